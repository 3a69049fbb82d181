use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::executor::{InFlight, IterationExecutor};
use crate::workload::Workload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::FromRepr)]
#[repr(u8)]
pub(crate) enum VuState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl VuState {
    pub(crate) fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

#[derive(Debug)]
pub(crate) struct VuStateCell(AtomicU8);

impl VuStateCell {
    fn new() -> Self {
        Self(AtomicU8::new(VuState::Starting as u8))
    }

    pub(crate) fn get(&self) -> VuState {
        VuState::from_repr(self.0.load(Ordering::Acquire)).unwrap_or(VuState::Stopped)
    }

    pub(crate) fn set(&self, state: VuState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub(crate) fn transition(&self, from: VuState, to: VuState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Sends the VU id to the pool controller when the VU task ends, including on abort.
#[derive(Debug)]
struct ExitNotice {
    vu_id: u64,
    tx: mpsc::UnboundedSender<u64>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.tx.send(self.vu_id);
    }
}

/// Controller-side view of a VU. The VU task shares the state, counters and in-flight slot.
#[derive(Debug, Clone)]
pub(crate) struct VuShared {
    pub state: Arc<VuStateCell>,
    pub iterations: Arc<AtomicU64>,
    pub in_flight: Arc<InFlight>,
    /// Soft stop: finish the current iteration, then exit.
    pub retire: CancellationToken,
}

impl VuShared {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(VuStateCell::new()),
            iterations: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(InFlight::default()),
            retire: CancellationToken::new(),
        }
    }
}

pub(crate) struct VirtualUser<W> {
    id: u64,
    shared: VuShared,
    /// Hard stop: abort the in-flight iteration.
    abort: CancellationToken,
    executor: Arc<IterationExecutor<W>>,
    _exit: ExitNotice,
}

impl<W: Workload> VirtualUser<W> {
    pub(crate) fn new(
        id: u64,
        shared: VuShared,
        abort: CancellationToken,
        executor: Arc<IterationExecutor<W>>,
        exited: mpsc::UnboundedSender<u64>,
    ) -> Self {
        Self {
            id,
            shared,
            abort,
            executor,
            _exit: ExitNotice {
                vu_id: id,
                tx: exited,
            },
        }
    }

    fn should_stop(&self) -> bool {
        self.abort.is_cancelled() || self.shared.retire.is_cancelled()
    }

    pub(crate) async fn run(self) {
        // Retired before it ever ran.
        if !self
            .shared
            .state
            .transition(VuState::Starting, VuState::Running)
        {
            self.shared.state.set(VuState::Stopped);
            return;
        }

        while !self.should_stop() {
            let iteration = self
                .shared
                .iterations
                .fetch_add(1, Ordering::Relaxed)
                .saturating_add(1);

            let executed = self
                .executor
                .run_once(self.id, iteration, &self.shared.in_flight, &self.abort)
                .await;
            if executed.cancelled {
                break;
            }

            let delay = executed
                .pacing
                .map(|p| p.delay(executed.elapsed))
                .unwrap_or_default();

            if delay.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                biased;

                _ = self.abort.cancelled() => break,
                _ = self.shared.retire.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.shared.state.set(VuState::Stopped);
        tracing::debug!(
            vu = self.id,
            iterations = self.shared.iterations.load(Ordering::Relaxed),
            "virtual user stopped"
        );
    }
}
