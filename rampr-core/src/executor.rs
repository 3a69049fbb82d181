use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt as _;
use rampr_metrics::{Aggregator, FailureKind, IterationResult, Outcome};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Pacing;
use crate::workload::{IterationContext, Workload};

/// Start time of a VU's current iteration, claimable exactly once.
///
/// Shared between the VU that runs the iteration and the pool controller, which may abandon the
/// VU. Whoever claims the slot reports the iteration; the other side drops it. Once the controller
/// closes the slot, no further iteration can begin on it.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    slot: Mutex<SlotState>,
}

#[derive(Debug, Default)]
struct SlotState {
    started: Option<Instant>,
    closed: bool,
}

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stamps the start of an iteration and counts it in flight, in one step under the lock.
    /// Returns `false` without touching the gauge when the slot is closed.
    fn begin(&self, aggregator: &Aggregator, at: Instant) -> bool {
        let mut slot = self.lock();
        if slot.closed {
            return false;
        }
        aggregator.begin_iteration();
        slot.started = Some(at);
        true
    }

    fn claim(&self) -> Option<Instant> {
        self.lock().started.take()
    }

    /// Claims the current iteration, if any, and refuses every later one.
    fn close(&self) -> Option<Instant> {
        let mut slot = self.lock();
        slot.closed = true;
        slot.started.take()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Executed {
    pub pacing: Option<Pacing>,
    pub elapsed: Duration,
    pub cancelled: bool,
}

#[derive(Debug)]
pub(crate) struct IterationExecutor<W> {
    workload: Arc<W>,
    aggregator: Arc<Aggregator>,
    default_pacing: Option<Pacing>,
    iteration_timeout: Option<Duration>,
}

impl<W: Workload> IterationExecutor<W> {
    pub(crate) fn new(
        workload: Arc<W>,
        aggregator: Arc<Aggregator>,
        default_pacing: Option<Pacing>,
        iteration_timeout: Option<Duration>,
    ) -> Self {
        Self {
            workload,
            aggregator,
            default_pacing,
            iteration_timeout,
        }
    }

    pub(crate) fn workload(&self) -> &W {
        &self.workload
    }

    pub(crate) fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    /// Runs one iteration and reports it, unless the slot was claimed by an abandonment first.
    pub(crate) async fn run_once(
        &self,
        vu_id: u64,
        iteration: u64,
        slot: &InFlight,
        cancel: &CancellationToken,
    ) -> Executed {
        let started = Instant::now();
        if !slot.begin(&self.aggregator, started) {
            // Abandoned between iterations.
            return Executed {
                pacing: None,
                elapsed: Duration::ZERO,
                cancelled: true,
            };
        }

        let ctx = IterationContext::new(vu_id, iteration, cancel.clone());
        let call = AssertUnwindSafe(self.workload.iteration(ctx)).catch_unwind();
        let bounded = async {
            match self.iteration_timeout {
                Some(limit) => tokio::time::timeout(limit, call).await.ok(),
                None => Some(call.await),
            }
        };

        let mut pacing = self.default_pacing;
        let mut bytes_transferred = None;
        let mut cancelled = false;

        let outcome = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                cancelled = true;
                Outcome::cancelled()
            }
            res = bounded => match res {
                Some(Ok(Ok(it))) => {
                    pacing = it.pacing.or(self.default_pacing);
                    bytes_transferred = it.bytes_transferred;
                    Outcome::Success
                }
                Some(Ok(Err(err))) => Outcome::failure(FailureKind::Workload, err.to_string()),
                Some(Err(panic)) => Outcome::failure(
                    FailureKind::Panicked,
                    panic_message("workload", panic.as_ref()),
                ),
                None => {
                    let limit = self.iteration_timeout.unwrap_or_default();
                    Outcome::failure(
                        FailureKind::Timeout,
                        format!("iteration timed out after {}", humantime::format_duration(limit)),
                    )
                }
            },
        };

        let ended = Instant::now();
        if let Some(started) = slot.claim() {
            self.aggregator.finish_iteration(&IterationResult {
                vu_id,
                started: started.into_std(),
                ended: ended.into_std(),
                outcome,
                bytes_transferred,
            });
        }

        Executed {
            pacing,
            elapsed: ended.saturating_duration_since(started),
            cancelled,
        }
    }
}

/// Reports an abandoned VU's in-flight iteration as cancelled, if it still holds one, and closes
/// the slot so the VU cannot start another.
pub(crate) fn settle_abandoned(aggregator: &Aggregator, vu_id: u64, slot: &InFlight) -> bool {
    let Some(started) = slot.close() else {
        return false;
    };

    aggregator.finish_iteration(&IterationResult {
        vu_id,
        started: started.into_std(),
        ended: Instant::now().into_std(),
        outcome: Outcome::cancelled(),
        bytes_transferred: None,
    });
    true
}

pub(crate) fn panic_message(what: &str, payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("{what} panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("{what} panicked: {s}")
    } else {
        format!("{what} panicked")
    }
}
