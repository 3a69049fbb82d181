use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Pacing;

/// Per-iteration context handed to the workload.
#[derive(Debug, Clone)]
pub struct IterationContext {
    pub vu_id: u64,
    /// 1-based iteration number within this VU.
    pub iteration: u64,
    cancel: CancellationToken,
}

impl IterationContext {
    pub(crate) fn new(vu_id: u64, iteration: u64, cancel: CancellationToken) -> Self {
        Self {
            vu_id,
            iteration,
            cancel,
        }
    }

    /// Fires when the run is hard-stopped. The in-flight iteration is dropped shortly after, so
    /// workloads only need to watch it around blocking work the engine cannot interrupt.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// What a successful iteration reports back to the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Iteration {
    pub pacing: Option<Pacing>,
    pub bytes_transferred: Option<u64>,
}

impl Iteration {
    pub fn done() -> Self {
        Self::default()
    }

    /// Sleep for `delay` after this iteration before starting the next one.
    #[must_use]
    pub fn sleep(self, delay: Duration) -> Self {
        self.pace(Pacing::After(delay))
    }

    #[must_use]
    pub fn pace(mut self, pacing: Pacing) -> Self {
        self.pacing = Some(pacing);
        self
    }

    #[must_use]
    pub fn bytes(mut self, bytes: u64) -> Self {
        self.bytes_transferred = Some(bytes);
        self
    }
}

/// User-supplied unit of work executed once per iteration per VU.
///
/// Implemented for any `Fn(IterationContext) -> impl Future<Output = Result<Iteration, E>>`.
pub trait Workload: Send + Sync + 'static {
    type Error: Display + Send + 'static;

    /// Called by the pool controller before a VU is spawned. An error counts as a spawn
    /// shortfall and the VU is retried on the next reconciliation tick.
    fn setup_vu(&self, _vu_id: u64) -> Result<(), Self::Error> {
        Ok(())
    }

    fn iteration(
        &self,
        ctx: IterationContext,
    ) -> impl Future<Output = Result<Iteration, Self::Error>> + Send;
}

impl<F, Fut, E> Workload for F
where
    F: Fn(IterationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Iteration, E>> + Send,
    E: Display + Send + 'static,
{
    type Error = E;

    fn iteration(
        &self,
        ctx: IterationContext,
    ) -> impl Future<Output = Result<Iteration, Self::Error>> + Send {
        self(ctx)
    }
}
