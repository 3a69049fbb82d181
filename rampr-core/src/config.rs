use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: u64,
}

impl Stage {
    pub fn new(duration: Duration, target: u64) -> Self {
        Self { duration, target }
    }
}

/// Delay policy applied between two iterations of the same VU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Wait this long after the iteration ends.
    After(Duration),

    /// Start iterations at most this often, measured from iteration start. A slower iteration is
    /// followed immediately and missed time is never caught up.
    Interval(Duration),
}

impl Pacing {
    /// Remaining delay before the next iteration may start.
    pub fn delay(self, iteration_time: Duration) -> Duration {
        match self {
            Pacing::After(d) => d,
            Pacing::Interval(d) => d.saturating_sub(iteration_time),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// How often the pool controller reconciles live VUs against the ramp.
    pub reconcile_interval: Duration,

    /// Pacing used when the workload does not request one.
    pub pacing: Option<Pacing>,

    /// Iterations running longer than this are aborted and counted as timeouts.
    pub iteration_timeout: Option<Duration>,

    /// Ceiling on concurrently registered VUs; ramp targets above it are recorded as shortfall.
    pub max_vus: Option<u64>,

    /// Time VUs get to finish their last iteration once the ramp has ended.
    pub graceful_stop: Duration,

    /// Time VUs get to drain after a hard cancellation before they are abandoned.
    pub cancel_grace: Duration,

    /// Interval between progress samples (iterations/sec, optional progress callback).
    pub progress_interval: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(1),
            pacing: None,
            iteration_timeout: None,
            max_vus: None,
            graceful_stop: Duration::from_secs(30),
            cancel_grace: Duration::from_secs(5),
            progress_interval: Duration::from_secs(1),
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> Result<()> {
        if self.reconcile_interval.is_zero() {
            return Err(Error::InvalidReconcileInterval);
        }
        if self.progress_interval.is_zero() {
            return Err(Error::InvalidProgressInterval);
        }
        if self.max_vus == Some(0) {
            return Err(Error::InvalidMaxVus);
        }
        Ok(())
    }
}

pub(crate) fn validate_stages(stages: &[Stage]) -> Result<()> {
    if stages.is_empty() {
        return Err(Error::InvalidStages);
    }
    Ok(())
}
