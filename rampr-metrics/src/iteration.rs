use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why an iteration failed.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumCount,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// The workload returned an error.
    Workload,
    /// The workload panicked.
    Panicked,
    /// The iteration exceeded the configured iteration timeout.
    Timeout,
    /// The iteration was interrupted by a hard stop.
    Cancelled,
}

impl FailureKind {
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure {
        kind: FailureKind,
        reason: Arc<str>,
    },
}

impl Outcome {
    pub fn failure(kind: FailureKind, reason: impl Into<Arc<str>>) -> Self {
        Self::Failure {
            kind,
            reason: reason.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::failure(FailureKind::Cancelled, "cancelled")
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// One finished iteration. Folded into aggregates by the aggregator and then dropped.
#[derive(Debug, Clone)]
pub struct IterationResult {
    pub vu_id: u64,
    pub started: Instant,
    pub ended: Instant,
    pub outcome: Outcome,
    pub bytes_transferred: Option<u64>,
}

impl IterationResult {
    pub fn latency(&self) -> Duration {
        self.ended.saturating_duration_since(self.started)
    }
}
