pub mod aggregator;
pub mod histogram;
pub mod iteration;
pub mod stats;

pub use aggregator::{Aggregator, ERRORS_OVERFLOW_KEY, MAX_ERROR_KEYS, MetricsSnapshot};
pub use histogram::HistogramSummary;
pub use iteration::{FailureKind, IterationResult, Outcome};
pub use stats::{RateSummary, RunningStats, per_sec};
