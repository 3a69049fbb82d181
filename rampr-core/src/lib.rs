mod config;
mod error;
mod executor;
mod plan;
mod pool;
mod progress;
mod run;
mod schedule;
mod state;
mod vu;
mod workload;

pub use config::{Pacing, RunOptions, Stage};
pub use error::{Error, Result};
pub use plan::{PacingMode, PlanDuration, RunPlan, StagePlan};
pub use progress::{ProgressFn, ProgressUpdate};
pub use run::{Engine, RunHandle, RunOutcome, RunReport};
pub use schedule::{RampSchedule, StageSnapshot};
pub use state::RunState;
pub use workload::{Iteration, IterationContext, Workload};

pub use rampr_metrics::{
    Aggregator, FailureKind, HistogramSummary, IterationResult, MetricsSnapshot, Outcome,
    RateSummary,
};
