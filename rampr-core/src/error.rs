pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid run plan: {0}")]
    Plan(#[from] serde_yaml::Error),

    #[error("`stages` must be a non-empty array of {{ duration, target }}")]
    InvalidStages,

    #[error("stage {index}: `target` must be a non-negative integer (got {target})")]
    NegativeTarget { index: usize, target: i64 },

    #[error("`reconcile_interval` must be a positive duration")]
    InvalidReconcileInterval,

    #[error("`progress_interval` must be a positive duration")]
    InvalidProgressInterval,

    #[error("`max_vus` must be a positive integer")]
    InvalidMaxVus,

    #[error("the engine must be started from within a Tokio runtime")]
    NoRuntime,

    #[error("run finished without a final report")]
    ReportUnavailable,
}
