use crate::run::RunState;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("`stages` must be a non-empty list of {{ duration, target }}")]
    InvalidStages,

    #[error("invalid stage #{index}: {reason}")]
    InvalidStage { index: usize, reason: &'static str },

    #[error("`tick` must be a positive duration")]
    InvalidTick,

    #[error("`threshold_interval` must be a positive duration")]
    InvalidThresholdInterval,

    #[error("`max_scheduler_error_rate` must be within (0, 1]")]
    InvalidErrorRate,

    #[error("invalid threshold `{expression}` on `{metric}`: {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },

    #[error("test run cannot start from state `{0}`")]
    InvalidState(RunState),

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error(transparent)]
    Metrics(#[from] surge_metrics::Error),
}
