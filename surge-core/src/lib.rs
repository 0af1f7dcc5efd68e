mod aggregator;
mod body;
mod config;
mod error;
mod observation;
mod progress;
mod run;
mod schedule;
mod scheduler;
mod signal;
mod summary;
mod thresholds;
mod thresholds_eval;
mod vu;

pub use aggregator::names;
pub use body::{IterationContext, IterationError, TestBody};
pub use config::{RampShape, RunPlan, Stage};
pub use error::{Error, Result};
pub use observation::{CheckResult, Observation, Outcome, RequestSample};
pub use progress::{ProgressFn, ProgressUpdate};
pub use run::{RunState, StopHandle, TestRun};
pub use schedule::{RampingSchedule, StageSnapshot};
pub use scheduler::{MIN_SPAWN_ATTEMPTS, SchedulerStatus};
pub use summary::{AbortReason, CheckSummary, MetricSummary, Summary};
pub use thresholds::{Statistic, Threshold, ThresholdExpr, ThresholdOp, parse_threshold_expr};
pub use thresholds_eval::{ThresholdResult, evaluate_threshold, evaluate_thresholds};

pub use surge_metrics::{MetricKind, MetricSeriesSummary, MetricValue, RateSummary, TrendSummary};
