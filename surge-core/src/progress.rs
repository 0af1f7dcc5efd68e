use std::time::Duration;

use crate::run::RunState;
use crate::schedule::StageSnapshot;

#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Monotonic tick counter (1-based) for progress emissions.
    pub tick: u64,
    pub elapsed: Duration,
    pub total_duration: Duration,
    pub state: RunState,
    pub stage: Option<StageSnapshot>,
    pub target_vus: u64,
    pub live_vus: u64,
    pub retiring_vus: u64,

    pub iterations_total: u64,
    /// Iterations/sec observed during the last progress interval.
    pub iterations_per_sec_now: f64,
    pub iteration_failed_rate: Option<f64>,
    pub checks_failed_rate: Option<f64>,
    pub http_reqs_total: u64,
    pub http_req_duration_p95_ms: Option<f64>,
    /// Thresholds failing at the last live evaluation.
    pub failing_thresholds: Vec<String>,
}

pub type ProgressFn = std::sync::Arc<dyn Fn(ProgressUpdate) + Send + Sync + 'static>;
