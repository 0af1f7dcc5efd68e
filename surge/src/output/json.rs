use serde::Serialize;
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;

use super::OutputFormatter;
use crate::plan_yaml::Target;
use crate::report::{JsonSummary, build_summary};

pub(crate) struct JsonOutput;

impl OutputFormatter for JsonOutput {
    fn print_header(&self, _plan_path: &Path, _plan: &surge_core::RunPlan, _target: &Target) {}

    fn progress(&self) -> Option<surge_core::ProgressFn> {
        Some(Arc::new(move |u| {
            let line = build_progress_line(&u);
            emit_json_line(&line);
        }))
    }

    fn print_summary(&self, summary: &surge_core::Summary) -> anyhow::Result<()> {
        let line = JsonSummaryLine {
            kind: "summary",
            summary: build_summary(summary),
        };
        emit_json_line(&line);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonProgressLine {
    pub kind: &'static str,
    pub tick: u64,
    pub state: String,
    pub elapsed_secs: f64,
    pub total_duration_secs: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<usize>,
    pub target_vus: u64,
    pub live_vus: u64,
    pub retiring_vus: u64,

    pub iterations_total: u64,
    pub iterations_per_sec: f64,
    pub iteration_failed_rate: Option<f64>,
    pub checks_failed_rate: Option<f64>,
    pub http_reqs_total: u64,
    pub http_req_duration_p95_ms: Option<f64>,

    pub failing_thresholds: Vec<String>,
}

#[derive(Debug, Serialize)]
struct JsonSummaryLine {
    kind: &'static str,
    #[serde(flatten)]
    summary: JsonSummary,
}

fn build_progress_line(u: &surge_core::ProgressUpdate) -> JsonProgressLine {
    JsonProgressLine {
        kind: "progress",
        tick: u.tick,
        state: u.state.to_string(),
        elapsed_secs: u.elapsed.as_secs_f64(),
        total_duration_secs: u.total_duration.as_secs_f64(),
        stage: u.stage.as_ref().map(|s| s.index),
        target_vus: u.target_vus,
        live_vus: u.live_vus,
        retiring_vus: u.retiring_vus,
        iterations_total: u.iterations_total,
        iterations_per_sec: u.iterations_per_sec_now,
        iteration_failed_rate: u.iteration_failed_rate,
        checks_failed_rate: u.checks_failed_rate,
        http_reqs_total: u.http_reqs_total,
        http_req_duration_p95_ms: u.http_req_duration_p95_ms,
        failing_thresholds: u.failing_thresholds.clone(),
    }
}

fn emit_json_line<T: Serialize>(line: &T) {
    let mut out = std::io::stdout().lock();
    if serde_json::to_writer(&mut out, line).is_ok() {
        let _ = writeln!(out);
    }
}
