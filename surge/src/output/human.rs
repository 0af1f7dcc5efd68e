use std::sync::Arc;

mod format;
mod progress;
mod summary;

use format::{format_duration, format_ms, format_ms_opt, format_percent_opt, format_rate};
use progress::HumanProgress;
use summary::render;

use super::OutputFormatter;
use crate::plan_yaml::Target;

pub(crate) struct HumanReadableOutput {
    progress: Arc<HumanProgress>,
}

impl HumanReadableOutput {
    pub(crate) fn new() -> Self {
        Self {
            progress: Arc::new(HumanProgress::new()),
        }
    }
}

/// One progress line, without the bar itself.
fn progress_message(u: &surge_core::ProgressUpdate) -> String {
    let mut msg = match &u.stage {
        Some(stage) => format!(
            "stage={}/{} target={} vus={} elapsed={} stage_remaining={}",
            stage.index + 1,
            stage.count,
            u.target_vus,
            u.live_vus,
            format_duration(u.elapsed),
            format_duration(stage.stage_remaining),
        ),
        None => format!(
            "{} vus={} elapsed={}",
            u.state,
            u.live_vus,
            format_duration(u.elapsed)
        ),
    };

    if u.retiring_vus > 0 {
        msg.push_str(&format!(" retiring={}", u.retiring_vus));
    }

    msg.push_str(&format!(
        " iters={} iters/s={} failed={} checks_failed={}",
        u.iterations_total,
        format_rate(u.iterations_per_sec_now),
        format_percent_opt(u.iteration_failed_rate),
        format_percent_opt(u.checks_failed_rate),
    ));

    if u.http_reqs_total > 0 {
        msg.push_str(&format!(
            " reqs={} p95={}",
            u.http_reqs_total,
            format_ms_opt(u.http_req_duration_p95_ms)
        ));
    }
    if !u.failing_thresholds.is_empty() {
        msg.push_str(&format!(" thresholds_failing={}", u.failing_thresholds.len()));
    }

    msg
}

impl OutputFormatter for HumanReadableOutput {
    fn print_header(
        &self,
        plan_path: &std::path::Path,
        plan: &surge_core::RunPlan,
        target: &Target,
    ) {
        println!("plan: {}", plan_path.display());
        println!("target: {} {}", target.method, target.url);
        println!(
            "stages: {} duration={} max_vus={} ramp={}",
            plan.stages.len(),
            format_duration(plan.total_duration()),
            plan.max_target(),
            plan.ramp
        );
        if let Some(think) = plan.think_time {
            println!("think_time: {}", format_ms(think.as_secs_f64() * 1000.0));
        }
        for t in &plan.thresholds {
            let abort = if t.abort_on_fail { " (abort on fail)" } else { "" };
            println!("threshold: {}{abort}", t.name());
        }
        println!();
    }

    fn progress(&self) -> Option<surge_core::ProgressFn> {
        let progress = self.progress.clone();

        Some(Arc::new(move |u| {
            progress.update(u.total_duration, u.elapsed, progress_message(&u));
        }))
    }

    fn print_summary(&self, summary: &surge_core::Summary) -> anyhow::Result<()> {
        self.progress.finish();
        print!("{}", render(summary));

        let failed: Vec<_> = summary.failed_thresholds().collect();
        if !failed.is_empty() {
            eprintln!("thresholds failed:");
            for t in failed {
                match (t.observed, &t.diagnostic) {
                    (Some(obs), _) => eprintln!("  {} (observed {obs})", t.name()),
                    (None, Some(diag)) => eprintln!("  {} ({diag})", t.name()),
                    (None, None) => eprintln!("  {} (no value)", t.name()),
                }
            }
        }

        Ok(())
    }
}
