use anyhow::Context as _;
use surge_core::TestRun;
use surge_http::HttpClient;
use tracing::{info, warn};

use crate::cli::{RunArgs, ValidateArgs};
use crate::exit_codes::ExitCode;
use crate::http_body::HttpTestBody;
use crate::output;
use crate::plan_yaml::{self, PlanFile};
use crate::report;
use crate::run_error::{RunError, classify_core_error};

pub async fn run(args: RunArgs) -> Result<ExitCode, RunError> {
    let out = output::formatter(args.output);

    let PlanFile { mut plan, mut target } = plan_yaml::load_plan(&args.plan)
        .await
        .map_err(RunError::InvalidInput)?;

    if let Some(url) = args.url.clone() {
        target.url = Some(url);
    }
    if let Some(think_time) = args.think_time {
        plan.think_time = (!think_time.is_zero()).then_some(think_time);
    }

    let target = target
        .resolve()
        .with_context(|| format!("invalid plan: {}", args.plan.display()))
        .map_err(RunError::InvalidInput)?;

    let mut test_run =
        TestRun::new(plan).map_err(|e| classify_core_error("invalid run plan", e))?;

    out.print_header(&args.plan, test_run.plan(), &target);
    if let Some(progress) = out.progress() {
        test_run = test_run.with_progress(progress);
    }

    let stop = test_run.stop_handle();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping run");
            stop.stop();
        }
    });

    info!(plan = %args.plan.display(), url = %target.url, "starting run");
    let body = HttpTestBody::new(HttpClient::default(), target);
    let result = test_run.run(body).await;
    ctrl_c.abort();

    let summary = result.map_err(|e| classify_core_error("run failed", e))?;
    info!(
        state = %summary.state,
        overall_pass = summary.overall_pass,
        "run finished"
    );

    out.print_summary(&summary)
        .map_err(RunError::RuntimeError)?;

    if let Some(path) = &args.summary_out {
        report::write_summary_file(path, &summary)
            .await
            .map_err(RunError::RuntimeError)?;
    }

    Ok(ExitCode::from_summary(&summary))
}

pub async fn validate(args: ValidateArgs) -> Result<ExitCode, RunError> {
    let PlanFile { plan, target } = plan_yaml::load_plan(&args.plan)
        .await
        .map_err(RunError::InvalidInput)?;

    plan.validate()
        .map_err(|e| classify_core_error("invalid run plan", e))?;

    // The url may still come from `--url` at run time.
    let target_url = match target.url.clone() {
        Some(url) => {
            target
                .resolve()
                .with_context(|| format!("invalid plan: {}", args.plan.display()))
                .map_err(RunError::InvalidInput)?;
            url
        }
        None => "(from --url)".to_string(),
    };

    println!(
        "plan ok: {} stage(s), duration={:?}, max_vus={}, thresholds={}, target={target_url}",
        plan.stages.len(),
        plan.total_duration(),
        plan.max_target(),
        plan.thresholds.len()
    );

    Ok(ExitCode::Success)
}
