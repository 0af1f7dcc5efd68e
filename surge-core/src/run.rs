use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use surge_metrics::{MetricId, MetricValue, Registry};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::aggregator::{Aggregator, BuiltinMetrics, names};
use crate::body::TestBody;
use crate::config::RunPlan;
use crate::error::{Error, Result};
use crate::progress::{ProgressFn, ProgressUpdate};
use crate::scheduler::{Scheduler, SchedulerStatus};
use crate::signal::StopSignal;
use crate::summary::{AbortReason, CheckSummary, MetricSummary, Summary};
use crate::thresholds::Threshold;
use crate::thresholds_eval::{ThresholdResult, evaluate_thresholds};

const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound for the aggregator to drain after the scheduler returned.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Draining,
    Completed,
    Aborted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Draining)
                | (Self::Running, Self::Aborted)
                | (Self::Draining, Self::Completed)
        )
    }
}

/// Requests a graceful stop of a running [`TestRun`] from outside, e.g. on Ctrl-C.
/// The run ends as [`RunState::Aborted`] with [`AbortReason::Interrupted`].
#[derive(Debug, Clone)]
pub struct StopHandle {
    signal: Arc<StopSignal>,
    interrupted: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.signal.trigger();
    }
}

/// Owns one run: its plan, its metrics and its lifecycle.
pub struct TestRun {
    plan: Arc<RunPlan>,
    registry: Arc<Registry>,
    builtins: BuiltinMetrics,
    state: RunState,
    stop: Arc<StopSignal>,
    interrupted: Arc<AtomicBool>,
    progress: Option<ProgressFn>,
    progress_interval: Duration,
}

struct LiveProgress {
    tick: u64,
    prev_iterations: u64,
    prev_at: Instant,
    failing: Vec<String>,
}

impl TestRun {
    /// Validates the plan. An invalid plan never produces a `TestRun`.
    pub fn new(plan: RunPlan) -> Result<Self> {
        plan.validate()?;

        let registry = Arc::new(Registry::default());
        let builtins = BuiltinMetrics::register(&registry)?;

        Ok(Self {
            plan: Arc::new(plan),
            registry,
            builtins,
            state: RunState::Pending,
            stop: Arc::new(StopSignal::new()),
            interrupted: Arc::new(AtomicBool::new(false)),
            progress: None,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        })
    }

    #[must_use]
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    #[must_use]
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.progress_interval = interval;
        }
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn plan(&self) -> &RunPlan {
        &self.plan
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            signal: self.stop.clone(),
            interrupted: self.interrupted.clone(),
        }
    }

    fn transition(&mut self, next: RunState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidState(self.state));
        }
        debug!(from = %self.state, to = %next, "run state transition");
        self.state = next;
        Ok(())
    }

    /// Runs the plan to completion (or abort) and returns the final summary.
    pub async fn run<B: TestBody>(&mut self, body: B) -> Result<Summary> {
        if self.state != RunState::Pending {
            return Err(Error::InvalidState(self.state));
        }

        let (ingest, aggregator) = Aggregator::new(self.registry.clone(), self.builtins).spawn();
        let (status_tx, status_rx) = watch::channel(SchedulerStatus::default());
        let scheduler = Scheduler::new(
            self.plan.clone(),
            Arc::new(body),
            ingest,
            self.stop.clone(),
            status_tx,
        );

        self.transition(RunState::Running)?;
        info!(
            stages = self.plan.stages.len(),
            duration = ?self.plan.total_duration(),
            max_vus = self.plan.max_target(),
            thresholds = self.plan.thresholds.len(),
            "test run started"
        );

        let started = Instant::now();
        let mut scheduler_task = tokio::spawn(scheduler.run());

        let threshold_every = self.plan.threshold_interval;
        let mut threshold_ticker =
            tokio::time::interval_at(started + threshold_every, threshold_every);
        threshold_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut progress_ticker =
            tokio::time::interval_at(started + self.progress_interval, self.progress_interval);
        progress_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut live = LiveProgress {
            tick: 0,
            prev_iterations: 0,
            prev_at: started,
            failing: Vec::new(),
        };
        let mut abort: Option<AbortReason> = None;

        let scheduler_result = loop {
            tokio::select! {
                res = &mut scheduler_task => break res,
                _ = threshold_ticker.tick() => {
                    let elapsed = started.elapsed();
                    let results =
                        evaluate_thresholds(&self.registry, &self.plan.thresholds, elapsed);
                    live.failing = results
                        .iter()
                        .filter(|r| !r.passed)
                        .map(ThresholdResult::name)
                        .collect();

                    if abort.is_none()
                        && let Some(reason) = abort_reason(&self.plan.thresholds, &results, elapsed)
                    {
                        warn!(reason = %reason, "aborting run");
                        abort = Some(reason);
                        self.stop.trigger();
                    }
                }
                _ = progress_ticker.tick(), if self.progress.is_some() => {
                    self.emit_progress(&mut live, &status_rx, started.elapsed());
                }
            }
        };

        let scheduler_failure = match scheduler_result {
            Ok(Ok(())) => None,
            Ok(Err(Error::Scheduler(msg))) => Some(msg),
            Ok(Err(err)) => Some(err.to_string()),
            Err(err) => Some(format!("scheduler task failed: {err}")),
        };
        if let Some(msg) = scheduler_failure {
            error!(error = %msg, "scheduler gave up");
            abort.get_or_insert(AbortReason::Scheduler(msg));
        }

        if abort.is_none() && self.interrupted.load(Ordering::Acquire) {
            abort = Some(AbortReason::Interrupted);
        }

        let next = if abort.is_some() {
            RunState::Aborted
        } else {
            RunState::Draining
        };
        self.transition(next)?;

        // Scheduler and VUs are gone, so every sender is dropped and the aggregator
        // finishes once its queue is empty.
        let mut aggregator = aggregator;
        match tokio::time::timeout(FLUSH_TIMEOUT, &mut aggregator).await {
            Ok(Ok(observations)) => debug!(observations, "metrics flushed"),
            Ok(Err(err)) => warn!(error = %err, "aggregator task failed"),
            Err(_) => {
                warn!("timed out waiting for metrics to flush");
                aggregator.abort();
            }
        }

        let duration = started.elapsed();
        let thresholds = evaluate_thresholds(&self.registry, &self.plan.thresholds, duration);
        if self.state == RunState::Draining {
            self.transition(RunState::Completed)?;
        }

        let summary = self.build_summary(duration, thresholds, abort);
        info!(
            state = %summary.state,
            overall_pass = summary.overall_pass,
            duration = ?summary.duration,
            "test run finished"
        );
        Ok(summary)
    }

    fn counter(&self, id: MetricId) -> u64 {
        match self.registry.base_value(id) {
            Some(MetricValue::Counter(v)) => v,
            _ => 0,
        }
    }

    fn rate(&self, id: MetricId) -> Option<f64> {
        match self.registry.base_value(id) {
            Some(MetricValue::Rate(r)) => r.rate,
            _ => None,
        }
    }

    fn emit_progress(
        &self,
        live: &mut LiveProgress,
        status: &watch::Receiver<SchedulerStatus>,
        elapsed: Duration,
    ) {
        let Some(progress) = &self.progress else {
            return;
        };
        let status = status.borrow().clone();

        let now = Instant::now();
        let iterations = self.counter(self.builtins.iterations);
        let dt = now.duration_since(live.prev_at).as_secs_f64().max(1e-9);
        let iterations_per_sec_now = iterations.saturating_sub(live.prev_iterations) as f64 / dt;
        live.prev_iterations = iterations;
        live.prev_at = now;
        live.tick += 1;

        progress(ProgressUpdate {
            tick: live.tick,
            elapsed,
            total_duration: self.plan.total_duration(),
            state: self.state,
            stage: status.stage,
            target_vus: status.target,
            live_vus: status.live,
            retiring_vus: status.retiring,
            iterations_total: iterations,
            iterations_per_sec_now,
            iteration_failed_rate: self.rate(self.builtins.iteration_failed),
            checks_failed_rate: self.rate(self.builtins.checks),
            http_reqs_total: self.counter(self.builtins.http_reqs),
            http_req_duration_p95_ms: self
                .registry
                .trend_percentile(self.builtins.http_req_duration, 95.0),
            failing_thresholds: live.failing.clone(),
        });
    }

    fn build_summary(
        &self,
        duration: Duration,
        thresholds: Vec<ThresholdResult>,
        abort_reason: Option<AbortReason>,
    ) -> Summary {
        let metrics = self
            .registry
            .base_values()
            .into_iter()
            .map(|(name, kind, value)| (name, MetricSummary { kind, value }))
            .collect();

        let check_key = self.registry.resolve_key(names::CHECK_TAG);
        let mut checks: Vec<CheckSummary> = self
            .registry
            .query(self.builtins.checks)
            .where_has(check_key)
            .group_by([check_key])
            .sum_rate()
            .into_iter()
            .filter_map(|(tags, rate)| {
                let name = self.registry.key_name(tags.get(check_key)?)?;
                Some(CheckSummary {
                    name: name.to_string(),
                    passes: rate.total.saturating_sub(rate.hits),
                    fails: rate.hits,
                })
            })
            .collect();
        checks.sort_by(|a, b| a.name.cmp(&b.name));

        let overall_pass =
            self.state == RunState::Completed && thresholds.iter().all(|t| t.passed);

        Summary {
            state: self.state,
            duration,
            metrics,
            series: self.registry.summarize(),
            thresholds,
            checks,
            overall_pass,
            abort_reason,
        }
    }
}

fn abort_reason(
    thresholds: &[Threshold],
    results: &[ThresholdResult],
    elapsed: Duration,
) -> Option<AbortReason> {
    thresholds
        .iter()
        .zip(results)
        .find(|(t, r)| t.abort_on_fail && elapsed >= t.delay_abort_eval && r.is_breach())
        .map(|(_, r)| AbortReason::Threshold { name: r.name() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_exits() {
        use RunState::*;
        let all = [Pending, Running, Draining, Completed, Aborted];

        for from in [Completed, Aborted] {
            assert!(from.is_terminal());
            assert!(all.iter().all(|to| !from.can_transition_to(*to)));
        }

        assert!(Pending.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Draining));
        assert!(!Pending.can_transition_to(Aborted));
        assert!(Running.can_transition_to(Aborted));
        assert!(!Draining.can_transition_to(Aborted));
        assert_eq!(Draining.to_string(), "draining");
    }

    #[test]
    fn abort_respects_flag_and_delay() {
        let threshold = |abort: Option<u64>| {
            let t = Threshold::new("checks", "rate<0.01").unwrap_or_else(|e| panic!("{e}"));
            match abort {
                Some(delay) => t.abort_on_fail(Duration::from_secs(delay)),
                None => t,
            }
        };
        let breach = ThresholdResult {
            metric: "checks".to_string(),
            expression: "rate<0.01".to_string(),
            passed: false,
            observed: Some(0.5),
            diagnostic: None,
            abort_on_fail: true,
        };
        let no_samples = ThresholdResult {
            observed: None,
            diagnostic: Some("no samples recorded yet".to_string()),
            ..breach.clone()
        };
        let at = Duration::from_secs(5);

        assert_eq!(abort_reason(&[threshold(None)], &[breach.clone()], at), None);
        assert_eq!(abort_reason(&[threshold(Some(10))], &[breach.clone()], at), None);
        assert_eq!(abort_reason(&[threshold(Some(1))], &[no_samples], at), None);
        assert_eq!(
            abort_reason(&[threshold(Some(1))], &[breach], at),
            Some(AbortReason::Threshold {
                name: "checks: rate<0.01".to_string()
            })
        );
    }
}
