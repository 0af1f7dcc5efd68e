use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::aggregator::IngestSender;
use crate::body::TestBody;
use crate::config::RunPlan;
use crate::error::{Error, Result};
use crate::schedule::{RampingSchedule, StageSnapshot};
use crate::signal::StopSignal;
use crate::vu::{VuHandle, spawn_vu};

/// Spawn attempts needed before the failure ratio can abort a run.
pub const MIN_SPAWN_ATTEMPTS: u64 = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub elapsed: Duration,
    pub target: u64,
    /// Running VUs that have not been asked to stop.
    pub live: u64,
    /// VUs finishing their last iteration after a ramp-down or stop.
    pub retiring: u64,
    pub spawned_total: u64,
    pub spawn_failures: u64,
    pub stage: Option<StageSnapshot>,
}

#[derive(Debug)]
struct Retiring {
    vu: VuHandle,
    deadline: Instant,
}

/// Drives the live VU population toward the ramp schedule on a fixed tick.
pub(crate) struct Scheduler<B> {
    plan: Arc<RunPlan>,
    schedule: RampingSchedule,
    body: Arc<B>,
    ingest: IngestSender,
    stop: Arc<StopSignal>,
    status: watch::Sender<SchedulerStatus>,

    /// Oldest first; ramp-down retires from the back.
    active: VecDeque<VuHandle>,
    retiring: Vec<Retiring>,
    next_id: u64,
    spawn_attempts: u64,
    spawn_failures: u64,
}

impl<B: TestBody> Scheduler<B> {
    pub(crate) fn new(
        plan: Arc<RunPlan>,
        body: Arc<B>,
        ingest: IngestSender,
        stop: Arc<StopSignal>,
        status: watch::Sender<SchedulerStatus>,
    ) -> Self {
        let schedule = RampingSchedule::new(plan.start_vus, plan.ramp, plan.stages.clone());
        Self {
            plan,
            schedule,
            body,
            ingest,
            stop,
            status,
            active: VecDeque::new(),
            retiring: Vec::new(),
            next_id: 1,
            spawn_attempts: 0,
            spawn_failures: 0,
        }
    }

    /// Runs until the last stage has elapsed or a stop is requested, then drains every
    /// VU. The population is zero when this returns, including on error.
    pub(crate) async fn run(mut self) -> Result<()> {
        let started = Instant::now();
        let end = started + self.schedule.total_duration();

        let mut ticker = tokio::time::interval(self.plan.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tokio::time::sleep_until(end) => {}
                _ = self.stop.wait() => {
                    info!("stop requested; draining vus");
                    break Ok(());
                }
            }

            let elapsed = started.elapsed();
            if self.schedule.is_done(elapsed) {
                debug!(?elapsed, "all stages elapsed");
                break Ok(());
            }

            let target = self.schedule.target_at(elapsed);
            self.reap(Instant::now()).await;
            if let Err(err) = self.converge(target) {
                break Err(err);
            }
            self.publish(elapsed, target);
        };

        self.drain_all().await;
        self.publish(started.elapsed(), 0);
        outcome
    }

    fn converge(&mut self, target: u64) -> Result<()> {
        // A VU task only ends on its own if it crashed.
        let (crashed, alive): (Vec<_>, Vec<_>) = std::mem::take(&mut self.active)
            .into_iter()
            .partition(|vu| vu.join.is_finished());
        self.active = alive.into();
        for vu in crashed {
            self.record_failure(vu.id, "vu task exited unexpectedly".to_string())?;
        }

        let live = self.active.len() as u64;
        if live < target {
            for _ in live..target {
                self.spawn_one()?;
            }
        } else if live > target {
            let deadline = Instant::now() + self.plan.graceful_ramp_down;
            for _ in target..live {
                let Some(vu) = self.active.pop_back() else {
                    break;
                };
                debug!(vu_id = vu.id, "retiring vu");
                vu.stop.trigger();
                self.retiring.push(Retiring { vu, deadline });
            }
        }

        Ok(())
    }

    fn spawn_one(&mut self) -> Result<()> {
        let id = self.next_id;
        self.next_id += 1;
        self.spawn_attempts += 1;

        match self.body.init_vu(id) {
            Ok(()) => {
                debug!(vu_id = id, "spawning vu");
                let vu = spawn_vu(
                    id,
                    self.body.clone(),
                    self.plan.think_time,
                    self.ingest.clone(),
                );
                self.active.push_back(vu);
                Ok(())
            }
            Err(reason) => self.record_failure(id, reason),
        }
    }

    /// Counts a VU that failed to start or died on its own against the spawn
    /// failure ratio.
    fn record_failure(&mut self, vu_id: u64, reason: String) -> Result<()> {
        warn!(vu_id, reason = %reason, "vu failed");
        self.spawn_failures += 1;
        self.ingest.spawn_failed(vu_id, reason);

        let ratio = self.spawn_failures as f64 / self.spawn_attempts.max(1) as f64;
        if self.spawn_attempts >= MIN_SPAWN_ATTEMPTS
            && ratio > self.plan.max_scheduler_error_rate
        {
            return Err(Error::Scheduler(format!(
                "{} of {} vus failed (limit {:.0}%)",
                self.spawn_failures,
                self.spawn_attempts,
                self.plan.max_scheduler_error_rate * 100.0
            )));
        }
        Ok(())
    }

    /// Drops retired VUs that finished and force-stops the ones past their deadline.
    async fn reap(&mut self, now: Instant) {
        let retiring = std::mem::take(&mut self.retiring);
        for r in retiring {
            if r.vu.join.is_finished() {
                continue;
            }
            if now >= r.deadline {
                self.force_stop(r.vu).await;
            } else {
                self.retiring.push(r);
            }
        }
    }

    async fn force_stop(&self, mut vu: VuHandle) {
        vu.join.abort();
        // The task has fully stopped once joined, so the flag below is final.
        let _ = (&mut vu.join).await;

        if vu.in_iteration.load(std::sync::atomic::Ordering::Acquire) {
            warn!(vu_id = vu.id, "vu did not finish its iteration in time; aborted");
            self.ingest.aborted(vu.id);
        } else {
            debug!(vu_id = vu.id, "vu force-stopped between iterations");
        }
    }

    async fn drain_all(&mut self) {
        let deadline = Instant::now() + self.plan.graceful_stop;

        while let Some(vu) = self.active.pop_front() {
            vu.stop.trigger();
            self.retiring.push(Retiring { vu, deadline });
        }
        for r in &mut self.retiring {
            r.deadline = r.deadline.min(deadline);
        }

        if !self.retiring.is_empty() {
            info!(vus = self.retiring.len(), "waiting for vus to finish");
        }
        self.ingest.vus(0);

        let retiring = std::mem::take(&mut self.retiring);
        for mut r in retiring {
            match tokio::time::timeout_at(r.deadline, &mut r.vu.join).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(vu_id = r.vu.id, error = %err, "vu task failed"),
                Err(_) => self.force_stop(r.vu).await,
            }
        }
    }

    fn publish(&self, elapsed: Duration, target: u64) {
        let live = self.active.len() as u64;
        self.ingest.vus(live);
        self.status.send_replace(SchedulerStatus {
            elapsed,
            target,
            live,
            retiring: self.retiring.len() as u64,
            spawned_total: self.spawn_attempts - self.spawn_failures,
            spawn_failures: self.spawn_failures,
            stage: self.schedule.stage_snapshot_at(elapsed),
        });
    }
}

impl<B> Drop for Scheduler<B> {
    fn drop(&mut self) {
        // Empty after a normal drain; only a failed scheduler leaves VUs behind.
        for vu in &self.active {
            vu.join.abort();
        }
        for r in &self.retiring {
            r.vu.join.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{Aggregator, BuiltinMetrics};
    use crate::body::{IterationContext, IterationError};
    use crate::config::Stage;
    use surge_metrics::{MetricValue, Registry};

    fn plan(stages: Vec<Stage>) -> RunPlan {
        RunPlan {
            tick: Duration::from_millis(20),
            graceful_ramp_down: Duration::from_millis(200),
            graceful_stop: Duration::from_millis(200),
            ..RunPlan::new(stages)
        }
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[tokio::test]
    async fn population_follows_target_and_ends_at_zero() {
        let registry = Arc::new(Registry::default());
        let ids = BuiltinMetrics::register(&registry).unwrap_or_else(|e| panic!("{e}"));
        let (ingest, agg) = Aggregator::new(registry.clone(), ids).spawn();

        let plan = Arc::new(plan(vec![
            Stage::new(ms(200), 4),
            Stage::new(ms(200), 4),
            Stage::new(ms(200), 0),
        ]));
        let body = |_ctx: IterationContext| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<(), IterationError>(())
        };
        let (status_tx, mut status_rx) = watch::channel(SchedulerStatus::default());
        let schedule = RampingSchedule::new(plan.start_vus, plan.ramp, plan.stages.clone());

        let scheduler = Scheduler::new(
            plan.clone(),
            Arc::new(body),
            ingest,
            Arc::new(StopSignal::new()),
            status_tx,
        );
        let task = tokio::spawn(scheduler.run());

        let mut max_live = 0;
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow_and_update().clone();
            // Reconciled on every tick: never above the target of the tick that produced it.
            assert!(status.live <= status.target, "{status:?}");
            assert_eq!(status.target, schedule.target_at(status.elapsed));
            max_live = max_live.max(status.live);
        }

        task.await
            .unwrap_or_else(|e| panic!("{e}"))
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(max_live, 4);

        agg.await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(registry.base_value(ids.vus), Some(MetricValue::Gauge(0)));
        assert_eq!(registry.base_value(ids.vus_max), Some(MetricValue::Gauge(4)));
        let aborted = match registry.base_value(ids.iterations_aborted) {
            Some(MetricValue::Counter(n)) => n,
            _ => 0,
        };
        assert_eq!(aborted, 0);
    }

    #[tokio::test]
    async fn stragglers_are_aborted_and_recorded() {
        let registry = Arc::new(Registry::default());
        let ids = BuiltinMetrics::register(&registry).unwrap_or_else(|e| panic!("{e}"));
        let (ingest, agg) = Aggregator::new(registry.clone(), ids).spawn();

        let mut plan = plan(vec![Stage::new(ms(100), 2)]);
        plan.ramp = crate::config::RampShape::Step;
        plan.graceful_stop = ms(50);

        let body = |_ctx: IterationContext| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<(), IterationError>(())
        };
        let (status_tx, _status_rx) = watch::channel(SchedulerStatus::default());
        let scheduler = Scheduler::new(
            Arc::new(plan),
            Arc::new(body),
            ingest,
            Arc::new(StopSignal::new()),
            status_tx,
        );

        tokio::time::timeout(Duration::from_secs(5), scheduler.run())
            .await
            .unwrap_or_else(|_| panic!("scheduler did not force-stop stragglers"))
            .unwrap_or_else(|e| panic!("{e}"));

        let ingested = agg.await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(ingested, 0);
        assert_eq!(
            registry.base_value(ids.iterations_aborted),
            Some(MetricValue::Counter(2))
        );
    }

    #[tokio::test]
    async fn crashed_vus_are_reported_with_their_id_and_counted() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let body = |_ctx: IterationContext| async move { Ok::<(), IterationError>(()) };
        let (status_tx, _status_rx) = watch::channel(SchedulerStatus::default());
        let mut scheduler = Scheduler::new(
            Arc::new(plan(vec![Stage::new(ms(100), 1)])),
            Arc::new(body),
            IngestSender::from_sender(tx),
            Arc::new(StopSignal::new()),
            status_tx,
        );

        scheduler.spawn_attempts = 1;
        scheduler.active.push_back(VuHandle {
            id: 7,
            stop: Arc::new(StopSignal::new()),
            in_iteration: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            join: tokio::spawn(async {}),
        });
        tokio::time::sleep(ms(20)).await;

        scheduler
            .converge(0)
            .unwrap_or_else(|e| panic!("one failure must not abort: {e}"));
        assert!(scheduler.active.is_empty());
        assert_eq!(scheduler.spawn_failures, 1);

        let mut failed = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let crate::aggregator::Ingest::SpawnFailed { vu_id, .. } = msg {
                failed.push(vu_id);
            }
        }
        assert_eq!(failed, vec![7]);
    }
}
