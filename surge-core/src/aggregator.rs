use std::sync::Arc;

use surge_metrics::{KeyId, MetricHandle, MetricId, MetricKind, Registry, TagSet};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::observation::{Observation, Outcome};

/// Names of the metrics every run registers.
pub mod names {
    pub const ITERATIONS: &str = "iterations";
    pub const ITERATIONS_FAILED: &str = "iterations_failed";
    pub const ITERATION_FAILED: &str = "iteration_failed";
    pub const ITERATION_DURATION: &str = "iteration_duration";
    pub const ITERATIONS_ABORTED: &str = "iterations_aborted";
    pub const CHECKS: &str = "checks";
    pub const HTTP_REQS: &str = "http_reqs";
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
    pub const VUS: &str = "vus";
    pub const VUS_MAX: &str = "vus_max";
    pub const SCHEDULER_ERRORS: &str = "scheduler_errors";

    /// Tag carrying the check name on per-check `checks` series.
    pub const CHECK_TAG: &str = "check";
    pub const STATUS_TAG: &str = "status";
    pub const NAME_TAG: &str = "name";
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct BuiltinMetrics {
    pub(crate) iterations: MetricId,
    pub(crate) iterations_failed: MetricId,
    pub(crate) iteration_failed: MetricId,
    pub(crate) iteration_duration: MetricId,
    pub(crate) iterations_aborted: MetricId,
    pub(crate) checks: MetricId,
    pub(crate) http_reqs: MetricId,
    pub(crate) http_req_duration: MetricId,
    pub(crate) http_req_failed: MetricId,
    pub(crate) vus: MetricId,
    pub(crate) vus_max: MetricId,
    pub(crate) scheduler_errors: MetricId,
}

impl BuiltinMetrics {
    pub(crate) fn register(registry: &Registry) -> Result<Self> {
        Ok(Self {
            iterations: registry.register(names::ITERATIONS, MetricKind::Counter)?,
            iterations_failed: registry.register(names::ITERATIONS_FAILED, MetricKind::Counter)?,
            iteration_failed: registry.register(names::ITERATION_FAILED, MetricKind::Rate)?,
            iteration_duration: registry.register(names::ITERATION_DURATION, MetricKind::Trend)?,
            iterations_aborted: registry
                .register(names::ITERATIONS_ABORTED, MetricKind::Counter)?,
            checks: registry.register(names::CHECKS, MetricKind::Rate)?,
            http_reqs: registry.register(names::HTTP_REQS, MetricKind::Counter)?,
            http_req_duration: registry.register(names::HTTP_REQ_DURATION, MetricKind::Trend)?,
            http_req_failed: registry.register(names::HTTP_REQ_FAILED, MetricKind::Rate)?,
            vus: registry.register(names::VUS, MetricKind::Gauge)?,
            vus_max: registry.register(names::VUS_MAX, MetricKind::Gauge)?,
            scheduler_errors: registry.register(names::SCHEDULER_ERRORS, MetricKind::Counter)?,
        })
    }
}

/// Messages accepted by the aggregator task.
#[derive(Debug)]
pub(crate) enum Ingest {
    Observation(Box<Observation>),
    /// A VU was force-stopped in the middle of an iteration.
    Aborted { vu_id: u64 },
    SpawnFailed { vu_id: u64, reason: String },
    Vus { live: u64 },
}

/// The only way to submit data to the aggregator. Sends never block.
#[derive(Debug, Clone)]
pub(crate) struct IngestSender {
    tx: mpsc::UnboundedSender<Ingest>,
}

impl IngestSender {
    pub(crate) fn from_sender(tx: mpsc::UnboundedSender<Ingest>) -> Self {
        Self { tx }
    }

    fn send(&self, msg: Ingest) {
        if self.tx.send(msg).is_err() {
            trace!("aggregator is gone; dropping message");
        }
    }

    pub(crate) fn observation(&self, obs: Observation) {
        self.send(Ingest::Observation(Box::new(obs)));
    }

    pub(crate) fn aborted(&self, vu_id: u64) {
        self.send(Ingest::Aborted { vu_id });
    }

    pub(crate) fn spawn_failed(&self, vu_id: u64, reason: String) {
        self.send(Ingest::SpawnFailed { vu_id, reason });
    }

    pub(crate) fn vus(&self, live: u64) {
        self.send(Ingest::Vus { live });
    }
}

/// Single writer of the run's metric registry.
#[derive(Debug)]
pub(crate) struct Aggregator {
    registry: Arc<Registry>,
    ids: BuiltinMetrics,
    check_key: KeyId,
    status_key: KeyId,
    name_key: KeyId,
    ingested: u64,
}

impl Aggregator {
    pub(crate) fn new(registry: Arc<Registry>, ids: BuiltinMetrics) -> Self {
        let check_key = registry.resolve_key(names::CHECK_TAG);
        let status_key = registry.resolve_key(names::STATUS_TAG);
        let name_key = registry.resolve_key(names::NAME_TAG);
        Self {
            registry,
            ids,
            check_key,
            status_key,
            name_key,
            ingested: 0,
        }
    }

    /// Applies `f` to the base series and, when `tags` is non-empty, to the tagged series.
    fn each(&self, metric: MetricId, tags: &TagSet, f: impl Fn(&MetricHandle)) {
        if let Some(h) = self.registry.base(metric) {
            f(&h);
        }
        if !tags.is_empty()
            && let Some(h) = self.registry.handle(metric, tags.clone())
        {
            f(&h);
        }
    }

    fn with_extra(&self, base: &TagSet, extra: &[(KeyId, KeyId)]) -> TagSet {
        let mut tags: Vec<(KeyId, KeyId)> = base
            .iter()
            .filter(|(k, _)| !extra.iter().any(|(ek, _)| ek == k))
            .chain(extra.iter().copied())
            .collect();
        tags.sort_unstable();
        TagSet::from_sorted_iter(tags)
    }

    pub(crate) fn apply(&mut self, msg: Ingest) {
        match msg {
            Ingest::Observation(obs) => self.observe(&obs),
            Ingest::Aborted { vu_id } => {
                debug!(vu_id, "iteration aborted");
                if let Some(h) = self.registry.base(self.ids.iterations_aborted) {
                    h.increment(1);
                }
            }
            Ingest::SpawnFailed { vu_id, reason } => {
                debug!(vu_id, reason = %reason, "vu spawn failed");
                if let Some(h) = self.registry.base(self.ids.scheduler_errors) {
                    h.increment(1);
                }
            }
            Ingest::Vus { live } => {
                let live = i64::try_from(live).unwrap_or(i64::MAX);
                if let Some(h) = self.registry.base(self.ids.vus) {
                    h.set_gauge(live);
                }
                if let Some(h) = self.registry.base(self.ids.vus_max) {
                    h.max_gauge(live);
                }
            }
        }
    }

    fn observe(&mut self, obs: &Observation) {
        self.ingested += 1;

        let tags = self
            .registry
            .resolve_tags(obs.tags.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let failed = obs.outcome != Outcome::Success;

        self.each(self.ids.iterations, &tags, |h| h.increment(1));
        self.each(self.ids.iteration_failed, &tags, |h| h.add_rate(failed));
        if failed {
            self.each(self.ids.iterations_failed, &tags, |h| h.increment(1));
        }
        let duration_ms = obs.duration.as_secs_f64() * 1000.0;
        self.each(self.ids.iteration_duration, &tags, |h| h.observe(duration_ms));

        // `checks` counts failed checks as hits.
        for check in &obs.checks {
            let name = self.registry.resolve_key(&check.name);
            let check_tags = self.with_extra(&tags, &[(self.check_key, name)]);
            self.each(self.ids.checks, &check_tags, |h| h.add_rate(!check.passed));
        }

        for req in &obs.requests {
            let mut extra = Vec::with_capacity(2);
            if let Some(status) = req.status {
                extra.push((self.status_key, self.registry.resolve_key(&status.to_string())));
            }
            if let Some(name) = &req.name {
                extra.push((self.name_key, self.registry.resolve_key(name)));
            }
            let req_tags = self.with_extra(&tags, &extra);

            let ms = req.duration.as_secs_f64() * 1000.0;
            self.each(self.ids.http_reqs, &req_tags, |h| h.increment(1));
            self.each(self.ids.http_req_duration, &req_tags, |h| h.observe(ms));
            self.each(self.ids.http_req_failed, &req_tags, |h| h.add_rate(!req.ok));
        }

        if let Some(err) = &obs.error {
            trace!(
                vu_id = obs.vu_id,
                iteration = obs.iteration,
                outcome = %obs.outcome,
                error = %err,
                "iteration did not succeed"
            );
        }
    }

    /// Starts the aggregator task. It ends once every [`IngestSender`] is dropped and
    /// returns the number of observations it ingested.
    pub(crate) fn spawn(mut self) -> (IngestSender, JoinHandle<u64>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                self.apply(msg);
            }
            if self.ingested == 0 {
                warn!("run finished without a single completed iteration");
            }
            debug!(observations = self.ingested, "aggregator drained");
            self.ingested
        });
        (IngestSender::from_sender(tx), task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::{CheckResult, RequestSample};
    use std::collections::BTreeMap;
    use std::time::{Duration, SystemTime};
    use surge_metrics::MetricValue;

    fn observation(vu_id: u64, iteration: u64, outcome: Outcome) -> Observation {
        Observation {
            vu_id,
            iteration,
            timestamp: SystemTime::now(),
            duration: Duration::from_millis(100 + iteration),
            outcome,
            checks: vec![CheckResult {
                name: "status is 200".to_string(),
                passed: outcome == Outcome::Success,
            }],
            requests: vec![RequestSample::new(
                Duration::from_millis(90),
                Some(200),
                outcome != Outcome::Error,
            )],
            tags: BTreeMap::new(),
            error: None,
        }
    }

    fn setup() -> (Arc<Registry>, BuiltinMetrics) {
        let registry = Arc::new(Registry::default());
        let ids = BuiltinMetrics::register(&registry).unwrap_or_else(|e| panic!("{e}"));
        (registry, ids)
    }

    #[test]
    fn counters_do_not_depend_on_submission_order() {
        let outcomes = [Outcome::Success, Outcome::Failure, Outcome::Error];
        let all: Vec<Observation> = (0..30)
            .map(|i| observation(i % 4, i, outcomes[(i % 3) as usize]))
            .collect();

        let mut reversed = all.clone();
        reversed.reverse();
        let mut interleaved: Vec<Observation> = all.iter().step_by(2).cloned().collect();
        interleaved.extend(all.iter().skip(1).step_by(2).cloned());

        let mut results = Vec::new();
        for order in [all, reversed, interleaved] {
            let (registry, ids) = setup();
            let mut agg = Aggregator::new(registry.clone(), ids);
            for obs in order {
                agg.apply(Ingest::Observation(Box::new(obs)));
            }
            results.push((
                registry.base_value(ids.iterations),
                registry.base_value(ids.iterations_failed),
                registry.base_value(ids.iteration_failed),
                registry.base_value(ids.checks),
                match registry.base_value(ids.iteration_duration) {
                    // The float sum behind `avg` may differ in the last bit between orders.
                    Some(MetricValue::Trend(t)) => Some((t.count, t.min, t.max, t.p95)),
                    _ => None,
                },
            ));
        }

        assert_eq!(results[0].0, Some(MetricValue::Counter(30)));
        assert_eq!(results[0].1, Some(MetricValue::Counter(20)));
        assert!(results.iter().all(|r| *r == results[0]));
    }

    #[test]
    fn checks_and_requests_feed_their_metrics() {
        let (registry, ids) = setup();
        let mut agg = Aggregator::new(registry.clone(), ids);

        let mut obs = observation(1, 0, Outcome::Failure);
        obs.tags.insert("group".to_string(), "login".to_string());
        agg.apply(Ingest::Observation(Box::new(obs)));
        agg.apply(Ingest::Observation(Box::new(observation(1, 1, Outcome::Success))));

        let Some(MetricValue::Rate(checks)) = registry.base_value(ids.checks) else {
            panic!("expected checks rate");
        };
        assert_eq!((checks.total, checks.hits), (2, 1));

        assert_eq!(registry.base_value(ids.http_reqs), Some(MetricValue::Counter(2)));

        let status_k = registry.resolve_key(names::STATUS_TAG);
        let ok = registry.resolve_key("200");
        assert_eq!(
            registry.query(ids.http_reqs).where_eq(status_k, ok).sum_counter_total(),
            2
        );

        let group_k = registry.resolve_key("group");
        assert_eq!(
            registry.query(ids.iterations).where_has(group_k).sum_counter_total(),
            1
        );
    }

    #[test]
    fn scheduler_messages_update_gauges_and_counters() {
        let (registry, ids) = setup();
        let mut agg = Aggregator::new(registry.clone(), ids);

        agg.apply(Ingest::Vus { live: 5 });
        agg.apply(Ingest::Vus { live: 2 });
        agg.apply(Ingest::Aborted { vu_id: 3 });
        agg.apply(Ingest::SpawnFailed {
            vu_id: 4,
            reason: "no".to_string(),
        });

        assert_eq!(registry.base_value(ids.vus), Some(MetricValue::Gauge(2)));
        assert_eq!(registry.base_value(ids.vus_max), Some(MetricValue::Gauge(5)));
        assert_eq!(
            registry.base_value(ids.iterations_aborted),
            Some(MetricValue::Counter(1))
        );
        assert_eq!(
            registry.base_value(ids.scheduler_errors),
            Some(MetricValue::Counter(1))
        );
    }

    #[tokio::test]
    async fn task_drains_when_senders_drop() {
        let (registry, ids) = setup();
        let (tx, task) = Aggregator::new(registry.clone(), ids).spawn();

        let handles: Vec<_> = (0..4)
            .map(|vu| {
                let tx = tx.clone();
                tokio::spawn(async move {
                    for i in 0..25 {
                        tx.observation(observation(vu, i, Outcome::Success));
                    }
                })
            })
            .collect();
        drop(tx);
        for h in handles {
            h.await.unwrap_or_else(|e| panic!("{e}"));
        }

        let ingested = task.await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(ingested, 100);
        assert_eq!(registry.base_value(ids.iterations), Some(MetricValue::Counter(100)));
    }
}
