use std::time::Duration;

use surge_metrics::{MetricId, MetricKind, MetricValue, Registry};

use crate::thresholds::{Statistic, Threshold};

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    pub passed: bool,
    /// Value the expression was compared against, if one could be computed.
    pub observed: Option<f64>,
    /// Why no value could be computed.
    pub diagnostic: Option<String>,
    pub abort_on_fail: bool,
}

impl ThresholdResult {
    pub fn name(&self) -> String {
        format!("{}: {}", self.metric, self.expression)
    }

    /// A failure backed by an observed value, as opposed to a metric that is missing
    /// or has no samples yet.
    pub fn is_breach(&self) -> bool {
        !self.passed && self.observed.is_some()
    }
}

pub fn evaluate_thresholds(
    registry: &Registry,
    thresholds: &[Threshold],
    elapsed: Duration,
) -> Vec<ThresholdResult> {
    thresholds
        .iter()
        .map(|t| evaluate_threshold(registry, t, elapsed))
        .collect()
}

pub fn evaluate_threshold(
    registry: &Registry,
    threshold: &Threshold,
    elapsed: Duration,
) -> ThresholdResult {
    let observed = match registry.lookup(&threshold.metric) {
        Some((id, kind)) => observed_value(registry, id, kind, threshold.parsed.statistic, elapsed),
        None => Err(format!("metric `{}` does not exist", threshold.metric)),
    };

    let (passed, observed, diagnostic) = match observed {
        Ok(v) => (
            threshold.parsed.op.compare(v, threshold.parsed.value),
            Some(v),
            None,
        ),
        Err(diag) => (false, None, Some(diag)),
    };

    ThresholdResult {
        metric: threshold.metric.clone(),
        expression: threshold.expression.clone(),
        passed,
        observed,
        diagnostic,
        abort_on_fail: threshold.abort_on_fail,
    }
}

fn observed_value(
    registry: &Registry,
    id: MetricId,
    kind: MetricKind,
    statistic: Statistic,
    elapsed: Duration,
) -> Result<f64, String> {
    let value = registry
        .base_value(id)
        .unwrap_or_else(|| MetricValue::empty(kind));
    let unsupported = || Err(format!("`{statistic}` is not defined for {kind} metrics"));
    let no_samples = || Err("no samples recorded yet".to_string());

    match (value, statistic) {
        (MetricValue::Counter(sum), Statistic::Count | Statistic::Value) => Ok(sum as f64),
        (MetricValue::Counter(sum), Statistic::Rate) => {
            let secs = elapsed.as_secs_f64();
            if secs > 0.0 {
                Ok(sum as f64 / secs)
            } else {
                Err("run has not started".to_string())
            }
        }
        (MetricValue::Counter(_), _) => unsupported(),

        (MetricValue::Gauge(v), Statistic::Value) => Ok(v as f64),
        (MetricValue::Gauge(_), _) => unsupported(),

        (MetricValue::Rate(r), Statistic::Rate) => r.rate.map_or_else(no_samples, Ok),
        (MetricValue::Rate(r), Statistic::Count) => Ok(r.total as f64),
        (MetricValue::Rate(_), _) => unsupported(),

        (MetricValue::Trend(t), Statistic::Count) => Ok(t.count as f64),
        (MetricValue::Trend(t), Statistic::Avg) => t.avg.map_or_else(no_samples, Ok),
        (MetricValue::Trend(t), Statistic::Min) => t.min.map_or_else(no_samples, Ok),
        (MetricValue::Trend(t), Statistic::Max) => t.max.map_or_else(no_samples, Ok),
        (MetricValue::Trend(t), Statistic::Med) => t.med.map_or_else(no_samples, Ok),
        (MetricValue::Trend(_), Statistic::P(p)) => registry
            .trend_percentile(id, p)
            .map_or_else(no_samples, Ok),
        (MetricValue::Trend(_), _) => unsupported(),
    }
}
