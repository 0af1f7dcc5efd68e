use std::collections::BTreeMap;

use serde::Serialize;
use surge_core::{MetricValue, Summary, ThresholdResult};

/// Serializable view of a [`Summary`], shared by `--output json` and `--summary-out`.
#[derive(Debug, Serialize)]
pub(crate) struct JsonSummary {
    pub state: String,
    pub duration_secs: f64,
    pub overall_pass: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub metrics: BTreeMap<String, JsonMetric>,
    pub thresholds: Vec<JsonThreshold>,
    pub checks: Vec<JsonCheck>,
    pub series: Vec<JsonSeries>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum JsonMetric {
    Counter {
        count: u64,
        rate: f64,
    },
    Gauge {
        value: i64,
    },
    /// `hits` counts the samples the metric tracks (failed checks for `checks`,
    /// failed requests for `http_req_failed`), so `rate = hits / total`.
    Rate {
        rate: Option<f64>,
        hits: u64,
        total: u64,
    },
    Trend {
        count: u64,
        avg: Option<f64>,
        min: Option<f64>,
        med: Option<f64>,
        max: Option<f64>,
        #[serde(rename = "p(90)")]
        p90: Option<f64>,
        #[serde(rename = "p(95)")]
        p95: Option<f64>,
        #[serde(rename = "p(99)")]
        p99: Option<f64>,
    },
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonThreshold {
    pub metric: String,
    pub expression: String,
    pub passed: bool,
    pub observed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    pub abort_on_fail: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonCheck {
    pub name: String,
    pub passes: u64,
    pub fails: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonSeries {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub value: JsonMetric,
}

/// Counter rates are per second of run time, as k6 reports them.
fn json_metric(value: &MetricValue, duration_secs: f64) -> JsonMetric {
    match value {
        MetricValue::Counter(count) => JsonMetric::Counter {
            count: *count,
            rate: if duration_secs > 0.0 {
                *count as f64 / duration_secs
            } else {
                0.0
            },
        },
        MetricValue::Gauge(value) => JsonMetric::Gauge { value: *value },
        MetricValue::Rate(r) => JsonMetric::Rate {
            rate: r.rate,
            hits: r.hits,
            total: r.total,
        },
        MetricValue::Trend(t) => JsonMetric::Trend {
            count: t.count,
            avg: t.avg,
            min: t.min,
            med: t.med,
            max: t.max,
            p90: t.p90,
            p95: t.p95,
            p99: t.p99,
        },
    }
}

fn json_threshold(t: &ThresholdResult) -> JsonThreshold {
    JsonThreshold {
        metric: t.metric.clone(),
        expression: t.expression.clone(),
        passed: t.passed,
        observed: t.observed,
        diagnostic: t.diagnostic.clone(),
        abort_on_fail: t.abort_on_fail,
    }
}

pub(crate) fn build_summary(summary: &Summary) -> JsonSummary {
    let duration_secs = summary.duration.as_secs_f64();

    JsonSummary {
        state: summary.state.to_string(),
        duration_secs,
        overall_pass: summary.overall_pass,
        abort_reason: summary.abort_reason.as_ref().map(ToString::to_string),
        metrics: summary
            .metrics
            .iter()
            .map(|(name, m)| (name.clone(), json_metric(&m.value, duration_secs)))
            .collect(),
        thresholds: summary.thresholds.iter().map(json_threshold).collect(),
        checks: summary
            .checks
            .iter()
            .map(|c| JsonCheck {
                name: c.name.clone(),
                passes: c.passes,
                fails: c.fails,
            })
            .collect(),
        series: summary
            .series
            .iter()
            .filter(|s| !s.tags.is_empty())
            .map(|s| JsonSeries {
                name: s.name.clone(),
                tags: s.tags.iter().cloned().collect(),
                value: json_metric(&s.value, duration_secs),
            })
            .collect(),
    }
}

pub(crate) async fn write_summary_file(
    path: &std::path::Path,
    summary: &Summary,
) -> anyhow::Result<()> {
    use anyhow::Context as _;

    let json = serde_json::to_string_pretty(&build_summary(summary))
        .context("failed to encode summary")?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("failed to create summary output dir: {}", parent.display())
        })?;
    }
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("failed to write summary: {}", path.display()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::Value;
    use std::time::Duration;
    use surge_core::{
        AbortReason, CheckSummary, MetricKind, MetricSeriesSummary, MetricSummary, RateSummary,
        RunState, TrendSummary,
    };

    pub(crate) fn sample_summary() -> Summary {
        let mut metrics = BTreeMap::new();
        metrics.insert(
            "http_reqs".to_string(),
            MetricSummary {
                kind: MetricKind::Counter,
                value: MetricValue::Counter(40),
            },
        );
        metrics.insert(
            "http_req_failed".to_string(),
            MetricSummary {
                kind: MetricKind::Rate,
                value: MetricValue::Rate(RateSummary::new(40, 2)),
            },
        );
        metrics.insert(
            "checks".to_string(),
            MetricSummary {
                kind: MetricKind::Rate,
                value: MetricValue::Rate(RateSummary::new(40, 2)),
            },
        );
        metrics.insert(
            "http_req_duration".to_string(),
            MetricSummary {
                kind: MetricKind::Trend,
                value: MetricValue::Trend(TrendSummary {
                    count: 40,
                    min: Some(1.0),
                    max: Some(9.0),
                    avg: Some(4.0),
                    med: Some(3.5),
                    p90: Some(8.0),
                    p95: Some(8.5),
                    p99: Some(9.0),
                }),
            },
        );

        Summary {
            state: RunState::Aborted,
            duration: Duration::from_secs(4),
            metrics,
            series: vec![MetricSeriesSummary {
                name: "checks".to_string(),
                kind: MetricKind::Rate,
                tags: vec![("check".to_string(), "status is 200".to_string())],
                value: MetricValue::Rate(RateSummary::new(40, 2)),
            }],
            thresholds: vec![ThresholdResult {
                metric: "http_req_failed".to_string(),
                expression: "rate<0.01".to_string(),
                passed: false,
                observed: Some(0.05),
                diagnostic: None,
                abort_on_fail: true,
            }],
            checks: vec![CheckSummary {
                name: "status is 200".to_string(),
                passes: 38,
                fails: 2,
            }],
            overall_pass: false,
            abort_reason: Some(AbortReason::Threshold {
                name: "http_req_failed: rate<0.01".to_string(),
            }),
        }
    }

    #[test]
    fn summary_json_shape() {
        let v: Value = match serde_json::to_value(build_summary(&sample_summary())) {
            Ok(v) => v,
            Err(err) => panic!("to_value failed: {err}"),
        };

        assert_eq!(v.get("state").and_then(Value::as_str), Some("aborted"));
        assert_eq!(v.get("overall_pass").and_then(Value::as_bool), Some(false));
        assert!(
            v.get("abort_reason")
                .and_then(Value::as_str)
                .is_some_and(|s| s.contains("http_req_failed"))
        );

        assert_eq!(
            v.pointer("/metrics/http_reqs/type").and_then(Value::as_str),
            Some("counter")
        );
        assert_eq!(
            v.pointer("/metrics/http_reqs/rate").and_then(Value::as_f64),
            Some(10.0)
        );
        assert_eq!(
            v.pointer("/metrics/http_req_failed/hits").and_then(Value::as_u64),
            Some(2)
        );
        assert_eq!(
            v.pointer("/metrics/http_req_failed/total").and_then(Value::as_u64),
            Some(40)
        );

        // Two of forty checks failed: the metric and the check breakdown agree.
        assert_eq!(
            v.pointer("/metrics/checks/hits").and_then(Value::as_u64),
            v.pointer("/checks/0/fails").and_then(Value::as_u64)
        );
        assert_eq!(
            v.pointer("/metrics/checks/total").and_then(Value::as_u64),
            Some(40)
        );
        assert_eq!(
            v.pointer("/metrics/checks/rate").and_then(Value::as_f64),
            Some(0.05)
        );
        assert_eq!(
            v.pointer("/metrics/http_req_duration/p(90)")
                .and_then(Value::as_f64),
            Some(8.0)
        );
        assert_eq!(
            v.pointer("/thresholds/0/passed").and_then(Value::as_bool),
            Some(false)
        );
        assert_eq!(
            v.pointer("/series/0/tags/check").and_then(Value::as_str),
            Some("status is 200")
        );
    }

    #[tokio::test]
    async fn summary_file_is_pretty_json() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let path = dir.path().join("nested").join("summary.json");

        write_summary_file(&path, &sample_summary())
            .await
            .unwrap_or_else(|e| panic!("write summary: {e:#}"));

        let text = std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("read: {e}"));
        assert!(text.contains("\n  \"state\": \"aborted\""), "{text}");
        let v: Value = serde_json::from_str(&text).unwrap_or_else(|e| panic!("parse: {e}"));
        assert_eq!(v.get("checks").and_then(Value::as_array).map(Vec::len), Some(1));
    }
}
