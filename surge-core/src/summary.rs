use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use surge_metrics::{MetricKind, MetricSeriesSummary, MetricValue};

use crate::run::RunState;
use crate::thresholds_eval::ThresholdResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// An `abort_on_fail` threshold was breached.
    Threshold { name: String },
    /// Too many VUs failed to spawn, or the scheduler itself failed.
    Scheduler(String),
    /// Stopped from outside through a [`crate::StopHandle`].
    Interrupted,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Threshold { name } => write!(f, "threshold `{name}` crossed"),
            Self::Scheduler(msg) => write!(f, "scheduler: {msg}"),
            Self::Interrupted => f.write_str("interrupted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricSummary {
    pub kind: MetricKind,
    pub value: MetricValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckSummary {
    pub name: String,
    pub passes: u64,
    pub fails: u64,
}

/// Final result of a run. Produced once, after every observation was aggregated.
#[derive(Debug, Clone)]
pub struct Summary {
    pub state: RunState,
    pub duration: Duration,
    /// Base (untagged) value of every metric.
    pub metrics: BTreeMap<String, MetricSummary>,
    /// Every tagged and untagged series.
    pub series: Vec<MetricSeriesSummary>,
    pub thresholds: Vec<ThresholdResult>,
    pub checks: Vec<CheckSummary>,
    pub overall_pass: bool,
    pub abort_reason: Option<AbortReason>,
}

impl Summary {
    /// Threshold name → passed.
    pub fn threshold_results(&self) -> BTreeMap<String, bool> {
        self.thresholds
            .iter()
            .map(|t| (t.name(), t.passed))
            .collect()
    }

    pub fn failed_thresholds(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.thresholds.iter().filter(|t| !t.passed)
    }

    pub fn metric(&self, name: &str) -> Option<&MetricSummary> {
        self.metrics.get(name)
    }

    pub fn counter(&self, name: &str) -> Option<u64> {
        match self.metric(name)?.value {
            MetricValue::Counter(v) => Some(v),
            _ => None,
        }
    }

    pub fn rate(&self, name: &str) -> Option<f64> {
        match &self.metric(name)?.value {
            MetricValue::Rate(r) => r.rate,
            _ => None,
        }
    }
}
