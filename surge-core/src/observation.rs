use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Outcome {
    /// The body completed and every check passed.
    Success,
    /// A check failed or the body reported an error.
    Failure,
    /// The iteration could not run to completion (panic or cancellation).
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
}

/// One request issued by the test body, as reported by its transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSample {
    /// Optional logical name, recorded as the `name` tag.
    pub name: Option<String>,
    pub duration: Duration,
    pub status: Option<u16>,
    pub ok: bool,
}

impl RequestSample {
    pub fn new(duration: Duration, status: Option<u16>, ok: bool) -> Self {
        Self {
            name: None,
            duration,
            status,
            ok,
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Immutable record of one completed iteration.
#[derive(Debug, Clone)]
pub struct Observation {
    pub vu_id: u64,
    pub iteration: u64,
    pub timestamp: SystemTime,
    pub duration: Duration,
    pub outcome: Outcome,
    pub checks: Vec<CheckResult>,
    pub requests: Vec<RequestSample>,
    pub tags: BTreeMap<String, String>,
    pub error: Option<String>,
}
