use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::observation::{CheckResult, RequestSample};

/// Error returned by a test body. The iteration is recorded as a failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct IterationError(String);

impl IterationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for IterationError {
    fn from(v: String) -> Self {
        Self(v)
    }
}

impl From<&str> for IterationError {
    fn from(v: &str) -> Self {
        Self(v.to_string())
    }
}

#[derive(Debug, Default)]
pub(crate) struct IterationRecord {
    pub(crate) checks: Vec<CheckResult>,
    pub(crate) requests: Vec<RequestSample>,
    pub(crate) tags: BTreeMap<String, String>,
}

/// Handle passed to the test body for one iteration.
#[derive(Debug, Clone)]
pub struct IterationContext {
    vu_id: u64,
    iteration: u64,
    record: Arc<Mutex<IterationRecord>>,
}

impl IterationContext {
    pub fn new(vu_id: u64, iteration: u64) -> Self {
        Self {
            vu_id,
            iteration,
            record: Arc::new(Mutex::new(IterationRecord::default())),
        }
    }

    pub fn vu_id(&self) -> u64 {
        self.vu_id
    }

    /// 0-based iteration index within this VU.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Records a named check and returns `passed`.
    pub fn check(&self, name: impl Into<String>, passed: bool) -> bool {
        self.record.lock().checks.push(CheckResult {
            name: name.into(),
            passed,
        });
        passed
    }

    pub fn record_request(&self, sample: RequestSample) {
        self.record.lock().requests.push(sample);
    }

    /// Adds a tag to every metric sample derived from this iteration.
    pub fn tag(&self, key: impl Into<String>, value: impl Into<String>) {
        self.record.lock().tags.insert(key.into(), value.into());
    }

    pub fn checks(&self) -> Vec<CheckResult> {
        self.record.lock().checks.clone()
    }

    pub fn requests(&self) -> Vec<RequestSample> {
        self.record.lock().requests.clone()
    }

    pub(crate) fn take_record(&self) -> IterationRecord {
        std::mem::take(&mut *self.record.lock())
    }
}

/// The user-supplied iteration logic.
///
/// Implemented for every `Fn(IterationContext) -> Future<Output = Result<(), IterationError>>`,
/// so plain async closures can be used directly.
pub trait TestBody: Send + Sync + 'static {
    type Fut: Future<Output = Result<(), IterationError>> + Send + 'static;

    /// Per-VU setup, run by the scheduler before the VU starts iterating. An error
    /// counts as a failed spawn.
    fn init_vu(&self, _vu_id: u64) -> Result<(), String> {
        Ok(())
    }

    fn call(&self, ctx: IterationContext) -> Self::Fut;
}

impl<F, Fut> TestBody for F
where
    F: Fn(IterationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), IterationError>> + Send + 'static,
{
    type Fut = Fut;

    fn call(&self, ctx: IterationContext) -> Fut {
        self(ctx)
    }
}
