use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};

use tokio::task::{JoinError, JoinHandle};
use tracing::debug;

use crate::aggregator::IngestSender;
use crate::body::{IterationContext, IterationError, TestBody};
use crate::observation::{Observation, Outcome};
use crate::signal::StopSignal;

/// Scheduler-side view of one running VU.
#[derive(Debug)]
pub(crate) struct VuHandle {
    pub(crate) id: u64,
    pub(crate) stop: Arc<StopSignal>,
    /// Set while the VU awaits an iteration; read after the task is joined to decide
    /// whether a forced stop cut an iteration short.
    pub(crate) in_iteration: Arc<AtomicBool>,
    pub(crate) join: JoinHandle<()>,
}

/// Aborts the iteration task if the VU task is dropped (force-stop).
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub(crate) fn spawn_vu<B: TestBody>(
    id: u64,
    body: Arc<B>,
    think_time: Option<Duration>,
    ingest: IngestSender,
) -> VuHandle {
    let stop = Arc::new(StopSignal::new());
    let in_iteration = Arc::new(AtomicBool::new(false));

    let join = tokio::spawn(run_vu(
        id,
        body,
        think_time,
        ingest,
        stop.clone(),
        in_iteration.clone(),
    ));

    VuHandle {
        id,
        stop,
        in_iteration,
        join,
    }
}

async fn run_vu<B: TestBody>(
    id: u64,
    body: Arc<B>,
    think_time: Option<Duration>,
    ingest: IngestSender,
    stop: Arc<StopSignal>,
    in_iteration: Arc<AtomicBool>,
) {
    let mut iteration = 0u64;

    while !stop.is_triggered() {
        in_iteration.store(true, Ordering::Release);
        let obs = run_iteration(id, iteration, &body).await;
        // No await between the push and clearing the flag: a forced stop either lands
        // inside the iteration or after the observation was sent.
        ingest.observation(obs);
        in_iteration.store(false, Ordering::Release);
        iteration += 1;

        if let Some(think) = think_time {
            tokio::select! {
                _ = tokio::time::sleep(think) => {}
                _ = stop.wait() => {}
            }
        }
    }

    debug!(vu_id = id, iterations = iteration, "vu stopped");
}

async fn run_iteration<B: TestBody>(vu_id: u64, iteration: u64, body: &Arc<B>) -> Observation {
    let ctx = IterationContext::new(vu_id, iteration);
    let timestamp = SystemTime::now();
    let started = Instant::now();

    let result: Result<Result<(), IterationError>, String> =
        match std::panic::catch_unwind(AssertUnwindSafe(|| body.call(ctx.clone()))) {
            Ok(fut) => {
                let mut task = AbortOnDrop(tokio::spawn(fut));
                (&mut task.0).await.map_err(join_error_message)
            }
            Err(panic) => Err(panic_message(panic.as_ref())),
        };

    let duration = started.elapsed();
    let record = ctx.take_record();

    let (outcome, error) = match result {
        Ok(Ok(())) if record.checks.iter().all(|c| c.passed) => (Outcome::Success, None),
        Ok(Ok(())) => (Outcome::Failure, None),
        Ok(Err(err)) => (Outcome::Failure, Some(err.to_string())),
        Err(err) => (Outcome::Error, Some(err)),
    };

    Observation {
        vu_id,
        iteration,
        timestamp,
        duration,
        outcome,
        checks: record.checks,
        requests: record.requests,
        tags: record.tags,
        error,
    }
}

fn join_error_message(err: JoinError) -> String {
    if err.is_panic() {
        let panic = err.into_panic();
        panic_message(panic.as_ref())
    } else {
        "iteration was cancelled".to_string()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("iteration panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("iteration panicked: {s}")
    } else {
        "iteration panicked".to_string()
    }
}
