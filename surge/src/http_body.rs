use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use surge_core::{IterationContext, IterationError, RequestSample, TestBody};
use surge_http::{HttpClient, HttpRequest};
use tracing::debug;

use crate::plan_yaml::Target;

type IterationFuture = Pin<Box<dyn Future<Output = Result<(), IterationError>> + Send>>;

/// Sends the plan's target request once per iteration and checks its status.
pub(crate) struct HttpTestBody {
    client: HttpClient,
    target: Arc<Target>,
    check_name: Arc<str>,
}

impl HttpTestBody {
    pub(crate) fn new(client: HttpClient, target: Target) -> Self {
        let check_name = Arc::from(format!("status is {}", target.expect_status));
        Self {
            client,
            target: Arc::new(target),
            check_name,
        }
    }
}

/// k6 counts 2xx and 3xx as expected responses for `http_req_failed`.
fn is_expected_response(status: u16) -> bool {
    (200..400).contains(&status)
}

fn build_request(target: &Target) -> HttpRequest {
    let mut req = HttpRequest::new(target.method.clone(), target.url.as_str())
        .with_timeout(Some(target.timeout));
    for (name, value) in &target.headers {
        req = req.with_header(name.as_str(), value.as_str());
    }
    if let Some(body) = &target.body {
        req.body = Bytes::from(body.clone());
    }
    req
}

impl TestBody for HttpTestBody {
    type Fut = IterationFuture;

    fn call(&self, ctx: IterationContext) -> Self::Fut {
        let client = self.client.clone();
        let target = self.target.clone();
        let check_name = self.check_name.clone();

        Box::pin(async move {
            let req = build_request(&target);
            let started = Instant::now();

            match client.request(req).await {
                Ok(res) => {
                    ctx.record_request(
                        RequestSample::new(
                            res.elapsed,
                            Some(res.status),
                            is_expected_response(res.status),
                        )
                        .named(target.url.as_str()),
                    );
                    ctx.check(check_name.as_ref(), res.status == target.expect_status);
                    Ok(())
                }
                Err(err) => {
                    debug!(vu = ctx.vu_id(), error = %err, "request failed");
                    ctx.record_request(
                        RequestSample::new(started.elapsed(), None, false)
                            .named(target.url.as_str()),
                    );
                    ctx.check(check_name.as_ref(), false);
                    Err(IterationError::new(err.to_string()))
                }
            }
        })
    }
}
