//! The pipeline executor.
//!
//! A cursor walks the stage chain exactly once per request. Each stage is
//! awaited under a watchdog timer; a stage that neither completes nor
//! errors within the budget is logged and force-advanced, so one stuck
//! stage cannot wedge the request. Errors skip the remaining stages and
//! route to the first registered error handler, or to the default 500
//! handler when none is registered.

use crate::middleware::{PipelineStage, StageFlow};
use crate::models::context::{Request, Response};
use crate::models::error::AppError;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Watchdog budget for a single security stage.
pub const STAGE_WATCHDOG: Duration = Duration::from_millis(100);

/// Synchronous error handler: receives the error and the request it
/// occurred on, produces the full response.
pub type ErrorHandler = Arc<dyn Fn(&AppError, &Request) -> Response + Send + Sync>;

/// Builds the default 500-series handler used when the application did not
/// register its own.
pub fn default_error_handler() -> ErrorHandler {
    Arc::new(|err, _req| {
        let mut res = Response::new();
        let status = err.status().as_u16();
        // These cannot fail on a fresh response.
        let _ = res.set_status(status);
        if let Some(secs) = err.retry_after() {
            let _ = res.insert_header("Retry-After", secs.to_string());
        }
        let _ = res.send_json(&err.body());
        res
    })
}

/// Outcome of a pipeline run, fed back to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Every stage passed; the handler should run next.
    Completed,
    /// A stage wrote the response and terminated the chain.
    ShortCircuited,
    /// An error was routed to the error handler; the response is final.
    Errored,
}

/// Ordered middleware executor for one request.
pub struct RequestPipeline {
    stages: Vec<Arc<dyn PipelineStage>>,
    error_handler: ErrorHandler,
    watchdog: Duration,
}

impl RequestPipeline {
    pub fn new(stages: Vec<Arc<dyn PipelineStage>>, error_handler: Option<ErrorHandler>) -> Self {
        Self {
            stages,
            error_handler: error_handler.unwrap_or_else(default_error_handler),
            watchdog: STAGE_WATCHDOG,
        }
    }

    #[cfg(test)]
    pub fn with_watchdog(mut self, watchdog: Duration) -> Self {
        self.watchdog = watchdog;
        self
    }

    /// Runs the chain over the request. On return the response either
    /// needs the handler (`Completed`) or is final.
    pub async fn run(&self, req: &mut Request, res: &mut Response) -> PipelineOutcome {
        for stage in &self.stages {
            if req.cancel.is_cancelled() {
                debug!("pipeline: request cancelled before stage '{}'", stage.id());
                return PipelineOutcome::ShortCircuited;
            }
            let outcome = if stage.watchdog_exempt() {
                Ok(stage.handle(req, res).await)
            } else {
                timeout(self.watchdog, stage.handle(req, res)).await
            };
            match outcome {
                Ok(Ok(StageFlow::Next)) => continue,
                Ok(Ok(StageFlow::Done)) => {
                    debug!("pipeline: stage '{}' completed the response", stage.id());
                    return PipelineOutcome::ShortCircuited;
                }
                Ok(Err(err)) => {
                    self.route_error(err, req, res);
                    return PipelineOutcome::Errored;
                }
                Err(_) => {
                    // Contract violation: the stage neither finished nor
                    // failed within its budget. Force the cursor forward.
                    warn!(
                        "pipeline: stage '{}' exceeded its {}ms watchdog, advancing",
                        stage.id(),
                        self.watchdog.as_millis()
                    );
                    continue;
                }
            }
        }
        PipelineOutcome::Completed
    }

    /// Routes an error to the configured handler, replacing whatever the
    /// failed stage left in the response.
    pub fn route_error(&self, err: AppError, req: &Request, res: &mut Response) {
        debug!("pipeline: routing error '{}' for {}", err.code(), req.path);
        let error_response = (self.error_handler)(&err, req);
        let mut replacement = error_response;
        std::mem::swap(res, &mut replacement);
    }
}
