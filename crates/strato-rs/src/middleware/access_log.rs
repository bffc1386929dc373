//! Access logging stage.
//!
//! The stage itself only marks the request; the dispatcher emits the line
//! once the response has been finalized, so status, byte count and
//! duration reflect what actually went on the wire.

use crate::middleware::{PipelineStage, StageFlow};
use crate::models::context::{Request, Response};
use crate::models::error::AppError;
use async_trait::async_trait;
use log::info;
use serde_json::Value;

pub const ACCESS_LOG_ATTR: &str = "access_log";

pub struct AccessLogStage;

#[async_trait]
impl PipelineStage for AccessLogStage {
    fn id(&self) -> &'static str {
        "access-log"
    }

    async fn handle(&self, req: &mut Request, _res: &mut Response) -> Result<StageFlow, AppError> {
        req.set_attribute(ACCESS_LOG_ATTR, Value::Bool(true));
        Ok(StageFlow::Next)
    }
}

/// Emits the access line for a finished request, when the stage marked it.
pub fn emit(req: &Request, status: u16, bytes: usize) {
    if req
        .attribute(ACCESS_LOG_ATTR)
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        info!(
            "{} {} {} {}B {}ms {}",
            req.method,
            req.path,
            status,
            bytes,
            req.elapsed_ms(),
            req.remote_addr
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::route::Method;

    #[tokio::test]
    async fn stage_marks_request() {
        let stage = AccessLogStage;
        let mut req = Request::new(Method::Get, "/x");
        let mut res = Response::new();
        stage.handle(&mut req, &mut res).await.unwrap();
        assert_eq!(
            req.attribute(ACCESS_LOG_ATTR).and_then(|v| v.as_bool()),
            Some(true)
        );
        // emit() on an unmarked request is a no-op; both paths just log.
        emit(&req, 200, 5);
        emit(&Request::new(Method::Get, "/y"), 200, 5);
    }
}
