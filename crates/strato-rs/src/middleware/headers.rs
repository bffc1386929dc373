//! Security response headers.

use crate::middleware::{PipelineStage, StageFlow};
use crate::models::config::RuntimeEnv;
use crate::models::context::{Request, Response};
use crate::models::error::AppError;
use async_trait::async_trait;

/// Sets the hardening header set on every response. Values match the
/// usual helmet defaults; CSP is emitted only when configured.
pub struct SecurityHeadersStage {
    csp: Option<String>,
    env: RuntimeEnv,
}

impl SecurityHeadersStage {
    pub fn new(csp: Option<String>, env: RuntimeEnv) -> Self {
        Self { csp, env }
    }
}

#[async_trait]
impl PipelineStage for SecurityHeadersStage {
    fn id(&self) -> &'static str {
        "security-headers"
    }

    async fn handle(&self, _req: &mut Request, res: &mut Response) -> Result<StageFlow, AppError> {
        res.insert_header("X-Content-Type-Options", "nosniff")?;
        res.insert_header("X-Frame-Options", "DENY")?;
        res.insert_header("Referrer-Policy", "no-referrer")?;
        res.insert_header(
            "Permissions-Policy",
            "geolocation=(), microphone=(), camera=()",
        )?;
        if self.env == RuntimeEnv::Production {
            res.insert_header(
                "Strict-Transport-Security",
                "max-age=31536000; includeSubDomains",
            )?;
        }
        if let Some(csp) = &self.csp {
            res.insert_header("Content-Security-Policy", csp.clone())?;
        }
        Ok(StageFlow::Next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::route::Method;

    #[tokio::test]
    async fn baseline_headers_are_set() {
        let stage = SecurityHeadersStage::new(None, RuntimeEnv::Development);
        let mut req = Request::new(Method::Get, "/");
        let mut res = Response::new();
        let flow = stage.handle(&mut req, &mut res).await.unwrap();
        assert_eq!(flow, StageFlow::Next);
        assert_eq!(res.header("x-content-type-options"), Some("nosniff"));
        assert_eq!(res.header("x-frame-options"), Some("DENY"));
        assert!(res.header("strict-transport-security").is_none());
        assert!(res.header("content-security-policy").is_none());
    }

    #[tokio::test]
    async fn production_adds_hsts_and_csp_when_configured() {
        let stage = SecurityHeadersStage::new(
            Some("default-src 'self'".to_string()),
            RuntimeEnv::Production,
        );
        let mut req = Request::new(Method::Get, "/");
        let mut res = Response::new();
        stage.handle(&mut req, &mut res).await.unwrap();
        assert!(res
            .header("strict-transport-security")
            .unwrap()
            .contains("max-age"));
        assert_eq!(
            res.header("content-security-policy"),
            Some("default-src 'self'")
        );
    }
}
