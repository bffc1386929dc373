//! Cross-origin resource sharing stage.
//!
//! Preflights (`OPTIONS` carrying `Access-Control-Request-Method`) are
//! answered directly with 204 and the full CORS header set. Simple
//! requests get `Access-Control-Allow-Origin` (and the credentials flag)
//! added and continue down the chain.
//!
//! Header values are always strings: method and header lists are joined
//! with `", "` before assignment, never serialized as a container.

use crate::middleware::{PipelineStage, StageFlow};
use crate::models::config::{CorsOrigin, CorsPolicy};
use crate::models::context::{Request, Response};
use crate::models::error::AppError;
use async_trait::async_trait;
use log::debug;

pub struct CorsStage {
    policy: CorsPolicy,
    /// `Access-Control-Allow-Methods` value, prejoined at construction.
    methods_value: String,
    /// `Access-Control-Allow-Headers` value, prejoined at construction.
    headers_value: String,
}

impl CorsStage {
    pub fn new(policy: CorsPolicy) -> Self {
        let methods_value = policy
            .methods
            .iter()
            .map(|m| m.to_ascii_uppercase())
            .collect::<Vec<_>>()
            .join(", ");
        let headers_value = policy.allowed_headers.join(", ");
        Self {
            policy,
            methods_value,
            headers_value,
        }
    }

    /// Resolves the `Access-Control-Allow-Origin` value for a request
    /// origin: the wildcard passes everyone, an allowlist reflects the
    /// origin it contains, anything else is denied.
    fn allow_origin(&self, request_origin: &str) -> Option<String> {
        match &self.policy.origin {
            CorsOrigin::Any(o) if o == "*" => Some("*".to_string()),
            CorsOrigin::Any(o) => {
                if o == request_origin {
                    Some(request_origin.to_string())
                } else {
                    None
                }
            }
            CorsOrigin::List(list) => {
                if list.iter().any(|o| o == request_origin) {
                    Some(request_origin.to_string())
                } else {
                    None
                }
            }
        }
    }
}

#[async_trait]
impl PipelineStage for CorsStage {
    fn id(&self) -> &'static str {
        "cors"
    }

    async fn handle(&self, req: &mut Request, res: &mut Response) -> Result<StageFlow, AppError> {
        let Some(origin) = req.header("origin").map(|s| s.to_string()) else {
            // Same-origin traffic; nothing to negotiate.
            return Ok(StageFlow::Next);
        };

        let is_preflight = req.method == crate::models::route::Method::Options
            && req.header("access-control-request-method").is_some();

        let Some(allow_origin) = self.allow_origin(&origin) else {
            if is_preflight {
                debug!("cors: denying preflight from origin {}", origin);
                return Err(AppError::OriginRejected { origin });
            }
            // Simple request from an unlisted origin: no CORS headers,
            // the browser enforces the denial.
            return Ok(StageFlow::Next);
        };

        if is_preflight {
            res.set_status(204)?;
            res.insert_header("Access-Control-Allow-Origin", allow_origin)?;
            res.insert_header("Access-Control-Allow-Methods", self.methods_value.clone())?;
            res.insert_header("Access-Control-Allow-Headers", self.headers_value.clone())?;
            if self.policy.credentials {
                res.insert_header("Access-Control-Allow-Credentials", "true")?;
            }
            res.insert_header("Access-Control-Max-Age", self.policy.max_age.to_string())?;
            res.send_bytes("text/plain; charset=utf-8", "")?;
            return Ok(StageFlow::Done);
        }

        res.insert_header("Access-Control-Allow-Origin", allow_origin)?;
        if self.policy.credentials {
            res.insert_header("Access-Control-Allow-Credentials", "true")?;
        }
        Ok(StageFlow::Next)
    }
}
