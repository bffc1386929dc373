//! CSRF protection via double-submit cookie.
//!
//! Unsafe methods must present the token twice: in the
//! `__Host-csrf-token` cookie and again in the `x-csrf-token` header (or
//! a `_csrf` body field). The cookie is HttpOnly, so scripts cannot read
//! it; clients obtain the token from the `GET /csrf-token` exchange
//! endpoint, which sets the cookie and returns the same token in the JSON
//! body. Issuing a fresh token through that endpoint rotates any previous
//! one.

use crate::middleware::{PipelineStage, StageFlow};
use crate::models::config::RuntimeEnv;
use crate::models::context::{Request, Response};
use crate::models::error::AppError;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use log::debug;
use rand::RngCore;

pub const CSRF_COOKIE: &str = "__Host-csrf-token";
pub const CSRF_HEADER: &str = "x-csrf-token";
pub const CSRF_BODY_FIELD: &str = "_csrf";

/// 32 random bytes, URL-safe base64.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Builds the `Set-Cookie` value for a token. `Secure` is attached in
/// production; development stays plain so local HTTP keeps working.
pub fn build_cookie(token: &str, env: RuntimeEnv) -> String {
    let mut cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Strict",
        CSRF_COOKIE, token
    );
    if env == RuntimeEnv::Production {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Extracts a cookie value from the `Cookie` request header.
fn cookie_value(req: &Request, name: &str) -> Option<String> {
    let header = req.header("cookie")?;
    for pair in header.split(';') {
        let Some((k, v)) = pair.trim().split_once('=') else {
            continue;
        };
        if k == name {
            return Some(v.to_string());
        }
    }
    None
}

/// Constant-time comparison; token equality must not leak prefix length.
fn tokens_match(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub struct CsrfStage {
    env: RuntimeEnv,
}

impl CsrfStage {
    pub fn new(env: RuntimeEnv) -> Self {
        Self { env }
    }
}

#[async_trait]
impl PipelineStage for CsrfStage {
    fn id(&self) -> &'static str {
        "csrf"
    }

    async fn handle(&self, req: &mut Request, _res: &mut Response) -> Result<StageFlow, AppError> {
        if req.method.is_safe() {
            return Ok(StageFlow::Next);
        }

        let Some(cookie_token) = cookie_value(req, CSRF_COOKIE) else {
            debug!("csrf: cookie missing on {} {}", req.method, req.path);
            return Err(AppError::CsrfRejected);
        };

        let submitted = req
            .header(CSRF_HEADER)
            .map(|s| s.to_string())
            .or_else(|| {
                req.json_body()
                    .and_then(|body| body.get(CSRF_BODY_FIELD))
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
            });

        match submitted {
            Some(token) if tokens_match(&token, &cookie_token) => Ok(StageFlow::Next),
            Some(_) => {
                debug!("csrf: token mismatch on {} {}", req.method, req.path);
                Err(AppError::CsrfRejected)
            }
            None => {
                debug!("csrf: no submitted token on {} {}", req.method, req.path);
                Err(AppError::CsrfRejected)
            }
        }
    }
}

/// Handler body for the token exchange endpoint: issues a fresh token,
/// sets the cookie and returns the token so scripts can echo it back.
pub fn issue_token_response(env: RuntimeEnv) -> Result<Response, AppError> {
    let token = generate_token();
    let mut res = Response::new();
    res.add_cookie(build_cookie(&token, env))?;
    res.send_json(&serde_json::json!({ "token": token }))?;
    Ok(res)
}
