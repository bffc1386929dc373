//! Route definitions: HTTP methods, patterns and handler bindings.

use crate::middleware::PipelineStage;
use crate::models::context::{Request, Response};
use crate::models::error::AppError;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// HTTP methods the router understands.
///
/// `All` is a registration-only pseudo-method that matches every request
/// method; it never appears on an incoming request.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Connect,
    All,
}

impl Method {
    /// Parses a request method. Unknown methods yield `None` so the caller
    /// can answer 501 rather than panic.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            "PATCH" => Some(Method::Patch),
            "HEAD" => Some(Method::Head),
            "OPTIONS" => Some(Method::Options),
            "CONNECT" => Some(Method::Connect),
            "ALL" => Some(Method::All),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Connect => "CONNECT",
            Method::All => "ALL",
        }
    }

    /// Safe methods are cache-eligible by default and exempt from CSRF.
    pub fn is_safe(&self) -> bool {
        matches!(self, Method::Get | Method::Head | Method::Options)
    }

    /// Every concrete method, in a stable order. Used for `ALL` expansion
    /// when answering `OPTIONS` and CORS preflights.
    pub fn concrete() -> &'static [Method] {
        &[
            Method::Get,
            Method::Post,
            Method::Put,
            Method::Delete,
            Method::Patch,
            Method::Head,
            Method::Options,
            Method::Connect,
        ]
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boxed asynchronous request handler.
///
/// Handlers consume the request (they terminate the chain) and produce the
/// response. Use [`handler_fn`] to lift an async closure into this type.
pub type Handler =
    Arc<dyn Fn(Request) -> BoxFuture<'static, Result<Response, AppError>> + Send + Sync>;

/// Lifts an async function into a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, AppError>> + Send + 'static,
{
    Arc::new(move |req| Box::pin(f(req)))
}

/// Per-route cache participation.
///
/// The store's safe-method policy applies under `Default`; routes may opt in
/// (any method, custom TTL) or out entirely.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CacheMode {
    /// Follow the global policy: GET/HEAD cached with the configured TTL.
    Default,
    /// Cache this route regardless of method, with an optional TTL override.
    Enabled { ttl_secs: Option<u64> },
    /// Never cache responses from this route.
    Disabled,
}

/// A registered route: method, path pattern, handler and route-scoped
/// middleware that runs after the security stack and before the handler.
///
/// Pattern segments are literals, `:name` parameters (one segment) or
/// `*name` wildcards (the remainder of the path; always terminal).
#[derive(Clone)]
pub struct Route {
    pub method: Method,
    pub pattern: String,
    pub handler: Handler,
    pub middleware: Vec<Arc<dyn PipelineStage>>,
    pub cache: CacheMode,
    /// Route-specific timeout override in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl Route {
    pub fn new(method: Method, pattern: impl Into<String>, handler: Handler) -> Self {
        Self {
            method,
            pattern: pattern.into(),
            handler,
            middleware: Vec::new(),
            cache: CacheMode::Default,
            timeout_ms: None,
        }
    }

    pub fn with_middleware(mut self, stage: Arc<dyn PipelineStage>) -> Self {
        self.middleware.push(stage);
        self
    }

    pub fn with_cache(mut self, mode: CacheMode) -> Self {
        self.cache = mode;
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("pattern", &self.pattern)
            .field("middleware", &self.middleware.len())
            .field("cache", &self.cache)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_parse_round_trip() {
        for m in Method::concrete() {
            assert_eq!(Method::parse(m.as_str()), Some(*m));
        }
        assert_eq!(Method::parse("BREW"), None);
        assert_eq!(Method::parse("get"), Some(Method::Get));
    }

    #[test]
    fn safe_methods() {
        assert!(Method::Get.is_safe());
        assert!(Method::Head.is_safe());
        assert!(!Method::Post.is_safe());
        assert!(!Method::Delete.is_safe());
    }
}
