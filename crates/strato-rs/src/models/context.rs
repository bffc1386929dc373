//! Request and response state threaded through the middleware pipeline.
//!
//! The framework keeps its own request/response representation rather than
//! exposing the HTTP engine's types: middleware stages mutate these, the
//! dispatcher converts to and from the engine at the edges. This is what
//! makes the pipeline testable without a live socket.

use crate::models::error::AppError;
use crate::models::route::Method;
use actix_web::web::Bytes;
use ahash::HashMap as AHashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Cooperative cancellation signal carried by every request.
///
/// Fired on lifecycle timeout, client disconnect, server shutdown or a
/// route-specific timeout. Stages and handlers observing the flag should
/// stop work; writes after cancellation are discarded by the dispatcher.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Negotiated response encoding, decided by the compression stage and
/// applied by the dispatcher once the final body is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Gzip,
    Deflate,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
        }
    }
}

/// An in-flight HTTP request.
///
/// `method`, `path`, `query`, `headers`, `body` and `remote_addr` are fixed
/// after parsing. `params` is written by the router, `attributes` by
/// middleware; `json` starts as the lazily parsed body and may be rewritten
/// by sanitization stages.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub raw_query: String,
    /// Decoded query pairs in arrival order. Duplicate keys survive until
    /// the parameter-pollution stage collapses them.
    pub query: Vec<(String, String)>,
    /// Header names lowercased; repeated headers keep every value.
    pub headers: AHashMap<String, Vec<String>>,
    pub body: Bytes,
    /// Parsed JSON body, present when the request carried a JSON
    /// content-type and auto-parsing is enabled. Mutable so sanitization
    /// can rewrite it in place.
    pub json: Option<Value>,
    /// Path parameters captured by the router (`:name` and `*name`).
    pub params: AHashMap<String, String>,
    /// Free-form attribute bag for middleware. Unknown keys are allowed.
    pub attributes: AHashMap<String, Value>,
    pub remote_addr: String,
    pub started_at: Instant,
    pub cancel: CancelFlag,
}

impl Request {
    /// Builds a request from already-parsed parts. The dispatcher uses this
    /// at the engine boundary; tests use it directly.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            raw_query: String::new(),
            query: Vec::new(),
            headers: AHashMap::default(),
            body: Bytes::new(),
            json: None,
            params: AHashMap::default(),
            attributes: AHashMap::default(),
            remote_addr: "unknown".to_string(),
            started_at: Instant::now(),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_query(mut self, raw: &str) -> Self {
        self.raw_query = raw.to_string();
        self.query = parse_query(raw);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = addr.into();
        self
    }

    /// First value of a header, if present.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|v| v.first())
            .map(|s| s.as_str())
    }

    /// All values of a header.
    pub fn header_all(&self, name: &str) -> &[String] {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Parses the body as JSON on first use and caches the result.
    pub fn json_body(&mut self) -> Option<&mut Value> {
        if self.json.is_none() && !self.body.is_empty() {
            let is_json = self
                .header("content-type")
                .map(|ct| ct.contains("application/json"))
                .unwrap_or(false);
            if is_json {
                self.json = serde_json::from_slice(&self.body).ok();
            }
        }
        self.json.as_mut()
    }

    /// First query value for a key.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(|s| s.as_str())
    }

    pub fn set_attribute(&mut self, key: &str, value: Value) {
        self.attributes.insert(key.to_string(), value);
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

/// Minimal percent-decoding for query strings. Invalid escapes pass
/// through untouched rather than failing the request.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3);
                match hex.and_then(|h| std::str::from_utf8(h).ok()).and_then(|h| {
                    u8::from_str_radix(h, 16).ok()
                }) {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Splits `a=1&b=2` into decoded pairs, preserving order and duplicates.
pub fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((k, v)) => (percent_decode(k), percent_decode(v)),
            None => (percent_decode(part), String::new()),
        })
        .collect()
}

/// The response under construction for a request.
///
/// Exactly one body write is permitted; `written` is monotonic. Setting a
/// header after the body has been written is a state violation. These
/// invariants hold on every code path, including error handling.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
    written: bool,
    /// Cookies queued as full `Set-Cookie` values.
    cookies: Vec<String>,
    pub(crate) encoding: Option<Encoding>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: None,
            written: false,
            cookies: Vec::new(),
            encoding: None,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) -> Result<(), AppError> {
        if self.written {
            return Err(AppError::ResponseState {
                message: "status set after body write".to_string(),
            });
        }
        self.status = status;
        Ok(())
    }

    pub fn written(&self) -> bool {
        self.written
    }

    /// Replaces any existing header of the same name, then appends.
    pub fn insert_header(&mut self, name: &str, value: impl Into<String>) -> Result<(), AppError> {
        if self.written {
            return Err(AppError::ResponseState {
                message: format!("header '{}' set after body write", name),
            });
        }
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
        Ok(())
    }

    /// Appends without replacing; used for repeatable headers.
    pub fn append_header(&mut self, name: &str, value: impl Into<String>) -> Result<(), AppError> {
        if self.written {
            return Err(AppError::ResponseState {
                message: format!("header '{}' appended after body write", name),
            });
        }
        self.headers.push((name.to_string(), value.into()));
        Ok(())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn add_cookie(&mut self, set_cookie: impl Into<String>) -> Result<(), AppError> {
        if self.written {
            return Err(AppError::ResponseState {
                message: "cookie set after body write".to_string(),
            });
        }
        self.cookies.push(set_cookie.into());
        Ok(())
    }

    pub fn cookies(&self) -> &[String] {
        &self.cookies
    }

    fn write_body(&mut self, body: Bytes) -> Result<(), AppError> {
        if self.written {
            return Err(AppError::ResponseState {
                message: "body written twice".to_string(),
            });
        }
        self.body = Some(body);
        self.written = true;
        Ok(())
    }

    pub fn send_bytes(
        &mut self,
        content_type: &str,
        body: impl Into<Bytes>,
    ) -> Result<(), AppError> {
        self.insert_header("Content-Type", content_type)?;
        self.write_body(body.into())
    }

    pub fn send_text(&mut self, body: impl Into<String>) -> Result<(), AppError> {
        self.send_bytes("text/plain; charset=utf-8", body.into())
    }

    pub fn send_html(&mut self, body: impl Into<String>) -> Result<(), AppError> {
        self.send_bytes("text/html; charset=utf-8", body.into())
    }

    /// Serializes `value` with the safe fallback serializer, so response
    /// emission cannot fail and surface as a 500.
    pub fn send_json(&mut self, value: &Value) -> Result<(), AppError> {
        let body = crate::utils::serializer::to_safe_json(value);
        self.send_bytes("application/json", body)
    }

    /// Writes the body without touching headers; for replaying prepared
    /// responses whose headers are installed separately.
    pub fn send_body(&mut self, body: impl Into<Bytes>) -> Result<(), AppError> {
        self.write_body(body.into())
    }

    /// Body bytes as written so far.
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn body_len(&self) -> usize {
        self.body.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    /// Strips the body while keeping status and headers; the HEAD path.
    pub fn suppress_body(&mut self) {
        self.body = Some(Bytes::new());
    }

    /// Replaces the body bytes in place (compression uses this after the
    /// chain has completed). Does not count as a second write.
    pub(crate) fn replace_body(&mut self, body: Bytes) {
        self.body = Some(body);
    }

    /// Sets a header as part of response finalization, after the chain has
    /// written the body. Not available to stages or handlers; the
    /// single-write discipline only governs the pipeline.
    pub(crate) fn force_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    /// Adopts a handler-produced response into this one: earlier stage
    /// headers stay, the handler's status, headers, cookies and body land
    /// on top. Enforces the single-write invariant.
    pub fn adopt(&mut self, other: Response) -> Result<(), AppError> {
        if self.written {
            return Err(AppError::ResponseState {
                message: "response adopted after body write".to_string(),
            });
        }
        self.status = other.status;
        for (name, value) in other.headers {
            self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
            self.headers.push((name, value));
        }
        self.cookies.extend(other.cookies);
        if let Some(body) = other.body {
            self.write_body(body)?;
        }
        if other.encoding.is_some() {
            self.encoding = other.encoding;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_write_is_rejected() {
        let mut res = Response::new();
        res.send_text("one").unwrap();
        let err = res.send_text("two").unwrap_err();
        assert!(matches!(err, AppError::ResponseState { .. }));
        assert!(res.written());
    }

    #[test]
    fn header_after_body_is_rejected() {
        let mut res = Response::new();
        res.insert_header("X-Early", "ok").unwrap();
        res.send_text("body").unwrap();
        assert!(res.insert_header("X-Late", "no").is_err());
        assert_eq!(res.header("x-early"), Some("ok"));
    }

    #[test]
    fn query_parsing_keeps_duplicates_in_order() {
        let q = parse_query("a=1&b=2&a=3&flag");
        assert_eq!(
            q,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
                ("a".to_string(), "3".to_string()),
                ("flag".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn query_percent_decoding() {
        let q = parse_query("name=J%C3%BCrgen&q=a%20b+c");
        assert_eq!(q[0].1, "Jürgen");
        assert_eq!(q[1].1, "a b c");
    }

    #[test]
    fn lazy_json_body() {
        let mut req = Request::new(Method::Post, "/x")
            .with_header("content-type", "application/json")
            .with_body(&br#"{"a":1}"#[..]);
        assert_eq!(req.json_body().unwrap()["a"], 1);
        // Non-JSON content types never parse.
        let mut plain = Request::new(Method::Post, "/x").with_body(&br#"{"a":1}"#[..]);
        assert!(plain.json_body().is_none());
    }

    #[test]
    fn cancellation_is_sticky() {
        let req = Request::new(Method::Get, "/");
        assert!(!req.cancel.is_cancelled());
        req.cancel.cancel();
        assert!(req.cancel.is_cancelled());
    }
}
