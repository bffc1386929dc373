//! Input sanitization stages: NoSQL operator scrubbing and XSS/SQL
//! injection filtering.
//!
//! Both stages walk the request's query pairs, path parameters and parsed
//! JSON body. The NoSQL stage rewrites hostile *keys*; the threat filter
//! inspects string *values* and either blocks the request (default) or
//! scrubs the offending content when sanitize mode is configured.

use crate::middleware::{PipelineStage, StageFlow};
use crate::models::context::{Request, Response};
use crate::models::error::AppError;
use async_trait::async_trait;
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Patterns indicating script or markup injection attempts.
static XSS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)<\s*script",
        r"(?i)<\s*iframe",
        r"(?i)<\s*object",
        r"(?i)<\s*embed",
        r"(?i)javascript\s*:",
        r"(?i)\bon[a-z]+\s*=",
        r"(?i)expression\s*\(",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

/// SQL keywords evaluated in context: bare words like "select" in prose
/// stay legal, statement shapes do not.
static SQL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\bunion\s+(all\s+)?select\b",
        r"(?i)\bselect\s+.+\s+from\s+\w",
        r"(?i)\binsert\s+into\s+\w",
        r"(?i)\bdelete\s+from\s+\w",
        r"(?i)\bdrop\s+(table|database)\b",
        r"(?i)\bupdate\s+\w+\s+set\s",
        r"(?i)'\s*or\s+'?1'?\s*=\s*'?1",
        r"(?i);\s*--",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

/// Keys beginning with `$` or containing `.` drive NoSQL operator and
/// path-traversal injection; both characters are rewritten.
fn sanitize_key(key: &str) -> Option<String> {
    if key.starts_with('$') || key.contains('.') {
        Some(key.replace(['$', '.'], "_"))
    } else {
        None
    }
}

fn sanitize_json_keys(value: &mut Value, path: &str, rewritten: &mut Vec<String>) {
    if let Value::Object(map) = value {
        let keys: Vec<String> = map.keys().cloned().collect();
        for key in keys {
            let child_path = format!("{}.{}", path, key);
            if let Some(clean) = sanitize_key(&key) {
                if let Some(inner) = map.remove(&key) {
                    map.insert(clean, inner);
                }
                rewritten.push(child_path.clone());
            }
        }
        for (k, v) in map.iter_mut() {
            sanitize_json_keys(v, &format!("{}.{}", path, k), rewritten);
        }
    } else if let Value::Array(items) = value {
        for (i, item) in items.iter_mut().enumerate() {
            sanitize_json_keys(item, &format!("{}[{}]", path, i), rewritten);
        }
    }
}

/// Rewrites `$`-prefixed and dotted keys across query, params and body.
#[derive(Default)]
pub struct NoSqlSanitizeStage;

#[async_trait]
impl PipelineStage for NoSqlSanitizeStage {
    fn id(&self) -> &'static str {
        "nosql-sanitize"
    }

    async fn handle(&self, req: &mut Request, _res: &mut Response) -> Result<StageFlow, AppError> {
        let mut rewritten = Vec::new();

        for (key, _) in req.query.iter_mut() {
            if let Some(clean) = sanitize_key(key) {
                rewritten.push(format!("query.{}", key));
                *key = clean;
            }
        }

        let param_keys: Vec<String> = req.params.keys().cloned().collect();
        for key in param_keys {
            if let Some(clean) = sanitize_key(&key) {
                if let Some(v) = req.params.remove(&key) {
                    req.params.insert(clean, v);
                }
                rewritten.push(format!("params.{}", key));
            }
        }

        req.json_body();
        if let Some(body) = req.json.as_mut() {
            sanitize_json_keys(body, "body", &mut rewritten);
        }

        if !rewritten.is_empty() {
            warn!(
                "nosql-sanitize: rewrote operator keys on {}: {}",
                req.path,
                rewritten.join(", ")
            );
        }
        Ok(StageFlow::Next)
    }
}

/// What the threat scan found in one string.
fn scan(value: &str, xss: bool, sql: bool) -> bool {
    if xss && XSS_PATTERNS.iter().any(|p| p.is_match(value)) {
        return true;
    }
    if sql && SQL_PATTERNS.iter().any(|p| p.is_match(value)) {
        return true;
    }
    false
}

fn scrub(value: &str, xss: bool, sql: bool) -> String {
    let mut out = value.to_string();
    if xss {
        for p in XSS_PATTERNS.iter() {
            out = p.replace_all(&out, "").into_owned();
        }
    }
    if sql {
        for p in SQL_PATTERNS.iter() {
            out = p.replace_all(&out, "").into_owned();
        }
    }
    out
}

fn walk_json(
    value: &mut Value,
    path: &str,
    xss: bool,
    sql: bool,
    sanitize: bool,
    offending: &mut Vec<String>,
) {
    match value {
        Value::String(s) => {
            if scan(s, xss, sql) {
                offending.push(path.to_string());
                if sanitize {
                    *s = scrub(s, xss, sql);
                }
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter_mut().enumerate() {
                walk_json(item, &format!("{}[{}]", path, i), xss, sql, sanitize, offending);
            }
        }
        Value::Object(map) => {
            for (k, v) in map.iter_mut() {
                walk_json(v, &format!("{}.{}", path, k), xss, sql, sanitize, offending);
            }
        }
        _ => {}
    }
}

/// Scans string content in query, params and body for XSS and SQL
/// injection shapes. Detection blocks with 400 and the offending paths
/// unless sanitize mode is configured, in which case matches are scrubbed
/// in place and the request continues.
pub struct ThreatFilterStage {
    xss: bool,
    sql: bool,
    sanitize_instead_of_block: bool,
}

impl ThreatFilterStage {
    pub fn new(xss: bool, sql: bool, sanitize_instead_of_block: bool) -> Self {
        Self {
            xss,
            sql,
            sanitize_instead_of_block,
        }
    }
}

#[async_trait]
impl PipelineStage for ThreatFilterStage {
    fn id(&self) -> &'static str {
        "threat-filter"
    }

    async fn handle(&self, req: &mut Request, _res: &mut Response) -> Result<StageFlow, AppError> {
        let mut offending = Vec::new();
        let sanitize = self.sanitize_instead_of_block;

        for (key, value) in req.query.iter_mut() {
            if scan(value, self.xss, self.sql) {
                offending.push(format!("query.{}", key));
                if sanitize {
                    *value = scrub(value, self.xss, self.sql);
                }
            }
        }

        let param_keys: Vec<String> = req.params.keys().cloned().collect();
        for key in param_keys {
            let hit = req
                .params
                .get(&key)
                .map(|v| scan(v, self.xss, self.sql))
                .unwrap_or(false);
            if hit {
                offending.push(format!("params.{}", key));
                if sanitize {
                    if let Some(v) = req.params.get_mut(&key) {
                        *v = scrub(v, self.xss, self.sql);
                    }
                }
            }
        }

        req.json_body();
        if let Some(body) = req.json.as_mut() {
            walk_json(body, "body", self.xss, self.sql, sanitize, &mut offending);
        }

        if offending.is_empty() {
            return Ok(StageFlow::Next);
        }

        if sanitize {
            warn!(
                "threat-filter: scrubbed {} value(s) on {}: {}",
                offending.len(),
                req.path,
                offending.join(", ")
            );
            Ok(StageFlow::Next)
        } else {
            warn!(
                "threat-filter: blocking {} — threats at {}",
                req.path,
                offending.join(", ")
            );
            Err(AppError::ThreatDetected { paths: offending })
        }
    }
}
