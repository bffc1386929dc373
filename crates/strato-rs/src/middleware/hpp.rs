//! HTTP parameter pollution guard.
//!
//! Repeated query or body keys are collapsed to the last occurrence unless
//! the key is whitelisted. Downstream code can then assume single-valued
//! parameters without `?a=safe&a=evil` smuggling.

use crate::middleware::{PipelineStage, StageFlow};
use crate::models::context::{Request, Response};
use crate::models::error::AppError;
use async_trait::async_trait;
use log::debug;
use serde_json::Value;

pub struct ParameterPollutionStage {
    whitelist: Vec<String>,
}

impl ParameterPollutionStage {
    pub fn new(whitelist: Vec<String>) -> Self {
        Self { whitelist }
    }

    fn collapse_query(&self, query: &mut Vec<(String, String)>) -> usize {
        let mut collapsed = 0;
        let mut seen_last: Vec<(String, String)> = Vec::with_capacity(query.len());
        for (k, v) in query.drain(..) {
            if self.whitelist.contains(&k) {
                seen_last.push((k, v));
                continue;
            }
            if let Some(existing) = seen_last
                .iter_mut()
                .find(|(ek, _)| *ek == k)
            {
                existing.1 = v;
                collapsed += 1;
            } else {
                seen_last.push((k, v));
            }
        }
        *query = seen_last;
        collapsed
    }

    /// JSON bodies cannot repeat keys after parsing, but arrays where a
    /// scalar is expected are the body-side pollution vector: collapse
    /// single-element wrapping arrays of scalars to the scalar.
    fn collapse_body(&self, value: &mut Value) -> usize {
        let mut collapsed = 0;
        if let Value::Object(map) = value {
            for (key, v) in map.iter_mut() {
                if self.whitelist.contains(key) {
                    continue;
                }
                if let Value::Array(items) = v {
                    let all_scalars = items
                        .iter()
                        .all(|i| !matches!(i, Value::Array(_) | Value::Object(_)));
                    if all_scalars && !items.is_empty() {
                        *v = items.last().cloned().unwrap_or(Value::Null);
                        collapsed += 1;
                        continue;
                    }
                }
                collapsed += self.collapse_body(v);
            }
        }
        collapsed
    }
}

#[async_trait]
impl PipelineStage for ParameterPollutionStage {
    fn id(&self) -> &'static str {
        "hpp"
    }

    async fn handle(&self, req: &mut Request, _res: &mut Response) -> Result<StageFlow, AppError> {
        let mut collapsed = self.collapse_query(&mut req.query);
        if req.json_body().is_some() {
            if let Some(body) = req.json.as_mut() {
                collapsed += self.collapse_body(body);
            }
        }
        if collapsed > 0 {
            debug!(
                "hpp: collapsed {} duplicated parameter(s) on {}",
                collapsed, req.path
            );
        }
        Ok(StageFlow::Next)
    }
}
