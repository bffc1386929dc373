//! Segment-trie route matching.
//!
//! The trie stores one tree per HTTP method (plus a shared tree for `ALL`
//! registrations). Each node holds static children in a hash map, at most
//! one parameter child (`:name`, matching exactly one segment) and at most
//! one wildcard child (`*name`, consuming the remaining path; always
//! terminal). Match priority at every level is static, then parameter,
//! then wildcard; a parameter match backtracks when the subtree fails,
//! a wildcard never does.
//!
//! # Performance
//!
//! Matching is O(number of path segments) amortized: static lookups are
//! O(1) per level via `ahash`, and backtracking is bounded by the number
//! of parameter nodes along the path. Registration is rare and takes the
//! write lock; matching is hot and takes the read lock.
//!
//! # Examples
//!
//! ```rust
//! use strato_rs::utils::route_trie::RouteTrie;
//! use strato_rs::models::route::{handler_fn, Method, Route};
//! use strato_rs::models::context::Response;
//!
//! let trie = RouteTrie::new();
//! let handler = handler_fn(|_req| async move {
//!     let mut res = Response::new();
//!     res.send_text("ok")?;
//!     Ok(res)
//! });
//! trie.register(Route::new(Method::Get, "/files/*rest", handler)).unwrap();
//!
//! let hit = trie.matches(Method::Get, "/files/a/b/c.txt").unwrap();
//! assert_eq!(hit.params.get("rest").map(|s| s.as_str()), Some("a/b/c.txt"));
//! ```

use crate::models::route::{Method, Route};
use crate::utils::path::segments;
use ahash::HashMap as AHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Errors raised while registering route patterns.
#[derive(Error, Debug, PartialEq)]
pub enum RouteTrieError {
    /// The pattern contains an empty parameter or wildcard name, or a
    /// wildcard in a non-terminal position.
    #[error("Invalid route pattern: {pattern}")]
    InvalidPattern { pattern: String },

    /// A different parameter name already occupies this position, e.g.
    /// registering `/users/:id` after `/users/:name`.
    #[error("Conflicting parameter name at '{pattern}': existing '{existing}'")]
    ParamConflict { pattern: String, existing: String },
}

/// One parsed pattern segment.
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Param(String),
    Wildcard(String),
}

fn parse_pattern(pattern: &str) -> Result<Vec<Segment>, RouteTrieError> {
    let raw = segments(pattern);
    let mut parsed = Vec::with_capacity(raw.len());
    for (i, seg) in raw.iter().enumerate() {
        if let Some(name) = seg.strip_prefix(':') {
            if name.is_empty() {
                return Err(RouteTrieError::InvalidPattern {
                    pattern: pattern.to_string(),
                });
            }
            parsed.push(Segment::Param(name.to_string()));
        } else if let Some(name) = seg.strip_prefix('*') {
            if name.is_empty() || i != raw.len() - 1 {
                return Err(RouteTrieError::InvalidPattern {
                    pattern: pattern.to_string(),
                });
            }
            parsed.push(Segment::Wildcard(name.to_string()));
        } else {
            parsed.push(Segment::Literal(seg.to_string()));
        }
    }
    Ok(parsed)
}

#[derive(Default)]
struct TrieNode {
    static_children: AHashMap<String, TrieNode>,
    param_child: Option<Box<TrieNode>>,
    param_name: Option<String>,
    wild_child: Option<Box<TrieNode>>,
    wild_name: Option<String>,
    route: Option<Arc<Route>>,
}

impl TrieNode {
    fn insert(&mut self, pattern: &str, segs: &[Segment], route: Arc<Route>) -> Result<(), RouteTrieError> {
        match segs.first() {
            None => {
                // Duplicate registration replaces the previous route.
                self.route = Some(route);
                Ok(())
            }
            Some(Segment::Literal(lit)) => self
                .static_children
                .entry(lit.clone())
                .or_default()
                .insert(pattern, &segs[1..], route),
            Some(Segment::Param(name)) => {
                if let Some(existing) = &self.param_name {
                    if existing != name {
                        return Err(RouteTrieError::ParamConflict {
                            pattern: pattern.to_string(),
                            existing: existing.clone(),
                        });
                    }
                } else {
                    self.param_name = Some(name.clone());
                }
                self.param_child
                    .get_or_insert_with(Default::default)
                    .insert(pattern, &segs[1..], route)
            }
            Some(Segment::Wildcard(name)) => {
                self.wild_name = Some(name.clone());
                let child = self.wild_child.get_or_insert_with(Default::default);
                child.route = Some(route);
                Ok(())
            }
        }
    }

    /// Depth-first match with parameter backtracking. `captured` carries
    /// the parameter values picked up so far; it is unwound on failure.
    fn find<'a>(
        &'a self,
        path_segs: &[&str],
        captured: &mut Vec<(String, String)>,
    ) -> Option<&'a TrieNode> {
        match path_segs.first() {
            None => {
                if self.route.is_some() {
                    return Some(self);
                }
                // An empty remainder may still satisfy a wildcard child.
                if let (Some(wild), Some(name)) = (&self.wild_child, &self.wild_name) {
                    if wild.route.is_some() {
                        captured.push((name.clone(), String::new()));
                        return Some(wild.as_ref());
                    }
                }
                None
            }
            Some(seg) => {
                if let Some(child) = self.static_children.get(*seg) {
                    if let Some(found) = child.find(&path_segs[1..], captured) {
                        return Some(found);
                    }
                }
                if let (Some(param), Some(name)) = (&self.param_child, &self.param_name) {
                    captured.push((name.clone(), seg.to_string()));
                    if let Some(found) = param.find(&path_segs[1..], captured) {
                        return Some(found);
                    }
                    captured.pop();
                }
                if let (Some(wild), Some(name)) = (&self.wild_child, &self.wild_name) {
                    if wild.route.is_some() {
                        captured.push((name.clone(), path_segs.join("/")));
                        return Some(wild.as_ref());
                    }
                }
                None
            }
        }
    }

    fn has_route(&self, path_segs: &[&str]) -> bool {
        let mut captured = Vec::new();
        self.find(path_segs, &mut captured).is_some()
    }
}

/// A successful route match.
#[derive(Clone)]
pub struct RouteMatch {
    pub route: Arc<Route>,
    pub params: AHashMap<String, String>,
}

/// Concurrent segment trie keyed by HTTP method.
///
/// Reads (matching) proceed in parallel; registration takes exclusive
/// access. Lookup counters update atomically outside the lock.
pub struct RouteTrie {
    roots: RwLock<AHashMap<Method, TrieNode>>,
    lookups: AtomicU64,
    failed_lookups: AtomicU64,
}

impl Default for RouteTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTrie {
    pub fn new() -> Self {
        Self {
            roots: RwLock::new(AHashMap::default()),
            lookups: AtomicU64::new(0),
            failed_lookups: AtomicU64::new(0),
        }
    }

    /// Registers a route. A duplicate `(method, pattern)` replaces the
    /// previous registration; registering `"/"` sets the method root.
    pub fn register(&self, route: Route) -> Result<(), RouteTrieError> {
        let segs = parse_pattern(&route.pattern)?;
        let pattern = route.pattern.clone();
        let method = route.method;
        let route = Arc::new(route);
        let mut roots = self.roots.write().unwrap_or_else(|e| e.into_inner());
        roots
            .entry(method)
            .or_default()
            .insert(&pattern, &segs, route)
    }

    /// Matches a request path. The method tree is consulted first, then
    /// the `ALL` tree; `HEAD` falls back to `GET` registrations.
    pub fn matches(&self, method: Method, path: &str) -> Option<RouteMatch> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let path_segs = segments(path);
        let roots = self.roots.read().unwrap_or_else(|e| e.into_inner());

        let mut candidates: Vec<Method> = vec![method];
        if method == Method::Head {
            candidates.push(Method::Get);
        }
        candidates.push(Method::All);

        for m in candidates {
            if let Some(root) = roots.get(&m) {
                let mut captured = Vec::new();
                if let Some(node) = root.find(&path_segs, &mut captured) {
                    if let Some(route) = &node.route {
                        let mut params = AHashMap::default();
                        for (k, v) in captured {
                            params.insert(k, v);
                        }
                        return Some(RouteMatch {
                            route: route.clone(),
                            params,
                        });
                    }
                }
            }
        }

        self.failed_lookups.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Concrete methods with a route registered for `path`. Used for bare
    /// `OPTIONS` responses and CORS method listings.
    pub fn allowed_methods(&self, path: &str) -> Vec<Method> {
        let path_segs = segments(path);
        let roots = self.roots.read().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        let all_matches = roots
            .get(&Method::All)
            .map(|root| root.has_route(&path_segs))
            .unwrap_or(false);
        for m in Method::concrete() {
            if all_matches {
                out.push(*m);
                continue;
            }
            let direct = roots
                .get(m)
                .map(|root| root.has_route(&path_segs))
                .unwrap_or(false);
            let head_via_get = *m == Method::Head
                && roots
                    .get(&Method::Get)
                    .map(|root| root.has_route(&path_segs))
                    .unwrap_or(false);
            if direct || head_via_get {
                out.push(*m);
            }
        }
        out
    }

    /// `(total lookups, failed lookups)` since construction.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.lookups.load(Ordering::Relaxed),
            self.failed_lookups.load(Ordering::Relaxed),
        )
    }
}
