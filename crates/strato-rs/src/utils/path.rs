//! Path and fingerprint helpers used by the router and the cache.

use crate::models::context::Request;

/// Splits a path into its segments, ignoring leading and trailing slashes.
/// The empty path and `"/"` both yield no segments (the root).
pub fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Normalizes a path for comparison: single leading slash, no trailing
/// slash (except for the root itself).
pub fn normalize(path: &str) -> String {
    let segs = segments(path);
    if segs.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segs.join("/"))
    }
}

/// Canonical sorted rendering of a query for cache fingerprints:
/// pairs sorted by key then value, joined `k=v&k=v`.
pub fn sorted_query(query: &[(String, String)]) -> String {
    let mut pairs: Vec<&(String, String)> = query.iter().collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Deterministic cache key: `method|path|sortedQuery|varyValues`.
///
/// `HEAD` shares the `GET` fingerprint so both methods hit one entry; the
/// body is suppressed on the way out for `HEAD`.
pub fn fingerprint(req: &Request, vary_headers: &[String]) -> String {
    let method = match req.method {
        crate::models::route::Method::Head => "GET",
        m => m.as_str(),
    };
    let vary = vary_headers
        .iter()
        .map(|h| req.header(h).unwrap_or(""))
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "{}|{}|{}|{}",
        method,
        normalize(&req.path),
        sorted_query(&req.query),
        vary
    )
}
