//! Server configuration model.
//!
//! The merged configuration is an immutable snapshot assembled at startup
//! from defaults, the configuration file and environment overrides. It is
//! the single source of truth at runtime; hot updates replace the whole
//! snapshot atomically rather than mutating it in place.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Parses human-readable sizes like `10mb`, `512kb` or `1048576`.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let lower = s.trim().to_ascii_lowercase();
    let (digits, multiplier) = if let Some(rest) = lower.strip_suffix("gb") {
        (rest, 1024 * 1024 * 1024)
    } else if let Some(rest) = lower.strip_suffix("mb") {
        (rest, 1024 * 1024)
    } else if let Some(rest) = lower.strip_suffix("kb") {
        (rest, 1024)
    } else if let Some(rest) = lower.strip_suffix('b') {
        (rest, 1)
    } else {
        (lower.as_str(), 1)
    };
    digits
        .trim()
        .parse::<usize>()
        .map(|n| n * multiplier)
        .map_err(|_| format!("invalid size literal: {}", s))
}

/// Strategy used when the desired port is occupied.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PortStrategy {
    /// Try `desired+1`, `desired+2`, ... up to the attempt budget.
    Increment,
    /// Pick random ports from the ephemeral range.
    Random,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AutoPortSwitch {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_port_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_port_strategy")]
    pub strategy: PortStrategy,
}

fn default_port_attempts() -> u32 {
    10
}

fn default_port_strategy() -> PortStrategy {
    PortStrategy::Random
}

impl Default for AutoPortSwitch {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: default_port_attempts(),
            strategy: default_port_strategy(),
        }
    }
}

/// Core listener settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Honor `X-Forwarded-For` when resolving the client address.
    #[serde(default)]
    pub trust_proxy: bool,
    /// Parse JSON bodies eagerly for requests with a JSON content type.
    #[serde(default = "default_true")]
    pub auto_parse_json: bool,
    #[serde(default)]
    pub auto_port_switch: AutoPortSwitch,
    /// Maximum JSON body size, e.g. `"10mb"`.
    #[serde(default = "default_body_limit")]
    pub json_limit: String,
    /// Maximum urlencoded body size, e.g. `"10mb"`.
    #[serde(default = "default_body_limit")]
    pub url_encoded_limit: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8085
}

fn default_true() -> bool {
    true
}

fn default_body_limit() -> String {
    "10mb".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            trust_proxy: false,
            auto_parse_json: true,
            auto_port_switch: AutoPortSwitch::default(),
            json_limit: default_body_limit(),
            url_encoded_limit: default_body_limit(),
        }
    }
}

impl ServerSection {
    pub fn json_limit_bytes(&self) -> usize {
        parse_size(&self.json_limit).unwrap_or(10 * 1024 * 1024)
    }

    pub fn url_encoded_limit_bytes(&self) -> usize {
        parse_size(&self.url_encoded_limit).unwrap_or(10 * 1024 * 1024)
    }
}

/// Overall strictness preset. The preset picks the default rate-limit
/// ceiling; individual toggles can still be flipped per stage.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Basic,
    Enhanced,
    Maximum,
}

impl SecurityLevel {
    /// Default requests-per-window ceiling for the preset.
    pub fn default_rate_limit_max(&self) -> u64 {
        match self {
            SecurityLevel::Basic => 1000,
            SecurityLevel::Enhanced => 300,
            SecurityLevel::Maximum => 100,
        }
    }
}

/// CORS settings: either a bare enable flag or a full policy.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum CorsSetting {
    Enabled(bool),
    Policy(CorsPolicy),
}

impl Default for CorsSetting {
    fn default() -> Self {
        CorsSetting::Enabled(true)
    }
}

impl CorsSetting {
    pub fn policy(&self) -> Option<CorsPolicy> {
        match self {
            CorsSetting::Enabled(false) => None,
            CorsSetting::Enabled(true) => Some(CorsPolicy::default()),
            CorsSetting::Policy(p) => Some(p.clone()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CorsPolicy {
    /// `"*"` or a specific origin; a list forms an allowlist.
    #[serde(default = "default_cors_origin")]
    pub origin: CorsOrigin,
    #[serde(default = "default_cors_methods")]
    pub methods: Vec<String>,
    #[serde(default = "default_cors_headers")]
    pub allowed_headers: Vec<String>,
    #[serde(default)]
    pub credentials: bool,
    #[serde(default = "default_cors_max_age")]
    pub max_age: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum CorsOrigin {
    Any(String),
    List(Vec<String>),
}

fn default_cors_origin() -> CorsOrigin {
    CorsOrigin::Any("*".to_string())
}

fn default_cors_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "DELETE", "OPTIONS", "PATCH", "HEAD"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_cors_headers() -> Vec<String> {
    ["Content-Type", "Authorization"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_cors_max_age() -> u64 {
    86_400
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self {
            origin: default_cors_origin(),
            methods: default_cors_methods(),
            allowed_headers: default_cors_headers(),
            credentials: false,
            max_age: default_cors_max_age(),
        }
    }
}

/// Rate-limit window settings. `max` falls back to the security level's
/// preset when unset. Buckets live in process-local memory; when clustering
/// is enabled, per-IP counts drift across workers by design.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RateLimitSection {
    #[serde(default = "default_rate_window_ms")]
    pub window_ms: u64,
    #[serde(default)]
    pub max: Option<u64>,
    /// Whole-process ceiling across all clients; off when unset.
    #[serde(default)]
    pub global_max: Option<u64>,
    /// Per-route ceiling across all clients; off when unset.
    #[serde(default)]
    pub route_max: Option<u64>,
    /// Paths that bypass rate limiting entirely.
    #[serde(default = "default_exempt_paths")]
    pub exempt_paths: Vec<String>,
    /// Emit `X-RateLimit-*` headers on limited routes.
    #[serde(default = "default_true")]
    pub headers: bool,
}

fn default_rate_window_ms() -> u64 {
    900_000
}

fn default_exempt_paths() -> Vec<String> {
    vec!["/health".to_string(), "/ping".to_string()]
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            window_ms: default_rate_window_ms(),
            max: None,
            global_max: None,
            route_max: None,
            exempt_paths: default_exempt_paths(),
            headers: true,
        }
    }
}

/// Slow-down settings: progressive delay past a request threshold.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SlowDownSection {
    #[serde(default = "default_delay_after")]
    pub delay_after: u64,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_slow_window_ms")]
    pub window_ms: u64,
}

fn default_delay_after() -> u64 {
    100
}

fn default_base_delay_ms() -> u64 {
    50
}

fn default_max_delay_ms() -> u64 {
    2_000
}

fn default_slow_window_ms() -> u64 {
    60_000
}

impl Default for SlowDownSection {
    fn default() -> Self {
        Self {
            delay_after: default_delay_after(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            window_ms: default_slow_window_ms(),
        }
    }
}

/// Security middleware stack configuration. Stage order is fixed by the
/// pipeline; these switches decide which stages participate.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SecuritySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_security_level")]
    pub level: SecurityLevel,
    #[serde(default = "default_true")]
    pub csrf: bool,
    /// Security response headers (nosniff, frame deny, HSTS, ...).
    #[serde(default = "default_true")]
    pub helmet: bool,
    #[serde(default = "default_true")]
    pub xss: bool,
    #[serde(default = "default_true")]
    pub sql_injection: bool,
    /// Tightens the slow-down profile for repeated unsafe requests.
    #[serde(default = "default_true")]
    pub brute_force: bool,
    #[serde(default)]
    pub cors: CorsSetting,
    #[serde(default = "default_true")]
    pub compression: bool,
    /// Gzip/deflate only bodies at least this large.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
    /// HTTP parameter pollution guard.
    #[serde(default = "default_true")]
    pub hpp: bool,
    /// Query/body keys allowed to repeat.
    #[serde(default)]
    pub hpp_whitelist: Vec<String>,
    /// NoSQL operator sanitization (`$`-keys and dotted keys).
    #[serde(default = "default_true")]
    pub mongo_sanitize: bool,
    /// Access logging of method, path, status, bytes and duration.
    #[serde(default = "default_true")]
    pub morgan: bool,
    #[serde(default = "default_true")]
    pub slow_down: bool,
    #[serde(default)]
    pub slow_down_config: SlowDownSection,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    /// Content-Security-Policy value, emitted when set.
    #[serde(default)]
    pub csp: Option<String>,
    /// When set, XSS/SQLi findings are scrubbed instead of rejected.
    #[serde(default)]
    pub sanitize_instead_of_block: bool,
}

fn default_security_level() -> SecurityLevel {
    SecurityLevel::Basic
}

fn default_compression_threshold() -> usize {
    1024
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_security_level(),
            csrf: true,
            helmet: true,
            xss: true,
            sql_injection: true,
            brute_force: true,
            cors: CorsSetting::default(),
            compression: true,
            compression_threshold: default_compression_threshold(),
            hpp: true,
            hpp_whitelist: Vec::new(),
            mongo_sanitize: true,
            morgan: true,
            slow_down: true,
            slow_down_config: SlowDownSection::default(),
            rate_limit: RateLimitSection::default(),
            csp: None,
            sanitize_instead_of_block: false,
        }
    }
}

impl SecuritySection {
    pub fn rate_limit_max(&self) -> u64 {
        self.rate_limit
            .max
            .unwrap_or_else(|| self.level.default_rate_limit_max())
    }
}

/// Response cache settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CacheSection {
    /// `memory` is the only in-process strategy; anything else degrades to
    /// memory with a warning.
    #[serde(default = "default_cache_strategy")]
    pub strategy: String,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_max_memory")]
    pub max_memory: String,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
    /// Request headers folded into the cache fingerprint.
    #[serde(default)]
    pub vary_headers: Vec<String>,
}

fn default_cache_strategy() -> String {
    "memory".to_string()
}

fn default_cache_max_entries() -> usize {
    1000
}

fn default_cache_max_memory() -> String {
    "100mb".to_string()
}

fn default_cache_ttl() -> u64 {
    300
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            strategy: default_cache_strategy(),
            max_entries: default_cache_max_entries(),
            max_memory: default_cache_max_memory(),
            ttl_secs: default_cache_ttl(),
            compression_threshold: default_compression_threshold(),
            vary_headers: Vec::new(),
        }
    }
}

impl CacheSection {
    pub fn max_memory_bytes(&self) -> usize {
        parse_size(&self.max_memory).unwrap_or(100 * 1024 * 1024)
    }
}

/// Thresholds that vote for adding a worker.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScaleUpThresholds {
    #[serde(default = "default_up_cpu")]
    pub cpu: f64,
    #[serde(default = "default_up_memory")]
    pub memory: f64,
    #[serde(default = "default_up_response_time")]
    pub response_time_ms: f64,
    #[serde(default = "default_up_queue")]
    pub queue_length: f64,
}

fn default_up_cpu() -> f64 {
    80.0
}

fn default_up_memory() -> f64 {
    85.0
}

fn default_up_response_time() -> f64 {
    1_000.0
}

fn default_up_queue() -> f64 {
    50.0
}

impl Default for ScaleUpThresholds {
    fn default() -> Self {
        Self {
            cpu: default_up_cpu(),
            memory: default_up_memory(),
            response_time_ms: default_up_response_time(),
            queue_length: default_up_queue(),
        }
    }
}

/// Thresholds that vote for retiring a worker.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScaleDownThresholds {
    #[serde(default = "default_down_cpu")]
    pub cpu: f64,
    #[serde(default = "default_down_memory")]
    pub memory: f64,
    #[serde(default = "default_down_idle_secs")]
    pub idle_secs: f64,
}

fn default_down_cpu() -> f64 {
    20.0
}

fn default_down_memory() -> f64 {
    30.0
}

fn default_down_idle_secs() -> f64 {
    300.0
}

impl Default for ScaleDownThresholds {
    fn default() -> Self {
        Self {
            cpu: default_down_cpu(),
            memory: default_down_memory(),
            idle_secs: default_down_idle_secs(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AutoScalingSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default)]
    pub scale_up_threshold: ScaleUpThresholds,
    #[serde(default)]
    pub scale_down_threshold: ScaleDownThresholds,
    /// Minimum pause between scaling actions, in milliseconds.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_period_ms: u64,
    #[serde(default = "default_scale_step")]
    pub scale_step: usize,
    /// Metric evaluation interval in milliseconds.
    #[serde(default = "default_scale_interval_ms")]
    pub check_interval_ms: u64,
}

fn default_min_workers() -> usize {
    1
}

fn default_max_workers() -> usize {
    8
}

fn default_cooldown_ms() -> u64 {
    300_000
}

fn default_scale_step() -> usize {
    1
}

fn default_scale_interval_ms() -> u64 {
    30_000
}

impl Default for AutoScalingSection {
    fn default() -> Self {
        Self {
            enabled: false,
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            scale_up_threshold: ScaleUpThresholds::default(),
            scale_down_threshold: ScaleDownThresholds::default(),
            cooldown_period_ms: default_cooldown_ms(),
            scale_step: default_scale_step(),
            check_interval_ms: default_scale_interval_ms(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProcessManagementSection {
    #[serde(default = "default_true")]
    pub respawn: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_graceful_shutdown_ms")]
    pub graceful_shutdown_timeout_ms: u64,
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_delay_ms() -> u64 {
    1_000
}

fn default_graceful_shutdown_ms() -> u64 {
    8_000
}

impl Default for ProcessManagementSection {
    fn default() -> Self {
        Self {
            respawn: true,
            max_restarts: default_max_restarts(),
            restart_delay_ms: default_restart_delay_ms(),
            graceful_shutdown_timeout_ms: default_graceful_shutdown_ms(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HealthCheckSection {
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive probe failures before a worker is marked degraded.
    #[serde(default = "default_health_max_failures")]
    pub max_failures: u32,
}

fn default_health_interval_ms() -> u64 {
    10_000
}

fn default_health_timeout_ms() -> u64 {
    2_000
}

fn default_health_max_failures() -> u32 {
    2
}

impl Default for HealthCheckSection {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            timeout_ms: default_health_timeout_ms(),
            max_failures: default_health_max_failures(),
        }
    }
}

/// Number of workers: `"auto"` or a fixed count.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum WorkerCount {
    Auto(String),
    Fixed(usize),
}

impl Default for WorkerCount {
    fn default() -> Self {
        WorkerCount::Auto("auto".to_string())
    }
}

impl WorkerCount {
    pub fn resolve(&self) -> usize {
        match self {
            WorkerCount::Fixed(n) => (*n).max(1),
            WorkerCount::Auto(_) => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClusterSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub workers: WorkerCount,
    #[serde(default)]
    pub auto_scaling: AutoScalingSection,
    #[serde(default)]
    pub process_management: ProcessManagementSection,
    #[serde(default)]
    pub health_check: HealthCheckSection,
    /// Worker executable override; defaults to the current executable.
    #[serde(default)]
    pub worker_exec: Option<String>,
    /// Per-worker readiness deadline in milliseconds.
    #[serde(default = "default_worker_start_timeout_ms")]
    pub worker_start_timeout_ms: u64,
    /// Whole-cluster startup deadline in milliseconds.
    #[serde(default = "default_cluster_start_timeout_ms")]
    pub cluster_start_timeout_ms: u64,
}

fn default_worker_start_timeout_ms() -> u64 {
    8_000
}

fn default_cluster_start_timeout_ms() -> u64 {
    15_000
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            enabled: false,
            workers: WorkerCount::default(),
            auto_scaling: AutoScalingSection::default(),
            process_management: ProcessManagementSection::default(),
            health_check: HealthCheckSection::default(),
            worker_exec: None,
            worker_start_timeout_ms: default_worker_start_timeout_ms(),
            cluster_start_timeout_ms: default_cluster_start_timeout_ms(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TimeoutSection {
    #[serde(default = "default_request_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Route-pattern → timeout override in milliseconds.
    #[serde(default)]
    pub routes: HashMap<String, u64>,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_request_timeout_ms(),
            routes: HashMap::new(),
        }
    }
}

/// Admission control caps. Zero means unlimited.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ConcurrencySection {
    #[serde(default)]
    pub max_concurrent_requests: usize,
    #[serde(default)]
    pub max_per_ip: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RequestManagementSection {
    #[serde(default)]
    pub timeout: TimeoutSection,
    #[serde(default)]
    pub concurrency: ConcurrencySection,
}

/// A single server instance under the multi-server controller.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerInstanceConfig {
    pub id: String,
    pub port: u16,
    #[serde(default)]
    pub host: Option<String>,
    /// Routes starting with this prefix are assigned to the instance.
    #[serde(default)]
    pub route_prefix: Option<String>,
    /// Exact paths or trailing-`/*` patterns assigned to the instance.
    #[serde(default)]
    pub allowed_routes: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MultiServerSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub servers: Vec<ServerInstanceConfig>,
}

/// Custom 404 page settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NotFoundSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_not_found_title")]
    pub title: String,
    #[serde(default = "default_not_found_message")]
    pub message: String,
    #[serde(default = "default_not_found_theme")]
    pub theme: String,
    #[serde(default)]
    pub redirect_to: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
}

fn default_not_found_title() -> String {
    "Page Not Found".to_string()
}

fn default_not_found_message() -> String {
    "The page you are looking for does not exist.".to_string()
}

fn default_not_found_theme() -> String {
    "dark".to_string()
}

impl Default for NotFoundSection {
    fn default() -> Self {
        Self {
            enabled: true,
            title: default_not_found_title(),
            message: default_not_found_message(),
            theme: default_not_found_theme(),
            redirect_to: None,
            contact: None,
        }
    }
}

/// Runtime environment, selected by `STRATO_ENV`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnv {
    Development,
    Production,
}

impl Default for RuntimeEnv {
    fn default() -> Self {
        RuntimeEnv::Development
    }
}

/// The complete merged configuration snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub env: RuntimeEnv,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub cluster: ClusterSection,
    #[serde(default)]
    pub request_management: RequestManagementSection,
    #[serde(default)]
    pub multi_server: MultiServerSection,
    #[serde(default)]
    pub not_found: NotFoundSection,
}

impl ServerConfig {
    /// Quick structural validation. The comprehensive pass with warnings
    /// lives in `config::validation::ConfigValidator`.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be between 1 and 65535".to_string());
        }
        parse_size(&self.server.json_limit)?;
        parse_size(&self.server.url_encoded_limit)?;
        parse_size(&self.cache.max_memory)?;
        if self.cluster.auto_scaling.min_workers > self.cluster.auto_scaling.max_workers {
            return Err("cluster.auto_scaling: min_workers exceeds max_workers".to_string());
        }
        if self.security.rate_limit.window_ms == 0 {
            return Err("security.rate_limit.window_ms must be positive".to_string());
        }
        if self.multi_server.enabled {
            let mut seen = std::collections::HashSet::new();
            for instance in &self.multi_server.servers {
                if instance.port == 0 {
                    return Err(format!("multi_server '{}': port must be nonzero", instance.id));
                }
                if !seen.insert(&instance.id) {
                    return Err(format!("multi_server: duplicate server id '{}'", instance.id));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.server.host, "localhost");
        assert_eq!(cfg.server.port, 8085);
        assert!(cfg.server.auto_parse_json);
        assert!(!cfg.server.auto_port_switch.enabled);
        assert_eq!(cfg.server.auto_port_switch.max_attempts, 10);
        assert_eq!(cfg.security.rate_limit.window_ms, 900_000);
        assert_eq!(cfg.cache.ttl_secs, 300);
        assert_eq!(cfg.cache.compression_threshold, 1024);
        assert_eq!(cfg.cluster.auto_scaling.cooldown_period_ms, 300_000);
        assert_eq!(cfg.request_management.timeout.default_timeout_ms, 30_000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn size_literals() {
        assert_eq!(parse_size("10mb").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_size("512KB").unwrap(), 512 * 1024);
        assert_eq!(parse_size("1048576").unwrap(), 1_048_576);
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn level_presets_pick_rate_limit_max() {
        let mut sec = SecuritySection::default();
        assert_eq!(sec.rate_limit_max(), 1000);
        sec.level = SecurityLevel::Maximum;
        assert_eq!(sec.rate_limit_max(), 100);
        sec.rate_limit.max = Some(7);
        assert_eq!(sec.rate_limit_max(), 7);
    }

    #[test]
    fn invalid_bounds_are_rejected() {
        let mut cfg = ServerConfig::default();
        cfg.cluster.auto_scaling.min_workers = 9;
        cfg.cluster.auto_scaling.max_workers = 2;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn cors_setting_forms() {
        let parsed: SecuritySection = serde_json::from_str(r#"{"cors": false}"#).unwrap();
        assert!(parsed.cors.policy().is_none());
        let parsed: SecuritySection =
            serde_json::from_str(r#"{"cors": {"origin": "*", "credentials": true}}"#).unwrap();
        let policy = parsed.cors.policy().unwrap();
        assert!(policy.credentials);
    }
}
