//! Comprehensive configuration validation.
//!
//! Startup runs this after the structural `ServerConfig::validate` pass.
//! Errors abort the server; warnings are logged and startup continues.

use crate::models::config::{CorsOrigin, RuntimeEnv, ServerConfig};
use log::warn;

/// Outcome of a comprehensive validation pass.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates the full configuration, collecting every error and
    /// warning rather than stopping at the first.
    pub fn validate_comprehensive(config: &ServerConfig) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if let Err(e) = config.validate() {
            errors.push(e);
        }

        Self::check_server(config, &mut errors, &mut warnings);
        Self::check_security(config, &mut errors, &mut warnings);
        Self::check_cache(config, &mut warnings);
        Self::check_cluster(config, &mut errors, &mut warnings);
        Self::check_multi_server(config, &mut errors);

        for w in &warnings {
            warn!("config: {}", w);
        }

        ValidationResult {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    fn check_server(config: &ServerConfig, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
        if config.server.port < 1024 && config.server.port != 0 {
            warnings.push(format!(
                "server.port {} is privileged; binding may require elevated rights",
                config.server.port
            ));
        }
        let aps = &config.server.auto_port_switch;
        if aps.enabled && aps.max_attempts == 0 {
            errors.push("server.auto_port_switch.max_attempts must be at least 1".to_string());
        }
        if config.request_management.timeout.default_timeout_ms == 0 {
            warnings.push("request timeout of 0 disables the 504 guard entirely".to_string());
        }
        for (pattern, ms) in &config.request_management.timeout.routes {
            if *ms == 0 {
                warnings.push(format!("route timeout for '{}' is 0 (disabled)", pattern));
            }
        }
    }

    fn check_security(config: &ServerConfig, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
        let sec = &config.security;
        if !sec.enabled {
            warnings.push("security stack is disabled".to_string());
            return;
        }
        if sec.rate_limit_max() == 0 {
            errors.push("security.rate_limit max of 0 would reject every request".to_string());
        }
        if let Some(policy) = sec.cors.policy() {
            let wildcard = matches!(&policy.origin, CorsOrigin::Any(o) if o == "*");
            if wildcard && policy.credentials {
                warnings.push(
                    "security.cors: origin '*' with credentials=true — browsers reject \
                     credentialed responses carrying the wildcard origin"
                        .to_string(),
                );
            }
            if policy.methods.is_empty() {
                errors.push("security.cors.methods must not be empty".to_string());
            }
        }
        if !sec.csrf && config.env == RuntimeEnv::Production {
            warnings.push("CSRF protection disabled in production".to_string());
        }
        if sec.slow_down {
            let sd = &sec.slow_down_config;
            if sd.base_delay_ms > sd.max_delay_ms {
                errors.push("security.slow_down: base_delay_ms exceeds max_delay_ms".to_string());
            }
        }
    }

    fn check_cache(config: &ServerConfig, warnings: &mut Vec<String>) {
        if config.cache.strategy != "memory" {
            warnings.push(format!(
                "cache strategy '{}' is not available in-process; degrading to 'memory'",
                config.cache.strategy
            ));
        }
        if config.cache.max_entries == 0 {
            warnings.push("cache.max_entries of 0 disables response caching".to_string());
        }
    }

    fn check_cluster(config: &ServerConfig, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
        let cluster = &config.cluster;
        if !cluster.enabled {
            return;
        }
        let workers = cluster.workers.resolve();
        let scaling = &cluster.auto_scaling;
        if scaling.enabled {
            if workers < scaling.min_workers || workers > scaling.max_workers {
                warnings.push(format!(
                    "initial worker count {} is outside the auto-scaling bounds [{}, {}]",
                    workers, scaling.min_workers, scaling.max_workers
                ));
            }
            if scaling.scale_step == 0 {
                errors.push("cluster.auto_scaling.scale_step must be at least 1".to_string());
            }
        }
        if cluster.process_management.graceful_shutdown_timeout_ms == 0 {
            warnings.push("graceful_shutdown_timeout of 0 force-kills workers".to_string());
        }
        if cluster.health_check.max_failures == 0 {
            errors.push("cluster.health_check.max_failures must be at least 1".to_string());
        }
    }

    fn check_multi_server(config: &ServerConfig, errors: &mut Vec<String>) {
        if !config.multi_server.enabled {
            return;
        }
        if config.multi_server.servers.is_empty() {
            errors.push("multi_server.enabled with no server instances".to_string());
        }
        for instance in &config.multi_server.servers {
            if let Some(patterns) = &instance.allowed_routes {
                for p in patterns {
                    // '*' is only meaningful as a trailing /* suffix.
                    if p.contains('*') && !p.ends_with("/*") {
                        errors.push(format!(
                            "multi_server '{}': pattern '{}' may only use a trailing /*",
                            instance.id, p
                        ));
                    }
                }
            }
        }
    }
}
