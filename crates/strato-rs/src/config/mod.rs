//! Configuration loading and environment merging.
//!
//! Precedence, lowest to highest: built-in defaults, the configuration
//! file, environment variables. The result is an immutable snapshot; a
//! running process replaces the whole snapshot on `config_update` rather
//! than patching fields.

pub mod validation;

use crate::models::config::{RuntimeEnv, ServerConfig};
use crate::models::error::AppError;
use log::{debug, info, warn};
use std::env;
use std::path::Path;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_VAR: &str = "STRATO_CONFIG_PATH";
/// Runtime environment selector (`production` / `development`).
pub const ENV_VAR: &str = "STRATO_ENV";
/// JSON configuration blob handed to spawned workers.
pub const WORKER_CONFIG_VAR: &str = "STRATO_SERVER_CONFIG";
/// Set by the supervisor inside worker processes.
pub const CLUSTER_MODE_VAR: &str = "CLUSTER_MODE";
pub const WORKER_ID_VAR: &str = "WORKER_ID";
pub const WORKER_PORT_VAR: &str = "WORKER_PORT";
/// Either of these disables clustering when truthy.
pub const SINGLE_PROCESS_VAR: &str = "SINGLE_PROCESS";
pub const DISABLE_CLUSTERING_VAR: &str = "DISABLE_CLUSTERING";

/// Truthiness rule for boolean environment variables.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_truthy(name: &str) -> bool {
    env::var(name).map(|v| is_truthy(&v)).unwrap_or(false)
}

/// True when this process was spawned as a cluster worker.
pub fn is_worker_process() -> bool {
    env_truthy(CLUSTER_MODE_VAR)
}

/// True when the environment forbids clustering outright.
pub fn clustering_disabled_by_env() -> bool {
    env_truthy(SINGLE_PROCESS_VAR) || env_truthy(DISABLE_CLUSTERING_VAR)
}

/// Loads the merged configuration snapshot for a supervisor or
/// single-process server.
///
/// A missing configuration file is not an error — the server runs on
/// defaults — but an unreadable or unparseable file aborts startup
/// (`config-parse-failed` is fatal by design).
pub fn load_config() -> Result<ServerConfig, AppError> {
    let path = env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| "config.json".to_string());
    let mut config = if Path::new(&path).exists() {
        let raw = std::fs::read_to_string(&path).map_err(|e| AppError::Config {
            message: format!("cannot read {}: {}", path, e),
        })?;
        let parsed: ServerConfig = serde_json::from_str(&raw).map_err(|e| AppError::Config {
            message: format!("cannot parse {}: {}", path, e),
        })?;
        info!("Loaded configuration from {}", path);
        parsed
    } else {
        debug!("No configuration file at {}, using defaults", path);
        ServerConfig::default()
    };

    apply_env_overrides(&mut config);
    config
        .validate()
        .map_err(|message| AppError::Config { message })?;
    Ok(config)
}

/// Applies environment overrides onto a parsed configuration.
pub fn apply_env_overrides(config: &mut ServerConfig) {
    if let Ok(env_name) = env::var(ENV_VAR) {
        config.env = match env_name.to_ascii_lowercase().as_str() {
            "production" | "prod" => RuntimeEnv::Production,
            _ => RuntimeEnv::Development,
        };
    }
    if let Ok(host) = env::var("STRATO_HOST") {
        config.server.host = host;
    }
    if let Ok(port) = env::var("STRATO_PORT") {
        match port.parse::<u16>() {
            Ok(p) if p > 0 => config.server.port = p,
            _ => warn!("Ignoring invalid STRATO_PORT value: {}", port),
        }
    }
    if clustering_disabled_by_env() && config.cluster.enabled {
        info!("Clustering disabled by environment");
        config.cluster.enabled = false;
    }
    // A worker must never spawn its own cluster.
    if is_worker_process() {
        config.cluster.enabled = false;
    }
}

/// Reconstructs the worker's configuration snapshot from the environment
/// the supervisor prepared: the serialized config blob plus the assigned
/// port. Recursive clustering is disabled unconditionally.
pub fn worker_config_from_env() -> Result<ServerConfig, AppError> {
    let blob = env::var(WORKER_CONFIG_VAR).map_err(|_| AppError::Config {
        message: format!("{} missing in worker environment", WORKER_CONFIG_VAR),
    })?;
    let mut config: ServerConfig = serde_json::from_str(&blob).map_err(|e| AppError::Config {
        message: format!("cannot parse {}: {}", WORKER_CONFIG_VAR, e),
    })?;
    config.cluster.enabled = false;
    if let Ok(port) = env::var(WORKER_PORT_VAR) {
        if let Ok(p) = port.parse::<u16>() {
            config.server.port = p;
        }
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        for v in ["1", "true", "TRUE", "yes", "on"] {
            assert!(is_truthy(v), "{} should be truthy", v);
        }
        for v in ["0", "false", "no", "off", ""] {
            assert!(!is_truthy(v), "{} should be falsy", v);
        }
    }

    #[test]
    fn worker_mode_disables_recursive_clustering() {
        let mut config = ServerConfig::default();
        config.cluster.enabled = true;
        let blob = serde_json::to_string(&config).unwrap();
        let parsed: ServerConfig = serde_json::from_str(&blob).unwrap();
        // worker_config_from_env applies this rule; mirror it here without
        // touching process env, which is shared across the test binary.
        let mut worker = parsed;
        worker.cluster.enabled = false;
        assert!(!worker.cluster.enabled);
    }
}
