//! Configuration parsing, defaults and validation.

use strato_rs::config::validation::ConfigValidator;
use strato_rs::models::config::{PortStrategy, SecurityLevel, ServerConfig};

#[test]
fn empty_document_yields_full_defaults() {
    let config: ServerConfig = serde_json::from_str("{}").unwrap();
    assert_eq!(config.server.host, "localhost");
    assert_eq!(config.server.port, 8085);
    assert!(!config.server.trust_proxy);
    assert!(config.server.auto_parse_json);
    assert_eq!(config.server.json_limit, "10mb");
    assert!(config.security.enabled);
    assert!(config.security.csrf);
    assert_eq!(config.security.rate_limit.window_ms, 900_000);
    assert_eq!(config.cache.ttl_secs, 300);
    assert_eq!(config.cache.compression_threshold, 1024);
    assert!(!config.cluster.enabled);
    assert!(!config.multi_server.enabled);
    assert!(config.not_found.enabled);
    assert_eq!(config.request_management.timeout.default_timeout_ms, 30_000);
}

#[test]
fn nested_sections_parse() {
    let raw = r#"{
        "server": {
            "port": 9090,
            "auto_port_switch": { "enabled": true, "max_attempts": 5, "strategy": "increment" }
        },
        "security": {
            "level": "maximum",
            "cors": { "origin": "http://app.example", "credentials": true },
            "rate_limit": { "window_ms": 60000, "max": 50 }
        },
        "cluster": {
            "enabled": true,
            "workers": 4,
            "auto_scaling": { "enabled": true, "min_workers": 2, "max_workers": 6 }
        },
        "request_management": {
            "timeout": { "default_timeout_ms": 10000, "routes": { "/slow": 60000 } },
            "concurrency": { "max_concurrent_requests": 128, "max_per_ip": 16 }
        },
        "multi_server": {
            "enabled": true,
            "servers": [
                { "id": "api", "port": 6532, "route_prefix": "/api" },
                { "id": "pub", "port": 8373, "route_prefix": "/" }
            ]
        }
    }"#;
    let config: ServerConfig = serde_json::from_str(raw).unwrap();
    assert_eq!(config.server.port, 9090);
    assert!(config.server.auto_port_switch.enabled);
    assert_eq!(config.server.auto_port_switch.strategy, PortStrategy::Increment);
    assert_eq!(config.security.level, SecurityLevel::Maximum);
    assert_eq!(config.security.rate_limit_max(), 50);
    assert_eq!(config.cluster.workers.resolve(), 4);
    assert_eq!(
        config.request_management.timeout.routes.get("/slow"),
        Some(&60_000)
    );
    assert_eq!(config.multi_server.servers.len(), 2);
    assert!(config.validate().is_ok());
}

#[test]
fn security_level_presets_drive_rate_limits() {
    for (raw, expected) in [
        (r#"{"security": {"level": "basic"}}"#, 1000),
        (r#"{"security": {"level": "enhanced"}}"#, 300),
        (r#"{"security": {"level": "maximum"}}"#, 100),
    ] {
        let config: ServerConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.security.rate_limit_max(), expected);
    }
}

#[test]
fn config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    let mut config = ServerConfig::default();
    config.server.port = 7777;
    config.cluster.enabled = true;
    std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let parsed: ServerConfig = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed.server.port, 7777);
    assert!(parsed.cluster.enabled);
}

#[test]
fn validation_collects_multiple_errors() {
    let mut config = ServerConfig::default();
    config.security.rate_limit.max = Some(0);
    config.cluster.enabled = true;
    config.cluster.health_check.max_failures = 0;
    config.multi_server.enabled = true; // no instances configured

    let result = ConfigValidator::validate_comprehensive(&config);
    assert!(!result.is_valid);
    assert!(result.errors.len() >= 3, "errors: {:?}", result.errors);
}

#[test]
fn duplicate_multi_server_ids_are_rejected() {
    let raw = r#"{
        "multi_server": {
            "enabled": true,
            "servers": [
                { "id": "a", "port": 6001 },
                { "id": "a", "port": 6002 }
            ]
        }
    }"#;
    let config: ServerConfig = serde_json::from_str(raw).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn worker_count_auto_resolves_to_at_least_one() {
    let config: ServerConfig =
        serde_json::from_str(r#"{"cluster": {"workers": "auto"}}"#).unwrap();
    assert!(config.cluster.workers.resolve() >= 1);
}

#[test]
fn truthy_environment_values() {
    for v in ["1", "true", "yes", "on", "TRUE"] {
        assert!(strato_rs::config::is_truthy(v));
    }
    for v in ["0", "false", "off", "nope", ""] {
        assert!(!strato_rs::config::is_truthy(v));
    }
}
