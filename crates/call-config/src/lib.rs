//! Configuration loading and validation for the CALL daemon.
//!
//! [`CallConfig`] is the top-level runtime settings record. It loads in
//! three layers: compiled-in [`CallConfig::default`], an optional TOML
//! file, then `CALL_*` environment variable overrides applied last.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },
    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },
    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Top-level runtime configuration for the CALL daemon.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct CallConfig {
    /// Address the HTTP surface binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Minimum interval between successive polls of the same requestId.
    #[serde(default = "default_rate_limit_interval_ms")]
    pub rate_limit_interval_ms: u64,
    /// Maximum bytes per chunk when a completed async result is chunked.
    #[serde(default = "default_chunk_size_bytes")]
    pub chunk_size_bytes: usize,
    /// TTL applied to async operation instances that don't specify one.
    #[serde(default = "default_ttl_seconds")]
    pub default_ttl_seconds: u64,
    /// Enable verbose request/response debug logging.
    #[serde(default)]
    pub debug: bool,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8089".to_string()
}

fn default_rate_limit_interval_ms() -> u64 {
    1000
}

fn default_chunk_size_bytes() -> usize {
    4096
}

fn default_ttl_seconds() -> u64 {
    300
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            rate_limit_interval_ms: default_rate_limit_interval_ms(),
            chunk_size_bytes: default_chunk_size_bytes(),
            default_ttl_seconds: default_ttl_seconds(),
            debug: false,
        }
    }
}

/// Load a [`CallConfig`] from an optional TOML file path, then apply
/// `CALL_*` environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<CallConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => CallConfig::default(),
    };
    apply_env_overrides(&mut config);
    validate_config(&config)?;
    Ok(config)
}

/// Parse a TOML string into a [`CallConfig`].
pub fn parse_toml(content: &str) -> Result<CallConfig, ConfigError> {
    toml::from_str::<CallConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

/// Apply `CALL_*` environment variable overrides in place.
///
/// Recognised variables: `CALL_BIND_ADDR`, `CALL_RATE_LIMIT_INTERVAL_MS`,
/// `CALL_CHUNK_SIZE_BYTES`, `CALL_DEFAULT_TTL_SECONDS`, `CALL_DEBUG`.
pub fn apply_env_overrides(config: &mut CallConfig) {
    if let Ok(val) = std::env::var("CALL_BIND_ADDR") {
        config.bind_addr = val;
    }
    if let Ok(val) = std::env::var("CALL_RATE_LIMIT_INTERVAL_MS") {
        if let Ok(n) = val.parse() {
            config.rate_limit_interval_ms = n;
        }
    }
    if let Ok(val) = std::env::var("CALL_CHUNK_SIZE_BYTES") {
        if let Ok(n) = val.parse() {
            config.chunk_size_bytes = n;
        }
    }
    if let Ok(val) = std::env::var("CALL_DEFAULT_TTL_SECONDS") {
        if let Ok(n) = val.parse() {
            config.default_ttl_seconds = n;
        }
    }
    if let Ok(val) = std::env::var("CALL_DEBUG") {
        config.debug = val == "1" || val.eq_ignore_ascii_case("true");
    }
}

/// Validate a parsed configuration, returning a collected error list on failure.
pub fn validate_config(config: &CallConfig) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.bind_addr.trim().is_empty() {
        errors.push("bind_addr must not be empty".to_string());
    }
    if config.rate_limit_interval_ms == 0 {
        errors.push("rate_limit_interval_ms must be greater than zero".to_string());
    }
    if config.chunk_size_bytes == 0 {
        errors.push("chunk_size_bytes must be greater than zero".to_string());
    }
    if config.default_ttl_seconds == 0 {
        errors.push("default_ttl_seconds must be greater than zero".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        validate_config(&CallConfig::default()).unwrap();
    }

    #[test]
    fn default_has_sensible_values() {
        let cfg = CallConfig::default();
        assert_eq!(cfg.bind_addr, "127.0.0.1:8089");
        assert_eq!(cfg.rate_limit_interval_ms, 1000);
        assert!(!cfg.debug);
    }

    #[test]
    fn parse_valid_toml() {
        let toml_str = r#"
            bind_addr = "0.0.0.0:9000"
            rate_limit_interval_ms = 2000
        "#;
        let cfg = parse_toml(toml_str).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:9000");
        assert_eq!(cfg.rate_limit_interval_ms, 2000);
        assert_eq!(cfg.chunk_size_bytes, 4096, "unset fields keep their default");
    }

    #[test]
    fn parse_invalid_toml_gives_parse_error() {
        let err = parse_toml("this is [not valid =").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn validation_catches_zero_rate_limit_interval() {
        let cfg = CallConfig {
            rate_limit_interval_ms: 0,
            ..Default::default()
        };
        let err = validate_config(&cfg).unwrap_err();
        match err {
            ConfigError::ValidationError { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("rate_limit_interval_ms")));
            }
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    #[test]
    fn validation_catches_empty_bind_addr() {
        let cfg = CallConfig {
            bind_addr: String::new(),
            ..Default::default()
        };
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("call.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "bind_addr = \"127.0.0.1:9999\"").unwrap();
        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:9999");
    }

    #[test]
    fn load_missing_file_gives_file_not_found() {
        let err = load_config(Some(Path::new("/nonexistent/call.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn load_none_returns_default() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg, CallConfig::default());
    }

    #[test]
    fn json_schema_can_be_generated() {
        let schema = schemars::schema_for!(CallConfig);
        let json = serde_json::to_string_pretty(&schema).unwrap();
        assert!(json.contains("CallConfig"));
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = CallConfig {
            bind_addr: "1.2.3.4:80".into(),
            rate_limit_interval_ms: 750,
            chunk_size_bytes: 8192,
            default_ttl_seconds: 600,
            debug: true,
        };
        let serialized = toml::to_string(&cfg).unwrap();
        let back: CallConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(cfg, back);
    }
}
