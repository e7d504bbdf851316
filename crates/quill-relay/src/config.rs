//! YAML configuration loading for the relay.
//!
//! Loads [`RelayConfig`] from a YAML file on disk, falling back to defaults
//! when no file is specified. Environment variables override file values;
//! CLI flags override both.

use quill_core::{QuillError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Relay configuration. The mediation *policy* lives separately in
/// `policy.json` under the data directory; this file only shapes the
/// process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address and port for the HTTP transport.
    pub listen_addr: String,
    /// Upstream JSON-RPC endpoint for the HTTP transport.
    pub upstream_url: String,
    /// Name of the mediated tool server, matched against policy entries.
    pub server_name: String,
    /// Data directory holding keys, ledger, behavior, and auth databases.
    pub data_dir: String,
    /// Operator key name under `<data_dir>/keys/`.
    pub key_name: String,
    /// Require bearer tokens on the HTTP transport.
    pub auth_enabled: bool,
    /// Upstream request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Upstream connection timeout in milliseconds.
    pub connection_timeout_ms: u64,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Structured logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level filter (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Output format (`text` or `json`).
    pub format: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8787".to_string(),
            upstream_url: "http://127.0.0.1:8788".to_string(),
            server_name: "default".to_string(),
            data_dir: ".quill".to_string(),
            key_name: "operator".to_string(),
            auth_enabled: false,
            timeout_ms: 30_000,
            connection_timeout_ms: 5_000,
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Load a [`RelayConfig`] from a YAML file at `path`.
pub fn load_config(path: &Path) -> Result<RelayConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        QuillError::Config(format!("failed to read config file {}: {e}", path.display()))
    })?;
    serde_yaml::from_str(&contents)
        .map_err(|e| QuillError::Config(format!("failed to parse config YAML: {e}")))
}

/// Apply environment variable overrides.
///
/// `QUILL_DATA_DIR` names the data directory; the other variables mirror
/// the config fields for container deployments.
pub fn apply_env_overrides(config: &mut RelayConfig) {
    if let Ok(value) = std::env::var("QUILL_DATA_DIR") {
        if !value.is_empty() {
            config.data_dir = value;
        }
    }
    if let Ok(value) = std::env::var("QUILL_LISTEN_ADDR") {
        if !value.is_empty() {
            config.listen_addr = value;
        }
    }
    if let Ok(value) = std::env::var("QUILL_UPSTREAM_URL") {
        if !value.is_empty() {
            config.upstream_url = value;
        }
    }
    if let Ok(value) = std::env::var("QUILL_SERVER_NAME") {
        if !value.is_empty() {
            config.server_name = value;
        }
    }
}

/// Validate the resolved configuration.
pub fn validate_config(config: &RelayConfig) -> Result<()> {
    if config.server_name.is_empty() {
        return Err(QuillError::Config("server_name must not be empty".to_string()));
    }
    if config.listen_addr.parse::<std::net::SocketAddr>().is_err() {
        return Err(QuillError::Config(format!(
            "listen_addr '{}' is not a valid socket address",
            config.listen_addr
        )));
    }
    if config.upstream_url.is_empty() {
        return Err(QuillError::Config("upstream_url must not be empty".to_string()));
    }
    if config.data_dir.is_empty() {
        return Err(QuillError::Config("data_dir must not be empty".to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_yaml(yaml: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.listen_addr, "127.0.0.1:8787");
        assert_eq!(config.server_name, "default");
        assert!(!config.auth_enabled);
        assert_eq!(config.logging.level, "info");
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_load_partial_yaml_fills_defaults() {
        let f = write_yaml(
            r#"
server_name: "builder-mcp"
upstream_url: "http://localhost:9001"
auth_enabled: true
"#,
        );
        let config = load_config(f.path()).unwrap();
        assert_eq!(config.server_name, "builder-mcp");
        assert_eq!(config.upstream_url, "http://localhost:9001");
        assert!(config.auth_enabled);
        // Unspecified fields come from defaults
        assert_eq!(config.listen_addr, "127.0.0.1:8787");
        assert_eq!(config.key_name, "operator");
    }

    #[test]
    fn test_load_missing_file() {
        assert!(load_config(Path::new("/nonexistent/quill.yaml")).is_err());
    }

    #[test]
    fn test_load_invalid_yaml() {
        let f = write_yaml("listen_addr: [not: a: string");
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_listen_addr() {
        let config = RelayConfig {
            listen_addr: "not-an-addr".to_string(),
            ..RelayConfig::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_server_name() {
        let config = RelayConfig {
            server_name: String::new(),
            ..RelayConfig::default()
        };
        assert!(validate_config(&config).is_err());
    }
}
