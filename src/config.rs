use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration, loaded from TOML with env overrides for
/// the secrets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BastionConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listener bind address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Directory receiving session transcripts.
    #[serde(default = "default_logs_location")]
    pub logs_location: PathBuf,
    /// Seed a throwaway data set at boot.
    #[serde(default)]
    pub demo: bool,
    #[serde(default)]
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            logs_location: default_logs_location(),
            demo: false,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `file` (JSON-backed) or `memory`.
    #[serde(default = "default_store_driver")]
    pub driver: String,
    /// Store location for the `file` driver.
    #[serde(default = "default_store_url")]
    pub url: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            driver: default_store_driver(),
            url: default_store_url(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Key material for sealing store secrets. Required unless demo mode
    /// is on; also read from SSHGATE_AES_KEY.
    #[serde(default)]
    pub aes_key: String,
    /// Optional external command consulted when no static ACL applies.
    #[serde(default)]
    pub acl_check_cmd: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

fn default_bind_addr() -> String {
    "0.0.0.0:2222".to_string()
}

fn default_logs_location() -> PathBuf {
    PathBuf::from("logs")
}

fn default_store_driver() -> String {
    "file".to_string()
}

fn default_store_url() -> PathBuf {
    PathBuf::from("sshgate.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Load and validate a configuration file, then apply env overrides.
pub fn load_config(path: &Path) -> Result<BastionConfig> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading config: {}", path.display()))?;
    let mut config: BastionConfig =
        toml::from_str(&data).with_context(|| format!("parsing config: {}", path.display()))?;
    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

pub fn apply_env_overrides(config: &mut BastionConfig) {
    if let Ok(key) = std::env::var("SSHGATE_AES_KEY") {
        if !key.is_empty() {
            config.security.aes_key = key;
        }
    }
    if let Ok(addr) = std::env::var("SSHGATE_BIND_ADDR") {
        if !addr.is_empty() {
            config.server.bind_addr = addr;
        }
    }
}

pub fn validate(config: &BastionConfig) -> Result<()> {
    config
        .server
        .bind_addr
        .parse::<std::net::SocketAddr>()
        .with_context(|| format!("invalid bind_addr {:?}", config.server.bind_addr))?;

    match config.store.driver.as_str() {
        "file" | "memory" => {}
        other => anyhow::bail!("unknown store driver {other:?} (available: file, memory)"),
    }

    if config.security.aes_key.is_empty() && !config.server.demo {
        anyhow::bail!("security.aes_key must be set (or SSHGATE_AES_KEY exported)");
    }
    Ok(())
}

/// Starter config written by `sshgate init`.
pub fn sample_config(bind_addr: &str) -> String {
    format!(
        r#"[server]
bind_addr = "{bind_addr}"
logs_location = "logs"
demo = false
debug = false

[store]
driver = "file"
url = "sshgate.json"

[security]
# Key material for sealing host credentials at rest.
# Can also be provided via SSHGATE_AES_KEY.
aes_key = ""
# acl_check_cmd = "/usr/local/bin/sshgate-acl-check"

[logging]
level = "info"
format = "pretty"
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in() {
        let config: BastionConfig = toml::from_str(
            r#"
[security]
aes_key = "k"
"#,
        )
        .unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0:2222");
        assert_eq!(config.store.driver, "file");
        assert_eq!(config.logging.format, LogFormat::Pretty);
        validate(&config).unwrap();
    }

    #[test]
    fn missing_aes_key_is_rejected() {
        let config: BastionConfig = toml::from_str("").unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn demo_mode_allows_empty_aes_key() {
        let config: BastionConfig = toml::from_str(
            r#"
[server]
demo = true
"#,
        )
        .unwrap();
        validate(&config).unwrap();
    }

    #[test]
    fn bad_bind_addr_is_rejected() {
        let config: BastionConfig = toml::from_str(
            r#"
[server]
bind_addr = "nonsense"
[security]
aes_key = "k"
"#,
        )
        .unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn bad_store_driver_is_rejected() {
        let config: BastionConfig = toml::from_str(
            r#"
[store]
driver = "postgres"
[security]
aes_key = "k"
"#,
        )
        .unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn sample_config_parses() {
        let config: BastionConfig = toml::from_str(&sample_config("127.0.0.1:2222")).unwrap();
        assert_eq!(config.server.bind_addr, "127.0.0.1:2222");
    }
}
