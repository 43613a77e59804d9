//! Sandbox API configuration loading and parsing

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::tools::ToolSettings;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/sandbox-api/config.toml";
pub const CONFIG_ENV: &str = "SANDBOX_API_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Falls back to the process working directory.
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
    #[serde(default = "default_process_timeout")]
    pub default_process_timeout_secs: u64,
    #[serde(default = "default_port_poll_interval")]
    pub port_poll_interval_ms: u64,
    #[serde(default = "default_wait_for_ports_poll")]
    pub wait_for_ports_poll_ms: u64,
    #[serde(default = "default_tree_max_depth")]
    pub tree_max_depth: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            workspace: None,
            log_level: default_log_level(),
            log_format: default_log_format(),
            default_process_timeout_secs: default_process_timeout(),
            port_poll_interval_ms: default_port_poll_interval(),
            wait_for_ports_poll_ms: default_wait_for_ports_poll(),
            tree_max_depth: default_tree_max_depth(),
        }
    }
}

impl SandboxConfig {
    /// CLI flag wins over the `PORT` variable, which wins over the file.
    pub fn apply_port_override(&mut self, cli_port: Option<u16>, env_port: Option<&str>) -> Result<()> {
        if let Some(port) = cli_port {
            self.port = port;
        } else if let Some(raw) = env_port.filter(|s| !s.is_empty()) {
            self.port = raw
                .parse()
                .with_context(|| format!("PORT is not a valid port: {raw}"))?;
        }
        Ok(())
    }

    /// Always absolute; a relative `workspace` is taken from the current
    /// directory.
    pub fn workspace_dir(&self) -> Result<PathBuf> {
        match &self.workspace {
            Some(dir) if dir.is_absolute() => Ok(dir.clone()),
            Some(dir) => Ok(current_dir()?.join(dir)),
            None => current_dir(),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn port_poll_interval(&self) -> Duration {
        Duration::from_millis(self.port_poll_interval_ms.max(10))
    }

    pub fn tool_settings(&self) -> ToolSettings {
        ToolSettings {
            default_timeout: Duration::from_secs(self.default_process_timeout_secs),
            port_poll: Duration::from_millis(self.wait_for_ports_poll_ms.max(10)),
        }
    }
}

/// Where the effective configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    /// The file was missing; defaults were used.
    Defaults(PathBuf),
}

/// Load the configuration from `path`, else `$SANDBOX_API_CONFIG`, else the
/// default location. A missing file is not an error.
pub fn load_config(path: Option<&Path>) -> Result<(SandboxConfig, ConfigSource)> {
    let config_path = match path {
        Some(p) => p.to_path_buf(),
        None => std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH)),
    };

    if !config_path.exists() {
        return Ok((SandboxConfig::default(), ConfigSource::Defaults(config_path)));
    }

    let content = fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read config from {}", config_path.display()))?;
    let config: SandboxConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config from {}", config_path.display()))?;
    Ok((config, ConfigSource::File(config_path)))
}

fn current_dir() -> Result<PathBuf> {
    std::env::current_dir().context("Failed to read current directory")
}

fn default_port() -> u16 {
    8080
}
fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> LogFormat {
    LogFormat::Compact
}
fn default_process_timeout() -> u64 {
    60
}
fn default_port_poll_interval() -> u64 {
    2000
}
fn default_wait_for_ports_poll() -> u64 {
    250
}
fn default_tree_max_depth() -> usize {
    32
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.log_format, LogFormat::Compact);
        assert_eq!(config.tool_settings().default_timeout, Duration::from_secs(60));
        assert_eq!(config.port_poll_interval(), Duration::from_secs(2));
        assert_eq!(config.tree_max_depth, 32);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: SandboxConfig = toml::from_str(
            r#"
            port = 9000
            log_format = "json"
            workspace = "/srv/work"
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.workspace_dir().unwrap(), PathBuf::from("/srv/work"));
        assert_eq!(config.wait_for_ports_poll_ms, 250);
    }

    #[test]
    fn test_relative_workspace_is_made_absolute() {
        let config: SandboxConfig = toml::from_str(r#"workspace = "data/work""#).unwrap();
        let dir = config.workspace_dir().unwrap();
        assert!(dir.is_absolute());
        assert_eq!(dir, std::env::current_dir().unwrap().join("data/work"));

        assert!(SandboxConfig::default().workspace_dir().unwrap().is_absolute());
    }

    #[test]
    fn test_missing_file_falls_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.toml");
        let (config, source) = load_config(Some(&path)).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(source, ConfigSource::Defaults(path));
    }

    #[test]
    fn test_file_is_loaded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "host = \"127.0.0.1\"\ntree_max_depth = 4\n").unwrap();
        let (config, source) = load_config(Some(&path)).unwrap();
        assert_eq!(config.bind_address(), "127.0.0.1:8080");
        assert_eq!(config.tree_max_depth, 4);
        assert_eq!(source, ConfigSource::File(path));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn test_port_precedence() {
        let mut config = SandboxConfig::default();
        config.apply_port_override(None, Some("9100")).unwrap();
        assert_eq!(config.port, 9100);
        config.apply_port_override(Some(9200), Some("9100")).unwrap();
        assert_eq!(config.port, 9200);
        config.apply_port_override(None, Some("")).unwrap();
        assert_eq!(config.port, 9200);
        assert!(config.apply_port_override(None, Some("http")).is_err());
    }
}
