// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Layered server configuration: `mbridge.toml` with `MBRIDGE_*`
//! environment overrides.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::Level;

/// Log level for filtering messages.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Output format for the file log sink.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub console_enable: bool,
    pub console_level: LogLevel,
    pub file_enable: bool,
    pub file_level: LogLevel,
    pub file_path: String,
    pub file_format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enable: true,
            console_level: LogLevel::Info,
            file_enable: false,
            file_level: LogLevel::Info,
            file_path: "./logs/mbridge.log".to_string(),
            file_format: LogFormat::Text,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// Stable identifier written into every persisted row.
    pub server_id: String,
    pub data_dir: String,
    /// Defaults to `<data_dir>/messages.db`.
    pub database_url: Option<String>,
    /// Directory of per-channel YAML definitions.
    pub channels_dir: String,
    /// Allow statistics counters to go negative instead of clamping.
    pub allow_negative_statistics: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: "mbridge-1".to_string(),
            data_dir: "./data".to_string(),
            database_url: None,
            channels_dir: "./channels".to_string(),
            allow_negative_statistics: false,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn resolved_database_url(&self) -> String {
        self.database_url
            .clone()
            .unwrap_or_else(|| format!("sqlite://{}/messages.db", self.data_dir))
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ClusterConfig {
    /// Selects block-allocated message ids and a shared session store.
    pub enabled: bool,
    /// External shared session cache; unset falls back to in-process
    /// sessions with a warning.
    pub session_store_url: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle timeout; a session untouched this long is gone.
    pub timeout_mins: u64,
    /// In-process store cleaning interval.
    pub cleanup_interval_mins: u64,
    /// Mark session cookies Secure (TLS-only) by default.
    pub secure_cookies: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { timeout_mins: 30, cleanup_interval_mins: 5, secure_cookies: true }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct ScriptConfig {
    /// Wall-clock budget per script execution.
    pub timeout_ms: u64,
    /// QuickJS memory limit per execution.
    pub memory_limit_mb: usize,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000, memory_limit_mb: 64 }
    }
}

/// Top-level server configuration.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cluster: ClusterConfig,
    pub session: SessionConfig,
    pub log: LogConfig,
    pub script: ScriptConfig,
}

impl Config {
    /// Loads the config file (when present) and applies `MBRIDGE_*`
    /// environment overrides (`MBRIDGE_SERVER__DATA_DIR`, ...).
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(figment::providers::Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        } else {
            figment = figment.merge(Toml::file("mbridge.toml"));
        }
        figment.merge(Env::prefixed("MBRIDGE_").split("__")).extract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.session.timeout_mins, 30);
        assert_eq!(config.session.cleanup_interval_mins, 5);
        assert_eq!(config.script.timeout_ms, 30_000);
        assert!(!config.cluster.enabled);
        assert_eq!(config.server.resolved_database_url(), "sqlite://./data/messages.db");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mbridge.toml");
        std::fs::write(
            &path,
            "[server]\nserver_id = \"node-a\"\n[cluster]\nenabled = true\n",
        )
        .expect("write config");

        let config = Config::load(Some(&path)).expect("load");
        assert_eq!(config.server.server_id, "node-a");
        assert!(config.cluster.enabled);
        // Everything else keeps its default.
        assert_eq!(config.session.timeout_mins, 30);
    }
}
