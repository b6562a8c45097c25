// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Daemon configuration.
//!
//! Loaded from a JSON file; unknown keys are ignored so consumers can
//! annotate their config freely. A handful of environment variables
//! override file values: `FOSSIBOT_EMAIL`, `FOSSIBOT_PASSWORD`,
//! `MOSQUITTO_HOST` and `LOG_LEVEL`.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

/// Default PID file location when `/var/run` is writable.
const SYSTEM_PID_FILE: &str = "/var/run/fossibot-bridge.pid";
/// Fallback PID file next to the working directory.
const LOCAL_PID_FILE: &str = "fossibot-bridge.pid";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Vendor accounts to bridge.
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,

    /// Local broker coordinates.
    pub mosquitto: MosquittoConfig,

    /// Process-level settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Embedded health endpoint.
    #[serde(default)]
    pub health: HealthConfig,

    /// Token and device cache tunables.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Scheduling knobs.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Diagnostic toggles.
    #[serde(default)]
    pub debug: DebugConfig,
}

/// One vendor account.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// Login email; also the cache key.
    pub email: String,
    /// Login password.
    pub password: String,
    /// Disabled accounts are ignored entirely.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Local broker coordinates.
#[derive(Debug, Clone, Deserialize)]
pub struct MosquittoConfig {
    /// Broker host. Required.
    pub host: String,
    /// Broker port.
    #[serde(default = "default_mosquitto_port")]
    pub port: u16,
    /// Optional broker credentials.
    #[serde(default)]
    pub username: Option<String>,
    /// Optional broker credentials.
    #[serde(default)]
    pub password: Option<String>,
    /// MQTT client identifier on the local session.
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

/// Process-level settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Log destination; stderr when absent.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Log level filter.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Single-instance lock file; auto-chosen when absent.
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
}

/// Embedded health endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Whether to serve `GET /health`.
    #[serde(default)]
    pub enabled: bool,
    /// Listen port.
    #[serde(default = "default_health_port")]
    pub port: u16,
}

/// Token and device cache tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Root directory for persisted tokens and device lists.
    #[serde(default = "default_cache_directory")]
    pub directory: PathBuf,
    /// Seconds subtracted from a token's expiry when judging reuse.
    #[serde(default = "default_safety_margin")]
    pub token_ttl_safety_margin: u64,
    /// Device list validity in seconds.
    #[serde(default = "default_device_list_ttl")]
    pub device_list_ttl: u64,
    /// Periodic device re-discovery interval in seconds.
    #[serde(default = "default_device_refresh_interval")]
    pub device_refresh_interval: u64,
}

/// Scheduling knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Seconds between retained bridge status publishes.
    #[serde(default = "default_status_interval")]
    pub status_publish_interval: u64,
    /// Seconds between cyclic holding-register polls; 0 disables the
    /// cycle (the vendor rate-limits aggressive polling), leaving only
    /// the startup read and post-write re-reads.
    #[serde(default)]
    pub device_poll_interval: u64,
    /// First reconnect delay in seconds.
    #[serde(default = "default_reconnect_min")]
    pub reconnect_delay_min: u64,
    /// Reconnect delay cap in seconds.
    #[serde(default = "default_reconnect_max")]
    pub reconnect_delay_max: u64,
}

/// Diagnostic toggles.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct DebugConfig {
    /// Dump decoded register maps at debug level.
    #[serde(default)]
    pub log_raw_registers: bool,
    /// Include the originating topic in state update logs.
    #[serde(default)]
    pub log_update_source: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_file: None,
            log_level: default_log_level(),
            pid_file: None,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_health_port(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: default_cache_directory(),
            token_ttl_safety_margin: default_safety_margin(),
            device_list_ttl: default_device_list_ttl(),
            device_refresh_interval: default_device_refresh_interval(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            status_publish_interval: default_status_interval(),
            device_poll_interval: 0,
            reconnect_delay_min: default_reconnect_min(),
            reconnect_delay_max: default_reconnect_max(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_mosquitto_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "fossibot_bridge".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_health_port() -> u16 {
    8080
}
fn default_cache_directory() -> PathBuf {
    PathBuf::from("/var/lib/fossibot")
}
fn default_safety_margin() -> u64 {
    300
}
fn default_device_list_ttl() -> u64 {
    86_400
}
fn default_device_refresh_interval() -> u64 {
    86_400
}
fn default_status_interval() -> u64 {
    60
}
fn default_reconnect_min() -> u64 {
    5
}
fn default_reconnect_max() -> u64 {
    60
}

impl Config {
    /// Loads, applies environment overrides and validates.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file is unreadable, not JSON, or
    /// semantically invalid.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Self =
            serde_json::from_str(&content).map_err(|source| ConfigError::Json {
                path: path.display().to_string(),
                source,
            })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parses a configuration from a JSON string without touching the
    /// environment. Used by tests and the `validate` wrapper.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on parse or validation failure.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content).map_err(|source| ConfigError::Json {
            path: "<inline>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(email) = std::env::var("FOSSIBOT_EMAIL") {
            let password = std::env::var("FOSSIBOT_PASSWORD").unwrap_or_default();
            match self.accounts.first_mut() {
                Some(account) => {
                    account.email = email;
                    if !password.is_empty() {
                        account.password = password;
                    }
                }
                None => self.accounts.push(AccountConfig {
                    email,
                    password,
                    enabled: true,
                }),
            }
        }
        if let Ok(host) = std::env::var("MOSQUITTO_HOST") {
            self.mosquitto.host = host;
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.daemon.log_level = level;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled_accounts().next().is_none() {
            return Err(ConfigError::MissingKey("accounts"));
        }
        for account in self.enabled_accounts() {
            if account.email.is_empty() || !account.email.contains('@') {
                return Err(ConfigError::InvalidValue {
                    key: "accounts[].email",
                    reason: format!("not an email address: {:?}", account.email),
                });
            }
            if account.password.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "accounts[].password",
                    reason: "empty password".to_string(),
                });
            }
        }
        if self.mosquitto.host.is_empty() {
            return Err(ConfigError::MissingKey("mosquitto.host"));
        }
        if self.mosquitto.port == 0 {
            return Err(ConfigError::InvalidValue {
                key: "mosquitto.port",
                reason: "port 0".to_string(),
            });
        }
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.daemon.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "daemon.log_level",
                reason: format!("unknown level {:?}", self.daemon.log_level),
            });
        }
        if self.bridge.reconnect_delay_min == 0
            || self.bridge.reconnect_delay_max < self.bridge.reconnect_delay_min
        {
            return Err(ConfigError::InvalidValue {
                key: "bridge.reconnect_delay_max",
                reason: "reconnect delays must satisfy 0 < min <= max".to_string(),
            });
        }
        Ok(())
    }

    /// Accounts that are switched on.
    pub fn enabled_accounts(&self) -> impl Iterator<Item = &AccountConfig> {
        self.accounts.iter().filter(|a| a.enabled)
    }

    /// Resolved PID file path: the configured one, else a system
    /// location when writable, else a file in the working directory.
    #[must_use]
    pub fn pid_file_path(&self) -> PathBuf {
        if let Some(path) = &self.daemon.pid_file {
            return path.clone();
        }
        let system = PathBuf::from(SYSTEM_PID_FILE);
        let var_run_writable = system
            .parent()
            .and_then(|dir| std::fs::metadata(dir).ok())
            .is_some_and(|m| !m.permissions().readonly());
        if var_run_writable {
            system
        } else {
            PathBuf::from(LOCAL_PID_FILE)
        }
    }
}

/// Masks an email for log output: `ab***@example.org`.
#[must_use]
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let visible: String = local.chars().take(2).collect();
            format!("{visible}***@{domain}")
        }
        None => "***".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "accounts": [{"email": "user@example.org", "password": "secret"}],
        "mosquitto": {"host": "localhost"}
    }"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = Config::from_json(MINIMAL).unwrap();
        assert_eq!(config.mosquitto.port, 1883);
        assert_eq!(config.mosquitto.client_id, "fossibot_bridge");
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.cache.token_ttl_safety_margin, 300);
        assert_eq!(config.cache.device_list_ttl, 86_400);
        assert_eq!(config.bridge.status_publish_interval, 60);
        assert_eq!(config.bridge.device_poll_interval, 0);
        assert!(!config.health.enabled);
        assert!(config.accounts[0].enabled);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let config = Config::from_json(
            r#"{
                "accounts": [{"email": "u@e.org", "password": "p", "note": "spare"}],
                "mosquitto": {"host": "broker.lan"},
                "future_section": {"x": 1}
            }"#,
        )
        .unwrap();
        assert_eq!(config.mosquitto.host, "broker.lan");
    }

    #[test]
    fn missing_accounts_is_rejected() {
        let err = Config::from_json(r#"{"mosquitto": {"host": "h"}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey("accounts")));
    }

    #[test]
    fn disabled_accounts_do_not_count() {
        let err = Config::from_json(
            r#"{
                "accounts": [{"email": "u@e.org", "password": "p", "enabled": false}],
                "mosquitto": {"host": "h"}
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey("accounts")));
    }

    #[test]
    fn bad_email_is_rejected() {
        let err = Config::from_json(
            r#"{
                "accounts": [{"email": "nodomain", "password": "p"}],
                "mosquitto": {"host": "h"}
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "accounts[].email", .. }));
    }

    #[test]
    fn bad_log_level_is_rejected() {
        let err = Config::from_json(
            r#"{
                "accounts": [{"email": "u@e.org", "password": "p"}],
                "mosquitto": {"host": "h"},
                "daemon": {"log_level": "loud"}
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "daemon.log_level", .. }));
    }

    #[test]
    fn email_masking() {
        assert_eq!(mask_email("user@example.org"), "us***@example.org");
        assert_eq!(mask_email("a@b.c"), "a***@b.c");
        assert_eq!(mask_email("garbage"), "***");
    }
}
