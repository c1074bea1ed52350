//! Application configuration management.
//!
//! Configuration is stored as `config.json` in the install root, which is
//! `$VAULTKEEP_HOME` when set and `<data dir>/vaultkeep` otherwise. The
//! install root also holds the token, the keepalive PID file and logs, and
//! the default SSH key location. Every field has a default, so a missing or
//! partial file is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::TOKEN_FILE;
use crate::utils::write_private;

/// Application name used for the default install root
const APP_NAME: &str = "vaultkeep";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding the install root
pub const HOME_ENV: &str = "VAULTKEEP_HOME";

/// Environment variable overriding the configured username
pub const USERNAME_ENV: &str = "VAULTKEEP_USERNAME";

/// Endpoint that issues MFA-caching SSH keys
pub const DEFAULT_ENDPOINT: &str = "cyberark";

const KEEPALIVE_PID_FILE: &str = "keepalive.pid";
const KEEPALIVE_LOG_FILE: &str = "keepalive.log";
const SSH_KEY_FILE: &str = "key.openssh";

/// Upper bound for one watchdog run
const MAX_TIMEOUT_HOURS: f64 = 168.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("keepalive min_seconds must be at least 1")]
    ZeroInterval,

    #[error("keepalive min_seconds ({min}) must be less than max_seconds ({max})")]
    IntervalOrder { min: u64, max: u64 },

    #[error(
        "keepalive max_seconds ({max}) must be less than the server session timeout ({timeout}s)"
    )]
    ExceedsSessionTimeout { max: u64, timeout: u64 },

    #[error("keepalive timeout_hours must be greater than 0 and at most 168, got {0}")]
    HardTimeout(f64),
}

/// Timing of the keepalive watchdog.
///
/// The vault expires a session after `session_timeout_seconds` of
/// inactivity (PasswordVault's `sessionState timeout`, 20 minutes by
/// default), so both interval bounds must stay below it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    pub min_seconds: u64,
    pub max_seconds: u64,
    pub timeout_hours: f64,
    pub session_timeout_seconds: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            min_seconds: 901,
            max_seconds: 1139,
            timeout_hours: 9.0,
            session_timeout_seconds: 1200,
        }
    }
}

impl KeepaliveConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_seconds == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        if self.min_seconds >= self.max_seconds {
            return Err(ConfigError::IntervalOrder {
                min: self.min_seconds,
                max: self.max_seconds,
            });
        }
        if self.max_seconds >= self.session_timeout_seconds {
            return Err(ConfigError::ExceedsSessionTimeout {
                max: self.max_seconds,
                timeout: self.session_timeout_seconds,
            });
        }
        if !self.timeout_hours.is_finite()
            || self.timeout_hours <= 0.0
            || self.timeout_hours > MAX_TIMEOUT_HOURS
        {
            return Err(ConfigError::HardTimeout(self.timeout_hours));
        }
        Ok(())
    }

    pub fn hard_timeout_seconds(&self) -> u64 {
        (self.timeout_hours * 3600.0).round() as u64
    }

    pub fn hard_timeout(&self) -> Duration {
        Duration::from_secs(self.hard_timeout_seconds())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Defaults to `key.openssh` in the install root
    pub key_path: Option<PathBuf>,
    pub key_max_age_hours: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            key_path: None,
            key_max_age_hours: 9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub endpoint: String,
    pub username: Option<String>,
    pub verify_ssl: bool,
    pub ssh: SshConfig,
    pub keepalive: KeepaliveConfig,

    #[serde(skip)]
    root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            username: None,
            verify_ssl: false,
            ssh: SshConfig::default(),
            keepalive: KeepaliveConfig::default(),
            root: PathBuf::new(),
        }
    }
}

impl Config {
    /// Load from the default install root
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::install_root()?)
    }

    /// Load `config.json` from `root`, falling back to defaults if absent
    pub fn load_from(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str::<Config>(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            Self::default()
        };
        config.root = root.to_path_buf();
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        write_private(&self.root.join(CONFIG_FILE), contents.as_bytes())
            .context("Failed to write config file")?;
        Ok(())
    }

    pub fn install_root() -> Result<PathBuf> {
        if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            // Absolute, so the watchdog's recorded --pid-path matches from any cwd
            let home = PathBuf::from(home);
            if home.is_relative() {
                let cwd = std::env::current_dir().context("Failed to resolve VAULTKEEP_HOME")?;
                return Ok(cwd.join(home));
            }
            return Ok(home);
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Apply command-line and environment overrides
    pub fn apply_overrides(&mut self, endpoint: Option<String>, username: Option<String>) {
        if let Some(endpoint) = endpoint.filter(|e| !e.trim().is_empty()) {
            self.endpoint = endpoint;
        }
        let username = username.or_else(|| std::env::var(USERNAME_ENV).ok());
        if let Some(username) = username.filter(|u| !u.trim().is_empty()) {
            self.username = Some(username);
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn token_path(&self) -> PathBuf {
        self.root.join(TOKEN_FILE)
    }

    pub fn keepalive_pid_path(&self) -> PathBuf {
        self.root.join(KEEPALIVE_PID_FILE)
    }

    pub fn keepalive_log_path(&self) -> PathBuf {
        self.root.join(KEEPALIVE_LOG_FILE)
    }

    pub fn ssh_key_path(&self) -> PathBuf {
        self.ssh
            .key_path
            .clone()
            .unwrap_or_else(|| self.root.join(SSH_KEY_FILE))
    }

    /// Only the default endpoint hands out SSH keys
    pub fn is_default_endpoint(&self) -> bool {
        self.endpoint == DEFAULT_ENDPOINT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.endpoint, "cyberark");
        assert!(!config.verify_ssl);
        assert_eq!(config.ssh.key_max_age_hours, 9);
        assert_eq!(config.keepalive.min_seconds, 901);
        assert_eq!(config.keepalive.max_seconds, 1139);
        assert_eq!(config.keepalive.hard_timeout_seconds(), 32400);
        assert!(config.keepalive.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"username": "jdoe", "keepalive": {"timeout_hours": 4.5}}"#,
        )
        .expect("write");

        let config = Config::load_from(dir.path()).expect("load");
        assert_eq!(config.username.as_deref(), Some("jdoe"));
        assert_eq!(config.endpoint, "cyberark");
        assert_eq!(config.keepalive.min_seconds, 901);
        assert_eq!(config.keepalive.hard_timeout_seconds(), 16200);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config::load_from(dir.path()).expect("load");
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.root(), dir.path());
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(CONFIG_FILE), "{ not json").expect("write");
        assert!(Config::load_from(dir.path()).is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::load_from(dir.path()).expect("load");
        config.username = Some("operator".to_string());
        config.save().expect("save");

        let reloaded = Config::load_from(dir.path()).expect("reload");
        assert_eq!(reloaded.username.as_deref(), Some("operator"));
    }

    #[test]
    fn test_paths_live_under_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config::load_from(dir.path()).expect("load");
        assert_eq!(config.token_path(), dir.path().join("token"));
        assert_eq!(config.keepalive_pid_path(), dir.path().join("keepalive.pid"));
        assert_eq!(config.keepalive_log_path(), dir.path().join("keepalive.log"));
        assert_eq!(config.ssh_key_path(), dir.path().join("key.openssh"));
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = Config::default();
        config.apply_overrides(Some("cyberark-dr".to_string()), Some("alice".to_string()));
        assert_eq!(config.endpoint, "cyberark-dr");
        assert_eq!(config.username.as_deref(), Some("alice"));
        assert!(!config.is_default_endpoint());

        // Blank overrides are ignored
        config.apply_overrides(Some("  ".to_string()), None);
        assert_eq!(config.endpoint, "cyberark-dr");
    }

    #[test]
    fn test_validate_interval_order() {
        let keepalive = KeepaliveConfig {
            min_seconds: 1139,
            max_seconds: 901,
            ..Default::default()
        };
        assert_eq!(
            keepalive.validate(),
            Err(ConfigError::IntervalOrder { min: 1139, max: 901 })
        );
    }

    #[test]
    fn test_validate_session_timeout() {
        let keepalive = KeepaliveConfig {
            max_seconds: 1200,
            ..Default::default()
        };
        assert!(matches!(
            keepalive.validate(),
            Err(ConfigError::ExceedsSessionTimeout { .. })
        ));
    }

    #[test]
    fn test_validate_hard_timeout() {
        for hours in [0.0, -1.0, f64::NAN, 1000.0] {
            let keepalive = KeepaliveConfig {
                timeout_hours: hours,
                ..Default::default()
            };
            assert!(keepalive.validate().is_err(), "{hours} should be rejected");
        }
    }
}
