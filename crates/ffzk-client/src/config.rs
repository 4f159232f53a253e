//! Coordination client and election configuration

use crate::error::{ClientError, Result};
use crate::path;
use crate::retry::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Session timeout used when none is configured
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Connection timeout used when none is configured
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Settings for connecting to the coordination service and running elections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZkConfig {
    /// Comma separated `host:port` list of the ensemble
    pub servers: String,

    /// Root prefix applied to every path
    pub namespace: String,

    /// Initial backoff between retries, in milliseconds
    pub base_sleep_time_milliseconds: u64,

    /// Upper bound for a single backoff, in milliseconds
    pub max_sleep_time_milliseconds: u64,

    /// Maximum number of retries
    pub max_retries: u32,

    /// Session timeout in milliseconds, 0 keeps the client default
    pub session_timeout_milliseconds: u64,

    /// Connection timeout in milliseconds, 0 keeps the client default
    pub connection_timeout_milliseconds: u64,

    /// `user:password` credential for digest authentication.
    /// No authentication when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    /// Directory holding the election participants
    pub lead_latch_path: String,

    /// Name used to build the participant id, the local IP when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_name: Option<String>,

    pub election: ElectionSettings,
}

/// Election toggle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionSettings {
    pub enable: bool,
}

impl Default for ZkConfig {
    fn default() -> Self {
        Self {
            servers: String::new(),
            namespace: "ffzk".to_string(),
            base_sleep_time_milliseconds: 1000,
            max_sleep_time_milliseconds: 3000,
            max_retries: 3,
            session_timeout_milliseconds: 0,
            connection_timeout_milliseconds: 0,
            digest: None,
            lead_latch_path: "/leader".to_string(),
            application_name: None,
            election: ElectionSettings::default(),
        }
    }
}

impl ZkConfig {
    /// Create a configuration for the given ensemble with defaults elsewhere
    pub fn new<T: Into<String>>(servers: T) -> Self {
        Self {
            servers: servers.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClientError::configuration(format!("Failed to read config file: {}", e))
        })?;

        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ClientError::configuration(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            ClientError::configuration(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path, content).map_err(|e| {
            ClientError::configuration(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server_list().is_empty() {
            return Err(ClientError::configuration("servers must not be empty"));
        }

        if self.namespace.contains('/') {
            return Err(ClientError::configuration(
                "namespace must not contain '/'",
            ));
        }

        if self.max_sleep_time_milliseconds < self.base_sleep_time_milliseconds {
            return Err(ClientError::configuration(
                "max_sleep_time_milliseconds must not be lower than base_sleep_time_milliseconds",
            ));
        }

        path::validate(&self.lead_latch_path)
            .map_err(|e| ClientError::configuration(format!("lead_latch_path: {}", e)))?;

        if path::is_root(&self.lead_latch_path) {
            return Err(ClientError::configuration(
                "lead_latch_path must not be the root",
            ));
        }

        if let Some(digest) = &self.digest {
            if !digest.is_empty() && !digest.contains(':') {
                return Err(ClientError::configuration(
                    "digest must have the form user:password",
                ));
            }
        }

        Ok(())
    }

    /// Individual ensemble endpoints
    pub fn server_list(&self) -> Vec<&str> {
        self.servers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Digest credential, treating an empty string as absent
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref().filter(|d| !d.is_empty())
    }

    pub fn retry_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.base_sleep_time_milliseconds),
            Duration::from_millis(self.max_sleep_time_milliseconds),
            self.max_retries,
        )
    }

    pub fn session_timeout(&self) -> Duration {
        match self.session_timeout_milliseconds {
            0 => DEFAULT_SESSION_TIMEOUT,
            ms => Duration::from_millis(ms),
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        match self.connection_timeout_milliseconds {
            0 => DEFAULT_CONNECTION_TIMEOUT,
            ms => Duration::from_millis(ms),
        }
    }

    /// How long startup waits for the first connection
    pub fn startup_wait(&self) -> Duration {
        Duration::from_millis(self.max_sleep_time_milliseconds * u64::from(self.max_retries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = ZkConfig::default();
        assert_eq!(config.namespace, "ffzk");
        assert_eq!(config.lead_latch_path, "/leader");
        assert_eq!(config.base_sleep_time_milliseconds, 1000);
        assert_eq!(config.max_sleep_time_milliseconds, 3000);
        assert_eq!(config.max_retries, 3);
        assert!(!config.election.enable);
        assert!(config.digest().is_none());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ZkConfig::new("127.0.0.1:2181");
        assert!(config.validate().is_ok());

        config.servers = " , ".to_string();
        assert!(config.validate().is_err());

        config.servers = "127.0.0.1:2181".to_string();
        config.lead_latch_path = "leader".to_string();
        assert!(config.validate().is_err());

        config.lead_latch_path = "/".to_string();
        assert!(config.validate().is_err());

        config.lead_latch_path = "/leader".to_string();
        config.max_sleep_time_milliseconds = 10;
        assert!(config.validate().is_err());

        config.max_sleep_time_milliseconds = 3000;
        config.digest = Some("nocolon".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeouts_fall_back_to_defaults() {
        let mut config = ZkConfig::new("zk:2181");
        assert_eq!(config.session_timeout(), DEFAULT_SESSION_TIMEOUT);
        assert_eq!(config.connection_timeout(), DEFAULT_CONNECTION_TIMEOUT);
        assert_eq!(config.startup_wait(), Duration::from_millis(9000));

        config.session_timeout_milliseconds = 5000;
        config.connection_timeout_milliseconds = 2000;
        assert_eq!(config.session_timeout(), Duration::from_secs(5));
        assert_eq!(config.connection_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = ZkConfig::from_toml_str(
            r#"
            servers = "zk1:2181, zk2:2181"
            digest = "admin:secret"

            [election]
            enable = true
            "#,
        )
        .unwrap();

        assert_eq!(config.server_list(), vec!["zk1:2181", "zk2:2181"]);
        assert_eq!(config.namespace, "ffzk");
        assert_eq!(config.digest(), Some("admin:secret"));
        assert!(config.election.enable);
    }

    #[test]
    fn test_missing_servers_rejected() {
        assert!(ZkConfig::from_toml_str("namespace = \"app\"").is_err());
    }

    #[test]
    fn test_config_file_operations() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("zk.toml");

        let mut config = ZkConfig::new("127.0.0.1:2181");
        config.application_name = Some("billing".to_string());
        config.to_file(&config_path).unwrap();
        assert!(config_path.exists());

        let loaded = ZkConfig::from_file(&config_path).unwrap();
        assert_eq!(config, loaded);
    }
}
