//! WolfPack Configuration
//!
//! This module provides configuration structures for a WolfPack node and
//! the coordination service it joins.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::coordination::ExponentialBackoff;
use crate::id::NodeAddress;
use crate::state::ElectionConfig;

/// Main WolfPack configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfPackConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Coordination service configuration
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Node-to-node write delivery
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address this node registers and is reached at (a port or host:port)
    pub address: String,
}

/// Coordination service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Coordinator endpoint
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Base sleep between retries in milliseconds
    #[serde(default = "default_base_sleep_ms")]
    pub base_sleep_ms: u64,

    /// Maximum number of retries per operation
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Upper bound for a single retry sleep in milliseconds
    #[serde(default = "default_max_sleep_ms")]
    pub max_sleep_ms: u64,

    /// Election queue path
    #[serde(default = "default_election_path")]
    pub election_path: String,

    /// Leader record path
    #[serde(default = "default_leader_path")]
    pub leader_path: String,

    /// Membership registry path
    #[serde(default = "default_members_path")]
    pub members_path: String,
}

/// Node-to-node delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Host used to reach addresses that are bare ports
    #[serde(default = "default_peer_host")]
    pub peer_host: String,

    /// Timeout for a forward or fan-out request in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApiConfig {
    /// HTTP API bind address (defaults to 0.0.0.0:<node port>)
    #[serde(default)]
    pub bind_address: Option<String>,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_endpoint() -> String {
    "http://127.0.0.1:2181".to_string()
}

fn default_session_timeout_ms() -> u64 {
    5000
}

fn default_base_sleep_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    5
}

fn default_max_sleep_ms() -> u64 {
    30_000
}

fn default_election_path() -> String {
    "/leader-election".to_string()
}

fn default_leader_path() -> String {
    "/leader-port".to_string()
}

fn default_members_path() -> String {
    "/workers".to_string()
}

fn default_peer_host() -> String {
    "127.0.0.1".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            session_timeout_ms: default_session_timeout_ms(),
            base_sleep_ms: default_base_sleep_ms(),
            max_retries: default_max_retries(),
            max_sleep_ms: default_max_sleep_ms(),
            election_path: default_election_path(),
            leader_path: default_leader_path(),
            members_path: default_members_path(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            peer_host: default_peer_host(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfPackConfig {
    /// Minimal configuration for a node at `address` with every other key defaulted
    pub fn for_address(address: impl Into<String>) -> Self {
        Self {
            node: NodeConfig {
                address: address.into(),
            },
            coordination: CoordinationConfig::default(),
            replication: ReplicationConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfPackConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        NodeAddress::parse(&self.node.address)?;

        if self.coordination.endpoint.trim().is_empty() {
            return Err(crate::Error::Config("coordination.endpoint cannot be empty".into()));
        }

        if self.coordination.session_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "coordination.session_timeout_ms must be greater than 0".into(),
            ));
        }

        for (key, path) in [
            ("election_path", &self.coordination.election_path),
            ("leader_path", &self.coordination.leader_path),
            ("members_path", &self.coordination.members_path),
        ] {
            if !path.starts_with('/') || path.len() < 2 {
                return Err(crate::Error::Config(format!(
                    "coordination.{} must be an absolute path, got '{}'",
                    key, path
                )));
            }
            if path[1..].split('/').any(|segment| segment.is_empty()) {
                return Err(crate::Error::Config(format!(
                    "coordination.{} has an empty segment: '{}'",
                    key, path
                )));
            }
        }

        match self.logging.format.as_str() {
            "pretty" | "compact" => {}
            other => {
                return Err(crate::Error::Config(format!(
                    "logging.format must be 'pretty' or 'compact', got '{}'",
                    other
                )))
            }
        }

        Ok(())
    }

    /// Get the node address
    pub fn node_address(&self) -> crate::Result<NodeAddress> {
        NodeAddress::parse(&self.node.address)
    }

    /// Get the HTTP API bind address
    pub fn api_bind_address(&self) -> crate::Result<String> {
        if let Some(bind) = &self.api.bind_address {
            return Ok(bind.clone());
        }
        let address = self.node_address()?;
        match address.port() {
            Some(port) => Ok(format!("0.0.0.0:{}", port)),
            None => Err(crate::Error::Config(format!(
                "api.bind_address is required when node.address '{}' has no port",
                address
            ))),
        }
    }

    /// Get session timeout as Duration
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination.session_timeout_ms)
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.replication.request_timeout_ms)
    }

    /// Retry policy for coordination operations
    pub fn retry_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            base_sleep: Duration::from_millis(self.coordination.base_sleep_ms),
            max_retries: self.coordination.max_retries,
            max_sleep: Duration::from_millis(self.coordination.max_sleep_ms),
        }
    }

    /// Election settings; the leader re-checks its lease three times per session timeout
    pub fn election(&self) -> ElectionConfig {
        ElectionConfig {
            election_path: self.coordination.election_path.clone(),
            lease_check_interval: (self.session_timeout() / 3).max(Duration::from_millis(1)),
        }
    }
}
