//! Node Identity and Addressing
//!
//! Two deliberately separate value objects:
//!
//! - [`NodeIdentity`]: a short random candidate id generated at startup,
//!   used only when joining the leader election.
//! - [`NodeAddress`]: where a node is reached. Also the key of its
//!   membership entry and the value stored in the leader record.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Length of a generated candidate id
const IDENTITY_LEN: usize = 8;

/// Opaque election candidate id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeIdentity(String);

impl NodeIdentity {
    /// Generate a fresh random identity
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self(uuid[..IDENTITY_LEN].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

/// Externally reachable node address
///
/// Either a bare port (`"8081"`, reached on the configured peer host) or a
/// `host:port` pair. Never contains `/` since it doubles as a path segment
/// in the membership registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddress(String);

impl NodeAddress {
    /// Parse and validate an address
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::Config("node address cannot be empty".into()));
        }
        if trimmed.contains('/') {
            return Err(Error::Config(format!(
                "node address '{}' must not contain '/'",
                trimmed
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Port component, if the address carries one
    pub fn port(&self) -> Option<u16> {
        let port = match self.0.rsplit_once(':') {
            Some((_, port)) => port,
            None => &self.0,
        };
        port.parse().ok()
    }

    /// Base HTTP URL for this address
    ///
    /// Bare ports are resolved against `default_host`.
    pub fn base_url(&self, default_host: &str) -> String {
        if self.0.contains(':') {
            format!("http://{}", self.0)
        } else {
            format!("http://{}:{}", default_host, self.0)
        }
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

impl std::str::FromStr for NodeAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
