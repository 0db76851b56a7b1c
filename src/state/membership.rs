//! Cluster Membership Registry
//!
//! Live nodes are ephemeral entries under the members path, keyed by node
//! address. An entry disappears with its owner's coordination session, so
//! there is no explicit deregistration.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::coordination::{child_path, CoordinationClient};
use crate::error::{Error, Result};
use crate::id::{NodeAddress, NodeIdentity};

/// Payload stored in a membership entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    /// Candidate id of the registering node
    pub identity: NodeIdentity,
    /// Address the node is reached at
    pub address: NodeAddress,
    /// When the entry was created
    pub registered_at: chrono::DateTime<chrono::Utc>,
}

/// Registry of live node addresses
pub struct MembershipRegistry {
    client: Arc<CoordinationClient>,
    path: String,
    identity: NodeIdentity,
}

impl MembershipRegistry {
    /// Create a registry rooted at `path` (e.g. `/workers`)
    pub fn new(client: Arc<CoordinationClient>, path: impl Into<String>, identity: NodeIdentity) -> Self {
        Self {
            client,
            path: path.into(),
            identity,
        }
    }

    fn entry_path(&self, address: &NodeAddress) -> String {
        child_path(&self.path, address.as_str())
    }

    /// Register `address` as a live member
    ///
    /// Re-registering our own entry succeeds; an entry held by another live
    /// node fails with `Registration`.
    pub async fn register(&self, address: &NodeAddress) -> Result<()> {
        let registration_error = |reason: String| Error::Registration {
            address: address.to_string(),
            reason,
        };

        self.client
            .create_path(&self.path)
            .await
            .map_err(|e| registration_error(e.to_string()))?;

        let info = MemberInfo {
            identity: self.identity.clone(),
            address: address.clone(),
            registered_at: chrono::Utc::now(),
        };
        let data = serde_json::to_vec(&info)?;
        let entry = self.entry_path(address);

        match self.client.create_ephemeral(&entry, data).await {
            Ok(()) => {
                tracing::info!("Registered {} in {}", address, self.path);
                Ok(())
            }
            Err(Error::NodeExists(_)) => {
                let existing = self.read_entry(&entry).await;
                match existing {
                    Some(info) if info.identity == self.identity => {
                        tracing::debug!("{} already registered by this node", address);
                        Ok(())
                    }
                    Some(info) => Err(registration_error(format!(
                        "address is held by live node {}",
                        info.identity
                    ))),
                    None => Err(registration_error(
                        "address is held by another live session".into(),
                    )),
                }
            }
            Err(e) => Err(registration_error(e.to_string())),
        }
    }

    async fn read_entry(&self, entry: &str) -> Option<MemberInfo> {
        let data = self.client.get_data(entry).await.ok()?;
        serde_json::from_slice(&data).ok()
    }

    /// Snapshot of live member addresses
    ///
    /// Best effort: a failed read is logged and yields an empty list.
    pub async fn list_addresses(&self) -> Vec<NodeAddress> {
        match self.client.get_children(&self.path).await {
            Ok(children) => children
                .iter()
                .filter_map(|child| NodeAddress::parse(child).ok())
                .collect(),
            Err(e) => {
                tracing::warn!("Failed to list members under {}: {}", self.path, e);
                Vec::new()
            }
        }
    }

    /// Decoded entries of all live members; unreadable entries are skipped
    pub async fn members(&self) -> Vec<MemberInfo> {
        let mut members = Vec::new();
        for address in self.list_addresses().await {
            if let Some(info) = self.read_entry(&self.entry_path(&address)).await {
                members.push(info);
            }
        }
        members.sort_by(|a, b| a.address.cmp(&b.address));
        members
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{CoordinationBackend, Ensemble, ExponentialBackoff};
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn connected(ensemble: &Arc<Ensemble>) -> Arc<CoordinationClient> {
        let backend: Arc<dyn CoordinationBackend> = ensemble.clone();
        let client = Arc::new(CoordinationClient::new(
            backend,
            ExponentialBackoff::new(Duration::from_millis(5), 3),
            Duration::from_secs(5),
        ));
        let (tx, _rx) = mpsc::unbounded_channel();
        client.connect(tx).await.unwrap();
        client
    }

    fn address(raw: &str) -> NodeAddress {
        NodeAddress::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let ensemble = Arc::new(Ensemble::new());
        let a = MembershipRegistry::new(connected(&ensemble).await, "/workers", NodeIdentity::generate());
        let b = MembershipRegistry::new(connected(&ensemble).await, "/workers", NodeIdentity::generate());

        a.register(&address("8081")).await.unwrap();
        b.register(&address("8082")).await.unwrap();

        let mut addresses = a.list_addresses().await;
        addresses.sort();
        assert_eq!(addresses, vec![address("8081"), address("8082")]);

        let members = b.members().await;
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].address, address("8081"));
    }

    #[tokio::test]
    async fn test_reregistration_is_idempotent() {
        let ensemble = Arc::new(Ensemble::new());
        let registry = MembershipRegistry::new(connected(&ensemble).await, "/workers", NodeIdentity::generate());

        registry.register(&address("8081")).await.unwrap();
        registry.register(&address("8081")).await.unwrap();
        assert_eq!(registry.list_addresses().await.len(), 1);
    }

    #[tokio::test]
    async fn test_address_held_by_other_node() {
        let ensemble = Arc::new(Ensemble::new());
        let first = MembershipRegistry::new(connected(&ensemble).await, "/workers", NodeIdentity::generate());
        let second = MembershipRegistry::new(connected(&ensemble).await, "/workers", NodeIdentity::generate());

        first.register(&address("8081")).await.unwrap();
        let err = second.register(&address("8081")).await.unwrap_err();
        assert!(matches!(err, Error::Registration { .. }));
    }

    #[tokio::test]
    async fn test_entry_vanishes_with_session() {
        let ensemble = Arc::new(Ensemble::new());
        let client = connected(&ensemble).await;
        let registry = MembershipRegistry::new(Arc::clone(&client), "/workers", NodeIdentity::generate());
        let observer = MembershipRegistry::new(connected(&ensemble).await, "/workers", NodeIdentity::generate());

        registry.register(&address("8081")).await.unwrap();
        assert_eq!(observer.list_addresses().await.len(), 1);

        client.close().await;
        assert!(observer.list_addresses().await.is_empty());
    }

    #[tokio::test]
    async fn test_list_failure_yields_empty() {
        let ensemble = Arc::new(Ensemble::new());
        let registry = MembershipRegistry::new(
            Arc::new(CoordinationClient::new(
                ensemble.clone(),
                ExponentialBackoff::new(Duration::from_millis(1), 1),
                Duration::from_secs(5),
            )),
            "/workers",
            NodeIdentity::generate(),
        );

        // Members path was never created
        assert!(registry.list_addresses().await.is_empty());

        ensemble.set_available(false);
        assert!(registry.list_addresses().await.is_empty());
    }
}
