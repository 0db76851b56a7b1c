//! Leader Directory
//!
//! The shared record naming the current leader's address. Only the node
//! holding leadership writes it; every node reads it.

use std::sync::Arc;

use crate::coordination::CoordinationClient;
use crate::error::{Error, Result};
use crate::id::NodeAddress;

/// Shared "who is leader" record
pub struct LeaderDirectory {
    client: Arc<CoordinationClient>,
    path: String,
}

impl LeaderDirectory {
    /// Create a directory backed by `path` (e.g. `/leader-port`)
    pub fn new(client: Arc<CoordinationClient>, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
        }
    }

    /// Overwrite the record with `address`
    pub async fn publish(&self, address: &NodeAddress) -> Result<()> {
        self.client.create_path(&self.path).await?;
        self.client
            .set_data(&self.path, address.as_str().as_bytes().to_vec())
            .await?;
        tracing::info!("Published leader address {} to {}", address, self.path);
        Ok(())
    }

    /// Last published leader address
    ///
    /// Fails with `NotYetElected` until a leader has published.
    pub async fn read(&self) -> Result<NodeAddress> {
        let data = match self.client.get_data(&self.path).await {
            Ok(data) => data,
            Err(Error::NoNode(_)) => return Err(Error::NotYetElected),
            Err(e) => return Err(e),
        };
        let raw = String::from_utf8(data)
            .map_err(|e| Error::Internal(format!("leader record is not UTF-8: {}", e)))?;
        if raw.trim().is_empty() {
            return Err(Error::NotYetElected);
        }
        NodeAddress::parse(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{CoordinationBackend, Ensemble, ExponentialBackoff};
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn directory(ensemble: &Arc<Ensemble>) -> LeaderDirectory {
        let backend: Arc<dyn CoordinationBackend> = ensemble.clone();
        let client = Arc::new(CoordinationClient::new(
            backend,
            ExponentialBackoff::new(Duration::from_millis(5), 3),
            Duration::from_secs(5),
        ));
        let (tx, _rx) = mpsc::unbounded_channel();
        client.connect(tx).await.unwrap();
        LeaderDirectory::new(client, "/leader-port")
    }

    #[tokio::test]
    async fn test_not_yet_elected() {
        let ensemble = Arc::new(Ensemble::new());
        let reader = directory(&ensemble).await;
        assert!(matches!(reader.read().await, Err(Error::NotYetElected)));

        // An empty record (path created at startup) is still "no leader"
        reader.client.create_path("/leader-port").await.unwrap();
        assert!(matches!(reader.read().await, Err(Error::NotYetElected)));
    }

    #[tokio::test]
    async fn test_publish_overwrites() {
        let ensemble = Arc::new(Ensemble::new());
        let writer = directory(&ensemble).await;
        let reader = directory(&ensemble).await;

        writer.publish(&NodeAddress::parse("8081").unwrap()).await.unwrap();
        assert_eq!(reader.read().await.unwrap().as_str(), "8081");

        writer.publish(&NodeAddress::parse("8082").unwrap()).await.unwrap();
        writer.publish(&NodeAddress::parse("8082").unwrap()).await.unwrap();
        assert_eq!(reader.read().await.unwrap().as_str(), "8082");
    }
}
