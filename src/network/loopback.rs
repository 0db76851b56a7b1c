//! Loopback Transport
//!
//! Delivers writes to routers living in the same process. Used to run a
//! whole cluster inside one test or demo process; keeps a log of every
//! delivery and can make addresses unreachable.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use super::Transport;
use crate::error::{Error, Result};
use crate::id::NodeAddress;
use crate::replication::{Router, WriteResponse};
use crate::store::WriteRecord;

/// One attempted delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub from: NodeAddress,
    pub to: NodeAddress,
    pub record: WriteRecord,
}

/// In-process transport
#[derive(Default)]
pub struct LoopbackTransport {
    routers: RwLock<HashMap<NodeAddress, Weak<Router>>>,
    unreachable: RwLock<HashSet<NodeAddress>>,
    deliveries: Mutex<Vec<Delivery>>,
}

impl LoopbackTransport {
    /// Create an empty transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `router` reachable at its address
    pub async fn register(&self, router: &Arc<Router>) {
        self.routers
            .write()
            .await
            .insert(router.address().clone(), Arc::downgrade(router));
    }

    pub async fn unregister(&self, address: &NodeAddress) {
        self.routers.write().await.remove(address);
    }

    /// Drop (or restore) every delivery to `address`
    pub async fn set_unreachable(&self, address: &NodeAddress, unreachable: bool) {
        let mut set = self.unreachable.write().await;
        if unreachable {
            set.insert(address.clone());
        } else {
            set.remove(address);
        }
    }

    /// Deliveries attempted so far, including failed ones
    pub async fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().await.clone()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send_write(
        &self,
        target: &NodeAddress,
        record: &WriteRecord,
        from: &NodeAddress,
    ) -> Result<WriteResponse> {
        self.deliveries.lock().await.push(Delivery {
            from: from.clone(),
            to: target.clone(),
            record: record.clone(),
        });

        if self.unreachable.read().await.contains(target) {
            return Err(Error::Network(format!("{} is unreachable", target)));
        }

        let router = self
            .routers
            .read()
            .await
            .get(target)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::Network(format!("no node listening at {}", target)))?;

        router.handle_write(record.clone(), Some(from.clone())).await
    }
}
