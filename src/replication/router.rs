//! Write Router
//!
//! Decides, per incoming write, whether this node applies it as leader and
//! fans it out, applies it as a replica, or forwards it once to the leader.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::task::TaskTracker;

use crate::error::{Error, Result};
use crate::id::NodeAddress;
use crate::network::Transport;
use crate::state::{LeaderDirectory, LeadershipState, MembershipRegistry};
use crate::store::{RecordStore, WriteRecord};

/// How a write was handled by the node that answered it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStatus {
    /// Applied here as leader and fanned out to followers
    AppliedAsLeader,
    /// Sent on to the leader
    Forwarded,
    /// Applied here as a replica of the leader's write
    AppliedAsReplica,
}

/// Write acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteResponse {
    pub success: bool,
    pub status: WriteStatus,
    pub message: String,
    /// Leader address as known to the answering node
    pub leader: Option<String>,
    /// Followers a leader fanned out to
    #[serde(default)]
    pub followers: usize,
}

/// Routes writes between the local store, the leader and the followers
pub struct Router {
    address: NodeAddress,
    leadership: watch::Receiver<LeadershipState>,
    directory: Arc<LeaderDirectory>,
    membership: Arc<MembershipRegistry>,
    store: Arc<dyn RecordStore>,
    transport: Arc<dyn Transport>,
    /// Outstanding fan-out deliveries
    fanout: TaskTracker,
    accepting: AtomicBool,
}

impl Router {
    /// Create a new router
    pub fn new(
        address: NodeAddress,
        leadership: watch::Receiver<LeadershipState>,
        directory: Arc<LeaderDirectory>,
        membership: Arc<MembershipRegistry>,
        store: Arc<dyn RecordStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            address,
            leadership,
            directory,
            membership,
            store,
            transport,
            fanout: TaskTracker::new(),
            accepting: AtomicBool::new(true),
        }
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Whether this node holds leadership right now
    pub fn is_leader(&self) -> bool {
        *self.leadership.borrow() == LeadershipState::Leader
    }

    /// Current leadership state
    pub fn leadership_state(&self) -> LeadershipState {
        *self.leadership.borrow()
    }

    /// Leader address from the directory
    pub async fn leader(&self) -> Result<NodeAddress> {
        self.directory.read().await
    }

    /// Handle a write, optionally tagged with the address that sent it
    pub async fn handle_write(
        &self,
        record: WriteRecord,
        request_from: Option<NodeAddress>,
    ) -> Result<WriteResponse> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        if self.is_leader() {
            return Ok(self.apply_as_leader(record).await);
        }

        let leader = self.directory.read().await.map_err(|e| {
            tracing::warn!("Cannot route write {}: {}", record.id, e);
            match e {
                Error::NotYetElected => Error::NotYetElected,
                other => Error::Routing(format!("leader unknown: {}", other)),
            }
        })?;

        // A delivery from the leader is applied and never sent on again
        if request_from.as_ref() == Some(&leader) {
            self.store.append(record.clone()).await;
            tracing::debug!("Applied replica of write {} from leader {}", record.id, leader);
            return Ok(WriteResponse {
                success: true,
                status: WriteStatus::AppliedAsReplica,
                message: format!("Replicated write {} from leader {}", record.id, leader),
                leader: Some(leader.to_string()),
                followers: 0,
            });
        }

        if leader == self.address {
            // Our own address is still published but we no longer lead
            return Err(Error::Routing(format!(
                "leader record names {} which is not leading",
                leader
            )));
        }

        tracing::debug!("Forwarding write {} to leader {}", record.id, leader);
        self.transport
            .send_write(&leader, &record, &self.address)
            .await
            .map_err(|e| {
                tracing::warn!("Failed to forward write {} to leader {}: {}", record.id, leader, e);
                Error::Routing(format!("leader {} unreachable: {}", leader, e))
            })?;

        Ok(WriteResponse {
            success: true,
            status: WriteStatus::Forwarded,
            message: format!("Forwarded write {} to leader {}", record.id, leader),
            leader: Some(leader.to_string()),
            followers: 0,
        })
    }

    async fn apply_as_leader(&self, record: WriteRecord) -> WriteResponse {
        self.store.append(record.clone()).await;

        let followers: Vec<NodeAddress> = self
            .membership
            .list_addresses()
            .await
            .into_iter()
            .filter(|address| *address != self.address)
            .collect();

        for follower in &followers {
            self.replicate(follower.clone(), record.clone());
        }

        tracing::debug!(
            "Applied write {} as leader, replicating to {} follower(s)",
            record.id,
            followers.len()
        );

        WriteResponse {
            success: true,
            status: WriteStatus::AppliedAsLeader,
            message: format!(
                "Applied write {} on leader {}, replicating to {} follower(s)",
                record.id,
                self.address,
                followers.len()
            ),
            leader: Some(self.address.to_string()),
            followers: followers.len(),
        }
    }

    /// Deliver one record to one follower in the background
    ///
    /// Failures are logged and dropped; nothing is retried.
    fn replicate(&self, follower: NodeAddress, record: WriteRecord) {
        let transport = Arc::clone(&self.transport);
        let from = self.address.clone();
        self.fanout.spawn(async move {
            if let Err(e) = transport.send_write(&follower, &record, &from).await {
                let failure = Error::ReplicationDelivery {
                    address: follower.to_string(),
                    reason: e.to_string(),
                };
                tracing::warn!("{}", failure);
            }
        });
    }

    /// Refuse new writes from now on
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Wait for outstanding fan-out deliveries
    pub async fn drain(&self) {
        self.fanout.close();
        self.fanout.wait().await;
    }

    /// Number of fan-out deliveries still running
    pub fn pending_deliveries(&self) -> usize {
        self.fanout.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{CoordinationBackend, CoordinationClient, Ensemble, ExponentialBackoff};
    use crate::id::NodeIdentity;
    use crate::network::LoopbackTransport;
    use crate::store::VolatileStore;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// A router whose leadership state is driven by the test
    struct Harness {
        router: Arc<Router>,
        store: Arc<VolatileStore>,
        directory: Arc<LeaderDirectory>,
        leadership: watch::Sender<LeadershipState>,
    }

    async fn harness(
        ensemble: &Arc<Ensemble>,
        transport: &Arc<LoopbackTransport>,
        port: &str,
    ) -> Harness {
        let backend: Arc<dyn CoordinationBackend> = ensemble.clone();
        let client = Arc::new(CoordinationClient::new(
            backend,
            ExponentialBackoff::new(Duration::from_millis(5), 2),
            Duration::from_secs(5),
        ));
        let (tx, _rx) = mpsc::unbounded_channel();
        client.connect(tx).await.unwrap();

        let address = NodeAddress::parse(port).unwrap();
        let directory = Arc::new(LeaderDirectory::new(Arc::clone(&client), "/leader-port"));
        let membership = Arc::new(MembershipRegistry::new(
            Arc::clone(&client),
            "/workers",
            NodeIdentity::generate(),
        ));
        membership.register(&address).await.unwrap();

        let store = Arc::new(VolatileStore::new());
        let (leadership, rx) = watch::channel(LeadershipState::Follower);
        let transport_dyn: Arc<dyn Transport> = transport.clone();
        let router = Arc::new(Router::new(
            address,
            rx,
            Arc::clone(&directory),
            membership,
            store.clone(),
            transport_dyn,
        ));
        transport.register(&router).await;

        Harness {
            router,
            store,
            directory,
            leadership,
        }
    }

    /// Three routers, the first of them leader
    async fn cluster() -> (Arc<LoopbackTransport>, Vec<Harness>) {
        let ensemble = Arc::new(Ensemble::new());
        let transport = Arc::new(LoopbackTransport::new());
        let mut nodes = Vec::new();
        for port in ["8081", "8082", "8083"] {
            nodes.push(harness(&ensemble, &transport, port).await);
        }
        nodes[0].leadership.send_replace(LeadershipState::Leader);
        nodes[0]
            .directory
            .publish(&NodeAddress::parse("8081").unwrap())
            .await
            .unwrap();
        (transport, nodes)
    }

    fn addr(raw: &str) -> NodeAddress {
        NodeAddress::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_leader_applies_and_fans_out() {
        let (transport, nodes) = cluster().await;

        let response = nodes[0]
            .router
            .handle_write(WriteRecord::new(1, "Alice"), None)
            .await
            .unwrap();
        assert_eq!(response.status, WriteStatus::AppliedAsLeader);
        assert_eq!(response.followers, 2);
        nodes[0].router.drain().await;

        for node in &nodes {
            assert_eq!(node.store.list().await, vec![WriteRecord::new(1, "Alice")]);
        }
        // Exactly one delivery per follower, none bounced back
        assert_eq!(transport.deliveries().await.len(), 2);
    }

    #[tokio::test]
    async fn test_replica_from_leader_is_not_forwarded() {
        let (transport, nodes) = cluster().await;

        let response = nodes[1]
            .router
            .handle_write(WriteRecord::new(2, "Bob"), Some(addr("8081")))
            .await
            .unwrap();
        assert_eq!(response.status, WriteStatus::AppliedAsReplica);
        assert_eq!(nodes[1].store.len().await, 1);
        assert!(nodes[0].store.is_empty().await);
        assert!(transport.deliveries().await.is_empty());
    }

    #[tokio::test]
    async fn test_follower_forwards_exactly_once() {
        let (transport, nodes) = cluster().await;

        // No provenance, then a foreign one: both are client writes
        for from in [None, Some(addr("8083"))] {
            let response = nodes[1]
                .router
                .handle_write(WriteRecord::new(3, "Carol"), from)
                .await
                .unwrap();
            assert_eq!(response.status, WriteStatus::Forwarded);
            assert_eq!(response.leader.as_deref(), Some("8081"));
        }
        nodes[0].router.drain().await;

        let to_leader = transport
            .deliveries()
            .await
            .into_iter()
            .filter(|d| d.to == addr("8081"))
            .count();
        assert_eq!(to_leader, 2);
        assert_eq!(nodes[0].store.len().await, 2);
        assert_eq!(nodes[1].store.len().await, 2);
        assert_eq!(nodes[2].store.len().await, 2);
    }

    #[tokio::test]
    async fn test_unknown_leader_is_not_yet_elected() {
        let ensemble = Arc::new(Ensemble::new());
        let transport = Arc::new(LoopbackTransport::new());
        let node = harness(&ensemble, &transport, "8082").await;

        let err = node
            .router
            .handle_write(WriteRecord::new(1, "Alice"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotYetElected));
        assert!(node.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_unreachable_leader_is_a_routing_failure() {
        let (transport, nodes) = cluster().await;
        transport.set_unreachable(&addr("8081"), true).await;

        let err = nodes[2]
            .router
            .handle_write(WriteRecord::new(1, "Alice"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Routing(_)));
    }

    #[tokio::test]
    async fn test_failed_follower_does_not_fail_write() {
        let (transport, nodes) = cluster().await;
        transport.set_unreachable(&addr("8083"), true).await;

        let response = nodes[0]
            .router
            .handle_write(WriteRecord::new(1, "Alice"), None)
            .await
            .unwrap();
        assert!(response.success);
        nodes[0].router.drain().await;

        assert_eq!(nodes[1].store.len().await, 1);
        assert!(nodes[2].store.is_empty().await);
    }

    #[tokio::test]
    async fn test_stale_self_leader_record() {
        let (_transport, nodes) = cluster().await;
        nodes[0].leadership.send_replace(LeadershipState::Candidate);

        let err = nodes[0]
            .router
            .handle_write(WriteRecord::new(1, "Alice"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Routing(_)));
    }

    #[tokio::test]
    async fn test_stop_accepting() {
        let (_transport, nodes) = cluster().await;
        nodes[0].router.stop_accepting();
        assert!(!nodes[0].router.is_accepting());

        let err = nodes[0]
            .router
            .handle_write(WriteRecord::new(1, "Alice"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShuttingDown));
    }
}
