//! WolfPack Node
//!
//! Assembles one cluster node: the coordination session, membership entry,
//! leadership loop and write router, and tears them down in order.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::AppState;
use crate::config::WolfPackConfig;
use crate::coordination::{CoordinationBackend, CoordinationClient};
use crate::error::Result;
use crate::id::{NodeAddress, NodeIdentity};
use crate::network::Transport;
use crate::replication::Router;
use crate::state::{LeaderDirectory, LeadershipManager, LeadershipState, MembershipRegistry};
use crate::store::RecordStore;

/// A running cluster node
pub struct Node {
    identity: NodeIdentity,
    address: NodeAddress,
    client: Arc<CoordinationClient>,
    directory: Arc<LeaderDirectory>,
    membership: Arc<MembershipRegistry>,
    leadership: Arc<LeadershipManager>,
    router: Arc<Router>,
    leadership_loop: Mutex<Option<JoinHandle<()>>>,
    /// Cancelled once the node has stopped
    shutdown: CancellationToken,
}

impl Node {
    /// Join the cluster
    ///
    /// Connects to the coordination service, registers this node's address,
    /// starts the leadership loop and enters the election. A failed
    /// registration is logged and the node keeps running unregistered; any
    /// later failure closes the session before returning.
    pub async fn start(
        config: WolfPackConfig,
        backend: Arc<dyn CoordinationBackend>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn RecordStore>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let address = config.node_address()?;
        let identity = NodeIdentity::generate();
        tracing::info!("Starting node {} as candidate {}", address, identity);

        let client = Arc::new(CoordinationClient::new(
            backend,
            config.retry_policy(),
            config.session_timeout(),
        ));
        let directory = Arc::new(LeaderDirectory::new(
            Arc::clone(&client),
            config.coordination.leader_path.clone(),
        ));
        let membership = Arc::new(MembershipRegistry::new(
            Arc::clone(&client),
            config.coordination.members_path.clone(),
            identity.clone(),
        ));
        let leadership = Arc::new(LeadershipManager::new(
            identity.clone(),
            address.clone(),
            config.election(),
            Arc::clone(&client),
            Arc::clone(&directory),
            Arc::clone(&membership),
        ));

        client.connect(leadership.event_sender()).await?;

        if let Err(e) = membership.register(&address).await {
            tracing::error!("{}; continuing without fan-out traffic", e);
        }

        let leadership_loop = match leadership.spawn().await {
            Ok(handle) => handle,
            Err(e) => {
                client.close().await;
                return Err(e);
            }
        };

        let router = Arc::new(Router::new(
            address.clone(),
            leadership.subscribe(),
            Arc::clone(&directory),
            Arc::clone(&membership),
            store,
            transport,
        ));

        if let Err(e) = leadership.start_election().await {
            tracing::error!("Failed to join election: {}; leaving the cluster", e);
            leadership_loop.abort();
            leadership.halt().await;
            client.close().await;
            return Err(e);
        }

        Ok(Arc::new(Self {
            identity,
            address,
            client,
            directory,
            membership,
            leadership,
            router,
            leadership_loop: Mutex::new(Some(leadership_loop)),
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn leadership(&self) -> &Arc<LeadershipManager> {
        &self.leadership
    }

    pub fn membership(&self) -> &Arc<MembershipRegistry> {
        &self.membership
    }

    pub fn directory(&self) -> &Arc<LeaderDirectory> {
        &self.directory
    }

    pub fn client(&self) -> &Arc<CoordinationClient> {
        &self.client
    }

    /// Check if this node is the leader
    pub fn is_leader(&self) -> bool {
        self.leadership.is_leader()
    }

    pub fn state(&self) -> LeadershipState {
        self.leadership.state()
    }

    /// Shared state for the HTTP API
    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            router: Arc::clone(&self.router),
            leadership: Arc::clone(&self.leadership),
            membership: Arc::clone(&self.membership),
        })
    }

    /// Token cancelled once the node has stopped
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Leave the cluster cleanly
    ///
    /// Stops taking writes, releases leadership so the coordination service
    /// can elect a successor, waits for in-flight fan-out, then closes the
    /// session (which removes the membership entry).
    pub async fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        tracing::info!("Closing node {}", self.address);

        self.router.stop_accepting();

        self.leadership.close();
        if let Some(handle) = self.leadership_loop.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!("Leadership loop ended abnormally: {}", e);
            }
        }

        self.router.drain().await;
        self.client.close().await;
        self.shutdown.cancel();
        tracing::info!("Node {} closed", self.address);
    }

    /// Stop abruptly, as if the process died
    ///
    /// The session is not closed; the coordination service expires it after
    /// the session timeout and only then elects a successor.
    pub async fn abort(&self) {
        tracing::warn!("Aborting node {}", self.address);
        self.router.stop_accepting();
        self.client.abort().await;
        if let Some(handle) = self.leadership_loop.lock().await.take() {
            handle.abort();
        }
        self.leadership.halt().await;
        self.shutdown.cancel();
    }
}
