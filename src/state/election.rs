//! Leader Election
//!
//! Runs the per-node leadership state machine on top of the coordination
//! service's election queue. Leadership is session-bound: it is held by a
//! lease task owning a cancellation token, and every coordination event
//! (election outcome, session trouble, shutdown) arrives on one ordered
//! channel processed by a single loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::coordination::CoordinationClient;
use crate::error::{Error, Result};
use crate::id::{NodeAddress, NodeIdentity};
use crate::state::{LeaderDirectory, MembershipRegistry};

/// Leadership state of this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadershipState {
    /// Constructed, not yet a candidate
    Initializing,
    /// Queued for leadership, outcome not known yet
    Candidate,
    /// Another node holds leadership
    Follower,
    /// This node holds leadership and has published its address
    Leader,
    /// Shut down
    Closed,
}

impl std::fmt::Display for LeadershipState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeadershipState::Initializing => write!(f, "INITIALIZING"),
            LeadershipState::Candidate => write!(f, "CANDIDATE"),
            LeadershipState::Follower => write!(f, "FOLLOWER"),
            LeadershipState::Leader => write!(f, "LEADER"),
            LeadershipState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Input to the leadership loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipEvent {
    /// Our candidate reached the head of the election queue
    Elected,
    /// Our candidate is queued behind `leader`
    Standby { leader: Option<String> },
    /// Heartbeats are failing
    SessionSuspended,
    /// The session recovered or was replaced
    SessionReconnected,
    /// The session expired
    SessionLost,
    /// The lease for `term` found leadership gone
    Revoked { term: u64 },
    /// Shut down
    Closed,
}

/// Election configuration
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Election queue path
    pub election_path: String,
    /// How often a leader re-confirms it still heads the queue
    pub lease_check_interval: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            election_path: "/leader-election".to_string(),
            lease_check_interval: Duration::from_millis(1000),
        }
    }
}

/// Leadership manager for a single node
pub struct LeadershipManager {
    /// Candidate id
    identity: NodeIdentity,
    /// Address published while leader
    address: NodeAddress,
    config: ElectionConfig,
    client: Arc<CoordinationClient>,
    directory: Arc<LeaderDirectory>,
    membership: Arc<MembershipRegistry>,
    state_tx: watch::Sender<LeadershipState>,
    events_tx: mpsc::UnboundedSender<LeadershipEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<LeadershipEvent>>>,
    /// Terms won by this node
    term: AtomicU64,
    /// Cancels the lease holder of the current term
    lease: Mutex<Option<CancellationToken>>,
}

impl LeadershipManager {
    /// Create a new leadership manager
    pub fn new(
        identity: NodeIdentity,
        address: NodeAddress,
        config: ElectionConfig,
        client: Arc<CoordinationClient>,
        directory: Arc<LeaderDirectory>,
        membership: Arc<MembershipRegistry>,
    ) -> Self {
        let (state_tx, _) = watch::channel(LeadershipState::Initializing);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            identity,
            address,
            config,
            client,
            directory,
            membership,
            state_tx,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            term: AtomicU64::new(0),
            lease: Mutex::new(None),
        }
    }

    /// Sender feeding this manager's event loop
    pub fn event_sender(&self) -> mpsc::UnboundedSender<LeadershipEvent> {
        self.events_tx.clone()
    }

    /// Start the event loop; it runs until a `Closed` event
    pub async fn spawn(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let events = self
            .events_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Internal("leadership loop already running".into()))?;
        Ok(tokio::spawn(Arc::clone(self).run(events)))
    }

    /// Join the election
    ///
    /// Returns once the candidacy is queued; the outcome arrives as an event.
    pub async fn start_election(&self) -> Result<()> {
        if self.state() == LeadershipState::Initializing {
            self.transition(LeadershipState::Candidate);
        }
        self.client
            .join_election(&self.config.election_path, self.identity.as_str())
            .await?;
        tracing::info!(
            "Joined election {} as candidate {} ({})",
            self.config.election_path,
            self.identity,
            self.address
        );
        Ok(())
    }

    /// Current state
    pub fn state(&self) -> LeadershipState {
        *self.state_tx.borrow()
    }

    /// Check if this node currently holds leadership
    pub fn is_leader(&self) -> bool {
        self.state() == LeadershipState::Leader
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.state_tx.subscribe()
    }

    /// Number of terms this node has won
    pub fn term(&self) -> u64 {
        self.term.load(Ordering::SeqCst)
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Ask the loop to release leadership and stop
    pub fn close(&self) {
        let _ = self.events_tx.send(LeadershipEvent::Closed);
    }

    /// Stop without resigning; the candidacy goes when the session expires
    pub async fn halt(&self) {
        self.release_lease().await;
        self.transition(LeadershipState::Closed);
    }

    fn transition(&self, next: LeadershipState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            tracing::info!("Leadership state {} -> {}", previous, next);
        }
    }

    async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<LeadershipEvent>) {
        while let Some(event) = events.recv().await {
            tracing::debug!("Leadership event {:?} in state {}", event, self.state());
            match event {
                LeadershipEvent::Elected => self.on_elected().await,
                LeadershipEvent::Standby { leader } => {
                    if self.state() == LeadershipState::Candidate {
                        tracing::info!(
                            "Standing by, leader candidate is {}",
                            leader.as_deref().unwrap_or("unknown")
                        );
                        self.transition(LeadershipState::Follower);
                    }
                }
                LeadershipEvent::SessionSuspended => {
                    self.step_down("coordination session suspended", true).await;
                }
                LeadershipEvent::Revoked { term } => {
                    if self.is_leader() && term == self.term() {
                        self.step_down("leadership revoked", true).await;
                    }
                }
                LeadershipEvent::SessionLost => {
                    // The session took our candidacy with it
                    self.step_down("coordination session lost", false).await;
                }
                LeadershipEvent::SessionReconnected => self.on_reconnected().await,
                LeadershipEvent::Closed => {
                    self.on_closed().await;
                    break;
                }
            }
        }
        tracing::debug!("Leadership loop for {} stopped", self.identity);
    }

    async fn on_elected(&self) {
        match self.state() {
            LeadershipState::Candidate | LeadershipState::Follower => {}
            _ => return,
        }

        match self.client.has_leadership(&self.config.election_path).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("Ignoring stale election notice");
                return;
            }
            Err(e) => {
                tracing::warn!("Could not confirm leadership: {}", e);
                self.give_up_term().await;
                return;
            }
        }

        if let Err(e) = self.directory.publish(&self.address).await {
            tracing::error!("Failed to publish leader address {}: {}", self.address, e);
            self.give_up_term().await;
            return;
        }

        let term = self.term.fetch_add(1, Ordering::SeqCst) + 1;
        self.hold_lease(term).await;
        self.transition(LeadershipState::Leader);
        tracing::info!("Node {} is now leader (term {})", self.address, term);

        match self.client.participants(&self.config.election_path).await {
            Ok(participants) => {
                let ids: Vec<String> = participants
                    .iter()
                    .map(|p| {
                        if p.is_leader {
                            format!("{}*", p.id)
                        } else {
                            p.id.clone()
                        }
                    })
                    .collect();
                tracing::info!("Election participants: {}", ids.join(", "));
            }
            Err(e) => tracing::debug!("Could not list election participants: {}", e),
        }
    }

    /// Requeue after a failed takeover
    ///
    /// Waits one retry delay first; a lone candidate is re-elected as soon as
    /// it requeues, so a persistent failure would otherwise spin.
    async fn give_up_term(&self) {
        self.transition(LeadershipState::Candidate);
        let delay = self.client.retry_delay();
        tracing::debug!("Requeueing for leadership in {:?}", delay);
        tokio::time::sleep(delay).await;
        self.resign(true).await;
    }

    /// Start the lease holder for `term`
    ///
    /// The task lives exactly as long as the term and emits `Revoked` if the
    /// coordination service no longer names us head of the queue.
    async fn hold_lease(&self, term: u64) {
        let token = CancellationToken::new();
        if let Some(previous) = self.lease.lock().await.replace(token.clone()) {
            previous.cancel();
        }

        let client = Arc::clone(&self.client);
        let path = self.config.election_path.clone();
        let interval = self.config.lease_check_interval;
        let events = self.events_tx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match client.has_leadership(&path).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!("Lease check: leadership for term {} is gone", term);
                        let _ = events.send(LeadershipEvent::Revoked { term });
                        break;
                    }
                    Err(e) if e.is_session_loss() => {
                        let _ = events.send(LeadershipEvent::Revoked { term });
                        break;
                    }
                    Err(e) => tracing::debug!("Lease check failed: {}", e),
                }
            }
        });
    }

    async fn release_lease(&self) {
        if let Some(token) = self.lease.lock().await.take() {
            token.cancel();
        }
    }

    /// Drop back to candidate, resigning first if we were leader
    async fn step_down(&self, reason: &str, requeue: bool) {
        let was_leader = self.is_leader();
        match self.state() {
            LeadershipState::Closed | LeadershipState::Initializing => return,
            _ => {}
        }

        self.transition(LeadershipState::Candidate);
        self.release_lease().await;

        if was_leader {
            tracing::warn!("Giving up leadership: {}", reason);
            if requeue {
                self.resign(true).await;
            }
        } else {
            tracing::info!("Back to candidate: {}", reason);
        }
    }

    /// Leave the election queue, optionally rejoining at the back
    async fn resign(&self, requeue: bool) {
        if let Err(e) = self
            .client
            .leave_election(&self.config.election_path, requeue)
            .await
        {
            tracing::warn!("Failed to leave election {}: {}", self.config.election_path, e);
        }
    }

    async fn on_reconnected(&self) {
        match self.state() {
            LeadershipState::Closed | LeadershipState::Initializing => return,
            LeadershipState::Leader => self.step_down("session reconnected", true).await,
            _ => self.transition(LeadershipState::Candidate),
        }

        if let Err(e) = self.membership.register(&self.address).await {
            tracing::error!("Re-registration failed, running unregistered: {}", e);
        }

        if let Err(e) = self.start_election().await {
            tracing::error!("Failed to rejoin election: {}", e);
            return;
        }

        // Joining is idempotent on a surviving session, so no fresh notice
        // arrives if we kept our place in the queue
        match self.client.has_leadership(&self.config.election_path).await {
            Ok(true) => self.on_elected().await,
            Ok(false) => {
                if self.state() == LeadershipState::Candidate {
                    self.transition(LeadershipState::Follower);
                }
            }
            Err(e) => tracing::warn!("Could not check leadership after reconnect: {}", e),
        }
    }

    async fn on_closed(&self) {
        let was_leader = self.is_leader();
        self.transition(LeadershipState::Closed);
        self.release_lease().await;
        if was_leader {
            tracing::info!("Releasing leadership on shutdown");
        }
        self.resign(false).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::testing::FaultyBackend;
    use crate::coordination::{CoordinationBackend, Ensemble, ExponentialBackoff};
    use std::sync::atomic::AtomicBool;

    struct TestNode {
        client: Arc<CoordinationClient>,
        manager: Arc<LeadershipManager>,
        directory: Arc<LeaderDirectory>,
        session: crate::coordination::SessionId,
        handle: JoinHandle<()>,
    }

    async fn start_node(ensemble: &Arc<Ensemble>, port: &str, timeout: Duration) -> TestNode {
        let backend: Arc<dyn CoordinationBackend> = ensemble.clone();
        start_node_on(backend, port, timeout).await
    }

    async fn start_node_on(
        backend: Arc<dyn CoordinationBackend>,
        port: &str,
        timeout: Duration,
    ) -> TestNode {
        let client = Arc::new(CoordinationClient::new(
            backend,
            ExponentialBackoff::new(Duration::from_millis(5), 2),
            timeout,
        ));
        let identity = NodeIdentity::generate();
        let address = NodeAddress::parse(port).unwrap();
        let directory = Arc::new(LeaderDirectory::new(Arc::clone(&client), "/leader-port"));
        let membership = Arc::new(MembershipRegistry::new(
            Arc::clone(&client),
            "/workers",
            identity.clone(),
        ));
        let manager = Arc::new(LeadershipManager::new(
            identity,
            address.clone(),
            ElectionConfig {
                election_path: "/leader-election".into(),
                lease_check_interval: Duration::from_millis(20),
            },
            Arc::clone(&client),
            Arc::clone(&directory),
            Arc::clone(&membership),
        ));

        let session = client.connect(manager.event_sender()).await.unwrap();
        membership.register(&address).await.unwrap();
        let handle = manager.spawn().await.unwrap();
        manager.start_election().await.unwrap();

        TestNode {
            client,
            manager,
            directory,
            session,
            handle,
        }
    }

    async fn wait_for_state(manager: &LeadershipManager, want: LeadershipState) {
        let mut rx = manager.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
            .await
            .expect("timed out waiting for state")
            .unwrap();
    }

    #[tokio::test]
    async fn test_single_node_becomes_leader_and_publishes() {
        let ensemble = Arc::new(Ensemble::new());
        let node = start_node(&ensemble, "8081", Duration::from_secs(5)).await;

        wait_for_state(&node.manager, LeadershipState::Leader).await;
        assert!(node.manager.is_leader());
        assert_eq!(node.manager.term(), 1);
        assert_eq!(node.directory.read().await.unwrap().as_str(), "8081");
    }

    #[tokio::test]
    async fn test_second_node_follows() {
        let ensemble = Arc::new(Ensemble::new());
        let first = start_node(&ensemble, "8081", Duration::from_secs(5)).await;
        wait_for_state(&first.manager, LeadershipState::Leader).await;

        let second = start_node(&ensemble, "8082", Duration::from_secs(5)).await;
        wait_for_state(&second.manager, LeadershipState::Follower).await;
        assert!(!second.manager.is_leader());
        assert_eq!(second.directory.read().await.unwrap().as_str(), "8081");
    }

    #[tokio::test]
    async fn test_expired_leader_hands_over() {
        let ensemble = Arc::new(Ensemble::new());
        let first = start_node(&ensemble, "8081", Duration::from_secs(5)).await;
        wait_for_state(&first.manager, LeadershipState::Leader).await;
        let second = start_node(&ensemble, "8082", Duration::from_secs(5)).await;
        wait_for_state(&second.manager, LeadershipState::Follower).await;

        // Stop the first node's heartbeats and drop its session
        first.client.abort().await;
        ensemble.expire_session(first.session).await;

        wait_for_state(&second.manager, LeadershipState::Leader).await;
        assert_eq!(second.directory.read().await.unwrap().as_str(), "8082");

        // The old leader's lease notices the session is gone
        wait_for_state(&first.manager, LeadershipState::Candidate).await;
    }

    #[tokio::test]
    async fn test_suspended_leader_steps_down_and_recovers() {
        let ensemble = Arc::new(Ensemble::new());
        let node = start_node(&ensemble, "8081", Duration::from_millis(150)).await;
        wait_for_state(&node.manager, LeadershipState::Leader).await;

        ensemble.set_available(false);
        wait_for_state(&node.manager, LeadershipState::Candidate).await;
        assert!(!node.manager.is_leader());

        ensemble.set_available(true);
        wait_for_state(&node.manager, LeadershipState::Leader).await;
        assert!(node.manager.term() >= 2);
    }

    #[tokio::test]
    async fn test_close_releases_leadership() {
        let ensemble = Arc::new(Ensemble::new());
        let first = start_node(&ensemble, "8081", Duration::from_secs(5)).await;
        wait_for_state(&first.manager, LeadershipState::Leader).await;
        let second = start_node(&ensemble, "8082", Duration::from_secs(5)).await;
        wait_for_state(&second.manager, LeadershipState::Follower).await;

        first.manager.close();
        first.handle.await.unwrap();
        assert_eq!(first.manager.state(), LeadershipState::Closed);

        wait_for_state(&second.manager, LeadershipState::Leader).await;
        assert_eq!(second.directory.read().await.unwrap().as_str(), "8082");

        // Events after close are not processed
        let _ = first.manager.event_sender().send(LeadershipEvent::Elected);
        assert_eq!(first.manager.state(), LeadershipState::Closed);
    }

    /// Record whether `manager` ever enters `Leader`
    fn watch_for_leader(manager: &LeadershipManager) -> Arc<AtomicBool> {
        let seen = Arc::new(AtomicBool::new(manager.is_leader()));
        let flag = Arc::clone(&seen);
        let mut rx = manager.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                if *rx.borrow_and_update() == LeadershipState::Leader {
                    flag.store(true, Ordering::SeqCst);
                }
            }
        });
        seen
    }

    #[tokio::test]
    async fn test_publish_failure_never_leads() {
        let ensemble = Arc::new(Ensemble::new());
        let backend = Arc::new(FaultyBackend::new(Arc::clone(&ensemble), "/leader-port"));
        backend.fail_writes.store(true, Ordering::SeqCst);

        let node = start_node_on(backend.clone(), "8081", Duration::from_secs(5)).await;
        let seen_leader = watch_for_leader(&node.manager);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!seen_leader.load(Ordering::SeqCst));
        assert_ne!(node.manager.state(), LeadershipState::Leader);
        assert_eq!(node.manager.term(), 0);
        assert!(matches!(node.directory.read().await, Err(Error::NotYetElected)));

        // Each failed takeover waits a retry delay (5ms) before requeueing
        let requeues = backend.leave_calls.load(Ordering::SeqCst);
        assert!(requeues >= 1, "never requeued");
        assert!(requeues <= 80, "requeued {} times in 300ms", requeues);

        backend.fail_writes.store(false, Ordering::SeqCst);
        wait_for_state(&node.manager, LeadershipState::Leader).await;
        assert_eq!(node.manager.term(), 1);
        assert_eq!(node.directory.read().await.unwrap().as_str(), "8081");
    }

    #[tokio::test]
    async fn test_failed_leadership_check_stays_candidate() {
        let ensemble = Arc::new(Ensemble::new());
        let backend = Arc::new(FaultyBackend::new(Arc::clone(&ensemble), "/leader-port"));
        backend.fail_leadership_check.store(true, Ordering::SeqCst);

        let node = start_node_on(backend.clone(), "8081", Duration::from_secs(5)).await;
        let seen_leader = watch_for_leader(&node.manager);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!seen_leader.load(Ordering::SeqCst));
        assert_eq!(node.manager.state(), LeadershipState::Candidate);
        assert_eq!(node.manager.term(), 0);
        assert!(node.directory.read().await.is_err());

        backend.fail_leadership_check.store(false, Ordering::SeqCst);
        wait_for_state(&node.manager, LeadershipState::Leader).await;
        assert_eq!(node.manager.term(), 1);
    }

    #[tokio::test]
    async fn test_spawn_twice_fails() {
        let ensemble = Arc::new(Ensemble::new());
        let node = start_node(&ensemble, "8081", Duration::from_secs(5)).await;
        assert!(node.manager.spawn().await.is_err());
    }
}
