//! Coordination Client
//!
//! Owns a node's coordination session: opens it with backoff, keeps it alive,
//! turns connection trouble into leadership events and re-establishes the
//! session after it expires. Every other component reaches the coordination
//! service through this adapter.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{
    parent_path, CoordinationBackend, CreateMode, ExponentialBackoff, Participant, SessionEvent,
    SessionId,
};
use crate::error::{Error, Result};
use crate::state::LeadershipEvent;

/// Long-poll window for session events
const EVENT_POLL_WAIT: Duration = Duration::from_secs(5);

/// Connection state of the session, as seen by this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected yet
    Disconnected,
    /// Session established
    Connected,
    /// Heartbeats are failing; the session may still be alive
    Suspended,
    /// Heartbeats recovered, or a new session replaced a lost one
    Reconnected,
    /// The session expired
    Lost,
    /// Closed by this node
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Suspended => write!(f, "SUSPENDED"),
            ConnectionState::Reconnected => write!(f, "RECONNECTED"),
            ConnectionState::Lost => write!(f, "LOST"),
            ConnectionState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Session-owning adapter over a [`CoordinationBackend`]
pub struct CoordinationClient {
    backend: Arc<dyn CoordinationBackend>,
    retry: ExponentialBackoff,
    session_timeout: Duration,
    session: RwLock<Option<SessionId>>,
    connection: RwLock<ConnectionState>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CoordinationClient {
    /// Create a client; nothing is opened until [`CoordinationClient::connect`]
    pub fn new(
        backend: Arc<dyn CoordinationBackend>,
        retry: ExponentialBackoff,
        session_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            retry,
            session_timeout,
            session: RwLock::new(None),
            connection: RwLock::new(ConnectionState::Disconnected),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Open the session and start the heartbeat and event tasks
    ///
    /// Election outcomes and connection changes are delivered on `events`.
    pub async fn connect(
        self: &Arc<Self>,
        events: mpsc::UnboundedSender<LeadershipEvent>,
    ) -> Result<SessionId> {
        let session = self
            .retry
            .retry("open session", || self.backend.open_session(self.session_timeout))
            .await?;
        *self.session.write().await = Some(session);
        *self.connection.write().await = ConnectionState::Connected;
        tracing::info!("Connected to coordination service (session {})", session);

        let heartbeat = tokio::spawn(Arc::clone(self).heartbeat_loop(events.clone()));
        let pump = tokio::spawn(Arc::clone(self).event_pump(events));
        self.tasks.lock().await.extend([heartbeat, pump]);

        Ok(session)
    }

    fn heartbeat_interval(&self) -> Duration {
        (self.session_timeout / 3).max(Duration::from_millis(1))
    }

    /// First-retry sleep of the retry policy
    pub fn retry_delay(&self) -> Duration {
        self.retry.delay_for(0)
    }

    /// Current session id
    pub async fn session_id(&self) -> Result<SessionId> {
        self.session
            .read()
            .await
            .ok_or_else(|| Error::CoordinationUnavailable("no coordination session".into()))
    }

    /// Current connection state
    pub async fn connection_state(&self) -> ConnectionState {
        *self.connection.read().await
    }

    async fn set_connection(&self, state: ConnectionState) {
        *self.connection.write().await = state;
    }

    async fn heartbeat_loop(self: Arc<Self>, events: mpsc::UnboundedSender<LeadershipEvent>) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(session) = *self.session.read().await else {
                continue;
            };

            // A heartbeat stuck past its interval counts as a failed one
            let beat = tokio::time::timeout(
                self.heartbeat_interval(),
                self.backend.heartbeat(session),
            )
            .await
            .unwrap_or_else(|_| Err(Error::CoordinationUnavailable("heartbeat timed out".into())));

            match beat {
                Ok(()) => {
                    if self.connection_state().await == ConnectionState::Suspended {
                        tracing::info!("Coordination session {} reconnected", session);
                        self.set_connection(ConnectionState::Reconnected).await;
                        let _ = events.send(LeadershipEvent::SessionReconnected);
                    }
                }
                Err(e) if e.is_session_loss() => {
                    tracing::warn!("Coordination session {} lost", session);
                    self.set_connection(ConnectionState::Lost).await;
                    let _ = events.send(LeadershipEvent::SessionLost);

                    match self.reestablish().await {
                        Some(_) => {
                            let _ = events.send(LeadershipEvent::SessionReconnected);
                        }
                        None => break,
                    }
                }
                Err(e) => {
                    if self.connection_state().await != ConnectionState::Suspended {
                        tracing::warn!("Coordination session {} suspended: {}", session, e);
                        self.set_connection(ConnectionState::Suspended).await;
                        let _ = events.send(LeadershipEvent::SessionSuspended);
                    }
                }
            }
        }
    }

    /// Open a replacement session, retrying until it works or we shut down
    async fn reestablish(&self) -> Option<SessionId> {
        let mut attempt = 0u32;
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            match self.backend.open_session(self.session_timeout).await {
                Ok(session) => {
                    *self.session.write().await = Some(session);
                    self.set_connection(ConnectionState::Reconnected).await;
                    tracing::info!("Opened replacement coordination session {}", session);
                    return Some(session);
                }
                Err(e) => {
                    let delay = self.retry.delay_for(attempt.min(self.retry.max_retries));
                    tracing::warn!("Failed to reopen coordination session: {} (retry in {:?})", e, delay);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn event_pump(self: Arc<Self>, events: mpsc::UnboundedSender<LeadershipEvent>) {
        loop {
            let session = *self.session.read().await;
            let polled = match session {
                Some(session) => tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    polled = self.backend.poll_events(session, EVENT_POLL_WAIT) => polled,
                },
                None => Ok(Vec::new()),
            };

            match polled {
                Ok(batch) => {
                    for event in batch {
                        let event = match event {
                            SessionEvent::Elected { .. } => LeadershipEvent::Elected,
                            SessionEvent::Standby { leader, .. } => LeadershipEvent::Standby { leader },
                        };
                        if events.send(event).is_err() {
                            return;
                        }
                    }
                    if session.is_none() {
                        tokio::select! {
                            _ = self.shutdown.cancelled() => break,
                            _ = tokio::time::sleep(self.heartbeat_interval()) => {}
                        }
                    }
                }
                Err(e) => {
                    // The heartbeat task owns state transitions; just back off
                    tracing::debug!("Event poll failed: {}", e);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.heartbeat_interval()) => {}
                    }
                }
            }
        }
    }

    /// Create a persistent path and any missing parents
    ///
    /// Check-then-create; losing the race to another node is fine.
    pub async fn create_path(&self, path: &str) -> Result<()> {
        let mut missing = Vec::new();
        let mut current = path;
        while current != "/" && !self.exists(current).await? {
            missing.push(current);
            current = parent_path(current);
        }

        for path in missing.into_iter().rev() {
            match self.create(path, Vec::new(), CreateMode::Persistent).await {
                Ok(()) | Err(Error::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Create a path tied to this node's session
    pub async fn create_ephemeral(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.create(path, data, CreateMode::Ephemeral).await
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<()> {
        let session = self.session_id().await?;
        self.retry
            .retry("create", || self.backend.create(session, path, data.clone(), mode))
            .await
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        self.retry.retry("exists", || self.backend.exists(path)).await
    }

    pub async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.retry
            .retry("get children", || self.backend.get_children(path))
            .await
    }

    pub async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        self.retry.retry("get data", || self.backend.get_data(path)).await
    }

    pub async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.retry
            .retry("set data", || self.backend.set_data(path, data.clone()))
            .await
    }

    /// Enter the election as `candidate_id`
    pub async fn join_election(&self, path: &str, candidate_id: &str) -> Result<()> {
        let session = self.session_id().await?;
        self.retry
            .retry("join election", || {
                self.backend.join_election(session, path, candidate_id)
            })
            .await
    }

    /// Leave the election; with `requeue` the node stays eligible for later terms
    pub async fn leave_election(&self, path: &str, requeue: bool) -> Result<()> {
        let session = self.session_id().await?;
        self.retry
            .retry("leave election", || {
                self.backend.leave_election(session, path, requeue)
            })
            .await
    }

    pub async fn has_leadership(&self, path: &str) -> Result<bool> {
        let session = self.session_id().await?;
        self.backend.has_leadership(session, path).await
    }

    pub async fn participants(&self, path: &str) -> Result<Vec<Participant>> {
        self.retry
            .retry("participants", || self.backend.participants(path))
            .await
    }

    /// Stop background tasks and close the session
    ///
    /// Ephemeral entries and candidacies owned by the session go with it.
    pub async fn close(&self) {
        self.stop_tasks().await;
        let session = self.session.write().await.take();
        if let Some(session) = session {
            match self.backend.close_session(session).await {
                Ok(()) => tracing::info!("Closed coordination session {}", session),
                Err(e) => tracing::warn!("Failed to close coordination session {}: {}", session, e),
            }
        }
        self.set_connection(ConnectionState::Closed).await;
    }

    /// Stop background tasks without closing the session
    ///
    /// The session is left to expire on the service side, as if the process
    /// had died.
    pub async fn abort(&self) {
        self.stop_tasks().await;
        self.set_connection(ConnectionState::Closed).await;
    }

    async fn stop_tasks(&self) {
        self.shutdown.cancel();
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}
