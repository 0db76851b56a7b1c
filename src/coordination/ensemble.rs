//! In-memory Coordination Ensemble
//!
//! A single-process implementation of [`CoordinationBackend`]. Multiple nodes
//! in one process can share an `Arc<Ensemble>`; the coordinator server wraps
//! one to serve nodes in other processes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use super::{
    parent_path, CoordinationBackend, CreateMode, Participant, SessionEvent, SessionId,
};
use crate::error::{Error, Result};

/// A stored path
struct ZNode {
    data: Vec<u8>,
    /// Owning session for ephemeral paths
    owner: Option<SessionId>,
}

/// Server-side session state
struct Session {
    timeout: Duration,
    last_seen: Instant,
    events: VecDeque<SessionEvent>,
    notify: Arc<Notify>,
}

/// Queued election candidate
struct Candidate {
    session: SessionId,
    id: String,
}

#[derive(Default)]
struct EnsembleState {
    next_session: SessionId,
    sessions: HashMap<SessionId, Session>,
    nodes: BTreeMap<String, ZNode>,
    elections: HashMap<String, VecDeque<Candidate>>,
}

impl EnsembleState {
    fn require_session(&self, session: SessionId) -> Result<()> {
        if self.sessions.contains_key(&session) {
            Ok(())
        } else {
            Err(Error::SessionExpired(session))
        }
    }

    fn push_event(&mut self, session: SessionId, event: SessionEvent) {
        if let Some(entry) = self.sessions.get_mut(&session) {
            entry.events.push_back(event);
            entry.notify.notify_one();
        }
    }

    fn head_of(&self, path: &str) -> Option<(SessionId, String)> {
        self.elections
            .get(path)
            .and_then(|queue| queue.front())
            .map(|c| (c.session, c.id.clone()))
    }

    /// Remove a session's candidate from an election queue
    ///
    /// When the removed candidate was the head, the new head is told it won.
    fn dequeue(&mut self, path: &str, session: SessionId, requeue: bool) {
        let Some(queue) = self.elections.get_mut(path) else {
            return;
        };
        let was_head = queue.front().map(|c| c.session) == Some(session);
        let Some(pos) = queue.iter().position(|c| c.session == session) else {
            return;
        };
        let candidate = queue.remove(pos);
        if requeue {
            if let Some(candidate) = candidate {
                queue.push_back(candidate);
            }
        }

        let head = self.head_of(path);
        if was_head {
            if let Some((head_session, head_id)) = &head {
                tracing::debug!("Election {} handed to candidate {}", path, head_id);
                self.push_event(
                    *head_session,
                    SessionEvent::Elected {
                        path: path.to_string(),
                    },
                );
            }
        }
        if requeue && head.as_ref().map(|(s, _)| *s) != Some(session) {
            self.push_event(
                session,
                SessionEvent::Standby {
                    path: path.to_string(),
                    leader: head.map(|(_, id)| id),
                },
            );
        }
    }

    /// Drop a session with everything it owns
    fn remove_session(&mut self, session: SessionId) -> bool {
        let Some(entry) = self.sessions.remove(&session) else {
            return false;
        };
        // Wake a pending poll so it observes the expiry
        entry.notify.notify_one();

        self.nodes.retain(|_, node| node.owner != Some(session));

        let paths: Vec<String> = self.elections.keys().cloned().collect();
        for path in paths {
            self.dequeue(&path, session, false);
        }
        true
    }
}

/// In-memory coordination service
pub struct Ensemble {
    state: Mutex<EnsembleState>,
    available: AtomicBool,
}

impl Default for Ensemble {
    fn default() -> Self {
        Self::new()
    }
}

impl Ensemble {
    /// Create an empty ensemble
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EnsembleState {
                next_session: 1,
                ..Default::default()
            }),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle availability; while unavailable every call fails with
    /// `CoordinationUnavailable`. Sessions still expire.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::CoordinationUnavailable(
                "ensemble is not serving requests".into(),
            ))
        }
    }

    /// Forcibly expire a session
    pub async fn expire_session(&self, session: SessionId) -> bool {
        let removed = self.state.lock().await.remove_session(session);
        if removed {
            tracing::info!("Session {} expired", session);
        }
        removed
    }

    /// Expire every session that missed its heartbeat deadline
    pub async fn reap_expired(&self) -> Vec<SessionId> {
        let mut state = self.state.lock().await;
        let expired: Vec<SessionId> = state
            .sessions
            .iter()
            .filter(|(_, s)| s.last_seen.elapsed() > s.timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            state.remove_session(*id);
            tracing::info!("Session {} expired (missed heartbeats)", id);
        }
        expired
    }

    /// Run [`Ensemble::reap_expired`] periodically
    ///
    /// The task stops once the ensemble is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let ensemble = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(ensemble) = ensemble.upgrade() else {
                    break;
                };
                ensemble.reap_expired().await;
            }
        })
    }

    /// Whether a session is still alive
    pub async fn is_alive(&self, session: SessionId) -> bool {
        self.state.lock().await.sessions.contains_key(&session)
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }
}

fn validate_path(path: &str) -> Result<()> {
    let valid = path.starts_with('/')
        && (path == "/" || !path.ends_with('/'))
        && !path.contains("//");
    if valid {
        Ok(())
    } else {
        Err(Error::Internal(format!("invalid coordination path '{}'", path)))
    }
}

#[async_trait]
impl CoordinationBackend for Ensemble {
    async fn open_session(&self, timeout: Duration) -> Result<SessionId> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let id = state.next_session;
        state.next_session += 1;
        state.sessions.insert(
            id,
            Session {
                timeout,
                last_seen: Instant::now(),
                events: VecDeque::new(),
                notify: Arc::new(Notify::new()),
            },
        );
        tracing::debug!("Opened session {} (timeout {:?})", id, timeout);
        Ok(id)
    }

    async fn heartbeat(&self, session: SessionId) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        match state.sessions.get_mut(&session) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                Ok(())
            }
            None => Err(Error::SessionExpired(session)),
        }
    }

    async fn close_session(&self, session: SessionId) -> Result<()> {
        self.check_available()?;
        if self.state.lock().await.remove_session(session) {
            tracing::debug!("Closed session {}", session);
        }
        Ok(())
    }

    async fn poll_events(&self, session: SessionId, wait: Duration) -> Result<Vec<SessionEvent>> {
        self.check_available()?;
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notify = {
                let mut state = self.state.lock().await;
                let entry = state
                    .sessions
                    .get_mut(&session)
                    .ok_or(Error::SessionExpired(session))?;
                if !entry.events.is_empty() {
                    return Ok(entry.events.drain(..).collect());
                }
                Arc::clone(&entry.notify)
            };

            if tokio::time::timeout_at(deadline, notify.notified()).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn create(
        &self,
        session: SessionId,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<()> {
        self.check_available()?;
        validate_path(path)?;
        if path == "/" {
            return Err(Error::NodeExists(path.to_string()));
        }

        let mut state = self.state.lock().await;
        state.require_session(session)?;
        if state.nodes.contains_key(path) {
            return Err(Error::NodeExists(path.to_string()));
        }
        let parent = parent_path(path);
        if parent != "/" && !state.nodes.contains_key(parent) {
            return Err(Error::NoNode(parent.to_string()));
        }

        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(session),
        };
        state.nodes.insert(path.to_string(), ZNode { data, owner });
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check_available()?;
        validate_path(path)?;
        if path == "/" {
            return Ok(true);
        }
        Ok(self.state.lock().await.nodes.contains_key(path))
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.check_available()?;
        validate_path(path)?;
        let state = self.state.lock().await;
        if path != "/" && !state.nodes.contains_key(path) {
            return Err(Error::NoNode(path.to_string()));
        }
        let children = state
            .nodes
            .keys()
            .filter(|key| parent_path(key) == path)
            .filter_map(|key| key.rsplit('/').next())
            .map(str::to_string)
            .collect();
        Ok(children)
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        self.check_available()?;
        validate_path(path)?;
        let state = self.state.lock().await;
        state
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| Error::NoNode(path.to_string()))
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.check_available()?;
        validate_path(path)?;
        let mut state = self.state.lock().await;
        match state.nodes.get_mut(path) {
            Some(node) => {
                node.data = data;
                Ok(())
            }
            None => Err(Error::NoNode(path.to_string())),
        }
    }

    async fn join_election(&self, session: SessionId, path: &str, candidate_id: &str) -> Result<()> {
        self.check_available()?;
        validate_path(path)?;
        let mut state = self.state.lock().await;
        state.require_session(session)?;

        let queue = state.elections.entry(path.to_string()).or_default();
        if queue.iter().any(|c| c.session == session) {
            return Ok(());
        }
        queue.push_back(Candidate {
            session,
            id: candidate_id.to_string(),
        });

        let event = match state.head_of(path) {
            Some((head, _)) if head == session => SessionEvent::Elected {
                path: path.to_string(),
            },
            head => SessionEvent::Standby {
                path: path.to_string(),
                leader: head.map(|(_, id)| id),
            },
        };
        tracing::debug!("Candidate {} joined election {}", candidate_id, path);
        state.push_event(session, event);
        Ok(())
    }

    async fn leave_election(&self, session: SessionId, path: &str, requeue: bool) -> Result<()> {
        self.check_available()?;
        validate_path(path)?;
        let mut state = self.state.lock().await;
        state.require_session(session)?;
        state.dequeue(path, session, requeue);
        Ok(())
    }

    async fn has_leadership(&self, session: SessionId, path: &str) -> Result<bool> {
        self.check_available()?;
        let state = self.state.lock().await;
        state.require_session(session)?;
        Ok(state.head_of(path).map(|(head, _)| head) == Some(session))
    }

    async fn participants(&self, path: &str) -> Result<Vec<Participant>> {
        self.check_available()?;
        let state = self.state.lock().await;
        let participants = state
            .elections
            .get(path)
            .map(|queue| {
                queue
                    .iter()
                    .enumerate()
                    .map(|(idx, c)| Participant {
                        id: c.id.clone(),
                        is_leader: idx == 0,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(participants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ELECTION: &str = "/leader-election";

    async fn drain(ensemble: &Ensemble, session: SessionId) -> Vec<SessionEvent> {
        ensemble
            .poll_events(session, Duration::from_millis(10))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_tree_semantics() {
        let ensemble = Ensemble::new();
        let s = ensemble.open_session(Duration::from_secs(5)).await.unwrap();

        // Parent must exist
        let err = ensemble
            .create(s, "/workers/8081", vec![], CreateMode::Ephemeral)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoNode(_)));

        ensemble
            .create(s, "/workers", vec![], CreateMode::Persistent)
            .await
            .unwrap();
        let err = ensemble
            .create(s, "/workers", vec![], CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NodeExists(_)));

        ensemble
            .create(s, "/workers/8081", b"a".to_vec(), CreateMode::Ephemeral)
            .await
            .unwrap();
        ensemble
            .create(s, "/workers/8082", b"b".to_vec(), CreateMode::Ephemeral)
            .await
            .unwrap();

        let mut children = ensemble.get_children("/workers").await.unwrap();
        children.sort();
        assert_eq!(children, vec!["8081", "8082"]);
        assert_eq!(ensemble.get_children("/").await.unwrap(), vec!["workers"]);

        ensemble.set_data("/workers", b"x".to_vec()).await.unwrap();
        assert_eq!(ensemble.get_data("/workers").await.unwrap(), b"x".to_vec());
        assert!(matches!(
            ensemble.get_data("/missing").await.unwrap_err(),
            Error::NoNode(_)
        ));
    }

    #[tokio::test]
    async fn test_ephemerals_vanish_with_session() {
        let ensemble = Ensemble::new();
        let a = ensemble.open_session(Duration::from_secs(5)).await.unwrap();
        let b = ensemble.open_session(Duration::from_secs(5)).await.unwrap();

        ensemble
            .create(a, "/workers", vec![], CreateMode::Persistent)
            .await
            .unwrap();
        ensemble
            .create(a, "/workers/8081", vec![], CreateMode::Ephemeral)
            .await
            .unwrap();
        ensemble
            .create(b, "/workers/8082", vec![], CreateMode::Ephemeral)
            .await
            .unwrap();

        ensemble.close_session(a).await.unwrap();

        // Persistent parent survives its creator
        assert!(ensemble.exists("/workers").await.unwrap());
        assert_eq!(ensemble.get_children("/workers").await.unwrap(), vec!["8082"]);
        assert!(matches!(
            ensemble.heartbeat(a).await.unwrap_err(),
            Error::SessionExpired(_)
        ));
    }

    #[tokio::test]
    async fn test_election_handover() {
        let ensemble = Ensemble::new();
        let a = ensemble.open_session(Duration::from_secs(5)).await.unwrap();
        let b = ensemble.open_session(Duration::from_secs(5)).await.unwrap();

        ensemble.join_election(a, ELECTION, "aaaa").await.unwrap();
        ensemble.join_election(b, ELECTION, "bbbb").await.unwrap();
        // Joining twice is a no-op
        ensemble.join_election(b, ELECTION, "bbbb").await.unwrap();

        assert_eq!(
            drain(&ensemble, a).await,
            vec![SessionEvent::Elected { path: ELECTION.into() }]
        );
        assert_eq!(
            drain(&ensemble, b).await,
            vec![SessionEvent::Standby {
                path: ELECTION.into(),
                leader: Some("aaaa".into())
            }]
        );
        assert!(ensemble.has_leadership(a, ELECTION).await.unwrap());
        assert!(!ensemble.has_leadership(b, ELECTION).await.unwrap());
        assert_eq!(ensemble.participants(ELECTION).await.unwrap().len(), 2);

        // Expiring the leader hands the election over exactly once
        assert!(ensemble.expire_session(a).await);
        assert_eq!(
            drain(&ensemble, b).await,
            vec![SessionEvent::Elected { path: ELECTION.into() }]
        );
        assert!(drain(&ensemble, b).await.is_empty());
        assert!(ensemble.has_leadership(b, ELECTION).await.unwrap());
    }

    #[tokio::test]
    async fn test_requeue_moves_leader_to_back() {
        let ensemble = Ensemble::new();
        let a = ensemble.open_session(Duration::from_secs(5)).await.unwrap();
        let b = ensemble.open_session(Duration::from_secs(5)).await.unwrap();
        ensemble.join_election(a, ELECTION, "aaaa").await.unwrap();
        ensemble.join_election(b, ELECTION, "bbbb").await.unwrap();
        drain(&ensemble, a).await;
        drain(&ensemble, b).await;

        ensemble.leave_election(a, ELECTION, true).await.unwrap();

        assert_eq!(
            drain(&ensemble, b).await,
            vec![SessionEvent::Elected { path: ELECTION.into() }]
        );
        assert_eq!(
            drain(&ensemble, a).await,
            vec![SessionEvent::Standby {
                path: ELECTION.into(),
                leader: Some("bbbb".into())
            }]
        );
        let participants = ensemble.participants(ELECTION).await.unwrap();
        assert_eq!(participants[0].id, "bbbb");
        assert_eq!(participants[1].id, "aaaa");
    }

    #[tokio::test]
    async fn test_lone_candidate_requeue_starts_new_term() {
        let ensemble = Ensemble::new();
        let a = ensemble.open_session(Duration::from_secs(5)).await.unwrap();
        ensemble.join_election(a, ELECTION, "aaaa").await.unwrap();
        drain(&ensemble, a).await;

        ensemble.leave_election(a, ELECTION, true).await.unwrap();
        assert_eq!(
            drain(&ensemble, a).await,
            vec![SessionEvent::Elected { path: ELECTION.into() }]
        );
    }

    #[tokio::test]
    async fn test_poll_waits_for_events() {
        let ensemble = Arc::new(Ensemble::new());
        let a = ensemble.open_session(Duration::from_secs(5)).await.unwrap();

        let poller = {
            let ensemble = Arc::clone(&ensemble);
            tokio::spawn(async move { ensemble.poll_events(a, Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        ensemble.join_election(a, ELECTION, "aaaa").await.unwrap();

        let events = poller.await.unwrap().unwrap();
        assert_eq!(events, vec![SessionEvent::Elected { path: ELECTION.into() }]);
    }

    #[tokio::test]
    async fn test_reaper_expires_silent_sessions() {
        let ensemble = Arc::new(Ensemble::new());
        let quiet = ensemble.open_session(Duration::from_millis(50)).await.unwrap();
        let chatty = ensemble.open_session(Duration::from_millis(50)).await.unwrap();
        let reaper = ensemble.spawn_reaper(Duration::from_millis(10));

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(15)).await;
            ensemble.heartbeat(chatty).await.unwrap();
        }

        assert!(!ensemble.is_alive(quiet).await);
        assert!(ensemble.is_alive(chatty).await);
        reaper.abort();
    }

    #[tokio::test]
    async fn test_unavailable_ensemble() {
        let ensemble = Ensemble::new();
        ensemble.set_available(false);
        let err = ensemble.open_session(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_retryable());
        ensemble.set_available(true);
        assert!(ensemble.open_session(Duration::from_secs(1)).await.is_ok());
    }
}
