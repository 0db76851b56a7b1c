//! Coordination Service
//!
//! The external primitive the cluster leans on for leader election,
//! ephemeral membership and the shared leader record. The contract is
//! session-based and modelled on ZooKeeper with Curator's leader-selector
//! recipe:
//!
//! - a tree of paths, each holding opaque bytes
//! - ephemeral paths owned by a session, removed when the session ends
//! - one FIFO candidate queue per election path; the head holds leadership
//!
//! [`Ensemble`] is the in-memory implementation, [`CoordinatorServer`]
//! exposes one over HTTP, and [`RemoteEnsemble`] talks to that server.
//! Nodes only ever see the service through [`CoordinationClient`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

mod client;
mod ensemble;
pub mod protocol;
mod remote;
mod retry;
mod server;
#[cfg(test)]
pub(crate) mod testing;

pub use client::{CoordinationClient, ConnectionState};
pub use ensemble::Ensemble;
pub use remote::RemoteEnsemble;
pub use retry::ExponentialBackoff;
pub use server::CoordinatorServer;

/// Coordination session identifier
pub type SessionId = u64;

/// Lifetime of a created path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateMode {
    /// Survives the creating session
    Persistent,
    /// Removed when the creating session closes or expires
    Ephemeral,
}

/// Notification queued for a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The session's candidate became head of the election queue
    Elected { path: String },
    /// The session's candidate is queued behind the current leader
    Standby {
        path: String,
        leader: Option<String>,
    },
}

/// Election participant as reported by the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub is_leader: bool,
}

/// Operations offered by the coordination service
#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    /// Open a session that expires unless heartbeated within `timeout`
    async fn open_session(&self, timeout: Duration) -> Result<SessionId>;

    /// Keep a session alive
    async fn heartbeat(&self, session: SessionId) -> Result<()>;

    /// Close a session, dropping its ephemerals and candidacies
    async fn close_session(&self, session: SessionId) -> Result<()>;

    /// Drain queued events, waiting up to `wait` for at least one
    async fn poll_events(&self, session: SessionId, wait: Duration) -> Result<Vec<SessionEvent>>;

    /// Create a path; the parent must exist
    async fn create(
        &self,
        session: SessionId,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Names (last segments) of the direct children of a path
    async fn get_children(&self, path: &str) -> Result<Vec<String>>;

    async fn get_data(&self, path: &str) -> Result<Vec<u8>>;

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// Enqueue a candidate; idempotent per session
    async fn join_election(&self, session: SessionId, path: &str, candidate_id: &str) -> Result<()>;

    /// Leave the election, optionally rejoining at the back of the queue
    async fn leave_election(&self, session: SessionId, path: &str, requeue: bool) -> Result<()>;

    /// Whether the session's candidate currently heads the queue
    async fn has_leadership(&self, session: SessionId, path: &str) -> Result<bool>;

    async fn participants(&self, path: &str) -> Result<Vec<Participant>>;
}

/// Parent of a path (`/a/b` -> `/a`, `/a` -> `/`)
pub(crate) fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Join a parent path and a child name
pub(crate) fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), name)
    }
}
