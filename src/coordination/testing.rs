//! Fault-injecting backend for tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{CoordinationBackend, CreateMode, Ensemble, Participant, SessionEvent, SessionId};
use crate::error::{Error, Result};

/// Wraps an [`Ensemble`] and fails selected operations on demand
pub(crate) struct FaultyBackend {
    inner: Arc<Ensemble>,
    /// Writes (create, set_data) to this path fail with `NoNode`
    broken_path: String,
    pub fail_writes: AtomicBool,
    pub fail_join: AtomicBool,
    pub fail_leadership_check: AtomicBool,
    /// Heartbeats never complete
    pub stall_heartbeats: AtomicBool,
    pub leave_calls: AtomicUsize,
}

impl FaultyBackend {
    pub fn new(inner: Arc<Ensemble>, broken_path: &str) -> Self {
        Self {
            inner,
            broken_path: broken_path.to_string(),
            fail_writes: AtomicBool::new(false),
            fail_join: AtomicBool::new(false),
            fail_leadership_check: AtomicBool::new(false),
            stall_heartbeats: AtomicBool::new(false),
            leave_calls: AtomicUsize::new(0),
        }
    }

    fn write_fault(&self, path: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) && path == self.broken_path {
            return Err(Error::NoNode(path.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationBackend for FaultyBackend {
    async fn open_session(&self, timeout: Duration) -> Result<SessionId> {
        self.inner.open_session(timeout).await
    }

    async fn heartbeat(&self, session: SessionId) -> Result<()> {
        if self.stall_heartbeats.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        self.inner.heartbeat(session).await
    }

    async fn close_session(&self, session: SessionId) -> Result<()> {
        self.inner.close_session(session).await
    }

    async fn poll_events(&self, session: SessionId, wait: Duration) -> Result<Vec<SessionEvent>> {
        self.inner.poll_events(session, wait).await
    }

    async fn create(
        &self,
        session: SessionId,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<()> {
        self.write_fault(path)?;
        self.inner.create(session, path, data, mode).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.inner.exists(path).await
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.inner.get_children(path).await
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        self.inner.get_data(path).await
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.write_fault(path)?;
        self.inner.set_data(path, data).await
    }

    async fn join_election(&self, session: SessionId, path: &str, candidate_id: &str) -> Result<()> {
        if self.fail_join.load(Ordering::SeqCst) {
            return Err(Error::Internal("election refused".into()));
        }
        self.inner.join_election(session, path, candidate_id).await
    }

    async fn leave_election(&self, session: SessionId, path: &str, requeue: bool) -> Result<()> {
        self.leave_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.leave_election(session, path, requeue).await
    }

    async fn has_leadership(&self, session: SessionId, path: &str) -> Result<bool> {
        if self.fail_leadership_check.load(Ordering::SeqCst) {
            return Err(Error::Internal("leadership check refused".into()));
        }
        self.inner.has_leadership(session, path).await
    }

    async fn participants(&self, path: &str) -> Result<Vec<Participant>> {
        self.inner.participants(path).await
    }
}
