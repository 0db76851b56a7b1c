//! Remote Ensemble
//!
//! [`CoordinationBackend`] over HTTP, talking to a [`super::CoordinatorServer`].
//! Transport failures surface as `CoordinationUnavailable` so the retry
//! policy and the session state machine treat them as connection trouble.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::protocol::*;
use super::{CoordinationBackend, CreateMode, Participant, SessionEvent, SessionId};
use crate::error::{Error, Result};

/// Slack added on top of a long-poll wait for the request timeout
const POLL_SLACK: Duration = Duration::from_secs(5);

/// HTTP client for a remote coordinator
pub struct RemoteEnsemble {
    base_url: String,
    client: reqwest::Client,
}

impl RemoteEnsemble {
    /// Create a client for the coordinator at `endpoint` (e.g. `http://127.0.0.1:2181`)
    pub fn new(endpoint: &str, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            base_url: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::CoordinationUnavailable(e.to_string()))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        match response.json::<ErrorBody>().await {
            Ok(body) => Err(body.into_error()),
            Err(_) => Err(Error::CoordinationUnavailable(format!(
                "coordinator returned {}",
                status
            ))),
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        self.send(request)
            .await?
            .json::<T>()
            .await
            .map_err(|e| Error::CoordinationUnavailable(format!("bad coordinator response: {}", e)))
    }
}

#[async_trait]
impl CoordinationBackend for RemoteEnsemble {
    async fn open_session(&self, timeout: Duration) -> Result<SessionId> {
        let request = self.client.post(self.url("/sessions")).json(&OpenSessionRequest {
            timeout_ms: timeout.as_millis() as u64,
        });
        let response: OpenSessionResponse = self.send_json(request).await?;
        Ok(response.session_id)
    }

    async fn heartbeat(&self, session: SessionId) -> Result<()> {
        let url = self.url(&format!("/sessions/{}/heartbeat", session));
        self.send(self.client.post(url)).await?;
        Ok(())
    }

    async fn close_session(&self, session: SessionId) -> Result<()> {
        let url = self.url(&format!("/sessions/{}", session));
        self.send(self.client.delete(url)).await?;
        Ok(())
    }

    async fn poll_events(&self, session: SessionId, wait: Duration) -> Result<Vec<SessionEvent>> {
        let url = self.url(&format!("/sessions/{}/events", session));
        let request = self
            .client
            .get(url)
            .query(&EventsQuery {
                wait_ms: wait.as_millis() as u64,
            })
            .timeout(wait + POLL_SLACK);
        let response: EventsResponse = self.send_json(request).await?;
        Ok(response.events)
    }

    async fn create(
        &self,
        session: SessionId,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<()> {
        let request = self.client.post(self.url("/nodes")).json(&CreateRequest {
            session_id: session,
            path: path.to_string(),
            data,
            mode,
        });
        self.send(request).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let request = self
            .client
            .get(self.url("/nodes/exists"))
            .query(&PathQuery { path: path.to_string() });
        let response: ExistsResponse = self.send_json(request).await?;
        Ok(response.exists)
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        let request = self
            .client
            .get(self.url("/nodes/children"))
            .query(&PathQuery { path: path.to_string() });
        let response: ChildrenResponse = self.send_json(request).await?;
        Ok(response.children)
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        let request = self
            .client
            .get(self.url("/nodes/data"))
            .query(&PathQuery { path: path.to_string() });
        let response: DataResponse = self.send_json(request).await?;
        Ok(response.data)
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let request = self.client.put(self.url("/nodes/data")).json(&SetDataRequest {
            path: path.to_string(),
            data,
        });
        self.send(request).await?;
        Ok(())
    }

    async fn join_election(&self, session: SessionId, path: &str, candidate_id: &str) -> Result<()> {
        let request = self
            .client
            .post(self.url("/elections/join"))
            .json(&JoinElectionRequest {
                session_id: session,
                path: path.to_string(),
                candidate_id: candidate_id.to_string(),
            });
        self.send(request).await?;
        Ok(())
    }

    async fn leave_election(&self, session: SessionId, path: &str, requeue: bool) -> Result<()> {
        let request = self
            .client
            .post(self.url("/elections/leave"))
            .json(&LeaveElectionRequest {
                session_id: session,
                path: path.to_string(),
                requeue,
            });
        self.send(request).await?;
        Ok(())
    }

    async fn has_leadership(&self, session: SessionId, path: &str) -> Result<bool> {
        let request = self
            .client
            .get(self.url("/elections/leadership"))
            .query(&LeadershipQuery {
                session_id: session,
                path: path.to_string(),
            });
        let response: LeadershipResponse = self.send_json(request).await?;
        Ok(response.has_leadership)
    }

    async fn participants(&self, path: &str) -> Result<Vec<Participant>> {
        let request = self
            .client
            .get(self.url("/elections/participants"))
            .query(&PathQuery { path: path.to_string() });
        let response: ParticipantsResponse = self.send_json(request).await?;
        Ok(response.participants)
    }
}
