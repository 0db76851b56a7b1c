//! Coordinator HTTP wire types
//!
//! Shared by [`super::CoordinatorServer`] and [`super::RemoteEnsemble`].

use serde::{Deserialize, Serialize};

use super::{CreateMode, Participant, SessionEvent, SessionId};
use crate::error::Error;

/// Error codes carried in [`ErrorBody::code`]
pub mod codes {
    pub const SESSION_EXPIRED: &str = "SESSION_EXPIRED";
    pub const NODE_EXISTS: &str = "NODE_EXISTS";
    pub const NO_NODE: &str = "NO_NODE";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    pub const INTERNAL: &str = "INTERNAL";
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenSessionRequest {
    pub timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenSessionResponse {
    pub session_id: SessionId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventsQuery {
    pub wait_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventsResponse {
    pub events: Vec<SessionEvent>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateRequest {
    pub session_id: SessionId,
    pub path: String,
    #[serde(default)]
    pub data: Vec<u8>,
    pub mode: CreateMode,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PathQuery {
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExistsResponse {
    pub exists: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChildrenResponse {
    pub children: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DataResponse {
    pub data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetDataRequest {
    pub path: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinElectionRequest {
    pub session_id: SessionId,
    pub path: String,
    pub candidate_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LeaveElectionRequest {
    pub session_id: SessionId,
    pub path: String,
    #[serde(default)]
    pub requeue: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LeadershipQuery {
    pub session_id: SessionId,
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LeadershipResponse {
    pub has_leadership: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ParticipantsResponse {
    pub participants: Vec<Participant>,
}

/// Error payload returned by the coordinator
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    /// Path or session the error refers to
    #[serde(default)]
    pub subject: Option<String>,
}

impl ErrorBody {
    /// Encode a crate error for the wire
    pub fn from_error(e: &Error) -> Self {
        let (code, subject) = match e {
            Error::SessionExpired(id) => (codes::SESSION_EXPIRED, Some(id.to_string())),
            Error::NodeExists(path) => (codes::NODE_EXISTS, Some(path.clone())),
            Error::NoNode(path) => (codes::NO_NODE, Some(path.clone())),
            Error::CoordinationUnavailable(_) => (codes::UNAVAILABLE, None),
            _ => (codes::INTERNAL, None),
        };
        Self {
            error: e.to_string(),
            code: code.to_string(),
            subject,
        }
    }

    /// Decode back into the matching crate error
    pub fn into_error(self) -> Error {
        let subject = self.subject.unwrap_or_default();
        match self.code.as_str() {
            codes::SESSION_EXPIRED => match subject.parse() {
                Ok(id) => Error::SessionExpired(id),
                Err(_) => Error::CoordinationUnavailable(self.error),
            },
            codes::NODE_EXISTS => Error::NodeExists(subject),
            codes::NO_NODE => Error::NoNode(subject),
            codes::UNAVAILABLE => Error::CoordinationUnavailable(self.error),
            _ => Error::Internal(self.error),
        }
    }
}
