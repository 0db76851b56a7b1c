//! WolfPack - Leader-Coordinated Write Routing
//!
//! A small cluster of interchangeable nodes that agree on exactly one leader
//! through an external coordination service and route every write through
//! that leader, which applies it and replicates it to each follower.
//!
//! # Architecture
//!
//! Each node holds a session with the coordination service. The session owns
//! the node's membership entry and its place in the election queue, so both
//! disappear when the node goes away. The elected node publishes its address
//! in a shared leader record; followers read it to forward client writes, and
//! the leader fans applied writes out to every registered member.
//!
//! # Features
//!
//! - Session-bound leadership with automatic failover
//! - Ephemeral membership registry
//! - Single-hop forwarding with loop prevention
//! - Best-effort parallel fan-out to followers
//! - In-memory coordination ensemble, servable over HTTP
//! - HTTP API for writes, reads and status

pub mod api;
pub mod config;
pub mod coordination;
pub mod error;
pub mod id;
pub mod network;
pub mod node;
pub mod replication;
pub mod state;
pub mod store;

pub use config::WolfPackConfig;
pub use error::{Error, Result};
pub use node::Node;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfPackConfig;
    pub use crate::coordination::{CoordinationBackend, Ensemble, RemoteEnsemble};
    pub use crate::error::{Error, Result};
    pub use crate::id::{NodeAddress, NodeIdentity};
    pub use crate::network::{HttpTransport, LoopbackTransport, Transport};
    pub use crate::node::Node;
    pub use crate::replication::{WriteResponse, WriteStatus};
    pub use crate::state::LeadershipState;
    pub use crate::store::{RecordStore, VolatileStore, WriteRecord};
}
