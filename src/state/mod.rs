//! State Management Module
//!
//! Cluster-wide state a node shares through the coordination service:
//! leadership, live membership and the leader record.

mod directory;
pub mod election;
mod membership;

pub use directory::LeaderDirectory;
pub use election::{ElectionConfig, LeadershipEvent, LeadershipManager, LeadershipState};
pub use membership::{MemberInfo, MembershipRegistry};
