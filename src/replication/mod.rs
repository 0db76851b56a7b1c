//! Replication Module
//!
//! Write routing: the leader applies and fans out, followers forward to the
//! leader or apply the leader's deliveries.

mod router;

pub use router::{Router, WriteResponse, WriteStatus};
