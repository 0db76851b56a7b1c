//! Network Module
//!
//! Outbound delivery of writes between nodes: forwards to the leader and
//! the leader's fan-out to followers.

mod client;
mod loopback;

pub use client::HttpTransport;
pub use loopback::{Delivery, LoopbackTransport};

use async_trait::async_trait;

use crate::error::Result;
use crate::id::NodeAddress;
use crate::replication::WriteResponse;
use crate::store::WriteRecord;

/// Header carrying the sender's address on node-to-node writes
pub const REQUEST_FROM_HEADER: &str = "request_from";

/// Sends a write to another node
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `record` to `target`, tagged with `from` as provenance
    async fn send_write(
        &self,
        target: &NodeAddress,
        record: &WriteRecord,
        from: &NodeAddress,
    ) -> Result<WriteResponse>;
}
