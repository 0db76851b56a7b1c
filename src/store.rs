//! Volatile Record Store
//!
//! Per-node, in-memory, append-only storage for application records.
//! Each node owns its own instance; replication keeps them in step.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Application payload carried by a write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRecord {
    pub id: i64,
    pub name: String,
}

impl WriteRecord {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Append/list contract for record storage
///
/// Implementations must be safe for concurrent append and read. Records are
/// never mutated after append, and duplicate ids are allowed.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Append a record
    async fn append(&self, record: WriteRecord);

    /// All records in insertion order
    async fn list(&self) -> Vec<WriteRecord>;

    /// Number of stored records
    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// In-memory store, lost on restart
#[derive(Default)]
pub struct VolatileStore {
    records: RwLock<Vec<WriteRecord>>,
}

impl VolatileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for VolatileStore {
    async fn append(&self, record: WriteRecord) {
        self.records.write().await.push(record);
    }

    async fn list(&self) -> Vec<WriteRecord> {
        self.records.read().await.clone()
    }

    async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_insertion_order_and_duplicates() {
        let store = VolatileStore::new();
        assert!(store.is_empty().await);

        store.append(WriteRecord::new(2, "Bob")).await;
        store.append(WriteRecord::new(1, "Alice")).await;
        store.append(WriteRecord::new(2, "Bob")).await;

        let records = store.list().await;
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], WriteRecord::new(2, "Bob"));
        assert_eq!(records[1], WriteRecord::new(1, "Alice"));
        assert_eq!(records[2], records[0]);
    }

    #[tokio::test]
    async fn test_concurrent_appends() {
        let store = Arc::new(VolatileStore::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.append(WriteRecord::new(i, format!("student-{}", i))).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.len().await, 32);
    }
}
