//! Persistence collaborator interface.
//!
//! The state layer never owns a storage engine; it hands canonical state
//! bytes to whatever the host wires in. The in-memory implementation backs
//! tests and single-process deployments.

use crate::{
    error::{CrdtError, Result},
    types::TypeTag,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

/// Storage collaborator: save/load canonical instance bytes by
/// `(type_tag, key)`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist instance bytes
    async fn save(&self, type_tag: TypeTag, key: &str, bytes: Bytes) -> Result<()>;

    /// Load instance bytes; `None` when the instance has never been saved
    async fn load(&self, type_tag: TypeTag, key: &str) -> Result<Option<Bytes>>;

    /// Remove persisted bytes, used by archival collaborators
    async fn remove(&self, type_tag: TypeTag, key: &str) -> Result<()>;
}

/// In-memory store for tests and ephemeral deployments
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<(TypeTag, String), Bytes>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of persisted instances
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save(&self, type_tag: TypeTag, key: &str, bytes: Bytes) -> Result<()> {
        self.entries.insert((type_tag, key.to_string()), bytes);
        Ok(())
    }

    async fn load(&self, type_tag: TypeTag, key: &str) -> Result<Option<Bytes>> {
        Ok(self
            .entries
            .get(&(type_tag, key.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn remove(&self, type_tag: TypeTag, key: &str) -> Result<()> {
        self.entries.remove(&(type_tag, key.to_string()));
        Ok(())
    }
}

/// A store that fails every call, for exercising degraded paths in tests.
#[derive(Debug, Default)]
pub struct FailingStore;

#[async_trait]
impl StateStore for FailingStore {
    async fn save(&self, type_tag: TypeTag, key: &str, _bytes: Bytes) -> Result<()> {
        Err(CrdtError::Storage(format!("save refused for {type_tag}/{key}")))
    }

    async fn load(&self, type_tag: TypeTag, key: &str) -> Result<Option<Bytes>> {
        Err(CrdtError::Storage(format!("load refused for {type_tag}/{key}")))
    }

    async fn remove(&self, type_tag: TypeTag, key: &str) -> Result<()> {
        Err(CrdtError::Storage(format!(
            "remove refused for {type_tag}/{key}"
        )))
    }
}
