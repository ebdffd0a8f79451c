//! Core traits for CRDT implementations

use crate::{
    error::Result,
    types::{Delta, NodeId, VectorClock},
};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Core CRDT trait that all replicated types implement.
///
/// Operations are commutative and idempotent at the type level: applying
/// the same operation twice, or two operations in either order, leaves the
/// replica in the same state.
#[async_trait]
pub trait Crdt: Clone + Send + Sync {
    /// The type of operations this CRDT supports
    type Operation: Clone + Send + Sync + Serialize + for<'de> Deserialize<'de>;

    /// The type of the CRDT's state
    type State: Clone + Send + Sync + Serialize + for<'de> Deserialize<'de>;

    /// Apply a locally originated operation
    async fn apply_operation(&mut self, operation: Self::Operation) -> Result<()>;

    /// Apply an operation received from a peer
    async fn apply_remote_operation(&mut self, operation: Self::Operation) -> Result<()>;

    /// Validate that an operation payload is well formed
    fn validate_operation(&self, operation: &Self::Operation) -> Result<()>;

    /// The node ID of this replica
    fn node_id(&self) -> NodeId;

    /// Snapshot of the current vector clock
    fn vector_clock(&self) -> VectorClock;

    /// Snapshot of the current state
    fn clone_state(&self) -> Self::State;
}

/// Trait for CRDTs that support merging with other replicas.
///
/// `merge` is an in-place join: afterwards `self` holds the least upper
/// bound of both inputs. The join is commutative, associative, and
/// idempotent — the property tests pin all three.
#[async_trait]
pub trait Mergeable: Crdt {
    /// Merge this replica with another
    async fn merge(&mut self, other: &Self) -> Result<()>;

    /// Check if this CRDT can be merged with another
    fn can_merge(&self, other: &Self) -> bool;

    /// Operations that would catch `self` up to `other`
    fn diff(&self, other: &Self) -> Vec<Self::Operation>;
}

/// Trait for CRDTs that support incremental synchronization
#[async_trait]
pub trait Synchronizable: Crdt {
    /// Get a delta covering everything past the given vector clock
    fn delta_since(&self, clock: &VectorClock) -> Result<Delta<Self::State>>;

    /// Apply a delta to this replica
    async fn apply_delta(&mut self, delta: Delta<Self::State>) -> Result<()>;

    /// Operations reconstructing state past the given vector clock
    fn operations_since(&self, clock: &VectorClock) -> Vec<Self::Operation>;

    /// Approximate in-memory size of this replica
    fn size_bytes(&self) -> usize;
}

/// Projection of CRDT state to the externally visible domain value, plus
/// the canonical byte representation used for storage and export.
pub trait Materialize: Crdt {
    /// The externally visible value type
    type Value;

    /// Project current state to the domain value
    fn value(&self) -> Self::Value;

    /// Rebuild a replica from a state snapshot
    fn from_state(node_id: NodeId, state: Self::State) -> Self;

    /// Canonical byte representation; round-trips losslessly
    fn to_bytes(&self) -> Result<Bytes> {
        let encoded = bincode::serialize(&self.clone_state())?;
        Ok(Bytes::from(encoded))
    }

    /// Rebuild a replica from canonical bytes
    fn from_bytes(node_id: NodeId, bytes: &[u8]) -> Result<Self>
    where
        Self: Sized,
    {
        let state: Self::State = bincode::deserialize(bytes)?;
        Ok(Self::from_state(node_id, state))
    }
}

/// Trait for CRDTs that accumulate tombstones or acked history that can be
/// reclaimed once every peer has observed it.
#[async_trait]
pub trait GarbageCollectable: Crdt {
    /// Whether a collection pass would reclaim anything
    fn needs_gc(&self) -> bool;

    /// Approximate bytes held by reclaimable data
    fn garbage_size(&self) -> usize;

    /// Drop data covered by the all-peers-acked watermark. Returns the
    /// number of entries reclaimed.
    async fn collect(&mut self, watermark: &VectorClock) -> Result<usize>;
}
