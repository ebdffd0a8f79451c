//! Grow-only Counter CRDT implementation
//!
//! Each node increments its own slot; the value is the sum of all slots
//! and merge takes the entry-wise maximum. The counter never decreases.

use crate::{
    clock::ClockManager,
    error::{CrdtError, Result},
    traits::{Crdt, GarbageCollectable, Materialize, Mergeable, Synchronizable},
    types::{Delta, NodeId, VectorClock},
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt::{self, Display},
};

/// G-Counter operation.
///
/// Replicated in join form: `Advance` carries the node's running total, so
/// re-applying a seen operation is a no-op under the max-merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GCounterOp {
    /// A node's slot reached `total`
    Advance {
        /// Slot owner
        node: NodeId,
        /// New running total for that slot
        total: u64,
    },
}

/// G-Counter state: one non-negative slot per node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GCounterState {
    /// Per-node totals
    pub slots: HashMap<NodeId, u64>,
}

impl GCounterState {
    /// Create new empty state
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }

    /// Current counter value: the sum of all slots
    pub fn value(&self) -> u64 {
        self.slots.values().fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    /// Get slot total for a node
    pub fn get(&self, node: NodeId) -> u64 {
        self.slots.get(&node).copied().unwrap_or(0)
    }

    /// Entry-wise max merge
    pub fn join(&mut self, other: &GCounterState) {
        for (&node, &total) in &other.slots {
            let slot = self.slots.entry(node).or_insert(0);
            *slot = (*slot).max(total);
        }
    }
}

/// Grow-only Counter CRDT
#[derive(Debug)]
pub struct GCounter {
    node_id: NodeId,
    state: RwLock<GCounterState>,
    clock_manager: ClockManager,
}

impl GCounter {
    /// Create new G-Counter
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            state: RwLock::new(GCounterState::new()),
            clock_manager: ClockManager::new(node_id),
        }
    }

    /// Increment this node's slot, returning the replicated operation.
    pub async fn increment(&mut self, amount: u64) -> Result<GCounterOp> {
        if amount == 0 {
            return Err(CrdtError::malformed("increment amount must be positive"));
        }

        self.clock_manager.advance_local();
        let total = {
            let mut state = self.state.write();
            let slot = state.slots.entry(self.node_id).or_insert(0);
            *slot = slot.saturating_add(amount);
            *slot
        };

        Ok(GCounterOp::Advance {
            node: self.node_id,
            total,
        })
    }

    /// Increment by 1
    pub async fn inc(&mut self) -> Result<GCounterOp> {
        self.increment(1).await
    }

    /// Current counter value
    pub fn value(&self) -> u64 {
        self.state.read().value()
    }

    /// Slot total for a specific node
    pub fn slot(&self, node: NodeId) -> u64 {
        self.state.read().get(node)
    }
}

impl Clone for GCounter {
    fn clone(&self) -> Self {
        Self {
            node_id: self.node_id,
            state: RwLock::new(self.state.read().clone()),
            clock_manager: self.clock_manager.fork(),
        }
    }
}

#[async_trait]
impl Crdt for GCounter {
    type Operation = GCounterOp;
    type State = GCounterState;

    async fn apply_operation(&mut self, operation: Self::Operation) -> Result<()> {
        self.validate_operation(&operation)?;
        let GCounterOp::Advance { node, total } = operation;
        let mut state = self.state.write();
        let slot = state.slots.entry(node).or_insert(0);
        *slot = (*slot).max(total);
        Ok(())
    }

    async fn apply_remote_operation(&mut self, operation: Self::Operation) -> Result<()> {
        self.apply_operation(operation).await
    }

    fn validate_operation(&self, operation: &Self::Operation) -> Result<()> {
        let GCounterOp::Advance { total, .. } = operation;
        if *total == 0 {
            return Err(CrdtError::malformed("advance total must be positive"));
        }
        Ok(())
    }

    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn vector_clock(&self) -> VectorClock {
        self.clock_manager.vector_clock()
    }

    fn clone_state(&self) -> Self::State {
        self.state.read().clone()
    }
}

#[async_trait]
impl Mergeable for GCounter {
    async fn merge(&mut self, other: &Self) -> Result<()> {
        let other_state = other.clone_state();
        self.state.write().join(&other_state);
        self.clock_manager.merge_vector_clock(&other.vector_clock());
        Ok(())
    }

    fn can_merge(&self, _other: &Self) -> bool {
        true
    }

    fn diff(&self, other: &Self) -> Vec<Self::Operation> {
        let self_state = self.state.read();
        let other_state = other.state.read();

        other_state
            .slots
            .iter()
            .filter(|(&node, &total)| total > self_state.get(node))
            .map(|(&node, &total)| GCounterOp::Advance { node, total })
            .collect()
    }
}

#[async_trait]
impl Synchronizable for GCounter {
    fn delta_since(&self, _clock: &VectorClock) -> Result<Delta<Self::State>> {
        // Slot totals carry no per-operation history; the state itself is
        // the smallest safe delta.
        Ok(Delta::FullState(self.clone_state()))
    }

    async fn apply_delta(&mut self, delta: Delta<Self::State>) -> Result<()> {
        match delta {
            Delta::FullState(state) => {
                self.state.write().join(&state);
                Ok(())
            }
            Delta::Operations(encoded) => {
                for bytes in encoded {
                    let operation: GCounterOp = bincode::deserialize(&bytes)?;
                    self.apply_remote_operation(operation).await?;
                }
                Ok(())
            }
        }
    }

    fn operations_since(&self, clock: &VectorClock) -> Vec<Self::Operation> {
        // Reconstructs state as join-form operations; harmless to re-apply.
        let state = self.state.read();
        let _ = clock;
        state
            .slots
            .iter()
            .filter(|(_, &total)| total > 0)
            .map(|(&node, &total)| GCounterOp::Advance { node, total })
            .collect()
    }

    fn size_bytes(&self) -> usize {
        let state = self.state.read();
        std::mem::size_of::<GCounterState>()
            + state.slots.len() * (std::mem::size_of::<NodeId>() + std::mem::size_of::<u64>())
    }
}

impl Materialize for GCounter {
    type Value = u64;

    fn value(&self) -> u64 {
        self.state.read().value()
    }

    fn from_state(node_id: NodeId, state: Self::State) -> Self {
        Self {
            node_id,
            state: RwLock::new(state),
            clock_manager: ClockManager::new(node_id),
        }
    }
}

#[async_trait]
impl GarbageCollectable for GCounter {
    fn needs_gc(&self) -> bool {
        false
    }

    fn garbage_size(&self) -> usize {
        0
    }

    async fn collect(&mut self, _watermark: &VectorClock) -> Result<usize> {
        // Slots are live data; nothing is reclaimable.
        Ok(0)
    }
}

impl Display for GCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "G-Counter[{}]: {}", self.node_id, self.value())
    }
}
