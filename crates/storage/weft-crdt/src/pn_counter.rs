//! PN-Counter (Increment/Decrement Counter) CRDT implementation
//!
//! A pair of grow-only counter states (P, N): increments advance P,
//! decrements advance N, and the value is `P - N`.

use crate::{
    clock::ClockManager,
    error::{CrdtError, Result},
    gcounter::GCounterState,
    traits::{Crdt, GarbageCollectable, Materialize, Mergeable, Synchronizable},
    types::{Delta, NodeId, VectorClock},
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// PN-Counter operation in join form: the node's running totals on both
/// halves after the mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PnCounterOp {
    /// A node's slots reached the given totals
    Advance {
        /// Slot owner
        node: NodeId,
        /// Running total of increments for that node
        positive_total: u64,
        /// Running total of decrements for that node
        negative_total: u64,
    },
}

/// PN-Counter state: a pair of G-Counter states
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnCounterState {
    /// Increment half
    pub positive: GCounterState,
    /// Decrement half
    pub negative: GCounterState,
}

impl PnCounterState {
    /// Create new empty state
    pub fn new() -> Self {
        Self {
            positive: GCounterState::new(),
            negative: GCounterState::new(),
        }
    }

    /// Current counter value
    pub fn value(&self) -> i64 {
        self.positive.value() as i64 - self.negative.value() as i64
    }

    /// Join both halves entry-wise
    pub fn join(&mut self, other: &PnCounterState) {
        self.positive.join(&other.positive);
        self.negative.join(&other.negative);
    }
}

/// Increment/Decrement Counter CRDT
#[derive(Debug)]
pub struct PnCounter {
    node_id: NodeId,
    state: RwLock<PnCounterState>,
    clock_manager: ClockManager,
}

impl PnCounter {
    /// Create new PN-Counter
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            state: RwLock::new(PnCounterState::new()),
            clock_manager: ClockManager::new(node_id),
        }
    }

    /// Increment the counter, returning the replicated operation
    pub async fn increment(&mut self, amount: u64) -> Result<PnCounterOp> {
        self.bump(amount, false).await
    }

    /// Decrement the counter, returning the replicated operation
    pub async fn decrement(&mut self, amount: u64) -> Result<PnCounterOp> {
        self.bump(amount, true).await
    }

    /// Increment by 1
    pub async fn inc(&mut self) -> Result<PnCounterOp> {
        self.increment(1).await
    }

    /// Decrement by 1
    pub async fn dec(&mut self) -> Result<PnCounterOp> {
        self.decrement(1).await
    }

    async fn bump(&mut self, amount: u64, negative: bool) -> Result<PnCounterOp> {
        if amount == 0 {
            return Err(CrdtError::malformed("counter amount must be positive"));
        }

        self.clock_manager.advance_local();
        let (positive_total, negative_total) = {
            let mut state = self.state.write();
            let half = if negative {
                &mut state.negative
            } else {
                &mut state.positive
            };
            let slot = half.slots.entry(self.node_id).or_insert(0);
            *slot = slot.saturating_add(amount);
            (
                state.positive.get(self.node_id),
                state.negative.get(self.node_id),
            )
        };

        Ok(PnCounterOp::Advance {
            node: self.node_id,
            positive_total,
            negative_total,
        })
    }

    /// Current counter value
    pub fn value(&self) -> i64 {
        self.state.read().value()
    }

    /// Sum of the increment half
    pub fn positive_sum(&self) -> u64 {
        self.state.read().positive.value()
    }

    /// Sum of the decrement half
    pub fn negative_sum(&self) -> u64 {
        self.state.read().negative.value()
    }

    /// Net contribution of a specific node
    pub fn node_contribution(&self, node: NodeId) -> i64 {
        let state = self.state.read();
        state.positive.get(node) as i64 - state.negative.get(node) as i64
    }
}

impl Clone for PnCounter {
    fn clone(&self) -> Self {
        Self {
            node_id: self.node_id,
            state: RwLock::new(self.state.read().clone()),
            clock_manager: self.clock_manager.fork(),
        }
    }
}

#[async_trait]
impl Crdt for PnCounter {
    type Operation = PnCounterOp;
    type State = PnCounterState;

    async fn apply_operation(&mut self, operation: Self::Operation) -> Result<()> {
        self.validate_operation(&operation)?;
        let PnCounterOp::Advance {
            node,
            positive_total,
            negative_total,
        } = operation;

        let mut state = self.state.write();
        let p = state.positive.slots.entry(node).or_insert(0);
        *p = (*p).max(positive_total);
        let n = state.negative.slots.entry(node).or_insert(0);
        *n = (*n).max(negative_total);
        Ok(())
    }

    async fn apply_remote_operation(&mut self, operation: Self::Operation) -> Result<()> {
        self.apply_operation(operation).await
    }

    fn validate_operation(&self, operation: &Self::Operation) -> Result<()> {
        let PnCounterOp::Advance {
            positive_total,
            negative_total,
            ..
        } = operation;
        if *positive_total == 0 && *negative_total == 0 {
            return Err(CrdtError::malformed(
                "advance must carry at least one nonzero total",
            ));
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
impl Mergeable for PnCounter {
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

        let mut nodes: std::collections::HashSet<NodeId> = std::collections::HashSet::new();
        nodes.extend(other_state.positive.slots.keys().copied());
        nodes.extend(other_state.negative.slots.keys().copied());

        nodes
            .into_iter()
            .filter(|&node| {
                other_state.positive.get(node) > self_state.positive.get(node)
                    || other_state.negative.get(node) > self_state.negative.get(node)
            })
            .map(|node| PnCounterOp::Advance {
                node,
                positive_total: other_state.positive.get(node),
                negative_total: other_state.negative.get(node),
            })
            .collect()
    }
}

#[async_trait]
impl Synchronizable for PnCounter {
    fn delta_since(&self, _clock: &VectorClock) -> Result<Delta<Self::State>> {
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
                    let operation: PnCounterOp = bincode::deserialize(&bytes)?;
                    self.apply_remote_operation(operation).await?;
                }
                Ok(())
            }
        }
    }

    fn operations_since(&self, _clock: &VectorClock) -> Vec<Self::Operation> {
        let state = self.state.read();
        let mut nodes: std::collections::HashSet<NodeId> = std::collections::HashSet::new();
        nodes.extend(state.positive.slots.keys().copied());
        nodes.extend(state.negative.slots.keys().copied());

        nodes
            .into_iter()
            .map(|node| PnCounterOp::Advance {
                node,
                positive_total: state.positive.get(node),
                negative_total: state.negative.get(node),
            })
            .filter(|op| self.validate_operation(op).is_ok())
            .collect()
    }

    fn size_bytes(&self) -> usize {
        let state = self.state.read();
        std::mem::size_of::<PnCounterState>()
            + (state.positive.slots.len() + state.negative.slots.len())
                * (std::mem::size_of::<NodeId>() + std::mem::size_of::<u64>())
    }
}

impl Materialize for PnCounter {
    type Value = i64;

    fn value(&self) -> i64 {
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
impl GarbageCollectable for PnCounter {
    fn needs_gc(&self) -> bool {
        false
    }

    fn garbage_size(&self) -> usize {
        0
    }

    async fn collect(&mut self, _watermark: &VectorClock) -> Result<usize> {
        Ok(0)
    }
}

impl Display for PnCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        write!(
            f,
            "PN-Counter[{}]: {} (P:{}, N:{})",
            self.node_id,
            state.value(),
            state.positive.value(),
            state.negative.value()
        )
    }
}
