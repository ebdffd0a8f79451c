//! Grow-only Set CRDT implementation
//!
//! Elements can be added but never removed; merge is set union.

use crate::{
    clock::ClockManager,
    error::Result,
    traits::{Crdt, Materialize, Mergeable, Synchronizable},
    types::{Delta, NodeId, VectorClock},
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt::{self, Display},
    hash::Hash,
};

/// G-Set operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GSetOp<T> {
    /// Insert an element; there is deliberately no removal variant
    Add {
        /// The inserted element
        element: T,
    },
}

/// G-Set state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "T: Clone + Eq + Hash + Serialize + for<'a> Deserialize<'a>")]
pub struct GSetState<T>
where
    T: Clone + Eq + Hash,
{
    /// The elements
    pub elements: HashSet<T>,
}

impl<T> GSetState<T>
where
    T: Clone + Eq + Hash,
{
    /// Create new empty state
    pub fn new() -> Self {
        Self {
            elements: HashSet::new(),
        }
    }
}

impl<T> Default for GSetState<T>
where
    T: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Grow-only Set CRDT
#[derive(Debug)]
pub struct GSet<T>
where
    T: Clone + Eq + Hash + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    node_id: NodeId,
    state: RwLock<GSetState<T>>,
    clock_manager: ClockManager,
}

impl<T> GSet<T>
where
    T: Clone + Eq + Hash + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    /// Create new G-Set
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            state: RwLock::new(GSetState::new()),
            clock_manager: ClockManager::new(node_id),
        }
    }

    /// Add an element, returning the replicated operation
    pub async fn add(&mut self, element: T) -> Result<GSetOp<T>> {
        self.clock_manager.advance_local();
        self.state.write().elements.insert(element.clone());
        Ok(GSetOp::Add { element })
    }

    /// Check if an element is in the set
    pub fn contains(&self, element: &T) -> bool {
        self.state.read().elements.contains(element)
    }

    /// All elements currently in the set
    pub fn elements(&self) -> HashSet<T> {
        self.state.read().elements.clone()
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.state.read().elements.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.state.read().elements.is_empty()
    }
}

impl<T> Clone for GSet<T>
where
    T: Clone + Eq + Hash + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    fn clone(&self) -> Self {
        Self {
            node_id: self.node_id,
            state: RwLock::new(self.state.read().clone()),
            clock_manager: self.clock_manager.fork(),
        }
    }
}

#[async_trait]
impl<T> Crdt for GSet<T>
where
    T: Clone + Eq + Hash + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    type Operation = GSetOp<T>;
    type State = GSetState<T>;

    async fn apply_operation(&mut self, operation: Self::Operation) -> Result<()> {
        let GSetOp::Add { element } = operation;
        self.state.write().elements.insert(element);
        Ok(())
    }

    async fn apply_remote_operation(&mut self, operation: Self::Operation) -> Result<()> {
        self.apply_operation(operation).await
    }

    fn validate_operation(&self, _operation: &Self::Operation) -> Result<()> {
        // Any add is well formed.
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
impl<T> Mergeable for GSet<T>
where
    T: Clone + Eq + Hash + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    async fn merge(&mut self, other: &Self) -> Result<()> {
        let other_state = other.clone_state();
        self.state.write().elements.extend(other_state.elements);
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
            .elements
            .difference(&self_state.elements)
            .cloned()
            .map(|element| GSetOp::Add { element })
            .collect()
    }
}

#[async_trait]
impl<T> Synchronizable for GSet<T>
where
    T: Clone + Eq + Hash + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    fn delta_since(&self, _clock: &VectorClock) -> Result<Delta<Self::State>> {
        Ok(Delta::FullState(self.clone_state()))
    }

    async fn apply_delta(&mut self, delta: Delta<Self::State>) -> Result<()> {
        match delta {
            Delta::FullState(state) => {
                self.state.write().elements.extend(state.elements);
                Ok(())
            }
            Delta::Operations(encoded) => {
                for bytes in encoded {
                    let operation: GSetOp<T> = bincode::deserialize(&bytes)?;
                    self.apply_remote_operation(operation).await?;
                }
                Ok(())
            }
        }
    }

    fn operations_since(&self, _clock: &VectorClock) -> Vec<Self::Operation> {
        self.state
            .read()
            .elements
            .iter()
            .cloned()
            .map(|element| GSetOp::Add { element })
            .collect()
    }

    fn size_bytes(&self) -> usize {
        let state = self.state.read();
        std::mem::size_of::<GSetState<T>>() + state.elements.len() * std::mem::size_of::<T>()
    }
}

impl<T> Materialize for GSet<T>
where
    T: Clone + Eq + Hash + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    type Value = HashSet<T>;

    fn value(&self) -> HashSet<T> {
        self.state.read().elements.clone()
    }

    fn from_state(node_id: NodeId, state: Self::State) -> Self {
        Self {
            node_id,
            state: RwLock::new(state),
            clock_manager: ClockManager::new(node_id),
        }
    }
}

impl<T> Display for GSet<T>
where
    T: Clone + Eq + Hash + Send + Sync + Serialize + for<'de> Deserialize<'de> + Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elements: Vec<String> = self
            .state
            .read()
            .elements
            .iter()
            .map(|e| e.to_string())
            .collect();
        write!(f, "G-Set[{}]: {{{}}}", self.node_id, elements.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_and_contains() {
        let mut set = GSet::new(NodeId::new());

        set.add("alpha".to_string()).await.unwrap();
        set.add("beta".to_string()).await.unwrap();

        assert!(set.contains(&"alpha".to_string()));
        assert!(set.contains(&"beta".to_string()));
        assert_eq!(set.len(), 2);
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let mut set = GSet::new(NodeId::new());

        set.add("alpha".to_string()).await.unwrap();
        set.add("alpha".to_string()).await.unwrap();

        assert_eq!(set.len(), 1);
    }

    #[tokio::test]
    async fn test_merge_is_union() {
        let mut a = GSet::new(NodeId::new());
        let mut b = GSet::new(NodeId::new());

        a.add(1u32).await.unwrap();
        b.add(2u32).await.unwrap();

        a.merge(&b).await.unwrap();
        b.merge(&a).await.unwrap();

        assert_eq!(a.elements(), b.elements());
        assert_eq!(a.len(), 2);
    }

    #[tokio::test]
    async fn test_state_round_trip() {
        let mut a = GSet::new(NodeId::new());
        a.add("x".to_string()).await.unwrap();

        let bytes = a.to_bytes().unwrap();
        let restored: GSet<String> = GSet::from_bytes(a.node_id(), &bytes).unwrap();
        assert!(restored.contains(&"x".to_string()));
    }
}
