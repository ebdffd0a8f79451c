//! Last-Writer-Wins Register CRDT implementation
//!
//! Stores a single value stamped with `(timestamp, node)`. Merge keeps the
//! entry with the larger timestamp; equal timestamps resolve to the larger
//! `NodeId` in UUID byte order. That tiebreak is arbitrary but total and
//! identical on every replica, which is what convergence needs.

use crate::{
    clock::ClockManager,
    error::Result,
    traits::{Crdt, Materialize, Mergeable, Synchronizable},
    types::{Delta, NodeId, Timestamp, VectorClock},
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// LWW Register operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LwwOp<T> {
    /// New value
    pub value: T,
    /// Timestamp of the write
    pub timestamp: Timestamp,
    /// Node that performed the write
    pub node: NodeId,
}

/// LWW Register state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LwwState<T> {
    /// Current value
    pub value: Option<T>,
    /// Timestamp of last write
    pub timestamp: Timestamp,
    /// Node who performed last write
    pub node: Option<NodeId>,
}

impl<T> LwwState<T> {
    /// Create new empty state
    pub fn new() -> Self {
        Self {
            value: None,
            timestamp: Timestamp::from_millis(0),
            node: None,
        }
    }

    /// Get current value
    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Check if state has a value
    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }

    /// Whether a write stamped `(timestamp, node)` supersedes this state.
    pub fn loses_to(&self, timestamp: Timestamp, node: NodeId) -> bool {
        match (self.timestamp.cmp(&timestamp), self.node) {
            (std::cmp::Ordering::Less, _) => true,
            (std::cmp::Ordering::Equal, Some(current)) => current < node,
            (std::cmp::Ordering::Equal, None) => true,
            (std::cmp::Ordering::Greater, _) => false,
        }
    }

    /// Apply a write if it wins against the current entry.
    pub fn absorb(&mut self, value: T, timestamp: Timestamp, node: NodeId) {
        if self.loses_to(timestamp, node) {
            self.value = Some(value);
            self.timestamp = timestamp;
            self.node = Some(node);
        }
    }
}

impl<T> Default for LwwState<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Last-Writer-Wins Register CRDT
#[derive(Debug)]
pub struct LwwRegister<T> {
    node_id: NodeId,
    state: RwLock<LwwState<T>>,
    clock_manager: ClockManager,
}

impl<T> LwwRegister<T>
where
    T: Clone + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    /// Create new LWW register
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            state: RwLock::new(LwwState::new()),
            clock_manager: ClockManager::new(node_id),
        }
    }

    /// Set the value, returning the replicated operation
    pub async fn set(&mut self, value: T) -> Result<LwwOp<T>> {
        self.clock_manager.advance_local();
        let operation = LwwOp {
            value,
            timestamp: self.clock_manager.next_timestamp(),
            node: self.node_id,
        };
        self.apply_operation(operation.clone()).await?;
        Ok(operation)
    }

    /// Get current value
    pub fn get(&self) -> Option<T> {
        self.state.read().value.clone()
    }

    /// Check if register is empty
    pub fn is_empty(&self) -> bool {
        self.state.read().is_empty()
    }

    /// Get last write timestamp
    pub fn last_write_timestamp(&self) -> Timestamp {
        self.state.read().timestamp
    }

    /// Get last writer
    pub fn last_writer(&self) -> Option<NodeId> {
        self.state.read().node
    }
}

impl<T> Clone for LwwRegister<T>
where
    T: Clone,
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
impl<T> Crdt for LwwRegister<T>
where
    T: Clone + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    type Operation = LwwOp<T>;
    type State = LwwState<T>;

    async fn apply_operation(&mut self, operation: Self::Operation) -> Result<()> {
        self.state
            .write()
            .absorb(operation.value, operation.timestamp, operation.node);
        Ok(())
    }

    async fn apply_remote_operation(&mut self, operation: Self::Operation) -> Result<()> {
        self.apply_operation(operation).await
    }

    fn validate_operation(&self, _operation: &Self::Operation) -> Result<()> {
        // Every stamped write is well formed.
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
impl<T> Mergeable for LwwRegister<T>
where
    T: Clone + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    async fn merge(&mut self, other: &Self) -> Result<()> {
        let other_state = other.clone_state();
        if let (Some(value), Some(node)) = (other_state.value, other_state.node) {
            self.state
                .write()
                .absorb(value, other_state.timestamp, node);
        }
        self.clock_manager.merge_vector_clock(&other.vector_clock());
        Ok(())
    }

    fn can_merge(&self, _other: &Self) -> bool {
        true
    }

    fn diff(&self, other: &Self) -> Vec<Self::Operation> {
        let self_state = self.state.read();
        let other_state = other.state.read();

        match (&other_state.value, other_state.node) {
            (Some(value), Some(node))
                if self_state.loses_to(other_state.timestamp, node) =>
            {
                vec![LwwOp {
                    value: value.clone(),
                    timestamp: other_state.timestamp,
                    node,
                }]
            }
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl<T> Synchronizable for LwwRegister<T>
where
    T: Clone + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    fn delta_since(&self, _clock: &VectorClock) -> Result<Delta<Self::State>> {
        Ok(Delta::FullState(self.clone_state()))
    }

    async fn apply_delta(&mut self, delta: Delta<Self::State>) -> Result<()> {
        match delta {
            Delta::FullState(state) => {
                if let (Some(value), Some(node)) = (state.value, state.node) {
                    self.state.write().absorb(value, state.timestamp, node);
                }
                Ok(())
            }
            Delta::Operations(encoded) => {
                for bytes in encoded {
                    let operation: LwwOp<T> = bincode::deserialize(&bytes)?;
                    self.apply_remote_operation(operation).await?;
                }
                Ok(())
            }
        }
    }

    fn operations_since(&self, _clock: &VectorClock) -> Vec<Self::Operation> {
        let state = self.state.read();
        match (&state.value, state.node) {
            (Some(value), Some(node)) => vec![LwwOp {
                value: value.clone(),
                timestamp: state.timestamp,
                node,
            }],
            _ => Vec::new(),
        }
    }

    fn size_bytes(&self) -> usize {
        std::mem::size_of::<LwwState<T>>()
    }
}

impl<T> Materialize for LwwRegister<T>
where
    T: Clone + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    type Value = Option<T>;

    fn value(&self) -> Option<T> {
        self.state.read().value.clone()
    }

    fn from_state(node_id: NodeId, state: Self::State) -> Self {
        Self {
            node_id,
            state: RwLock::new(state),
            clock_manager: ClockManager::new(node_id),
        }
    }
}

impl<T> Display for LwwRegister<T>
where
    T: Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        match &state.value {
            Some(value) => write!(
                f,
                "LWW[{}]: {} ({})",
                self.node_id, value, state.timestamp
            ),
            None => write!(f, "LWW[{}]: empty", self.node_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get() {
        let mut lww = LwwRegister::new(NodeId::new());
        lww.set("hello".to_string()).await.unwrap();
        assert_eq!(lww.get(), Some("hello".to_string()));
    }

    #[tokio::test]
    async fn test_newer_write_wins() {
        let mut a = LwwRegister::new(NodeId::new());
        let mut b = LwwRegister::new(NodeId::new());

        a.set("first".to_string()).await.unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(2)).await;
        b.set("second".to_string()).await.unwrap();

        a.merge(&b).await.unwrap();
        b.merge(&a).await.unwrap();

        assert_eq!(a.get(), Some("second".to_string()));
        assert_eq!(b.get(), Some("second".to_string()));
    }

    #[tokio::test]
    async fn test_equal_timestamp_tiebreak_is_deterministic() {
        let n1 = NodeId::new();
        let n2 = NodeId::new();
        let timestamp = Timestamp::from_millis(100);

        let mut a: LwwRegister<String> = LwwRegister::new(n1);
        let mut b: LwwRegister<String> = LwwRegister::new(n2);

        let op1 = LwwOp {
            value: "A".to_string(),
            timestamp,
            node: n1,
        };
        let op2 = LwwOp {
            value: "B".to_string(),
            timestamp,
            node: n2,
        };

        // Deliver in opposite orders; the larger node ID wins everywhere.
        a.apply_operation(op1.clone()).await.unwrap();
        a.apply_operation(op2.clone()).await.unwrap();
        b.apply_operation(op2).await.unwrap();
        b.apply_operation(op1).await.unwrap();

        let expected = if n1 > n2 { "A" } else { "B" };
        assert_eq!(a.get().as_deref(), Some(expected));
        assert_eq!(b.get().as_deref(), Some(expected));
    }

    #[tokio::test]
    async fn test_stale_write_is_ignored() {
        let node = NodeId::new();
        let mut lww = LwwRegister::new(node);

        lww.set("current".to_string()).await.unwrap();
        let stale = LwwOp {
            value: "stale".to_string(),
            timestamp: Timestamp::from_millis(1),
            node,
        };
        lww.apply_remote_operation(stale).await.unwrap();

        assert_eq!(lww.get(), Some("current".to_string()));
    }

    #[tokio::test]
    async fn test_state_round_trip() {
        use crate::types::JsonValue;

        let mut lww = LwwRegister::new(NodeId::new());
        lww.set(JsonValue::new(serde_json::json!({"theme": "dark"})))
            .await
            .unwrap();

        let bytes = lww.to_bytes().unwrap();
        let restored: LwwRegister<JsonValue> =
            LwwRegister::from_bytes(lww.node_id(), &bytes).unwrap();
        assert_eq!(restored.get(), lww.get());
    }
}
