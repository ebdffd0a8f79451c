//! Clock management for CRDT ordering

use crate::types::{NodeId, Timestamp, VectorClock};
use parking_lot::RwLock;
use std::sync::Arc;

/// Clock manager coordinating the vector clock and timestamp generation
/// for one replica.
///
/// Clones share the underlying clocks, so composite CRDTs (graph, workflow)
/// can hand the same manager to their constituent parts. Use [`fork`] to
/// create an independent copy for a new replica.
///
/// [`fork`]: ClockManager::fork
#[derive(Debug)]
pub struct ClockManager {
    node_id: NodeId,
    vector_clock: Arc<RwLock<VectorClock>>,
    // Last issued stamp; stamps are strictly monotonic even if the wall
    // clock stalls or steps backwards.
    last_stamp: Arc<RwLock<u64>>,
}

impl ClockManager {
    /// Create new clock manager
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            vector_clock: Arc::new(RwLock::new(VectorClock::new())),
            last_stamp: Arc::new(RwLock::new(0)),
        }
    }

    /// Get this replica's node ID
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Advance the local entry of the vector clock, returning the new
    /// sequence number.
    pub fn advance_local(&self) -> u64 {
        self.vector_clock.write().advance(self.node_id)
    }

    /// This replica's current local sequence number
    pub fn own_sequence(&self) -> u64 {
        self.vector_clock.read().get(self.node_id)
    }

    /// Get current vector clock
    pub fn vector_clock(&self) -> VectorClock {
        self.vector_clock.read().clone()
    }

    /// Merge with a remote vector clock
    pub fn merge_vector_clock(&self, remote: &VectorClock) {
        self.vector_clock.write().merge(remote);
    }

    /// Record that a remote sequence has been observed
    pub fn observe(&self, node: NodeId, sequence: u64) {
        self.vector_clock.write().observe(node, sequence);
    }

    /// Issue a strictly monotonic millisecond timestamp.
    ///
    /// Takes the wall clock when it has advanced, otherwise the previous
    /// stamp plus one — the hybrid advance that keeps last-writer-wins
    /// ordering sane under bursts and clock steps.
    pub fn next_timestamp(&self) -> Timestamp {
        let mut last = self.last_stamp.write();
        let physical = Timestamp::now().as_millis();
        let stamp = if physical > *last { physical } else { *last + 1 };
        *last = stamp;
        Timestamp::from_millis(stamp)
    }

    /// Deep-copy this manager for an independent replica.
    pub fn fork(&self) -> Self {
        Self {
            node_id: self.node_id,
            vector_clock: Arc::new(RwLock::new(self.vector_clock.read().clone())),
            last_stamp: Arc::new(RwLock::new(*self.last_stamp.read())),
        }
    }

    /// Deep-copy this manager for a different node, keeping observed state.
    pub fn fork_as(&self, node_id: NodeId) -> Self {
        Self {
            node_id,
            vector_clock: Arc::new(RwLock::new(self.vector_clock.read().clone())),
            last_stamp: Arc::new(RwLock::new(*self.last_stamp.read())),
        }
    }
}

impl Clone for ClockManager {
    fn clone(&self) -> Self {
        Self {
            node_id: self.node_id,
            vector_clock: Arc::clone(&self.vector_clock),
            last_stamp: Arc::clone(&self.last_stamp),
        }
    }
}

/// Utility functions for clock operations
pub mod utils {
    use super::*;

    /// Check whether an operation is causally ready for delivery: its
    /// origin's sequence must be the next expected one and every other
    /// dependency must already be covered locally.
    pub fn is_causally_ready(
        operation_clock: &VectorClock,
        local_clock: &VectorClock,
        operation_node: NodeId,
    ) -> bool {
        for node in operation_clock.nodes() {
            if node == operation_node {
                let expected = local_clock.get(node) + 1;
                if operation_clock.get(node) != expected {
                    return false;
                }
            } else if local_clock.get(node) < operation_clock.get(node) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_is_sequential() {
        let manager = ClockManager::new(NodeId::new());
        assert_eq!(manager.advance_local(), 1);
        assert_eq!(manager.advance_local(), 2);
        assert_eq!(manager.own_sequence(), 2);
    }

    #[test]
    fn timestamps_are_strictly_monotonic() {
        let manager = ClockManager::new(NodeId::new());
        let mut previous = manager.next_timestamp();
        for _ in 0..1000 {
            let next = manager.next_timestamp();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn clones_share_state_forks_do_not() {
        let manager = ClockManager::new(NodeId::new());
        let shared = manager.clone();
        let forked = manager.fork();

        manager.advance_local();
        assert_eq!(shared.own_sequence(), 1);
        assert_eq!(forked.own_sequence(), 0);
    }

    #[test]
    fn causal_readiness() {
        let origin = NodeId::new();
        let other = NodeId::new();

        let mut local = VectorClock::new();
        local.set(origin, 1);
        local.set(other, 3);

        // Next op from origin with a dependency we already cover.
        let mut op_clock = VectorClock::new();
        op_clock.set(origin, 2);
        op_clock.set(other, 2);
        assert!(utils::is_causally_ready(&op_clock, &local, origin));

        // Gap in the origin's sequence.
        op_clock.set(origin, 4);
        assert!(!utils::is_causally_ready(&op_clock, &local, origin));
    }
}
