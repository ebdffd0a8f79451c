//! Observed-Remove Set (OR-Set) CRDT implementation
//!
//! Adds tag each element with a fresh `(node, sequence)` pair; removes
//! tombstone every tag the remover has observed. An add whose tag has not
//! been observed-removed always survives a merge (add-wins).
//!
//! Tombstones accumulate until [`collect`](crate::traits::GarbageCollectable::collect)
//! reclaims the pairs covered by the all-peers-acked watermark.

use crate::{
    clock::ClockManager,
    error::{CrdtError, Result},
    traits::{Crdt, GarbageCollectable, Materialize, Mergeable, Synchronizable},
    types::{Delta, NodeId, Timestamp, VectorClock},
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    fmt::{self, Display},
    hash::Hash,
};

/// Unique tag attached to each add
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementTag {
    /// Node that added the element
    pub node: NodeId,
    /// The adder's local sequence at add time
    pub sequence: u64,
    /// Stamp from the adder's monotonic clock
    pub timestamp: Timestamp,
}

impl ElementTag {
    /// Create a tag
    pub fn new(node: NodeId, sequence: u64, timestamp: Timestamp) -> Self {
        Self {
            node,
            sequence,
            timestamp,
        }
    }
}

impl PartialOrd for ElementTag {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ElementTag {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.node.cmp(&other.node))
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

/// Identity of the removal that tombstoned a tag. Kept so garbage
/// collection can tell when every peer has observed the removal itself,
/// not just the add.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RemovalStamp {
    /// Node that performed the removal
    pub node: NodeId,
    /// The remover's local sequence at removal time
    pub sequence: u64,
}

/// OR-Set operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrSetOp<T> {
    /// Add element with unique tag
    Add {
        /// The element
        element: T,
        /// Fresh tag minted by the adder
        tag: ElementTag,
    },
    /// Tombstone the observed tags of an element
    Remove {
        /// The element
        element: T,
        /// Tags the remover had observed for the element
        tags: HashSet<ElementTag>,
        /// Identity of this removal
        stamp: RemovalStamp,
    },
}

/// OR-Set state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "T: Clone + Eq + Hash + Serialize + for<'a> Deserialize<'a>")]
pub struct OrSetState<T>
where
    T: Clone + Eq + Hash,
{
    /// Live tags per element
    added: HashMap<T, HashSet<ElementTag>>,
    /// Tombstoned tags per element, with the removal that produced each
    removed: HashMap<T, HashMap<ElementTag, RemovalStamp>>,
}

impl<T> OrSetState<T>
where
    T: Clone + Eq + Hash,
{
    /// Create new empty state
    pub fn new() -> Self {
        Self {
            added: HashMap::new(),
            removed: HashMap::new(),
        }
    }

    /// Get all elements currently in the set
    pub fn elements(&self) -> HashSet<T> {
        self.added
            .iter()
            .filter(|(element, tags)| {
                let removed = self.removed.get(element);
                tags.iter()
                    .any(|tag| removed.map_or(true, |r| !r.contains_key(tag)))
            })
            .map(|(element, _)| element.clone())
            .collect()
    }

    /// Check if element is in the set
    pub fn contains(&self, element: &T) -> bool {
        match self.added.get(element) {
            Some(tags) => {
                let removed = self.removed.get(element);
                tags.iter()
                    .any(|tag| removed.map_or(true, |r| !r.contains_key(tag)))
            }
            None => false,
        }
    }

    /// Live (not yet tombstoned) tags for an element
    pub fn live_tags(&self, element: &T) -> HashSet<ElementTag> {
        let removed = self.removed.get(element);
        self.added
            .get(element)
            .map(|tags| {
                tags.iter()
                    .filter(|tag| removed.map_or(true, |r| !r.contains_key(tag)))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of present elements
    pub fn len(&self) -> usize {
        self.elements().len()
    }

    /// Whether no element is present
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of tombstoned tags
    pub fn tombstone_count(&self) -> usize {
        self.removed.values().map(|tags| tags.len()).sum()
    }

    fn insert_tag(&mut self, element: T, tag: ElementTag) {
        self.added.entry(element).or_default().insert(tag);
    }

    fn tombstone(&mut self, element: T, tags: HashSet<ElementTag>, stamp: RemovalStamp) {
        // Tombstones are stored unconditionally: the remover observed the
        // add even if this replica has not yet, and a later-arriving add
        // must not resurrect the element. Concurrent removals of the same
        // tag keep the smaller stamp so replicas stay identical.
        let entry = self.removed.entry(element).or_default();
        for tag in tags {
            entry
                .entry(tag)
                .and_modify(|existing| *existing = (*existing).min(stamp))
                .or_insert(stamp);
        }
    }

    /// Pairwise union with another state
    pub fn join(&mut self, other: &OrSetState<T>) {
        for (element, tags) in &other.added {
            let entry = self.added.entry(element.clone()).or_default();
            entry.extend(tags.iter().copied());
        }
        for (element, tags) in &other.removed {
            let entry = self.removed.entry(element.clone()).or_default();
            for (&tag, &stamp) in tags {
                entry
                    .entry(tag)
                    .and_modify(|existing| *existing = (*existing).min(stamp))
                    .or_insert(stamp);
            }
        }
    }
}

impl<T> Default for OrSetState<T>
where
    T: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Observed-Remove Set CRDT
#[derive(Debug)]
pub struct OrSet<T>
where
    T: Clone + Eq + Hash + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    node_id: NodeId,
    state: RwLock<OrSetState<T>>,
    clock_manager: ClockManager,
}

impl<T> OrSet<T>
where
    T: Clone + Eq + Hash + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    /// Create new OR-Set
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            state: RwLock::new(OrSetState::new()),
            clock_manager: ClockManager::new(node_id),
        }
    }

    /// Create an OR-Set sharing an existing clock manager, for composite
    /// types that mint tags from one sequence.
    pub(crate) fn with_clock(clock_manager: ClockManager) -> Self {
        Self::with_clock_and_state(clock_manager, OrSetState::new())
    }

    /// Rebuild an OR-Set from a state snapshot under a shared clock manager.
    pub(crate) fn with_clock_and_state(
        clock_manager: ClockManager,
        state: OrSetState<T>,
    ) -> Self {
        Self {
            node_id: clock_manager.node_id(),
            state: RwLock::new(state),
            clock_manager,
        }
    }

    /// Add an element, returning the replicated operation
    pub async fn add(&mut self, element: T) -> Result<OrSetOp<T>> {
        let sequence = self.clock_manager.advance_local();
        let tag = ElementTag::new(self.node_id, sequence, self.clock_manager.next_timestamp());

        let operation = OrSetOp::Add {
            element,
            tag,
        };
        self.apply_operation(operation.clone()).await?;
        Ok(operation)
    }

    /// Remove an element by tombstoning every tag observed for it
    pub async fn remove(&mut self, element: &T) -> Result<OrSetOp<T>> {
        let tags = self.state.read().live_tags(element);
        if tags.is_empty() {
            return Err(CrdtError::malformed(
                "cannot remove an element that is not present",
            ));
        }

        let sequence = self.clock_manager.advance_local();
        let operation = OrSetOp::Remove {
            element: element.clone(),
            tags,
            stamp: RemovalStamp {
                node: self.node_id,
                sequence,
            },
        };
        self.apply_operation(operation.clone()).await?;
        Ok(operation)
    }

    /// Check if element is in the set
    pub fn contains(&self, element: &T) -> bool {
        self.state.read().contains(element)
    }

    /// Get all elements in the set
    pub fn elements(&self) -> HashSet<T> {
        self.state.read().elements()
    }

    /// Number of present elements
    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.state.read().is_empty()
    }

    /// Total tombstoned tags awaiting collection
    pub fn tombstone_count(&self) -> usize {
        self.state.read().tombstone_count()
    }
}

impl<T> Clone for OrSet<T>
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
impl<T> Crdt for OrSet<T>
where
    T: Clone + Eq + Hash + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    type Operation = OrSetOp<T>;
    type State = OrSetState<T>;

    async fn apply_operation(&mut self, operation: Self::Operation) -> Result<()> {
        self.validate_operation(&operation)?;
        match operation {
            OrSetOp::Add { element, tag } => {
                self.clock_manager.observe(tag.node, tag.sequence);
                self.state.write().insert_tag(element, tag);
            }
            OrSetOp::Remove {
                element,
                tags,
                stamp,
            } => {
                self.clock_manager.observe(stamp.node, stamp.sequence);
                self.state.write().tombstone(element, tags, stamp);
            }
        }
        Ok(())
    }

    async fn apply_remote_operation(&mut self, operation: Self::Operation) -> Result<()> {
        self.apply_operation(operation).await
    }

    fn validate_operation(&self, operation: &Self::Operation) -> Result<()> {
        match operation {
            OrSetOp::Add { .. } => Ok(()),
            OrSetOp::Remove { tags, .. } => {
                if tags.is_empty() {
                    Err(CrdtError::malformed(
                        "remove must observe at least one tag",
                    ))
                } else {
                    Ok(())
                }
            }
        }
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
impl<T> Mergeable for OrSet<T>
where
    T: Clone + Eq + Hash + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
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
        let mut operations = Vec::new();

        for (element, other_tags) in &other_state.added {
            let known = self_state.added.get(element);
            for &tag in other_tags {
                if known.map_or(true, |tags| !tags.contains(&tag)) {
                    operations.push(OrSetOp::Add {
                        element: element.clone(),
                        tag,
                    });
                }
            }
        }

        for (element, other_removed) in &other_state.removed {
            let known = self_state.removed.get(element);
            let missing: HashSet<ElementTag> = other_removed
                .keys()
                .filter(|tag| known.map_or(true, |r| !r.contains_key(tag)))
                .copied()
                .collect();
            if !missing.is_empty() {
                // Group the missing tombstones under one representative
                // stamp; any stamp the peer holds is valid.
                let stamp = missing
                    .iter()
                    .filter_map(|tag| other_removed.get(tag))
                    .copied()
                    .min()
                    .unwrap_or(RemovalStamp {
                        node: other.node_id,
                        sequence: 0,
                    });
                operations.push(OrSetOp::Remove {
                    element: element.clone(),
                    tags: missing,
                    stamp,
                });
            }
        }

        operations
    }
}

#[async_trait]
impl<T> Synchronizable for OrSet<T>
where
    T: Clone + Eq + Hash + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
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
                    let operation: OrSetOp<T> = bincode::deserialize(&bytes)?;
                    self.apply_remote_operation(operation).await?;
                }
                Ok(())
            }
        }
    }

    fn operations_since(&self, clock: &VectorClock) -> Vec<Self::Operation> {
        let state = self.state.read();
        let mut operations = Vec::new();

        for (element, tags) in &state.added {
            for &tag in tags {
                if !clock.covers(tag.node, tag.sequence) {
                    operations.push(OrSetOp::Add {
                        element: element.clone(),
                        tag,
                    });
                }
            }
        }

        for (element, removed) in &state.removed {
            let mut by_stamp: HashMap<RemovalStamp, HashSet<ElementTag>> = HashMap::new();
            for (&tag, &stamp) in removed {
                if !clock.covers(stamp.node, stamp.sequence) {
                    by_stamp.entry(stamp).or_default().insert(tag);
                }
            }
            for (stamp, tags) in by_stamp {
                operations.push(OrSetOp::Remove {
                    element: element.clone(),
                    tags,
                    stamp,
                });
            }
        }

        operations
    }

    fn size_bytes(&self) -> usize {
        let state = self.state.read();
        let added_tags: usize = state.added.values().map(|t| t.len()).sum();
        let removed_tags: usize = state.removed.values().map(|t| t.len()).sum();
        std::mem::size_of::<OrSetState<T>>()
            + (state.added.len() + state.removed.len()) * std::mem::size_of::<T>()
            + (added_tags + removed_tags) * std::mem::size_of::<ElementTag>()
    }
}

impl<T> Materialize for OrSet<T>
where
    T: Clone + Eq + Hash + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    type Value = HashSet<T>;

    fn value(&self) -> HashSet<T> {
        self.state.read().elements()
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
impl<T> GarbageCollectable for OrSet<T>
where
    T: Clone + Eq + Hash + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    fn needs_gc(&self) -> bool {
        self.tombstone_count() > 0
    }

    fn garbage_size(&self) -> usize {
        self.tombstone_count() * std::mem::size_of::<ElementTag>()
    }

    async fn collect(&mut self, watermark: &VectorClock) -> Result<usize> {
        let mut state = self.state.write();
        let mut reclaimed = 0;

        let elements: Vec<T> = state.removed.keys().cloned().collect();
        for element in elements {
            let collectable: Vec<ElementTag> = state
                .removed
                .get(&element)
                .map(|tags| {
                    tags.iter()
                        .filter(|(tag, stamp)| {
                            // Both the add and the removal must be covered by
                            // every peer before the pair can be dropped.
                            watermark.covers(tag.node, tag.sequence)
                                && watermark.covers(stamp.node, stamp.sequence)
                        })
                        .map(|(&tag, _)| tag)
                        .collect()
                })
                .unwrap_or_default();

            if collectable.is_empty() {
                continue;
            }

            if let Some(tags) = state.removed.get_mut(&element) {
                for tag in &collectable {
                    tags.remove(tag);
                    reclaimed += 1;
                }
                if tags.is_empty() {
                    state.removed.remove(&element);
                }
            }
            if let Some(tags) = state.added.get_mut(&element) {
                for tag in &collectable {
                    tags.remove(tag);
                }
                if tags.is_empty() {
                    state.added.remove(&element);
                }
            }
        }

        Ok(reclaimed)
    }
}

impl<T> Display for OrSet<T>
where
    T: Clone + Eq + Hash + Send + Sync + Serialize + for<'de> Deserialize<'de> + Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elements: Vec<String> = self.elements().iter().map(|e| e.to_string()).collect();
        write!(f, "OR-Set[{}]: {{{}}}", self.node_id, elements.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_remove() {
        let mut set = OrSet::new(NodeId::new());

        set.add("hello".to_string()).await.unwrap();
        set.add("world".to_string()).await.unwrap();
        set.remove(&"hello".to_string()).await.unwrap();

        assert!(!set.contains(&"hello".to_string()));
        assert!(set.contains(&"world".to_string()));
        assert_eq!(set.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_absent_element_rejected() {
        let mut set: OrSet<String> = OrSet::new(NodeId::new());
        assert!(set.remove(&"ghost".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_add_remove_is_add_wins() {
        let mut a = OrSet::new(NodeId::new());
        let mut b = OrSet::new(NodeId::new());

        // Both add the same element; a removes only the tag it observed.
        a.add("x".to_string()).await.unwrap();
        b.add("x".to_string()).await.unwrap();
        a.remove(&"x".to_string()).await.unwrap();

        a.merge(&b).await.unwrap();
        b.merge(&a).await.unwrap();

        // b's unobserved add survives on both replicas.
        assert!(a.contains(&"x".to_string()));
        assert!(b.contains(&"x".to_string()));
        assert_eq!(a.clone_state(), b.clone_state());
    }

    #[tokio::test]
    async fn test_remove_before_add_does_not_resurrect() {
        let mut a = OrSet::new(NodeId::new());
        let mut b = OrSet::new(NodeId::new());
        let mut c = OrSet::new(NodeId::new());

        // a adds, b observes and removes; c hears about the removal first.
        let add_op = a.add("x".to_string()).await.unwrap();
        b.apply_remote_operation(add_op.clone()).await.unwrap();
        let remove_op = b.remove(&"x".to_string()).await.unwrap();

        c.apply_remote_operation(remove_op).await.unwrap();
        c.apply_remote_operation(add_op).await.unwrap();

        assert!(!c.contains(&"x".to_string()));
    }

    #[tokio::test]
    async fn test_re_add_after_remove() {
        let mut set = OrSet::new(NodeId::new());

        set.add("x".to_string()).await.unwrap();
        set.remove(&"x".to_string()).await.unwrap();
        set.add("x".to_string()).await.unwrap();

        assert!(set.contains(&"x".to_string()));
    }

    #[tokio::test]
    async fn test_gc_reclaims_only_acked_tombstones() {
        let node = NodeId::new();
        let mut set = OrSet::new(node);

        set.add("x".to_string()).await.unwrap();
        set.remove(&"x".to_string()).await.unwrap();
        set.add("y".to_string()).await.unwrap();
        set.remove(&"y".to_string()).await.unwrap();
        assert_eq!(set.tombstone_count(), 2);

        // Watermark covers only the first add/remove pair (sequences 1-2).
        let mut watermark = VectorClock::new();
        watermark.set(node, 2);
        let reclaimed = set.collect(&watermark).await.unwrap();
        assert_eq!(reclaimed, 1);
        assert_eq!(set.tombstone_count(), 1);

        // Full coverage reclaims the rest.
        watermark.set(node, 4);
        let reclaimed = set.collect(&watermark).await.unwrap();
        assert_eq!(reclaimed, 1);
        assert!(!set.needs_gc());
        assert!(!set.contains(&"x".to_string()));
        assert!(!set.contains(&"y".to_string()));
    }

    #[tokio::test]
    async fn test_state_round_trip() {
        let mut set = OrSet::new(NodeId::new());
        set.add("kept".to_string()).await.unwrap();
        set.add("gone".to_string()).await.unwrap();
        set.remove(&"gone".to_string()).await.unwrap();

        let bytes = set.to_bytes().unwrap();
        let restored: OrSet<String> = OrSet::from_bytes(set.node_id(), &bytes).unwrap();

        assert!(restored.contains(&"kept".to_string()));
        assert!(!restored.contains(&"gone".to_string()));
        assert_eq!(restored.tombstone_count(), 1);
    }
}
