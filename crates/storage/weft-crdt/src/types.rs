//! Core types for CRDT implementations

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt::{self, Display},
    hash::{Hash as StdHash, Hasher},
    time::{SystemTime, UNIX_EPOCH},
};
use uuid::Uuid;

/// Unique node identifier for CRDT operations.
///
/// The derived `Ord` (UUID byte order) is the deterministic total order
/// used to break last-writer-wins timestamp ties; every replica must agree
/// on it for convergence to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Create a new random node ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create node ID from UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for NodeId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Millisecond timestamp for ordering operations
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create timestamp from current system time
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Create timestamp from value
    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Get timestamp value
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Get next timestamp
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Vector clock for causal ordering
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    clocks: HashMap<NodeId, u64>,
}

impl VectorClock {
    /// Create new vector clock
    pub fn new() -> Self {
        Self {
            clocks: HashMap::new(),
        }
    }

    /// Advance clock for a node, returning the new counter value
    pub fn advance(&mut self, node: NodeId) -> u64 {
        let counter = self.clocks.entry(node).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Get clock value for a node
    pub fn get(&self, node: NodeId) -> u64 {
        self.clocks.get(&node).copied().unwrap_or(0)
    }

    /// Set clock value for a node
    pub fn set(&mut self, node: NodeId, value: u64) {
        self.clocks.insert(node, value);
    }

    /// Record that `sequence` from `node` has been observed
    pub fn observe(&mut self, node: NodeId, sequence: u64) {
        let counter = self.clocks.entry(node).or_insert(0);
        *counter = (*counter).max(sequence);
    }

    /// Whether this clock already covers `sequence` from `node`
    pub fn covers(&self, node: NodeId, sequence: u64) -> bool {
        self.get(node) >= sequence
    }

    /// Merge with another vector clock (take maximum of each entry)
    pub fn merge(&mut self, other: &VectorClock) {
        for (&node, &counter) in &other.clocks {
            let current = self.clocks.entry(node).or_insert(0);
            *current = (*current).max(counter);
        }
    }

    /// Entry-wise minimum with another clock, used for acked watermarks.
    /// Nodes absent from either side floor to zero.
    pub fn floor(&self, other: &VectorClock) -> VectorClock {
        let mut result = VectorClock::new();
        for &node in self.clocks.keys().chain(other.clocks.keys()) {
            result.set(node, self.get(node).min(other.get(node)));
        }
        result
    }

    /// Compare with another vector clock
    pub fn compare(&self, other: &VectorClock) -> VectorClockComparison {
        let mut less_than = false;
        let mut greater_than = false;

        let mut all_nodes = std::collections::HashSet::new();
        all_nodes.extend(self.clocks.keys());
        all_nodes.extend(other.clocks.keys());

        for &node in all_nodes {
            let self_time = self.get(node);
            let other_time = other.get(node);

            if self_time < other_time {
                less_than = true;
            } else if self_time > other_time {
                greater_than = true;
            }
        }

        match (less_than, greater_than) {
            (false, false) => VectorClockComparison::Equal,
            (true, false) => VectorClockComparison::Before,
            (false, true) => VectorClockComparison::After,
            (true, true) => VectorClockComparison::Concurrent,
        }
    }

    /// Check if this clock happened before another
    pub fn happens_before(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), VectorClockComparison::Before)
    }

    /// Check if clocks are concurrent
    pub fn is_concurrent(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), VectorClockComparison::Concurrent)
    }

    /// Whether this clock covers everything in `other`
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(
            self.compare(other),
            VectorClockComparison::After | VectorClockComparison::Equal
        )
    }

    /// Get all nodes in this vector clock
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.clocks.keys().copied()
    }

    /// Number of tracked nodes
    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    /// Whether the clock has no entries
    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    /// Stable digest of the clock contents, used as a delta-cache key.
    pub fn digest(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        let mut entries: Vec<_> = self.clocks.iter().collect();
        entries.sort_by_key(|(node, _)| **node);
        let mut hasher = DefaultHasher::new();
        for (node, counter) in entries {
            node.hash(&mut hasher);
            counter.hash(&mut hasher);
        }
        hasher.finish()
    }
}

/// Vector clock comparison result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorClockComparison {
    /// Strictly before the other clock
    Before,
    /// Strictly after the other clock
    After,
    /// Identical clocks
    Equal,
    /// Neither dominates; the histories diverged
    Concurrent,
}

/// Closed set of CRDT type tags the registry can materialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeTag {
    /// Grow-only counter
    GCounter,
    /// Increment/decrement counter
    PnCounter,
    /// Grow-only set
    GSet,
    /// Observed-remove set
    OrSet,
    /// Last-writer-wins register
    LwwRegister,
    /// Append-only time series
    TimeSeries,
    /// Vertex/edge graph
    Graph,
    /// Step workflow
    Workflow,
}

impl TypeTag {
    /// Stable string form used in storage keys and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeTag::GCounter => "gcounter",
            TypeTag::PnCounter => "pncounter",
            TypeTag::GSet => "gset",
            TypeTag::OrSet => "orset",
            TypeTag::LwwRegister => "lww",
            TypeTag::TimeSeries => "timeseries",
            TypeTag::Graph => "graph",
            TypeTag::Workflow => "workflow",
        }
    }
}

impl Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry index: a CRDT instance is addressed by `(type_tag, key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    /// The CRDT type of the instance
    pub type_tag: TypeTag,
    /// Application-chosen name
    pub key: String,
}

impl InstanceKey {
    /// Create an instance key
    pub fn new(type_tag: TypeTag, key: impl Into<String>) -> Self {
        Self {
            type_tag,
            key: key.into(),
        }
    }
}

impl Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_tag, self.key)
    }
}

/// Instance metadata tracked by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMeta {
    /// Creation time
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Last local apply or remote merge
    pub modified_at: chrono::DateTime<chrono::Utc>,
    /// Schema version of the serialized state
    pub schema_version: u32,
    /// Last successful sync round touching this instance
    pub last_synced: Option<chrono::DateTime<chrono::Utc>>,
}

impl InstanceMeta {
    /// Metadata for a freshly created instance
    pub fn new(schema_version: u32) -> Self {
        let now = chrono::Utc::now();
        Self {
            created_at: now,
            modified_at: now,
            schema_version,
            last_synced: None,
        }
    }

    /// Record a mutation
    pub fn touch(&mut self) {
        self.modified_at = chrono::Utc::now();
    }
}

/// A replicated operation in wire form.
///
/// `payload` is the bincode encoding of the type-specific operation; the
/// `(node_id, local_sequence)` pair is the operation's identity for
/// duplicate suppression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Originating node
    pub node_id: NodeId,
    /// Per-node monotonic sequence number
    pub local_sequence: u64,
    /// Wall-clock-ish stamp from the origin's monotonic clock
    pub timestamp: Timestamp,
    /// Encoded type-specific operation
    pub payload: Bytes,
}

impl OperationRecord {
    /// The operation's identity for duplicate detection
    pub fn identity(&self) -> (NodeId, u64) {
        (self.node_id, self.local_sequence)
    }
}

/// Self-describing delta envelope exchanged during a sync round.
///
/// Carries the operations the receiver is missing relative to the clock it
/// advertised; `full_state` is the fallback when the sender's operation log
/// no longer reaches back far enough (e.g. after tombstone GC).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaEnvelope {
    /// Type of the target instance
    pub type_tag: TypeTag,
    /// Key of the target instance
    pub key: String,
    /// Sender's vector clock for the instance at send time
    pub sender_clock: VectorClock,
    /// Missing operations in sender-log order
    pub operations: Vec<OperationRecord>,
    /// Canonical state snapshot fallback
    pub full_state: Option<Bytes>,
}

impl DeltaEnvelope {
    /// Instance key this envelope addresses
    pub fn instance_key(&self) -> InstanceKey {
        InstanceKey::new(self.type_tag, self.key.clone())
    }

    /// Whether the envelope carries nothing to apply
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty() && self.full_state.is_none()
    }
}

/// A JSON domain value carried by registers and workflow payloads.
///
/// Wraps `serde_json::Value` behind a string encoding so the canonical
/// bincode representation round-trips; `serde_json::Value` itself requires
/// a self-describing format.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonValue(pub serde_json::Value);

impl JsonValue {
    /// Wrap a JSON value
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Access the wrapped value
    pub fn as_json(&self) -> &serde_json::Value {
        &self.0
    }

    /// Unwrap into the inner value
    pub fn into_json(self) -> serde_json::Value {
        self.0
    }
}

impl From<serde_json::Value> for JsonValue {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

impl Display for JsonValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for JsonValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for JsonValue {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        serde_json::from_str(&raw)
            .map(JsonValue)
            .map_err(serde::de::Error::custom)
    }
}

/// Delta for incremental updates at the type level
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Delta<T> {
    /// Full state replacement (join on receipt)
    FullState(T),
    /// Encoded operations to apply in order
    Operations(Vec<Bytes>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_clock_compare() {
        let n1 = NodeId::new();
        let n2 = NodeId::new();

        let mut a = VectorClock::new();
        let mut b = VectorClock::new();
        assert_eq!(a.compare(&b), VectorClockComparison::Equal);

        a.advance(n1);
        assert_eq!(a.compare(&b), VectorClockComparison::After);
        assert_eq!(b.compare(&a), VectorClockComparison::Before);

        b.advance(n2);
        assert_eq!(a.compare(&b), VectorClockComparison::Concurrent);
        assert!(a.is_concurrent(&b));

        b.merge(&a);
        assert!(b.dominates(&a));
    }

    #[test]
    fn vector_clock_floor() {
        let n1 = NodeId::new();
        let n2 = NodeId::new();

        let mut a = VectorClock::new();
        a.set(n1, 5);
        a.set(n2, 2);
        let mut b = VectorClock::new();
        b.set(n1, 3);

        let watermark = a.floor(&b);
        assert_eq!(watermark.get(n1), 3);
        assert_eq!(watermark.get(n2), 0);
    }

    #[test]
    fn vector_clock_digest_is_order_independent() {
        let n1 = NodeId::new();
        let n2 = NodeId::new();

        let mut a = VectorClock::new();
        a.set(n1, 1);
        a.set(n2, 7);

        let mut b = VectorClock::new();
        b.set(n2, 7);
        b.set(n1, 1);

        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn covers_tracks_observed_sequences() {
        let n1 = NodeId::new();
        let mut clock = VectorClock::new();
        clock.observe(n1, 4);
        assert!(clock.covers(n1, 3));
        assert!(clock.covers(n1, 4));
        assert!(!clock.covers(n1, 5));
    }

    #[test]
    fn type_tag_round_trip() {
        let key = InstanceKey::new(TypeTag::OrSet, "session-tags");
        assert_eq!(key.to_string(), "orset/session-tags");
    }

    #[test]
    fn json_value_survives_bincode() {
        let value = JsonValue::new(serde_json::json!({"a": [1, 2, 3], "b": "x"}));
        let bytes = bincode::serialize(&value).unwrap();
        let back: JsonValue = bincode::deserialize(&bytes).unwrap();
        assert_eq!(value, back);
    }
}
