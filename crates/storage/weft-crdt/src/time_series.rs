//! Time-Series CRDT implementation
//!
//! An append-only sequence of `(timestamp, value)` points kept as one log
//! per node, keyed by the node's monotonic sequence. Reads interleave the
//! logs by `(timestamp, node, sequence)`; merge is a union of the logs.
//! Retention prunes only points every peer has acked, and downsampling is
//! a read-time aggregation that never mutates the log.

use crate::{
    clock::ClockManager,
    error::{CrdtError, Result},
    traits::{Crdt, GarbageCollectable, Materialize, Mergeable, Synchronizable},
    types::{Delta, NodeId, Timestamp, VectorClock},
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fmt::{self, Display},
};

/// A single observation in the series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimePoint {
    /// Observation time
    pub timestamp: Timestamp,
    /// Observed value
    pub value: f64,
}

/// Time-series operation, keyed by `(node, sequence)` so re-application
/// is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TimeSeriesOp {
    /// Append a point to a node's log
    Append {
        /// Appending node
        node: NodeId,
        /// The node's sequence for this point
        sequence: u64,
        /// The observation
        point: TimePoint,
    },
}

/// Read-time aggregation functions for downsampling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Aggregate {
    /// Arithmetic mean of the bucket
    Mean,
    /// Smallest value in the bucket
    Min,
    /// Largest value in the bucket
    Max,
    /// Sum of the bucket
    Sum,
    /// Number of points in the bucket
    Count,
    /// Latest value in the bucket
    Last,
}

/// Retention bounds applied by the garbage-collection pass.
///
/// Pruning is additionally gated on the all-peers-acked watermark, so a
/// point is only dropped once no peer still needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Drop acked points older than this many milliseconds before the
    /// newest point, if set
    pub max_age_ms: Option<u64>,
    /// Keep at most this many points per node, if set
    pub max_points_per_node: Option<usize>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age_ms: None,
            max_points_per_node: None,
        }
    }
}

/// Time-series state: one append-only log per node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesState {
    /// Per-node logs keyed by sequence
    pub logs: HashMap<NodeId, BTreeMap<u64, TimePoint>>,
}

impl TimeSeriesState {
    /// Create new empty state
    pub fn new() -> Self {
        Self {
            logs: HashMap::new(),
        }
    }

    /// All points interleaved by `(timestamp, node, sequence)`
    pub fn points(&self) -> Vec<TimePoint> {
        let mut indexed: Vec<(Timestamp, NodeId, u64, TimePoint)> = self
            .logs
            .iter()
            .flat_map(|(&node, log)| {
                log.iter()
                    .map(move |(&sequence, &point)| (point.timestamp, node, sequence, point))
            })
            .collect();
        indexed.sort_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));
        indexed.into_iter().map(|(_, _, _, point)| point).collect()
    }

    /// Total number of stored points
    pub fn len(&self) -> usize {
        self.logs.values().map(|log| log.len()).sum()
    }

    /// Whether the series holds no points
    pub fn is_empty(&self) -> bool {
        self.logs.values().all(|log| log.is_empty())
    }

    /// Union with another state
    pub fn join(&mut self, other: &TimeSeriesState) {
        for (&node, log) in &other.logs {
            let entry = self.logs.entry(node).or_default();
            for (&sequence, &point) in log {
                entry.entry(sequence).or_insert(point);
            }
        }
    }
}

/// Append-only Time-Series CRDT
#[derive(Debug)]
pub struct TimeSeries {
    node_id: NodeId,
    state: RwLock<TimeSeriesState>,
    clock_manager: ClockManager,
    retention: RetentionPolicy,
}

impl TimeSeries {
    /// Create new time series
    pub fn new(node_id: NodeId) -> Self {
        Self::with_retention(node_id, RetentionPolicy::default())
    }

    /// Create new time series with retention bounds
    pub fn with_retention(node_id: NodeId, retention: RetentionPolicy) -> Self {
        Self {
            node_id,
            state: RwLock::new(TimeSeriesState::new()),
            clock_manager: ClockManager::new(node_id),
            retention,
        }
    }

    /// Append a value stamped with the current clock
    pub async fn record(&mut self, value: f64) -> Result<TimeSeriesOp> {
        let timestamp = self.clock_manager.next_timestamp();
        self.record_at(timestamp, value).await
    }

    /// Append a value with an explicit timestamp
    pub async fn record_at(&mut self, timestamp: Timestamp, value: f64) -> Result<TimeSeriesOp> {
        if !value.is_finite() {
            return Err(CrdtError::malformed("time-series value must be finite"));
        }

        let sequence = self.clock_manager.advance_local();
        let operation = TimeSeriesOp::Append {
            node: self.node_id,
            sequence,
            point: TimePoint { timestamp, value },
        };
        self.apply_operation(operation.clone()).await?;
        Ok(operation)
    }

    /// All points in read order
    pub fn points(&self) -> Vec<TimePoint> {
        self.state.read().points()
    }

    /// Number of stored points
    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    /// Whether the series is empty
    pub fn is_empty(&self) -> bool {
        self.state.read().is_empty()
    }

    /// Configured retention policy
    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Non-destructive downsample: partition the read view into buckets of
    /// `bucket_ms` and aggregate each. The log itself is untouched.
    pub fn downsample(&self, bucket_ms: u64, aggregate: Aggregate) -> Result<Vec<TimePoint>> {
        if bucket_ms == 0 {
            return Err(CrdtError::malformed("bucket width must be positive"));
        }

        let points = self.points();
        let mut buckets: BTreeMap<u64, Vec<f64>> = BTreeMap::new();
        for point in &points {
            let bucket = point.timestamp.as_millis() / bucket_ms;
            buckets.entry(bucket).or_default().push(point.value);
        }

        Ok(buckets
            .into_iter()
            .map(|(bucket, values)| {
                let aggregated = match aggregate {
                    Aggregate::Mean => values.iter().sum::<f64>() / values.len() as f64,
                    Aggregate::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
                    Aggregate::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                    Aggregate::Sum => values.iter().sum(),
                    Aggregate::Count => values.len() as f64,
                    Aggregate::Last => *values.last().unwrap_or(&0.0),
                };
                TimePoint {
                    timestamp: Timestamp::from_millis(bucket * bucket_ms),
                    value: aggregated,
                }
            })
            .collect())
    }
}

impl Clone for TimeSeries {
    fn clone(&self) -> Self {
        Self {
            node_id: self.node_id,
            state: RwLock::new(self.state.read().clone()),
            clock_manager: self.clock_manager.fork(),
            retention: self.retention,
        }
    }
}

#[async_trait]
impl Crdt for TimeSeries {
    type Operation = TimeSeriesOp;
    type State = TimeSeriesState;

    async fn apply_operation(&mut self, operation: Self::Operation) -> Result<()> {
        self.validate_operation(&operation)?;
        let TimeSeriesOp::Append {
            node,
            sequence,
            point,
        } = operation;

        self.clock_manager.observe(node, sequence);
        self.state
            .write()
            .logs
            .entry(node)
            .or_default()
            .entry(sequence)
            .or_insert(point);
        Ok(())
    }

    async fn apply_remote_operation(&mut self, operation: Self::Operation) -> Result<()> {
        self.apply_operation(operation).await
    }

    fn validate_operation(&self, operation: &Self::Operation) -> Result<()> {
        let TimeSeriesOp::Append { sequence, point, .. } = operation;
        if *sequence == 0 {
            return Err(CrdtError::malformed("sequence numbers start at 1"));
        }
        if !point.value.is_finite() {
            return Err(CrdtError::malformed("time-series value must be finite"));
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
impl Mergeable for TimeSeries {
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

        for (&node, log) in &other_state.logs {
            let known = self_state.logs.get(&node);
            for (&sequence, &point) in log {
                if known.map_or(true, |l| !l.contains_key(&sequence)) {
                    operations.push(TimeSeriesOp::Append {
                        node,
                        sequence,
                        point,
                    });
                }
            }
        }

        operations
    }
}

#[async_trait]
impl Synchronizable for TimeSeries {
    fn delta_since(&self, clock: &VectorClock) -> Result<Delta<Self::State>> {
        let encoded = self
            .operations_since(clock)
            .into_iter()
            .map(|op| bincode::serialize(&op).map(Bytes::from))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Delta::Operations(encoded))
    }

    async fn apply_delta(&mut self, delta: Delta<Self::State>) -> Result<()> {
        match delta {
            Delta::FullState(state) => {
                self.state.write().join(&state);
                Ok(())
            }
            Delta::Operations(encoded) => {
                for bytes in encoded {
                    let operation: TimeSeriesOp = bincode::deserialize(&bytes)?;
                    self.apply_remote_operation(operation).await?;
                }
                Ok(())
            }
        }
    }

    fn operations_since(&self, clock: &VectorClock) -> Vec<Self::Operation> {
        // Per-node sequences map directly onto the vector clock, so the
        // series serves precise deltas.
        let state = self.state.read();
        let mut operations = Vec::new();
        for (&node, log) in &state.logs {
            let seen = clock.get(node);
            for (&sequence, &point) in log.range(seen + 1..) {
                operations.push(TimeSeriesOp::Append {
                    node,
                    sequence,
                    point,
                });
            }
        }
        operations
    }

    fn size_bytes(&self) -> usize {
        let state = self.state.read();
        std::mem::size_of::<TimeSeriesState>()
            + state.len() * (std::mem::size_of::<u64>() + std::mem::size_of::<TimePoint>())
    }
}

impl Materialize for TimeSeries {
    type Value = Vec<TimePoint>;

    fn value(&self) -> Vec<TimePoint> {
        self.points()
    }

    fn from_state(node_id: NodeId, state: Self::State) -> Self {
        Self {
            node_id,
            state: RwLock::new(state),
            clock_manager: ClockManager::new(node_id),
            retention: RetentionPolicy::default(),
        }
    }
}

#[async_trait]
impl GarbageCollectable for TimeSeries {
    fn needs_gc(&self) -> bool {
        let state = self.state.read();
        match self.retention.max_points_per_node {
            Some(max) => state.logs.values().any(|log| log.len() > max),
            None => self.retention.max_age_ms.is_some() && !state.is_empty(),
        }
    }

    fn garbage_size(&self) -> usize {
        let state = self.state.read();
        match self.retention.max_points_per_node {
            Some(max) => state
                .logs
                .values()
                .map(|log| log.len().saturating_sub(max))
                .sum::<usize>()
                * std::mem::size_of::<TimePoint>(),
            None => 0,
        }
    }

    async fn collect(&mut self, watermark: &VectorClock) -> Result<usize> {
        let newest = self
            .points()
            .last()
            .map(|p| p.timestamp.as_millis())
            .unwrap_or(0);

        let mut state = self.state.write();
        let mut reclaimed = 0;

        for (&node, log) in state.logs.iter_mut() {
            let acked = watermark.get(node);
            let over_capacity = self
                .retention
                .max_points_per_node
                .map(|max| log.len().saturating_sub(max))
                .unwrap_or(0);

            let mut droppable: Vec<u64> = Vec::new();
            for (index, (&sequence, point)) in log.iter().enumerate() {
                // Only points every peer has observed are candidates.
                if sequence > acked {
                    break;
                }
                let too_old = self
                    .retention
                    .max_age_ms
                    .map(|age| point.timestamp.as_millis() + age < newest)
                    .unwrap_or(false);
                let over = index < over_capacity;
                if too_old || over {
                    droppable.push(sequence);
                }
            }

            for sequence in droppable {
                log.remove(&sequence);
                reclaimed += 1;
            }
        }

        Ok(reclaimed)
    }
}

impl Display for TimeSeries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TimeSeries[{}]: {} points across {} nodes",
            self.node_id,
            self.len(),
            self.state.read().logs.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_and_read_order() {
        let mut series = TimeSeries::new(NodeId::new());

        series.record_at(Timestamp::from_millis(30), 3.0).await.unwrap();
        series.record_at(Timestamp::from_millis(10), 1.0).await.unwrap();
        series.record_at(Timestamp::from_millis(20), 2.0).await.unwrap();

        let values: Vec<f64> = series.points().iter().map(|p| p.value).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_non_finite_value_rejected() {
        let mut series = TimeSeries::new(NodeId::new());
        assert!(series.record(f64::NAN).await.is_err());
        assert!(series.is_empty());
    }

    #[tokio::test]
    async fn test_merge_interleaves_by_timestamp() {
        let mut a = TimeSeries::new(NodeId::new());
        let mut b = TimeSeries::new(NodeId::new());

        a.record_at(Timestamp::from_millis(10), 1.0).await.unwrap();
        a.record_at(Timestamp::from_millis(30), 3.0).await.unwrap();
        b.record_at(Timestamp::from_millis(20), 2.0).await.unwrap();

        a.merge(&b).await.unwrap();
        b.merge(&a).await.unwrap();

        let values: Vec<f64> = a.points().iter().map(|p| p.value).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
        assert_eq!(a.clone_state(), b.clone_state());
    }

    #[tokio::test]
    async fn test_equal_timestamps_order_by_node() {
        let n1 = NodeId::new();
        let n2 = NodeId::new();
        let mut a = TimeSeries::new(n1);
        let mut b = TimeSeries::new(n2);

        a.record_at(Timestamp::from_millis(10), 1.0).await.unwrap();
        b.record_at(Timestamp::from_millis(10), 2.0).await.unwrap();

        a.merge(&b).await.unwrap();
        b.merge(&a).await.unwrap();

        // Same deterministic interleaving on both replicas.
        let from_a: Vec<f64> = a.points().iter().map(|p| p.value).collect();
        let from_b: Vec<f64> = b.points().iter().map(|p| p.value).collect();
        assert_eq!(from_a, from_b);
    }

    #[tokio::test]
    async fn test_operations_since_serves_precise_deltas() {
        let mut series = TimeSeries::new(NodeId::new());
        series.record(1.0).await.unwrap();
        series.record(2.0).await.unwrap();
        let checkpoint = series.vector_clock();
        series.record(3.0).await.unwrap();

        let missing = series.operations_since(&checkpoint);
        assert_eq!(missing.len(), 1);
    }

    #[tokio::test]
    async fn test_downsample_mean() {
        let mut series = TimeSeries::new(NodeId::new());
        series.record_at(Timestamp::from_millis(0), 1.0).await.unwrap();
        series.record_at(Timestamp::from_millis(50), 3.0).await.unwrap();
        series.record_at(Timestamp::from_millis(150), 10.0).await.unwrap();

        let sampled = series.downsample(100, Aggregate::Mean).unwrap();
        assert_eq!(sampled.len(), 2);
        assert_eq!(sampled[0].value, 2.0);
        assert_eq!(sampled[1].value, 10.0);

        // The log is untouched.
        assert_eq!(series.len(), 3);
    }

    #[tokio::test]
    async fn test_retention_prunes_only_acked_points() {
        let node = NodeId::new();
        let mut series = TimeSeries::with_retention(
            node,
            RetentionPolicy {
                max_age_ms: None,
                max_points_per_node: Some(1),
            },
        );

        series.record_at(Timestamp::from_millis(10), 1.0).await.unwrap();
        series.record_at(Timestamp::from_millis(20), 2.0).await.unwrap();
        series.record_at(Timestamp::from_millis(30), 3.0).await.unwrap();

        // No peer has acked anything: nothing may be pruned.
        let reclaimed = series.collect(&VectorClock::new()).await.unwrap();
        assert_eq!(reclaimed, 0);
        assert_eq!(series.len(), 3);

        // Peers acked the first two points; capacity is 1, so both go.
        let mut watermark = VectorClock::new();
        watermark.set(node, 2);
        let reclaimed = series.collect(&watermark).await.unwrap();
        assert_eq!(reclaimed, 2);
        let values: Vec<f64> = series.points().iter().map(|p| p.value).collect();
        assert_eq!(values, vec![3.0]);
    }

    #[tokio::test]
    async fn test_state_round_trip() {
        let mut series = TimeSeries::new(NodeId::new());
        series.record(7.5).await.unwrap();

        let bytes = series.to_bytes().unwrap();
        let restored = TimeSeries::from_bytes(series.node_id(), &bytes).unwrap();
        assert_eq!(restored.points(), series.points());
    }
}
