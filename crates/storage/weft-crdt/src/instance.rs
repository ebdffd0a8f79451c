//! The closed union of CRDT types the registry can hold.
//!
//! Dispatch is a plain enum match — no downcasting, no runtime type
//! inspection. Register values and workflow payloads use the JSON domain
//! the assistant platform speaks; sets and graphs are keyed by strings.

use crate::{
    error::{CrdtError, Result},
    gcounter::{GCounter, GCounterOp},
    graph::{Graph, GraphOp},
    gset::{GSet, GSetOp},
    lww_register::{LwwOp, LwwRegister},
    or_set::{OrSet, OrSetOp},
    pn_counter::{PnCounter, PnCounterOp},
    time_series::{TimePoint, TimeSeries, TimeSeriesOp},
    traits::{Crdt, GarbageCollectable, Materialize, Mergeable, Synchronizable},
    types::{JsonValue, NodeId, OperationRecord, Timestamp, TypeTag, VectorClock},
    workflow::{StepStatus, Workflow, WorkflowOp},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A local mutation intent, routed to the matching CRDT variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LocalChange {
    /// Increment a counter
    Increment {
        /// Amount to add
        amount: u64,
    },
    /// Decrement a PN-Counter
    Decrement {
        /// Amount to subtract
        amount: u64,
    },
    /// Add an element to a set
    AddElement {
        /// The element
        element: String,
    },
    /// Remove an element from an OR-Set
    RemoveElement {
        /// The element
        element: String,
    },
    /// Write a register value
    SetValue {
        /// The new value
        value: JsonValue,
    },
    /// Append a time-series point
    RecordPoint {
        /// Explicit observation time; defaults to the replica clock
        timestamp: Option<Timestamp>,
        /// Observed value
        value: f64,
    },
    /// Add a graph vertex
    AddVertex {
        /// Vertex id
        vertex: String,
    },
    /// Remove a graph vertex
    RemoveVertex {
        /// Vertex id
        vertex: String,
    },
    /// Add a graph edge
    AddEdge {
        /// Source vertex
        from: String,
        /// Target vertex
        to: String,
    },
    /// Remove a graph edge
    RemoveEdge {
        /// Source vertex
        from: String,
        /// Target vertex
        to: String,
    },
    /// Transition a workflow step
    TransitionStep {
        /// Step id
        step: String,
        /// New status
        status: StepStatus,
    },
    /// Mark a workflow step complete
    CompleteStep {
        /// Step id
        step: String,
    },
}

/// A CRDT instance held by the registry
#[derive(Debug, Clone)]
pub enum CrdtInstance {
    /// Grow-only counter
    GCounter(GCounter),
    /// Increment/decrement counter
    PnCounter(PnCounter),
    /// Grow-only set of strings
    GSet(GSet<String>),
    /// Observed-remove set of strings
    OrSet(OrSet<String>),
    /// JSON-valued LWW register
    LwwRegister(LwwRegister<JsonValue>),
    /// Append-only time series
    TimeSeries(TimeSeries),
    /// String-keyed graph
    Graph(Graph<String>),
    /// Step workflow
    Workflow(Workflow),
}

impl CrdtInstance {
    /// Create a fresh instance of the given type
    pub fn new(type_tag: TypeTag, node_id: NodeId) -> Self {
        match type_tag {
            TypeTag::GCounter => Self::GCounter(GCounter::new(node_id)),
            TypeTag::PnCounter => Self::PnCounter(PnCounter::new(node_id)),
            TypeTag::GSet => Self::GSet(GSet::new(node_id)),
            TypeTag::OrSet => Self::OrSet(OrSet::new(node_id)),
            TypeTag::LwwRegister => Self::LwwRegister(LwwRegister::new(node_id)),
            TypeTag::TimeSeries => Self::TimeSeries(TimeSeries::new(node_id)),
            TypeTag::Graph => Self::Graph(Graph::new(node_id)),
            TypeTag::Workflow => Self::Workflow(Workflow::new(node_id)),
        }
    }

    /// The instance's type tag
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Self::GCounter(_) => TypeTag::GCounter,
            Self::PnCounter(_) => TypeTag::PnCounter,
            Self::GSet(_) => TypeTag::GSet,
            Self::OrSet(_) => TypeTag::OrSet,
            Self::LwwRegister(_) => TypeTag::LwwRegister,
            Self::TimeSeries(_) => TypeTag::TimeSeries,
            Self::Graph(_) => TypeTag::Graph,
            Self::Workflow(_) => TypeTag::Workflow,
        }
    }

    /// The replica's node ID
    pub fn node_id(&self) -> NodeId {
        match self {
            Self::GCounter(c) => c.node_id(),
            Self::PnCounter(c) => c.node_id(),
            Self::GSet(s) => s.node_id(),
            Self::OrSet(s) => s.node_id(),
            Self::LwwRegister(r) => r.node_id(),
            Self::TimeSeries(t) => t.node_id(),
            Self::Graph(g) => g.node_id(),
            Self::Workflow(w) => w.node_id(),
        }
    }

    /// Snapshot of the instance's vector clock
    pub fn vector_clock(&self) -> VectorClock {
        match self {
            Self::GCounter(c) => c.vector_clock(),
            Self::PnCounter(c) => c.vector_clock(),
            Self::GSet(s) => s.vector_clock(),
            Self::OrSet(s) => s.vector_clock(),
            Self::LwwRegister(r) => r.vector_clock(),
            Self::TimeSeries(t) => t.vector_clock(),
            Self::Graph(g) => g.vector_clock(),
            Self::Workflow(w) => w.vector_clock(),
        }
    }

    /// Apply a local change, returning it as a wire-ready operation record.
    pub async fn apply_local(&mut self, change: LocalChange) -> Result<OperationRecord> {
        let node_id = self.node_id();
        let payload: Bytes = match (&mut *self, change) {
            (Self::GCounter(c), LocalChange::Increment { amount }) => {
                encode(&c.increment(amount).await?)?
            }
            (Self::PnCounter(c), LocalChange::Increment { amount }) => {
                encode(&c.increment(amount).await?)?
            }
            (Self::PnCounter(c), LocalChange::Decrement { amount }) => {
                encode(&c.decrement(amount).await?)?
            }
            (Self::GSet(s), LocalChange::AddElement { element }) => {
                encode(&s.add(element).await?)?
            }
            (Self::OrSet(s), LocalChange::AddElement { element }) => {
                encode(&s.add(element).await?)?
            }
            (Self::OrSet(s), LocalChange::RemoveElement { element }) => {
                encode(&s.remove(&element).await?)?
            }
            (Self::LwwRegister(r), LocalChange::SetValue { value }) => {
                encode(&r.set(value).await?)?
            }
            (Self::TimeSeries(t), LocalChange::RecordPoint { timestamp, value }) => {
                let op = match timestamp {
                    Some(ts) => t.record_at(ts, value).await?,
                    None => t.record(value).await?,
                };
                encode(&op)?
            }
            (Self::Graph(g), LocalChange::AddVertex { vertex }) => {
                encode(&g.add_vertex(vertex).await?)?
            }
            (Self::Graph(g), LocalChange::RemoveVertex { vertex }) => {
                encode(&g.remove_vertex(&vertex).await?)?
            }
            (Self::Graph(g), LocalChange::AddEdge { from, to }) => {
                encode(&g.add_edge(from, to).await?)?
            }
            (Self::Graph(g), LocalChange::RemoveEdge { from, to }) => {
                encode(&g.remove_edge(&from, &to).await?)?
            }
            (Self::Workflow(w), LocalChange::TransitionStep { step, status }) => {
                encode(&w.transition(step, status).await?)?
            }
            (Self::Workflow(w), LocalChange::CompleteStep { step }) => {
                encode(&w.complete(step).await?)?
            }
            (instance, change) => {
                return Err(CrdtError::TypeMismatch {
                    expected: instance.type_tag().to_string(),
                    actual: format!("{change:?}"),
                })
            }
        };

        Ok(OperationRecord {
            node_id,
            local_sequence: self.vector_clock().get(node_id),
            timestamp: Timestamp::now(),
            payload,
        })
    }

    /// Decode and apply a remote operation payload.
    pub async fn apply_remote_payload(&mut self, payload: &[u8]) -> Result<()> {
        match self {
            Self::GCounter(c) => {
                let op: GCounterOp = decode(payload)?;
                c.apply_remote_operation(op).await
            }
            Self::PnCounter(c) => {
                let op: PnCounterOp = decode(payload)?;
                c.apply_remote_operation(op).await
            }
            Self::GSet(s) => {
                let op: GSetOp<String> = decode(payload)?;
                s.apply_remote_operation(op).await
            }
            Self::OrSet(s) => {
                let op: OrSetOp<String> = decode(payload)?;
                s.apply_remote_operation(op).await
            }
            Self::LwwRegister(r) => {
                let op: LwwOp<JsonValue> = decode(payload)?;
                r.apply_remote_operation(op).await
            }
            Self::TimeSeries(t) => {
                let op: TimeSeriesOp = decode(payload)?;
                t.apply_remote_operation(op).await
            }
            Self::Graph(g) => {
                let op: GraphOp<String> = decode(payload)?;
                g.apply_remote_operation(op).await
            }
            Self::Workflow(w) => {
                let op: WorkflowOp = decode(payload)?;
                w.apply_remote_operation(op).await
            }
        }
    }

    /// Merge another instance of the same type into this one.
    pub async fn merge_with(&mut self, other: &CrdtInstance) -> Result<()> {
        match (self, other) {
            (Self::GCounter(a), Self::GCounter(b)) => a.merge(b).await,
            (Self::PnCounter(a), Self::PnCounter(b)) => a.merge(b).await,
            (Self::GSet(a), Self::GSet(b)) => a.merge(b).await,
            (Self::OrSet(a), Self::OrSet(b)) => a.merge(b).await,
            (Self::LwwRegister(a), Self::LwwRegister(b)) => a.merge(b).await,
            (Self::TimeSeries(a), Self::TimeSeries(b)) => a.merge(b).await,
            (Self::Graph(a), Self::Graph(b)) => a.merge(b).await,
            (Self::Workflow(a), Self::Workflow(b)) => a.merge(b).await,
            (a, b) => Err(CrdtError::TypeMismatch {
                expected: a.type_tag().to_string(),
                actual: b.type_tag().to_string(),
            }),
        }
    }

    /// Canonical state bytes for storage and full-state sync.
    pub fn state_bytes(&self) -> Result<Bytes> {
        match self {
            Self::GCounter(c) => c.to_bytes(),
            Self::PnCounter(c) => c.to_bytes(),
            Self::GSet(s) => s.to_bytes(),
            Self::OrSet(s) => s.to_bytes(),
            Self::LwwRegister(r) => r.to_bytes(),
            Self::TimeSeries(t) => t.to_bytes(),
            Self::Graph(g) => g.to_bytes(),
            Self::Workflow(w) => w.to_bytes(),
        }
    }

    /// Rebuild an instance from canonical state bytes.
    pub fn from_state_bytes(type_tag: TypeTag, node_id: NodeId, bytes: &[u8]) -> Result<Self> {
        Ok(match type_tag {
            TypeTag::GCounter => Self::GCounter(GCounter::from_bytes(node_id, bytes)?),
            TypeTag::PnCounter => Self::PnCounter(PnCounter::from_bytes(node_id, bytes)?),
            TypeTag::GSet => Self::GSet(GSet::from_bytes(node_id, bytes)?),
            TypeTag::OrSet => Self::OrSet(OrSet::from_bytes(node_id, bytes)?),
            TypeTag::LwwRegister => Self::LwwRegister(LwwRegister::from_bytes(node_id, bytes)?),
            TypeTag::TimeSeries => Self::TimeSeries(TimeSeries::from_bytes(node_id, bytes)?),
            TypeTag::Graph => Self::Graph(Graph::from_bytes(node_id, bytes)?),
            TypeTag::Workflow => Self::Workflow(Workflow::from_bytes(node_id, bytes)?),
        })
    }

    /// Merge canonical state bytes of the same type into this instance.
    pub async fn merge_state_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let incoming = Self::from_state_bytes(self.type_tag(), self.node_id(), bytes)?;
        self.merge_with(&incoming).await
    }

    /// Project the instance to its JSON domain value.
    pub fn value_json(&self) -> serde_json::Value {
        match self {
            Self::GCounter(c) => serde_json::json!(Materialize::value(c)),
            Self::PnCounter(c) => serde_json::json!(Materialize::value(c)),
            Self::GSet(s) => {
                let mut elements: Vec<String> = s.value().into_iter().collect();
                elements.sort();
                serde_json::json!(elements)
            }
            Self::OrSet(s) => {
                let mut elements: Vec<String> = s.value().into_iter().collect();
                elements.sort();
                serde_json::json!(elements)
            }
            Self::LwwRegister(r) => r
                .value()
                .map(JsonValue::into_json)
                .unwrap_or(serde_json::Value::Null),
            Self::TimeSeries(t) => serde_json::json!(t
                .value()
                .iter()
                .map(|TimePoint { timestamp, value }| {
                    serde_json::json!({"timestamp": timestamp.as_millis(), "value": value})
                })
                .collect::<Vec<_>>()),
            Self::Graph(g) => {
                let view = g.value();
                let mut vertices: Vec<String> = view.vertices.into_iter().collect();
                vertices.sort();
                let mut edges: Vec<serde_json::Value> = view
                    .edges
                    .iter()
                    .map(|e| serde_json::json!({"from": e.from, "to": e.to}))
                    .collect();
                edges.sort_by_key(|e| e.to_string());
                serde_json::json!({"vertices": vertices, "edges": edges})
            }
            Self::Workflow(w) => {
                let view = w.value();
                let steps: std::collections::BTreeMap<String, String> = view
                    .steps
                    .into_iter()
                    .map(|(step, status)| (step, status.to_string()))
                    .collect();
                let mut completed: Vec<String> = view.completed.into_iter().collect();
                completed.sort();
                serde_json::json!({"steps": steps, "completed": completed})
            }
        }
    }

    /// Approximate in-memory size
    pub fn size_bytes(&self) -> usize {
        match self {
            Self::GCounter(c) => c.size_bytes(),
            Self::PnCounter(c) => c.size_bytes(),
            Self::GSet(s) => s.size_bytes(),
            Self::OrSet(s) => s.size_bytes(),
            Self::LwwRegister(r) => r.size_bytes(),
            Self::TimeSeries(t) => t.size_bytes(),
            Self::Graph(g) => g.size_bytes(),
            Self::Workflow(w) => w.size_bytes(),
        }
    }

    /// Whether a GC pass would reclaim anything
    pub fn needs_gc(&self) -> bool {
        match self {
            Self::OrSet(s) => s.needs_gc(),
            Self::TimeSeries(t) => t.needs_gc(),
            Self::Graph(g) => g.needs_gc(),
            Self::Workflow(w) => w.needs_gc(),
            _ => false,
        }
    }

    /// Reclaim tombstones and acked history covered by the watermark.
    pub async fn collect(&mut self, watermark: &VectorClock) -> Result<usize> {
        match self {
            Self::OrSet(s) => s.collect(watermark).await,
            Self::TimeSeries(t) => t.collect(watermark).await,
            Self::Graph(g) => g.collect(watermark).await,
            Self::Workflow(w) => w.collect(watermark).await,
            _ => Ok(0),
        }
    }
}

fn encode<T: Serialize>(op: &T) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(op)?))
}

fn decode<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T> {
    bincode::deserialize(payload)
        .map_err(|e| CrdtError::malformed(format!("undecodable operation payload: {e}")))
}
