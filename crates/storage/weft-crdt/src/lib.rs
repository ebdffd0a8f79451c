//! # Weft CRDT
//!
//! Conflict-free Replicated Data Types and delta synchronization for the
//! Weft platform's distributed state layer.
//!
//! This crate provides mathematically proven data structures that resolve
//! concurrent mutation without consensus, plus the registry, conflict
//! resolver, and peer synchronization machinery around them.
//!
//! ## Supported CRDTs
//!
//! - **G-Counter / PN-Counter**: grow-only and increment/decrement counters
//! - **G-Set / OR-Set**: grow-only and observed-remove sets (add-wins)
//! - **LWW-Register**: last-writer-wins register for single values
//! - **TimeSeries**: append-only observations with read-time downsampling
//! - **Graph**: vertex/edge sets with bounded, cycle-safe traversal
//! - **Workflow**: per-step LWW status plus monotonic completion
//!
//! ## Guarantees
//!
//! - **Conflict-free**: merge is commutative, associative, and idempotent
//! - **Eventually consistent**: replicas converge to identical state
//! - **Partition tolerant**: local writes continue during splits; one
//!   round after reconnection restores convergence
//! - **Duplicate safe**: redelivered operations are no-ops
//!
//! ## Example
//!
//! ```rust,no_run
//! use weft_crdt::{GCounter, Mergeable, NodeId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut replica1 = GCounter::new(NodeId::new());
//!     let mut replica2 = GCounter::new(NodeId::new());
//!
//!     // Concurrent updates on independent replicas
//!     replica1.increment(5).await?;
//!     replica2.increment(3).await?;
//!
//!     // Merging in both directions converges both sides
//!     replica1.merge(&replica2).await?;
//!     replica2.merge(&replica1).await?;
//!
//!     assert_eq!(replica1.value(), replica2.value());
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod traits;
pub mod types;

// CRDT implementations
pub mod gcounter;
pub mod graph;
pub mod gset;
pub mod lww_register;
pub mod or_set;
pub mod pn_counter;
pub mod time_series;
pub mod workflow;

// Registry and instance plumbing
pub mod instance;
pub mod registry;
pub mod store;

// Synchronization and conflict handling
pub mod clock;
pub mod optimized_sync;
pub mod resolver;
pub mod sync;

// Re-exports for convenience
pub use clock::ClockManager;
pub use error::{CrdtError, Result};
pub use traits::{Crdt, GarbageCollectable, Materialize, Mergeable, Synchronizable};
pub use types::{
    Delta, DeltaEnvelope, InstanceKey, InstanceMeta, JsonValue, NodeId, OperationRecord,
    Timestamp, TypeTag, VectorClock, VectorClockComparison,
};

pub use gcounter::GCounter;
pub use graph::{Edge, Graph, GraphView};
pub use gset::GSet;
pub use lww_register::LwwRegister;
pub use or_set::{ElementTag, OrSet};
pub use pn_counter::PnCounter;
pub use time_series::{Aggregate, RetentionPolicy, TimePoint, TimeSeries};
pub use workflow::{StepStatus, Workflow, WorkflowView};

pub use instance::{CrdtInstance, LocalChange};
pub use registry::{
    ChangeEvent, ChangeOrigin, CrdtRegistry, InstanceStatus, MergeReport, RegistryConfig,
};
pub use resolver::{
    Conflict, ConflictCategory, ConflictResolver, Decision, ResolutionOutcome, ResolutionStrategy,
    ResolverConfig,
};
pub use store::{MemoryStore, StateStore};
pub use sync::{
    MetricsSink, NullMetrics, PeerTransport, SyncConfig, SyncEngine, SyncEvent, SyncService,
};

pub use optimized_sync::{OptimizedSyncEngine, PerfConfig};
