//! Semantic conflict resolution.
//!
//! The algebraic merge always succeeds; this layer classifies concurrent,
//! non-trivially-mergeable windows that a business rule may care about and
//! applies a per-category strategy. It is an overlay: an unresolvable
//! conflict is reported on the outcome channel while the underlying merge
//! has already proceeded, so convergence is never held hostage.
//!
//! Conflicts are batched (size and timeout bounded) before processing to
//! amortize resolution cost under load.

use crate::types::{InstanceKey, NodeId};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tracing::{debug, warn};
use weft_core::Validatable;

/// What kind of conflict was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictCategory {
    /// Concurrent writes to register-like state
    Value,
    /// Concurrent structural edits (set membership, graph shape)
    Structural,
    /// A business rule flagged the merge for review
    Policy,
}

/// How a category of conflicts is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionStrategy {
    /// Accept the CRDT merge result as-is
    AlgebraicMerge,
    /// Pick the candidate with the highest confidence score
    ConfidenceWeighted,
    /// Queue for a human or downstream collaborator
    Deferred,
}

/// A candidate value competing in confidence-weighted selection
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictCandidate {
    /// The proposed value
    pub value: serde_json::Value,
    /// Resolver-supplied confidence in [0, 1]
    pub confidence: f64,
    /// Where the candidate came from, when known
    pub origin: Option<NodeId>,
}

/// A detected semantic conflict
#[derive(Debug, Clone)]
pub struct Conflict {
    /// The instance the conflict occurred on
    pub key: InstanceKey,
    /// Classification
    pub category: ConflictCategory,
    /// Human-readable description of the conflicting window
    pub description: String,
    /// The locally merged value at detection time
    pub merged_value: serde_json::Value,
    /// The peer whose delta raised the conflict, when known
    pub peer: Option<NodeId>,
    /// Competing candidates for confidence-weighted selection
    pub candidates: Vec<ConflictCandidate>,
    /// When the conflict was detected
    pub detected_at: chrono::DateTime<chrono::Utc>,
}

impl Conflict {
    /// Create a conflict record
    pub fn new(
        key: InstanceKey,
        category: ConflictCategory,
        description: String,
        merged_value: serde_json::Value,
        peer: Option<NodeId>,
    ) -> Self {
        Self {
            key,
            category,
            description,
            merged_value,
            peer,
            candidates: Vec::new(),
            detected_at: chrono::Utc::now(),
        }
    }

    /// Attach competing candidates
    pub fn with_candidates(mut self, candidates: Vec<ConflictCandidate>) -> Self {
        self.candidates = candidates;
        self
    }
}

/// The decision reached for one conflict
#[derive(Debug, Clone)]
pub enum Decision {
    /// The algebraic merge result stands
    AcceptMerge,
    /// A candidate was selected by confidence
    Selected {
        /// The winning value
        value: serde_json::Value,
        /// Its confidence score
        confidence: f64,
    },
    /// Handed to a downstream queue
    Deferred,
    /// No strategy could settle it; reported, never dropped
    Unresolved {
        /// Why resolution failed
        reason: String,
    },
}

/// Outcome delivered on the resolver's output channel
#[derive(Debug, Clone)]
pub struct ResolutionOutcome {
    /// The conflict that was processed
    pub conflict: Conflict,
    /// The decision reached
    pub decision: Decision,
}

/// Resolver tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Flush a batch once it reaches this many conflicts
    pub batch_size: usize,
    /// Flush a non-empty batch after this long regardless of size
    pub batch_timeout: Duration,
    /// Strategy per conflict category
    pub strategies: HashMap<ConflictCategory, ResolutionStrategy>,
    /// Capacity of the inbound conflict channel
    pub channel_capacity: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        let mut strategies = HashMap::new();
        strategies.insert(ConflictCategory::Value, ResolutionStrategy::ConfidenceWeighted);
        strategies.insert(ConflictCategory::Structural, ResolutionStrategy::AlgebraicMerge);
        strategies.insert(ConflictCategory::Policy, ResolutionStrategy::Deferred);
        Self {
            batch_size: 100,
            batch_timeout: Duration::from_millis(50),
            strategies,
            channel_capacity: 1024,
        }
    }
}

impl Validatable for ResolverConfig {
    fn validate(&self) -> weft_core::WeftResult<()> {
        weft_core::traits::validate_range("batch_size", self.batch_size, 1, 100_000)?;
        if self.batch_timeout.is_zero() {
            return Err(weft_core::WeftError::config(
                "batch_timeout must be positive",
            ));
        }
        Ok(())
    }
}

/// Running counters exposed to the metrics collaborator
#[derive(Debug, Default)]
pub struct ResolverStats {
    /// Conflicts received
    pub received: AtomicU64,
    /// Batches processed
    pub batches: AtomicU64,
    /// Settled by accepting the algebraic merge
    pub accepted_merges: AtomicU64,
    /// Settled by confidence selection
    pub selections: AtomicU64,
    /// Handed to the deferred queue
    pub deferred: AtomicU64,
    /// Reported as unresolvable
    pub unresolved: AtomicU64,
}

/// Batching conflict resolver
pub struct ConflictResolver {
    config: ResolverConfig,
    stats: Arc<ResolverStats>,
    channels: Option<(mpsc::Receiver<Conflict>, mpsc::Sender<ResolutionOutcome>)>,
}

impl ConflictResolver {
    /// Create a resolver with its inbound and outbound channels.
    ///
    /// Returns `(resolver, conflict_tx, outcome_rx)`; hand `conflict_tx` to
    /// the registry and consume outcomes from `outcome_rx`.
    pub fn new(
        config: ResolverConfig,
    ) -> (Self, mpsc::Sender<Conflict>, mpsc::Receiver<ResolutionOutcome>) {
        let (conflict_tx, conflict_rx) = mpsc::channel(config.channel_capacity);
        let (outcome_tx, outcome_rx) = mpsc::channel(config.channel_capacity);
        let resolver = Self {
            config,
            stats: Arc::new(ResolverStats::default()),
            channels: Some((conflict_rx, outcome_tx)),
        };
        (resolver, conflict_tx, outcome_rx)
    }

    /// Shared statistics handle
    pub fn stats(&self) -> Arc<ResolverStats> {
        Arc::clone(&self.stats)
    }

    /// Run the batching loop until cancelled. Flushes on batch size, on
    /// timeout from the first queued conflict, and on shutdown.
    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) {
        let (mut conflict_rx, outcome_tx) = match self.channels.take() {
            Some(channels) => channels,
            None => return,
        };

        let mut batch: Vec<Conflict> = Vec::with_capacity(self.config.batch_size);
        let mut deadline: Option<Instant> = None;

        loop {
            let timeout = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        self.flush(&mut batch, &outcome_tx).await;
                        break;
                    }
                }
                incoming = conflict_rx.recv() => {
                    match incoming {
                        Some(conflict) => {
                            self.stats.received.fetch_add(1, Ordering::Relaxed);
                            if batch.is_empty() {
                                deadline = Some(Instant::now() + self.config.batch_timeout);
                            }
                            batch.push(conflict);
                            if batch.len() >= self.config.batch_size {
                                self.flush(&mut batch, &outcome_tx).await;
                                deadline = None;
                            }
                        }
                        None => {
                            self.flush(&mut batch, &outcome_tx).await;
                            break;
                        }
                    }
                }
                _ = timeout => {
                    self.flush(&mut batch, &outcome_tx).await;
                    deadline = None;
                }
            }
        }
    }

    async fn flush(&self, batch: &mut Vec<Conflict>, outcome_tx: &mpsc::Sender<ResolutionOutcome>) {
        if batch.is_empty() {
            return;
        }
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        debug!(count = batch.len(), "resolving conflict batch");

        for conflict in batch.drain(..) {
            let decision = self.resolve(&conflict);
            match &decision {
                Decision::AcceptMerge => {
                    self.stats.accepted_merges.fetch_add(1, Ordering::Relaxed);
                }
                Decision::Selected { .. } => {
                    self.stats.selections.fetch_add(1, Ordering::Relaxed);
                }
                Decision::Deferred => {
                    self.stats.deferred.fetch_add(1, Ordering::Relaxed);
                }
                Decision::Unresolved { reason } => {
                    self.stats.unresolved.fetch_add(1, Ordering::Relaxed);
                    warn!(instance = %conflict.key, %reason, "unresolvable conflict reported");
                }
            }
            if outcome_tx
                .send(ResolutionOutcome { conflict, decision })
                .await
                .is_err()
            {
                // Consumer went away; outcomes are droppable at shutdown.
                return;
            }
        }
    }

    /// Apply the configured strategy to one conflict.
    pub fn resolve(&self, conflict: &Conflict) -> Decision {
        let strategy = self
            .config
            .strategies
            .get(&conflict.category)
            .copied()
            .unwrap_or(ResolutionStrategy::AlgebraicMerge);

        match strategy {
            ResolutionStrategy::AlgebraicMerge => Decision::AcceptMerge,
            ResolutionStrategy::Deferred => Decision::Deferred,
            ResolutionStrategy::ConfidenceWeighted => {
                let best = conflict
                    .candidates
                    .iter()
                    .filter(|c| c.confidence.is_finite())
                    .max_by(|a, b| {
                        a.confidence
                            .partial_cmp(&b.confidence)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    });
                match best {
                    Some(candidate) => Decision::Selected {
                        value: candidate.value.clone(),
                        confidence: candidate.confidence,
                    },
                    // Nothing to weigh: the merge result is the only
                    // defensible answer.
                    None if conflict.candidates.is_empty() => Decision::AcceptMerge,
                    None => Decision::Unresolved {
                        reason: "no candidate carries a usable confidence score".to_string(),
                    },
                }
            }
        }
    }
}
