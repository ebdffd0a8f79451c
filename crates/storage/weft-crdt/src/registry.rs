//! Instance registry: creation, lookup, local apply, remote merge,
//! persistence, and change notification for named CRDT instances.
//!
//! The registry is an explicit object with an injected store; tests build
//! as many isolated registries as they need. Instances are indexed by
//! `(type_tag, key)` and lazily materialized from persisted bytes on first
//! access. Callers touching different instances never contend; operations
//! against one instance serialize through its cell mutex, which preserves
//! the causal order of local writes.

use crate::{
    error::{CrdtError, Result},
    instance::{CrdtInstance, LocalChange},
    resolver::{Conflict, ConflictCategory},
    store::StateStore,
    types::{
        DeltaEnvelope, InstanceKey, InstanceMeta, NodeId, OperationRecord, TypeTag, VectorClock,
    },
};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, warn};
use weft_core::Validatable;

/// Registry tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Schema version stamped on new instances
    pub schema_version: u32,
    /// Capacity of each instance's change-event channel
    pub event_buffer: usize,
    /// Maximum operation records retained per instance for delta serving;
    /// peers further behind fall back to full-state sync
    pub max_log_records: usize,
    /// Persist canonical bytes after every successful apply or merge
    pub persist_on_apply: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            event_buffer: 64,
            max_log_records: 4096,
            persist_on_apply: true,
        }
    }
}

impl Validatable for RegistryConfig {
    fn validate(&self) -> weft_core::WeftResult<()> {
        weft_core::traits::validate_range("event_buffer", self.event_buffer, 1, 65_536)?;
        weft_core::traits::validate_range("max_log_records", self.max_log_records, 16, 1_048_576)?;
        Ok(())
    }
}

/// Why an instance changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A local apply through the registry
    Local,
    /// A merged delta, possibly attributed to a peer
    Remote {
        /// The peer the delta came from, when known
        peer: Option<NodeId>,
    },
}

/// Notification delivered to subscribers after a successful apply or merge
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// The instance that changed
    pub key: InstanceKey,
    /// What caused the change
    pub origin: ChangeOrigin,
    /// When the registry recorded it
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Health/status projection for one instance
#[derive(Debug, Clone)]
pub struct InstanceStatus {
    /// The instance
    pub key: InstanceKey,
    /// Applied-operation clock
    pub clock: VectorClock,
    /// Creation time
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Last mutation time
    pub modified_at: chrono::DateTime<chrono::Utc>,
    /// Last sync round that touched the instance
    pub last_synced: Option<chrono::DateTime<chrono::Utc>>,
    /// Conflicts detected but not yet settled by the resolver
    pub pending_conflicts: usize,
    /// Set when persisted bytes were corrupt and the instance is waiting
    /// to be rebuilt from a full-state delta
    pub needs_recovery: bool,
    /// Approximate in-memory size
    pub size_bytes: usize,
}

/// Outcome of merging one delta envelope
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Operations applied
    pub applied: usize,
    /// Operations dropped as already-seen duplicates
    pub duplicates: usize,
    /// Operations rejected by payload validation
    pub malformed: usize,
    /// Whether the envelope was concurrent with local history
    pub concurrent: bool,
}

impl MergeReport {
    /// Whether anything new reached the instance
    pub fn changed(&self) -> bool {
        self.applied > 0
    }
}

/// Persisted form of an instance: canonical state plus registry bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct InstanceSnapshot {
    type_tag: TypeTag,
    key: String,
    schema_version: u32,
    meta: InstanceMeta,
    applied: VectorClock,
    state: Bytes,
}

struct CellInner {
    crdt: CrdtInstance,
    meta: InstanceMeta,
    /// Highest applied sequence per node; duplicate suppression and the
    /// advertised clock during sync rounds.
    applied: VectorClock,
    /// Recent operations for delta serving, oldest first.
    log: VecDeque<OperationRecord>,
    /// Highest sequence per node evicted from the log; peers behind this
    /// floor get full-state sync.
    log_floor: VectorClock,
    pending_conflicts: usize,
    needs_recovery: bool,
}

/// One registry slot: the instance plus its event channel
pub struct InstanceCell {
    key: InstanceKey,
    inner: Mutex<CellInner>,
    events: broadcast::Sender<ChangeEvent>,
}

impl InstanceCell {
    fn new(key: InstanceKey, inner: CellInner, event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer);
        Self {
            key,
            inner: Mutex::new(inner),
            events,
        }
    }

    /// The instance key this cell holds
    pub fn key(&self) -> &InstanceKey {
        &self.key
    }

    /// Subscribe to change events for this instance
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    fn notify(&self, origin: ChangeOrigin) {
        // Send fails only when nobody is subscribed.
        let _ = self.events.send(ChangeEvent {
            key: self.key.clone(),
            origin,
            at: chrono::Utc::now(),
        });
    }
}

#[derive(Debug, Default)]
struct RegistryStats {
    local_applies: AtomicU64,
    merged_operations: AtomicU64,
    duplicate_operations: AtomicU64,
    malformed_operations: AtomicU64,
    conflicts_detected: AtomicU64,
}

/// The instance registry
pub struct CrdtRegistry {
    node_id: NodeId,
    config: RegistryConfig,
    store: Arc<dyn StateStore>,
    instances: DashMap<InstanceKey, Arc<InstanceCell>>,
    conflict_tx: SyncMutex<Option<mpsc::Sender<Conflict>>>,
    stats: RegistryStats,
}

impl CrdtRegistry {
    /// Create a registry with default configuration
    pub fn new(node_id: NodeId, store: Arc<dyn StateStore>) -> Self {
        Self::with_config(node_id, store, RegistryConfig::default())
    }

    /// Create a registry with explicit configuration
    pub fn with_config(
        node_id: NodeId,
        store: Arc<dyn StateStore>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            node_id,
            config,
            store,
            instances: DashMap::new(),
            conflict_tx: SyncMutex::new(None),
            stats: RegistryStats::default(),
        }
    }

    /// This registry's node ID
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Route detected semantic conflicts to a resolver input channel.
    pub fn set_conflict_channel(&self, tx: mpsc::Sender<Conflict>) {
        *self.conflict_tx.lock() = Some(tx);
    }

    /// Keys of all materialized instances
    pub fn keys(&self) -> Vec<InstanceKey> {
        self.instances.iter().map(|e| e.key().clone()).collect()
    }

    /// Get or lazily create the instance for `(type_tag, key)`.
    ///
    /// First access tries the store; corrupt bytes surface in the status
    /// as `needs_recovery` and the instance starts from the last valid
    /// network delta rather than silently resetting history.
    pub async fn get_or_create(&self, type_tag: TypeTag, key: &str) -> Result<Arc<InstanceCell>> {
        let instance_key = InstanceKey::new(type_tag, key);
        if let Some(cell) = self.instances.get(&instance_key) {
            return Ok(cell.clone());
        }

        let inner = match self.store.load(type_tag, key).await? {
            Some(bytes) => match self.materialize(type_tag, key, &bytes) {
                Ok(inner) => inner,
                Err(error) => {
                    warn!(
                        instance = %instance_key,
                        %error,
                        "persisted state is corrupt; awaiting recovery from a full-state delta"
                    );
                    let mut inner = self.fresh_cell(type_tag);
                    inner.needs_recovery = true;
                    inner
                }
            },
            None => {
                debug!(instance = %instance_key, "materializing new instance");
                self.fresh_cell(type_tag)
            }
        };

        let cell = Arc::new(InstanceCell::new(
            instance_key.clone(),
            inner,
            self.config.event_buffer,
        ));
        let entry = self.instances.entry(instance_key).or_insert(cell).clone();
        Ok(entry)
    }

    fn fresh_cell(&self, type_tag: TypeTag) -> CellInner {
        CellInner {
            crdt: CrdtInstance::new(type_tag, self.node_id),
            meta: InstanceMeta::new(self.config.schema_version),
            applied: VectorClock::new(),
            log: VecDeque::new(),
            log_floor: VectorClock::new(),
            pending_conflicts: 0,
            needs_recovery: false,
        }
    }

    fn materialize(&self, type_tag: TypeTag, key: &str, bytes: &[u8]) -> Result<CellInner> {
        let snapshot: InstanceSnapshot = bincode::deserialize(bytes)?;
        if snapshot.type_tag != type_tag || snapshot.key != key {
            return Err(CrdtError::SerializationFailure(format!(
                "snapshot addressed to {}/{}, expected {}/{}",
                snapshot.type_tag, snapshot.key, type_tag, key
            )));
        }
        if snapshot.schema_version > self.config.schema_version {
            return Err(CrdtError::SerializationFailure(format!(
                "snapshot schema v{} is newer than supported v{}",
                snapshot.schema_version, self.config.schema_version
            )));
        }
        let crdt = CrdtInstance::from_state_bytes(type_tag, self.node_id, &snapshot.state)?;
        Ok(CellInner {
            crdt,
            meta: snapshot.meta,
            // The log is not persisted; anything from before this process
            // is served to peers as full state.
            log_floor: snapshot.applied.clone(),
            applied: snapshot.applied,
            log: VecDeque::new(),
            pending_conflicts: 0,
            needs_recovery: false,
        })
    }

    /// Apply a local change to an instance, creating it if needed.
    pub async fn apply_local(
        &self,
        type_tag: TypeTag,
        key: &str,
        change: LocalChange,
    ) -> Result<OperationRecord> {
        let cell = self.get_or_create(type_tag, key).await?;

        let (record, snapshot) = {
            let mut inner = cell.inner.lock().await;
            let record = inner.crdt.apply_local(change).await?;
            inner.applied.observe(record.node_id, record.local_sequence);
            Self::push_log(&mut inner, record.clone(), self.config.max_log_records);
            inner.meta.touch();
            let snapshot = self.snapshot_bytes(&cell.key, &inner)?;
            (record, snapshot)
        };

        self.persist(&cell.key, snapshot).await?;
        self.stats.local_applies.fetch_add(1, Ordering::Relaxed);
        cell.notify(ChangeOrigin::Local);
        Ok(record)
    }

    /// Merge an incoming delta envelope through duplicate suppression,
    /// validation, and conflict detection.
    pub async fn merge_delta(
        &self,
        envelope: &DeltaEnvelope,
        from_peer: Option<NodeId>,
    ) -> Result<MergeReport> {
        let cell = self.get_or_create(envelope.type_tag, &envelope.key).await?;

        let mut report = MergeReport::default();
        let mut conflict: Option<Conflict> = None;

        let snapshot = {
            let mut inner = cell.inner.lock().await;

            report.concurrent = inner.applied.is_concurrent(&envelope.sender_clock);
            if report.concurrent {
                if let Some(candidate) =
                    self.classify_conflict(&cell.key, &inner, envelope, from_peer)
                {
                    inner.pending_conflicts += 1;
                    conflict = Some(candidate);
                }
            }

            for record in &envelope.operations {
                if inner.applied.covers(record.node_id, record.local_sequence) {
                    // ClockRegression territory: an already-covered
                    // sequence is a duplicate, never a sync failure.
                    report.duplicates += 1;
                    continue;
                }
                match inner.crdt.apply_remote_payload(&record.payload).await {
                    Ok(()) => {
                        inner.applied.observe(record.node_id, record.local_sequence);
                        Self::push_log(&mut inner, record.clone(), self.config.max_log_records);
                        report.applied += 1;
                    }
                    Err(error @ CrdtError::MalformedOperation { .. }) => {
                        warn!(
                            instance = %cell.key,
                            node = %record.node_id,
                            sequence = record.local_sequence,
                            %error,
                            "rejected malformed operation"
                        );
                        report.malformed += 1;
                    }
                    Err(error) => return Err(error),
                }
            }

            if let Some(state) = &envelope.full_state {
                inner.crdt.merge_state_bytes(state).await?;
                inner.applied.merge(&envelope.sender_clock);
                inner.needs_recovery = false;
                report.applied += 1;
            }

            if report.changed() {
                inner.meta.touch();
            }
            inner.meta.last_synced = Some(chrono::Utc::now());

            if report.changed() && self.config.persist_on_apply {
                Some(self.snapshot_bytes(&cell.key, &inner)?)
            } else {
                None
            }
        };

        if let Some(snapshot) = snapshot {
            self.persist(&cell.key, snapshot).await?;
        }

        self.stats
            .merged_operations
            .fetch_add(report.applied as u64, Ordering::Relaxed);
        self.stats
            .duplicate_operations
            .fetch_add(report.duplicates as u64, Ordering::Relaxed);
        self.stats
            .malformed_operations
            .fetch_add(report.malformed as u64, Ordering::Relaxed);

        if let Some(conflict) = conflict {
            self.stats.conflicts_detected.fetch_add(1, Ordering::Relaxed);
            let tx = self.conflict_tx.lock().clone();
            if let Some(tx) = tx {
                if tx.send(conflict).await.is_err() {
                    warn!(instance = %cell.key, "conflict resolver channel closed");
                }
            }
        }

        if report.changed() {
            cell.notify(ChangeOrigin::Remote { peer: from_peer });
        }
        Ok(report)
    }

    fn classify_conflict(
        &self,
        key: &InstanceKey,
        inner: &CellInner,
        envelope: &DeltaEnvelope,
        from_peer: Option<NodeId>,
    ) -> Option<Conflict> {
        // Counters, grow-only sets, and time series join without semantic
        // ambiguity; only register-like and structural types are worth a
        // resolver pass.
        let category = match key.type_tag {
            TypeTag::LwwRegister | TypeTag::Workflow => ConflictCategory::Value,
            TypeTag::OrSet | TypeTag::Graph => ConflictCategory::Structural,
            _ => return None,
        };
        Some(Conflict::new(
            key.clone(),
            category,
            format!(
                "concurrent operation window ({} local entries vs {} sender entries)",
                inner.applied.len(),
                envelope.sender_clock.len()
            ),
            inner.crdt.value_json(),
            from_peer,
        ))
    }

    fn push_log(inner: &mut CellInner, record: OperationRecord, max_records: usize) {
        inner.log.push_back(record);
        while inner.log.len() > max_records {
            if let Some(evicted) = inner.log.pop_front() {
                inner
                    .log_floor
                    .observe(evicted.node_id, evicted.local_sequence);
            }
        }
    }

    /// Build the delta a peer at `peer_clock` is missing, or `None` when
    /// the peer is already current.
    pub async fn delta_for(
        &self,
        type_tag: TypeTag,
        key: &str,
        peer_clock: &VectorClock,
    ) -> Result<Option<DeltaEnvelope>> {
        let instance_key = InstanceKey::new(type_tag, key);
        let cell = match self.instances.get(&instance_key) {
            Some(cell) => cell.clone(),
            None => return Ok(None),
        };

        let inner = cell.inner.lock().await;
        if peer_clock.dominates(&inner.applied) {
            return Ok(None);
        }

        // A peer behind the log floor cannot be caught up from retained
        // operations; hand it canonical state instead.
        let gap = inner
            .log_floor
            .nodes()
            .any(|node| peer_clock.get(node) < inner.log_floor.get(node));

        let envelope = if gap {
            DeltaEnvelope {
                type_tag,
                key: key.to_string(),
                sender_clock: inner.applied.clone(),
                operations: Vec::new(),
                full_state: Some(inner.crdt.state_bytes()?),
            }
        } else {
            let operations: Vec<OperationRecord> = inner
                .log
                .iter()
                .filter(|record| !peer_clock.covers(record.node_id, record.local_sequence))
                .cloned()
                .collect();
            DeltaEnvelope {
                type_tag,
                key: key.to_string(),
                sender_clock: inner.applied.clone(),
                operations,
                full_state: None,
            }
        };

        if envelope.is_empty() {
            Ok(None)
        } else {
            Ok(Some(envelope))
        }
    }

    /// Read an instance's domain value
    pub async fn value(&self, type_tag: TypeTag, key: &str) -> Result<serde_json::Value> {
        let cell = self.existing(type_tag, key)?;
        let inner = cell.inner.lock().await;
        Ok(inner.crdt.value_json())
    }

    /// Export the instance snapshot for archival collaborators
    pub async fn export_state(&self, type_tag: TypeTag, key: &str) -> Result<Bytes> {
        let cell = self.existing(type_tag, key)?;
        let inner = cell.inner.lock().await;
        self.snapshot_bytes(&cell.key, &inner)
    }

    /// Import a snapshot, merging it into current state
    pub async fn import_state(&self, type_tag: TypeTag, key: &str, bytes: &[u8]) -> Result<()> {
        let snapshot: InstanceSnapshot = bincode::deserialize(bytes)?;
        if snapshot.type_tag != type_tag {
            return Err(CrdtError::TypeMismatch {
                expected: type_tag.to_string(),
                actual: snapshot.type_tag.to_string(),
            });
        }

        let cell = self.get_or_create(type_tag, key).await?;
        let persisted = {
            let mut inner = cell.inner.lock().await;
            inner.crdt.merge_state_bytes(&snapshot.state).await?;
            inner.applied.merge(&snapshot.applied);
            inner.needs_recovery = false;
            inner.meta.touch();
            self.snapshot_bytes(&cell.key, &inner)?
        };
        self.persist(&cell.key, persisted).await?;
        cell.notify(ChangeOrigin::Remote { peer: None });
        Ok(())
    }

    /// Subscribe to change events, creating the instance if needed
    pub async fn subscribe(
        &self,
        type_tag: TypeTag,
        key: &str,
    ) -> Result<broadcast::Receiver<ChangeEvent>> {
        Ok(self.get_or_create(type_tag, key).await?.subscribe())
    }

    /// Status projection for one instance
    pub async fn status(&self, type_tag: TypeTag, key: &str) -> Result<InstanceStatus> {
        let cell = self.existing(type_tag, key)?;
        let inner = cell.inner.lock().await;
        Ok(InstanceStatus {
            key: cell.key.clone(),
            clock: inner.applied.clone(),
            created_at: inner.meta.created_at,
            modified_at: inner.meta.modified_at,
            last_synced: inner.meta.last_synced,
            pending_conflicts: inner.pending_conflicts,
            needs_recovery: inner.needs_recovery,
            size_bytes: inner.crdt.size_bytes(),
        })
    }

    /// The applied clock advertised during sync rounds
    pub async fn instance_clock(&self, type_tag: TypeTag, key: &str) -> Result<VectorClock> {
        let cell = self.existing(type_tag, key)?;
        let inner = cell.inner.lock().await;
        Ok(inner.applied.clone())
    }

    /// Record that the resolver settled `count` conflicts for an instance
    pub async fn note_conflicts_settled(&self, key: &InstanceKey, count: usize) {
        if let Some(cell) = self.instances.get(key).map(|c| c.clone()) {
            let mut inner = cell.inner.lock().await;
            inner.pending_conflicts = inner.pending_conflicts.saturating_sub(count);
        }
    }

    /// Garbage-collect one instance under its acked watermark.
    pub async fn collect_instance(
        &self,
        key: &InstanceKey,
        watermark: &VectorClock,
    ) -> Result<usize> {
        let cell = match self.instances.get(key) {
            Some(cell) => cell.clone(),
            None => return Ok(0),
        };

        let mut inner = cell.inner.lock().await;
        let mut reclaimed = inner.crdt.collect(watermark).await?;

        // Acked log records will never be requested again.
        while let Some(front) = inner.log.front() {
            if !watermark.covers(front.node_id, front.local_sequence) {
                break;
            }
            if let Some(evicted) = inner.log.pop_front() {
                inner
                    .log_floor
                    .observe(evicted.node_id, evicted.local_sequence);
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Run a garbage-collection pass over every instance with one shared
    /// watermark. Returns total entries reclaimed.
    pub async fn collect_garbage(&self, watermark: &VectorClock) -> Result<usize> {
        let mut reclaimed = 0;
        for key in self.keys() {
            reclaimed += self.collect_instance(&key, watermark).await?;
        }
        Ok(reclaimed)
    }

    /// Counter snapshot for the metrics collaborator
    pub fn metrics_snapshot(&self) -> std::collections::HashMap<String, f64> {
        let mut metrics = std::collections::HashMap::new();
        metrics.insert(
            "registry.instances".to_string(),
            self.instances.len() as f64,
        );
        metrics.insert(
            "registry.local_applies".to_string(),
            self.stats.local_applies.load(Ordering::Relaxed) as f64,
        );
        metrics.insert(
            "registry.merged_operations".to_string(),
            self.stats.merged_operations.load(Ordering::Relaxed) as f64,
        );
        metrics.insert(
            "registry.duplicate_operations".to_string(),
            self.stats.duplicate_operations.load(Ordering::Relaxed) as f64,
        );
        metrics.insert(
            "registry.malformed_operations".to_string(),
            self.stats.malformed_operations.load(Ordering::Relaxed) as f64,
        );
        metrics.insert(
            "registry.conflicts_detected".to_string(),
            self.stats.conflicts_detected.load(Ordering::Relaxed) as f64,
        );
        metrics
    }

    fn existing(&self, type_tag: TypeTag, key: &str) -> Result<Arc<InstanceCell>> {
        let instance_key = InstanceKey::new(type_tag, key);
        self.instances
            .get(&instance_key)
            .map(|cell| cell.clone())
            .ok_or_else(|| CrdtError::NotFound(instance_key.to_string()))
    }

    fn snapshot_bytes(&self, key: &InstanceKey, inner: &CellInner) -> Result<Bytes> {
        let snapshot = InstanceSnapshot {
            type_tag: key.type_tag,
            key: key.key.clone(),
            schema_version: self.config.schema_version,
            meta: inner.meta.clone(),
            applied: inner.applied.clone(),
            state: inner.crdt.state_bytes()?,
        };
        Ok(Bytes::from(bincode::serialize(&snapshot)?))
    }

    async fn persist(&self, key: &InstanceKey, bytes: Bytes) -> Result<()> {
        if !self.config.persist_on_apply {
            return Ok(());
        }
        self.store.save(key.type_tag, &key.key, bytes).await
    }
}

#[async_trait::async_trait]
impl weft_core::Observable for CrdtRegistry {
    async fn status(&self) -> weft_core::WeftResult<weft_core::ObservableStatus> {
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("node_id".to_string(), self.node_id.to_string());
        metadata.insert("instances".to_string(), self.instances.len().to_string());
        Ok(weft_core::ObservableStatus {
            state: weft_core::ObservableState::Running,
            last_updated: chrono::Utc::now(),
            metadata,
        })
    }

    async fn health(&self) -> weft_core::WeftResult<weft_core::HealthStatus> {
        let cells: Vec<Arc<InstanceCell>> =
            self.instances.iter().map(|e| e.value().clone()).collect();
        let mut recovering = 0usize;
        for cell in cells {
            if cell.inner.lock().await.needs_recovery {
                recovering += 1;
            }
        }

        let level = if recovering == 0 {
            weft_core::HealthLevel::Healthy
        } else {
            weft_core::HealthLevel::Warning
        };
        let mut checks = std::collections::HashMap::new();
        checks.insert(
            "instances".to_string(),
            weft_core::traits::HealthCheck::new(
                level,
                format!("{recovering} instances awaiting recovery"),
            ),
        );
        Ok(weft_core::HealthStatus::from_checks(checks))
    }

    async fn metrics(&self) -> weft_core::WeftResult<std::collections::HashMap<String, f64>> {
        Ok(self.metrics_snapshot())
    }

    fn describe(&self) -> String {
        format!(
            "CrdtRegistry[{}]: {} instances",
            self.node_id,
            self.instances.len()
        )
    }
}
