//! Peer synchronization: the delta exchange protocol, peer bookkeeping,
//! and the background sync service.
//!
//! A round between two peers runs: request (initiator's clocks) →
//! response (deltas the initiator is missing, plus the responder's clocks)
//! → finish (deltas the responder is missing, plus acked clocks) → ack.
//! Every message is applied atomically on the receiving side — a frame
//! that fails to decode discards the whole message and the round, and the
//! next round re-sends from the last acked clocks. Partitioned peers back
//! off exponentially while local writes continue untouched.

use crate::{
    error::{CrdtError, Result},
    registry::CrdtRegistry,
    types::{DeltaEnvelope, InstanceKey, NodeId, VectorClock},
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
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
    sync::{mpsc, watch, Mutex},
    time::Instant,
};
use tracing::{debug, info, warn};
use weft_core::Validatable;

/// Transport collaborator: peer discovery plus framed message exchange.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// The local node's identity on this transport
    fn local_node(&self) -> NodeId;

    /// Currently reachable peers
    fn peers(&self) -> Vec<NodeId>;

    /// Send a frame to a peer
    async fn send(&self, to: NodeId, frame: Bytes) -> Result<()>;

    /// Receive the next inbound frame
    async fn recv(&self) -> Result<(NodeId, Bytes)>;
}

/// Metrics collaborator fed by the sync layer.
pub trait MetricsSink: Send + Sync {
    /// A sync round finished
    fn record_round(&self, peer: NodeId, latency: Duration, bytes: usize, operations: usize);

    /// Conflicts detected while merging
    fn record_conflicts(&self, count: usize);

    /// Duplicate operations dropped while merging
    fn record_duplicates(&self, count: usize);
}

/// Metrics sink that discards everything
#[derive(Debug, Default)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn record_round(&self, _peer: NodeId, _latency: Duration, _bytes: usize, _operations: usize) {}
    fn record_conflicts(&self, _count: usize) {}
    fn record_duplicates(&self, _count: usize) {}
}

/// How a wire frame's envelope block is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameEncoding {
    /// Raw bincode
    Plain,
    /// lz4-compressed bincode with a length prefix
    Lz4,
}

/// One delta envelope in wire form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    /// Body encoding
    pub encoding: FrameEncoding,
    /// Encoded (and possibly compressed) envelope
    pub body: Bytes,
}

impl WireFrame {
    /// Encode an envelope, compressing bodies above `compress_threshold`.
    pub fn encode(envelope: &DeltaEnvelope, compress_threshold: usize) -> Result<Self> {
        let raw = bincode::serialize(envelope)?;
        if raw.len() >= compress_threshold {
            let compressed = lz4_flex::compress_prepend_size(&raw);
            Ok(Self {
                encoding: FrameEncoding::Lz4,
                body: Bytes::from(compressed),
            })
        } else {
            Ok(Self {
                encoding: FrameEncoding::Plain,
                body: Bytes::from(raw),
            })
        }
    }

    /// Decode back to an envelope.
    pub fn decode(&self) -> Result<DeltaEnvelope> {
        let raw = match self.encoding {
            FrameEncoding::Plain => self.body.to_vec(),
            FrameEncoding::Lz4 => lz4_flex::decompress_size_prepended(&self.body)
                .map_err(|e| CrdtError::SerializationFailure(format!("lz4: {e}")))?,
        };
        Ok(bincode::deserialize(&raw)?)
    }

    /// Wire size of this frame
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Whether the frame body is empty
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// Messages exchanged during a sync round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Round start: the initiator advertises its clocks
    Request {
        /// Initiating node
        from: NodeId,
        /// Round identifier, unique per initiator
        round_id: u64,
        /// Initiator's per-instance applied clocks
        clocks: Vec<(InstanceKey, VectorClock)>,
    },
    /// Deltas the initiator is missing, plus the responder's clocks
    Response {
        /// Responding node
        from: NodeId,
        /// Round identifier
        round_id: u64,
        /// Deltas for the initiator
        frames: Vec<WireFrame>,
        /// Responder's per-instance applied clocks
        clocks: Vec<(InstanceKey, VectorClock)>,
    },
    /// Deltas the responder is missing, plus the initiator's acked clocks
    Finish {
        /// Initiating node
        from: NodeId,
        /// Round identifier
        round_id: u64,
        /// Deltas for the responder
        frames: Vec<WireFrame>,
        /// Initiator's post-merge clocks
        acked_clocks: Vec<(InstanceKey, VectorClock)>,
    },
    /// Round end: the responder's post-merge clocks
    Ack {
        /// Responding node
        from: NodeId,
        /// Round identifier
        round_id: u64,
        /// Responder's post-merge clocks
        acked_clocks: Vec<(InstanceKey, VectorClock)>,
    },
}

impl SyncMessage {
    /// Encode for the transport
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    /// Decode from the transport
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(Into::into)
    }
}

/// Sync engine tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Background round interval
    pub interval: Duration,
    /// A round older than this is abandoned
    pub round_timeout: Duration,
    /// First retry delay after a transport failure
    pub backoff_base: Duration,
    /// Retry delay ceiling
    pub backoff_cap: Duration,
    /// Compress frames at or above this many bytes
    pub compress_threshold: usize,
    /// Capacity of the service event channel
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            round_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            compress_threshold: 512,
            event_capacity: 256,
        }
    }
}

impl Validatable for SyncConfig {
    fn validate(&self) -> weft_core::WeftResult<()> {
        if self.interval.is_zero() || self.round_timeout.is_zero() {
            return Err(weft_core::WeftError::config(
                "sync intervals must be positive",
            ));
        }
        if self.backoff_base > self.backoff_cap {
            return Err(weft_core::WeftError::config(
                "backoff_base must not exceed backoff_cap",
            ));
        }
        Ok(())
    }
}

/// Per-peer sync bookkeeping
#[derive(Debug, Clone, Default)]
pub struct PeerSyncState {
    /// The peer's last acked clock per instance
    pub last_known: HashMap<InstanceKey, VectorClock>,
    /// Last successful round
    pub last_sync: Option<chrono::DateTime<chrono::Utc>>,
    /// Transport failures since the last success
    pub consecutive_failures: u32,
    /// Exponential-backoff gate; no rounds before this instant
    pub next_attempt: Option<Instant>,
}

/// Stage of an in-flight round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStage {
    /// Request sent, awaiting response
    AwaitingResponse,
    /// Response sent, awaiting finish
    AwaitingFinish,
    /// Finish sent, awaiting ack
    AwaitingAck,
}

/// An in-flight sync round
#[derive(Debug, Clone)]
pub struct SyncSession {
    /// Round identifier
    pub round_id: u64,
    /// The other side
    pub peer: NodeId,
    /// Current stage
    pub stage: RoundStage,
    /// When the round started
    pub started_at: Instant,
}

/// Aggregate sync statistics
#[derive(Debug, Default)]
pub struct SyncStatistics {
    /// Rounds initiated locally
    pub rounds_started: AtomicU64,
    /// Rounds completed (either role)
    pub rounds_completed: AtomicU64,
    /// Rounds failed or expired
    pub rounds_failed: AtomicU64,
    /// Bytes sent in frames
    pub bytes_sent: AtomicU64,
    /// Bytes received in frames
    pub bytes_received: AtomicU64,
    /// Operations applied from peers
    pub operations_applied: AtomicU64,
    /// Duplicate operations dropped
    pub duplicates_dropped: AtomicU64,
}

/// The synchronization engine: protocol handling plus peer bookkeeping.
pub struct SyncEngine {
    registry: Arc<CrdtRegistry>,
    transport: Arc<dyn PeerTransport>,
    metrics: Arc<dyn MetricsSink>,
    config: SyncConfig,
    peers: DashMap<NodeId, PeerSyncState>,
    /// In-flight rounds keyed by `(initiator, round_id)`; initiator
    /// namespacing keeps simultaneous rounds in both directions apart.
    sessions: DashMap<(NodeId, u64), SyncSession>,
    round_counter: AtomicU64,
    stats: Arc<SyncStatistics>,
    delta_cache: parking_lot::Mutex<Option<Arc<crate::optimized_sync::DeltaCache>>>,
}

impl SyncEngine {
    /// Create a sync engine
    pub fn new(
        registry: Arc<CrdtRegistry>,
        transport: Arc<dyn PeerTransport>,
        metrics: Arc<dyn MetricsSink>,
        config: SyncConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            metrics,
            config,
            peers: DashMap::new(),
            sessions: DashMap::new(),
            round_counter: AtomicU64::new(0),
            stats: Arc::new(SyncStatistics::default()),
            delta_cache: parking_lot::Mutex::new(None),
        }
    }

    /// Shared statistics handle
    pub fn stats(&self) -> Arc<SyncStatistics> {
        Arc::clone(&self.stats)
    }

    /// The registry this engine syncs
    pub fn registry(&self) -> Arc<CrdtRegistry> {
        Arc::clone(&self.registry)
    }

    /// Peers currently reachable on the transport
    pub fn reachable_peers(&self) -> Vec<NodeId> {
        self.transport.peers()
    }

    /// Install a delta cache; subsequent frame builds go through it.
    pub fn install_delta_cache(&self, cache: Arc<crate::optimized_sync::DeltaCache>) {
        *self.delta_cache.lock() = Some(cache);
    }

    /// Receive the next inbound transport frame; pair with
    /// [`handle_frame`](Self::handle_frame) when driving the protocol
    /// without the background service.
    pub async fn recv_frame(&self) -> Result<(NodeId, Bytes)> {
        self.transport.recv().await
    }

    /// Snapshot of a peer's sync state
    pub fn peer_state(&self, peer: NodeId) -> Option<PeerSyncState> {
        self.peers.get(&peer).map(|state| state.clone())
    }

    /// Whether the backoff gate currently blocks a peer
    pub fn is_backed_off(&self, peer: NodeId) -> bool {
        self.peers
            .get(&peer)
            .and_then(|state| state.next_attempt)
            .map_or(false, |at| Instant::now() < at)
    }

    async fn local_clocks(&self) -> Result<Vec<(InstanceKey, VectorClock)>> {
        futures::future::try_join_all(self.registry.keys().into_iter().map(|key| async move {
            let clock = self.registry.instance_clock(key.type_tag, &key.key).await?;
            Ok((key, clock))
        }))
        .await
    }

    /// Start a round with a peer. Honors the backoff gate; transport
    /// failures arm it and leave local state untouched.
    pub async fn begin_round(&self, peer: NodeId) -> Result<Option<u64>> {
        if self.is_backed_off(peer) {
            return Ok(None);
        }

        let round_id = self.round_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let message = SyncMessage::Request {
            from: self.transport.local_node(),
            round_id,
            clocks: self.local_clocks().await?,
        };

        // We are the initiator: the session is keyed under our own id.
        let session_key = (self.transport.local_node(), round_id);
        self.sessions.insert(
            session_key,
            SyncSession {
                round_id,
                peer,
                stage: RoundStage::AwaitingResponse,
                started_at: Instant::now(),
            },
        );
        self.stats.rounds_started.fetch_add(1, Ordering::Relaxed);

        match self.transport.send(peer, message.to_bytes()?).await {
            Ok(()) => Ok(Some(round_id)),
            Err(error) => {
                self.sessions.remove(&session_key);
                self.record_failure(peer);
                Err(error)
            }
        }
    }

    /// Handle one inbound transport frame.
    pub async fn handle_frame(&self, from: NodeId, frame: Bytes) -> Result<()> {
        let message = SyncMessage::from_bytes(&frame)?;
        match message {
            SyncMessage::Request {
                from: peer,
                round_id,
                clocks,
            } => self.handle_request(peer, round_id, clocks).await,
            SyncMessage::Response {
                from: peer,
                round_id,
                frames,
                clocks,
            } => self.handle_response(peer, round_id, frames, clocks).await,
            SyncMessage::Finish {
                from: peer,
                round_id,
                frames,
                acked_clocks,
            } => self.handle_finish(peer, round_id, frames, acked_clocks).await,
            SyncMessage::Ack {
                from: peer,
                round_id,
                acked_clocks,
            } => self.handle_ack(peer, round_id, acked_clocks).await,
        }
        .map_err(|error| {
            if matches!(error, CrdtError::TransportFailure(_)) {
                self.record_failure(from);
            }
            error
        })
    }

    async fn handle_request(
        &self,
        peer: NodeId,
        round_id: u64,
        clocks: Vec<(InstanceKey, VectorClock)>,
    ) -> Result<()> {
        debug!(%peer, round_id, "sync request received");
        self.note_peer_clocks(peer, &clocks);

        let frames = self.build_frames(&clocks).await?;
        let message = SyncMessage::Response {
            from: self.transport.local_node(),
            round_id,
            frames,
            clocks: self.local_clocks().await?,
        };

        // The peer initiated this round; key the session under its id.
        self.sessions.insert(
            (peer, round_id),
            SyncSession {
                round_id,
                peer,
                stage: RoundStage::AwaitingFinish,
                started_at: Instant::now(),
            },
        );
        self.send_counted(peer, &message).await
    }

    async fn handle_response(
        &self,
        peer: NodeId,
        round_id: u64,
        frames: Vec<WireFrame>,
        clocks: Vec<(InstanceKey, VectorClock)>,
    ) -> Result<()> {
        // We initiated this round.
        let session_key = (self.transport.local_node(), round_id);
        self.expect_stage(session_key, RoundStage::AwaitingResponse)?;
        self.note_peer_clocks(peer, &clocks);

        self.apply_frames(peer, frames).await?;

        let frames = self.build_frames(&clocks).await?;
        let message = SyncMessage::Finish {
            from: self.transport.local_node(),
            round_id,
            frames,
            acked_clocks: self.local_clocks().await?,
        };

        if let Some(mut session) = self.sessions.get_mut(&session_key) {
            session.stage = RoundStage::AwaitingAck;
        }
        self.send_counted(peer, &message).await
    }

    async fn handle_finish(
        &self,
        peer: NodeId,
        round_id: u64,
        frames: Vec<WireFrame>,
        acked_clocks: Vec<(InstanceKey, VectorClock)>,
    ) -> Result<()> {
        // The peer initiated this round.
        let session_key = (peer, round_id);
        self.expect_stage(session_key, RoundStage::AwaitingFinish)?;

        self.apply_frames(peer, frames).await?;
        self.note_peer_clocks(peer, &acked_clocks);

        let message = SyncMessage::Ack {
            from: self.transport.local_node(),
            round_id,
            acked_clocks: self.local_clocks().await?,
        };
        self.send_counted(peer, &message).await?;
        self.complete_round(peer, session_key);
        Ok(())
    }

    async fn handle_ack(
        &self,
        peer: NodeId,
        round_id: u64,
        acked_clocks: Vec<(InstanceKey, VectorClock)>,
    ) -> Result<()> {
        // We initiated this round.
        let session_key = (self.transport.local_node(), round_id);
        self.expect_stage(session_key, RoundStage::AwaitingAck)?;
        self.note_peer_clocks(peer, &acked_clocks);
        self.complete_round(peer, session_key);
        Ok(())
    }

    /// Build frames covering everything the peer is missing: instances it
    /// advertised, plus instances it has never heard of.
    async fn build_frames(
        &self,
        peer_clocks: &[(InstanceKey, VectorClock)],
    ) -> Result<Vec<WireFrame>> {
        let advertised: HashMap<&InstanceKey, &VectorClock> =
            peer_clocks.iter().map(|(key, clock)| (key, clock)).collect();
        let empty = VectorClock::new();

        let cache = self.delta_cache.lock().clone();
        let mut frames = Vec::new();
        for key in self.registry.keys() {
            let peer_clock = advertised.get(&key).copied().unwrap_or(&empty);
            let frame = match &cache {
                Some(cache) => {
                    cache
                        .frame_for(
                            &self.registry,
                            &key,
                            peer_clock,
                            self.config.compress_threshold,
                        )
                        .await?
                }
                None => match self
                    .registry
                    .delta_for(key.type_tag, &key.key, peer_clock)
                    .await?
                {
                    Some(envelope) => {
                        Some(WireFrame::encode(&envelope, self.config.compress_threshold)?)
                    }
                    None => None,
                },
            };
            if let Some(frame) = frame {
                frames.push(frame);
            }
        }
        Ok(frames)
    }

    /// Decode every frame before applying anything, so a torn or corrupt
    /// message leaves local state untouched and the round is simply
    /// re-run from the last acked clocks.
    async fn apply_frames(&self, peer: NodeId, frames: Vec<WireFrame>) -> Result<()> {
        let received_bytes: usize = frames.iter().map(WireFrame::len).sum();
        let envelopes: Vec<DeltaEnvelope> = frames
            .iter()
            .map(WireFrame::decode)
            .collect::<Result<Vec<_>>>()?;

        let mut applied = 0usize;
        let mut duplicates = 0usize;
        let mut conflicts = 0usize;
        for envelope in &envelopes {
            let report = self.registry.merge_delta(envelope, Some(peer)).await?;
            applied += report.applied;
            duplicates += report.duplicates;
            if report.concurrent {
                conflicts += 1;
            }
            self.note_peer_clock(peer, envelope.instance_key(), &envelope.sender_clock);
        }

        self.stats
            .bytes_received
            .fetch_add(received_bytes as u64, Ordering::Relaxed);
        self.stats
            .operations_applied
            .fetch_add(applied as u64, Ordering::Relaxed);
        self.stats
            .duplicates_dropped
            .fetch_add(duplicates as u64, Ordering::Relaxed);
        self.metrics.record_conflicts(conflicts);
        self.metrics.record_duplicates(duplicates);
        Ok(())
    }

    async fn send_counted(&self, peer: NodeId, message: &SyncMessage) -> Result<()> {
        let bytes = message.to_bytes()?;
        let frame_bytes: usize = match message {
            SyncMessage::Response { frames, .. } | SyncMessage::Finish { frames, .. } => {
                frames.iter().map(WireFrame::len).sum()
            }
            _ => 0,
        };
        match self.transport.send(peer, bytes).await {
            Ok(()) => {
                self.stats
                    .bytes_sent
                    .fetch_add(frame_bytes as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(error) => {
                self.record_failure(peer);
                Err(error)
            }
        }
    }

    fn expect_stage(&self, session_key: (NodeId, u64), stage: RoundStage) -> Result<()> {
        match self.sessions.get(&session_key) {
            Some(session) if session.stage == stage => Ok(()),
            Some(session) => Err(CrdtError::TransportFailure(format!(
                "round {} is at stage {:?}, not {stage:?}",
                session_key.1, session.stage
            ))),
            None => Err(CrdtError::TransportFailure(format!(
                "round {} is not active",
                session_key.1
            ))),
        }
    }

    fn complete_round(&self, peer: NodeId, session_key: (NodeId, u64)) {
        let latency = self
            .sessions
            .remove(&session_key)
            .map(|(_, session)| session.started_at.elapsed())
            .unwrap_or_default();

        self.stats.rounds_completed.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_round(peer, latency, 0, 0);

        let mut state = self.peers.entry(peer).or_default();
        state.last_sync = Some(chrono::Utc::now());
        if state.consecutive_failures > 0 {
            info!(%peer, "peer recovered after {} failures", state.consecutive_failures);
        }
        state.consecutive_failures = 0;
        state.next_attempt = None;
    }

    fn record_failure(&self, peer: NodeId) {
        let mut state = self.peers.entry(peer).or_default();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let exponent = state.consecutive_failures.saturating_sub(1).min(16);
        let delay = self
            .config
            .backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.config.backoff_cap);
        state.next_attempt = Some(Instant::now() + delay);
        self.stats.rounds_failed.fetch_add(1, Ordering::Relaxed);
        warn!(%peer, failures = state.consecutive_failures, ?delay, "sync failure, backing off");
    }

    fn note_peer_clocks(&self, peer: NodeId, clocks: &[(InstanceKey, VectorClock)]) {
        let mut state = self.peers.entry(peer).or_default();
        for (key, clock) in clocks {
            state
                .last_known
                .entry(key.clone())
                .or_default()
                .merge(clock);
        }
    }

    fn note_peer_clock(&self, peer: NodeId, key: InstanceKey, clock: &VectorClock) {
        let mut state = self.peers.entry(peer).or_default();
        state.last_known.entry(key).or_default().merge(clock);
    }

    /// Drop rounds that outlived the timeout. Nothing was committed for
    /// them beyond whole-message applies, so expiry is side-effect free.
    pub fn cleanup_expired_rounds(&self) -> usize {
        let timeout = self.config.round_timeout;
        let expired: Vec<(NodeId, u64)> = self
            .sessions
            .iter()
            .filter(|session| session.started_at.elapsed() > timeout)
            .map(|session| (session.peer, session.round_id))
            .collect();

        for key in &expired {
            if let Some((_, session)) = self.sessions.remove(key) {
                warn!(peer = %session.peer, round_id = session.round_id, "sync round expired");
                self.stats.rounds_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        expired.len()
    }

    /// Drop this peer's rounds older than `timeout`; used by the adaptive
    /// timeout layer in place of the global round timeout.
    pub fn expire_rounds_for(&self, peer: NodeId, timeout: Duration) -> usize {
        let expired: Vec<(NodeId, u64)> = self
            .sessions
            .iter()
            .filter(|session| session.peer == peer && session.started_at.elapsed() > timeout)
            .map(|session| (session.peer, session.round_id))
            .collect();

        for key in &expired {
            if self.sessions.remove(key).is_some() {
                self.stats.rounds_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        expired.len()
    }

    /// The all-peers-acked watermark for one instance: the floor of every
    /// peer's last known clock and our own applied clock. With no peers
    /// the local clock is the watermark.
    pub async fn acked_watermark(&self, key: &InstanceKey) -> Result<VectorClock> {
        let mut watermark = self.registry.instance_clock(key.type_tag, &key.key).await?;
        for entry in self.peers.iter() {
            let peer_clock = entry
                .last_known
                .get(key)
                .cloned()
                .unwrap_or_default();
            watermark = watermark.floor(&peer_clock);
        }
        Ok(watermark)
    }

    /// Garbage-collect every instance under its acked watermark.
    pub async fn collect_garbage(&self) -> Result<usize> {
        let mut reclaimed = 0;
        for key in self.registry.keys() {
            let watermark = self.acked_watermark(&key).await?;
            reclaimed += self
                .registry
                .collect_instance(&key, &watermark)
                .await?;
        }
        Ok(reclaimed)
    }
}

/// Events emitted by the background service
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A round with a peer completed
    RoundCompleted {
        /// The peer
        peer: NodeId,
    },
    /// A round failed; the peer is backed off
    RoundFailed {
        /// The peer
        peer: NodeId,
        /// What went wrong
        error: String,
    },
    /// A garbage-collection pass reclaimed entries
    GarbageCollected {
        /// Entries reclaimed
        reclaimed: usize,
    },
}

/// Background synchronization service: periodic rounds, inbound dispatch,
/// expiry cleanup, and watermark GC, all cancellable via a watch token.
pub struct SyncService {
    engine: Arc<SyncEngine>,
    cancel_tx: watch::Sender<bool>,
    events_tx: mpsc::Sender<SyncEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<SyncEvent>>>,
    interval: Duration,
}

impl SyncService {
    /// Create a service around an engine
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        let interval = engine.config.interval;
        let capacity = engine.config.event_capacity;
        let (cancel_tx, _) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        Self {
            engine,
            cancel_tx,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            interval,
        }
    }

    /// The engine this service drives
    pub fn engine(&self) -> Arc<SyncEngine> {
        Arc::clone(&self.engine)
    }

    /// Take the event stream; callable once.
    pub async fn events(&self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.events_rx.lock().await.take()
    }

    /// Spawn the ticker and inbound-dispatch tasks.
    pub fn start(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        // Periodic rounds with every reachable peer.
        {
            let engine = Arc::clone(&self.engine);
            let events = self.events_tx.clone();
            let mut cancel = self.cancel_tx.subscribe();
            let period = self.interval;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            engine.cleanup_expired_rounds();
                            for peer in engine.transport.peers() {
                                match engine.begin_round(peer).await {
                                    Ok(_) => {}
                                    Err(error) => {
                                        let _ = events
                                            .send(SyncEvent::RoundFailed {
                                                peer,
                                                error: error.to_string(),
                                            })
                                            .await;
                                    }
                                }
                            }
                            match engine.collect_garbage().await {
                                Ok(reclaimed) if reclaimed > 0 => {
                                    let _ = events
                                        .send(SyncEvent::GarbageCollected { reclaimed })
                                        .await;
                                }
                                Ok(_) => {}
                                Err(error) => {
                                    warn!(%error, "garbage collection pass failed");
                                }
                            }
                        }
                        changed = cancel.changed() => {
                            // A dropped cancel channel means the service
                            // is gone; stop as if cancelled.
                            if changed.is_err() || *cancel.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        // Inbound message dispatch.
        {
            let engine = Arc::clone(&self.engine);
            let events = self.events_tx.clone();
            let mut cancel = self.cancel_tx.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        inbound = engine.transport.recv() => {
                            match inbound {
                                Ok((from, frame)) => {
                                    let completed_before = engine
                                        .stats
                                        .rounds_completed
                                        .load(Ordering::Relaxed);
                                    if let Err(error) = engine.handle_frame(from, frame).await {
                                        warn!(peer = %from, %error, "failed to handle sync frame");
                                        let _ = events
                                            .send(SyncEvent::RoundFailed {
                                                peer: from,
                                                error: error.to_string(),
                                            })
                                            .await;
                                    } else if engine
                                        .stats
                                        .rounds_completed
                                        .load(Ordering::Relaxed)
                                        > completed_before
                                    {
                                        let _ = events
                                            .send(SyncEvent::RoundCompleted { peer: from })
                                            .await;
                                    }
                                }
                                Err(error) => {
                                    warn!(%error, "transport receive failed");
                                    tokio::time::sleep(Duration::from_millis(100)).await;
                                }
                            }
                        }
                        changed = cancel.changed() => {
                            if changed.is_err() || *cancel.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        handles
    }

    /// Cancel both background tasks. In-flight rounds are abandoned
    /// without partial effects.
    pub fn stop(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

#[async_trait]
impl weft_core::Observable for SyncService {
    async fn status(&self) -> weft_core::WeftResult<weft_core::ObservableStatus> {
        let mut metadata = HashMap::new();
        metadata.insert(
            "peers".to_string(),
            self.engine.peers.len().to_string(),
        );
        metadata.insert(
            "active_rounds".to_string(),
            self.engine.sessions.len().to_string(),
        );
        let state = if *self.cancel_tx.borrow() {
            weft_core::ObservableState::Stopped
        } else {
            weft_core::ObservableState::Running
        };
        Ok(weft_core::ObservableStatus {
            state,
            last_updated: chrono::Utc::now(),
            metadata,
        })
    }

    async fn health(&self) -> weft_core::WeftResult<weft_core::HealthStatus> {
        let backed_off = self
            .engine
            .peers
            .iter()
            .filter(|state| state.consecutive_failures > 0)
            .count();
        let level = if backed_off == 0 {
            weft_core::HealthLevel::Healthy
        } else {
            weft_core::HealthLevel::Warning
        };
        let mut checks = HashMap::new();
        checks.insert(
            "peers".to_string(),
            weft_core::traits::HealthCheck::new(
                level,
                format!("{backed_off} peers in backoff"),
            ),
        );
        Ok(weft_core::HealthStatus::from_checks(checks))
    }

    async fn metrics(&self) -> weft_core::WeftResult<HashMap<String, f64>> {
        let stats = &self.engine.stats;
        let mut metrics = HashMap::new();
        metrics.insert(
            "sync.rounds_started".to_string(),
            stats.rounds_started.load(Ordering::Relaxed) as f64,
        );
        metrics.insert(
            "sync.rounds_completed".to_string(),
            stats.rounds_completed.load(Ordering::Relaxed) as f64,
        );
        metrics.insert(
            "sync.rounds_failed".to_string(),
            stats.rounds_failed.load(Ordering::Relaxed) as f64,
        );
        metrics.insert(
            "sync.bytes_sent".to_string(),
            stats.bytes_sent.load(Ordering::Relaxed) as f64,
        );
        metrics.insert(
            "sync.bytes_received".to_string(),
            stats.bytes_received.load(Ordering::Relaxed) as f64,
        );
        metrics.insert(
            "sync.operations_applied".to_string(),
            stats.operations_applied.load(Ordering::Relaxed) as f64,
        );
        Ok(metrics)
    }

    fn describe(&self) -> String {
        format!(
            "SyncService[{}]: {} peers tracked",
            self.engine.transport.local_node(),
            self.engine.peers.len()
        )
    }
}

/// In-memory transport hub for tests and single-process topologies.
pub mod memory_transport {
    use super::*;

    /// Routing hub connecting in-process transports
    #[derive(Default)]
    pub struct InMemoryHub {
        routes: DashMap<NodeId, mpsc::Sender<(NodeId, Bytes)>>,
        partitioned: DashMap<NodeId, ()>,
    }

    impl InMemoryHub {
        /// Create an empty hub
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Register a node and get its transport endpoint
        pub fn register(self: &Arc<Self>, node: NodeId) -> InMemoryTransport {
            let (tx, rx) = mpsc::channel(256);
            self.routes.insert(node, tx);
            InMemoryTransport {
                hub: Arc::clone(self),
                node,
                inbox: Mutex::new(rx),
            }
        }

        /// Cut a node off from the hub, simulating a partition
        pub fn partition(&self, node: NodeId) {
            self.partitioned.insert(node, ());
        }

        /// Restore a partitioned node
        pub fn heal(&self, node: NodeId) {
            self.partitioned.remove(&node);
        }

        fn reachable(&self, node: NodeId) -> bool {
            !self.partitioned.contains_key(&node)
        }
    }

    /// One node's endpoint on the hub
    pub struct InMemoryTransport {
        hub: Arc<InMemoryHub>,
        node: NodeId,
        inbox: Mutex<mpsc::Receiver<(NodeId, Bytes)>>,
    }

    #[async_trait]
    impl PeerTransport for InMemoryTransport {
        fn local_node(&self) -> NodeId {
            self.node
        }

        fn peers(&self) -> Vec<NodeId> {
            self.hub
                .routes
                .iter()
                .map(|entry| *entry.key())
                .filter(|&peer| peer != self.node)
                .collect()
        }

        async fn send(&self, to: NodeId, frame: Bytes) -> Result<()> {
            if !self.hub.reachable(self.node) || !self.hub.reachable(to) {
                return Err(CrdtError::TransportFailure(format!(
                    "{to} is unreachable"
                )));
            }
            let route = self
                .hub
                .routes
                .get(&to)
                .ok_or_else(|| CrdtError::TransportFailure(format!("unknown peer {to}")))?
                .clone();
            route
                .send((self.node, frame))
                .await
                .map_err(|_| CrdtError::TransportFailure(format!("{to} inbox closed")))
        }

        async fn recv(&self) -> Result<(NodeId, Bytes)> {
            self.inbox
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| CrdtError::TransportFailure("hub closed".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{memory_transport::*, *};
    use crate::{
        instance::LocalChange,
        store::MemoryStore,
        types::TypeTag,
    };

    fn engine(
        hub: &Arc<InMemoryHub>,
        node: NodeId,
    ) -> (Arc<SyncEngine>, Arc<CrdtRegistry>) {
        let registry = Arc::new(CrdtRegistry::new(node, Arc::new(MemoryStore::new())));
        let transport = Arc::new(hub.register(node));
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&registry),
            transport,
            Arc::new(NullMetrics),
            SyncConfig::default(),
        ));
        (engine, registry)
    }

    /// Deliver queued messages between two engines until quiescent.
    async fn pump(engines: &[(&Arc<SyncEngine>, NodeId)]) {
        for _ in 0..16 {
            let mut delivered = false;
            for (engine, _) in engines {
                while let Ok(Ok((from, frame))) = tokio::time::timeout(
                    Duration::from_millis(20),
                    engine.transport.recv(),
                )
                .await
                {
                    let _ = engine.handle_frame(from, frame).await;
                    delivered = true;
                }
            }
            if !delivered {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_wire_frame_round_trip_plain_and_compressed() {
        let envelope = DeltaEnvelope {
            type_tag: TypeTag::GCounter,
            key: "k".to_string(),
            sender_clock: VectorClock::new(),
            operations: Vec::new(),
            full_state: Some(Bytes::from(vec![7u8; 4096])),
        };

        let plain = WireFrame::encode(&envelope, usize::MAX).unwrap();
        assert_eq!(plain.encoding, FrameEncoding::Plain);
        assert_eq!(plain.decode().unwrap().key, "k");

        let compressed = WireFrame::encode(&envelope, 64).unwrap();
        assert_eq!(compressed.encoding, FrameEncoding::Lz4);
        // Constant filler compresses well.
        assert!(compressed.len() < plain.len());
        let decoded = compressed.decode().unwrap();
        assert_eq!(decoded.full_state, envelope.full_state);
    }

    #[tokio::test]
    async fn test_single_round_converges_both_sides() {
        let hub = InMemoryHub::new();
        let node_a = NodeId::new();
        let node_b = NodeId::new();
        let (engine_a, registry_a) = engine(&hub, node_a);
        let (engine_b, registry_b) = engine(&hub, node_b);

        registry_a
            .apply_local(TypeTag::GCounter, "visits", LocalChange::Increment { amount: 5 })
            .await
            .unwrap();
        registry_b
            .apply_local(TypeTag::GCounter, "visits", LocalChange::Increment { amount: 3 })
            .await
            .unwrap();

        engine_a.begin_round(node_b).await.unwrap();
        pump(&[(&engine_a, node_a), (&engine_b, node_b)]).await;

        assert_eq!(
            registry_a.value(TypeTag::GCounter, "visits").await.unwrap(),
            serde_json::json!(8)
        );
        assert_eq!(
            registry_b.value(TypeTag::GCounter, "visits").await.unwrap(),
            serde_json::json!(8)
        );
        assert_eq!(
            engine_a.stats.rounds_completed.load(Ordering::Relaxed) +
            engine_b.stats.rounds_completed.load(Ordering::Relaxed),
            2
        );
    }

    #[tokio::test]
    async fn test_round_carries_unknown_instances() {
        let hub = InMemoryHub::new();
        let node_a = NodeId::new();
        let node_b = NodeId::new();
        let (engine_a, registry_a) = engine(&hub, node_a);
        let (engine_b, registry_b) = engine(&hub, node_b);

        // b has never heard of this instance.
        registry_a
            .apply_local(
                TypeTag::OrSet,
                "tags",
                LocalChange::AddElement {
                    element: "fresh".to_string(),
                },
            )
            .await
            .unwrap();

        engine_b.begin_round(node_a).await.unwrap();
        pump(&[(&engine_a, node_a), (&engine_b, node_b)]).await;

        assert_eq!(
            registry_b.value(TypeTag::OrSet, "tags").await.unwrap(),
            serde_json::json!(["fresh"])
        );
    }

    #[tokio::test]
    async fn test_partition_backoff_and_recovery() {
        let hub = InMemoryHub::new();
        let node_a = NodeId::new();
        let node_b = NodeId::new();
        let (engine_a, registry_a) = engine(&hub, node_a);
        let (engine_b, registry_b) = engine(&hub, node_b);

        hub.partition(node_b);
        // Local writes keep flowing during the partition.
        for _ in 0..3 {
            registry_a
                .apply_local(TypeTag::GCounter, "visits", LocalChange::Increment { amount: 1 })
                .await
                .unwrap();
        }
        assert!(engine_a.begin_round(node_b).await.is_err());
        assert!(engine_a.is_backed_off(node_b));
        // The gate swallows attempts instead of spamming the peer.
        assert_eq!(engine_a.begin_round(node_b).await.unwrap(), None);

        hub.heal(node_b);
        let state = engine_a.peer_state(node_b).unwrap();
        tokio::time::sleep(
            state
                .next_attempt
                .map(|at| at.saturating_duration_since(Instant::now()))
                .unwrap_or_default(),
        )
        .await;

        // One round after reconnection reaches full convergence.
        engine_a.begin_round(node_b).await.unwrap();
        pump(&[(&engine_a, node_a), (&engine_b, node_b)]).await;
        assert_eq!(
            registry_b.value(TypeTag::GCounter, "visits").await.unwrap(),
            serde_json::json!(3)
        );
        assert!(!engine_a.is_backed_off(node_b));
    }

    #[tokio::test]
    async fn test_redelivered_round_applies_nothing_twice() {
        let hub = InMemoryHub::new();
        let node_a = NodeId::new();
        let node_b = NodeId::new();
        let (engine_a, registry_a) = engine(&hub, node_a);
        let (engine_b, registry_b) = engine(&hub, node_b);

        registry_a
            .apply_local(TypeTag::GCounter, "visits", LocalChange::Increment { amount: 5 })
            .await
            .unwrap();

        engine_a.begin_round(node_b).await.unwrap();
        pump(&[(&engine_a, node_a), (&engine_b, node_b)]).await;
        engine_a.begin_round(node_b).await.unwrap();
        pump(&[(&engine_a, node_a), (&engine_b, node_b)]).await;

        assert_eq!(
            registry_b.value(TypeTag::GCounter, "visits").await.unwrap(),
            serde_json::json!(5)
        );
    }

    #[tokio::test]
    async fn test_expired_rounds_are_discarded() {
        let hub = InMemoryHub::new();
        let node_a = NodeId::new();
        let node_b = NodeId::new();
        // Keep the peer endpoint alive so sends succeed but go unanswered.
        let _peer_endpoint = hub.register(node_b);

        let registry = Arc::new(CrdtRegistry::new(node_a, Arc::new(MemoryStore::new())));
        let config = SyncConfig {
            round_timeout: Duration::from_millis(1),
            ..SyncConfig::default()
        };
        let engine_a = SyncEngine::new(
            registry,
            Arc::new(hub.register(node_a)),
            Arc::new(NullMetrics),
            config,
        );

        engine_a.begin_round(node_b).await.unwrap();
        assert_eq!(engine_a.sessions.len(), 1);

        // The peer never answers; the round times out and is dropped
        // without side effects.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(engine_a.cleanup_expired_rounds(), 1);
        assert!(engine_a.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_watermark_floors_over_peers() {
        let hub = InMemoryHub::new();
        let node_a = NodeId::new();
        let node_b = NodeId::new();
        let (engine_a, registry_a) = engine(&hub, node_a);
        let (engine_b, _registry_b) = engine(&hub, node_b);

        registry_a
            .apply_local(
                TypeTag::OrSet,
                "tags",
                LocalChange::AddElement {
                    element: "x".to_string(),
                },
            )
            .await
            .unwrap();
        let key = InstanceKey::new(TypeTag::OrSet, "tags");

        // Peer exists but has acked nothing: watermark is floored to zero.
        engine_a.note_peer_clock(node_b, key.clone(), &VectorClock::new());
        let watermark = engine_a.acked_watermark(&key).await.unwrap();
        assert_eq!(watermark.get(node_a), 0);

        // After a full round the peer's ack raises the watermark.
        engine_a.begin_round(node_b).await.unwrap();
        pump(&[(&engine_a, node_a), (&engine_b, node_b)]).await;
        let watermark = engine_a.acked_watermark(&key).await.unwrap();
        assert_eq!(watermark.get(node_a), 1);
    }

    #[tokio::test]
    async fn test_service_background_sync() {
        let hub = InMemoryHub::new();
        let node_a = NodeId::new();
        let node_b = NodeId::new();
        let (engine_a, registry_a) = engine(&hub, node_a);
        let (engine_b, registry_b) = engine(&hub, node_b);

        let service_a = SyncService::new(Arc::clone(&engine_a));
        let service_b = SyncService::new(Arc::clone(&engine_b));
        let handles_a = service_a.start();
        let handles_b = service_b.start();

        registry_a
            .apply_local(TypeTag::GCounter, "visits", LocalChange::Increment { amount: 7 })
            .await
            .unwrap();

        // Wait out a couple of sync intervals.
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(
            registry_b.value(TypeTag::GCounter, "visits").await.unwrap(),
            serde_json::json!(7)
        );

        service_a.stop();
        service_b.stop();
        for handle in handles_a.into_iter().chain(handles_b) {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
    }
}
