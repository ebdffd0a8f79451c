//! Throughput wrapper around the sync engine: delta caching, per-peer
//! adaptive pacing, and latency-tracking timeouts.
//!
//! The wrapper changes nothing about protocol semantics. The cache avoids
//! recomputing identical deltas when several peers are equally far behind;
//! pacing stretches a peer's round interval while rounds come back empty
//! and snaps back to the floor on activity; per-peer timeouts follow a
//! moving latency average instead of the global round timeout.

use crate::{
    error::Result,
    registry::CrdtRegistry,
    sync::{SyncEngine, WireFrame},
    types::{InstanceKey, NodeId, VectorClock},
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::watch, time::Instant};
use tracing::debug;
use weft_core::Validatable;

/// Performance layer tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerfConfig {
    /// Pacing floor: the interval used while rounds carry data
    pub min_interval: Duration,
    /// Pacing ceiling for idle peers
    pub max_interval: Duration,
    /// Interval multiplier applied after an empty round
    pub idle_backoff_factor: f64,
    /// Cached frames older than this are rebuilt
    pub cache_ttl: Duration,
    /// Maximum cached frames
    pub cache_capacity: usize,
    /// Weight of the newest latency sample in the moving average
    pub latency_alpha: f64,
    /// Adaptive timeout floor
    pub min_timeout: Duration,
    /// Adaptive timeout ceiling
    pub max_timeout: Duration,
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(15),
            idle_backoff_factor: 1.5,
            cache_ttl: Duration::from_secs(5),
            cache_capacity: 1024,
            latency_alpha: 0.2,
            min_timeout: Duration::from_millis(500),
            max_timeout: Duration::from_secs(30),
        }
    }
}

impl Validatable for PerfConfig {
    fn validate(&self) -> weft_core::WeftResult<()> {
        if self.min_interval > self.max_interval {
            return Err(weft_core::WeftError::config(
                "min_interval must not exceed max_interval",
            ));
        }
        if self.idle_backoff_factor < 1.0 {
            return Err(weft_core::WeftError::config(
                "idle_backoff_factor must be at least 1.0",
            ));
        }
        weft_core::traits::validate_range("cache_capacity", self.cache_capacity, 1, 1_000_000)?;
        Ok(())
    }
}

/// Running counters for the performance layer
#[derive(Debug, Default)]
pub struct PerfStats {
    /// Frames served from cache
    pub cache_hits: AtomicU64,
    /// Frames built and cached
    pub cache_misses: AtomicU64,
    /// Cache entries evicted by TTL or capacity
    pub cache_evictions: AtomicU64,
    /// Rounds skipped by adaptive pacing
    pub rounds_paced: AtomicU64,
    /// Rounds actually triggered
    pub rounds_triggered: AtomicU64,
}

#[derive(Clone)]
struct CachedFrame {
    frame: WireFrame,
    built_at: Instant,
}

/// Cache of encoded delta frames keyed by `(instance, peer clock digest,
/// local clock digest)`.
///
/// Including the local digest means a cached frame is reused only while
/// local state is unchanged, so hits are always exact, never stale.
pub struct DeltaCache {
    entries: DashMap<(InstanceKey, u64, u64), CachedFrame>,
    ttl: Duration,
    capacity: usize,
    stats: Arc<PerfStats>,
}

impl DeltaCache {
    fn new(ttl: Duration, capacity: usize, stats: Arc<PerfStats>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            capacity,
            stats,
        }
    }

    /// Fetch or build the frame bringing a peer at `peer_clock` up to date.
    pub async fn frame_for(
        &self,
        registry: &CrdtRegistry,
        key: &InstanceKey,
        peer_clock: &VectorClock,
        compress_threshold: usize,
    ) -> Result<Option<WireFrame>> {
        let local_clock = registry.instance_clock(key.type_tag, &key.key).await?;
        let cache_key = (key.clone(), peer_clock.digest(), local_clock.digest());

        if let Some(cached) = self.entries.get(&cache_key) {
            if cached.built_at.elapsed() < self.ttl {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(cached.frame.clone()));
            }
        }

        let envelope = match registry.delta_for(key.type_tag, &key.key, peer_clock).await? {
            Some(envelope) => envelope,
            None => return Ok(None),
        };
        let frame = WireFrame::encode(&envelope, compress_threshold)?;

        self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            cache_key,
            CachedFrame {
                frame: frame.clone(),
                built_at: Instant::now(),
            },
        );
        self.evict();
        Ok(Some(frame))
    }

    fn evict(&self) {
        let mut evicted = 0u64;

        let expired: Vec<_> = self
            .entries
            .iter()
            .filter(|entry| entry.built_at.elapsed() >= self.ttl)
            .map(|entry| entry.key().clone())
            .collect();
        for key in expired {
            if self.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }

        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.built_at)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    if self.entries.remove(&key).is_some() {
                        evicted += 1;
                    }
                }
                None => break,
            }
        }

        if evicted > 0 {
            self.stats.cache_evictions.fetch_add(evicted, Ordering::Relaxed);
        }
    }

    /// Number of cached frames
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
struct PeerPace {
    interval: Duration,
    next_due: Instant,
    latency_ema_ms: f64,
}

/// Per-peer adaptive pacing and timeout state
pub struct AdaptiveScheduler {
    config: PerfConfig,
    peers: DashMap<NodeId, PeerPace>,
}

impl AdaptiveScheduler {
    fn new(config: PerfConfig) -> Self {
        Self {
            config,
            peers: DashMap::new(),
        }
    }

    /// Whether a round with this peer is due
    pub fn is_due(&self, peer: NodeId) -> bool {
        self.peers
            .get(&peer)
            .map_or(true, |pace| Instant::now() >= pace.next_due)
    }

    /// Record a completed round: activity snaps the interval back to the
    /// floor, an empty round stretches it toward the ceiling.
    pub fn record_round(&self, peer: NodeId, had_activity: bool, latency: Option<Duration>) {
        let mut pace = self.peers.entry(peer).or_insert_with(|| PeerPace {
            interval: self.config.min_interval,
            next_due: Instant::now(),
            latency_ema_ms: self.config.min_timeout.as_millis() as f64,
        });

        pace.interval = if had_activity {
            self.config.min_interval
        } else {
            let stretched = pace.interval.mul_f64(self.config.idle_backoff_factor);
            stretched.min(self.config.max_interval)
        };
        pace.next_due = Instant::now() + pace.interval;

        if let Some(latency) = latency {
            let alpha = self.config.latency_alpha;
            pace.latency_ema_ms =
                alpha * latency.as_millis() as f64 + (1.0 - alpha) * pace.latency_ema_ms;
        }
    }

    /// Fold a latency sample into the peer's moving average without
    /// touching its pacing interval.
    pub fn record_latency(&self, peer: NodeId, latency: Duration) {
        let mut pace = self.peers.entry(peer).or_insert_with(|| PeerPace {
            interval: self.config.min_interval,
            next_due: Instant::now(),
            latency_ema_ms: self.config.min_timeout.as_millis() as f64,
        });
        let alpha = self.config.latency_alpha;
        pace.latency_ema_ms =
            alpha * latency.as_millis() as f64 + (1.0 - alpha) * pace.latency_ema_ms;
    }

    /// Adaptive round timeout for a peer: a multiple of its moving
    /// latency average, clamped to the configured window.
    pub fn timeout_for(&self, peer: NodeId) -> Duration {
        let ema_ms = self
            .peers
            .get(&peer)
            .map(|pace| pace.latency_ema_ms)
            .unwrap_or(self.config.min_timeout.as_millis() as f64);
        Duration::from_millis((ema_ms * 4.0) as u64)
            .clamp(self.config.min_timeout, self.config.max_timeout)
    }

    /// Current pacing interval for a peer
    pub fn interval_for(&self, peer: NodeId) -> Duration {
        self.peers
            .get(&peer)
            .map(|pace| pace.interval)
            .unwrap_or(self.config.min_interval)
    }
}

/// Outcome of one pacing tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Peers whose round was started
    pub rounds_started: usize,
    /// Peers skipped by pacing or backoff
    pub rounds_skipped: usize,
    /// Rounds expired under adaptive timeouts
    pub rounds_expired: usize,
}

/// The optimized engine: the plain engine plus cache and pacing.
pub struct OptimizedSyncEngine {
    inner: Arc<SyncEngine>,
    scheduler: AdaptiveScheduler,
    cache: Arc<DeltaCache>,
    stats: Arc<PerfStats>,
    /// Operations-applied counter at each peer's previous paced round.
    activity_marks: DashMap<NodeId, u64>,
}

impl OptimizedSyncEngine {
    /// Wrap a sync engine; frame building is routed through the cache
    /// from this point on.
    pub fn new(inner: Arc<SyncEngine>, config: PerfConfig) -> Self {
        let stats = Arc::new(PerfStats::default());
        let cache = Arc::new(DeltaCache::new(
            config.cache_ttl,
            config.cache_capacity,
            Arc::clone(&stats),
        ));
        inner.install_delta_cache(Arc::clone(&cache));
        Self {
            scheduler: AdaptiveScheduler::new(config),
            inner,
            cache,
            stats,
            activity_marks: DashMap::new(),
        }
    }

    /// The wrapped engine
    pub fn inner(&self) -> Arc<SyncEngine> {
        Arc::clone(&self.inner)
    }

    /// Shared performance counters
    pub fn stats(&self) -> Arc<PerfStats> {
        Arc::clone(&self.stats)
    }

    /// The delta cache
    pub fn cache(&self) -> Arc<DeltaCache> {
        Arc::clone(&self.cache)
    }

    /// Pacing state
    pub fn scheduler(&self) -> &AdaptiveScheduler {
        &self.scheduler
    }

    /// One pacing tick: expire slow rounds per adaptive timeout, then
    /// start rounds with every peer that is due and not backed off.
    ///
    /// Activity is attributed from the engine's operations counter since
    /// the peer's previous paced round. The counter is shared across
    /// peers, so a busy neighbor can hold an idle peer at the pacing
    /// floor; that only errs toward syncing more often.
    pub async fn tick(&self) -> Result<TickReport> {
        let mut report = TickReport::default();

        for peer in self.inner.reachable_peers() {
            report.rounds_expired += self
                .inner
                .expire_rounds_for(peer, self.scheduler.timeout_for(peer));

            if !self.scheduler.is_due(peer) || self.inner.is_backed_off(peer) {
                report.rounds_skipped += 1;
                self.stats.rounds_paced.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let applied_now = self
                .inner
                .stats()
                .operations_applied
                .load(Ordering::Relaxed);
            let had_activity = self
                .activity_marks
                .get(&peer)
                .map_or(true, |mark| applied_now > *mark);

            match self.inner.begin_round(peer).await {
                Ok(Some(_)) => {
                    report.rounds_started += 1;
                    self.stats.rounds_triggered.fetch_add(1, Ordering::Relaxed);
                    self.activity_marks.insert(peer, applied_now);
                    self.scheduler.record_round(peer, had_activity, None);
                }
                Ok(None) => {
                    report.rounds_skipped += 1;
                }
                Err(error) => {
                    debug!(%peer, %error, "paced round failed to start");
                    report.rounds_skipped += 1;
                    self.scheduler.record_round(peer, false, None);
                }
            }
        }

        Ok(report)
    }

    /// Feed an observed round latency into the peer's adaptive timeout.
    /// Typically called from the host's metrics pipeline.
    pub fn note_round_latency(&self, peer: NodeId, latency: Duration) {
        self.scheduler.record_latency(peer, latency);
    }

    /// Run the pacing loop until cancelled. Ticks at the pacing floor;
    /// per-peer intervals decide who actually syncs.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) {
        let floor = self.scheduler.config.min_interval;
        let mut ticker = tokio::time::interval(floor);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.tick().await {
                        debug!(%error, "pacing tick failed");
                    }
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Metrics snapshot for the metrics collaborator
    pub fn metrics_snapshot(&self) -> std::collections::HashMap<String, f64> {
        let mut metrics = std::collections::HashMap::new();
        metrics.insert(
            "perf.cache_hits".to_string(),
            self.stats.cache_hits.load(Ordering::Relaxed) as f64,
        );
        metrics.insert(
            "perf.cache_misses".to_string(),
            self.stats.cache_misses.load(Ordering::Relaxed) as f64,
        );
        metrics.insert(
            "perf.cache_evictions".to_string(),
            self.stats.cache_evictions.load(Ordering::Relaxed) as f64,
        );
        metrics.insert(
            "perf.rounds_paced".to_string(),
            self.stats.rounds_paced.load(Ordering::Relaxed) as f64,
        );
        metrics.insert(
            "perf.rounds_triggered".to_string(),
            self.stats.rounds_triggered.load(Ordering::Relaxed) as f64,
        );
        metrics.insert("perf.cache_size".to_string(), self.cache.len() as f64);
        metrics
    }
}
