//! Route cache for itinerary-routing
//!
//! Computed legs keyed by (origin, destination, mode) with per-mode expiry,
//! lazy and periodic eviction, and a radius lookup for near-identical
//! requests.

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::config::CachePolicy;
use crate::core::error::Result;
use crate::core::geo::{fixed_e5, haversine_m};
use crate::core::model::{Coordinates, RouteSegment, RouteStatistics, TravelMode, Waypoint};

/// One endpoint of a cached route.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PointKey {
    /// Stable place identifier from the itinerary
    Place(String),
    /// Coordinates rounded to 5 decimal places
    Coord { lat_e5: i64, lon_e5: i64 },
}

impl PointKey {
    pub fn from_coordinates(coordinates: Coordinates) -> Self {
        PointKey::Coord {
            lat_e5: fixed_e5(coordinates.lat),
            lon_e5: fixed_e5(coordinates.lon),
        }
    }

    pub fn for_waypoint(waypoint: &Waypoint) -> Self {
        match &waypoint.place_id {
            Some(id) => PointKey::Place(id.clone()),
            None => Self::from_coordinates(waypoint.coordinates),
        }
    }
}

impl fmt::Display for PointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointKey::Place(id) => write!(f, "place:{id}"),
            PointKey::Coord { lat_e5, lon_e5 } => {
                write!(f, "{:.5},{:.5}", *lat_e5 as f64 / 1e5, *lon_e5 as f64 / 1e5)
            }
        }
    }
}

/// Identity of a directional route request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteKey {
    pub origin: PointKey,
    pub destination: PointKey,
    pub mode: TravelMode,
}

impl RouteKey {
    pub fn new(origin: PointKey, destination: PointKey, mode: TravelMode) -> Self {
        Self { origin, destination, mode }
    }

    /// Key for a leg between two waypoints, preferring place identifiers over coordinates.
    pub fn for_leg(from: &Waypoint, to: &Waypoint, mode: TravelMode) -> Self {
        Self::new(PointKey::for_waypoint(from), PointKey::for_waypoint(to), mode)
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} [{}]", self.origin, self.destination, self.mode)
    }
}

/// Lifecycle state of a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheStatus {
    Cached,
    Calculating,
    Failed,
    Expired,
}

/// A computed route held by the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRoute {
    pub key: RouteKey,
    pub origin: Coordinates,
    pub destination: Coordinates,
    pub segment: RouteSegment,
    pub cache_expiry: DateTime<Utc>,
    pub last_calculated: DateTime<Utc>,
    pub statistics: RouteStatistics,
    pub status: CacheStatus,
}

impl CachedRoute {
    /// An entry is unusable from its expiry instant onwards.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.cache_expiry
    }

    pub fn effective_status(&self, now: DateTime<Utc>) -> CacheStatus {
        if self.is_expired_at(now) {
            CacheStatus::Expired
        } else {
            self.status
        }
    }
}

/// Counters for cache effectiveness
#[derive(Debug, Default)]
struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    similar_hits: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time copy of the cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub similar_hits: u64,
    pub evictions: u64,
}

/// Calculating or Failed marker, aged out by `sweep` like a cached entry
struct PendingMark {
    status: CacheStatus,
    since: DateTime<Utc>,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<RouteKey, CachedRoute>,
    /// Keys in flight or whose last computation failed
    pending: HashMap<RouteKey, PendingMark>,
}

/// Shared, in-memory route cache
///
/// Writes are last-writer-wins per key; the orchestrator guarantees a
/// single writer per day, so a plain mutex around the map is sufficient.
pub struct RouteCache {
    inner: Mutex<CacheInner>,
    metrics: CacheMetrics,
    policy: CachePolicy,
}

impl Default for RouteCache {
    fn default() -> Self {
        Self::new(CachePolicy::default())
    }
}

impl RouteCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            metrics: CacheMetrics::default(),
            policy,
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        // A panic while holding the lock cannot leave the maps half-updated
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &RouteKey) -> Option<CachedRoute> {
        self.get_at(key, Utc::now())
    }

    /// Lookup against an explicit clock; expired entries are evicted and reported as a miss.
    pub fn get_at(&self, key: &RouteKey, now: DateTime<Utc>) -> Option<CachedRoute> {
        let mut inner = self.lock();

        let expired = match inner.entries.get(key) {
            Some(entry) if entry.is_expired_at(now) => true,
            Some(entry) if entry.status == CacheStatus::Cached => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache hit: {key}");
                return Some(entry.clone());
            }
            _ => false,
        };

        if expired {
            inner.entries.remove(key);
            self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
            debug!("Cache entry expired: {key}");
        }
        self.metrics.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put(
        &self,
        key: RouteKey,
        origin: Coordinates,
        destination: Coordinates,
        segment: RouteSegment,
        ttl: Duration,
    ) -> CachedRoute {
        self.put_at(key, origin, destination, segment, ttl, Utc::now())
    }

    /// Store a computed route, replacing whatever the key held before.
    pub fn put_at(
        &self,
        key: RouteKey,
        origin: Coordinates,
        destination: Coordinates,
        segment: RouteSegment,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> CachedRoute {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let cache_expiry = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let statistics = RouteStatistics::from_segments(std::slice::from_ref(&segment), key.mode);

        let entry = CachedRoute {
            key: key.clone(),
            origin,
            destination,
            segment,
            cache_expiry,
            last_calculated: now,
            statistics,
            status: CacheStatus::Cached,
        };

        let mut inner = self.lock();
        inner.pending.remove(&key);
        inner.entries.insert(key, entry.clone());
        entry
    }

    /// Store a leg using the mode's configured lifetime.
    pub fn put_leg(
        &self,
        from: &Waypoint,
        to: &Waypoint,
        mode: TravelMode,
        segment: RouteSegment,
    ) -> CachedRoute {
        self.put(
            RouteKey::for_leg(from, to, mode),
            from.coordinates,
            to.coordinates,
            segment,
            self.policy.ttl_for(mode),
        )
    }

    pub fn find_similar(
        &self,
        origin: Coordinates,
        destination: Coordinates,
        mode: TravelMode,
        radius_m: f64,
    ) -> Option<CachedRoute> {
        self.find_similar_at(origin, destination, mode, radius_m, Utc::now())
    }

    /// Closest live entry whose endpoints both lie within `radius_m`.
    ///
    /// Queries no longer than twice the radius never match: such a leg could
    /// pair with a cached leg running the other way, or with any leg near a
    /// repeated stop. Past that length a match always points the same way.
    pub fn find_similar_at(
        &self,
        origin: Coordinates,
        destination: Coordinates,
        mode: TravelMode,
        radius_m: f64,
        now: DateTime<Utc>,
    ) -> Option<CachedRoute> {
        if haversine_m(origin, destination) <= 2.0 * radius_m {
            return None;
        }
        let inner = self.lock();

        let best = inner
            .entries
            .values()
            .filter(|entry| {
                entry.key.mode == mode && entry.effective_status(now) == CacheStatus::Cached
            })
            .filter_map(|entry| {
                let d_origin = haversine_m(origin, entry.origin);
                let d_destination = haversine_m(destination, entry.destination);
                (d_origin <= radius_m && d_destination <= radius_m)
                    .then_some((d_origin + d_destination, entry))
            })
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, entry)| entry.clone());

        if let Some(ref entry) = best {
            self.metrics.similar_hits.fetch_add(1, Ordering::Relaxed);
            debug!("Similar cache hit: {}", entry.key);
        }
        best
    }

    pub fn mark_calculating(&self, key: &RouteKey) {
        self.mark_at(key, CacheStatus::Calculating, Utc::now());
    }

    pub fn mark_failed(&self, key: &RouteKey) {
        self.mark_at(key, CacheStatus::Failed, Utc::now());
    }

    fn mark_at(&self, key: &RouteKey, status: CacheStatus, since: DateTime<Utc>) {
        self.lock().pending.insert(key.clone(), PendingMark { status, since });
    }

    pub fn status(&self, key: &RouteKey) -> Option<CacheStatus> {
        self.status_at(key, Utc::now())
    }

    pub fn status_at(&self, key: &RouteKey, now: DateTime<Utc>) -> Option<CacheStatus> {
        let inner = self.lock();
        if let Some(mark) = inner.pending.get(key) {
            return Some(mark.status);
        }
        inner.entries.get(key).map(|entry| entry.effective_status(now))
    }

    pub fn remove(&self, key: &RouteKey) -> Option<CachedRoute> {
        let mut inner = self.lock();
        inner.pending.remove(key);
        inner.entries.remove(key)
    }

    /// Drop every expired entry, returning how many were removed.
    ///
    /// Pending markers older than their mode's lifetime go too; they are not
    /// counted as evictions.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired_at(now));
        let removed = before - inner.entries.len();

        let policy = &self.policy;
        inner.pending.retain(|key, mark| {
            let ttl = chrono::Duration::from_std(policy.ttl_for(key.mode))
                .unwrap_or(chrono::Duration::MAX);
            mark.since.checked_add_signed(ttl).map_or(true, |expiry| now < expiry)
        });
        self.metrics.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    /// Run `sweep` every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.sweep();
                        if removed > 0 {
                            debug!("Cache sweep evicted {removed} expired route(s)");
                        }
                    }
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.metrics.hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
            similar_hits: self.metrics.similar_hits.load(Ordering::Relaxed),
            evictions: self.metrics.evictions.load(Ordering::Relaxed),
        }
    }

    /// Write all cached entries as JSON.
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let entries: Vec<CachedRoute> = self.lock().entries.values().cloned().collect();
        let data = serde_json::to_string_pretty(&entries)?;
        tokio::fs::write(path.as_ref(), data).await?;
        info!("Saved {} cached route(s) to {}", entries.len(), path.as_ref().display());
        Ok(())
    }

    /// Load a snapshot written by `save_to_file`, skipping entries that have expired since.
    pub async fn load_from_file<P: AsRef<Path>>(path: P, policy: CachePolicy) -> Result<Self> {
        let cache = Self::new(policy);
        if !path.as_ref().exists() {
            return Ok(cache);
        }

        let data = tokio::fs::read_to_string(path.as_ref()).await?;
        let entries: Vec<CachedRoute> = serde_json::from_str(&data)?;
        let now = Utc::now();
        let total = entries.len();
        {
            let mut inner = cache.lock();
            for entry in entries.into_iter().filter(|e| !e.is_expired_at(now)) {
                inner.entries.insert(entry.key.clone(), entry);
            }
        }
        info!(
            "Loaded {} of {} cached route(s) from {}",
            cache.len(),
            total,
            path.as_ref().display()
        );
        Ok(cache)
    }
}
