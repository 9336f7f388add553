//! Read-through cache in front of a [`ChannelRoutingRepository`]
//!
//! Entries are replaced wholesale (`Arc` swap), never mutated in place.
//! Concurrent misses for the same channel share one upstream fetch: the first
//! caller becomes the leader and publishes its result over a `watch` channel,
//! later callers wait on it. If the leader is cancelled mid-fetch its
//! followers notice the closed channel and one of them takes over.
//!
//! Freshness has two bounds. Within `ttl` an entry is served without asking
//! upstream. Between `ttl` and `max_staleness` the entry is only a fallback:
//! every read attempts a refresh, and the stale value is served (non-strict
//! mode) only when that refresh fails. Past `max_staleness` the entry is
//! dropped, lazily on access and by the background sweeper.

use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, RuntimeError};
use crate::repository::ChannelRoutingRepository;
use crate::retry::{RetryPolicy, retry_transient};
use crate::types::ChannelRoutingConfig;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    /// Hard bound after which an entry is never served, even as a fallback
    pub max_staleness: Duration,
    /// Fail instead of serving a stale entry when the refresh fails
    pub strict: bool,
    pub capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_staleness: Duration::from_secs(3600),
            strict: false,
            capacity: 1024,
            retry: RetryPolicy::once(Duration::from_millis(200)),
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    value: Arc<ChannelRoutingConfig>,
    refreshed_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.refreshed_at)
    }

    fn is_fresh(&self, now: Instant) -> bool {
        self.age(now) < self.ttl
    }
}

/// Counters exposed for diagnostics and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub upstream_fetches: u64,
    pub stale_served: u64,
    pub entries: usize,
}

type FlightResult = Option<Result<Arc<ChannelRoutingConfig>>>;

enum Flight {
    Leader(watch::Sender<FlightResult>),
    Follower(watch::Receiver<FlightResult>),
}

/// Removes the in-flight marker when the leader finishes or is cancelled
struct FlightGuard<'a> {
    flights: &'a Mutex<HashMap<String, watch::Receiver<FlightResult>>>,
    key: &'a str,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        lock(self.flights).remove(self.key);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct CachedChannelRoutingRepository {
    upstream: Arc<dyn ChannelRoutingRepository>,
    config: CacheConfig,
    entries: Mutex<LruCache<String, Arc<CacheEntry>>>,
    in_flight: Mutex<HashMap<String, watch::Receiver<FlightResult>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    upstream_fetches: AtomicU64,
    stale_served: AtomicU64,
}

impl CachedChannelRoutingRepository {
    pub fn new(upstream: Arc<dyn ChannelRoutingRepository>, config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        info!(
            "Routing cache over '{}' backend (ttl={:?}, max_staleness={:?}, strict={}, capacity={})",
            upstream.backend(),
            config.ttl,
            config.max_staleness,
            config.strict,
            capacity
        );
        Self {
            upstream,
            config,
            entries: Mutex::new(LruCache::new(capacity)),
            in_flight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            upstream_fetches: AtomicU64::new(0),
            stale_served: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Routing config for `channel_id`.
    ///
    /// `NotFound` when upstream has no routing for the channel, `Upstream`
    /// when the refresh fails and no servable entry exists.
    pub async fn get(&self, channel_id: &str) -> Result<Arc<ChannelRoutingConfig>> {
        if let Some(value) = self.fresh(channel_id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Routing cache hit for channel '{}'", channel_id);
            return Ok(value);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.fetch(channel_id, false).await
    }

    /// Re-fetch from upstream regardless of freshness
    pub async fn refresh(&self, channel_id: &str) -> Result<Arc<ChannelRoutingConfig>> {
        self.fetch(channel_id, true).await
    }

    /// Drop one entry; returns whether it was cached
    pub fn invalidate(&self, channel_id: &str) -> bool {
        let removed = lock(&self.entries).pop(channel_id).is_some();
        if removed {
            debug!("Invalidated routing cache entry for '{}'", channel_id);
        }
        removed
    }

    pub fn invalidate_all(&self) {
        let mut entries = lock(&self.entries);
        let count = entries.len();
        entries.clear();
        info!("Invalidated {} routing cache entries", count);
    }

    /// Drop every entry past the max-staleness bound, returning how many went
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.age(now) > self.config.max_staleness)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        if !expired.is_empty() {
            debug!("Evicted {} expired routing cache entries", expired.len());
        }
        expired.len()
    }

    /// Run [`Self::evict_expired`] every `interval` until `cancel` fires
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Routing cache sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        cache.evict_expired();
                    }
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            upstream_fetches: self.upstream_fetches.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    /// Fresh value if any; drops the entry when it is past max staleness
    fn fresh(&self, channel_id: &str) -> Option<Arc<ChannelRoutingConfig>> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        let entry = entries.get(channel_id).cloned()?;
        if entry.is_fresh(now) {
            return Some(Arc::clone(&entry.value));
        }
        if entry.age(now) > self.config.max_staleness {
            debug!(
                "Dropping routing cache entry for '{}' (age {:?})",
                channel_id,
                entry.age(now)
            );
            entries.pop(channel_id);
        }
        None
    }

    async fn fetch(&self, channel_id: &str, force: bool) -> Result<Arc<ChannelRoutingConfig>> {
        loop {
            let flight = {
                let mut flights = lock(&self.in_flight);
                match flights.get(channel_id) {
                    Some(rx) => Flight::Follower(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        flights.insert(channel_id.to_string(), rx);
                        Flight::Leader(tx)
                    }
                }
            };

            match flight {
                Flight::Leader(tx) => {
                    let _guard = FlightGuard {
                        flights: &self.in_flight,
                        key: channel_id,
                    };
                    // Another leader may have filled the entry since our miss
                    let result = match self.fresh(channel_id).filter(|_| !force) {
                        Some(value) => Ok(value),
                        None => self.load(channel_id).await,
                    };
                    tx.send_replace(Some(result.clone()));
                    return result;
                }
                Flight::Follower(mut rx) => {
                    debug!("Joining in-flight routing fetch for '{}'", channel_id);
                    let outcome = rx.wait_for(|r| r.is_some()).await.map(|r| (*r).clone());
                    match outcome {
                        Ok(Some(result)) => return result,
                        // Leader went away before publishing; take over
                        Ok(None) | Err(_) => continue,
                    }
                }
            }
        }
    }

    async fn load(&self, channel_id: &str) -> Result<Arc<ChannelRoutingConfig>> {
        let fetched = retry_transient(self.config.retry, "routing lookup", || {
            self.upstream_fetches.fetch_add(1, Ordering::Relaxed);
            let upstream = Arc::clone(&self.upstream);
            let channel = channel_id.to_string();
            async move { upstream.lookup(&channel).await }
        })
        .await;

        match fetched {
            Ok(Some(config)) => {
                let value = Arc::new(config);
                let entry = Arc::new(CacheEntry {
                    value: Arc::clone(&value),
                    refreshed_at: Instant::now(),
                    ttl: self.config.ttl,
                });
                lock(&self.entries).put(channel_id.to_string(), entry);
                debug!(
                    "Cached routing for '{}' ({} agents, mode {})",
                    channel_id,
                    value.agents.len(),
                    value.mode
                );
                Ok(value)
            }
            Ok(None) => {
                if lock(&self.entries).pop(channel_id).is_some() {
                    info!("Routing for '{}' was removed upstream", channel_id);
                }
                Err(RuntimeError::NotFound {
                    channel_id: channel_id.to_string(),
                })
            }
            Err(e) => self.fallback(channel_id, e),
        }
    }

    fn fallback(&self, channel_id: &str, err: RuntimeError) -> Result<Arc<ChannelRoutingConfig>> {
        let now = Instant::now();
        let stale = lock(&self.entries).peek(channel_id).cloned();
        match stale {
            Some(entry) if entry.age(now) <= self.config.max_staleness => {
                if self.config.strict {
                    error!(
                        "Routing refresh for '{}' failed in strict mode: {}",
                        channel_id, err
                    );
                    return Err(err);
                }
                warn!(
                    "Routing refresh for '{}' failed, serving entry {:?} old: {}",
                    channel_id,
                    entry.age(now),
                    err
                );
                self.stale_served.fetch_add(1, Ordering::Relaxed);
                Ok(Arc::clone(&entry.value))
            }
            _ => {
                warn!("Routing lookup for '{}' failed: {}", channel_id, err);
                Err(err)
            }
        }
    }
}
