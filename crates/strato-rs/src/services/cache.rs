//! In-process response cache with TTL, scored eviction and predictive
//! warming.
//!
//! Entries are keyed by the request fingerprint
//! (`method|path|sortedQuery|vary`). The store is bounded twice over —
//! entry count and total bytes — and refuses writes it cannot make room
//! for within the eviction budget rather than evicting without bound.
//! Every hit feeds a per-entry access history from which the store derives
//! a frequency/trend/confidence pattern used for prefetch ranking.
//!
//! Concurrent misses on one fingerprint collapse into a single
//! computation: one caller produces the value, the rest wait and share it.

use crate::models::error::AppError;
use ahash::HashMap as AHashMap;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::future::Future;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Number of access timestamps retained per entry for trend analysis.
const ACCESS_HISTORY: usize = 10;
/// Compression must shave at least this fraction off to be worth keeping.
const MIN_COMPRESSION_GAIN: f64 = 0.20;
/// Predictions older than this are discarded by the maintenance sweep.
const PREDICTION_TTL: Duration = Duration::from_secs(600);

/// A cached response: status, headers and body, ready to replay.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Options accepted by [`CacheStore::set`].
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// Override of the store-wide TTL, in seconds. `Some(0)` never expires.
    pub ttl_secs: Option<u64>,
    pub tags: Vec<String>,
    /// Eviction priority; higher survives longer. Defaults to 1.0.
    pub priority: Option<f64>,
}

/// Direction the access rate of an entry is moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Increasing,
    Stable,
    Decreasing,
}

impl Trend {
    fn multiplier(&self) -> f64 {
        match self {
            Trend::Increasing => 1.3,
            Trend::Stable => 1.0,
            Trend::Decreasing => 0.7,
        }
    }
}

/// Derived access statistics for one cache key.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessPattern {
    pub frequency_per_minute: f64,
    pub trend: Trend,
    /// Grows with sample count, saturating at 1.0.
    pub confidence: f64,
}

struct CacheEntry {
    response: CachedResponse,
    compressed: bool,
    created_at: Instant,
    expires_at: Option<Instant>,
    hits: u64,
    last_access: Instant,
    access_times: VecDeque<Instant>,
    priority: f64,
    size_bytes: usize,
    tags: Vec<String>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|e| e <= now).unwrap_or(false)
    }

    fn record_access(&mut self, now: Instant) {
        self.hits += 1;
        self.last_access = now;
        if self.access_times.len() == ACCESS_HISTORY {
            self.access_times.pop_front();
        }
        self.access_times.push_back(now);
    }

    fn pattern(&self, now: Instant) -> AccessPattern {
        let samples = self.access_times.len();
        if samples < 2 {
            return AccessPattern {
                frequency_per_minute: 0.0,
                trend: Trend::Stable,
                confidence: samples as f64 / ACCESS_HISTORY as f64,
            };
        }
        let span = now
            .duration_since(*self.access_times.front().expect("nonempty"))
            .as_secs_f64()
            .max(1.0);
        let frequency_per_minute = samples as f64 / (span / 60.0);

        // Compare the inter-access gap of the older half to the newer
        // half; shrinking gaps mean the key is heating up.
        let times: Vec<Instant> = self.access_times.iter().copied().collect();
        let mid = times.len() / 2;
        let gap = |slice: &[Instant]| -> f64 {
            if slice.len() < 2 {
                return f64::MAX;
            }
            slice
                .windows(2)
                .map(|w| w[1].duration_since(w[0]).as_secs_f64())
                .sum::<f64>()
                / (slice.len() - 1) as f64
        };
        let older = gap(&times[..mid.max(2)]);
        let newer = gap(&times[mid.min(times.len() - 2)..]);
        let trend = if newer < older * 0.75 {
            Trend::Increasing
        } else if newer > older * 1.25 {
            Trend::Decreasing
        } else {
            Trend::Stable
        };

        AccessPattern {
            frequency_per_minute,
            trend,
            confidence: (samples as f64 / ACCESS_HISTORY as f64).min(1.0),
        }
    }

    /// Eviction score; lower evicts first.
    fn eviction_score(&self, now: Instant) -> f64 {
        let age_hours = now.duration_since(self.created_at).as_secs_f64() / 3600.0;
        let since_access_min = (now.duration_since(self.last_access).as_secs_f64() / 60.0).min(30.0);
        let size_kb = self.size_bytes as f64 / 1024.0;
        self.priority - age_hours - since_access_min + ((self.hits + 1) as f64).ln() - size_kb / 10.0
    }
}

/// Aggregate counters, readable without the store lock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub bytes: usize,
}

/// Bounded in-memory cache store.
pub struct CacheStore {
    entries: RwLock<AHashMap<String, CacheEntry>>,
    max_entries: usize,
    max_memory_bytes: usize,
    default_ttl: Option<Duration>,
    compression_threshold: usize,
    current_bytes: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    /// Keys flagged by prediction, with the time they were flagged.
    predictions: RwLock<AHashMap<String, Instant>>,
    /// Single-flight coordination per fingerprint.
    pending: tokio::sync::Mutex<AHashMap<String, Arc<Notify>>>,
}

impl CacheStore {
    pub fn new(
        max_entries: usize,
        max_memory_bytes: usize,
        default_ttl_secs: u64,
        compression_threshold: usize,
    ) -> Self {
        Self {
            entries: RwLock::new(AHashMap::default()),
            max_entries,
            max_memory_bytes,
            default_ttl: (default_ttl_secs > 0).then(|| Duration::from_secs(default_ttl_secs)),
            compression_threshold,
            current_bytes: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            predictions: RwLock::new(AHashMap::default()),
            pending: tokio::sync::Mutex::new(AHashMap::default()),
        }
    }

    pub fn from_config(cache: &crate::models::config::CacheSection) -> Self {
        Self::new(
            cache.max_entries,
            cache.max_memory_bytes(),
            cache.ttl_secs,
            cache.compression_threshold,
        )
    }

    /// Fetches and replays an entry. Expired entries are dropped on
    /// access and never returned.
    pub fn get(&self, fingerprint: &str) -> Option<CachedResponse> {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(fingerprint) {
            Some(entry) if entry.is_expired(now) => {
                let size = entry.size_bytes;
                entries.remove(fingerprint);
                self.current_bytes.fetch_sub(size, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(entry) => {
                entry.record_access(now);
                self.hits.fetch_add(1, Ordering::Relaxed);
                let mut response = entry.response.clone();
                let compressed = entry.compressed;
                drop(entries);
                if compressed {
                    response.body = gunzip(&response.body).unwrap_or(response.body);
                }
                Some(response)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores an entry, evicting up to 10% of current entries to make
    /// room. Fails with `insufficient-capacity` when the budget cannot be
    /// met — an over-large value must not wipe the cache.
    pub fn set(
        &self,
        fingerprint: &str,
        mut response: CachedResponse,
        opts: CacheOptions,
    ) -> Result<(), AppError> {
        if self.max_entries == 0 {
            return Ok(());
        }
        let now = Instant::now();

        let mut compressed = false;
        if response.body.len() >= self.compression_threshold {
            if let Ok(packed) = gzip(&response.body) {
                let gain = 1.0 - packed.len() as f64 / response.body.len() as f64;
                if gain >= MIN_COMPRESSION_GAIN {
                    response.body = packed;
                    compressed = true;
                }
            }
        }

        let size_bytes = response.body.len()
            + response
                .headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>();
        if size_bytes > self.max_memory_bytes {
            return Err(AppError::CacheCapacity {
                needed_bytes: size_bytes,
            });
        }

        let expires_at = match opts.ttl_secs {
            Some(0) => None,
            Some(secs) => Some(now + Duration::from_secs(secs)),
            None => self.default_ttl.map(|ttl| now + ttl),
        };

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());

        // Replacing an entry releases its accounting first.
        if let Some(old) = entries.remove(fingerprint) {
            self.current_bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
        }

        let over_capacity = |entries: &AHashMap<String, CacheEntry>, bytes: usize| {
            entries.len() >= self.max_entries
                || bytes + size_bytes > self.max_memory_bytes
        };

        if over_capacity(&entries, self.current_bytes.load(Ordering::Relaxed)) {
            let budget = (entries.len() / 10).max(1);
            let mut scored: Vec<(String, f64, usize)> = entries
                .iter()
                .map(|(k, e)| (k.clone(), e.eviction_score(now), e.size_bytes))
                .collect();
            scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            for (key, _, size) in scored.into_iter().take(budget) {
                entries.remove(&key);
                self.current_bytes.fetch_sub(size, Ordering::Relaxed);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("cache: evicted {}", key);
                if !over_capacity(&entries, self.current_bytes.load(Ordering::Relaxed)) {
                    break;
                }
            }
            if over_capacity(&entries, self.current_bytes.load(Ordering::Relaxed)) {
                return Err(AppError::CacheCapacity {
                    needed_bytes: size_bytes,
                });
            }
        }

        entries.insert(
            fingerprint.to_string(),
            CacheEntry {
                response,
                compressed,
                created_at: now,
                expires_at,
                hits: 0,
                last_access: now,
                access_times: VecDeque::with_capacity(ACCESS_HISTORY),
                priority: opts.priority.unwrap_or(1.0),
                size_bytes,
                tags: opts.tags,
            },
        );
        self.current_bytes.fetch_add(size_bytes, Ordering::Relaxed);
        Ok(())
    }

    pub fn delete(&self, fingerprint: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.remove(fingerprint) {
            self.current_bytes.fetch_sub(entry.size_bytes, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.clear();
        self.current_bytes.store(0, Ordering::Relaxed);
    }

    /// Removes every entry carrying `tag`. Returns the removal count.
    pub fn invalidate_by_tag(&self, tag: &str) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.tags.iter().any(|t| t == tag))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            if let Some(entry) = entries.remove(key) {
                self.current_bytes.fetch_sub(entry.size_bytes, Ordering::Relaxed);
            }
        }
        doomed.len()
    }

    /// Access pattern for a live entry.
    pub fn pattern(&self, fingerprint: &str) -> Option<AccessPattern> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(fingerprint).map(|e| e.pattern(Instant::now()))
    }

    /// Ranks live entries by predicted access probability —
    /// `frequency × trend × confidence` — and returns the top `n` keys.
    pub fn predict_next_access(&self, n: usize) -> Vec<String> {
        let now = Instant::now();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut ranked: Vec<(String, f64)> = entries
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, e)| {
                let p = e.pattern(now);
                let probability = p.frequency_per_minute * p.trend.multiplier() * p.confidence;
                (k.clone(), probability)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let keys: Vec<String> = ranked.into_iter().take(n).map(|(k, _)| k).collect();

        let mut predictions = self.predictions.write().unwrap_or_else(|e| e.into_inner());
        for key in &keys {
            predictions.insert(key.clone(), now);
        }
        keys
    }

    /// Loads predicted keys that have since left the cache. Loader
    /// failures are swallowed — warming is best-effort by contract.
    pub async fn warm_cache<L>(&self, loader: L)
    where
        L: Fn(String) -> BoxFuture<'static, Result<CachedResponse, AppError>>,
    {
        let missing: Vec<String> = {
            let predictions = self.predictions.read().unwrap_or_else(|e| e.into_inner());
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            predictions
                .keys()
                .filter(|k| !entries.contains_key(*k))
                .cloned()
                .collect()
        };
        if missing.is_empty() {
            return;
        }
        debug!("cache: warming {} predicted key(s)", missing.len());
        let loads = missing.iter().map(|key| loader(key.clone()));
        let results = futures::future::join_all(loads).await;
        for (key, result) in missing.into_iter().zip(results) {
            match result {
                Ok(response) => {
                    if let Err(e) = self.set(&key, response, CacheOptions::default()) {
                        debug!("cache: warm store for {} failed: {}", key, e);
                    }
                }
                Err(e) => debug!("cache: warm load for {} failed: {}", key, e),
            }
        }
    }

    /// Single-flight compute: exactly one caller runs `compute` per
    /// fingerprint; concurrent callers wait and read the winner's value.
    pub async fn get_or_compute<F, Fut>(
        &self,
        fingerprint: &str,
        opts: CacheOptions,
        compute: F,
    ) -> Result<(CachedResponse, bool), AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedResponse, AppError>>,
    {
        let mut compute = Some(compute);
        loop {
            if let Some(found) = self.get(fingerprint) {
                return Ok((found, true));
            }

            let notify = {
                let mut pending = self.pending.lock().await;
                match pending.get(fingerprint) {
                    Some(existing) => Some(existing.clone()),
                    None => {
                        pending.insert(fingerprint.to_string(), Arc::new(Notify::new()));
                        None
                    }
                }
            };

            match notify {
                Some(notify) => {
                    // Another task is producing this value; wait for it.
                    notify.notified().await;
                    if let Some(found) = self.get(fingerprint) {
                        return Ok((found, true));
                    }
                    // Producer failed; loop and compete again.
                    continue;
                }
                None => {
                    let Some(compute) = compute.take() else {
                        // This task already produced once; a second miss
                        // means the value was immediately evicted.
                        self.finish_pending(fingerprint).await;
                        return Err(AppError::CacheCapacity { needed_bytes: 0 });
                    };
                    let result = compute().await;
                    match result {
                        Ok(response) => {
                            // Error responses are never cached; the waiters
                            // will recompute on their own.
                            if (200..300).contains(&response.status) {
                                if let Err(e) =
                                    self.set(fingerprint, response.clone(), opts.clone())
                                {
                                    warn!("cache: store after compute failed: {}", e);
                                }
                            }
                            self.finish_pending(fingerprint).await;
                            return Ok((response, false));
                        }
                        Err(e) => {
                            self.finish_pending(fingerprint).await;
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    async fn finish_pending(&self, fingerprint: &str) {
        let mut pending = self.pending.lock().await;
        if let Some(notify) = pending.remove(fingerprint) {
            notify.notify_waiters();
        }
    }

    /// Drops expired entries and stale predictions. The server schedules
    /// this every 60 seconds.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        let mut freed = 0usize;
        entries.retain(|_, e| {
            if e.is_expired(now) {
                freed += e.size_bytes;
                false
            } else {
                true
            }
        });
        if freed > 0 {
            self.current_bytes.fetch_sub(freed, Ordering::Relaxed);
            info!(
                "cache: purged {} expired entr{}",
                before - entries.len(),
                if before - entries.len() == 1 { "y" } else { "ies" }
            );
        }
        drop(entries);

        let mut predictions = self.predictions.write().unwrap_or_else(|e| e.into_inner());
        predictions.retain(|_, at| now.duration_since(*at) < PREDICTION_TTL);
    }

    /// Spawns the periodic maintenance sweep.
    pub fn start_maintenance(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.purge_expired();
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: entries.len(),
            bytes: self.current_bytes.load(Ordering::Relaxed),
        }
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn gunzip(data: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).ok()?;
    Some(out)
}
