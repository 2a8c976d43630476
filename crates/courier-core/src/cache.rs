//! Named TTL caches with expiry sweeps and memory-pressure eviction.
//!
//! Each namespace keeps its entries in insertion order. Eviction (capacity or
//! pressure) always removes the oldest-enumerated keys first; reads never
//! reorder entries, so this is deliberately not an LRU.
//!
//! Operations on a namespace that was not configured are no-ops: reads return
//! `None`/empty and writes return `false`.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Weak},
    time::Duration,
};

use courier_platform::{MemoryProbe, MemorySample};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{CacheSettings, ConfigHandle, CourierConfig},
    logger::DiagnosticLogger,
};

/// Namespaces at or below this many entries are left alone by pressure eviction.
pub const PRESSURE_EVICTION_FLOOR: usize = 100;
/// Pressure eviction removes `len / PRESSURE_EVICTION_DIVISOR` entries (20%).
const PRESSURE_EVICTION_DIVISOR: usize = 5;

/// Point-in-time view of one namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceStats {
    /// Entries physically held, including expired ones not yet swept.
    pub keys: usize,
    pub max_size: usize,
    pub ttl: Duration,
    pub hits: u64,
    pub misses: u64,
}

/// Entries removed by one pressure-eviction pass, per namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub removed: BTreeMap<String, usize>,
}

impl EvictionReport {
    pub fn total(&self) -> usize {
        self.removed.values().sum()
    }
}

#[derive(Debug)]
struct Slot<V> {
    value: V,
    inserted_at: Instant,
    /// Entry-specific TTL; `None` follows the namespace TTL.
    ttl: Option<Duration>,
    seq: u64,
}

impl<V> Slot<V> {
    /// A zero TTL never expires.
    fn is_expired(&self, namespace_ttl: Duration, now: Instant) -> bool {
        let ttl = self.ttl.unwrap_or(namespace_ttl);
        !ttl.is_zero() && now.saturating_duration_since(self.inserted_at) >= ttl
    }
}

#[derive(Debug)]
struct NamespaceState<V> {
    settings: CacheSettings,
    entries: HashMap<String, Slot<V>>,
    order: BTreeMap<u64, String>,
    next_seq: u64,
    hits: u64,
    misses: u64,
}

impl<V> NamespaceState<V> {
    fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            hits: 0,
            misses: 0,
        }
    }

    fn max_size(&self) -> usize {
        self.settings.max_size.max(1)
    }

    fn remove(&mut self, key: &str) -> Option<Slot<V>> {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.seq);
        Some(slot)
    }

    fn is_live(&self, key: &str, now: Instant) -> bool {
        self.entries
            .get(key)
            .is_some_and(|slot| !slot.is_expired(self.settings.ttl, now))
    }

    fn insert(&mut self, key: String, value: V, ttl: Option<Duration>, now: Instant) {
        self.remove(&key);
        if self.entries.len() >= self.max_size() {
            self.purge_expired(now);
        }
        let overflow = (self.entries.len() + 1).saturating_sub(self.max_size());
        self.evict_oldest(overflow);

        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, key.clone());
        self.entries.insert(
            key,
            Slot {
                value,
                inserted_at: now,
                ttl,
                seq,
            },
        );
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .order
            .values()
            .filter(|key| self.entries.contains_key(*key) && !self.is_live(key, now))
            .cloned()
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    fn evict_oldest(&mut self, count: usize) -> usize {
        let mut removed = 0;
        while removed < count {
            let Some((_, key)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&key);
            removed += 1;
        }
        removed
    }

    fn relieve_pressure(&mut self) -> usize {
        let len = self.entries.len();
        if len <= PRESSURE_EVICTION_FLOOR {
            return 0;
        }
        let target = (len / PRESSURE_EVICTION_DIVISOR).min(len - PRESSURE_EVICTION_FLOOR);
        self.evict_oldest(target)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn stats(&self) -> NamespaceStats {
        NamespaceStats {
            keys: self.entries.len(),
            max_size: self.max_size(),
            ttl: self.settings.ttl,
            hits: self.hits,
            misses: self.misses,
        }
    }
}

struct Maintenance {
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// A fixed set of independently sized TTL namespaces.
pub struct CacheManager<V> {
    namespaces: HashMap<String, Mutex<NamespaceState<V>>>,
    config: ConfigHandle,
    logger: DiagnosticLogger,
    maintenance: Mutex<Option<Maintenance>>,
}

impl<V> CacheManager<V> {
    /// Build one namespace per entry of the current config's cache section.
    pub fn new(config: &ConfigHandle) -> Self {
        let snapshot = config.load();
        let namespaces = snapshot
            .cache
            .iter()
            .map(|(name, settings)| (name.clone(), Mutex::new(NamespaceState::new(*settings))))
            .collect();

        Self {
            namespaces,
            config: config.clone(),
            logger: DiagnosticLogger::new(config.clone()),
            maintenance: Mutex::new(None),
        }
    }

    /// Configured namespace names, sorted.
    pub fn namespaces(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.namespaces.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.namespaces.contains_key(namespace)
    }

    /// Store `value` with the namespace TTL. Returns `false` for unknown namespaces.
    pub fn set(&self, namespace: &str, key: impl Into<String>, value: V) -> bool {
        let Some(state) = self.namespaces.get(namespace) else {
            return false;
        };
        state.lock().insert(key.into(), value, None, Instant::now());
        true
    }

    /// Store `value` with an entry-specific TTL (zero never expires). The TTL
    /// survives later namespace reconfiguration.
    pub fn set_with_ttl(
        &self,
        namespace: &str,
        key: impl Into<String>,
        value: V,
        ttl: Duration,
    ) -> bool {
        let Some(state) = self.namespaces.get(namespace) else {
            return false;
        };
        state.lock().insert(key.into(), value, Some(ttl), Instant::now());
        true
    }

    /// Remove one key. Returns whether it was present.
    pub fn delete(&self, namespace: &str, key: &str) -> bool {
        self.namespaces
            .get(namespace)
            .is_some_and(|state| state.lock().remove(key).is_some())
    }

    /// Live keys in enumeration (insertion) order.
    pub fn keys(&self, namespace: &str) -> Vec<String> {
        let Some(state) = self.namespaces.get(namespace) else {
            return Vec::new();
        };
        let state = state.lock();
        let now = Instant::now();
        state
            .order
            .values()
            .filter(|key| state.is_live(key, now))
            .cloned()
            .collect()
    }

    pub fn stats(&self, namespace: &str) -> Option<NamespaceStats> {
        self.namespaces
            .get(namespace)
            .map(|state| state.lock().stats())
    }

    pub fn all_stats(&self) -> BTreeMap<String, NamespaceStats> {
        self.namespaces
            .iter()
            .map(|(name, state)| (name.clone(), state.lock().stats()))
            .collect()
    }

    /// Drop every entry of one namespace.
    pub fn clear(&self, namespace: &str) -> bool {
        let Some(state) = self.namespaces.get(namespace) else {
            return false;
        };
        state.lock().clear();
        true
    }

    /// Physically remove expired entries of one namespace.
    pub fn sweep_expired(&self, namespace: &str) -> usize {
        self.namespaces
            .get(namespace)
            .map_or(0, |state| state.lock().purge_expired(Instant::now()))
    }

    /// Trim the oldest 20% of every namespace holding more than
    /// [`PRESSURE_EVICTION_FLOOR`] entries, never going below the floor.
    pub fn evict_under_pressure(&self) -> EvictionReport {
        let mut report = EvictionReport::default();
        for (name, state) in &self.namespaces {
            let removed = state.lock().relieve_pressure();
            if removed > 0 {
                report.removed.insert(name.clone(), removed);
            }
        }
        if report.total() > 0 {
            self.logger.warn(format_args!(
                "memory pressure eviction removed {} entries across {} namespaces",
                report.total(),
                report.removed.len()
            ));
        }
        report
    }

    /// Sample `probe` once and evict if usage exceeds the configured threshold.
    pub fn check_memory_pressure(&self, probe: &dyn MemoryProbe) -> Option<EvictionReport> {
        let sample = match probe.sample() {
            Ok(sample) => sample,
            Err(err) => {
                self.logger
                    .debug(format_args!("memory sample unavailable: {err}"));
                return None;
            }
        };
        let threshold = self.config.load().performance.memory_threshold;
        if !exceeds_threshold(&sample, threshold) {
            return None;
        }
        self.logger.performance(format_args!(
            "memory usage {:.2} above threshold {threshold:.2}",
            sample.usage_ratio()
        ));
        Some(self.evict_under_pressure())
    }

    /// Apply new sizing to live namespaces; entries beyond a smaller max are
    /// evicted oldest-first. A new namespace TTL applies to every entry stored
    /// without its own TTL, measured from its original insertion. Namespaces
    /// absent from `config` keep their sizing.
    pub fn reconfigure(&self, config: &CourierConfig) {
        for (name, state) in &self.namespaces {
            let Some(settings) = config.cache_settings(name) else {
                continue;
            };
            let mut state = state.lock();
            state.settings = *settings;
            let overflow = state.entries.len().saturating_sub(state.max_size());
            state.evict_oldest(overflow);
        }
    }

    /// Stop background maintenance started by [`CacheManager::start_maintenance`].
    ///
    /// The manager must not be used afterwards.
    pub fn shutdown(&self) {
        if let Some(running) = self.maintenance.lock().take() {
            running.stop.cancel();
            drop(running.tasks);
        }
    }

    fn cleanup_interval(&self, namespace: &str) -> Option<Duration> {
        self.namespaces
            .get(namespace)
            .map(|state| state.lock().settings.cleanup_interval)
            .filter(|interval| !interval.is_zero())
    }
}

impl<V: Clone> CacheManager<V> {
    /// Read a live entry. Expired entries are removed on the way.
    pub fn get(&self, namespace: &str, key: &str) -> Option<V> {
        let state = self.namespaces.get(namespace)?;
        let mut state = state.lock();
        let now = Instant::now();

        if !state.entries.contains_key(key) {
            state.misses += 1;
            return None;
        }
        if !state.is_live(key, now) {
            state.remove(key);
            state.misses += 1;
            return None;
        }
        state.hits += 1;
        state.entries.get(key).map(|slot| slot.value.clone())
    }
}

impl<V: Send + 'static> CacheManager<V> {
    /// Spawn the per-namespace expiry sweeps and, when metrics are enabled,
    /// the memory-pressure monitor. Returns `false` if already running.
    ///
    /// Tasks hold only a weak reference and exit when the manager is dropped
    /// or [`CacheManager::shutdown`] is called.
    pub fn start_maintenance(self: &Arc<Self>, probe: Arc<dyn MemoryProbe>) -> bool {
        let mut guard = self.maintenance.lock();
        if guard.is_some() {
            return false;
        }

        let stop = CancellationToken::new();
        let mut tasks = Vec::new();
        for name in self.namespaces.keys() {
            if self.cleanup_interval(name).is_none() {
                continue;
            }
            tasks.push(tokio::spawn(sweep_loop(
                Arc::downgrade(self),
                name.clone(),
                stop.child_token(),
            )));
        }

        let performance = self.config.load().performance.clone();
        if performance.enable_metrics {
            tasks.push(tokio::spawn(memory_monitor_loop(
                Arc::downgrade(self),
                probe,
                performance.memory_check_interval,
                stop.child_token(),
            )));
        }

        self.logger.debug(format_args!(
            "cache maintenance started with {} tasks",
            tasks.len()
        ));
        *guard = Some(Maintenance { stop, tasks });
        true
    }
}

impl<V> Drop for CacheManager<V> {
    fn drop(&mut self) {
        if let Some(running) = self.maintenance.get_mut().take() {
            running.stop.cancel();
        }
    }
}

async fn sweep_loop<V: Send + 'static>(
    manager: Weak<CacheManager<V>>,
    namespace: String,
    stop: CancellationToken,
) {
    loop {
        let Some(interval) = manager
            .upgrade()
            .and_then(|manager| manager.cleanup_interval(&namespace))
        else {
            break;
        };
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let Some(manager) = manager.upgrade() else {
            break;
        };
        let removed = manager.sweep_expired(&namespace);
        if removed > 0 {
            manager
                .logger
                .performance(format_args!("swept {removed} expired entries from {namespace}"));
        }
    }
}

async fn memory_monitor_loop<V: Send + 'static>(
    manager: Weak<CacheManager<V>>,
    probe: Arc<dyn MemoryProbe>,
    period: Duration,
    stop: CancellationToken,
) {
    let period = period.max(Duration::from_millis(1));
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.check_memory_pressure(probe.as_ref());
    }
}

fn exceeds_threshold(sample: &MemorySample, threshold: f64) -> bool {
    sample.total_bytes > 0 && sample.usage_ratio() > threshold
}
