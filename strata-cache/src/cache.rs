//! Bounded in-memory cache.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use strata_core::{ConfigError, MemoryPolicy, StrataResult};

use crate::ticker::{SystemTicker, Ticker};

/// Computes the weight of an entry.
pub type Weigher<K, V> = Arc<dyn Fn(&K, &V) -> u64 + Send + Sync>;

/// A cached value with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub weight: u64,
    pub write_time: Duration,
    pub access_time: Duration,
}

/// Capacity bound of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    Unbounded,
    MaxSize(u64),
    MaxWeight(u64),
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses, including expired entries.
    pub misses: u64,
    /// Number of evictions due to capacity.
    pub evictions: u64,
    /// Number of entries dropped because they expired.
    pub expirations: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Total weight of entries currently in cache.
    pub total_weight: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheInner<K, V> {
    entries: LruCache<K, CacheEntry<V>>,
    total_weight: u64,
    stats: CacheStats,
}

/// LRU cache bounded by entry count or total weight, with optional
/// write and access expiry.
///
/// All structural state sits behind one lock. Operations never suspend
/// while holding it.
pub struct Cache<K, V> {
    inner: Mutex<CacheInner<K, V>>,
    capacity: Capacity,
    weigher: Option<Weigher<K, V>>,
    expire_after_write: Option<Duration>,
    expire_after_access: Option<Duration>,
    ticker: Arc<dyn Ticker>,
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn builder() -> CacheBuilder<K, V> {
        CacheBuilder::new()
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    fn is_expired(&self, entry: &CacheEntry<V>, now: Duration) -> bool {
        let written_too_long_ago = self
            .expire_after_write
            .is_some_and(|ttl| now.saturating_sub(entry.write_time) >= ttl);
        let idle_too_long = self
            .expire_after_access
            .is_some_and(|ttl| now.saturating_sub(entry.access_time) >= ttl);
        written_too_long_ago || idle_too_long
    }

    fn weigh(&self, key: &K, value: &V) -> u64 {
        self.weigher.as_ref().map_or(1, |weigher| weigher(key, value))
    }

    fn over_capacity(&self, inner: &CacheInner<K, V>) -> bool {
        match self.capacity {
            Capacity::Unbounded => false,
            Capacity::MaxSize(max) => inner.entries.len() as u64 > max,
            Capacity::MaxWeight(max) => inner.total_weight > max,
        }
    }

    /// Live lookup under the lock. Promotes the entry and refreshes its
    /// access time; drops it if expired.
    fn lookup_locked(&self, inner: &mut CacheInner<K, V>, key: &K, now: Duration) -> Option<V> {
        let CacheInner {
            entries,
            total_weight,
            stats,
        } = inner;

        let expired = match entries.get_mut(key) {
            None => {
                stats.misses += 1;
                return None;
            }
            Some(entry) => {
                if !self.is_expired(entry, now) {
                    entry.access_time = now;
                    stats.hits += 1;
                    return Some(entry.value.clone());
                }
                entry.weight
            }
        };

        entries.pop(key);
        *total_weight = total_weight.saturating_sub(expired);
        stats.expirations += 1;
        stats.misses += 1;
        None
    }

    fn insert_locked(
        &self,
        inner: &mut CacheInner<K, V>,
        key: K,
        value: V,
        weight: u64,
        now: Duration,
    ) {
        let entry = CacheEntry {
            value,
            weight,
            write_time: now,
            access_time: now,
        };
        if let Some(previous) = inner.entries.put(key, entry) {
            inner.total_weight = inner.total_weight.saturating_sub(previous.weight);
        }
        inner.total_weight = inner.total_weight.saturating_add(weight);

        // May evict the entry just inserted when it alone exceeds the bound.
        while self.over_capacity(inner) {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => {
                    inner.total_weight = inner.total_weight.saturating_sub(evicted.weight);
                    inner.stats.evictions += 1;
                }
                None => break,
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.ticker.read();
        let mut inner = self.inner.lock();
        self.lookup_locked(&mut inner, key, now)
    }

    /// Returns the cached value, or computes, stores and returns it.
    ///
    /// `compute` runs under the cache lock, so concurrent callers for the
    /// same key invoke it at most once. Keep it cheap.
    pub fn get_or_put<F>(&self, key: K, compute: F) -> V
    where
        F: FnOnce() -> V,
    {
        let now = self.ticker.read();
        let mut inner = self.inner.lock();
        if let Some(value) = self.lookup_locked(&mut inner, &key, now) {
            return value;
        }
        let value = compute();
        let weight = self.weigh(&key, &value);
        self.insert_locked(&mut inner, key, value.clone(), weight, now);
        value
    }

    /// Async variant of [`get_or_put`](Self::get_or_put). The loader runs
    /// outside the lock, so concurrent misses may each invoke it; the last
    /// one to finish wins. Errors are returned without touching the cache.
    pub async fn get_or_load<F, Fut, E>(&self, key: K, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = load().await?;
        self.put(key, value.clone());
        Ok(value)
    }

    /// Insert using the configured weigher, or weight 1.
    pub fn put(&self, key: K, value: V) {
        let weight = self.weigh(&key, &value);
        self.put_weighted(key, value, weight);
    }

    /// Insert with an explicit weight, bypassing the weigher.
    pub fn put_weighted(&self, key: K, value: V, weight: u64) {
        let now = self.ticker.read();
        let mut inner = self.inner.lock();
        self.insert_locked(&mut inner, key, value, weight, now);
    }

    pub fn invalidate(&self, key: &K) {
        let mut inner = self.inner.lock();
        if let Some(removed) = inner.entries.pop(key) {
            inner.total_weight = inner.total_weight.saturating_sub(removed.weight);
        }
    }

    pub fn invalidate_keys<'a, I>(&self, keys: I)
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        let mut inner = self.inner.lock();
        for key in keys {
            if let Some(removed) = inner.entries.pop(key) {
                inner.total_weight = inner.total_weight.saturating_sub(removed.weight);
            }
        }
    }

    pub fn invalidate_all(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.total_weight = 0;
    }

    /// Number of live entries. Expired entries are purged first.
    pub fn size(&self) -> u64 {
        let now = self.ticker.read();
        let mut inner = self.inner.lock();
        self.purge_expired_locked(&mut inner, now);
        inner.entries.len() as u64
    }

    /// Total weight of live entries.
    pub fn weight(&self) -> u64 {
        let now = self.ticker.read();
        let mut inner = self.inner.lock();
        self.purge_expired_locked(&mut inner, now);
        inner.total_weight
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entry_count: inner.entries.len() as u64,
            total_weight: inner.total_weight,
            ..inner.stats.clone()
        }
    }

    fn purge_expired_locked(&self, inner: &mut CacheInner<K, V>, now: Duration) {
        if self.expire_after_write.is_none() && self.expire_after_access.is_none() {
            return;
        }
        let expired: Vec<K> = inner
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(removed) = inner.entries.pop(&key) {
                inner.total_weight = inner.total_weight.saturating_sub(removed.weight);
                inner.stats.expirations += 1;
            }
        }
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Builder for [`Cache`].
pub struct CacheBuilder<K, V> {
    max_size: Option<u64>,
    max_weight: Option<u64>,
    weigher: Option<Weigher<K, V>>,
    expire_after_write: Option<Duration>,
    expire_after_access: Option<Duration>,
    ticker: Option<Arc<dyn Ticker>>,
}

impl<K, V> Default for CacheBuilder<K, V> {
    fn default() -> Self {
        Self {
            max_size: None,
            max_weight: None,
            weigher: None,
            expire_after_write: None,
            expire_after_access: None,
            ticker: None,
        }
    }
}

impl<K, V> CacheBuilder<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the builder from a memory policy. A weight bound still needs a
    /// weigher via [`weigher`](Self::weigher).
    pub fn from_policy(policy: &MemoryPolicy) -> Self {
        Self {
            max_size: policy.max_size,
            max_weight: policy.max_weight,
            expire_after_write: policy.expire_after_write,
            expire_after_access: policy.expire_after_access,
            ..Self::default()
        }
    }

    pub fn maximum_size(mut self, max_size: u64) -> Self {
        self.max_size = Some(max_size);
        self
    }

    pub fn maximum_weight<F>(mut self, max_weight: u64, weigher: F) -> Self
    where
        F: Fn(&K, &V) -> u64 + Send + Sync + 'static,
    {
        self.max_weight = Some(max_weight);
        self.weigher = Some(Arc::new(weigher));
        self
    }

    pub fn weigher(mut self, weigher: Weigher<K, V>) -> Self {
        self.weigher = Some(weigher);
        self
    }

    pub fn expire_after_write(mut self, ttl: Duration) -> Self {
        self.expire_after_write = Some(ttl);
        self
    }

    pub fn expire_after_access(mut self, ttl: Duration) -> Self {
        self.expire_after_access = Some(ttl);
        self
    }

    pub fn ticker(mut self, ticker: Arc<dyn Ticker>) -> Self {
        self.ticker = Some(ticker);
        self
    }

    pub fn build(self) -> StrataResult<Cache<K, V>> {
        let capacity = match (self.max_size, self.max_weight) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::IncompatibleOptions {
                    option_a: "maximum_size".to_string(),
                    option_b: "maximum_weight".to_string(),
                }
                .into())
            }
            (Some(max), None) => Capacity::MaxSize(max),
            (None, Some(max)) => {
                if self.weigher.is_none() {
                    return Err(ConfigError::InvalidValue {
                        field: "maximum_weight".to_string(),
                        value: max.to_string(),
                        reason: "a weight bound requires a weigher".to_string(),
                    }
                    .into());
                }
                Capacity::MaxWeight(max)
            }
            (None, None) => Capacity::Unbounded,
        };

        for (field, ttl) in [
            ("expire_after_write", self.expire_after_write),
            ("expire_after_access", self.expire_after_access),
        ] {
            if ttl == Some(Duration::ZERO) {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: "0ms".to_string(),
                    reason: "expiry must be positive".to_string(),
                }
                .into());
            }
        }

        Ok(Cache {
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                total_weight: 0,
                stats: CacheStats::default(),
            }),
            capacity,
            weigher: self.weigher,
            expire_after_write: self.expire_after_write,
            expire_after_access: self.expire_after_access,
            ticker: self
                .ticker
                .unwrap_or_else(|| Arc::new(SystemTicker::new())),
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
