use std::fmt::Formatter;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::mapref::entry::Entry;

use crate::db::QueryResult;
use crate::FxDashMap;

/// Simple key value cache that locks on a per-key level.
pub struct KeyValueCache<K, V> {
    map: FxDashMap<K, V>,
    statistics: CacheStatistics,
}

impl<K, V> KeyValueCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn try_get(&self, key: &K) -> Option<V> {
        if let Some(existing) = self.map.get(key) {
            self.statistics.hit();
            Some(existing.clone())
        } else {
            self.statistics.miss();
            None
        }
    }

    pub fn get<F>(&self, key: &K, compute: F) -> QueryResult<V>
    where
        F: FnOnce(&K) -> QueryResult<V>,
    {
        Ok(match self.map.entry(key.clone()) {
            Entry::Occupied(cached) => {
                self.statistics.hit();

                cached.get().clone()
            }
            Entry::Vacant(vacant) => {
                self.statistics.miss();

                let value = compute(key)?;
                vacant.insert(value.clone());
                value
            }
        })
    }

    pub fn set(&self, key: K, value: V) {
        self.map.insert(key, value);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.map.remove(key).map(|(_, value)| value)
    }

    pub fn clear(&self) {
        self.map.clear();
        self.map.shrink_to_fit();
    }

    pub fn statistics(&self) -> Option<Statistics> {
        self.statistics.to_statistics()
    }
}

impl<K, V> Default for KeyValueCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self {
            map: FxDashMap::default(),
            statistics: CacheStatistics::default(),
        }
    }
}

impl<K, V> std::fmt::Debug for KeyValueCache<K, V>
where
    K: std::fmt::Debug + Eq + Hash,
    V: std::fmt::Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_map();

        for entry in &self.map {
            debug.entry(&entry.key(), &entry.value());
        }

        debug.finish()
    }
}

/// Optional persistent store for completed module analyses, keyed by the
/// module's qualified name. The serialized form is opaque to callers; the
/// registry consults the store before parsing and writes to it after a
/// library module analyzed successfully.
pub trait AnalysisCache: Send + Sync {
    fn load(&self, qualified_name: &str) -> Option<Vec<u8>>;

    fn save(&self, qualified_name: &str, data: Vec<u8>);
}

/// In-memory [`AnalysisCache`], for tests and as a reference implementation.
#[derive(Debug, Default)]
pub struct MemoryAnalysisCache {
    entries: FxDashMap<String, Vec<u8>>,
}

impl AnalysisCache for MemoryAnalysisCache {
    fn load(&self, qualified_name: &str) -> Option<Vec<u8>> {
        self.entries.get(qualified_name).map(|data| data.clone())
    }

    fn save(&self, qualified_name: &str, data: Vec<u8>) {
        self.entries.insert(qualified_name.to_string(), data);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statistics {
    pub hits: usize,
    pub misses: usize,
}

impl Statistics {
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> Option<f64> {
        if self.hits + self.misses == 0 {
            return None;
        }

        Some((self.hits as f64) / (self.hits + self.misses) as f64)
    }
}

#[cfg(debug_assertions)]
pub type CacheStatistics = DebugStatistics;

#[cfg(not(debug_assertions))]
pub type CacheStatistics = ReleaseStatistics;

pub trait StatisticsRecorder {
    fn hit(&self);
    fn miss(&self);
    fn to_statistics(&self) -> Option<Statistics>;
}

#[derive(Debug, Default)]
pub struct DebugStatistics {
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl StatisticsRecorder for DebugStatistics {
    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::SeqCst);
    }

    fn to_statistics(&self) -> Option<Statistics> {
        let hits = self.hits.load(Ordering::SeqCst);
        let misses = self.misses.load(Ordering::SeqCst);

        Some(Statistics { hits, misses })
    }
}

#[derive(Debug, Default)]
pub struct ReleaseStatistics;

impl StatisticsRecorder for ReleaseStatistics {
    #[inline]
    fn hit(&self) {}

    #[inline]
    fn miss(&self) {}

    #[inline]
    fn to_statistics(&self) -> Option<Statistics> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{AnalysisCache, KeyValueCache, MemoryAnalysisCache};

    #[test]
    fn compute_once() {
        let cache: KeyValueCache<u32, String> = KeyValueCache::default();

        let value = cache.get(&1, |_| Ok("one".to_string())).unwrap();
        assert_eq!(value, "one");

        // The second request must not recompute.
        let value = cache
            .get(&1, |_| panic!("value should be cached"))
            .unwrap();
        assert_eq!(value, "one");

        let statistics = cache.statistics().unwrap();
        assert_eq!(statistics.hits, 1);
        assert_eq!(statistics.misses, 1);
    }

    #[test]
    fn remove_invalidates() {
        let cache: KeyValueCache<u32, String> = KeyValueCache::default();
        cache.set(1, "one".to_string());

        assert_eq!(cache.remove(&1), Some("one".to_string()));
        assert_eq!(cache.try_get(&1), None);
    }

    #[test]
    fn memory_analysis_cache_round_trips() {
        let cache = MemoryAnalysisCache::default();
        assert_eq!(cache.load("collections(3.12)"), None);

        cache.save("collections(3.12)", vec![1, 2, 3]);
        assert_eq!(cache.load("collections(3.12)"), Some(vec![1, 2, 3]));
    }
}
