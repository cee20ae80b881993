use std::sync::Arc;

use hpo_types::{Frame, TtResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Holds the ingested frame for the lifetime of a trial.
///
/// The entry is never invalidated by the pipeline: every fold reuses it.
#[derive(Debug, Default)]
pub struct DatasetCache {
    entry: RwLock<Option<Arc<Frame>>>,
    stats: RwLock<CacheStats>,
}

impl DatasetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached frame, or run `load` once and cache its result.
    pub fn get_or_load(&self, load: impl FnOnce() -> TtResult<Frame>) -> TtResult<Arc<Frame>> {
        if let Some(frame) = self.get() {
            return Ok(frame);
        }

        let frame = Arc::new(load()?);
        self.store(Arc::clone(&frame));
        Ok(frame)
    }

    pub fn get(&self) -> Option<Arc<Frame>> {
        let cached = self.entry.read().clone();
        let mut stats = self.stats.write();
        match cached {
            Some(frame) => {
                stats.hits += 1;
                Some(frame)
            }
            None => {
                stats.misses += 1;
                None
            }
        }
    }

    pub fn store(&self, frame: Arc<Frame>) {
        let rows = frame.len() as u64;
        *self.entry.write() = Some(frame);

        let mut stats = self.stats.write();
        stats.stores += 1;
        stats.rows_cached = rows;
    }

    pub fn get_stats(&self) -> CacheStats {
        self.stats.read().clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub rows_cached: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpo_types::Partition;

    fn frame() -> Frame {
        let part = Partition::new(vec![vec![Some(1.0), Some(2.0)]]).unwrap();
        Frame::new(vec!["a".into()], vec![part]).unwrap()
    }

    #[test]
    fn test_cache_loads_once() {
        let cache = DatasetCache::new();
        let mut loads = 0;

        let first = cache
            .get_or_load(|| {
                loads += 1;
                Ok(frame())
            })
            .unwrap();
        let second = cache
            .get_or_load(|| {
                loads += 1;
                Ok(frame())
            })
            .unwrap();

        assert_eq!(loads, 1);
        assert!(Arc::ptr_eq(&first, &second));

        let stats = cache.get_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.stores, 1);
        assert_eq!(stats.rows_cached, 2);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_failed_load_is_not_cached() {
        let cache = DatasetCache::new();
        let err = cache.get_or_load(|| Err(hpo_types::internal_error!("disk on fire")));
        assert!(err.is_err());
        assert_eq!(cache.get_stats().stores, 0);

        // the next call retries the load
        let loaded = cache.get_or_load(|| Ok(frame())).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(cache.get_stats().misses, 2);
    }
}
