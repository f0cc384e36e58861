//! The two-tier response cache (§4.2): a bounded in-memory L1 in front of a
//! persistent on-disk L2, strict lookup order L1 -> L2, writes populate both.
//!
//! L1 mirrors this codebase's existing `RwLock`-protected in-memory maps
//! (see `AppState.extractions`): an `lru::LruCache` behind a `std::sync::
//! RwLock`. L2 is `sled`, an embedded pure-Rust KV store — picked because it
//! is the persistence crate this retrieval pack's other repos already reach
//! for when they need an embedded store, and it gives us real LRU-by-
//! access-time eviction without hand-rolling a WAL.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::fingerprint::CacheKey;
use crate::model::ExtractionResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    L1,
    L2,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub l1_size: usize,
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
}

/// On-disk record wrapper, giving L2 entries an access timestamp so the
/// periodic quota sweep can evict by least-recently-accessed (§5).
#[derive(Debug, Serialize, Deserialize)]
struct L2Entry {
    result: ExtractionResult,
    last_accessed: f64,
}

pub struct Cache {
    l1: RwLock<LruCache<CacheKey, ExtractionResult>>,
    l2: sled::Db,
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
}

impl Cache {
    pub fn open(l1_capacity: usize, l2_dir: &std::path::Path) -> anyhow::Result<Self> {
        let capacity = NonZeroUsize::new(l1_capacity.max(1)).expect("capacity clamped to >=1");
        let l2 = sled::open(l2_dir)?;
        Ok(Self {
            l1: RwLock::new(LruCache::new(capacity)),
            l2,
            l1_hits: AtomicU64::new(0),
            l1_misses: AtomicU64::new(0),
            l2_hits: AtomicU64::new(0),
            l2_misses: AtomicU64::new(0),
        })
    }

    /// `get(key) -> (result|miss, source)` (§4.2). A hit in L2 promotes the
    /// entry into L1. L2 I/O errors degrade to a miss rather than failing
    /// the caller — cache failures never fail a request (§7).
    pub fn get(&self, key: &CacheKey) -> Option<(ExtractionResult, CacheSource)> {
        if let Some(result) = self.l1.write().unwrap().get(key).cloned() {
            self.l1_hits.fetch_add(1, Ordering::Relaxed);
            return Some((result, CacheSource::L1));
        }
        self.l1_misses.fetch_add(1, Ordering::Relaxed);

        match self.l2_get(key) {
            Ok(Some(result)) => {
                self.l2_hits.fetch_add(1, Ordering::Relaxed);
                self.l1.write().unwrap().put(*key, result.clone());
                Some((result, CacheSource::L2))
            }
            Ok(None) => {
                self.l2_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                warn!("cache L2 read failed, degrading to miss: {}", e);
                self.l2_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// `put(key, result)`: inserts into both tiers, idempotently. An L2
    /// write failure is logged and swallowed — the L1 write still lands.
    pub fn put(&self, key: CacheKey, result: ExtractionResult) {
        self.l1.write().unwrap().put(key, result.clone());
        if let Err(e) = self.l2_put(key, &result) {
            warn!("cache L2 write failed for key {}: {}", key, e);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            l1_size: self.l1.read().unwrap().len(),
            l1_hits: self.l1_hits.load(Ordering::Relaxed),
            l1_misses: self.l1_misses.load(Ordering::Relaxed),
            l2_hits: self.l2_hits.load(Ordering::Relaxed),
            l2_misses: self.l2_misses.load(Ordering::Relaxed),
        }
    }

    fn l2_get(&self, key: &CacheKey) -> anyhow::Result<Option<ExtractionResult>> {
        let Some(bytes) = self.l2.get(key.as_bytes())? else {
            return Ok(None);
        };
        match serde_json::from_slice::<L2Entry>(&bytes) {
            Ok(mut entry) => {
                entry.last_accessed = crate::model::now_seconds();
                let reencoded = serde_json::to_vec(&entry)?;
                self.l2.insert(key.as_bytes(), reencoded)?;
                Ok(Some(entry.result))
            }
            Err(e) => {
                // Corrupt entries are treated as misses and evicted (§4.2).
                warn!("corrupt L2 cache entry for key {}, evicting: {}", key, e);
                self.l2.remove(key.as_bytes())?;
                Ok(None)
            }
        }
    }

    fn l2_put(&self, key: CacheKey, result: &ExtractionResult) -> anyhow::Result<()> {
        let entry = L2Entry {
            result: result.clone(),
            last_accessed: crate::model::now_seconds(),
        };
        let bytes = serde_json::to_vec(&entry)?;
        self.l2.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    /// Approximate disk-quota enforcement (§5): `sled` exposes no hard byte
    /// quota, so this sweeps and evicts the least-recently-accessed entries
    /// once the on-disk size estimate exceeds `max_bytes`. Intended to be
    /// called periodically by the owner of the cache, not on every `put`.
    pub fn enforce_disk_quota(&self, max_bytes: u64) -> anyhow::Result<usize> {
        if self.l2.size_on_disk()? <= max_bytes {
            return Ok(0);
        }

        let mut entries: Vec<(sled::IVec, f64)> = Vec::new();
        for item in self.l2.iter() {
            let (k, v) = item?;
            if let Ok(entry) = serde_json::from_slice::<L2Entry>(&v) {
                entries.push((k, entry.last_accessed));
            }
        }
        entries.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut evicted = 0;
        for (key, _) in entries {
            if self.l2.size_on_disk()? <= max_bytes {
                break;
            }
            self.l2.remove(&key)?;
            evicted += 1;
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Metadata, Method};
    use std::collections::BTreeMap;

    fn sample_result() -> ExtractionResult {
        ExtractionResult {
            success: true,
            data: BTreeMap::from([("nome".to_string(), Some("João".to_string()))]),
            metadata: Metadata::new(Method::Llm, 0.5),
            error: None,
        }
    }

    fn open_tmp() -> (Cache, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(2, dir.path()).unwrap();
        (cache, dir)
    }

    #[test]
    fn miss_then_hit_after_put() {
        let (cache, _dir) = open_tmp();
        let key = CacheKey::compute(b"bytes", "oab", &schema());
        assert!(cache.get(&key).is_none());

        cache.put(key, sample_result());
        let (result, source) = cache.get(&key).unwrap();
        assert!(result.success);
        assert_eq!(source, CacheSource::L1);
    }

    #[test]
    fn l2_hit_promotes_to_l1() {
        let (cache, _dir) = open_tmp();
        let key = CacheKey::compute(b"bytes", "oab", &schema());
        cache.put(key, sample_result());

        // Evict from L1 directly, leaving only the L2 copy.
        cache.l1.write().unwrap().pop(&key);

        let (_, source) = cache.get(&key).unwrap();
        assert_eq!(source, CacheSource::L2);

        // Second read now comes from the promoted L1 entry.
        let (_, source2) = cache.get(&key).unwrap();
        assert_eq!(source2, CacheSource::L1);
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let (cache, _dir) = open_tmp();
        let key = CacheKey::compute(b"bytes", "oab", &schema());
        cache.get(&key);
        cache.put(key, sample_result());
        cache.get(&key);

        let stats = cache.stats();
        assert_eq!(stats.l1_hits, 1);
        assert_eq!(stats.l1_misses, 1);
    }

    fn schema() -> crate::model::Schema {
        crate::model::Schema::new(vec![("nome".to_string(), "Full name".to_string())]).unwrap()
    }
}
