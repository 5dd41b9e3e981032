//! Entity feature cache: TTL read cache in front of a pluggable backend
//!
//! Read-through policy: cache → backend → cold-start default (written back).
//! Writes go to the backend first and then invalidate the cached entry
//! before returning, so no reader can observe a pre-write vector once
//! `put` has returned. A per-key generation counter closes the race where
//! a slow read-through would otherwise re-insert a stale vector after an
//! invalidation.
//!
//! Backend failures never propagate to callers on the read path: the
//! caller gets a default vector and a warning is logged.

use crate::feature_backend::{EntityKind, FeatureBackend, FeatureVector};
use crate::metrics;
use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default read-cache TTL (5 minutes)
pub const DEFAULT_READ_CACHE_TTL: Duration = Duration::from_secs(300);

/// Default bound on cached entries
pub const DEFAULT_READ_CACHE_CAPACITY: usize = 100_000;

type Key = (EntityKind, String);

struct CacheEntry {
    vector: FeatureVector,
    cached_at: Instant,
}

/// Cache map, insertion queue and invalidation generations behind one lock
struct CacheState {
    entries: HashMap<Key, CacheEntry>,
    insertion_order: VecDeque<Key>,
    generations: HashMap<Key, u64>,
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct FeatureCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub cold_starts: u64,
    pub invalidations: u64,
    pub backend_errors: u64,
    pub entries: usize,
    pub hit_rate: f64,
}

/// Read-through feature cache service. One instance per process, owned by
/// the composition root.
pub struct FeatureCacheService {
    backend: Arc<dyn FeatureBackend>,
    state: RwLock<CacheState>,
    ttl: Duration,
    capacity: usize,
    user_dim: usize,
    item_dim: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    cold_starts: AtomicU64,
    invalidations: AtomicU64,
    backend_errors: AtomicU64,
}

impl FeatureCacheService {
    pub fn new(
        backend: Arc<dyn FeatureBackend>,
        ttl: Duration,
        capacity: usize,
        user_dim: usize,
        item_dim: usize,
    ) -> Self {
        Self {
            backend,
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                insertion_order: VecDeque::new(),
                generations: HashMap::new(),
            }),
            ttl,
            capacity,
            user_dim,
            item_dim,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            cold_starts: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            backend_errors: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(backend: Arc<dyn FeatureBackend>) -> Self {
        Self::new(
            backend,
            DEFAULT_READ_CACHE_TTL,
            DEFAULT_READ_CACHE_CAPACITY,
            crate::user_features::USER_FEATURE_DIM,
            crate::user_features::ITEM_FEATURE_DIM,
        )
    }

    pub fn dimension_for(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::User => self.user_dim,
            EntityKind::Item => self.item_dim,
        }
    }

    /// Cache lookup honoring TTL. Expired entries are dropped on sight.
    fn cached(&self, key: &Key) -> Option<FeatureVector> {
        {
            let state = self.state.read();
            match state.entries.get(key) {
                Some(entry) if entry.cached_at.elapsed() < self.ttl => {
                    return Some(entry.vector.clone());
                }
                Some(_) => {} // expired, fall through to removal
                None => return None,
            }
        }
        let mut state = self.state.write();
        if let Some(entry) = state.entries.get(key) {
            if entry.cached_at.elapsed() >= self.ttl {
                state.entries.remove(key);
            } else {
                return Some(entry.vector.clone());
            }
        }
        None
    }

    fn current_generation(&self, key: &Key) -> u64 {
        self.state
            .read()
            .generations
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Inserts only if no invalidation happened since `generation` was
    /// read. Returns whether the insert took effect.
    fn insert_if_current(&self, key: Key, generation: u64, vector: FeatureVector) -> bool {
        let mut state = self.state.write();
        let current = state.generations.get(&key).copied().unwrap_or(0);
        if current != generation {
            debug!(
                kind = key.0.as_str(),
                id = %key.1,
                "skipping stale read-through insert"
            );
            return false;
        }
        if !state.entries.contains_key(&key) {
            state.insertion_order.push_back(key.clone());
        }
        state.entries.insert(
            key,
            CacheEntry {
                vector,
                cached_at: Instant::now(),
            },
        );
        while state.entries.len() > self.capacity {
            match state.insertion_order.pop_front() {
                Some(oldest) => {
                    state.entries.remove(&oldest);
                }
                None => break,
            }
        }
        true
    }

    fn invalidate(&self, key: &Key) {
        let mut state = self.state.write();
        *state.generations.entry(key.clone()).or_insert(0) += 1;
        state.entries.remove(key);
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        metrics::CACHE_INVALIDATIONS_TOTAL.inc();
    }

    /// Read-through get. Always yields a vector: backend miss produces a
    /// zero default that is written back, backend failure produces a zero
    /// default without write-back.
    pub async fn get(&self, kind: EntityKind, id: &str) -> Result<FeatureVector> {
        let key = (kind, id.to_string());

        if let Some(vector) = self.cached(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::CACHE_HITS_TOTAL.inc();
            return Ok(vector);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::CACHE_MISSES_TOTAL.inc();

        let generation = self.current_generation(&key);
        match self.backend.get_vector(kind, id).await {
            Ok(Some(vector)) => {
                self.insert_if_current(key, generation, vector.clone());
                Ok(vector)
            }
            Ok(None) => {
                let vector = self.cold_start(kind, id, generation).await;
                Ok(vector)
            }
            Err(e) => {
                self.backend_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    backend = self.backend.name(),
                    kind = kind.as_str(),
                    id,
                    error = %e,
                    "backend read failed; serving default vector"
                );
                Ok(FeatureVector::default_for(kind, id, self.dimension_for(kind)))
            }
        }
    }

    /// Batch read-through with one backend round trip for the misses.
    /// Every requested id is present in the result.
    pub async fn get_batch(
        &self,
        kind: EntityKind,
        ids: &[String],
    ) -> Result<HashMap<String, FeatureVector>> {
        let mut out = HashMap::with_capacity(ids.len());
        let mut missing: Vec<String> = Vec::new();
        let mut generations: HashMap<String, u64> = HashMap::new();

        for id in ids {
            let key = (kind, id.clone());
            if let Some(vector) = self.cached(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::CACHE_HITS_TOTAL.inc();
                out.insert(id.clone(), vector);
            } else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics::CACHE_MISSES_TOTAL.inc();
                generations.insert(id.clone(), self.current_generation(&key));
                missing.push(id.clone());
            }
        }

        if missing.is_empty() {
            return Ok(out);
        }

        match self.backend.get_batch(kind, &missing).await {
            Ok(mut found) => {
                for id in &missing {
                    let generation = generations[id];
                    match found.remove(id) {
                        Some(vector) => {
                            self.insert_if_current(
                                (kind, id.clone()),
                                generation,
                                vector.clone(),
                            );
                            out.insert(id.clone(), vector);
                        }
                        None => {
                            let vector = self.cold_start(kind, id, generation).await;
                            out.insert(id.clone(), vector);
                        }
                    }
                }
            }
            Err(e) => {
                self.backend_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    backend = self.backend.name(),
                    kind = kind.as_str(),
                    count = missing.len(),
                    error = %e,
                    "backend batch read failed; serving default vectors"
                );
                for id in &missing {
                    out.insert(
                        id.clone(),
                        FeatureVector::default_for(kind, id, self.dimension_for(kind)),
                    );
                }
            }
        }

        Ok(out)
    }

    /// Writes through to the backend, then invalidates the cached entry.
    /// The invalidation is synchronous: once this returns, no reader can
    /// see the previous vector.
    pub async fn put(&self, vector: FeatureVector) -> Result<()> {
        let key = (vector.kind, vector.entity_id.clone());
        self.backend
            .put_vector(vector)
            .await
            .context("backend write failed")?;
        self.invalidate(&key);
        Ok(())
    }

    async fn cold_start(&self, kind: EntityKind, id: &str, generation: u64) -> FeatureVector {
        self.cold_starts.fetch_add(1, Ordering::Relaxed);
        metrics::CACHE_COLD_STARTS_TOTAL.inc();
        let vector = FeatureVector::default_for(kind, id, self.dimension_for(kind));

        // Write-back is best effort: a downed backend must not fail the read
        if let Err(e) = self.backend.put_vector(vector.clone()).await {
            self.backend_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                backend = self.backend.name(),
                kind = kind.as_str(),
                id,
                error = %e,
                "cold-start write-back failed"
            );
        } else {
            self.insert_if_current((kind, id.to_string()), generation, vector.clone());
        }
        vector
    }

    pub fn stats(&self) -> FeatureCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        FeatureCacheStats {
            hits,
            misses,
            cold_starts: self.cold_starts.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
            entries: self.state.read().entries.len(),
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }

    pub fn backend(&self) -> &Arc<dyn FeatureBackend> {
        &self.backend
    }

    pub fn entry_count(&self) -> usize {
        self.state.read().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_backend::MemoryFeatureBackend;

    fn service_with_ttl(ttl: Duration) -> FeatureCacheService {
        FeatureCacheService::new(Arc::new(MemoryFeatureBackend::new()), ttl, 1000, 8, 4)
    }

    fn vector(kind: EntityKind, id: &str, fill: f32, dim: usize) -> FeatureVector {
        FeatureVector::computed(kind, id, vec![fill; dim])
    }

    #[tokio::test]
    async fn test_cold_start_returns_default_and_writes_back() {
        let service = service_with_ttl(Duration::from_secs(60));
        let got = service.get(EntityKind::User, "nobody").await.unwrap();
        assert_eq!(got.values, vec![0.0; 8]);
        assert_eq!(got.provenance, crate::feature_backend::Provenance::Default);

        // Written back to the backend
        let backend_copy = service
            .backend()
            .get_vector(EntityKind::User, "nobody")
            .await
            .unwrap();
        assert!(backend_copy.is_some());

        let stats = service.stats();
        assert_eq!(stats.cold_starts, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_second_read_hits_cache() {
        let service = service_with_ttl(Duration::from_secs(60));
        service
            .put(vector(EntityKind::User, "u1", 0.5, 8))
            .await
            .unwrap();

        let _ = service.get(EntityKind::User, "u1").await.unwrap();
        let _ = service.get(EntityKind::User, "u1").await.unwrap();

        let stats = service.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry_forces_backend_reread() {
        let service = service_with_ttl(Duration::from_millis(20));
        service
            .put(vector(EntityKind::User, "u1", 0.5, 8))
            .await
            .unwrap();
        let _ = service.get(EntityKind::User, "u1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let _ = service.get(EntityKind::User, "u1").await.unwrap();

        let stats = service.stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.hits, 0);
    }

    #[tokio::test]
    async fn test_put_invalidates_synchronously() {
        let service = service_with_ttl(Duration::from_secs(60));
        service
            .put(vector(EntityKind::User, "u1", 0.1, 8))
            .await
            .unwrap();
        let before = service.get(EntityKind::User, "u1").await.unwrap();
        assert_eq!(before.values, vec![0.1; 8]);

        service
            .put(vector(EntityKind::User, "u1", 0.9, 8))
            .await
            .unwrap();
        // Immediately after put returns, the new value is visible
        let after = service.get(EntityKind::User, "u1").await.unwrap();
        assert_eq!(after.values, vec![0.9; 8]);
    }

    #[tokio::test]
    async fn test_stale_read_through_insert_is_discarded() {
        let service = service_with_ttl(Duration::from_secs(60));
        let key = (EntityKind::User, "u1".to_string());

        // A read-through captures the generation, then a write invalidates
        // before the read-through completes its insert.
        let generation = service.current_generation(&key);
        service.invalidate(&key);
        let inserted =
            service.insert_if_current(key.clone(), generation, vector(EntityKind::User, "u1", 0.1, 8));
        assert!(!inserted);
        assert_eq!(service.entry_count(), 0);

        // A fresh generation inserts normally
        let generation = service.current_generation(&key);
        let inserted =
            service.insert_if_current(key, generation, vector(EntityKind::User, "u1", 0.2, 8));
        assert!(inserted);
        assert_eq!(service.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_batch_mixes_cache_backend_and_defaults() {
        let service = service_with_ttl(Duration::from_secs(60));
        service
            .put(vector(EntityKind::Item, "i1", 0.1, 4))
            .await
            .unwrap();
        let _ = service.get(EntityKind::Item, "i1").await.unwrap(); // warm cache
        service
            .put(vector(EntityKind::Item, "i2", 0.2, 4))
            .await
            .unwrap(); // in backend only

        let ids = vec!["i1".to_string(), "i2".to_string(), "i3".to_string()];
        let got = service.get_batch(EntityKind::Item, &ids).await.unwrap();

        assert_eq!(got.len(), 3);
        assert_eq!(got["i1"].values, vec![0.1; 4]);
        assert_eq!(got["i2"].values, vec![0.2; 4]);
        assert_eq!(got["i3"].values, vec![0.0; 4]);
        assert_eq!(
            got["i3"].provenance,
            crate::feature_backend::Provenance::Default
        );
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_entries() {
        let backend = Arc::new(MemoryFeatureBackend::new());
        let service =
            FeatureCacheService::new(backend, Duration::from_secs(60), 3, 8, 4);

        for i in 0..5 {
            let id = format!("u{}", i);
            service
                .put(vector(EntityKind::User, &id, 0.1, 8))
                .await
                .unwrap();
            let _ = service.get(EntityKind::User, &id).await.unwrap();
        }

        assert!(service.entry_count() <= 3);
    }

    #[tokio::test]
    async fn test_backend_failure_serves_default() {
        struct FailingBackend;
        #[async_trait::async_trait]
        impl FeatureBackend for FailingBackend {
            async fn get_vector(
                &self,
                _kind: EntityKind,
                _id: &str,
            ) -> Result<Option<FeatureVector>> {
                anyhow::bail!("backend down")
            }
            async fn put_vector(&self, _vector: FeatureVector) -> Result<()> {
                anyhow::bail!("backend down")
            }
            async fn get_batch(
                &self,
                _kind: EntityKind,
                _ids: &[String],
            ) -> Result<HashMap<String, FeatureVector>> {
                anyhow::bail!("backend down")
            }
            async fn health_check(&self) -> Result<crate::feature_backend::BackendHealth> {
                anyhow::bail!("backend down")
            }
            fn name(&self) -> &'static str {
                "failing"
            }
        }

        let service = FeatureCacheService::new(
            Arc::new(FailingBackend),
            Duration::from_secs(60),
            1000,
            8,
            4,
        );

        let got = service.get(EntityKind::User, "u1").await.unwrap();
        assert_eq!(got.values, vec![0.0; 8]);
        assert_eq!(service.stats().backend_errors, 1);

        let batch = service
            .get_batch(EntityKind::Item, &["i1".to_string()])
            .await
            .unwrap();
        assert_eq!(batch["i1"].values, vec![0.0; 4]);
    }
}
