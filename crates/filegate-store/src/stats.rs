//! Storage-usage snapshot cache. A full usage walk can be expensive on
//! either backend, so snapshots are cached for a TTL and refreshed by a
//! background task; clients can force a recomputation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use filegate_common::error::Result;
use filegate_common::types::{StorageUsage, format_bytes};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::traits::ObjectStore;

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_objects: i64,
    pub total_size: i64,
    pub total_size_formatted: String,
    pub average_file_size: String,
    pub estimated_disk_usage: String,
    pub largest_file: Option<String>,
    pub largest_file_size: String,
    pub computed_at: DateTime<Utc>,
    pub calculation_ms: u64,
}

impl StatsSnapshot {
    fn from_usage(usage: StorageUsage, took: Duration) -> Self {
        let average = if usage.total_objects > 0 {
            usage.total_size / usage.total_objects
        } else {
            0
        };
        // flat 10% allowance for store-side metadata overhead
        let estimated = (usage.total_size as f64 * 1.1) as i64;

        Self {
            total_objects: usage.total_objects,
            total_size: usage.total_size,
            total_size_formatted: format_bytes(usage.total_size),
            average_file_size: format_bytes(average),
            estimated_disk_usage: format_bytes(estimated),
            largest_file: usage.largest_file,
            largest_file_size: format_bytes(usage.largest_file_size),
            computed_at: Utc::now(),
            calculation_ms: took.as_millis() as u64,
        }
    }
}

struct CachedStats {
    snapshot: StatsSnapshot,
    cached_at: Instant,
}

pub struct StatsCache {
    store: Arc<dyn ObjectStore>,
    ttl: Duration,
    cached: RwLock<Option<CachedStats>>,
    refresh_guard: Mutex<()>,
}

impl StatsCache {
    pub fn new(store: Arc<dyn ObjectStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cached: RwLock::new(None),
            refresh_guard: Mutex::new(()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns a snapshot plus whether it was served from cache and its age.
    pub async fn get(&self, force: bool) -> Result<(StatsSnapshot, bool, Duration)> {
        if !force {
            let cached = self.cached.read().await;
            if let Some(entry) = cached.as_ref() {
                let age = entry.cached_at.elapsed();
                if age < self.ttl {
                    return Ok((entry.snapshot.clone(), true, age));
                }
            }
        }

        let snapshot = self.refresh().await?;
        Ok((snapshot, false, Duration::ZERO))
    }

    pub async fn refresh(&self) -> Result<StatsSnapshot> {
        let _guard = self.refresh_guard.lock().await;

        let started = Instant::now();
        let usage = self.store.usage().await?;
        let snapshot = StatsSnapshot::from_usage(usage, started.elapsed());

        let mut cached = self.cached.write().await;
        *cached = Some(CachedStats {
            snapshot: snapshot.clone(),
            cached_at: Instant::now(),
        });
        Ok(snapshot)
    }

    /// Background variant: skips the walk when a refresh is already running.
    pub async fn refresh_if_idle(&self) -> Result<()> {
        if self.refresh_guard.try_lock().is_err() {
            debug!("stats refresh already in progress, skipping");
            return Ok(());
        }
        self.refresh().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryObjectStore;
    use bytes::Bytes;

    #[tokio::test]
    async fn caches_within_ttl_and_forces_refresh() {
        let store = Arc::new(InMemoryObjectStore::new());
        store
            .put_object("a.bin", Bytes::from(vec![0u8; 2048]), None)
            .await
            .unwrap();

        let cache = StatsCache::new(store.clone(), Duration::from_secs(60));

        let (first, hit, _) = cache.get(false).await.unwrap();
        assert!(!hit);
        assert_eq!(first.total_objects, 1);
        assert_eq!(first.total_size, 2048);
        assert_eq!(first.total_size_formatted, "2.00 KB");
        assert_eq!(first.largest_file.as_deref(), Some("a.bin"));

        store
            .put_object("b.bin", Bytes::from(vec![0u8; 4096]), None)
            .await
            .unwrap();

        // within TTL the stale snapshot is served
        let (second, hit, _) = cache.get(false).await.unwrap();
        assert!(hit);
        assert_eq!(second.total_objects, 1);

        // forced refresh observes the new object
        let (third, hit, _) = cache.get(true).await.unwrap();
        assert!(!hit);
        assert_eq!(third.total_objects, 2);
        assert_eq!(third.largest_file.as_deref(), Some("b.bin"));
    }

    #[tokio::test]
    async fn zero_ttl_always_recomputes() {
        let store = Arc::new(InMemoryObjectStore::new());
        let cache = StatsCache::new(store, Duration::ZERO);

        let (_, hit, _) = cache.get(false).await.unwrap();
        assert!(!hit);
        let (_, hit, _) = cache.get(false).await.unwrap();
        assert!(!hit);
    }
}
