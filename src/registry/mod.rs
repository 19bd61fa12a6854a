//! Cache of the execution helpers ("workers") currently known to the runtime.
//!
//! The snapshot list is double-buffered: a refresh builds a complete new
//! [`WorkerCache`] off to the side and swaps it in with a single pointer
//! store. Readers load whichever cache is current and never see a
//! half-written list. Refreshes are serialized among themselves so that the
//! on-demand path and the background loop do not query the runtime twice
//! for the same expiry.

mod refresh;

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::RegistryConfig;
use crate::error::{RelayError, Result};
use crate::runtime::{ContainerFilter, RuntimeError, WorkerLister, WorkerSnapshot};

/// One generation of the worker cache. Never mutated after construction.
#[derive(Debug, Clone, Default)]
pub struct WorkerCache {
    pub snapshots: Vec<WorkerSnapshot>,
    /// Monotonic time of the refresh that produced this generation.
    pub refreshed_at: Option<Instant>,
    /// Wall-clock time of the same refresh, for reporting.
    pub refreshed_at_utc: Option<DateTime<Utc>>,
}

impl WorkerCache {
    fn is_expired(&self, ttl: Duration) -> bool {
        match self.refreshed_at {
            Some(at) => at.elapsed() > ttl,
            None => true,
        }
    }
}

/// Summary of the cache state, as reported over the API.
#[derive(Debug, Clone, Serialize)]
pub struct CacheInfo {
    pub cached_containers_count: usize,
    pub last_update: Option<DateTime<Utc>>,
    pub cache_ttl_secs: u64,
    pub is_expired: bool,
    pub workers: Vec<WorkerSnapshot>,
}

pub struct WorkerRegistry {
    lister: Arc<dyn WorkerLister>,
    filter: ContainerFilter,
    ttl: Duration,
    cache: ArcSwap<WorkerCache>,
    refresh_lock: Mutex<()>,
}

impl WorkerRegistry {
    pub fn new(lister: Arc<dyn WorkerLister>, config: &RegistryConfig) -> Self {
        let mut filter = ContainerFilter::new(config.worker_name_marker.clone());
        filter.include_stopped = config.include_stopped;

        Self {
            lister,
            filter,
            ttl: config.cache_ttl,
            cache: ArcSwap::from_pointee(WorkerCache::default()),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Query the runtime and replace the cache with the matching workers.
    ///
    /// On failure the previous generation stays in place and the error is
    /// returned.
    pub async fn refresh(&self) -> std::result::Result<Vec<WorkerSnapshot>, RuntimeError> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> std::result::Result<Vec<WorkerSnapshot>, RuntimeError> {
        let listed = self.lister.list(&self.filter).await?;

        // The runtime's own filter is a hint; apply ours as well
        let snapshots: Vec<WorkerSnapshot> = listed
            .into_iter()
            .filter(|w| self.filter.matches(&w.name))
            .collect();

        tracing::debug!(count = snapshots.len(), "Worker cache refreshed");

        self.cache.store(Arc::new(WorkerCache {
            snapshots: snapshots.clone(),
            refreshed_at: Some(Instant::now()),
            refreshed_at_utc: Some(Utc::now()),
        }));

        Ok(snapshots)
    }

    /// Copy of the current snapshot list, without touching the runtime.
    pub fn get_cached(&self) -> Vec<WorkerSnapshot> {
        self.cache.load().snapshots.clone()
    }

    pub fn is_expired(&self) -> bool {
        self.cache.load().is_expired(self.ttl)
    }

    /// Serve the cache if it is fresh and non-empty, otherwise refresh.
    pub async fn get_or_refresh(
        &self,
        force_refresh: bool,
    ) -> std::result::Result<Vec<WorkerSnapshot>, RuntimeError> {
        if !force_refresh {
            if let Some(fresh) = self.fresh_snapshots() {
                return Ok(fresh);
            }
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited for the lock
        if !force_refresh {
            if let Some(fresh) = self.fresh_snapshots() {
                return Ok(fresh);
            }
        }

        self.refresh_locked().await
    }

    fn fresh_snapshots(&self) -> Option<Vec<WorkerSnapshot>> {
        let cache = self.cache.load();
        if cache.snapshots.is_empty() || cache.is_expired(self.ttl) {
            None
        } else {
            Some(cache.snapshots.clone())
        }
    }

    /// Uniformly random worker from the current cache.
    pub fn pick_random(&self) -> Result<WorkerSnapshot> {
        let cache = self.cache.load();
        if cache.snapshots.is_empty() {
            return Err(RelayError::NoWorkersAvailable);
        }
        let index = rand::thread_rng().gen_range(0..cache.snapshots.len());
        Ok(cache.snapshots[index].clone())
    }

    /// Exact ID match, falling back to the first ID with `id` as prefix.
    pub fn find_by_id(&self, id: &str) -> Option<WorkerSnapshot> {
        if id.is_empty() {
            return None;
        }
        let cache = self.cache.load();
        cache
            .snapshots
            .iter()
            .find(|w| w.id == id)
            .or_else(|| cache.snapshots.iter().find(|w| w.id.starts_with(id)))
            .cloned()
    }

    /// Exact name match, falling back to the first name containing `name`.
    pub fn find_by_name(&self, name: &str) -> Option<WorkerSnapshot> {
        if name.is_empty() {
            return None;
        }
        let cache = self.cache.load();
        cache
            .snapshots
            .iter()
            .find(|w| w.name == name)
            .or_else(|| cache.snapshots.iter().find(|w| w.name.contains(name)))
            .cloned()
    }

    pub fn cache_info(&self) -> CacheInfo {
        let cache = self.cache.load();
        CacheInfo {
            cached_containers_count: cache.snapshots.len(),
            last_update: cache.refreshed_at_utc,
            cache_ttl_secs: self.ttl.as_secs(),
            is_expired: cache.is_expired(self.ttl),
            workers: cache.snapshots.clone(),
        }
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("filter", &self.filter)
            .field("ttl", &self.ttl)
            .field("cached", &self.cache.load().snapshots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StaticLister(Vec<WorkerSnapshot>);

    #[async_trait]
    impl WorkerLister for StaticLister {
        async fn list(
            &self,
            _filter: &ContainerFilter,
        ) -> std::result::Result<Vec<WorkerSnapshot>, RuntimeError> {
            Ok(self.0.clone())
        }
    }

    fn registry(workers: Vec<WorkerSnapshot>) -> WorkerRegistry {
        WorkerRegistry::new(Arc::new(StaticLister(workers)), &RegistryConfig::default())
    }

    #[tokio::test]
    async fn refresh_applies_name_filter() {
        let reg = registry(vec![
            WorkerSnapshot::new("aaa", "deployment-worker"),
            WorkerSnapshot::new("bbb", "postgres"),
            WorkerSnapshot::new("ccc", "prod_deployment-worker_2"),
        ]);

        let workers = reg.refresh().await.unwrap();
        let ids: Vec<_> = workers.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["aaa", "ccc"]);
        assert_eq!(reg.get_cached(), workers);
    }

    #[test]
    fn pick_random_on_empty_cache() {
        let reg = registry(vec![]);
        assert!(matches!(
            reg.pick_random(),
            Err(RelayError::NoWorkersAvailable)
        ));
    }

    #[test]
    fn new_registry_is_expired() {
        let reg = registry(vec![]);
        assert!(reg.is_expired());
        let info = reg.cache_info();
        assert_eq!(info.cached_containers_count, 0);
        assert!(info.last_update.is_none());
        assert_eq!(info.cache_ttl_secs, 60);
    }

    #[tokio::test]
    async fn find_prefers_exact_match() {
        let reg = registry(vec![
            WorkerSnapshot::new("abc123456789", "deployment-worker-10"),
            WorkerSnapshot::new("abc", "deployment-worker-1"),
        ]);
        reg.refresh().await.unwrap();

        assert_eq!(reg.find_by_id("abc").unwrap().name, "deployment-worker-1");
        assert_eq!(
            reg.find_by_id("abc1234").unwrap().name,
            "deployment-worker-10"
        );
        assert!(reg.find_by_id("zzz").is_none());
        assert!(reg.find_by_id("").is_none());

        assert_eq!(reg.find_by_name("deployment-worker-1").unwrap().id, "abc");
        assert_eq!(reg.find_by_name("worker-10").unwrap().id, "abc123456789");
        assert!(reg.find_by_name("nginx").is_none());
    }
}
