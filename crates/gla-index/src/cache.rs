//! Memory-bounded LRU cache of retrieval indexes.
//!
//! Indexes are keyed per `(job id, filename)` and built lazily. Concurrent
//! requesters for the same key wait on a per-key creation lock so the log is
//! chunked and embedded once. Each handed-out [`IndexLease`] pins its entry:
//! eviction skips entries that are still leased.

use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lru::LruCache;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::index::RetrievalIndex;

struct CacheEntry {
    index: Arc<RetrievalIndex>,
    bytes: usize,
    leases: Arc<AtomicUsize>,
}

struct CacheInner {
    entries: LruCache<String, CacheEntry>,
    used_bytes: usize,
}

/// Shared handle to a cached index. The entry cannot be evicted while any
/// lease on it is alive.
pub struct IndexLease {
    key: String,
    index: Arc<RetrievalIndex>,
    leases: Arc<AtomicUsize>,
}

impl IndexLease {
    fn new(key: &str, entry: &CacheEntry) -> Self {
        entry.leases.fetch_add(1, Ordering::SeqCst);
        Self {
            key: key.to_string(),
            index: entry.index.clone(),
            leases: entry.leases.clone(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn index(&self) -> &Arc<RetrievalIndex> {
        &self.index
    }
}

impl Deref for IndexLease {
    type Target = RetrievalIndex;

    fn deref(&self) -> &Self::Target {
        &self.index
    }
}

impl Drop for IndexLease {
    fn drop(&mut self) {
        self.leases.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for IndexLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexLease")
            .field("key", &self.key)
            .field("chunks", &self.index.len())
            .finish()
    }
}

/// LRU cache of [`RetrievalIndex`] bounded by an approximate memory budget.
pub struct IndexCache {
    inner: Mutex<CacheInner>,
    creation_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    budget_bytes: usize,
}

impl IndexCache {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                used_bytes: 0,
            }),
            creation_locks: Mutex::new(HashMap::new()),
            budget_bytes,
        }
    }

    fn inner(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Key for the index of one job's log file.
    pub fn key_for(job_id: &str, filename: &str) -> String {
        format!("{}/{}", job_id, filename)
    }

    /// Lease the index for `key`, building it with `build` on a miss.
    ///
    /// A cached entry whose content hash differs from `content_hash` is
    /// invalidated and handed to `build` so it can be extended instead of
    /// rebuilt. Returns the lease and whether a build happened.
    pub async fn get_or_build<F, Fut, E>(
        &self,
        key: &str,
        content_hash: &str,
        build: F,
    ) -> Result<(IndexLease, bool), E>
    where
        F: FnOnce(Option<Arc<RetrievalIndex>>) -> Fut,
        Fut: Future<Output = Result<RetrievalIndex, E>>,
    {
        if let Some(lease) = self.lookup(key, content_hash) {
            debug!("Index cache hit for {}", key);
            return Ok((lease, false));
        }

        let lock = {
            let mut locks = self
                .creation_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(key.to_string()).or_default().clone()
        };
        let _guard = lock.lock().await;

        // Another requester may have built it while we waited.
        if let Some(lease) = self.lookup(key, content_hash) {
            debug!("Index for {} built by a concurrent request", key);
            return Ok((lease, false));
        }

        let stale = self.invalidate(key);
        // Insert before releasing the creation lock so late arrivals hit the cache.
        let outcome = build(stale).await.map(|index| (self.insert(key, index), true));

        self.creation_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key);
        outcome
    }

    fn lookup(&self, key: &str, content_hash: &str) -> Option<IndexLease> {
        let mut inner = self.inner();
        let entry = inner.entries.get(key)?;
        if entry.index.content_hash() != content_hash {
            return None;
        }
        Some(IndexLease::new(key, entry))
    }

    fn insert(&self, key: &str, index: RetrievalIndex) -> IndexLease {
        let bytes = index.approx_bytes();
        let entry = CacheEntry {
            index: Arc::new(index),
            bytes,
            leases: Arc::new(AtomicUsize::new(0)),
        };
        let lease = IndexLease::new(key, &entry);

        {
            let mut inner = self.inner();
            if let Some(old) = inner.entries.put(key.to_string(), entry) {
                inner.used_bytes = inner.used_bytes.saturating_sub(old.bytes);
            }
            inner.used_bytes += bytes;
        }
        info!("Cached index for {} ({} bytes)", key, bytes);

        self.evict_to_budget();
        lease
    }

    /// Drop the entry for `key`, returning its index. Outstanding leases
    /// keep their copy alive.
    pub fn invalidate(&self, key: &str) -> Option<Arc<RetrievalIndex>> {
        let mut inner = self.inner();
        let entry = inner.entries.pop(key)?;
        inner.used_bytes = inner.used_bytes.saturating_sub(entry.bytes);
        debug!("Invalidated cached index for {}", key);
        Some(entry.index)
    }

    /// Evict least-recently-used, unleased entries until usage is within
    /// budget. Returns the number of entries evicted.
    pub fn evict_to_budget(&self) -> usize {
        let mut inner = self.inner();
        if inner.used_bytes <= self.budget_bytes {
            return 0;
        }

        let mut excess = inner.used_bytes - self.budget_bytes;
        let mut victims = Vec::new();
        for (key, entry) in inner.entries.iter().rev() {
            if excess == 0 {
                break;
            }
            if entry.leases.load(Ordering::SeqCst) > 0 {
                continue;
            }
            excess = excess.saturating_sub(entry.bytes);
            victims.push(key.clone());
        }

        for key in &victims {
            if let Some(entry) = inner.entries.pop(key) {
                inner.used_bytes = inner.used_bytes.saturating_sub(entry.bytes);
                warn!("Evicted index for {} ({} bytes)", key, entry.bytes);
            }
        }

        if inner.used_bytes > self.budget_bytes {
            debug!(
                "Index cache over budget ({} > {} bytes), remaining entries are leased",
                inner.used_bytes, self.budget_bytes
            );
        }
        victims.len()
    }

    /// Periodically run [`evict_to_budget`](Self::evict_to_budget) until
    /// `shutdown` fires. Catches entries whose leases were released after
    /// the last insert.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Index cache sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let evicted = cache.evict_to_budget();
                        if evicted > 0 {
                            debug!("Sweeper evicted {} indexes", evicted);
                        }
                    }
                }
            }
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner().entries.contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner().entries.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.inner().used_bytes
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    /// Active leases on `key`, zero when absent.
    pub fn lease_count(&self, key: &str) -> usize {
        self.inner()
            .entries
            .peek(key)
            .map(|e| e.leases.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}
