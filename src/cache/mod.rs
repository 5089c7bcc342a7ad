//! Two-tier attachment cache: an in-memory tier backed by a disk tier,
//! keyed by content hash.
//!
//! `dashmap` for the concurrent shared map backing both tiers, and
//! `once_cell`/`tokio::sync` for single-flight coalescing of concurrent
//! cache misses on the same key.

use crate::error::{RelayError, RelayResult};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

#[derive(Clone)]
struct MemoryEntry {
    bytes: Bytes,
    last_used: DateTime<Utc>,
}

/// Configuration for both tiers.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub memory_capacity_bytes: u64,
    pub disk_capacity_bytes: u64,
    pub disk_dir: PathBuf,
    pub entry_ttl: chrono::Duration,
}

type InFlight = Arc<OnceCell<RelayResult<Bytes>>>;

/// Content-addressed two-tier attachment byte cache with single-flight
/// coalescing: concurrent lookups of the same key share one fetch.
pub struct AttachmentCache {
    config: CacheConfig,
    memory: DashMap<String, MemoryEntry>,
    memory_bytes: AtomicU64,
    disk_bytes: AtomicU64,
    lru_order: Mutex<VecDeque<String>>,
    in_flight: DashMap<String, InFlight>,
}

impl AttachmentCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            memory: DashMap::new(),
            memory_bytes: AtomicU64::new(0),
            disk_bytes: AtomicU64::new(0),
            lru_order: Mutex::new(VecDeque::new()),
            in_flight: DashMap::new(),
        }
    }

    /// Returns cached bytes for `key`, or runs `fetch` exactly once across
    /// all concurrent callers racing on the same key and populates both
    /// tiers with the result.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> RelayResult<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = RelayResult<Bytes>>,
    {
        if let Some(bytes) = self.get_memory(key).await {
            return Ok(bytes);
        }
        if let Some(bytes) = self.get_disk(key).await? {
            self.insert_memory(key, bytes.clone()).await;
            return Ok(bytes);
        }

        let cell = self
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = cell
            .get_or_init(|| async {
                let bytes = fetch().await;
                if let Ok(ref b) = bytes {
                    self.insert_memory(key, b.clone()).await;
                    let _ = self.insert_disk(key, b.clone()).await;
                }
                bytes
            })
            .await
            .clone();

        self.in_flight.remove(key);
        result
    }

    async fn get_memory(&self, key: &str) -> Option<Bytes> {
        if let Some(mut entry) = self.memory.get_mut(key) {
            if Utc::now() - entry.last_used > self.config.entry_ttl {
                drop(entry);
                self.evict_memory_key(key).await;
                return None;
            }
            entry.last_used = Utc::now();
            self.touch_lru(key).await;
            return Some(entry.bytes.clone());
        }
        None
    }

    async fn insert_memory(&self, key: &str, bytes: Bytes) {
        let size = bytes.len() as u64;
        if size > self.config.memory_capacity_bytes {
            return;
        }
        if self.memory.contains_key(key) {
            self.memory.insert(key.to_string(), MemoryEntry { bytes, last_used: Utc::now() });
            self.touch_lru(key).await;
            return;
        }

        while self.memory_bytes.load(Ordering::Relaxed) + size > self.config.memory_capacity_bytes {
            if !self.evict_one_memory().await {
                break;
            }
        }

        self.memory.insert(key.to_string(), MemoryEntry { bytes, last_used: Utc::now() });
        self.memory_bytes.fetch_add(size, Ordering::Relaxed);
        let mut order = self.lru_order.lock().await;
        order.push_back(key.to_string());
    }

    async fn touch_lru(&self, key: &str) {
        let mut order = self.lru_order.lock().await;
        if let Some(pos) = order.iter().position(|k| k == key) {
            order.remove(pos);
        }
        order.push_back(key.to_string());
    }

    async fn evict_one_memory(&self) -> bool {
        let victim = {
            let mut order = self.lru_order.lock().await;
            order.pop_front()
        };
        match victim {
            Some(key) => {
                self.evict_memory_key(&key).await;
                true
            }
            None => false,
        }
    }

    async fn evict_memory_key(&self, key: &str) {
        if let Some((_, entry)) = self.memory.remove(key) {
            self.memory_bytes.fetch_sub(entry.bytes.len() as u64, Ordering::Relaxed);
        }
    }

    fn disk_path(&self, key: &str) -> PathBuf {
        self.config.disk_dir.join(key)
    }

    async fn get_disk(&self, key: &str) -> RelayResult<Option<Bytes>> {
        let path = self.disk_path(key);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => {
                let modified = meta.modified().ok().map(DateTime::<Utc>::from).unwrap_or_else(Utc::now);
                if Utc::now() - modified > self.config.entry_ttl {
                    let _ = tokio::fs::remove_file(&path).await;
                    return Ok(None);
                }
                let bytes = tokio::fs::read(&path).await?;
                Ok(Some(Bytes::from(bytes)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RelayError::from(e)),
        }
    }

    async fn insert_disk(&self, key: &str, bytes: Bytes) -> RelayResult<()> {
        let size = bytes.len() as u64;
        if size > self.config.disk_capacity_bytes {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.config.disk_dir).await?;

        while self.disk_bytes.load(Ordering::Relaxed) + size > self.config.disk_capacity_bytes {
            if !self.evict_one_disk().await? {
                break;
            }
        }

        let path = self.disk_path(key);
        tokio::fs::write(&path, &bytes).await?;
        self.disk_bytes.fetch_add(size, Ordering::Relaxed);
        Ok(())
    }

    async fn evict_one_disk(&self) -> RelayResult<bool> {
        let mut dir = tokio::fs::read_dir(&self.config.disk_dir).await?;
        let mut oldest: Option<(PathBuf, std::time::SystemTime, u64)> = None;
        while let Some(entry) = dir.next_entry().await? {
            let meta = entry.metadata().await?;
            let modified = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            if oldest.as_ref().map(|(_, t, _)| modified < *t).unwrap_or(true) {
                oldest = Some((entry.path(), modified, meta.len()));
            }
        }
        match oldest {
            Some((path, _, len)) => {
                tokio::fs::remove_file(&path).await?;
                self.disk_bytes.fetch_sub(len, Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_config(dir: &std::path::Path) -> CacheConfig {
        CacheConfig {
            memory_capacity_bytes: 1024,
            disk_capacity_bytes: 4096,
            disk_dir: dir.to_path_buf(),
            entry_ttl: chrono::Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn single_flight_coalesces_concurrent_misses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(AttachmentCache::new(test_config(dir.path())));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("k1", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(Bytes::from_static(b"payload"))
                    })
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), Bytes::from_static(b"payload"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn memory_hit_after_first_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AttachmentCache::new(test_config(dir.path()));
        let calls = AtomicUsize::new(0);

        cache
            .get_or_fetch("k2", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Bytes::from_static(b"x"))
            })
            .await
            .unwrap();
        cache
            .get_or_fetch("k2", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Bytes::from_static(b"x"))
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn oversized_entry_is_never_cached() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.memory_capacity_bytes = 4;
        config.disk_capacity_bytes = 4;
        let cache = AttachmentCache::new(config);
        let big = Bytes::from(vec![0u8; 64]);
        cache.get_or_fetch("big", || async { Ok(big.clone()) }).await.unwrap();
        assert!(cache.get_memory("big").await.is_none());
    }
}
