/// Download Pool (spec C9, §4.9): bounded-concurrency image fetcher with a
/// TTL+LRU cache keyed by source URL, plus a separate dedup cache keyed by
/// content hash so the same bytes aren't uploaded to the file bed twice.
/// Mirrors the teacher's `request_with_retry` shape (small fixed retry count,
/// fixed backoff) rather than C8's exponential one — this is a plain network
/// fetch, not an interactive recovery.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use arena_bridge_common::config::AppConfig;
use arena_bridge_common::error::BridgeError;

const FETCH_RETRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(300);

struct CacheEntry {
    base64: String,
    fetched_at: Instant,
}

struct Cache {
    entries: HashMap<String, CacheEntry>,
    insertion_order: Vec<String>,
    max_size: usize,
    ttl: Duration,
}

impl Cache {
    fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            insertion_order: Vec::new(),
            max_size,
            ttl,
        }
    }

    fn get_fresh(&mut self, key: &str) -> Option<String> {
        self.evict_expired();
        self.entries.get(key).map(|e| e.base64.clone())
    }

    fn insert(&mut self, key: String, base64: String) {
        self.evict_expired();
        if !self.entries.contains_key(&key) {
            self.insertion_order.push(key.clone());
        }
        self.entries.insert(
            key,
            CacheEntry {
                base64,
                fetched_at: Instant::now(),
            },
        );
        self.evict_over_capacity();
    }

    fn evict_expired(&mut self) {
        let ttl = self.ttl;
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.fetched_at.elapsed() > ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.entries.remove(&key);
            self.insertion_order.retain(|k| k != &key);
        }
    }

    fn evict_over_capacity(&mut self) {
        while self.entries.len() > self.max_size && !self.insertion_order.is_empty() {
            let oldest = self.insertion_order.remove(0);
            self.entries.remove(&oldest);
        }
    }
}

/// Simple size-capped dedup cache: sha256(bytes) -> uploaded file-bed URL.
/// No TTL — a duplicate upload is wasted work, not stale data, so there is
/// no correctness reason to expire an entry, only a memory-growth reason to
/// cap it.
struct UploadCache {
    entries: HashMap<String, String>,
    insertion_order: Vec<String>,
    max_size: usize,
}

impl UploadCache {
    fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            insertion_order: Vec::new(),
            max_size,
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: String, url: String) {
        if !self.entries.contains_key(&key) {
            self.insertion_order.push(key.clone());
        }
        self.entries.insert(key, url);
        while self.entries.len() > self.max_size && !self.insertion_order.is_empty() {
            let oldest = self.insertion_order.remove(0);
            self.entries.remove(&oldest);
        }
    }
}

pub struct DownloadPool {
    semaphore: Arc<Semaphore>,
    client: Option<Arc<reqwest::Client>>,
    cache: Mutex<Cache>,
    upload_cache: Mutex<UploadCache>,
    timeout: Duration,
}

impl DownloadPool {
    pub fn new(config: &AppConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.download_timeout.connect_ms))
            .timeout(config.download_timeout.total())
            .pool_max_idle_per_host(config.connection_pool.per_host_limit)
            .pool_idle_timeout(Duration::from_secs(config.connection_pool.keepalive_timeout_secs))
            .build()
            .ok()
            .map(Arc::new);
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
            client,
            cache: Mutex::new(Cache::new(
                config.memory_management.image_cache_max_size,
                Duration::from_secs(config.memory_management.image_cache_ttl_seconds),
            )),
            upload_cache: Mutex::new(UploadCache::new(config.memory_management.image_cache_max_size)),
            timeout: config.download_timeout.total(),
        }
    }

    /// Fetches `url` and returns it as base64, using the TTL+LRU cache when
    /// possible. Bounded by the pool's semaphore so a burst of images in one
    /// response can't open unbounded concurrent connections.
    pub async fn fetch_base64(&self, url: &str) -> Result<String, BridgeError> {
        if let Some(cached) = self.cache.lock().await.get_fresh(url) {
            debug!(url, "image cache hit");
            return Ok(cached);
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| BridgeError::DownloadFailed("download pool closed".to_string()))?;

        let bytes = self.fetch_with_retry(url).await?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        self.cache.lock().await.insert(url.to_string(), encoded.clone());
        Ok(encoded)
    }

    async fn fetch_with_retry(&self, url: &str) -> Result<Vec<u8>, BridgeError> {
        let mut last_err = None;
        for attempt in 0..FETCH_RETRIES {
            let client_guard;
            let client: &reqwest::Client = match &self.client {
                Some(c) => c,
                None => {
                    client_guard = reqwest::Client::builder()
                        .timeout(self.timeout)
                        .build()
                        .map_err(|e| BridgeError::DownloadFailed(e.to_string()))?;
                    &client_guard
                }
            };
            match client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .bytes()
                        .await
                        .map(|b| b.to_vec())
                        .map_err(|e| BridgeError::DownloadFailed(e.to_string()));
                }
                Ok(resp) => {
                    last_err = Some(BridgeError::DownloadFailed(format!(
                        "upstream image host returned {}",
                        resp.status()
                    )));
                }
                Err(e) => {
                    last_err = Some(BridgeError::DownloadFailed(e.to_string()));
                }
            }
            warn!(url, attempt, "image download attempt failed, retrying");
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
        Err(last_err.unwrap_or_else(|| BridgeError::DownloadFailed("unknown download failure".to_string())))
    }

    /// Reclaims expired/over-capacity image cache entries independent of
    /// lookups, so an image nobody re-requests after it goes stale doesn't
    /// sit in memory until the process happens to look it up again (spec
    /// §4.9: "a background task periodically evicts expired entries and
    /// hard-caps total size").
    pub async fn evict_stale(&self) {
        self.cache.lock().await.evict_expired();
    }

    /// Looks up a cached file-bed URL for the given bytes, or computes the
    /// sha256 for a caller that's about to upload and wants to cache it.
    pub async fn cached_upload_url(&self, bytes: &[u8]) -> Option<String> {
        let key = sha256_hex(bytes);
        self.upload_cache.lock().await.get(&key)
    }

    pub async fn remember_upload(&self, bytes: &[u8], url: String) {
        let key = sha256_hex(bytes);
        self.upload_cache.lock().await.insert(key, url);
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_evicts_over_capacity_oldest_first() {
        let mut cache = Cache::new(2, Duration::from_secs(3600));
        cache.insert("a".to_string(), "A".to_string());
        cache.insert("b".to_string(), "B".to_string());
        cache.insert("c".to_string(), "C".to_string());
        assert_eq!(cache.get_fresh("a"), None);
        assert_eq!(cache.get_fresh("b"), Some("B".to_string()));
        assert_eq!(cache.get_fresh("c"), Some("C".to_string()));
    }

    #[test]
    fn cache_evicts_expired_entries() {
        let mut cache = Cache::new(10, Duration::from_millis(0));
        cache.insert("a".to_string(), "A".to_string());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get_fresh("a"), None);
    }

    #[test]
    fn upload_cache_dedups_by_key() {
        let mut cache = UploadCache::new(10);
        cache.insert("hash1".to_string(), "https://filebed/1.png".to_string());
        assert_eq!(cache.get("hash1"), Some("https://filebed/1.png".to_string()));
        assert_eq!(cache.get("hash2"), None);
    }

    #[tokio::test]
    async fn remember_and_recall_upload_by_content_hash() {
        let config = AppConfig::default();
        let pool = DownloadPool::new(&config);
        let bytes = b"fake-image-bytes";
        assert_eq!(pool.cached_upload_url(bytes).await, None);
        pool.remember_upload(bytes, "https://filebed/x.png".to_string()).await;
        assert_eq!(
            pool.cached_upload_url(bytes).await,
            Some("https://filebed/x.png".to_string())
        );
    }
}
