use std::{
    num::NonZeroUsize,
    time::{Duration, Instant},
};

use lru::LruCache;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{config::read_env, fingerprint::RequestFingerprint, models::Answer};

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub capacity: usize,
    pub min_ttl: Duration,
    pub max_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            min_ttl: Duration::from_secs(60),
            max_ttl: Duration::from_secs(3600),
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            capacity: read_env("ASSIST_CACHE_CAPACITY", defaults.capacity),
            min_ttl: Duration::from_secs(read_env(
                "ASSIST_CACHE_MIN_TTL_SECS",
                defaults.min_ttl.as_secs(),
            )),
            max_ttl: Duration::from_secs(read_env(
                "ASSIST_CACHE_MAX_TTL_SECS",
                defaults.max_ttl.as_secs(),
            )),
        }
    }

    /// Linear in quality between `min_ttl` and `max_ttl`.
    pub fn ttl_for(&self, quality_score: f64) -> Duration {
        let quality = quality_score.clamp(0.0, 1.0);
        let span = self.max_ttl.saturating_sub(self.min_ttl);
        self.min_ttl + span.mul_f64(quality)
    }
}

/// Bounded LRU of accepted answers keyed by request fingerprint.
pub struct ResponseCache {
    entries: Option<Mutex<LruCache<RequestFingerprint, CacheEntry>>>,
    config: CacheConfig,
}

struct CacheEntry {
    answer: Answer,
    expires_at: Instant,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        let entries = match NonZeroUsize::new(config.capacity) {
            Some(capacity) => Some(Mutex::new(LruCache::new(capacity))),
            None => {
                info!("response cache disabled (capacity 0)");
                None
            }
        };
        Self { entries, config }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub async fn get(&self, key: &RequestFingerprint) -> Option<Answer> {
        self.get_at(key, Instant::now()).await
    }

    pub async fn put(&self, key: RequestFingerprint, answer: Answer, ttl: Duration) {
        self.put_at(key, answer, ttl, Instant::now()).await
    }

    pub async fn len(&self) -> usize {
        match &self.entries {
            Some(entries) => entries.lock().await.len(),
            None => 0,
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn get_at(&self, key: &RequestFingerprint, now: Instant) -> Option<Answer> {
        let mut guard = self.entries.as_ref()?.lock().await;
        let expired = guard.peek(key)?.expires_at <= now;
        if expired {
            guard.pop(key);
            debug!(fingerprint = %key.as_str(), "expired cache entry dropped");
            return None;
        }
        guard.get(key).map(|entry| entry.answer.clone())
    }

    async fn put_at(&self, key: RequestFingerprint, answer: Answer, ttl: Duration, now: Instant) {
        let Some(entries) = &self.entries else {
            return;
        };
        let mut guard = entries.lock().await;
        if !guard.contains(&key) && guard.len() >= guard.cap().get() {
            purge_expired(&mut guard, now);
        }

        let entry = CacheEntry {
            answer,
            expires_at: now + ttl,
        };
        if let Some((evicted, _)) = guard.push(key.clone(), entry) {
            if evicted != key {
                debug!(fingerprint = %evicted.as_str(), "least recently used entry evicted");
            }
        }
    }
}

fn purge_expired(cache: &mut LruCache<RequestFingerprint, CacheEntry>, now: Instant) {
    let expired = cache
        .iter()
        .filter(|(_, entry)| entry.expires_at <= now)
        .map(|(key, _)| key.clone())
        .collect::<Vec<_>>();
    for key in expired {
        cache.pop(&key);
    }
}
