use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A successfully served translation, stored for exact-match reuse.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedTranslation {
    pub detected_lang: String,
    pub confidence: f32,
    pub translated_text: String,
    pub provider: String,
}

#[derive(Debug, Hash, PartialEq, Eq)]
struct CacheKey {
    message: String,
    target_lang: String,
}

/// Snapshot of cache effectiveness, exposed through the health endpoint.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Content-addressed cache of `(message, target_lang)` to a prior translation.
///
/// Bounded by an LRU size cap so repeated chatter cannot grow memory without
/// bound; there is no separate TTL. Shared across all concurrent pipelines
/// behind a single mutex - lookups are cheap hash probes, so contention stays
/// negligible next to the provider round-trip they avoid.
pub struct TranslationCache {
    inner: Mutex<LruCache<CacheKey, CachedTranslation>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TranslationCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Exact-match lookup. Promotes the entry to most-recently-used.
    pub fn get(&self, message: &str, target_lang: &str) -> Option<CachedTranslation> {
        let key = CacheKey {
            message: message.to_string(),
            target_lang: target_lang.to_string(),
        };
        let mut cache = self.inner.lock().expect("cache lock poisoned");
        match cache.get(&key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Write-through insert after a successful provider translation.
    pub fn insert(&self, message: &str, target_lang: &str, entry: CachedTranslation) {
        let key = CacheKey {
            message: message.to_string(),
            target_lang: target_lang.to_string(),
        };
        let mut cache = self.inner.lock().expect("cache lock poisoned");
        cache.put(key, entry);
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.inner.lock().expect("cache lock poisoned").len();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
        }
    }
}
