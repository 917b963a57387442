//! Change-vector-keyed HTTP response cache
//!
//! Caches raw response bodies keyed by request path so the executor can send
//! `If-None-Match` and serve `304 Not Modified` responses locally. Entries are
//! pure overwrites (last writer wins); correctness comes from change-vector
//! revalidation, not from the cache itself.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use moka::sync::Cache;
use tracing::debug;

/// A single cached response
#[derive(Debug)]
struct HttpCacheItem {
    /// Change vector the body was served under; `None` marks a not-found
    /// tombstone
    change_vector: Option<String>,
    body: Bytes,
    stored_at: Instant,
    /// Tombstone may be served aggressively without revalidation
    aggressively_cached: bool,
}

/// Result of a cache lookup
#[derive(Debug, Clone)]
pub struct CachedItem {
    /// Change vector of the cached body; `None` for a not-found tombstone
    pub change_vector: Option<String>,
    /// Cached response body
    pub body: Bytes,
    /// Age of the entry
    pub age: std::time::Duration,
    /// Whether the entry was written as aggressively cacheable
    pub aggressively_cached: bool,
}

impl CachedItem {
    /// Whether this entry records a confirmed missing document
    pub fn is_not_found(&self) -> bool {
        self.change_vector.is_none()
    }
}

/// Process-local cache of request key → `(change vector, body)`
pub struct HttpCache {
    items: Cache<String, Arc<HttpCacheItem>>,
}

impl HttpCache {
    /// Create a cache bounded to `max_size` payload bytes
    pub fn new(max_size: u64) -> Self {
        let items = Cache::builder()
            .max_capacity(max_size)
            .weigher(|key: &String, item: &Arc<HttpCacheItem>| {
                (key.len() + item.body.len()).min(u32::MAX as usize) as u32
            })
            .build();
        Self { items }
    }

    /// Cache key for a request: the url's path and query, prefixed with
    /// `method + "-"` for non-GET methods. GET, the common case, uses the
    /// bare path. The origin is dropped so an entry written through one
    /// topology node revalidates reads routed to any other, and so absolute
    /// and database-relative forms of the same read share one entry;
    /// change vectors are cluster-wide, which is what makes that sound.
    pub fn cache_key(method: Option<&str>, url: &str) -> String {
        let path = match url.find("://") {
            Some(scheme_end) => {
                let authority = &url[scheme_end + 3..];
                match authority.find('/') {
                    Some(path_start) => &authority[path_start..],
                    None => "/",
                }
            }
            None => url,
        };
        match method {
            Some(m) if !m.is_empty() && m != "GET" => format!("{}-{}", m, path),
            _ => path.to_string(),
        }
    }

    /// Look up a cached response
    pub fn get(&self, key: &str) -> Option<CachedItem> {
        self.items.get(key).map(|item| CachedItem {
            change_vector: item.change_vector.clone(),
            body: item.body.clone(),
            age: item.stored_at.elapsed(),
            aggressively_cached: item.aggressively_cached,
        })
    }

    /// Store a response body under its change vector. Pure overwrite.
    pub fn set(&self, key: &str, change_vector: &str, body: Bytes) {
        debug!(key, change_vector, bytes = body.len(), "caching response");
        self.items.insert(
            key.to_string(),
            Arc::new(HttpCacheItem {
                change_vector: Some(change_vector.to_string()),
                body,
                stored_at: Instant::now(),
                aggressively_cached: false,
            }),
        );
    }

    /// Record that a key is known missing so repeat misses can skip the
    /// network while aggressive caching is on
    pub fn set_not_found(&self, key: &str, aggressively_cached: bool) {
        debug!(key, aggressively_cached, "caching not-found tombstone");
        self.items.insert(
            key.to_string(),
            Arc::new(HttpCacheItem {
                change_vector: None,
                body: Bytes::new(),
                stored_at: Instant::now(),
                aggressively_cached,
            }),
        );
    }

    /// Drop a single entry
    pub fn invalidate(&self, key: &str) {
        self.items.invalidate(key);
    }

    /// Drop everything
    pub fn clear(&self) {
        self.items.invalidate_all();
    }

    /// Approximate number of cached entries
    pub fn len(&self) -> u64 {
        self.items.run_pending_tasks();
        self.items.entry_count()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
