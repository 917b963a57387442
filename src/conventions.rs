//! Client-wide conventions and tuning knobs
//!
//! A `DocumentConventions` instance is attached to a `DocumentStore` and shared
//! (read-only) by every request executor and session the store creates.

use std::time::Duration;

use crate::http::ReadBalanceBehavior;

/// Client-wide configuration shared by all sessions of a store
#[derive(Debug, Clone)]
pub struct DocumentConventions {
    /// Per-attempt HTTP request timeout
    pub request_timeout: Duration,
    /// How read requests are spread across topology nodes
    pub read_balance_behavior: ReadBalanceBehavior,
    /// Guard against runaway N+1 request patterns inside one session
    pub max_number_of_requests_per_session: usize,
    /// Attach last-known change vectors to puts/deletes
    pub use_optimistic_concurrency: bool,
    /// Skip lazy topology discovery and pin to the seed urls
    pub disable_topology_updates: bool,
    /// How long a failed node stays out of rotation before being retried
    pub failure_cooldown: Duration,
    /// Upper bound on HTTP cache payload bytes
    pub max_http_cache_size: u64,
    /// Collection prefix used when a stored entity carries no id
    pub default_collection: String,
}

impl Default for DocumentConventions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            read_balance_behavior: ReadBalanceBehavior::None,
            max_number_of_requests_per_session: 30,
            use_optimistic_concurrency: true,
            disable_topology_updates: false,
            failure_cooldown: Duration::from_secs(5 * 60),
            max_http_cache_size: 128 * 1024 * 1024, // 128MB
            default_collection: "items".to_string(),
        }
    }
}

impl DocumentConventions {
    /// Create conventions with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-attempt request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the read balance behavior
    pub fn with_read_balance_behavior(mut self, behavior: ReadBalanceBehavior) -> Self {
        self.read_balance_behavior = behavior;
        self
    }

    /// Set the per-session request budget
    pub fn with_max_requests_per_session(mut self, max: usize) -> Self {
        self.max_number_of_requests_per_session = max;
        self
    }

    /// Toggle optimistic concurrency on saves
    pub fn with_optimistic_concurrency(mut self, enabled: bool) -> Self {
        self.use_optimistic_concurrency = enabled;
        self
    }

    /// Pin the executor to the seed urls (no topology discovery)
    pub fn with_topology_updates_disabled(mut self) -> Self {
        self.disable_topology_updates = true;
        self
    }

    /// Set how long a failed node stays out of rotation
    pub fn with_failure_cooldown(mut self, cooldown: Duration) -> Self {
        self.failure_cooldown = cooldown;
        self
    }

    /// Build the document id prefix for an entity without one.
    ///
    /// Ids follow the `collection/suffix` shape; the collection may be supplied
    /// by the caller at store time, otherwise `default_collection` applies.
    pub fn id_prefix_for(&self, collection: Option<&str>) -> String {
        let collection = collection.unwrap_or(&self.default_collection);
        format!("{}/", collection)
    }
}

/// Aggressive caching mode
///
/// `DoNotTrackChanges` serves cached responses for the whole window without
/// touching the server. `TrackChanges` keeps revalidating via change vectors
/// but still allows not-found tombstones to short-circuit repeat misses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggressiveCacheMode {
    /// Serve from cache for the full duration, ignoring server-side changes
    DoNotTrackChanges,
    /// Revalidate with `If-None-Match` even inside the window
    TrackChanges,
}

/// Aggressive caching window configuration
#[derive(Debug, Clone, Copy)]
pub struct AggressiveCacheOptions {
    /// How long cached responses may be served without validation
    pub duration: Duration,
    /// Whether change tracking stays on inside the window
    pub mode: AggressiveCacheMode,
}

impl AggressiveCacheOptions {
    /// Cache aggressively for `duration` without tracking server changes
    pub fn for_duration(duration: Duration) -> Self {
        Self {
            duration,
            mode: AggressiveCacheMode::DoNotTrackChanges,
        }
    }

    /// Cache aggressively but keep revalidating via change vectors
    pub fn tracking_changes(duration: Duration) -> Self {
        Self {
            duration,
            mode: AggressiveCacheMode::TrackChanges,
        }
    }
}
