//! Request execution with failover, caching, and topology maintenance
//!
//! One `RequestExecutor` exists per (store, database) pair and is shared by
//! every session. It lazily discovers the cluster topology, routes each
//! command to a healthy node, revalidates cached responses via change
//! vectors, and fails over on transport errors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::RwLock;
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::commands::GetTopologyCommand;
use crate::conventions::{AggressiveCacheMode, AggressiveCacheOptions, DocumentConventions};
use crate::http::cache::{CachedItem, HttpCache};
use crate::http::commands::{Command, HttpRequest, ResponseDisposal};
use crate::http::node_selector::NodeSelector;
use crate::http::topology::{ServerNode, Topology};
use crate::{Error, Result};

/// Per-request context a session passes along with each command
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    /// Stable id used to key round-robin read balancing
    pub session_id: u64,
    /// Aggressive caching window, when the session enabled one
    pub aggressive_cache: Option<AggressiveCacheOptions>,
    /// Bypass the HTTP cache entirely for this session
    pub no_caching: bool,
}

/// Outcome of a single `execute` call
#[derive(Debug, Clone, Copy)]
pub struct ExecutionResult {
    /// True when the command's response was served from the HTTP cache
    /// (304 revalidation or an aggressive-cache window)
    pub from_cache: bool,
}

/// How a single attempt against one node ended
enum AttemptError {
    /// Application-level failure; surfaces to the caller unchanged
    Fatal(Error),
    /// Node answered 421: its topology view is behind ours
    TopologyStale(Error),
    /// Connection-level failure; the next node gets a try
    Transport(Error),
}

/// Executes commands against the cluster on behalf of sessions
pub struct RequestExecutor {
    database: String,
    initial_urls: Vec<String>,
    conventions: DocumentConventions,
    client: reqwest::Client,
    /// Copy-on-write selector snapshot; `None` until the first topology fetch
    selector: RwLock<Option<Arc<NodeSelector>>>,
    cache: Arc<HttpCache>,
    /// Serializes topology refreshes so concurrent callers coalesce
    refresh_lock: tokio::sync::Mutex<()>,
    /// Responses actually produced by a server round trip
    requests_sent: AtomicU64,
    /// Responses served from the HTTP cache
    cache_hits: AtomicU64,
}

impl RequestExecutor {
    /// Create an executor for `database` seeded with the given urls
    pub fn new(
        urls: Vec<String>,
        database: impl Into<String>,
        conventions: DocumentConventions,
    ) -> Arc<Self> {
        let database = database.into();
        let cache = Arc::new(HttpCache::new(conventions.max_http_cache_size));

        // With topology updates disabled the seed urls are the topology.
        let selector = if conventions.disable_topology_updates {
            let topology = Arc::new(Topology::from_urls(&urls, &database));
            Some(Arc::new(NodeSelector::new(
                topology,
                conventions.failure_cooldown,
            )))
        } else {
            None
        };

        Arc::new(Self {
            database,
            initial_urls: urls,
            conventions,
            client: reqwest::Client::new(),
            selector: RwLock::new(selector),
            cache,
            refresh_lock: tokio::sync::Mutex::new(()),
            requests_sent: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        })
    }

    /// The database this executor serves
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Conventions this executor was built with
    pub fn conventions(&self) -> &DocumentConventions {
        &self.conventions
    }

    /// Shared HTTP cache
    pub fn cache(&self) -> &Arc<HttpCache> {
        &self.cache
    }

    /// Number of responses produced by actual server round trips
    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::Relaxed)
    }

    /// Number of responses served from the HTTP cache
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Current topology snapshot, if one has been fetched
    pub fn topology(&self) -> Option<Arc<Topology>> {
        self.selector.read().as_ref().map(|s| s.topology().clone())
    }

    /// Serve a command from an aggressive-cache window without touching the
    /// network. Returns `false` when no window applies or nothing usable is
    /// cached; the caller then goes through the full execute path.
    pub fn try_serve_from_cache<C: Command>(
        &self,
        command: &mut C,
        session_info: &SessionInfo,
    ) -> Result<bool> {
        let Some(options) = &session_info.aggressive_cache else {
            return Ok(false);
        };
        if options.mode != AggressiveCacheMode::DoNotTrackChanges
            || session_info.no_caching
            || !command.can_cache()
            || !command.is_read_request()
        {
            return Ok(false);
        }
        let Some(selector) = self.selector.read().clone() else {
            return Ok(false);
        };

        let (_, node) = selector.preferred_node()?;
        let request = command.create_request(node)?;
        let cache_key = HttpCache::cache_key(Some(request.method.as_str()), &request.url);
        match self.cache.get(&cache_key) {
            Some(item)
                if item.age < options.duration
                    && (!item.is_not_found() || item.aggressively_cached) =>
            {
                debug!(url = %request.url, "serving from aggressive cache window");
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                let body = Self::cached_body(&item);
                command.set_response(&body, true)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Execute a command, failing over across topology nodes as needed
    pub async fn execute<C: Command>(
        &self,
        command: &mut C,
        session_info: &SessionInfo,
    ) -> Result<ExecutionResult> {
        if self.try_serve_from_cache(command, session_info)? {
            return Ok(ExecutionResult { from_cache: true });
        }

        let mut selector = self.ensure_selector().await?;
        let mut node_count = selector.node_count();

        let is_read = command.is_read_request();
        let (mut node_index, mut node) = if is_read {
            let (i, n) = selector.node_for_read(
                self.conventions.read_balance_behavior,
                Some(session_info.session_id),
            )?;
            (i, n.clone())
        } else {
            let (i, n) = selector.preferred_node()?;
            (i, n.clone())
        };

        let mut attempts = 0usize;
        let mut topology_refreshed = false;

        loop {
            attempts += 1;
            match self
                .try_execute(command, &node, session_info, &selector, node_index)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::TopologyStale(e)) => {
                    // One unconditional refresh-and-retry, then give up.
                    if topology_refreshed {
                        return Err(e);
                    }
                    warn!(node = %node.url, "node reports stale topology, refreshing");
                    self.update_topology(&node).await?;
                    topology_refreshed = true;
                    selector = self.ensure_selector().await?;
                    node_count = selector.node_count();
                    let (i, n) = selector.preferred_node()?;
                    node_index = i;
                    node = n.clone();
                }
                Err(AttemptError::Transport(e)) => {
                    selector.on_failed_request(node_index);
                    if attempts >= node_count {
                        warn!(
                            database = %self.database,
                            attempts, "every topology node failed"
                        );
                        return Err(if node_count == 1 {
                            e
                        } else {
                            Error::AllTopologyNodesDown {
                                url_count: node_count,
                            }
                        });
                    }
                    match selector.next_node_after(node_index) {
                        Some((i, n)) => {
                            info!(
                                failed = %node.url,
                                next = %n.url,
                                "failing over to next topology node"
                            );
                            node_index = i;
                            node = n.clone();
                        }
                        None => return Err(e),
                    }
                }
            }
        }
    }

    /// One attempt against one node
    async fn try_execute<C: Command>(
        &self,
        command: &mut C,
        node: &ServerNode,
        session_info: &SessionInfo,
        selector: &Arc<NodeSelector>,
        node_index: usize,
    ) -> std::result::Result<ExecutionResult, AttemptError> {
        let request = command.create_request(node).map_err(AttemptError::Fatal)?;

        let caching_enabled =
            command.can_cache() && command.is_read_request() && !session_info.no_caching;
        let cache_key = HttpCache::cache_key(Some(request.method.as_str()), &request.url);

        // Aggressive windows were already checked in `execute`; from here on
        // the cached entry only feeds revalidation.
        let cached = if caching_enabled {
            self.cache.get(&cache_key)
        } else {
            None
        };

        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .timeout(self.conventions.request_timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        if let Some(item) = &cached {
            if let Some(change_vector) = &item.change_vector {
                builder = builder.header("If-None-Match", change_vector);
            }
        }
        if let Some(raft_id) = command.raft_unique_request_id() {
            builder = builder.header("Raft-Request-Id", raft_id);
        }

        let started = Instant::now();
        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) => return Err(AttemptError::Transport(e.into())),
        };
        let elapsed = started.elapsed();
        let status = response.status();

        match status {
            StatusCode::NOT_MODIFIED => {
                selector.on_successful_request(node_index, elapsed);
                let item = cached.ok_or_else(|| {
                    AttemptError::Fatal(Error::IllegalState(
                        "server returned 304 without a cached entry".to_string(),
                    ))
                })?;
                debug!(url = %request.url, "304 not modified, serving cached body");
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                let body = Self::cached_body(&item);
                command
                    .set_response(&body, true)
                    .map_err(AttemptError::Fatal)?;
                Ok(ExecutionResult { from_cache: true })
            }
            StatusCode::NOT_FOUND => {
                selector.on_successful_request(node_index, elapsed);
                self.requests_sent.fetch_add(1, Ordering::Relaxed);
                if caching_enabled {
                    let aggressive = session_info.aggressive_cache.is_some();
                    self.cache.set_not_found(&cache_key, aggressive);
                }
                command
                    .set_response(b"null", false)
                    .map_err(AttemptError::Fatal)?;
                Ok(ExecutionResult { from_cache: false })
            }
            StatusCode::MISDIRECTED_REQUEST => {
                let body = response.bytes().await.unwrap_or_default();
                Err(AttemptError::TopologyStale(Error::from_server_response(
                    status.as_u16(),
                    &body,
                )))
            }
            s if s.is_success() => {
                selector.on_successful_request(node_index, elapsed);
                self.requests_sent.fetch_add(1, Ordering::Relaxed);

                if command.response_disposal() == ResponseDisposal::Empty {
                    return Ok(ExecutionResult { from_cache: false });
                }

                let change_vector = response
                    .headers()
                    .get("ETag")
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.trim_matches('"').to_string());
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| AttemptError::Transport(e.into()))?;

                if caching_enabled {
                    if let Some(cv) = &change_vector {
                        self.cache.set(&cache_key, cv, body.clone());
                    }
                }

                command
                    .set_response(&body, false)
                    .map_err(AttemptError::Fatal)?;
                Ok(ExecutionResult { from_cache: false })
            }
            s => {
                // Application-level errors are never retried.
                let body = response.bytes().await.unwrap_or_default();
                Err(AttemptError::Fatal(Error::from_server_response(
                    s.as_u16(),
                    &body,
                )))
            }
        }
    }

    fn cached_body(item: &CachedItem) -> Bytes {
        if item.is_not_found() {
            Bytes::from_static(b"null")
        } else {
            item.body.clone()
        }
    }

    /// Return the current selector, fetching the initial topology on first use
    async fn ensure_selector(&self) -> Result<Arc<NodeSelector>> {
        if let Some(selector) = self.selector.read().as_ref() {
            return Ok(selector.clone());
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have completed the fetch while we waited.
        if let Some(selector) = self.selector.read().as_ref() {
            return Ok(selector.clone());
        }

        let topology = self.fetch_initial_topology().await?;
        info!(
            database = %self.database,
            etag = topology.etag,
            nodes = topology.nodes.len(),
            "initial topology fetched"
        );
        let selector = Arc::new(NodeSelector::new(
            Arc::new(topology),
            self.conventions.failure_cooldown,
        ));
        *self.selector.write() = Some(selector.clone());
        Ok(selector)
    }

    /// Try each seed url in order until one answers the topology request
    async fn fetch_initial_topology(&self) -> Result<Topology> {
        let mut last_error = None;
        for url in &self.initial_urls {
            let node = ServerNode::new(url.clone(), self.database.clone());
            let mut command = GetTopologyCommand::new();
            match self.send_unrouted(&node, &mut command).await {
                Ok(()) => {
                    if let Some(topology) = command.into_result() {
                        return Ok(topology);
                    }
                }
                Err(e) if e.is_transport() => {
                    warn!(url = %url, error = %e, "seed url unreachable during topology fetch");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        // Multi-seed exhaustion aggregates like the failover path does; a
        // single seed keeps its raw transport error.
        if self.initial_urls.len() > 1 {
            return Err(Error::AllTopologyNodesDown {
                url_count: self.initial_urls.len(),
            });
        }
        Err(last_error.unwrap_or(Error::AllTopologyNodesDown {
            url_count: self.initial_urls.len(),
        }))
    }

    /// Refresh the topology from `node`, swapping the selector only when the
    /// incoming snapshot is newer. Concurrent refreshes coalesce.
    pub async fn update_topology(&self, node: &ServerNode) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;

        let mut command = GetTopologyCommand::new();
        self.send_unrouted(node, &mut command).await?;
        let Some(incoming) = command.into_result() else {
            return Ok(());
        };

        let current_etag = self
            .selector
            .read()
            .as_ref()
            .map(|s| s.topology().etag)
            .unwrap_or(-1);
        if incoming.etag <= current_etag {
            debug!(
                incoming = incoming.etag,
                current = current_etag,
                "ignoring stale topology"
            );
            return Ok(());
        }

        info!(
            etag = incoming.etag,
            nodes = incoming.nodes.len(),
            "topology updated"
        );
        let selector = Arc::new(NodeSelector::new(
            Arc::new(incoming),
            self.conventions.failure_cooldown,
        ));
        *self.selector.write() = Some(selector);
        Ok(())
    }

    /// Send a command straight to one node: no cache, no failover.
    /// Used for topology bootstrap before a selector exists.
    async fn send_unrouted<C: Command>(&self, node: &ServerNode, command: &mut C) -> Result<()> {
        let request = command.create_request(node)?;
        let HttpRequest {
            url, method, body, ..
        } = request;

        let mut builder = self
            .client
            .request(method, &url)
            .timeout(self.conventions.request_timeout);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(Error::from_server_response(status.as_u16(), &body));
        }
        command.set_response(&body, false)
    }
}
