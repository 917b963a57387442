//! Node selection with failure tracking
//!
//! The selector owns one topology snapshot and decides, per request, which
//! node to try. Writes always go to the first non-faulted node; reads honor
//! the configured `ReadBalanceBehavior`. A node faulted by a transport error
//! stays out of rotation until its cooldown elapses or a newer topology
//! arrives.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::http::topology::{ServerNode, Topology};
use crate::{Error, Result};

/// How read requests are spread across the topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ReadBalanceBehavior {
    /// Always read from the preferred (first healthy) node
    #[default]
    None,
    /// Rotate reads across healthy nodes, keyed by session
    RoundRobin,
    /// Prefer the node with the best recorded response time
    FastestNode,
}

/// Per-node failure bookkeeping
struct NodeState {
    failures: AtomicUsize,
    last_failure: RwLock<Option<Instant>>,
    /// Best observed response time in microseconds (0 = unmeasured)
    speed_micros: AtomicU64,
}

impl NodeState {
    fn new() -> Self {
        Self {
            failures: AtomicUsize::new(0),
            last_failure: RwLock::new(None),
            speed_micros: AtomicU64::new(0),
        }
    }

    fn is_faulted(&self, cooldown: Duration) -> bool {
        if self.failures.load(Ordering::Relaxed) == 0 {
            return false;
        }
        match *self.last_failure.read() {
            Some(at) => at.elapsed() < cooldown,
            None => false,
        }
    }
}

/// Chooses which topology node serves each request
pub struct NodeSelector {
    topology: Arc<Topology>,
    state: Vec<NodeState>,
    round_robin: AtomicUsize,
    failure_cooldown: Duration,
}

impl NodeSelector {
    /// Create a selector over a topology snapshot
    pub fn new(topology: Arc<Topology>, failure_cooldown: Duration) -> Self {
        let state = topology.nodes.iter().map(|_| NodeState::new()).collect();
        Self {
            topology,
            state,
            round_robin: AtomicUsize::new(0),
            failure_cooldown,
        }
    }

    /// The topology snapshot this selector routes over
    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Number of nodes in the snapshot
    pub fn node_count(&self) -> usize {
        self.topology.nodes.len()
    }

    /// First node not currently faulted; falls back to node 0 when every node
    /// is faulted (the executor will surface the transport error itself).
    pub fn preferred_node(&self) -> Result<(usize, &ServerNode)> {
        if self.topology.nodes.is_empty() {
            return Err(Error::IllegalState(
                "topology contains no nodes".to_string(),
            ));
        }
        for (i, node) in self.topology.nodes.iter().enumerate() {
            if !self.state[i].is_faulted(self.failure_cooldown) {
                return Ok((i, node));
            }
        }
        warn!("every topology node is faulted, falling back to node 0");
        Ok((0, &self.topology.nodes[0]))
    }

    /// Node for a read request, honoring the balance behavior
    pub fn node_for_read(
        &self,
        behavior: ReadBalanceBehavior,
        session_id: Option<u64>,
    ) -> Result<(usize, &ServerNode)> {
        match behavior {
            ReadBalanceBehavior::None => self.preferred_node(),
            ReadBalanceBehavior::RoundRobin => self.round_robin_node(session_id),
            ReadBalanceBehavior::FastestNode => self.fastest_node(),
        }
    }

    fn round_robin_node(&self, session_id: Option<u64>) -> Result<(usize, &ServerNode)> {
        let count = self.node_count();
        if count == 0 {
            return Err(Error::IllegalState(
                "topology contains no nodes".to_string(),
            ));
        }
        let start = match session_id {
            Some(id) => id as usize % count,
            None => self.round_robin.fetch_add(1, Ordering::Relaxed) % count,
        };
        for offset in 0..count {
            let i = (start + offset) % count;
            if !self.state[i].is_faulted(self.failure_cooldown) {
                return Ok((i, &self.topology.nodes[i]));
            }
        }
        self.preferred_node()
    }

    fn fastest_node(&self) -> Result<(usize, &ServerNode)> {
        let mut best: Option<(usize, u64)> = None;
        for (i, state) in self.state.iter().enumerate() {
            if state.is_faulted(self.failure_cooldown) {
                continue;
            }
            let speed = state.speed_micros.load(Ordering::Relaxed);
            if speed == 0 {
                continue; // unmeasured
            }
            match best {
                Some((_, s)) if s <= speed => {}
                _ => best = Some((i, speed)),
            }
        }
        match best {
            Some((i, _)) => Ok((i, &self.topology.nodes[i])),
            None => self.preferred_node(),
        }
    }

    /// The node after `index`, skipping faulted nodes, for failover
    pub fn next_node_after(&self, index: usize) -> Option<(usize, &ServerNode)> {
        let count = self.node_count();
        if count <= 1 {
            return None;
        }
        for offset in 1..count {
            let i = (index + offset) % count;
            if !self.state[i].is_faulted(self.failure_cooldown) {
                return Some((i, &self.topology.nodes[i]));
            }
        }
        None
    }

    /// Record a transport-level failure against a node
    pub fn on_failed_request(&self, index: usize) {
        if let Some(state) = self.state.get(index) {
            let failures = state.failures.fetch_add(1, Ordering::Relaxed) + 1;
            *state.last_failure.write() = Some(Instant::now());
            warn!(
                node = %self.topology.nodes[index].url,
                failures, "marking node as faulted"
            );
        }
    }

    /// Record a successful response and its latency
    pub fn on_successful_request(&self, index: usize, elapsed: Duration) {
        if let Some(state) = self.state.get(index) {
            if state.failures.swap(0, Ordering::Relaxed) > 0 {
                info!(node = %self.topology.nodes[index].url, "node recovered");
            }
            let micros = elapsed.as_micros().min(u64::MAX as u128) as u64;
            let prev = state.speed_micros.load(Ordering::Relaxed);
            if prev == 0 || micros < prev {
                state.speed_micros.store(micros.max(1), Ordering::Relaxed);
                debug!(
                    node = %self.topology.nodes[index].url,
                    micros, "recorded node speed"
                );
            }
        }
    }
}
