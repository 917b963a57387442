//! Cluster-facing HTTP layer
//!
//! Everything between a session and the wire lives here: the topology
//! snapshot, the node selector with its failover bookkeeping, the
//! change-vector-keyed response cache, and the request executor that ties
//! them together. A single `RequestExecutor` is shared by every session a
//! store opens against the same database.

pub mod cache;
pub mod commands;
pub mod node_selector;
pub mod request_executor;
pub mod topology;

pub use cache::{CachedItem, HttpCache};
pub use commands::{Command, HttpRequest, ResponseDisposal};
pub use node_selector::{NodeSelector, ReadBalanceBehavior};
pub use request_executor::{RequestExecutor, SessionInfo};
pub use topology::{ServerNode, ServerRole, Topology};
