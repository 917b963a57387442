//! Session (unit of work) layer
//!
//! A `DocumentSession` tracks every entity it has loaded or stored, detects
//! what actually changed, and persists the net diff as one batch on
//! `save_changes`. Sessions are single-owner and cheap; the heavyweight
//! shared pieces (executor, cache, topology) live behind the store.

mod cluster_transactions;
mod document_info;
mod document_session;
mod lazy;

pub use cluster_transactions::{
    ClusterTransactions, CompareExchangeHandle, CompareExchangeSessionValue,
    CompareExchangeValueState,
};
pub use document_info::DocumentInfo;
pub use document_session::DocumentSession;
pub use lazy::{Lazy, PendingLazyOperation};

use crate::conventions::AggressiveCacheOptions;

/// Transaction scope of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionMode {
    /// Writes go through a single node's transaction (the default)
    #[default]
    SingleNode,
    /// Writes go through the cluster's raft log; enables compare-exchange
    /// tracking on the session
    ClusterWide,
}

/// Options for opening a session
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Transaction scope; compare-exchange APIs require `ClusterWide`
    pub transaction_mode: TransactionMode,
    /// Serve reads from the HTTP cache within this window
    pub aggressive_cache: Option<AggressiveCacheOptions>,
    /// Bypass the HTTP cache for every request of this session
    pub no_caching: bool,
}
