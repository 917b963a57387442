//! Cluster topology snapshot
//!
//! A `Topology` is an immutable view of the database group: which nodes hold
//! the database and in what order writes should prefer them. Snapshots are
//! replaced wholesale when the server reports a newer etag; node order is
//! stable otherwise.

use serde::{Deserialize, Serialize};

/// Role a node plays within the database group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ServerRole {
    /// Unknown or unassigned
    #[default]
    None,
    /// Full member of the database group
    Member,
    /// Being promoted into the group
    Promotable,
    /// Recovering after a fault
    Rehab,
}

/// A single node in the cluster topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerNode {
    /// Base url of the node, without a trailing slash
    #[serde(rename = "Url")]
    pub url: String,
    /// Database this node serves
    #[serde(rename = "Database", default)]
    pub database: String,
    /// Cluster-wide tag (e.g. "A", "B")
    #[serde(rename = "ClusterTag", default)]
    pub cluster_tag: String,
    /// Role within the database group
    #[serde(rename = "ServerRole", default)]
    pub server_role: ServerRole,
}

impl ServerNode {
    /// Create a node from a seed url (used before the first topology fetch)
    pub fn new(url: impl Into<String>, database: impl Into<String>) -> Self {
        let mut url = url.into();
        while url.ends_with('/') {
            url.pop();
        }
        Self {
            url,
            database: database.into(),
            cluster_tag: String::new(),
            server_role: ServerRole::None,
        }
    }
}

/// Immutable topology snapshot: an etag plus an ordered node list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// Monotonically increasing topology version
    #[serde(rename = "Etag")]
    pub etag: i64,
    /// Nodes in server-preferred order; index 0 is the write-preferred node
    #[serde(rename = "Nodes")]
    pub nodes: Vec<ServerNode>,
}

impl Topology {
    /// Build a seed topology from raw urls, before the server has been asked
    pub fn from_urls(urls: &[String], database: &str) -> Self {
        Self {
            etag: -1,
            nodes: urls
                .iter()
                .map(|u| ServerNode::new(u.clone(), database))
                .collect(),
        }
    }

    /// Whether this snapshot supersedes `other`
    pub fn is_newer_than(&self, other: &Topology) -> bool {
        self.etag > other.etag
    }
}
