//! Batched write command (`bulk_docs`)
//!
//! Everything a `save_changes` call produces — document puts and deletes plus
//! compare-exchange operations — travels as one ordered array and comes back
//! as a positional array of per-command results.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::http::commands::{Command, HttpRequest};
use crate::http::topology::ServerNode;
use crate::session::TransactionMode;
use crate::Result;

/// One entry in a batch, in session-composed order
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "Type")]
pub enum BatchCommandData {
    /// Put a document, optionally guarded by its last-known change vector
    #[serde(rename = "PUT")]
    Put {
        #[serde(rename = "Id")]
        id: String,
        #[serde(rename = "ChangeVector")]
        change_vector: Option<String>,
        #[serde(rename = "Document")]
        document: Value,
    },
    /// Delete a document, optionally guarded by its last-known change vector
    #[serde(rename = "DELETE")]
    Delete {
        #[serde(rename = "Id")]
        id: String,
        #[serde(rename = "ChangeVector")]
        change_vector: Option<String>,
    },
    /// Compare-exchange put with the expected index
    #[serde(rename = "CompareExchangePUT")]
    CompareExchangePut {
        #[serde(rename = "Key")]
        key: String,
        #[serde(rename = "Index")]
        index: i64,
        #[serde(rename = "Value")]
        value: Value,
    },
    /// Compare-exchange delete with the expected index
    #[serde(rename = "CompareExchangeDELETE")]
    CompareExchangeDelete {
        #[serde(rename = "Key")]
        key: String,
        #[serde(rename = "Index")]
        index: i64,
    },
}

/// Per-command result, positionally matched to the request array
#[derive(Debug, Clone, Deserialize)]
pub struct BatchResult {
    #[serde(rename = "Type")]
    pub command_type: String,
    #[serde(rename = "Id", default)]
    pub id: Option<String>,
    #[serde(rename = "ChangeVector", default)]
    pub change_vector: Option<String>,
    #[serde(rename = "Key", default)]
    pub key: Option<String>,
    #[serde(rename = "Index", default)]
    pub index: Option<i64>,
}

#[derive(Serialize)]
struct BatchRequestBody<'a> {
    #[serde(rename = "Commands")]
    commands: &'a [BatchCommandData],
    #[serde(rename = "TransactionMode", skip_serializing_if = "Option::is_none")]
    transaction_mode: Option<&'static str>,
}

#[derive(Deserialize, Default)]
struct BatchResponseBody {
    #[serde(rename = "Results", default)]
    results: Vec<BatchResult>,
}

/// `POST /databases/{db}/bulk_docs` — apply an ordered batch of commands
pub struct BatchCommand {
    commands: Vec<BatchCommandData>,
    mode: TransactionMode,
    /// Idempotency id for cluster-wide batches, fixed for the command's lifetime
    raft_request_id: Option<String>,
    results: Vec<BatchResult>,
}

impl BatchCommand {
    /// Create a batch in the given transaction mode.
    ///
    /// Cluster-wide batches are raft operations: they get an idempotency id up
    /// front so a retried send cannot apply twice.
    pub fn new(commands: Vec<BatchCommandData>, mode: TransactionMode) -> Self {
        let raft_request_id = match mode {
            TransactionMode::ClusterWide => Some(uuid::Uuid::new_v4().to_string()),
            TransactionMode::SingleNode => None,
        };
        Self {
            commands,
            mode,
            raft_request_id,
            results: Vec::new(),
        }
    }

    /// Positional results, one per submitted command
    pub fn results(&self) -> &[BatchResult] {
        &self.results
    }
}

impl Command for BatchCommand {
    fn create_request(&self, node: &ServerNode) -> Result<HttpRequest> {
        let url = format!("{}/databases/{}/bulk_docs", node.url, node.database);
        let body = BatchRequestBody {
            commands: &self.commands,
            transaction_mode: match self.mode {
                TransactionMode::ClusterWide => Some("ClusterWide"),
                TransactionMode::SingleNode => None,
            },
        };
        Ok(HttpRequest::json(
            Method::POST,
            url,
            serde_json::to_vec(&body)?,
        ))
    }

    fn set_response(&mut self, body: &[u8], _from_cache: bool) -> Result<()> {
        let parsed: BatchResponseBody = serde_json::from_slice(body)?;
        self.results = parsed.results;
        Ok(())
    }

    fn is_read_request(&self) -> bool {
        false
    }

    fn raft_unique_request_id(&self) -> Option<&str> {
        self.raft_request_id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_body_shape() {
        let commands = vec![
            BatchCommandData::Put {
                id: "users/1".to_string(),
                change_vector: Some("A:1".to_string()),
                document: serde_json::json!({"name": "ada"}),
            },
            BatchCommandData::Delete {
                id: "users/2".to_string(),
                change_vector: None,
            },
        ];
        let command = BatchCommand::new(commands, TransactionMode::SingleNode);
        let node = ServerNode::new("http://a:8080", "db");
        let request = command.create_request(&node).unwrap();

        assert_eq!(request.url, "http://a:8080/databases/db/bulk_docs");
        let body: Value = serde_json::from_slice(request.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["Commands"][0]["Type"], "PUT");
        assert_eq!(body["Commands"][0]["Id"], "users/1");
        assert_eq!(body["Commands"][1]["Type"], "DELETE");
        assert!(body.get("TransactionMode").is_none());
    }

    #[test]
    fn test_cluster_wide_batch_has_stable_raft_id() {
        let command = BatchCommand::new(Vec::new(), TransactionMode::ClusterWide);
        let first = command.raft_unique_request_id().unwrap().to_string();
        // Same id on every attempt; retried sends must be server-side no-ops.
        assert_eq!(command.raft_unique_request_id().unwrap(), first);

        let single = BatchCommand::new(Vec::new(), TransactionMode::SingleNode);
        assert!(single.raft_unique_request_id().is_none());
    }
}
