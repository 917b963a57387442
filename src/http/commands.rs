//! Command abstraction between operations and the executor
//!
//! The executor never inspects what a command means; it only asks it to
//! describe an HTTP request for a given node and hands back the raw response
//! body. Every operation the client performs (document loads, batches,
//! multi-get, compare-exchange) is a `Command` implementation.

use reqwest::Method;

use crate::http::topology::ServerNode;
use crate::Result;

/// A fully-described HTTP request, ready for the executor to send
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Absolute url including query string
    pub url: String,
    /// HTTP method
    pub method: Method,
    /// Extra headers beyond what the executor adds itself
    pub headers: Vec<(String, String)>,
    /// JSON body, when the method carries one
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// A bodyless GET for `url`
    pub fn get(url: String) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: Vec::new(),
            body: None,
        }
    }

    /// A JSON request with the given method and serialized body
    pub fn json(method: Method, url: String, body: Vec<u8>) -> Self {
        Self {
            url,
            method,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Some(body),
        }
    }
}

/// How the executor should treat the response body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDisposal {
    /// Response carries a JSON object the command wants to see
    Object,
    /// Response body is irrelevant (the status code is the result)
    Empty,
}

/// An operation the request executor can run against a cluster node.
///
/// Commands are single-use: the executor calls `create_request` once per
/// attempt (the request may be retried against other nodes verbatim) and
/// `set_response` exactly once on success.
pub trait Command: Send {
    /// Describe the HTTP request this command makes against `node`
    fn create_request(&self, node: &ServerNode) -> Result<HttpRequest>;

    /// Receive the raw response body. `from_cache` is true when the body was
    /// served from the HTTP cache (304 path or aggressive window).
    fn set_response(&mut self, body: &[u8], from_cache: bool) -> Result<()>;

    /// Read requests are cacheable and may be balanced across nodes
    fn is_read_request(&self) -> bool;

    /// How to treat the response body
    fn response_disposal(&self) -> ResponseDisposal {
        ResponseDisposal::Object
    }

    /// Idempotency id for cluster-wide (raft) operations.
    ///
    /// Generated once per logical operation, never per HTTP attempt, so a
    /// retried send is a safe no-op server-side.
    fn raft_unique_request_id(&self) -> Option<&str> {
        None
    }

    /// Whether responses to this command may be stored in the HTTP cache
    fn can_cache(&self) -> bool {
        self.is_read_request()
    }
}
