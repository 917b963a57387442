//! Compare-exchange (distributed CAS) commands
//!
//! The server exposes a linearizable key/value store at
//! `/databases/{db}/cmpxchg`; every mutation carries the expected index and
//! fails on mismatch. Session-tracked compare-exchange values go through the
//! batch command instead; these standalone commands serve direct operations
//! and the session's read path.

use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;

use crate::http::commands::{Command, HttpRequest};
use crate::http::topology::ServerNode;
use crate::Result;

/// A compare-exchange entry as the server reports it
#[derive(Debug, Clone, Deserialize)]
pub struct CompareExchangeValue {
    #[serde(rename = "Key")]
    pub key: String,
    /// Server-assigned version; positive once persisted
    #[serde(rename = "Index")]
    pub index: i64,
    #[serde(rename = "Value")]
    pub value: Value,
}

#[derive(Deserialize, Default)]
struct GetResponseBody {
    #[serde(rename = "Results", default)]
    results: Vec<CompareExchangeValue>,
}

/// `GET /databases/{db}/cmpxchg?key=...` — read a compare-exchange value
pub struct GetCompareExchangeValueCommand {
    key: String,
    result: Option<CompareExchangeValue>,
}

impl GetCompareExchangeValueCommand {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            result: None,
        }
    }

    /// The fetched value; `None` when the key does not exist
    pub fn into_result(self) -> Option<CompareExchangeValue> {
        self.result
    }
}

impl Command for GetCompareExchangeValueCommand {
    fn create_request(&self, node: &ServerNode) -> Result<HttpRequest> {
        let url = format!(
            "{}/databases/{}/cmpxchg?key={}",
            node.url, node.database, self.key
        );
        Ok(HttpRequest::get(url))
    }

    fn set_response(&mut self, body: &[u8], _from_cache: bool) -> Result<()> {
        if body == b"null" {
            self.result = None;
            return Ok(());
        }
        let parsed: GetResponseBody = serde_json::from_slice(body)?;
        self.result = parsed.results.into_iter().next();
        Ok(())
    }

    fn is_read_request(&self) -> bool {
        true
    }
}

#[derive(Deserialize)]
struct PutResponseBody {
    #[serde(rename = "Index")]
    index: i64,
    #[serde(rename = "Successful", default)]
    successful: bool,
    #[serde(rename = "Value", default)]
    value: Value,
}

/// Result of a direct compare-exchange put or delete
#[derive(Debug, Clone)]
pub struct CompareExchangeResult {
    /// Whether the CAS succeeded
    pub successful: bool,
    /// The index now stored server-side (the winner's index on failure)
    pub index: i64,
    /// The value now stored server-side
    pub value: Value,
}

/// `PUT /databases/{db}/cmpxchg?key=...&index=...` — CAS-put a value.
///
/// Index 0 means "create only if absent"; a positive index must match the
/// current server index for the swap to apply.
pub struct PutCompareExchangeValueCommand {
    key: String,
    index: i64,
    value: Value,
    result: Option<CompareExchangeResult>,
}

impl PutCompareExchangeValueCommand {
    pub fn new(key: impl Into<String>, index: i64, value: Value) -> Self {
        Self {
            key: key.into(),
            index,
            value,
            result: None,
        }
    }

    pub fn into_result(self) -> Option<CompareExchangeResult> {
        self.result
    }
}

impl Command for PutCompareExchangeValueCommand {
    fn create_request(&self, node: &ServerNode) -> Result<HttpRequest> {
        let url = format!(
            "{}/databases/{}/cmpxchg?key={}&index={}",
            node.url, node.database, self.key, self.index
        );
        let body = serde_json::to_vec(&serde_json::json!({ "Value": self.value }))?;
        Ok(HttpRequest::json(Method::PUT, url, body))
    }

    fn set_response(&mut self, body: &[u8], _from_cache: bool) -> Result<()> {
        let parsed: PutResponseBody = serde_json::from_slice(body)?;
        self.result = Some(CompareExchangeResult {
            successful: parsed.successful,
            index: parsed.index,
            value: parsed.value,
        });
        Ok(())
    }

    fn is_read_request(&self) -> bool {
        false
    }
}

/// `DELETE /databases/{db}/cmpxchg?key=...&index=...` — CAS-delete a value
pub struct DeleteCompareExchangeValueCommand {
    key: String,
    index: i64,
    result: Option<CompareExchangeResult>,
}

impl DeleteCompareExchangeValueCommand {
    pub fn new(key: impl Into<String>, index: i64) -> Self {
        Self {
            key: key.into(),
            index,
            result: None,
        }
    }

    pub fn into_result(self) -> Option<CompareExchangeResult> {
        self.result
    }
}

impl Command for DeleteCompareExchangeValueCommand {
    fn create_request(&self, node: &ServerNode) -> Result<HttpRequest> {
        let url = format!(
            "{}/databases/{}/cmpxchg?key={}&index={}",
            node.url, node.database, self.key, self.index
        );
        Ok(HttpRequest {
            url,
            method: Method::DELETE,
            headers: Vec::new(),
            body: None,
        })
    }

    fn set_response(&mut self, body: &[u8], _from_cache: bool) -> Result<()> {
        if body == b"null" {
            self.result = None;
            return Ok(());
        }
        let parsed: PutResponseBody = serde_json::from_slice(body)?;
        self.result = Some(CompareExchangeResult {
            successful: parsed.successful,
            index: parsed.index,
            value: parsed.value,
        });
        Ok(())
    }

    fn is_read_request(&self) -> bool {
        false
    }
}
