//! Batched document fetch command

use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;

use crate::http::commands::{Command, HttpRequest};
use crate::http::topology::ServerNode;
use crate::Result;

/// Positional results of a document fetch; missing ids come back as `null`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetDocumentsResult {
    #[serde(rename = "Results", default)]
    pub results: Vec<Value>,
}

/// `GET /databases/{db}/docs?id=a&id=b` — fetch one or more documents by id
pub struct GetDocumentsCommand {
    ids: Vec<String>,
    result: Option<GetDocumentsResult>,
}

impl GetDocumentsCommand {
    /// Fetch the given ids in one round trip
    pub fn new(ids: Vec<String>) -> Self {
        Self { ids, result: None }
    }

    /// Consume the command, yielding the positional results
    pub fn into_result(self) -> GetDocumentsResult {
        self.result.unwrap_or_default()
    }

    /// Build just the query string, shared with the lazy multi-get path
    pub fn query_string(ids: &[String]) -> String {
        let mut query = String::from("?");
        for (i, id) in ids.iter().enumerate() {
            if i > 0 {
                query.push('&');
            }
            query.push_str("id=");
            query.push_str(&urlencode(id));
        }
        query
    }
}

/// Minimal percent-encoding for document ids inside a query string
fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

impl Command for GetDocumentsCommand {
    fn create_request(&self, node: &ServerNode) -> Result<HttpRequest> {
        let url = format!(
            "{}/databases/{}/docs{}",
            node.url,
            node.database,
            Self::query_string(&self.ids)
        );
        Ok(HttpRequest {
            url,
            method: Method::GET,
            headers: Vec::new(),
            body: None,
        })
    }

    fn set_response(&mut self, body: &[u8], _from_cache: bool) -> Result<()> {
        if body == b"null" {
            self.result = Some(GetDocumentsResult {
                results: self.ids.iter().map(|_| Value::Null).collect(),
            });
            return Ok(());
        }
        self.result = Some(serde_json::from_slice(body)?);
        Ok(())
    }

    fn is_read_request(&self) -> bool {
        true
    }
}
