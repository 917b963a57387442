//! Multi-get command: many reads in one round trip
//!
//! The lazy-operation machinery funnels every pending read into a single
//! `POST /databases/{db}/multi_get` whose response array matches the request
//! array positionally. Each inner request participates in the HTTP cache the
//! same way a standalone read would: `If-None-Match` on the way out, per-item
//! `304` served from cache on the way back.

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::http::cache::HttpCache;
use crate::http::commands::{Command, HttpRequest};
use crate::http::topology::ServerNode;
use crate::Result;

/// One inner request of a multi-get batch
#[derive(Debug, Clone, Serialize)]
pub struct GetRequest {
    /// Path relative to the node url, e.g. `/databases/db/docs`
    #[serde(rename = "Url")]
    pub url: String,
    /// Query string including the leading `?`
    #[serde(rename = "Query", default)]
    pub query: String,
    /// HTTP method of the inner request
    #[serde(rename = "Method")]
    pub method: String,
    /// Extra headers for the inner request
    #[serde(rename = "Headers", default)]
    pub headers: HashMap<String, String>,
    /// JSON body for inner POSTs
    #[serde(rename = "Content", skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

impl GetRequest {
    /// A bodyless inner GET
    pub fn get(url: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: query.into(),
            method: "GET".to_string(),
            headers: HashMap::new(),
            content: None,
        }
    }

    /// Cache key for this inner request (relative url; change vectors make
    /// the entry node-independent)
    pub fn cache_key(&self) -> String {
        format!("{}{}", self.url, self.query)
    }
}

/// One inner response, positionally matched to its request
#[derive(Debug, Clone)]
pub struct GetResponse {
    /// Parsed JSON result (`Null` for missing documents)
    pub result: Value,
    /// Inner status code
    pub status_code: u16,
    /// Inner response headers
    pub headers: HashMap<String, String>,
    /// True when the result was served from the HTTP cache
    pub from_cache: bool,
    /// Set when a 304 arrived but the cached entry had been evicted in the
    /// meantime; the operation must be retried
    pub force_retry: bool,
}

impl GetResponse {
    /// Whether the inner request failed at the application level
    pub fn is_error(&self) -> bool {
        self.status_code >= 400 && self.status_code != 404
    }
}

#[derive(Serialize)]
struct MultiGetRequestBody<'a> {
    #[serde(rename = "Requests")]
    requests: Vec<WireRequest<'a>>,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    #[serde(rename = "Url")]
    url: &'a str,
    #[serde(rename = "Query")]
    query: &'a str,
    #[serde(rename = "Method")]
    method: &'a str,
    #[serde(rename = "Headers")]
    headers: HashMap<String, String>,
    #[serde(rename = "Content", skip_serializing_if = "Option::is_none")]
    content: Option<&'a Value>,
}

#[derive(Deserialize, Default)]
struct MultiGetResponseBody {
    #[serde(rename = "Results", default)]
    results: Vec<WireResponse>,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(rename = "Result", default)]
    result: Value,
    #[serde(rename = "StatusCode")]
    status_code: u16,
    #[serde(rename = "Headers", default)]
    headers: HashMap<String, String>,
}

/// `POST /databases/{db}/multi_get` — run many inner reads in one round trip
pub struct MultiGetCommand {
    cache: Arc<HttpCache>,
    requests: Vec<GetRequest>,
    responses: Vec<GetResponse>,
}

impl MultiGetCommand {
    pub fn new(cache: Arc<HttpCache>, requests: Vec<GetRequest>) -> Self {
        Self {
            cache,
            requests,
            responses: Vec::new(),
        }
    }

    /// Positional responses, one per inner request
    pub fn responses(&self) -> &[GetResponse] {
        &self.responses
    }
}

impl Command for MultiGetCommand {
    fn create_request(&self, node: &ServerNode) -> Result<HttpRequest> {
        let url = format!("{}/databases/{}/multi_get", node.url, node.database);

        let requests = self
            .requests
            .iter()
            .map(|r| {
                let mut headers = r.headers.clone();
                if let Some(item) = self.cache.get(&r.cache_key()) {
                    if let Some(change_vector) = item.change_vector {
                        headers.insert("If-None-Match".to_string(), change_vector);
                    }
                }
                WireRequest {
                    url: &r.url,
                    query: &r.query,
                    method: &r.method,
                    headers,
                    content: r.content.as_ref(),
                }
            })
            .collect();

        let body = serde_json::to_vec(&MultiGetRequestBody { requests })?;
        Ok(HttpRequest::json(Method::POST, url, body))
    }

    fn set_response(&mut self, body: &[u8], _from_cache: bool) -> Result<()> {
        let parsed: MultiGetResponseBody = serde_json::from_slice(body)?;
        let mut responses = Vec::with_capacity(parsed.results.len());

        for (request, wire) in self.requests.iter().zip(parsed.results) {
            let key = request.cache_key();
            let mut response = GetResponse {
                result: wire.result,
                status_code: wire.status_code,
                headers: wire.headers,
                from_cache: false,
                force_retry: false,
            };

            if response.status_code == 304 {
                match self.cache.get(&key) {
                    Some(item) if !item.is_not_found() => {
                        response.result = serde_json::from_slice(&item.body)?;
                        response.from_cache = true;
                    }
                    Some(_) => {
                        response.result = Value::Null;
                        response.from_cache = true;
                    }
                    // Evicted between building the request and handling the
                    // response; the caller re-runs this item.
                    None => response.force_retry = true,
                }
            } else if response.status_code == 404 {
                self.cache.set_not_found(&key, false);
                response.result = Value::Null;
            } else if let Some(change_vector) = response.headers.get("ETag") {
                let raw = serde_json::to_vec(&response.result)?;
                self.cache
                    .set(&key, change_vector.trim_matches('"'), raw.into());
            }

            responses.push(response);
        }

        self.responses = responses;
        Ok(())
    }

    // The batch mutates nothing, but its aggregate response must not be
    // cached wholesale; caching happens per inner item above.
    fn is_read_request(&self) -> bool {
        true
    }

    fn can_cache(&self) -> bool {
        false
    }
}
