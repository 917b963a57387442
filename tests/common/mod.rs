//! Miniature Vellum server used by the integration tests
//!
//! Implements just enough of the wire protocol for the client to exercise
//! topology discovery, document loads with change-vector revalidation,
//! batched writes, multi-get, and compare-exchange. Several nodes can be
//! spawned over one shared state to simulate a cluster.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::RwLock;
use serde_json::{json, Value};

/// Shared cluster state: every spawned node serves the same data
pub struct VellumState {
    docs: RwLock<HashMap<String, StoredDoc>>,
    cmpxchg: RwLock<HashMap<String, (i64, Value)>>,
    topology_urls: RwLock<Vec<String>>,
    etag: AtomicI64,
    /// Document GETs answered with a full body (304s excluded)
    pub docs_served: AtomicU64,
    /// Document GETs answered with 304 Not Modified
    pub not_modified_served: AtomicU64,
    /// multi_get batch calls received
    pub multi_gets: AtomicU64,
    /// Inner multi_get items answered with 304 Not Modified
    pub inner_not_modified: AtomicU64,
    /// bulk_docs batch calls received
    pub bulk_docs_calls: AtomicU64,
    /// Standalone cmpxchg calls received
    pub cmpxchg_calls: AtomicU64,
    /// Topology fetches received
    pub topology_fetches: AtomicU64,
    /// Remaining document GETs to answer with 421 Misdirected Request
    pub misdirect_docs: AtomicU64,
    /// Artificial delay applied to multi_get handling, in milliseconds
    pub multi_get_delay_ms: AtomicU64,
}

#[derive(Clone)]
struct StoredDoc {
    change_vector: String,
    body: Value,
}

/// Install a test subscriber once so RUST_LOG works under `cargo test`
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl VellumState {
    pub fn new() -> Arc<Self> {
        init_tracing();
        Arc::new(Self {
            docs: RwLock::new(HashMap::new()),
            cmpxchg: RwLock::new(HashMap::new()),
            topology_urls: RwLock::new(Vec::new()),
            etag: AtomicI64::new(0),
            docs_served: AtomicU64::new(0),
            not_modified_served: AtomicU64::new(0),
            multi_gets: AtomicU64::new(0),
            inner_not_modified: AtomicU64::new(0),
            bulk_docs_calls: AtomicU64::new(0),
            cmpxchg_calls: AtomicU64::new(0),
            topology_fetches: AtomicU64::new(0),
            misdirect_docs: AtomicU64::new(0),
            multi_get_delay_ms: AtomicU64::new(0),
        })
    }

    /// Set the node urls reported by the topology endpoint
    pub fn set_topology(&self, urls: Vec<String>) {
        *self.topology_urls.write() = urls;
    }

    /// Seed a document directly, bypassing the client
    pub fn put_doc(&self, id: &str, mut body: Value) -> String {
        let change_vector = self.next_change_vector();
        body["@metadata"] = json!({"@id": id, "@change-vector": change_vector});
        self.docs.write().insert(
            id.to_string(),
            StoredDoc {
                change_vector: change_vector.clone(),
                body,
            },
        );
        change_vector
    }

    /// Read a document's raw body, bypassing the client
    pub fn raw_doc(&self, id: &str) -> Option<Value> {
        self.docs.read().get(id).map(|d| d.body.clone())
    }

    /// Read a compare-exchange entry, bypassing the client
    pub fn raw_cmpxchg(&self, key: &str) -> Option<(i64, Value)> {
        self.cmpxchg.read().get(key).cloned()
    }

    fn next_change_vector(&self) -> String {
        format!("A:{}-test", self.etag.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn next_index(&self) -> i64 {
        self.etag.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Spawn one node over the shared state; returns its base url
pub async fn spawn_node(state: Arc<VellumState>) -> String {
    let router = Router::new()
        .route("/topology", get(get_topology))
        .route("/databases/:db/docs", get(get_docs))
        .route("/databases/:db/bulk_docs", post(bulk_docs))
        .route("/databases/:db/multi_get", post(multi_get))
        .route(
            "/databases/:db/cmpxchg",
            get(cmpxchg_get).put(cmpxchg_put).delete(cmpxchg_delete),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test server");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("test server");
    });
    format!("http://{}", addr)
}

/// A url that refuses connections (bound then dropped)
pub async fn dead_node_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind throwaway listener");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("http://{}", addr)
}

fn parse_query(query: &Option<String>, name: &str) -> Vec<String> {
    let Some(query) = query else {
        return Vec::new();
    };
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(k, _)| *k == name)
        .map(|(_, v)| percent_decode(v))
        .collect()
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(b) = u8::from_str_radix(&raw[i + 1..i + 3], 16) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

async fn get_topology(State(state): State<Arc<VellumState>>) -> Json<Value> {
    state.topology_fetches.fetch_add(1, Ordering::SeqCst);
    let urls = state.topology_urls.read().clone();
    let nodes: Vec<Value> = urls
        .iter()
        .enumerate()
        .map(|(i, url)| {
            json!({
                "Url": url,
                "Database": "db",
                "ClusterTag": ((b'A' + i as u8) as char).to_string(),
                "ServerRole": "Member",
            })
        })
        .collect();
    Json(json!({"Etag": 1, "Nodes": nodes}))
}

async fn get_docs(
    State(state): State<Arc<VellumState>>,
    Path(_db): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    if state.misdirect_docs.load(Ordering::SeqCst) > 0 {
        state.misdirect_docs.fetch_sub(1, Ordering::SeqCst);
        return (
            StatusCode::MISDIRECTED_REQUEST,
            Json(json!({
                "Type": "Vellum.Server.DatabaseTopologyStaleException",
                "Message": "node topology etag is behind the cluster",
            })),
        )
            .into_response();
    }

    let ids = parse_query(&query, "id");
    let docs = state.docs.read();

    // Single-document reads participate in change-vector revalidation.
    if ids.len() == 1 {
        if let Some(doc) = docs.get(&ids[0]) {
            let if_none_match = headers
                .get("If-None-Match")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim_matches('"'));
            if if_none_match == Some(doc.change_vector.as_str()) {
                state.not_modified_served.fetch_add(1, Ordering::SeqCst);
                return StatusCode::NOT_MODIFIED.into_response();
            }
            state.docs_served.fetch_add(1, Ordering::SeqCst);
            return (
                [("ETag", doc.change_vector.clone())],
                Json(json!({"Results": [doc.body]})),
            )
                .into_response();
        }
        state.docs_served.fetch_add(1, Ordering::SeqCst);
        return StatusCode::NOT_FOUND.into_response();
    }

    state.docs_served.fetch_add(1, Ordering::SeqCst);
    let results: Vec<Value> = ids
        .iter()
        .map(|id| docs.get(id).map(|d| d.body.clone()).unwrap_or(Value::Null))
        .collect();
    Json(json!({"Results": results})).into_response()
}

fn concurrency_error(id: &str) -> Response {
    (
        StatusCode::CONFLICT,
        Json(json!({
            "Type": "Vellum.Server.ConcurrencyException",
            "Message": format!("change vector mismatch on '{}'", id),
            "Id": id,
        })),
    )
        .into_response()
}

fn cmpxchg_conflict(key: &str) -> Response {
    (
        StatusCode::CONFLICT,
        Json(json!({
            "Type": "Vellum.Server.ClusterTransactionConcurrencyException",
            "Message": format!("compare-exchange index mismatch on '{}'", key),
            "Key": key,
        })),
    )
        .into_response()
}

async fn bulk_docs(
    State(state): State<Arc<VellumState>>,
    Path(_db): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    state.bulk_docs_calls.fetch_add(1, Ordering::SeqCst);
    let commands = body["Commands"].as_array().cloned().unwrap_or_default();

    // Validate the whole batch before applying anything.
    {
        let docs = state.docs.read();
        let cmpxchg = state.cmpxchg.read();
        for command in &commands {
            let kind = command["Type"].as_str().unwrap_or_default();
            match kind {
                "PUT" | "DELETE" => {
                    let id = command["Id"].as_str().unwrap_or_default();
                    if let Some(expected) = command["ChangeVector"].as_str() {
                        match docs.get(id) {
                            Some(doc) if doc.change_vector == expected => {}
                            _ => return concurrency_error(id),
                        }
                    }
                }
                "CompareExchangePUT" | "CompareExchangeDELETE" => {
                    let key = command["Key"].as_str().unwrap_or_default();
                    let expected = command["Index"].as_i64().unwrap_or_default();
                    match cmpxchg.get(key) {
                        Some((current, _)) if *current == expected => {}
                        None if expected == 0 => {}
                        _ => return cmpxchg_conflict(key),
                    }
                }
                _ => {
                    return (
                        StatusCode::BAD_REQUEST,
                        Json(json!({
                            "Type": "Vellum.Server.BadRequestException",
                            "Message": format!("unknown command type '{}'", kind),
                        })),
                    )
                        .into_response()
                }
            }
        }
    }

    let mut results = Vec::with_capacity(commands.len());
    for command in &commands {
        let kind = command["Type"].as_str().unwrap_or_default();
        match kind {
            "PUT" => {
                let id = command["Id"].as_str().unwrap_or_default();
                let mut document = command["Document"].clone();
                let change_vector = state.next_change_vector();
                document["@metadata"] =
                    json!({"@id": id, "@change-vector": change_vector});
                state.docs.write().insert(
                    id.to_string(),
                    StoredDoc {
                        change_vector: change_vector.clone(),
                        body: document,
                    },
                );
                results.push(json!({
                    "Type": "PUT",
                    "Id": id,
                    "ChangeVector": change_vector,
                }));
            }
            "DELETE" => {
                let id = command["Id"].as_str().unwrap_or_default();
                state.docs.write().remove(id);
                results.push(json!({"Type": "DELETE", "Id": id}));
            }
            "CompareExchangePUT" => {
                let key = command["Key"].as_str().unwrap_or_default();
                let index = state.next_index();
                state
                    .cmpxchg
                    .write()
                    .insert(key.to_string(), (index, command["Value"].clone()));
                results.push(json!({
                    "Type": "CompareExchangePUT",
                    "Key": key,
                    "Index": index,
                }));
            }
            "CompareExchangeDELETE" => {
                let key = command["Key"].as_str().unwrap_or_default();
                state.cmpxchg.write().remove(key);
                results.push(json!({
                    "Type": "CompareExchangeDELETE",
                    "Key": key,
                    "Index": -1,
                }));
            }
            _ => unreachable!("validated above"),
        }
    }

    Json(json!({"Results": results})).into_response()
}

async fn multi_get(
    State(state): State<Arc<VellumState>>,
    Path(_db): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    state.multi_gets.fetch_add(1, Ordering::SeqCst);
    let delay = state.multi_get_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
    }
    let requests = body["Requests"].as_array().cloned().unwrap_or_default();
    let docs = state.docs.read();

    let results: Vec<Value> = requests
        .iter()
        .map(|request| {
            let query = request["Query"].as_str().unwrap_or_default().to_string();
            let ids = parse_query(&Some(query.trim_start_matches('?').to_string()), "id");

            if ids.len() == 1 {
                if let Some(doc) = docs.get(&ids[0]) {
                    let if_none_match = request["Headers"]["If-None-Match"]
                        .as_str()
                        .map(|v| v.trim_matches('"'));
                    if if_none_match == Some(doc.change_vector.as_str()) {
                        state.inner_not_modified.fetch_add(1, Ordering::SeqCst);
                        return json!({
                            "Result": Value::Null,
                            "StatusCode": 304,
                            "Headers": {},
                        });
                    }
                    return json!({
                        "Result": {"Results": [doc.body]},
                        "StatusCode": 200,
                        "Headers": {"ETag": doc.change_vector},
                    });
                }
                return json!({
                    "Result": Value::Null,
                    "StatusCode": 404,
                    "Headers": {},
                });
            }

            let inner: Vec<Value> = ids
                .iter()
                .map(|id| docs.get(id).map(|d| d.body.clone()).unwrap_or(Value::Null))
                .collect();
            json!({
                "Result": {"Results": inner},
                "StatusCode": 200,
                "Headers": {},
            })
        })
        .collect();

    Json(json!({"Results": results})).into_response()
}

async fn cmpxchg_get(
    State(state): State<Arc<VellumState>>,
    Path(_db): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    state.cmpxchg_calls.fetch_add(1, Ordering::SeqCst);
    let keys = parse_query(&query, "key");
    let cmpxchg = state.cmpxchg.read();

    let results: Vec<Value> = keys
        .iter()
        .filter_map(|key| {
            cmpxchg
                .get(key)
                .map(|(index, value)| json!({"Key": key, "Index": index, "Value": value}))
        })
        .collect();
    Json(json!({"Results": results})).into_response()
}

async fn cmpxchg_put(
    State(state): State<Arc<VellumState>>,
    Path(_db): Path<String>,
    RawQuery(query): RawQuery,
    Json(body): Json<Value>,
) -> Response {
    state.cmpxchg_calls.fetch_add(1, Ordering::SeqCst);
    let key = parse_query(&query, "key").pop().unwrap_or_default();
    let expected = parse_query(&query, "index")
        .pop()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or_default();

    let mut cmpxchg = state.cmpxchg.write();
    let matches = match cmpxchg.get(&key) {
        Some((current, _)) => *current == expected,
        None => expected == 0,
    };
    if !matches {
        return cmpxchg_conflict(&key);
    }

    let index = state.next_index();
    let value = body["Value"].clone();
    cmpxchg.insert(key.clone(), (index, value.clone()));
    Json(json!({"Index": index, "Successful": true, "Value": value})).into_response()
}

async fn cmpxchg_delete(
    State(state): State<Arc<VellumState>>,
    Path(_db): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    state.cmpxchg_calls.fetch_add(1, Ordering::SeqCst);
    let key = parse_query(&query, "key").pop().unwrap_or_default();
    let expected = parse_query(&query, "index")
        .pop()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or_default();

    let mut cmpxchg = state.cmpxchg.write();
    match cmpxchg.get(&key) {
        Some((current, _)) if *current == expected => {
            cmpxchg.remove(&key);
            Json(json!({"Index": -1, "Successful": true, "Value": Value::Null})).into_response()
        }
        Some(_) => cmpxchg_conflict(&key),
        None => {
            Json(json!({"Index": -1, "Successful": true, "Value": Value::Null})).into_response()
        }
    }
}
