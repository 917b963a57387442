//! The document session: a unit of work over one database

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::commands::{BatchCommand, BatchCommandData, GetDocumentsCommand};
use crate::http::request_executor::{RequestExecutor, SessionInfo};
use crate::session::cluster_transactions::{
    ClusterTransactions, CompareExchangeSessionValue, CompareExchangeValueState,
};
use crate::session::document_info::DocumentInfo;
use crate::session::lazy::PendingLazyOperation;
use crate::session::{SessionOptions, TransactionMode};
use crate::{Error, Result};

static SESSION_IDS: AtomicU64 = AtomicU64::new(1);

/// What a batch slot corresponds to, for positional result application
enum PlannedAction {
    DeleteDocument(String),
    PutDocument(String),
    PutCompareExchange(String),
    DeleteCompareExchange(String),
}

/// A unit of work against one database.
///
/// Tracks loaded and stored entities, resolves repeat loads locally, and
/// persists the net diff as a single batch on [`save_changes`]. Sessions are
/// single-owner and must not be shared across tasks; the executor behind them
/// is the shared, thread-safe piece.
///
/// [`save_changes`]: DocumentSession::save_changes
pub struct DocumentSession {
    executor: Arc<RequestExecutor>,
    session_info: SessionInfo,
    mode: TransactionMode,
    documents_by_id: HashMap<String, DocumentInfo>,
    /// Tracking order, so batches are composed deterministically
    documents_order: Vec<String>,
    /// Ids queued for deletion, in registration order
    deleted_ids: Vec<String>,
    known_missing: HashSet<String>,
    /// Compare-exchange values tracked by this session (ClusterWide only)
    pub(crate) cx_values: HashMap<String, CompareExchangeSessionValue>,
    pub(crate) cx_order: Vec<String>,
    pending_lazy: Vec<Box<dyn PendingLazyOperation>>,
    number_of_requests: usize,
}

impl DocumentSession {
    /// Open a session over a shared executor
    pub fn new(executor: Arc<RequestExecutor>, options: SessionOptions) -> Self {
        let session_info = SessionInfo {
            session_id: SESSION_IDS.fetch_add(1, Ordering::Relaxed),
            aggressive_cache: options.aggressive_cache,
            no_caching: options.no_caching,
        };
        Self {
            executor,
            session_info,
            mode: options.transaction_mode,
            documents_by_id: HashMap::new(),
            documents_order: Vec::new(),
            deleted_ids: Vec::new(),
            known_missing: HashSet::new(),
            cx_values: HashMap::new(),
            cx_order: Vec::new(),
            pending_lazy: Vec::new(),
            number_of_requests: 0,
        }
    }

    /// The executor this session issues requests through
    pub fn executor(&self) -> &Arc<RequestExecutor> {
        &self.executor
    }

    /// Transaction mode the session was opened with
    pub fn transaction_mode(&self) -> TransactionMode {
        self.mode
    }

    /// Server round trips this session has caused (cache-served responses
    /// excluded)
    pub fn number_of_requests(&self) -> usize {
        self.number_of_requests
    }

    /// Whether `id` is currently tracked
    pub fn is_loaded(&self, id: &str) -> bool {
        self.documents_by_id.contains_key(id)
    }

    /// Whether `id` was deleted in this session and not yet saved
    pub fn is_deleted(&self, id: &str) -> bool {
        self.deleted_ids.iter().any(|d| d == id)
    }

    /// Compare-exchange facade; requires a ClusterWide session
    pub fn cluster_transactions(&mut self) -> Result<ClusterTransactions<'_>> {
        if self.mode != TransactionMode::ClusterWide {
            return Err(Error::IllegalState(
                "compare-exchange operations require a session opened with \
                 TransactionMode::ClusterWide"
                    .to_string(),
            ));
        }
        Ok(ClusterTransactions::new(self))
    }

    /// Load one document, resolving from session state when possible
    pub async fn load<T: DeserializeOwned>(&mut self, id: &str) -> Result<Option<T>> {
        let mut result = self.load_many(&[id]).await?;
        Ok(result.remove(id).flatten())
    }

    /// Load many documents in at most one round trip.
    ///
    /// Ids already tracked or known missing never touch the network; the rest
    /// go out as a single batched fetch.
    pub async fn load_many<T: DeserializeOwned>(
        &mut self,
        ids: &[&str],
    ) -> Result<HashMap<String, Option<T>>> {
        let mut results: HashMap<String, Option<T>> = HashMap::new();
        let mut to_fetch: Vec<String> = Vec::new();

        for &id in ids {
            if id.is_empty() {
                return Err(Error::IllegalArgument("document id is empty".to_string()));
            }
            if let Some(info) = self.documents_by_id.get(id) {
                results.insert(id.to_string(), Some(serde_json::from_value(
                    info.entity.clone(),
                )?));
            } else if self.known_missing.contains(id) {
                results.insert(id.to_string(), None);
            } else if !to_fetch.contains(&id.to_string()) {
                to_fetch.push(id.to_string());
            }
        }

        if to_fetch.is_empty() {
            debug!("load resolved entirely from session state");
            return Ok(results);
        }

        let mut command = GetDocumentsCommand::new(to_fetch.clone());
        self.execute(&mut command).await?;
        let fetched = command.into_result();

        for (id, doc) in to_fetch.iter().zip(fetched.results) {
            if doc.is_null() {
                self.known_missing.insert(id.clone());
                results.insert(id.clone(), None);
            } else {
                let info = self.track_document(doc)?;
                results.insert(id.clone(), Some(serde_json::from_value(info.entity.clone())?));
            }
        }

        Ok(results)
    }

    /// Whether a document exists, using tracked state before the network
    pub async fn exists(&mut self, id: &str) -> Result<bool> {
        Ok(self.load::<Value>(id).await?.is_some())
    }

    /// Store an entity under `id`, or under a generated id when `None`.
    ///
    /// Calling `store` again with the same id refreshes the session's view of
    /// the entity; the diff against the last saved snapshot decides whether
    /// anything is actually written.
    pub fn store<T: Serialize>(&mut self, entity: &T, id: Option<&str>) -> Result<String> {
        let value = serde_json::to_value(entity)?;
        if !value.is_object() {
            return Err(Error::IllegalArgument(
                "only JSON objects can be stored as documents".to_string(),
            ));
        }

        let id = match id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => self.generate_id(),
        };

        // Storing after a delete cancels the delete: last intent wins.
        self.deleted_ids.retain(|d| d != &id);
        self.known_missing.remove(&id);

        match self.documents_by_id.get_mut(&id) {
            Some(info) => {
                info.entity = value;
            }
            None => {
                debug!(id = %id, "tracking new entity");
                self.documents_by_id
                    .insert(id.clone(), DocumentInfo::new_entity(id.clone(), value));
                self.documents_order.push(id.clone());
            }
        }
        Ok(id)
    }

    /// Queue a document for deletion.
    ///
    /// An entity that was never persisted is simply dropped from tracking;
    /// anything else becomes a guarded DELETE in the next batch.
    pub fn delete(&mut self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::IllegalArgument("document id is empty".to_string()));
        }

        if let Some(info) = self.documents_by_id.get(id) {
            if info.new_document {
                debug!(id = %id, "dropping never-persisted entity");
                self.documents_by_id.remove(id);
                self.documents_order.retain(|d| d != id);
                return Ok(());
            }
        }

        if !self.is_deleted(id) {
            self.deleted_ids.push(id.to_string());
        }
        Ok(())
    }

    /// Persist every pending change as one batch.
    ///
    /// Nothing dirty means no network call at all; calling this twice without
    /// intervening mutation is free the second time.
    pub async fn save_changes(&mut self) -> Result<()> {
        let (commands, plan) = self.build_batch()?;
        if commands.is_empty() {
            debug!("save_changes: nothing to do");
            return Ok(());
        }

        info!(commands = commands.len(), "saving session changes");
        let mut batch = BatchCommand::new(commands, self.mode);
        self.execute(&mut batch).await?;

        let results = batch.results();
        if results.len() != plan.len() {
            return Err(Error::IllegalState(format!(
                "batch returned {} results for {} commands",
                results.len(),
                plan.len()
            )));
        }

        for (action, result) in plan.iter().zip(results) {
            match action {
                PlannedAction::DeleteDocument(id) => {
                    self.documents_by_id.remove(id);
                    self.documents_order.retain(|d| d != id);
                    self.known_missing.insert(id.clone());
                }
                PlannedAction::PutDocument(id) => {
                    if let Some(info) = self.documents_by_id.get_mut(id) {
                        info.on_saved(result.change_vector.clone());
                    }
                }
                PlannedAction::PutCompareExchange(key) => {
                    if let Some(entry) = self.cx_values.get_mut(key) {
                        entry.index = result.index.unwrap_or(entry.index);
                        entry.state = CompareExchangeValueState::Loaded;
                    }
                }
                PlannedAction::DeleteCompareExchange(key) => {
                    if let Some(entry) = self.cx_values.get_mut(key) {
                        entry.index = -1;
                        entry.value = None;
                        // Stays tombstoned; re-creating the key in this
                        // session requires clear().
                        entry.state = CompareExchangeValueState::Deleted;
                    }
                }
            }
        }

        self.deleted_ids.clear();
        Ok(())
    }

    /// Compose the batch: deletes first, then puts, then compare-exchange
    /// ops, each group in registration order. Per-id conflicts were already
    /// resolved at registration time (last intent wins).
    fn build_batch(&self) -> Result<(Vec<BatchCommandData>, Vec<PlannedAction>)> {
        let mut commands = Vec::new();
        let mut plan = Vec::new();
        let optimistic = self.executor.conventions().use_optimistic_concurrency;

        for id in &self.deleted_ids {
            let change_vector = self
                .documents_by_id
                .get(id)
                .and_then(|info| info.change_vector.clone())
                .filter(|_| optimistic);
            commands.push(BatchCommandData::Delete {
                id: id.clone(),
                change_vector,
            });
            plan.push(PlannedAction::DeleteDocument(id.clone()));
        }

        for id in &self.documents_order {
            if self.is_deleted(id) {
                continue;
            }
            let Some(info) = self.documents_by_id.get(id) else {
                continue;
            };
            if !info.is_dirty() {
                continue;
            }
            commands.push(BatchCommandData::Put {
                id: id.clone(),
                change_vector: info.change_vector.clone().filter(|_| optimistic),
                document: info.entity.clone(),
            });
            plan.push(PlannedAction::PutDocument(id.clone()));
        }

        for key in &self.cx_order {
            let Some(entry) = self.cx_values.get(key) else {
                continue;
            };
            match entry.state {
                CompareExchangeValueState::New => {
                    commands.push(BatchCommandData::CompareExchangePut {
                        key: key.clone(),
                        index: entry.index,
                        value: entry.value.clone().unwrap_or(Value::Null),
                    });
                    plan.push(PlannedAction::PutCompareExchange(key.clone()));
                }
                CompareExchangeValueState::Deleted if entry.index >= 0 => {
                    commands.push(BatchCommandData::CompareExchangeDelete {
                        key: key.clone(),
                        index: entry.index,
                    });
                    plan.push(PlannedAction::DeleteCompareExchange(key.clone()));
                }
                _ => {}
            }
        }

        Ok((commands, plan))
    }

    /// Track a document the server returned; replaces nothing already tracked
    pub(crate) fn track_document(&mut self, document: Value) -> Result<&DocumentInfo> {
        let metadata = document.get("@metadata").cloned().unwrap_or(Value::Null);
        let id = metadata
            .get("@id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                Error::Serialization("document is missing @metadata.@id".to_string())
            })?
            .to_string();
        let change_vector = metadata
            .get("@change-vector")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        self.known_missing.remove(&id);
        if !self.documents_by_id.contains_key(&id) {
            self.documents_by_id.insert(
                id.clone(),
                DocumentInfo::from_server(id.clone(), change_vector, document),
            );
            self.documents_order.push(id.clone());
        }
        // A session returns the instance it already tracks for a given id.
        Ok(&self.documents_by_id[&id])
    }

    /// Stop tracking one document
    pub fn evict(&mut self, id: &str) {
        self.documents_by_id.remove(id);
        self.documents_order.retain(|d| d != id);
        self.deleted_ids.retain(|d| d != id);
        self.known_missing.remove(id);
    }

    /// Drop all session state: tracked documents, pending deletes, missing
    /// markers, compare-exchange values, and queued lazy operations
    pub fn clear(&mut self) {
        self.documents_by_id.clear();
        self.documents_order.clear();
        self.deleted_ids.clear();
        self.known_missing.clear();
        self.cx_values.clear();
        self.cx_order.clear();
        self.pending_lazy.clear();
    }

    /// Queue a lazy operation (see `session::lazy`)
    pub(crate) fn add_lazy_operation(&mut self, op: Box<dyn PendingLazyOperation>) {
        self.pending_lazy.push(op);
    }

    pub(crate) fn take_lazy_operations(&mut self) -> Vec<Box<dyn PendingLazyOperation>> {
        std::mem::take(&mut self.pending_lazy)
    }

    pub(crate) fn has_pending_lazy_operations(&self) -> bool {
        !self.pending_lazy.is_empty()
    }

    /// Session-local view used by lazy ops to resolve without the network
    pub(crate) fn local_document(&self, id: &str) -> Option<&Value> {
        self.documents_by_id.get(id).map(|info| &info.entity)
    }

    pub(crate) fn is_known_missing(&self, id: &str) -> bool {
        self.known_missing.contains(id)
    }

    pub(crate) fn mark_known_missing(&mut self, id: &str) {
        self.known_missing.insert(id.to_string());
    }

    /// Run a command through the shared executor, enforcing the session
    /// request budget and counting only real server round trips
    pub(crate) async fn execute<C: crate::http::Command>(&mut self, command: &mut C) -> Result<()> {
        let budget = self
            .executor
            .conventions()
            .max_number_of_requests_per_session;
        if self.number_of_requests >= budget {
            // An aggressive-window serve costs no round trip, so it stays
            // available after the budget is spent.
            if self.executor.try_serve_from_cache(command, &self.session_info)? {
                return Ok(());
            }
            return Err(Error::IllegalState(format!(
                "session exceeded its request budget of {} (is this an N+1 access pattern?)",
                budget
            )));
        }

        let outcome = self.executor.execute(command, &self.session_info).await?;
        if !outcome.from_cache {
            self.number_of_requests += 1;
        }
        Ok(())
    }

    fn generate_id(&self) -> String {
        let prefix = self.executor.conventions().id_prefix_for(None);
        format!("{}{}", prefix, uuid::Uuid::new_v4())
    }
}
