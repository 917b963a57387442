//! Lazy operations and multi-get coalescing
//!
//! A lazy call registers a pending operation on the session and hands back a
//! [`Lazy`] handle. Nothing touches the network until a handle's value is
//! first requested; at that point the *entire* pending queue is flushed as
//! one multi-get, so N independent lazy reads cost one round trip.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::commands::{GetDocumentsCommand, GetRequest, GetResponse, MultiGetCommand};
use crate::session::document_session::DocumentSession;
use crate::{Error, Result};

/// Upper bound on revalidation rounds for one flush of the lazy queue.
/// Retries only happen on cache-eviction races, which cannot pile up.
const MAX_LAZY_ROUNDS: usize = 32;

/// A deferred read queued on a session.
///
/// Implementations build one inner multi-get request, consume the positional
/// response, and may ask for another round when a cache race invalidated
/// their answer.
pub trait PendingLazyOperation {
    /// Resolve from session-local state; `true` means no request is needed
    fn try_resolve_local(&mut self, session: &DocumentSession) -> bool;

    /// The inner request this operation contributes to the batch
    fn create_request(&self) -> GetRequest;

    /// Consume this operation's positional response
    fn handle_response(
        &mut self,
        response: &GetResponse,
        session: &mut DocumentSession,
    ) -> Result<()>;

    /// Whether the last response requires re-running this operation
    fn requires_retry(&self) -> bool;
}

/// Shared slot a lazy operation fills with its raw JSON result
pub(crate) type LazySlot = Rc<RefCell<Option<Value>>>;

/// A memoized deferred value.
///
/// The first `value` call flushes every pending lazy operation on the
/// session; later calls return the memoized result without I/O.
pub struct Lazy<T> {
    slot: LazySlot,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Lazy<T> {
    pub(crate) fn new(slot: LazySlot) -> Self {
        Self {
            slot,
            _marker: PhantomData,
        }
    }

    /// Whether the value has already been materialized
    pub fn is_materialized(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Get the value, flushing the session's whole lazy queue if needed
    pub async fn value(&self, session: &mut DocumentSession) -> Result<T> {
        if self.slot.borrow().is_none() {
            session.execute_all_pending_lazy_operations().await?;
        }
        let guard = self.slot.borrow();
        let raw = guard.as_ref().ok_or_else(|| {
            Error::IllegalState("lazy value was not materialized by the batch".to_string())
        })?;
        Ok(serde_json::from_value(raw.clone())?)
    }
}

/// Lazy single-document load
struct LazyLoadOperation {
    id: String,
    slot: LazySlot,
    retry: bool,
}

impl PendingLazyOperation for LazyLoadOperation {
    fn try_resolve_local(&mut self, session: &DocumentSession) -> bool {
        if let Some(entity) = session.local_document(&self.id) {
            *self.slot.borrow_mut() = Some(entity.clone());
            return true;
        }
        if session.is_known_missing(&self.id) {
            *self.slot.borrow_mut() = Some(Value::Null);
            return true;
        }
        false
    }

    fn create_request(&self) -> GetRequest {
        GetRequest::get(
            "/docs".to_string(),
            GetDocumentsCommand::query_string(std::slice::from_ref(&self.id)),
        )
    }

    fn handle_response(
        &mut self,
        response: &GetResponse,
        session: &mut DocumentSession,
    ) -> Result<()> {
        self.retry = response.force_retry;
        if self.retry {
            return Ok(());
        }

        let document = response
            .result
            .get("Results")
            .and_then(|r| r.get(0))
            .cloned()
            .unwrap_or(Value::Null);

        if document.is_null() {
            session.mark_known_missing(&self.id);
            *self.slot.borrow_mut() = Some(Value::Null);
        } else {
            let info = session.track_document(document)?;
            *self.slot.borrow_mut() = Some(info.entity.clone());
        }
        Ok(())
    }

    fn requires_retry(&self) -> bool {
        self.retry
    }
}

impl DocumentSession {
    /// Register a deferred load; no network traffic happens until the
    /// returned handle (or any other lazy handle) is first evaluated
    pub fn lazily_load<T: DeserializeOwned>(&mut self, id: &str) -> Lazy<Option<T>> {
        let slot: LazySlot = Rc::new(RefCell::new(None));
        let mut op = LazyLoadOperation {
            id: id.to_string(),
            slot: slot.clone(),
            retry: false,
        };
        // Already-tracked ids resolve immediately and never enter the queue.
        if !op.try_resolve_local(self) {
            self.add_lazy_operation(Box::new(op));
        }
        Lazy::new(slot)
    }

    /// Flush the entire pending lazy queue.
    ///
    /// All pending operations are sent as one multi-get; operations reporting
    /// a cache race are re-sent as a shrinking subset until the batch settles.
    pub async fn execute_all_pending_lazy_operations(&mut self) -> Result<()> {
        let mut ops = self.take_lazy_operations();
        ops.retain_mut(|op| !op.try_resolve_local(self));
        if ops.is_empty() {
            return Ok(());
        }

        let mut rounds = 0;
        while !ops.is_empty() {
            rounds += 1;
            if rounds > MAX_LAZY_ROUNDS {
                return Err(Error::IllegalState(format!(
                    "lazy batch did not settle after {} rounds",
                    MAX_LAZY_ROUNDS
                )));
            }

            debug!(pending = ops.len(), round = rounds, "flushing lazy queue");
            let requests: Vec<GetRequest> = ops
                .iter()
                .map(|op| {
                    let mut request = op.create_request();
                    // Inner urls are database-relative on the wire.
                    request.url = format!(
                        "/databases/{}{}",
                        self.executor().database(),
                        request.url
                    );
                    request
                })
                .collect();

            let mut command = MultiGetCommand::new(self.executor().cache().clone(), requests);
            self.execute(&mut command).await?;

            let responses = command.responses().to_vec();
            if responses.len() != ops.len() {
                return Err(Error::IllegalState(format!(
                    "multi-get returned {} responses for {} requests",
                    responses.len(),
                    ops.len()
                )));
            }

            for (op, response) in ops.iter_mut().zip(&responses) {
                if response.is_error() {
                    // One hard per-item failure aborts the whole flush.
                    return Err(Error::from_server_response(
                        response.status_code,
                        &serde_json::to_vec(&response.result)?,
                    ));
                }
                op.handle_response(response, self)?;
            }

            ops.retain(|op| op.requires_retry());
        }
        Ok(())
    }
}
