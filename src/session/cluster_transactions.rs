//! Session-tracked compare-exchange values
//!
//! Compare-exchange entries are the cluster's linearizable key/value layer.
//! A ClusterWide session tracks them exactly like documents: reads are
//! resolved locally when possible, writes ride the save_changes batch with
//! their expected index, and a CAS mismatch surfaces as a conflict the
//! application must handle.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::commands::GetCompareExchangeValueCommand;
use crate::session::document_session::DocumentSession;
use crate::{Error, Result};

/// Lifecycle of one compare-exchange key within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareExchangeValueState {
    /// Registered locally, not yet persisted (index 0 on first create)
    New,
    /// Persisted server-side with a positive index
    Loaded,
    /// Deleted in this session; tombstoned until `clear`
    Deleted,
    /// Confirmed absent server-side (index sentinel -1)
    Missing,
}

/// One tracked compare-exchange entry
#[derive(Debug, Clone)]
pub struct CompareExchangeSessionValue {
    /// The cluster-wide key
    pub key: String,
    /// Last-known server index; 0 = never persisted, -1 = known missing
    pub index: i64,
    /// Pending or loaded value
    pub value: Option<Value>,
    /// Where the entry is in its lifecycle
    pub state: CompareExchangeValueState,
}

/// A typed view of a tracked compare-exchange value
#[derive(Debug, Clone)]
pub struct CompareExchangeHandle<T> {
    /// The cluster-wide key
    pub key: String,
    /// Server index the next CAS will be checked against
    pub index: i64,
    /// The value itself
    pub value: T,
}

/// Compare-exchange operations of a ClusterWide session.
///
/// Obtained via [`DocumentSession::cluster_transactions`], which enforces the
/// transaction mode before any of these can run.
pub struct ClusterTransactions<'a> {
    session: &'a mut DocumentSession,
}

impl<'a> ClusterTransactions<'a> {
    pub(crate) fn new(session: &'a mut DocumentSession) -> Self {
        Self { session }
    }

    /// Register a compare-exchange value for creation.
    ///
    /// Creating over an already-loaded key overwrites the pending value but
    /// keeps the last-known server index, so the save still CASes against the
    /// server's version. Creating over a key deleted in this session is a
    /// programming error until `clear`.
    pub fn create_compare_exchange_value<T: Serialize>(
        &mut self,
        key: &str,
        value: &T,
    ) -> Result<()> {
        if key.is_empty() {
            return Err(Error::IllegalArgument(
                "compare-exchange key is empty".to_string(),
            ));
        }
        let value = serde_json::to_value(value)?;

        match self.session.cx_values.get_mut(key) {
            Some(entry) => match entry.state {
                CompareExchangeValueState::Deleted => {
                    return Err(Error::IllegalState(format!(
                        "compare-exchange key '{}' was deleted in this session; \
                         clear() the session before re-creating it",
                        key
                    )));
                }
                CompareExchangeValueState::Missing => {
                    debug!(key, "re-creating compare-exchange value over known-missing entry");
                    entry.index = 0;
                    entry.value = Some(value);
                    entry.state = CompareExchangeValueState::New;
                }
                CompareExchangeValueState::New | CompareExchangeValueState::Loaded => {
                    // Keep the index: the CAS expectation must follow the
                    // server's last-known version.
                    entry.value = Some(value);
                    entry.state = CompareExchangeValueState::New;
                }
            },
            None => {
                self.session.cx_values.insert(
                    key.to_string(),
                    CompareExchangeSessionValue {
                        key: key.to_string(),
                        index: 0,
                        value: Some(value),
                        state: CompareExchangeValueState::New,
                    },
                );
                self.session.cx_order.push(key.to_string());
            }
        }
        Ok(())
    }

    /// Get a compare-exchange value, resolving locally when the session has
    /// already seen the key (including known-missing and deleted entries)
    pub async fn get_compare_exchange_value<T: DeserializeOwned>(
        &mut self,
        key: &str,
    ) -> Result<Option<CompareExchangeHandle<T>>> {
        if let Some(entry) = self.session.cx_values.get(key) {
            return match entry.state {
                CompareExchangeValueState::Missing | CompareExchangeValueState::Deleted => Ok(None),
                _ => {
                    let value = entry.value.clone().unwrap_or(Value::Null);
                    Ok(Some(CompareExchangeHandle {
                        key: entry.key.clone(),
                        index: entry.index,
                        value: serde_json::from_value(value)?,
                    }))
                }
            };
        }

        let mut command = GetCompareExchangeValueCommand::new(key);
        self.session.execute(&mut command).await?;

        match command.into_result() {
            Some(fetched) => {
                let handle = CompareExchangeHandle {
                    key: fetched.key.clone(),
                    index: fetched.index,
                    value: serde_json::from_value(fetched.value.clone())?,
                };
                self.session.cx_values.insert(
                    key.to_string(),
                    CompareExchangeSessionValue {
                        key: fetched.key,
                        index: fetched.index,
                        value: Some(fetched.value),
                        state: CompareExchangeValueState::Loaded,
                    },
                );
                self.session.cx_order.push(key.to_string());
                Ok(Some(handle))
            }
            None => {
                // Remember the miss so repeated gets stay local.
                self.session.cx_values.insert(
                    key.to_string(),
                    CompareExchangeSessionValue {
                        key: key.to_string(),
                        index: -1,
                        value: None,
                        state: CompareExchangeValueState::Missing,
                    },
                );
                self.session.cx_order.push(key.to_string());
                Ok(None)
            }
        }
    }

    /// Queue a tracked compare-exchange value for deletion
    pub fn delete_compare_exchange_value(&mut self, key: &str) -> Result<()> {
        match self.session.cx_values.get_mut(key) {
            Some(entry) => match entry.state {
                CompareExchangeValueState::New if entry.index == 0 => {
                    // Never persisted; just drop it.
                    self.session.cx_values.remove(key);
                    self.session.cx_order.retain(|k| k != key);
                    Ok(())
                }
                CompareExchangeValueState::Missing => Ok(()),
                _ => {
                    entry.value = None;
                    entry.state = CompareExchangeValueState::Deleted;
                    Ok(())
                }
            },
            None => Err(Error::IllegalState(format!(
                "compare-exchange key '{}' is not tracked by this session; \
                 use delete_compare_exchange_value_with_index",
                key
            ))),
        }
    }

    /// Queue an untracked compare-exchange key for deletion with an explicit
    /// expected index
    pub fn delete_compare_exchange_value_with_index(
        &mut self,
        key: &str,
        index: i64,
    ) -> Result<()> {
        if self.session.cx_values.contains_key(key) {
            return self.delete_compare_exchange_value(key);
        }
        self.session.cx_values.insert(
            key.to_string(),
            CompareExchangeSessionValue {
                key: key.to_string(),
                index,
                value: None,
                state: CompareExchangeValueState::Deleted,
            },
        );
        self.session.cx_order.push(key.to_string());
        Ok(())
    }
}
