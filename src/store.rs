//! Document store: the long-lived handle applications keep
//!
//! A `DocumentStore` owns one request executor per database and lends it to
//! every session it opens. The store is cheap to share behind an `Arc`; the
//! executors, topology, and HTTP cache behind it are created once per
//! database and reused.

use std::sync::Arc;

use dashmap::DashMap;

use crate::conventions::DocumentConventions;
use crate::http::RequestExecutor;
use crate::session::{DocumentSession, SessionOptions};
use crate::{Error, Result};

/// Entry point to the client: cluster urls, a default database, and the
/// per-database executor pool
pub struct DocumentStore {
    urls: Vec<String>,
    database: String,
    conventions: DocumentConventions,
    executors: DashMap<String, Arc<RequestExecutor>>,
}

impl DocumentStore {
    /// Create a store for `database` reachable through `urls`
    pub fn new(urls: Vec<String>, database: impl Into<String>) -> Result<Self> {
        Self::with_conventions(urls, database, DocumentConventions::default())
    }

    /// Create a store with explicit conventions
    pub fn with_conventions(
        urls: Vec<String>,
        database: impl Into<String>,
        conventions: DocumentConventions,
    ) -> Result<Self> {
        if urls.is_empty() {
            return Err(Error::Config("at least one cluster url is required".to_string()));
        }
        let database = database.into();
        if database.is_empty() {
            return Err(Error::Config("database name is required".to_string()));
        }
        Ok(Self {
            urls,
            database,
            conventions,
            executors: DashMap::new(),
        })
    }

    /// The store's default database
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Conventions shared by everything this store creates
    pub fn conventions(&self) -> &DocumentConventions {
        &self.conventions
    }

    /// The shared executor for `database` (or the store default), created on
    /// first use
    pub fn request_executor(&self, database: Option<&str>) -> Arc<RequestExecutor> {
        let database = database.unwrap_or(&self.database);
        self.executors
            .entry(database.to_string())
            .or_insert_with(|| {
                RequestExecutor::new(
                    self.urls.clone(),
                    database.to_string(),
                    self.conventions.clone(),
                )
            })
            .clone()
    }

    /// Open a session against the default database
    pub fn open_session(&self) -> DocumentSession {
        self.open_session_with(SessionOptions::default())
    }

    /// Open a session with explicit options
    pub fn open_session_with(&self, options: SessionOptions) -> DocumentSession {
        DocumentSession::new(self.request_executor(None), options)
    }
}
