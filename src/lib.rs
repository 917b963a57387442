//! # Vellum client
//!
//! Rust client for the Vellum distributed document database. The driver hides
//! cluster topology, node failover, response caching, request coalescing, and
//! the cluster's compare-exchange primitive behind a unit-of-work session
//! API.
//!
//! ## Architecture
//!
//! - **DocumentStore**: long-lived handle; owns one request executor (and its
//!   topology + HTTP cache) per database
//! - **RequestExecutor**: routes commands to healthy nodes, retries on
//!   transport failures, revalidates cached responses via change vectors
//! - **DocumentSession**: tracks loaded/stored entities and persists the net
//!   diff as a single batch on `save_changes`
//! - **Lazy operations**: coalesce many deferred reads into one multi-get
//!   round trip
//! - **Cluster transactions**: session-tracked compare-exchange values with
//!   CAS semantics
//!
//! ## Example
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//! use vellum::DocumentStore;
//!
//! #[derive(Serialize, Deserialize)]
//! struct User {
//!     name: String,
//! }
//!
//! # async fn demo() -> vellum::Result<()> {
//! let store = DocumentStore::new(vec!["http://localhost:8080".to_string()], "app")?;
//! let mut session = store.open_session();
//!
//! session.store(&User { name: "ada".into() }, Some("users/1"))?;
//! session.save_changes().await?;
//!
//! let user: Option<User> = session.load("users/1").await?;
//! # let _ = user;
//! # Ok(())
//! # }
//! ```

pub mod commands;
pub mod conventions;
pub mod http;
pub mod session;
pub mod store;

mod error;

pub use conventions::{AggressiveCacheMode, AggressiveCacheOptions, DocumentConventions};
pub use error::{Error, Result};
pub use http::ReadBalanceBehavior;
pub use session::{DocumentSession, SessionOptions, TransactionMode};
pub use store::DocumentStore;
