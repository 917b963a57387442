//! Concrete commands the client issues against the server
//!
//! Each file implements one wire operation as a `Command`. The session layer
//! composes these; the request executor runs them.

mod batch;
mod compare_exchange;
mod get_documents;
mod get_topology;
mod multi_get;

pub use batch::{BatchCommand, BatchCommandData, BatchResult};
pub use compare_exchange::{
    CompareExchangeResult, CompareExchangeValue, DeleteCompareExchangeValueCommand,
    GetCompareExchangeValueCommand, PutCompareExchangeValueCommand,
};
pub use get_documents::{GetDocumentsCommand, GetDocumentsResult};
pub use get_topology::GetTopologyCommand;
pub use multi_get::{GetRequest, GetResponse, MultiGetCommand};
