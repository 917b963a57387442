//! Topology fetch command

use reqwest::Method;

use crate::http::commands::{Command, HttpRequest};
use crate::http::topology::{ServerNode, Topology};
use crate::Result;

/// `GET /topology?name={db}` — fetch the current database group topology
pub struct GetTopologyCommand {
    result: Option<Topology>,
}

impl GetTopologyCommand {
    pub fn new() -> Self {
        Self { result: None }
    }

    /// Consume the command, yielding the fetched topology
    pub fn into_result(self) -> Option<Topology> {
        self.result
    }
}

impl Default for GetTopologyCommand {
    fn default() -> Self {
        Self::new()
    }
}

impl Command for GetTopologyCommand {
    fn create_request(&self, node: &ServerNode) -> Result<HttpRequest> {
        let url = format!("{}/topology?name={}", node.url, node.database);
        Ok(HttpRequest {
            url,
            method: Method::GET,
            headers: Vec::new(),
            body: None,
        })
    }

    fn set_response(&mut self, body: &[u8], _from_cache: bool) -> Result<()> {
        self.result = Some(serde_json::from_slice(body)?);
        Ok(())
    }

    fn is_read_request(&self) -> bool {
        true
    }

    // Topology responses must always reflect the live cluster.
    fn can_cache(&self) -> bool {
        false
    }
}
