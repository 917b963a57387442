//! Error types for the Vellum client

use std::fmt;

/// Result type alias for Vellum client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the Vellum client
#[derive(Debug)]
pub enum Error {
    /// Transport-level errors (connection refused, DNS, TLS)
    Transport(reqwest::Error),
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Every node in the topology failed with a transport error
    AllTopologyNodesDown { url_count: usize },
    /// A request attempt timed out
    Timeout,
    /// Optimistic concurrency violation on a document
    Concurrency { id: String, message: String },
    /// Compare-exchange index mismatch (distributed CAS conflict)
    CompareExchangeConflict { key: String, message: String },
    /// Application-level error reported by the server
    Database { type_name: String, message: String },
    /// API misuse detected before any network call
    IllegalState(String),
    /// Invalid argument supplied by the caller
    IllegalArgument(String),
    /// Configuration errors
    Config(String),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "Transport error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::AllTopologyNodesDown { url_count } => {
                write!(f, "All {} topology nodes are unreachable", url_count)
            }
            Error::Timeout => write!(f, "Request timed out"),
            Error::Concurrency { id, message } => {
                write!(f, "Concurrency conflict on document '{}': {}", id, message)
            }
            Error::CompareExchangeConflict { key, message } => {
                write!(f, "Compare-exchange conflict on key '{}': {}", key, message)
            }
            Error::Database { type_name, message } => {
                write!(f, "Server error ({}): {}", type_name, message)
            }
            Error::IllegalState(msg) => write!(f, "Illegal state: {}", msg),
            Error::IllegalArgument(msg) => write!(f, "Illegal argument: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error {
    /// Map a non-success server response body to a typed error.
    ///
    /// The server reports errors as `{"Type": "...", "Message": "...", "Error": "..."}`.
    /// The `Type` field carries the server-side exception class; conflicts map to
    /// the dedicated concurrency variants so callers can match on them.
    pub fn from_server_response(status: u16, body: &[u8]) -> Error {
        let parsed: serde_json::Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(_) => {
                return Error::Database {
                    type_name: format!("Http{}", status),
                    message: String::from_utf8_lossy(body).into_owned(),
                }
            }
        };

        let type_name = parsed
            .get("Type")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown")
            .to_string();
        let message = parsed
            .get("Message")
            .or_else(|| parsed.get("Error"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown server error")
            .to_string();

        if type_name.ends_with("ClusterTransactionConcurrencyException")
            || type_name.ends_with("CompareExchangeConflictException")
        {
            let key = parsed
                .get("Key")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            return Error::CompareExchangeConflict { key, message };
        }

        if status == 409 || type_name.ends_with("ConcurrencyException") {
            let id = parsed
                .get("Id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            return Error::Concurrency { id, message };
        }

        Error::Database { type_name, message }
    }

    /// Whether this error came from the transport layer (eligible for failover)
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout | Error::Io(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout
        } else {
            Error::Transport(e)
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_mapping() {
        let body = br#"{"Type":"Vellum.Server.ConcurrencyException","Message":"vector mismatch","Id":"users/1"}"#;
        match Error::from_server_response(409, body) {
            Error::Concurrency { id, .. } => assert_eq!(id, "users/1"),
            e => panic!("expected Concurrency, got {:?}", e),
        }
    }

    #[test]
    fn test_cluster_conflict_mapping() {
        let body = br#"{"Type":"Vellum.Server.ClusterTransactionConcurrencyException","Message":"stale index","Key":"locks/a"}"#;
        match Error::from_server_response(409, body) {
            Error::CompareExchangeConflict { key, .. } => assert_eq!(key, "locks/a"),
            e => panic!("expected CompareExchangeConflict, got {:?}", e),
        }
    }

    #[test]
    fn test_unparseable_body_falls_back() {
        match Error::from_server_response(500, b"<html>boom</html>") {
            Error::Database { type_name, .. } => assert_eq!(type_name, "Http500"),
            e => panic!("expected Database, got {:?}", e),
        }
    }
}
