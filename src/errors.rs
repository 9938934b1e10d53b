use thiserror::Error;

/// Errors surfaced by the AMI client's connect/login/action path.
#[derive(Debug, Error)]
pub enum AmiError {
    #[error("connection to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("login rejected by AMI server")]
    LoginRejected,
    #[error("action timed out")]
    Timeout,
    #[error("not connected to AMI server")]
    Disconnected,
    #[error("action cancelled")]
    Cancelled,
}

/// Errors surfaced by the persistence layer.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to open database at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: libsql::Error,
    },
    #[error("query failed: {0}")]
    Query(#[source] libsql::Error),
    #[error("row decode failed: {0}")]
    Decode(String),
}

impl From<libsql::Error> for PersistenceError {
    fn from(source: libsql::Error) -> Self {
        PersistenceError::Query(source)
    }
}

/// Errors surfaced by the WebSocket hub.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("client {0} is not registered")]
    UnknownClient(uuid::Uuid),
    #[error("upgrade rejected: anonymous access disabled")]
    AnonymousDenied,
}
