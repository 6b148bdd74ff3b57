use thiserror::Error;

/// Taxonomic error type shared across every component. Each variant
/// corresponds to one error kind named by the synchronisation design; the
/// `source` is always preserved so callers can inspect the underlying
/// failure.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("db error: {0}")]
    Db(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("outbox queue error: {0}")]
    Queue(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("apply error: {0}")]
    Apply(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("row not found: {table}/{row_id}")]
    RowNotFound { table: String, row_id: String },

    #[error("auth error: {0}")]
    Auth(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("adapter error: {0}")]
    Adapter(String),

    #[error("dead lettered: {0}")]
    DeadLettered(String),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Db(Box::new(e))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Codec(e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        SyncError::Db(Box::new(e))
    }
}
