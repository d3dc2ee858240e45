//! Error taxonomy shared across the indexer.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure classes surfaced by the indexer.
///
/// Every variant except [`Error::Cancelled`] is fatal for the iteration
/// that produced it; [`Error::Config`] is fatal at construction time.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration, detected at construction. Never recoverable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// RPC transport failure or a non-empty per-element batch error.
    #[error("upstream rpc failure: {0}")]
    Upstream(String),

    /// Semantically invalid upstream payload (null where forbidden, receipt
    /// for an unknown hash, unparseable quantity).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Database connection or statement failure.
    #[error("store failure: {0}")]
    Store(String),

    /// Unique-key collision at commit time.
    #[error("commit conflict: {0}")]
    Conflict(String),

    /// Pipeline shutdown observed while waiting.
    #[error("operation cancelled")]
    Cancelled,
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return Error::Conflict(db.message().to_owned());
            }
        }
        Error::Store(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Protocol(err.to_string())
    }
}
