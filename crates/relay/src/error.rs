//! Error types for relay construction

/// Errors from building sources and sinks.
///
/// Once a worker is running nothing here is fatal: list and send failures
/// are logged by the worker and the loop carries on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("credential resolution failed: {0}")]
    Auth(#[from] tenant_auth::Error),

    #[error("unreadable API response: {0}")]
    Response(#[from] dispatch::Error),

    #[error("unknown source operation: {0}")]
    UnknownSource(String),

    #[error("unknown sink kind: {0}")]
    UnknownSink(String),

    #[error("invalid sink configuration: {0}")]
    InvalidSink(String),
}

impl Error {
    /// Whether the process must stop rather than run without this worker.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Auth(e) => e.is_fatal(),
            Error::Response(_) => false,
            Error::UnknownSource(_) | Error::UnknownSink(_) | Error::InvalidSink(_) => true,
        }
    }
}

/// Result alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;
