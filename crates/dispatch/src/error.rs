//! Error types for dispatch operations

/// Errors from reading dispatched responses.
///
/// Failed calls themselves are not errors: the dispatcher logs them and
/// leaves the credential's page out of the result.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("response from tenant {tenant_id} is not valid JSON: {message}")]
    Decode { tenant_id: String, message: String },
}

/// Result alias for dispatch operations.
pub type Result<T> = std::result::Result<T, Error>;
