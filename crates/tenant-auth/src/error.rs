//! Error types for tenant authentication

/// Errors from credential trials, token issuance and refresh.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token request rejected: {0}")]
    TokenRequest(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("refreshed token is already expired: {0}")]
    TokenExpired(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("client assertion error: {0}")]
    Assertion(String),

    #[error(
        "clock skew of {skew_secs}s against the token issuer for tenant {tenant_id}; fix the local clock"
    )]
    ClockSkew { tenant_id: String, skew_secs: i64 },
}

impl Error {
    /// Whether this error must abort startup instead of being absorbed by the
    /// resolver's trial loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ClockSkew { .. })
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
