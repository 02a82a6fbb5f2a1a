//! Service-specific error types

use thiserror::Error;

/// Startup errors. Anything raised after the workers are running is handled
/// inside the workers and never reaches the binary.
#[derive(Error, Debug)]
pub enum Error {
    #[error("pair {index} ({source_id}.{operation}): {source}")]
    Pair {
        index: usize,
        source_id: String,
        operation: String,
        #[source]
        source: relay::Error,
    },

    #[error("failed to bind status listener on {addr}: {source}")]
    StatusBind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Whether the underlying cause is a clock-skew rejection.
    pub fn is_clock_skew(&self) -> bool {
        matches!(
            self,
            Error::Pair {
                source: relay::Error::Auth(tenant_auth::Error::ClockSkew { .. }),
                ..
            }
        )
    }
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
