//! Common types for the M365 event relay

mod secret;
mod error;

pub use secret::{REDACTED, Secret};
pub use error::{Error, Result};
