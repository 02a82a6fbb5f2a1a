//! Authenticated request dispatch for tenant-scoped APIs
//!
//! Runs one logical call across a `ResolvedCredentialSet`, handling token
//! refresh, 403 rate-limit backoff, transport retries and pagination. Each
//! data source owns one `RequestDispatcher` (and with it one HTTP client).
//!
//! Call lifecycle per credential:
//! 1. Substitute `{TENANTID}` in the URL
//! 2. Refresh the token if it is inside the expiry margin
//! 3. Send with `Authorization: Bearer`
//! 4. `classify()` the response and retry at most once per cause
//! 5. Follow continuation URLs until the extractor returns `None`

pub mod classify;
pub mod dispatcher;
pub mod error;
pub mod sleep;

pub use classify::{Outcome, classify};
pub use dispatcher::{DispatchPolicy, DispatchRequest, Page, RequestDispatcher, TENANT_PLACEHOLDER};
pub use error::{Error, Result};
pub use sleep::cancellable_sleep;
