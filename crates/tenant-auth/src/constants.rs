//! Azure AD constants
//!
//! Public endpoint configuration for the client-credentials flow. None of
//! these values are secrets.

/// Default Azure AD authority. Overridable per deployment (sovereign clouds,
/// test endpoints).
pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

/// `client_assertion_type` for certificate-based client authentication (RFC 7523)
pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Lifetime of a signed client assertion, in seconds.
pub const ASSERTION_LIFETIME_SECS: i64 = 600;

/// Default safety window subtracted from a token's expiry.
pub const DEFAULT_EXPIRY_MARGIN_MINUTES: i64 = 5;

/// Default tolerated distance between the token's `iat` and local UTC now.
/// Azure AD backdates `iat` by up to five minutes, so the window sits above that.
pub const DEFAULT_MAX_CLOCK_SKEW_MINUTES: i64 = 7;

/// Default upper bound on one token endpoint round trip, in seconds.
pub const DEFAULT_TOKEN_REQUEST_TIMEOUT_SECS: u64 = 120;
