//! Access token claims
//!
//! Azure AD issues JWT access tokens. The relay never validates their
//! signature (the issuing API does that); it only reads the payload to learn
//! the granted roles, the issue time for the clock-skew check and the expiry
//! for the refresh decision.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{Error, Result};

/// The subset of access token claims the relay acts on.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenClaims {
    /// Application roles granted to the app in the tenant
    #[serde(default)]
    pub roles: Vec<String>,
    /// Issued-at, unix seconds
    pub iat: i64,
    /// Expiry, unix seconds
    pub exp: i64,
    #[serde(default)]
    pub aud: Option<String>,
    #[serde(default)]
    pub tid: Option<String>,
    #[serde(default)]
    pub appid: Option<String>,
}

impl TokenClaims {
    /// Decode the payload segment of a compact JWT without verifying it.
    pub fn decode(token: &str) -> Result<Self> {
        let payload = token
            .split('.')
            .nth(1)
            .ok_or_else(|| Error::InvalidToken("access token is not a compact JWT".into()))?;

        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| Error::InvalidToken(format!("payload is not base64url: {e}")))?;

        serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidToken(format!("payload is not a claim set: {e}")))
    }

    /// True when every required role was granted.
    pub fn has_roles(&self, required: &[&str]) -> bool {
        required
            .iter()
            .all(|role| self.roles.iter().any(|granted| granted == role))
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.iat, 0).unwrap_or_default()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or_default()
    }
}
