//! Client-credentials token issuance
//!
//! Every token request is a `client_credentials` grant against
//! `{authority}/{tenant}/oauth2/token`, naming the target API through the
//! `resource` form field. A certificate-backed app sends a signed client
//! assertion; a secret-backed app sends its client secret.

use std::time::Duration;

use serde::Deserialize;

use crate::constants::CLIENT_ASSERTION_TYPE;
use crate::error::{Error, Result};
use crate::material::CredentialMaterial;

/// Response from the token endpoint.
///
/// Only the access token is read. Lifetime comes from the token's own `exp`
/// claim, since Azure AD has reported `expires_in` as both a number and a
/// string over the years.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// Token endpoint URL for a tenant.
pub fn token_endpoint(authority: &str, tenant_id: &str) -> String {
    format!("{}/{tenant_id}/oauth2/token", authority.trim_end_matches('/'))
}

/// Request an access token for `resource_id` on behalf of `app_id`.
pub async fn acquire_token(
    client: &reqwest::Client,
    timeout: Duration,
    authority: &str,
    tenant_id: &str,
    app_id: &str,
    material: &CredentialMaterial,
    resource_id: &str,
) -> Result<TokenResponse> {
    let url = token_endpoint(authority, tenant_id);

    let mut form: Vec<(&str, String)> = vec![
        ("grant_type", "client_credentials".into()),
        ("client_id", app_id.into()),
        ("resource", resource_id.into()),
    ];
    match material {
        CredentialMaterial::Secret(secret) => {
            form.push(("client_secret", secret.expose().clone()));
        }
        CredentialMaterial::Certificate(certificate) => {
            form.push(("client_assertion_type", CLIENT_ASSERTION_TYPE.into()));
            form.push(("client_assertion", certificate.client_assertion(app_id, &url)?));
        }
    }

    let response = client
        .post(&url)
        .timeout(timeout)
        .form(&form)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::TokenRequest(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenRequest(format!("invalid token response: {e}")))
}
