//! Credential lifecycle
//!
//! A `Credential` binds one (tenant, app, resource) to the material that
//! authenticated it and the access token currently in use. The token and its
//! decoded claims sit behind one lock so a refresh swaps both together; a
//! failed refresh leaves the previous pair untouched.

use chrono::{DateTime, Duration, Utc};
use common::Secret;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::claims::TokenClaims;
use crate::constants::{
    DEFAULT_AUTHORITY, DEFAULT_EXPIRY_MARGIN_MINUTES, DEFAULT_MAX_CLOCK_SKEW_MINUTES,
    DEFAULT_TOKEN_REQUEST_TIMEOUT_SECS,
};
use crate::error::{Error, Result};
use crate::material::CredentialMaterial;
use crate::token::acquire_token;

/// Timing rules applied to every token.
#[derive(Debug, Clone, Copy)]
pub struct TokenPolicy {
    /// A token counts as expired this long before its `exp`
    pub expiry_margin: Duration,
    /// Largest tolerated distance between `iat` and local now
    pub max_clock_skew: Duration,
    /// Upper bound on one token endpoint round trip
    pub request_timeout: std::time::Duration,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            expiry_margin: Duration::minutes(DEFAULT_EXPIRY_MARGIN_MINUTES),
            max_clock_skew: Duration::minutes(DEFAULT_MAX_CLOCK_SKEW_MINUTES),
            request_timeout: std::time::Duration::from_secs(DEFAULT_TOKEN_REQUEST_TIMEOUT_SECS),
        }
    }
}

/// Where and how tokens are requested.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub client: reqwest::Client,
    pub authority: String,
    pub policy: TokenPolicy,
    /// Log raw tokens and secrets instead of redacting them
    pub show_secrets: bool,
}

impl AuthContext {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            authority: DEFAULT_AUTHORITY.to_string(),
            policy: TokenPolicy::default(),
            show_secrets: false,
        }
    }
}

/// Who is asking for what.
#[derive(Debug, Clone)]
pub struct Identity {
    pub tenant_id: String,
    pub app_id: String,
    pub resource_id: String,
    pub material: CredentialMaterial,
}

#[derive(Debug)]
struct TokenState {
    access_token: Secret<String>,
    claims: TokenClaims,
}

/// An authenticated (tenant, app, resource) with a refreshable token.
#[derive(Debug)]
pub struct Credential {
    identity: Identity,
    context: AuthContext,
    state: RwLock<TokenState>,
}

impl Credential {
    /// Authenticate and check the issuer's clock against ours.
    ///
    /// `Error::ClockSkew` is the only error callers must not swallow: every
    /// later expiry decision would be wrong.
    pub async fn authenticate(context: AuthContext, identity: Identity) -> Result<Self> {
        let state = issue(&context, &identity).await?;

        let skew = (Utc::now() - state.claims.issued_at()).num_seconds().abs();
        if skew > context.policy.max_clock_skew.num_seconds() {
            return Err(Error::ClockSkew {
                tenant_id: identity.tenant_id.clone(),
                skew_secs: skew,
            });
        }

        info!(
            tenant_id = %identity.tenant_id,
            app_id = %identity.app_id,
            resource = %identity.resource_id,
            via = identity.material.kind(),
            roles = ?state.claims.roles,
            expires_at = %state.claims.expires_at(),
            token = %state.access_token.reveal(context.show_secrets),
            "authenticated"
        );

        Ok(Self {
            identity,
            context,
            state: RwLock::new(state),
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.identity.tenant_id
    }

    pub fn app_id(&self) -> &str {
        &self.identity.app_id
    }

    pub fn resource_id(&self) -> &str {
        &self.identity.resource_id
    }

    pub fn material(&self) -> &CredentialMaterial {
        &self.identity.material
    }

    /// Current bearer token.
    pub async fn access_token(&self) -> Secret<String> {
        self.state.read().await.access_token.clone()
    }

    pub async fn roles(&self) -> Vec<String> {
        self.state.read().await.claims.roles.clone()
    }

    pub async fn has_roles(&self, required: &[&str]) -> bool {
        self.state.read().await.claims.has_roles(required)
    }

    pub async fn expires_at(&self) -> DateTime<Utc> {
        self.state.read().await.claims.expires_at()
    }

    /// True once now is past expiry minus the safety margin.
    pub async fn is_expired(&self) -> bool {
        let state = self.state.read().await;
        expired(&state.claims, self.context.policy.expiry_margin, Utc::now())
    }

    /// Re-authenticate with the stored material and swap in the new token.
    ///
    /// On any error the previous token and claims stay in place.
    pub async fn refresh_token(&self) -> Result<()> {
        let fresh = issue(&self.context, &self.identity).await?;
        if expired(&fresh.claims, self.context.policy.expiry_margin, Utc::now()) {
            return Err(Error::TokenExpired(format!(
                "token for tenant {} expires at {}",
                self.identity.tenant_id,
                fresh.claims.expires_at()
            )));
        }

        debug!(
            tenant_id = %self.identity.tenant_id,
            expires_at = %fresh.claims.expires_at(),
            token = %fresh.access_token.reveal(self.context.show_secrets),
            "refreshed token"
        );
        *self.state.write().await = fresh;
        Ok(())
    }
}

fn expired(claims: &TokenClaims, margin: Duration, now: DateTime<Utc>) -> bool {
    claims.expires_at() - margin < now
}

async fn issue(context: &AuthContext, identity: &Identity) -> Result<TokenState> {
    let response = acquire_token(
        &context.client,
        context.policy.request_timeout,
        &context.authority,
        &identity.tenant_id,
        &identity.app_id,
        &identity.material,
        &identity.resource_id,
    )
    .await?;

    if response.access_token.is_empty() {
        return Err(Error::InvalidToken("token endpoint returned an empty token".into()));
    }
    let claims = TokenClaims::decode(&response.access_token)?;

    Ok(TokenState {
        access_token: Secret::new(response.access_token),
        claims,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockApp, MockTokenEndpoint};

    const RESOURCE: &str = "https://api.security.microsoft.com";

    fn context(endpoint: &MockTokenEndpoint) -> AuthContext {
        AuthContext {
            authority: endpoint.authority.clone(),
            ..AuthContext::new(reqwest::Client::new())
        }
    }

    fn identity(secret: &str) -> Identity {
        Identity {
            tenant_id: "t1".into(),
            app_id: "app-1".into(),
            resource_id: RESOURCE.into(),
            material: CredentialMaterial::Secret(Secret::new(secret.into())),
        }
    }

    async fn endpoint() -> MockTokenEndpoint {
        MockTokenEndpoint::start(vec![
            MockApp::with_secret("t1", "app-1", "s3cret").roles(&["Incident.Read.All"]),
        ])
        .await
    }

    #[test]
    fn expiry_honours_margin() {
        let now = Utc::now();
        let claims = TokenClaims {
            roles: vec![],
            iat: now.timestamp(),
            exp: (now + Duration::minutes(4)).timestamp(),
            aud: None,
            tid: None,
            appid: None,
        };
        assert!(expired(&claims, Duration::minutes(5), now));
        assert!(!expired(&claims, Duration::minutes(3), now));
    }

    #[tokio::test]
    async fn authenticate_decodes_roles() {
        let endpoint = endpoint().await;
        let credential = Credential::authenticate(context(&endpoint), identity("s3cret"))
            .await
            .unwrap();
        assert_eq!(credential.tenant_id(), "t1");
        assert_eq!(credential.resource_id(), RESOURCE);
        assert_eq!(credential.material().kind(), "secret");
        assert!(credential.has_roles(&["Incident.Read.All"]).await);
        assert!(!credential.is_expired().await);
    }

    #[tokio::test]
    async fn skewed_issuer_clock_is_fatal() {
        let endpoint = endpoint().await;
        endpoint.set_issued_offset(-3600);
        let err = Credential::authenticate(context(&endpoint), identity("s3cret"))
            .await
            .unwrap_err();
        assert!(err.is_fatal(), "expected clock skew, got {err}");
    }

    #[tokio::test]
    async fn skew_inside_window_is_accepted() {
        let endpoint = endpoint().await;
        // Azure AD backdates iat by five minutes
        endpoint.set_issued_offset(-300);
        assert!(
            Credential::authenticate(context(&endpoint), identity("s3cret"))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn short_lived_token_is_expired_until_refreshed() {
        let endpoint = endpoint().await;
        endpoint.set_lifetime(60);
        let credential = Credential::authenticate(context(&endpoint), identity("s3cret"))
            .await
            .unwrap();
        assert!(credential.is_expired().await);

        endpoint.set_lifetime(3599);
        credential.refresh_token().await.unwrap();
        assert!(!credential.is_expired().await);
    }

    #[tokio::test]
    async fn refresh_returning_expired_token_fails() {
        let endpoint = endpoint().await;
        let credential = Credential::authenticate(context(&endpoint), identity("s3cret"))
            .await
            .unwrap();
        endpoint.set_lifetime(60);
        assert!(matches!(
            credential.refresh_token().await,
            Err(Error::TokenExpired(_))
        ));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_token() {
        let endpoint = endpoint().await;
        let credential = Credential::authenticate(context(&endpoint), identity("s3cret"))
            .await
            .unwrap();
        let before = credential.access_token().await.expose().clone();
        let expires_before = credential.expires_at().await;

        endpoint.set_rejecting(true);
        assert!(credential.refresh_token().await.is_err());
        assert_eq!(credential.access_token().await.expose(), &before);
        assert_eq!(credential.expires_at().await, expires_before);
    }

    #[tokio::test]
    async fn rejected_material_does_not_authenticate() {
        let endpoint = endpoint().await;
        let err = Credential::authenticate(context(&endpoint), identity("nope"))
            .await
            .unwrap_err();
        assert!(!err.is_fatal());
    }
}
