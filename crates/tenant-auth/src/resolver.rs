//! Credential discovery
//!
//! Operators configure lists of tenants, apps, certificates, passwords and
//! secrets without saying which belong together. The resolver tries every
//! tenant × app pair against the material in a fixed priority order and keeps
//! the first identity that authenticates with the required roles.

use std::path::PathBuf;
use std::sync::Arc;

use common::Secret;
use tracing::{debug, info, warn};

use crate::credential::{AuthContext, Credential, Identity, TokenPolicy};
use crate::error::Result;
use crate::material::{CertificateMaterial, CredentialMaterial};

/// Everything the operator configured for authentication.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub authority: String,
    pub tenant_ids: Vec<String>,
    pub app_ids: Vec<String>,
    pub certificate_paths: Vec<PathBuf>,
    pub certificate_passwords: Vec<Secret<String>>,
    pub app_secrets: Vec<Secret<String>>,
    pub policy: TokenPolicy,
    pub show_secrets: bool,
}

/// Tenant id → winning credential, in configured tenant order.
#[derive(Debug, Default)]
pub struct ResolvedCredentialSet {
    credentials: Vec<Arc<Credential>>,
}

impl ResolvedCredentialSet {
    /// Add a credential unless its tenant already has one. Returns whether
    /// it was added.
    pub fn insert(&mut self, credential: Credential) -> bool {
        if self.get(credential.tenant_id()).is_some() {
            return false;
        }
        self.credentials.push(Arc::new(credential));
        true
    }

    pub fn get(&self, tenant_id: &str) -> Option<&Arc<Credential>> {
        self.credentials
            .iter()
            .find(|credential| credential.tenant_id() == tenant_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Credential>> {
        self.credentials.iter()
    }

    pub fn tenant_ids(&self) -> Vec<&str> {
        self.credentials.iter().map(|c| c.tenant_id()).collect()
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

/// Outcome of one authentication trial.
enum Trial {
    Accepted(Credential),
    /// Authenticated but without the required roles: the pair's search ends
    MissingRoles,
    Failed,
}

/// Searches the configured material for working credentials.
///
/// Each resolver owns its HTTP client; the credentials it produces keep a
/// handle to it for refreshes.
pub struct CredentialResolver {
    settings: Arc<AuthSettings>,
    client: reqwest::Client,
}

impl CredentialResolver {
    pub fn new(settings: Arc<AuthSettings>) -> Self {
        Self {
            settings,
            client: reqwest::Client::new(),
        }
    }

    /// Resolve one credential per tenant for `resource_id` carrying every
    /// role in `required_roles`.
    ///
    /// Trial failures are logged and skipped; an empty set is a valid
    /// result. Only `Error::ClockSkew` is returned.
    pub async fn resolve(
        &self,
        resource_id: &str,
        required_roles: &[&str],
    ) -> Result<ResolvedCredentialSet> {
        let mut resolved = ResolvedCredentialSet::default();

        for tenant_id in &self.settings.tenant_ids {
            for app_id in &self.settings.app_ids {
                let Some(credential) = self
                    .resolve_pair(tenant_id, app_id, resource_id, required_roles)
                    .await?
                else {
                    continue;
                };
                if !resolved.insert(credential) {
                    info!(
                        tenant_id = %tenant_id,
                        app_id = %app_id,
                        resource = resource_id,
                        "tenant already resolved by an earlier app, dropping"
                    );
                }
            }
        }

        info!(
            resource = resource_id,
            roles = ?required_roles,
            tenants = ?resolved.tenant_ids(),
            "resolved credentials"
        );
        Ok(resolved)
    }

    async fn resolve_pair(
        &self,
        tenant_id: &str,
        app_id: &str,
        resource_id: &str,
        required_roles: &[&str],
    ) -> Result<Option<Credential>> {
        let passwords = std::iter::once(None).chain(
            self.settings
                .certificate_passwords
                .iter()
                .map(Some),
        );
        let password_attempts: Vec<Option<&Secret<String>>> = passwords.collect();

        for path in &self.settings.certificate_paths {
            for password in &password_attempts {
                let certificate = match CertificateMaterial::load(path, *password) {
                    Ok(certificate) => certificate,
                    Err(e) => {
                        debug!(
                            path = %path.display(),
                            with_password = password.is_some(),
                            error = %e,
                            "certificate not usable"
                        );
                        continue;
                    }
                };
                let material = CredentialMaterial::Certificate(certificate);
                match self
                    .trial(tenant_id, app_id, resource_id, material, required_roles)
                    .await?
                {
                    Trial::Accepted(credential) => return Ok(Some(credential)),
                    Trial::MissingRoles => return Ok(None),
                    Trial::Failed => {}
                }
            }
        }

        for secret in &self.settings.app_secrets {
            if secret.expose().is_empty() {
                continue;
            }
            let material = CredentialMaterial::Secret(secret.clone());
            match self
                .trial(tenant_id, app_id, resource_id, material, required_roles)
                .await?
            {
                Trial::Accepted(credential) => return Ok(Some(credential)),
                Trial::MissingRoles => return Ok(None),
                Trial::Failed => {}
            }
        }

        debug!(tenant_id, app_id, resource = resource_id, "no material authenticated");
        Ok(None)
    }

    async fn trial(
        &self,
        tenant_id: &str,
        app_id: &str,
        resource_id: &str,
        material: CredentialMaterial,
        required_roles: &[&str],
    ) -> Result<Trial> {
        let context = AuthContext {
            client: self.client.clone(),
            authority: self.settings.authority.clone(),
            policy: self.settings.policy,
            show_secrets: self.settings.show_secrets,
        };
        let via = material.kind();
        let identity = Identity {
            tenant_id: tenant_id.to_string(),
            app_id: app_id.to_string(),
            resource_id: resource_id.to_string(),
            material,
        };

        let credential = match Credential::authenticate(context, identity).await {
            Ok(credential) => credential,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(tenant_id, app_id, via, error = %e, "authentication failed");
                return Ok(Trial::Failed);
            }
        };

        if credential.has_roles(required_roles).await {
            Ok(Trial::Accepted(credential))
        } else {
            let granted = credential.roles().await;
            debug!(
                tenant_id,
                app_id,
                required = ?required_roles,
                granted = ?granted,
                "authenticated without required roles, discarding"
            );
            Ok(Trial::MissingRoles)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::testing::{MockApp, MockTokenEndpoint, self_signed_pkcs12};

    const RESOURCE: &str = "https://api.security.microsoft.com";
    const ROLE: &str = "Incident.Read.All";

    fn settings(endpoint: &MockTokenEndpoint) -> AuthSettings {
        AuthSettings {
            authority: endpoint.authority.clone(),
            tenant_ids: vec!["t1".into()],
            app_ids: vec!["app-1".into()],
            certificate_paths: vec![],
            certificate_passwords: vec![],
            app_secrets: vec![],
            policy: TokenPolicy::default(),
            show_secrets: false,
        }
    }

    fn secrets(values: &[&str]) -> Vec<Secret<String>> {
        values.iter().map(|s| Secret::new(s.to_string())).collect()
    }

    #[tokio::test]
    async fn resolves_secret_with_required_role() {
        let endpoint = MockTokenEndpoint::start(vec![
            MockApp::with_secret("t1", "app-1", "s3cret").roles(&[ROLE]),
        ])
        .await;
        let mut settings = settings(&endpoint);
        settings.app_secrets = secrets(&["", "wrong", "s3cret"]);

        let resolved = CredentialResolver::new(Arc::new(settings))
            .resolve(RESOURCE, &[ROLE])
            .await
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved.get("t1").unwrap().app_id(), "app-1");
        // The empty secret is skipped, the wrong one is tried
        assert_eq!(endpoint.requests(), 2);
    }

    #[tokio::test]
    async fn credential_without_role_is_discarded() {
        let endpoint = MockTokenEndpoint::start(vec![
            MockApp::with_secret("t1", "app-1", "s3cret").roles(&["User.Read.All"]),
        ])
        .await;
        let mut settings = settings(&endpoint);
        settings.app_secrets = secrets(&["s3cret", "other"]);

        let resolved = CredentialResolver::new(Arc::new(settings))
            .resolve(RESOURCE, &[ROLE])
            .await
            .unwrap();
        assert!(resolved.is_empty());
        // Search for the pair ends at the role-less success
        assert_eq!(endpoint.requests(), 1);
    }

    #[tokio::test]
    async fn resolution_runs_on_spawned_task() {
        let endpoint = MockTokenEndpoint::start(vec![
            MockApp::with_secret("t1", "app-1", "s3cret").roles(&["User.Read.All"]),
            MockApp::with_secret("t2", "app-1", "s3cret").roles(&[ROLE]),
        ])
        .await;
        let mut settings = settings(&endpoint);
        settings.tenant_ids = vec!["t1".into(), "t2".into()];
        settings.app_secrets = secrets(&["s3cret"]);
        let resolver = CredentialResolver::new(Arc::new(settings));

        // Both the accepted and the role-less branch must be Send
        let resolved = tokio::spawn(async move { resolver.resolve(RESOURCE, &[ROLE]).await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.tenant_ids(), vec!["t2"]);
    }

    #[tokio::test]
    async fn pairs_without_valid_material_are_excluded() {
        let endpoint = MockTokenEndpoint::start(vec![
            MockApp::with_secret("t1", "app-1", "s3cret").roles(&[ROLE]),
        ])
        .await;
        let dir = tempfile::tempdir().unwrap();
        let junk = dir.path().join("junk.pfx");
        std::fs::write(&junk, b"garbage").unwrap();

        let mut settings = settings(&endpoint);
        settings.tenant_ids = vec!["t1".into(), "t2".into()];
        settings.certificate_paths = vec![junk, dir.path().join("missing.pfx")];
        settings.certificate_passwords = secrets(&["pw"]);
        settings.app_secrets = secrets(&["s3cret"]);

        let resolved = CredentialResolver::new(Arc::new(settings))
            .resolve(RESOURCE, &[ROLE])
            .await
            .unwrap();
        assert_eq!(resolved.tenant_ids(), vec!["t1"]);
    }

    #[tokio::test]
    async fn certificate_is_preferred_over_secret() {
        let endpoint = MockTokenEndpoint::start(vec![
            MockApp::with_certificate("t1", "app-1").roles(&[ROLE]),
        ])
        .await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.pfx");
        std::fs::write(&path, self_signed_pkcs12("pw")).unwrap();

        let mut settings = settings(&endpoint);
        settings.certificate_paths = vec![path];
        settings.certificate_passwords = secrets(&["nope", "pw"]);
        settings.app_secrets = secrets(&["s3cret"]);

        let resolved = CredentialResolver::new(Arc::new(settings))
            .resolve(RESOURCE, &[ROLE])
            .await
            .unwrap();
        let credential = resolved.get("t1").unwrap();
        assert_eq!(credential.material().kind(), "certificate");
        // Only the correctly opened certificate reaches the endpoint
        assert_eq!(endpoint.requests(), 1);
    }

    #[tokio::test]
    async fn first_app_wins_per_tenant() {
        let endpoint = MockTokenEndpoint::start(vec![
            MockApp::with_secret("t1", "app-1", "s1").roles(&[ROLE]),
            MockApp::with_secret("t1", "app-2", "s2").roles(&[ROLE]),
        ])
        .await;
        let mut settings = settings(&endpoint);
        settings.app_ids = vec!["app-1".into(), "app-2".into()];
        settings.app_secrets = secrets(&["s1", "s2"]);

        let resolved = CredentialResolver::new(Arc::new(settings))
            .resolve(RESOURCE, &[ROLE])
            .await
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved.get("t1").unwrap().app_id(), "app-1");
    }

    #[tokio::test]
    async fn clock_skew_aborts_resolution() {
        let endpoint = MockTokenEndpoint::start(vec![
            MockApp::with_secret("t1", "app-1", "s3cret").roles(&[ROLE]),
        ])
        .await;
        endpoint.set_issued_offset(7200);
        let mut settings = settings(&endpoint);
        settings.app_secrets = secrets(&["s3cret"]);

        let result = CredentialResolver::new(Arc::new(settings))
            .resolve(RESOURCE, &[ROLE])
            .await;
        assert!(matches!(result, Err(Error::ClockSkew { .. })));
    }

    #[tokio::test]
    async fn nothing_configured_resolves_empty() {
        let endpoint = MockTokenEndpoint::start(vec![]).await;
        let resolved = CredentialResolver::new(Arc::new(settings(&endpoint)))
            .resolve(RESOURCE, &[ROLE])
            .await
            .unwrap();
        assert!(resolved.is_empty());
        assert_eq!(endpoint.requests(), 0);
    }
}
