//! Authentication material
//!
//! An app proves its identity either with a client secret or with a
//! certificate. Certificates are PKCS#12 bundles; the private key signs a
//! short-lived RS256 client assertion (RFC 7523) whose `x5t` header carries
//! the SHA-1 thumbprint Azure AD uses to find the registered certificate.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use common::Secret;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use serde::Serialize;
use uuid::Uuid;

use crate::constants::ASSERTION_LIFETIME_SECS;
use crate::error::{Error, Result};

/// What an app authenticates with.
#[derive(Debug, Clone)]
pub enum CredentialMaterial {
    Certificate(CertificateMaterial),
    Secret(Secret<String>),
}

impl CredentialMaterial {
    /// Short label for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            CredentialMaterial::Certificate(_) => "certificate",
            CredentialMaterial::Secret(_) => "secret",
        }
    }
}

/// A loaded certificate: its thumbprint and the PKCS#1 DER private key.
#[derive(Debug, Clone)]
pub struct CertificateMaterial {
    path: PathBuf,
    thumbprint: String,
    private_key: Secret<Vec<u8>>,
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    aud: &'a str,
    iss: &'a str,
    sub: &'a str,
    jti: String,
    nbf: i64,
    exp: i64,
}

impl CertificateMaterial {
    /// Load a PKCS#12 bundle. `None` opens it without a password.
    pub fn load(path: &Path, password: Option<&Secret<String>>) -> Result<Self> {
        let der = std::fs::read(path)
            .map_err(|e| Error::Certificate(format!("reading {}: {e}", path.display())))?;
        let bundle = Pkcs12::from_der(&der)
            .map_err(|e| Error::Certificate(format!("{} is not PKCS#12: {e}", path.display())))?;
        let parsed = bundle
            .parse2(password.map(|p| p.expose().as_str()).unwrap_or(""))
            .map_err(|e| Error::Certificate(format!("opening {}: {e}", path.display())))?;

        let cert = parsed
            .cert
            .ok_or_else(|| Error::Certificate(format!("{} holds no certificate", path.display())))?;
        let pkey = parsed
            .pkey
            .ok_or_else(|| Error::Certificate(format!("{} holds no private key", path.display())))?;

        let digest = cert
            .digest(MessageDigest::sha1())
            .map_err(|e| Error::Certificate(format!("thumbprint: {e}")))?;
        let private_key = pkey
            .rsa()
            .and_then(|rsa| rsa.private_key_to_der())
            .map_err(|e| Error::Certificate(format!("{} key is not RSA: {e}", path.display())))?;

        Ok(Self {
            path: path.to_path_buf(),
            thumbprint: URL_SAFE_NO_PAD.encode(&*digest),
            private_key: Secret::new(private_key),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Base64url SHA-1 thumbprint (the `x5t` header value).
    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    /// Sign a client assertion for `app_id` addressed to the token endpoint.
    pub fn client_assertion(&self, app_id: &str, audience: &str) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = AssertionClaims {
            aud: audience,
            iss: app_id,
            sub: app_id,
            jti: Uuid::new_v4().to_string(),
            nbf: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.x5t = Some(self.thumbprint.clone());

        let key = EncodingKey::from_rsa_der(self.private_key.expose());
        jsonwebtoken::encode(&header, &claims, &key)
            .map_err(|e| Error::Assertion(format!("signing client assertion: {e}")))
    }
}
