//! Azure AD authentication for tenant-scoped APIs
//!
//! Discovers which configured tenant/app/material combinations authenticate
//! against a resource with the roles a data source needs, and keeps their
//! access tokens fresh.
//!
//! Credential flow:
//! 1. `CredentialResolver::resolve()` tries each tenant × app pair
//! 2. `token::acquire_token()` runs the client-credentials grant
//! 3. `TokenClaims::decode()` reads roles and expiry from the token
//! 4. Callers check `Credential::is_expired()` and call `refresh_token()`

pub mod claims;
pub mod constants;
pub mod credential;
pub mod error;
pub mod material;
pub mod resolver;
pub mod token;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use claims::TokenClaims;
pub use constants::*;
pub use credential::{AuthContext, Credential, Identity, TokenPolicy};
pub use error::{Error, Result};
pub use material::{CertificateMaterial, CredentialMaterial};
pub use resolver::{AuthSettings, CredentialResolver, ResolvedCredentialSet};
pub use token::{TokenResponse, acquire_token};
