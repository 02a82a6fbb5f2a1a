//! In-process Azure AD stand-in for tests.
//!
//! `MockTokenEndpoint` serves `POST /{tenant}/oauth2/token` on an ephemeral
//! port and issues unsigned JWTs carrying whatever roles the registered app
//! was given. Tests point a resolver's authority at `endpoint.authority`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use axum::extract::{Form, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::task::JoinHandle;

/// Encode claims as an unsigned compact JWT.
pub fn unsigned_token(claims: &Value) -> String {
    format!(
        "{}.{}.unsigned",
        URL_SAFE_NO_PAD.encode(r#"{"typ":"JWT","alg":"none"}"#),
        URL_SAFE_NO_PAD.encode(claims.to_string())
    )
}

/// A self-signed RSA certificate and key bundled as PKCS#12.
pub fn self_signed_pkcs12(password: &str) -> Vec<u8> {
    use openssl::asn1::Asn1Time;
    use openssl::bn::BigNum;
    use openssl::hash::MessageDigest;
    use openssl::pkcs12::Pkcs12;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::{X509Builder, X509NameBuilder};

    let pkey = PKey::from_rsa(Rsa::generate(2048).expect("rsa keygen")).expect("pkey");
    let mut name = X509NameBuilder::new().expect("name builder");
    name.append_entry_by_text("CN", "m365-relay-test")
        .expect("common name");
    let name = name.build();

    let mut builder = X509Builder::new().expect("x509 builder");
    builder.set_version(2).expect("version");
    let serial = BigNum::from_u32(1)
        .and_then(|n| n.to_asn1_integer())
        .expect("serial");
    builder.set_serial_number(&serial).expect("serial");
    builder.set_subject_name(&name).expect("subject");
    builder.set_issuer_name(&name).expect("issuer");
    builder.set_pubkey(&pkey).expect("pubkey");
    builder
        .set_not_before(&Asn1Time::days_from_now(0).expect("not before"))
        .expect("not before");
    builder
        .set_not_after(&Asn1Time::days_from_now(1).expect("not after"))
        .expect("not after");
    builder.sign(&pkey, MessageDigest::sha256()).expect("sign");
    let cert = builder.build();

    Pkcs12::builder()
        .name("m365-relay-test")
        .pkey(&pkey)
        .cert(&cert)
        .build2(password)
        .and_then(|bundle| bundle.to_der())
        .expect("pkcs12")
}

/// An app registration known to the mock endpoint.
#[derive(Debug, Clone)]
pub struct MockApp {
    pub tenant_id: String,
    pub app_id: String,
    pub secret: Option<String>,
    pub accepts_certificates: bool,
    pub roles: Vec<String>,
}

impl MockApp {
    pub fn with_secret(tenant_id: &str, app_id: &str, secret: &str) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            app_id: app_id.into(),
            secret: Some(secret.into()),
            accepts_certificates: false,
            roles: Vec::new(),
        }
    }

    /// Accepts any client assertion whose issuer is this app.
    pub fn with_certificate(tenant_id: &str, app_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            app_id: app_id.into(),
            secret: None,
            accepts_certificates: true,
            roles: Vec::new(),
        }
    }

    pub fn roles(mut self, roles: &[&str]) -> Self {
        self.roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }

    fn accepts(&self, form: &HashMap<String, String>) -> bool {
        if let (Some(expected), Some(given)) = (&self.secret, form.get("client_secret")) {
            return expected == given;
        }
        if !self.accepts_certificates {
            return false;
        }
        form.get("client_assertion")
            .and_then(|assertion| assertion.split('.').nth(1))
            .and_then(|payload| URL_SAFE_NO_PAD.decode(payload).ok())
            .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
            .is_some_and(|claims| claims["iss"] == self.app_id.as_str())
    }
}

struct EndpointState {
    apps: Vec<MockApp>,
    requests: AtomicUsize,
    lifetime_secs: AtomicI64,
    issued_offset_secs: AtomicI64,
    rejecting: AtomicBool,
    stalled: AtomicBool,
}

/// Running mock token endpoint. Aborted on drop.
pub struct MockTokenEndpoint {
    /// Base URL to use as the authority
    pub authority: String,
    state: Arc<EndpointState>,
    server: JoinHandle<()>,
}

impl MockTokenEndpoint {
    pub async fn start(apps: Vec<MockApp>) -> Self {
        let state = Arc::new(EndpointState {
            apps,
            requests: AtomicUsize::new(0),
            lifetime_secs: AtomicI64::new(3599),
            issued_offset_secs: AtomicI64::new(0),
            rejecting: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
        });

        let app = Router::new()
            .route("/{tenant}/oauth2/token", post(issue))
            .with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock token endpoint");
        let addr = listener.local_addr().expect("local addr");
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            authority: format!("http://{addr}"),
            state,
            server,
        }
    }

    /// Token requests received so far, accepted or not.
    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    /// Lifetime of tokens issued from now on.
    pub fn set_lifetime(&self, secs: i64) {
        self.state.lifetime_secs.store(secs, Ordering::SeqCst);
    }

    /// Shift the `iat` claim of issued tokens to simulate a skewed clock.
    pub fn set_issued_offset(&self, secs: i64) {
        self.state.issued_offset_secs.store(secs, Ordering::SeqCst);
    }

    /// Reject every request with 401 while set.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.state.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// Hold every request open without answering while set.
    pub fn set_stalled(&self, stalled: bool) {
        self.state.stalled.store(stalled, Ordering::SeqCst);
    }
}

impl Drop for MockTokenEndpoint {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn issue(
    State(state): State<Arc<EndpointState>>,
    Path(tenant): Path<String>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);
    if state.stalled.load(Ordering::SeqCst) {
        std::future::pending::<()>().await;
    }

    let client_id = form.get("client_id").map(String::as_str).unwrap_or("");
    let app = state.apps.iter().find(|app| {
        app.tenant_id == tenant && app.app_id == client_id && app.accepts(&form)
    });
    let app = match app {
        Some(app) if !state.rejecting.load(Ordering::SeqCst) => app,
        _ => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "invalid_client"})),
            )
                .into_response();
        }
    };

    let now = Utc::now().timestamp();
    let lifetime = state.lifetime_secs.load(Ordering::SeqCst);
    let iat = now + state.issued_offset_secs.load(Ordering::SeqCst);
    let token = unsigned_token(&json!({
        "aud": form.get("resource"),
        "tid": tenant,
        "appid": app.app_id,
        "roles": app.roles,
        "iat": iat,
        "nbf": iat,
        "exp": now + lifetime,
    }));

    Json(json!({
        "token_type": "Bearer",
        "expires_in": lifetime.to_string(),
        "access_token": token,
    }))
    .into_response()
}
