//! Plain JSON webhook sink
//!
//! POSTs each item as `application/json` to the configured address. A non-200
//! answer is resent once, unless the relay is shutting down.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use common::Secret;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::EventSink;

/// How the configured auth value is placed in the `Authorization` header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    /// The value is sent verbatim
    #[default]
    Blank,
    /// `Bearer <value>`
    Bearer,
    /// `Basic <value>`; the value is already base64 encoded
    Basic,
}

/// Sink settings from one configured pair.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub address: String,
    pub kind: String,
    pub auth_scheme: AuthScheme,
    pub auth: Secret<String>,
    pub timeout: Duration,
}

/// Webhook that receives each item as its own JSON POST.
pub struct PlainWebhook {
    client: reqwest::Client,
    address: String,
    authorization: Option<HeaderValue>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl PlainWebhook {
    pub fn new(config: SinkConfig, cancel: CancellationToken) -> Self {
        Self {
            client: reqwest::Client::new(),
            authorization: authorization_header(config.auth_scheme, &config.auth),
            address: config.address,
            timeout: config.timeout,
            cancel,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn post(&self, item: &Value) -> Option<StatusCode> {
        let mut request = self
            .client
            .post(&self.address)
            .timeout(self.timeout)
            .json(item);
        if let Some(value) = &self.authorization {
            request = request.header(AUTHORIZATION, value.clone());
        }

        match request.send().await {
            Ok(response) => Some(response.status()),
            Err(e) => {
                warn!(address = %self.address, error = %e, "webhook request failed");
                None
            }
        }
    }
}

/// Build the sensitive `Authorization` value. Empty auth sends no header.
fn authorization_header(scheme: AuthScheme, auth: &Secret<String>) -> Option<HeaderValue> {
    let auth = auth.expose();
    if auth.is_empty() {
        return None;
    }
    let raw = match scheme {
        AuthScheme::Blank => auth.clone(),
        AuthScheme::Bearer => format!("Bearer {auth}"),
        AuthScheme::Basic => format!("Basic {auth}"),
    };
    match HeaderValue::from_str(&raw) {
        Ok(mut value) => {
            value.set_sensitive(true);
            Some(value)
        }
        Err(e) => {
            warn!(error = %e, "sink auth value is not a valid header, sending without it");
            None
        }
    }
}

impl EventSink for PlainWebhook {
    fn id(&self) -> &str {
        "Plain"
    }

    fn send<'a>(&'a self, item: &'a Value) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            let status = self.post(item).await;
            if status == Some(StatusCode::OK) {
                return true;
            }
            if self.cancel.is_cancelled() {
                debug!(address = %self.address, "shutting down, not resending");
                return false;
            }

            debug!(address = %self.address, status = ?status, "resending webhook");
            let status = self.post(item).await;
            if status == Some(StatusCode::OK) {
                return true;
            }
            warn!(address = %self.address, status = ?status, "webhook resend failed");
            false
        })
    }
}
