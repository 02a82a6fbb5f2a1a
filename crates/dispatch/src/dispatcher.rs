//! Authenticated request dispatch
//!
//! Fans one logical API call out across every resolved tenant credential,
//! refreshing tokens on the way and applying the retry policy:
//!
//! - 403 is the remote service throttling us: wait the rate-limit window,
//!   retry once, never twice
//! - a transport error replaces the HTTP client, pauses briefly and retries
//!   once
//! - any other failure abandons the call for that credential
//!
//! Failures never surface as errors; the caller gets the pages that worked.

use std::time::{Duration, Instant};

use reqwest::Method;
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use tenant_auth::{Credential, ResolvedCredentialSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::{Outcome, classify};
use crate::error::{Error, Result};
use crate::sleep::cancellable_sleep;

/// Placeholder replaced by the credential's tenant id in request URLs.
pub const TENANT_PLACEHOLDER: &str = "{TENANTID}";

/// Waits and limits applied to every call.
#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    /// Wait before the single retry after a 403
    pub rate_limit_backoff: Duration,
    /// Wait before the single retry after a transport error
    pub transport_pause: Duration,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            rate_limit_backoff: Duration::from_secs(60),
            transport_pause: Duration::from_secs(2),
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// One logical API call.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub url: String,
    pub method: Method,
    /// Only call with this tenant's credential
    pub pinned_tenant: Option<String>,
    /// A 400 response means "already subscribed"
    pub subscribe: bool,
}

impl DispatchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::GET,
            pinned_tenant: None,
            subscribe: false,
        }
    }

    pub fn subscribe(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::POST,
            pinned_tenant: None,
            subscribe: true,
        }
    }

    pub fn pinned(mut self, tenant_id: impl Into<String>) -> Self {
        self.pinned_tenant = Some(tenant_id.into());
        self
    }
}

/// A successful response body and the headers needed to paginate.
#[derive(Debug, Clone)]
pub struct Page {
    pub tenant_id: String,
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

impl Page {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn is_empty(&self) -> bool {
        self.body.trim().is_empty()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|e| Error::Decode {
            tenant_id: self.tenant_id.clone(),
            message: e.to_string(),
        })
    }
}

/// Executes calls for one data source. Owns its HTTP client.
pub struct RequestDispatcher {
    client: reqwest::Client,
    policy: DispatchPolicy,
    cancel: CancellationToken,
    show_secrets: bool,
}

impl RequestDispatcher {
    pub fn new(policy: DispatchPolicy, cancel: CancellationToken) -> Self {
        Self {
            client: reqwest::Client::new(),
            policy,
            cancel,
            show_secrets: false,
        }
    }

    /// Log bearer tokens in request traces.
    pub fn with_show_secrets(mut self, show: bool) -> Self {
        self.show_secrets = show;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Send `request` once per credential and collect the non-empty bodies.
    pub async fn send(
        &mut self,
        request: &DispatchRequest,
        credentials: &ResolvedCredentialSet,
    ) -> Vec<Page> {
        self.send_paginated(request, credentials, |_| None).await
    }

    /// Like `send`, following continuation URLs produced by `next_page`
    /// with the same credential until it returns `None`.
    pub async fn send_paginated<F>(
        &mut self,
        request: &DispatchRequest,
        credentials: &ResolvedCredentialSet,
        next_page: F,
    ) -> Vec<Page>
    where
        F: Fn(&Page) -> Option<String>,
    {
        let mut pages = Vec::new();

        if let Some(pinned) = &request.pinned_tenant
            && credentials.get(pinned).is_none()
        {
            debug!(tenant_id = %pinned, url = %request.url, "no credential for pinned tenant");
            return pages;
        }

        for credential in credentials.iter() {
            if self.cancel.is_cancelled() {
                break;
            }
            if let Some(pinned) = &request.pinned_tenant
                && credential.tenant_id() != pinned
            {
                continue;
            }

            let tenant_id = credential.tenant_id();
            let mut url = request.url.replace(TENANT_PLACEHOLDER, tenant_id);
            let mut page_count = 0usize;
            while let Some(page) = self.call(request, &url, credential).await {
                page_count += 1;
                let next = next_page(&page);
                if !page.is_empty() {
                    pages.push(page);
                }
                match next {
                    Some(next) => url = next.replace(TENANT_PLACEHOLDER, tenant_id),
                    None => break,
                }
            }
            if page_count > 1 {
                debug!(tenant_id, pages = page_count, "followed continuation pages");
            }
        }

        pages
    }

    /// One call for one credential, with refresh and bounded retries.
    async fn call(
        &mut self,
        request: &DispatchRequest,
        url: &str,
        credential: &Credential,
    ) -> Option<Page> {
        let tenant_id = credential.tenant_id();

        if credential.is_expired().await {
            let refreshed = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                refreshed = credential.refresh_token() => refreshed,
            };
            if let Err(e) = refreshed {
                warn!(tenant_id, app_id = credential.app_id(), error = %e, "token refresh failed, skipping credential");
                return None;
            }
        }

        let mut rate_limit_retried = false;
        let mut transport_retried = false;

        loop {
            let page = match self.attempt(request, url, credential).await {
                Ok(page) => page,
                Err(e) => {
                    metrics::counter!("relay_api_transport_errors_total").increment(1);
                    warn!(tenant_id, url, error = %e, retried = transport_retried, "transport error");
                    self.client = reqwest::Client::new();
                    if transport_retried {
                        return None;
                    }
                    transport_retried = true;
                    if !cancellable_sleep(&self.cancel, self.policy.transport_pause).await {
                        return None;
                    }
                    continue;
                }
            };

            match classify(page.status, page.is_empty(), request.subscribe) {
                Outcome::Content | Outcome::NoContent => return Some(page),
                Outcome::RateLimited if !rate_limit_retried => {
                    metrics::counter!("relay_api_rate_limited_total").increment(1);
                    info!(
                        tenant_id,
                        url,
                        backoff_secs = self.policy.rate_limit_backoff.as_secs(),
                        "rate limited, backing off before retry"
                    );
                    rate_limit_retried = true;
                    if !cancellable_sleep(&self.cancel, self.policy.rate_limit_backoff).await {
                        debug!(tenant_id, "cancelled during rate-limit backoff");
                        return None;
                    }
                }
                Outcome::RateLimited => {
                    metrics::counter!("relay_api_rate_limited_total").increment(1);
                    warn!(tenant_id, url, "still rate limited after backoff, giving up");
                    return None;
                }
                Outcome::AlreadySubscribed => {
                    debug!(tenant_id, url, "already subscribed");
                    return None;
                }
                Outcome::Remote => {
                    warn!(tenant_id, url, status = page.status, body = %page.body, "API returned an error");
                    return None;
                }
            }
        }
    }

    async fn attempt(
        &self,
        request: &DispatchRequest,
        url: &str,
        credential: &Credential,
    ) -> std::result::Result<Page, reqwest::Error> {
        let token = credential.access_token().await;
        debug!(
            method = %request.method,
            url,
            tenant_id = credential.tenant_id(),
            app_id = credential.app_id(),
            token = %token.reveal(self.show_secrets),
            "sending request"
        );

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .bearer_auth(token.expose())
            .timeout(self.policy.request_timeout);
        if request.method == Method::POST {
            builder = builder.body("");
        }

        let started = Instant::now();
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.text().await?;

        let status_label = status.to_string();
        metrics::counter!("relay_api_requests_total", "status" => status_label.clone())
            .increment(1);
        metrics::histogram!("relay_api_request_duration_seconds", "status" => status_label)
            .record(started.elapsed().as_secs_f64());

        Ok(Page {
            tenant_id: credential.tenant_id().to_string(),
            status,
            headers,
            body,
        })
    }
}
