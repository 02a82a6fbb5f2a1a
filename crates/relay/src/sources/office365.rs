//! Office 365 Management activity feed
//!
//! The feed is subscription based: every content type must be started once
//! per tenant before content blobs are listed. Listing returns blob
//! descriptors (paged through the `NextPageUri` header); each descriptor's
//! `contentUri` is then fetched with the credential of the tenant named in
//! the URI, and the activities are the elements of the returned arrays.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Duration, DurationRound, Utc};
use dispatch::{DispatchRequest, Page, RequestDispatcher};
use serde_json::Value;
use tenant_auth::ResolvedCredentialSet;
use tracing::{debug, info, warn};

use super::{SourceContext, array_items, next_page_uri};
use crate::EventSource;
use crate::error::Result;

const ID: &str = "Office365Management.Activities";
const RESOURCE_ID: &str = "https://manage.office.com";
const ROLES: &[&str] = &["ActivityFeed.Read", "ActivityFeed.ReadDlp", "ServiceHealth.Read"];
const API_VERSION: &str = "v1.0";

/// Content types subscribed and listed on every tenant.
pub const CONTENT_TYPES: [&str; 5] = [
    "Audit.AzureActiveDirectory",
    "Audit.Exchange",
    "Audit.SharePoint",
    "Audit.General",
    "DLP.All",
];

/// The API rejects listing windows longer than 24 hours.
const MAX_WINDOW_HOURS: i64 = 24;

/// Activities from all subscribed content types.
pub struct Office365Activities {
    base_url: String,
    credentials: ResolvedCredentialSet,
    dispatcher: RequestDispatcher,
    since: DateTime<Utc>,
}

impl Office365Activities {
    /// Resolve credentials and start every content-type subscription.
    pub async fn new(context: SourceContext) -> Result<Self> {
        let credentials = context.resolve(RESOURCE_ID, ROLES).await?;
        let mut source = Self {
            base_url: context.base_url(RESOURCE_ID),
            credentials,
            dispatcher: context.dispatcher(),
            since: context.initial_since(),
        };

        let subscribed = source.subscribe().await;
        info!(
            source = ID,
            tenants = source.credentials.len(),
            fully_subscribed = subscribed,
            "activity feed source ready"
        );
        Ok(source)
    }

    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }

    fn feed_url(&self, tail: &str) -> String {
        format!(
            "{}/api/{API_VERSION}/{{TENANTID}}/activity/feed/subscriptions/{tail}",
            self.base_url
        )
    }

    /// Start all subscriptions, then count tenants with every content
    /// type enabled. A 400 from `start` means already subscribed.
    async fn subscribe(&mut self) -> usize {
        for content_type in CONTENT_TYPES {
            let url = self.feed_url(&format!(
                "start?contentType={content_type}&PublisherIdentifier={{TENANTID}}"
            ));
            self.dispatcher
                .send(&DispatchRequest::subscribe(url), &self.credentials)
                .await;
        }

        let url = self.feed_url("list?PublisherIdentifier={TENANTID}");
        let pages = self
            .dispatcher
            .send(&DispatchRequest::get(url), &self.credentials)
            .await;

        pages
            .iter()
            .filter(|page| {
                let enabled = enabled_subscriptions(page);
                debug!(tenant_id = %page.tenant_id, enabled, "activity feed subscriptions");
                enabled >= CONTENT_TYPES.len()
            })
            .count()
    }

    async fn poll(&mut self) -> Result<Vec<Value>> {
        let (start, end) = listing_window(self.since, Utc::now());
        let start_param = feed_timestamp(start);
        let end_param = feed_timestamp(end);

        let mut blobs = Vec::new();
        for content_type in CONTENT_TYPES {
            let url = self.feed_url(&format!(
                "content?contentType={content_type}&PublisherIdentifier={{TENANTID}}&startTime={start_param}&endTime={end_param}"
            ));
            let pages = self
                .dispatcher
                .send_paginated(&DispatchRequest::get(url), &self.credentials, next_page_uri)
                .await;
            blobs.extend(pages.iter().flat_map(content_uris));
        }
        self.since = end;

        let mut activities = Vec::new();
        for (page_tenant, content_uri) in blobs {
            let tenant_id = tenant_from_content_uri(&content_uri, &self.base_url)
                .unwrap_or(page_tenant);
            let separator = if content_uri.contains('?') { '&' } else { '?' };
            let url = format!("{content_uri}{separator}PublisherIdentifier={tenant_id}");
            let request = DispatchRequest::get(url).pinned(tenant_id);
            let pages = self.dispatcher.send(&request, &self.credentials).await;
            activities.extend(array_items(&pages, ID));
        }

        debug!(source = ID, start = %start, end = %end, items = activities.len(), "listed activities");
        Ok(activities)
    }
}

impl EventSource for Office365Activities {
    fn id(&self) -> &str {
        ID
    }

    fn list<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Result<Vec<Value>>> + Send + 'a>> {
        Box::pin(self.poll())
    }
}

/// Second-precision window from `since` to `now`, at most 24 hours long.
fn listing_window(since: DateTime<Utc>, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let second = Duration::seconds(1);
    let start = since.duration_trunc(second).unwrap_or(since);
    let now = now.duration_trunc(second).unwrap_or(now);
    let end = now.min(start + Duration::hours(MAX_WINDOW_HOURS));
    (start, end)
}

/// `2024-03-01T10:20:30`, the form the feed accepts for start and end times.
fn feed_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// `(tenant of the listing page, contentUri)` for every blob descriptor.
fn content_uris(page: &Page) -> Vec<(String, String)> {
    match page.json::<Value>() {
        Ok(Value::Array(blobs)) => blobs
            .iter()
            .filter_map(|blob| blob.get("contentUri")?.as_str())
            .map(|uri| (page.tenant_id.clone(), uri.to_string()))
            .collect(),
        Ok(_) => {
            warn!(source = ID, tenant_id = %page.tenant_id, "content listing is not an array");
            Vec::new()
        }
        Err(e) => {
            warn!(source = ID, error = %e, "skipping unreadable content listing");
            Vec::new()
        }
    }
}

/// The tenant segment following `{base}/api/v1.0/` in a content URI.
fn tenant_from_content_uri(uri: &str, base_url: &str) -> Option<String> {
    let prefix = format!("{base_url}/api/{API_VERSION}/");
    let rest = uri.strip_prefix(&prefix)?;
    let tenant = rest.split(['/', '?']).next()?;
    (!tenant.is_empty()).then(|| tenant.to_string())
}

fn enabled_subscriptions(page: &Page) -> usize {
    match page.json::<Value>() {
        Ok(Value::Array(subscriptions)) => subscriptions
            .iter()
            .filter(|s| {
                s.get("status")
                    .and_then(Value::as_str)
                    .is_some_and(|status| status.eq_ignore_ascii_case("enabled"))
            })
            .count(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use axum::Router;
    use axum::extract::{Path, Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use serde_json::json;

    use crate::sources::test_support::{context, serve, token_endpoint};

    #[derive(Clone, Default)]
    struct Feed {
        base: Arc<Mutex<String>>,
        started: Arc<Mutex<Vec<String>>>,
        windows: Arc<Mutex<Vec<(String, String)>>>,
        fetched: Arc<Mutex<Vec<(String, String)>>>,
    }

    async fn start(
        State(feed): State<Feed>,
        Path(tenant): Path<String>,
        Query(query): Query<HashMap<String, String>>,
    ) -> StatusCode {
        let content_type = query.get("contentType").cloned().unwrap_or_default();
        feed.started
            .lock()
            .unwrap()
            .push(format!("{tenant}:{content_type}"));
        if content_type == "Audit.General" {
            // Already subscribed
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::OK
        }
    }

    async fn list_subscriptions() -> axum::Json<Value> {
        let subs: Vec<Value> = CONTENT_TYPES
            .iter()
            .map(|ct| json!({"contentType": ct, "status": "enabled"}))
            .collect();
        axum::Json(Value::Array(subs))
    }

    async fn content(
        State(feed): State<Feed>,
        Path(tenant): Path<String>,
        Query(query): Query<HashMap<String, String>>,
    ) -> impl IntoResponse {
        let content_type = query.get("contentType").cloned().unwrap_or_default();
        let base = feed.base.lock().unwrap().clone();
        let mut headers = HeaderMap::new();

        if content_type != "Audit.Exchange" {
            return (headers, String::new());
        }
        if !query.contains_key("page") {
            feed.windows.lock().unwrap().push((
                query.get("startTime").cloned().unwrap_or_default(),
                query.get("endTime").cloned().unwrap_or_default(),
            ));
            headers.insert(
                "nextpageuri",
                format!(
                    "{base}/api/v1.0/{tenant}/activity/feed/subscriptions/content?contentType=Audit.Exchange&page=2"
                )
                .parse()
                .unwrap(),
            );
            let body = json!([{"contentUri": format!("{base}/api/v1.0/{tenant}/activity/feed/audit/blob1")}]);
            return (headers, body.to_string());
        }
        let body = json!([{"contentUri": format!("{base}/api/v1.0/{tenant}/activity/feed/audit/blob2")}]);
        (headers, body.to_string())
    }

    async fn blob(
        State(feed): State<Feed>,
        Path((tenant, blob)): Path<(String, String)>,
        Query(query): Query<HashMap<String, String>>,
    ) -> axum::Json<Value> {
        feed.fetched.lock().unwrap().push((
            tenant.clone(),
            query.get("PublisherIdentifier").cloned().unwrap_or_default(),
        ));
        axum::Json(json!([
            {"Id": format!("{blob}-a"), "OrganizationId": tenant},
            {"Id": format!("{blob}-b"), "OrganizationId": tenant},
        ]))
    }

    async fn feed_server(feed: Feed) -> String {
        let base = serve(
            Router::new()
                .route(
                    "/api/v1.0/{tenant}/activity/feed/subscriptions/start",
                    post(start),
                )
                .route(
                    "/api/v1.0/{tenant}/activity/feed/subscriptions/list",
                    get(list_subscriptions),
                )
                .route(
                    "/api/v1.0/{tenant}/activity/feed/subscriptions/content",
                    get(content),
                )
                .route("/api/v1.0/{tenant}/activity/feed/audit/{blob}", get(blob))
                .with_state(feed.clone()),
        )
        .await;
        *feed.base.lock().unwrap() = base.clone();
        base
    }

    #[tokio::test]
    async fn subscribes_every_content_type_per_tenant() {
        let endpoint = token_endpoint(&["t1", "t2"], ROLES).await;
        let feed = Feed::default();
        let base = feed_server(feed.clone()).await;

        let source = Office365Activities::new(context(&endpoint, &["t1", "t2"], &base))
            .await
            .unwrap();
        assert_eq!(source.id(), ID);

        let started = feed.started.lock().unwrap();
        assert_eq!(started.len(), 10);
        assert!(started.contains(&"t1:DLP.All".to_string()));
        assert!(started.contains(&"t2:Audit.AzureActiveDirectory".to_string()));
    }

    #[tokio::test]
    async fn fetches_blobs_pinned_to_their_tenant() {
        let endpoint = token_endpoint(&["t1", "t2"], ROLES).await;
        let feed = Feed::default();
        let base = feed_server(feed.clone()).await;

        let mut source = Office365Activities::new(context(&endpoint, &["t1", "t2"], &base))
            .await
            .unwrap();
        let items = source.list().await.unwrap();

        // Two tenants, two listing pages each, one blob per page, two items per blob
        assert_eq!(items.len(), 8);
        let ids: Vec<&str> = items.iter().map(|i| i["Id"].as_str().unwrap()).collect();
        assert_eq!(&ids[..4], &["blob1-a", "blob1-b", "blob2-a", "blob2-b"]);

        let fetched = feed.fetched.lock().unwrap();
        assert_eq!(fetched.len(), 4);
        for (tenant, publisher) in fetched.iter() {
            assert_eq!(tenant, publisher);
        }
        assert_eq!(items[0]["OrganizationId"], "t1");
        assert_eq!(items[4]["OrganizationId"], "t2");
    }

    #[tokio::test]
    async fn first_window_is_clamped_to_a_day() {
        let endpoint = token_endpoint(&["t1"], ROLES).await;
        let feed = Feed::default();
        let base = feed_server(feed.clone()).await;

        let mut ctx = context(&endpoint, &["t1"], &base);
        ctx.lookback = Duration::hours(72);
        let mut source = Office365Activities::new(ctx).await.unwrap();
        let since = source.since();
        source.list().await.unwrap();

        let windows = feed.windows.lock().unwrap();
        let (start, end) = &windows[0];
        assert_eq!(start, &feed_timestamp(since.duration_trunc(Duration::seconds(1)).unwrap()));
        let parse = |s: &str| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").unwrap();
        assert_eq!(parse(end) - parse(start), Duration::hours(24));
        // The next poll continues where this one ended
        assert_eq!(feed_timestamp(source.since()), *end);
    }

    #[test]
    fn window_is_second_precision_and_bounded() {
        let since = DateTime::parse_from_rfc3339("2024-03-01T00:00:00.750Z")
            .unwrap()
            .with_timezone(&Utc);
        let now = since + Duration::hours(2) + Duration::milliseconds(400);
        let (start, end) = listing_window(since, now);
        assert_eq!(feed_timestamp(start), "2024-03-01T00:00:00");
        assert_eq!(feed_timestamp(end), "2024-03-01T02:00:01");

        let (_, end) = listing_window(since, since + Duration::days(3));
        assert_eq!(feed_timestamp(end), "2024-03-02T00:00:00");
    }

    #[test]
    fn extracts_tenant_from_content_uri() {
        let base = "https://manage.office.com";
        assert_eq!(
            tenant_from_content_uri(
                "https://manage.office.com/api/v1.0/41463f53-8812-40f4-890f-865bf6e35190/activity/feed/audit/abc",
                base
            )
            .as_deref(),
            Some("41463f53-8812-40f4-890f-865bf6e35190")
        );
        assert_eq!(tenant_from_content_uri("https://elsewhere/x", base), None);
    }
}
