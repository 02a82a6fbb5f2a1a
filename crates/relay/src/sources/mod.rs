//! Built-in Microsoft 365 sources
//!
//! Every source resolves its own credentials and owns its own
//! `RequestDispatcher` at construction, then keeps a "since" mark that each
//! successful `list()` moves to the poll start time.

pub mod incidents;
pub mod office365;

pub use incidents::IncidentSource;
pub use office365::Office365Activities;

use std::sync::Arc;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use dispatch::{DispatchPolicy, Page, RequestDispatcher};
use serde_json::Value;
use tenant_auth::{AuthSettings, CredentialResolver, ResolvedCredentialSet};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::Result;

/// What a source needs to build itself.
#[derive(Debug, Clone)]
pub struct SourceContext {
    pub auth: Arc<AuthSettings>,
    pub dispatch: DispatchPolicy,
    pub cancel: CancellationToken,
    /// How far back the first poll reaches
    pub lookback: Duration,
    /// Replaces the API base URL (the resource id) when set
    pub api_base: Option<String>,
}

impl SourceContext {
    async fn resolve(&self, resource_id: &str, roles: &[&str]) -> Result<ResolvedCredentialSet> {
        Ok(CredentialResolver::new(Arc::clone(&self.auth))
            .resolve(resource_id, roles)
            .await?)
    }

    fn dispatcher(&self) -> RequestDispatcher {
        RequestDispatcher::new(self.dispatch, self.cancel.clone())
            .with_show_secrets(self.auth.show_secrets)
    }

    fn base_url(&self, resource_id: &str) -> String {
        self.api_base
            .as_deref()
            .unwrap_or(resource_id)
            .trim_end_matches('/')
            .to_string()
    }

    fn initial_since(&self) -> DateTime<Utc> {
        Utc::now() - self.lookback
    }
}

/// `@odata.nextLink` continuation used by the Defender and Graph APIs.
pub fn odata_next_link(page: &Page) -> Option<String> {
    page.json::<Value>()
        .ok()?
        .get("@odata.nextLink")?
        .as_str()
        .map(String::from)
}

/// `NextPageUri` header continuation used by the Office 365 Management API.
pub fn next_page_uri(page: &Page) -> Option<String> {
    page.header("NextPageUri").map(String::from)
}

/// OData timestamp literal, UTC with second precision.
pub fn odata_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Elements of the `value` array of each page. Unreadable pages are logged
/// and skipped.
fn value_items(pages: &[Page], source: &str) -> Vec<Value> {
    let mut items = Vec::new();
    for page in pages {
        match page.json::<Value>() {
            Ok(Value::Object(mut body)) => match body.remove("value") {
                Some(Value::Array(values)) => items.extend(values),
                _ => warn!(source, tenant_id = %page.tenant_id, "response has no value array"),
            },
            Ok(_) => warn!(source, tenant_id = %page.tenant_id, "response is not an object"),
            Err(e) => warn!(source, error = %e, "skipping unreadable page"),
        }
    }
    items
}

/// Elements of each page's top-level array.
fn array_items(pages: &[Page], source: &str) -> Vec<Value> {
    let mut items = Vec::new();
    for page in pages {
        match page.json::<Value>() {
            Ok(Value::Array(values)) => items.extend(values),
            Ok(_) => warn!(source, tenant_id = %page.tenant_id, "response is not an array"),
            Err(e) => warn!(source, error = %e, "skipping unreadable page"),
        }
    }
    items
}


#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderMap;

    fn page(body: &str) -> Page {
        Page {
            tenant_id: "t1".into(),
            status: 200,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    #[test]
    fn reads_odata_next_link() {
        let with_next = page(r#"{"value":[],"@odata.nextLink":"https://x/next"}"#);
        assert_eq!(odata_next_link(&with_next).as_deref(), Some("https://x/next"));
        assert_eq!(odata_next_link(&page(r#"{"value":[]}"#)), None);
        assert_eq!(odata_next_link(&page("[]")), None);
    }

    #[test]
    fn reads_next_page_uri_header() {
        let mut p = page("[]");
        p.headers
            .insert("nextpageuri", "https://x/page2".parse().unwrap());
        assert_eq!(next_page_uri(&p).as_deref(), Some("https://x/page2"));
        assert_eq!(next_page_uri(&page("[]")), None);
    }

    #[test]
    fn timestamps_are_utc_seconds() {
        let at = DateTime::parse_from_rfc3339("2024-03-01T10:20:30.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(odata_timestamp(at), "2024-03-01T10:20:30Z");
    }

    #[test]
    fn collects_value_and_array_items() {
        let pages = vec![page(r#"{"value":[{"a":1},{"a":2}]}"#), page("not json"), page(r#"{"value":[{"a":3}]}"#)];
        assert_eq!(value_items(&pages, "test").len(), 3);

        let arrays = vec![page(r#"[{"b":1}]"#), page(r#"{"b":2}"#), page(r#"[{"b":3},{"b":4}]"#)];
        assert_eq!(array_items(&arrays, "test").len(), 3);
    }
}
