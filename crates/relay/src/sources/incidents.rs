//! Incident feeds (Microsoft 365 Defender and Microsoft Graph Security)
//!
//! Both APIs list incidents updated since a timestamp through an OData
//! `$filter`, return them in a `value` array and page with
//! `@odata.nextLink`. They differ only in resource, role and path.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use dispatch::{DispatchRequest, RequestDispatcher};
use serde_json::Value;
use tenant_auth::ResolvedCredentialSet;
use tracing::{debug, info};

use super::{SourceContext, odata_next_link, odata_timestamp, value_items};
use crate::EventSource;
use crate::error::Result;

/// Fixed shape of one incident API.
#[derive(Debug, Clone, Copy)]
struct IncidentApi {
    id: &'static str,
    resource_id: &'static str,
    roles: &'static [&'static str],
    path: &'static str,
    filter_field: &'static str,
}

const THREAT_PROTECTION: IncidentApi = IncidentApi {
    id: "MicrosoftThreatProtection.Incidents",
    resource_id: "https://api.security.microsoft.com",
    roles: &["Incident.Read.All"],
    path: "/api/incidents",
    filter_field: "lastUpdateTime",
};

const GRAPH_SECURITY: IncidentApi = IncidentApi {
    id: "MicrosoftGraphSecurity.Incidents",
    resource_id: "https://graph.microsoft.com",
    roles: &["SecurityIncident.Read.All"],
    path: "/v1.0/security/incidents",
    filter_field: "lastUpdateDateTime",
};

/// Lists incidents updated since the previous poll.
pub struct IncidentSource {
    api: IncidentApi,
    base_url: String,
    credentials: ResolvedCredentialSet,
    dispatcher: RequestDispatcher,
    since: DateTime<Utc>,
}

impl IncidentSource {
    /// Microsoft 365 Defender incidents.
    pub async fn threat_protection(context: SourceContext) -> Result<Self> {
        Self::build(THREAT_PROTECTION, context).await
    }

    /// Microsoft Graph Security incidents.
    pub async fn graph_security(context: SourceContext) -> Result<Self> {
        Self::build(GRAPH_SECURITY, context).await
    }

    async fn build(api: IncidentApi, context: SourceContext) -> Result<Self> {
        let credentials = context.resolve(api.resource_id, api.roles).await?;
        info!(source = api.id, tenants = credentials.len(), "incident source ready");
        Ok(Self {
            api,
            base_url: context.base_url(api.resource_id),
            credentials,
            dispatcher: context.dispatcher(),
            since: context.initial_since(),
        })
    }

    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }

    fn list_url(&self) -> String {
        format!(
            "{}{}?$filter={}+ge+{}",
            self.base_url,
            self.api.path,
            self.api.filter_field,
            odata_timestamp(self.since)
        )
    }

    async fn poll(&mut self) -> Result<Vec<Value>> {
        let started = Utc::now();
        let request = DispatchRequest::get(self.list_url());
        let pages = self
            .dispatcher
            .send_paginated(&request, &self.credentials, odata_next_link)
            .await;
        let items = value_items(&pages, self.api.id);

        debug!(source = self.api.id, since = %self.since, pages = pages.len(), items = items.len(), "listed incidents");
        self.since = started;
        Ok(items)
    }
}

impl EventSource for IncidentSource {
    fn id(&self) -> &str {
        self.api.id
    }

    fn list<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Result<Vec<Value>>> + Send + 'a>> {
        Box::pin(self.poll())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use axum::Router;
    use axum::extract::{Query, State};
    use axum::routing::get;
    use serde_json::json;

    use crate::sources::test_support::{context, serve, token_endpoint};

    #[derive(Clone, Default)]
    struct Api {
        filters: Arc<Mutex<Vec<String>>>,
        base: Arc<Mutex<String>>,
    }

    async fn incidents(
        State(api): State<Api>,
        Query(query): Query<HashMap<String, String>>,
    ) -> axum::Json<Value> {
        if query.contains_key("page2") {
            return axum::Json(json!({"value": [{"incidentId": 3}]}));
        }
        api.filters
            .lock()
            .unwrap()
            .push(query.get("$filter").cloned().unwrap_or_default());
        let next = format!("{}/api/incidents?page2=1", api.base.lock().unwrap());
        axum::Json(json!({
            "value": [{"incidentId": 1}, {"incidentId": 2}],
            "@odata.nextLink": next,
        }))
    }

    #[tokio::test]
    async fn lists_incidents_across_pages_and_advances_since() {
        let endpoint = token_endpoint(&["t1"], &["Incident.Read.All"]).await;
        let api = Api::default();
        let base = serve(
            Router::new()
                .route("/api/incidents", get(incidents))
                .with_state(api.clone()),
        )
        .await;
        *api.base.lock().unwrap() = base.clone();

        let mut source = IncidentSource::threat_protection(context(&endpoint, &["t1"], &base))
            .await
            .unwrap();
        assert_eq!(source.id(), "MicrosoftThreatProtection.Incidents");

        let first_since = source.since();
        assert!(Utc::now() - first_since >= chrono::Duration::minutes(1439));

        let before = Utc::now();
        let items = source.list().await.unwrap();
        let ids: Vec<i64> = items.iter().map(|i| i["incidentId"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(source.since() >= before);

        source.list().await.unwrap();
        let filters = api.filters.lock().unwrap();
        assert_eq!(filters.len(), 2);
        // '+' in the query string decodes to spaces
        assert!(filters[0].starts_with("lastUpdateTime ge "));
        assert_eq!(
            filters[0],
            format!("lastUpdateTime ge {}", odata_timestamp(first_since))
        );
        assert_ne!(filters[0], filters[1]);
    }

    #[tokio::test]
    async fn without_role_polls_nobody() {
        let endpoint = token_endpoint(&["t1"], &["User.Read.All"]).await;
        let api = Api::default();
        let base = serve(
            Router::new()
                .route("/v1.0/security/incidents", get(incidents))
                .with_state(api.clone()),
        )
        .await;

        let mut source = IncidentSource::graph_security(context(&endpoint, &["t1"], &base))
            .await
            .unwrap();
        assert!(source.list().await.unwrap().is_empty());
        assert!(api.filters.lock().unwrap().is_empty());
    }
}
