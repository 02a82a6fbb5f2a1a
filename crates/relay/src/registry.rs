//! Name → constructor tables for sources and sinks
//!
//! Configured pairs name their source as `(source, operation)` and their
//! sink by kind. Lookups happen once at startup; an unknown name is a
//! configuration error.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::sink::{PlainWebhook, SinkConfig};
use crate::sources::{IncidentSource, Office365Activities, SourceContext};
use crate::{EventSink, EventSource};

/// Future yielding a constructed source.
pub type SourceFuture = Pin<Box<dyn Future<Output = Result<Box<dyn EventSource>>> + Send>>;

/// Builds a source from its context.
pub type SourceConstructor = fn(SourceContext) -> SourceFuture;

/// Builds a sink from its configuration.
pub type SinkConstructor = fn(SinkConfig, CancellationToken) -> Result<Arc<dyn EventSink>>;

fn threat_protection_incidents(context: SourceContext) -> SourceFuture {
    Box::pin(async move {
        let source = IncidentSource::threat_protection(context).await?;
        Ok(Box::new(source) as Box<dyn EventSource>)
    })
}

fn graph_security_incidents(context: SourceContext) -> SourceFuture {
    Box::pin(async move {
        let source = IncidentSource::graph_security(context).await?;
        Ok(Box::new(source) as Box<dyn EventSource>)
    })
}

fn office365_activities(context: SourceContext) -> SourceFuture {
    Box::pin(async move {
        let source = Office365Activities::new(context).await?;
        Ok(Box::new(source) as Box<dyn EventSource>)
    })
}

fn plain_webhook(config: SinkConfig, cancel: CancellationToken) -> Result<Arc<dyn EventSink>> {
    if !(config.address.starts_with("http://") || config.address.starts_with("https://")) {
        return Err(Error::InvalidSink(format!(
            "sink address must be http(s): {}",
            config.address
        )));
    }
    Ok(Arc::new(PlainWebhook::new(config, cancel)))
}

/// Source constructors keyed by `(source, operation)`.
#[derive(Default)]
pub struct SourceRegistry {
    constructors: HashMap<(String, String), SourceConstructor>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in source.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("MicrosoftThreatProtection", "Incidents", threat_protection_incidents);
        registry.register("MicrosoftGraphSecurity", "Incidents", graph_security_incidents);
        registry.register("Office365Management", "Activities", office365_activities);
        registry
    }

    pub fn register(&mut self, source: &str, operation: &str, constructor: SourceConstructor) {
        self.constructors
            .insert((source.to_string(), operation.to_string()), constructor);
    }

    pub fn contains(&self, source: &str, operation: &str) -> bool {
        self.constructors
            .contains_key(&(source.to_string(), operation.to_string()))
    }

    /// Construct the named source. Resolves credentials, so this talks to
    /// the token endpoint.
    pub async fn build(
        &self,
        source: &str,
        operation: &str,
        context: SourceContext,
    ) -> Result<Box<dyn EventSource>> {
        let constructor = self
            .constructors
            .get(&(source.to_string(), operation.to_string()))
            .ok_or_else(|| Error::UnknownSource(format!("{source}.{operation}")))?;
        constructor(context).await
    }
}

/// Sink constructors keyed by kind.
#[derive(Default)]
pub struct SinkRegistry {
    constructors: HashMap<String, SinkConstructor>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in sink.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("Plain", plain_webhook);
        registry
    }

    pub fn register(&mut self, kind: &str, constructor: SinkConstructor) {
        self.constructors.insert(kind.to_string(), constructor);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    pub fn build(&self, config: SinkConfig, cancel: CancellationToken) -> Result<Arc<dyn EventSink>> {
        let constructor = self
            .constructors
            .get(&config.kind)
            .ok_or_else(|| Error::UnknownSink(config.kind.clone()))?;
        constructor(config, cancel)
    }
}
