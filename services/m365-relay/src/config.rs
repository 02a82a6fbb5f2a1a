//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Application secrets and certificate passwords may be kept out of the TOML
//! entirely: `RELAY_APP_SECRETS` and `RELAY_CERT_PASSWORDS` (comma-separated)
//! replace the file values when set.

use common::Secret;
use dispatch::DispatchPolicy;
use relay::{AuthScheme, SinkConfig, WorkerSettings};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tenant_auth::{AuthSettings, DEFAULT_AUTHORITY, TokenPolicy};

/// Longest first-poll lookback accepted (7 days).
const MAX_LOOKBACK_MINUTES: i64 = 7 * 24 * 60;

/// Widest tolerated token clock skew.
const MAX_CLOCK_SKEW_MINUTES: i64 = 60;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Log tokens and secrets in clear text
    #[serde(default)]
    pub show_secrets: bool,
    pub azure: AzureConfig,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub status: Option<StatusConfig>,
    #[serde(default)]
    pub pairs: Vec<PairConfig>,
}

/// Tenants, applications and the material to try for each of them
#[derive(Debug, Deserialize)]
pub struct AzureConfig {
    #[serde(default = "default_authority")]
    pub authority: String,
    pub tenant_ids: Vec<String>,
    pub app_ids: Vec<String>,
    #[serde(default)]
    pub certificate_paths: Vec<PathBuf>,
    #[serde(default)]
    pub certificate_passwords: Vec<Secret<String>>,
    #[serde(default)]
    pub app_secrets: Vec<Secret<String>>,
}

/// Timing knobs
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub token_expiry_margin_minutes: i64,
    pub poll_interval_secs: u64,
    pub flood_cap_ms: u64,
    pub flood_step_ms: u64,
    pub lookback_minutes: i64,
    pub watchdog_interval_secs: u64,
    pub rate_limit_backoff_secs: u64,
    pub clock_skew_minutes: i64,
    pub request_timeout_secs: u64,
    pub sink_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            token_expiry_margin_minutes: 5,
            poll_interval_secs: 300,
            flood_cap_ms: 1000,
            flood_step_ms: 50,
            lookback_minutes: 1440,
            watchdog_interval_secs: 5,
            rate_limit_backoff_secs: 60,
            clock_skew_minutes: 7,
            request_timeout_secs: 120,
            sink_timeout_secs: 30,
        }
    }
}

/// Optional `/health` + `/metrics` listener
#[derive(Debug, Deserialize)]
pub struct StatusConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// One source operation wired to one sink
#[derive(Debug, Deserialize)]
pub struct PairConfig {
    pub source: String,
    pub operation: String,
    pub sink_address: String,
    #[serde(default = "default_sink_kind")]
    pub sink_kind: String,
    #[serde(default)]
    pub sink_auth_kind: AuthScheme,
    #[serde(default)]
    pub sink_auth: Option<Secret<String>>,
}

fn default_authority() -> String {
    DEFAULT_AUTHORITY.to_string()
}

fn default_max_connections() -> usize {
    64
}

fn default_sink_kind() -> String {
    "Plain".to_string()
}

/// Split a comma-separated env value into secrets, dropping empty entries.
fn secrets_from_env(value: &str) -> Vec<Secret<String>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Secret::new(s.to_owned()))
        .collect()
}

impl Config {
    /// Load configuration from a TOML file, overlay secrets from the
    /// environment, then validate.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(secrets) = std::env::var("RELAY_APP_SECRETS") {
            config.azure.app_secrets = secrets_from_env(&secrets);
        }
        if let Ok(passwords) = std::env::var("RELAY_CERT_PASSWORDS") {
            config.azure.certificate_passwords = secrets_from_env(&passwords);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.azure.tenant_ids.is_empty() {
            return Err(common::Error::Config(
                "azure.tenant_ids must list at least one tenant".into(),
            ));
        }
        if self.azure.app_ids.is_empty() {
            return Err(common::Error::Config(
                "azure.app_ids must list at least one application".into(),
            ));
        }
        if !self.azure.authority.starts_with("http://")
            && !self.azure.authority.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "azure.authority must start with http:// or https://, got: {}",
                self.azure.authority
            )));
        }
        if self.pairs.is_empty() {
            return Err(common::Error::Config(
                "at least one [[pairs]] entry is required".into(),
            ));
        }
        for pair in &self.pairs {
            if !pair.sink_address.starts_with("http://")
                && !pair.sink_address.starts_with("https://")
            {
                return Err(common::Error::Config(format!(
                    "sink_address for {}.{} must start with http:// or https://, got: {}",
                    pair.source, pair.operation, pair.sink_address
                )));
            }
        }

        let settings = &self.settings;
        if settings.poll_interval_secs == 0 {
            return Err(common::Error::Config(
                "poll_interval_secs must be greater than 0".into(),
            ));
        }
        if !(1..=60).contains(&settings.token_expiry_margin_minutes) {
            return Err(common::Error::Config(format!(
                "token_expiry_margin_minutes must be between 1 and 60, got: {}",
                settings.token_expiry_margin_minutes
            )));
        }
        if settings.watchdog_interval_secs == 0 {
            return Err(common::Error::Config(
                "watchdog_interval_secs must be greater than 0".into(),
            ));
        }
        if settings.request_timeout_secs == 0 || settings.sink_timeout_secs == 0 {
            return Err(common::Error::Config(
                "request_timeout_secs and sink_timeout_secs must be greater than 0".into(),
            ));
        }
        if !(0..=MAX_LOOKBACK_MINUTES).contains(&settings.lookback_minutes) {
            return Err(common::Error::Config(format!(
                "lookback_minutes must be between 0 and {MAX_LOOKBACK_MINUTES}, got: {}",
                settings.lookback_minutes
            )));
        }
        if !(0..=MAX_CLOCK_SKEW_MINUTES).contains(&settings.clock_skew_minutes) {
            return Err(common::Error::Config(format!(
                "clock_skew_minutes must be between 0 and {MAX_CLOCK_SKEW_MINUTES}, got: {}",
                settings.clock_skew_minutes
            )));
        }
        if let Some(status) = &self.status
            && status.max_connections == 0
        {
            return Err(common::Error::Config(
                "status.max_connections must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("m365-relay.toml")
    }

    pub fn auth_settings(&self) -> AuthSettings {
        AuthSettings {
            authority: self.azure.authority.trim_end_matches('/').to_string(),
            tenant_ids: self.azure.tenant_ids.clone(),
            app_ids: self.azure.app_ids.clone(),
            certificate_paths: self.azure.certificate_paths.clone(),
            certificate_passwords: self.azure.certificate_passwords.clone(),
            app_secrets: self.azure.app_secrets.clone(),
            policy: TokenPolicy {
                expiry_margin: chrono::Duration::minutes(self.settings.token_expiry_margin_minutes),
                max_clock_skew: chrono::Duration::minutes(self.settings.clock_skew_minutes),
                request_timeout: Duration::from_secs(self.settings.request_timeout_secs),
            },
            show_secrets: self.show_secrets,
        }
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            rate_limit_backoff: Duration::from_secs(self.settings.rate_limit_backoff_secs),
            request_timeout: Duration::from_secs(self.settings.request_timeout_secs),
            ..DispatchPolicy::default()
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            poll_interval: Duration::from_secs(self.settings.poll_interval_secs),
            flood_step: Duration::from_millis(self.settings.flood_step_ms),
            flood_cap: Duration::from_millis(self.settings.flood_cap_ms),
        }
    }

    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.settings.lookback_minutes)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.settings.watchdog_interval_secs)
    }

    pub fn sink_config(&self, pair: &PairConfig) -> SinkConfig {
        SinkConfig {
            address: pair.sink_address.clone(),
            kind: pair.sink_kind.clone(),
            auth_scheme: pair.sink_auth_kind,
            auth: pair
                .sink_auth
                .clone()
                .unwrap_or_else(|| Secret::new(String::new())),
            timeout: Duration::from_secs(self.settings.sink_timeout_secs),
        }
    }
}
