//! Configuration
//!
//! Settings are read from a TOML file and then overridden from the
//! environment. Secrets (the Kit access token) should come from the
//! environment; tenant secrets live in the file next to the tenant they sign.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//!
//! [defaults]
//! kit_form_id = "1234"
//! last_name_field = "last_name"
//! custom_fields = [{ local_name = "country", remote_name = "country_code" }]
//!
//! [webhook]
//! endpoint = "rest"
//! max_age_secs = 900
//!
//! [[plugins]]
//! id = "5678"
//! name = "My Plugin"
//! secret_key = "sk_..."
//! free_form_ids = "111, 112"
//! paid_form_ids = [221]
//! ```

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tracing::{debug, warn};

use crate::error::ConfigError;

/// Default Kit v4 API base URL
pub const DEFAULT_KIT_API_BASE: &str = "https://api.kit.com/v4/";

/// Default maximum webhook age (15 minutes)
pub const DEFAULT_MAX_AGE_SECS: i64 = 15 * 60;

/// One day, the default replay and queue TTL
pub const DAY_SECS: u64 = 24 * 60 * 60;

/// Replay markers never live shorter than this
pub const MIN_REPLAY_TTL_SECS: u64 = 60 * 60;

/// Retry delays are capped at five minutes
pub const MAX_RETRY_DELAY_SECS: u64 = 5 * 60;

/// Split a comma/whitespace separated list, dropping empty items.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListItem {
    Text(String),
    Number(i64),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListValue {
    Text(String),
    Number(i64),
    Items(Vec<ListItem>),
}

/// Accept either `"1, 2 3"` or `[1, "2", "3"]` for list settings.
fn deserialize_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = ListValue::deserialize(deserializer)?;
    Ok(match value {
        ListValue::Text(text) => parse_list(&text),
        ListValue::Number(n) => vec![n.to_string()],
        ListValue::Items(items) => items
            .into_iter()
            .flat_map(|item| match item {
                ListItem::Text(text) => parse_list(&text),
                ListItem::Number(n) => vec![n.to_string()],
            })
            .collect(),
    })
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let item = ListItem::deserialize(deserializer)?;
    Ok(match item {
        ListItem::Text(text) => text.trim().to_string(),
        ListItem::Number(n) => n.to_string(),
    })
}

/// Which inbound transport the server exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    /// `POST /freemkit/v1/webhook`
    #[default]
    Rest,
    /// Any path carrying the `freemkit_webhook` query marker
    Query,
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rest => write!(f, "rest"),
            Self::Query => write!(f, "query"),
        }
    }
}

impl FromStr for EndpointType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rest" => Ok(Self::Rest),
            "query" | "query_var" => Ok(Self::Query),
            _ => Err(format!(
                "invalid webhook endpoint '{}', expected 'rest' or 'query'",
                s
            )),
        }
    }
}

/// HTTP listener settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Kit API connection settings
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct KitConfig {
    /// API base URL, must end with `/`
    pub api_base: String,
    /// OAuth access token (prefer `FREEMKIT_KIT_ACCESS_TOKEN`)
    pub access_token: Option<String>,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for KitConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_KIT_API_BASE.to_string(),
            access_token: None,
            timeout_secs: 30,
        }
    }
}

impl fmt::Debug for KitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KitConfig")
            .field("api_base", &self.api_base)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[redacted]"),
            )
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Maps a property of the Freemius user object to a Kit custom field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CustomFieldMapping {
    /// Property name on `objects.user`
    #[serde(default)]
    pub local_name: String,
    /// Kit custom field key
    pub remote_name: String,
}

/// Site-wide defaults used when a tenant leaves a setting empty.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Fallback Kit form ids for both tiers
    #[serde(deserialize_with = "deserialize_list")]
    pub kit_form_id: Vec<String>,
    /// Fallback Kit tag ids for both tiers
    #[serde(deserialize_with = "deserialize_list")]
    pub kit_tag_id: Vec<String>,
    /// Fallback free-tier trigger events
    #[serde(deserialize_with = "deserialize_list")]
    pub free_event_types: Vec<String>,
    /// Fallback paid-tier trigger events
    #[serde(deserialize_with = "deserialize_list")]
    pub paid_event_types: Vec<String>,
    /// Kit field that receives the user's last name
    pub last_name_field: Option<String>,
    /// Additional user property mappings
    pub custom_fields: Vec<CustomFieldMapping>,
}

/// A registered Freemius product (tenant).
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Freemius plugin id
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    /// Display name
    pub name: String,
    /// Freemius public key
    pub public_key: String,
    /// Freemius secret key, used as the HMAC secret
    pub secret_key: String,
    /// Kit forms for free users
    #[serde(deserialize_with = "deserialize_list")]
    pub free_form_ids: Vec<String>,
    /// Kit tags for free users
    #[serde(deserialize_with = "deserialize_list")]
    pub free_tag_ids: Vec<String>,
    /// Events that subscribe a free user
    #[serde(deserialize_with = "deserialize_list")]
    pub free_event_types: Vec<String>,
    /// Kit forms for paying users
    #[serde(deserialize_with = "deserialize_list")]
    pub paid_form_ids: Vec<String>,
    /// Kit tags for paying users
    #[serde(deserialize_with = "deserialize_list")]
    pub paid_tag_ids: Vec<String>,
    /// Events that subscribe a paying user
    #[serde(deserialize_with = "deserialize_list")]
    pub paid_event_types: Vec<String>,
}

impl PluginConfig {
    /// URL-friendly slug derived from the display name
    pub fn slug(&self) -> String {
        let mut slug = String::with_capacity(self.name.len());
        for c in self.name.trim().chars() {
            if c.is_ascii_alphanumeric() {
                slug.push(c.to_ascii_lowercase());
            } else if !slug.ends_with('-') && !slug.is_empty() {
                slug.push('-');
            }
        }
        slug.trim_end_matches('-').to_string()
    }
}

impl fmt::Debug for PluginConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("public_key", &self.public_key)
            .field("secret_key", &"[redacted]")
            .field("free_form_ids", &self.free_form_ids)
            .field("free_tag_ids", &self.free_tag_ids)
            .field("free_event_types", &self.free_event_types)
            .field("paid_form_ids", &self.paid_form_ids)
            .field("paid_tag_ids", &self.paid_tag_ids)
            .field("paid_event_types", &self.paid_event_types)
            .finish()
    }
}

/// Pipeline policy knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookPolicy {
    /// Inbound transport
    pub endpoint: EndpointType,
    /// Maximum accepted clock distance in seconds (non-positive → default)
    pub max_age_secs: i64,
    /// Reject deliveries that carry no timestamp at all
    pub require_timestamp: bool,
    /// Replay marker lifetime in seconds (at least one hour)
    pub replay_ttl_secs: u64,
    /// Queue record lifetime in seconds
    pub queue_ttl_secs: u64,
    /// Processing attempts before an event is dropped
    pub max_attempts: u32,
    /// Delay before the first asynchronous attempt
    pub initial_delay_ms: u64,
    /// Use deferred processing; when false every event is processed inline
    pub async_processing: bool,
}

impl Default for WebhookPolicy {
    fn default() -> Self {
        Self {
            endpoint: EndpointType::Rest,
            max_age_secs: DEFAULT_MAX_AGE_SECS,
            require_timestamp: false,
            replay_ttl_secs: DAY_SECS,
            queue_ttl_secs: DAY_SECS,
            max_attempts: 3,
            initial_delay_ms: 1000,
            async_processing: true,
        }
    }
}

impl WebhookPolicy {
    /// Effective freshness window
    pub fn max_age(&self) -> Duration {
        let secs = if self.max_age_secs <= 0 {
            DEFAULT_MAX_AGE_SECS
        } else {
            self.max_age_secs
        };
        Duration::from_secs(secs as u64)
    }

    /// Effective replay marker TTL
    pub fn replay_ttl(&self) -> Duration {
        Duration::from_secs(self.replay_ttl_secs.max(MIN_REPLAY_TTL_SECS))
    }

    /// Queue record TTL
    pub fn queue_ttl(&self) -> Duration {
        Duration::from_secs(self.queue_ttl_secs)
    }

    /// Delay before the first attempt
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Delay before retrying after `attempts` failures: one minute per
    /// failure, capped at five minutes.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let secs = (attempts as u64 * 60).min(MAX_RETRY_DELAY_SECS);
        Duration::from_secs(secs)
    }
}

/// Persistence settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the transient and subscriber files; memory only when unset
    pub data_dir: Option<PathBuf>,
}

/// Complete service settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// HTTP listener
    pub server: ServerConfig,
    /// Kit API connection
    pub kit: KitConfig,
    /// Site-wide defaults
    pub defaults: DefaultsConfig,
    /// Pipeline policy
    pub webhook: WebhookPolicy,
    /// Persistence
    pub storage: StorageConfig,
    /// Registered tenants
    pub plugins: Vec<PluginConfig>,
}

impl Settings {
    /// Load settings from a TOML file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut settings = Self::from_toml_str(&content)?;
        settings.apply_env_overrides();
        settings.validate()?;
        debug!(
            path = %path.display(),
            plugins = settings.plugins.len(),
            endpoint = %settings.webhook.endpoint,
            "Loaded configuration"
        );
        Ok(settings)
    }

    /// Parse settings without touching the environment.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Override file values from `FREEMKIT_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = env::var("FREEMKIT_KIT_ACCESS_TOKEN") {
            if !token.is_empty() {
                self.kit.access_token = Some(token);
            }
        }
        if let Ok(base) = env::var("FREEMKIT_KIT_API_BASE") {
            if !base.is_empty() {
                self.kit.api_base = base;
            }
        }
        if let Ok(dir) = env::var("FREEMKIT_DATA_DIR") {
            if !dir.is_empty() {
                self.storage.data_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(endpoint) = env::var("FREEMKIT_WEBHOOK_ENDPOINT") {
            match endpoint.parse() {
                Ok(parsed) => self.webhook.endpoint = parsed,
                Err(e) => warn!("Ignoring FREEMKIT_WEBHOOK_ENDPOINT: {}", e),
            }
        }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashMap::new();
        for plugin in &self.plugins {
            if plugin.id.is_empty() {
                return Err(ConfigError::Invalid(
                    "every [[plugins]] entry needs an id".to_string(),
                ));
            }
            if plugin.secret_key.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "plugin {} has an empty secret_key",
                    plugin.id
                )));
            }
            if seen.insert(plugin.id.as_str(), ()).is_some() {
                return Err(ConfigError::Invalid(format!(
                    "plugin id {} is configured more than once",
                    plugin.id
                )));
            }
        }

        if let Some(field) = self
            .defaults
            .custom_fields
            .iter()
            .find(|field| field.remote_name.trim().is_empty())
        {
            return Err(ConfigError::Invalid(format!(
                "custom field mapping for '{}' has an empty remote_name",
                field.local_name
            )));
        }

        if url::Url::parse(&self.kit.api_base).is_err() {
            return Err(ConfigError::Invalid(format!(
                "kit.api_base '{}' is not a valid URL",
                self.kit.api_base
            )));
        }

        Ok(())
    }

    /// Tenant lookup table built from `[[plugins]]`
    pub fn tenants(&self) -> TenantRegistry {
        TenantRegistry::new(self.plugins.clone())
    }

    /// Minimal settings for tests: one tenant `test-plugin` with secret
    /// `test-secret`.
    pub fn test_config() -> Self {
        Self {
            plugins: vec![PluginConfig {
                id: "test-plugin".to_string(),
                name: "Test Plugin".to_string(),
                secret_key: "test-secret".to_string(),
                ..PluginConfig::default()
            }],
            ..Self::default()
        }
    }
}

/// Read-only tenant lookup by Freemius plugin id.
#[derive(Debug, Clone, Default)]
pub struct TenantRegistry {
    plugins: HashMap<String, PluginConfig>,
}

impl TenantRegistry {
    /// Build from a list of tenant configs
    pub fn new(plugins: impl IntoIterator<Item = PluginConfig>) -> Self {
        Self {
            plugins: plugins
                .into_iter()
                .map(|plugin| (plugin.id.clone(), plugin))
                .collect(),
        }
    }

    /// Look up a tenant
    pub fn get(&self, plugin_id: &str) -> Option<&PluginConfig> {
        self.plugins.get(plugin_id)
    }

    /// Number of registered tenants
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether no tenant is registered
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
