//! Kit v4 HTTP client.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument};
use url::Url;

use crate::config::KitConfig;
use crate::error::{ClientError, ClientResult};
use crate::kit::SubscriptionClient;
use crate::webhook::events::is_valid_email;

/// Longest error body kept in [`ClientError::Api`]
const MAX_ERROR_BODY: usize = 512;

#[derive(Serialize)]
struct CreateSubscriber<'a> {
    email_address: &'a str,
    first_name: &'a str,
    state: &'static str,
    fields: &'a BTreeMap<String, String>,
}

/// Client for `https://api.kit.com/v4/`
#[derive(Clone)]
pub struct KitClient {
    http: reqwest::Client,
    base: Url,
    connected: bool,
}

impl KitClient {
    /// Build a client from configuration.
    ///
    /// A missing access token is not an error here: every call fails with
    /// [`ClientError::NotConnected`] until one is configured.
    pub fn new(config: &KitConfig) -> ClientResult<Self> {
        let base = parse_base(&config.api_base)?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let token = config.access_token.as_deref().unwrap_or("").trim();
        if !token.is_empty() {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| ClientError::Config("access token is not a valid header".into()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .user_agent(concat!("freemkit/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base,
            connected: !token.is_empty(),
        })
    }

    /// Whether an access token is configured
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Resolve a path against the API base
    pub fn endpoint(&self, path: &str) -> ClientResult<Url> {
        self.base
            .join(path)
            .map_err(|e| ClientError::Config(e.to_string()))
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> ClientResult<Value> {
        if !self.connected {
            return Err(ClientError::NotConnected);
        }

        let url = self.endpoint(path)?;
        let response = self.http.post(url).json(body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ClientError::Api {
                status: status.as_u16(),
                message: truncate(&text, MAX_ERROR_BODY),
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ClientError::Api {
            status: status.as_u16(),
            message: format!("unreadable response: {e}"),
        })
    }
}

fn parse_base(raw: &str) -> ClientResult<Url> {
    let mut base = raw.trim().to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Url::parse(&base).map_err(|e| ClientError::Config(format!("invalid api_base '{raw}': {e}")))
}

/// Parse a Kit resource id; ids are positive integers.
pub fn parse_resource_id(raw: &str) -> ClientResult<u64> {
    match raw.trim().parse::<u64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(ClientError::InvalidId(raw.to_string())),
    }
}

/// Extract `subscriber.id` from a create-subscriber response.
pub fn subscriber_id_from(response: &Value) -> ClientResult<u64> {
    response
        .pointer("/subscriber/id")
        .and_then(|id| id.as_u64().or_else(|| id.as_str()?.parse().ok()))
        .filter(|id| *id > 0)
        .ok_or(ClientError::MissingSubscriberId)
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[async_trait]
impl SubscriptionClient for KitClient {
    #[instrument(skip_all)]
    async fn create_or_get_subscriber(
        &self,
        email: &str,
        first_name: &str,
        fields: &BTreeMap<String, String>,
    ) -> ClientResult<u64> {
        if !is_valid_email(email) {
            return Err(ClientError::InvalidEmail(email.to_string()));
        }

        let body = CreateSubscriber {
            email_address: email,
            first_name,
            state: "active",
            fields,
        };
        let response = self.post("subscribers", &body).await?;
        let id = subscriber_id_from(&response)?;
        debug!(subscriber_id = id, "Kit subscriber ready");
        Ok(id)
    }

    async fn attach_to_list(&self, list_id: &str, subscriber_id: u64) -> ClientResult<()> {
        let form_id = parse_resource_id(list_id)?;
        self.post(
            &format!("forms/{form_id}/subscribers/{subscriber_id}"),
            &serde_json::json!({}),
        )
        .await?;
        Ok(())
    }

    async fn apply_tag(&self, tag_id: &str, subscriber_id: u64) -> ClientResult<()> {
        let tag_id = parse_resource_id(tag_id)?;
        self.post(
            &format!("tags/{tag_id}/subscribers/{subscriber_id}"),
            &serde_json::json!({}),
        )
        .await?;
        Ok(())
    }
}
