//! Freemius Event Types
//!
//! Freemius posts loosely typed JSON: ids may be numbers or strings and the
//! user object carries arbitrary extra properties. Rather than a rigid
//! struct, the event is kept as a `serde_json::Value` and read through the
//! lookups below, all of which treat missing keys as empty.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{WebhookError, WebhookResult};

/// Known aliases for event types seen in payloads and saved settings.
const EVENT_TYPE_ALIASES: &[(&str, &str)] = &[("installed.installed", "install.installed")];

/// Default free-tier trigger event
pub const DEFAULT_FREE_EVENT: &str = "install.installed";

/// Default paid-tier trigger event
pub const DEFAULT_PAID_EVENT: &str = "license.created";

/// Subscription tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Free users (installs)
    Free,
    /// Paying users (licenses)
    Paid,
}

impl Tier {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Paid => "paid",
        }
    }

    /// Hardcoded trigger event when nothing is configured
    pub fn default_event(&self) -> &'static str {
        match self {
            Self::Free => DEFAULT_FREE_EVENT,
            Self::Paid => DEFAULT_PAID_EVENT,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render a JSON scalar as a string. Objects, arrays, null, `false`, `""`
/// and numeric zero count as empty and yield `None`.
pub fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
        Value::Bool(true) => Some("1".to_string()),
        _ => None,
    }
}

/// A decoded, validated Freemius webhook
#[derive(Debug, Clone)]
pub struct FreemiusEvent {
    /// Tenant identifier
    pub plugin_id: String,
    /// Raw event type as sent
    pub event_type: String,
    /// `objects.user`
    pub user: Map<String, Value>,
}

/// Decode a raw body and extract its plugin id.
pub fn decode_payload(raw: &[u8]) -> WebhookResult<(Value, String)> {
    let value: Value = serde_json::from_slice(raw).map_err(|_| WebhookError::InvalidRequest)?;
    let plugin_id = plugin_id_of(&value).ok_or(WebhookError::InvalidRequest)?;
    Ok((value, plugin_id))
}

impl FreemiusEvent {
    /// Decode and validate a raw payload.
    ///
    /// Checks run in a fixed order so the first failing rule decides the
    /// error: body/plugin id, user object, email, event type. Tenant
    /// existence is checked by the caller.
    pub fn parse(raw: &[u8]) -> WebhookResult<Self> {
        let (value, plugin_id) = decode_payload(raw)?;
        Self::from_payload(plugin_id, &value)
    }

    /// Validate an already decoded payload.
    pub fn from_payload(plugin_id: String, value: &Value) -> WebhookResult<Self> {
        let user = value
            .pointer("/objects/user")
            .and_then(Value::as_object)
            .cloned()
            .ok_or(WebhookError::InvalidData)?;

        let email = user.get("email").and_then(Value::as_str).unwrap_or("");
        if !is_valid_email(email) {
            return Err(WebhookError::InvalidEmail);
        }

        let event_type = value
            .get("type")
            .and_then(scalar_string)
            .ok_or(WebhookError::InvalidEvent)?;

        Ok(Self {
            plugin_id,
            event_type,
            user,
        })
    }

    /// Sanitized email
    pub fn email(&self) -> String {
        self.user
            .get("email")
            .and_then(Value::as_str)
            .map(|email| email.trim().to_string())
            .unwrap_or_default()
    }

    /// First name; the Freemius placeholder name `Admin` is dropped.
    pub fn first_name(&self) -> String {
        display_name(&self.user_property("first"))
    }

    /// Last name; the Freemius placeholder name `Admin` is dropped.
    pub fn last_name(&self) -> String {
        display_name(&self.user_property("last"))
    }

    /// Sanitized user property, empty when absent or not a scalar
    pub fn user_property(&self, name: &str) -> String {
        if name.is_empty() {
            return String::new();
        }
        match self.user.get(name) {
            Some(Value::String(s)) => sanitize_text(s),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => if *b { "1" } else { "" }.to_string(),
            _ => String::new(),
        }
    }

    /// Event type with aliases resolved
    pub fn normalized_type(&self) -> String {
        normalize_event_type(&self.event_type)
    }
}

/// Extract `plugin_id` from a decoded payload
pub fn plugin_id_of(value: &Value) -> Option<String> {
    value.get("plugin_id").and_then(scalar_string)
}

fn display_name(name: &str) -> String {
    if name.eq_ignore_ascii_case("admin") {
        String::new()
    } else {
        name.to_string()
    }
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^[A-Za-z0-9!#$%&'*+/=?^_`{|}~-]+(?:\.[A-Za-z0-9!#$%&'*+/=?^_`{|}~-]+)*@(?:[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z]{2,63}$",
        )
        .expect("email regex is valid")
    })
}

/// Validate an email address (dot-atom local part, dotted hostname).
pub fn is_valid_email(email: &str) -> bool {
    let email = email.trim();
    if email.is_empty() || email.len() > 254 {
        return false;
    }
    match email.split_once('@') {
        Some((local, _)) if local.len() <= 64 => email_regex().is_match(email),
        _ => false,
    }
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]*>").expect("tag regex is valid"))
}

/// Strip markup and control characters and collapse whitespace.
pub fn sanitize_text(text: &str) -> String {
    let stripped = tag_regex().replace_all(text, "");
    stripped
        .split(|c: char| c.is_whitespace() || c.is_control())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Case-fold, trim and resolve aliases.
pub fn normalize_event_type(event_type: &str) -> String {
    let event_type = event_type.trim().to_lowercase();
    EVENT_TYPE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == event_type)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(event_type)
}

/// Normalize a list of event types, dropping empties and duplicates while
/// keeping the first occurrence's position.
pub fn normalize_event_types<S: AsRef<str>>(event_types: &[S]) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(event_types.len());
    for event_type in event_types {
        let event_type = normalize_event_type(event_type.as_ref());
        if !event_type.is_empty() && !normalized.contains(&event_type) {
            normalized.push(event_type);
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_parse_valid_event() {
        let raw = payload(json!({
            "plugin_id": 1234,
            "type": "install.installed",
            "objects": {"user": {"email": "jane@example.com", "first": "Jane", "last": "Doe"}}
        }));
        let event = FreemiusEvent::parse(&raw).unwrap();
        assert_eq!(event.plugin_id, "1234");
        assert_eq!(event.email(), "jane@example.com");
        assert_eq!(event.first_name(), "Jane");
        assert_eq!(event.last_name(), "Doe");
    }

    #[test]
    fn test_parse_error_order() {
        assert_eq!(
            FreemiusEvent::parse(b"not json").unwrap_err(),
            WebhookError::InvalidRequest
        );
        assert_eq!(
            FreemiusEvent::parse(&payload(json!({"plugin_id": ""}))).unwrap_err(),
            WebhookError::InvalidRequest
        );
        assert_eq!(
            FreemiusEvent::parse(&payload(json!({"plugin_id": "1", "objects": {}}))).unwrap_err(),
            WebhookError::InvalidData
        );
        assert_eq!(
            FreemiusEvent::parse(&payload(json!({
                "plugin_id": "1",
                "objects": {"user": {"email": "nope"}}
            })))
            .unwrap_err(),
            WebhookError::InvalidEmail
        );
        assert_eq!(
            FreemiusEvent::parse(&payload(json!({
                "plugin_id": "1",
                "objects": {"user": {"email": "a@example.com"}}
            })))
            .unwrap_err(),
            WebhookError::InvalidEvent
        );
    }

    #[test]
    fn test_admin_placeholder_names_are_dropped() {
        let raw = payload(json!({
            "plugin_id": "1",
            "type": "license.created",
            "objects": {"user": {"email": "a@example.com", "first": "ADMIN", "last": "admin"}}
        }));
        let event = FreemiusEvent::parse(&raw).unwrap();
        assert_eq!(event.first_name(), "");
        assert_eq!(event.last_name(), "");
    }

    #[test]
    fn test_user_property_lookup() {
        let raw = payload(json!({
            "plugin_id": "1",
            "type": "x",
            "objects": {"user": {
                "email": "a@example.com",
                "country": " <b>United</b>\n Kingdom ",
                "id": 42,
                "nested": {"a": 1}
            }}
        }));
        let event = FreemiusEvent::parse(&raw).unwrap();
        assert_eq!(event.user_property("country"), "United Kingdom");
        assert_eq!(event.user_property("id"), "42");
        assert_eq!(event.user_property("nested"), "");
        assert_eq!(event.user_property("missing"), "");
        assert_eq!(event.user_property(""), "");
    }

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("user@example.com"));
        assert!(is_valid_email("first.last+tag@sub.example.co.uk"));
        assert!(!is_valid_email(""));
        assert!(!is_valid_email("user@localhost"));
        assert!(!is_valid_email("user@@example.com"));
        assert!(!is_valid_email(".user@example.com"));
        assert!(!is_valid_email("us..er@example.com"));
        assert!(!is_valid_email("user example@example.com"));
    }

    #[test]
    fn test_normalize_event_type_aliases() {
        assert_eq!(normalize_event_type(" Installed.Installed "), "install.installed");
        assert_eq!(normalize_event_type("LICENSE.created"), "license.created");
    }

    #[test]
    fn test_normalize_event_types_dedups_in_order() {
        let normalized =
            normalize_event_types(&["installed.installed", "", "install.installed", "b"]);
        assert_eq!(normalized, vec!["install.installed", "b"]);
    }

    #[test]
    fn test_scalar_string() {
        assert_eq!(scalar_string(&json!("abc")), Some("abc".to_string()));
        assert_eq!(scalar_string(&json!(12)), Some("12".to_string()));
        assert_eq!(scalar_string(&json!(0)), None);
        assert_eq!(scalar_string(&json!("")), None);
        assert_eq!(scalar_string(&json!(null)), None);
        assert_eq!(scalar_string(&json!([1])), None);
    }
}
