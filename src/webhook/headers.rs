//! Request header lookup across delivery mechanisms.
//!
//! Depending on how the request reached us, a header may be available as a
//! parsed `HeaderMap` or only as a CGI variable (`HTTP_X_SIGNATURE`).
//! Lookups try the parsed headers first and take the first non-empty value.

use std::collections::HashMap;

use http::HeaderMap;

/// Header carrying the payload HMAC
pub const SIGNATURE_HEADER: &str = "x-signature";

/// CGI variable name for a header: `x-fs-timestamp` → `HTTP_X_FS_TIMESTAMP`
pub fn cgi_variable(header_name: &str) -> String {
    format!("HTTP_{}", header_name.replace('-', "_").to_uppercase())
}

/// Layered header sources for a single request
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderSources<'a> {
    native: Option<&'a HeaderMap>,
    cgi: Option<&'a HashMap<String, String>>,
}

impl<'a> HeaderSources<'a> {
    /// No sources; every lookup misses
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the framework's parsed headers
    pub fn with_native(mut self, headers: &'a HeaderMap) -> Self {
        self.native = Some(headers);
        self
    }

    /// Use a CGI-style environment map
    pub fn with_cgi(mut self, env: &'a HashMap<String, String>) -> Self {
        self.cgi = Some(env);
        self
    }

    /// Trimmed value of the first non-empty match, if any.
    pub fn get(&self, name: &str) -> Option<String> {
        self.native_value(name).or_else(|| self.cgi_value(name))
    }

    /// The `X-Signature` value, or empty when absent
    pub fn signature(&self) -> String {
        self.get(SIGNATURE_HEADER).unwrap_or_default()
    }

    fn native_value(&self, name: &str) -> Option<String> {
        self.native?
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::trim)
            .find(|value| !value.is_empty())
            .map(str::to_string)
    }

    fn cgi_value(&self, name: &str) -> Option<String> {
        self.cgi?
            .get(&cgi_variable(name))
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_cgi_variable_name() {
        assert_eq!(cgi_variable("x-signature"), "HTTP_X_SIGNATURE");
        assert_eq!(cgi_variable("X-FS-Timestamp"), "HTTP_X_FS_TIMESTAMP");
    }

    #[test]
    fn test_native_lookup_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Signature", HeaderValue::from_static(" abc "));
        let sources = HeaderSources::new().with_native(&headers);
        assert_eq!(sources.get("x-signature").as_deref(), Some("abc"));
        assert_eq!(sources.signature(), "abc");
    }

    #[test]
    fn test_falls_through_empty_native_to_cgi() {
        let cgi = HashMap::from([("HTTP_X_SIGNATURE".to_string(), "from-cgi".to_string())]);

        let mut headers = HeaderMap::new();
        headers.insert("x-signature", HeaderValue::from_static("from-native"));
        let both = HeaderSources::new().with_native(&headers).with_cgi(&cgi);
        assert_eq!(both.signature(), "from-native");

        headers.insert("x-signature", HeaderValue::from_static(""));
        let empty_native = HeaderSources::new().with_native(&headers).with_cgi(&cgi);
        assert_eq!(empty_native.signature(), "from-cgi");
    }

    #[test]
    fn test_missing_everywhere() {
        let sources = HeaderSources::new();
        assert_eq!(sources.get("x-timestamp"), None);
        assert_eq!(sources.signature(), "");
    }
}
