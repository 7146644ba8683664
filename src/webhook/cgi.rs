//! CGI transport.
//!
//! Lets a front web server run `freemkit cgi` per request. Headers are only
//! available as `HTTP_*` variables, the body arrives on stdin and the
//! response is written to stdout with a `Status:` line. A CGI process exits
//! after one response, so events are always processed inline.

use std::collections::HashMap;

use axum::http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::webhook::handler::{has_query_marker, text_response, WebhookState};
use crate::webhook::headers::HeaderSources;

/// Largest body accepted on stdin
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// One CGI request
#[derive(Debug, Clone, Default)]
pub struct CgiRequest {
    /// `REQUEST_METHOD`
    pub method: String,
    /// Full CGI environment
    pub env: HashMap<String, String>,
    /// Request body
    pub body: Vec<u8>,
}

impl CgiRequest {
    /// Build a request from environment variables and a body reader.
    ///
    /// Reads at most `CONTENT_LENGTH` bytes (capped at [`MAX_BODY_BYTES`]).
    pub async fn read<R>(env: HashMap<String, String>, mut stdin: R) -> std::io::Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let method = env
            .get("REQUEST_METHOD")
            .map(|m| m.trim().to_uppercase())
            .unwrap_or_default();

        let length = env
            .get("CONTENT_LENGTH")
            .and_then(|len| len.trim().parse::<usize>().ok())
            .unwrap_or(0)
            .min(MAX_BODY_BYTES);

        let mut body = Vec::with_capacity(length);
        if length > 0 {
            (&mut stdin).take(length as u64).read_to_end(&mut body).await?;
        }

        Ok(Self { method, env, body })
    }

    /// Read the request of the current process
    pub async fn from_process() -> std::io::Result<Self> {
        Self::read(std::env::vars().collect(), tokio::io::stdin()).await
    }
}

/// CGI response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiResponse {
    /// HTTP status
    pub status: StatusCode,
    /// Plain-text body
    pub body: String,
}

impl CgiResponse {
    /// Render as CGI output
    pub fn render(&self) -> String {
        format!(
            "Status: {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
            self.status.as_u16(),
            self.status.canonical_reason().unwrap_or(""),
            self.body.len(),
            self.body
        )
    }
}

/// Handle one CGI request.
///
/// Mirrors the query transport: the `freemkit_webhook` marker must be in
/// `QUERY_STRING` and only POST is accepted.
pub async fn handle_cgi(state: &WebhookState, request: &CgiRequest) -> CgiResponse {
    if !has_query_marker(request.env.get("QUERY_STRING").map(String::as_str)) {
        return CgiResponse {
            status: StatusCode::NOT_FOUND,
            body: "Not Found".to_string(),
        };
    }
    if request.method != "POST" {
        return CgiResponse {
            status: StatusCode::METHOD_NOT_ALLOWED,
            body: "Invalid request method".to_string(),
        };
    }

    let headers = HeaderSources::new().with_cgi(&request.env);
    let (status, body) = text_response(&state.ingest(&request.body, &headers).await);
    CgiResponse { status, body }
}
