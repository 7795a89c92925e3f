//! Error taxonomy and HTML error pages for the proxy

use crate::fetch::FetchError;
use crate::landing::escape_html;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::time::Duration;
use thiserror::Error;

/// Maximum number of characters of upstream diagnostics shown to the browser
pub const MAX_DIAGNOSTIC_CHARS: usize = 500;

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// No running container serves the target
    ContainerNotFound,
    /// The in-container fetch command failed
    FetchFailed,
    /// The pipeline exceeded the request timeout
    RequestTimeout,
    /// The upstream response could not be parsed or rewritten
    InvalidUpstreamResponse,
    /// The request method cannot be proxied
    MethodNotAllowed,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::ContainerNotFound => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::FetchFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::InvalidUpstreamResponse => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::ContainerNotFound => "CONTAINER_NOT_FOUND",
            ProxyErrorCode::FetchFailed => "FETCH_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::InvalidUpstreamResponse => "INVALID_UPSTREAM_RESPONSE",
            ProxyErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
        }
    }

    fn title(&self) -> &'static str {
        match self {
            ProxyErrorCode::ContainerNotFound => "No running container",
            ProxyErrorCode::FetchFailed => "Upstream fetch failed",
            ProxyErrorCode::RequestTimeout => "Upstream timed out",
            ProxyErrorCode::InvalidUpstreamResponse => "Invalid upstream response",
            ProxyErrorCode::MethodNotAllowed => "Method not allowed",
        }
    }
}

/// Failures of the proxy pipeline for one request
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no running container found for cluster '{cluster}'")]
    ClusterNotRunning { cluster: String },
    #[error("no running container found for {target}")]
    NoContainer { target: String },
    #[error("fetch from {container} failed: {source}")]
    Fetch {
        container: String,
        #[source]
        source: FetchError,
    },
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
    #[error("{0} requests cannot be proxied; only GET and HEAD are forwarded")]
    MethodNotAllowed(String),
}

impl ProxyError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            ProxyError::ClusterNotRunning { .. } | ProxyError::NoContainer { .. } => {
                ProxyErrorCode::ContainerNotFound
            }
            ProxyError::Fetch { .. } => ProxyErrorCode::FetchFailed,
            ProxyError::Timeout(_) => ProxyErrorCode::RequestTimeout,
            ProxyError::InvalidResponse(_) => ProxyErrorCode::InvalidUpstreamResponse,
            ProxyError::MethodNotAllowed(_) => ProxyErrorCode::MethodNotAllowed,
        }
    }

    /// Render as an HTML error page
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        html_error_response(self.code(), truncate_chars(&self.to_string(), MAX_DIAGNOSTIC_CHARS))
    }
}

/// Truncate to at most `max` characters, marking the cut with an ellipsis
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

/// Create a minimal HTML error page with an X-Proxy-Error header
pub fn html_error_response(code: ProxyErrorCode, message: impl AsRef<str>) -> Response<Full<Bytes>> {
    let status = code.status_code();
    let body = format!(
        r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>{status} {title}</title></head>
<body>
<h1>{status} {title}</h1>
<p>{message}</p>
<p><a href="javascript:history.back()">Back</a> | <a href="/">All clusters</a></p>
</body></html>
"#,
        status = status.as_u16(),
        title = code.title(),
        message = escape_html(message.as_ref()),
    );

    Response::builder()
        .status(status)
        .header("Content-Type", "text/html; charset=utf-8")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}
