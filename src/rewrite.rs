//! Rewrites proxied responses so that navigation stays on the proxy.
//!
//! Two rules, applied in order:
//! 1. absolute or scheme-relative references to internal node addresses
//!    (`//<prefix>-<cluster>-node<N>:<port>`) become `<origin>/proxy/<host>:<port>`;
//! 2. root-relative `href`, `src` and `action` values become
//!    `/proxy/<current target>/<path>`.
//!
//! Inline script data and CSS `url(...)` references are left alone.

use crate::response::UpstreamResponse;
use regex::bytes::{Captures, Regex as BytesRegex};
use regex::Regex;
use std::borrow::Cow;

/// Prefix of every proxied path
pub const PROXY_PATH_PREFIX: &str = "/proxy/";

/// Cache policy for successful non-HTML assets fetched through the exec channel
pub const ASSET_CACHE_CONTROL: &str = "public, max-age=3600";

/// Response headers that are never forwarded
const STRIPPED_HEADERS: &[&str] = &[
    "transfer-encoding",
    "connection",
    "keep-alive",
    "content-length",
    "content-security-policy",
    "content-security-policy-report-only",
    "x-frame-options",
    "strict-transport-security",
];

/// Where the proxy is reachable and which target the response came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteContext {
    /// External base URL of the proxy, without trailing slash
    pub proxy_origin: String,
    /// `host:port` of the fetched resource
    pub current_target: String,
}

impl RewriteContext {
    pub fn new(proxy_origin: impl Into<String>, current_target: impl Into<String>) -> Self {
        Self {
            proxy_origin: proxy_origin.into().trim_end_matches('/').to_string(),
            current_target: current_target.into(),
        }
    }

    fn proxied(&self, host_port: &str) -> String {
        format!("{}{}{}", self.proxy_origin, PROXY_PATH_PREFIX, host_port)
    }
}

/// Compiled rewrite patterns for one container prefix
#[derive(Debug, Clone)]
pub struct Rewriter {
    internal_ref: BytesRegex,
    internal_location: Regex,
    root_relative_attr: BytesRegex,
}

impl Rewriter {
    pub fn new(container_prefix: &str) -> Self {
        let host = format!(r"{}-[A-Za-z0-9_.\-]+?-node\d+", regex::escape(container_prefix));
        let internal_ref = format!(r"(?-u)(?:https?:)?//({}):(\d+)", host);

        Self {
            internal_ref: BytesRegex::new(&internal_ref).expect("valid internal reference regex"),
            internal_location: Regex::new(&format!("^{}", internal_ref))
                .expect("valid internal location regex"),
            root_relative_attr: BytesRegex::new(
                r#"(?i-u)\b(href|src|action)(\s*=\s*)(?:"([^"]*)"|'([^']*)')"#,
            )
            .expect("valid attribute regex"),
        }
    }

    /// Rewrite an HTML body. Bytes outside matched references are untouched.
    pub fn rewrite_body<'a>(&self, html: &'a [u8], ctx: &RewriteContext) -> Cow<'a, [u8]> {
        let absolute = self.internal_ref.replace_all(html, |caps: &Captures| {
            ctx.proxied(&format!(
                "{}:{}",
                String::from_utf8_lossy(&caps[1]),
                String::from_utf8_lossy(&caps[2])
            ))
            .into_bytes()
        });

        let rewritten = self
            .root_relative_attr
            .replace_all(&absolute, |caps: &Captures| rewrite_attribute(caps, ctx))
            .into_owned();

        if rewritten == html {
            Cow::Borrowed(html)
        } else {
            Cow::Owned(rewritten)
        }
    }

    /// Rewrite a `Location` header value
    pub fn rewrite_location(&self, location: &str, ctx: &RewriteContext) -> String {
        if let Some(caps) = self.internal_location.captures(location) {
            let rest = &location[caps.get(0).map(|m| m.end()).unwrap_or(0)..];
            return format!("{}{}", ctx.proxied(&format!("{}:{}", &caps[1], &caps[2])), rest);
        }

        if is_root_relative(location) {
            return format!("{}{}{}", PROXY_PATH_PREFIX, ctx.current_target, location);
        }

        location.to_string()
    }

    /// Headers to send downstream for a proxied response
    pub fn forward_headers(
        &self,
        upstream: &UpstreamResponse,
        ctx: &RewriteContext,
    ) -> Vec<(String, String)> {
        let is_html = upstream.is_html();
        let is_redirect = upstream.is_redirect();
        // Only successful assets get the long-lived cache policy
        let cacheable_asset = !is_html && (200..300).contains(&upstream.status);

        let mut headers: Vec<(String, String)> = upstream
            .headers
            .iter()
            .filter(|(name, _)| !is_stripped(name))
            .filter(|(name, _)| !cacheable_asset || !name.eq_ignore_ascii_case("cache-control"))
            .map(|(name, value)| {
                if is_redirect && name.eq_ignore_ascii_case("location") {
                    (name.clone(), self.rewrite_location(value, ctx))
                } else {
                    (name.clone(), value.clone())
                }
            })
            .collect();

        if cacheable_asset {
            headers.push(("Cache-Control".to_string(), ASSET_CACHE_CONTROL.to_string()));
        }
        headers
    }
}

fn is_stripped(name: &str) -> bool {
    STRIPPED_HEADERS
        .iter()
        .any(|stripped| name.eq_ignore_ascii_case(stripped))
}

/// `/path` but not `//host` and not already `/proxy/...`
fn is_root_relative(value: &str) -> bool {
    value.starts_with('/') && !value.starts_with("//") && !value.starts_with(PROXY_PATH_PREFIX)
}

fn rewrite_attribute(caps: &Captures, ctx: &RewriteContext) -> Vec<u8> {
    let (value, quote) = match (caps.get(3), caps.get(4)) {
        (Some(v), _) => (v.as_bytes(), b'"'),
        (None, Some(v)) => (v.as_bytes(), b'\''),
        (None, None) => return caps[0].to_vec(),
    };

    let value_str = String::from_utf8_lossy(value);
    if !is_root_relative(&value_str) {
        return caps[0].to_vec();
    }

    let mut out = Vec::with_capacity(caps[0].len() + ctx.current_target.len() + 8);
    out.extend_from_slice(&caps[1]);
    out.extend_from_slice(&caps[2]);
    out.push(quote);
    out.extend_from_slice(PROXY_PATH_PREFIX.as_bytes());
    out.extend_from_slice(ctx.current_target.as_bytes());
    out.push(b'/');
    out.extend_from_slice(&value[1..]);
    out.push(quote);
    out
}
