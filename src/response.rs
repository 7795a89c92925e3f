//! Parser for raw HTTP responses captured from `curl -i`
//!
//! The buffer is scanned as bytes; the body is returned as a slice of the
//! original buffer and never decoded.

use hyper::body::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;

static STATUS_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{3})\b").expect("valid status code regex"));

const DEFAULT_STATUS: u16 = 200;

/// A parsed upstream response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamResponse {
    pub status: u16,
    /// Header names keep their case; a repeated name replaces the earlier value
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Offset of the body within the raw buffer
    body_offset: usize,
}

impl UpstreamResponse {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn is_html(&self) -> bool {
        self.content_type()
            .map(|ct| ct.to_ascii_lowercase().contains("text/html"))
            .unwrap_or(false)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    /// Number of bytes preceding the body (header blocks and boundaries)
    pub fn header_len(&self) -> usize {
        self.body_offset
    }
}

/// Line separator used by a header block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Separator {
    Crlf,
    Lf,
}

impl Separator {
    fn line(self) -> &'static str {
        match self {
            Separator::Crlf => "\r\n",
            Separator::Lf => "\n",
        }
    }

    fn boundary_len(self) -> usize {
        match self {
            Separator::Crlf => 4,
            Separator::Lf => 2,
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Earliest header/body boundary in `buf`
fn find_boundary(buf: &[u8]) -> Option<(usize, Separator)> {
    let crlf = find(buf, b"\r\n\r\n").map(|i| (i, Separator::Crlf));
    let lf = find(buf, b"\n\n").map(|i| (i, Separator::Lf));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Parse raw `curl -i` output into status, headers and body.
///
/// Interim `1xx` responses (and any other response preceding the final one)
/// are skipped. Without any boundary the whole buffer is the body.
pub fn parse(raw: &Bytes) -> UpstreamResponse {
    let Some((mut boundary, mut separator)) = find_boundary(raw) else {
        return UpstreamResponse {
            status: DEFAULT_STATUS,
            headers: Vec::new(),
            body: raw.clone(),
            body_offset: 0,
        };
    };

    let mut header_start = 0;
    let mut body_start = boundary + separator.boundary_len();

    while raw[body_start..].starts_with(b"HTTP/") {
        header_start = body_start;
        match find_boundary(&raw[header_start..]) {
            Some((next, next_separator)) => {
                boundary = header_start + next;
                separator = next_separator;
                body_start = boundary + separator.boundary_len();
            }
            None => {
                // Final block without a blank line: headers only, empty body
                boundary = raw.len();
                separator = if raw[header_start..].contains(&b'\r') {
                    Separator::Crlf
                } else {
                    Separator::Lf
                };
                body_start = raw.len();
                break;
            }
        }
    }

    let header_block = String::from_utf8_lossy(&raw[header_start..boundary]);
    let (status, headers) = parse_header_block(&header_block, separator);

    UpstreamResponse {
        status,
        headers,
        body: raw.slice(body_start..),
        body_offset: body_start,
    }
}

fn parse_header_block(block: &str, separator: Separator) -> (u16, Vec<(String, String)>) {
    let mut lines = block.split(separator.line());

    let status = lines
        .next()
        .and_then(|line| STATUS_CODE.captures(line))
        .and_then(|caps| caps[1].parse().ok())
        .unwrap_or(DEFAULT_STATUS);

    let mut headers: Vec<(String, String)> = Vec::new();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let value = value.trim().to_string();
        match headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(existing) => *existing = (name.to_string(), value),
            None => headers.push((name.to_string(), value)),
        }
    }

    (status, headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_bytes(raw: &'static [u8]) -> UpstreamResponse {
        parse(&Bytes::from_static(raw))
    }

    #[test]
    fn test_parse_basic_response() {
        let resp = parse_bytes(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nX-Test:  spaced  \r\n\r\n<html></html>",
        );

        assert_eq!(resp.status, 200);
        assert_eq!(resp.content_type(), Some("text/html; charset=utf-8"));
        assert_eq!(resp.header("x-test"), Some("spaced"));
        assert!(resp.is_html());
        assert_eq!(&resp.body[..], b"<html></html>");
    }

    #[test]
    fn test_parse_lf_only() {
        let resp = parse_bytes(b"HTTP/1.0 404 Not Found\nContent-Type: text/plain\n\nmissing");
        assert_eq!(resp.status, 404);
        assert_eq!(resp.content_type(), Some("text/plain"));
        assert!(!resp.is_html());
        assert_eq!(&resp.body[..], b"missing");
    }

    #[test]
    fn test_earliest_boundary_wins() {
        // The LF boundary comes first; the CRLF pair later is part of the body
        let resp = parse_bytes(b"HTTP/1.1 200 OK\nA: 1\n\nbody\r\n\r\nmore");
        assert_eq!(resp.header("A"), Some("1"));
        assert_eq!(&resp.body[..], b"body\r\n\r\nmore");
    }

    #[test]
    fn test_no_boundary_is_all_body() {
        let resp = parse_bytes(b"just some bytes");
        assert_eq!(resp.status, 200);
        assert!(resp.headers.is_empty());
        assert_eq!(&resp.body[..], b"just some bytes");
        assert_eq!(resp.header_len(), 0);
    }

    #[test]
    fn test_skips_interim_responses() {
        let resp = parse_bytes(
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 103 Early Hints\r\nLink: </a.css>\r\n\r\nHTTP/1.1 201 Created\r\nX-Final: yes\r\n\r\ndone",
        );
        assert_eq!(resp.status, 201);
        assert_eq!(resp.header("X-Final"), Some("yes"));
        assert_eq!(resp.header("Link"), None);
        assert_eq!(&resp.body[..], b"done");
    }

    #[test]
    fn test_body_starting_like_http_only_after_final_headers() {
        let resp = parse_bytes(b"HTTP/1.1 200 OK\r\n\r\nplain HTTP/ text");
        assert_eq!(&resp.body[..], b"plain HTTP/ text");
    }

    #[test]
    fn test_final_block_without_boundary() {
        let resp = parse_bytes(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 204 No Content\r\nX-A: 1");
        assert_eq!(resp.status, 204);
        assert_eq!(resp.header("X-A"), Some("1"));
        assert!(resp.body.is_empty());
    }

    #[test]
    fn test_missing_status_code_defaults_to_200() {
        let resp = parse_bytes(b"garbage line\r\nA: b\r\n\r\nx");
        assert_eq!(resp.status, 200);
        assert_eq!(resp.header("a"), Some("b"));
    }

    #[test]
    fn test_duplicate_headers_last_wins() {
        let resp = parse_bytes(
            b"HTTP/1.1 302 Found\r\nLocation: /first\r\nlocation: /second\r\nBad line\r\nX-Url: http://a:1/b\r\n\r\n",
        );
        assert!(resp.is_redirect());
        assert_eq!(resp.header("Location"), Some("/second"));
        assert_eq!(resp.headers.len(), 2);
        assert_eq!(resp.header("x-url"), Some("http://a:1/b"));
    }

    #[test]
    fn test_binary_body_is_untouched() {
        let resp = parse_bytes(b"HTTP/1.1 200 OK\r\nContent-Type: image/png\r\n\r\n\x89PNG\r\n\x1a\n\x00\xff");
        assert_eq!(&resp.body[..], b"\x89PNG\r\n\x1a\n\x00\xff");
    }

    #[test]
    fn test_header_and_body_reconstruct_input() {
        let inputs: [&'static [u8]; 6] = [
            b"HTTP/1.1 200 OK\r\nA: 1\r\n\r\nbody",
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\n\nx",
            b"HTTP/1.1 200 OK\n\n",
            b"no boundary",
            b"",
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK",
        ];

        for input in inputs {
            let raw = Bytes::from_static(input);
            let resp = parse(&raw);
            let mut rebuilt = raw[..resp.header_len()].to_vec();
            rebuilt.extend_from_slice(&resp.body);
            assert_eq!(rebuilt, input, "input {:?}", String::from_utf8_lossy(input));
        }
    }
}
