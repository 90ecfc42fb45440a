//! Minimal HTTP/1.x proxy
//!
//! Each connection carries one raw request. With an `upstream` base URL the
//! request is replayed against it with a blocking client and the upstream
//! status, content type and body are relayed. Without one the handler
//! answers `200 OK` with a JSON summary of the request it saw.

use crate::table::ProcessTable;
use crate::worker::{Handler, WorkerArgs};
use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde_json::json;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Headers that describe the client connection rather than the request
const HOP_HEADERS: [&str; 5] = [
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "keep-alive",
];

/// A parsed HTTP/1.x request
///
/// Parsing is lenient: a missing method, path or version falls back to
/// `GET / HTTP/1.1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn parse(raw: &[u8]) -> Self {
        let (head, body) = match find_subsequence(raw, b"\r\n\r\n") {
            Some(end) => (&raw[..end], raw[end + 4..].to_vec()),
            None => (raw, Vec::new()),
        };
        let head = String::from_utf8_lossy(head);
        let mut lines = head.split("\r\n");

        let mut request_line = lines.next().unwrap_or("").split(' ').filter(|s| !s.is_empty());
        let method = request_line.next().unwrap_or("GET").to_string();
        let path = request_line.next().unwrap_or("/").to_string();
        let version = request_line.next().unwrap_or("HTTP/1.1").to_string();

        let headers = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
            .collect();

        Self {
            method,
            path,
            version,
            headers,
            body,
        }
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

pub struct HttpProxyHandler {
    upstream: Option<(Client, String)>,
}

impl HttpProxyHandler {
    fn forward(client: &Client, base: &str, request: &HttpRequest) -> Result<Vec<u8>> {
        let method = Method::from_str(&request.method)
            .with_context(|| format!("Invalid method: {}", request.method))?;
        let url = format!("{}{}", base, request.path);

        let mut builder = client.request(method, &url);
        for (name, value) in &request.headers {
            if HOP_HEADERS.iter().any(|hop| name.eq_ignore_ascii_case(hop)) {
                continue;
            }
            let (Ok(name), Ok(value)) = (HeaderName::from_str(name), HeaderValue::from_str(value)) else {
                continue;
            };
            builder = builder.header(name, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder
            .send()
            .with_context(|| format!("Failed to reach {}", url))?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let body = response.bytes().context("Failed to read upstream body")?;

        Ok(http_response(
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown"),
            &content_type,
            &body,
        ))
    }
}

impl Handler for HttpProxyHandler {
    const NAME: &'static str = "http-proxy";

    fn init(args: &WorkerArgs, _table: &ProcessTable) -> Result<Self> {
        let upstream = match args.get_str("upstream") {
            Some(base) => {
                let client = Client::builder()
                    .timeout(UPSTREAM_TIMEOUT)
                    .build()
                    .context("Failed to create HTTP client")?;
                Some((client, base.trim_end_matches('/').to_string()))
            }
            None => None,
        };
        Ok(Self { upstream })
    }

    fn process_message(&mut self, request: &[u8]) -> Result<Option<Vec<u8>>> {
        let request = HttpRequest::parse(request);

        let response = match &self.upstream {
            Some((client, base)) => match Self::forward(client, base, &request) {
                Ok(response) => response,
                Err(e) => {
                    warn!(path = %request.path, error = %format!("{:#}", e), "upstream request failed");
                    let body = json!({ "success": false, "message": format!("{:#}", e) });
                    http_response(502, "Bad Gateway", "application/json", body.to_string().as_bytes())
                }
            },
            None => {
                let body = json!({
                    "success": true,
                    "message": "Request proxied successfully",
                    "request": {
                        "method": request.method,
                        "path": request.path,
                    },
                });
                http_response(200, "OK", "application/json", body.to_string().as_bytes())
            }
        };

        Ok(Some(response))
    }
}

fn http_response(status: u16, reason: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        status,
        reason,
        content_type,
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);
    response
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
