//! Probe executor: one outbound HTTP(S) request per invocation.
//!
//! The executor is pure with respect to state. It never fails; every
//! invocation classifies into a [`ProbeOutcome`], with transport-level
//! failures mapped to status code 0.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::{HttpMethod, Node};

/// Hard deadline for the entire probe: connection, TLS, request, and
/// response body read.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Response bodies are truncated to this many bytes for diagnostics.
pub const BODY_CAPTURE_LIMIT: usize = 10_000;

const TRANSPORT_FAILURE_TEXT: &str = "Connection Failed";

/// The effective probe configuration, detached from node identity so the
/// executor can also serve ad-hoc connection tests.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub endpoint_url: String,
    pub method: HttpMethod,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub expected_status_codes: Vec<u16>,
}

impl ProbeTarget {
    pub fn from_node(node: &Node) -> Self {
        Self {
            endpoint_url: node.endpoint_url.clone(),
            method: node.method,
            headers: node.headers.clone(),
            body: node.body.clone(),
            expected_status_codes: node.expected_status_codes.clone(),
        }
    }
}

/// Classified result of one probe.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeOutcome {
    /// HTTP status, or 0 for a transport-level failure.
    pub status_code: u16,
    pub status_text: String,
    pub response_time_ms: i64,
    pub success: bool,
    /// Empty on success.
    pub error_message: String,
    /// Diagnostic capture; not part of the persisted sample.
    pub request_headers: HashMap<String, String>,
    pub response_headers: HashMap<String, String>,
    pub response_body: String,
    /// Probe completion time.
    pub checked_at: DateTime<Utc>,
}

impl ProbeOutcome {
    fn transport_failure(
        request_headers: HashMap<String, String>,
        elapsed: Duration,
        error: String,
    ) -> Self {
        Self {
            status_code: 0,
            status_text: TRANSPORT_FAILURE_TEXT.to_string(),
            response_time_ms: elapsed.as_millis() as i64,
            success: false,
            error_message: error,
            request_headers,
            response_headers: HashMap::new(),
            response_body: String::new(),
            checked_at: Utc::now(),
        }
    }
}

/// Execute one probe against the target.
///
/// Blocks until the probe completes or the 30-second deadline expires.
pub async fn execute(target: &ProbeTarget) -> ProbeOutcome {
    let request_headers = target.headers.clone();

    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(c) => c,
        Err(e) => {
            return ProbeOutcome::transport_failure(
                request_headers,
                Duration::ZERO,
                format!("client setup failed: {}", e),
            )
        }
    };

    let method = match target.method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
    };

    let mut request = client.request(method, &target.endpoint_url);
    for (name, value) in &target.headers {
        request = request.header(name, value);
    }
    if target.method.sends_body() && !target.body.is_empty() {
        request = request.body(target.body.clone());
    }

    let start = Instant::now();

    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => {
            return ProbeOutcome::transport_failure(
                request_headers,
                start.elapsed(),
                short_error(&e),
            )
        }
    };

    let status = response.status();
    let response_headers: HashMap<String, String> = response
        .headers()
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )
        })
        .collect();

    // Drain the full body so response_time_ms covers the complete transfer.
    let body = match response.bytes().await {
        Ok(b) => b,
        Err(e) => {
            return ProbeOutcome::transport_failure(
                request_headers,
                start.elapsed(),
                short_error(&e),
            )
        }
    };

    let elapsed = start.elapsed();
    let status_code = status.as_u16();
    let success = target.expected_status_codes.contains(&status_code);

    ProbeOutcome {
        status_code,
        status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
        response_time_ms: elapsed.as_millis() as i64,
        success,
        error_message: if success {
            String::new()
        } else {
            format!("unexpected status code {}", status_code)
        },
        request_headers,
        response_headers,
        response_body: truncate_body(&body),
        checked_at: Utc::now(),
    }
}

fn truncate_body(body: &[u8]) -> String {
    if body.len() > BODY_CAPTURE_LIMIT {
        let mut captured = String::from_utf8_lossy(&body[..BODY_CAPTURE_LIMIT]).into_owned();
        captured.push('…');
        captured
    } else {
        String::from_utf8_lossy(body).into_owned()
    }
}

fn short_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "probe timed out after 30s".to_string()
    } else if e.is_connect() {
        format!("connection failed: {}", e)
    } else {
        format!("request failed: {}", e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::spawn_stub_server;

    fn target(url: String) -> ProbeTarget {
        ProbeTarget {
            endpoint_url: url,
            method: HttpMethod::Get,
            headers: HashMap::new(),
            body: String::new(),
            expected_status_codes: vec![200],
        }
    }

    #[tokio::test]
    async fn classifies_expected_status_as_success() {
        let url = spawn_stub_server(vec![200]).await;
        let outcome = execute(&target(url)).await;
        assert!(outcome.success);
        assert_eq!(outcome.status_code, 200);
        assert_eq!(outcome.status_text, "OK");
        assert!(outcome.error_message.is_empty());
        assert!(outcome.response_time_ms >= 0);
    }

    #[tokio::test]
    async fn classifies_unexpected_status_as_failure() {
        let url = spawn_stub_server(vec![503]).await;
        let outcome = execute(&target(url)).await;
        assert!(!outcome.success);
        assert_eq!(outcome.status_code, 503);
        assert_eq!(outcome.status_text, "Service Unavailable");
        assert!(outcome.error_message.contains("503"));
    }

    #[tokio::test]
    async fn expected_codes_govern_success_not_2xx() {
        let url = spawn_stub_server(vec![503]).await;
        let mut t = target(url);
        t.expected_status_codes = vec![503];
        let outcome = execute(&t).await;
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn transport_failure_uses_zero_sentinel() {
        // Bind a port, then drop the listener so the connection is refused.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let outcome = execute(&target(format!("http://{}", addr))).await;
        assert!(!outcome.success);
        assert_eq!(outcome.status_code, 0);
        assert_eq!(outcome.status_text, "Connection Failed");
        assert!(!outcome.error_message.is_empty());
    }

    #[tokio::test]
    async fn captures_and_truncates_large_bodies() {
        let url = crate::testutil::spawn_stub_server_with_body(200, 20_000).await;
        let outcome = execute(&target(url)).await;
        assert!(outcome.success);
        assert!(outcome.response_body.len() <= BODY_CAPTURE_LIMIT + '…'.len_utf8());
        assert!(outcome.response_body.ends_with('…'));
    }
}
