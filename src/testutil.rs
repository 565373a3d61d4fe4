//! Shared fixtures for in-crate tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use uuid::Uuid;

use crate::db::{
    default_expected_status_codes, HttpMethod, Node, NodeStatus, Sample,
    DEFAULT_FAILURE_THRESHOLD,
};

/// A node with valid defaults, owned by `user_id`.
pub fn test_node(user_id: &str, name: &str) -> Node {
    let now = Utc::now();
    Node {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        name: name.to_string(),
        endpoint_url: "http://example.test/health".to_string(),
        method: HttpMethod::Get,
        headers: HashMap::new(),
        body: String::new(),
        check_interval_ms: 15_000,
        expected_status_codes: default_expected_status_codes(),
        failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        status: NodeStatus::Active,
        consecutive_failures: 0,
        last_check_at: None,
        created_at: now,
        updated_at: now,
    }
}

/// A successful 200 sample recorded at `created_at`.
pub fn test_sample(node_id: &str, created_at: DateTime<Utc>) -> Sample {
    Sample {
        id: Uuid::new_v4().to_string(),
        node_id: node_id.to_string(),
        status_code: 200,
        status_text: "OK".to_string(),
        response_time_ms: 10,
        success: true,
        error_message: String::new(),
        created_at,
    }
}

/// Spawn a local HTTP stub that answers one request per connection with the
/// given status codes in order, repeating the last one. Returns the base URL.
pub async fn spawn_stub_server(statuses: Vec<u16>) -> String {
    spawn_stub(statuses, "ok".to_string()).await
}

/// Stub answering with a fixed status and a body of `body_len` bytes.
pub async fn spawn_stub_server_with_body(status: u16, body_len: usize) -> String {
    spawn_stub(vec![status], "x".repeat(body_len)).await
}

async fn spawn_stub(statuses: Vec<u16>, body: String) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let served = Arc::new(AtomicUsize::new(0));

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let statuses = statuses.clone();
            let served = served.clone();
            let body = body.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                let _ = socket.read(&mut buf).await;

                let idx = served.fetch_add(1, Ordering::SeqCst);
                let status = statuses[idx.min(statuses.len() - 1)];
                let response = format!(
                    "HTTP/1.1 {} {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    reason_phrase(status),
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{}", addr)
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
