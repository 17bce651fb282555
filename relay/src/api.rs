//! Health & metrics HTTP endpoints (§6: "a loopback-bound HTTP server
//! exposing `GET /health` and `GET /metrics`; the latter optionally gated by
//! a bearer token").
//!
//! A hand-rolled `TcpListener` loop writing raw HTTP responses rather than
//! pulling in a full framework, since `axum`/`tower` add nothing two static
//! routes need; exposes this relay's [`crate::metrics`] registry as
//! Prometheus text.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use eyre::{Result, WrapErr};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use crate::redact::Redacted;

const MAX_CONNECTIONS: usize = 128;
const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
}

/// Shared process start time, used only for the `/health` timestamp.
pub struct ApiState {
    pub started_unix: AtomicI64,
    pub bearer_token: Option<Redacted<String>>,
}

impl ApiState {
    pub fn new(bearer_token: Option<Redacted<String>>) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self {
            started_unix: AtomicI64::new(now),
            bearer_token,
        }
    }
}

/// Serve `/health` and `/metrics` on `bind_addr` until the process exits.
/// Runs as its own spawned task (§5, §6); not part of the cycle scheduler's
/// drain sequence, since the spec only requires the health server to close
/// *after* the scheduler drains (§5: "close the health server and exit").
pub async fn serve(bind_addr: SocketAddr, state: Arc<ApiState>) -> Result<()> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .wrap_err_with(|| format!("failed to bind health/metrics server to {bind_addr}"))?;
    tracing::info!(%bind_addr, "health/metrics server listening");

    let semaphore = Arc::new(Semaphore::new(MAX_CONNECTIONS));

    loop {
        let (mut stream, _peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "failed to accept health/metrics connection");
                continue;
            }
        };
        let state = state.clone();
        let sem = semaphore.clone();
        tokio::spawn(async move {
            let _permit = match sem.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            if let Err(e) = handle_connection(&mut stream, &state).await {
                tracing::debug!(error = %e, "health/metrics connection ended with an error");
            }
        });
    }
}

async fn handle_connection(stream: &mut tokio::net::TcpStream, state: &ApiState) -> Result<()> {
    let mut buf = vec![0u8; 8192];
    let n = tokio::time::timeout(READ_TIMEOUT, stream.read(&mut buf))
        .await
        .wrap_err("timed out reading health/metrics request")?
        .wrap_err("failed to read request")?;
    let request = String::from_utf8_lossy(&buf[..n]);
    let request_line = request.lines().next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");

    let auth_header = request
        .lines()
        .find(|l| l.to_ascii_lowercase().starts_with("authorization:"))
        .map(|l| l.splitn(2, ':').nth(1).unwrap_or("").trim().to_string());

    let (status_line, content_type, body) = match (method, path) {
        ("GET", "/health") => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let resp = HealthResponse {
                status: "ok",
                timestamp: now,
            };
            (
                "200 OK",
                "application/json",
                serde_json::to_vec(&resp).unwrap_or_default(),
            )
        }
        ("GET", "/metrics") => {
            if !authorized(&state.bearer_token, auth_header.as_deref()) {
                ("401 Unauthorized", "text/plain", b"unauthorized".to_vec())
            } else {
                let encoder = TextEncoder::new();
                let metric_families = prometheus::gather();
                let mut buffer = Vec::new();
                if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                    tracing::warn!(error = %e, "failed to encode metrics");
                    ("500 Internal Server Error", "text/plain", b"encode error".to_vec())
                } else {
                    ("200 OK", encoder.format_type(), buffer)
                }
            }
        }
        _ => ("404 Not Found", "text/plain", b"not found".to_vec()),
    };

    let header = format!(
        "HTTP/1.1 {status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream
        .write_all(header.as_bytes())
        .await
        .wrap_err("failed to write response header")?;
    stream.write_all(&body).await.wrap_err("failed to write response body")?;
    stream.flush().await.ok();
    Ok(())
}

fn authorized(configured: &Option<Redacted<String>>, presented: Option<&str>) -> bool {
    let Some(expected) = configured else {
        return true;
    };
    let Some(presented) = presented else {
        return false;
    };
    let expected_header = format!("Bearer {}", expected.0);
    presented == expected_header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_token_configured_allows_anyone() {
        assert!(authorized(&None, None));
    }

    #[test]
    fn missing_header_is_rejected_when_token_configured() {
        assert!(!authorized(&Some(Redacted("secret".into())), None));
    }

    #[test]
    fn wrong_token_is_rejected() {
        assert!(!authorized(&Some(Redacted("secret".into())), Some("Bearer wrong")));
    }

    #[test]
    fn correct_bearer_token_is_accepted() {
        assert!(authorized(&Some(Redacted("secret".into())), Some("Bearer secret")));
    }
}
