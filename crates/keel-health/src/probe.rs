//! Health probe transport.
//!
//! A probe issues one `GET {host}:{port}{path}` and reports whether the
//! instance answered `200` with a JSON body. Every failure mode (refused
//! connection, handshake error, non-200, unparsable body, timeout) is
//! folded into an unhealthy [`ProbeOutcome`] carrying an error payload.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use http_body_util::BodyExt;
use serde_json::{Value, json};
use tracing::debug;

use keel_state::ServiceInstance;

/// Result of a single health probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub healthy: bool,
    /// The JSON body on success, or `{"error": ...}` detail on failure.
    pub payload: Value,
}

impl ProbeOutcome {
    pub fn healthy(payload: Value) -> Self {
        Self { healthy: true, payload }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            payload: json!({ "error": error.into() }),
        }
    }
}

pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = ProbeOutcome> + Send + 'a>>;

/// Something that can probe an instance's health endpoint.
pub trait Probe: Send + Sync {
    fn probe<'a>(
        &'a self,
        instance: &'a ServiceInstance,
        path: &'a str,
        timeout: Duration,
    ) -> ProbeFuture<'a>;
}

/// Probes instances over plain HTTP/1.1.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpProbe;

impl Probe for HttpProbe {
    fn probe<'a>(
        &'a self,
        instance: &'a ServiceInstance,
        path: &'a str,
        timeout: Duration,
    ) -> ProbeFuture<'a> {
        Box::pin(async move { http_probe(&instance.address(), path, timeout).await })
    }
}

/// Perform an HTTP health probe against `address` (`host:port`).
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeOutcome {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeOutcome::unhealthy(format!("connection failed: {e}"));
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeOutcome::unhealthy(format!("handshake failed: {e}"));
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "keel-health/0.1")
            .header("accept", "application/json")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => return ProbeOutcome::unhealthy(format!("invalid request: {e}")),
        };

        let resp = match sender.send_request(req).await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                return ProbeOutcome::unhealthy(format!("request failed: {e}"));
            }
        };

        let status = resp.status();
        if status != http::StatusCode::OK {
            debug!(%status, %uri, "health probe non-200");
            return ProbeOutcome {
                healthy: false,
                payload: json!({ "error": "unexpected status", "status": status.as_u16() }),
            };
        }

        let body = match resp.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => return ProbeOutcome::unhealthy(format!("body read failed: {e}")),
        };
        match serde_json::from_slice::<Value>(&body) {
            Ok(payload) => ProbeOutcome::healthy(payload),
            Err(e) => {
                debug!(error = %e, %uri, "health probe body is not JSON");
                ProbeOutcome::unhealthy(format!("invalid JSON body: {e}"))
            }
        }
    })
    .await;

    match result {
        Ok(outcome) => outcome,
        Err(_) => {
            debug!(%uri, "health probe timed out");
            ProbeOutcome::unhealthy(format!("timed out after {}ms", timeout.as_millis()))
        }
    }
}
