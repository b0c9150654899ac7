//! Per-candidate upstream calls: header rewriting, streaming forward,
//! bounded timeouts, and failure classification.
//!
//! Candidates are tried in router order. A transport error or 5xx falls
//! through to the next candidate; any other completed response commits,
//! including a 4xx (it is a legitimate answer to the client's call). The
//! response body streams to the client unbuffered while a bounded clone of
//! its prefix feeds token-usage extraction.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, Response, StatusCode};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;

use crate::crypto::VaultCipher;
use crate::error::{GatewayError, Result};
use crate::ratelimit::RateDecision;
use crate::recorder::{UsageGuard, STATUS_CLIENT_CLOSED};
use crate::router::Candidate;
use crate::store::{latency_key, AuditAction, AuditRecord, FastStore, VaultStore};

use super::usage::{is_json_content, TokenUsage, USAGE_SCAN_LIMIT};

/// Upstream response-header timeout.
pub const UPSTREAM_HEADER_TIMEOUT: Duration = Duration::from_secs(30);

/// Latency cache TTL.
const LATENCY_TTL_SECS: u64 = 60;

/// Headers never forwarded upstream: the gateway's own credentials and
/// signature material, plus hop-by-hop fields the client set.
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "authorization",
    "x-api-key",
    "content-length",
    "connection",
    "transfer-encoding",
    "x-feen-timestamp",
    "x-feen-signature",
    "x-feen-nonce",
    "provider-key",
];

/// Hop-by-hop response headers that must not be echoed to the client.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &["connection", "transfer-encoding"];

/// The request facts the transport forwards verbatim.
pub struct ForwardRequest {
    pub method: Method,
    /// Provider-native suffix without a leading slash.
    pub forwarded_path: String,
    pub query: Option<String>,
    /// Inbound headers; rewritten per provider before forwarding.
    pub headers: HeaderMap,
    /// Body bytes, captured once before the attempt loop.
    pub body: Bytes,
}

/// Candidate-loop transport over a shared HTTP client.
pub struct UpstreamTransport {
    client: reqwest::Client,
    vault: Arc<dyn VaultStore>,
    fast: Arc<dyn FastStore>,
    cipher: VaultCipher,
}

impl UpstreamTransport {
    pub fn new(
        vault: Arc<dyn VaultStore>,
        fast: Arc<dyn FastStore>,
        cipher: VaultCipher,
    ) -> Result<Self> {
        // No overall client timeout: header arrival is bounded per attempt
        // and body streaming is bounded by request cancellation.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            vault,
            fast,
            cipher,
        })
    }

    /// Try each candidate in order and stream back the first committed
    /// response. The usage guard travels with the attempt and is committed
    /// by whoever finishes it.
    pub async fn forward(
        &self,
        candidates: &[Candidate],
        request: ForwardRequest,
        rate: RateDecision,
        mut guard: UsageGuard,
    ) -> Result<Response<Body>> {
        let mut integrity_failure = false;

        for candidate in candidates {
            guard.set_provider(candidate.provider);

            let credential = match self.cipher.decrypt_string(&candidate.key.encrypted_material) {
                Ok(credential) => credential,
                Err(err) => {
                    // Key material that fails authentication is an operator
                    // problem; it must never read as a client error.
                    integrity_failure = true;
                    tracing::error!(key_id = %candidate.key.id, error = %err, "vault blob failed integrity check");
                    let _ = self
                        .vault
                        .append_audit(AuditRecord::new(
                            AuditAction::ApiError,
                            None,
                            json!({
                                "keyId": candidate.key.id,
                                "error": "vault integrity failure",
                            }),
                        ))
                        .await;
                    continue;
                }
            };

            let started = Instant::now();
            let outcome = self
                .attempt(candidate, &credential, &request)
                .await;
            let latency_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(response) if response.status().is_server_error() => {
                    self.store_latency(candidate.provider, latency_ms).await;
                    tracing::warn!(
                        provider = %candidate.provider,
                        status = %response.status(),
                        "upstream returned server error; trying next candidate"
                    );
                }
                Ok(response) => {
                    self.store_latency(candidate.provider, latency_ms).await;
                    return Ok(self.commit(candidate, response, latency_ms, rate, guard));
                }
                Err(err) => {
                    if latency_ms > 0 {
                        self.store_latency(candidate.provider, latency_ms).await;
                    }
                    tracing::warn!(
                        provider = %candidate.provider,
                        error = %err,
                        "upstream attempt failed; trying next candidate"
                    );
                }
            }
        }

        let latency_ms = guard.elapsed_ms();
        if integrity_failure {
            guard.commit(500, latency_ms, None);
            return Err(GatewayError::Integrity(
                crate::crypto::vault::IntegrityError::TagMismatch,
            ));
        }
        guard.commit(502, latency_ms, None);
        Err(GatewayError::AllProvidersFailed)
    }

    /// One upstream call, bounded by the header timeout.
    async fn attempt(
        &self,
        candidate: &Candidate,
        credential: &str,
        request: &ForwardRequest,
    ) -> std::result::Result<reqwest::Response, String> {
        let url = match &request.query {
            Some(query) => format!(
                "{}/{}?{}",
                candidate.base_url.trim_end_matches('/'),
                request.forwarded_path,
                query
            ),
            None => format!(
                "{}/{}",
                candidate.base_url.trim_end_matches('/'),
                request.forwarded_path
            ),
        };

        let mut headers = HeaderMap::new();
        for (name, value) in request.headers.iter() {
            if STRIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
                continue;
            }
            headers.insert(name.clone(), value.clone());
        }
        for (name, value) in candidate.provider.auth_headers(credential) {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(name, value);
            }
        }
        // Bytez accepts an optional pass-through key for its own upstreams.
        if candidate.provider == crate::providers::Provider::Bytez {
            if let Some(value) = request.headers.get("provider-key") {
                headers.insert("provider-key", value.clone());
            }
        }

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .headers(headers);
        if request.method != Method::GET && request.method != Method::HEAD {
            builder = builder.body(request.body.clone());
        }

        tokio::time::timeout(UPSTREAM_HEADER_TIMEOUT, builder.send())
            .await
            .map_err(|_| format!("upstream response headers timed out after {UPSTREAM_HEADER_TIMEOUT:?}"))?
            .map_err(|e| e.to_string())
    }

    /// Commit a completed upstream response: clone headers, add the
    /// gateway's own, and stream the body while feeding usage extraction.
    fn commit(
        &self,
        candidate: &Candidate,
        upstream: reqwest::Response,
        latency_ms: u64,
        rate: RateDecision,
        guard: UsageGuard,
    ) -> Response<Body> {
        let status = upstream.status();
        let scan_body = is_json_content(
            upstream
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
        );

        let mut builder = Response::builder().status(status);
        if let Some(headers) = builder.headers_mut() {
            for (name, value) in upstream.headers().iter() {
                if STRIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
                    continue;
                }
                headers.insert(name.clone(), value.clone());
            }
            headers.insert("x-feen-latency", header_value(latency_ms));
            if let Ok(value) = HeaderValue::from_str(candidate.provider.tag()) {
                headers.insert("x-feen-provider", value);
            }
            headers.insert("x-ratelimit-limit", header_value(rate.limit));
            headers.insert("x-ratelimit-remaining", header_value(rate.remaining));
            headers.insert("x-ratelimit-reset", header_value(rate.reset_at));
        }

        // Forward chunks as they arrive; the bounded tee never delays them.
        let (tx, rx) = mpsc::channel::<std::result::Result<Bytes, std::io::Error>>(64);
        let status_code = status.as_u16();
        let mut upstream_body = upstream.bytes_stream();

        tokio::spawn(async move {
            let mut tee: Vec<u8> = Vec::new();
            let mut tee_overflow = !scan_body;
            let mut client_gone = false;

            while let Some(chunk) = upstream_body.next().await {
                match chunk {
                    Ok(bytes) => {
                        if !tee_overflow {
                            if tee.len() + bytes.len() > USAGE_SCAN_LIMIT {
                                tee_overflow = true;
                                tee.clear();
                            } else {
                                tee.extend_from_slice(&bytes);
                            }
                        }
                        if !client_gone && tx.send(Ok(bytes)).await.is_err() {
                            // Client went away mid-stream.
                            client_gone = true;
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = tx
                            .send(Err(std::io::Error::other(err.to_string())))
                            .await;
                        break;
                    }
                }
            }
            drop(tx);

            if client_gone {
                guard.commit(STATUS_CLIENT_CLOSED, latency_ms, None);
                return;
            }

            let usage = if tee_overflow || tee.is_empty() {
                None
            } else {
                TokenUsage::from_body(&tee)
            };
            guard.commit(status_code, latency_ms, usage);
        });

        let stream = tokio_stream(rx);
        builder
            .body(Body::from_stream(stream))
            .unwrap_or_else(|_| {
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())
                    .expect("static response")
            })
    }

    async fn store_latency(&self, provider: crate::providers::Provider, latency_ms: u64) {
        // Ranking data only; a cache outage is not a request failure.
        if let Err(err) = self
            .fast
            .set_ex(&latency_key(provider), &latency_ms.to_string(), LATENCY_TTL_SECS)
            .await
        {
            tracing::debug!(%provider, error = %err, "failed to store latency sample");
        }
    }
}

fn header_value<T: std::fmt::Display>(value: T) -> HeaderValue {
    HeaderValue::from_str(&value.to_string())
        .unwrap_or_else(|_| HeaderValue::from_static("0"))
}

fn tokio_stream(
    rx: mpsc::Receiver<std::result::Result<Bytes, std::io::Error>>,
) -> impl futures::Stream<Item = std::result::Result<Bytes, std::io::Error>> {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_value_formats() {
        assert_eq!(header_value(42u64), HeaderValue::from_static("42"));
        assert_eq!(header_value(0u32), HeaderValue::from_static("0"));
    }

    #[test]
    fn test_stripped_headers_cover_gateway_credentials() {
        for name in ["authorization", "x-api-key", "x-feen-signature", "host"] {
            assert!(STRIPPED_REQUEST_HEADERS.contains(&name));
        }
    }
}
