//! The data-plane entry point: `ANY /api/proxy/{*path}`.
//!
//! Assembles the per-request context, threads it through policy, rate
//! limiting, routing and transport, and streams the upstream response back.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, Request, Response};
use axum::response::IntoResponse;
use bytes::Bytes;
use chrono::Utc;
use uuid::Uuid;

use crate::crypto::RequestSignature;
use crate::error::GatewayError;
use crate::guard::{RotationController, SuspiciousKind};
use crate::policy::{normalize_path, PolicyInput};
use crate::proxy::ForwardRequest;
use crate::recorder::UsageGuard;
use crate::store::UsageRecord;

use super::state::AppState;

/// Proxy any request under the catch-all prefix to the selected provider.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response<Body> {
    let request_id = Uuid::new_v4();
    let method = request.method().clone();
    let request_path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);
    let headers = request.headers().clone();

    let client_ip = resolve_client_ip(&headers, remote);
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let Some(bearer) = bearer_token(&headers) else {
        let err = GatewayError::TokenInvalid("Missing access token".into());
        return reject(request_id, err);
    };
    let bearer = bearer.to_string();

    let body = match axum::body::to_bytes(
        request.into_body(),
        state.config.server.max_body_size,
    )
    .await
    {
        Ok(body) => body,
        Err(_) => {
            let err = GatewayError::Validation("Request body too large or unreadable".into());
            return reject(request_id, err);
        }
    };

    let forwarded_path = normalize_path(&path).to_string();
    let requested_model = top_level_model(&body);
    let signature = signature_headers(&headers);

    // Policy (C4): first failure terminates.
    let access = match state
        .policy
        .evaluate(PolicyInput {
            bearer: &bearer,
            client_ip,
            request_path: &request_path,
            forwarded_path: &forwarded_path,
            method: method.as_str(),
            body: &body,
            signature,
            requested_model: requested_model.as_deref(),
        })
        .await
    {
        Ok(access) => access,
        Err(err) => return reject(request_id, err),
    };

    // Rate limit (C5): minute window, then the promoted daily window.
    let rate = state
        .limiter
        .check_minute(access.token.id, access.token.rate_per_minute)
        .await;
    if !rate.allowed {
        record_event(&state, access.token.id, SuspiciousKind::RateLimited).await;
        let err = GatewayError::RateLimited {
            retry_after_secs: rate.retry_after_secs(Utc::now().timestamp()),
            limit: rate.limit,
        };
        return reject(request_id, err);
    }
    let daily = state
        .limiter
        .check_daily(access.token.id, access.token.daily_cap)
        .await;
    if !daily.allowed {
        record_event(&state, access.token.id, SuspiciousKind::QuotaExceeded).await;
        let err = GatewayError::QuotaExceeded("Daily usage cap exceeded".into());
        return reject(request_id, err);
    }

    // Router (C6): ordered candidates over the owner's key set.
    let owner_keys = match state.vault.api_keys_for_user(access.token.owner_user).await {
        Ok(keys) => keys,
        Err(err) => return reject(request_id, err.into()),
    };
    let candidates = match state
        .router
        .candidates(
            requested_model.as_deref(),
            access.token.api_key_ref,
            &owner_keys,
        )
        .await
    {
        Ok(candidates) => candidates,
        Err(err) => return reject(request_id, err),
    };

    // Usage template (C8): armed now, committed by whoever finishes the
    // attempt; dropping it records a 499.
    let template = UsageRecord {
        id: Uuid::new_v4(),
        api_key_ref: access.api_key.id,
        shared_token_ref: access.token.id,
        user_ref: access.token.owner_user,
        provider: candidates[0].provider,
        model: requested_model.clone(),
        endpoint: forwarded_path.clone(),
        method: method.to_string(),
        status_code: 0,
        request_tokens: None,
        response_tokens: None,
        total_tokens: None,
        latency_ms: 0,
        client_ip: client_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        user_agent,
        created_at: Utc::now(),
    };
    let guard = UsageGuard::new(Arc::clone(&state.recorder), template);

    // Transport (C7): candidate loop with streaming forward.
    let forward = ForwardRequest {
        method,
        forwarded_path,
        query,
        headers,
        body,
    };
    match state.transport.forward(&candidates, forward, rate, guard).await {
        Ok(response) => response,
        Err(err) => {
            if matches!(err, GatewayError::AllProvidersFailed) {
                record_event(&state, access.token.id, SuspiciousKind::UpstreamFailure).await;
            }
            reject(request_id, err)
        }
    }
}

/// Extract the bearer from the `Authorization` header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Client address: leftmost `X-Forwarded-For` entry, else the socket peer.
fn resolve_client_ip(headers: &HeaderMap, remote: SocketAddr) -> Option<IpAddr> {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            if let Ok(ip) = first.trim().parse() {
                return Some(ip);
            }
        }
        // A forwarded header we cannot parse means the real client address
        // is unknown, not the proxy hop we happen to see.
        return None;
    }
    Some(remote.ip())
}

/// The top-level `model` field of a JSON body, when present.
fn top_level_model(body: &Bytes) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("model")?.as_str().map(str::to_string)
}

/// All three signature headers, or `None`.
fn signature_headers(headers: &HeaderMap) -> Option<RequestSignature> {
    let timestamp = headers
        .get("x-feen-timestamp")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())?;
    let signature = headers
        .get("x-feen-signature")
        .and_then(|v| v.to_str().ok())?
        .to_string();
    let nonce = headers
        .get("x-feen-nonce")
        .and_then(|v| v.to_str().ok())?
        .to_string();
    Some(RequestSignature {
        timestamp,
        nonce,
        signature,
    })
}

async fn record_event(state: &Arc<AppState>, token_id: Uuid, kind: SuspiciousKind) {
    if let Err(err) = state.guard.record_event(token_id, kind).await {
        tracing::error!(%token_id, error = %err, "failed to record suspicious event");
    }
}

/// Build the canonical error response; the server middleware audits it by
/// the request id it carries.
fn reject(request_id: Uuid, err: GatewayError) -> Response<Body> {
    err.to_response(request_id).into_response()
}
