//! HTTP entry points.
//!
//! One catch-all data-plane route (`ANY /api/proxy/{*path}`) plus the thin
//! admin surface. Every gateway-generated error response is audited with
//! its request id on the way out.

mod admin;
mod auth;
mod proxy_handler;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{any, delete, get, post};
use axum::Router;
use tokio::net::TcpListener;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{GatewayError, Result};

pub use auth::{mint_session_token, verify_session_token, AuthedUser};
pub use state::AppState;

/// Assemble the full router over shared state.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(admin::health))
        // Vault CRUD
        .route(
            "/api/keys",
            post(admin::create_api_key).get(admin::list_api_keys),
        )
        .route(
            "/api/keys/{id}",
            get(admin::get_api_key)
                .patch(admin::update_api_key)
                .delete(admin::delete_api_key),
        )
        .route("/api/keys/{id}/reveal", post(admin::reveal_api_key))
        // Shared tokens
        .route(
            "/api/tokens",
            post(admin::create_token).get(admin::list_tokens),
        )
        .route(
            "/api/tokens/{id}",
            get(admin::get_token)
                .patch(admin::update_token)
                .delete(admin::delete_token),
        )
        .route("/api/tokens/{id}/rotate", post(admin::rotate_token))
        // Webhooks
        .route(
            "/api/webhooks",
            post(admin::create_webhook).get(admin::list_webhooks),
        )
        .route("/api/webhooks/{id}", delete(admin::delete_webhook))
        // Two-factor authentication
        .route("/api/2fa/setup", post(admin::setup_2fa))
        .route("/api/2fa/verify", post(admin::verify_2fa))
        .route("/api/2fa/disable", post(admin::disable_2fa))
        // Usage listing
        .route("/api/usage", get(admin::list_usage))
        // Data plane
        .route("/api/proxy/{*path}", any(proxy_handler::proxy_handler))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            audit_gateway_errors,
        ))
        .with_state(state)
}

/// Write the `API_ERROR` audit entry for gateway-generated error responses.
///
/// Gateway errors are recognizable by the `x-request-id` they carry;
/// upstream responses forwarded by the proxy carry `x-feen-provider`
/// instead and pass through untouched (a 4xx from the provider is a
/// legitimate answer, not a gateway error).
async fn audit_gateway_errors(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let response = next.run(request).await;

    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        let is_gateway_error = response.headers().contains_key("x-request-id")
            && !response.headers().contains_key("x-feen-provider");
        if is_gateway_error {
            let request_id = response
                .headers()
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(Uuid::new_v4);
            state
                .audit_api_error(request_id, &path, status.as_u16())
                .await;
        }
    }
    response
}

/// Run the gateway until interrupted.
pub async fn run(config: Config) -> Result<()> {
    let state = AppState::from_config(config).await?;
    let worker_handles = state.spawn_workers();

    let addr = state.config.server.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| GatewayError::Internal(format!("failed to bind {addr}: {e}")))?;
    tracing::info!(%addr, "feen gateway listening");

    let router = build_router(state);
    let result = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    })
    .await
    .map_err(|e| GatewayError::Internal(format!("server error: {e}")));

    for handle in worker_handles {
        handle.abort();
    }
    result
}
