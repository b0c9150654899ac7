//! Gateway error types and the canonical JSON error body.
//!
//! Every client-visible failure maps to a stable `code` string and an HTTP
//! status. Integrity failures (vault tag mismatch) are deliberately collapsed
//! into `INTERNAL_ERROR` before they reach a client; the detail goes to the
//! audit log instead.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::vault::IntegrityError;
use crate::store::StoreError;

/// Gateway errors
#[derive(Error, Debug)]
pub enum GatewayError {
    // === Policy / authentication ===
    #[error("{0}")]
    TokenInvalid(String),

    #[error("Shared token has expired")]
    TokenExpired,

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("Two-factor verification required")]
    TwoFactorRequired,

    #[error("{0}")]
    InsufficientScope(String),

    // === Signed requests ===
    #[error("Missing signature headers")]
    MissingSignature,

    #[error("Signature timestamp outside the allowed window")]
    ExpiredTimestamp,

    #[error("Nonce already observed")]
    ReplayAttack,

    #[error("Signature verification failed")]
    InvalidSignature,

    // === Quotas ===
    #[error("Rate limit exceeded")]
    RateLimited {
        /// Seconds until the current window closes.
        retry_after_secs: u64,
        /// The per-minute limit that was hit.
        limit: u32,
    },

    #[error("{0}")]
    QuotaExceeded(String),

    // === Validation / CRUD ===
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    // === Upstream / routing ===
    #[error("No provider is available for this request")]
    NoCandidates,

    #[error("All available providers failed")]
    AllProvidersFailed,

    // === Infrastructure ===
    #[error("Vault integrity failure")]
    Integrity(#[from] IntegrityError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TokenInvalid(_) => "TOKEN_INVALID",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::TwoFactorRequired => "TWO_FACTOR_REQUIRED",
            Self::InsufficientScope(_) => "INSUFFICIENT_SCOPE",
            Self::MissingSignature => "MISSING_SIGNATURE",
            Self::ExpiredTimestamp => "EXPIRED_TIMESTAMP",
            Self::ReplayAttack => "REPLAY_ATTACK",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Self::Validation(_) | Self::Json(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::NoCandidates => "SERVICE_UNAVAILABLE",
            Self::AllProvidersFailed => "EXTERNAL_SERVICE_ERROR",
            Self::Store(_) => "DATABASE_ERROR",
            Self::Integrity(_) | Self::Config(_) | Self::Internal(_) | Self::Io(_) => {
                "INTERNAL_ERROR"
            }
        }
    }

    /// HTTP status for the error code.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::TokenInvalid(_)
            | Self::TokenExpired
            | Self::Unauthorized(_)
            | Self::MissingSignature
            | Self::ExpiredTimestamp
            | Self::ReplayAttack
            | Self::InvalidSignature => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) | Self::TwoFactorRequired | Self::InsufficientScope(_) => {
                StatusCode::FORBIDDEN
            }
            Self::RateLimited { .. } | Self::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Validation(_) | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::NoCandidates | Self::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::AllProvidersFailed => StatusCode::BAD_GATEWAY,
            Self::Integrity(_) | Self::Config(_) | Self::Internal(_) | Self::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Extra structured detail attached to the JSON body.
    fn details(&self) -> Value {
        match self {
            Self::RateLimited {
                retry_after_secs,
                limit,
            } => serde_json::json!({
                "retryAfterSecs": retry_after_secs,
                "limit": limit,
            }),
            _ => Value::Object(Default::default()),
        }
    }

    /// Build the canonical error response for a known request id.
    pub fn to_response(&self, request_id: Uuid) -> Response {
        let status = self.status();
        // Integrity and infrastructure details never leak to the client.
        let message = match self {
            Self::Integrity(_) | Self::Config(_) | Self::Internal(_) | Self::Io(_) => {
                "Internal error".to_string()
            }
            Self::Store(_) => "Storage backend unavailable".to_string(),
            other => other.to_string(),
        };

        let body = ErrorBody {
            error: message,
            code: self.code().to_string(),
            details: self.details(),
            request_id: request_id.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        };

        let mut response = (status, Json(body)).into_response();
        if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
            response.headers_mut().insert("x-request-id", value);
        }
        if let Self::RateLimited {
            retry_after_secs, ..
        } = self
        {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Canonical JSON error body returned by every failing endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Human-readable message.
    pub error: String,
    /// Stable code from the error taxonomy.
    pub code: String,
    /// Structured extra detail (empty object when none).
    pub details: Value,
    /// Request id, also present as the `X-Request-ID` header.
    #[serde(rename = "requestId")]
    pub request_id: String,
    /// ISO-8601 timestamp.
    pub timestamp: String,
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Internal(format!("http client error: {err}"))
    }
}

impl From<toml::de::Error> for GatewayError {
    fn from(err: toml::de::Error) -> Self {
        GatewayError::Config(err.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.to_response(Uuid::new_v4())
    }
}
