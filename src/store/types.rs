//! Entity records shared by every store backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::providers::Provider;

/// An account that owns API keys and shared tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    /// `salt_hex:pbkdf2_hex` (see `crypto::hash`).
    pub password_hash: String,
    /// Base32 TOTP secret, present once 2FA setup has started.
    pub totp_secret: Option<String>,
    pub totp_enabled: bool,
    /// SHA-256 hashes of unspent backup codes.
    pub backup_code_hashes: Vec<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Fresh active user with a hashed password.
    pub fn new(email: impl Into<String>, password_hash: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            password_hash: password_hash.into(),
            totp_secret: None,
            totp_enabled: false,
            backup_code_hashes: Vec::new(),
            active: true,
            created_at: Utc::now(),
        }
    }
}

/// A deposited upstream credential and its policy envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub owner_user: Uuid,
    pub team: Option<Uuid>,
    pub provider: Provider,
    /// AEAD blob (`nonce || tag || ciphertext`, base64). The plaintext never
    /// persists anywhere else.
    pub encrypted_material: String,
    /// SHA-256 of the plaintext; dedup lookups only, never decryption.
    pub material_hash: String,
    /// First and last few characters of the plaintext, for UI listings.
    pub display_prefix: String,
    /// Endpoint override, required for AZURE_OPENAI and CUSTOM keys.
    pub base_url: Option<String>,
    pub rate_per_minute: u32,
    pub daily_cap: u32,
    pub active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A policy object delegating use of exactly one API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedTokenRecord {
    pub id: Uuid,
    pub api_key_ref: Uuid,
    pub owner_user: Uuid,
    /// Plaintext access token; populated only when the deployment keeps
    /// plaintext at rest (`vault.store_plaintext_tokens`).
    pub access_token: Option<String>,
    /// SHA-256 of the access token; the sole request-time lookup key.
    pub token_hash: String,
    pub name: Option<String>,
    pub rate_per_minute: u32,
    /// 0 means no daily cap.
    pub daily_cap: u32,
    pub usage_count: u64,
    pub max_total_use: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Literal addresses, CIDRs, or the literal `unknown`. Empty = any.
    pub allowed_ips: Vec<String>,
    /// Exact model names. Empty = any.
    pub allowed_models: Vec<String>,
    /// Scope vocabulary entries or the wildcard `*`.
    pub scopes: Vec<String>,
    pub require_signature: bool,
    pub signing_secret: Option<String>,
    pub active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SharedTokenRecord {
    /// Whether the token has passed its expiry instant.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }

    /// Whether the lifetime usage allowance is exhausted.
    pub fn is_exhausted(&self) -> bool {
        self.max_total_use
            .is_some_and(|cap| self.usage_count >= cap)
    }
}

/// Immutable usage record written after each completed proxy attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub id: Uuid,
    pub api_key_ref: Uuid,
    pub shared_token_ref: Uuid,
    pub user_ref: Uuid,
    pub provider: Provider,
    pub model: Option<String>,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub request_tokens: Option<u64>,
    pub response_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub latency_ms: u64,
    pub client_ip: String,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Administratively sensitive events, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub action: AuditAction,
    pub actor_user: Option<Uuid>,
    pub detail: Value,
    pub request_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Convenience constructor stamping id and time.
    pub fn new(action: AuditAction, actor_user: Option<Uuid>, detail: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            actor_user,
            detail,
            request_id: None,
            created_at: Utc::now(),
        }
    }

    /// Attach the request id that triggered the event.
    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }
}

/// Closed set of audit actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    ApiKeyCreated,
    ApiKeyUpdated,
    ApiKeyDeleted,
    ApiKeyRevealed,
    SharedKeyCreated,
    SharedKeyUpdated,
    SharedKeyDeleted,
    TokenRotated,
    SuspiciousActivity,
    TwoFactorEnabled,
    TwoFactorDisabled,
    WebhookRegistered,
    WebhookDeleted,
    WebhookDelivered,
    WebhookFailed,
    ApiError,
    UsageBackpressure,
}

impl AuditAction {
    /// Canonical tag written to the log.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ApiKeyCreated => "API_KEY_CREATED",
            Self::ApiKeyUpdated => "API_KEY_UPDATED",
            Self::ApiKeyDeleted => "API_KEY_DELETED",
            Self::ApiKeyRevealed => "API_KEY_REVEALED",
            Self::SharedKeyCreated => "SHARED_KEY_CREATED",
            Self::SharedKeyUpdated => "SHARED_KEY_UPDATED",
            Self::SharedKeyDeleted => "SHARED_KEY_DELETED",
            Self::TokenRotated => "TOKEN_ROTATED",
            Self::SuspiciousActivity => "SUSPICIOUS_ACTIVITY",
            Self::TwoFactorEnabled => "2FA_ENABLED",
            Self::TwoFactorDisabled => "2FA_DISABLED",
            Self::WebhookRegistered => "WEBHOOK_REGISTERED",
            Self::WebhookDeleted => "WEBHOOK_DELETED",
            Self::WebhookDelivered => "WEBHOOK_DELIVERED",
            Self::WebhookFailed => "WEBHOOK_FAILED",
            Self::ApiError => "API_ERROR",
            Self::UsageBackpressure => "USAGE_BACKPRESSURE",
        }
    }

    /// Parse a canonical tag back into an action.
    pub fn from_tag(tag: &str) -> Option<Self> {
        const ALL: [AuditAction; 17] = [
            AuditAction::ApiKeyCreated,
            AuditAction::ApiKeyUpdated,
            AuditAction::ApiKeyDeleted,
            AuditAction::ApiKeyRevealed,
            AuditAction::SharedKeyCreated,
            AuditAction::SharedKeyUpdated,
            AuditAction::SharedKeyDeleted,
            AuditAction::TokenRotated,
            AuditAction::SuspiciousActivity,
            AuditAction::TwoFactorEnabled,
            AuditAction::TwoFactorDisabled,
            AuditAction::WebhookRegistered,
            AuditAction::WebhookDeleted,
            AuditAction::WebhookDelivered,
            AuditAction::WebhookFailed,
            AuditAction::ApiError,
            AuditAction::UsageBackpressure,
        ];
        ALL.into_iter().find(|a| a.tag() == tag)
    }
}

/// A registered webhook endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRecord {
    pub id: Uuid,
    pub owner_user: Uuid,
    pub url: String,
    /// Shared secret for `X-Feen-Webhook-Signature`.
    pub secret: String,
    /// Event names this endpoint subscribes to; `*` subscribes to all.
    pub events: Vec<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl WebhookRecord {
    /// Whether this webhook subscribes to the given event.
    pub fn subscribes_to(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == "*" || e == event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token() -> SharedTokenRecord {
        SharedTokenRecord {
            id: Uuid::new_v4(),
            api_key_ref: Uuid::new_v4(),
            owner_user: Uuid::new_v4(),
            access_token: None,
            token_hash: "hash".into(),
            name: None,
            rate_per_minute: 60,
            daily_cap: 0,
            usage_count: 0,
            max_total_use: None,
            expires_at: None,
            allowed_ips: Vec::new(),
            allowed_models: Vec::new(),
            scopes: vec!["*".into()],
            require_signature: false,
            signing_secret: None,
            active: true,
            last_used_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let mut t = token();
        assert!(!t.is_expired(now));
        t.expires_at = Some(now - Duration::seconds(1));
        assert!(t.is_expired(now));
        t.expires_at = Some(now + Duration::seconds(60));
        assert!(!t.is_expired(now));
    }

    #[test]
    fn test_exhaustion() {
        let mut t = token();
        assert!(!t.is_exhausted());
        t.max_total_use = Some(10);
        t.usage_count = 9;
        assert!(!t.is_exhausted());
        t.usage_count = 10;
        assert!(t.is_exhausted());
    }

    #[test]
    fn test_webhook_subscription() {
        let hook = WebhookRecord {
            id: Uuid::new_v4(),
            owner_user: Uuid::new_v4(),
            url: "https://example.com/hook".into(),
            secret: "s".into(),
            events: vec!["token.rotated".into()],
            active: true,
            created_at: Utc::now(),
        };
        assert!(hook.subscribes_to("token.rotated"));
        assert!(!hook.subscribes_to("token.expired"));

        let all = WebhookRecord {
            events: vec!["*".into()],
            ..hook
        };
        assert!(all.subscribes_to("token.expired"));
    }

    #[test]
    fn test_audit_action_tags() {
        assert_eq!(AuditAction::TokenRotated.tag(), "TOKEN_ROTATED");
        assert_eq!(AuditAction::TwoFactorEnabled.tag(), "2FA_ENABLED");
        assert_eq!(AuditAction::ApiError.tag(), "API_ERROR");
    }
}
