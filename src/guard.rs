//! Suspicious-activity tracking and automatic token rotation.
//!
//! Each failure type has a rotation threshold inside a shared one-hour
//! window. Crossing a threshold mints a replacement token, invalidating
//! every outstanding copy of the old one.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::crypto::{self, lookup_hash};
use crate::error::Result;
use crate::store::{
    suspicious_key, suspicious_prefix, AuditAction, AuditRecord, FastStore, VaultStore,
    WEBHOOK_QUEUE_KEY,
};

/// Window in which suspicious events accumulate.
const SUSPICIOUS_WINDOW_SECS: u64 = 3600;

/// Classified failure types that count against a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspiciousKind {
    InvalidSignature,
    MissingSignature,
    ExpiredTimestamp,
    ReplayAttack,
    IpBlacklisted,
    ScopeDenied,
    ModelNotAllowed,
    ExpiredToken,
    QuotaExceeded,
    RateLimited,
    UpstreamFailure,
}

impl SuspiciousKind {
    /// Canonical tag used in fast-store keys and audit detail.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::MissingSignature => "MISSING_SIGNATURE",
            Self::ExpiredTimestamp => "EXPIRED_TIMESTAMP",
            Self::ReplayAttack => "REPLAY_ATTACK",
            Self::IpBlacklisted => "IP_BLACKLISTED",
            Self::ScopeDenied => "SCOPE_DENIED",
            Self::ModelNotAllowed => "MODEL_NOT_ALLOWED",
            Self::ExpiredToken => "EXPIRED_TOKEN",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::RateLimited => "RATE_LIMITED",
            Self::UpstreamFailure => "UPSTREAM_FAILURE",
        }
    }

    /// Rotation reason recorded in the audit log.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidSignature => "invalid_signature",
            Self::MissingSignature => "missing_signature",
            Self::ExpiredTimestamp => "expired_timestamp",
            Self::ReplayAttack => "replay_attack",
            Self::IpBlacklisted => "ip_blacklisted",
            Self::ScopeDenied => "scope_denied",
            Self::ModelNotAllowed => "model_not_allowed",
            Self::ExpiredToken => "expired_token",
            Self::QuotaExceeded => "quota_exceeded",
            Self::RateLimited => "rate_limited",
            Self::UpstreamFailure => "upstream_failure",
        }
    }

    /// Events within the window before rotation fires. Replays and
    /// blacklisted addresses rotate immediately.
    pub fn rotation_threshold(&self) -> u64 {
        match self {
            Self::ReplayAttack | Self::IpBlacklisted => 1,
            Self::InvalidSignature => 3,
            Self::MissingSignature | Self::ExpiredTimestamp => 5,
            Self::ScopeDenied | Self::ModelNotAllowed => 5,
            Self::ExpiredToken | Self::QuotaExceeded => 10,
            Self::RateLimited => 20,
            Self::UpstreamFailure => 10,
        }
    }
}

/// Records suspicious events and rotates tokens past their thresholds.
///
/// Modelled as a trait so the data plane can be tested with a fake that
/// observes events without touching stores.
#[async_trait]
pub trait RotationController: Send + Sync {
    /// Record one event; returns `true` when the event triggered rotation.
    async fn record_event(&self, token_id: Uuid, kind: SuspiciousKind) -> Result<bool>;

    /// Rotate a token now, for the given audit reason. Returns the new
    /// plaintext access token.
    async fn rotate(&self, token_id: Uuid, reason: &str) -> Result<String>;
}

/// The production controller, backed by the fast store's event lists.
pub struct SuspicionGuard {
    vault: Arc<dyn VaultStore>,
    fast: Arc<dyn FastStore>,
    /// Whether rotation writes the new plaintext back onto the row.
    store_plaintext: bool,
}

impl SuspicionGuard {
    pub fn new(
        vault: Arc<dyn VaultStore>,
        fast: Arc<dyn FastStore>,
        store_plaintext: bool,
    ) -> Self {
        Self {
            vault,
            fast,
            store_plaintext,
        }
    }

    /// Current event count for a token/kind pair (test and ops visibility).
    pub async fn event_count(&self, token_id: Uuid, kind: SuspiciousKind) -> Result<u64> {
        Ok(self.fast.llen(&suspicious_key(token_id, kind.tag())).await?)
    }
}

#[async_trait]
impl RotationController for SuspicionGuard {
    async fn record_event(&self, token_id: Uuid, kind: SuspiciousKind) -> Result<bool> {
        let key = suspicious_key(token_id, kind.tag());
        let event = json!({
            "kind": kind.tag(),
            "at": Utc::now().to_rfc3339(),
        })
        .to_string();

        let count = self.fast.lpush(&key, &event).await?;
        // Refresh the window on every event; the list dies an hour after
        // the last observation.
        self.fast.expire(&key, SUSPICIOUS_WINDOW_SECS).await?;

        self.vault
            .append_audit(AuditRecord::new(
                AuditAction::SuspiciousActivity,
                None,
                json!({ "tokenId": token_id, "kind": kind.tag(), "count": count }),
            ))
            .await?;

        if count >= kind.rotation_threshold() {
            self.rotate(token_id, kind.reason()).await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn rotate(&self, token_id: Uuid, reason: &str) -> Result<String> {
        let new_token = crypto::mint_access_token();
        let new_hash = lookup_hash(&new_token);
        let plaintext = self.store_plaintext.then(|| new_token.clone());

        // Single-writer update of access_token + token_hash. Concurrent
        // rotations are idempotent: the loser just rotates again.
        let rotated = self
            .vault
            .rotate_token(token_id, plaintext, new_hash)
            .await?;

        // The fast-store keys belong to the old token; drop them all.
        for key in self
            .fast
            .keys_with_prefix(&suspicious_prefix(token_id))
            .await?
        {
            self.fast.del(&key).await?;
        }

        self.vault
            .append_audit(AuditRecord::new(
                AuditAction::TokenRotated,
                None,
                json!({ "tokenId": token_id, "reason": reason }),
            ))
            .await?;

        let payload = json!({
            "event": "token.rotated",
            "data": {
                "tokenId": token_id,
                "ownerUser": rotated.owner_user,
                "reason": reason,
            },
            "timestamp": Utc::now().to_rfc3339(),
        });
        self.fast
            .lpush(WEBHOOK_QUEUE_KEY, &payload.to_string())
            .await?;

        tracing::warn!(%token_id, reason, "shared token rotated");
        Ok(new_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryFastStore, MemoryVaultStore};
    use crate::store::SharedTokenRecord;

    async fn seeded() -> (SuspicionGuard, Uuid, Arc<dyn VaultStore>) {
        let vault: Arc<dyn VaultStore> = Arc::new(MemoryVaultStore::new());
        let fast: Arc<dyn FastStore> = Arc::new(MemoryFastStore::new());

        let token = SharedTokenRecord {
            id: Uuid::new_v4(),
            api_key_ref: Uuid::new_v4(),
            owner_user: Uuid::new_v4(),
            access_token: None,
            token_hash: lookup_hash("feen_original"),
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
        };
        let id = token.id;
        vault
            .create_token_with_audit(
                token,
                AuditRecord::new(AuditAction::SharedKeyCreated, None, serde_json::Value::Null),
            )
            .await
            .unwrap();

        (SuspicionGuard::new(vault.clone(), fast, false), id, vault)
    }

    #[tokio::test]
    async fn test_threshold_rotation() {
        let (guard, token_id, vault) = seeded().await;

        // Two invalid signatures do not rotate; the third does.
        assert!(!guard
            .record_event(token_id, SuspiciousKind::InvalidSignature)
            .await
            .unwrap());
        assert!(!guard
            .record_event(token_id, SuspiciousKind::InvalidSignature)
            .await
            .unwrap());
        assert!(guard
            .record_event(token_id, SuspiciousKind::InvalidSignature)
            .await
            .unwrap());

        // Old hash is gone.
        assert!(vault
            .token_by_hash(&lookup_hash("feen_original"))
            .await
            .unwrap()
            .is_none());

        // Rotation audit carries the reason and clears the event lists.
        let audits = vault
            .audit_with_action(AuditAction::TokenRotated, 10)
            .await
            .unwrap();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].detail["reason"], "invalid_signature");
        assert_eq!(
            guard
                .event_count(token_id, SuspiciousKind::InvalidSignature)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_replay_rotates_immediately() {
        let (guard, token_id, _vault) = seeded().await;
        assert!(guard
            .record_event(token_id, SuspiciousKind::ReplayAttack)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_manual_rotation_yields_usable_token() {
        let (guard, token_id, vault) = seeded().await;
        let new_token = guard.rotate(token_id, "manual_rotation").await.unwrap();
        assert!(new_token.starts_with("feen_"));
        let found = vault
            .token_by_hash(&lookup_hash(&new_token))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, token_id);
        // Hash-only deployment: plaintext is not written back.
        assert!(found.access_token.is_none());
    }
}
