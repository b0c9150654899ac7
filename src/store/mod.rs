//! Store adapters: the persistent vault store and the fast shared store.
//!
//! Components are written against the two traits here and receive concrete
//! backends at process start. The in-memory implementations are the default
//! for development and double as test fakes; Postgres and Redis back
//! production deployments.

pub mod memory;
pub mod postgres;
pub mod redis;
pub mod types;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::providers::Provider;
pub use types::{
    ApiKeyRecord, AuditAction, AuditRecord, SharedTokenRecord, UsageRecord, User, WebhookRecord,
};

/// Errors surfaced by store adapters.
///
/// Transport errors are fatal for the request by default; the explicit
/// fail-open points (rate limiter, latency cache) live in the callers.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Typed CRUD over the persistent entities (§ data model).
#[async_trait]
pub trait VaultStore: Send + Sync {
    // === Users ===
    async fn create_user(&self, user: User) -> StoreResult<()>;
    async fn user_by_id(&self, id: Uuid) -> StoreResult<Option<User>>;
    async fn user_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    async fn update_user(&self, user: User) -> StoreResult<()>;

    // === API keys ===
    async fn create_api_key(&self, key: ApiKeyRecord) -> StoreResult<()>;
    async fn api_key_by_id(&self, id: Uuid) -> StoreResult<Option<ApiKeyRecord>>;
    /// Keys owned by a user, oldest first (insertion order).
    async fn api_keys_for_user(&self, owner: Uuid) -> StoreResult<Vec<ApiKeyRecord>>;
    async fn update_api_key(&self, key: ApiKeyRecord) -> StoreResult<()>;
    /// Deletes the key and cascade-deletes its shared tokens.
    async fn delete_api_key(&self, id: Uuid) -> StoreResult<()>;
    async fn find_key_by_material_hash(
        &self,
        owner: Uuid,
        material_hash: &str,
    ) -> StoreResult<Option<ApiKeyRecord>>;
    /// Providers for which at least one active key exists, any owner.
    async fn active_providers(&self) -> StoreResult<Vec<Provider>>;
    /// The most recently used active key for a provider (probe target).
    async fn most_recent_key_for_provider(
        &self,
        provider: Provider,
    ) -> StoreResult<Option<ApiKeyRecord>>;

    // === Shared tokens ===
    /// Writes the token row and its audit entry atomically.
    async fn create_token_with_audit(
        &self,
        token: SharedTokenRecord,
        audit: AuditRecord,
    ) -> StoreResult<()>;
    async fn token_by_id(&self, id: Uuid) -> StoreResult<Option<SharedTokenRecord>>;
    /// Request-time lookup; returns inactive rows too so the caller can
    /// reject them without a timing difference.
    async fn token_by_hash(&self, token_hash: &str) -> StoreResult<Option<SharedTokenRecord>>;
    async fn tokens_for_user(&self, owner: Uuid) -> StoreResult<Vec<SharedTokenRecord>>;
    async fn update_token(&self, token: SharedTokenRecord) -> StoreResult<()>;
    async fn delete_token(&self, id: Uuid) -> StoreResult<()>;
    /// Atomically replaces `access_token` and `token_hash` on a row.
    async fn rotate_token(
        &self,
        id: Uuid,
        new_plaintext: Option<String>,
        new_hash: String,
    ) -> StoreResult<SharedTokenRecord>;
    /// Bumps `usage_count` and `last_used_at` on the token and
    /// `last_used_at` on its key.
    async fn record_token_use(
        &self,
        token_id: Uuid,
        api_key_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;
    async fn deactivate_token(&self, id: Uuid) -> StoreResult<()>;
    /// Marks every still-active token whose expiry has passed as inactive
    /// and returns the affected rows.
    async fn expire_tokens_before(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<SharedTokenRecord>>;

    // === Usage log ===
    async fn append_usage(&self, record: UsageRecord) -> StoreResult<()>;
    async fn usage_for_user(&self, owner: Uuid, limit: u32) -> StoreResult<Vec<UsageRecord>>;
    /// Count of usage records for a token on a UTC day.
    async fn usage_count_for_token_on(
        &self,
        token_id: Uuid,
        day: NaiveDate,
    ) -> StoreResult<u64>;
    async fn prune_usage_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    // === Audit log ===
    async fn append_audit(&self, record: AuditRecord) -> StoreResult<()>;
    async fn audit_with_action(
        &self,
        action: AuditAction,
        limit: u32,
    ) -> StoreResult<Vec<AuditRecord>>;
    async fn prune_audit_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    // === Webhooks ===
    async fn create_webhook(&self, webhook: WebhookRecord) -> StoreResult<()>;
    async fn webhook_by_id(&self, id: Uuid) -> StoreResult<Option<WebhookRecord>>;
    async fn webhooks_for_user(&self, owner: Uuid) -> StoreResult<Vec<WebhookRecord>>;
    async fn active_webhooks(&self) -> StoreResult<Vec<WebhookRecord>>;
    async fn delete_webhook(&self, id: Uuid) -> StoreResult<()>;

    /// Liveness check for the health endpoint.
    async fn ping(&self) -> StoreResult<()>;
}

/// Counters, TTL keys, lists, and sets for the request-time fast path.
#[async_trait]
pub trait FastStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()>;
    /// Set only if absent; returns whether the key was set. Used for nonce
    /// replay detection.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<bool>;
    async fn del(&self, key: &str) -> StoreResult<()>;
    /// Atomic increment, creating the key at 1.
    async fn incr(&self, key: &str) -> StoreResult<i64>;
    /// Apply a TTL to an existing key; returns whether the key existed.
    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<bool>;

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()>;
    async fn srem(&self, key: &str, member: &str) -> StoreResult<()>;
    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Push to the head of a list; returns the new length.
    async fn lpush(&self, key: &str, value: &str) -> StoreResult<u64>;
    async fn llen(&self, key: &str) -> StoreResult<u64>;
    async fn rpop(&self, key: &str) -> StoreResult<Option<String>>;

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;
    async fn ping(&self) -> StoreResult<()>;
}

// === Fast-store key layout ===

/// Fixed-window rate-limit counter for a scope/key/window triple.
pub fn ratelimit_key(scope: &str, key: &str, window_index: i64) -> String {
    format!("ratelimit:{scope}:{key}:{window_index}")
}

/// Cached latency sample for a provider, milliseconds.
pub fn latency_key(provider: Provider) -> String {
    format!("latency:{provider}")
}

/// Suspicious-event list for a token and event type.
pub fn suspicious_key(token_id: Uuid, kind: &str) -> String {
    format!("suspicious:{token_id}:{kind}")
}

/// Prefix covering every suspicious-event list of a token.
pub fn suspicious_prefix(token_id: Uuid) -> String {
    format!("suspicious:{token_id}:")
}

/// Replay-protection nonce marker.
pub fn nonce_key(token_id: Uuid, nonce: &str) -> String {
    format!("nonce:{token_id}:{nonce}")
}

/// Pending webhook deliveries.
pub const WEBHOOK_QUEUE_KEY: &str = "webhooks:queue";
