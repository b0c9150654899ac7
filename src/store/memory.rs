//! In-memory store backends.
//!
//! Default for development, and the fakes every test suite builds on.
//! TTL semantics follow Redis closely enough for the gateway's use:
//! expiry is checked on access, `INCR` creates missing keys at 1, and
//! lists/sets are typed per key.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;
// TTLs follow the runtime clock, not the wall clock.
use tokio::time::Instant;
use uuid::Uuid;

use super::{
    ApiKeyRecord, AuditAction, AuditRecord, FastStore, SharedTokenRecord, StoreError, StoreResult,
    UsageRecord, User, VaultStore, WebhookRecord,
};
use crate::providers::Provider;

// === Persistent store ===

#[derive(Default)]
struct VaultTables {
    users: HashMap<Uuid, User>,
    api_keys: HashMap<Uuid, ApiKeyRecord>,
    tokens: HashMap<Uuid, SharedTokenRecord>,
    usage: Vec<UsageRecord>,
    audit: Vec<AuditRecord>,
    webhooks: HashMap<Uuid, WebhookRecord>,
}

/// In-memory [`VaultStore`].
#[derive(Default)]
pub struct MemoryVaultStore {
    tables: Arc<RwLock<VaultTables>>,
}

impl MemoryVaultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VaultStore for MemoryVaultStore {
    async fn create_user(&self, user: User) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables.users.values().any(|u| u.email == user.email) {
            return Err(StoreError::Conflict(format!(
                "email already registered: {}",
                user.email
            )));
        }
        tables.users.insert(user.id, user);
        Ok(())
    }

    async fn user_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.tables.read().await.users.get(&id).cloned())
    }

    async fn user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        Ok(self
            .tables
            .read()
            .await
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn update_user(&self, user: User) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.users.contains_key(&user.id) {
            return Err(StoreError::NotFound);
        }
        tables.users.insert(user.id, user);
        Ok(())
    }

    async fn create_api_key(&self, key: ApiKeyRecord) -> StoreResult<()> {
        self.tables.write().await.api_keys.insert(key.id, key);
        Ok(())
    }

    async fn api_key_by_id(&self, id: Uuid) -> StoreResult<Option<ApiKeyRecord>> {
        Ok(self.tables.read().await.api_keys.get(&id).cloned())
    }

    async fn api_keys_for_user(&self, owner: Uuid) -> StoreResult<Vec<ApiKeyRecord>> {
        let tables = self.tables.read().await;
        let mut keys: Vec<_> = tables
            .api_keys
            .values()
            .filter(|k| k.owner_user == owner)
            .cloned()
            .collect();
        keys.sort_by_key(|k| k.created_at);
        Ok(keys)
    }

    async fn update_api_key(&self, key: ApiKeyRecord) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.api_keys.contains_key(&key.id) {
            return Err(StoreError::NotFound);
        }
        tables.api_keys.insert(key.id, key);
        Ok(())
    }

    async fn delete_api_key(&self, id: Uuid) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables.api_keys.remove(&id).is_none() {
            return Err(StoreError::NotFound);
        }
        tables.tokens.retain(|_, t| t.api_key_ref != id);
        Ok(())
    }

    async fn find_key_by_material_hash(
        &self,
        owner: Uuid,
        material_hash: &str,
    ) -> StoreResult<Option<ApiKeyRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .api_keys
            .values()
            .find(|k| k.owner_user == owner && k.material_hash == material_hash)
            .cloned())
    }

    async fn active_providers(&self) -> StoreResult<Vec<Provider>> {
        let tables = self.tables.read().await;
        let mut seen = HashSet::new();
        let mut providers = Vec::new();
        for key in tables.api_keys.values().filter(|k| k.active) {
            if seen.insert(key.provider) {
                providers.push(key.provider);
            }
        }
        Ok(providers)
    }

    async fn most_recent_key_for_provider(
        &self,
        provider: Provider,
    ) -> StoreResult<Option<ApiKeyRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .api_keys
            .values()
            .filter(|k| k.active && k.provider == provider)
            .max_by_key(|k| k.last_used_at.unwrap_or(k.created_at))
            .cloned())
    }

    async fn create_token_with_audit(
        &self,
        token: SharedTokenRecord,
        audit: AuditRecord,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables
            .tokens
            .values()
            .any(|t| t.token_hash == token.token_hash)
        {
            return Err(StoreError::Conflict("token hash collision".into()));
        }
        tables.tokens.insert(token.id, token);
        tables.audit.push(audit);
        Ok(())
    }

    async fn token_by_id(&self, id: Uuid) -> StoreResult<Option<SharedTokenRecord>> {
        Ok(self.tables.read().await.tokens.get(&id).cloned())
    }

    async fn token_by_hash(&self, token_hash: &str) -> StoreResult<Option<SharedTokenRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .tokens
            .values()
            .find(|t| t.token_hash == token_hash)
            .cloned())
    }

    async fn tokens_for_user(&self, owner: Uuid) -> StoreResult<Vec<SharedTokenRecord>> {
        let tables = self.tables.read().await;
        let mut tokens: Vec<_> = tables
            .tokens
            .values()
            .filter(|t| t.owner_user == owner)
            .cloned()
            .collect();
        tokens.sort_by_key(|t| t.created_at);
        Ok(tokens)
    }

    async fn update_token(&self, token: SharedTokenRecord) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.tokens.contains_key(&token.id) {
            return Err(StoreError::NotFound);
        }
        tables.tokens.insert(token.id, token);
        Ok(())
    }

    async fn delete_token(&self, id: Uuid) -> StoreResult<()> {
        if self.tables.write().await.tokens.remove(&id).is_none() {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn rotate_token(
        &self,
        id: Uuid,
        new_plaintext: Option<String>,
        new_hash: String,
    ) -> StoreResult<SharedTokenRecord> {
        let mut tables = self.tables.write().await;
        let token = tables.tokens.get_mut(&id).ok_or(StoreError::NotFound)?;
        token.access_token = new_plaintext;
        token.token_hash = new_hash;
        Ok(token.clone())
    }

    async fn record_token_use(
        &self,
        token_id: Uuid,
        api_key_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if let Some(token) = tables.tokens.get_mut(&token_id) {
            token.usage_count += 1;
            token.last_used_at = Some(at);
        }
        if let Some(key) = tables.api_keys.get_mut(&api_key_id) {
            key.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn deactivate_token(&self, id: Uuid) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let token = tables.tokens.get_mut(&id).ok_or(StoreError::NotFound)?;
        token.active = false;
        Ok(())
    }

    async fn expire_tokens_before(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<SharedTokenRecord>> {
        let mut tables = self.tables.write().await;
        let mut expired = Vec::new();
        for token in tables.tokens.values_mut() {
            if token.active && token.is_expired(now) {
                token.active = false;
                expired.push(token.clone());
            }
        }
        Ok(expired)
    }

    async fn append_usage(&self, record: UsageRecord) -> StoreResult<()> {
        self.tables.write().await.usage.push(record);
        Ok(())
    }

    async fn usage_for_user(&self, owner: Uuid, limit: u32) -> StoreResult<Vec<UsageRecord>> {
        let tables = self.tables.read().await;
        let mut records: Vec<_> = tables
            .usage
            .iter()
            .filter(|r| r.user_ref == owner)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit as usize);
        Ok(records)
    }

    async fn usage_count_for_token_on(
        &self,
        token_id: Uuid,
        day: NaiveDate,
    ) -> StoreResult<u64> {
        let tables = self.tables.read().await;
        Ok(tables
            .usage
            .iter()
            .filter(|r| r.shared_token_ref == token_id && r.created_at.date_naive() == day)
            .count() as u64)
    }

    async fn prune_usage_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.usage.len();
        tables.usage.retain(|r| r.created_at >= cutoff);
        Ok((before - tables.usage.len()) as u64)
    }

    async fn append_audit(&self, record: AuditRecord) -> StoreResult<()> {
        self.tables.write().await.audit.push(record);
        Ok(())
    }

    async fn audit_with_action(
        &self,
        action: AuditAction,
        limit: u32,
    ) -> StoreResult<Vec<AuditRecord>> {
        let tables = self.tables.read().await;
        let mut records: Vec<_> = tables
            .audit
            .iter()
            .filter(|r| r.action == action)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit as usize);
        Ok(records)
    }

    async fn prune_audit_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.audit.len();
        tables.audit.retain(|r| r.created_at >= cutoff);
        Ok((before - tables.audit.len()) as u64)
    }

    async fn create_webhook(&self, webhook: WebhookRecord) -> StoreResult<()> {
        self.tables.write().await.webhooks.insert(webhook.id, webhook);
        Ok(())
    }

    async fn webhook_by_id(&self, id: Uuid) -> StoreResult<Option<WebhookRecord>> {
        Ok(self.tables.read().await.webhooks.get(&id).cloned())
    }

    async fn webhooks_for_user(&self, owner: Uuid) -> StoreResult<Vec<WebhookRecord>> {
        let tables = self.tables.read().await;
        let mut hooks: Vec<_> = tables
            .webhooks
            .values()
            .filter(|w| w.owner_user == owner)
            .cloned()
            .collect();
        hooks.sort_by_key(|w| w.created_at);
        Ok(hooks)
    }

    async fn active_webhooks(&self) -> StoreResult<Vec<WebhookRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .webhooks
            .values()
            .filter(|w| w.active)
            .cloned()
            .collect())
    }

    async fn delete_webhook(&self, id: Uuid) -> StoreResult<()> {
        if self.tables.write().await.webhooks.remove(&id).is_none() {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

// === Fast store ===

enum FastValue {
    Text(String),
    List(VecDeque<String>),
    Set(HashSet<String>),
}

struct FastEntry {
    value: FastValue,
    expires_at: Option<Instant>,
}

impl FastEntry {
    fn live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// In-memory [`FastStore`] with expiry-on-access TTL handling.
#[derive(Default)]
pub struct MemoryFastStore {
    entries: Arc<RwLock<HashMap<String, FastEntry>>>,
}

impl MemoryFastStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ttl_instant(ttl_secs: u64) -> Option<Instant> {
        Some(Instant::now() + Duration::from_secs(ttl_secs))
    }
}

#[async_trait]
impl FastStore for MemoryFastStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(key) {
            if entry.live() {
                return match &entry.value {
                    FastValue::Text(s) => Ok(Some(s.clone())),
                    _ => Ok(None),
                };
            }
        }
        entries.remove(key);
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()> {
        self.entries.write().await.insert(
            key.to_string(),
            FastEntry {
                value: FastValue::Text(value.to_string()),
                expires_at: Self::ttl_instant(ttl_secs),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<bool> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(key) {
            if entry.live() {
                return Ok(false);
            }
        }
        entries.insert(
            key.to_string(),
            FastEntry {
                value: FastValue::Text(value.to_string()),
                expires_at: Self::ttl_instant(ttl_secs),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut entries = self.entries.write().await;
        let current = match entries.get(key) {
            Some(entry) if entry.live() => match &entry.value {
                FastValue::Text(s) => s.parse::<i64>().unwrap_or(0),
                _ => return Err(StoreError::Backend("INCR on non-string key".into())),
            },
            _ => 0,
        };
        let next = current + 1;
        let expires_at = entries.get(key).filter(|e| e.live()).and_then(|e| e.expires_at);
        entries.insert(
            key.to_string(),
            FastEntry {
                value: FastValue::Text(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<bool> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) if entry.live() => {
                entry.expires_at = Self::ttl_instant(ttl_secs);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| FastEntry {
                value: FastValue::Set(HashSet::new()),
                expires_at: None,
            });
        if !entry.live() || !matches!(entry.value, FastValue::Set(_)) {
            *entry = FastEntry {
                value: FastValue::Set(HashSet::new()),
                expires_at: None,
            };
        }
        if let FastValue::Set(set) = &mut entry.value {
            set.insert(member.to_string());
        }
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut entries = self.entries.write().await;
        if let Some(FastEntry {
            value: FastValue::Set(set),
            ..
        }) = entries.get_mut(key).filter(|e| e.live())
        {
            set.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let entries = self.entries.read().await;
        match entries.get(key).filter(|e| e.live()) {
            Some(FastEntry {
                value: FastValue::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn lpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| FastEntry {
                value: FastValue::List(VecDeque::new()),
                expires_at: None,
            });
        if !entry.live() || !matches!(entry.value, FastValue::List(_)) {
            *entry = FastEntry {
                value: FastValue::List(VecDeque::new()),
                expires_at: None,
            };
        }
        match &mut entry.value {
            FastValue::List(list) => {
                list.push_front(value.to_string());
                Ok(list.len() as u64)
            }
            _ => unreachable!("entry was just normalized to a list"),
        }
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        let entries = self.entries.read().await;
        match entries.get(key).filter(|e| e.live()) {
            Some(FastEntry {
                value: FastValue::List(list),
                ..
            }) => Ok(list.len() as u64),
            _ => Ok(0),
        }
    }

    async fn rpop(&self, key: &str) -> StoreResult<Option<String>> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(key).filter(|e| e.live()) {
            Some(FastEntry {
                value: FastValue::List(list),
                ..
            }) => Ok(list.pop_back()),
            _ => Ok(None),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.live())
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
