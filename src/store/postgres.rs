//! Postgres-backed [`VaultStore`].
//!
//! Queries are runtime-bound (`query`/`query_as` with positional binds) and
//! rows are decoded with hand-written `FromRow` impls. List-valued columns
//! (`allowed_ips`, `scopes`, ...) are stored as JSON text; the provider and
//! audit-action tags are stored as their canonical strings.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{postgres::PgRow, FromRow, PgPool, Postgres, Row};
use uuid::Uuid;

use super::{
    ApiKeyRecord, AuditAction, AuditRecord, SharedTokenRecord, StoreError, StoreResult,
    UsageRecord, User, VaultStore, WebhookRecord,
};
use crate::providers::Provider;

/// Postgres store over a connection pool.
#[derive(Clone)]
pub struct PgVaultStore {
    pool: PgPool,
}

impl PgVaultStore {
    /// Connect and make sure the schema exists.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Wrap an existing pool (tests, shared pools).
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_schema(&self) -> StoreResult<()> {
        const SCHEMA: &str = r#"
            CREATE TABLE IF NOT EXISTS users (
                id UUID PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                totp_secret TEXT,
                totp_enabled BOOLEAN NOT NULL DEFAULT FALSE,
                backup_code_hashes TEXT NOT NULL DEFAULT '[]',
                active BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMPTZ NOT NULL
            );
            CREATE TABLE IF NOT EXISTS api_keys (
                id UUID PRIMARY KEY,
                owner_user UUID NOT NULL REFERENCES users(id),
                team UUID,
                provider TEXT NOT NULL,
                encrypted_material TEXT NOT NULL,
                material_hash TEXT NOT NULL,
                display_prefix TEXT NOT NULL,
                base_url TEXT,
                rate_per_minute INTEGER NOT NULL,
                daily_cap INTEGER NOT NULL,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                last_used_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX IF NOT EXISTS api_keys_owner_idx ON api_keys(owner_user);
            CREATE INDEX IF NOT EXISTS api_keys_material_idx ON api_keys(owner_user, material_hash);
            CREATE TABLE IF NOT EXISTS shared_tokens (
                id UUID PRIMARY KEY,
                api_key_ref UUID NOT NULL REFERENCES api_keys(id) ON DELETE CASCADE,
                owner_user UUID NOT NULL REFERENCES users(id),
                access_token TEXT,
                token_hash TEXT NOT NULL UNIQUE,
                name TEXT,
                rate_per_minute INTEGER NOT NULL,
                daily_cap INTEGER NOT NULL,
                usage_count BIGINT NOT NULL DEFAULT 0,
                max_total_use BIGINT,
                expires_at TIMESTAMPTZ,
                allowed_ips TEXT NOT NULL DEFAULT '[]',
                allowed_models TEXT NOT NULL DEFAULT '[]',
                scopes TEXT NOT NULL DEFAULT '[]',
                require_signature BOOLEAN NOT NULL DEFAULT FALSE,
                signing_secret TEXT,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                last_used_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX IF NOT EXISTS shared_tokens_owner_idx ON shared_tokens(owner_user);
            CREATE TABLE IF NOT EXISTS usage_logs (
                id UUID PRIMARY KEY,
                api_key_ref UUID NOT NULL,
                shared_token_ref UUID NOT NULL,
                user_ref UUID NOT NULL,
                provider TEXT NOT NULL,
                model TEXT,
                endpoint TEXT NOT NULL,
                method TEXT NOT NULL,
                status_code INTEGER NOT NULL,
                request_tokens BIGINT,
                response_tokens BIGINT,
                total_tokens BIGINT,
                latency_ms BIGINT NOT NULL,
                client_ip TEXT NOT NULL,
                user_agent TEXT,
                created_at TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX IF NOT EXISTS usage_logs_token_day_idx ON usage_logs(shared_token_ref, created_at);
            CREATE TABLE IF NOT EXISTS audit_logs (
                id UUID PRIMARY KEY,
                action TEXT NOT NULL,
                actor_user UUID,
                detail TEXT NOT NULL,
                request_id UUID,
                created_at TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX IF NOT EXISTS audit_logs_action_idx ON audit_logs(action, created_at);
            CREATE TABLE IF NOT EXISTS webhooks (
                id UUID PRIMARY KEY,
                owner_user UUID NOT NULL REFERENCES users(id),
                url TEXT NOT NULL,
                secret TEXT NOT NULL,
                events TEXT NOT NULL DEFAULT '[]',
                active BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMPTZ NOT NULL
            );
        "#;
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}

fn json_list(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

fn parse_json_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn parse_provider(tag: &str) -> sqlx::Result<Provider> {
    Provider::from_str(tag).map_err(|e| sqlx::Error::ColumnDecode {
        index: "provider".into(),
        source: e.into(),
    })
}

fn parse_action(tag: &str) -> sqlx::Result<AuditAction> {
    AuditAction::from_tag(tag).ok_or_else(|| sqlx::Error::ColumnDecode {
        index: "action".into(),
        source: format!("unknown audit action: {tag}").into(),
    })
}

impl<'r> FromRow<'r, PgRow> for User {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            password_hash: row.try_get("password_hash")?,
            totp_secret: row.try_get("totp_secret")?,
            totp_enabled: row.try_get("totp_enabled")?,
            backup_code_hashes: parse_json_list(row.try_get("backup_code_hashes")?),
            active: row.try_get("active")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for ApiKeyRecord {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            owner_user: row.try_get("owner_user")?,
            team: row.try_get("team")?,
            provider: parse_provider(row.try_get("provider")?)?,
            encrypted_material: row.try_get("encrypted_material")?,
            material_hash: row.try_get("material_hash")?,
            display_prefix: row.try_get("display_prefix")?,
            base_url: row.try_get("base_url")?,
            rate_per_minute: row.try_get::<i32, _>("rate_per_minute")? as u32,
            daily_cap: row.try_get::<i32, _>("daily_cap")? as u32,
            active: row.try_get("active")?,
            last_used_at: row.try_get("last_used_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for SharedTokenRecord {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            api_key_ref: row.try_get("api_key_ref")?,
            owner_user: row.try_get("owner_user")?,
            access_token: row.try_get("access_token")?,
            token_hash: row.try_get("token_hash")?,
            name: row.try_get("name")?,
            rate_per_minute: row.try_get::<i32, _>("rate_per_minute")? as u32,
            daily_cap: row.try_get::<i32, _>("daily_cap")? as u32,
            usage_count: row.try_get::<i64, _>("usage_count")? as u64,
            max_total_use: row.try_get::<Option<i64>, _>("max_total_use")?.map(|v| v as u64),
            expires_at: row.try_get("expires_at")?,
            allowed_ips: parse_json_list(row.try_get("allowed_ips")?),
            allowed_models: parse_json_list(row.try_get("allowed_models")?),
            scopes: parse_json_list(row.try_get("scopes")?),
            require_signature: row.try_get("require_signature")?,
            signing_secret: row.try_get("signing_secret")?,
            active: row.try_get("active")?,
            last_used_at: row.try_get("last_used_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for UsageRecord {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            api_key_ref: row.try_get("api_key_ref")?,
            shared_token_ref: row.try_get("shared_token_ref")?,
            user_ref: row.try_get("user_ref")?,
            provider: parse_provider(row.try_get("provider")?)?,
            model: row.try_get("model")?,
            endpoint: row.try_get("endpoint")?,
            method: row.try_get("method")?,
            status_code: row.try_get::<i32, _>("status_code")? as u16,
            request_tokens: row.try_get::<Option<i64>, _>("request_tokens")?.map(|v| v as u64),
            response_tokens: row
                .try_get::<Option<i64>, _>("response_tokens")?
                .map(|v| v as u64),
            total_tokens: row.try_get::<Option<i64>, _>("total_tokens")?.map(|v| v as u64),
            latency_ms: row.try_get::<i64, _>("latency_ms")? as u64,
            client_ip: row.try_get("client_ip")?,
            user_agent: row.try_get("user_agent")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for AuditRecord {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            action: parse_action(row.try_get("action")?)?,
            actor_user: row.try_get("actor_user")?,
            detail: serde_json::from_str(row.try_get("detail")?).unwrap_or(serde_json::Value::Null),
            request_id: row.try_get("request_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for WebhookRecord {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            owner_user: row.try_get("owner_user")?,
            url: row.try_get("url")?,
            secret: row.try_get("secret")?,
            events: parse_json_list(row.try_get("events")?),
            active: row.try_get("active")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl VaultStore for PgVaultStore {
    async fn create_user(&self, user: User) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO users (id, email, password_hash, totp_secret, totp_enabled, backup_code_hashes, active, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.totp_secret)
        .bind(user.totp_enabled)
        .bind(json_list(&user.backup_code_hashes))
        .bind(user.active)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn user_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(sqlx::query_as::<Postgres, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        Ok(
            sqlx::query_as::<Postgres, User>("SELECT * FROM users WHERE email = $1")
                .bind(email)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn update_user(&self, user: User) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE users SET email = $2, password_hash = $3, totp_secret = $4, totp_enabled = $5, \
             backup_code_hashes = $6, active = $7 WHERE id = $1",
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.totp_secret)
        .bind(user.totp_enabled)
        .bind(json_list(&user.backup_code_hashes))
        .bind(user.active)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn create_api_key(&self, key: ApiKeyRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO api_keys (id, owner_user, team, provider, encrypted_material, material_hash, \
             display_prefix, base_url, rate_per_minute, daily_cap, active, last_used_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(key.id)
        .bind(key.owner_user)
        .bind(key.team)
        .bind(key.provider.tag())
        .bind(&key.encrypted_material)
        .bind(&key.material_hash)
        .bind(&key.display_prefix)
        .bind(&key.base_url)
        .bind(key.rate_per_minute as i32)
        .bind(key.daily_cap as i32)
        .bind(key.active)
        .bind(key.last_used_at)
        .bind(key.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn api_key_by_id(&self, id: Uuid) -> StoreResult<Option<ApiKeyRecord>> {
        Ok(
            sqlx::query_as::<Postgres, ApiKeyRecord>("SELECT * FROM api_keys WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn api_keys_for_user(&self, owner: Uuid) -> StoreResult<Vec<ApiKeyRecord>> {
        Ok(sqlx::query_as::<Postgres, ApiKeyRecord>(
            "SELECT * FROM api_keys WHERE owner_user = $1 ORDER BY created_at ASC",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn update_api_key(&self, key: ApiKeyRecord) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE api_keys SET team = $2, encrypted_material = $3, material_hash = $4, \
             display_prefix = $5, base_url = $6, rate_per_minute = $7, daily_cap = $8, \
             active = $9, last_used_at = $10 WHERE id = $1",
        )
        .bind(key.id)
        .bind(key.team)
        .bind(&key.encrypted_material)
        .bind(&key.material_hash)
        .bind(&key.display_prefix)
        .bind(&key.base_url)
        .bind(key.rate_per_minute as i32)
        .bind(key.daily_cap as i32)
        .bind(key.active)
        .bind(key.last_used_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn delete_api_key(&self, id: Uuid) -> StoreResult<()> {
        // shared_tokens cascades via the foreign key.
        let result = sqlx::query("DELETE FROM api_keys WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn find_key_by_material_hash(
        &self,
        owner: Uuid,
        material_hash: &str,
    ) -> StoreResult<Option<ApiKeyRecord>> {
        Ok(sqlx::query_as::<Postgres, ApiKeyRecord>(
            "SELECT * FROM api_keys WHERE owner_user = $1 AND material_hash = $2",
        )
        .bind(owner)
        .bind(material_hash)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn active_providers(&self) -> StoreResult<Vec<Provider>> {
        let rows = sqlx::query("SELECT DISTINCT provider FROM api_keys WHERE active = TRUE")
            .fetch_all(&self.pool)
            .await?;
        let mut providers = Vec::with_capacity(rows.len());
        for row in rows {
            let tag: String = row.try_get("provider")?;
            providers.push(parse_provider(&tag)?);
        }
        Ok(providers)
    }

    async fn most_recent_key_for_provider(
        &self,
        provider: Provider,
    ) -> StoreResult<Option<ApiKeyRecord>> {
        Ok(sqlx::query_as::<Postgres, ApiKeyRecord>(
            "SELECT * FROM api_keys WHERE active = TRUE AND provider = $1 \
             ORDER BY COALESCE(last_used_at, created_at) DESC LIMIT 1",
        )
        .bind(provider.tag())
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn create_token_with_audit(
        &self,
        token: SharedTokenRecord,
        audit: AuditRecord,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO shared_tokens (id, api_key_ref, owner_user, access_token, token_hash, name, \
             rate_per_minute, daily_cap, usage_count, max_total_use, expires_at, allowed_ips, \
             allowed_models, scopes, require_signature, signing_secret, active, last_used_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)",
        )
        .bind(token.id)
        .bind(token.api_key_ref)
        .bind(token.owner_user)
        .bind(&token.access_token)
        .bind(&token.token_hash)
        .bind(&token.name)
        .bind(token.rate_per_minute as i32)
        .bind(token.daily_cap as i32)
        .bind(token.usage_count as i64)
        .bind(token.max_total_use.map(|v| v as i64))
        .bind(token.expires_at)
        .bind(json_list(&token.allowed_ips))
        .bind(json_list(&token.allowed_models))
        .bind(json_list(&token.scopes))
        .bind(token.require_signature)
        .bind(&token.signing_secret)
        .bind(token.active)
        .bind(token.last_used_at)
        .bind(token.created_at)
        .execute(&mut *tx)
        .await?;

        insert_audit(&mut tx, &audit).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn token_by_id(&self, id: Uuid) -> StoreResult<Option<SharedTokenRecord>> {
        Ok(sqlx::query_as::<Postgres, SharedTokenRecord>(
            "SELECT * FROM shared_tokens WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn token_by_hash(&self, token_hash: &str) -> StoreResult<Option<SharedTokenRecord>> {
        Ok(sqlx::query_as::<Postgres, SharedTokenRecord>(
            "SELECT * FROM shared_tokens WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn tokens_for_user(&self, owner: Uuid) -> StoreResult<Vec<SharedTokenRecord>> {
        Ok(sqlx::query_as::<Postgres, SharedTokenRecord>(
            "SELECT * FROM shared_tokens WHERE owner_user = $1 ORDER BY created_at ASC",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn update_token(&self, token: SharedTokenRecord) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE shared_tokens SET name = $2, rate_per_minute = $3, daily_cap = $4, \
             max_total_use = $5, expires_at = $6, allowed_ips = $7, allowed_models = $8, \
             scopes = $9, require_signature = $10, signing_secret = $11, active = $12 \
             WHERE id = $1",
        )
        .bind(token.id)
        .bind(&token.name)
        .bind(token.rate_per_minute as i32)
        .bind(token.daily_cap as i32)
        .bind(token.max_total_use.map(|v| v as i64))
        .bind(token.expires_at)
        .bind(json_list(&token.allowed_ips))
        .bind(json_list(&token.allowed_models))
        .bind(json_list(&token.scopes))
        .bind(token.require_signature)
        .bind(&token.signing_secret)
        .bind(token.active)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn delete_token(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM shared_tokens WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
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
        sqlx::query_as::<Postgres, SharedTokenRecord>(
            "UPDATE shared_tokens SET access_token = $2, token_hash = $3 WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(new_plaintext)
        .bind(new_hash)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)
    }

    async fn record_token_use(
        &self,
        token_id: Uuid,
        api_key_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE shared_tokens SET usage_count = usage_count + 1, last_used_at = $2 WHERE id = $1",
        )
        .bind(token_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        sqlx::query("UPDATE api_keys SET last_used_at = $2 WHERE id = $1")
            .bind(api_key_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn deactivate_token(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("UPDATE shared_tokens SET active = FALSE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn expire_tokens_before(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<SharedTokenRecord>> {
        Ok(sqlx::query_as::<Postgres, SharedTokenRecord>(
            "UPDATE shared_tokens SET active = FALSE \
             WHERE active = TRUE AND expires_at IS NOT NULL AND expires_at < $1 RETURNING *",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn append_usage(&self, record: UsageRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO usage_logs (id, api_key_ref, shared_token_ref, user_ref, provider, model, \
             endpoint, method, status_code, request_tokens, response_tokens, total_tokens, \
             latency_ms, client_ip, user_agent, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(record.id)
        .bind(record.api_key_ref)
        .bind(record.shared_token_ref)
        .bind(record.user_ref)
        .bind(record.provider.tag())
        .bind(&record.model)
        .bind(&record.endpoint)
        .bind(&record.method)
        .bind(record.status_code as i32)
        .bind(record.request_tokens.map(|v| v as i64))
        .bind(record.response_tokens.map(|v| v as i64))
        .bind(record.total_tokens.map(|v| v as i64))
        .bind(record.latency_ms as i64)
        .bind(&record.client_ip)
        .bind(&record.user_agent)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn usage_for_user(&self, owner: Uuid, limit: u32) -> StoreResult<Vec<UsageRecord>> {
        Ok(sqlx::query_as::<Postgres, UsageRecord>(
            "SELECT * FROM usage_logs WHERE user_ref = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(owner)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn usage_count_for_token_on(
        &self,
        token_id: Uuid,
        day: NaiveDate,
    ) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM usage_logs WHERE shared_token_ref = $1 \
             AND created_at >= $2 AND created_at < $2 + INTERVAL '1 day'",
        )
        .bind(token_id)
        .bind(day.and_hms_opt(0, 0, 0).map(|t| t.and_utc()))
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn prune_usage_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM usage_logs WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn append_audit(&self, record: AuditRecord) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_audit(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn audit_with_action(
        &self,
        action: AuditAction,
        limit: u32,
    ) -> StoreResult<Vec<AuditRecord>> {
        Ok(sqlx::query_as::<Postgres, AuditRecord>(
            "SELECT * FROM audit_logs WHERE action = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(action.tag())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn prune_audit_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM audit_logs WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn create_webhook(&self, webhook: WebhookRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO webhooks (id, owner_user, url, secret, events, active, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(webhook.id)
        .bind(webhook.owner_user)
        .bind(&webhook.url)
        .bind(&webhook.secret)
        .bind(json_list(&webhook.events))
        .bind(webhook.active)
        .bind(webhook.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn webhook_by_id(&self, id: Uuid) -> StoreResult<Option<WebhookRecord>> {
        Ok(
            sqlx::query_as::<Postgres, WebhookRecord>("SELECT * FROM webhooks WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn webhooks_for_user(&self, owner: Uuid) -> StoreResult<Vec<WebhookRecord>> {
        Ok(sqlx::query_as::<Postgres, WebhookRecord>(
            "SELECT * FROM webhooks WHERE owner_user = $1 ORDER BY created_at ASC",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn active_webhooks(&self) -> StoreResult<Vec<WebhookRecord>> {
        Ok(sqlx::query_as::<Postgres, WebhookRecord>(
            "SELECT * FROM webhooks WHERE active = TRUE",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn delete_webhook(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM webhooks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

async fn insert_audit(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    record: &AuditRecord,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO audit_logs (id, action, actor_user, detail, request_id, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(record.id)
    .bind(record.action.tag())
    .bind(record.actor_user)
    .bind(record.detail.to_string())
    .bind(record.request_id)
    .bind(record.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
