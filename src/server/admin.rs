//! Admin surface: key and token CRUD, webhooks, 2FA, usage listing,
//! health. Thin wrappers over the crypto and store layers; every mutation
//! writes an audit record. Input schemas are validated here, next to the
//! handlers that consume them.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::crypto::{
    self, display_prefix, generate_backup_codes, generate_totp_secret, lookup_hash, verify_totp,
};
use crate::error::{GatewayError, Result};
use crate::guard::RotationController;
use crate::providers::Provider;
use crate::store::{
    ApiKeyRecord, AuditAction, AuditRecord, SharedTokenRecord, User, WebhookRecord,
};

use super::auth::AuthedUser;
use super::state::AppState;

// === API keys ===

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateApiKeyRequest {
    pub provider: String,
    /// The upstream credential to deposit.
    pub material: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub team: Option<Uuid>,
    #[serde(default)]
    pub rate_per_minute: Option<u32>,
    #[serde(default)]
    pub daily_cap: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyResponse {
    pub id: Uuid,
    pub provider: String,
    pub display_prefix: String,
    pub base_url: Option<String>,
    pub rate_per_minute: u32,
    pub daily_cap: u32,
    pub active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&ApiKeyRecord> for ApiKeyResponse {
    fn from(key: &ApiKeyRecord) -> Self {
        Self {
            id: key.id,
            provider: key.provider.tag().to_string(),
            display_prefix: key.display_prefix.clone(),
            base_url: key.base_url.clone(),
            rate_per_minute: key.rate_per_minute,
            daily_cap: key.daily_cap,
            active: key.active,
            last_used_at: key.last_used_at,
            created_at: key.created_at,
        }
    }
}

pub async fn create_api_key(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Json(req): Json<CreateApiKeyRequest>,
) -> Result<impl IntoResponse> {
    let provider = Provider::from_str(&req.provider)
        .map_err(GatewayError::Validation)?;
    if req.material.trim().is_empty() {
        return Err(GatewayError::Validation("material must not be empty".into()));
    }
    if provider.base_url().is_none() && req.base_url.is_none() {
        return Err(GatewayError::Validation(format!(
            "provider {provider} requires a base_url"
        )));
    }
    if let Some(url) = &req.base_url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(GatewayError::Validation("base_url must be an HTTP(S) URL".into()));
        }
    }

    // Duplicate deposits of the same material are rejected, not re-stored.
    let material_hash = lookup_hash(&req.material);
    if state
        .vault
        .find_key_by_material_hash(user.id, &material_hash)
        .await?
        .is_some()
    {
        return Err(GatewayError::AlreadyExists(
            "This credential is already deposited".into(),
        ));
    }

    let key = ApiKeyRecord {
        id: Uuid::new_v4(),
        owner_user: user.id,
        team: req.team,
        provider,
        encrypted_material: state.cipher.encrypt(req.material.as_bytes())?,
        material_hash,
        display_prefix: display_prefix(&req.material),
        base_url: req.base_url,
        rate_per_minute: req
            .rate_per_minute
            .unwrap_or(state.config.limits.default_rate_per_minute),
        daily_cap: req.daily_cap.unwrap_or(state.config.limits.default_daily_cap),
        active: true,
        last_used_at: None,
        created_at: Utc::now(),
    };
    state.vault.create_api_key(key.clone()).await?;
    state
        .vault
        .append_audit(AuditRecord::new(
            AuditAction::ApiKeyCreated,
            Some(user.id),
            json!({ "keyId": key.id, "provider": provider.tag() }),
        ))
        .await?;

    Ok((StatusCode::CREATED, Json(ApiKeyResponse::from(&key))))
}

pub async fn list_api_keys(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
) -> Result<impl IntoResponse> {
    let keys = state.vault.api_keys_for_user(user.id).await?;
    let body: Vec<ApiKeyResponse> = keys.iter().map(ApiKeyResponse::from).collect();
    Ok(Json(body))
}

pub async fn get_api_key(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let key = owned_key(&state, &user, id).await?;
    Ok(Json(ApiKeyResponse::from(&key)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateApiKeyRequest {
    #[serde(default)]
    pub rate_per_minute: Option<u32>,
    #[serde(default)]
    pub daily_cap: Option<u32>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub base_url: Option<String>,
}

pub async fn update_api_key(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateApiKeyRequest>,
) -> Result<impl IntoResponse> {
    let mut key = owned_key(&state, &user, id).await?;
    if let Some(rate) = req.rate_per_minute {
        if rate == 0 {
            return Err(GatewayError::Validation("rate_per_minute must be positive".into()));
        }
        key.rate_per_minute = rate;
    }
    if let Some(cap) = req.daily_cap {
        key.daily_cap = cap;
    }
    if let Some(active) = req.active {
        key.active = active;
    }
    if let Some(url) = req.base_url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(GatewayError::Validation("base_url must be an HTTP(S) URL".into()));
        }
        key.base_url = Some(url);
    }

    state.vault.update_api_key(key.clone()).await?;
    state
        .vault
        .append_audit(AuditRecord::new(
            AuditAction::ApiKeyUpdated,
            Some(user.id),
            json!({ "keyId": key.id }),
        ))
        .await?;
    Ok(Json(ApiKeyResponse::from(&key)))
}

pub async fn delete_api_key(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let key = owned_key(&state, &user, id).await?;
    state.vault.delete_api_key(key.id).await?;
    state
        .vault
        .append_audit(AuditRecord::new(
            AuditAction::ApiKeyDeleted,
            Some(user.id),
            json!({ "keyId": key.id, "provider": key.provider.tag() }),
        ))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealRequest {
    #[serde(default)]
    pub totp_code: Option<String>,
}

/// Return the decrypted credential to its owner. Gated behind a fresh TOTP
/// (or backup) code once the owner has 2FA enabled.
pub async fn reveal_api_key(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<Uuid>,
    body: bytes::Bytes,
) -> Result<impl IntoResponse> {
    let key = owned_key(&state, &user, id).await?;
    let req: RevealRequest = if body.is_empty() {
        RevealRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|_| GatewayError::Validation("Malformed JSON body".into()))?
    };

    if user.totp_enabled {
        let code = req.totp_code.ok_or(GatewayError::TwoFactorRequired)?;
        verify_second_factor(&state, user.clone(), &code).await?;
    }

    let material = state.cipher.decrypt_string(&key.encrypted_material)?;
    state
        .vault
        .append_audit(AuditRecord::new(
            AuditAction::ApiKeyRevealed,
            Some(user.id),
            json!({ "keyId": key.id }),
        ))
        .await?;
    Ok(Json(json!({ "id": key.id, "material": material })))
}

async fn owned_key(state: &Arc<AppState>, user: &User, id: Uuid) -> Result<ApiKeyRecord> {
    state
        .vault
        .api_key_by_id(id)
        .await?
        .filter(|k| k.owner_user == user.id)
        .ok_or_else(|| GatewayError::NotFound("API key not found".into()))
}

// === Shared tokens ===

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTokenRequest {
    pub api_key_id: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub rate_per_minute: Option<u32>,
    #[serde(default)]
    pub daily_cap: Option<u32>,
    #[serde(default)]
    pub max_total_use: Option<u64>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub require_signature: bool,
    #[serde(default)]
    pub signing_secret: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub id: Uuid,
    pub api_key_id: Uuid,
    pub name: Option<String>,
    pub rate_per_minute: u32,
    pub daily_cap: u32,
    pub usage_count: u64,
    pub max_total_use: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub allowed_ips: Vec<String>,
    pub allowed_models: Vec<String>,
    pub scopes: Vec<String>,
    pub require_signature: bool,
    pub active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Present only when the deployment stores plaintext tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl From<&SharedTokenRecord> for TokenResponse {
    fn from(token: &SharedTokenRecord) -> Self {
        Self {
            id: token.id,
            api_key_id: token.api_key_ref,
            name: token.name.clone(),
            rate_per_minute: token.rate_per_minute,
            daily_cap: token.daily_cap,
            usage_count: token.usage_count,
            max_total_use: token.max_total_use,
            expires_at: token.expires_at,
            allowed_ips: token.allowed_ips.clone(),
            allowed_models: token.allowed_models.clone(),
            scopes: token.scopes.clone(),
            require_signature: token.require_signature,
            active: token.active,
            last_used_at: token.last_used_at,
            created_at: token.created_at,
            access_token: token.access_token.clone(),
        }
    }
}

pub async fn create_token(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Json(req): Json<CreateTokenRequest>,
) -> Result<impl IntoResponse> {
    let key = owned_key(&state, &user, req.api_key_id).await?;
    validate_ip_entries(&req.allowed_ips)?;
    if let Some(rate) = req.rate_per_minute {
        if rate == 0 {
            return Err(GatewayError::Validation("rate_per_minute must be positive".into()));
        }
    }
    if let Some(expires_at) = req.expires_at {
        if expires_at <= Utc::now() {
            return Err(GatewayError::Validation("expires_at must be in the future".into()));
        }
    }
    if req.require_signature && req.signing_secret.as_deref().map_or(true, str::is_empty) {
        return Err(GatewayError::Validation(
            "require_signature needs a signing_secret".into(),
        ));
    }

    let access_token = crypto::mint_access_token();
    let token = SharedTokenRecord {
        id: Uuid::new_v4(),
        api_key_ref: key.id,
        owner_user: user.id,
        access_token: state
            .config
            .vault
            .store_plaintext_tokens
            .then(|| access_token.clone()),
        token_hash: lookup_hash(&access_token),
        name: req.name,
        rate_per_minute: req
            .rate_per_minute
            .unwrap_or(state.config.limits.default_rate_per_minute),
        daily_cap: req.daily_cap.unwrap_or(state.config.limits.default_daily_cap),
        usage_count: 0,
        max_total_use: req.max_total_use,
        expires_at: req.expires_at,
        allowed_ips: req.allowed_ips,
        allowed_models: req.allowed_models,
        scopes: if req.scopes.is_empty() {
            vec!["*".to_string()]
        } else {
            req.scopes
        },
        require_signature: req.require_signature,
        signing_secret: req.signing_secret,
        active: true,
        last_used_at: None,
        created_at: Utc::now(),
    };

    // Token row and audit entry land atomically.
    let audit = AuditRecord::new(
        AuditAction::SharedKeyCreated,
        Some(user.id),
        json!({ "tokenId": token.id, "apiKeyId": key.id }),
    );
    state
        .vault
        .create_token_with_audit(token.clone(), audit)
        .await?;

    let mut body = serde_json::to_value(TokenResponse::from(&token))?;
    // The mint is returned exactly once, whatever the at-rest policy.
    body["accessToken"] = json!(access_token);
    Ok((StatusCode::CREATED, Json(body)))
}

pub async fn list_tokens(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
) -> Result<impl IntoResponse> {
    let tokens = state.vault.tokens_for_user(user.id).await?;
    let body: Vec<TokenResponse> = tokens.iter().map(TokenResponse::from).collect();
    Ok(Json(body))
}

pub async fn get_token(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let token = owned_token(&state, &user, id).await?;
    Ok(Json(TokenResponse::from(&token)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTokenRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub rate_per_minute: Option<u32>,
    #[serde(default)]
    pub daily_cap: Option<u32>,
    #[serde(default)]
    pub max_total_use: Option<u64>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub allowed_ips: Option<Vec<String>>,
    #[serde(default)]
    pub allowed_models: Option<Vec<String>>,
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    #[serde(default)]
    pub require_signature: Option<bool>,
    #[serde(default)]
    pub signing_secret: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
}

pub async fn update_token(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateTokenRequest>,
) -> Result<impl IntoResponse> {
    let mut token = owned_token(&state, &user, id).await?;

    if let Some(name) = req.name {
        token.name = Some(name);
    }
    if let Some(rate) = req.rate_per_minute {
        if rate == 0 {
            return Err(GatewayError::Validation("rate_per_minute must be positive".into()));
        }
        token.rate_per_minute = rate;
    }
    if let Some(cap) = req.daily_cap {
        token.daily_cap = cap;
    }
    if let Some(max) = req.max_total_use {
        token.max_total_use = Some(max);
    }
    if let Some(expires_at) = req.expires_at {
        token.expires_at = Some(expires_at);
    }
    if let Some(ips) = req.allowed_ips {
        validate_ip_entries(&ips)?;
        token.allowed_ips = ips;
    }
    if let Some(models) = req.allowed_models {
        token.allowed_models = models;
    }
    if let Some(scopes) = req.scopes {
        if scopes.is_empty() {
            return Err(GatewayError::Validation("scopes must not be empty".into()));
        }
        token.scopes = scopes;
    }
    if let Some(require) = req.require_signature {
        token.require_signature = require;
    }
    if let Some(secret) = req.signing_secret {
        token.signing_secret = Some(secret);
    }
    if let Some(active) = req.active {
        token.active = active;
    }
    if token.require_signature && token.signing_secret.as_deref().map_or(true, str::is_empty) {
        return Err(GatewayError::Validation(
            "require_signature needs a signing_secret".into(),
        ));
    }

    state.vault.update_token(token.clone()).await?;
    state
        .vault
        .append_audit(AuditRecord::new(
            AuditAction::SharedKeyUpdated,
            Some(user.id),
            json!({ "tokenId": token.id }),
        ))
        .await?;
    Ok(Json(TokenResponse::from(&token)))
}

pub async fn delete_token(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let token = owned_token(&state, &user, id).await?;
    state.vault.delete_token(token.id).await?;
    state
        .vault
        .append_audit(AuditRecord::new(
            AuditAction::SharedKeyDeleted,
            Some(user.id),
            json!({ "tokenId": token.id }),
        ))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Owner-requested rotation: same routine the guardrails use.
pub async fn rotate_token(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let token = owned_token(&state, &user, id).await?;
    let access_token = state.guard.rotate(token.id, "manual_rotation").await?;
    Ok(Json(json!({ "id": token.id, "accessToken": access_token })))
}

async fn owned_token(
    state: &Arc<AppState>,
    user: &User,
    id: Uuid,
) -> Result<SharedTokenRecord> {
    state
        .vault
        .token_by_id(id)
        .await?
        .filter(|t| t.owner_user == user.id)
        .ok_or_else(|| GatewayError::NotFound("Shared token not found".into()))
}

fn validate_ip_entries(entries: &[String]) -> Result<()> {
    for entry in entries {
        let valid = entry == "unknown"
            || entry.parse::<IpNet>().is_ok()
            || entry.parse::<IpAddr>().is_ok();
        if !valid {
            return Err(GatewayError::Validation(format!(
                "invalid allowed_ips entry: {entry}"
            )));
        }
    }
    Ok(())
}

// === Webhooks ===

#[derive(Debug, Deserialize)]
pub struct CreateWebhookRequest {
    pub url: String,
    pub secret: String,
    #[serde(default)]
    pub events: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub id: Uuid,
    pub url: String,
    pub events: Vec<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&WebhookRecord> for WebhookResponse {
    fn from(hook: &WebhookRecord) -> Self {
        Self {
            id: hook.id,
            url: hook.url.clone(),
            events: hook.events.clone(),
            active: hook.active,
            created_at: hook.created_at,
        }
    }
}

pub async fn create_webhook(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Json(req): Json<CreateWebhookRequest>,
) -> Result<impl IntoResponse> {
    if !req.url.starts_with("http://") && !req.url.starts_with("https://") {
        return Err(GatewayError::Validation("url must be an HTTP(S) URL".into()));
    }
    if req.secret.len() < 16 {
        return Err(GatewayError::Validation(
            "secret must be at least 16 characters".into(),
        ));
    }

    let hook = WebhookRecord {
        id: Uuid::new_v4(),
        owner_user: user.id,
        url: req.url,
        secret: req.secret,
        events: if req.events.is_empty() {
            vec!["*".to_string()]
        } else {
            req.events
        },
        active: true,
        created_at: Utc::now(),
    };
    state.vault.create_webhook(hook.clone()).await?;
    state
        .vault
        .append_audit(AuditRecord::new(
            AuditAction::WebhookRegistered,
            Some(user.id),
            json!({ "webhookId": hook.id, "url": hook.url }),
        ))
        .await?;
    Ok((StatusCode::CREATED, Json(WebhookResponse::from(&hook))))
}

pub async fn list_webhooks(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
) -> Result<impl IntoResponse> {
    let hooks = state.vault.webhooks_for_user(user.id).await?;
    let body: Vec<WebhookResponse> = hooks.iter().map(WebhookResponse::from).collect();
    Ok(Json(body))
}

pub async fn delete_webhook(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let hook = state
        .vault
        .webhook_by_id(id)
        .await?
        .filter(|h| h.owner_user == user.id)
        .ok_or_else(|| GatewayError::NotFound("Webhook not found".into()))?;
    state.vault.delete_webhook(hook.id).await?;
    state
        .vault
        .append_audit(AuditRecord::new(
            AuditAction::WebhookDeleted,
            Some(user.id),
            json!({ "webhookId": hook.id }),
        ))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// === Two-factor authentication ===

pub async fn setup_2fa(
    State(state): State<Arc<AppState>>,
    AuthedUser(mut user): AuthedUser,
) -> Result<impl IntoResponse> {
    if user.totp_enabled {
        return Err(GatewayError::AlreadyExists(
            "Two-factor authentication is already enabled".into(),
        ));
    }

    let secret = generate_totp_secret();
    let (backup_codes, backup_hashes) = generate_backup_codes();
    let otpauth_url = format!(
        "otpauth://totp/Feen:{}?secret={}&issuer=Feen",
        user.email, secret
    );

    user.totp_secret = Some(secret.clone());
    user.backup_code_hashes = backup_hashes;
    state.vault.update_user(user).await?;

    // Plaintext backup codes leave the process exactly once, here.
    Ok(Json(json!({
        "secret": secret,
        "otpauthUrl": otpauth_url,
        "backupCodes": backup_codes,
    })))
}

#[derive(Debug, Deserialize)]
pub struct TwoFactorCodeRequest {
    pub code: String,
}

pub async fn verify_2fa(
    State(state): State<Arc<AppState>>,
    AuthedUser(mut user): AuthedUser,
    Json(req): Json<TwoFactorCodeRequest>,
) -> Result<impl IntoResponse> {
    let secret = user
        .totp_secret
        .clone()
        .ok_or_else(|| GatewayError::Validation("Run 2FA setup first".into()))?;
    if !verify_totp(&secret, &req.code, Utc::now().timestamp() as u64) {
        return Err(GatewayError::Unauthorized("Invalid verification code".into()));
    }

    user.totp_enabled = true;
    let user_id = user.id;
    state.vault.update_user(user).await?;
    state
        .vault
        .append_audit(AuditRecord::new(
            AuditAction::TwoFactorEnabled,
            Some(user_id),
            json!({}),
        ))
        .await?;
    Ok(Json(json!({ "enabled": true })))
}

pub async fn disable_2fa(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Json(req): Json<TwoFactorCodeRequest>,
) -> Result<impl IntoResponse> {
    if !user.totp_enabled {
        return Err(GatewayError::Validation(
            "Two-factor authentication is not enabled".into(),
        ));
    }
    let mut user = verify_second_factor(&state, user, &req.code).await?;

    user.totp_enabled = false;
    user.totp_secret = None;
    user.backup_code_hashes.clear();
    let user_id = user.id;
    state.vault.update_user(user).await?;
    state
        .vault
        .append_audit(AuditRecord::new(
            AuditAction::TwoFactorDisabled,
            Some(user_id),
            json!({}),
        ))
        .await?;
    Ok(Json(json!({ "enabled": false })))
}

/// Accept a fresh TOTP code or burn a backup code. Returns the (possibly
/// mutated) user so callers can persist the burned code.
async fn verify_second_factor(
    state: &Arc<AppState>,
    mut user: User,
    code: &str,
) -> Result<User> {
    if let Some(secret) = &user.totp_secret {
        if verify_totp(secret, code, Utc::now().timestamp() as u64) {
            return Ok(user);
        }
    }

    let code_hash = lookup_hash(code);
    if let Some(position) = user
        .backup_code_hashes
        .iter()
        .position(|h| crypto::constant_time_eq(h.as_bytes(), code_hash.as_bytes()))
    {
        user.backup_code_hashes.remove(position);
        state.vault.update_user(user.clone()).await?;
        return Ok(user);
    }

    Err(GatewayError::Unauthorized("Invalid verification code".into()))
}

// === Usage ===

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    #[serde(default = "default_usage_limit")]
    pub limit: u32,
}

fn default_usage_limit() -> u32 {
    50
}

pub async fn list_usage(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Query(query): Query<UsageQuery>,
) -> Result<impl IntoResponse> {
    let records = state
        .vault
        .usage_for_user(user.id, query.limit.min(500))
        .await?;
    Ok(Json(records))
}

// === Health ===

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let persistent_ok = state.vault.ping().await.is_ok();
    let fast_ok = state.fast.ping().await.is_ok();
    let status = if persistent_ok && fast_ok {
        "healthy"
    } else {
        "degraded"
    };

    Json(json!({
        "status": status,
        "version": crate::VERSION,
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "stores": {
            "persistent": persistent_ok,
            "fast": fast_ok,
        },
    }))
}
