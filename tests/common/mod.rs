//! Shared harness for the end-to-end tests: a gateway on an ephemeral port
//! backed by in-memory stores, plus a scriptable mock upstream.
//!
//! The mock selects its behavior from the path prefix, so one server can
//! play several providers: keys deposited with base URL `<mock>/ok` get
//! healthy completions, `<mock>/fail` always answers 500, and
//! `<mock>/missing` answers 404.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Json;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use feen::config::Config;
use feen::crypto::{self, lookup_hash};
use feen::server::{build_router, mint_session_token, AppState};
use feen::store::memory::{MemoryFastStore, MemoryVaultStore};
use feen::store::{
    ApiKeyRecord, AuditAction, AuditRecord, FastStore, SharedTokenRecord, User, VaultStore,
};
use feen::Provider;

/// One observed upstream hit: `(path, authorization-header)`.
pub type MockHit = (String, Option<String>);

pub struct TestGateway {
    pub state: Arc<AppState>,
    pub vault: Arc<dyn VaultStore>,
    pub fast: Arc<dyn FastStore>,
    pub base: String,
    pub mock_base: String,
    pub hits: Arc<Mutex<Vec<MockHit>>>,
    pub client: reqwest::Client,
    pub user: User,
}

impl TestGateway {
    /// Spawn the mock upstream, the gateway, and the usage flush worker.
    pub async fn spawn() -> Self {
        let (mock_base, hits) = spawn_mock_upstream().await;

        let mut config = Config::default();
        config.vault.master_key = "0123456789abcdef0123456789abcdef".to_string();
        config.vault.session_secret = "test-session-secret".to_string();

        let vault: Arc<dyn VaultStore> = Arc::new(MemoryVaultStore::new());
        let fast: Arc<dyn FastStore> = Arc::new(MemoryFastStore::new());
        let state =
            AppState::with_stores(config, Arc::clone(&vault), Arc::clone(&fast)).unwrap();

        // Only the usage workers; the periodic loops would race the tests.
        state.recorder.spawn_workers(1, Arc::clone(&vault), Arc::clone(&fast));

        let user = User::new("owner@example.com", crypto::hash_password("pass-word-123"));
        vault.create_user(user.clone()).await.unwrap();

        let router = build_router(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        Self {
            state,
            vault,
            fast,
            base: format!("http://{addr}"),
            mock_base,
            hits,
            client: reqwest::Client::new(),
            user,
        }
    }

    /// Deposit a CUSTOM-provider key whose endpoint is the mock upstream
    /// under the given behavior prefix (`ok`, `fail`, `missing`).
    pub async fn deposit_key(&self, mode: &str, material: &str) -> ApiKeyRecord {
        let key = ApiKeyRecord {
            id: Uuid::new_v4(),
            owner_user: self.user.id,
            team: None,
            provider: Provider::Custom,
            encrypted_material: self.state.cipher.encrypt(material.as_bytes()).unwrap(),
            material_hash: lookup_hash(material),
            display_prefix: feen::crypto::display_prefix(material),
            base_url: Some(format!("{}/{mode}", self.mock_base)),
            rate_per_minute: 600,
            daily_cap: 0,
            active: true,
            last_used_at: None,
            created_at: Utc::now(),
        };
        self.vault.create_api_key(key.clone()).await.unwrap();
        key
    }

    /// Mint a shared token for a key, letting the caller tweak the policy
    /// fields before it is stored. Returns the record and the plaintext.
    pub async fn mint_token(
        &self,
        key: &ApiKeyRecord,
        tweak: impl FnOnce(&mut SharedTokenRecord),
    ) -> (SharedTokenRecord, String) {
        let access_token = crypto::mint_access_token();
        let mut token = SharedTokenRecord {
            id: Uuid::new_v4(),
            api_key_ref: key.id,
            owner_user: self.user.id,
            access_token: None,
            token_hash: lookup_hash(&access_token),
            name: None,
            rate_per_minute: 600,
            daily_cap: 0,
            usage_count: 0,
            max_total_use: None,
            expires_at: None,
            allowed_ips: Vec::new(),
            allowed_models: Vec::new(),
            scopes: vec!["*".to_string()],
            require_signature: false,
            signing_secret: None,
            active: true,
            last_used_at: None,
            created_at: Utc::now(),
        };
        tweak(&mut token);

        self.vault
            .create_token_with_audit(
                token.clone(),
                AuditRecord::new(
                    AuditAction::SharedKeyCreated,
                    Some(self.user.id),
                    json!({ "tokenId": token.id }),
                ),
            )
            .await
            .unwrap();
        (token, access_token)
    }

    /// Admin session bearer for the seeded user.
    pub fn session(&self) -> String {
        mint_session_token(
            &self.state.config.vault.session_secret,
            self.user.id,
            3600,
        )
    }

    pub fn proxy_url(&self, suffix: &str) -> String {
        format!("{}/api/proxy/{suffix}", self.base)
    }

    /// Upstream hits observed so far.
    pub fn upstream_hits(&self) -> Vec<MockHit> {
        self.hits.lock().unwrap().clone()
    }

    /// Wait until at least `count` usage records exist for the seeded user.
    /// The recorder commits after the response body has been streamed, so
    /// tests poll for the observable result instead of sleeping.
    pub async fn wait_usage(&self, count: usize) -> Vec<feen::store::UsageRecord> {
        for _ in 0..200 {
            let records = self.vault.usage_for_user(self.user.id, 100).await.unwrap();
            if records.len() >= count {
                return records;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("usage records did not reach {count}");
    }

    /// Wait until a token's usage counter reaches `count`.
    pub async fn wait_token_use(&self, token_id: Uuid, count: u64) -> SharedTokenRecord {
        for _ in 0..200 {
            let token = self.vault.token_by_id(token_id).await.unwrap().unwrap();
            if token.usage_count >= count {
                return token;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("token usage_count did not reach {count}");
    }
}

async fn spawn_mock_upstream() -> (String, Arc<Mutex<Vec<MockHit>>>) {
    let hits: Arc<Mutex<Vec<MockHit>>> = Arc::new(Mutex::new(Vec::new()));

    let app = axum::Router::new()
        .fallback(any(mock_handler))
        .with_state(Arc::clone(&hits));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), hits)
}

async fn mock_handler(
    State(hits): State<Arc<Mutex<Vec<MockHit>>>>,
    request: Request<Body>,
) -> Response {
    let path = request.uri().path().to_string();
    let auth = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    hits.lock().unwrap().push((path.clone(), auth));

    if path.starts_with("/fail/") {
        return (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded").into_response();
    }
    if path.starts_with("/missing/") {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": { "message": "model not found" } })),
        )
            .into_response();
    }

    Json(json!({
        "id": "cmpl-mock-1",
        "object": "chat.completion",
        "choices": [{ "index": 0, "message": { "role": "assistant", "content": "hi" } }],
        "usage": { "prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30 },
    }))
    .into_response()
}
