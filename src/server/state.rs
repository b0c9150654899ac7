//! Process context: every component, constructed once in `main` and shared
//! through axum state. Nothing in the gateway reaches for globals.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use uuid::Uuid;

use crate::config::Config;
use crate::crypto::VaultCipher;
use crate::error::{GatewayError, Result};
use crate::guard::{RotationController, SuspicionGuard};
use crate::policy::PolicyEvaluator;
use crate::proxy::UpstreamTransport;
use crate::ratelimit::RateLimiter;
use crate::recorder::UsageRecorder;
use crate::router::ModelRouter;
use crate::store::memory::{MemoryFastStore, MemoryVaultStore};
use crate::store::postgres::PgVaultStore;
use crate::store::redis::RedisFastStore;
use crate::store::{AuditAction, AuditRecord, FastStore, VaultStore};
use crate::tasks::BackgroundTasks;

/// Application state shared across handlers.
pub struct AppState {
    pub config: Config,
    pub vault: Arc<dyn VaultStore>,
    pub fast: Arc<dyn FastStore>,
    pub cipher: VaultCipher,
    pub policy: PolicyEvaluator,
    pub limiter: RateLimiter,
    pub router: ModelRouter,
    pub transport: UpstreamTransport,
    pub recorder: Arc<UsageRecorder>,
    pub guard: Arc<dyn RotationController>,
    pub started_at: Instant,
}

impl AppState {
    /// Build the full component graph on explicit store backends.
    pub fn with_stores(
        config: Config,
        vault: Arc<dyn VaultStore>,
        fast: Arc<dyn FastStore>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let cipher = VaultCipher::new(config.vault.master_key.as_bytes());

        let guard: Arc<dyn RotationController> = Arc::new(SuspicionGuard::new(
            Arc::clone(&vault),
            Arc::clone(&fast),
            config.vault.store_plaintext_tokens,
        ));
        let policy = PolicyEvaluator::new(
            Arc::clone(&vault),
            Arc::clone(&fast),
            Arc::clone(&guard),
        );
        let limiter = RateLimiter::new(Arc::clone(&fast));
        let router = ModelRouter::new(Arc::clone(&fast));
        let transport =
            UpstreamTransport::new(Arc::clone(&vault), Arc::clone(&fast), cipher.clone())?;
        let recorder = UsageRecorder::new(config.limits.usage_queue_capacity);

        Ok(Arc::new(Self {
            config,
            vault,
            fast,
            cipher,
            policy,
            limiter,
            router,
            transport,
            recorder,
            guard,
            started_at: Instant::now(),
        }))
    }

    /// Build from configuration, selecting store backends by URL scheme.
    pub async fn from_config(config: Config) -> Result<Arc<Self>> {
        let vault: Arc<dyn VaultStore> = match config.store.persistent_url.as_str() {
            url if url.starts_with("memory") => Arc::new(MemoryVaultStore::new()),
            url if url.starts_with("postgres") => Arc::new(PgVaultStore::connect(url).await?),
            other => {
                return Err(GatewayError::Config(format!(
                    "unsupported persistent store URL: {other}"
                )))
            }
        };
        let fast: Arc<dyn FastStore> = match config.store.fast_url.as_str() {
            url if url.starts_with("memory") => Arc::new(MemoryFastStore::new()),
            url if url.starts_with("redis") => Arc::new(RedisFastStore::connect(url).await?),
            other => {
                return Err(GatewayError::Config(format!(
                    "unsupported fast store URL: {other}"
                )))
            }
        };
        Self::with_stores(config, vault, fast)
    }

    /// Spawn the usage flush workers and background loops.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = self.recorder.spawn_workers(
            self.config.limits.usage_workers,
            Arc::clone(&self.vault),
            Arc::clone(&self.fast),
        );
        let tasks = BackgroundTasks {
            vault: Arc::clone(&self.vault),
            fast: Arc::clone(&self.fast),
            cipher: self.cipher.clone(),
            client: reqwest::Client::new(),
            retention: self.config.retention.clone(),
        };
        handles.extend(tasks.spawn_all());
        handles
    }

    /// Write the `API_ERROR` audit entry that accompanies a gateway error
    /// response.
    pub async fn audit_api_error(&self, request_id: Uuid, path: &str, status: u16) {
        let record = AuditRecord::new(
            AuditAction::ApiError,
            None,
            json!({ "path": path, "status": status }),
        )
        .with_request_id(request_id);
        if let Err(err) = self.vault.append_audit(record).await {
            tracing::error!(error = %err, "failed to write API_ERROR audit entry");
        }
    }
}
