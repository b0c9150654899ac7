//! Background integrity loops.
//!
//! Four independent loops run for the life of the process: the latency
//! probe, the token expiry sweep, log retention pruning, and webhook
//! delivery. Each is its own task; none can fail the data plane.

mod expiry;
mod latency;
mod retention;
mod webhooks;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::RetentionConfig;
use crate::crypto::VaultCipher;
use crate::store::{FastStore, VaultStore};

pub use webhooks::sign_webhook_payload;

/// Probe cadence (also the latency cache TTL).
const LATENCY_PROBE_INTERVAL: Duration = Duration::from_secs(60);

/// Expiry sweep cadence.
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Retention pruning cadence.
const RETENTION_INTERVAL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Idle sleep between webhook queue polls.
const WEBHOOK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Shared dependencies of the background loops.
#[derive(Clone)]
pub struct BackgroundTasks {
    pub vault: Arc<dyn VaultStore>,
    pub fast: Arc<dyn FastStore>,
    pub cipher: VaultCipher,
    pub client: reqwest::Client,
    pub retention: RetentionConfig,
}

impl BackgroundTasks {
    /// Spawn every loop; the handles are aborted on shutdown.
    pub fn spawn_all(self) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(latency::run(self.clone(), LATENCY_PROBE_INTERVAL)),
            tokio::spawn(expiry::run(self.clone(), EXPIRY_SWEEP_INTERVAL)),
            tokio::spawn(retention::run(self.clone(), RETENTION_INTERVAL)),
            tokio::spawn(webhooks::run(self, WEBHOOK_POLL_INTERVAL)),
        ]
    }
}
