//! Asynchronous usage recording.
//!
//! Completed proxy attempts enqueue one usage record and one counter
//! increment; a small worker pool flushes them without ever blocking a
//! client response. The queue is bounded: on overflow the oldest records
//! are dropped and a `USAGE_BACKPRESSURE` alert is emitted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::proxy::usage::TokenUsage;
use crate::store::{AuditAction, AuditRecord, FastStore, UsageRecord, VaultStore, WEBHOOK_QUEUE_KEY};

/// Status recorded when the client went away before the attempt finished.
pub const STATUS_CLIENT_CLOSED: u16 = 499;

/// Bounded in-process usage queue.
pub struct UsageRecorder {
    queue: Mutex<VecDeque<UsageRecord>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl UsageRecorder {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        })
    }

    /// Enqueue a finished record. Synchronous and non-blocking so it is
    /// callable from drop guards; overflow evicts the oldest entry.
    pub fn enqueue(&self, record: UsageRecord) {
        let mut queue = self.queue.lock().expect("usage queue poisoned");
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(record);
        drop(queue);
        self.notify.notify_one();
    }

    /// Records waiting to be flushed (test and ops visibility).
    pub fn pending(&self) -> usize {
        self.queue.lock().expect("usage queue poisoned").len()
    }

    /// Spawn the flush workers against the given stores.
    pub fn spawn_workers(
        self: &Arc<Self>,
        workers: usize,
        vault: Arc<dyn VaultStore>,
        fast: Arc<dyn FastStore>,
    ) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|_| {
                let recorder = Arc::clone(self);
                let vault = Arc::clone(&vault);
                let fast = Arc::clone(&fast);
                tokio::spawn(async move {
                    loop {
                        let record = {
                            let mut queue = recorder.queue.lock().expect("usage queue poisoned");
                            queue.pop_front()
                        };
                        match record {
                            Some(record) => recorder.flush_one(&vault, &fast, record).await,
                            None => recorder.notify.notified().await,
                        }
                    }
                })
            })
            .collect()
    }

    /// Flush a single record with an at-most-once retry. Permanent failure
    /// is an operator problem, never a client one.
    async fn flush_one(
        &self,
        vault: &Arc<dyn VaultStore>,
        fast: &Arc<dyn FastStore>,
        record: UsageRecord,
    ) {
        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            tracing::error!(dropped, "usage queue overflow; oldest records were dropped");
            let _ = vault
                .append_audit(AuditRecord::new(
                    AuditAction::UsageBackpressure,
                    None,
                    json!({ "dropped": dropped }),
                ))
                .await;
        }

        if let Err(first) = self.write(vault, fast, &record).await {
            tracing::warn!(error = %first, "usage flush failed; retrying once");
            if let Err(second) = self.write(vault, fast, &record).await {
                tracing::error!(error = %second, token_id = %record.shared_token_ref, "usage record lost");
            }
        }
    }

    async fn write(
        &self,
        vault: &Arc<dyn VaultStore>,
        fast: &Arc<dyn FastStore>,
        record: &UsageRecord,
    ) -> crate::store::StoreResult<()> {
        vault.append_usage(record.clone()).await?;
        vault
            .record_token_use(record.shared_token_ref, record.api_key_ref, record.created_at)
            .await?;

        // Lazy daily-cap enforcement: the post-increment total for the day
        // deactivates the token so the next policy check sees it inactive.
        if let Some(token) = vault.token_by_id(record.shared_token_ref).await? {
            if token.active && token.daily_cap > 0 {
                let today = record.created_at.date_naive();
                let total = vault
                    .usage_count_for_token_on(token.id, today)
                    .await?;
                if total > token.daily_cap as u64 {
                    vault.deactivate_token(token.id).await?;
                    let payload = json!({
                        "event": "token.daily_cap_exceeded",
                        "data": {
                            "tokenId": token.id,
                            "ownerUser": token.owner_user,
                            "dailyCap": token.daily_cap,
                            "total": total,
                        },
                        "timestamp": Utc::now().to_rfc3339(),
                    });
                    fast.lpush(WEBHOOK_QUEUE_KEY, &payload.to_string()).await?;
                    tracing::warn!(token_id = %token.id, total, cap = token.daily_cap, "daily cap exceeded; token deactivated");
                }
            }
        }
        Ok(())
    }
}

/// Guarantees exactly one usage record per proxy attempt.
///
/// The data plane arms a guard once policy admits the request; whoever
/// finishes the attempt commits the real outcome. If the request future is
/// dropped first (client disconnect), the guard itself records the attempt
/// as `499` with the latency measured so far.
pub struct UsageGuard {
    recorder: Arc<UsageRecorder>,
    template: Option<UsageRecord>,
    started: Instant,
}

impl UsageGuard {
    pub fn new(recorder: Arc<UsageRecorder>, template: UsageRecord) -> Self {
        Self {
            recorder,
            template: Some(template),
            started: Instant::now(),
        }
    }

    /// Milliseconds since the guard was armed.
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Point the pending record at the candidate currently being attempted.
    pub fn set_provider(&mut self, provider: crate::providers::Provider) {
        if let Some(record) = self.template.as_mut() {
            record.provider = provider;
        }
    }

    /// Commit the final outcome for this attempt.
    pub fn commit(mut self, status_code: u16, latency_ms: u64, usage: Option<TokenUsage>) {
        if let Some(mut record) = self.template.take() {
            record.status_code = status_code;
            record.latency_ms = latency_ms;
            if let Some(usage) = usage {
                record.request_tokens = usage.request_tokens;
                record.response_tokens = usage.response_tokens;
                record.total_tokens = usage.total_tokens;
            }
            record.created_at = Utc::now();
            self.recorder.enqueue(record);
        }
    }
}

impl Drop for UsageGuard {
    fn drop(&mut self) {
        if let Some(mut record) = self.template.take() {
            record.status_code = STATUS_CLIENT_CLOSED;
            record.latency_ms = self.started.elapsed().as_millis() as u64;
            record.created_at = Utc::now();
            self.recorder.enqueue(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Provider;
    use crate::store::memory::{MemoryFastStore, MemoryVaultStore};
    use uuid::Uuid;

    fn template() -> UsageRecord {
        UsageRecord {
            id: Uuid::new_v4(),
            api_key_ref: Uuid::new_v4(),
            shared_token_ref: Uuid::new_v4(),
            user_ref: Uuid::new_v4(),
            provider: Provider::Openai,
            model: Some("gpt-4o".into()),
            endpoint: "v1/chat/completions".into(),
            method: "POST".into(),
            status_code: 0,
            request_tokens: None,
            response_tokens: None,
            total_tokens: None,
            latency_ms: 0,
            client_ip: "1.2.3.4".into(),
            user_agent: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_commit_enqueues_once() {
        let recorder = UsageRecorder::new(16);
        let guard = UsageGuard::new(Arc::clone(&recorder), template());
        guard.commit(
            200,
            12,
            Some(TokenUsage {
                request_tokens: Some(10),
                response_tokens: Some(20),
                total_tokens: Some(30),
            }),
        );
        assert_eq!(recorder.pending(), 1);
    }

    #[tokio::test]
    async fn test_drop_records_client_closed() {
        let recorder = UsageRecorder::new(16);
        drop(UsageGuard::new(Arc::clone(&recorder), template()));
        assert_eq!(recorder.pending(), 1);

        let record = recorder
            .queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap();
        assert_eq!(record.status_code, STATUS_CLIENT_CLOSED);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let recorder = UsageRecorder::new(2);
        let mut a = template();
        a.endpoint = "first".into();
        let b = template();
        let c = template();
        recorder.enqueue(a);
        recorder.enqueue(b);
        recorder.enqueue(c);
        assert_eq!(recorder.pending(), 2);
        assert_eq!(recorder.dropped.load(Ordering::Relaxed), 1);
        let oldest = recorder.queue.lock().unwrap().pop_front().unwrap();
        assert_ne!(oldest.endpoint, "first");
    }

    #[tokio::test]
    async fn test_worker_flush_and_daily_cap() {
        let vault_dyn: Arc<dyn VaultStore> = Arc::new(MemoryVaultStore::new());
        let fast: Arc<dyn FastStore> = Arc::new(MemoryFastStore::new());

        // Token with a one-request daily cap.
        let mut record = template();
        let token = crate::store::SharedTokenRecord {
            id: record.shared_token_ref,
            api_key_ref: record.api_key_ref,
            owner_user: record.user_ref,
            access_token: None,
            token_hash: "h".into(),
            name: None,
            rate_per_minute: 60,
            daily_cap: 1,
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
        vault_dyn
            .create_token_with_audit(
                token,
                AuditRecord::new(AuditAction::SharedKeyCreated, None, serde_json::Value::Null),
            )
            .await
            .unwrap();

        let recorder = UsageRecorder::new(16);
        let handles = recorder.spawn_workers(1, vault_dyn.clone(), Arc::clone(&fast));

        record.status_code = 200;
        recorder.enqueue(record.clone());
        let mut second = record.clone();
        second.id = Uuid::new_v4();
        recorder.enqueue(second);

        // Let the worker drain the queue.
        for _ in 0..50 {
            if recorder.pending() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let stored = vault_dyn
            .token_by_id(record.shared_token_ref)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.usage_count, 2);
        // Second request breached the cap of 1.
        assert!(!stored.active);
        // A webhook notification was queued.
        assert_eq!(fast.llen(WEBHOOK_QUEUE_KEY).await.unwrap(), 1);

        for handle in handles {
            handle.abort();
        }
    }
}
