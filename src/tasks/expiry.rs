//! Daily expiry sweep.
//!
//! Marks inactive every still-active token whose `expires_at` has passed,
//! auditing and enqueueing a webhook per mutation.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use crate::store::{AuditAction, AuditRecord, WEBHOOK_QUEUE_KEY};

use super::BackgroundTasks;

pub(super) async fn run(tasks: BackgroundTasks, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        sweep(&tasks).await;
    }
}

async fn sweep(tasks: &BackgroundTasks) {
    let expired = match tasks.vault.expire_tokens_before(Utc::now()).await {
        Ok(expired) => expired,
        Err(err) => {
            tracing::warn!(error = %err, "expiry sweep failed");
            return;
        }
    };
    if expired.is_empty() {
        return;
    }

    tracing::info!(count = expired.len(), "expiry sweep deactivated tokens");
    for token in expired {
        let _ = tasks
            .vault
            .append_audit(AuditRecord::new(
                AuditAction::SharedKeyUpdated,
                None,
                json!({ "tokenId": token.id, "change": "expired" }),
            ))
            .await;

        let payload = json!({
            "event": "token.expired",
            "data": {
                "tokenId": token.id,
                "ownerUser": token.owner_user,
                "expiresAt": token.expires_at.map(|at| at.to_rfc3339()),
            },
            "timestamp": Utc::now().to_rfc3339(),
        });
        let _ = tasks
            .fast
            .lpush(WEBHOOK_QUEUE_KEY, &payload.to_string())
            .await;
    }
}
