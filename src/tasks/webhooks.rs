//! Webhook delivery worker.
//!
//! Pops pending payloads off the fast-store queue and posts them to every
//! registered webhook subscribed to the payload's event. Deliveries are
//! signed with `HMAC-SHA256(secret, "<ts>.<body>")`; the outcome is
//! audit-logged and there is no automatic retry.

use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

use crate::crypto::hash::hex_encode;
use crate::store::{AuditAction, AuditRecord, WebhookRecord, WEBHOOK_QUEUE_KEY};

use super::BackgroundTasks;

/// Delivery timeout per endpoint.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Compute the delivery signature over `"<ts>.<body>"`.
pub fn sign_webhook_payload(secret: &str, timestamp: i64, body: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    hex_encode(&mac.finalize().into_bytes())
}

pub(super) async fn run(tasks: BackgroundTasks, poll: Duration) {
    loop {
        match tasks.fast.rpop(WEBHOOK_QUEUE_KEY).await {
            Ok(Some(payload)) => deliver(&tasks, &payload).await,
            Ok(None) => tokio::time::sleep(poll).await,
            Err(err) => {
                tracing::debug!(error = %err, "webhook queue unavailable");
                tokio::time::sleep(poll).await;
            }
        }
    }
}

async fn deliver(tasks: &BackgroundTasks, payload: &str) {
    let parsed: Value = match serde_json::from_str(payload) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!(error = %err, "discarding malformed webhook payload");
            return;
        }
    };
    let Some(event) = parsed.get("event").and_then(Value::as_str) else {
        tracing::warn!("discarding webhook payload without an event");
        return;
    };

    let webhooks = match tasks.vault.active_webhooks().await {
        Ok(webhooks) => webhooks,
        Err(err) => {
            tracing::warn!(error = %err, "webhook delivery: store unavailable");
            return;
        }
    };

    for webhook in webhooks.iter().filter(|w| w.subscribes_to(event)) {
        deliver_one(tasks, webhook, event, payload).await;
    }
}

async fn deliver_one(tasks: &BackgroundTasks, webhook: &WebhookRecord, event: &str, body: &str) {
    let timestamp = Utc::now().timestamp();
    let signature = sign_webhook_payload(&webhook.secret, timestamp, body);

    let result = tasks
        .client
        .post(&webhook.url)
        .timeout(DELIVERY_TIMEOUT)
        .header("content-type", "application/json")
        .header("x-feen-webhook-signature", signature)
        .header("x-feen-webhook-timestamp", timestamp.to_string())
        .header("x-feen-webhook-event", event)
        .body(body.to_string())
        .send()
        .await;

    let (action, detail) = match result {
        Ok(response) if response.status().is_success() => (
            AuditAction::WebhookDelivered,
            json!({ "webhookId": webhook.id, "event": event, "status": response.status().as_u16() }),
        ),
        Ok(response) => (
            AuditAction::WebhookFailed,
            json!({ "webhookId": webhook.id, "event": event, "status": response.status().as_u16() }),
        ),
        Err(err) => (
            AuditAction::WebhookFailed,
            json!({ "webhookId": webhook.id, "event": event, "error": err.to_string() }),
        ),
    };

    if action == AuditAction::WebhookFailed {
        tracing::warn!(webhook_id = %webhook.id, event, "webhook delivery failed");
    }
    let _ = tasks
        .vault
        .append_audit(AuditRecord::new(action, Some(webhook.owner_user), detail))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_deterministic() {
        let a = sign_webhook_payload("secret", 1_700_000_000, r#"{"event":"token.rotated"}"#);
        let b = sign_webhook_payload("secret", 1_700_000_000, r#"{"event":"token.rotated"}"#);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_signature_binds_timestamp_and_body() {
        let base = sign_webhook_payload("secret", 1_700_000_000, "{}");
        assert_ne!(base, sign_webhook_payload("secret", 1_700_000_001, "{}"));
        assert_ne!(base, sign_webhook_payload("secret", 1_700_000_000, "{ }"));
        assert_ne!(base, sign_webhook_payload("other", 1_700_000_000, "{}"));
    }
}
