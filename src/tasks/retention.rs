//! Weekly retention pruning for the append-only logs.

use std::time::Duration;

use chrono::Utc;

use super::BackgroundTasks;

pub(super) async fn run(tasks: BackgroundTasks, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        prune(&tasks).await;
    }
}

async fn prune(tasks: &BackgroundTasks) {
    let now = Utc::now();

    let usage_cutoff = now - chrono::Duration::days(tasks.retention.usage_days as i64);
    match tasks.vault.prune_usage_before(usage_cutoff).await {
        Ok(count) if count > 0 => tracing::info!(count, "pruned usage records"),
        Ok(_) => {}
        Err(err) => tracing::warn!(error = %err, "usage pruning failed"),
    }

    let audit_cutoff = now - chrono::Duration::days(tasks.retention.audit_days as i64);
    match tasks.vault.prune_audit_before(audit_cutoff).await {
        Ok(count) if count > 0 => tracing::info!(count, "pruned audit records"),
        Ok(_) => {}
        Err(err) => tracing::warn!(error = %err, "audit pruning failed"),
    }
}
