//! Latency probe loop.
//!
//! Every minute, for each provider with at least one active key, issue a
//! minimal one-token request with the most recently used key and cache the
//! observed latency. Failures are silent: a missing sample just ranks the
//! provider last.

use std::time::{Duration, Instant};

use crate::store::latency_key;

use super::BackgroundTasks;

/// Latency cache TTL in seconds.
const LATENCY_TTL_SECS: u64 = 60;

pub(super) async fn run(tasks: BackgroundTasks, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        probe_all(&tasks).await;
    }
}

async fn probe_all(tasks: &BackgroundTasks) {
    let providers = match tasks.vault.active_providers().await {
        Ok(providers) => providers,
        Err(err) => {
            tracing::debug!(error = %err, "latency probe: store unavailable");
            return;
        }
    };

    for provider in providers {
        let Ok(Some(key)) = tasks.vault.most_recent_key_for_provider(provider).await else {
            continue;
        };
        let Some(base_url) = provider
            .base_url()
            .map(str::to_string)
            .or_else(|| key.base_url.clone())
        else {
            continue;
        };
        let Ok(credential) = tasks.cipher.decrypt_string(&key.encrypted_material) else {
            tracing::debug!(key_id = %key.id, "latency probe: undecryptable key material");
            continue;
        };

        let url = format!(
            "{}{}",
            base_url.trim_end_matches('/'),
            provider.probe_path()
        );
        let mut request = tasks
            .client
            .post(&url)
            .timeout(Duration::from_secs(10))
            .json(&provider.probe_body(provider.probe_model()));
        for (name, value) in provider.auth_headers(&credential) {
            request = request.header(name, value);
        }

        let started = Instant::now();
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                let latency_ms = started.elapsed().as_millis() as u64;
                let _ = tasks
                    .fast
                    .set_ex(
                        &latency_key(provider),
                        &latency_ms.to_string(),
                        LATENCY_TTL_SECS,
                    )
                    .await;
                tracing::debug!(%provider, latency_ms, "latency probe sample stored");
            }
            Ok(response) => {
                tracing::debug!(%provider, status = %response.status(), "latency probe rejected");
            }
            Err(err) => {
                tracing::debug!(%provider, error = %err, "latency probe failed");
            }
        }
    }
}
