//! Model-aware candidate selection.
//!
//! Given the requested model and the caller's deposited keys, produce an
//! ordered list of `(key, provider, base_url)` candidates. Preferred
//! providers are ranked by the latency cache; everything else follows, with
//! the token's directly referenced key promoted to the front of the
//! non-preferred tail.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{GatewayError, Result};
use crate::providers::{preferred_providers, Provider};
use crate::store::{latency_key, ApiKeyRecord, FastStore};

/// One upstream attempt target.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub key: ApiKeyRecord,
    pub provider: Provider,
    pub base_url: String,
}

impl Candidate {
    fn from_key(key: ApiKeyRecord) -> Option<Self> {
        let provider = key.provider;
        let base_url = match provider.base_url() {
            Some(fixed) => fixed.to_string(),
            // Azure/custom keys carry their own endpoint; a key without one
            // is not routable.
            None => key.base_url.clone()?,
        };
        Some(Self {
            key,
            provider,
            base_url,
        })
    }
}

/// Latency-ranked candidate selection over the owner's key set.
pub struct ModelRouter {
    fast: Arc<dyn FastStore>,
}

impl ModelRouter {
    pub fn new(fast: Arc<dyn FastStore>) -> Self {
        Self { fast }
    }

    /// Build the ordered candidate list.
    ///
    /// `direct_key_id` is the key the shared token references; `owner_keys`
    /// must be in creation order (oldest first). An empty result is a
    /// configuration error.
    pub async fn candidates(
        &self,
        requested_model: Option<&str>,
        direct_key_id: uuid::Uuid,
        owner_keys: &[ApiKeyRecord],
    ) -> Result<Vec<Candidate>> {
        let active: Vec<&ApiKeyRecord> = owner_keys.iter().filter(|k| k.active).collect();

        let preferred: Vec<Provider> = requested_model
            .map(|model| {
                preferred_providers(model)
                    .iter()
                    .copied()
                    .filter(|p| active.iter().any(|k| k.provider == *p))
                    .collect()
            })
            .unwrap_or_default();

        let ordered = if preferred.is_empty() {
            self.direct_first(direct_key_id, &active)
        } else {
            self.latency_ranked(&preferred, direct_key_id, &active).await
        };

        let candidates: Vec<Candidate> = ordered
            .into_iter()
            .filter_map(|key| Candidate::from_key(key.clone()))
            .collect();

        if candidates.is_empty() {
            return Err(GatewayError::NoCandidates);
        }
        Ok(candidates)
    }

    /// Unknown model: the token's own key leads, the rest follow in
    /// creation order.
    fn direct_first<'a>(
        &self,
        direct_key_id: uuid::Uuid,
        active: &[&'a ApiKeyRecord],
    ) -> Vec<&'a ApiKeyRecord> {
        let mut ordered = Vec::with_capacity(active.len());
        if let Some(direct) = active.iter().find(|k| k.id == direct_key_id) {
            ordered.push(*direct);
        }
        for key in active {
            if key.id != direct_key_id {
                ordered.push(*key);
            }
        }
        ordered
    }

    /// Known model: preferred providers sorted by cached latency (missing
    /// samples sort last), then the direct key, then the remaining keys.
    async fn latency_ranked<'a>(
        &self,
        preferred: &[Provider],
        direct_key_id: uuid::Uuid,
        active: &[&'a ApiKeyRecord],
    ) -> Vec<&'a ApiKeyRecord> {
        let mut latencies: HashMap<Provider, u64> = HashMap::new();
        for provider in preferred {
            latencies.insert(*provider, self.cached_latency(*provider).await);
        }

        let mut preferred_keys: Vec<&ApiKeyRecord> = active
            .iter()
            .filter(|k| preferred.contains(&k.provider))
            .copied()
            .collect();
        // Ties break on creation order, which `active` already carries;
        // a stable sort preserves it.
        preferred_keys.sort_by_key(|k| latencies.get(&k.provider).copied().unwrap_or(u64::MAX));

        let mut ordered = preferred_keys;
        if let Some(direct) = active
            .iter()
            .find(|k| k.id == direct_key_id && !preferred.contains(&k.provider))
        {
            ordered.push(*direct);
        }
        for key in active {
            if !preferred.contains(&key.provider) && key.id != direct_key_id {
                ordered.push(*key);
            }
        }
        ordered
    }

    /// Cached latency sample in milliseconds; absent or unreadable entries
    /// count as slowest. A cache outage only costs ranking quality.
    async fn cached_latency(&self, provider: Provider) -> u64 {
        match self.fast.get(&latency_key(provider)).await {
            Ok(Some(raw)) => raw.parse().unwrap_or(u64::MAX),
            _ => u64::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryFastStore;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn key(provider: Provider, age_mins: i64) -> ApiKeyRecord {
        ApiKeyRecord {
            id: Uuid::new_v4(),
            owner_user: Uuid::new_v4(),
            team: None,
            provider,
            encrypted_material: "blob".into(),
            material_hash: Uuid::new_v4().to_string(),
            display_prefix: "sk-l...1234".into(),
            base_url: None,
            rate_per_minute: 60,
            daily_cap: 0,
            active: true,
            last_used_at: None,
            created_at: Utc::now() - Duration::minutes(age_mins),
        }
    }

    #[tokio::test]
    async fn test_unknown_model_leads_with_direct_key() {
        let router = ModelRouter::new(Arc::new(MemoryFastStore::new()));
        let openai = key(Provider::Openai, 30);
        let cohere = key(Provider::Cohere, 20);
        let keys = vec![openai.clone(), cohere.clone()];

        let candidates = router
            .candidates(None, cohere.id, &keys)
            .await
            .unwrap();
        assert_eq!(candidates[0].key.id, cohere.id);
        assert_eq!(candidates[1].key.id, openai.id);
    }

    #[tokio::test]
    async fn test_latency_ranks_preferred() {
        let fast = Arc::new(MemoryFastStore::new());
        fast.set_ex(&latency_key(Provider::Together), "50", 60)
            .await
            .unwrap();
        // Groq has no cached sample and must sort after Together.
        let router = ModelRouter::new(fast);

        let openai = key(Provider::Openai, 40);
        let groq = key(Provider::Groq, 30);
        let together = key(Provider::Together, 20);
        let keys = vec![openai.clone(), groq.clone(), together.clone()];

        let candidates = router
            .candidates(Some("llama-3-8b-instruct"), openai.id, &keys)
            .await
            .unwrap();

        assert_eq!(candidates[0].key.id, together.id);
        assert_eq!(candidates[1].key.id, groq.id);
        // The direct (non-preferred) key follows the preferred set.
        assert_eq!(candidates[2].key.id, openai.id);
    }

    #[tokio::test]
    async fn test_preferred_intersects_owner_keys() {
        let router = ModelRouter::new(Arc::new(MemoryFastStore::new()));
        // Owner has no key for any llama home; order falls back to direct.
        let anthropic = key(Provider::Anthropic, 10);
        let keys = vec![anthropic.clone()];

        let candidates = router
            .candidates(Some("llama-3-8b-instruct"), anthropic.id, &keys)
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].key.id, anthropic.id);
    }

    #[tokio::test]
    async fn test_custom_key_without_endpoint_is_skipped() {
        let router = ModelRouter::new(Arc::new(MemoryFastStore::new()));
        let mut custom = key(Provider::Custom, 10);
        custom.base_url = None;
        let keys = vec![custom.clone()];

        let err = router.candidates(None, custom.id, &keys).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoCandidates));
    }

    #[tokio::test]
    async fn test_custom_key_uses_configured_endpoint() {
        let router = ModelRouter::new(Arc::new(MemoryFastStore::new()));
        let mut custom = key(Provider::Custom, 10);
        custom.base_url = Some("https://llm.internal.example".into());
        let keys = vec![custom.clone()];

        let candidates = router.candidates(None, custom.id, &keys).await.unwrap();
        assert_eq!(candidates[0].base_url, "https://llm.internal.example");
    }

    #[tokio::test]
    async fn test_inactive_keys_excluded() {
        let router = ModelRouter::new(Arc::new(MemoryFastStore::new()));
        let mut disabled = key(Provider::Openai, 10);
        disabled.active = false;
        let live = key(Provider::Mistral, 5);
        let keys = vec![disabled.clone(), live.clone()];

        let candidates = router.candidates(None, disabled.id, &keys).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].key.id, live.id);
    }
}
