//! Shared-token policy evaluation.
//!
//! Given an extracted bearer token and request metadata, the evaluator
//! resolves `{shared_token, api_key}` or fails with the first violated
//! check. Check order is part of the contract: format, lookup, expiry,
//! usage cap, IP allow-list, model allow-list, scope, signature.
//!
//! Every failure except a plain lookup miss feeds the rotation controller.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use ipnet::IpNet;

use crate::crypto::{self, lookup_hash, RequestSignature};
use crate::error::{GatewayError, Result};
use crate::guard::{RotationController, SuspiciousKind};
use crate::store::{nonce_key, ApiKeyRecord, FastStore, SharedTokenRecord, VaultStore};

/// Request facts the evaluator operates on.
#[derive(Debug)]
pub struct PolicyInput<'a> {
    /// The raw bearer string presented by the caller.
    pub bearer: &'a str,
    /// Client address, when it could be determined.
    pub client_ip: Option<IpAddr>,
    /// Full request path as received (used for signature verification).
    pub request_path: &'a str,
    /// Provider-native suffix, normalized: no leading slash, no query.
    pub forwarded_path: &'a str,
    pub method: &'a str,
    /// Raw request body (signature input).
    pub body: &'a [u8],
    /// Signature headers, when all three were present.
    pub signature: Option<RequestSignature>,
    /// Top-level `model` from the request body, when present.
    pub requested_model: Option<&'a str>,
}

/// Successful resolution: the token and the key it delegates.
#[derive(Debug, Clone)]
pub struct ResolvedAccess {
    pub token: SharedTokenRecord,
    pub api_key: ApiKeyRecord,
}

/// Stateless policy checks over the store adapters.
pub struct PolicyEvaluator {
    vault: Arc<dyn VaultStore>,
    fast: Arc<dyn FastStore>,
    guard: Arc<dyn RotationController>,
}

impl PolicyEvaluator {
    pub fn new(
        vault: Arc<dyn VaultStore>,
        fast: Arc<dyn FastStore>,
        guard: Arc<dyn RotationController>,
    ) -> Self {
        Self { vault, fast, guard }
    }

    /// Run the checks in order; the first failure terminates evaluation.
    pub async fn evaluate(&self, input: PolicyInput<'_>) -> Result<ResolvedAccess> {
        // 1. Token format, before any store work.
        if !crypto::has_token_prefix(input.bearer) {
            return Err(GatewayError::TokenInvalid("Invalid access token".into()));
        }

        // 2. Lookup by keyed hash. An inactive row answers exactly like a
        // missing one; no event is recorded for either.
        let token = self
            .vault
            .token_by_hash(&lookup_hash(input.bearer))
            .await?
            .filter(|t| t.active)
            .ok_or_else(|| GatewayError::TokenInvalid("Invalid access token".into()))?;

        // 3. Expiry.
        if token.is_expired(Utc::now()) {
            return Err(self
                .fail(&token, SuspiciousKind::ExpiredToken, GatewayError::TokenExpired)
                .await);
        }

        // 4. Lifetime usage cap.
        if token.is_exhausted() {
            return Err(self
                .fail(
                    &token,
                    SuspiciousKind::QuotaExceeded,
                    GatewayError::QuotaExceeded("Shared token usage allowance exhausted".into()),
                )
                .await);
        }

        // 5. IP allow-list.
        if !ip_allowed(&token.allowed_ips, input.client_ip) {
            return Err(self
                .fail(
                    &token,
                    SuspiciousKind::IpBlacklisted,
                    GatewayError::Forbidden("IP address not allowed".into()),
                )
                .await);
        }

        // 6. Model allow-list.
        if let Some(model) = input.requested_model {
            if !token.allowed_models.is_empty()
                && !token.allowed_models.iter().any(|m| m == model)
            {
                return Err(self
                    .fail(
                        &token,
                        SuspiciousKind::ModelNotAllowed,
                        GatewayError::Forbidden(format!("Model not allowed: {model}")),
                    )
                    .await);
            }
        }

        // 7. Scope.
        let required = required_scopes(input.forwarded_path);
        if !required.is_empty() && !scopes_satisfy(&token.scopes, required) {
            return Err(self
                .fail(
                    &token,
                    SuspiciousKind::ScopeDenied,
                    GatewayError::InsufficientScope(format!(
                        "Token scope does not cover this endpoint (requires one of: {})",
                        required.join(", ")
                    )),
                )
                .await);
        }

        // 8. Request signature, only for tokens that demand one.
        if token.require_signature {
            self.check_signature(&token, &input).await?;
        }

        let api_key = self
            .vault
            .api_key_by_id(token.api_key_ref)
            .await?
            .filter(|k| k.active)
            .ok_or_else(|| {
                GatewayError::Config(format!(
                    "shared token {} references a missing or inactive key",
                    token.id
                ))
            })?;

        Ok(ResolvedAccess { token, api_key })
    }

    async fn check_signature(
        &self,
        token: &SharedTokenRecord,
        input: &PolicyInput<'_>,
    ) -> Result<()> {
        let Some(signature) = input.signature.as_ref() else {
            return Err(self
                .fail(token, SuspiciousKind::MissingSignature, GatewayError::MissingSignature)
                .await);
        };

        if !signature.timestamp_in_window(Utc::now().timestamp()) {
            return Err(self
                .fail(token, SuspiciousKind::ExpiredTimestamp, GatewayError::ExpiredTimestamp)
                .await);
        }

        // First sight of a nonce claims it for twice the validity window.
        let fresh = self
            .fast
            .set_nx_ex(
                &nonce_key(token.id, &signature.nonce),
                &signature.timestamp.to_string(),
                crypto::NONCE_TTL_SECS,
            )
            .await?;
        if !fresh {
            return Err(self
                .fail(token, SuspiciousKind::ReplayAttack, GatewayError::ReplayAttack)
                .await);
        }

        let secret = token
            .signing_secret
            .as_deref()
            .ok_or_else(|| {
                GatewayError::Config(format!("token {} requires signatures but has no secret", token.id))
            })?;

        if !signature.verify(
            secret,
            input.method,
            input.request_path,
            input.body,
            &token.id.to_string(),
        ) {
            return Err(self
                .fail(token, SuspiciousKind::InvalidSignature, GatewayError::InvalidSignature)
                .await);
        }

        Ok(())
    }

    /// Record the suspicious event, then hand the failure back. Rotation
    /// (if the threshold was crossed) only affects the next request.
    async fn fail(
        &self,
        token: &SharedTokenRecord,
        kind: SuspiciousKind,
        err: GatewayError,
    ) -> GatewayError {
        if let Err(record_err) = self.guard.record_event(token.id, kind).await {
            tracing::error!(token_id = %token.id, error = %record_err, "failed to record suspicious event");
        }
        err
    }
}

/// Match a client address against allow-list entries (literals or CIDRs).
/// An undeterminable address matches only a literal `unknown` entry.
fn ip_allowed(allowed: &[String], client: Option<IpAddr>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match client {
        None => allowed.iter().any(|entry| entry == "unknown"),
        Some(ip) => allowed.iter().any(|entry| {
            if let Ok(net) = entry.parse::<IpNet>() {
                return net.contains(&ip);
            }
            if let Ok(literal) = entry.parse::<IpAddr>() {
                return literal == ip;
            }
            false
        }),
    }
}

/// Endpoint-prefix to required-scope table. Longest prefixes first so
/// `v1/images/edits` wins over `v1/images`. An unknown endpoint requires
/// nothing.
fn required_scopes(normalized_path: &str) -> &'static [&'static str] {
    const TABLE: &[(&str, &[&str])] = &[
        ("v1/chat/completions", &["chat:write"]),
        ("v1/images/generations", &["images:write"]),
        ("v1/images/variations", &["images:write"]),
        ("v1/images/edits", &["images:edit"]),
        ("v1/audio/transcriptions", &["audio:transcribe"]),
        ("v1/audio/translations", &["audio:translate"]),
        ("v1/audio/speech", &["audio:speech"]),
        ("v1/fine_tuning/jobs", &["finetune:read", "finetune:write"]),
        ("v1/completions", &["completions:write"]),
        ("v1/embeddings", &["embeddings:write"]),
        ("v1/assistants", &["assistants:read", "assistants:write"]),
        ("v1/messages", &["chat:write"]),
        ("v1/complete", &["completions:write"]),
        ("v1/models", &["models:list", "models:read"]),
        ("v1/files", &["files:read", "files:write"]),
    ];

    for (prefix, scopes) in TABLE {
        if normalized_path.starts_with(prefix) {
            return scopes;
        }
    }
    &[]
}

/// A token satisfies a requirement when any of its scopes covers any
/// required scope. `*` covers everything; `files:*` covers `files:read`.
fn scopes_satisfy(held: &[String], required: &[&str]) -> bool {
    held.iter().any(|scope| {
        if scope == "*" {
            return true;
        }
        required.iter().any(|req| {
            scope == req
                || scope
                    .strip_suffix(":*")
                    .is_some_and(|family| req.starts_with(&format!("{family}:")))
        })
    })
}

/// Strip the leading slash and query string off a forwarded path.
pub fn normalize_path(path: &str) -> &str {
    let path = path.split('?').next().unwrap_or(path);
    path.trim_start_matches('/')
}
