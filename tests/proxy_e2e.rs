//! End-to-end data-plane tests: policy, rate limiting, fallback, usage
//! metering, signatures, and rotation, all over real HTTP.

mod common;

use chrono::{Duration, Utc};
use common::TestGateway;
use feen::crypto::{lookup_hash, signature};
use feen::guard::{RotationController, SuspiciousKind};
use feen::store::{suspicious_key, AuditAction};

const CHAT_BODY: &str = r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#;

#[tokio::test]
async fn test_successful_proxy_call_meters_usage() {
    let gw = TestGateway::spawn().await;
    let key = gw.deposit_key("ok", "sk-custom-abcdef0123").await;
    let (token, access_token) = gw.mint_token(&key, |_| {}).await;

    let response = gw
        .client
        .post(gw.proxy_url("v1/chat/completions"))
        .bearer_auth(&access_token)
        .header("content-type", "application/json")
        .body(CHAT_BODY)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("x-feen-provider").unwrap(),
        "CUSTOM"
    );
    assert!(response.headers().contains_key("x-feen-latency"));
    assert!(response.headers().contains_key("x-ratelimit-remaining"));

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["id"], "cmpl-mock-1");

    // The upstream saw the decrypted credential, not the feen token.
    let hits = gw.upstream_hits();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0, "/ok/v1/chat/completions");
    assert_eq!(hits[0].1.as_deref(), Some("Bearer sk-custom-abcdef0123"));

    // Exactly one usage record, with the extracted token counts.
    let usage = gw.wait_usage(1).await;
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].status_code, 200);
    assert_eq!(usage[0].request_tokens, Some(10));
    assert_eq!(usage[0].response_tokens, Some(20));
    assert_eq!(usage[0].total_tokens, Some(30));
    assert_eq!(usage[0].model.as_deref(), Some("gpt-4o"));

    let stored = gw.wait_token_use(token.id, 1).await;
    assert!(stored.last_used_at.is_some());
}

#[tokio::test]
async fn test_rate_limit_window() {
    let gw = TestGateway::spawn().await;
    let key = gw.deposit_key("ok", "sk-rate-abcdef0123").await;
    let (_token, access_token) = gw.mint_token(&key, |t| t.rate_per_minute = 2).await;

    let mut statuses = Vec::new();
    for _ in 0..3 {
        let response = gw
            .client
            .post(gw.proxy_url("v1/chat/completions"))
            .bearer_auth(&access_token)
            .header("content-type", "application/json")
            .body(CHAT_BODY)
            .send()
            .await
            .unwrap();
        statuses.push(response.status().as_u16());

        if response.status() == 429 {
            let retry_after: u64 = response
                .headers()
                .get("retry-after")
                .unwrap()
                .to_str()
                .unwrap()
                .parse()
                .unwrap();
            assert!(retry_after <= 60);

            let body: serde_json::Value = response.json().await.unwrap();
            assert_eq!(body["code"], "RATE_LIMITED");
            assert!(body["requestId"].is_string());
        }
    }

    assert_eq!(statuses, vec![200, 200, 429]);
    // The third call never reached the upstream.
    assert_eq!(gw.upstream_hits().len(), 2);
}

#[tokio::test]
async fn test_expired_token_never_reaches_upstream() {
    let gw = TestGateway::spawn().await;
    let key = gw.deposit_key("ok", "sk-exp-abcdef0123").await;
    let (_token, access_token) = gw
        .mint_token(&key, |t| t.expires_at = Some(Utc::now() - Duration::seconds(1)))
        .await;

    for _ in 0..2 {
        let response = gw
            .client
            .post(gw.proxy_url("v1/chat/completions"))
            .bearer_auth(&access_token)
            .body(CHAT_BODY)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 401);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["code"], "TOKEN_EXPIRED");
    }

    assert!(gw.upstream_hits().is_empty());
}

#[tokio::test]
async fn test_ip_allowlist_blocks_and_rotates() {
    let gw = TestGateway::spawn().await;
    let key = gw.deposit_key("ok", "sk-ip-abcdef0123").await;
    let (token, access_token) = gw
        .mint_token(&key, |t| t.allowed_ips = vec!["10.0.0.0/24".to_string()])
        .await;

    let response = gw
        .client
        .post(gw.proxy_url("v1/chat/completions"))
        .bearer_auth(&access_token)
        .header("x-forwarded-for", "10.0.1.5")
        .body(CHAT_BODY)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 403);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "IP address not allowed");
    assert!(gw.upstream_hits().is_empty());

    // The IP_BLACKLISTED event was recorded, and since blacklisted
    // addresses rotate immediately, the token changed and its event lists
    // were cleared.
    let suspicious = gw
        .vault
        .audit_with_action(AuditAction::SuspiciousActivity, 10)
        .await
        .unwrap();
    assert_eq!(suspicious.len(), 1);
    assert_eq!(suspicious[0].detail["kind"], "IP_BLACKLISTED");

    let rotations = gw
        .vault
        .audit_with_action(AuditAction::TokenRotated, 10)
        .await
        .unwrap();
    assert_eq!(rotations.len(), 1);
    assert_eq!(rotations[0].detail["reason"], "ip_blacklisted");

    let events = gw
        .fast
        .llen(&suspicious_key(token.id, SuspiciousKind::IpBlacklisted.tag()))
        .await
        .unwrap();
    assert_eq!(events, 0);

    // The old plaintext is dead even from an allowed address.
    let response = gw
        .client
        .post(gw.proxy_url("v1/chat/completions"))
        .bearer_auth(&access_token)
        .header("x-forwarded-for", "10.0.0.7")
        .body(CHAT_BODY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // An in-range caller on a fresh token passes.
    let (_token2, access_token2) = gw
        .mint_token(&key, |t| t.allowed_ips = vec!["10.0.0.0/24".to_string()])
        .await;
    let response = gw
        .client
        .post(gw.proxy_url("v1/chat/completions"))
        .bearer_auth(&access_token2)
        .header("x-forwarded-for", "10.0.0.7")
        .body(CHAT_BODY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_scope_denied() {
    let gw = TestGateway::spawn().await;
    let key = gw.deposit_key("ok", "sk-scope-abcdef0123").await;
    let (_token, access_token) = gw
        .mint_token(&key, |t| t.scopes = vec!["embeddings:write".to_string()])
        .await;

    let response = gw
        .client
        .post(gw.proxy_url("v1/chat/completions"))
        .bearer_auth(&access_token)
        .body(CHAT_BODY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "INSUFFICIENT_SCOPE");

    // The same token is fine on the endpoint its scope covers.
    let response = gw
        .client
        .post(gw.proxy_url("v1/embeddings"))
        .bearer_auth(&access_token)
        .body(r#"{"model":"text-embedding-3-small","input":"hi"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_model_allowlist() {
    let gw = TestGateway::spawn().await;
    let key = gw.deposit_key("ok", "sk-model-abcdef0123").await;
    let (_token, access_token) = gw
        .mint_token(&key, |t| t.allowed_models = vec!["gpt-4o-mini".to_string()])
        .await;

    let response = gw
        .client
        .post(gw.proxy_url("v1/chat/completions"))
        .bearer_auth(&access_token)
        .body(CHAT_BODY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
    assert!(gw.upstream_hits().is_empty());
}

#[tokio::test]
async fn test_fallback_on_server_error() {
    let gw = TestGateway::spawn().await;
    // Direct key fails; the second deposited key answers.
    let failing = gw.deposit_key("fail", "sk-fail-abcdef0123").await;
    let _healthy = gw.deposit_key("ok", "sk-ok-abcdef0123").await;
    let (_token, access_token) = gw.mint_token(&failing, |_| {}).await;

    let response = gw
        .client
        .post(gw.proxy_url("v1/chat/completions"))
        .bearer_auth(&access_token)
        .body(CHAT_BODY)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let hits = gw.upstream_hits();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].0, "/fail/v1/chat/completions");
    assert_eq!(hits[1].0, "/ok/v1/chat/completions");
}

#[tokio::test]
async fn test_all_candidates_failing_is_bad_gateway() {
    let gw = TestGateway::spawn().await;
    let failing = gw.deposit_key("fail", "sk-fail-abcdef0123").await;
    let (_token, access_token) = gw.mint_token(&failing, |_| {}).await;

    let response = gw
        .client
        .post(gw.proxy_url("v1/chat/completions"))
        .bearer_auth(&access_token)
        .body(CHAT_BODY)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "All available providers failed");

    // The exhausted attempt still produced a usage record.
    let usage = gw.wait_usage(1).await;
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].status_code, 502);
}

#[tokio::test]
async fn test_upstream_4xx_forwarded_unchanged() {
    let gw = TestGateway::spawn().await;
    let missing = gw.deposit_key("missing", "sk-404-abcdef0123").await;
    let _healthy = gw.deposit_key("ok", "sk-ok2-abcdef0123").await;
    let (_token, access_token) = gw.mint_token(&missing, |_| {}).await;

    let response = gw
        .client
        .post(gw.proxy_url("v1/chat/completions"))
        .bearer_auth(&access_token)
        .body(CHAT_BODY)
        .send()
        .await
        .unwrap();

    // 4xx is a legitimate answer: no fallback, body forwarded as-is.
    assert_eq!(response.status(), 404);
    assert_eq!(gw.upstream_hits().len(), 1);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["message"], "model not found");
}

#[tokio::test]
async fn test_invalid_signature_rotates_after_threshold() {
    let gw = TestGateway::spawn().await;
    let key = gw.deposit_key("ok", "sk-sig-abcdef0123").await;
    let (token, access_token) = gw
        .mint_token(&key, |t| {
            t.require_signature = true;
            t.signing_secret = Some("signing-secret".to_string());
        })
        .await;

    // Three bad signatures burn through the rotation threshold.
    for i in 0..3 {
        let response = gw
            .client
            .post(gw.proxy_url("v1/chat/completions"))
            .bearer_auth(&access_token)
            .header("x-feen-timestamp", Utc::now().timestamp().to_string())
            .header("x-feen-nonce", format!("nonce-{i}"))
            .header("x-feen-signature", "deadbeef")
            .body(CHAT_BODY)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 401);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["code"], "INVALID_SIGNATURE");
    }

    // The fourth call sees a rotated token.
    let response = gw
        .client
        .post(gw.proxy_url("v1/chat/completions"))
        .bearer_auth(&access_token)
        .body(CHAT_BODY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "TOKEN_INVALID");

    let stored = gw.vault.token_by_id(token.id).await.unwrap().unwrap();
    assert_ne!(stored.token_hash, lookup_hash(&access_token));

    let audits = gw
        .vault
        .audit_with_action(AuditAction::TokenRotated, 10)
        .await
        .unwrap();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].detail["reason"], "invalid_signature");
    assert!(gw.upstream_hits().is_empty());
}

#[tokio::test]
async fn test_signed_request_and_replay_protection() {
    let gw = TestGateway::spawn().await;
    let key = gw.deposit_key("ok", "sk-replay-abcdef0123").await;
    let (token, access_token) = gw
        .mint_token(&key, |t| {
            t.require_signature = true;
            t.signing_secret = Some("signing-secret".to_string());
        })
        .await;

    let timestamp = Utc::now().timestamp();
    let nonce = "nonce-once";
    let sig = signature::sign(
        "signing-secret",
        timestamp,
        nonce,
        "POST",
        "/api/proxy/v1/chat/completions",
        CHAT_BODY.as_bytes(),
        &token.id.to_string(),
    );

    let send = || {
        gw.client
            .post(gw.proxy_url("v1/chat/completions"))
            .bearer_auth(&access_token)
            .header("x-feen-timestamp", timestamp.to_string())
            .header("x-feen-nonce", nonce)
            .header("x-feen-signature", sig.clone())
            .body(CHAT_BODY)
            .send()
    };

    // First use of the nonce verifies and goes upstream.
    let response = send().await.unwrap();
    assert_eq!(response.status(), 200);

    // An identical replay is rejected.
    let response = send().await.unwrap();
    assert_eq!(response.status(), 401);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "REPLAY_ATTACK");

    assert_eq!(gw.upstream_hits().len(), 1);
}

#[tokio::test]
async fn test_missing_signature_headers() {
    let gw = TestGateway::spawn().await;
    let key = gw.deposit_key("ok", "sk-missig-abcdef0123").await;
    let (_token, access_token) = gw
        .mint_token(&key, |t| {
            t.require_signature = true;
            t.signing_secret = Some("signing-secret".to_string());
        })
        .await;

    let response = gw
        .client
        .post(gw.proxy_url("v1/chat/completions"))
        .bearer_auth(&access_token)
        .body(CHAT_BODY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "MISSING_SIGNATURE");
}

#[tokio::test]
async fn test_rotation_invalidates_old_token() {
    let gw = TestGateway::spawn().await;
    let key = gw.deposit_key("ok", "sk-rot-abcdef0123").await;
    let (token, access_token) = gw.mint_token(&key, |_| {}).await;

    // Old token works before rotation.
    let response = gw
        .client
        .post(gw.proxy_url("v1/chat/completions"))
        .bearer_auth(&access_token)
        .body(CHAT_BODY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let new_token = gw
        .state
        .guard
        .rotate(token.id, "manual_rotation")
        .await
        .unwrap();

    // Old plaintext is dead, the replacement lives under the same policy.
    let response = gw
        .client
        .post(gw.proxy_url("v1/chat/completions"))
        .bearer_auth(&access_token)
        .body(CHAT_BODY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = gw
        .client
        .post(gw.proxy_url("v1/chat/completions"))
        .bearer_auth(&new_token)
        .body(CHAT_BODY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_lifetime_usage_cap() {
    let gw = TestGateway::spawn().await;
    let key = gw.deposit_key("ok", "sk-cap-abcdef0123").await;
    let (token, access_token) = gw
        .mint_token(&key, |t| t.max_total_use = Some(1))
        .await;

    let response = gw
        .client
        .post(gw.proxy_url("v1/chat/completions"))
        .bearer_auth(&access_token)
        .body(CHAT_BODY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    // The counter update is asynchronous; the cap binds once it lands.
    gw.wait_token_use(token.id, 1).await;

    let response = gw
        .client
        .post(gw.proxy_url("v1/chat/completions"))
        .bearer_auth(&access_token)
        .body(CHAT_BODY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 429);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "QUOTA_EXCEEDED");
}

#[tokio::test]
async fn test_unknown_bearer_shapes() {
    let gw = TestGateway::spawn().await;
    let _key = gw.deposit_key("ok", "sk-any-abcdef0123").await;

    // No prefix, wrong prefix, valid prefix but unknown token: all 401.
    for bearer in ["sk-raw-provider-key", "token-123", "feen_unknownunknownunknownunknown"] {
        let response = gw
            .client
            .post(gw.proxy_url("v1/chat/completions"))
            .bearer_auth(bearer)
            .body(CHAT_BODY)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 401);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["code"], "TOKEN_INVALID");
    }
    assert!(gw.upstream_hits().is_empty());
}
