//! Request-scoped caller identity for the admin surface.
//!
//! The signup/session flow lives outside the core; its boundary contract is
//! an HMAC-signed bearer `"<user_id>.<expiry_unix>.<sig_hex>"` minted under
//! the boot-time session secret. The extractor verifies the bearer and
//! loads the caller, so every handler receives an explicit identity instead
//! of reading ambient state.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::crypto::hash::{constant_time_eq, hex_encode};
use crate::error::GatewayError;
use crate::store::User;

use super::state::AppState;

/// Mint a session bearer for a user id, valid for `ttl_secs`.
pub fn mint_session_token(secret: &str, user_id: Uuid, ttl_secs: i64) -> String {
    let expires = Utc::now().timestamp() + ttl_secs;
    let payload = format!("{user_id}.{expires}");
    format!("{payload}.{}", session_sig(secret, &payload))
}

/// Verify a session bearer; returns the user id while the token is live.
pub fn verify_session_token(secret: &str, token: &str) -> Option<Uuid> {
    let (payload, sig) = token.rsplit_once('.')?;
    let expected = session_sig(secret, payload);
    if !constant_time_eq(expected.as_bytes(), sig.as_bytes()) {
        return None;
    }

    let (user_id, expires) = payload.split_once('.')?;
    let expires: i64 = expires.parse().ok()?;
    if expires < Utc::now().timestamp() {
        return None;
    }
    user_id.parse().ok()
}

fn session_sig(secret: &str, payload: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(payload.as_bytes());
    hex_encode(&mac.finalize().into_bytes())
}

/// The authenticated caller of an admin endpoint.
pub struct AuthedUser(pub User);

impl FromRequestParts<Arc<AppState>> for AuthedUser {
    type Rejection = GatewayError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let bearer = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| GatewayError::Unauthorized("Missing bearer token".into()))?;

        let user_id = verify_session_token(&state.config.vault.session_secret, bearer)
            .ok_or_else(|| GatewayError::Unauthorized("Invalid or expired session".into()))?;

        let user = state
            .vault
            .user_by_id(user_id)
            .await?
            .filter(|u| u.active)
            .ok_or_else(|| GatewayError::Unauthorized("Unknown or disabled user".into()))?;

        Ok(AuthedUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_round_trip() {
        let user_id = Uuid::new_v4();
        let token = mint_session_token("secret", user_id, 3600);
        assert_eq!(verify_session_token("secret", &token), Some(user_id));
    }

    #[test]
    fn test_session_rejects_tampering() {
        let user_id = Uuid::new_v4();
        let token = mint_session_token("secret", user_id, 3600);

        assert_eq!(verify_session_token("other-secret", &token), None);

        let other_user = Uuid::new_v4();
        let forged = token.replacen(&user_id.to_string(), &other_user.to_string(), 1);
        assert_eq!(verify_session_token("secret", &forged), None);
    }

    #[test]
    fn test_session_expiry() {
        let user_id = Uuid::new_v4();
        let expired = mint_session_token("secret", user_id, -1);
        assert_eq!(verify_session_token("secret", &expired), None);
    }

    #[test]
    fn test_malformed_tokens() {
        assert_eq!(verify_session_token("secret", ""), None);
        assert_eq!(verify_session_token("secret", "no-dots"), None);
        assert_eq!(verify_session_token("secret", "a.b.c"), None);
    }
}
