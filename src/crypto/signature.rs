//! HMAC-SHA256 request signatures for tokens with `require_signature`.
//!
//! The canonical string is
//! `timestamp \n nonce \n METHOD \n path \n body \n token_id`. A signature
//! is accepted only when the timestamp is within the validity window and the
//! `(token, nonce)` pair has not been observed before.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::hash::{constant_time_eq, hex_encode};
use super::SIGNATURE_WINDOW_SECS;

type HmacSha256 = Hmac<Sha256>;

/// The three signature headers extracted from a signed request.
#[derive(Debug, Clone)]
pub struct RequestSignature {
    /// Unix timestamp (seconds) the client claims to have signed at.
    pub timestamp: i64,
    /// Client-chosen nonce, unique per request within the window.
    pub nonce: String,
    /// Hex HMAC-SHA256 over the canonical string.
    pub signature: String,
}

impl RequestSignature {
    /// Whether the claimed timestamp is within the allowed clock skew of
    /// `now`.
    pub fn timestamp_in_window(&self, now_unix: i64) -> bool {
        (now_unix - self.timestamp).abs() <= SIGNATURE_WINDOW_SECS
    }

    /// Verify the HMAC over the canonical string. Constant-time on the
    /// signature bytes.
    pub fn verify(&self, secret: &str, method: &str, path: &str, body: &[u8], token_id: &str) -> bool {
        let expected = sign(secret, self.timestamp, &self.nonce, method, path, body, token_id);
        constant_time_eq(expected.as_bytes(), self.signature.as_bytes())
    }
}

/// Compute the hex signature for the canonical string. Exposed so clients
/// (and tests) can produce valid signatures.
pub fn sign(
    secret: &str,
    timestamp: i64,
    nonce: &str,
    method: &str,
    path: &str,
    body: &[u8],
    token_id: &str,
) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b"\n");
    mac.update(nonce.as_bytes());
    mac.update(b"\n");
    mac.update(method.to_uppercase().as_bytes());
    mac.update(b"\n");
    mac.update(path.as_bytes());
    mac.update(b"\n");
    mac.update(body);
    mac.update(b"\n");
    mac.update(token_id.as_bytes());
    hex_encode(&mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed(now: i64) -> RequestSignature {
        RequestSignature {
            timestamp: now,
            nonce: "nonce-1".into(),
            signature: sign(
                "topsecret",
                now,
                "nonce-1",
                "POST",
                "/api/proxy/v1/chat/completions",
                br#"{"model":"gpt-4o"}"#,
                "tok-1",
            ),
        }
    }

    #[test]
    fn test_valid_signature_verifies() {
        let sig = signed(1_700_000_000);
        assert!(sig.verify(
            "topsecret",
            "POST",
            "/api/proxy/v1/chat/completions",
            br#"{"model":"gpt-4o"}"#,
            "tok-1",
        ));
    }

    #[test]
    fn test_any_field_change_breaks_signature() {
        let sig = signed(1_700_000_000);
        let body = br#"{"model":"gpt-4o"}"#;
        assert!(!sig.verify("topsecret", "GET", "/api/proxy/v1/chat/completions", body, "tok-1"));
        assert!(!sig.verify("topsecret", "POST", "/api/proxy/v1/embeddings", body, "tok-1"));
        assert!(!sig.verify("topsecret", "POST", "/api/proxy/v1/chat/completions", b"{}", "tok-1"));
        assert!(!sig.verify("topsecret", "POST", "/api/proxy/v1/chat/completions", body, "tok-2"));
        assert!(!sig.verify("other", "POST", "/api/proxy/v1/chat/completions", body, "tok-1"));
    }

    #[test]
    fn test_method_is_case_insensitive() {
        let now = 1_700_000_000;
        let a = sign("s", now, "n", "post", "/p", b"", "t");
        let b = sign("s", now, "n", "POST", "/p", b"", "t");
        assert_eq!(a, b);
    }

    #[test]
    fn test_timestamp_window() {
        let sig = signed(1_700_000_000);
        assert!(sig.timestamp_in_window(1_700_000_000));
        assert!(sig.timestamp_in_window(1_700_000_000 + SIGNATURE_WINDOW_SECS));
        assert!(sig.timestamp_in_window(1_700_000_000 - SIGNATURE_WINDOW_SECS));
        assert!(!sig.timestamp_in_window(1_700_000_000 + SIGNATURE_WINDOW_SECS + 1));
    }
}
