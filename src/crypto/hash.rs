//! Keyed lookup hashing, password derivation, and constant-time comparison.

use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

use super::PBKDF2_ROUNDS;

/// Password salt length in bytes.
const PASSWORD_SALT_LEN: usize = 16;

/// Derived password hash length in bytes.
const PASSWORD_HASH_LEN: usize = 32;

/// Deterministic SHA-256 hex digest used for equality lookups
/// (token lookup, credential dedup). Never used for decryption.
pub fn lookup_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex_encode(&digest)
}

/// Constant-time equality over secret bytes.
///
/// Length mismatch short-circuits; the length of a secret is not treated as
/// secret, only its content.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Hash a password as `salt_hex:pbkdf2_hex` (PBKDF2-HMAC-SHA512, 100k
/// rounds, 32-byte output).
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; PASSWORD_SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);

    let mut derived = [0u8; PASSWORD_HASH_LEN];
    pbkdf2_hmac::<Sha512>(password.as_bytes(), &salt, PBKDF2_ROUNDS, &mut derived);

    format!("{}:{}", hex_encode(&salt), hex_encode(&derived))
}

/// Verify a password against a stored `salt_hex:hash_hex` string.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt_hex, hash_hex)) = stored.split_once(':') else {
        return false;
    };
    let (Some(salt), Some(expected)) = (hex_decode(salt_hex), hex_decode(hash_hex)) else {
        return false;
    };

    let mut derived = vec![0u8; expected.len()];
    pbkdf2_hmac::<Sha512>(password.as_bytes(), &salt, PBKDF2_ROUNDS, &mut derived);

    constant_time_eq(&derived, &expected)
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

pub(crate) fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let raw = hex.as_bytes();
    let mut out = Vec::with_capacity(hex.len() / 2);
    for pair in raw.chunks_exact(2) {
        let hi = decode_nibble(pair[0])?;
        let lo = decode_nibble(pair[1])?;
        out.push((hi << 4) | lo);
    }
    Some(out)
}

fn decode_nibble(value: u8) -> Option<u8> {
    match value {
        b'0'..=b'9' => Some(value - b'0'),
        b'a'..=b'f' => Some(value - b'a' + 10),
        b'A'..=b'F' => Some(value - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_hash_deterministic() {
        assert_eq!(lookup_hash("feen_abc"), lookup_hash("feen_abc"));
        assert_ne!(lookup_hash("feen_abc"), lookup_hash("feen_abd"));
        assert_eq!(lookup_hash("x").len(), 64);
    }

    #[test]
    fn test_password_round_trip() {
        let stored = hash_password("hunter2hunter2");
        assert!(verify_password("hunter2hunter2", &stored));
        assert!(!verify_password("hunter2hunter3", &stored));
    }

    #[test]
    fn test_password_salts_differ() {
        assert_ne!(hash_password("same"), hash_password("same"));
    }

    #[test]
    fn test_verify_rejects_malformed_stored() {
        assert!(!verify_password("pw", "no-colon-here"));
        assert!(!verify_password("pw", "zz:zz"));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"same-bytes", b"same-bytes"));
        assert!(!constant_time_eq(b"same-bytes", b"same-bytez"));
        assert!(!constant_time_eq(b"short", b"longer-value"));
    }

    #[test]
    fn test_hex_round_trip() {
        let bytes = [0x00, 0x7f, 0xff, 0x10];
        assert_eq!(hex_decode(&hex_encode(&bytes)).unwrap(), bytes);
        assert!(hex_decode("abc").is_none());
        assert!(hex_decode("zz").is_none());
    }
}
