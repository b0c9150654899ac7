//! Time-based one-time passwords (RFC 6238) and backup codes.
//!
//! 30-second step, 6 digits, HMAC-SHA1 over the 8-byte big-endian step
//! counter, verified with a ±1-step window. Secrets are 20 bytes, base32.

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;

use super::hash::lookup_hash;

type HmacSha1 = Hmac<Sha1>;

/// TOTP time step in seconds.
const TOTP_STEP_SECS: u64 = 30;

/// Number of digits in a code.
const TOTP_DIGITS: u32 = 6;

/// Secret length in bytes (160-bit, the RFC 4226 recommendation).
const TOTP_SECRET_BYTES: usize = 20;

/// Number of backup codes issued at enrollment.
const BACKUP_CODE_COUNT: usize = 8;

/// Generate a fresh base32-encoded TOTP secret.
pub fn generate_totp_secret() -> String {
    let mut secret = [0u8; TOTP_SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut secret);
    BASE32_NOPAD.encode(&secret)
}

/// Compute the code for a given step counter.
fn hotp(secret: &[u8], counter: u64) -> u32 {
    let mut mac = HmacSha1::new_from_slice(secret).expect("HMAC accepts any key size");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // Dynamic truncation per RFC 4226 §5.3.
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let slice: [u8; 4] = digest[offset..offset + 4].try_into().expect("4-byte window");
    let code = u32::from_be_bytes(slice) & 0x7fff_ffff;
    code % 10u32.pow(TOTP_DIGITS)
}

/// Compute the current TOTP code for a base32 secret at a Unix timestamp.
pub fn totp_code(secret_b32: &str, unix_secs: u64) -> Option<String> {
    let secret = BASE32_NOPAD.decode(secret_b32.as_bytes()).ok()?;
    let counter = unix_secs / TOTP_STEP_SECS;
    Some(format!("{:06}", hotp(&secret, counter)))
}

/// Verify a submitted code against the secret, accepting the previous,
/// current, and next step.
pub fn verify_totp(secret_b32: &str, submitted: &str, unix_secs: u64) -> bool {
    let Ok(secret) = BASE32_NOPAD.decode(secret_b32.as_bytes()) else {
        return false;
    };
    if submitted.len() != TOTP_DIGITS as usize {
        return false;
    }
    let counter = unix_secs / TOTP_STEP_SECS;
    for candidate in counter.saturating_sub(1)..=counter + 1 {
        let expected = format!("{:06}", hotp(&secret, candidate));
        if super::constant_time_eq(expected.as_bytes(), submitted.as_bytes()) {
            return true;
        }
    }
    false
}

/// Generate backup codes, returning `(plaintext, hashes)`.
///
/// Plaintexts are shown to the user exactly once; only the hashes persist.
pub fn generate_backup_codes() -> (Vec<String>, Vec<String>) {
    let mut rng = rand::thread_rng();
    let mut plain = Vec::with_capacity(BACKUP_CODE_COUNT);
    let mut hashes = Vec::with_capacity(BACKUP_CODE_COUNT);
    for _ in 0..BACKUP_CODE_COUNT {
        let mut bytes = [0u8; 5];
        rng.fill_bytes(&mut bytes);
        let code = crate::crypto::hash::hex_encode(&bytes);
        hashes.push(lookup_hash(&code));
        plain.push(code);
    }
    (plain, hashes)
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 appendix B test vector, adapted to SHA-1 and a 20-byte
    // ASCII secret ("12345678901234567890").
    const RFC_SECRET: &[u8] = b"12345678901234567890";

    #[test]
    fn test_rfc6238_vectors() {
        let secret_b32 = BASE32_NOPAD.encode(RFC_SECRET);
        let cases: [(u64, &str); 3] = [
            (59, "287082"),
            (1_111_111_109, "081804"),
            (1_234_567_890, "005924"),
        ];
        for (at, expected) in cases {
            assert_eq!(totp_code(&secret_b32, at).unwrap(), expected);
        }
    }

    #[test]
    fn test_window_tolerance() {
        let secret = generate_totp_secret();
        let now = 1_700_000_000;
        let code = totp_code(&secret, now).unwrap();

        assert!(verify_totp(&secret, &code, now));
        // One step in either direction still verifies.
        assert!(verify_totp(&secret, &code, now + TOTP_STEP_SECS));
        assert!(verify_totp(&secret, &code, now - TOTP_STEP_SECS));
        // Two steps away does not.
        assert!(!verify_totp(&secret, &code, now + 2 * TOTP_STEP_SECS + 1));
    }

    #[test]
    fn test_rejects_malformed_input() {
        let secret = generate_totp_secret();
        assert!(!verify_totp(&secret, "12345", 0));
        assert!(!verify_totp(&secret, "1234567", 0));
        assert!(!verify_totp("not base32!!", "123456", 0));
    }

    #[test]
    fn test_backup_codes_hashed() {
        let (plain, hashes) = generate_backup_codes();
        assert_eq!(plain.len(), BACKUP_CODE_COUNT);
        assert_eq!(hashes.len(), BACKUP_CODE_COUNT);
        for (code, hash) in plain.iter().zip(&hashes) {
            assert_ne!(code, hash);
            assert_eq!(&lookup_hash(code), hash);
        }
    }
}
