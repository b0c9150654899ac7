//! Access-token minting and display formatting.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;

/// Prefix carried by every shared access token.
pub const TOKEN_PREFIX: &str = "feen_";

/// Random bytes of entropy behind each token.
const TOKEN_SECRET_BYTES: usize = 24;

/// Mint a new shared access token: `feen_` followed by 24 random bytes,
/// base64url-encoded without padding.
pub fn mint_access_token() -> String {
    let mut secret = [0u8; TOKEN_SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut secret);
    format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(secret))
}

/// Whether a candidate string carries the token prefix. The entry point
/// checks this before any store lookup is attempted.
pub fn has_token_prefix(candidate: &str) -> bool {
    candidate.starts_with(TOKEN_PREFIX)
}

/// UI-only display form of a deposited credential: first and last four
/// characters joined by an ellipsis, or `****` when the plaintext is too
/// short to show anything safely.
pub fn display_prefix(plaintext: &str) -> String {
    if plaintext.len() <= 8 {
        return "****".to_string();
    }
    let chars: Vec<char> = plaintext.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_shape() {
        let token = mint_access_token();
        assert!(token.starts_with("feen_"));
        // 24 bytes -> 32 base64url chars, no padding.
        assert_eq!(token.len(), TOKEN_PREFIX.len() + 32);
        assert!(!token.contains('='));
    }

    #[test]
    fn test_mint_unique() {
        assert_ne!(mint_access_token(), mint_access_token());
    }

    #[test]
    fn test_prefix_check() {
        assert!(has_token_prefix("feen_abcdef"));
        assert!(!has_token_prefix("sk-abcdef"));
        assert!(!has_token_prefix(""));
    }

    #[test]
    fn test_display_prefix() {
        assert_eq!(display_prefix("sk-live-abcdef012345"), "sk-l...2345");
        assert_eq!(display_prefix("short"), "****");
        assert_eq!(display_prefix("12345678"), "****");
        assert_eq!(display_prefix("123456789"), "1234...6789");
    }
}
