//! Cryptographic primitives for the vault and the token layer.
//!
//! Everything secret-shaped in the gateway funnels through this module:
//! authenticated encryption of deposited provider credentials, keyed lookup
//! hashing, access-token minting, password derivation, TOTP, and signed
//! proxy requests.

pub mod hash;
pub mod signature;
pub mod token;
pub mod totp;
pub mod vault;

/// AEAD nonce size in bytes (96-bit).
pub const NONCE_SIZE: usize = 12;

/// Poly1305 authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;

/// Vault key size in bytes (256-bit).
pub const KEY_SIZE: usize = 32;

/// PBKDF2 iteration count for master-key derivation and password hashing.
pub const PBKDF2_ROUNDS: u32 = 100_000;

/// Allowed clock skew for signed requests, in seconds.
pub const SIGNATURE_WINDOW_SECS: i64 = 300;

/// Nonce retention: twice the signature validity window.
pub const NONCE_TTL_SECS: u64 = 2 * SIGNATURE_WINDOW_SECS as u64;

pub use hash::{constant_time_eq, hash_password, lookup_hash, verify_password};
pub use signature::RequestSignature;
pub use token::{display_prefix, has_token_prefix, mint_access_token, TOKEN_PREFIX};
pub use totp::{generate_backup_codes, generate_totp_secret, totp_code, verify_totp};
pub use vault::{IntegrityError, VaultCipher};
