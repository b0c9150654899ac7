//! # Feen - API-key vault and proxy gateway
//!
//! Multi-tenant vault for upstream AI provider credentials plus the proxy
//! data plane that fronts them. Users deposit provider keys; the gateway
//! stores them encrypted and hands out opaque `feen_` access tokens that
//! downstream clients present in place of the real credential.
//!
//! Each proxied request flows through a fixed pipeline:
//!
//! ```text
//! Client                    Feen Gateway                       Provider
//!    |                          |                                 |
//!    |-- Bearer feen_... ------>| policy -> rate -> route         |
//!    |                          |-- rewritten auth headers ------>|
//!    |<===== streamed body =====|<========= response =============|
//!    |                          | usage queued, counters bumped   |
//! ```
//!
//! ## Modules
//!
//! - [`crypto`]: vault AEAD, hashing, token minting, TOTP, signatures
//! - [`store`]: persistent and fast store adapters (memory/Postgres/Redis)
//! - [`policy`]: shared-token policy evaluation
//! - [`ratelimit`]: fixed-window counters with fail-open semantics
//! - [`router`]: latency-ranked provider candidate selection
//! - [`proxy`]: upstream transport, streaming, usage extraction
//! - [`recorder`]: asynchronous usage persistence
//! - [`guard`]: suspicious-activity tracking and token rotation
//! - [`tasks`]: latency probe, expiry sweep, retention, webhooks
//! - [`server`]: HTTP entry points and process state
//! - [`config`]: configuration management
//! - [`error`]: error taxonomy and canonical error bodies

pub mod config;
pub mod crypto;
pub mod error;
pub mod guard;
pub mod policy;
pub mod providers;
pub mod proxy;
pub mod ratelimit;
pub mod recorder;
pub mod router;
pub mod server;
pub mod store;
pub mod tasks;

// Re-exports for convenience
pub use config::Config;
pub use error::{GatewayError, Result};
pub use providers::Provider;
pub use server::{build_router, AppState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
