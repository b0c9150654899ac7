//! Upstream proxy transport and usage extraction.

pub mod transport;
pub mod usage;

pub use transport::{ForwardRequest, UpstreamTransport, UPSTREAM_HEADER_TIMEOUT};
pub use usage::{TokenUsage, USAGE_SCAN_LIMIT};
