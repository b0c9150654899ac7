//! Token-usage extraction from upstream response bodies.
//!
//! Only a bounded prefix of the body is ever inspected, and only when the
//! response is JSON. Two shapes are recognized:
//! `{usage:{prompt_tokens,completion_tokens,total_tokens}}` (OpenAI-style)
//! and `{usage:{input_tokens,output_tokens}}` (Anthropic-style).

use serde_json::Value;

/// Largest body prefix the extractor will buffer.
pub const USAGE_SCAN_LIMIT: usize = 1024 * 1024;

/// Extracted usage counts. All fields optional; `total` defaults to the sum
/// when both components are present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub request_tokens: Option<u64>,
    pub response_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

impl TokenUsage {
    /// Parse a buffered JSON body. Returns `None` when the body is not
    /// JSON or carries no usage block.
    pub fn from_body(body: &[u8]) -> Option<Self> {
        let value: Value = serde_json::from_slice(body).ok()?;
        let usage = value.get("usage")?;

        let request_tokens = usage
            .get("prompt_tokens")
            .or_else(|| usage.get("input_tokens"))
            .and_then(Value::as_u64);
        let response_tokens = usage
            .get("completion_tokens")
            .or_else(|| usage.get("output_tokens"))
            .and_then(Value::as_u64);
        let total_tokens = usage.get("total_tokens").and_then(Value::as_u64).or_else(|| {
            match (request_tokens, response_tokens) {
                (Some(req), Some(resp)) => Some(req + resp),
                _ => None,
            }
        });

        if request_tokens.is_none() && response_tokens.is_none() && total_tokens.is_none() {
            return None;
        }
        Some(Self {
            request_tokens,
            response_tokens,
            total_tokens,
        })
    }
}

/// Whether a response content type is worth scanning for usage.
pub fn is_json_content(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| {
        let ct = ct.to_ascii_lowercase();
        ct.starts_with("application/json") || ct.starts_with("application/problem+json")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_shape() {
        let body = br#"{"id":"cmpl-1","usage":{"prompt_tokens":10,"completion_tokens":20,"total_tokens":30}}"#;
        let usage = TokenUsage::from_body(body).unwrap();
        assert_eq!(usage.request_tokens, Some(10));
        assert_eq!(usage.response_tokens, Some(20));
        assert_eq!(usage.total_tokens, Some(30));
    }

    #[test]
    fn test_anthropic_shape_sums_total() {
        let body = br#"{"id":"msg-1","usage":{"input_tokens":7,"output_tokens":5}}"#;
        let usage = TokenUsage::from_body(body).unwrap();
        assert_eq!(usage.request_tokens, Some(7));
        assert_eq!(usage.response_tokens, Some(5));
        assert_eq!(usage.total_tokens, Some(12));
    }

    #[test]
    fn test_no_usage_block() {
        assert_eq!(TokenUsage::from_body(br#"{"id":"x"}"#), None);
        assert_eq!(TokenUsage::from_body(b"not json"), None);
        assert_eq!(TokenUsage::from_body(br#"{"usage":{}}"#), None);
    }

    #[test]
    fn test_partial_usage() {
        let usage = TokenUsage::from_body(br#"{"usage":{"prompt_tokens":3}}"#).unwrap();
        assert_eq!(usage.request_tokens, Some(3));
        assert_eq!(usage.response_tokens, None);
        assert_eq!(usage.total_tokens, None);
    }

    #[test]
    fn test_explicit_total_wins() {
        let body = br#"{"usage":{"prompt_tokens":1,"completion_tokens":2,"total_tokens":100}}"#;
        assert_eq!(TokenUsage::from_body(body).unwrap().total_tokens, Some(100));
    }

    #[test]
    fn test_is_json_content() {
        assert!(is_json_content(Some("application/json")));
        assert!(is_json_content(Some("application/json; charset=utf-8")));
        assert!(!is_json_content(Some("text/event-stream")));
        assert!(!is_json_content(None));
    }
}
