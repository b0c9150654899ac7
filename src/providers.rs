//! The closed provider set: base URLs, auth-header contracts, and the
//! static model-to-provider preference table used by the router.
//!
//! The base URLs and header names are wire-compatibility surface; changing
//! any of them is a breaking change for deployed tokens.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Upstream inference providers the gateway can front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Provider {
    Openai,
    Anthropic,
    Google,
    Cohere,
    Mistral,
    Groq,
    Together,
    Replicate,
    Huggingface,
    Bytez,
    AzureOpenai,
    Custom,
}

impl Provider {
    /// All providers, in declaration order.
    pub const ALL: [Provider; 12] = [
        Provider::Openai,
        Provider::Anthropic,
        Provider::Google,
        Provider::Cohere,
        Provider::Mistral,
        Provider::Groq,
        Provider::Together,
        Provider::Replicate,
        Provider::Huggingface,
        Provider::Bytez,
        Provider::AzureOpenai,
        Provider::Custom,
    ];

    /// Canonical tag string (matches the persisted representation).
    pub fn tag(&self) -> &'static str {
        match self {
            Provider::Openai => "OPENAI",
            Provider::Anthropic => "ANTHROPIC",
            Provider::Google => "GOOGLE",
            Provider::Cohere => "COHERE",
            Provider::Mistral => "MISTRAL",
            Provider::Groq => "GROQ",
            Provider::Together => "TOGETHER",
            Provider::Replicate => "REPLICATE",
            Provider::Huggingface => "HUGGINGFACE",
            Provider::Bytez => "BYTEZ",
            Provider::AzureOpenai => "AZURE_OPENAI",
            Provider::Custom => "CUSTOM",
        }
    }

    /// Fixed upstream base URL, or `None` for providers whose endpoint is
    /// configured on the deposited key (Azure OpenAI, custom).
    pub fn base_url(&self) -> Option<&'static str> {
        match self {
            Provider::Openai => Some("https://api.openai.com"),
            Provider::Anthropic => Some("https://api.anthropic.com"),
            Provider::Google => Some("https://generativelanguage.googleapis.com"),
            Provider::Cohere => Some("https://api.cohere.ai"),
            Provider::Mistral => Some("https://api.mistral.ai"),
            Provider::Groq => Some("https://api.groq.com/openai"),
            Provider::Together => Some("https://api.together.xyz"),
            Provider::Replicate => Some("https://api.replicate.com"),
            Provider::Huggingface => Some("https://api-inference.huggingface.co"),
            Provider::Bytez => Some("https://api.bytez.ai/v2"),
            Provider::AzureOpenai | Provider::Custom => None,
        }
    }

    /// Auth headers to set on an upstream request, given the decrypted
    /// credential. Most providers take a bearer; Anthropic wants `x-api-key`
    /// plus a pinned API version.
    pub fn auth_headers(&self, credential: &str) -> Vec<(&'static str, String)> {
        match self {
            Provider::Anthropic => vec![
                ("x-api-key", credential.to_string()),
                ("anthropic-version", "2023-06-01".to_string()),
            ],
            _ => vec![("authorization", format!("Bearer {credential}"))],
        }
    }

    /// Path of the minimal request the latency probe issues.
    pub fn probe_path(&self) -> &'static str {
        match self {
            Provider::Anthropic => "/v1/messages",
            _ => "/v1/chat/completions",
        }
    }

    /// Minimal probe body (`max_tokens = 1`); the chat and messages APIs
    /// happen to agree on this subset.
    pub fn probe_body(&self, model: &str) -> serde_json::Value {
        serde_json::json!({
            "model": model,
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "ping"}],
        })
    }

    /// Default model name used by the latency probe.
    pub fn probe_model(&self) -> &'static str {
        match self {
            Provider::Openai | Provider::AzureOpenai => "gpt-4o-mini",
            Provider::Anthropic => "claude-3-5-haiku-latest",
            Provider::Google => "gemini-1.5-flash",
            Provider::Cohere => "command-r",
            Provider::Mistral => "mistral-small-latest",
            Provider::Groq => "llama-3.1-8b-instant",
            Provider::Together => "meta-llama/Llama-3-8b-chat-hf",
            Provider::Replicate => "meta/meta-llama-3-8b-instruct",
            Provider::Huggingface => "meta-llama/Meta-Llama-3-8B-Instruct",
            Provider::Bytez | Provider::Custom => "gpt-4o-mini",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Provider::ALL
            .iter()
            .copied()
            .find(|p| p.tag().eq_ignore_ascii_case(value))
            .ok_or_else(|| format!("unknown provider: {value}"))
    }
}

/// Preferred providers for a requested model, best-known-home first.
///
/// Exact names are matched first, then well-known family prefixes. An
/// unknown model returns the empty slice and the router falls back to the
/// token's direct key.
pub fn preferred_providers(model: &str) -> &'static [Provider] {
    const OPENAI_FIRST: &[Provider] = &[Provider::Openai, Provider::AzureOpenai];
    const ANTHROPIC_ONLY: &[Provider] = &[Provider::Anthropic];
    const GOOGLE_ONLY: &[Provider] = &[Provider::Google];
    const COHERE_ONLY: &[Provider] = &[Provider::Cohere];
    const MISTRAL_HOMES: &[Provider] = &[Provider::Mistral, Provider::Together, Provider::Groq];
    const LLAMA_HOMES: &[Provider] = &[
        Provider::Together,
        Provider::Groq,
        Provider::Replicate,
        Provider::Huggingface,
    ];

    let model = model.trim();
    let lower = model.to_ascii_lowercase();

    if lower.starts_with("gpt-") || lower.starts_with("o1") || lower.starts_with("o3") {
        return OPENAI_FIRST;
    }
    if lower.starts_with("claude") {
        return ANTHROPIC_ONLY;
    }
    if lower.starts_with("gemini") {
        return GOOGLE_ONLY;
    }
    if lower.starts_with("command") {
        return COHERE_ONLY;
    }
    if lower.starts_with("mistral") || lower.starts_with("mixtral") || lower.starts_with("codestral")
    {
        return MISTRAL_HOMES;
    }
    if lower.contains("llama") {
        return LLAMA_HOMES;
    }
    &[]
}
