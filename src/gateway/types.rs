//! Core types for the chat gateway.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// ATTRIBUTION
// =============================================================================

/// Attribution carried by every gateway request.
///
/// `caller` names the code path that issued the call, e.g. `"judge::llm"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Attribution {
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self { caller }
    }
}

// =============================================================================
// PROVIDERS
// =============================================================================

/// Hosted chat-completions providers with an OpenAI-compatible API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    HuggingFace,
    OpenAI,
    OpenRouter,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::HuggingFace => "huggingface",
            Provider::OpenAI => "openai",
            Provider::OpenRouter => "openrouter",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Provider::HuggingFace => "https://router.huggingface.co/v1",
            Provider::OpenAI => "https://api.openai.com/v1",
            Provider::OpenRouter => "https://openrouter.ai/api/v1",
        }
    }

    /// Environment variable holding the API credential.
    pub fn api_key_env(&self) -> &'static str {
        match self {
            Provider::HuggingFace => "HF_TOKEN",
            Provider::OpenAI => "OPENAI_API_KEY",
            Provider::OpenRouter => "OPENROUTER_API_KEY",
        }
    }

    /// Environment variable overriding the base URL.
    pub fn base_url_env(&self) -> &'static str {
        match self {
            Provider::HuggingFace => "HF_BASE_URL",
            Provider::OpenAI => "OPENAI_BASE_URL",
            Provider::OpenRouter => "OPENROUTER_BASE_URL",
        }
    }
}

// =============================================================================
// CHAT TYPES
// =============================================================================

/// Chat message role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Model served by a provider, e.g. `gpt-4-turbo-preview` on OpenAI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatModel {
    pub provider: Provider,
    pub model_id: String,
}

impl ChatModel {
    pub fn new(provider: Provider, model_id: impl Into<String>) -> Self {
        Self {
            provider,
            model_id: model_id.into(),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn provider(&self) -> &'static str {
        self.provider.as_str()
    }
}

/// Request for chat completion.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: ChatModel,
    pub messages: Vec<Message>,
    /// Sampling temperature (0.0 - 2.0).
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub attribution: Attribution,
    /// Whether to request token-level logprobs in the response.
    pub logprobs: bool,
    /// Number of top alternative logprobs per token position.
    pub top_logprobs: Option<u32>,
}

impl ChatRequest {
    pub fn new(model: ChatModel, messages: Vec<Message>, attribution: Attribution) -> Self {
        Self {
            model,
            messages,
            temperature: 0.0,
            max_tokens: None,
            attribution,
            logprobs: false,
            top_logprobs: None,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// Request token-level logprobs with the specified number of alternatives.
    pub fn with_logprobs(mut self, top_n: u32) -> Self {
        self.logprobs = true;
        self.top_logprobs = Some(top_n);
        self
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Unknown(String),
}

impl From<Option<String>> for FinishReason {
    fn from(s: Option<String>) -> Self {
        match s.as_deref() {
            Some("stop") | Some("eos_token") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            Some(other) => FinishReason::Unknown(other.to_string()),
            None => FinishReason::Unknown("none".to_string()),
        }
    }
}

/// A single token's logprob entry with alternatives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenLogprob {
    pub token: String,
    pub logprob: f64,
    pub top_alternatives: Vec<TokenAlternative>,
}

/// An alternative token at a given position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenAlternative {
    pub token: String,
    pub logprob: f64,
}

/// Response from chat completion.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency: Duration,
    pub finish_reason: FinishReason,
    /// Per-token logprobs for the output, if requested and returned.
    pub output_logprobs: Option<Vec<TokenLogprob>>,
}

impl ChatResponse {
    pub(crate) fn empty() -> Self {
        Self {
            content: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            latency: Duration::from_millis(0),
            finish_reason: FinishReason::Unknown("error".to_string()),
            output_logprobs: None,
        }
    }
}
