//! Adapter for OpenAI-compatible `/chat/completions` endpoints.
//!
//! Hugging Face Inference, OpenAI and OpenRouter all speak this dialect; they
//! differ only in base URL and credential.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::types::*;

// =============================================================================
// TRAIT
// =============================================================================

/// Trait for chat completion providers.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

// =============================================================================
// CONFIG
// =============================================================================

/// Maximum allowed response body (1MB).
const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

/// Maximum allowed input characters (~125k tokens).
const MAX_INPUT_CHARS: usize = 500_000;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Connection settings for one provider.
#[derive(Debug, Clone)]
pub struct ChatEndpointConfig {
    pub provider: Provider,
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl ChatEndpointConfig {
    pub fn new(provider: Provider, api_key: impl Into<String>) -> Self {
        Self {
            provider,
            api_key: api_key.into(),
            base_url: provider.default_base_url().to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Read credential, base URL and timeout from the environment.
    ///
    /// `CHAT_TIMEOUT_SECONDS` applies to every provider.
    pub fn from_env(provider: Provider) -> Result<Self, ProviderError> {
        let key_var = provider.api_key_env();
        let api_key = std::env::var(key_var)
            .map_err(|_| ProviderError::config(format!("{key_var} not set")))?;

        let base_url = std::env::var(provider.base_url_env())
            .unwrap_or_else(|_| provider.default_base_url().to_string());

        let timeout = std::env::var("CHAT_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        Ok(Self {
            provider,
            api_key,
            base_url,
            timeout,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// =============================================================================
// ADAPTER
// =============================================================================

#[derive(Debug, Clone)]
pub struct ChatCompletionsAdapter {
    client: reqwest::Client,
    provider: Provider,
    base_url: String,
    timeout: Duration,
}

impl ChatCompletionsAdapter {
    pub fn new(config: ChatEndpointConfig) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth_value = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|_| ProviderError::config("Invalid API key format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            provider: config.provider,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.timeout,
        })
    }

    pub fn from_env(provider: Provider) -> Result<Self, ProviderError> {
        Self::new(ChatEndpointConfig::from_env(provider)?)
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn extract_request_id(headers: &HeaderMap) -> Option<String> {
        headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    /// `Retry-After` in delta-seconds form; HTTP dates are ignored.
    fn extract_retry_after(headers: &HeaderMap) -> Option<Duration> {
        headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    logprobs: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_logprobs: Option<u32>,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Option<Vec<Choice>>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
    #[serde(default)]
    logprobs: Option<ChoiceLogprobs>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceLogprobs {
    #[serde(default)]
    content: Option<Vec<ApiTokenLogprob>>,
}

#[derive(Deserialize)]
struct ApiTokenLogprob {
    token: String,
    logprob: f64,
    #[serde(default)]
    top_logprobs: Vec<ApiTopLogprob>,
}

#[derive(Deserialize)]
struct ApiTopLogprob {
    token: String,
    logprob: f64,
}

impl From<ApiTokenLogprob> for TokenLogprob {
    fn from(t: ApiTokenLogprob) -> Self {
        Self {
            token: t.token,
            logprob: t.logprob,
            top_alternatives: t
                .top_logprobs
                .into_iter()
                .map(|alt| TokenAlternative {
                    token: alt.token,
                    logprob: alt.logprob,
                })
                .collect(),
        }
    }
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

/// Providers disagree on whether `error` is an object or a bare string.
#[derive(Deserialize)]
#[serde(untagged)]
enum ApiError {
    Detailed {
        message: Option<String>,
        code: Option<serde_json::Value>,
    },
    Plain(String),
}

impl ApiError {
    fn message(&self) -> String {
        match self {
            ApiError::Detailed { message, .. } => message.clone().unwrap_or_default(),
            ApiError::Plain(s) => s.clone(),
        }
    }

    fn code(&self) -> Option<String> {
        match self {
            ApiError::Detailed {
                code: Some(serde_json::Value::String(s)),
                ..
            } => Some(s.clone()),
            ApiError::Detailed {
                code: Some(other), ..
            } if !other.is_null() => Some(other.to_string()),
            _ => None,
        }
    }
}

// =============================================================================
// CHAT PROVIDER IMPL
// =============================================================================

#[async_trait]
impl ChatProvider for ChatCompletionsAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let provider = self.provider.as_str();
        let total_chars: usize = req.messages.iter().map(|m| m.content.len()).sum();

        if total_chars > MAX_INPUT_CHARS {
            return Err(ProviderError::invalid_request(format!(
                "Input too large: {total_chars} chars (max {MAX_INPUT_CHARS})"
            )));
        }

        let start = Instant::now();

        let api_req = ChatApiRequest {
            model: req.model.model_id(),
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            logprobs: req.logprobs,
            top_logprobs: if req.logprobs { req.top_logprobs } else { None },
        };

        let mut response = self
            .client
            .post(self.chat_url())
            .json(&api_req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(self.timeout, None)
                } else {
                    ProviderError::Http(e)
                }
            })?;

        let status = response.status();
        let request_id = Self::extract_request_id(response.headers());
        let retry_after = Self::extract_retry_after(response.headers());

        // Stream response to enforce size limit
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let new_len = bytes.len() + chunk.len();
            if new_len > MAX_RESPONSE_LEN {
                return Err(ProviderError::provider(
                    provider,
                    format!("Response too large: {new_len} bytes"),
                    false,
                ));
            }
            bytes.extend_from_slice(&chunk);
        }

        let body = String::from_utf8_lossy(&bytes).to_string();

        let ctx = ErrorContext::new().with_status(status.as_u16());
        let ctx = match &request_id {
            Some(id) => ctx.with_request_id(id),
            None => ctx,
        };

        if !status.is_success() {
            let parsed_error = serde_json::from_str::<ChatApiResponse>(&body)
                .ok()
                .and_then(|p| p.error);
            let (message, ctx) = match parsed_error {
                Some(error) => {
                    let ctx = match error.code() {
                        Some(code) => ctx.with_code(code),
                        None => ctx,
                    };
                    (error.message(), ctx)
                }
                None => (format!("HTTP {}", status.as_u16()), ctx),
            };

            return Err(match status.as_u16() {
                429 => ProviderError::rate_limited(retry_after, ctx),
                401 | 403 => ProviderError::unauthorized(provider, message),
                400 | 413 | 422 => ProviderError::InvalidRequest {
                    message,
                    context: Some(ctx),
                },
                code => ProviderError::provider_with_context(provider, message, code >= 500, ctx),
            });
        }

        let parsed: ChatApiResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::provider(provider, format!("Invalid JSON: {e}"), false))?;

        if let Some(error) = parsed.error {
            return Err(ProviderError::provider(provider, error.message(), false));
        }

        let choice = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| ProviderError::provider(provider, "No choices in response", false))?;

        let content = choice
            .message
            .and_then(|m| m.content)
            .unwrap_or_default();

        let output_logprobs = choice
            .logprobs
            .and_then(|lp| lp.content)
            .map(|tokens| tokens.into_iter().map(TokenLogprob::from).collect());

        // Some inference servers omit usage entirely.
        let (input_tokens, output_tokens) = parsed
            .usage
            .map(|u| (u.prompt_tokens.unwrap_or(0), u.completion_tokens.unwrap_or(0)))
            .unwrap_or((0, 0));

        Ok(ChatResponse {
            content,
            input_tokens,
            output_tokens,
            latency: start.elapsed(),
            finish_reason: FinishReason::from(choice.finish_reason),
            output_logprobs,
        })
    }
}
