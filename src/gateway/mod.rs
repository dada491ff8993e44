//! Chat gateway: retrying transport over OpenAI-compatible providers.

pub mod chat_completions;
pub mod error;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use chat_completions::{ChatCompletionsAdapter, ChatProvider};
use usage::{CallStatus, ProviderCallRecord};

pub use chat_completions::ChatEndpointConfig;
pub use error::{ErrorContext, ProviderError};
pub use types::*;
pub use usage::{NoopUsageSink, StderrUsageSink, UsageSink};

/// What judges talk to. Lets tests substitute a scripted gateway.
#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Upper bound on any single wait, including server `Retry-After`.
    pub max_retry_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
        }
    }
}

impl GatewayConfig {
    /// `GATEWAY_MAX_RETRIES` and `GATEWAY_RETRY_BASE_DELAY_MS` override defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_retries = std::env::var("GATEWAY_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_retries);
        let retry_base_delay = std::env::var("GATEWAY_RETRY_BASE_DELAY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_base_delay);
        Self {
            max_retries,
            retry_base_delay,
            ..defaults
        }
    }
}

pub struct ProviderGateway<U: UsageSink, P: ChatProvider = ChatCompletionsAdapter> {
    provider: P,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<U: UsageSink, P: ChatProvider> ChatGateway for ProviderGateway<U, P> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl<U: UsageSink> ProviderGateway<U, ChatCompletionsAdapter> {
    pub fn from_env(provider: Provider, usage_sink: Arc<U>) -> Result<Self, ProviderError> {
        let adapter = ChatCompletionsAdapter::from_env(provider)?;
        Ok(Self::with_config(adapter, usage_sink, GatewayConfig::from_env()))
    }
}

impl<U: UsageSink, P: ChatProvider> ProviderGateway<U, P> {
    pub fn with_config(provider: P, usage_sink: Arc<U>, config: GatewayConfig) -> Self {
        Self {
            provider,
            usage_sink,
            config,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..=self.config.max_retries {
            match self.provider.chat(&req).await {
                Ok(resp) => {
                    self.record_usage(&req, &resp, attempt, CallStatus::Success, None)
                        .await;
                    return Ok(resp);
                }
                Err(err) => {
                    let code = err.code().to_string();
                    self.record_usage(
                        &req,
                        &ChatResponse::empty(),
                        attempt,
                        CallStatus::Error,
                        Some((code, err.request_id().map(str::to_string))),
                    )
                    .await;

                    if !err.is_retryable() || attempt == self.config.max_retries {
                        return Err(err);
                    }

                    let delay = err
                        .retry_after()
                        .unwrap_or_else(|| backoff_delay(self.config.retry_base_delay, attempt))
                        .min(self.config.max_retry_delay);
                    warn!(
                        model = req.model.model_id(),
                        attempt = attempt + 1,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "chat call failed; retrying"
                    );
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ProviderError::provider(req.model.provider(), "unknown error", false)
        }))
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        resp: &ChatResponse,
        attempt: u32,
        status: CallStatus,
        error: Option<(String, Option<String>)>,
    ) {
        let record = ProviderCallRecord::new(
            req.model.provider(),
            "chat/completions",
            req.model.model_id(),
            req.attribution.caller,
        )
        .tokens(resp.input_tokens, resp.output_tokens)
        .latency(resp.latency.as_millis() as u64)
        .attempt(attempt + 1);

        let record = match (status, error) {
            (CallStatus::Error, Some((code, request_id))) => {
                record.error(code).request_id(request_id)
            }
            (CallStatus::Error, None) => record.error("provider_error"),
            (CallStatus::Success, _) => record,
        };

        debug!(
            provider = record.provider,
            model = %record.model,
            status = record.status.as_str(),
            "recording provider call"
        );
        self.usage_sink.record(record).await;
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u32.pow(attempt.min(5));
    base * multiplier
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_exponent() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 5), Duration::from_millis(3_200));
        assert_eq!(backoff_delay(base, 9), Duration::from_millis(3_200));
    }
}
