//! Usage tracking via the UsageSink trait.
//!
//! Every gateway call, successful or not, produces one `ProviderCallRecord`.
//! Judges stay storage-agnostic: the CLI writes records to stderr, tests
//! discard them or collect them in memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
        }
    }
}

/// Record of a provider API call.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderCallRecord {
    pub provider: &'static str,
    pub endpoint: &'static str,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_ms: u64,
    /// 1-based attempt number within the gateway retry loop.
    pub attempt: u32,
    pub status: CallStatus,
    pub error_code: Option<String>,
    pub caller: &'static str,
    pub request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    pub fn new(
        provider: &'static str,
        endpoint: &'static str,
        model: impl Into<String>,
        caller: &'static str,
    ) -> Self {
        Self {
            provider,
            endpoint,
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            latency_ms: 0,
            attempt: 1,
            status: CallStatus::Success,
            error_code: None,
            caller,
            request_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn tokens(mut self, input: u32, output: u32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn error(mut self, code: impl Into<String>) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code.into());
        self
    }

    pub fn request_id(mut self, id: Option<String>) -> Self {
        self.request_id = id;
        self
    }
}

/// Trait for recording provider call usage.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Fire-and-forget: failures should be logged, not propagated.
    async fn record(&self, record: ProviderCallRecord);
}

/// Discards all records.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// Writes each record to stderr as one JSON line.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrUsageSink;

#[async_trait]
impl UsageSink for StderrUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        match serde_json::to_string(&record) {
            Ok(line) => eprintln!("{line}"),
            Err(err) => tracing::warn!(error = %err, "failed to serialize usage record"),
        }
    }
}
