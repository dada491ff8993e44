//! Pairwise reward models: scoring backends for [`RewardModelJudge`].
//!
//! A reward model scores every candidate of a prompt jointly and returns one
//! logit per candidate; higher means preferred. Loading is a one-way
//! transition (unloaded -> loaded) performed by a [`RewardModelLoader`]; a
//! failed load yields no model.
//!
//! [`RewardModelJudge`]: crate::judge::RewardModelJudge

pub mod http;

use std::time::Duration;

use async_trait::async_trait;

pub use http::{HttpRewardModel, HttpRewardModelLoader};

pub const DEFAULT_REWARD_MODEL: &str = "llm-blender/PairRM";
pub const DEFAULT_REWARD_MODEL_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum RewardModelError {
    /// Weights are still being fetched or another process holds the cache.
    #[error("reward model {model} is not ready yet: {reason}")]
    Contended { model: String, reason: String },
    #[error("reward model {model} not found")]
    NotFound { model: String },
    #[error("reward model service error (status {status:?}): {message}")]
    Service {
        status: Option<u16>,
        message: String,
    },
    #[error("malformed reward model response: {0}")]
    Malformed(String),
    #[error("reward model configuration error: {0}")]
    Config(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RewardModelError {
    /// Whether a later load attempt may succeed without any change.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Contended { .. } => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::NotFound { .. }
            | Self::Service { .. }
            | Self::Malformed(_)
            | Self::Config(_) => false,
        }
    }
}

/// A loaded pairwise preference model.
#[async_trait]
pub trait RewardModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// One row of logits per prompt, one logit per candidate.
    async fn score_batch(
        &self,
        prompts: &[String],
        candidates: &[Vec<String>],
    ) -> Result<Vec<Vec<f64>>, RewardModelError>;
}

/// Produces a loaded [`RewardModel`] or fails without side effects.
#[async_trait]
pub trait RewardModelLoader: Send + Sync {
    type Model: RewardModel + 'static;

    async fn load(&self) -> Result<Self::Model, RewardModelError>;
}

#[derive(Debug, Clone)]
pub struct RewardModelConfig {
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
    pub token: Option<String>,
}

impl Default for RewardModelConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_REWARD_MODEL_URL.to_string(),
            model: DEFAULT_REWARD_MODEL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            token: None,
        }
    }
}

impl RewardModelConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    /// Reads `REWARD_MODEL_URL`, `REWARD_MODEL_NAME`,
    /// `REWARD_MODEL_TIMEOUT_SECONDS` and `REWARD_MODEL_TOKEN`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("REWARD_MODEL_URL").unwrap_or(defaults.base_url),
            model: std::env::var("REWARD_MODEL_NAME").unwrap_or(defaults.model),
            timeout: std::env::var("REWARD_MODEL_TIMEOUT_SECONDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            token: std::env::var("REWARD_MODEL_TOKEN").ok(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn validate(&self) -> Result<(), RewardModelError> {
        if self.model.trim().is_empty() {
            return Err(RewardModelError::Config("model name cannot be empty".into()));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(RewardModelError::Config(format!(
                "base_url must be http(s), got '{}'",
                self.base_url
            )));
        }
        Ok(())
    }
}
