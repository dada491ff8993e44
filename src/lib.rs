#![forbid(unsafe_code)]

//! # pairwise-judges
//!
//! Judges decide which of several candidate completions best answers a
//! prompt. Preference-based fine-tuning loops use them to label rollouts.
//!
//! Four strategies share one async [`Judge`] trait:
//! - [`RandomPairwiseJudge`] and [`RandomRankJudge`] for baselines and tests,
//! - [`LlmPairwiseJudge`] asks a chat model over an OpenAI-compatible API,
//! - [`RewardModelJudge`] scores pairs with a preference reward model.
//!
//! Reward models can be slow to come up. Wrap their construction in
//! [`retry::load_with_retry`].

pub mod cache;
pub mod gateway;
pub mod judge;
pub mod prompts;
pub mod retry;
pub mod reward;

pub use cache::{SqliteVerdictCache, VerdictCache, VerdictCacheKey};
pub use gateway::{Attribution, ChatGateway, Provider, ProviderGateway, UsageSink};
pub use judge::{
    validate_batch, Judge, JudgeError, Judgment, LlmJudgeConfig, LlmPairwiseJudge,
    RandomPairwiseJudge, RandomRankJudge, RewardModelJudge, RewardModelJudgeConfig,
};
pub use retry::{load_with_retry, LoadRetryPolicy, TransientError};
pub use reward::{
    HttpRewardModel, HttpRewardModelLoader, RewardModel, RewardModelConfig, RewardModelError,
    RewardModelLoader,
};
