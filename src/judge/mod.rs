//! Judges: rank or compare candidate completions for a batch of prompts.
//!
//! Every strategy implements [`Judge`]. A call takes one completion set per
//! prompt and returns exactly one [`Judgment`] per prompt, in input order.
//!
//! | judge                 | discrete output      | `return_scores` |
//! |-----------------------|----------------------|-----------------|
//! | [`RandomPairwiseJudge`] | `Winner`           | uniform `Score` |
//! | [`RandomRankJudge`]     | `Ranking`          | unsupported     |
//! | [`LlmPairwiseJudge`]    | `Winner`           | logprob `Score` |
//! | [`RewardModelJudge`]    | `Winner`           | softmax `Score` |

pub mod llm;
pub mod random;
pub mod reward_model;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::gateway::ProviderError;
use crate::reward::RewardModelError;

pub use llm::{LlmJudgeConfig, LlmPairwiseJudge};
pub use random::{RandomPairwiseJudge, RandomRankJudge};
pub use reward_model::{RewardModelJudge, RewardModelJudgeConfig};

/// One judge verdict for one prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Judgment {
    /// Index of the preferred completion.
    Winner(usize),
    /// Permutation of completion indices, best first.
    Ranking(Vec<usize>),
    /// Probability in `[0, 1]` that the first completion beats the second.
    Score(f64),
}

impl Judgment {
    pub fn as_winner(&self) -> Option<usize> {
        match self {
            Judgment::Winner(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_ranking(&self) -> Option<&[usize]> {
        match self {
            Judgment::Ranking(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_score(&self) -> Option<f64> {
        match self {
            Judgment::Score(p) => Some(*p),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("invalid input shape: {0}")]
    InputShape(String),
    #[error("{judge} does not support {mode}")]
    UnsupportedMode {
        judge: &'static str,
        mode: &'static str,
    },
    #[error("request budget exhausted: at most {max_requests} requests per judge")]
    RequestBudgetExhausted { max_requests: usize },
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("reward model error: {0}")]
    RewardModel(#[from] RewardModelError),
    #[error("external service error: {0}")]
    ExternalService(String),
    #[error("invalid judge configuration: {0}")]
    Config(String),
}

impl JudgeError {
    pub fn scores_unsupported(judge: &'static str) -> Self {
        Self::UnsupportedMode {
            judge,
            mode: "return_scores",
        }
    }

    /// Failures of the backing API or model, as opposed to caller mistakes.
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            Self::Provider(_) | Self::RewardModel(_) | Self::ExternalService(_)
        )
    }
}

/// Ranks or compares completions for a batch of prompts.
#[async_trait]
pub trait Judge: Send + Sync {
    /// Short stable identifier, e.g. `"random_pairwise"`.
    fn name(&self) -> &'static str;

    /// Judge each completion set against its prompt.
    ///
    /// `return_scores` asks pairwise judges for a preference probability
    /// instead of a winner index.
    async fn judge(
        &self,
        prompts: &[String],
        completions: &[Vec<String>],
        return_scores: bool,
    ) -> Result<Vec<Judgment>, JudgeError>;
}

/// Shared precondition check for every judge.
///
/// `exact_pair` additionally requires exactly two completions per prompt.
pub fn validate_batch(
    prompts: &[String],
    completions: &[Vec<String>],
    exact_pair: bool,
) -> Result<(), JudgeError> {
    if prompts.len() != completions.len() {
        return Err(JudgeError::InputShape(format!(
            "{} prompts but {} completion sets",
            prompts.len(),
            completions.len()
        )));
    }
    for (idx, set) in completions.iter().enumerate() {
        if set.len() < 2 {
            return Err(JudgeError::InputShape(format!(
                "completion set {idx} has {} entries; at least 2 required",
                set.len()
            )));
        }
        if exact_pair && set.len() != 2 {
            return Err(JudgeError::InputShape(format!(
                "completion set {idx} has {} entries; pairwise judges need exactly 2",
                set.len()
            )));
        }
    }
    Ok(())
}

/// Seeded when a seed is given, OS entropy otherwise.
pub(crate) fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}
