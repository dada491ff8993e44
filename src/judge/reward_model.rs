//! Pairwise judge backed by a reward model.

use std::sync::Mutex;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::Rng;
use tracing::debug;

use crate::reward::{RewardModel, RewardModelError, RewardModelLoader};

use super::{make_rng, validate_batch, Judge, JudgeError, Judgment};

#[derive(Debug, Clone)]
pub struct RewardModelJudgeConfig {
    /// Softmax temperature for scored mode. Must be positive.
    pub temperature: f64,
    /// Present each pair in random order to cancel position bias.
    pub shuffle_order: bool,
    pub seed: Option<u64>,
}

impl Default for RewardModelJudgeConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            shuffle_order: false,
            seed: None,
        }
    }
}

pub struct RewardModelJudge<M: RewardModel> {
    model: M,
    config: RewardModelJudgeConfig,
    rng: Mutex<StdRng>,
}

impl<M: RewardModel> std::fmt::Debug for RewardModelJudge<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RewardModelJudge")
            .field("model", &self.model.model_name())
            .field("config", &self.config)
            .finish()
    }
}

impl<M: RewardModel> RewardModelJudge<M> {
    pub fn new(model: M, config: RewardModelJudgeConfig) -> Result<Self, RewardModelError> {
        if !(config.temperature.is_finite() && config.temperature > 0.0) {
            return Err(RewardModelError::Config(format!(
                "temperature must be positive, got {}",
                config.temperature
            )));
        }
        let rng = Mutex::new(make_rng(config.seed));
        Ok(Self { model, config, rng })
    }

    /// Load the model once and wrap it. No retry happens here.
    pub async fn load<L>(loader: &L, config: RewardModelJudgeConfig) -> Result<Self, RewardModelError>
    where
        L: RewardModelLoader<Model = M>,
    {
        let model = loader.load().await?;
        Self::new(model, config)
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    fn draw_flips(&self, n: usize) -> Vec<bool> {
        if !self.config.shuffle_order {
            return vec![false; n];
        }
        let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
        (0..n).map(|_| rng.gen_bool(0.5)).collect()
    }
}

/// Index of the largest logit; ties go to the lower index.
fn argmax(logits: &[f64]) -> usize {
    logits
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(best, best_val), (i, &v)| {
            if v > best_val {
                (i, v)
            } else {
                (best, best_val)
            }
        })
        .0
}

/// Probability of the first candidate under a temperature softmax.
fn first_preference(logits: &[f64], temperature: f64) -> f64 {
    let scaled: Vec<f64> = logits.iter().map(|l| l / temperature).collect();
    let max = scaled.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scaled.iter().map(|s| (s - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    (exps[0] / total).clamp(0.0, 1.0)
}

#[async_trait]
impl<M: RewardModel> Judge for RewardModelJudge<M> {
    fn name(&self) -> &'static str {
        "reward_model"
    }

    async fn judge(
        &self,
        prompts: &[String],
        completions: &[Vec<String>],
        return_scores: bool,
    ) -> Result<Vec<Judgment>, JudgeError> {
        validate_batch(prompts, completions, true)?;
        if prompts.is_empty() {
            return Ok(Vec::new());
        }

        let flips = self.draw_flips(completions.len());
        let ordered: Vec<Vec<String>> = completions
            .iter()
            .zip(&flips)
            .map(|(set, &flip)| {
                if flip {
                    vec![set[1].clone(), set[0].clone()]
                } else {
                    set.clone()
                }
            })
            .collect();

        let logits = self.model.score_batch(prompts, &ordered).await?;
        if logits.len() != prompts.len() {
            return Err(JudgeError::ExternalService(format!(
                "reward model returned {} rows for {} prompts",
                logits.len(),
                prompts.len()
            )));
        }

        let mut judgments = Vec::with_capacity(logits.len());
        for (idx, (mut row, flip)) in logits.into_iter().zip(flips).enumerate() {
            if row.len() != 2 || row.iter().any(|l| !l.is_finite()) {
                return Err(JudgeError::ExternalService(format!(
                    "reward model returned invalid logits for prompt {idx}: {row:?}"
                )));
            }
            if flip {
                row.swap(0, 1);
            }
            judgments.push(if return_scores {
                Judgment::Score(first_preference(&row, self.config.temperature))
            } else {
                Judgment::Winner(argmax(&row))
            });
        }

        debug!(
            model = self.model.model_name(),
            batch = judgments.len(),
            return_scores,
            "reward model judged batch"
        );
        Ok(judgments)
    }
}
