//! Random baselines. No skill; they validate plumbing and interface shape.

use std::sync::Mutex;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

use super::{make_rng, validate_batch, Judge, JudgeError, Judgment};

fn lock_rng(rng: &Mutex<StdRng>) -> std::sync::MutexGuard<'_, StdRng> {
    // Poisoning is harmless for an RNG.
    rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Picks a uniform winner (or a uniform score) per prompt.
#[derive(Debug)]
pub struct RandomPairwiseJudge {
    rng: Mutex<StdRng>,
}

impl RandomPairwiseJudge {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(make_rng(None)),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(make_rng(Some(seed))),
        }
    }

    pub fn with_rng(rng: StdRng) -> Self {
        Self {
            rng: Mutex::new(rng),
        }
    }
}

impl Default for RandomPairwiseJudge {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Judge for RandomPairwiseJudge {
    fn name(&self) -> &'static str {
        "random_pairwise"
    }

    async fn judge(
        &self,
        prompts: &[String],
        completions: &[Vec<String>],
        return_scores: bool,
    ) -> Result<Vec<Judgment>, JudgeError> {
        validate_batch(prompts, completions, false)?;
        let mut rng = lock_rng(&self.rng);
        Ok(completions
            .iter()
            .map(|set| {
                if return_scores {
                    Judgment::Score(rng.gen_range(0.0..=1.0))
                } else {
                    Judgment::Winner(rng.gen_range(0..set.len()))
                }
            })
            .collect())
    }
}

/// Returns a uniformly random permutation per prompt.
#[derive(Debug)]
pub struct RandomRankJudge {
    rng: Mutex<StdRng>,
}

impl RandomRankJudge {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(make_rng(None)),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(make_rng(Some(seed))),
        }
    }

    pub fn with_rng(rng: StdRng) -> Self {
        Self {
            rng: Mutex::new(rng),
        }
    }
}

impl Default for RandomRankJudge {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Judge for RandomRankJudge {
    fn name(&self) -> &'static str {
        "random_rank"
    }

    async fn judge(
        &self,
        prompts: &[String],
        completions: &[Vec<String>],
        return_scores: bool,
    ) -> Result<Vec<Judgment>, JudgeError> {
        if return_scores {
            return Err(JudgeError::scores_unsupported(self.name()));
        }
        validate_batch(prompts, completions, false)?;
        let mut rng = lock_rng(&self.rng);
        Ok(completions
            .iter()
            .map(|set| {
                let mut order: Vec<usize> = (0..set.len()).collect();
                order.shuffle(&mut *rng);
                Judgment::Ranking(order)
            })
            .collect())
    }
}
