//! Pairwise judge that asks a chat model which completion is better.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use rand::rngs::StdRng;
use rand::Rng;
use tracing::{debug, warn};

use crate::cache::{CachedVerdict, VerdictCache, VerdictCacheKey};
use crate::gateway::{
    Attribution, ChatGateway, ChatModel, ChatRequest, ChatResponse, NoopUsageSink, Provider,
    ProviderGateway, UsageSink,
};
use crate::prompts::{PromptTemplate, DEFAULT_PROMPT};

use super::{make_rng, validate_batch, Judge, JudgeError, Judgment};

pub const DEFAULT_HF_MODEL: &str = "meta-llama/Meta-Llama-3-70B-Instruct";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4-turbo-preview";

const TOP_LOGPROBS: u32 = 20;

#[derive(Debug, Clone)]
pub struct LlmJudgeConfig {
    pub model: ChatModel,
    pub template: PromptTemplate,
    /// Present each pair in random order and map the verdict back.
    pub shuffle_order: bool,
    pub seed: Option<u64>,
    /// Lifetime cap on API calls made by one judge instance.
    pub max_requests: usize,
    pub max_concurrency: usize,
    /// Reply length for discrete verdicts. Scored mode always asks for one token.
    pub max_tokens: u32,
    pub temperature: f32,
}

impl LlmJudgeConfig {
    pub fn new(model: ChatModel) -> Self {
        Self {
            model,
            template: DEFAULT_PROMPT,
            shuffle_order: true,
            seed: None,
            max_requests: 1000,
            max_concurrency: 8,
            max_tokens: 1,
            temperature: 0.0,
        }
    }
}

pub struct LlmPairwiseJudge {
    gateway: Arc<dyn ChatGateway>,
    config: LlmJudgeConfig,
    cache: Option<Arc<dyn VerdictCache>>,
    requests: AtomicUsize,
    rng: Mutex<StdRng>,
}

impl std::fmt::Debug for LlmPairwiseJudge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmPairwiseJudge")
            .field("config", &self.config)
            .field("cached", &self.cache.is_some())
            .field("requests", &self.requests.load(Ordering::Relaxed))
            .finish()
    }
}

impl LlmPairwiseJudge {
    pub fn new(gateway: Arc<dyn ChatGateway>, config: LlmJudgeConfig) -> Self {
        let rng = Mutex::new(make_rng(config.seed));
        Self {
            gateway,
            config,
            cache: None,
            requests: AtomicUsize::new(0),
            rng,
        }
    }

    /// Judge over `provider`, with credentials and endpoint read from the environment.
    pub fn from_provider(provider: Provider, model_id: impl Into<String>) -> Result<Self, JudgeError> {
        Self::from_provider_with_sink(provider, model_id, Arc::new(NoopUsageSink))
    }

    pub fn from_provider_with_sink<U: UsageSink + 'static>(
        provider: Provider,
        model_id: impl Into<String>,
        usage_sink: Arc<U>,
    ) -> Result<Self, JudgeError> {
        let gateway = ProviderGateway::from_env(provider, usage_sink)?;
        let config = LlmJudgeConfig::new(ChatModel::new(provider, model_id));
        Ok(Self::new(Arc::new(gateway), config))
    }

    /// Hugging Face inference router; needs `HF_TOKEN`.
    pub fn hugging_face() -> Result<Self, JudgeError> {
        Self::from_provider(Provider::HuggingFace, DEFAULT_HF_MODEL)
    }

    /// Needs `OPENAI_API_KEY`.
    pub fn openai() -> Result<Self, JudgeError> {
        Self::from_provider(Provider::OpenAI, DEFAULT_OPENAI_MODEL)
    }

    /// Needs `OPENROUTER_API_KEY`.
    pub fn openrouter(model_id: impl Into<String>) -> Result<Self, JudgeError> {
        Self::from_provider(Provider::OpenRouter, model_id)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self.rng = Mutex::new(make_rng(Some(seed)));
        self
    }

    pub fn with_template(mut self, template: PromptTemplate) -> Self {
        self.config.template = template;
        self
    }

    /// Replace the judging prompt with a single-message template.
    ///
    /// The text must contain `{prompt}`, `{response0}` and `{response1}`.
    pub fn with_system_prompt(self, prompt: impl Into<String>) -> Result<Self, JudgeError> {
        let template =
            PromptTemplate::custom("custom", "", prompt).map_err(JudgeError::Config)?;
        Ok(self.with_template(template))
    }

    pub fn with_cache(mut self, cache: Arc<dyn VerdictCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &LlmJudgeConfig {
        &self.config
    }

    /// API calls charged against the budget so far.
    pub fn requests_made(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn reserve(&self, n: usize) -> Result<(), JudgeError> {
        let max_requests = self.config.max_requests;
        self.requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(n).filter(|total| *total <= max_requests)
            })
            .map(|_| ())
            .map_err(|_| JudgeError::RequestBudgetExhausted { max_requests })
    }

    fn release(&self, n: usize) {
        self.requests.fetch_sub(n, Ordering::SeqCst);
    }

    fn draw_flips(&self, n: usize) -> Vec<bool> {
        if !self.config.shuffle_order {
            return vec![false; n];
        }
        let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
        (0..n).map(|_| rng.gen_bool(0.5)).collect()
    }

    fn cache_key(&self, prompt: &str, first: &str, second: &str) -> VerdictCacheKey {
        VerdictCacheKey::new(
            self.config.model.model_id(),
            &self.config.template.slug,
            &self.config.template.hash(),
            prompt,
            first,
            second,
        )
    }

    /// Cache lookups for a discrete batch; `None` marks a miss.
    async fn cached_verdicts(
        &self,
        prompts: &[String],
        completions: &[Vec<String>],
        return_scores: bool,
    ) -> Vec<Option<Judgment>> {
        let cache = match (&self.cache, return_scores) {
            (Some(cache), false) => cache,
            _ => return vec![None; prompts.len()],
        };

        let mut verdicts = Vec::with_capacity(prompts.len());
        for (prompt, pair) in prompts.iter().zip(completions) {
            let key = self.cache_key(prompt, &pair[0], &pair[1]);
            let verdict = match cache.get(&key).await {
                Ok(Some(hit)) if hit.winner < 2 => {
                    debug!(key = %key.key_hash, winner = hit.winner, "verdict cache hit");
                    Some(Judgment::Winner(hit.winner))
                }
                Ok(_) => None,
                Err(err) => {
                    warn!(error = %err, "verdict cache read failed");
                    None
                }
            };
            verdicts.push(verdict);
        }
        verdicts
    }

    /// One live API call. `sent` counts calls that reached the gateway.
    async fn judge_pair(
        &self,
        prompt: &str,
        first: &str,
        second: &str,
        flip: bool,
        return_scores: bool,
        sent: &AtomicUsize,
    ) -> Result<Judgment, JudgeError> {
        let (shown0, shown1) = if flip { (second, first) } else { (first, second) };
        let messages = self
            .config
            .template
            .render(prompt, shown0, shown1)
            .to_messages();
        let request = ChatRequest::new(
            self.config.model.clone(),
            messages,
            Attribution::new("judge::llm"),
        )
        .temperature(self.config.temperature);
        let request = if return_scores {
            request.max_tokens(1).with_logprobs(TOP_LOGPROBS)
        } else {
            request.max_tokens(self.config.max_tokens)
        };

        sent.fetch_add(1, Ordering::SeqCst);
        let response = self.gateway.chat(request).await?;

        if return_scores {
            let p = preference_from_logprobs(&response)?;
            return Ok(Judgment::Score(if flip { 1.0 - p } else { p }));
        }

        let shown = parse_verdict(&response.content)?;
        let winner = if flip { 1 - shown } else { shown };
        if let Some(cache) = &self.cache {
            let key = self.cache_key(prompt, first, second);
            if let Err(err) = cache.put(&key, CachedVerdict { winner }).await {
                warn!(error = %err, "verdict cache write failed");
            }
        }
        Ok(Judgment::Winner(winner))
    }
}

/// The reply must start with `0` or `1` after leading whitespace.
fn parse_verdict(content: &str) -> Result<usize, JudgeError> {
    match content.trim_start().chars().next() {
        Some('0') => Ok(0),
        Some('1') => Ok(1),
        _ => {
            let excerpt: String = content.chars().take(80).collect();
            Err(JudgeError::ExternalService(format!(
                "judge reply is not an identifier: {excerpt:?}"
            )))
        }
    }
}

/// `p("0") / (p("0") + p("1"))` over the first generated token.
fn preference_from_logprobs(response: &ChatResponse) -> Result<f64, JudgeError> {
    let first = response
        .output_logprobs
        .as_ref()
        .and_then(|tokens| tokens.first())
        .ok_or_else(|| JudgeError::ExternalService("response carried no logprobs".into()))?;

    let candidates = std::iter::once((first.token.as_str(), first.logprob)).chain(
        first
            .top_alternatives
            .iter()
            .map(|alt| (alt.token.as_str(), alt.logprob)),
    );

    let mut seen: Vec<&str> = Vec::new();
    let (mut p0, mut p1) = (0.0f64, 0.0f64);
    for (token, logprob) in candidates {
        if seen.contains(&token) {
            continue;
        }
        seen.push(token);
        match token.trim() {
            "0" => p0 += logprob.exp(),
            "1" => p1 += logprob.exp(),
            _ => {}
        }
    }

    let total = p0 + p1;
    if !(total > 0.0 && total.is_finite()) {
        return Err(JudgeError::ExternalService(
            "neither identifier appears in the top logprobs".into(),
        ));
    }
    Ok((p0 / total).clamp(0.0, 1.0))
}

#[async_trait]
impl Judge for LlmPairwiseJudge {
    fn name(&self) -> &'static str {
        "llm_pairwise"
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
        let mut verdicts = self
            .cached_verdicts(prompts, completions, return_scores)
            .await;
        let misses: Vec<usize> = (0..verdicts.len())
            .filter(|&i| verdicts[i].is_none())
            .collect();
        self.reserve(misses.len())?;

        let flips = self.draw_flips(prompts.len());
        let concurrency = self.config.max_concurrency.max(1);
        let sent = AtomicUsize::new(0);
        let fresh: Result<Vec<Judgment>, JudgeError> = stream::iter(misses.iter().copied())
            .map(|i| {
                let pair = &completions[i];
                self.judge_pair(&prompts[i], &pair[0], &pair[1], flips[i], return_scores, &sent)
            })
            .buffered(concurrency)
            .try_collect()
            .await;
        let fresh = match fresh {
            Ok(fresh) => fresh,
            Err(err) => {
                self.release(misses.len() - sent.load(Ordering::SeqCst));
                return Err(err);
            }
        };

        for (i, judgment) in misses.into_iter().zip(fresh) {
            verdicts[i] = Some(judgment);
        }
        let judgments: Vec<Judgment> = verdicts.into_iter().flatten().collect();

        debug!(
            model = self.config.model.model_id(),
            batch = judgments.len(),
            return_scores,
            requests = self.requests_made(),
            "llm judged batch"
        );
        Ok(judgments)
    }
}
