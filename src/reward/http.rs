//! HTTP client for a pairwise reward-model scoring server.
//!
//! Endpoints:
//! - `GET  {base}/models/{name}`: readiness. `200` ready, `503` loading,
//!   `404` unknown model.
//! - `POST {base}/models/{name}/score`: `{"inputs":[{"prompt","candidates"}]}`
//!   -> `{"scores":[[logit, ..], ..]}`.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{RewardModel, RewardModelConfig, RewardModelError, RewardModelLoader};

/// Maximum response body we will buffer (1MB).
const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

#[derive(Debug, Clone)]
pub struct HttpRewardModel {
    client: reqwest::Client,
    model: String,
    score_url: String,
}

#[derive(Serialize)]
struct ScoreRequest<'a> {
    inputs: Vec<ScoreInput<'a>>,
}

#[derive(Serialize)]
struct ScoreInput<'a> {
    prompt: &'a str,
    candidates: &'a [String],
}

#[derive(Deserialize)]
struct ScoreResponse {
    scores: Vec<Vec<f64>>,
}

#[derive(Deserialize)]
struct StatusResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn build_client(config: &RewardModelConfig) -> Result<reqwest::Client, RewardModelError> {
    let mut headers = HeaderMap::new();
    if let Some(token) = &config.token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| RewardModelError::Config("invalid token format".into()))?;
        headers.insert(AUTHORIZATION, value);
    }
    reqwest::Client::builder()
        .timeout(config.timeout)
        .default_headers(headers)
        .gzip(true)
        .build()
        .map_err(|e| RewardModelError::Config(format!("failed to create HTTP client: {e}")))
}

/// Read the body in chunks, failing once it passes `MAX_RESPONSE_LEN`.
async fn read_body(mut response: reqwest::Response) -> Result<String, RewardModelError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let new_len = bytes.len() + chunk.len();
        if new_len > MAX_RESPONSE_LEN {
            return Err(RewardModelError::Malformed(format!(
                "response too large: {new_len} bytes"
            )));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn body_message(body: &str) -> String {
    serde_json::from_str::<StatusResponse>(body)
        .ok()
        .and_then(|s| s.error)
        .unwrap_or_else(|| body.trim().chars().take(200).collect())
}

#[async_trait]
impl RewardModel for HttpRewardModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn score_batch(
        &self,
        prompts: &[String],
        candidates: &[Vec<String>],
    ) -> Result<Vec<Vec<f64>>, RewardModelError> {
        let request = ScoreRequest {
            inputs: prompts
                .iter()
                .zip(candidates)
                .map(|(prompt, set)| ScoreInput {
                    prompt,
                    candidates: set,
                })
                .collect(),
        };

        debug!(model = %self.model, batch = prompts.len(), "scoring batch");
        let response = self.client.post(&self.score_url).json(&request).send().await?;
        let status = response.status();
        let body = read_body(response).await?;

        match status.as_u16() {
            _ if status.is_success() => {
                let parsed: ScoreResponse = serde_json::from_str(&body)
                    .map_err(|e| RewardModelError::Malformed(e.to_string()))?;
                Ok(parsed.scores)
            }
            503 => Err(RewardModelError::Contended {
                model: self.model.clone(),
                reason: body_message(&body),
            }),
            404 => Err(RewardModelError::NotFound {
                model: self.model.clone(),
            }),
            code => Err(RewardModelError::Service {
                status: Some(code),
                message: body_message(&body),
            }),
        }
    }
}

/// Checks readiness of a model on a scoring server and hands out a client.
#[derive(Debug, Clone)]
pub struct HttpRewardModelLoader {
    config: RewardModelConfig,
}

impl HttpRewardModelLoader {
    pub fn new(config: RewardModelConfig) -> Self {
        Self { config }
    }

    pub fn from_env() -> Self {
        Self::new(RewardModelConfig::from_env())
    }

    fn model_url(&self) -> String {
        format!(
            "{}/models/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }
}

#[async_trait]
impl RewardModelLoader for HttpRewardModelLoader {
    type Model = HttpRewardModel;

    async fn load(&self) -> Result<HttpRewardModel, RewardModelError> {
        self.config.validate()?;
        let client = build_client(&self.config)?;
        let model_url = self.model_url();
        let model = self.config.model.clone();

        let response = client.get(&model_url).send().await?;
        let status = response.status();
        let body = read_body(response).await?;

        match status.as_u16() {
            404 => return Err(RewardModelError::NotFound { model }),
            503 => {
                return Err(RewardModelError::Contended {
                    model,
                    reason: body_message(&body),
                })
            }
            code if !status.is_success() => {
                return Err(RewardModelError::Service {
                    status: Some(code),
                    message: body_message(&body),
                })
            }
            _ => {}
        }

        // Some servers answer 200 with a status field while weights download.
        let state = serde_json::from_str::<StatusResponse>(&body)
            .ok()
            .and_then(|s| s.status);
        if let Some(state) = state.as_deref() {
            if state.eq_ignore_ascii_case("loading") || state.eq_ignore_ascii_case("downloading") {
                return Err(RewardModelError::Contended {
                    model,
                    reason: format!("server reports status '{state}'"),
                });
            }
        }

        info!(model = %model, url = %model_url, "reward model ready");
        Ok(HttpRewardModel {
            client,
            score_url: format!("{model_url}/score"),
            model,
        })
    }
}
