use std::sync::Arc;
use std::time::Duration;

use pairwise_judges::gateway::chat_completions::ChatCompletionsAdapter;
use pairwise_judges::gateway::{
    ChatEndpointConfig, ChatModel, GatewayConfig, NoopUsageSink, Provider, ProviderError,
    ProviderGateway,
};
use pairwise_judges::{
    Judge, JudgeError, Judgment, LlmJudgeConfig, LlmPairwiseJudge, SqliteVerdictCache,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, body_string_contains, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const MODEL: &str = "meta-llama/Meta-Llama-3-70B-Instruct";

fn reply(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{ "message": { "content": content }, "finish_reason": "stop" }],
        "usage": { "prompt_tokens": 50, "completion_tokens": 1 }
    }))
}

/// Picks whichever labelled output contains "Paris".
struct PrefersParis;

impl Respond for PrefersParis {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        let user = body["messages"]
            .as_array()
            .and_then(|m| m.last())
            .and_then(|m| m["content"].as_str())
            .unwrap_or_default()
            .to_string();
        let paris = user.find("Paris").unwrap_or(0);
        let second = user.find("identifier=\"1\"").unwrap_or(usize::MAX);
        reply(if paris > second { "1" } else { "0" })
    }
}

fn judge_for(server: &MockServer, config: LlmJudgeConfig, max_retries: u32) -> LlmPairwiseJudge {
    let endpoint = ChatEndpointConfig::new(Provider::HuggingFace, "hf_test")
        .with_base_url(server.uri())
        .with_timeout(Duration::from_secs(5));
    let adapter = ChatCompletionsAdapter::new(endpoint).unwrap();
    let gateway = ProviderGateway::with_config(
        adapter,
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries,
            retry_base_delay: Duration::from_millis(0),
            max_retry_delay: Duration::from_millis(10),
        },
    );
    LlmPairwiseJudge::new(Arc::new(gateway), config)
}

fn config() -> LlmJudgeConfig {
    LlmJudgeConfig::new(ChatModel::new(Provider::HuggingFace, MODEL))
}

fn france() -> (Vec<String>, Vec<Vec<String>>) {
    (
        vec![
            "The capital of France is".to_string(),
            "The biggest planet in the solar system is".to_string(),
        ],
        vec![
            vec!["Paris".to_string(), "Marseille".to_string()],
            vec!["Saturn".to_string(), "Paris".to_string()],
        ],
    )
}

#[tokio::test]
async fn discrete_verdicts_follow_the_model_regardless_of_shuffle() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "model": MODEL, "max_tokens": 1 })))
        .respond_with(PrefersParis)
        .mount(&server)
        .await;

    let (prompts, completions) = france();
    for seed in 0..4 {
        let judge = judge_for(
            &server,
            LlmJudgeConfig {
                seed: Some(seed),
                ..config()
            },
            0,
        );
        let out = judge.judge(&prompts, &completions, false).await.unwrap();
        assert_eq!(out, vec![Judgment::Winner(0), Judgment::Winner(1)]);
    }
}

#[tokio::test]
async fn request_carries_the_judging_prompt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("The capital of France is"))
        .and(body_string_contains("identifier=\\\"0\\\""))
        .respond_with(reply("0"))
        .expect(1)
        .mount(&server)
        .await;

    let judge = judge_for(
        &server,
        LlmJudgeConfig {
            shuffle_order: false,
            ..config()
        },
        0,
    );
    let (prompts, completions) = france();
    let out = judge
        .judge(&prompts[..1], &completions[..1], false)
        .await
        .unwrap();
    assert_eq!(out, vec![Judgment::Winner(0)]);
}

#[tokio::test]
async fn logprob_scores_are_probabilities() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "logprobs": true, "top_logprobs": 20 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "0" },
                "finish_reason": "length",
                "logprobs": { "content": [{
                    "token": "0",
                    "logprob": -0.1,
                    "top_logprobs": [
                        { "token": "0", "logprob": -0.1 },
                        { "token": "1", "logprob": -2.4 },
                        { "token": "Output", "logprob": -6.0 }
                    ]
                }]}
            }]
        })))
        .mount(&server)
        .await;

    let judge = judge_for(&server, config(), 0);
    let (prompts, completions) = france();
    let out = judge.judge(&prompts, &completions, true).await.unwrap();
    assert_eq!(out.len(), 2);
    for judgment in out {
        let p = judgment.as_score().expect("score");
        assert!((0.0..=1.0).contains(&p));
    }
}

#[tokio::test]
async fn chatty_reply_is_an_external_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(reply("Output 0 is better because"))
        .mount(&server)
        .await;

    let judge = judge_for(&server, config(), 0);
    let (prompts, completions) = france();
    let err = judge.judge(&prompts, &completions, false).await.unwrap_err();
    assert!(matches!(err, JudgeError::ExternalService(_)));
    assert!(err.is_external());
}

#[tokio::test]
async fn rate_limits_are_retried_by_the_gateway() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(reply("1"))
        .mount(&server)
        .await;

    let judge = judge_for(
        &server,
        LlmJudgeConfig {
            shuffle_order: false,
            ..config()
        },
        2,
    );
    let (prompts, completions) = france();
    let out = judge
        .judge(&prompts[..1], &completions[..1], false)
        .await
        .unwrap();
    assert_eq!(out, vec![Judgment::Winner(1)]);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn exhausted_retries_surface_provider_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let judge = judge_for(&server, config(), 1);
    let (prompts, completions) = france();
    let err = judge
        .judge(&prompts[..1], &completions[..1], false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        JudgeError::Provider(ProviderError::Provider { retryable: true, .. })
    ));
}

#[tokio::test]
async fn request_budget_spans_calls() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(PrefersParis)
        .mount(&server)
        .await;

    let judge = judge_for(
        &server,
        LlmJudgeConfig {
            max_requests: 3,
            ..config()
        },
        0,
    );
    let (prompts, completions) = france();
    judge.judge(&prompts, &completions, false).await.unwrap();
    let err = judge.judge(&prompts, &completions, false).await.unwrap_err();
    assert!(matches!(
        err,
        JudgeError::RequestBudgetExhausted { max_requests: 3 }
    ));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
    judge
        .judge(&prompts[..1], &completions[..1], false)
        .await
        .unwrap();
}

#[tokio::test]
async fn sqlite_cache_answers_repeat_questions() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(PrefersParis)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let cache = SqliteVerdictCache::new(dir.path().join("verdicts.sqlite")).unwrap();
    let judge = judge_for(&server, config(), 0).with_cache(Arc::new(cache));
    let (prompts, completions) = france();

    let first = judge.judge(&prompts, &completions, false).await.unwrap();
    let second = judge.judge(&prompts, &completions, false).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn triples_are_rejected_before_any_request() {
    let server = MockServer::start().await;
    let judge = judge_for(&server, config(), 0);
    let prompts = vec!["q".to_string()];
    let completions = vec![vec!["a".to_string(), "b".to_string(), "c".to_string()]];
    let err = judge.judge(&prompts, &completions, false).await.unwrap_err();
    assert!(matches!(err, JudgeError::InputShape(_)));
    assert!(server.received_requests().await.unwrap().is_empty());
}
