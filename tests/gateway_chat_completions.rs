use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pairwise_judges::gateway::chat_completions::{ChatCompletionsAdapter, ChatProvider};
use pairwise_judges::gateway::{
    Attribution, ChatEndpointConfig, ChatModel, ChatRequest, FinishReason, GatewayConfig,
    Message, NoopUsageSink, Provider, ProviderError, ProviderGateway,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn adapter(server: &MockServer) -> ChatCompletionsAdapter {
    let config = ChatEndpointConfig::new(Provider::HuggingFace, "hf_test")
        .with_base_url(server.uri())
        .with_timeout(Duration::from_secs(5));
    ChatCompletionsAdapter::new(config).unwrap()
}

fn request() -> ChatRequest {
    ChatRequest::new(
        ChatModel::new(Provider::HuggingFace, "meta-llama/Meta-Llama-3-70B-Instruct"),
        vec![Message::user("hi")],
        Attribution::new("test"),
    )
}

#[tokio::test]
async fn adapter_parses_content_and_usage() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer hf_test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "0" },
                "finish_reason": "eos_token"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 1 }
        })))
        .mount(&server)
        .await;

    let resp = adapter(&server).chat(&request().max_tokens(1)).await.unwrap();
    assert_eq!(resp.content, "0");
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.input_tokens, 10);
    assert_eq!(resp.output_tokens, 1);
    assert!(resp.output_logprobs.is_none());
}

#[tokio::test]
async fn adapter_requests_and_parses_top_logprobs() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "logprobs": true, "top_logprobs": 20 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "1" },
                "finish_reason": "length",
                "logprobs": { "content": [{
                    "token": "1",
                    "logprob": -0.2,
                    "top_logprobs": [
                        { "token": "1", "logprob": -0.2 },
                        { "token": "0", "logprob": -1.8 }
                    ]
                }]}
            }]
        })))
        .mount(&server)
        .await;

    let req = request().max_tokens(1).with_logprobs(20);
    let resp = adapter(&server).chat(&req).await.unwrap();
    assert_eq!(resp.finish_reason, FinishReason::Length);
    assert_eq!(resp.input_tokens, 0);
    let tokens = resp.output_logprobs.expect("logprobs");
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].top_alternatives.len(), 2);
    assert_eq!(tokens[0].top_alternatives[1].token, "0");
}

#[tokio::test]
async fn adapter_classifies_429_and_keeps_context() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-request-id", "abc123")
                .insert_header("retry-after", "7")
                .set_body_json(json!({
                    "error": { "message": "rate limited", "code": "rate_limit_exceeded" }
                })),
        )
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&request()).await.unwrap_err();
    assert!(err.is_retryable());
    match err {
        ProviderError::RateLimited {
            retry_after,
            context,
        } => {
            assert_eq!(retry_after, Some(Duration::from_secs(7)));
            let ctx = context.expect("expected error context");
            assert_eq!(ctx.http_status, Some(429));
            assert_eq!(ctx.provider_code.as_deref(), Some("rate_limit_exceeded"));
            assert_eq!(ctx.request_id.as_deref(), Some("abc123"));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn adapter_treats_bad_credentials_as_permanent() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": "Invalid credentials in Authorization header"
        })))
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&request()).await.unwrap_err();
    assert!(!err.is_retryable());
    assert!(matches!(err, ProviderError::Unauthorized { .. }));
}

#[derive(Clone)]
struct FlipResponder {
    calls: Arc<AtomicUsize>,
    first: ResponseTemplate,
    second: ResponseTemplate,
}

impl Respond for FlipResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            self.first.clone()
        } else {
            self.second.clone()
        }
    }
}

fn ok_body() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{
            "message": { "content": "ok" },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
    }))
}

fn fast_retries(max_retries: u32) -> GatewayConfig {
    GatewayConfig {
        max_retries,
        retry_base_delay: Duration::from_millis(0),
        max_retry_delay: Duration::from_millis(10),
    }
}

#[tokio::test]
async fn gateway_retries_server_errors_and_succeeds() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlipResponder {
            calls: Arc::new(AtomicUsize::new(0)),
            first: ResponseTemplate::new(500).set_body_json(json!({
                "error": { "message": "transient error", "code": "internal" }
            })),
            second: ok_body(),
        })
        .mount(&server)
        .await;

    let gateway =
        ProviderGateway::with_config(adapter(&server), Arc::new(NoopUsageSink), fast_retries(1));

    let resp = gateway.chat(request()).await.unwrap();
    assert_eq!(resp.content, "ok");

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 2);
}

#[tokio::test]
async fn gateway_caps_retry_after_and_retries_rate_limits() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlipResponder {
            calls: Arc::new(AtomicUsize::new(0)),
            first: ResponseTemplate::new(429).insert_header("retry-after", "3600"),
            second: ok_body(),
        })
        .mount(&server)
        .await;

    let gateway =
        ProviderGateway::with_config(adapter(&server), Arc::new(NoopUsageSink), fast_retries(2));

    let started = std::time::Instant::now();
    let resp = gateway.chat(request()).await.unwrap();
    assert_eq!(resp.content, "ok");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn gateway_does_not_retry_invalid_requests() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "message": "bad model id" }
        })))
        .mount(&server)
        .await;

    let gateway =
        ProviderGateway::with_config(adapter(&server), Arc::new(NoopUsageSink), fast_retries(3));

    let err = gateway.chat(request()).await.unwrap_err();
    assert!(matches!(err, ProviderError::InvalidRequest { .. }));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}
