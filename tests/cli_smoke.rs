use std::path::Path;
use std::process::Command;

use serde_json::json;
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, serde::Deserialize)]
struct OutputLine {
    prompt: String,
    judgment: serde_json::Value,
}

fn write_input(path: &Path) {
    let lines = [
        json!({ "prompt": "The capital of France is", "completions": ["Paris", "Marseille"] }),
        json!({ "prompt": "The biggest planet in the solar system is", "completions": ["Saturn", "Jupiter", "Mars"] }),
    ];
    let body: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
    std::fs::write(path, body.join("\n") + "\n\n").unwrap();
}

fn read_output(path: &Path) -> Vec<OutputLine> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn random_pairwise_run_writes_one_line_per_prompt() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("input.jsonl");
    let out = dir.path().join("out.jsonl");
    write_input(&input);

    let status = Command::new(env!("CARGO_BIN_EXE_judges"))
        .args(["run", "--judge", "random-pairwise", "--seed", "1"])
        .arg("--input")
        .arg(&input)
        .arg("--out")
        .arg(&out)
        .status()
        .unwrap();
    assert!(status.success());

    let lines = read_output(&out);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0].prompt, "The capital of France is");
    let winner = lines[1].judgment["winner"].as_u64().unwrap();
    assert!(winner < 3);
}

#[test]
fn random_rank_run_emits_rankings() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("input.jsonl");
    let out = dir.path().join("out.jsonl");
    write_input(&input);

    let status = Command::new(env!("CARGO_BIN_EXE_judges"))
        .args(["run", "--judge", "random-rank"])
        .arg("--input")
        .arg(&input)
        .arg("--out")
        .arg(&out)
        .status()
        .unwrap();
    assert!(status.success());

    let lines = read_output(&out);
    let ranking = lines[1].judgment["ranking"].as_array().unwrap();
    assert_eq!(ranking.len(), 3);
}

#[test]
fn random_rank_with_scores_fails() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("input.jsonl");
    write_input(&input);

    let output = Command::new(env!("CARGO_BIN_EXE_judges"))
        .args(["run", "--judge", "random-rank", "--scores"])
        .arg("--input")
        .arg(&input)
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("return_scores"));
}

#[test]
fn malformed_input_reports_line_number() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("input.jsonl");
    std::fs::write(&input, "{\"prompt\": \"ok\", \"completions\": [\"a\", \"b\"]}\nnot json\n").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_judges"))
        .args(["run", "--judge", "random-pairwise"])
        .arg("--input")
        .arg(&input)
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains(":2:"));
}

#[test]
fn cache_prune_requires_a_limit() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("cache.sqlite");
    let status = Command::new(env!("CARGO_BIN_EXE_judges"))
        .arg("cache-prune")
        .arg("--db")
        .arg(&db)
        .status()
        .unwrap();
    assert!(!status.success());

    let status = Command::new(env!("CARGO_BIN_EXE_judges"))
        .args(["cache-prune", "--max-rows", "10"])
        .arg("--db")
        .arg(&db)
        .status()
        .unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn reward_model_run_retries_until_ready() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models/llm-blender/PairRM"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/models/llm-blender/PairRM"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/models/llm-blender/PairRM/score"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "scores": [[2.0, -1.0]] })),
        )
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let input = dir.path().join("input.jsonl");
    let out = dir.path().join("out.jsonl");
    std::fs::write(
        &input,
        json!({ "prompt": "The capital of France is", "completions": ["Paris", "Marseille"] })
            .to_string(),
    )
    .unwrap();

    let uri = server.uri();
    let (input_arg, out_arg) = (input.clone(), out.clone());
    let status = tokio::task::spawn_blocking(move || {
        Command::new(env!("CARGO_BIN_EXE_judges"))
            .env("REWARD_MODEL_URL", uri)
            .env_remove("REWARD_MODEL_NAME")
            .args(["run", "--judge", "reward-model", "--load-attempts", "3", "--load-delay-secs", "0"])
            .arg("--input")
            .arg(&input_arg)
            .arg("--out")
            .arg(&out_arg)
            .status()
            .unwrap()
    })
    .await
    .unwrap();
    assert!(status.success());

    let lines = read_output(&out);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].judgment["winner"], 0);
}
