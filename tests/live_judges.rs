//! Against real services. Run with `cargo test -- --ignored` and credentials set.

use pairwise_judges::{
    load_with_retry, HttpRewardModelLoader, Judge, Judgment, LlmPairwiseJudge, LoadRetryPolicy,
    RewardModelJudge, RewardModelJudgeConfig, RewardModelLoader,
};

fn france() -> (Vec<String>, Vec<Vec<String>>) {
    (
        vec![
            "The capital of France is".to_string(),
            "The biggest planet in the solar system is".to_string(),
        ],
        vec![
            vec!["Paris".to_string(), "Marseille".to_string()],
            vec!["Saturn".to_string(), "Jupiter".to_string()],
        ],
    )
}

#[tokio::test]
#[ignore]
async fn hugging_face_judge_prefers_correct_answers() {
    if std::env::var("HF_TOKEN").is_err() {
        eprintln!("HF_TOKEN not set; skipping");
        return;
    }
    let judge = LlmPairwiseJudge::hugging_face().unwrap();
    let (prompts, completions) = france();
    let out = judge.judge(&prompts, &completions, false).await.unwrap();
    assert_eq!(out, vec![Judgment::Winner(0), Judgment::Winner(1)]);
}

#[tokio::test]
#[ignore]
async fn reward_model_judge_prefers_correct_answers() {
    if std::env::var("REWARD_MODEL_URL").is_err() {
        eprintln!("REWARD_MODEL_URL not set; skipping");
        return;
    }
    let loader = HttpRewardModelLoader::from_env();
    let model = load_with_retry(LoadRetryPolicy::from_env(), || loader.load())
        .await
        .unwrap();
    let judge = RewardModelJudge::new(model, RewardModelJudgeConfig::default()).unwrap();
    let (prompts, completions) = france();

    let winners = judge.judge(&prompts, &completions, false).await.unwrap();
    assert_eq!(winners, vec![Judgment::Winner(0), Judgment::Winner(1)]);

    let scores = judge.judge(&prompts, &completions, true).await.unwrap();
    for judgment in scores {
        let p = judgment.as_score().unwrap();
        assert!((0.0..=1.0).contains(&p));
    }
}
