#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing::info;

use pairwise_judges::gateway::{Provider, StderrUsageSink};
use pairwise_judges::judge::llm::{DEFAULT_HF_MODEL, DEFAULT_OPENAI_MODEL};
use pairwise_judges::judge::{Judge, Judgment};
use pairwise_judges::{
    load_with_retry, HttpRewardModelLoader, LlmPairwiseJudge, LoadRetryPolicy,
    RandomPairwiseJudge, RandomRankJudge, RewardModelConfig, RewardModelJudge,
    RewardModelJudgeConfig, RewardModelLoader, SqliteVerdictCache,
};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "judges", version, about = "Pairwise and ranking judges over JSONL")]
struct Cli {
    /// Show debug logs (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Judge every line of a JSONL file of {"prompt", "completions"}
    Run {
        #[arg(long, value_enum)]
        judge: JudgeKind,
        #[arg(long)]
        input: PathBuf,
        /// Output JSONL; stdout when omitted
        #[arg(long)]
        out: Option<PathBuf>,
        /// Return preference probabilities instead of winners
        #[arg(long)]
        scores: bool,
        #[arg(long)]
        seed: Option<u64>,
        /// Model id override (required for openrouter)
        #[arg(long)]
        model: Option<String>,
        /// SQLite verdict cache for remote judges
        #[arg(long)]
        cache: Option<PathBuf>,
        /// Write one JSON usage record per API call to stderr
        #[arg(long)]
        usage: bool,
        #[arg(long, default_value_t = 5)]
        load_attempts: u32,
        #[arg(long, default_value_t = 5)]
        load_delay_secs: u64,
    },
    /// Export the verdict cache to JSONL
    CacheExport {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Prune the verdict cache (by age and/or size)
    CachePrune {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        max_age_days: Option<u64>,
        #[arg(long)]
        max_rows: Option<usize>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum JudgeKind {
    RandomPairwise,
    RandomRank,
    Hf,
    Openai,
    Openrouter,
    RewardModel,
}

#[derive(Deserialize)]
struct InputRecord {
    prompt: String,
    completions: Vec<String>,
}

#[derive(Serialize)]
struct OutputRecord<'a> {
    prompt: &'a str,
    judgment: &'a Judgment,
}

struct RunOptions {
    seed: Option<u64>,
    model: Option<String>,
    cache: Option<PathBuf>,
    usage: bool,
    load_policy: LoadRetryPolicy,
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            judge,
            input,
            out,
            scores,
            seed,
            model,
            cache,
            usage,
            load_attempts,
            load_delay_secs,
        } => {
            let options = RunOptions {
                seed,
                model,
                cache,
                usage,
                load_policy: LoadRetryPolicy::new(
                    load_attempts,
                    Duration::from_secs(load_delay_secs),
                ),
            };
            let judge = build_judge(judge, options).await?;
            let (prompts, completions) = read_input(&input)?;
            info!(judge = judge.name(), prompts = prompts.len(), "judging input");

            let judgments = judge.judge(&prompts, &completions, scores).await?;

            let mut writer: Box<dyn Write> = match out {
                Some(path) => Box::new(BufWriter::new(File::create(path)?)),
                None => Box::new(BufWriter::new(io::stdout().lock())),
            };
            for (prompt, judgment) in prompts.iter().zip(&judgments) {
                let line = serde_json::to_string(&OutputRecord { prompt, judgment })?;
                writeln!(writer, "{line}")?;
            }
            writer.flush()?;
        }
        Commands::CacheExport { db, out } => {
            let path = db.unwrap_or_else(SqliteVerdictCache::default_path);
            let cache = SqliteVerdictCache::new(path)?;
            let written = cache.export_jsonl(out).await?;
            println!("exported {written} rows");
        }
        Commands::CachePrune {
            db,
            max_age_days,
            max_rows,
        } => {
            if max_age_days.is_none() && max_rows.is_none() {
                return Err("cache-prune requires --max-age-days and/or --max-rows".into());
            }
            if matches!(max_rows, Some(0)) {
                return Err("--max-rows must be >= 1".into());
            }
            let path = db.unwrap_or_else(SqliteVerdictCache::default_path);
            let cache = SqliteVerdictCache::new(path)?;
            let _lock = cache.lock_exclusive()?;
            let stats = cache.prune(max_age_days, max_rows).await?;
            println!(
                "pruned {} rows; {} rows remain",
                stats.deleted, stats.remaining
            );
        }
    }

    Ok(())
}

async fn build_judge(kind: JudgeKind, options: RunOptions) -> CliResult<Box<dyn Judge>> {
    let RunOptions {
        seed,
        model,
        cache,
        usage,
        load_policy,
    } = options;

    let judge: Box<dyn Judge> = match kind {
        JudgeKind::RandomPairwise => Box::new(match seed {
            Some(seed) => RandomPairwiseJudge::with_seed(seed),
            None => RandomPairwiseJudge::new(),
        }),
        JudgeKind::RandomRank => Box::new(match seed {
            Some(seed) => RandomRankJudge::with_seed(seed),
            None => RandomRankJudge::new(),
        }),
        JudgeKind::Hf | JudgeKind::Openai | JudgeKind::Openrouter => {
            let (provider, default_model) = match kind {
                JudgeKind::Hf => (Provider::HuggingFace, Some(DEFAULT_HF_MODEL)),
                JudgeKind::Openai => (Provider::OpenAI, Some(DEFAULT_OPENAI_MODEL)),
                _ => (Provider::OpenRouter, None),
            };
            let model_id = model
                .or_else(|| default_model.map(str::to_string))
                .ok_or("--model is required for the openrouter judge")?;
            let mut judge = if usage {
                LlmPairwiseJudge::from_provider_with_sink(
                    provider,
                    model_id,
                    Arc::new(StderrUsageSink),
                )?
            } else {
                LlmPairwiseJudge::from_provider(provider, model_id)?
            };
            if let Some(seed) = seed {
                judge = judge.with_seed(seed);
            }
            if let Some(path) = cache {
                judge = judge.with_cache(Arc::new(SqliteVerdictCache::new(path)?));
            }
            Box::new(judge)
        }
        JudgeKind::RewardModel => {
            let mut config = RewardModelConfig::from_env();
            if let Some(model) = model {
                config.model = model;
            }
            let loader = HttpRewardModelLoader::new(config);
            let reward_model = load_with_retry(load_policy, || loader.load()).await?;
            let judge = RewardModelJudge::new(
                reward_model,
                RewardModelJudgeConfig {
                    seed,
                    ..Default::default()
                },
            )?;
            Box::new(judge)
        }
    };
    Ok(judge)
}

fn read_input(path: &Path) -> CliResult<(Vec<String>, Vec<Vec<String>>)> {
    let reader = BufReader::new(File::open(path)?);
    let mut prompts = Vec::new();
    let mut completions = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: InputRecord = serde_json::from_str(&line)
            .map_err(|e| format!("{}:{}: {e}", path.display(), idx + 1))?;
        prompts.push(record.prompt);
        completions.push(record.completions);
    }
    Ok((prompts, completions))
}
