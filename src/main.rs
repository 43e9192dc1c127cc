//! qmd-grpo: GRPO fine-tuning for structured query expansion
//!
//! Subcommands:
//!
//! - `train`      -- Run GRPO training (or a single evaluation with `--eval-only`)
//! - `eval`       -- Evaluate a local adapter or a remote endpoint
//! - `expand`     -- Expand one query
//! - `score`      -- Score an expansion read from a file or stdin
//! - `score-data` -- Score JSONL training datasets

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing_subscriber::EnvFilter;

use qmd_grpo::config::QmdGrpoConfig;
use qmd_grpo::expansion::dataset::{load_examples, score_examples};
use qmd_grpo::expansion::{filter_expansion_lines, score_expansion, score_expansion_detailed};
use qmd_grpo::model::prompt::strip_terminal_marker;
use qmd_grpo::model::{Generator, LlmClient, LocalGenerator};
use qmd_grpo::training::pipeline::{build_policy, DEFAULT_TRAINING_QUERIES};
use qmd_grpo::training::{evaluate, load_queries, Trainer};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// GRPO fine-tuning for structured search-query expansion.
#[derive(Parser)]
#[command(name = "qmd-grpo", version, about)]
struct Cli {
    /// Path to a JSON configuration file (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run GRPO training.
    Train {
        /// Override the number of training steps.
        #[arg(long)]
        steps: Option<usize>,

        /// Adapter (file or directory) to start from.
        #[arg(long)]
        adapter: Option<PathBuf>,

        /// Output directory for checkpoints and the final adapter.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Skip training and run one evaluation.
        #[arg(long)]
        eval_only: bool,
    },

    /// Evaluate greedy expansions over a query file.
    Eval {
        /// Adapter (file or directory) to evaluate.
        #[arg(long, conflicts_with = "remote")]
        adapter: Option<PathBuf>,

        /// Evaluate the configured remote endpoint instead.
        #[arg(long)]
        remote: bool,

        /// Query file, one query per line.
        #[arg(long)]
        queries: Option<PathBuf>,
    },

    /// Expand a single query.
    Expand {
        query: String,

        /// Adapter (file or directory) to use.
        #[arg(long, conflicts_with = "remote")]
        adapter: Option<PathBuf>,

        /// Use the configured remote endpoint.
        #[arg(long)]
        remote: bool,

        /// Sampling temperature; 0 is greedy.
        #[arg(long, default_value_t = 0.0)]
        temperature: f64,

        /// Print the raw output instead of only the prefixed lines.
        #[arg(long)]
        raw: bool,
    },

    /// Score an expansion.
    Score {
        /// File to read, or `-` for stdin.
        #[arg(default_value = "-")]
        input: String,

        /// Query the expansion was produced for; enables the detailed score.
        #[arg(long)]
        query: Option<String>,
    },

    /// Score JSONL training datasets.
    ScoreData {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Reads RUST_LOG, defaults to info.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str::<QmdGrpoConfig>(&text)
                .with_context(|| format!("Failed to parse config from {}", path.display()))?
        }
        None => QmdGrpoConfig::default(),
    };

    if config.remote.api_key.is_empty() {
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.remote.api_key = key;
        }
    }

    match cli.command {
        Commands::Train {
            steps,
            adapter,
            output,
            eval_only,
        } => {
            if let Some(steps) = steps {
                config.rl.max_steps = steps;
            }
            if adapter.is_some() {
                config.policy.adapter = adapter;
            }
            if let Some(output) = output {
                config.output_dir = output;
            }
            cmd_train(config, eval_only).await
        }
        Commands::Eval {
            adapter,
            remote,
            queries,
        } => {
            if adapter.is_some() {
                config.policy.adapter = adapter;
            }
            if let Some(queries) = queries {
                config.eval.queries_file = queries;
            }
            cmd_eval(&config, remote).await
        }
        Commands::Expand {
            query,
            adapter,
            remote,
            temperature,
            raw,
        } => {
            if adapter.is_some() {
                config.policy.adapter = adapter;
            }
            cmd_expand(&config, &query, remote, temperature, raw).await
        }
        Commands::Score { input, query } => cmd_score(&input, query.as_deref()),
        Commands::ScoreData { files } => cmd_score_data(&files),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_train(config: QmdGrpoConfig, eval_only: bool) -> Result<()> {
    let eval_queries = eval_queries_or_default(&config.eval.queries_file)?;
    let mut trainer = Trainer::from_config(config, eval_queries)?;
    if eval_only {
        trainer = trainer.eval_only();
    }

    let summary = trainer.run().await?;

    if let Some(last) = summary.evaluations.last() {
        tracing::info!(
            steps = summary.steps,
            checkpoints = summary.checkpoints.len(),
            avg = last.report.avg,
            perfect = last.report.perfect,
            total = last.report.total,
            "GRPO run complete"
        );
    }
    Ok(())
}

async fn cmd_eval(config: &QmdGrpoConfig, remote: bool) -> Result<()> {
    config.validate()?;
    let queries = load_queries(&config.eval.queries_file)?;
    let max_tokens = config.eval.max_tokens;

    let report = if remote {
        let mut client = remote_client(config)?;
        evaluate(&mut client, &queries, max_tokens).await?
    } else {
        let policy = build_policy(config)?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut generator = LocalGenerator::new(&policy, &mut rng, config.rl.top_p);
        evaluate(&mut generator, &queries, max_tokens).await?
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cmd_expand(
    config: &QmdGrpoConfig,
    query: &str,
    remote: bool,
    temperature: f64,
    raw: bool,
) -> Result<()> {
    let max_tokens = config.eval.max_tokens;
    let output = if remote {
        let mut client = remote_client(config)?;
        client.generate(query, max_tokens, temperature).await?
    } else {
        let policy = build_policy(config)?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut generator = LocalGenerator::new(&policy, &mut rng, config.rl.top_p);
        generator.generate(query, max_tokens, temperature).await?
    };

    if raw {
        println!("{output}");
    } else {
        println!("{}", filter_expansion_lines(&strip_terminal_marker(&output)));
    }
    Ok(())
}

fn cmd_score(input: &str, query: Option<&str>) -> Result<()> {
    let text = if input == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read stdin")?;
        buf
    } else {
        std::fs::read_to_string(input).with_context(|| format!("Failed to read {input}"))?
    };

    let json = match query {
        Some(query) => serde_json::to_string_pretty(&score_expansion_detailed(query, &text))?,
        None => serde_json::to_string_pretty(&score_expansion(&text))?,
    };
    println!("{json}");
    Ok(())
}

fn cmd_score_data(files: &[PathBuf]) -> Result<()> {
    for path in files {
        let examples = load_examples(path)?;
        let report = score_examples(&examples);
        println!("{}", path.display());
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn remote_client(config: &QmdGrpoConfig) -> Result<LlmClient> {
    LlmClient::new(
        &config.remote.api_base,
        &config.remote.api_key,
        &config.remote.model_id,
        config.rl.top_p,
    )
}

/// Evaluation queries from `path`, or the built-in training pool when the
/// file does not exist.
fn eval_queries_or_default(path: &Path) -> Result<Vec<String>> {
    if path.exists() {
        return load_queries(path);
    }
    tracing::warn!(
        path = %path.display(),
        "evaluation query file not found, evaluating on the built-in query pool"
    );
    Ok(DEFAULT_TRAINING_QUERIES.iter().map(|q| q.to_string()).collect())
}
