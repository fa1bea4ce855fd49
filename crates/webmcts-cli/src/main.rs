use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use webmcts_local::{LeafFallback, MinerConfig, SearchConfig};

mod pipeline;

#[derive(Parser, Debug)]
#[command(name = "webmcts")]
#[command(about = "MCTS trajectory synthesis for web agents (search, prune, mine)", long_about = None)]
struct Cli {
    /// Debug-level logs on stderr (overrides RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Grow a search tree for one task file (writes the task with the tree under `trace`).
    Search(SearchCmd),
    /// Prune searched trees and mine training trajectories from them.
    Mine(MineCmd),
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug)]
struct SearchCmd {
    /// Task file: `{intent, state, ...}`.
    #[arg(long)]
    task: PathBuf,
    /// Output path; the task is skipped when it already exists.
    #[arg(long)]
    out: PathBuf,
    /// Policy model ids (`provider:model` or bare name); repeat to rotate.
    #[arg(long = "policy-model", env = "WEBMCTS_POLICY_MODEL", value_delimiter = ',', required = true)]
    policy_models: Vec<String>,
    #[arg(long, env = "WEBMCTS_WORLD_MODEL")]
    world_model: String,
    #[arg(long, env = "WEBMCTS_REWARD_MODEL")]
    reward_model: String,
    /// Similarity judge for fuzzy action equivalence.
    #[arg(long, env = "WEBMCTS_JUDGE_MODEL")]
    judge_model: Option<String>,
    #[arg(long, default_value_t = 2)]
    branch: usize,
    #[arg(long)]
    time_limit_ms: Option<u64>,
    #[arg(long)]
    iteration_limit: Option<u64>,
    #[arg(long, default_value_t = 4.75)]
    end_gate: f64,
    #[arg(long, default_value_t = 0.7)]
    exploration_constant: f64,
    /// Persistent fuzzy-equivalence cache (JSON).
    #[arg(long, env = "WEBMCTS_FUZZY_CACHE")]
    fuzzy_cache: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum FallbackArg {
    StopThenScore,
    ScoreOnly,
}

impl From<FallbackArg> for LeafFallback {
    fn from(v: FallbackArg) -> Self {
        match v {
            FallbackArg::StopThenScore => LeafFallback::StopThenScore,
            FallbackArg::ScoreOnly => LeafFallback::ScoreOnly,
        }
    }
}

#[derive(clap::Args, Debug)]
struct MineCmd {
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,
    #[arg(long, default_value = "./webmcts-vtraj")]
    valuable_dir: PathBuf,
    #[arg(long, default_value = "./webmcts-ttraj")]
    traceable_dir: PathBuf,
    #[arg(long, env = "WEBMCTS_JUDGE_MODEL")]
    judge_model: Option<String>,
    /// Generate reflection (backtracking) pairs with this model.
    #[arg(long, env = "WEBMCTS_REFLECTION_MODEL")]
    reflection_model: Option<String>,
    #[arg(long)]
    reflection_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 4.75)]
    value_threshold: f64,
    #[arg(long, value_enum, default_value = "stop-then-score")]
    fallback: FallbackArg,
    /// Also emit root-to-leaf pairs when only the score fallback matched.
    #[arg(long)]
    emit_valuable_on_score_fallback: bool,
    #[arg(long, env = "WEBMCTS_FUZZY_CACHE", default_value = "fuzzy_match.json")]
    fuzzy_cache: PathBuf,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

/// `KEY=VALUE` lines from `WEBMCTS_ENV_FILE`; explicit process env wins.
fn load_env_file() {
    let Ok(p) = std::env::var("WEBMCTS_ENV_FILE") else {
        return;
    };
    let p = p.trim();
    if p.is_empty() {
        return;
    }
    let Ok(txt) = std::fs::read_to_string(p) else {
        return;
    };
    for raw in txt.lines() {
        let s = raw.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let Some((k, v)) = s.split_once('=') else {
            continue;
        };
        let k = k.trim();
        if k.is_empty() {
            continue;
        }
        if std::env::var_os(k).is_none() {
            std::env::set_var(k, v.trim());
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_file();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Search(args) => {
            let config = SearchConfig {
                time_limit_ms: args.time_limit_ms,
                iteration_limit: args.iteration_limit,
                branch: args.branch,
                end_gate: args.end_gate,
                exploration_constant: args.exploration_constant,
                ..SearchConfig::default()
            };
            let v = pipeline::search(pipeline::SearchSpec {
                task: args.task,
                out: args.out,
                policy_models: args.policy_models,
                world_model: args.world_model,
                reward_model: args.reward_model,
                judge_model: args.judge_model,
                fuzzy_cache: args.fuzzy_cache,
                config,
            })
            .await?;
            println!("{v}");
        }
        Commands::Mine(args) => {
            let miner = MinerConfig {
                value_threshold: args.value_threshold,
                fallback: args.fallback.into(),
                emit_valuable_on_score_fallback: args.emit_valuable_on_score_fallback,
                ..MinerConfig::default()
            };
            let v = pipeline::mine(pipeline::MineSpec {
                data_dir: args.data_dir,
                valuable_dir: args.valuable_dir,
                traceable_dir: args.traceable_dir,
                reflection_dir: args.reflection_dir,
                judge_model: args.judge_model,
                reflection_model: args.reflection_model,
                fuzzy_cache: Some(args.fuzzy_cache),
                miner,
            })
            .await?;
            println!("{v}");
        }
        Commands::Version(args) => {
            let v = serde_json::json!({
                "schema_version": 1,
                "kind": "version",
                "ok": true,
                "name": "webmcts",
                "version": env!("CARGO_PKG_VERSION"),
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => println!("webmcts {}", env!("CARGO_PKG_VERSION")),
                _ => println!("{v}"),
            }
        }
    }
    Ok(())
}
