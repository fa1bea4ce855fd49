use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use webmcts_core::{ChatOptions, PolicyOracle, ReflectionOracle, SimilarityJudge};
use webmcts_local::compile::{reflection_pairs, traceable_record, valuable_pairs};
use webmcts_local::oracles::{LlmJudge, LlmPolicy, LlmReflection, LlmReward, LlmWorld};
use webmcts_local::retry::ORACLE_RETRIES;
use webmcts_local::store::write_json_pretty;
use webmcts_local::{
    extract_trajectories, prune, token_usage, ActionMatcher, FuzzyCache, Mcts, MinerConfig,
    ModelRegistry, NodeId, Oracles, SearchConfig, TaskFile, TaskStore, TrajectoryKind,
};

fn opts(temperature: f64, max_tokens: u64) -> ChatOptions {
    ChatOptions {
        temperature: Some(temperature),
        max_tokens: Some(max_tokens),
        ..ChatOptions::default()
    }
}

fn open_cache(path: Option<&Path>) -> Result<FuzzyCache> {
    match path {
        Some(p) => Ok(FuzzyCache::open(p)?),
        None => Ok(FuzzyCache::in_memory()),
    }
}

fn judge(registry: &ModelRegistry, model: Option<&str>) -> Result<Option<Arc<dyn SimilarityJudge>>> {
    let Some(m) = model else {
        tracing::info!("no judge model; fuzzy equivalence falls back to exact payload comparison");
        return Ok(None);
    };
    let backend = registry.backend(m)?;
    Ok(Some(Arc::new(LlmJudge::new(backend, opts(0.0, 512)))))
}

#[derive(Debug, Clone)]
pub struct SearchSpec {
    pub task: PathBuf,
    pub out: PathBuf,
    pub policy_models: Vec<String>,
    pub world_model: String,
    pub reward_model: String,
    pub judge_model: Option<String>,
    pub fuzzy_cache: Option<PathBuf>,
    pub config: SearchConfig,
}

pub async fn search(spec: SearchSpec) -> Result<serde_json::Value> {
    // Budgets are checked before anything touches the network or disk.
    spec.config.validate()?;

    if spec.out.exists() {
        tracing::info!(out = %spec.out.display(), "output exists; skipping task");
        return Ok(serde_json::json!({
            "schema_version": 1,
            "kind": "search",
            "ok": true,
            "skipped": true,
            "out": spec.out.display().to_string(),
        }));
    }

    let mut task = TaskFile::load(&spec.task)?;
    let registry = ModelRegistry::from_env(reqwest::Client::new());
    let cfg = &spec.config;

    let mut policies: Vec<Arc<dyn PolicyOracle>> = Vec::new();
    for m in &spec.policy_models {
        policies.push(Arc::new(LlmPolicy::new(
            registry.backend(m)?,
            opts(cfg.policy_temperature, cfg.max_tokens),
        )));
    }
    let oracles = Oracles {
        policies,
        world: Arc::new(LlmWorld::new(
            registry.backend(&spec.world_model)?,
            opts(cfg.world_temperature, cfg.max_tokens),
        )),
        reward: Arc::new(LlmReward::new(
            registry.backend(&spec.reward_model)?,
            opts(cfg.reward_temperature, cfg.max_tokens),
        )),
    };
    let matcher = ActionMatcher::new(
        judge(&registry, spec.judge_model.as_deref())?,
        open_cache(spec.fuzzy_cache.as_deref())?,
    );

    tracing::info!(task = %spec.task.display(), intent = %task.intent, "starting search");
    let mut engine = Mcts::new(task.intent.clone(), spec.config.clone(), &oracles, &matcher)?;
    let outcome = engine.run(task.state.clone()).await?;

    task.set_tree(&outcome.tree)?;
    write_json_pretty(&spec.out, &task)?;
    matcher.flush()?;

    let usage = token_usage();
    tracing::info!(
        stop_reason = ?outcome.stop_reason,
        iterations = outcome.iterations,
        nodes = outcome.tree.node_count(),
        calls = usage.calls,
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        "search finished"
    );
    Ok(serde_json::json!({
        "schema_version": 1,
        "kind": "search",
        "ok": true,
        "skipped": false,
        "out": spec.out.display().to_string(),
        "stop_reason": outcome.stop_reason,
        "finished": outcome.finished(),
        "iterations": outcome.iterations,
        "nodes": outcome.tree.node_count(),
        "token_usage": usage,
    }))
}

#[derive(Debug, Clone)]
pub struct MineSpec {
    pub data_dir: PathBuf,
    pub valuable_dir: PathBuf,
    pub traceable_dir: PathBuf,
    pub reflection_dir: Option<PathBuf>,
    pub judge_model: Option<String>,
    pub reflection_model: Option<String>,
    pub fuzzy_cache: Option<PathBuf>,
    pub miner: MinerConfig,
}

#[derive(Debug, Default, serde::Serialize)]
struct MineSummary {
    processed: usize,
    skipped: usize,
    failed: usize,
    empty: usize,
    valuable_pairs: usize,
    traceable_records: usize,
    reflection_pairs: usize,
}

pub async fn mine(spec: MineSpec) -> Result<serde_json::Value> {
    if spec.reflection_model.is_some() != spec.reflection_dir.is_some() {
        return Err(webmcts_core::Error::Config(
            "--reflection-model and --reflection-dir go together".to_string(),
        )
        .into());
    }

    let mut store = TaskStore::new(&spec.data_dir, &spec.valuable_dir, &spec.traceable_dir);
    if let Some(d) = &spec.reflection_dir {
        store = store.with_reflection_dir(d);
    }
    let registry = ModelRegistry::from_env(reqwest::Client::new());
    let matcher = ActionMatcher::new(
        judge(&registry, spec.judge_model.as_deref())?,
        open_cache(spec.fuzzy_cache.as_deref())?,
    );
    let reflector: Option<Arc<dyn ReflectionOracle>> = match &spec.reflection_model {
        Some(m) => Some(Arc::new(LlmReflection::new(registry.backend(m)?, opts(0.7, 4096)))),
        None => None,
    };

    let mut summary = MineSummary::default();
    let files = store
        .task_files()
        .with_context(|| format!("scan {}", store.data_dir().display()))?;
    for (index, path) in files.iter().enumerate() {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if store.is_finished(file_name) {
            tracing::info!(file = file_name, "already mined; skipping");
            summary.skipped += 1;
            continue;
        }
        tracing::info!(index, file = file_name, "mining task");
        match mine_one(&store, &matcher, reflector.as_deref(), &spec.miner, path, file_name).await {
            Ok(Some(counts)) => {
                summary.processed += 1;
                summary.valuable_pairs += counts.0;
                summary.traceable_records += counts.1;
                summary.reflection_pairs += counts.2;
            }
            Ok(None) => {
                summary.processed += 1;
                summary.empty += 1;
            }
            Err(e) => {
                tracing::warn!(file = file_name, error = %e, "task failed");
                summary.failed += 1;
            }
        }
    }

    let usage = token_usage();
    tracing::info!(
        processed = summary.processed,
        skipped = summary.skipped,
        failed = summary.failed,
        judge_calls = matcher.judge_calls(),
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        "mining finished"
    );
    Ok(serde_json::json!({
        "schema_version": 1,
        "kind": "mine",
        "ok": true,
        "summary": summary,
        "token_usage": usage,
    }))
}

/// `Ok(None)` when the tree yields no trajectories.
async fn mine_one(
    store: &TaskStore,
    matcher: &ActionMatcher,
    reflector: Option<&dyn ReflectionOracle>,
    miner: &MinerConfig,
    path: &Path,
    file_name: &str,
) -> Result<Option<(usize, usize, usize)>> {
    let task = TaskFile::load(path)?;
    let Some(mut tree) = task.tree()? else {
        anyhow::bail!("task has no searched tree under `trace`");
    };

    prune(&mut tree, matcher).await;
    matcher.flush()?;

    let mined = extract_trajectories(&tree, miner);
    if mined.is_empty() {
        tracing::warn!(file = file_name, "no trajectories produced");
        return Ok(None);
    }

    let mut valuable = Vec::new();
    for t in mined.of_kind(TrajectoryKind::Valuable) {
        valuable.extend(valuable_pairs(&task.intent, &tree, &t.nodes));
    }
    if !valuable.is_empty() {
        let p = store.write_valuable(file_name, &valuable)?;
        tracing::info!(count = valuable.len(), out = %p.display(), "wrote valuable pairs");
    }

    let triples: Vec<[NodeId; 3]> = mined
        .of_kind(TrajectoryKind::Traceable)
        .filter_map(|t| <[NodeId; 3]>::try_from(t.nodes.as_slice()).ok())
        .collect();
    let records: Vec<_> = triples
        .iter()
        .map(|tr| traceable_record(&task.intent, &tree, tr))
        .collect();
    if !records.is_empty() {
        let p = store.write_traceable(file_name, &records)?;
        tracing::info!(count = records.len(), out = %p.display(), "wrote traceable records");
    }

    let mut reflections = Vec::new();
    if let Some(oracle) = reflector {
        for tr in &triples {
            match reflection_pairs(&task.intent, &tree, tr, oracle, ORACLE_RETRIES).await {
                Some(pairs) => reflections.extend(pairs),
                None => tracing::warn!(file = file_name, "reflection unavailable; triple skipped"),
            }
        }
        if !reflections.is_empty() {
            store.write_reflection(file_name, &reflections)?;
        }
    }

    Ok(Some((valuable.len(), records.len(), reflections.len())))
}
