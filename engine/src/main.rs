use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use cartograph_cache::Cache;
use cartograph_core::{CancellationRegistry, EngineConfig, ProgressBus};
use cartograph_gateway::{MockProvider, ProviderGateway};
use cartograph_orchestrator::{CodeGraph, Engine, VcsAdapter};
use cartograph_resilience::EnvelopeConfig;
use cartograph_store::Store;
use cartograph_types::CoreError;
use clap::{Parser, Subcommand};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "cartograph-engine")]
#[command(about = "Hierarchical AI code analysis engine")]
struct Cli {
    #[arg(long)]
    path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Full tree walk of the whole analysis root.
    AnalyzeFull,
    /// Walk only files changed since `base_ref` (or the last completed session).
    AnalyzeIncremental {
        #[arg(long)]
        base_ref: Option<String>,
    },
    /// Apply a card's proposed fix to disk.
    ApplyFix {
        card_id: String,
    },
    /// Report component health and exit.
    Health,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    match run().await {
        Ok(code) => code,
        Err(err) => {
            error!(%err, "cartograph-engine failed");
            exit_code_for(&err)
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    if let Some(core_err) = err.downcast_ref::<CoreError>() {
        return match core_err {
            CoreError::VcsRequired(_) => ExitCode::from(64),
            CoreError::CircuitOpen { .. } => ExitCode::from(69),
            CoreError::Cancelled => ExitCode::from(130),
            _ => ExitCode::from(70),
        };
    }
    ExitCode::from(70)
}

async fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let path = cli.path.unwrap_or_else(|| PathBuf::from("."));
    let config = EngineConfig::load(&path, serde_json::Value::Null).context("loading configuration")?;

    let progress = ProgressBus::new();
    let store = Arc::new(Store::open(&path.join(&config.store_path), progress.clone()).context("opening store")?);
    let cache = Arc::new(Cache::open(&path.join(".cartograph/cache.sqlite3")).context("opening cache")?);

    let mut gateway = ProviderGateway::new(
        config.provider_kind.clone(),
        EnvelopeConfig {
            timeout: std::time::Duration::from_secs(config.ai_timeout_s),
            rate_rpm: config.ai_rate_rpm,
            rate_tpm: config.ai_rate_tpm,
            breaker_threshold: config.ai_breaker_threshold,
            breaker_recovery: std::time::Duration::from_secs(config.ai_breaker_recovery_s),
        },
    );
    gateway.register(Arc::new(MockProvider));
    let gateway = Arc::new(gateway);

    let cancellation = CancellationRegistry::new();
    let backup_root = path.join(".cartograph/fix-backups");
    let engine = Engine::new(store.clone(), cache.clone(), gateway, progress, cancellation, config, backup_root);

    match cli.command {
        Command::AnalyzeFull => {
            let graph: Arc<dyn CodeGraph> = Arc::new(NoCodeGraph);
            let summary = engine.analyze_full(&path.to_string_lossy(), graph).await?;
            info!(session_id = %summary.session_id, cards = summary.cards_created, "analysis complete");
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::AnalyzeIncremental { base_ref } => {
            let graph: Arc<dyn CodeGraph> = Arc::new(NoCodeGraph);
            let vcs = NoVcsAdapter;
            let (summary, git, changes, stats) =
                engine.analyze_incremental(&path.to_string_lossy(), base_ref, graph, &vcs).await?;
            info!(session_id = %summary.session_id, commit = %git.commit, "incremental analysis complete");
            println!(
                "{}",
                serde_json::json!({ "summary": summary, "git": git, "changes": changes, "stats": stats })
            );
        }
        Command::ApplyFix { card_id } => {
            let result = engine.apply_fix(&card_id, &path).await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "ok": result.ok,
                "backup_ref": result.backup_ref,
            }))?);
        }
        Command::Health => {
            let probe = cartograph_orchestrator::HealthProbe::new(store, cache);
            let report = probe.check_all().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !matches!(report.overall, cartograph_orchestrator::OverallHealth::Healthy) {
                return Ok(ExitCode::from(69));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Placeholder `CodeGraph` used until a real static analyzer is wired in.
/// Reports an empty graph, so `AnalyzeFull`/`AnalyzeIncremental` complete
/// successfully with zero modules rather than failing outright.
struct NoCodeGraph;

impl CodeGraph for NoCodeGraph {
    fn modules(&self) -> Vec<cartograph_orchestrator::ModuleDescriptor> {
        Vec::new()
    }
    fn classes(&self, _module_path: &str) -> Vec<cartograph_orchestrator::ClassDescriptor> {
        Vec::new()
    }
    fn functions(
        &self,
        _owner_path: &str,
        _class_qualifier: Option<&str>,
    ) -> Vec<cartograph_orchestrator::FunctionDescriptor> {
        Vec::new()
    }
    fn callers(&self, _function_qualifier: &str) -> Vec<String> {
        Vec::new()
    }
    fn callees(&self, _function_qualifier: &str) -> Vec<String> {
        Vec::new()
    }
    fn import_edges(&self) -> Vec<cartograph_orchestrator::ImportEdge> {
        Vec::new()
    }
}

/// Placeholder `VcsAdapter`. `AnalyzeIncremental` against it always fails
/// with `VcsRequired` until a real VCS integration is plugged in.
struct NoVcsAdapter;

#[async_trait::async_trait]
impl VcsAdapter for NoVcsAdapter {
    async fn is_repo(&self, _path: &str) -> cartograph_types::CoreResult<bool> {
        Ok(false)
    }
    async fn current_commit(&self, _path: &str) -> cartograph_types::CoreResult<String> {
        Err(CoreError::VcsRequired("no VCS adapter configured".to_string()))
    }
    async fn current_branch(&self, _path: &str) -> cartograph_types::CoreResult<String> {
        Err(CoreError::VcsRequired("no VCS adapter configured".to_string()))
    }
    async fn changed_files(&self, _path: &str, _base_ref: Option<&str>) -> cartograph_types::CoreResult<cartograph_types::ChangedFiles> {
        Err(CoreError::VcsRequired("no VCS adapter configured".to_string()))
    }
}
