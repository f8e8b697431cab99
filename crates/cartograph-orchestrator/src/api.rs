use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use cartograph_cache::Cache;
use cartograph_core::{CancellationRegistry, EngineConfig, ProgressBus};
use cartograph_gateway::ProviderGateway;
use cartograph_store::{CardPatch, Store};
use cartograph_types::{
    CardStatus, ChangedFiles, CoreError, CoreResult, GitInfo, IncrementalStats, ProgressEvent,
    SessionMode, SessionStatus, SessionSummary,
};
use uuid::Uuid;

use crate::external::{CodeGraph, VcsAdapter};
use crate::incremental::{candidate_source_files, invalidate_deleted, plan_incremental};
use crate::orchestrator::{run_system, ProgressCounters, Semaphores, WalkContext};

/// Returned by `ApplyFix`.
#[derive(Debug, Clone)]
pub struct ApplyFixResult {
    pub ok: bool,
    pub backup_ref: String,
}

/// The three request shapes external callers drive: `AnalyzeFull`,
/// `AnalyzeIncremental`, `ApplyFix`. Owns every long-lived dependency the
/// orchestrator needs; one `Engine` serves any number of sequential or
/// concurrent analyses.
pub struct Engine {
    store: Arc<Store>,
    cache: Arc<Cache>,
    gateway: Arc<ProviderGateway>,
    progress: ProgressBus,
    cancellation: CancellationRegistry,
    config: EngineConfig,
    fix_backup_root: PathBuf,
}

impl Engine {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<Cache>,
        gateway: Arc<ProviderGateway>,
        progress: ProgressBus,
        cancellation: CancellationRegistry,
        config: EngineConfig,
        fix_backup_root: PathBuf,
    ) -> Self {
        Self { store, cache, gateway, progress, cancellation, config, fix_backup_root }
    }

    fn semaphores(&self) -> Semaphores {
        Semaphores::new(
            self.config.max_concurrent_subsystems,
            self.config.max_concurrent_modules,
            self.config.max_concurrent_functions,
        )
    }

    /// §4.9: parses the whole path, walks it top-down with bounded fan-out,
    /// and returns the session summary once every activation has reached a
    /// terminal status.
    pub async fn analyze_full(&self, path: &str, graph: Arc<dyn CodeGraph>) -> CoreResult<SessionSummary> {
        let session_id = Uuid::new_v4();
        self.store.create_session(session_id, path, SessionMode::Full)?;
        self.progress.publish(ProgressEvent::AnalysisStarted {
            session_id,
            path: path.to_string(),
            mode: "full".to_string(),
        });

        let token = self.cancellation.register(session_id).await;
        self.cancellation.arm_deadline(session_id, Duration::from_secs(self.config.analysis_deadline_s));

        let ctx = Arc::new(WalkContext {
            store: self.store.clone(),
            cache: self.cache.clone(),
            gateway: self.gateway.clone(),
            progress: self.progress.clone(),
            graph,
            semaphores: self.semaphores(),
            counters: ProgressCounters::default(),
            session_id,
            cancel: token,
            provider_kind: Some(self.config.provider_kind.clone()),
        });

        let outcome = run_system(ctx.clone(), path, None).await;
        self.cancellation.unregister(session_id).await;

        let status = if ctx.cancel.is_cancelled() {
            SessionStatus::Cancelled
        } else if outcome.errored {
            SessionStatus::Degraded
        } else {
            SessionStatus::Completed
        };

        self.finish_session(
            session_id,
            path,
            status,
            outcome.card_ids.len() as u64,
            Vec::new(),
            Vec::new(),
            ctx.counters.modules_total.load(Ordering::Relaxed),
            ctx.counters.functions_total.load(Ordering::Relaxed),
            ctx.counters.cache_hits.load(Ordering::Relaxed),
            ctx.counters.cache_misses.load(Ordering::Relaxed),
            outcome.errors,
        )
    }

    /// §4.10: resolves the restricted module set via the VCS adapter, then
    /// runs the same tree walk scoped to it.
    pub async fn analyze_incremental(
        &self,
        path: &str,
        base_ref: Option<String>,
        graph: Arc<dyn CodeGraph>,
        vcs: &dyn VcsAdapter,
    ) -> CoreResult<(SessionSummary, GitInfo, ChangedFiles, IncrementalStats)> {
        let plan = plan_incremental(&self.store, vcs, path, base_ref, &self.config.source_extensions).await?;

        let session_id = Uuid::new_v4();
        self.store.create_session(session_id, path, SessionMode::Incremental)?;
        self.store.set_session_git_info(session_id, &plan.git.commit, &plan.git.base_ref)?;
        self.progress.publish(ProgressEvent::AnalysisStarted {
            session_id,
            path: path.to_string(),
            mode: "incremental".to_string(),
        });

        let token = self.cancellation.register(session_id).await;
        self.cancellation.arm_deadline(session_id, Duration::from_secs(self.config.analysis_deadline_s));

        let ctx = Arc::new(WalkContext {
            store: self.store.clone(),
            cache: self.cache.clone(),
            gateway: self.gateway.clone(),
            progress: self.progress.clone(),
            graph,
            semaphores: self.semaphores(),
            counters: ProgressCounters::default(),
            session_id,
            cancel: token,
            provider_kind: Some(self.config.provider_kind.clone()),
        });

        invalidate_deleted(&ctx, &plan.changes);

        let outcome = run_system(ctx.clone(), path, Some(&plan.restrict_to)).await;
        self.cancellation.unregister(session_id).await;

        let status = if ctx.cancel.is_cancelled() {
            SessionStatus::Cancelled
        } else if outcome.errored {
            SessionStatus::Degraded
        } else {
            SessionStatus::Completed
        };

        let mut all_files: Vec<String> = plan.restrict_to.iter().cloned().collect();
        all_files.sort();

        let candidates = candidate_source_files(ctx.graph.as_ref(), &self.config.source_extensions);
        let mut files_skipped: Vec<String> =
            candidates.into_iter().filter(|p| !plan.restrict_to.contains(p)).collect();
        files_skipped.sort();

        let summary = self.finish_session(
            session_id,
            path,
            status,
            outcome.card_ids.len() as u64,
            all_files,
            files_skipped,
            ctx.counters.modules_total.load(Ordering::Relaxed),
            ctx.counters.functions_total.load(Ordering::Relaxed),
            ctx.counters.cache_hits.load(Ordering::Relaxed),
            ctx.counters.cache_misses.load(Ordering::Relaxed),
            outcome.errors,
        )?;

        Ok((summary, plan.git, plan.changes, plan.stats))
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_session(
        &self,
        session_id: Uuid,
        path: &str,
        status: SessionStatus,
        cards_created: u64,
        files_analyzed: Vec<String>,
        files_skipped: Vec<String>,
        module_count: u64,
        function_count: u64,
        cache_hits: u64,
        cache_misses: u64,
        errors: Vec<String>,
    ) -> CoreResult<SessionSummary> {
        let session = self.store.complete_session(
            session_id,
            files_analyzed,
            files_skipped,
            module_count,
            function_count,
            cache_hits,
            cache_misses,
            errors,
        )?;

        let summary = SessionSummary {
            session_id,
            status,
            module_count: session.module_count,
            function_count: session.function_count,
            cache_hits: session.cache_hits,
            cache_misses: session.cache_misses,
            cards_created,
            errors: session.errors.clone(),
        };

        match status {
            SessionStatus::Completed | SessionStatus::Degraded => {
                self.progress.publish(ProgressEvent::AnalysisCompleted {
                    session_id,
                    summary: serde_json::to_value(&summary).unwrap_or_default(),
                });
            }
            _ => {
                self.progress.publish(ProgressEvent::AnalysisError {
                    session_id,
                    error: format!("session ended with status {status:?} for path {path}"),
                });
            }
        }
        Ok(summary)
    }

    /// §6: writes a card's proposed fix atomically (temp-file + rename),
    /// backing up the original under a per-session directory first.
    /// Rejects paths outside the configured analysis root and fixes whose
    /// hunk is ambiguous to apply unassisted.
    pub async fn apply_fix(&self, card_id: &str, project_root: &Path) -> CoreResult<ApplyFixResult> {
        let card = self.store.get_card(card_id)?;
        let fix = card
            .proposed_fix
            .ok_or_else(|| CoreError::NotFound(format!("card {card_id} has no proposed fix")))?;

        let target_path = project_root.join(&fix.file_path);
        let canonical_root = project_root
            .canonicalize()
            .map_err(CoreError::from)?;
        let canonical_target = target_path
            .canonicalize()
            .unwrap_or_else(|_| target_path.clone());
        if !canonical_target.starts_with(&canonical_root) {
            return Err(CoreError::PathOutOfScope(fix.file_path.clone()));
        }

        let original = std::fs::read_to_string(&canonical_target)?;
        let lines: Vec<&str> = original.lines().collect();
        let (start, end) = fix.line_range;
        if start == 0 || end < start || end as usize > lines.len() {
            return Err(CoreError::MultiHunkUnsupported);
        }

        let before = lines[..(start as usize - 1)].join("\n");
        let after = lines[(end as usize)..].join("\n");
        let replaced = fix.new_text.trim_end_matches('\n');
        let mut new_contents = String::new();
        if !before.is_empty() {
            new_contents.push_str(&before);
            new_contents.push('\n');
        }
        new_contents.push_str(replaced);
        new_contents.push('\n');
        if !after.is_empty() {
            new_contents.push_str(&after);
            new_contents.push('\n');
        }

        let session_backup_dir = self.fix_backup_root.join(card.owner_agent_id.clone());
        std::fs::create_dir_all(&session_backup_dir)?;
        let backup_path = session_backup_dir.join(format!("{}.bak", card_id));
        std::fs::write(&backup_path, &original)?;

        let tmp_path = canonical_target.with_extension("cartograph-tmp");
        std::fs::write(&tmp_path, new_contents)?;
        std::fs::rename(&tmp_path, &canonical_target)?;

        self.store.update_card(
            card_id,
            CardPatch { status: Some(CardStatus::Done), ..Default::default() },
            "ApplyFix",
        )?;

        Ok(ApplyFixResult { ok: true, backup_ref: backup_path.to_string_lossy().to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartograph_resilience::EnvelopeConfig;
    use cartograph_types::{Card, CardType, Priority, ProposedFix};

    fn engine(tmp: &tempfile::TempDir) -> Engine {
        let store = Arc::new(Store::open_in_memory(ProgressBus::new()).unwrap());
        let cache = Arc::new(Cache::open_in_memory().unwrap());
        let mut gateway = ProviderGateway::new("mock", EnvelopeConfig::default());
        gateway.register(Arc::new(cartograph_gateway::MockProvider));
        Engine::new(
            store,
            cache,
            Arc::new(gateway),
            ProgressBus::new(),
            CancellationRegistry::new(),
            EngineConfig::default(),
            tmp.path().join("backups"),
        )
    }

    fn card_with_fix(engine: &Engine, project_root: &Path, relative: &str, old: &str, new: &str) -> Card {
        std::fs::write(project_root.join(relative), old).unwrap();
        let card = engine
            .store
            .create_card("CARTO", CardType::Change, "AGN-Function-0001", "fix it", "summary")
            .unwrap();
        engine
            .store
            .update_card(
                &card.id,
                CardPatch {
                    status: Some(CardStatus::Proposed),
                    priority: Some(Priority::P2),
                    proposed_fix: Some(Some(ProposedFix {
                        file_path: relative.to_string(),
                        line_range: (1, 1),
                        old_text: old.to_string(),
                        new_text: new.to_string(),
                        validation_flags: vec![],
                    })),
                    ..Default::default()
                },
                "tester",
            )
            .unwrap()
    }

    #[tokio::test]
    async fn apply_fix_rewrites_the_file_and_records_a_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(&tmp);
        let card = card_with_fix(&engine, tmp.path(), "src.rs", "fn f() { 1 }", "fn f() { 2 }");

        let result = engine.apply_fix(&card.id, tmp.path()).await.unwrap();
        assert!(result.ok);
        assert!(Path::new(&result.backup_ref).exists());
        let rewritten = std::fs::read_to_string(tmp.path().join("src.rs")).unwrap();
        assert_eq!(rewritten, "fn f() { 2 }\n");

        let updated = engine.store.get_card(&card.id).unwrap();
        assert_eq!(updated.status, CardStatus::Done);
    }

    #[tokio::test]
    async fn apply_fix_rejects_paths_outside_the_project_root() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(&tmp);
        let card = engine
            .store
            .create_card("CARTO", CardType::Change, "AGN-Function-0001", "escape", "summary")
            .unwrap();
        engine
            .store
            .update_card(
                &card.id,
                CardPatch {
                    status: Some(CardStatus::Proposed),
                    proposed_fix: Some(Some(ProposedFix {
                        file_path: "../../etc/passwd".to_string(),
                        line_range: (1, 1),
                        old_text: String::new(),
                        new_text: "evil".to_string(),
                        validation_flags: vec![],
                    })),
                    ..Default::default()
                },
                "tester",
            )
            .unwrap();

        let result = engine.apply_fix(&card.id, tmp.path()).await;
        assert!(matches!(result, Err(CoreError::PathOutOfScope(_)) | Err(CoreError::Io(_))));
    }

    #[tokio::test]
    async fn analyze_full_over_an_empty_graph_creates_one_architecture_card() {
        struct EmptyGraph;
        impl CodeGraph for EmptyGraph {
            fn modules(&self) -> Vec<crate::external::ModuleDescriptor> {
                vec![]
            }
            fn classes(&self, _module_path: &str) -> Vec<crate::external::ClassDescriptor> {
                vec![]
            }
            fn functions(&self, _owner_path: &str, _class_qualifier: Option<&str>) -> Vec<crate::external::FunctionDescriptor> {
                vec![]
            }
            fn callers(&self, _function_qualifier: &str) -> Vec<String> {
                vec![]
            }
            fn callees(&self, _function_qualifier: &str) -> Vec<String> {
                vec![]
            }
            fn import_edges(&self) -> Vec<crate::external::ImportEdge> {
                vec![]
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(&tmp);
        let summary = engine.analyze_full("/empty/project", Arc::new(EmptyGraph)).await.unwrap();
        assert_eq!(summary.status, SessionStatus::Completed);
        assert_eq!(summary.cards_created, 1);
    }
}
