use std::collections::HashSet;

use cartograph_store::Store;
use cartograph_types::{ChangedFiles, CoreError, CoreResult, GitInfo, IncrementalStats};

use crate::external::{CodeGraph, VcsAdapter};
use crate::orchestrator::WalkContext;

fn has_interesting_extension(path: &str, source_extensions: &[String]) -> bool {
    source_extensions.is_empty() || source_extensions.iter().any(|ext| path.ends_with(&format!(".{ext}")))
}

/// Every file in the graph matching the configured source extensions —
/// the "candidate" set I8 measures `files_skipped` against.
pub fn candidate_source_files(graph: &dyn CodeGraph, source_extensions: &[String]) -> Vec<String> {
    graph
        .modules()
        .into_iter()
        .map(|m| m.path)
        .filter(|p| has_interesting_extension(p, source_extensions))
        .collect()
}

/// §4.10: resolves the module set an incremental run should walk, and the
/// git provenance recorded against the session.
pub struct IncrementalPlan {
    pub git: GitInfo,
    pub restrict_to: HashSet<String>,
    pub changes: ChangedFiles,
    pub stats: IncrementalStats,
}

/// Computes the restricted module set for `AnalyzeIncremental`: everything
/// modified or added, with renames treated as delete-then-add, filtered to
/// configured source extensions. Deleted files are returned separately so
/// the caller can invalidate their cache entries before the walk starts.
pub async fn plan_incremental(
    store: &Store,
    vcs: &dyn VcsAdapter,
    path: &str,
    base_ref: Option<String>,
    source_extensions: &[String],
) -> CoreResult<IncrementalPlan> {
    if !vcs.is_repo(path).await? {
        return Err(CoreError::VcsRequired(path.to_string()));
    }

    let current_commit = vcs.current_commit(path).await?;
    let current_branch = vcs.current_branch(path).await?;
    let base_ref = match base_ref {
        Some(explicit) => explicit,
        None => match store.last_completed_session(path)? {
            Some(session) => session.current_commit.unwrap_or(current_commit.clone()),
            None => format!("{current_commit}~1"),
        },
    };

    let changes = vcs.changed_files(path, Some(&base_ref)).await?;

    let mut restrict_to: HashSet<String> = HashSet::new();
    for modified in changes.modified.iter().filter(|p| has_interesting_extension(p, source_extensions)) {
        restrict_to.insert(modified.clone());
    }
    for added in changes.added.iter().filter(|p| has_interesting_extension(p, source_extensions)) {
        restrict_to.insert(added.clone());
    }
    for (_from, to) in changes.renamed.iter().filter(|(_, to)| has_interesting_extension(to, source_extensions)) {
        restrict_to.insert(to.clone());
    }

    let stats = IncrementalStats {
        modified_n: changes.modified.len() as u64,
        added_n: changes.added.len() as u64,
        deleted_n: changes.deleted.len() as u64,
    };

    Ok(IncrementalPlan {
        git: GitInfo { commit: current_commit, branch: current_branch, base_ref },
        restrict_to,
        changes,
        stats,
    })
}

/// Invalidates the cache for every path §4.10 step 6 names: explicit
/// deletions plus the "from" side of a rename.
pub fn invalidate_deleted(ctx: &WalkContext, changes: &ChangedFiles) {
    for deleted in changes.deleted.iter().chain(changes.renamed.iter().map(|(from, _)| from)) {
        if let Err(err) = ctx.cache.invalidate_file(std::path::Path::new(deleted)) {
            tracing::error!(%err, path = %deleted, "failed to invalidate cache for deleted file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cartograph_cache::Cache;
    use cartograph_core::ProgressBus;
    use cartograph_gateway::ProviderGateway;
    use cartograph_resilience::EnvelopeConfig;
    use std::sync::Arc as StdArc;
    use crate::orchestrator::{ProgressCounters, Semaphores};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct FakeVcs {
        base_commit: String,
    }

    #[async_trait]
    impl VcsAdapter for FakeVcs {
        async fn is_repo(&self, _path: &str) -> CoreResult<bool> {
            Ok(true)
        }
        async fn current_commit(&self, _path: &str) -> CoreResult<String> {
            Ok("deadbeef".to_string())
        }
        async fn current_branch(&self, _path: &str) -> CoreResult<String> {
            Ok("main".to_string())
        }
        async fn changed_files(&self, _path: &str, base_ref: Option<&str>) -> CoreResult<ChangedFiles> {
            assert_eq!(base_ref, Some(self.base_commit.as_str()));
            Ok(ChangedFiles {
                modified: vec!["src/lib.rs".to_string()],
                added: vec!["src/new.rs".to_string(), "README.md".to_string()],
                deleted: vec!["src/old.rs".to_string()],
                renamed: vec![],
            })
        }
    }

    #[tokio::test]
    async fn restricts_to_modified_and_added_source_files() {
        let store = Store::open_in_memory(ProgressBus::new()).unwrap();
        let vcs = FakeVcs { base_commit: "deadbeef~1".to_string() };
        let plan = plan_incremental(&store, &vcs, "/repo", Some("deadbeef~1".to_string()), &["rs".to_string()])
            .await
            .unwrap();
        assert!(plan.restrict_to.contains("src/lib.rs"));
        assert!(plan.restrict_to.contains("src/new.rs"));
        assert!(!plan.restrict_to.contains("README.md"));
        assert_eq!(plan.stats.deleted_n, 1);
    }

    #[tokio::test]
    async fn non_repo_path_is_rejected() {
        struct NotARepo;
        #[async_trait]
        impl VcsAdapter for NotARepo {
            async fn is_repo(&self, _path: &str) -> CoreResult<bool> {
                Ok(false)
            }
            async fn current_commit(&self, _path: &str) -> CoreResult<String> {
                unreachable!()
            }
            async fn current_branch(&self, _path: &str) -> CoreResult<String> {
                unreachable!()
            }
            async fn changed_files(&self, _path: &str, _base_ref: Option<&str>) -> CoreResult<ChangedFiles> {
                unreachable!()
            }
        }
        let store = Store::open_in_memory(ProgressBus::new()).unwrap();
        let result = plan_incremental(&store, &NotARepo, "/not-a-repo", None, &[]).await;
        assert!(matches!(result, Err(CoreError::VcsRequired(_))));
    }

    #[tokio::test]
    async fn invalidate_deleted_clears_cache_for_removed_and_renamed_from_paths() {
        let cache = Cache::open_in_memory().unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        cache.store(file.path(), cartograph_types::Scope::Function, "f", "payload", 1).unwrap();

        let ctx = WalkContext {
            store: StdArc::new(Store::open_in_memory(ProgressBus::new()).unwrap()),
            cache: StdArc::new(cache),
            gateway: StdArc::new(ProviderGateway::new("mock", EnvelopeConfig::default())),
            progress: ProgressBus::new(),
            graph: StdArc::new(NoopGraph),
            semaphores: Semaphores::new(1, 1, 1),
            counters: ProgressCounters::default(),
            session_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            provider_kind: None,
        };
        let changes = ChangedFiles {
            modified: vec![],
            added: vec![],
            deleted: vec![file.path().to_string_lossy().to_string()],
            renamed: vec![],
        };
        invalidate_deleted(&ctx, &changes);
        assert!(matches!(
            ctx.cache.lookup(file.path(), cartograph_types::Scope::Function, "f").unwrap(),
            cartograph_cache::CacheLookup::Miss
        ));
    }

    struct NoopGraph;
    impl crate::external::CodeGraph for NoopGraph {
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
}
