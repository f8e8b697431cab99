use async_trait::async_trait;
use cartograph_types::{ChangedFiles, CoreResult};

/// One function discovered by a `CodeGraph`. `source` and `signature` feed
/// the provider prompt directly; `callers`/`callees` are resolved through
/// the graph's own edge lookups rather than stored redundantly here.
#[derive(Debug, Clone)]
pub struct FunctionDescriptor {
    pub qualifier: String,
    pub path: String,
    pub source: String,
    pub signature: String,
    pub docstring: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClassDescriptor {
    pub qualifier: String,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct ImportEdge {
    pub from_path: String,
    pub to_path: String,
}

/// Parsed view of a directory tree, supplied by an external static analyzer.
/// This repository ships no implementation — tests exercise the tree walk
/// against small in-test fakes — but depends on the trait to keep the
/// orchestrator decoupled from any particular parser.
#[async_trait]
pub trait CodeGraph: Send + Sync {
    fn modules(&self) -> Vec<ModuleDescriptor>;
    fn classes(&self, module_path: &str) -> Vec<ClassDescriptor>;
    fn functions(&self, owner_path: &str, class_qualifier: Option<&str>) -> Vec<FunctionDescriptor>;
    fn callers(&self, function_qualifier: &str) -> Vec<String>;
    fn callees(&self, function_qualifier: &str) -> Vec<String>;
    fn import_edges(&self) -> Vec<ImportEdge>;
}

/// Version control collaborator behind `AnalyzeIncremental`. Every method is
/// expected to respect the core's VCS timeout on its own.
#[async_trait]
pub trait VcsAdapter: Send + Sync {
    async fn is_repo(&self, path: &str) -> CoreResult<bool>;
    async fn current_commit(&self, path: &str) -> CoreResult<String>;
    async fn current_branch(&self, path: &str) -> CoreResult<String>;
    async fn changed_files(&self, path: &str, base_ref: Option<&str>) -> CoreResult<ChangedFiles>;
}
