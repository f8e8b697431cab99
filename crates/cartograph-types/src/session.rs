use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Degraded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangedFiles {
    pub modified: Vec<String>,
    pub added: Vec<String>,
    pub deleted: Vec<String>,
    pub renamed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSession {
    pub id: Uuid,
    pub path: String,
    pub mode: SessionMode,
    pub base_reference: Option<String>,
    pub current_commit: Option<String>,
    pub files_analyzed: Vec<String>,
    pub files_skipped: Vec<String>,
    pub module_count: u64,
    pub function_count: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
}

impl AnalysisSession {
    pub fn new(id: Uuid, path: impl Into<String>, mode: SessionMode, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            path: path.into(),
            mode,
            base_reference: None,
            current_commit: None,
            files_analyzed: Vec::new(),
            files_skipped: Vec::new(),
            module_count: 0,
            function_count: 0,
            cache_hits: 0,
            cache_misses: 0,
            started_at,
            completed_at: None,
            errors: Vec::new(),
        }
    }

    pub fn is_immutable(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Returned by `AnalyzeFull` / `AnalyzeIncremental`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub module_count: u64,
    pub function_count: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cards_created: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitInfo {
    pub commit: String,
    pub branch: String,
    pub base_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalStats {
    pub modified_n: u64,
    pub added_n: u64,
    pub deleted_n: u64,
}
