use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    System,
    Subsystem,
    Module,
    Class,
    Function,
}

impl Scope {
    pub fn code(self) -> &'static str {
        match self {
            Scope::System => "System",
            Scope::Subsystem => "Subsystem",
            Scope::Module => "Module",
            Scope::Class => "Class",
            Scope::Function => "Function",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Analyzing,
    Reporting,
    Completed,
    Error,
}

impl AgentStatus {
    /// Status transitions are monotonic forward except the single allowed
    /// `Error -> Idle` reset on explicit retry.
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        if self == next {
            return false;
        }
        match (self, next) {
            (Error, Idle) => true,
            (Idle, Analyzing) => true,
            (Analyzing, Reporting) | (Analyzing, Error) => true,
            (Reporting, Completed) | (Reporting, Error) => true,
            (Idle, Error) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments_json: String,
    pub result_json: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub ts: chrono::DateTime<chrono::Utc>,
    pub role: MessageRole,
    pub content: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub tool_calls: Vec<ToolCall>,
    pub latency_ms: u64,
}

/// What an Agent was deployed against: a filesystem path plus an optional
/// qualifier identifying a class or function within that path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub path: String,
    pub qualifier: Option<String>,
}

impl Target {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            qualifier: None,
        }
    }

    pub fn with_qualifier(path: impl Into<String>, qualifier: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            qualifier: Some(qualifier.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: String,
    pub scope: Scope,
    pub target: Target,
    pub status: AgentStatus,
    pub parent_id: Option<String>,
    pub child_ids: Vec<String>,
    pub session_id: Uuid,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub findings: Vec<String>,
    pub created_card_ids: Vec<String>,
}
