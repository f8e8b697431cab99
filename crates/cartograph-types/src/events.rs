use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::card::Card;

/// Orchestration lifecycle events published on the ProgressBus. Small,
/// JSON-serializable, and tagged so a `FanOut` consumer can deserialize them
/// without knowing which variant to expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    AnalysisStarted {
        session_id: Uuid,
        path: String,
        mode: String,
    },
    AnalysisProgress {
        session_id: Uuid,
        modules_done: u64,
        modules_total: u64,
        functions_done: u64,
        functions_total: u64,
        cache_hits: u64,
        cache_misses: u64,
    },
    CardCreated {
        card: Card,
    },
    CardUpdated {
        card: Card,
    },
    CardDeleted {
        card_id: String,
    },
    AgentStatus {
        agent_id: String,
        status: String,
        target: String,
    },
    AnalysisCompleted {
        session_id: Uuid,
        summary: serde_json::Value,
    },
    AnalysisError {
        session_id: Uuid,
        error: String,
    },
}
