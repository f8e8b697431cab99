pub mod agent;
pub mod card;
pub mod error;
pub mod events;
pub mod session;

pub use agent::{AgentMessage, AgentSnapshot, AgentStatus, MessageRole, Scope, Target, ToolCall};
pub use card::{AuditEntry, Card, CardStatus, CardType, CodeReference, Priority, ProposedFix};
pub use error::{CoreError, CoreResult};
pub use events::ProgressEvent;
pub use session::{
    AnalysisSession, ChangedFiles, GitInfo, IncrementalStats, SessionMode, SessionStatus,
    SessionSummary,
};
