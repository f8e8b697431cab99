use std::sync::Arc;

use cartograph_store::Store;
use cartograph_types::{
    AgentMessage, AgentSnapshot, AgentStatus, CoreError, CoreResult, MessageRole, Scope, Target,
    ToolCall,
};
use uuid::Uuid;

/// Owns the in-memory state of a single Agent activation: its message
/// history, accumulated token counts, and findings collected while it
/// walks its assigned scope. State only leaves this struct at status
/// transitions, when it is flushed to the `Store` in one transaction —
/// there is no shared mutable aliasing of this state across tasks, so
/// a parent never reaches into a running child's runtime directly.
pub struct AgentRuntime {
    store: Arc<Store>,
    id: String,
    scope: Scope,
    target: Target,
    parent_id: Option<String>,
    session_id: Uuid,
    status: AgentStatus,
    messages: Vec<AgentMessage>,
    findings: Vec<String>,
    created_card_ids: Vec<String>,
    child_ids: Vec<String>,
    tokens_in: u64,
    tokens_out: u64,
}

impl AgentRuntime {
    /// `Begin(parent_id?, scope, target)`: registers a new Agent row in the
    /// Store and transitions it `Idle -> Analyzing`.
    pub async fn begin(
        store: Arc<Store>,
        parent_id: Option<String>,
        scope: Scope,
        target: Target,
        session_id: Uuid,
    ) -> CoreResult<Self> {
        let record = store.create_agent(scope, target.clone(), parent_id.clone(), session_id)?;
        store.update_agent_status(&record.id, AgentStatus::Analyzing)?;
        tracing::debug!(agent_id = %record.id, scope = scope.code(), "agent activation began");
        Ok(Self {
            store,
            id: record.id,
            scope,
            target,
            parent_id,
            session_id,
            status: AgentStatus::Analyzing,
            messages: Vec::new(),
            findings: Vec::new(),
            created_card_ids: Vec::new(),
            child_ids: Vec::new(),
            tokens_in: 0,
            tokens_out: 0,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// `RecordMessage(role, content, ...)`: appends one turn to this
    /// activation's in-memory transcript and accumulates its token cost.
    pub fn record_message(
        &mut self,
        role: MessageRole,
        content: impl Into<String>,
        tokens_in: u64,
        tokens_out: u64,
        tool_calls: Vec<ToolCall>,
        latency_ms: u64,
    ) {
        self.tokens_in += tokens_in;
        self.tokens_out += tokens_out;
        self.messages.push(AgentMessage {
            ts: chrono::Utc::now(),
            role,
            content: content.into(),
            tokens_in,
            tokens_out,
            tool_calls,
            latency_ms,
        });
    }

    /// `AddFinding(summary)`: records a card-worthy observation. The caller
    /// is expected to have already created the Card via the Store and pass
    /// its id here so the activation's final summary can reference it.
    pub fn add_finding(&mut self, summary: impl Into<String>, created_card_id: Option<String>) {
        self.findings.push(summary.into());
        if let Some(card_id) = created_card_id {
            self.created_card_ids.push(card_id);
        }
    }

    /// `AttachChild(child_id)`: notes a spawned sub-agent against this
    /// activation's view. The Store already linked the two rows at the
    /// child's `Begin`; this keeps the in-memory snapshot consistent until
    /// the next flush.
    pub fn attach_child(&mut self, child_id: impl Into<String>) {
        self.child_ids.push(child_id.into());
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id.clone(),
            scope: self.scope,
            target: self.target.clone(),
            status: self.status,
            parent_id: self.parent_id.clone(),
            child_ids: self.child_ids.clone(),
            session_id: self.session_id,
            total_tokens_in: self.tokens_in,
            total_tokens_out: self.tokens_out,
            findings: self.findings.clone(),
            created_card_ids: self.created_card_ids.clone(),
        }
    }

    fn flush_usage(&self) -> CoreResult<()> {
        self.store.record_agent_usage(
            &self.id,
            self.tokens_in,
            self.tokens_out,
            &self.findings,
            &self.created_card_ids,
        )
    }

    /// `Complete(summary)`: flushes accumulated usage and findings, then
    /// transitions `Analyzing -> Reporting -> Completed`.
    pub async fn complete(mut self, _summary: impl Into<String>) -> CoreResult<AgentSnapshot> {
        self.flush_usage()?;
        self.store.update_agent_status(&self.id, AgentStatus::Reporting)?;
        self.status = AgentStatus::Reporting;
        self.store.update_agent_status(&self.id, AgentStatus::Completed)?;
        self.status = AgentStatus::Completed;
        tracing::info!(agent_id = %self.id, tokens_in = self.tokens_in, tokens_out = self.tokens_out, "agent activation completed");
        Ok(self.snapshot())
    }

    /// `Fail(error)`: flushes whatever was accumulated so far, records the
    /// failure as a finding, and transitions to `Error`. Does not swallow
    /// `error` — it is returned so the caller can propagate it after the
    /// activation's terminal state is durably recorded.
    pub async fn fail(mut self, error: CoreError) -> CoreError {
        self.findings.push(format!("activation failed: {error}"));
        if let Err(flush_err) = self.flush_usage() {
            tracing::warn!(agent_id = %self.id, %flush_err, "failed to flush usage before marking agent failed");
        }
        if let Err(transition_err) = self.store.update_agent_status(&self.id, AgentStatus::Error) {
            tracing::warn!(agent_id = %self.id, %transition_err, "failed to record agent error status");
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartograph_core::ProgressBus;

    fn store() -> Arc<Store> {
        Arc::new(Store::open_in_memory(ProgressBus::new()).unwrap())
    }

    #[tokio::test]
    async fn begin_then_complete_flushes_usage_and_findings() {
        let store = store();
        let session_id = Uuid::new_v4();
        let mut runtime = AgentRuntime::begin(
            store.clone(),
            None,
            Scope::Module,
            Target::new("src/lib.rs"),
            session_id,
        )
        .await
        .unwrap();

        runtime.record_message(MessageRole::User, "analyze this module", 10, 0, vec![], 5);
        runtime.record_message(MessageRole::Assistant, "looks fine", 0, 20, vec![], 120);
        runtime.add_finding("no issues found", None);

        let id = runtime.id().to_string();
        let snapshot = runtime.complete("done").await.unwrap();
        assert_eq!(snapshot.status, AgentStatus::Completed);
        assert_eq!(snapshot.total_tokens_in, 10);
        assert_eq!(snapshot.total_tokens_out, 20);

        let record = store.get_agent(&id).unwrap();
        assert_eq!(record.total_tokens_in, 10);
        assert_eq!(record.findings, vec!["no issues found".to_string()]);
    }

    #[tokio::test]
    async fn fail_transitions_to_error_and_returns_the_error() {
        let store = store();
        let runtime = AgentRuntime::begin(
            store.clone(),
            None,
            Scope::Function,
            Target::new("src/lib.rs"),
            Uuid::new_v4(),
        )
        .await
        .unwrap();
        let id = runtime.id().to_string();
        let err = runtime.fail(CoreError::UpstreamTransient("boom".into())).await;
        assert!(matches!(err, CoreError::UpstreamTransient(_)));
        let record = store.get_agent(&id).unwrap();
        assert_eq!(record.status, AgentStatus::Error);
    }
}
