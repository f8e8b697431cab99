use async_trait::async_trait;
use cartograph_types::CoreError;

use crate::provider::{CompletionRequest, CompletionResponse, Message, ProviderAdapter};

/// Deterministic, local, no-network adapter used for development and tests.
/// Mirrors the teacher's local-echo provider: it never fails, never calls
/// out, and produces a response shaped like a real completion so the rest
/// of the pipeline (token accounting, card creation) exercises real code
/// paths without a network dependency.
pub struct MockProvider;

#[async_trait]
impl ProviderAdapter for MockProvider {
    fn provider_kind(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, CoreError> {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find_map(|m| match m {
                Message::User { content } => Some(content.clone()),
                _ => None,
            })
            .unwrap_or_default();

        let content = format!("[mock:{}] reviewed {} chars of input", request.model_id, last_user.len());
        let output_tokens = (content.len() / 4).max(1) as u64;
        let input_tokens = (last_user.len() / 4).max(1) as u64;

        Ok(CompletionResponse {
            content,
            input_tokens,
            output_tokens,
            tool_calls: Vec::new(),
            raw: serde_json::json!({ "provider": "mock" }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_a_deterministic_shape() {
        let provider = MockProvider;
        let req = CompletionRequest {
            model_id: "mock-1".into(),
            messages: vec![Message::User { content: "fn add(a, b) { a + b }".into() }],
            max_tokens: 256,
            tool_definitions: None,
            estimated_tokens: 50,
        };
        let resp = provider.complete(&req).await.unwrap();
        assert!(resp.content.contains("mock-1"));
        assert!(resp.input_tokens > 0);
        assert!(resp.output_tokens > 0);
    }
}
