use async_trait::async_trait;
use cartograph_types::CoreError;
use serde::{Deserialize, Serialize};

/// Closed message variant, replacing the source's free-form message
/// dictionaries. `arguments_json` stays opaque text so provider wire
/// shapes remain interoperable without the gateway interpreting them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User { content: String },
    Assistant { content: String, tool_calls: Vec<GatewayToolCall> },
    System { content: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayToolCall {
    pub id: String,
    pub name: String,
    pub arguments_json: String,
    pub result_json: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model_id: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub tool_definitions: Option<serde_json::Value>,
    pub estimated_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tool_calls: Vec<GatewayToolCall>,
    pub raw: serde_json::Value,
}

impl CompletionResponse {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// The narrow interface a concrete LLM vendor SDK is adapted to. The
/// gateway never interprets tool calls — they are surfaced to the caller
/// verbatim.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_kind(&self) -> &str;
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, CoreError>;
}
