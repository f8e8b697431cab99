pub mod gateway;
pub mod mock;
pub mod provider;

pub use gateway::ProviderGateway;
pub use mock::MockProvider;
pub use provider::{CompletionRequest, CompletionResponse, GatewayToolCall, Message, ProviderAdapter};
