pub mod budget;
pub mod gateway;
pub mod orchestrator;
pub mod providers;
pub mod retry;
pub mod subjects;

pub use budget::{AllocatedPrompt, TokenBudgetAllocator, TokenUsage, estimate_tokens};
pub use gateway::{ChatOptions, GatewayResponse, ProviderGateway};
pub use orchestrator::{ChatOrchestrator, ChatStart, ChatTurn, StartChat, TurnError};
pub use providers::{
    AnthropicProvider, ChatMessage, ChatRole, LlmProvider, LlmRequest, LlmResponse,
    OllamaProvider, OpenAiProvider, ProviderResult, Usage,
};
pub use retry::RetryPolicy;
pub use subjects::{InMemorySubjectDirectory, SubjectDirectory};
