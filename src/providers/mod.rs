pub mod execution;
pub mod llm;

pub use execution::{
    ExecutionEngine, ExecutionRequest, ExecutionResponse, LlmExecutionEngine, SimulatedEngine,
};
pub use llm::{AnthropicProvider, LLMProvider, MockLLMProvider, OpenAIProvider};
