pub mod api_types;
pub mod client;
pub mod confirmation;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod prompts;
pub mod providers;
pub mod rate_limiter;
pub mod retry;
pub mod tool_registry;

pub use client::{ReasoningClient, ReasoningResult};
pub use confirmation::{ConfirmationGate, SignalOutcome};
pub use conversation::{ConversationMemory, ConversationState, Observation, ToolCallRequest};
pub use error::{GateError, ReasoningError, RegistryError, ToolExecutionError};
pub use llm::{LlmClient, LlmError};
pub use orchestrator::{CapKind, Orchestrator, RunOutcome};
pub use rate_limiter::RateLimiter;
pub use retry::RetryConfig;
pub use tool_registry::ToolRegistry;
