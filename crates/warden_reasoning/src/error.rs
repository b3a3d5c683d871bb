//! Error taxonomy of the orchestration core.
//!
//! Only `ReasoningError` ends a run. Registry and tool errors are turned into
//! observations and fed back to the reasoning engine.

use crate::llm::LlmError;
use thiserror::Error;
use warden_core::ToolFailure;

#[derive(Debug, Error)]
pub enum ReasoningError {
    /// Rate-limit retries exhausted.
    #[error("reasoning engine unavailable after {attempts} attempts: {last}")]
    Unavailable { attempts: u32, last: LlmError },
    /// Any non rate-limit failure; never retried.
    #[error("reasoning engine error: {0}")]
    Engine(LlmError),
    #[error("reasoning engine returned neither text nor tool calls")]
    EmptyResponse,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    #[error("unknown tool: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionCause {
    #[error(transparent)]
    NotFound(#[from] RegistryError),
    #[error(transparent)]
    Failed(#[from] ToolFailure),
}

/// Uniform wrapper for everything that can go wrong while dispatching a tool.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("tool '{tool}' failed: {cause}")]
pub struct ToolExecutionError {
    pub tool: String,
    pub cause: ExecutionCause,
}

impl ToolExecutionError {
    pub fn new(tool: &str, cause: impl Into<ExecutionCause>) -> Self {
        Self {
            tool: tool.to_string(),
            cause: cause.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("could not post the approval request: {0}")]
    Affordance(#[source] anyhow::Error),
}
