use crate::api_types::{ContentBlock, Tool};
use crate::conversation::{ConversationState, SequenceCounter, ToolCallRequest};
use crate::error::ReasoningError;
use crate::llm::{CompletionParams, LlmClient};
use crate::prompts;
use crate::retry::{with_retry, RetryConfig};
use serde_json::Value;
use std::sync::Arc;
use warden_core::config::{LlmConfig, RetryPolicyConfig};
use warden_core::ToolArgs;

/// What the engine wants next.
#[derive(Debug, Clone, PartialEq)]
pub enum ReasoningResult {
    /// Execute these, in order, and report back.
    ToolCalls(Vec<ToolCallRequest>),
    /// The run is done; this is the answer for the operator.
    Final(String),
}

/// Wraps an [`LlmClient`] with the system prompt, sampling parameters and
/// rate-limit retries.
pub struct ReasoningClient {
    llm: Arc<dyn LlmClient>,
    retry: RetryConfig,
    system_prompt: String,
    params: CompletionParams,
    provider_name: String,
}

impl ReasoningClient {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            retry: RetryConfig::default(),
            system_prompt: prompts::SYSTEM_PROMPT.to_string(),
            params: CompletionParams::default(),
            provider_name: "reasoning engine".to_string(),
        }
    }

    pub fn from_config(llm: Arc<dyn LlmClient>, llm_cfg: &LlmConfig, retry: &RetryPolicyConfig) -> Self {
        Self {
            retry: RetryConfig::from(retry),
            system_prompt: prompts::system_prompt(llm_cfg.system_notes.as_deref()),
            params: CompletionParams {
                max_tokens: llm_cfg.max_tokens,
                temperature: llm_cfg.temperature,
            },
            provider_name: llm_cfg.model.clone(),
            ..Self::new(llm)
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Ask the engine for the next step. Rate limits are retried with backoff;
    /// any other failure is returned immediately.
    #[tracing::instrument(skip_all, fields(turns = conversation.len()))]
    pub async fn reason(
        &self,
        conversation: &ConversationState,
        tools: &[Tool],
        sequence: &mut SequenceCounter,
    ) -> Result<ReasoningResult, ReasoningError> {
        let messages = conversation.to_api_messages();
        let response = with_retry(&self.retry, &self.provider_name, || {
            self.llm.complete(
                &self.system_prompt,
                messages.clone(),
                tools.to_vec(),
                self.params.clone(),
            )
        })
        .await?;

        let mut text_parts = Vec::new();
        let mut calls = Vec::new();
        for block in response.content {
            match block {
                ContentBlock::Text { text } => text_parts.push(text),
                ContentBlock::ToolUse { id, name, input } => calls.push(ToolCallRequest {
                    id,
                    name,
                    arguments: into_args(input),
                    sequence: sequence.next(),
                }),
                ContentBlock::ToolResult { .. } => {}
            }
        }

        let text = text_parts.join("\n");
        if !calls.is_empty() {
            if !text.trim().is_empty() {
                tracing::debug!("Dropping preamble alongside tool calls: {}", text);
            }
            return Ok(ReasoningResult::ToolCalls(calls));
        }
        if text.trim().is_empty() {
            return Err(ReasoningError::EmptyResponse);
        }
        Ok(ReasoningResult::Final(text))
    }
}

/// Tool inputs are JSON objects; anything else is treated as no arguments.
fn into_args(input: Value) -> ToolArgs {
    match input {
        Value::Object(map) => map,
        Value::Null => ToolArgs::new(),
        other => {
            tracing::warn!("Tool input is not an object, ignoring: {}", other);
            ToolArgs::new()
        }
    }
}
