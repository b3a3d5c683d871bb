//! Scripted LLM provider with deterministic responses for tests without API keys.
//!
//! Each `complete()` call pops the next scripted reply. When the script runs
//! out, the fallback reply (if any) is returned forever; otherwise the call
//! fails with an API error.

use crate::api_types::{ContentBlock, Message, MessagesResponse, Tool};
use crate::llm::{CompletionParams, LlmClient, LlmError};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::time::Instant;

pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<MessagesResponse, LlmError>>>,
    fallback: Option<MessagesResponse>,
    calls: Mutex<Vec<RecordedCall>>,
}

/// What the provider saw on one call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub at: Instant,
    pub messages: Vec<Message>,
    pub tool_names: Vec<String>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Result<MessagesResponse, LlmError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Reply with `response` once the script is exhausted.
    pub fn with_fallback(mut self, response: MessagesResponse) -> Self {
        self.fallback = Some(response);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl LlmClient for ScriptedProvider {
    async fn complete(
        &self,
        _system: &str,
        messages: Vec<Message>,
        tools: Vec<Tool>,
        _params: CompletionParams,
    ) -> Result<MessagesResponse, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                at: Instant::now(),
                messages,
                tool_names: tools.into_iter().map(|t| t.name).collect(),
            });
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match (next, &self.fallback) {
            (Some(reply), _) => reply,
            (None, Some(fallback)) => Ok(fallback.clone()),
            (None, None) => Err(LlmError::Api {
                status: 500,
                body: "script exhausted".to_string(),
            }),
        }
    }
}

/// A final-answer reply.
pub fn text_response(text: &str) -> MessagesResponse {
    MessagesResponse {
        content: vec![ContentBlock::Text {
            text: text.to_string(),
        }],
        stop_reason: Some("end_turn".to_string()),
    }
}

/// A reply proposing the given `(id, tool, input)` calls, in order.
pub fn tool_use_response(calls: &[(&str, &str, Value)]) -> MessagesResponse {
    MessagesResponse {
        content: calls
            .iter()
            .map(|(id, name, input)| ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input: input.clone(),
            })
            .collect(),
        stop_reason: Some("tool_use".to_string()),
    }
}

pub fn rate_limited() -> LlmError {
    LlmError::RateLimited {
        status: 429,
        retry_after: None,
    }
}
