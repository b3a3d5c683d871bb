//! Conversation state for a run, and the process-wide per-channel memory.

use crate::api_types::{ContentBlock, Message, Role};
use dashmap::DashMap;
use serde_json::Value;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use warden_core::config::{MemoryConfig, MemoryScope};
use warden_core::ToolArgs;

/// A tool call proposed by the reasoning engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    /// Engine-assigned id; echoed back with the observation.
    pub id: String,
    pub name: String,
    pub arguments: ToolArgs,
    /// Strictly increasing within one run.
    pub sequence: u64,
}

/// Issues sequence numbers for one run.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    next: u64,
}

impl SequenceCounter {
    pub fn next(&mut self) -> u64 {
        self.next += 1;
        self.next
    }
}

/// Result of a tool call (or of not running it), as seen by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub call_id: String,
    pub tool: String,
    pub content: String,
    pub is_error: bool,
}

impl Observation {
    pub fn success(call: &ToolCallRequest, content: String) -> Self {
        Self {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            content,
            is_error: false,
        }
    }

    pub fn failure(call: &ToolCallRequest, content: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            content: content.into(),
            is_error: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Turn {
    User { text: String },
    Assistant {
        text: Option<String>,
        tool_calls: Vec<ToolCallRequest>,
    },
    ToolResult(Observation),
}

/// Ordered turns of one conversation. Runs only ever append.
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    turns: Vec<Turn>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn push_user(&mut self, text: &str) {
        self.turns.push(Turn::User {
            text: text.to_string(),
        });
    }

    pub fn push_assistant_text(&mut self, text: &str) {
        self.turns.push(Turn::Assistant {
            text: Some(text.to_string()),
            tool_calls: vec![],
        });
    }

    pub fn push_tool_calls(&mut self, calls: &[ToolCallRequest]) {
        self.turns.push(Turn::Assistant {
            text: None,
            tool_calls: calls.to_vec(),
        });
    }

    pub fn push_observation(&mut self, observation: Observation) {
        self.turns.push(Turn::ToolResult(observation));
    }

    pub fn last_observation(&self) -> Option<&Observation> {
        self.turns.iter().rev().find_map(|t| match t {
            Turn::ToolResult(o) => Some(o),
            _ => None,
        })
    }

    /// Drop the oldest turns so at most `max_turns` remain, then keep dropping
    /// until a user turn leads. Tool calls never lose their observations this
    /// way: an orphaned result or assistant turn is never at the front.
    pub fn trim_to(&mut self, max_turns: usize) {
        if self.turns.len() > max_turns {
            let overflow = self.turns.len() - max_turns;
            self.turns.drain(0..overflow);
        }
        let first_user = self
            .turns
            .iter()
            .position(|t| matches!(t, Turn::User { .. }))
            .unwrap_or(self.turns.len());
        self.turns.drain(0..first_user);
    }

    /// Render as Messages API payload. Consecutive blocks of the same role are
    /// merged, so all results of one tool batch land in a single user message.
    pub fn to_api_messages(&self) -> Vec<Message> {
        let mut messages: Vec<Message> = Vec::new();
        for turn in &self.turns {
            let (role, blocks) = match turn {
                Turn::User { text } => (Role::User, vec![ContentBlock::Text { text: text.clone() }]),
                Turn::Assistant { text, tool_calls } => {
                    let mut blocks = Vec::new();
                    if let Some(text) = text.as_ref().filter(|t| !t.trim().is_empty()) {
                        blocks.push(ContentBlock::Text { text: text.clone() });
                    }
                    blocks.extend(tool_calls.iter().map(|c| ContentBlock::ToolUse {
                        id: c.id.clone(),
                        name: c.name.clone(),
                        input: Value::Object(c.arguments.clone()),
                    }));
                    (Role::Assistant, blocks)
                }
                Turn::ToolResult(o) => (
                    Role::User,
                    vec![ContentBlock::ToolResult {
                        tool_use_id: o.call_id.clone(),
                        content: o.content.clone(),
                        is_error: o.is_error.then_some(true),
                    }],
                ),
            };
            if blocks.is_empty() {
                continue;
            }
            match messages.last_mut() {
                Some(last) if last.role == role => last.content.extend(blocks),
                _ => messages.push(Message {
                    role,
                    content: blocks,
                }),
            }
        }
        messages
    }
}

// ============================================================================
// ConversationMemory
// ============================================================================

/// Process-wide conversation store. With `MemoryScope::Channel`, each channel
/// has one conversation guarded by its own lock, so runs on the same channel
/// serialize while other channels proceed.
pub struct ConversationMemory {
    scope: MemoryScope,
    max_turns: usize,
    channels: DashMap<String, Arc<Mutex<ConversationState>>>,
}

impl ConversationMemory {
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            scope: config.scope,
            max_turns: config.max_turns,
            channels: DashMap::new(),
        }
    }

    pub fn scope(&self) -> MemoryScope {
        self.scope
    }

    /// Take exclusive ownership of a channel's conversation for one run.
    pub async fn checkout(&self, channel_id: &str) -> ConversationLease {
        match self.scope {
            MemoryScope::Run => ConversationLease::Ephemeral(ConversationState::new()),
            MemoryScope::Channel => {
                let cell = self
                    .channels
                    .entry(channel_id.to_string())
                    .or_default()
                    .clone();
                let mut guard = cell.lock_owned().await;
                guard.trim_to(self.max_turns);
                ConversationLease::Shared(guard)
            }
        }
    }

    /// Snapshot of a channel's stored conversation.
    pub async fn snapshot(&self, channel_id: &str) -> Option<ConversationState> {
        let cell = self.channels.get(channel_id).map(|c| c.clone())?;
        let state = cell.lock().await;
        Some(state.clone())
    }
}

/// Exclusive access to the conversation a run appends to.
pub enum ConversationLease {
    Shared(OwnedMutexGuard<ConversationState>),
    Ephemeral(ConversationState),
}

impl Deref for ConversationLease {
    type Target = ConversationState;

    fn deref(&self) -> &ConversationState {
        match self {
            ConversationLease::Shared(guard) => guard,
            ConversationLease::Ephemeral(state) => state,
        }
    }
}

impl DerefMut for ConversationLease {
    fn deref_mut(&mut self) -> &mut ConversationState {
        match self {
            ConversationLease::Shared(guard) => guard,
            ConversationLease::Ephemeral(state) => state,
        }
    }
}
