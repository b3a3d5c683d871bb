pub mod config;
pub mod tools;

pub use config::WardenConfig;
pub use tools::{Tool, ToolArgs, ToolDescriptor, ToolFailure, ToolHandler, ToolInputSchema};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// An operator message, normalized by the platform adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel_id: String,
    pub author_id: String,
    pub text: String,
    pub author_is_bot: bool,
    /// Resolved by the adapter's authorizer before the event reaches the loop.
    pub authorized: bool,
}

/// What the operator clicked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalSignal {
    Approve,
    Reject,
}

/// A click on a confirmation button.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButtonInteraction {
    pub correlation_id: Uuid,
    pub signal: ApprovalSignal,
    pub actor_id: String,
    pub authorized: bool,
}

/// Everything the platform adapter feeds into the bot.
#[derive(Debug, Clone)]
pub enum PlatformEvent {
    Message(InboundMessage),
    Interaction(ButtonInteraction),
}

/// Terminal state of a confirmation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
    Expired,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Approved => write!(f, "approved"),
            Decision::Rejected => write!(f, "rejected"),
            Decision::Expired => write!(f, "expired"),
        }
    }
}

/// Handle to a message the bot posted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub channel_id: String,
    pub message_id: String,
}

/// Content of an approval affordance for a destructive tool call.
#[derive(Debug, Clone)]
pub struct ConfirmationPrompt {
    pub correlation_id: Uuid,
    pub tool_name: String,
    pub arguments: ToolArgs,
    pub expires_in: Duration,
}

/// Outbound side of the chat platform.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    async fn post_message(&self, channel_id: &str, text: &str) -> anyhow::Result<()>;

    /// Post an approve/reject affordance bound to `prompt.correlation_id`.
    async fn post_confirmation(
        &self,
        channel_id: &str,
        prompt: &ConfirmationPrompt,
    ) -> anyhow::Result<MessageRef>;

    /// Remove the affordance's buttons and show the outcome.
    /// Retracting an already-retracted affordance must succeed.
    async fn retract_confirmation(
        &self,
        affordance: &MessageRef,
        decision: Decision,
    ) -> anyhow::Result<()>;
}
