//! The reason → act → observe loop that serves one operator message.

use crate::api_types::Tool;
use crate::client::{ReasoningClient, ReasoningResult};
use crate::confirmation::ConfirmationGate;
use crate::conversation::{
    ConversationMemory, ConversationState, Observation, SequenceCounter, ToolCallRequest,
};
use crate::error::ReasoningError;
use crate::rate_limiter::RateLimiter;
use crate::tool_registry::ToolRegistry;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use warden_core::config::{LimitsConfig, WardenConfig};
use warden_core::{ChannelSink, Decision, InboundMessage};

const MAX_TOOL_RESULT_LEN: usize = 8192;
const ARGS_PREVIEW_LEN: usize = 200;
const CAP_SUMMARY_PREVIEW_LEN: usize = 300;

// ============================================================================
// Budget
// ============================================================================

#[derive(Debug, Clone)]
pub struct RunLimits {
    pub max_tool_calls: u32,
    pub max_iterations: u32,
    pub confirmation_timeout: Duration,
    pub message_cooldown: Duration,
}

impl From<&LimitsConfig> for RunLimits {
    fn from(cfg: &LimitsConfig) -> Self {
        Self {
            max_tool_calls: cfg.max_tool_calls,
            max_iterations: cfg.max_iterations,
            confirmation_timeout: cfg.confirmation_timeout(),
            message_cooldown: cfg.message_cooldown(),
        }
    }
}

impl Default for RunLimits {
    fn default() -> Self {
        Self::from(&LimitsConfig::default())
    }
}

/// Counters for one run. Both only ever go up.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunBudget {
    pub tool_calls: u32,
    pub iterations: u32,
}

impl RunBudget {
    pub fn tool_cap_reached(&self, limits: &RunLimits) -> bool {
        self.tool_calls >= limits.max_tool_calls
    }

    pub fn iteration_cap_reached(&self, limits: &RunLimits) -> bool {
        self.iterations >= limits.max_iterations
    }

    pub fn record_tool_call(&mut self) {
        self.tool_calls += 1;
    }

    pub fn record_iteration(&mut self) {
        self.iterations += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapKind {
    ToolCalls,
    Iterations,
}

impl fmt::Display for CapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapKind::ToolCalls => write!(f, "tool call"),
            CapKind::Iterations => write!(f, "reasoning step"),
        }
    }
}

// ============================================================================
// Outcome
// ============================================================================

#[derive(Debug)]
pub enum RunOutcome {
    Completed { text: String },
    /// Stopped at a run cap; `text` summarizes where it stopped.
    CapReached { cap: CapKind, text: String },
    Failed { error: ReasoningError },
}

impl RunOutcome {
    /// What gets posted back to the source channel.
    pub fn message(&self) -> String {
        match self {
            RunOutcome::Completed { text } | RunOutcome::CapReached { text, .. } => text.clone(),
            RunOutcome::Failed { error } => format!("❌ Request failed: {}", error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Completed { .. })
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct Orchestrator {
    reasoning: ReasoningClient,
    registry: Arc<ToolRegistry>,
    limiter: RateLimiter,
    gate: Arc<ConfirmationGate>,
    memory: ConversationMemory,
    sink: Arc<dyn ChannelSink>,
    limits: RunLimits,
    admin_channel_id: String,
    tools: Vec<Tool>,
    /// Earliest instant the next accepted message may start its run.
    next_start: Mutex<Option<Instant>>,
}

impl Orchestrator {
    pub fn new(
        reasoning: ReasoningClient,
        registry: Arc<ToolRegistry>,
        sink: Arc<dyn ChannelSink>,
        config: &WardenConfig,
    ) -> Self {
        let tools = registry.api_tools();
        Self {
            reasoning,
            limiter: RateLimiter::from_registry(&registry),
            gate: Arc::new(ConfirmationGate::new(sink.clone())),
            memory: ConversationMemory::new(&config.memory),
            limits: RunLimits::from(&config.limits),
            admin_channel_id: config.discord.admin_channel_id.clone(),
            registry,
            sink,
            tools,
            next_start: Mutex::new(None),
        }
    }

    /// Gate that button interactions are routed to.
    pub fn gate(&self) -> &Arc<ConfirmationGate> {
        &self.gate
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    /// Only authorized humans in the admin channel start runs.
    pub fn accepts(&self, msg: &InboundMessage) -> bool {
        msg.channel_id == self.admin_channel_id
            && !msg.author_is_bot
            && msg.authorized
            && !msg.text.trim().is_empty()
    }

    /// Serve one inbound message: run the loop and post the outcome.
    /// Returns `None` if the message was ignored.
    pub async fn handle_message(&self, msg: &InboundMessage) -> Option<RunOutcome> {
        if !self.accepts(msg) {
            tracing::debug!(
                "Ignoring message from {} in {} (bot: {}, authorized: {})",
                msg.author_id,
                msg.channel_id,
                msg.author_is_bot,
                msg.authorized
            );
            return None;
        }
        self.pace_intake().await;
        tracing::info!("Run started by {} in {}", msg.author_id, msg.channel_id);
        let outcome = self.run(&msg.channel_id, &msg.text).await;
        if let Err(e) = self.sink.post_message(&msg.channel_id, &outcome.message()).await {
            tracing::error!("Failed to post run outcome to {}: {:#}", msg.channel_id, e);
        }
        Some(outcome)
    }

    /// Space run starts at least `message_cooldown` apart. Messages wait their
    /// turn; none are dropped.
    async fn pace_intake(&self) {
        let cooldown = self.limits.message_cooldown;
        if cooldown.is_zero() {
            return;
        }
        let start_at = {
            let mut next = self.next_start.lock().await;
            let now = Instant::now();
            let start_at = next.map_or(now, |n| n.max(now));
            *next = Some(start_at + cooldown);
            start_at
        };
        if start_at > Instant::now() {
            tracing::debug!("Message cooldown: waiting {}ms", (start_at - Instant::now()).as_millis());
            tokio::time::sleep_until(start_at).await;
        }
    }

    /// Drive the loop for `text` until a final answer, a cap, or a reasoning failure.
    pub async fn run(&self, channel_id: &str, text: &str) -> RunOutcome {
        let mut conversation = self.memory.checkout(channel_id).await;
        let mut budget = RunBudget::default();
        let mut sequence = SequenceCounter::default();
        let started = Instant::now();

        conversation.push_user(text);

        let outcome = loop {
            if budget.iteration_cap_reached(&self.limits) {
                break self.cap_hit(&mut conversation, CapKind::Iterations, &budget);
            }

            let calls = match self
                .reasoning
                .reason(&conversation, &self.tools, &mut sequence)
                .await
            {
                Ok(ReasoningResult::Final(text)) => {
                    conversation.push_assistant_text(&text);
                    break RunOutcome::Completed { text };
                }
                Ok(ReasoningResult::ToolCalls(calls)) => calls,
                Err(error) => {
                    tracing::error!("Run failed: {}", error);
                    conversation.push_assistant_text(&format!("(request failed: {})", error));
                    break RunOutcome::Failed { error };
                }
            };

            tracing::info!("Engine proposed {} tool call(s)", calls.len());
            conversation.push_tool_calls(&calls);

            let mut capped = false;
            for call in &calls {
                if capped || budget.tool_cap_reached(&self.limits) {
                    capped = true;
                    conversation.push_observation(Observation::failure(
                        call,
                        format!(
                            "Skipped: run limit of {} tool calls reached.",
                            self.limits.max_tool_calls
                        ),
                    ));
                    continue;
                }
                budget.record_tool_call();
                let observation = self.process_call(channel_id, call).await;
                conversation.push_observation(observation);
            }
            budget.record_iteration();

            if capped {
                break self.cap_hit(&mut conversation, CapKind::ToolCalls, &budget);
            }
        };

        tracing::info!(
            "Run finished in {}ms: {} tool call(s), {} iteration(s), success: {}",
            started.elapsed().as_millis(),
            budget.tool_calls,
            budget.iterations,
            outcome.is_success()
        );
        outcome
    }

    /// Rate limit, confirm if destructive, then dispatch one call.
    #[tracing::instrument(skip_all, fields(tool = %call.name, seq = call.sequence))]
    async fn process_call(&self, channel_id: &str, call: &ToolCallRequest) -> Observation {
        let now = Instant::now();
        if !self.limiter.check_and_record(&call.name, now) {
            let wait = self.limiter.remaining(&call.name, now);
            tracing::warn!("{} is on cooldown ({}ms left)", call.name, wait.as_millis());
            return Observation::failure(
                call,
                format!(
                    "Tool '{}' is on cooldown; try again in {:.1}s.",
                    call.name,
                    wait.as_secs_f64()
                ),
            );
        }

        let descriptor = match self.registry.resolve(&call.name) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("Engine asked for {}", e);
                return Observation::failure(call, format!("Error: {}", e));
            }
        };

        if descriptor.destructive {
            let timeout = self.limits.confirmation_timeout;
            let request = match self.gate.open(channel_id, call, timeout).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!("Confirmation for {} could not be opened: {:#}", call.name, e);
                    return Observation::failure(call, format!("Not executed: {}", e));
                }
            };
            match self.gate.wait(request, timeout).await {
                Decision::Approved => {}
                Decision::Rejected => {
                    tracing::warn!("{} rejected by operator", call.name);
                    return Observation::failure(
                        call,
                        format!("The operator rejected this {} call; it was not executed.", call.name),
                    );
                }
                Decision::Expired => {
                    tracing::warn!("{} approval expired", call.name);
                    return Observation::failure(
                        call,
                        format!(
                            "No approval within {}s; the {} call timed out and was not executed.",
                            timeout.as_secs(),
                            call.name
                        ),
                    );
                }
            }
        }

        self.dispatch(call).await
    }

    async fn dispatch(&self, call: &ToolCallRequest) -> Observation {
        let started = Instant::now();
        let result = self.registry.execute(&call.name, &call.arguments).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let args = args_preview(call);

        match result {
            Ok(value) => {
                tracing::info!(
                    target: "warden::audit",
                    tool = %call.name,
                    sequence = call.sequence,
                    outcome = "ok",
                    duration_ms,
                    args = %args,
                    "tool executed"
                );
                let body = serde_json::to_string(&value).unwrap_or_else(|_| value.to_string());
                Observation::success(call, sanitize_tool_result(&body))
            }
            Err(e) => {
                tracing::info!(
                    target: "warden::audit",
                    tool = %call.name,
                    sequence = call.sequence,
                    outcome = "error",
                    duration_ms,
                    args = %args,
                    error = %e,
                    "tool executed"
                );
                Observation::failure(call, sanitize_tool_result(&format!("Error: {}", e)))
            }
        }
    }

    fn cap_hit(&self, conversation: &mut ConversationState, cap: CapKind, budget: &RunBudget) -> RunOutcome {
        let limit = match cap {
            CapKind::ToolCalls => self.limits.max_tool_calls,
            CapKind::Iterations => self.limits.max_iterations,
        };
        tracing::warn!(
            "Run stopped at the {} limit ({}): {} tool call(s), {} iteration(s)",
            cap,
            limit,
            budget.tool_calls,
            budget.iterations
        );
        let last = conversation
            .last_observation()
            .map(|o| format!("`{}`: {}", o.tool, truncate_chars(&o.content, CAP_SUMMARY_PREVIEW_LEN)))
            .unwrap_or_else(|| "none".to_string());
        let text = format!(
            "⚠️ Stopped after reaching the {} limit ({}). Last result: {}",
            cap, limit, last
        );
        conversation.push_assistant_text(&text);
        RunOutcome::CapReached { cap, text }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Bound a tool result before it goes back into the conversation.
pub fn sanitize_tool_result(text: &str) -> String {
    let mut result = text.to_string();
    if result.len() > MAX_TOOL_RESULT_LEN {
        let mut boundary = MAX_TOOL_RESULT_LEN;
        while boundary > 0 && !result.is_char_boundary(boundary) {
            boundary -= 1;
        }
        result.truncate(boundary);
        result.push_str("\n... [truncated, output too long]");
    }
    result
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push('…');
    out
}

fn args_preview(call: &ToolCallRequest) -> String {
    let raw = serde_json::to_string(&call.arguments).unwrap_or_default();
    truncate_chars(&raw, ARGS_PREVIEW_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_caps_checked_before_action() {
        let limits = RunLimits {
            max_tool_calls: 2,
            max_iterations: 1,
            confirmation_timeout: Duration::from_secs(60),
            message_cooldown: Duration::ZERO,
        };
        let mut budget = RunBudget::default();
        assert!(!budget.tool_cap_reached(&limits));
        budget.record_tool_call();
        assert!(!budget.tool_cap_reached(&limits));
        budget.record_tool_call();
        assert!(budget.tool_cap_reached(&limits));

        assert!(!budget.iteration_cap_reached(&limits));
        budget.record_iteration();
        assert!(budget.iteration_cap_reached(&limits));
    }

    #[test]
    fn test_sanitize_truncates_on_char_boundary() {
        let short = "{\"ok\":true}";
        assert_eq!(sanitize_tool_result(short), short);

        let long = "é".repeat(MAX_TOOL_RESULT_LEN);
        let out = sanitize_tool_result(&long);
        assert!(out.ends_with("[truncated, output too long]"));
        assert!(out.len() <= MAX_TOOL_RESULT_LEN + 40);
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("abc", 5), "abc");
        assert_eq!(truncate_chars("abcdef", 3), "abc…");
    }

    #[test]
    fn test_outcome_messages() {
        let done = RunOutcome::Completed { text: "Done.".into() };
        assert_eq!(done.message(), "Done.");
        assert!(done.is_success());

        let failed = RunOutcome::Failed {
            error: ReasoningError::EmptyResponse,
        };
        assert!(failed.message().starts_with("❌"));
        assert!(!failed.is_success());
    }
}
