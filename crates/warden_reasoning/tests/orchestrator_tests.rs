//! End-to-end tests for the orchestration loop.
//!
//! A ScriptedProvider stands in for the reasoning engine and a RecordingSink
//! for the chat platform, so whole runs can be driven without network access.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;
use warden_core::config::WardenConfig;
use warden_core::{
    ApprovalSignal, ButtonInteraction, ChannelSink, ConfirmationPrompt, Decision, InboundMessage,
    MessageRef, ToolArgs, ToolDescriptor, ToolFailure, ToolHandler, ToolInputSchema,
};
use warden_reasoning::api_types::ContentBlock;
use warden_reasoning::providers::mock::{
    rate_limited, text_response, tool_use_response, RecordedCall, ScriptedProvider,
};
use warden_reasoning::{
    CapKind, Orchestrator, ReasoningClient, RetryConfig, RunOutcome, SignalOutcome, ToolRegistry,
};

const ADMIN: &str = "100";

// ============================================================================
// Recording sink
// ============================================================================

struct RecordingSink {
    messages: Mutex<Vec<(String, String)>>,
    prompts: Mutex<Vec<ConfirmationPrompt>>,
    retracted: Mutex<Vec<Decision>>,
    confirmations: mpsc::UnboundedSender<Uuid>,
}

impl RecordingSink {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Uuid>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(Self {
            messages: Mutex::new(vec![]),
            prompts: Mutex::new(vec![]),
            retracted: Mutex::new(vec![]),
            confirmations: tx,
        });
        (sink, rx)
    }

    fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().unwrap().clone()
    }

    fn retracted(&self) -> Vec<Decision> {
        self.retracted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelSink for RecordingSink {
    async fn post_message(&self, channel_id: &str, text: &str) -> anyhow::Result<()> {
        self.messages
            .lock()
            .unwrap()
            .push((channel_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn post_confirmation(
        &self,
        channel_id: &str,
        prompt: &ConfirmationPrompt,
    ) -> anyhow::Result<MessageRef> {
        self.prompts.lock().unwrap().push(prompt.clone());
        let _ = self.confirmations.send(prompt.correlation_id);
        Ok(MessageRef {
            channel_id: channel_id.to_string(),
            message_id: prompt.correlation_id.to_string(),
        })
    }

    async fn retract_confirmation(
        &self,
        _affordance: &MessageRef,
        decision: Decision,
    ) -> anyhow::Result<()> {
        self.retracted.lock().unwrap().push(decision);
        Ok(())
    }
}

// ============================================================================
// Counting tool
// ============================================================================

struct CountingTool {
    name: &'static str,
    destructive: bool,
    calls: Arc<AtomicUsize>,
    result: Value,
}

#[async_trait]
impl ToolHandler for CountingTool {
    fn descriptor(&self) -> ToolDescriptor {
        let d = ToolDescriptor::new(self.name, "test tool", ToolInputSchema::empty());
        if self.destructive {
            d.destructive()
        } else {
            d
        }
    }

    async fn execute(&self, _args: &ToolArgs) -> Result<Value, ToolFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.result.clone())
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    orchestrator: Arc<Orchestrator>,
    llm: Arc<ScriptedProvider>,
    sink: Arc<RecordingSink>,
    confirmations: mpsc::UnboundedReceiver<Uuid>,
    list_channels: Arc<AtomicUsize>,
    list_roles: Arc<AtomicUsize>,
    ban_user: Arc<AtomicUsize>,
}

fn config() -> WardenConfig {
    let mut cfg = WardenConfig::default();
    cfg.discord.admin_channel_id = ADMIN.to_string();
    cfg.cooldowns.default_ms = 0;
    cfg.cooldowns.destructive_ms = 0;
    cfg.limits.message_cooldown_ms = 0;
    cfg
}

fn harness(llm: ScriptedProvider) -> Harness {
    harness_with(llm, config())
}

fn harness_with(llm: ScriptedProvider, cfg: WardenConfig) -> Harness {
    let llm = Arc::new(llm);
    let (sink, confirmations) = RecordingSink::new();
    let list_channels = Arc::new(AtomicUsize::new(0));
    let list_roles = Arc::new(AtomicUsize::new(0));
    let ban_user = Arc::new(AtomicUsize::new(0));

    let mut registry = ToolRegistry::with_cooldowns(cfg.cooldowns.clone());
    registry.register(Box::new(CountingTool {
        name: "list_channels",
        destructive: false,
        calls: list_channels.clone(),
        result: json!([{"id": "1", "name": "general"}, {"id": "2", "name": "mod-log"}]),
    }));
    registry.register(Box::new(CountingTool {
        name: "list_roles",
        destructive: false,
        calls: list_roles.clone(),
        result: json!([{"id": "9", "name": "Moderator"}]),
    }));
    registry.register(Box::new(CountingTool {
        name: "ban_user",
        destructive: true,
        calls: ban_user.clone(),
        result: json!({"status": "banned", "user_id": "42"}),
    }));

    let retry = RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(60),
        backoff_factor: 2.0,
        jitter: Duration::ZERO,
    };
    let reasoning = ReasoningClient::new(llm.clone()).with_retry(retry);
    let orchestrator = Arc::new(Orchestrator::new(
        reasoning,
        Arc::new(registry),
        sink.clone(),
        &cfg,
    ));

    Harness {
        orchestrator,
        llm,
        sink,
        confirmations,
        list_channels,
        list_roles,
        ban_user,
    }
}

fn operator_message(text: &str) -> InboundMessage {
    InboundMessage {
        channel_id: ADMIN.to_string(),
        author_id: "7".to_string(),
        text: text.to_string(),
        author_is_bot: false,
        authorized: true,
    }
}

fn click(id: Uuid, signal: ApprovalSignal) -> ButtonInteraction {
    ButtonInteraction {
        correlation_id: id,
        signal,
        actor_id: "7".to_string(),
        authorized: true,
    }
}

/// Tool results the engine saw on a given call, as (is_error, content).
fn observations(call: &RecordedCall) -> Vec<(bool, String)> {
    call.messages
        .iter()
        .flat_map(|m| m.content.iter())
        .filter_map(|b| match b {
            ContentBlock::ToolResult {
                content, is_error, ..
            } => Some((is_error.unwrap_or(false), content.clone())),
            _ => None,
        })
        .collect()
}

fn ban_script() -> ScriptedProvider {
    ScriptedProvider::new(vec![
        Ok(tool_use_response(&[("toolu_ban", "ban_user", json!({"user_id": "42"}))])),
        Ok(text_response("Done.")),
    ])
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_list_channels_end_to_end() {
    let h = harness(ScriptedProvider::new(vec![
        Ok(tool_use_response(&[("toolu_1", "list_channels", json!({}))])),
        Ok(text_response("There are 2 channels: #general and #mod-log.")),
    ]));

    let outcome = h
        .orchestrator
        .handle_message(&operator_message("list channels"))
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(h.list_channels.load(Ordering::SeqCst), 1);
    assert_eq!(h.llm.call_count(), 2);

    let seen = observations(&h.llm.calls()[1]);
    assert_eq!(seen.len(), 1);
    assert!(!seen[0].0);
    assert!(seen[0].1.contains("mod-log"));

    let posted = h.sink.messages();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].0, ADMIN);
    assert_eq!(posted[0].1, "There are 2 channels: #general and #mod-log.");
}

#[tokio::test(start_paused = true)]
async fn test_ban_rejected() {
    let mut h = harness(ban_script());
    let orch = h.orchestrator.clone();
    let run = tokio::spawn(async move { orch.handle_message(&operator_message("ban user 42")).await });

    let id = h.confirmations.recv().await.unwrap();
    // Nothing runs while the request is pending
    assert_eq!(h.ban_user.load(Ordering::SeqCst), 0);
    assert_eq!(
        h.orchestrator.gate().signal(&click(id, ApprovalSignal::Reject)),
        SignalOutcome::Accepted
    );

    let outcome = run.await.unwrap().unwrap();
    assert!(outcome.is_success());
    assert_eq!(h.ban_user.load(Ordering::SeqCst), 0);
    assert_eq!(h.sink.retracted(), vec![Decision::Rejected]);

    let seen = observations(&h.llm.calls()[1]);
    assert!(seen[0].0);
    assert!(seen[0].1.contains("rejected"));

    // A late approve for the same request changes nothing
    assert_eq!(
        h.orchestrator.gate().signal(&click(id, ApprovalSignal::Approve)),
        SignalOutcome::Unknown
    );
    assert_eq!(h.ban_user.load(Ordering::SeqCst), 0);
    assert_eq!(h.sink.messages().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ban_expired() {
    let h = harness(ban_script());
    let started = tokio::time::Instant::now();

    let outcome = h
        .orchestrator
        .handle_message(&operator_message("ban user 42"))
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_secs(60));
    assert!(outcome.is_success());
    assert_eq!(h.ban_user.load(Ordering::SeqCst), 0);
    assert_eq!(h.sink.retracted(), vec![Decision::Expired]);
    assert_eq!(h.orchestrator.gate().pending_count(), 0);

    let seen = observations(&h.llm.calls()[1]);
    assert!(seen[0].0);
    assert!(seen[0].1.contains("timed out"));
    assert_eq!(h.sink.messages().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ban_approved_executes_once() {
    let mut h = harness(ban_script());
    let orch = h.orchestrator.clone();
    let run = tokio::spawn(async move { orch.handle_message(&operator_message("ban user 42")).await });

    let id = h.confirmations.recv().await.unwrap();
    let prompt = h.sink.prompts.lock().unwrap()[0].clone();
    assert_eq!(prompt.tool_name, "ban_user");
    assert_eq!(prompt.arguments.get("user_id"), Some(&json!("42")));

    h.orchestrator.gate().signal(&click(id, ApprovalSignal::Approve));
    h.orchestrator.gate().signal(&click(id, ApprovalSignal::Approve));

    let outcome = run.await.unwrap().unwrap();
    assert!(outcome.is_success());
    assert_eq!(h.ban_user.load(Ordering::SeqCst), 1);
    assert_eq!(h.sink.retracted(), vec![Decision::Approved]);

    let seen = observations(&h.llm.calls()[1]);
    assert!(!seen[0].0);
    assert!(seen[0].1.contains("banned"));
}

#[tokio::test(start_paused = true)]
async fn test_unauthorized_click_cannot_approve() {
    let mut h = harness(ban_script());
    let orch = h.orchestrator.clone();
    let run = tokio::spawn(async move { orch.handle_message(&operator_message("ban user 42")).await });

    let id = h.confirmations.recv().await.unwrap();
    let mut intruder = click(id, ApprovalSignal::Approve);
    intruder.authorized = false;
    assert_eq!(h.orchestrator.gate().signal(&intruder), SignalOutcome::Unauthorized);

    run.await.unwrap().unwrap();
    assert_eq!(h.ban_user.load(Ordering::SeqCst), 0);
    assert_eq!(h.sink.retracted(), vec![Decision::Expired]);
}

#[tokio::test(start_paused = true)]
async fn test_no_26th_tool_call() {
    let batch: Vec<(String, Value)> = (0..30).map(|i| (format!("toolu_{i}"), json!({}))).collect();
    let calls: Vec<(&str, &str, Value)> = batch
        .iter()
        .map(|(id, input)| (id.as_str(), "list_roles", input.clone()))
        .collect();
    let h = harness(ScriptedProvider::new(vec![]).with_fallback(tool_use_response(&calls)));

    let outcome = h
        .orchestrator
        .handle_message(&operator_message("list roles a lot"))
        .await
        .unwrap();

    assert!(matches!(outcome, RunOutcome::CapReached { cap: CapKind::ToolCalls, .. }));
    assert_eq!(h.list_roles.load(Ordering::SeqCst), 25);
    assert_eq!(h.llm.call_count(), 1);
    let posted = h.sink.messages();
    assert_eq!(posted.len(), 1);
    assert!(posted[0].1.contains("tool call limit (25)"));
}

#[tokio::test(start_paused = true)]
async fn test_no_26th_reasoning_call() {
    let mut cfg = config();
    cfg.limits.max_tool_calls = 100;
    let h = harness_with(
        ScriptedProvider::new(vec![])
            .with_fallback(tool_use_response(&[("toolu_x", "list_channels", json!({}))])),
        cfg,
    );

    let outcome = h
        .orchestrator
        .handle_message(&operator_message("loop"))
        .await
        .unwrap();

    assert!(matches!(outcome, RunOutcome::CapReached { cap: CapKind::Iterations, .. }));
    assert_eq!(h.llm.call_count(), 25);
    assert_eq!(h.list_channels.load(Ordering::SeqCst), 25);
    assert!(h.sink.messages()[0].1.contains("reasoning step limit (25)"));
}

#[tokio::test(start_paused = true)]
async fn test_cooldown_observation() {
    let mut cfg = config();
    cfg.cooldowns.overrides.insert("list_roles".to_string(), 1_000);
    let h = harness_with(
        ScriptedProvider::new(vec![
            Ok(tool_use_response(&[
                ("a", "list_roles", json!({})),
                ("b", "list_roles", json!({})),
            ])),
            Ok(text_response("Roles listed.")),
        ]),
        cfg,
    );

    h.orchestrator
        .handle_message(&operator_message("list roles twice"))
        .await
        .unwrap();

    assert_eq!(h.list_roles.load(Ordering::SeqCst), 1);
    let seen = observations(&h.llm.calls()[1]);
    assert_eq!(seen.len(), 2);
    assert!(!seen[0].0);
    assert!(seen[1].0);
    assert!(seen[1].1.contains("cooldown"));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_tool_is_observed() {
    let h = harness(ScriptedProvider::new(vec![
        Ok(tool_use_response(&[("a", "drop_database", json!({}))])),
        Ok(text_response("I can't do that.")),
    ]));

    let outcome = h
        .orchestrator
        .handle_message(&operator_message("drop the database"))
        .await
        .unwrap();

    assert!(outcome.is_success());
    let seen = observations(&h.llm.calls()[1]);
    assert!(seen[0].0);
    assert!(seen[0].1.contains("unknown tool: drop_database"));
}

#[tokio::test(start_paused = true)]
async fn test_engine_unavailable_posts_error() {
    let h = harness(ScriptedProvider::new(vec![
        Err(rate_limited()),
        Err(rate_limited()),
        Err(rate_limited()),
    ]));

    let outcome = h
        .orchestrator
        .handle_message(&operator_message("list channels"))
        .await
        .unwrap();

    assert!(matches!(outcome, RunOutcome::Failed { .. }));
    assert_eq!(h.llm.call_count(), 3);
    let posted = h.sink.messages();
    assert_eq!(posted.len(), 1);
    assert!(posted[0].1.starts_with("❌"));
    assert!(posted[0].1.contains("unavailable"));
}

#[tokio::test(start_paused = true)]
async fn test_ignored_messages() {
    let h = harness(ScriptedProvider::new(vec![]).with_fallback(text_response("hi")));

    let mut elsewhere = operator_message("list channels");
    elsewhere.channel_id = "555".to_string();
    let mut stranger = operator_message("list channels");
    stranger.authorized = false;
    let mut bot = operator_message("list channels");
    bot.author_is_bot = true;

    for msg in [elsewhere, stranger, bot] {
        assert!(h.orchestrator.handle_message(&msg).await.is_none());
    }
    assert_eq!(h.llm.call_count(), 0);
    assert!(h.sink.messages().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_channel_memory_carries_history() {
    let h = harness(ScriptedProvider::new(vec![
        Ok(text_response("Hello.")),
        Ok(text_response("Still here.")),
    ]));

    h.orchestrator
        .handle_message(&operator_message("hello"))
        .await
        .unwrap();
    h.orchestrator
        .handle_message(&operator_message("are you there?"))
        .await
        .unwrap();

    let second = &h.llm.calls()[1];
    // user, assistant, user
    assert_eq!(second.messages.len(), 3);
    assert_eq!(h.orchestrator.memory().snapshot(ADMIN).await.unwrap().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_back_to_back_messages_are_spaced() {
    let mut cfg = config();
    cfg.limits.message_cooldown_ms = 2_000;
    let h = harness_with(
        ScriptedProvider::new(vec![
            Ok(text_response("One.")),
            Ok(text_response("Two.")),
            Ok(text_response("Three.")),
        ]),
        cfg,
    );

    for text in ["first", "second", "third"] {
        h.orchestrator
            .handle_message(&operator_message(text))
            .await
            .unwrap();
    }

    let calls = h.llm.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls[1].at - calls[0].at >= Duration::from_secs(2));
    assert!(calls[2].at - calls[1].at >= Duration::from_secs(2));
    assert_eq!(h.sink.messages().len(), 3);
}
