//! Operator approval for destructive tool calls.
//!
//! Each request gets a fresh correlation id and a one-shot channel. The first
//! of {approve, reject, timeout} to remove the pending entry decides; anything
//! arriving later finds no entry and is ignored.

use crate::conversation::ToolCallRequest;
use crate::error::GateError;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;
use warden_core::{
    ApprovalSignal, ButtonInteraction, ChannelSink, ConfirmationPrompt, Decision, MessageRef,
};

struct PendingConfirmation {
    tx: oneshot::Sender<ApprovalSignal>,
    tool: String,
    created_at: Instant,
}

/// An open approval request. Consumed by [`ConfirmationGate::wait`].
pub struct ConfirmationRequest {
    pub correlation_id: Uuid,
    pub affordance: MessageRef,
    rx: oneshot::Receiver<ApprovalSignal>,
}

/// What happened to an incoming button click.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Accepted,
    /// No pending request with that id: never existed, or already decided.
    Unknown,
    Unauthorized,
}

pub struct ConfirmationGate {
    sink: Arc<dyn ChannelSink>,
    pending: DashMap<Uuid, PendingConfirmation>,
}

impl ConfirmationGate {
    pub fn new(sink: Arc<dyn ChannelSink>) -> Self {
        Self {
            sink,
            pending: DashMap::new(),
        }
    }

    /// Register a pending request for `call` and post the approve/reject affordance.
    pub async fn open(
        &self,
        channel_id: &str,
        call: &ToolCallRequest,
        timeout: Duration,
    ) -> Result<ConfirmationRequest, GateError> {
        let correlation_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            correlation_id,
            PendingConfirmation {
                tx,
                tool: call.name.clone(),
                created_at: Instant::now(),
            },
        );

        let prompt = ConfirmationPrompt {
            correlation_id,
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            expires_in: timeout,
        };
        match self.sink.post_confirmation(channel_id, &prompt).await {
            Ok(affordance) => {
                tracing::info!(
                    "Awaiting approval for {} (id: {}, timeout: {}s)",
                    call.name,
                    correlation_id,
                    timeout.as_secs()
                );
                Ok(ConfirmationRequest {
                    correlation_id,
                    affordance,
                    rx,
                })
            }
            Err(e) => {
                self.pending.remove(&correlation_id);
                Err(GateError::Affordance(e))
            }
        }
    }

    /// Wait for the operator, at most `timeout`. Always retracts the affordance.
    pub async fn wait(&self, request: ConfirmationRequest, timeout: Duration) -> Decision {
        let ConfirmationRequest {
            correlation_id,
            affordance,
            mut rx,
        } = request;

        let decision = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(signal)) => decision_of(signal),
            Ok(Err(_)) => Decision::Expired,
            Err(_) => {
                if self.pending.remove(&correlation_id).is_some() {
                    Decision::Expired
                } else {
                    // A click won the race against the deadline; its sender
                    // was taken before we could remove it.
                    match rx.await {
                        Ok(signal) => decision_of(signal),
                        Err(_) => Decision::Expired,
                    }
                }
            }
        };

        tracing::info!("Confirmation {} resolved: {}", correlation_id, decision);
        if let Err(e) = self.sink.retract_confirmation(&affordance, decision).await {
            tracing::warn!("Failed to retract confirmation {}: {:#}", correlation_id, e);
        }
        decision
    }

    /// Route a button click to its pending request.
    pub fn signal(&self, interaction: &ButtonInteraction) -> SignalOutcome {
        if !interaction.authorized {
            tracing::warn!(
                "Ignoring {:?} on {} from unauthorized user {}",
                interaction.signal,
                interaction.correlation_id,
                interaction.actor_id
            );
            return SignalOutcome::Unauthorized;
        }
        let Some((_, pending)) = self.pending.remove(&interaction.correlation_id) else {
            tracing::debug!("No pending confirmation {}", interaction.correlation_id);
            return SignalOutcome::Unknown;
        };
        tracing::info!(
            "{:?} for {} by {} after {}ms",
            interaction.signal,
            pending.tool,
            interaction.actor_id,
            pending.created_at.elapsed().as_millis()
        );
        if pending.tx.send(interaction.signal).is_err() {
            // The waiter is gone (run aborted); nothing left to decide.
            return SignalOutcome::Unknown;
        }
        SignalOutcome::Accepted
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

fn decision_of(signal: ApprovalSignal) -> Decision {
    match signal {
        ApprovalSignal::Approve => Decision::Approved,
        ApprovalSignal::Reject => Decision::Rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSink {
        prompts: Mutex<Vec<Uuid>>,
        retracted: Mutex<Vec<Decision>>,
        fail_post: bool,
    }

    #[async_trait::async_trait]
    impl ChannelSink for FakeSink {
        async fn post_message(&self, _channel_id: &str, _text: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn post_confirmation(
            &self,
            channel_id: &str,
            prompt: &ConfirmationPrompt,
        ) -> anyhow::Result<MessageRef> {
            if self.fail_post {
                bail!("Missing Access");
            }
            self.prompts.lock().unwrap().push(prompt.correlation_id);
            Ok(MessageRef {
                channel_id: channel_id.to_string(),
                message_id: "m1".to_string(),
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

    fn ban_call() -> ToolCallRequest {
        ToolCallRequest {
            id: "toolu_1".into(),
            name: "ban_user".into(),
            arguments: json!({"user_id": "42"}).as_object().cloned().unwrap(),
            sequence: 1,
        }
    }

    fn click(id: Uuid, signal: ApprovalSignal) -> ButtonInteraction {
        ButtonInteraction {
            correlation_id: id,
            signal,
            actor_id: "7".into(),
            authorized: true,
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn test_approve() {
        let sink = Arc::new(FakeSink::default());
        let gate = ConfirmationGate::new(sink.clone());
        let req = gate.open("admin", &ban_call(), TIMEOUT).await.unwrap();
        let id = req.correlation_id;
        assert_eq!(gate.pending_count(), 1);

        assert_eq!(gate.signal(&click(id, ApprovalSignal::Approve)), SignalOutcome::Accepted);
        assert_eq!(gate.wait(req, TIMEOUT).await, Decision::Approved);
        assert_eq!(gate.pending_count(), 0);
        assert_eq!(*sink.retracted.lock().unwrap(), vec![Decision::Approved]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_then_duplicate_click() {
        let sink = Arc::new(FakeSink::default());
        let gate = ConfirmationGate::new(sink.clone());
        let req = gate.open("admin", &ban_call(), TIMEOUT).await.unwrap();
        let id = req.correlation_id;

        assert_eq!(gate.signal(&click(id, ApprovalSignal::Reject)), SignalOutcome::Accepted);
        assert_eq!(gate.signal(&click(id, ApprovalSignal::Approve)), SignalOutcome::Unknown);
        assert_eq!(gate.wait(req, TIMEOUT).await, Decision::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expires_and_late_click_ignored() {
        let sink = Arc::new(FakeSink::default());
        let gate = ConfirmationGate::new(sink.clone());
        let req = gate.open("admin", &ban_call(), TIMEOUT).await.unwrap();
        let id = req.correlation_id;

        let started = Instant::now();
        assert_eq!(gate.wait(req, TIMEOUT).await, Decision::Expired);
        assert!(started.elapsed() >= TIMEOUT);
        assert_eq!(gate.pending_count(), 0);
        assert_eq!(gate.signal(&click(id, ApprovalSignal::Approve)), SignalOutcome::Unknown);
        assert_eq!(*sink.retracted.lock().unwrap(), vec![Decision::Expired]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_click_during_wait() {
        let sink = Arc::new(FakeSink::default());
        let gate = Arc::new(ConfirmationGate::new(sink.clone()));
        let req = gate.open("admin", &ban_call(), TIMEOUT).await.unwrap();
        let id = req.correlation_id;

        let g = gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            g.signal(&click(id, ApprovalSignal::Approve));
        });
        let started = Instant::now();
        assert_eq!(gate.wait(req, TIMEOUT).await, Decision::Approved);
        assert!(started.elapsed() < TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_click_does_not_decide() {
        let sink = Arc::new(FakeSink::default());
        let gate = ConfirmationGate::new(sink.clone());
        let req = gate.open("admin", &ban_call(), TIMEOUT).await.unwrap();
        let id = req.correlation_id;

        let mut intruder = click(id, ApprovalSignal::Approve);
        intruder.authorized = false;
        assert_eq!(gate.signal(&intruder), SignalOutcome::Unauthorized);
        assert_eq!(gate.pending_count(), 1);
        assert_eq!(gate.wait(req, TIMEOUT).await, Decision::Expired);
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let gate = ConfirmationGate::new(Arc::new(FakeSink::default()));
        assert_eq!(
            gate.signal(&click(Uuid::new_v4(), ApprovalSignal::Approve)),
            SignalOutcome::Unknown
        );
    }

    #[tokio::test]
    async fn test_post_failure_leaves_nothing_pending() {
        let sink = Arc::new(FakeSink {
            fail_post: true,
            ..FakeSink::default()
        });
        let gate = ConfirmationGate::new(sink);
        assert!(matches!(
            gate.open("admin", &ban_call(), TIMEOUT).await,
            Err(GateError::Affordance(_))
        ));
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ids_are_unique() {
        let sink = Arc::new(FakeSink::default());
        let gate = ConfirmationGate::new(sink.clone());
        let a = gate.open("admin", &ban_call(), TIMEOUT).await.unwrap();
        let b = gate.open("admin", &ban_call(), TIMEOUT).await.unwrap();
        assert_ne!(a.correlation_id, b.correlation_id);
        assert_eq!(gate.pending_count(), 2);
    }
}
