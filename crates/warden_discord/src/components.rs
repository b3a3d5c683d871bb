//! Confirmation embed, its Approve/Reject buttons, and their custom ids.

use serde_json::{json, Value};
use uuid::Uuid;
use warden_core::{ApprovalSignal, ConfirmationPrompt, Decision};

const PREFIX: &str = "warden";
const COLOR_PENDING: u32 = 0xE74C3C;
const COLOR_APPROVED: u32 = 0x2ECC71;
const COLOR_CLOSED: u32 = 0x95A5A6;
const MAX_FIELD_LEN: usize = 1024;

/// `warden:approve:<uuid>` / `warden:reject:<uuid>`
pub fn custom_id(signal: ApprovalSignal, correlation_id: Uuid) -> String {
    let verb = match signal {
        ApprovalSignal::Approve => "approve",
        ApprovalSignal::Reject => "reject",
    };
    format!("{PREFIX}:{verb}:{correlation_id}")
}

/// Inverse of [`custom_id`]. Ids belonging to other components yield `None`.
pub fn parse_custom_id(raw: &str) -> Option<(ApprovalSignal, Uuid)> {
    let mut parts = raw.splitn(3, ':');
    if parts.next()? != PREFIX {
        return None;
    }
    let signal = match parts.next()? {
        "approve" => ApprovalSignal::Approve,
        "reject" => ApprovalSignal::Reject,
        _ => return None,
    };
    let id = Uuid::parse_str(parts.next()?).ok()?;
    Some((signal, id))
}

fn confirmation_embed(prompt: &ConfirmationPrompt) -> Value {
    let args = serde_json::to_string_pretty(&prompt.arguments).unwrap_or_else(|_| "{}".into());
    let mut args_block = format!("```json\n{}\n```", args);
    if args_block.chars().count() > MAX_FIELD_LEN {
        let body: String = args.chars().take(MAX_FIELD_LEN - 20).collect();
        args_block = format!("```json\n{}\n…```", body);
    }
    json!({
        "title": "🔒 Confirmation Required",
        "description": "The bot wants to execute a **destructive action**.",
        "color": COLOR_PENDING,
        "fields": [
            {"name": "Action", "value": format!("`{}`", prompt.tool_name), "inline": false},
            {"name": "Parameters", "value": args_block, "inline": false},
            {"name": "How to respond", "value": "Click **Approve** or **Reject** below.", "inline": false},
        ],
        "footer": {"text": format!("Expires in {}s", prompt.expires_in.as_secs())},
    })
}

/// Message body for a new confirmation.
pub fn confirmation_message(prompt: &ConfirmationPrompt) -> Value {
    json!({
        "embeds": [confirmation_embed(prompt)],
        "components": [{
            "type": 1,
            "components": [
                {
                    "type": 2,
                    "style": 3,
                    "label": "Approve",
                    "emoji": {"name": "✅"},
                    "custom_id": custom_id(ApprovalSignal::Approve, prompt.correlation_id),
                },
                {
                    "type": 2,
                    "style": 4,
                    "label": "Reject",
                    "emoji": {"name": "❌"},
                    "custom_id": custom_id(ApprovalSignal::Reject, prompt.correlation_id),
                },
            ],
        }],
    })
}

/// Edit applied to a confirmation once decided: buttons gone, footer shows the
/// outcome. `original` is the embed as currently posted, if it could be fetched.
pub fn retraction_edit(decision: Decision, original: Option<&Value>) -> Value {
    let (footer, color) = match decision {
        Decision::Approved => ("✅ Approved", COLOR_APPROVED),
        Decision::Rejected => ("❌ Rejected, action cancelled.", COLOR_CLOSED),
        Decision::Expired => ("⏰ Timed out, action cancelled.", COLOR_CLOSED),
    };
    let mut embed = original
        .filter(|e| e.is_object())
        .cloned()
        .unwrap_or_else(|| json!({"title": "🔒 Confirmation Required"}));
    embed["color"] = json!(color);
    embed["footer"] = json!({ "text": footer });
    json!({
        "components": [],
        "embeds": [embed],
    })
}
