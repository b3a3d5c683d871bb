//! Admin tools over the Discord REST API.
//!
//! Read-only lookups, a few non-destructive writes, and the destructive
//! moderation actions that must go through operator confirmation.

use crate::rest::{is_category, DiscordRest, MESSAGE_LIMIT};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use warden_core::tools::{optional_i64, optional_str, required_i64, required_str};
use warden_core::{ToolArgs, ToolDescriptor, ToolFailure, ToolHandler, ToolInputSchema};

pub const MAX_PURGE_MESSAGES: i64 = 100;
pub const MAX_RECENT_MESSAGES: i64 = 50;
/// Discord caps timeouts at 28 days.
pub const MAX_TIMEOUT_MINUTES: i64 = 40_320;
pub const MAX_BAN_DELETE_DAYS: i64 = 7;
const MESSAGE_PREVIEW_LEN: usize = 500;

/// Every tool in the catalog, ready for the registry.
pub fn all_tools(rest: Arc<DiscordRest>) -> Vec<Box<dyn ToolHandler>> {
    vec![
        Box::new(GetServerInfo(rest.clone())),
        Box::new(ListChannels(rest.clone())),
        Box::new(ListRoles(rest.clone())),
        Box::new(GetUserInfo(rest.clone())),
        Box::new(GetRecentMessages(rest.clone())),
        Box::new(SendMessage(rest.clone())),
        Box::new(CreateChannel(rest.clone())),
        Box::new(AssignRole(rest.clone())),
        Box::new(DeleteChannel(rest.clone())),
        Box::new(BanUser(rest.clone())),
        Box::new(KickUser(rest.clone())),
        Box::new(TimeoutUser(rest.clone())),
        Box::new(PurgeMessages(rest)),
    ]
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn id_of(v: &Value) -> Result<String, ToolFailure> {
    v.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ToolFailure::Platform("Discord object without an id".into()))
}

fn reason_of(args: &ToolArgs) -> Option<&str> {
    optional_str(args, "reason")
}

fn user_id_of(args: &ToolArgs) -> Result<&str, ToolFailure> {
    let id = required_str(args, "user_id")?.trim();
    let id = id.trim_start_matches("<@").trim_start_matches('!').trim_end_matches('>');
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
        return Err(ToolFailure::Validation(format!("'{}' is not a Discord user id", id)));
    }
    Ok(id)
}

fn channel_schema() -> Value {
    json!({"type": "string", "description": "Channel name, with or without a leading #"})
}

fn user_schema() -> Value {
    json!({"type": "string", "description": "Numeric Discord user id"})
}

fn reason_schema() -> Value {
    json!({"type": "string", "description": "Reason recorded in the audit log"})
}

fn channel_kind(t: u64) -> &'static str {
    match t {
        0 => "text",
        2 => "voice",
        4 => "category",
        5 => "announcement",
        13 => "stage",
        15 => "forum",
        _ => "other",
    }
}

// ============================================================================
// Read-only
// ============================================================================

pub struct GetServerInfo(Arc<DiscordRest>);

#[async_trait]
impl ToolHandler for GetServerInfo {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "get_server_info",
            "Get an overview of the server: name, owner, member count, boosts and channel/role counts.",
            ToolInputSchema::empty(),
        )
    }

    async fn execute(&self, _args: &ToolArgs) -> Result<Value, ToolFailure> {
        let guild = self.0.get_guild().await?;
        let channels = self.0.guild_channels().await?;
        let count = |t: u64| {
            channels
                .iter()
                .filter(|c| c.get("type").and_then(Value::as_u64) == Some(t))
                .count()
        };
        Ok(json!({
            "name": str_field(&guild, "name"),
            "id": str_field(&guild, "id"),
            "owner_id": str_field(&guild, "owner_id"),
            "member_count": guild.get("approximate_member_count").cloned().unwrap_or(Value::Null),
            "boost_level": guild.get("premium_tier").cloned().unwrap_or(Value::Null),
            "boost_count": guild.get("premium_subscription_count").cloned().unwrap_or(Value::Null),
            "text_channels": count(0),
            "voice_channels": count(2),
            "categories": count(4),
            "roles": guild.get("roles").and_then(Value::as_array).map(|r| r.len()).unwrap_or(0),
            "emojis": guild.get("emojis").and_then(Value::as_array).map(|e| e.len()).unwrap_or(0),
        }))
    }
}

pub struct ListChannels(Arc<DiscordRest>);

#[async_trait]
impl ToolHandler for ListChannels {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "list_channels",
            "List all channels grouped by category, with their type and id.",
            ToolInputSchema::empty(),
        )
    }

    async fn execute(&self, _args: &ToolArgs) -> Result<Value, ToolFailure> {
        let channels = self.0.guild_channels().await?;
        Ok(group_channels(&channels))
    }
}

/// `{category name: [channels]}`, plus "(no category)" for top-level channels.
pub fn group_channels(channels: &[Value]) -> Value {
    let mut sorted: Vec<&Value> = channels.iter().collect();
    sorted.sort_by_key(|c| c.get("position").and_then(Value::as_i64).unwrap_or(0));

    let mut grouped = serde_json::Map::new();
    for cat in sorted.iter().filter(|c| is_category(c)) {
        let cat_id = cat.get("id").and_then(Value::as_str);
        let members: Vec<Value> = sorted
            .iter()
            .filter(|c| !is_category(c) && c.get("parent_id").and_then(Value::as_str) == cat_id)
            .map(|c| summarize_channel(c))
            .collect();
        grouped.insert(str_field(cat, "name"), Value::Array(members));
    }
    let loose: Vec<Value> = sorted
        .iter()
        .filter(|c| !is_category(c) && c.get("parent_id").and_then(Value::as_str).is_none())
        .map(|c| summarize_channel(c))
        .collect();
    if !loose.is_empty() {
        grouped.insert("(no category)".to_string(), Value::Array(loose));
    }
    Value::Object(grouped)
}

fn summarize_channel(c: &Value) -> Value {
    json!({
        "name": str_field(c, "name"),
        "type": channel_kind(c.get("type").and_then(Value::as_u64).unwrap_or(u64::MAX)),
        "id": str_field(c, "id"),
    })
}

pub struct ListRoles(Arc<DiscordRest>);

#[async_trait]
impl ToolHandler for ListRoles {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "list_roles",
            "List all roles from highest to lowest, with color, position and flags.",
            ToolInputSchema::empty(),
        )
    }

    async fn execute(&self, _args: &ToolArgs) -> Result<Value, ToolFailure> {
        let mut roles = self.0.guild_roles().await?;
        roles.sort_by_key(|r| std::cmp::Reverse(r.get("position").and_then(Value::as_i64).unwrap_or(0)));
        Ok(Value::Array(
            roles
                .iter()
                .map(|r| {
                    json!({
                        "name": str_field(r, "name"),
                        "id": str_field(r, "id"),
                        "color": format!("#{:06x}", r.get("color").and_then(Value::as_u64).unwrap_or(0)),
                        "position": r.get("position").cloned().unwrap_or(Value::Null),
                        "mentionable": r.get("mentionable").cloned().unwrap_or(Value::Bool(false)),
                        "hoist": r.get("hoist").cloned().unwrap_or(Value::Bool(false)),
                    })
                })
                .collect(),
        ))
    }
}

pub struct GetUserInfo(Arc<DiscordRest>);

#[async_trait]
impl ToolHandler for GetUserInfo {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "get_user_info",
            "Get details about a server member: names, join date, roles, bot flag.",
            ToolInputSchema::object(json!({ "user_id": user_schema() }), &["user_id"]),
        )
    }

    async fn execute(&self, args: &ToolArgs) -> Result<Value, ToolFailure> {
        let user_id = user_id_of(args)?;
        let member = self.0.guild_member(user_id).await?;
        let roles = self.0.guild_roles().await?;
        let member_roles: Vec<&str> = member
            .get("roles")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let role_names: Vec<String> = roles
            .iter()
            .filter(|r| r.get("id").and_then(Value::as_str).map_or(false, |id| member_roles.contains(&id)))
            .map(|r| str_field(r, "name"))
            .collect();
        let user = member.get("user").cloned().unwrap_or(Value::Null);
        Ok(json!({
            "name": str_field(&user, "username"),
            "display_name": member
                .get("nick")
                .and_then(Value::as_str)
                .or_else(|| user.get("global_name").and_then(Value::as_str))
                .unwrap_or_else(|| user.get("username").and_then(Value::as_str).unwrap_or_default()),
            "id": user_id,
            "joined_at": member.get("joined_at").cloned().unwrap_or(Value::Null),
            "roles": role_names,
            "timed_out_until": member.get("communication_disabled_until").cloned().unwrap_or(Value::Null),
            "bot": user.get("bot").and_then(Value::as_bool).unwrap_or(false),
        }))
    }
}

pub struct GetRecentMessages(Arc<DiscordRest>);

#[async_trait]
impl ToolHandler for GetRecentMessages {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "get_recent_messages",
            "Read the most recent messages of a text channel (at most 50).",
            ToolInputSchema::object(
                json!({
                    "channel_name": channel_schema(),
                    "count": {"type": "integer", "description": "How many messages, 1-50"},
                }),
                &["channel_name", "count"],
            ),
        )
    }

    async fn execute(&self, args: &ToolArgs) -> Result<Value, ToolFailure> {
        let name = required_str(args, "channel_name")?;
        let count = required_i64(args, "count")?.clamp(1, MAX_RECENT_MESSAGES);
        let channel = self.0.find_channel(name).await?;
        let messages = self.0.channel_messages(&id_of(&channel)?, count as u32).await?;
        Ok(Value::Array(
            messages
                .iter()
                .map(|m| {
                    json!({
                        "author": m.pointer("/author/username").and_then(Value::as_str).unwrap_or_default(),
                        "content": str_field(m, "content").chars().take(MESSAGE_PREVIEW_LEN).collect::<String>(),
                        "timestamp": m.get("timestamp").cloned().unwrap_or(Value::Null),
                        "id": str_field(m, "id"),
                    })
                })
                .collect(),
        ))
    }
}

// ============================================================================
// Non-destructive writes
// ============================================================================

pub struct SendMessage(Arc<DiscordRest>);

#[async_trait]
impl ToolHandler for SendMessage {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "send_message",
            "Post a plain-text message to a channel as the bot.",
            ToolInputSchema::object(
                json!({
                    "channel_name": channel_schema(),
                    "message": {"type": "string", "description": "Message text (max 2000 characters)"},
                }),
                &["channel_name", "message"],
            ),
        )
    }

    async fn execute(&self, args: &ToolArgs) -> Result<Value, ToolFailure> {
        let name = required_str(args, "channel_name")?;
        let message = required_str(args, "message")?;
        if message.chars().count() > MESSAGE_LIMIT {
            return Err(ToolFailure::Validation(format!(
                "message is longer than {} characters",
                MESSAGE_LIMIT
            )));
        }
        let channel = self.0.find_channel(name).await?;
        let posted = self
            .0
            .create_message(&id_of(&channel)?, &json!({ "content": message }))
            .await?;
        Ok(json!({"status": "sent", "message_id": str_field(&posted, "id")}))
    }
}

pub struct CreateChannel(Arc<DiscordRest>);

#[async_trait]
impl ToolHandler for CreateChannel {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "create_channel",
            "Create a text, voice, stage or forum channel, optionally inside a category.",
            ToolInputSchema::object(
                json!({
                    "channel_name": {"type": "string", "description": "Name of the new channel"},
                    "type": {"type": "string", "enum": ["text", "voice", "stage", "forum"]},
                    "category": {"type": "string", "description": "Category to create it in"},
                    "topic": {"type": "string", "description": "Channel topic"},
                }),
                &["channel_name"],
            ),
        )
    }

    async fn execute(&self, args: &ToolArgs) -> Result<Value, ToolFailure> {
        let name = required_str(args, "channel_name")?;
        let kind = match optional_str(args, "type").unwrap_or("text") {
            "text" => 0,
            "voice" => 2,
            "stage" => 13,
            "forum" => 15,
            other => return Err(ToolFailure::Validation(format!("unknown channel type '{}'", other))),
        };
        let mut body = json!({ "name": name, "type": kind });
        if let Some(topic) = optional_str(args, "topic") {
            body["topic"] = json!(topic);
        }
        if let Some(category) = optional_str(args, "category") {
            let cat = self.0.find_category(category).await?;
            body["parent_id"] = json!(id_of(&cat)?);
        }
        let created = self.0.create_channel(&body, reason_of(args)).await?;
        Ok(json!({
            "status": "created",
            "name": str_field(&created, "name"),
            "id": str_field(&created, "id"),
            "type": channel_kind(kind),
        }))
    }
}

pub struct AssignRole(Arc<DiscordRest>);

#[async_trait]
impl ToolHandler for AssignRole {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "assign_role",
            "Give a role to a member.",
            ToolInputSchema::object(
                json!({
                    "user_id": user_schema(),
                    "role_name": {"type": "string", "description": "Role name"},
                }),
                &["user_id", "role_name"],
            ),
        )
    }

    async fn execute(&self, args: &ToolArgs) -> Result<Value, ToolFailure> {
        let user_id = user_id_of(args)?;
        let role = self.0.find_role(required_str(args, "role_name")?).await?;
        self.0.guild_member(user_id).await?;
        self.0
            .add_member_role(user_id, &id_of(&role)?, reason_of(args))
            .await?;
        Ok(json!({"status": "assigned", "user_id": user_id, "role": str_field(&role, "name")}))
    }
}

// ============================================================================
// Destructive
// ============================================================================

pub struct DeleteChannel(Arc<DiscordRest>);

#[async_trait]
impl ToolHandler for DeleteChannel {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "delete_channel",
            "Permanently delete a channel.",
            ToolInputSchema::object(
                json!({ "channel_name": channel_schema(), "reason": reason_schema() }),
                &["channel_name", "reason"],
            ),
        )
        .destructive()
    }

    async fn execute(&self, args: &ToolArgs) -> Result<Value, ToolFailure> {
        let name = required_str(args, "channel_name")?;
        let channel = self.0.find_channel(name).await?;
        self.0
            .delete_channel(&id_of(&channel)?, reason_of(args))
            .await?;
        Ok(json!({"status": "deleted", "channel": str_field(&channel, "name")}))
    }
}

pub struct BanUser(Arc<DiscordRest>);

#[async_trait]
impl ToolHandler for BanUser {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "ban_user",
            "Ban a member from the server, optionally deleting their recent messages.",
            ToolInputSchema::object(
                json!({
                    "user_id": user_schema(),
                    "reason": reason_schema(),
                    "delete_days": {"type": "integer", "description": "Days of messages to delete, 0-7"},
                }),
                &["user_id", "reason"],
            ),
        )
        .destructive()
    }

    async fn execute(&self, args: &ToolArgs) -> Result<Value, ToolFailure> {
        let user_id = user_id_of(args)?;
        let days = optional_i64(args, "delete_days")?
            .unwrap_or(0)
            .clamp(0, MAX_BAN_DELETE_DAYS);
        self.0
            .ban_member(user_id, days as u64 * 86_400, reason_of(args))
            .await?;
        Ok(json!({"status": "banned", "user_id": user_id, "reason": reason_of(args)}))
    }
}

pub struct KickUser(Arc<DiscordRest>);

#[async_trait]
impl ToolHandler for KickUser {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "kick_user",
            "Kick a member from the server.",
            ToolInputSchema::object(
                json!({ "user_id": user_schema(), "reason": reason_schema() }),
                &["user_id", "reason"],
            ),
        )
        .destructive()
    }

    async fn execute(&self, args: &ToolArgs) -> Result<Value, ToolFailure> {
        let user_id = user_id_of(args)?;
        self.0.guild_member(user_id).await?;
        self.0.kick_member(user_id, reason_of(args)).await?;
        Ok(json!({"status": "kicked", "user_id": user_id, "reason": reason_of(args)}))
    }
}

pub struct TimeoutUser(Arc<DiscordRest>);

#[async_trait]
impl ToolHandler for TimeoutUser {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "timeout_user",
            "Time a member out (they cannot talk or react) for up to 28 days.",
            ToolInputSchema::object(
                json!({
                    "user_id": user_schema(),
                    "duration_minutes": {"type": "integer", "description": "Minutes, 1-40320"},
                    "reason": reason_schema(),
                }),
                &["user_id", "duration_minutes", "reason"],
            ),
        )
        .destructive()
    }

    async fn execute(&self, args: &ToolArgs) -> Result<Value, ToolFailure> {
        let user_id = user_id_of(args)?;
        let minutes = required_i64(args, "duration_minutes")?;
        if minutes < 1 {
            return Err(ToolFailure::Validation("duration_minutes must be at least 1".into()));
        }
        let minutes = minutes.min(MAX_TIMEOUT_MINUTES);
        let until = (Utc::now() + ChronoDuration::minutes(minutes)).to_rfc3339_opts(SecondsFormat::Secs, true);
        self.0
            .modify_member(
                user_id,
                &json!({ "communication_disabled_until": until }),
                reason_of(args),
            )
            .await?;
        Ok(json!({"status": "timed_out", "user_id": user_id, "until": until, "reason": reason_of(args)}))
    }
}

pub struct PurgeMessages(Arc<DiscordRest>);

#[async_trait]
impl ToolHandler for PurgeMessages {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "purge_messages",
            "Delete the most recent messages of a text channel (at most 100).",
            ToolInputSchema::object(
                json!({
                    "channel_name": channel_schema(),
                    "count": {"type": "integer", "description": "How many messages, 1-100"},
                    "reason": reason_schema(),
                }),
                &["channel_name", "count", "reason"],
            ),
        )
        .destructive()
    }

    async fn execute(&self, args: &ToolArgs) -> Result<Value, ToolFailure> {
        let name = required_str(args, "channel_name")?;
        let count = required_i64(args, "count")?;
        if count < 1 {
            return Err(ToolFailure::Validation("count must be at least 1".into()));
        }
        let count = count.min(MAX_PURGE_MESSAGES);
        let channel = self.0.find_channel(name).await?;
        let deleted = self
            .0
            .purge(&id_of(&channel)?, count as u32, reason_of(args))
            .await?;
        Ok(json!({"status": "purged", "count": deleted, "channel": str_field(&channel, "name")}))
    }
}
