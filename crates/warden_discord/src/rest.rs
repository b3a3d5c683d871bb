use crate::components;
use crate::error::DiscordError;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use warden_core::config::DiscordConfig;
use warden_core::{ChannelSink, ConfirmationPrompt, Decision, MessageRef};

/// Discord's per-message character limit.
pub const MESSAGE_LIMIT: usize = 2000;

const DISCORD_EPOCH_MS: u64 = 1_420_070_400_000;
const BULK_DELETE_MAX_AGE_MS: u64 = 14 * 24 * 60 * 60 * 1000;

/// How 429 responses are retried. Discord tells us how long to wait; the
/// exponential fallback only applies when it does not.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    /// Total attempts per request, including the first.
    pub max_attempts: u32,
    /// Wait after the first 429 when the response carries no hint.
    pub fallback_delay: Duration,
    /// Longest single wait, hint or not.
    pub max_wait: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            fallback_delay: Duration::from_secs(1),
            max_wait: Duration::from_secs(30),
        }
    }
}

impl RateLimitPolicy {
    /// Wait after 429 number `attempt` (1-based). `hint_secs` is Discord's
    /// `retry_after`, in (fractional) seconds.
    pub fn delay_for(&self, attempt: u32, hint_secs: Option<f64>) -> Duration {
        let delay = match hint_secs.filter(|s| s.is_finite() && *s >= 0.0) {
            Some(secs) => Duration::from_secs_f64(secs),
            None => self.fallback_delay * 2u32.saturating_pow(attempt.saturating_sub(1)),
        };
        delay.min(self.max_wait)
    }
}

/// Thin client over the Discord REST API, scoped to one guild.
pub struct DiscordRest {
    client: Client,
    rate_limit: RateLimitPolicy,
    api_base: String,
    token: String,
    guild_id: String,
}

impl DiscordRest {
    pub fn new(config: &DiscordConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("DiscordBot (warden, ", env!("CARGO_PKG_VERSION"), ")"))
            .build()
            .context("Failed to build Discord HTTP client")?;
        Ok(Self {
            client,
            rate_limit: RateLimitPolicy::default(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            guild_id: config.guild_id.clone(),
        })
    }

    pub fn with_rate_limit_policy(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit = policy;
        self
    }

    pub fn guild_id(&self) -> &str {
        &self.guild_id
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        reason: Option<&str>,
    ) -> Result<Value, DiscordError> {
        let url = format!("{}{}", self.api_base, path);
        let mut attempt = 1;

        loop {
            let mut req = self
                .client
                .request(method.clone(), &url)
                .header("Authorization", format!("Bot {}", self.token));
            if let Some(body) = body {
                req = req.json(body);
            }
            if let Some(reason) = reason.filter(|r| !r.trim().is_empty()) {
                req = req.header("X-Audit-Log-Reason", encode_reason(reason));
            }

            let response = req.send().await?;
            let status = response.status();
            let header_hint = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<f64>().ok());
            let text = response.text().await?;
            tracing::debug!("{} {} -> {}", method, path, status);

            if status == StatusCode::TOO_MANY_REQUESTS && attempt < self.rate_limit.max_attempts {
                let wait = self.rate_limit.delay_for(attempt, retry_after_hint(&text).or(header_hint));
                tracing::warn!(
                    "{} {} rate limited on attempt {}/{}, retrying in {:.2}s",
                    method,
                    path,
                    attempt,
                    self.rate_limit.max_attempts,
                    wait.as_secs_f64()
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
                continue;
            }
            if !status.is_success() {
                return Err(api_error(status, &text));
            }
            if status == StatusCode::NO_CONTENT || text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text).map_err(|e| DiscordError::Decode(e.to_string()));
        }
    }

    async fn get(&self, path: &str) -> Result<Value, DiscordError> {
        self.call(Method::GET, path, None, None).await
    }

    // ------------------------------------------------------------------
    // Guild
    // ------------------------------------------------------------------

    pub async fn get_guild(&self) -> Result<Value, DiscordError> {
        self.get(&format!("/guilds/{}?with_counts=true", self.guild_id))
            .await
    }

    pub async fn guild_channels(&self) -> Result<Vec<Value>, DiscordError> {
        as_list(self.get(&format!("/guilds/{}/channels", self.guild_id)).await?)
    }

    pub async fn guild_roles(&self) -> Result<Vec<Value>, DiscordError> {
        as_list(self.get(&format!("/guilds/{}/roles", self.guild_id)).await?)
    }

    pub async fn guild_member(&self, user_id: &str) -> Result<Value, DiscordError> {
        match self
            .get(&format!("/guilds/{}/members/{}", self.guild_id, user_id))
            .await
        {
            Err(e) if e.is_not_found() => Err(DiscordError::Lookup(format!(
                "User '{}' not found in this server.",
                user_id
            ))),
            other => other,
        }
    }

    pub async fn create_channel(&self, body: &Value, reason: Option<&str>) -> Result<Value, DiscordError> {
        self.call(
            Method::POST,
            &format!("/guilds/{}/channels", self.guild_id),
            Some(body),
            reason,
        )
        .await
    }

    pub async fn delete_channel(&self, channel_id: &str, reason: Option<&str>) -> Result<Value, DiscordError> {
        self.call(Method::DELETE, &format!("/channels/{}", channel_id), None, reason)
            .await
    }

    pub async fn add_member_role(&self, user_id: &str, role_id: &str, reason: Option<&str>) -> Result<(), DiscordError> {
        self.call(
            Method::PUT,
            &format!("/guilds/{}/members/{}/roles/{}", self.guild_id, user_id, role_id),
            None,
            reason,
        )
        .await
        .map(|_| ())
    }

    pub async fn ban_member(
        &self,
        user_id: &str,
        delete_message_seconds: u64,
        reason: Option<&str>,
    ) -> Result<(), DiscordError> {
        let body = json!({ "delete_message_seconds": delete_message_seconds });
        self.call(
            Method::PUT,
            &format!("/guilds/{}/bans/{}", self.guild_id, user_id),
            Some(&body),
            reason,
        )
        .await
        .map(|_| ())
    }

    pub async fn kick_member(&self, user_id: &str, reason: Option<&str>) -> Result<(), DiscordError> {
        self.call(
            Method::DELETE,
            &format!("/guilds/{}/members/{}", self.guild_id, user_id),
            None,
            reason,
        )
        .await
        .map(|_| ())
    }

    pub async fn modify_member(&self, user_id: &str, body: &Value, reason: Option<&str>) -> Result<Value, DiscordError> {
        self.call(
            Method::PATCH,
            &format!("/guilds/{}/members/{}", self.guild_id, user_id),
            Some(body),
            reason,
        )
        .await
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    pub async fn channel_messages(&self, channel_id: &str, limit: u32) -> Result<Vec<Value>, DiscordError> {
        as_list(
            self.get(&format!("/channels/{}/messages?limit={}", channel_id, limit))
                .await?,
        )
    }

    pub async fn create_message(&self, channel_id: &str, body: &Value) -> Result<Value, DiscordError> {
        self.call(
            Method::POST,
            &format!("/channels/{}/messages", channel_id),
            Some(body),
            None,
        )
        .await
    }

    pub async fn get_message(&self, channel_id: &str, message_id: &str) -> Result<Value, DiscordError> {
        self.get(&format!("/channels/{}/messages/{}", channel_id, message_id))
            .await
    }

    pub async fn edit_message(&self, channel_id: &str, message_id: &str, body: &Value) -> Result<Value, DiscordError> {
        self.call(
            Method::PATCH,
            &format!("/channels/{}/messages/{}", channel_id, message_id),
            Some(body),
            None,
        )
        .await
    }

    pub async fn delete_message(&self, channel_id: &str, message_id: &str, reason: Option<&str>) -> Result<(), DiscordError> {
        self.call(
            Method::DELETE,
            &format!("/channels/{}/messages/{}", channel_id, message_id),
            None,
            reason,
        )
        .await
        .map(|_| ())
    }

    /// Delete up to `limit` of the most recent messages. Messages older than
    /// two weeks cannot be bulk-deleted and are removed one by one.
    pub async fn purge(&self, channel_id: &str, limit: u32, reason: Option<&str>) -> Result<usize, DiscordError> {
        let messages = self.channel_messages(channel_id, limit).await?;
        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let (recent, old): (Vec<String>, Vec<String>) = messages
            .iter()
            .filter_map(|m| m.get("id").and_then(Value::as_str).map(str::to_string))
            .partition(|id| bulk_deletable(id, now_ms));

        match recent.len() {
            0 => {}
            1 => self.delete_message(channel_id, &recent[0], reason).await?,
            _ => {
                let body = json!({ "messages": recent });
                self.call(
                    Method::POST,
                    &format!("/channels/{}/messages/bulk-delete", channel_id),
                    Some(&body),
                    reason,
                )
                .await?;
            }
        }
        let mut deleted = recent.len();
        for id in &old {
            match self.delete_message(channel_id, id, reason).await {
                Ok(()) => deleted += 1,
                // Someone else got there first.
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }

    /// Acknowledge a component interaction without changing the message yet.
    pub async fn ack_interaction(&self, interaction_id: &str, token: &str) -> Result<(), DiscordError> {
        let body = json!({ "type": 6 });
        self.call(
            Method::POST,
            &format!("/interactions/{}/{}/callback", interaction_id, token),
            Some(&body),
            None,
        )
        .await
        .map(|_| ())
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    pub async fn find_channel(&self, name: &str) -> Result<Value, DiscordError> {
        let channels = self.guild_channels().await?;
        match_channel(&channels, name).cloned()
    }

    pub async fn find_category(&self, name: &str) -> Result<Value, DiscordError> {
        let channels = self.guild_channels().await?;
        match_category(&channels, name).cloned()
    }

    pub async fn find_role(&self, name: &str) -> Result<Value, DiscordError> {
        let roles = self.guild_roles().await?;
        match_role(&roles, name).cloned()
    }
}

#[async_trait]
impl ChannelSink for DiscordRest {
    async fn post_message(&self, channel_id: &str, text: &str) -> anyhow::Result<()> {
        let text = if text.trim().is_empty() { "✅ Done." } else { text };
        for chunk in split_message(text, MESSAGE_LIMIT) {
            let body = json!({
                "content": chunk,
                "allowed_mentions": { "parse": [] },
            });
            self.create_message(channel_id, &body).await?;
        }
        Ok(())
    }

    async fn post_confirmation(
        &self,
        channel_id: &str,
        prompt: &ConfirmationPrompt,
    ) -> anyhow::Result<MessageRef> {
        let posted = self
            .create_message(channel_id, &components::confirmation_message(prompt))
            .await?;
        let message_id = posted
            .get("id")
            .and_then(Value::as_str)
            .context("Discord did not return a message id for the confirmation")?;
        Ok(MessageRef {
            channel_id: channel_id.to_string(),
            message_id: message_id.to_string(),
        })
    }

    async fn retract_confirmation(
        &self,
        affordance: &MessageRef,
        decision: Decision,
    ) -> anyhow::Result<()> {
        let current = match self
            .get_message(&affordance.channel_id, &affordance.message_id)
            .await
        {
            Ok(m) => m,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let already_retracted = current
            .get("components")
            .and_then(Value::as_array)
            .map(|c| c.is_empty())
            .unwrap_or(true);
        if already_retracted {
            return Ok(());
        }

        let edit = components::retraction_edit(decision, current.pointer("/embeds/0"));
        match self
            .edit_message(&affordance.channel_id, &affordance.message_id, &edit)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn api_error(status: StatusCode, body: &str) -> DiscordError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|v| v.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.chars().take(300).collect());
    DiscordError::Api {
        status: status.as_u16(),
        code: parsed.as_ref().and_then(|v| v.get("code")).and_then(Value::as_u64),
        message,
    }
}

/// Discord puts the precise wait in the JSON body; the header is rounded.
fn retry_after_hint(body: &str) -> Option<f64> {
    serde_json::from_str::<Value>(body)
        .ok()?
        .get("retry_after")?
        .as_f64()
}

fn as_list(value: Value) -> Result<Vec<Value>, DiscordError> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(DiscordError::Decode(format!("expected a list, got {}", other))),
    }
}

/// Audit-log reasons travel in a header and must be percent-encoded.
fn encode_reason(reason: &str) -> String {
    url::form_urlencoded::byte_serialize(reason.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

fn bulk_deletable(snowflake: &str, now_ms: u64) -> bool {
    snowflake
        .parse::<u64>()
        .map(|id| (id >> 22) + DISCORD_EPOCH_MS)
        .map(|created_ms| now_ms.saturating_sub(created_ms) < BULK_DELETE_MAX_AGE_MS)
        .unwrap_or(false)
}

fn normalize(name: &str) -> String {
    name.trim().trim_start_matches('#').trim().to_lowercase()
}

fn name_of(v: &Value) -> &str {
    v.get("name").and_then(Value::as_str).unwrap_or_default()
}

/// Channel types: 4 is a category.
pub fn is_category(channel: &Value) -> bool {
    channel.get("type").and_then(Value::as_u64) == Some(4)
}

/// Find a non-category channel by case-insensitive name; a leading `#` is ignored.
pub fn match_channel<'a>(channels: &'a [Value], name: &str) -> Result<&'a Value, DiscordError> {
    let wanted = normalize(name);
    channels
        .iter()
        .find(|c| !is_category(c) && name_of(c).to_lowercase() == wanted)
        .ok_or_else(|| DiscordError::Lookup(format!("Channel '{}' not found.", name)))
}

pub fn match_category<'a>(channels: &'a [Value], name: &str) -> Result<&'a Value, DiscordError> {
    let wanted = name.trim().to_lowercase();
    channels
        .iter()
        .find(|c| is_category(c) && name_of(c).to_lowercase() == wanted)
        .ok_or_else(|| DiscordError::Lookup(format!("Category '{}' not found.", name)))
}

pub fn match_role<'a>(roles: &'a [Value], name: &str) -> Result<&'a Value, DiscordError> {
    let wanted = name.trim().trim_start_matches('@').to_lowercase();
    roles
        .iter()
        .find(|r| name_of(r).to_lowercase() == wanted)
        .ok_or_else(|| DiscordError::Lookup(format!("Role '{}' not found.", name)))
}

/// Split `text` into chunks of at most `limit` characters, preferring to break
/// at the last newline inside the window. Newlines at a break are dropped.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let window_end = match rest.char_indices().nth(limit) {
            Some((idx, _)) => idx,
            None => {
                chunks.push(rest.to_string());
                break;
            }
        };
        let split_at = match rest[..window_end].rfind('\n') {
            Some(0) | None => window_end,
            Some(nl) => nl,
        };
        chunks.push(rest[..split_at].to_string());
        rest = rest[split_at..].trim_start_matches('\n');
    }
    chunks
}
