use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

// ============================================================================
// Top-level config
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub discord: DiscordConfig,
    pub llm: LlmConfig,
    pub retry: RetryPolicyConfig,
    pub limits: LimitsConfig,
    pub cooldowns: CooldownConfig,
    pub memory: MemoryConfig,
    pub logging: LoggingConfig,
}

impl WardenConfig {
    /// Load config from a TOML file, falling back to defaults for missing fields.
    /// After loading, env var overrides are applied.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))
    }

    /// Like [`load`](Self::load), but a missing file means defaults plus env
    /// overrides. A file that exists and does not parse is still an error.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        match std::fs::metadata(path.as_ref()) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut cfg = Self::default();
                cfg.apply_env_overrides();
                Ok(cfg)
            }
            _ => Self::load(path),
        }
    }

    fn from_toml(content: &str) -> Result<Self> {
        let mut config: WardenConfig = toml::from_str(content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides on top of file-based config.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DISCORD_TOKEN") {
            self.discord.token = v;
        }
        if let Ok(v) = std::env::var("GUILD_ID") {
            self.discord.guild_id = v;
        }
        if let Ok(v) = std::env::var("ADMIN_CHANNEL_ID") {
            self.discord.admin_channel_id = v;
        }
        if let Ok(v) = std::env::var("ANTHROPIC_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("ANTHROPIC_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = std::env::var("LLM_BASE_URL") {
            self.llm.base_url = Some(v);
        }
        if let Ok(v) = std::env::var("LLM_MAX_TOKENS") {
            if let Ok(n) = v.parse() {
                self.llm.max_tokens = n;
            }
        }
        if let Ok(v) = std::env::var("LLM_TEMPERATURE") {
            if let Ok(n) = v.parse() {
                self.llm.temperature = n;
            }
        }
        if let Ok(v) = std::env::var("LLM_MAX_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                self.retry.max_attempts = n;
            }
        }
    }

    /// Reject configurations the bot cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.discord.token.trim().is_empty() {
            anyhow::bail!("Missing Discord bot token (discord.token or DISCORD_TOKEN)");
        }
        if self.discord.guild_id.trim().is_empty() {
            anyhow::bail!("Missing guild id (discord.guild_id or GUILD_ID)");
        }
        if self.discord.admin_channel_id.trim().is_empty() {
            anyhow::bail!("Missing admin channel id (discord.admin_channel_id or ADMIN_CHANNEL_ID)");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.limits.max_tool_calls == 0 || self.limits.max_iterations == 0 {
            anyhow::bail!("limits.max_tool_calls and limits.max_iterations must be at least 1");
        }
        Ok(())
    }
}

// ============================================================================
// Sub-configs
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    pub token: String,
    pub guild_id: String,
    /// The only channel the bot listens to.
    pub admin_channel_id: String,
    /// Members holding any of these roles may drive the bot.
    pub admin_role_ids: Vec<String>,
    /// Users allowed regardless of roles.
    pub admin_user_ids: Vec<String>,
    pub api_base: String,
    pub gateway_url: String,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            guild_id: String::new(),
            admin_channel_id: String::new(),
            admin_role_ids: vec![],
            admin_user_ids: vec![],
            api_base: "https://discord.com/api/v10".to_string(),
            gateway_url: "wss://gateway.discord.gg/?v=10&encoding=json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Server-specific instructions appended to the system prompt.
    pub system_notes: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-5".to_string(),
            base_url: None,
            api_key: None,
            max_tokens: 4096,
            temperature: 0.2,
            system_notes: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    /// Upper bound of the random jitter added to each delay. Keep it below
    /// `initial_delay_ms` so successive delays stay strictly increasing.
    pub jitter_ms: u64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 2_000,
            max_delay_ms: 60_000,
            backoff_factor: 2.0,
            jitter_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_tool_calls: u32,
    pub max_iterations: u32,
    pub confirmation_timeout_secs: u64,
    /// Minimum spacing between the starts of two operator requests. 0 disables.
    pub message_cooldown_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_tool_calls: 25,
            max_iterations: 25,
            confirmation_timeout_secs: 60,
            message_cooldown_ms: 2_000,
        }
    }
}

impl LimitsConfig {
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn message_cooldown(&self) -> Duration {
        Duration::from_millis(self.message_cooldown_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CooldownConfig {
    /// Applied to every non-destructive tool without an override. 0 disables.
    pub default_ms: u64,
    /// Applied to every destructive tool without an override. 0 disables.
    pub destructive_ms: u64,
    /// Per-tool overrides, keyed by tool name. 0 disables the cooldown.
    pub overrides: HashMap<String, u64>,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            default_ms: 1_000,
            destructive_ms: 2_000,
            overrides: HashMap::new(),
        }
    }
}

impl CooldownConfig {
    /// Resolve the cooldown for a tool. `None` means the tool is never throttled.
    pub fn cooldown_for(&self, tool: &str, destructive: bool) -> Option<Duration> {
        let ms = match self.overrides.get(tool) {
            Some(ms) => *ms,
            None if destructive => self.destructive_ms,
            None => self.default_ms,
        };
        (ms > 0).then(|| Duration::from_millis(ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub scope: MemoryScope,
    /// Turns kept per channel between runs when `scope = "channel"`.
    pub max_turns: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            scope: MemoryScope::Channel,
            max_turns: 40,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    /// Each operator message starts from an empty conversation.
    Run,
    /// History survives across messages, keyed by channel.
    #[default]
    Channel,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
    /// When set, logs are also written to a daily-rolling file in this directory.
    pub dir: Option<String>,
}

// ============================================================================
// Tests
// ============================================================================
