use thiserror::Error;
use warden_core::ToolFailure;

#[derive(Debug, Error)]
pub enum DiscordError {
    /// Non-2xx from the REST API. `code` is Discord's JSON error code, if sent.
    #[error("Discord API error (HTTP {status}): {message}")]
    Api {
        status: u16,
        code: Option<u64>,
        message: String,
    },
    #[error("Discord transport error: {0}")]
    Transport(String),
    #[error("malformed Discord response: {0}")]
    Decode(String),
    #[error("{0}")]
    Lookup(String),
    #[error("gateway error: {0}")]
    Gateway(String),
}

impl DiscordError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DiscordError::Api { status: 404, .. })
    }
}

impl From<reqwest::Error> for DiscordError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            DiscordError::Decode(e.to_string())
        } else {
            DiscordError::Transport(e.to_string())
        }
    }
}

/// Failed lookups are the caller's fault; everything else is the platform's.
impl From<DiscordError> for ToolFailure {
    fn from(e: DiscordError) -> Self {
        match e {
            DiscordError::Lookup(msg) => ToolFailure::Validation(msg),
            other => ToolFailure::Platform(other.to_string()),
        }
    }
}
