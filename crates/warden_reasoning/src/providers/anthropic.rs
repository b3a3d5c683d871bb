use crate::api_types::{Message, MessagesRequest, MessagesResponse, Tool};
use crate::llm::{CompletionParams, LlmClient, LlmError};
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use warden_core::config::LlmConfig;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicClient {
    client: Client,
    api_key: String,
    model: String,
    url: String,
}

impl AnthropicClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .context("Missing Anthropic API key (llm.api_key or ANTHROPIC_API_KEY)")?;
        let base_url = config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);

        Ok(Self {
            client: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()?,
            api_key,
            model: config.model.clone(),
            // Handle trailing slash just in case
            url: format!("{}/v1/messages", base_url.trim_end_matches('/')),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait::async_trait]
impl LlmClient for AnthropicClient {
    #[tracing::instrument(skip(self, system, messages, tools, params), fields(model = %self.model))]
    async fn complete(
        &self,
        system: &str,
        messages: Vec<Message>,
        tools: Vec<Tool>,
        params: CompletionParams,
    ) -> Result<MessagesResponse, LlmError> {
        let request_body = MessagesRequest {
            model: self.model.clone(),
            system: (!system.is_empty()).then(|| system.to_string()),
            messages,
            max_tokens: params.max_tokens,
            temperature: Some(params.temperature),
            tools,
        };

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                "Anthropic request: {} message(s), {} tool(s)",
                request_body.messages.len(),
                request_body.tools.len()
            );
        }

        let response = self
            .client
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, body));
        }

        let resp_text = response
            .text()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        tracing::debug!(
            "Anthropic raw response (first 2000 chars): {}",
            resp_text.chars().take(2000).collect::<String>()
        );
        serde_json::from_str(&resp_text).map_err(|e| LlmError::Decode(e.to_string()))
    }
}

/// 429 (rate limit) and 529 (overloaded) are rate-limit responses; the rest are not retried.
fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: String) -> LlmError {
    match status.as_u16() {
        429 | 529 => LlmError::RateLimited {
            status: status.as_u16(),
            retry_after,
        },
        code => LlmError::Api {
            status: code,
            body: body.chars().take(500).collect(),
        },
    }
}

/// `retry-after` in (possibly fractional) seconds.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let secs: f64 = raw.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}
