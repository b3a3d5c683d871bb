//! Tool abstraction types, shared between the orchestrator and the platform
//! adapters that implement the individual admin tools.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

/// Arguments of a tool call. Insertion order is preserved (serde_json `preserve_order`).
pub type ToolArgs = Map<String, Value>;

/// JSON tool definition sent to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: ToolInputSchema,
}

/// JSON Schema for tool input parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInputSchema {
    #[serde(rename = "type")]
    pub schema_type: String,
    pub properties: Value,
    pub required: Vec<String>,
}

impl ToolInputSchema {
    pub fn object(properties: Value, required: &[&str]) -> Self {
        Self {
            schema_type: "object".to_string(),
            properties,
            required: required.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn empty() -> Self {
        Self::object(Value::Object(Map::new()), &[])
    }
}

/// Static description of a registered tool. Immutable once the registry is built.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: ToolInputSchema,
    /// Destructive tools need operator approval before they run.
    pub destructive: bool,
    /// Minimum spacing between two invocations. `None` never throttles.
    pub cooldown: Option<Duration>,
}

impl ToolDescriptor {
    pub fn new(name: &str, description: &str, parameters: ToolInputSchema) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
            destructive: false,
            cooldown: None,
        }
    }

    pub fn destructive(mut self) -> Self {
        self.destructive = true;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Option<Duration>) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Schema sent to the reasoning engine.
    pub fn to_api_tool(&self) -> Tool {
        Tool {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.parameters.clone(),
        }
    }
}

/// Why a handler could not complete.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ToolFailure {
    #[error("invalid arguments: {0}")]
    Validation(String),
    #[error("platform error: {0}")]
    Platform(String),
}

/// Trait for tool handlers that can be registered and dispatched.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    /// Descriptor; its `name` is the dispatch key.
    fn descriptor(&self) -> ToolDescriptor;

    /// Execute the tool. The returned JSON is fed back to the LLM verbatim.
    async fn execute(&self, args: &ToolArgs) -> Result<Value, ToolFailure>;
}

// ============================================================================
// Argument helpers
// ============================================================================

pub fn required_str<'a>(args: &'a ToolArgs, key: &str) -> Result<&'a str, ToolFailure> {
    match args.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.as_str()),
        Some(_) => Err(ToolFailure::Validation(format!("'{key}' must be a non-empty string"))),
        None => Err(ToolFailure::Validation(format!("missing required parameter '{key}'"))),
    }
}

pub fn optional_str<'a>(args: &'a ToolArgs, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str).filter(|s| !s.trim().is_empty())
}

/// Integers may arrive as JSON numbers or numeric strings.
pub fn optional_i64(args: &ToolArgs, key: &str) -> Result<Option<i64>, ToolFailure> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or_else(|| ToolFailure::Validation(format!("'{key}' must be an integer"))),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ToolFailure::Validation(format!("'{key}' must be an integer"))),
        Some(_) => Err(ToolFailure::Validation(format!("'{key}' must be an integer"))),
    }
}

pub fn required_i64(args: &ToolArgs, key: &str) -> Result<i64, ToolFailure> {
    optional_i64(args, key)?
        .ok_or_else(|| ToolFailure::Validation(format!("missing required parameter '{key}'")))
}
