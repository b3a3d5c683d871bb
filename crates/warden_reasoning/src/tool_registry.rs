use crate::api_types::Tool;
use crate::error::{RegistryError, ToolExecutionError};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use warden_core::config::CooldownConfig;
use warden_core::{ToolArgs, ToolDescriptor, ToolHandler};

// ============================================================================
// ToolRegistry
// ============================================================================

struct Registered {
    descriptor: ToolDescriptor,
    handler: Box<dyn ToolHandler>,
}

/// Name-keyed catalog of tool handlers. Built once at startup, read-only after.
pub struct ToolRegistry {
    handlers: HashMap<String, Registered>,
    cooldowns: Option<CooldownConfig>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Registry that keeps each handler's own cooldown.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            cooldowns: None,
        }
    }

    /// Registry that overrides handler cooldowns from configuration.
    pub fn with_cooldowns(cooldowns: CooldownConfig) -> Self {
        Self {
            handlers: HashMap::new(),
            cooldowns: Some(cooldowns),
        }
    }

    /// Register a tool handler. Overwrites any existing handler with the same name.
    pub fn register(&mut self, handler: Box<dyn ToolHandler>) {
        let mut descriptor = handler.descriptor();
        if let Some(cfg) = &self.cooldowns {
            descriptor.cooldown = cfg.cooldown_for(&descriptor.name, descriptor.destructive);
        }
        tracing::debug!(
            "Registered tool: {} (destructive: {}, cooldown: {:?})",
            descriptor.name,
            descriptor.destructive,
            descriptor.cooldown
        );
        self.handlers.insert(
            descriptor.name.clone(),
            Registered {
                descriptor,
                handler,
            },
        );
    }

    pub fn resolve(&self, name: &str) -> Result<&ToolDescriptor, RegistryError> {
        self.handlers
            .get(name)
            .map(|r| &r.descriptor)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Dispatch a tool call by name.
    pub async fn execute(&self, name: &str, args: &ToolArgs) -> Result<Value, ToolExecutionError> {
        let entry = self
            .handlers
            .get(name)
            .ok_or_else(|| ToolExecutionError::new(name, RegistryError::NotFound(name.to_string())))?;
        entry
            .handler
            .execute(args)
            .await
            .map_err(|e| ToolExecutionError::new(name, e))
    }

    /// All descriptors, sorted by name so the schema sent upstream is stable.
    pub fn descriptors(&self) -> Vec<&ToolDescriptor> {
        let mut all: Vec<_> = self.handlers.values().map(|r| &r.descriptor).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Get the list of Tool schemas for the LLM.
    pub fn api_tools(&self) -> Vec<Tool> {
        self.descriptors().into_iter().map(|d| d.to_api_tool()).collect()
    }

    /// Cooldown table for the rate limiter.
    pub fn cooldowns(&self) -> HashMap<String, Duration> {
        self.handlers
            .values()
            .filter_map(|r| r.descriptor.cooldown.map(|c| (r.descriptor.name.clone(), c)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
