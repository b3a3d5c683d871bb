//! Per-tool cooldowns.
//!
//! A tool may run again only once its cooldown has elapsed since the last
//! *allowed* invocation. Denied checks never move the window.

use crate::tool_registry::ToolRegistry;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

pub struct RateLimiter {
    cooldowns: HashMap<String, Duration>,
    last: DashMap<String, Instant>,
}

impl RateLimiter {
    pub fn new(cooldowns: HashMap<String, Duration>) -> Self {
        Self {
            cooldowns,
            last: DashMap::new(),
        }
    }

    pub fn from_registry(registry: &ToolRegistry) -> Self {
        Self::new(registry.cooldowns())
    }

    /// Returns true and records `now` if `tool` is outside its cooldown window.
    /// Check and record happen under one shard lock, so two concurrent callers
    /// can never both pass inside a single window.
    pub fn check_and_record(&self, tool: &str, now: Instant) -> bool {
        let Some(cooldown) = self.cooldowns.get(tool).copied() else {
            return true;
        };
        match self.last.entry(tool.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
            Entry::Occupied(mut slot) => {
                if now.saturating_duration_since(*slot.get()) >= cooldown {
                    slot.insert(now);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Time left before `tool` may run again; zero if it may run now.
    pub fn remaining(&self, tool: &str, now: Instant) -> Duration {
        let Some(cooldown) = self.cooldowns.get(tool) else {
            return Duration::ZERO;
        };
        match self.last.get(tool) {
            Some(last) => cooldown.saturating_sub(now.saturating_duration_since(*last)),
            None => Duration::ZERO,
        }
    }

    pub fn cooldown(&self, tool: &str) -> Option<Duration> {
        self.cooldowns.get(tool).copied()
    }
}
