use crate::event::ADMINISTRATOR;
use dashmap::DashSet;
use serde_json::Value;
use std::collections::HashSet;
use warden_core::config::DiscordConfig;

/// Decides who may drive the bot and answer confirmations.
///
/// Configured ids never change. The guild owner and the set of roles carrying
/// ADMINISTRATOR are learned from Discord and kept current from gateway role
/// events, so the authorizer is shared behind an `Arc` and updated in place.
#[derive(Debug, Default)]
pub struct Authorizer {
    admin_user_ids: HashSet<String>,
    admin_role_ids: HashSet<String>,
    owner_id: Option<String>,
    administrator_roles: DashSet<String>,
}

impl Authorizer {
    pub fn new(config: &DiscordConfig) -> Self {
        Self {
            admin_user_ids: config.admin_user_ids.iter().cloned().collect(),
            admin_role_ids: config.admin_role_ids.iter().cloned().collect(),
            ..Self::default()
        }
    }

    /// Also trust every role in `roles` (a guild roles listing) that carries
    /// the ADMINISTRATOR permission.
    pub fn with_administrator_roles(self, roles: &[Value]) -> Self {
        for role in roles {
            self.observe_role(role);
        }
        self
    }

    /// The guild owner holds every permission whatever their roles say.
    pub fn with_owner(mut self, owner_id: Option<&str>) -> Self {
        self.owner_id = owner_id.filter(|id| !id.is_empty()).map(str::to_string);
        self
    }

    /// Track a created or updated role.
    pub fn observe_role(&self, role: &Value) {
        let Some(id) = role.get("id").and_then(Value::as_str) else {
            return;
        };
        let perms = role.get("permissions").and_then(Value::as_str);
        if has_administrator(perms) {
            if self.administrator_roles.insert(id.to_string()) {
                tracing::info!("Role {} now carries ADMINISTRATOR", id);
            }
        } else if self.administrator_roles.remove(id).is_some() {
            tracing::info!("Role {} lost ADMINISTRATOR", id);
        }
    }

    pub fn forget_role(&self, role_id: &str) {
        self.administrator_roles.remove(role_id);
    }

    /// `permissions` is the computed permission string Discord attaches to
    /// interactions; messages never carry it.
    pub fn is_authorized(&self, user_id: &str, roles: &[String], permissions: Option<&str>) -> bool {
        self.admin_user_ids.contains(user_id)
            || self.owner_id.as_deref() == Some(user_id)
            || roles
                .iter()
                .any(|r| self.admin_role_ids.contains(r) || self.administrator_roles.contains(r))
            || has_administrator(permissions)
    }

    pub fn admin_role_count(&self) -> usize {
        self.admin_role_ids.len() + self.administrator_roles.len()
    }
}

fn has_administrator(permissions: Option<&str>) -> bool {
    permissions
        .and_then(|p| p.parse::<u64>().ok())
        .map(|bits| bits & ADMINISTRATOR != 0)
        .unwrap_or(false)
}
