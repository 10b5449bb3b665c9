use std::collections::HashMap;

use tokio::sync::RwLock;

use super::{ToolDescriptor, ToolKind};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PreferenceKey {
    pub user_id: String,
    pub tool_type: ToolKind,
    pub tool_id: String,
}

/// Sparse per-user enable/disable overrides keyed by `(user, tool type, tool id)`.
///
/// An override can only narrow the global state: a tool disabled globally
/// stays disabled whatever the user sets.
#[derive(Debug, Default)]
pub struct ToolPreferences {
    overrides: RwLock<HashMap<PreferenceKey, bool>>,
}

impl ToolPreferences {
    pub async fn set(&self, user_id: &str, tool_type: ToolKind, tool_id: &str, enabled: bool) {
        let key = PreferenceKey {
            user_id: user_id.to_string(),
            tool_type,
            tool_id: tool_id.to_string(),
        };
        self.overrides.write().await.insert(key, enabled);
        tracing::debug!(user_id = %user_id, tool_type = %tool_type, tool_id = %tool_id, enabled, "tool preference set");
    }

    pub async fn clear(&self, user_id: &str, tool_type: ToolKind, tool_id: &str) -> bool {
        let key = PreferenceKey {
            user_id: user_id.to_string(),
            tool_type,
            tool_id: tool_id.to_string(),
        };
        self.overrides.write().await.remove(&key).is_some()
    }

    pub async fn get(&self, user_id: &str, tool_type: ToolKind, tool_id: &str) -> Option<bool> {
        let key = PreferenceKey {
            user_id: user_id.to_string(),
            tool_type,
            tool_id: tool_id.to_string(),
        };
        self.overrides.read().await.get(&key).copied()
    }

    pub async fn is_enabled(&self, user_id: &str, descriptor: &ToolDescriptor) -> bool {
        let user_override = self
            .get(user_id, descriptor.kind, &descriptor.source_id)
            .await;
        descriptor.enabled && user_override.unwrap_or(descriptor.enabled)
    }

    pub(crate) async fn snapshot_for_user(&self, user_id: &str) -> HashMap<(ToolKind, String), bool> {
        self.overrides
            .read()
            .await
            .iter()
            .filter(|(key, _)| key.user_id == user_id)
            .map(|(key, enabled)| ((key.tool_type, key.tool_id.clone()), *enabled))
            .collect()
    }
}

pub(crate) fn effective_enabled(
    descriptor: &ToolDescriptor,
    overrides: &HashMap<(ToolKind, String), bool>,
) -> bool {
    let user_override = overrides
        .get(&(descriptor.kind, descriptor.source_id.clone()))
        .copied();
    descriptor.enabled && user_override.unwrap_or(descriptor.enabled)
}
