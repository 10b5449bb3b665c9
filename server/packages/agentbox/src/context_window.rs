//! Context window resolution for the configured model.

use serde::{Deserialize, Serialize};

/// Known model families and their context windows, in match order.
///
/// Prefix matching walks this list front to back and takes the first key that
/// is a prefix of the model name, so order matters.
pub const MODEL_CONTEXT_WINDOWS: &[(&str, u32)] = &[
    ("gpt-5", 400_000),
    ("gpt-4.1", 1_048_576),
    ("gpt-4.1-mini", 1_048_576),
    ("gpt-4.1-nano", 1_048_576),
    ("gpt-4o", 128_000),
    ("gpt-4o-mini", 128_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-4", 8_192),
    ("gpt-3.5-turbo", 16_385),
    ("o1", 200_000),
    ("o3", 200_000),
    ("o4-mini", 200_000),
    ("claude-opus-4", 200_000),
    ("claude-sonnet-4", 200_000),
    ("claude-3-7-sonnet", 200_000),
    ("claude-3-5-sonnet", 200_000),
    ("claude-3-5-haiku", 200_000),
    ("gemini-2.5-pro", 1_048_576),
    ("gemini-2.5-flash", 1_048_576),
    ("gemini-2.0-flash", 1_048_576),
    ("deepseek-chat", 65_536),
    ("deepseek-reasoner", 65_536),
    ("qwen3", 131_072),
    ("kimi-k2", 131_072),
];

pub const DEFAULT_UNKNOWN_MODEL_CONTEXT_WINDOW: u32 = 32_768;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextOverflowConfig {
    /// Explicit override; wins over every table lookup when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,
    pub unknown_model_context_window: u32,
}

impl Default for ContextOverflowConfig {
    fn default() -> Self {
        Self {
            context_window: None,
            unknown_model_context_window: DEFAULT_UNKNOWN_MODEL_CONTEXT_WINDOW,
        }
    }
}

/// Lower-cases the model name and strips any provider path prefix.
pub fn normalize_model_name(model_name: &str) -> String {
    let trimmed = model_name.trim();
    let last = trimmed.rsplit('/').next().unwrap_or(trimmed);
    last.to_ascii_lowercase()
}

pub fn resolve_context_window(model_name: &str, config: &ContextOverflowConfig) -> u32 {
    if let Some(window) = config.context_window {
        return window;
    }

    let normalized = normalize_model_name(model_name);

    if let Some((_, window)) = MODEL_CONTEXT_WINDOWS
        .iter()
        .find(|(key, _)| *key == normalized)
    {
        return *window;
    }

    if let Some((key, window)) = MODEL_CONTEXT_WINDOWS
        .iter()
        .find(|(key, _)| normalized.starts_with(key))
    {
        tracing::debug!(model = %model_name, family = %key, "context window resolved by prefix");
        return *window;
    }

    tracing::debug!(
        model = %model_name,
        window = config.unknown_model_context_window,
        "unknown model, using fallback context window"
    );
    config.unknown_model_context_window
}
