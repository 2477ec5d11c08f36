use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-profile metadata kept in `accounts/accounts.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountMeta {
    pub created: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    /// Subscription tier or credential kind (e.g. "Pro", "API (Anthropic)").
    pub account_type: String,
    pub email: Option<String>,
}

/// Index of all known profiles plus which one is active.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountsIndex {
    pub accounts: HashMap<String, AccountMeta>,
    pub active: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnthropicApiKey {
    pub api_key: String,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BedrockApiKey {
    pub bearer_token: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub region: String,
    pub created: DateTime<Utc>,
}

/// The `.api_keys.json` blob for a profile, written with 0600 permissions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiKeys {
    pub anthropic: Option<AnthropicApiKey>,
    pub bedrock: Option<BedrockApiKey>,
}

impl ApiKeys {
    pub fn is_empty(&self) -> bool {
        self.anthropic.is_none() && self.bedrock.is_none()
    }
}

/// The full set of environment variables this system is known to set for
/// API-key-mode executor invocations (spec.md §6). Used to compute the
/// "unset" list on every profile switch so the environment is never
/// partially updated.
pub const ALL_ENV_VARS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "AWS_BEARER_TOKEN_BEDROCK",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "AWS_REGION",
    "CLAUDE_CODE_USE_BEDROCK",
    "ANTHROPIC_SMALL_FAST_MODEL_AWS_REGION",
];

/// Produce the environment-variable bindings the executor should see for
/// this API-key set (spec.md §4.5 last paragraph).
pub fn env_bindings(keys: &ApiKeys) -> Vec<(String, String)> {
    let mut bindings = Vec::new();
    if let Some(anthropic) = &keys.anthropic {
        bindings.push(("ANTHROPIC_API_KEY".to_string(), anthropic.api_key.clone()));
    }
    if let Some(bedrock) = &keys.bedrock {
        bindings.push(("CLAUDE_CODE_USE_BEDROCK".to_string(), "1".to_string()));
        bindings.push(("AWS_REGION".to_string(), bedrock.region.clone()));
        bindings.push((
            "ANTHROPIC_SMALL_FAST_MODEL_AWS_REGION".to_string(),
            bedrock.region.clone(),
        ));
        if let Some(token) = &bedrock.bearer_token {
            bindings.push(("AWS_BEARER_TOKEN_BEDROCK".to_string(), token.clone()));
        } else {
            if let Some(id) = &bedrock.access_key_id {
                bindings.push(("AWS_ACCESS_KEY_ID".to_string(), id.clone()));
            }
            if let Some(secret) = &bedrock.secret_access_key {
                bindings.push(("AWS_SECRET_ACCESS_KEY".to_string(), secret.clone()));
            }
        }
    }
    bindings
}

/// Sanitize a user-supplied profile name for filesystem use, following the
/// original Python implementation's character allowlist
/// (`src/cuti/services/claude_account_manager.py::save_account`).
pub fn sanitize_name(name: &str) -> Option<String> {
    let safe: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_' || *c == ' ')
        .collect();
    let trimmed = safe.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
