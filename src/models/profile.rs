// Credential profiles and the per-tool active pointer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a profile came from. Imported profiles remember enough about the
/// remote provider to re-sync later; custom ones are user-authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProfileSource {
    Custom,
    ImportedFromProvider {
        provider: String,
        remote_token_name: String,
        group: Option<String>,
        imported_at: DateTime<Utc>,
    },
}

impl Default for ProfileSource {
    fn default() -> Self {
        Self::Custom
    }
}

/// A named credential bundle scoped to one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub api_key: String,
    pub base_url: String,
    /// Codex only: "responses" or "chat" wire selection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wire_api: Option<String>,
    /// Gemini only: pinned model name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pricing_template_id: Option<String>,
    #[serde(default)]
    pub source: ProfileSource,
    /// Full JSON image of the tool-native files taken at activation time
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub native_snapshot: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Listing form: everything except the secrets and the snapshot blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileDescriptor {
    pub name: String,
    pub base_url: String,
    pub source: ProfileSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pricing_template_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Profile> for ProfileDescriptor {
    fn from(p: &Profile) -> Self {
        Self {
            name: p.name.clone(),
            base_url: p.base_url.clone(),
            source: p.source.clone(),
            pricing_template_id: p.pricing_template_id.clone(),
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

/// The at-most-one active profile per tool (active.json entry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveProfile {
    pub profile_name: String,
    pub switched_at: DateTime<Utc>,
    pub last_synced_at: DateTime<Utc>,
    /// Image of the native files immediately after the activation write
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub native_snapshot: Value,
    /// User profile displaced by an internal dc_proxy_ install, restored on
    /// proxy stop. Persisted so the restore survives a process restart.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior_profile: Option<String>,
}
