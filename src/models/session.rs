// Session aggregates derived from request payload identity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::token_log::TokenCounters;
use crate::tools::ToolId;

/// A session is "active" while its last request is younger than this.
pub const SESSION_ACTIVE_SECS: i64 = 5 * 60;

/// How requests in this session are routed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ConfigMode {
    /// Follow the tool's internal dc_proxy_ profile
    Global,
    /// Pinned to a specific user profile for this session
    Custom { profile_name: String },
}

impl Default for ConfigMode {
    fn default() -> Self {
        Self::Global
    }
}

/// Aggregate counters for one logical conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySession {
    /// Stable derived key (payload-specific, see the session manager)
    pub session_id: String,
    /// Short human form (uuid suffix or 12-char prefix)
    pub display_id: String,
    pub tool_id: ToolId,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub request_count: u64,
    pub counters: TokenCounters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default)]
    pub config_mode: ConfigMode,
}

impl ProxySession {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        (now - self.last_seen_at).num_seconds() < SESSION_ACTIVE_SECS
    }
}
