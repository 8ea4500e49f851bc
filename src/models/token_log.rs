// Append-only per-request usage records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tools::ToolId;

/// Raw token counters as reported by the vendor response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounters {
    pub input: u64,
    pub output: u64,
    pub cache_creation: u64,
    pub cache_read: u64,
}

impl TokenCounters {
    pub fn total(&self) -> u64 {
        self.input + self.output + self.cache_creation + self.cache_read
    }

    pub fn add(&mut self, other: &TokenCounters) {
        self.input += other.input;
        self.output += other.output;
        self.cache_creation += other.cache_creation;
        self.cache_read += other.cache_read;
    }
}

/// Priced costs in the template currency, 6-decimal precision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenCosts {
    pub input: f64,
    pub output: f64,
    pub cache_write: f64,
    pub cache_read: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Sse,
    Json,
    Unknown,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sse => "sse",
            Self::Json => "json",
            Self::Unknown => "unknown",
        }
    }
}

/// One finalized request record. Appended to the stats store in request
/// finalization order per session; never updated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenLog {
    /// Row id; 0 until the stats store assigns one
    #[serde(default)]
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub tool_id: ToolId,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub model: String,
    /// Profile or config that routed the request ("global" or a name)
    pub config_name: String,
    pub client_ip: String,
    pub request_status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub response_type: ResponseType,
    pub counters: TokenCounters,
    pub costs: TokenCosts,
    /// Wall-clock request duration, milliseconds
    pub response_ms: u64,
}
