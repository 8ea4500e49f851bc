// Global user settings (global.json)

use serde::{Deserialize, Serialize};

use super::watch::ConfigWatchConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// tracing filter level: trace|debug|info|warn|error
    pub level: String,
    /// Also write daily-rotated files under <data_root>/logs
    pub to_file: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            to_file: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_token: Option<String>,
    /// Outbound HTTP proxy for upstream requests, e.g. "http://127.0.0.1:7890"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub config_watch: ConfigWatchConfig,
    /// UI hint flags the desktop shell reads; opaque to the core
    #[serde(default)]
    pub hide_proxy_hint: bool,
    #[serde(default)]
    pub hide_import_hint: bool,
}
