// Config-watcher settings (stored inside global.json)

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::tools::ToolId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchMode {
    /// Notify only on sensitive-field changes
    Default,
    /// Notify on anything that survives the blacklist
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWatchConfig {
    pub enabled: bool,
    pub mode: WatchMode,
    /// Clamped to 1..=60 on load
    pub scan_interval_seconds: u64,
    /// Dotted-path patterns (segment wildcard `*`) that count as sensitive
    #[serde(default)]
    pub sensitive_fields: HashMap<ToolId, Vec<String>>,
    /// Dotted-path patterns dropped before any filtering
    #[serde(default)]
    pub blacklist: HashMap<ToolId, Vec<String>>,
}

impl ConfigWatchConfig {
    pub fn clamp(&mut self) {
        self.scan_interval_seconds = self.scan_interval_seconds.clamp(1, 60);
    }
}

impl Default for ConfigWatchConfig {
    fn default() -> Self {
        let mut sensitive_fields = HashMap::new();
        sensitive_fields.insert(
            ToolId::ClaudeCode,
            vec![
                "env.ANTHROPIC_AUTH_TOKEN".to_string(),
                "env.ANTHROPIC_BASE_URL".to_string(),
            ],
        );
        sensitive_fields.insert(
            ToolId::Codex,
            vec![
                "config.model_provider".to_string(),
                "config.model_providers.*.base_url".to_string(),
                "auth.OPENAI_API_KEY".to_string(),
            ],
        );
        sensitive_fields.insert(
            ToolId::GeminiCli,
            vec![
                "env.GEMINI_API_KEY".to_string(),
                "env.GOOGLE_GEMINI_BASE_URL".to_string(),
            ],
        );

        let mut blacklist = HashMap::new();
        blacklist.insert(
            ToolId::ClaudeCode,
            vec!["theme".to_string(), "ui.*".to_string()],
        );

        Self {
            enabled: true,
            mode: WatchMode::Default,
            scan_interval_seconds: 5,
            sensitive_fields,
            blacklist,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_interval_clamps_into_range() {
        let mut cfg = ConfigWatchConfig {
            scan_interval_seconds: 0,
            ..Default::default()
        };
        cfg.clamp();
        assert_eq!(cfg.scan_interval_seconds, 1);

        cfg.scan_interval_seconds = 600;
        cfg.clamp();
        assert_eq!(cfg.scan_interval_seconds, 60);
    }
}
