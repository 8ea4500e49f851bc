// Per-tool transparent proxy configuration (proxy.json)

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::{ToolId, ALL_TOOLS};

/// One tool's proxy settings. Mutating this while the instance is running
/// is forbidden; the manager enforces stop -> write -> start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolProxyConfig {
    pub enabled: bool,
    pub port: u16,
    /// Protective key clients must present at the local port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_api_key: Option<String>,
    /// Upstream credentials carried by the internal dc_proxy_ profile
    #[serde(skip_serializing_if = "Option::is_none")]
    pub real_api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub real_base_url: Option<String>,
    /// User profile that supplied the upstream credentials, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub real_profile_name: Option<String>,
    #[serde(default)]
    pub allow_public: bool,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub session_endpoint_config_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pricing_template_id: Option<String>,
    /// AMP only: Tavily key for the local webSearch2 handler
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tavily_api_key: Option<String>,
}

impl ToolProxyConfig {
    pub fn new(port: u16) -> Self {
        Self {
            enabled: false,
            port,
            local_api_key: None,
            real_api_key: None,
            real_base_url: None,
            real_profile_name: None,
            allow_public: false,
            auto_start: false,
            session_endpoint_config_enabled: false,
            pricing_template_id: None,
            tavily_api_key: None,
        }
    }
}

/// proxy.json top level: a map of tool id -> config plus a version marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyStore {
    pub version: String,
    #[serde(default)]
    pub tools: HashMap<ToolId, ToolProxyConfig>,
}

impl ProxyStore {
    pub fn get(&self, tool: ToolId) -> ToolProxyConfig {
        self.tools
            .get(&tool)
            .cloned()
            .unwrap_or_else(|| ToolProxyConfig::new(tool.default_port()))
    }

    pub fn set(&mut self, tool: ToolId, config: ToolProxyConfig) {
        self.tools.insert(tool, config);
    }

    /// One-time migration of the legacy flat layout. Old stores carried
    /// top-level `transparent_proxy_<field>` keys for claude-code only;
    /// those fold into the per-tool map and must not be re-emitted.
    pub fn migrate_legacy(raw: &Value) -> Option<Self> {
        let obj = raw.as_object()?;
        if !obj.keys().any(|k| k.starts_with("transparent_proxy_")) {
            return None;
        }

        let mut store = Self::default();
        let mut cfg = store.get(ToolId::ClaudeCode);
        if let Some(v) = obj.get("transparent_proxy_enabled").and_then(Value::as_bool) {
            cfg.enabled = v;
        }
        if let Some(v) = obj.get("transparent_proxy_port").and_then(Value::as_u64) {
            cfg.port = v as u16;
        }
        if let Some(v) = obj.get("transparent_proxy_api_key").and_then(Value::as_str) {
            cfg.local_api_key = Some(v.to_string());
        }
        if let Some(v) = obj
            .get("transparent_proxy_real_api_key")
            .and_then(Value::as_str)
        {
            cfg.real_api_key = Some(v.to_string());
        }
        if let Some(v) = obj
            .get("transparent_proxy_real_base_url")
            .and_then(Value::as_str)
        {
            cfg.real_base_url = Some(v.to_string());
        }
        store.set(ToolId::ClaudeCode, cfg);

        // Per-tool entries that coexisted with the legacy keys still win
        if let Some(tools) = obj.get("tools").and_then(Value::as_object) {
            for (key, value) in tools {
                if let (Ok(tool), Ok(cfg)) = (
                    ToolId::parse(key),
                    serde_json::from_value::<ToolProxyConfig>(value.clone()),
                ) {
                    store.set(tool, cfg);
                }
            }
        }

        Some(store)
    }
}

impl Default for ProxyStore {
    fn default() -> Self {
        let mut tools = HashMap::new();
        for tool in ALL_TOOLS {
            tools.insert(tool, ToolProxyConfig::new(tool.default_port()));
        }
        Self {
            version: "2.1.0".to_string(),
            tools,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_cover_every_tool() {
        let store = ProxyStore::default();
        assert_eq!(store.get(ToolId::ClaudeCode).port, 8787);
        assert_eq!(store.get(ToolId::Codex).port, 8788);
        assert_eq!(store.get(ToolId::GeminiCli).port, 8789);
        assert_eq!(store.get(ToolId::AmpCode).port, 8790);
    }

    #[test]
    fn legacy_keys_fold_into_claude_entry() {
        let raw = json!({
            "transparent_proxy_enabled": true,
            "transparent_proxy_port": 9100,
            "transparent_proxy_api_key": "local-k",
            "transparent_proxy_real_base_url": "https://jp.duckcoding.com"
        });
        let store = ProxyStore::migrate_legacy(&raw).expect("legacy layout detected");
        let cfg = store.get(ToolId::ClaudeCode);
        assert!(cfg.enabled);
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.local_api_key.as_deref(), Some("local-k"));
        assert_eq!(
            cfg.real_base_url.as_deref(),
            Some("https://jp.duckcoding.com")
        );

        // Migrated form must not re-emit the flat keys
        let out = serde_json::to_value(&store).unwrap();
        assert!(out.get("transparent_proxy_enabled").is_none());
    }

    #[test]
    fn modern_layout_is_not_migrated() {
        let raw = json!({"version": "2.1.0", "tools": {}});
        assert!(ProxyStore::migrate_legacy(&raw).is_none());
    }
}
