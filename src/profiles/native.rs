// Tool-native config file access
//
// Exactly which keys a profile activation touches per tool:
//   claude-code  ~/.claude/settings.json        env.ANTHROPIC_AUTH_TOKEN,
//                                               env.ANTHROPIC_BASE_URL
//   codex        ~/.codex/config.toml           model_provider,
//                                               [model_providers.<name>].base_url
//                ~/.codex/auth.json             OPENAI_API_KEY
//   gemini-cli   ~/.gemini-cli/.env             GEMINI_API_KEY,
//                                               GOOGLE_GEMINI_BASE_URL,
//                                               GEMINI_MODEL (optional)
//   amp-code     none (proxy-only)
// All other keys in those files are preserved. The codex TOML goes
// through toml_edit so user comments survive the rewrite.
//
// Snapshots are a canonical JSON image of the files, keyed by file role
// ("env"/"config"/"auth"), which is also the path namespace the config
// watcher diffs against.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};

use crate::store::DataStore;
use crate::tools::ToolId;

/// Provider table name written into the codex config.
const CODEX_PROVIDER: &str = "duckcoding";

/// Credential fields extracted from or applied to native files.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NativeCredentials {
    pub api_key: String,
    pub base_url: String,
    pub wire_api: Option<String>,
    pub model: Option<String>,
}

/// Resolve the directory the tools' dotfiles live under. The
/// `DUCKCODING_NATIVE_HOME` override mirrors `DUCKCODING_HOME` for the
/// data root: tests point it at a scratch directory so they never touch
/// a real ~/.claude, ~/.codex or ~/.gemini-cli.
fn home() -> PathBuf {
    if let Ok(dir) = std::env::var("DUCKCODING_NATIVE_HOME") {
        return PathBuf::from(dir);
    }
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn claude_settings_path() -> PathBuf {
    home().join(".claude").join("settings.json")
}

fn codex_config_path() -> PathBuf {
    home().join(".codex").join("config.toml")
}

fn codex_auth_path() -> PathBuf {
    home().join(".codex").join("auth.json")
}

fn gemini_env_path() -> PathBuf {
    home().join(".gemini-cli").join(".env")
}

/// Canonical JSON image of a tool's native files.
pub fn snapshot(store: &DataStore, tool: ToolId) -> Result<Value> {
    match tool {
        ToolId::ClaudeCode => store.read_uncached(&claude_settings_path()),
        ToolId::Codex => {
            let config_text = std::fs::read_to_string(codex_config_path()).unwrap_or_default();
            let config: Value = if config_text.trim().is_empty() {
                json!({})
            } else {
                let parsed: toml::Value =
                    toml::from_str(&config_text).context("parse codex config.toml")?;
                serde_json::to_value(parsed)?
            };
            let auth = store.read_uncached(&codex_auth_path())?;
            Ok(json!({ "config": config, "auth": auth }))
        }
        ToolId::GeminiCli => {
            let entries = store.read_env(&gemini_env_path())?;
            let map: Map<String, Value> = entries
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect();
            Ok(json!({ "env": Value::Object(map) }))
        }
        ToolId::AmpCode => Ok(Value::Null),
    }
}

/// Write profile credentials into the native files, preserving everything
/// else those files contain.
pub fn apply(store: &DataStore, tool: ToolId, creds: &NativeCredentials) -> Result<()> {
    match tool {
        ToolId::ClaudeCode => {
            let mut settings = store.read_uncached(&claude_settings_path())?;
            if !settings.is_object() {
                settings = json!({});
            }
            let obj = settings.as_object_mut().expect("object ensured above");
            let env = obj
                .entry("env")
                .or_insert_with(|| json!({}));
            if !env.is_object() {
                *env = json!({});
            }
            let env = env.as_object_mut().expect("object ensured above");
            env.insert(
                "ANTHROPIC_AUTH_TOKEN".into(),
                Value::String(creds.api_key.clone()),
            );
            env.insert(
                "ANTHROPIC_BASE_URL".into(),
                Value::String(creds.base_url.clone()),
            );
            store.write_json(&claude_settings_path(), &settings)
        }
        ToolId::Codex => {
            let mut doc = store.read_toml_document(&codex_config_path())?;
            doc["model_provider"] = toml_edit::value(CODEX_PROVIDER);
            doc["model_providers"][CODEX_PROVIDER]["name"] = toml_edit::value("DuckCoding");
            doc["model_providers"][CODEX_PROVIDER]["base_url"] =
                toml_edit::value(creds.base_url.as_str());
            if let Some(wire_api) = &creds.wire_api {
                doc["model_providers"][CODEX_PROVIDER]["wire_api"] =
                    toml_edit::value(wire_api.as_str());
            }
            store.write_toml_document(&codex_config_path(), &doc)?;

            let mut auth = store.read_uncached(&codex_auth_path())?;
            if !auth.is_object() {
                auth = json!({});
            }
            auth.as_object_mut()
                .expect("object ensured above")
                .insert("OPENAI_API_KEY".into(), Value::String(creds.api_key.clone()));
            store.write_json(&codex_auth_path(), &auth)
        }
        ToolId::GeminiCli => {
            let mut entries = store.read_env(&gemini_env_path())?;
            let mut set = |key: &str, value: &str| {
                if let Some(entry) = entries.iter_mut().find(|(k, _)| k.as_str() == key) {
                    entry.1 = value.to_string();
                } else {
                    entries.push((key.to_string(), value.to_string()));
                }
            };
            set("GEMINI_API_KEY", &creds.api_key);
            set("GOOGLE_GEMINI_BASE_URL", &creds.base_url);
            if let Some(model) = &creds.model {
                set("GEMINI_MODEL", model);
            }
            store.write_env(&gemini_env_path(), &entries)
        }
        ToolId::AmpCode => Ok(()),
    }
}

/// Read the credentials the native files currently point at (import path).
pub fn extract(store: &DataStore, tool: ToolId) -> Result<NativeCredentials> {
    let image = snapshot(store, tool)?;
    let mut creds = NativeCredentials::default();
    match tool {
        ToolId::ClaudeCode => {
            creds.api_key = image
                .pointer("/env/ANTHROPIC_AUTH_TOKEN")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            creds.base_url = image
                .pointer("/env/ANTHROPIC_BASE_URL")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
        }
        ToolId::Codex => {
            creds.api_key = image
                .pointer("/auth/OPENAI_API_KEY")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let provider = image
                .pointer("/config/model_provider")
                .and_then(Value::as_str)
                .unwrap_or(CODEX_PROVIDER)
                .to_string();
            if let Some(entry) = image.pointer(&format!("/config/model_providers/{provider}")) {
                creds.base_url = entry
                    .get("base_url")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                creds.wire_api = entry
                    .get("wire_api")
                    .and_then(Value::as_str)
                    .map(String::from);
            }
        }
        ToolId::GeminiCli => {
            creds.api_key = image
                .pointer("/env/GEMINI_API_KEY")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            creds.base_url = image
                .pointer("/env/GOOGLE_GEMINI_BASE_URL")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            creds.model = image
                .pointer("/env/GEMINI_MODEL")
                .and_then(Value::as_str)
                .map(String::from);
        }
        ToolId::AmpCode => {}
    }
    Ok(creds)
}

/// Rewrite the native files from a snapshot image (external-change
/// rollback). Codex TOML is regenerated from the snapshot values, so
/// comments added after the snapshot are not resurrected.
pub fn restore_snapshot(store: &DataStore, tool: ToolId, image: &Value) -> Result<()> {
    match tool {
        ToolId::ClaudeCode => {
            if image.is_null() {
                return Ok(());
            }
            store.write_json(&claude_settings_path(), image)
        }
        ToolId::Codex => {
            if let Some(config) = image.get("config") {
                let toml_value =
                    toml::Value::try_from(config).context("snapshot config to toml")?;
                let text = toml::to_string_pretty(&toml_value).context("render codex config")?;
                store.write_atomic(&codex_config_path(), text.as_bytes())?;
            }
            if let Some(auth) = image.get("auth") {
                store.write_json(&codex_auth_path(), auth)?;
            }
            Ok(())
        }
        ToolId::GeminiCli => {
            let Some(env) = image.get("env").and_then(Value::as_object) else {
                return Ok(());
            };
            let entries: Vec<(String, String)> = env
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect();
            store.write_env(&gemini_env_path(), &entries)
        }
        ToolId::AmpCode => Ok(()),
    }
}
