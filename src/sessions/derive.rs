// Session identity derivation from heterogeneous request payloads
//
// Each wire flavor hides its conversation key somewhere else:
//   anthropic  metadata.user_id, shaped user_<hash>_session_<uuid>
//   codex      prompt_cache_key
//   gemini     model + cachedContent, else a fingerprint of contents[0]
// A request carrying none of these gets a synthetic id stable for one
// client per calendar day.

use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use sha1::{Digest, Sha1};

use crate::tools::{ToolId, WireFlavor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub session_id: String,
    pub display_id: String,
}

impl SessionIdentity {
    fn with_prefix_display(session_id: String) -> Self {
        let display_id = session_id.chars().take(12).collect();
        Self {
            session_id,
            display_id,
        }
    }
}

fn claude_user_id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^user_.+_session_([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})$")
            .expect("valid session pattern")
    })
}

/// Derive a session identity for a request. `body` is the parsed request
/// JSON when available; the synthetic fallback needs only tool + client.
pub fn derive_session_identity(
    tool: ToolId,
    flavor: WireFlavor,
    body: Option<&Value>,
    client_ip: &str,
) -> SessionIdentity {
    if let Some(body) = body {
        let derived = match flavor {
            WireFlavor::Anthropic => derive_claude(body),
            WireFlavor::OpenAiResponses => derive_codex(body),
            WireFlavor::Gemini => derive_gemini(body),
            // AMP callers resolve the child flavor before calling
            WireFlavor::Amp => derive_claude(body),
        };
        if let Some(identity) = derived {
            return identity;
        }
    }
    synthetic(tool, client_ip)
}

fn derive_claude(body: &Value) -> Option<SessionIdentity> {
    let user_id = body.pointer("/metadata/user_id")?.as_str()?;
    if let Some(caps) = claude_user_id_pattern().captures(user_id) {
        return Some(SessionIdentity {
            session_id: user_id.to_string(),
            display_id: caps[1].to_string(),
        });
    }
    Some(SessionIdentity::with_prefix_display(user_id.to_string()))
}

fn derive_codex(body: &Value) -> Option<SessionIdentity> {
    let key = body.get("prompt_cache_key")?.as_str()?;
    if key.is_empty() {
        return None;
    }
    Some(SessionIdentity::with_prefix_display(key.to_string()))
}

fn derive_gemini(body: &Value) -> Option<SessionIdentity> {
    let model = body.get("model").and_then(Value::as_str).unwrap_or("");

    if let Some(cache_id) = body.get("cachedContent").and_then(Value::as_str) {
        return Some(SessionIdentity::with_prefix_display(format!(
            "{model}:{cache_id}"
        )));
    }

    // No cache id: fingerprint the opening turn, which is stable across
    // requests of one conversation
    let first = body.pointer("/contents/0")?;
    let mut hasher = Sha1::new();
    hasher.update(model.as_bytes());
    hasher.update(first.to_string().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    Some(SessionIdentity::with_prefix_display(format!(
        "gemini-{digest}"
    )))
}

fn synthetic(tool: ToolId, client_ip: &str) -> SessionIdentity {
    let date = Utc::now().format("%Y-%m-%d");
    let mut hasher = Sha1::new();
    hasher.update(format!("{}|{}|{}", tool.as_str(), client_ip, date).as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    SessionIdentity::with_prefix_display(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn claude_user_id_with_uuid_splits_display() {
        let body = json!({
            "metadata": {
                "user_id": "user_abc123_session_11111111-2222-3333-4444-555555555555"
            }
        });
        let id = derive_session_identity(
            ToolId::ClaudeCode,
            WireFlavor::Anthropic,
            Some(&body),
            "127.0.0.1",
        );
        assert_eq!(
            id.session_id,
            "user_abc123_session_11111111-2222-3333-4444-555555555555"
        );
        assert_eq!(id.display_id, "11111111-2222-3333-4444-555555555555");
    }

    #[test]
    fn claude_user_id_without_uuid_keeps_full_string() {
        let body = json!({"metadata": {"user_id": "user_plain"}});
        let id = derive_session_identity(
            ToolId::ClaudeCode,
            WireFlavor::Anthropic,
            Some(&body),
            "127.0.0.1",
        );
        assert_eq!(id.session_id, "user_plain");
        assert_eq!(id.display_id, "user_plain");
    }

    #[test]
    fn codex_prompt_cache_key_prefixes_display() {
        let body = json!({"prompt_cache_key": "0123456789abcdef-rest"});
        let id = derive_session_identity(
            ToolId::Codex,
            WireFlavor::OpenAiResponses,
            Some(&body),
            "127.0.0.1",
        );
        assert_eq!(id.session_id, "0123456789abcdef-rest");
        assert_eq!(id.display_id, "0123456789ab");
    }

    #[test]
    fn gemini_cache_id_combines_with_model() {
        let body = json!({"model": "gemini-2.5-pro", "cachedContent": "caches/xyz"});
        let id = derive_session_identity(
            ToolId::GeminiCli,
            WireFlavor::Gemini,
            Some(&body),
            "127.0.0.1",
        );
        assert_eq!(id.session_id, "gemini-2.5-pro:caches/xyz");
    }

    #[test]
    fn gemini_without_cache_fingerprints_first_content() {
        let body = json!({
            "model": "gemini-2.5-pro",
            "contents": [{"role": "user", "parts": [{"text": "hello"}]}]
        });
        let a = derive_session_identity(
            ToolId::GeminiCli,
            WireFlavor::Gemini,
            Some(&body),
            "127.0.0.1",
        );
        let b = derive_session_identity(
            ToolId::GeminiCli,
            WireFlavor::Gemini,
            Some(&body),
            "127.0.0.1",
        );
        assert_eq!(a, b);
        assert!(a.session_id.starts_with("gemini-"));
    }

    #[test]
    fn missing_identity_falls_back_to_synthetic_daily_id() {
        let a = derive_session_identity(ToolId::Codex, WireFlavor::OpenAiResponses, None, "10.0.0.8");
        let b = derive_session_identity(ToolId::Codex, WireFlavor::OpenAiResponses, None, "10.0.0.8");
        let other_client =
            derive_session_identity(ToolId::Codex, WireFlavor::OpenAiResponses, None, "10.0.0.9");
        assert_eq!(a, b);
        assert_ne!(a.session_id, other_client.session_id);
    }
}
