// Supported tool identities and their static metadata
//
// The closed set of AI CLIs this supervisor fronts. Everything that varies
// per tool at runtime (ports, credentials, pricing) lives in config files;
// what lives here is only the invariants: wire flavor, native file layout,
// defaults.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Closed set of supported tools. Wire form matches the on-disk keys
/// ("claude-code", "codex", "gemini-cli", "amp-code").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolId {
    #[serde(rename = "claude-code")]
    ClaudeCode,
    #[serde(rename = "codex")]
    Codex,
    #[serde(rename = "gemini-cli")]
    GeminiCli,
    #[serde(rename = "amp-code")]
    AmpCode,
}

/// Wire protocol flavor spoken between the tool and its vendor endpoint.
/// Selects the token processor and the header-rewrite rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFlavor {
    /// Anthropic messages API (SSE message_start/delta/stop)
    Anthropic,
    /// OpenAI responses API (response.created/response.completed)
    OpenAiResponses,
    /// Google generateContent (JSON or SSE with usageMetadata)
    Gemini,
    /// AMP multiplexes one of the above per its child profile
    Amp,
}

pub const ALL_TOOLS: [ToolId; 4] = [
    ToolId::ClaudeCode,
    ToolId::Codex,
    ToolId::GeminiCli,
    ToolId::AmpCode,
];

impl ToolId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude-code",
            Self::Codex => "codex",
            Self::GeminiCli => "gemini-cli",
            Self::AmpCode => "amp-code",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "claude-code" => Ok(Self::ClaudeCode),
            "codex" => Ok(Self::Codex),
            "gemini-cli" => Ok(Self::GeminiCli),
            "amp-code" => Ok(Self::AmpCode),
            other => Err(CoreError::invalid(format!("unknown tool id: {other}"))),
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::ClaudeCode => "Claude Code",
            Self::Codex => "Codex",
            Self::GeminiCli => "Gemini CLI",
            Self::AmpCode => "AMP Code",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::ClaudeCode => 8787,
            Self::Codex => 8788,
            Self::GeminiCli => 8789,
            Self::AmpCode => 8790,
        }
    }

    pub fn wire_flavor(&self) -> WireFlavor {
        match self {
            Self::ClaudeCode => WireFlavor::Anthropic,
            Self::Codex => WireFlavor::OpenAiResponses,
            Self::GeminiCli => WireFlavor::Gemini,
            Self::AmpCode => WireFlavor::Amp,
        }
    }

    pub fn default_pricing_template(&self) -> &'static str {
        match self {
            Self::ClaudeCode | Self::AmpCode => "preset-claude",
            Self::Codex => "preset-codex",
            Self::GeminiCli => "preset-gemini",
        }
    }

    /// Reserved name for the internal profile installed while the proxy runs.
    pub fn internal_profile_name(&self) -> String {
        format!("dc_proxy_{}", self.as_str())
    }

    /// Native config files this tool reads, relative to the home directory.
    /// AMP is proxy-only and keeps no native files.
    pub fn native_files(&self) -> Vec<PathBuf> {
        let Some(home) = dirs::home_dir() else {
            return Vec::new();
        };
        match self {
            Self::ClaudeCode => vec![home.join(".claude").join("settings.json")],
            Self::Codex => vec![
                home.join(".codex").join("config.toml"),
                home.join(".codex").join("auth.json"),
            ],
            Self::GeminiCli => vec![home.join(".gemini-cli").join(".env")],
            Self::AmpCode => Vec::new(),
        }
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
