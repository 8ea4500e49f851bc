// Token usage extraction - per-tool processors and the priced logger
//
// A Processor consumes raw response bytes as they stream through the
// proxy and accumulates token usage plus message identity. A Logger wraps
// a Processor with a pricing template and turns the final accumulation
// into a TokenLog row. One Processor impl per wire flavor; a factory
// selects by tool. Adding a tool means adding one Processor and
// registering it here.

mod claude;
mod codex;
mod gemini;
mod logger;
mod sse;

pub use claude::ClaudeProcessor;
pub use codex::CodexProcessor;
pub use gemini::GeminiProcessor;
pub use logger::{StreamOutcome, UsageLogger};
pub use sse::SseScanner;

use crate::models::TokenCounters;
use crate::tools::{ToolId, WireFlavor};

/// Incremental observation emitted by a processor mid-stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenEvent {
    pub message_id: Option<String>,
    pub model: Option<String>,
    pub delta: Option<TokenCounters>,
}

/// Final accumulated usage for one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenInfo {
    pub counters: TokenCounters,
    pub model: Option<String>,
    pub message_id: Option<String>,
    /// First malformed event: "offset <n>: <event type>"
    pub parse_error: Option<String>,
}

/// Streaming usage extractor. `feed` never fails: malformed input is
/// recorded and parsing continues, because a broken tap must not break
/// the byte stream the client is receiving.
pub trait Processor: Send {
    /// Consume a response chunk, yielding zero or more observations.
    fn feed(&mut self, chunk: &[u8]) -> Vec<TokenEvent>;

    /// Called at end of stream (or disconnect). Returns what accumulated,
    /// or None when nothing usage-shaped was ever seen.
    fn finalize(&mut self) -> Option<TokenInfo>;
}

/// Select the processor for a tool. AMP rides on the wire flavor of its
/// child profile, which the instance resolves before calling this.
pub fn processor_for(flavor: WireFlavor) -> Box<dyn Processor> {
    match flavor {
        WireFlavor::Anthropic => Box::new(ClaudeProcessor::new()),
        WireFlavor::OpenAiResponses => Box::new(CodexProcessor::new()),
        WireFlavor::Gemini => Box::new(GeminiProcessor::new()),
        // AMP defaults to the Anthropic flavor when no child is selected
        WireFlavor::Amp => Box::new(ClaudeProcessor::new()),
    }
}

/// Flavor actually used for a tool's response parsing.
pub fn effective_flavor(tool: ToolId, child: Option<WireFlavor>) -> WireFlavor {
    match tool.wire_flavor() {
        WireFlavor::Amp => child.unwrap_or(WireFlavor::Anthropic),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amp_uses_child_flavor_when_present() {
        assert_eq!(
            effective_flavor(ToolId::AmpCode, Some(WireFlavor::Gemini)),
            WireFlavor::Gemini
        );
        assert_eq!(
            effective_flavor(ToolId::AmpCode, None),
            WireFlavor::Anthropic
        );
        assert_eq!(
            effective_flavor(ToolId::Codex, Some(WireFlavor::Gemini)),
            WireFlavor::OpenAiResponses
        );
    }
}
