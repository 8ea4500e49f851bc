// Anthropic messages-API usage extraction
//
// SSE event flow: message_start carries the model, message id and the
// initial usage block (input + cache counters); message_delta events
// merge incremental usage (output tokens grow monotonically); message_stop
// closes the stream. Non-streaming JSON bodies carry the same usage block
// at the top level and are handled at finalize.
//
// cache_creation arrives either as the flat cache_creation_input_tokens
// number or as a nested object keyed by TTL bucket - the nested form is
// summed across all numeric children.

use serde_json::Value;

use super::sse::SseScanner;
use super::{Processor, TokenEvent, TokenInfo};
use crate::models::TokenCounters;

pub struct ClaudeProcessor {
    scanner: SseScanner,
    /// Raw body accumulation for the non-SSE JSON fallback
    raw: Vec<u8>,
    saw_sse_event: bool,
    info: TokenInfo,
    first_error: Option<String>,
}

impl ClaudeProcessor {
    pub fn new() -> Self {
        Self {
            scanner: SseScanner::new(),
            raw: Vec::new(),
            saw_sse_event: false,
            info: TokenInfo::default(),
            first_error: None,
        }
    }

    fn cache_creation_total(usage: &Value) -> u64 {
        // Nested object form wins; sum every numeric child
        if let Some(obj) = usage.get("cache_creation").and_then(Value::as_object) {
            return obj.values().filter_map(Value::as_u64).sum();
        }
        usage
            .get("cache_creation_input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    fn merge_usage(&mut self, usage: &Value) -> TokenCounters {
        let mut delta = TokenCounters::default();

        if let Some(v) = usage.get("input_tokens").and_then(Value::as_u64) {
            delta.input = v.saturating_sub(self.info.counters.input);
            self.info.counters.input = self.info.counters.input.max(v);
        }
        if let Some(v) = usage.get("output_tokens").and_then(Value::as_u64) {
            delta.output = v.saturating_sub(self.info.counters.output);
            self.info.counters.output = self.info.counters.output.max(v);
        }
        if let Some(v) = usage.get("cache_read_input_tokens").and_then(Value::as_u64) {
            delta.cache_read = v.saturating_sub(self.info.counters.cache_read);
            self.info.counters.cache_read = self.info.counters.cache_read.max(v);
        }
        let cc = Self::cache_creation_total(usage);
        if cc > 0 {
            delta.cache_creation = cc.saturating_sub(self.info.counters.cache_creation);
            self.info.counters.cache_creation = self.info.counters.cache_creation.max(cc);
        }
        delta
    }

    fn handle_event(&mut self, offset: u64, payload: &str) -> Option<TokenEvent> {
        let data: Value = match serde_json::from_str(payload) {
            Ok(d) => d,
            Err(_) => {
                if self.first_error.is_none() {
                    self.first_error = Some(format!("offset {offset}: malformed event"));
                }
                return None;
            }
        };

        let event_type = data.get("type").and_then(Value::as_str).unwrap_or("");
        match event_type {
            "message_start" => {
                let message = data.get("message")?;
                let mut event = TokenEvent::default();
                if let Some(model) = message.get("model").and_then(Value::as_str) {
                    self.info.model = Some(model.to_string());
                    event.model = Some(model.to_string());
                }
                if let Some(id) = message.get("id").and_then(Value::as_str) {
                    self.info.message_id = Some(id.to_string());
                    event.message_id = Some(id.to_string());
                }
                if let Some(usage) = message.get("usage") {
                    event.delta = Some(self.merge_usage(usage));
                }
                Some(event)
            }
            "message_delta" => {
                let usage = data.get("usage")?;
                Some(TokenEvent {
                    delta: Some(self.merge_usage(usage)),
                    ..Default::default()
                })
            }
            // message_stop and content events carry no usage
            _ => None,
        }
    }

    fn finalize_json_body(&mut self) {
        let Ok(body) = serde_json::from_slice::<Value>(&self.raw) else {
            if self.first_error.is_none() && !self.raw.is_empty() {
                self.first_error = Some("offset 0: malformed json body".to_string());
            }
            return;
        };
        if let Some(model) = body.get("model").and_then(Value::as_str) {
            self.info.model = Some(model.to_string());
        }
        if let Some(id) = body.get("id").and_then(Value::as_str) {
            self.info.message_id = Some(id.to_string());
        }
        if let Some(usage) = body.get("usage") {
            self.merge_usage(usage);
        }
    }
}

impl Processor for ClaudeProcessor {
    fn feed(&mut self, chunk: &[u8]) -> Vec<TokenEvent> {
        if !self.saw_sse_event {
            self.raw.extend_from_slice(chunk);
        }
        let lines = self.scanner.feed(chunk);
        if !lines.is_empty() {
            self.saw_sse_event = true;
            self.raw.clear();
        }
        lines
            .iter()
            .filter_map(|line| self.handle_event(line.offset, &line.payload))
            .collect()
    }

    fn finalize(&mut self) -> Option<TokenInfo> {
        if let Some(last) = self.scanner.finish() {
            self.saw_sse_event = true;
            self.handle_event(last.offset, &last.payload);
        }
        if !self.saw_sse_event && !self.raw.is_empty() {
            self.finalize_json_body();
        }

        if self.info.counters.total() == 0 && self.info.model.is_none() {
            return None;
        }
        self.info.parse_error = self.first_error.clone();
        Some(self.info.clone())
    }
}

impl Default for ClaudeProcessor {
    fn default() -> Self {
        Self::new()
    }
}
