// OpenAI responses-API usage extraction (codex wire)
//
// response.created emits the response id (used as the message id);
// response.completed carries the flat usage block. cached_tokens nest
// under input_tokens_details; reasoning_tokens under
// output_tokens_details are logged but not billed separately. There is
// no cache-write concept on this wire, so cache_creation is always 0.

use serde_json::Value;

use super::sse::SseScanner;
use super::{Processor, TokenEvent, TokenInfo};
use crate::models::TokenCounters;

pub struct CodexProcessor {
    scanner: SseScanner,
    raw: Vec<u8>,
    saw_sse_event: bool,
    info: TokenInfo,
    reasoning_tokens: u64,
    first_error: Option<String>,
}

impl CodexProcessor {
    pub fn new() -> Self {
        Self {
            scanner: SseScanner::new(),
            raw: Vec::new(),
            saw_sse_event: false,
            info: TokenInfo::default(),
            reasoning_tokens: 0,
            first_error: None,
        }
    }

    /// Tokens spent on reasoning, reported for observability only.
    pub fn reasoning_tokens(&self) -> u64 {
        self.reasoning_tokens
    }

    fn apply_usage(&mut self, usage: &Value) -> TokenCounters {
        let input = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
        let cached = usage
            .pointer("/input_tokens_details/cached_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let output = usage
            .get("output_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        self.reasoning_tokens = usage
            .pointer("/output_tokens_details/reasoning_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        // cached tokens are a subset of input_tokens on this wire
        let counters = TokenCounters {
            input: input.saturating_sub(cached),
            output,
            cache_creation: 0,
            cache_read: cached,
        };
        self.info.counters = counters;
        counters
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
            "response.created" => {
                let id = data.pointer("/response/id").and_then(Value::as_str)?;
                self.info.message_id = Some(id.to_string());
                if let Some(model) = data.pointer("/response/model").and_then(Value::as_str) {
                    self.info.model = Some(model.to_string());
                }
                Some(TokenEvent {
                    message_id: Some(id.to_string()),
                    model: self.info.model.clone(),
                    delta: None,
                })
            }
            "response.completed" => {
                let response = data.get("response")?;
                if let Some(model) = response.get("model").and_then(Value::as_str) {
                    self.info.model = Some(model.to_string());
                }
                let usage = response.get("usage")?;
                let delta = self.apply_usage(usage);
                Some(TokenEvent {
                    delta: Some(delta),
                    ..Default::default()
                })
            }
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
        if let Some(id) = body.get("id").and_then(Value::as_str) {
            self.info.message_id = Some(id.to_string());
        }
        if let Some(model) = body.get("model").and_then(Value::as_str) {
            self.info.model = Some(model.to_string());
        }
        if let Some(usage) = body.get("usage") {
            self.apply_usage(usage);
        }
    }
}

impl Processor for CodexProcessor {
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

        if self.info.counters.total() == 0 && self.info.message_id.is_none() {
            return None;
        }
        self.info.parse_error = self.first_error.clone();
        Some(self.info.clone())
    }
}

impl Default for CodexProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_then_completed_yields_full_info() {
        let mut p = CodexProcessor::new();
        p.feed(
            b"data: {\"type\":\"response.created\",\"response\":{\"id\":\"resp_abc123\",\"model\":\"gpt-5-codex\"}}\n",
        );
        p.feed(
            b"data: {\"type\":\"response.completed\",\"response\":{\"model\":\"gpt-5-codex\",\
              \"usage\":{\"input_tokens\":100,\"input_tokens_details\":{\"cached_tokens\":60},\
              \"output_tokens\":40,\"output_tokens_details\":{\"reasoning_tokens\":25}}}}\n",
        );

        let reasoning = p.reasoning_tokens();
        let info = p.finalize().unwrap();
        assert_eq!(info.message_id.as_deref(), Some("resp_abc123"));
        assert_eq!(info.model.as_deref(), Some("gpt-5-codex"));
        // cached tokens move out of input into cache_read
        assert_eq!(info.counters.input, 40);
        assert_eq!(info.counters.cache_read, 60);
        assert_eq!(info.counters.output, 40);
        assert_eq!(info.counters.cache_creation, 0);
        assert_eq!(reasoning, 25);
    }

    #[test]
    fn json_body_fallback() {
        let mut p = CodexProcessor::new();
        p.feed(
            br#"{"id":"resp_x","model":"gpt-5","usage":{"input_tokens":10,"output_tokens":5}}"#,
        );
        let info = p.finalize().unwrap();
        assert_eq!(info.counters.input, 10);
        assert_eq!(info.counters.output, 5);
    }

    #[test]
    fn intermediate_output_delta_events_are_ignored() {
        let mut p = CodexProcessor::new();
        let events = p.feed(
            b"data: {\"type\":\"response.output_text.delta\",\"delta\":\"hello\"}\n",
        );
        assert!(events.is_empty());
        assert!(p.finalize().is_none());
    }
}
