// Google generateContent usage extraction
//
// Gemini answers either as a single JSON document or as SSE where every
// chunk repeats usageMetadata with growing candidatesTokenCount; the last
// one seen wins. promptTokenCount includes cachedContentTokenCount, so
// the cached share is split out the same way the codex wire does it.

use serde_json::Value;

use super::sse::SseScanner;
use super::{Processor, TokenEvent, TokenInfo};
use crate::models::TokenCounters;

pub struct GeminiProcessor {
    scanner: SseScanner,
    raw: Vec<u8>,
    saw_sse_event: bool,
    info: TokenInfo,
    first_error: Option<String>,
}

impl GeminiProcessor {
    pub fn new() -> Self {
        Self {
            scanner: SseScanner::new(),
            raw: Vec::new(),
            saw_sse_event: false,
            info: TokenInfo::default(),
            first_error: None,
        }
    }

    fn apply_payload(&mut self, payload: &Value) -> Option<TokenCounters> {
        if let Some(model) = payload.get("modelVersion").and_then(Value::as_str) {
            self.info.model = Some(model.to_string());
        }
        if let Some(id) = payload.get("responseId").and_then(Value::as_str) {
            self.info.message_id = Some(id.to_string());
        }

        let usage = payload.get("usageMetadata")?;
        let prompt = usage
            .get("promptTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let cached = usage
            .get("cachedContentTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let mut output = usage
            .get("candidatesTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        // Thinking tokens bill as output on this wire
        output += usage
            .get("thoughtsTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let counters = TokenCounters {
            input: prompt.saturating_sub(cached),
            output,
            cache_creation: 0,
            cache_read: cached,
        };
        self.info.counters = counters;
        Some(counters)
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
        let delta = self.apply_payload(&data)?;
        Some(TokenEvent {
            model: self.info.model.clone(),
            message_id: self.info.message_id.clone(),
            delta: Some(delta),
        })
    }
}

impl Processor for GeminiProcessor {
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
            match serde_json::from_slice::<Value>(&self.raw) {
                Ok(body) => {
                    // Whole-array responses wrap chunks; take the last element
                    if let Some(items) = body.as_array() {
                        for item in items {
                            self.apply_payload(item);
                        }
                    } else {
                        self.apply_payload(&body);
                    }
                }
                Err(_) => {
                    if self.first_error.is_none() {
                        self.first_error = Some("offset 0: malformed json body".to_string());
                    }
                }
            }
        }

        if self.info.counters.total() == 0 && self.info.model.is_none() {
            return None;
        }
        self.info.parse_error = self.first_error.clone();
        Some(self.info.clone())
    }
}

impl Default for GeminiProcessor {
    fn default() -> Self {
        Self::new()
    }
}
