// Usage logger - turns a finalized Processor into a priced TokenLog
//
// The logger owns the per-request metadata (tool, session, route, client)
// and the processor doing the byte-level work. Outcome classification
// follows the stream, not the tap: parse failures degrade the log's
// status, upstream/client failures set their own error types, and
// pricing failures zero the costs rather than dropping the record.

use chrono::Utc;

use super::{Processor, TokenEvent, TokenInfo};
use crate::models::{
    PricingStore, RequestStatus, ResponseType, TokenCosts, TokenLog,
};
use crate::pricing;
use crate::tools::ToolId;

/// How the request ended, as observed by the proxy instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Success,
    /// Upstream answered with a non-2xx status
    UpstreamError { status: u16 },
    /// Client went away before the upstream finished
    Interrupted,
    /// No upstream bytes for the idle window
    IdleTimeout,
}

pub struct UsageLogger {
    processor: Box<dyn Processor>,
    tool: ToolId,
    session_id: String,
    config_name: String,
    client_ip: String,
    pricing_template_id: Option<String>,
    response_type: ResponseType,
    started_at: chrono::DateTime<Utc>,
}

impl UsageLogger {
    pub fn new(
        processor: Box<dyn Processor>,
        tool: ToolId,
        session_id: String,
        config_name: String,
        client_ip: String,
        pricing_template_id: Option<String>,
    ) -> Self {
        Self {
            processor,
            tool,
            session_id,
            config_name,
            client_ip,
            pricing_template_id,
            response_type: ResponseType::Unknown,
            started_at: Utc::now(),
        }
    }

    /// Record the negotiated body encoding (from the response content-type).
    pub fn set_response_type(&mut self, response_type: ResponseType) {
        self.response_type = response_type;
    }

    pub fn response_type(&self) -> ResponseType {
        self.response_type
    }

    /// Feed a response chunk through to the processor.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<TokenEvent> {
        if self.response_type == ResponseType::Unknown {
            // Unknown bodies are passed through unparsed
            return Vec::new();
        }
        self.processor.feed(chunk)
    }

    /// Close out the request and build the log row.
    pub fn finalize(mut self, outcome: StreamOutcome, pricing_store: &PricingStore) -> TokenLog {
        let info = if self.response_type == ResponseType::Unknown {
            None
        } else {
            self.processor.finalize()
        };
        let info = info.unwrap_or_else(TokenInfo::default);

        let (request_status, error_type, error_detail) = match &outcome {
            StreamOutcome::Success => match &info.parse_error {
                Some(detail) => (
                    RequestStatus::Failed,
                    Some("parse_error".to_string()),
                    Some(detail.clone()),
                ),
                None => (RequestStatus::Success, None, None),
            },
            StreamOutcome::UpstreamError { status } => (
                RequestStatus::Failed,
                Some("upstream_error".to_string()),
                Some(format!("http status {status}")),
            ),
            StreamOutcome::Interrupted => (
                RequestStatus::Failed,
                Some("request_interrupted".to_string()),
                None,
            ),
            StreamOutcome::IdleTimeout => (
                RequestStatus::Failed,
                Some("upstream_error".to_string()),
                Some("idle-timeout".to_string()),
            ),
        };

        let model = info.model.clone().unwrap_or_else(|| "unknown".to_string());
        let costs = match (&self.pricing_template_id, self.response_type) {
            // Unparsed bodies and missing templates price to zero
            (_, ResponseType::Unknown) => TokenCosts::default(),
            (None, _) => TokenCosts::default(),
            (Some(template_id), _) => {
                match pricing::resolve(pricing_store, template_id, &model) {
                    Ok(price) => pricing::cost(&price, &info.counters),
                    Err(e) => {
                        tracing::debug!("pricing unavailable for {model}: {e}");
                        TokenCosts::default()
                    }
                }
            }
        };

        let now = Utc::now();
        TokenLog {
            id: 0,
            timestamp: now,
            tool_id: self.tool,
            session_id: std::mem::take(&mut self.session_id),
            message_id: info.message_id,
            model,
            config_name: std::mem::take(&mut self.config_name),
            client_ip: std::mem::take(&mut self.client_ip),
            request_status,
            error_type,
            error_detail,
            response_type: self.response_type,
            counters: info.counters,
            costs,
            response_ms: (now - self.started_at).num_milliseconds().max(0) as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PricingStore;
    use crate::tools::WireFlavor;
    use crate::usage::processor_for;

    fn logger(response_type: ResponseType) -> UsageLogger {
        let mut l = UsageLogger::new(
            processor_for(WireFlavor::Anthropic),
            ToolId::ClaudeCode,
            "sess-1".to_string(),
            "global".to_string(),
            "127.0.0.1".to_string(),
            Some("preset-claude".to_string()),
        );
        l.set_response_type(response_type);
        l
    }

    fn pricing() -> PricingStore {
        let mut store = PricingStore::default();
        crate::pricing::install_presets(&mut store);
        store
    }

    #[test]
    fn successful_sse_request_is_priced() {
        let mut l = logger(ResponseType::Sse);
        l.feed(
            b"data: {\"type\":\"message_start\",\"message\":{\"id\":\"m1\",\"model\":\"claude-sonnet-4-20250514\",\"usage\":{\"input_tokens\":1000}}}\n",
        );
        l.feed(
            b"data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":500}}\n",
        );
        let log = l.finalize(StreamOutcome::Success, &pricing());
        assert_eq!(log.request_status, RequestStatus::Success);
        assert_eq!(log.counters.input, 1000);
        assert_eq!(log.counters.output, 500);
        // 1000 in * $3/1M + 500 out * $15/1M
        assert!((log.costs.total - 0.0105).abs() < 1e-9);
    }

    #[test]
    fn unknown_response_type_costs_zero() {
        let mut l = logger(ResponseType::Unknown);
        l.feed(b"<html>not an api response</html>");
        let log = l.finalize(StreamOutcome::Success, &pricing());
        assert_eq!(log.response_type, ResponseType::Unknown);
        assert_eq!(log.costs.total, 0.0);
        assert_eq!(log.counters.total(), 0);
    }

    #[test]
    fn interrupted_request_keeps_partial_counters() {
        let mut l = logger(ResponseType::Sse);
        l.feed(
            b"data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-sonnet-4\",\"usage\":{\"input_tokens\":50}}}\n",
        );
        let log = l.finalize(StreamOutcome::Interrupted, &pricing());
        assert_eq!(log.request_status, RequestStatus::Failed);
        assert_eq!(log.error_type.as_deref(), Some("request_interrupted"));
        assert_eq!(log.counters.input, 50);
    }

    #[test]
    fn upstream_error_carries_status() {
        let l = logger(ResponseType::Json);
        let log = l.finalize(StreamOutcome::UpstreamError { status: 529 }, &pricing());
        assert_eq!(log.error_type.as_deref(), Some("upstream_error"));
        assert_eq!(log.error_detail.as_deref(), Some("http status 529"));
    }
}
