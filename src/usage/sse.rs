// Incremental SSE line scanner
//
// Response bytes arrive in arbitrary chunk boundaries; this scanner
// buffers a trailing partial line across feeds and yields only complete
// `data:` payloads together with their byte offset in the stream (used
// for parse-error reporting).

/// A complete `data:` payload with the stream offset of its line start.
#[derive(Debug, Clone, PartialEq)]
pub struct DataLine {
    pub offset: u64,
    pub payload: String,
}

#[derive(Debug, Default)]
pub struct SseScanner {
    partial: Vec<u8>,
    /// Stream offset of the first byte of `partial`
    line_start: u64,
    consumed: u64,
}

impl SseScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning the `data:` payloads completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<DataLine> {
        let mut out = Vec::new();
        self.consumed += chunk.len() as u64;
        self.partial.extend_from_slice(chunk);

        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            let offset = self.line_start;
            self.line_start += line.len() as u64;

            let text = String::from_utf8_lossy(&line);
            let trimmed = text.trim();
            if let Some(payload) = trimmed.strip_prefix("data:") {
                let payload = payload.trim();
                if !payload.is_empty() && payload != "[DONE]" {
                    out.push(DataLine {
                        offset,
                        payload: payload.to_string(),
                    });
                }
            }
        }
        out
    }

    /// Flush a trailing line that never got its newline (stream ended).
    pub fn finish(&mut self) -> Option<DataLine> {
        if self.partial.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.partial).to_string();
        let offset = self.line_start;
        self.partial.clear();
        self.line_start = self.consumed;

        let trimmed = text.trim();
        let payload = trimmed.strip_prefix("data:")?.trim();
        if payload.is_empty() || payload == "[DONE]" {
            return None;
        }
        Some(DataLine {
            offset,
            payload: payload.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_across_chunks_reassembles() {
        let mut scanner = SseScanner::new();
        assert!(scanner.feed(b"event: message_start\ndata: {\"a\"").is_empty());
        let lines = scanner.feed(b": 1}\n\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].payload, "{\"a\": 1}");
    }

    #[test]
    fn offsets_point_at_line_starts() {
        let mut scanner = SseScanner::new();
        let lines = scanner.feed(b"data: one\ndata: two\n");
        assert_eq!(lines[0].offset, 0);
        assert_eq!(lines[1].offset, 10);
    }

    #[test]
    fn done_marker_and_comments_are_skipped() {
        let mut scanner = SseScanner::new();
        let lines = scanner.feed(b"data: [DONE]\n: keepalive\ndata:\n");
        assert!(lines.is_empty());
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut scanner = SseScanner::new();
        assert!(scanner.feed(b"data: {\"x\":2}").is_empty());
        let last = scanner.finish().unwrap();
        assert_eq!(last.payload, "{\"x\":2}");
    }
}
