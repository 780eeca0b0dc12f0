//! Minimal Server-Sent Events line framer.
//!
//! Shared by the streaming tee (usage extraction) and the JSON-to-SSE
//! synthesizer's upstream-error passthrough. Events are separated by a
//! blank line; each event accumulates an optional `event:` name and one or
//! more `data:` lines (joined with `\n`, per the SSE spec). Named and
//! shaped after the high-level `SseParser`/`feed`/`flush` interface used
//! for Claude/Codex/Legacy SSE consumption elsewhere in the ecosystem.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

#[derive(Default)]
pub struct SseParser {
    buf: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed newly-arrived bytes; returns every complete event found so far.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        loop {
            let boundary = find_blank_line(&self.buf);
            let Some((end, next_start)) = boundary else {
                break;
            };
            let block = self.buf[..end].to_vec();
            self.buf.drain(..next_start);
            if let Some(event) = parse_block(&block) {
                events.push(event);
            }
        }

        events
    }

    /// Parse any remaining buffered bytes as a final event (stream closed
    /// without a trailing blank line).
    pub fn flush(&mut self) -> Vec<SseEvent> {
        if self.buf.is_empty() {
            return Vec::new();
        }
        let block = std::mem::take(&mut self.buf);
        parse_block(&block).into_iter().collect()
    }
}

/// Find the first `\n\n` or `\r\n\r\n` boundary; returns `(block_end, next_start)`.
fn find_blank_line(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, i + 2));
        }
        if i + 3 < buf.len() && &buf[i..i + 4] == b"\r\n\r\n" {
            return Some((i, i + 4));
        }
        i += 1;
    }
    None
}

fn parse_block(block: &[u8]) -> Option<SseEvent> {
    let text = String::from_utf8_lossy(block);
    let mut event_type: Option<String> = None;
    let mut data_lines: Vec<String> = Vec::new();

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event_type = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start().to_string());
        }
        // `id:`, `retry:`, and comment lines (starting with `:`) are ignored —
        // the pipeline doesn't need last-event-id resumption.
    }

    if data_lines.is_empty() && event_type.is_none() {
        return None;
    }

    Some(SseEvent {
        event: event_type,
        data: data_lines.join("\n"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_event_with_data() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"event: message_start\ndata: {\"a\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn parses_unnamed_data_only_event() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: [DONE]\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, None);
        assert_eq!(events[0].data, "[DONE]");
    }

    #[test]
    fn handles_events_split_across_feed_calls() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: {\"a\"").is_empty());
        let events = parser.feed(b":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn flush_emits_trailing_block_without_blank_line() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: partial").is_empty());
        let events = parser.flush();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "partial");
    }

    #[test]
    fn multi_line_data_is_joined_with_newline() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: line1\ndata: line2\n\n");
        assert_eq!(events[0].data, "line1\nline2");
    }
}
