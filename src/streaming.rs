//! Streaming forwarder (spec §4.6): transparent SSE/NDJSON passthrough, plus
//! JSON-to-SSE synthesis for upstreams that refuse `stream=true` together
//! with tool calls.
//!
//! Both paths tee their bytes into a bounded ring buffer (for `RequestLog`
//! persistence) and into a `UsageParser`. Passthrough copies bytes unmodified
//! and flushes per read; synthesis buffers the full upstream JSON body first,
//! since there is nothing to stream until the whole object is in hand.

use bytes::Bytes;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::usage::UsageParser;

/// Default cap for the RequestLog tee buffer (spec §4.6a).
pub const RING_BUFFER_CAP: usize = 1024 * 1024;

/// Bounded byte accumulator: keeps the first `cap` bytes seen and silently
/// drops the rest, mirroring the RequestLog's own 1 MiB truncation rule
/// (spec §3 `response_content` truncation) so both ends agree on what
/// "truncated" means.
pub struct RingBuffer {
    cap: usize,
    buf: Vec<u8>,
    truncated: bool,
}

impl RingBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            buf: Vec::new(),
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if self.buf.len() >= self.cap {
            self.truncated = true;
            return;
        }
        let room = self.cap - self.buf.len();
        if chunk.len() > room {
            self.buf.extend_from_slice(&chunk[..room]);
            self.truncated = true;
        } else {
            self.buf.extend_from_slice(chunk);
        }
    }

    pub fn into_parts(self) -> (Vec<u8>, bool) {
        (self.buf, self.truncated)
    }
}

/// One chunk of the passthrough tee: bytes to forward to the client verbatim,
/// plus whatever the tee captured for logging/usage along the way.
pub struct PassthroughTee {
    pub ring: RingBuffer,
    pub usage: UsageParser,
    sse: crate::sse::SseParser,
}

impl PassthroughTee {
    pub fn new(usage: UsageParser) -> Self {
        Self {
            ring: RingBuffer::new(RING_BUFFER_CAP),
            usage,
            sse: crate::sse::SseParser::new(),
        }
    }

    /// Feed one chunk read from upstream. Returns the same bytes, unmodified,
    /// for the caller to forward to the client — this tee never rewrites the
    /// passthrough body (spec §4.6a: "copy bytes unmodified").
    pub fn feed(&mut self, chunk: &Bytes) -> Bytes {
        self.ring.push(chunk);
        for event in self.sse.feed(chunk) {
            self.usage.feed(&event);
        }
        chunk.clone()
    }

    pub fn finish(mut self) -> (Vec<u8>, bool, crate::usage::UsageMetrics) {
        for event in self.sse.flush() {
            self.usage.feed(&event);
        }
        let (bytes, truncated) = self.ring.into_parts();
        (bytes, truncated, self.usage.finish())
    }
}

/// Render one SSE `data:` line for a `chat.completion.chunk` object.
fn sse_line(value: &Value) -> String {
    format!("data: {}\n\n", value)
}

/// Synthesize an OpenAI-shaped SSE stream from a fully-buffered upstream
/// JSON body (spec §4.6b). `usage` accumulates from the buffered body's own
/// `usage` field, since there is no SSE to tee usage from on this path.
pub fn synthesize(body: &Value, usage: &mut UsageParser) -> String {
    usage.feed_legacy_json(body);

    let id = body
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("chatcmpl-{}", Uuid::now_v7()));
    let model = body.get("model").and_then(Value::as_str).unwrap_or("").to_string();
    let created = body
        .get("created")
        .and_then(Value::as_u64)
        .unwrap_or_else(now_unix_fallback);

    let choice = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .cloned()
        .unwrap_or(json!({}));
    let message = choice.get("message").cloned().unwrap_or(json!({}));
    let role = message.get("role").and_then(Value::as_str).unwrap_or("assistant").to_string();
    let content = message.get("content").and_then(Value::as_str).map(str::to_string);
    let tool_calls = message.get("tool_calls").cloned();

    let finish_reason = if tool_calls.is_some() { "tool_calls" } else { "stop" };

    let base = |delta: Value, finish: Option<&str>| {
        json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish,
            }],
        })
    };

    let mut out = String::new();

    // Role chunk: exactly one, carries only the role (spec §4.6b bullet 1).
    out.push_str(&sse_line(&base(json!({ "role": role }), None)));

    // Delta chunk: always has a `content` key, even if empty (spec invariant 2).
    let mut delta = json!({ "content": content.unwrap_or_default() });
    if let Some(calls) = tool_calls {
        delta["tool_calls"] = calls;
    }
    out.push_str(&sse_line(&base(delta, None)));

    // Terminal chunk: empty delta, carries finish_reason.
    out.push_str(&sse_line(&base(json!({}), Some(finish_reason))));

    out.push_str("data: [DONE]\n\n");
    out
}

/// Synthesize the single-event error passthrough for a 4xx upstream JSON
/// body (spec §4.6b / §8 invariant: "never close the stream silently on
/// validation errors").
pub fn synthesize_error(body: &Value) -> String {
    format!("{}data: [DONE]\n\n", sse_line(body))
}

/// `created` fallback when the upstream body omits it. Upstreams in practice
/// always set this; this only covers a malformed/test body, so any stable
/// constant is fine here — we do not depend on it being "now".
fn now_unix_fallback() -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Family;

    #[test]
    fn ring_buffer_truncates_past_cap() {
        let mut ring = RingBuffer::new(4);
        ring.push(b"ab");
        ring.push(b"cdef");
        let (bytes, truncated) = ring.into_parts();
        assert_eq!(bytes, b"abcd");
        assert!(truncated);
    }

    #[test]
    fn synthesize_emits_role_delta_terminal_done() {
        let body = json!({
            "id": "resp-1",
            "model": "gpt-x",
            "created": 100,
            "choices": [{"message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
        });
        let mut usage = UsageParser::new(Family::Legacy);
        let out = synthesize(&body, &mut usage);
        let events: Vec<&str> = out.split("\n\n").filter(|s| !s.is_empty()).collect();
        assert_eq!(events.len(), 4); // role, delta, terminal, [DONE]
        assert!(events[0].contains("\"role\":\"assistant\""));
        assert!(events[1].contains("\"content\":\"hi\""));
        assert!(events[2].contains("\"finish_reason\":\"stop\""));
        assert_eq!(events[3], "data: [DONE]");
    }

    #[test]
    fn synthesize_empty_content_with_tool_call_has_content_key_and_tool_calls_finish() {
        let body = json!({
            "model": "m",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{"id": "c1", "type": "function", "function": {"name": "f", "arguments": "{}"}}],
                },
                "finish_reason": "tool_calls",
            }],
        });
        let mut usage = UsageParser::new(Family::Legacy);
        let out = synthesize(&body, &mut usage);
        assert!(out.contains("\"delta\":{\"content\":\"\",\"tool_calls\":[{"));
        assert!(out.contains("\"finish_reason\":\"tool_calls\""));
        assert!(out.trim_end().ends_with("data: [DONE]"));
    }

    #[test]
    fn synthesize_error_emits_single_event_then_done() {
        let err = json!({"error": {"message": "bad request", "type": "invalid_request_error"}});
        let out = synthesize_error(&err);
        assert!(out.starts_with("data: {"));
        assert!(out.ends_with("data: [DONE]\n\n"));
        assert_eq!(out.matches("data: ").count(), 2);
    }
}
