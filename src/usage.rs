//! `UsageParser` — extracts token-usage counts from streamed upstream
//! chunks, per family grammar (spec §4.7).
//!
//! Runs as a sink on the tee from the streaming forwarder. Parser failures
//! are non-fatal: on any malformed/unexpected shape we emit zeros and log a
//! warning rather than failing the request, mirroring the accumulator
//! pattern in the SSE-consuming example code (never let a usage-shape quirk
//! abort an otherwise-successful response).

use serde_json::Value;

use crate::config::Family;
use crate::sse::SseEvent;

/// Non-negative token counts for one request (spec §3 `UsageMetrics`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct UsageMetrics {
    pub input: u64,
    pub cached_create: u64,
    pub cached_read: u64,
    pub output: u64,
    pub reasoning: u64,
    pub total: u64,
}

impl UsageMetrics {
    fn finalize(mut self) -> Self {
        if self.total == 0 && (self.input != 0 || self.output != 0) {
            self.total = self.input + self.output;
        }
        self
    }
}

/// Accumulates usage across one request's SSE events. Family-specific
/// grammar lives in `feed_claude` / `feed_codex` / `feed_legacy`; the
/// pipeline picks the right one up front based on the family being served.
#[derive(Debug, Default)]
pub struct UsageParser {
    family: Option<Family>,
    metrics: UsageMetrics,
    // Legacy: track the last `usage` object seen, since only the final
    // chunk in a Chat Completions stream carries it.
    last_legacy_usage: Option<UsageMetrics>,
}

impl UsageParser {
    pub fn new(family: Family) -> Self {
        Self {
            family: Some(family),
            ..Default::default()
        }
    }

    pub fn feed(&mut self, event: &SseEvent) {
        let family = match self.family {
            Some(f) => f,
            None => return,
        };
        match family {
            Family::Claude => self.feed_claude(event),
            Family::Codex => self.feed_codex(event),
            Family::Legacy => self.feed_legacy(event),
        }
    }

    /// Feed a fully-buffered (non-streamed) upstream JSON body, for the
    /// Legacy synthesis path (§4.6b) where there is no SSE to tee.
    pub fn feed_legacy_json(&mut self, body: &Value) {
        if let Some(usage) = body.get("usage") {
            self.last_legacy_usage = Some(parse_legacy_usage(usage));
        }
    }

    pub fn finish(mut self) -> UsageMetrics {
        if self.family == Some(Family::Legacy) {
            if let Some(u) = self.last_legacy_usage {
                self.metrics = u;
            }
        }
        self.metrics.finalize()
    }

    // ---- Claude (Messages SSE) ----
    // Final usage arrives on `message_delta`/`message_stop` with an
    // `"usage"` object carrying input/cache-creation/cache-read/output.
    fn feed_claude(&mut self, event: &SseEvent) {
        let Some(name) = &event.event else { return };
        if name != "message_delta" && name != "message_stop" {
            return;
        }
        let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
            tracing::warn!("usage parser: malformed claude SSE data, emitting zeros for this event");
            return;
        };
        let Some(usage) = value.get("usage") else { return };
        self.metrics.input = usage
            .get("input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(self.metrics.input);
        self.metrics.cached_create = usage
            .get("cache_creation_input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(self.metrics.cached_create);
        self.metrics.cached_read = usage
            .get("cache_read_input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(self.metrics.cached_read);
        self.metrics.output = usage
            .get("output_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(self.metrics.output);
    }

    // ---- Codex (Responses SSE) ----
    // Usage arrives on a terminal event (`response.completed` /
    // `response.done`) carrying `"usage"` with input/output tokens and a
    // cached-token breakdown. Displayed `input` excludes `cached_read`
    // (spec §4.7 post-processing: UI convention, not double-counted).
    fn feed_codex(&mut self, event: &SseEvent) {
        let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
            return;
        };
        let usage = value
            .get("usage")
            .or_else(|| value.get("response").and_then(|r| r.get("usage")));
        let Some(usage) = usage else { return };

        let input_total = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
        let cached_read = usage
            .get("input_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let output_total = usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
        let reasoning = usage
            .get("output_tokens_details")
            .and_then(|d| d.get("reasoning_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0);

        self.metrics.cached_read = cached_read;
        self.metrics.input = input_total.saturating_sub(cached_read);
        self.metrics.output = output_total;
        self.metrics.reasoning = reasoning;
    }

    // ---- Legacy (Chat SSE) ----
    // Only the last chunk carries `usage`; we keep overwriting
    // `last_legacy_usage` as chunks arrive, so whatever was seen last wins.
    fn feed_legacy(&mut self, event: &SseEvent) {
        if event.data.trim() == "[DONE]" {
            return;
        }
        let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
            return;
        };
        if let Some(usage) = value.get("usage") {
            self.last_legacy_usage = Some(parse_legacy_usage(usage));
        }
    }
}

fn parse_legacy_usage(usage: &Value) -> UsageMetrics {
    let input = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
    let output = usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0);
    let total = usage.get("total_tokens").and_then(Value::as_u64);
    UsageMetrics {
        input,
        output,
        total: total.unwrap_or(input + output),
        cached_create: 0,
        cached_read: 0,
        reasoning: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_usage_accumulates_from_message_delta() {
        let mut parser = UsageParser::new(Family::Claude);
        parser.feed(&SseEvent {
            event: Some("message_delta".into()),
            data: r#"{"usage":{"input_tokens":10,"cache_creation_input_tokens":2,"cache_read_input_tokens":3,"output_tokens":5}}"#.into(),
        });
        let usage = parser.finish();
        assert_eq!(usage.input, 10);
        assert_eq!(usage.cached_create, 2);
        assert_eq!(usage.cached_read, 3);
        assert_eq!(usage.output, 5);
        assert_eq!(usage.total, 15);
    }

    #[test]
    fn codex_input_excludes_cached_read() {
        let mut parser = UsageParser::new(Family::Codex);
        parser.feed(&SseEvent {
            event: None,
            data: r#"{"type":"response.completed","usage":{"input_tokens":100,"input_tokens_details":{"cached_tokens":40},"output_tokens":20,"output_tokens_details":{"reasoning_tokens":5}}}"#.into(),
        });
        let usage = parser.finish();
        assert_eq!(usage.input, 60);
        assert_eq!(usage.cached_read, 40);
        assert_eq!(usage.output, 20);
        assert_eq!(usage.reasoning, 5);
    }

    #[test]
    fn legacy_usage_takes_the_last_chunk_seen() {
        let mut parser = UsageParser::new(Family::Legacy);
        parser.feed(&SseEvent {
            event: None,
            data: r#"{"choices":[{"delta":{"content":"hi"}}]}"#.into(),
        });
        parser.feed(&SseEvent {
            event: None,
            data: r#"{"usage":{"prompt_tokens":7,"completion_tokens":3}}"#.into(),
        });
        parser.feed(&SseEvent {
            event: None,
            data: "[DONE]".into(),
        });
        let usage = parser.finish();
        assert_eq!(usage.input, 7);
        assert_eq!(usage.output, 3);
        assert_eq!(usage.total, 10);
    }

    #[test]
    fn malformed_event_yields_zeros_not_a_crash() {
        let mut parser = UsageParser::new(Family::Claude);
        parser.feed(&SseEvent {
            event: Some("message_delta".into()),
            data: "not json".into(),
        });
        assert_eq!(parser.finish(), UsageMetrics::default());
    }
}
