//! The request pipeline (spec §4.5): Accept → Transform → Select → Admit →
//! Forward → Stream → Close.
//!
//! One `Pipeline` is shared by all routes of a single family service. It
//! owns nothing about HTTP framing — `app.rs` hands it a parsed JSON body
//! and headers and gets back an axum `Response`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::{Family, SharedConfigStore};
use crate::error::{PipelineError, PipelineResult};
use crate::families::FamilyAdapter;
use crate::filter;
use crate::log::{RequestLog, RequestRecord, RequestStatus};
use crate::rate_limit::RateLimiterRegistry;
use crate::streaming::{self, PassthroughTee};
use crate::upstream::UpstreamPool;
use crate::usage::UsageParser;

/// Upper bound on the TCP+TLS connect phase only — never applied to the
/// request as a whole, since a streaming response body can legitimately run
/// for minutes (spec §4.5). Each `clp_*.rs` entry point sets this on its
/// `reqwest::ClientBuilder` via `connect_timeout`.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Pipeline {
    pub family: Family,
    pub config: SharedConfigStore,
    pub upstream: Arc<UpstreamPool>,
    pub rate_limiters: Arc<RateLimiterRegistry>,
    pub log: RequestLog,
    pub http: reqwest::Client,
    pub adapter: Box<dyn FamilyAdapter>,
}

impl Pipeline {
    /// Handle one inbound request body against `path` (already normalized to
    /// the family's routes by `app.rs`).
    pub async fn handle(&self, method: &str, path: &str, headers: HeaderMap, body: Bytes) -> Response {
        let mut record = RequestRecord::new(self.family, method, path, "", &body);
        let request_id = record.request_id.clone();

        match self.run(&mut record, headers, body).await {
            Ok(response) => response,
            Err(err) => {
                // A network/transport error from the initial send (DNS
                // failure, connection refused, TLS error) never reaches the
                // explicit 5xx branch in `run()` — it short-circuits via `?`
                // straight here. Count it against the upstream the same way
                // (spec §4.4, §7: "5xx and transport errors... do increment
                // FailureTracker").
                if err.counts_as_upstream_failure() {
                    if let Some(channel) = record.channel.clone() {
                        self.upstream.record_failure(self.family, &channel).await;
                    }
                }
                record.advance(RequestStatus::Failed);
                record.status_code = Some(err.status_code().as_u16());
                record.error_message = Some(err.to_string());
                self.log.finish(record).await;
                tracing::warn!(request_id, error = %err, "request failed");
                err.into_response()
            }
        }
    }

    async fn run(&self, record: &mut RequestRecord, headers: HeaderMap, body: Bytes) -> PipelineResult<Response> {
        // ACCEPT
        let mut original: Value = serde_json::from_slice(&body).map_err(|e| PipelineError::BadRequest(e.to_string()))?;
        let model_original = original
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError::BadRequest("missing `model` field".into()))?
            .to_string();
        record.model_original = model_original.clone();

        let client_wants_stream = original.get("stream").and_then(Value::as_bool).unwrap_or(false);

        // TRANSFORM — path normalization: a request that arrived on one of
        // this family's alternate routes gets its body reshaped into the
        // family's native shape before model rewriting/backfill run (spec
        // §4.5 step 2).
        if self.adapter.alternate_paths().contains(&path) {
            original = self.adapter.convert_alternate_body(original);
        }

        // `self.adapter` reads its model mappings (and, for Codex, reasoning
        // defaults) fresh from `self.config` on every call, so a routing/
        // system edit picked up by the config watcher applies immediately.
        let adapted = self.adapter.adapt_body(original, model_original.clone(), client_wants_stream);
        record.model_final = Some(adapted.model_final.clone());

        let serialized = serde_json::to_string(&adapted.body).map_err(|e| PipelineError::BadRequest(e.to_string()))?;
        let filter_rules = self.config.filter_rules();
        let filtered = filter::apply(&serialized, &filter_rules);
        record.filtered_body_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, filtered.as_bytes());

        // SELECT
        let selected = self.upstream.select(self.family, &model_original).await?;
        record.channel = Some(selected.config.name.clone());

        // ADMIT
        let cap = selected.config.effective_rpm();
        let limiter = self.rate_limiters.get(self.family.as_str(), &selected.config.name, cap).await;
        let cancel = CancellationToken::new();
        limiter
            .admit(&cancel)
            .await
            .map_err(|_| PipelineError::RateWaitCancelled)?;

        // FORWARD — the adapter, not a generic re-derivation, is authoritative
        // on what `stream` value it actually put in the outgoing body (Codex
        // always forces `true`; spec §8 scenario 4).
        let upstream_streaming = adapted.upstream_stream;
        let mut req_headers = reqwest::header::HeaderMap::new();
        for (name, value) in headers.iter() {
            if name == axum::http::header::HOST {
                continue;
            }
            if let Ok(v) = reqwest::header::HeaderValue::from_bytes(value.as_bytes()) {
                if let Ok(n) = reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()) {
                    req_headers.insert(n, v);
                }
            }
        }
        req_headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        self.adapter.adapt_headers(&mut req_headers, &selected.config, upstream_streaming);

        let url = format!("{}{}", selected.config.base_url.trim_end_matches('/'), self.adapter.canonical_path());
        // No per-request `.timeout()` here: that bounds the whole request
        // lifecycle including the response body, which would abort a
        // multi-minute SSE stream partway through (spec §4.5: "no read
        // timeout... indefinite idle"). The connect-phase timeout lives on
        // the `reqwest::Client` itself (`ClientBuilder::connect_timeout`,
        // set once in each `clp_*.rs` entry point).
        let send_fut = self.http.post(&url).headers(req_headers).body(filtered).send();

        let upstream_response = tokio::select! {
            result = send_fut => result.map_err(|e| PipelineError::UpstreamIo(e.to_string()))?,
            _ = cancel.cancelled() => return Err(PipelineError::ClientDisconnect),
        };

        let status = upstream_response.status();
        if status.is_client_error() || status.is_server_error() {
            let content_type = upstream_response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = upstream_response
                .bytes()
                .await
                .map_err(|e| PipelineError::UpstreamIo(e.to_string()))?;
            let axum_status = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);

            if !status.is_server_error() {
                self.upstream.record_client_fault(self.family, &selected.config.name);
            }
            // 5xx is counted once, generically, by `handle()`'s catch-all via
            // `PipelineError::counts_as_upstream_failure()` — the same path a
            // transport error without any HTTP response takes.

            record.status_code = Some(axum_status.as_u16());

            if client_wants_stream {
                // §4.6b: a 4xx/5xx upstream still gets one synthesized SSE
                // event plus [DONE] when the client asked to stream, so it
                // doesn't hang until a read timeout.
                if let Ok(body_json) = serde_json::from_slice::<Value>(&body) {
                    let sse_body = streaming::synthesize_error(&body_json);
                    record.advance(RequestStatus::Completed);
                    record.set_response_body(sse_body.as_bytes());
                    self.log.finish(record.clone()).await;
                    return Ok((
                        axum_status,
                        [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
                        sse_body,
                    )
                        .into_response());
                }
            }

            return Err(PipelineError::UpstreamHttp {
                status: axum_status,
                body,
                content_type,
            });
        }

        record.status_code = Some(status.as_u16());
        record.advance(RequestStatus::Streaming);
        self.log.started(record.clone());

        let content_type = upstream_response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let is_stream_shaped = content_type.contains("text/event-stream") || content_type.contains("application/x-ndjson");

        // STREAM
        if is_stream_shaped || upstream_streaming {
            self.stream_passthrough(record, upstream_response).await
        } else {
            self.buffer_and_respond(record, upstream_response, client_wants_stream, adapted.force_stream_off)
                .await
        }
    }

    /// Copies bytes unmodified from `upstream` to the client, flushing on
    /// each read, while simultaneously teeing into the RequestLog's ring
    /// buffer and the UsageParser (spec §4.6a). Grounded in the teacher's
    /// `normalize_sse_stream` generator (`api/proxy.rs`), generalized here
    /// to accumulate state instead of rewriting bytes.
    async fn stream_passthrough(&self, record: &mut RequestRecord, upstream: reqwest::Response) -> PipelineResult<Response> {
        let progress_log = self.log.clone();
        let request_id = record.request_id.clone();
        let finalizer = StreamFinalizer {
            state: Some((self.log.clone(), record.clone(), PassthroughTee::new(UsageParser::new(self.family)), Instant::now())),
        };

        // Progress events are batched at <=10Hz (spec §4.8): emit at most
        // once per this interval, coalescing whatever chunks arrived since
        // the last flush into one delta.
        const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

        let body_stream = async_stream::stream! {
            let mut finalizer = finalizer;
            let mut inner = upstream.bytes_stream();
            let mut last_progress = Instant::now();
            let mut pending = String::new();
            loop {
                match inner.next().await {
                    Some(Ok(chunk)) => {
                        if let Some((_, _, tee, _)) = finalizer.state.as_mut() {
                            let out = tee.feed(&chunk);
                            pending.push_str(&String::from_utf8_lossy(&chunk));
                            if last_progress.elapsed() >= PROGRESS_INTERVAL {
                                progress_log.progress(&request_id, &pending);
                                pending.clear();
                                last_progress = Instant::now();
                            }
                            yield Ok::<Bytes, std::io::Error>(out);
                        }
                    }
                    Some(Err(e)) => {
                        yield Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
                        break;
                    }
                    None => break,
                }
            }
            if !pending.is_empty() {
                progress_log.progress(&request_id, &pending);
            }
            finalizer.complete(true);
        };

        record.advance(RequestStatus::Streaming);
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(axum::http::header::CONTENT_TYPE, "text/event-stream")
            .body(Body::from_stream(body_stream))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
    }

    async fn buffer_and_respond(
        &self,
        record: &mut RequestRecord,
        upstream: reqwest::Response,
        client_wants_stream: bool,
        force_stream_off: bool,
    ) -> PipelineResult<Response> {
        let started_at = Instant::now();
        let body = upstream.bytes().await.map_err(|e| PipelineError::UpstreamIo(e.to_string()))?;
        let mut usage = UsageParser::new(self.family);

        let response = if client_wants_stream && force_stream_off {
            let parsed: Value = serde_json::from_slice(&body).map_err(|e| PipelineError::BadRequest(e.to_string()))?;
            let sse = streaming::synthesize(&parsed, &mut usage);
            record.response_truncated = false;
            record.set_response_body(sse.as_bytes());
            (
                StatusCode::OK,
                [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
                sse,
            )
                .into_response()
        } else {
            if let Ok(parsed) = serde_json::from_slice::<Value>(&body) {
                usage.feed_legacy_json(&parsed);
            }
            record.set_response_body(&body);
            (
                StatusCode::OK,
                [(axum::http::header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response()
        };

        record.usage = usage.finish();
        record.duration_ms = Some(started_at.elapsed().as_millis() as u64);
        record.advance(RequestStatus::Completed);
        self.log.finish(record.clone()).await;
        Ok(response)
    }
}

/// Finalizes a streamed request's RequestRecord exactly once: either
/// explicitly via `complete()` when the upstream stream ends normally, or
/// via `Drop` — which fires when the body generator is torn down early
/// because the client disconnected mid-stream (spec §5 cancellation rule:
/// finalize FAILED/`ERR_CLIENT_DISCONNECT`, no failure-count increment).
struct StreamFinalizer {
    state: Option<(RequestLog, RequestRecord, PassthroughTee, Instant)>,
}

impl StreamFinalizer {
    fn complete(mut self, ok: bool) {
        self.finish(ok);
    }

    fn finish(&mut self, ok: bool) {
        let Some((log, mut record, tee, started_at)) = self.state.take() else {
            return;
        };
        let (bytes, truncated, usage) = tee.finish();
        record.response_truncated = truncated;
        record.response_content_b64 = Some(base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &bytes));
        record.usage = usage;
        record.duration_ms = Some(started_at.elapsed().as_millis() as u64);
        if !ok {
            record.error_message = Some(PipelineError::ClientDisconnect.to_string());
        }
        record.advance(if ok { RequestStatus::Completed } else { RequestStatus::Failed });
        tokio::spawn(async move { log.finish(record).await });
    }
}

impl Drop for StreamFinalizer {
    fn drop(&mut self) {
        self.finish(false);
    }
}
