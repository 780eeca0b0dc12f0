//! `RequestLog` — the append-only JSONL record of every request a family
//! service has handled, plus a bounded in-memory ring and a realtime event
//! fan-out (spec §3, §4.8, §5).
//!
//! The writer is single-threaded per family: one task owns the file and
//! drains a bounded mpsc channel, the way the teacher's monitoring stream
//! owns a single sysinfo refresh loop and fans updates out over per-client
//! channels rather than letting callers touch shared mutable state directly.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::Engine as _;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::config::Family;
use crate::usage::UsageMetrics;

const WRITER_CHANNEL_CAP: usize = 256;
const DEFAULT_RING_CAP: usize = 50;
const BODY_TRUNCATE_CAP: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Streaming,
    Completed,
    Failed,
}

impl RequestStatus {
    /// Per spec §8 invariant 4: status only ever advances, never regresses.
    fn rank(self) -> u8 {
        match self {
            RequestStatus::Pending => 0,
            RequestStatus::Streaming => 1,
            RequestStatus::Completed => 2,
            RequestStatus::Failed => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub timestamp_start: String,
    pub timestamp_end: Option<String>,
    pub service: Family,
    pub channel: Option<String>,
    pub method: String,
    pub path: String,
    pub model_original: String,
    pub model_final: Option<String>,
    pub status_code: Option<u16>,
    pub duration_ms: Option<u64>,
    pub status: RequestStatus,
    pub original_body_b64: String,
    pub filtered_body_b64: String,
    #[serde(default)]
    pub response_headers: Vec<(String, String)>,
    pub response_content_b64: Option<String>,
    #[serde(default)]
    pub response_truncated: bool,
    #[serde(default)]
    pub usage: UsageMetrics,
    pub error_message: Option<String>,
    /// Set when the writer had to drop an unflushed record to make room in
    /// its channel; surfaced on the next record that does make it through.
    #[serde(default)]
    pub overflow: bool,
}

impl RequestRecord {
    pub fn new(service: Family, method: &str, path: &str, model_original: &str, original_body: &[u8]) -> Self {
        Self {
            request_id: Uuid::now_v7().to_string(),
            timestamp_start: chrono::Utc::now().to_rfc3339(),
            timestamp_end: None,
            service,
            channel: None,
            method: method.to_string(),
            path: path.to_string(),
            model_original: model_original.to_string(),
            model_final: None,
            status_code: None,
            duration_ms: None,
            status: RequestStatus::Pending,
            original_body_b64: base64::engine::general_purpose::STANDARD.encode(original_body),
            filtered_body_b64: String::new(),
            response_headers: Vec::new(),
            response_content_b64: None,
            response_truncated: false,
            usage: UsageMetrics::default(),
            error_message: None,
            overflow: false,
        }
    }

    /// Advance `status`, ignoring attempts to move backward (spec invariant 4).
    pub fn advance(&mut self, status: RequestStatus) {
        if status.rank() >= self.status.rank() {
            self.status = status;
        }
    }

    pub fn set_response_body(&mut self, body: &[u8]) {
        let cap = BODY_TRUNCATE_CAP.min(body.len());
        self.response_truncated = body.len() > BODY_TRUNCATE_CAP;
        self.response_content_b64 = Some(base64::engine::general_purpose::STANDARD.encode(&body[..cap]));
    }
}

/// Realtime fan-out events (spec §4.8).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum LogEvent {
    Snapshot(Vec<RequestRecord>),
    Started(RequestRecord),
    Progress { request_id: String, delta: String },
    Completed(RequestRecord),
    Failed(RequestRecord),
}

enum WriterMsg {
    Append(RequestRecord),
    Clear,
}

struct Inner {
    ring: Mutex<VecDeque<RequestRecord>>,
    ring_cap: Mutex<usize>,
    events: broadcast::Sender<LogEvent>,
    writer_tx: mpsc::Sender<WriterMsg>,
    path: PathBuf,
    /// Set when `finish()` fails to enqueue a record because the writer
    /// channel is full — that record never reaches disk. `run_writer`
    /// consumes this flag on the next record it does manage to append,
    /// marking it `overflow=true` (spec §5: "marks `overflow=true` on the
    /// next successful append").
    overflow_pending: Arc<AtomicBool>,
}

/// Per-family request log: JSONL file + bounded ring + realtime fan-out.
#[derive(Clone)]
pub struct RequestLog {
    inner: Arc<Inner>,
}

impl RequestLog {
    pub fn new(root: &std::path::Path, family: Family, ring_cap: usize) -> Self {
        let path = root.join("data").join(format!("{}.jsonl", family.as_str()));
        let (events, _rx) = broadcast::channel(256);
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAP);
        let overflow_pending = Arc::new(AtomicBool::new(false));

        let log = Self {
            inner: Arc::new(Inner {
                ring: Mutex::new(VecDeque::with_capacity(ring_cap)),
                ring_cap: Mutex::new(ring_cap),
                events,
                writer_tx,
                path: path.clone(),
                overflow_pending: overflow_pending.clone(),
            }),
        };

        tokio::spawn(run_writer(path, writer_rx, overflow_pending));
        log
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        let rx = self.inner.events.subscribe();
        let snapshot: Vec<RequestRecord> = self.inner.ring.lock().iter().cloned().collect();
        let _ = self.inner.events.send(LogEvent::Snapshot(snapshot));
        rx
    }

    pub fn set_ring_cap(&self, cap: usize) {
        *self.inner.ring_cap.lock() = cap;
        let mut ring = self.inner.ring.lock();
        while ring.len() > cap {
            ring.pop_front();
        }
    }

    pub fn started(&self, record: RequestRecord) {
        self.push_ring(record.clone());
        let _ = self.inner.events.send(LogEvent::Started(record));
    }

    pub fn progress(&self, request_id: &str, delta: &str) {
        let _ = self.inner.events.send(LogEvent::Progress {
            request_id: request_id.to_string(),
            delta: delta.to_string(),
        });
    }

    /// Finalize a record (COMPLETED or FAILED), append it to disk, update the
    /// ring, and broadcast the terminal event.
    pub async fn finish(&self, mut record: RequestRecord) {
        record.timestamp_end = Some(chrono::Utc::now().to_rfc3339());
        self.replace_in_ring(record.clone());

        let event = match record.status {
            RequestStatus::Failed => LogEvent::Failed(record.clone()),
            _ => LogEvent::Completed(record.clone()),
        };
        let _ = self.inner.events.send(event);

        if self.inner.writer_tx.try_send(WriterMsg::Append(record)).is_err() {
            self.inner.overflow_pending.store(true, Ordering::SeqCst);
            tracing::warn!(path = %self.inner.path.display(), "request log writer channel full, dropping unflushed record");
        }
    }

    /// Wipe the file, ring, and (by construction, since the ring held them)
    /// usage aggregates derived from it.
    pub async fn clear(&self) {
        self.inner.ring.lock().clear();
        let _ = self.inner.writer_tx.send(WriterMsg::Clear).await;
    }

    pub fn list(&self, limit: usize) -> Vec<RequestRecord> {
        let ring = self.inner.ring.lock();
        ring.iter().rev().take(limit).cloned().collect()
    }

    pub fn get(&self, request_id: &str) -> Option<RequestRecord> {
        self.inner.ring.lock().iter().find(|r| r.request_id == request_id).cloned()
    }

    fn push_ring(&self, record: RequestRecord) {
        let mut ring = self.inner.ring.lock();
        let cap = *self.inner.ring_cap.lock();
        if ring.len() >= cap {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    fn replace_in_ring(&self, record: RequestRecord) {
        let mut ring = self.inner.ring.lock();
        if let Some(slot) = ring.iter_mut().find(|r| r.request_id == record.request_id) {
            *slot = record;
        } else {
            let cap = *self.inner.ring_cap.lock();
            if ring.len() >= cap {
                ring.pop_front();
            }
            ring.push_back(record);
        }
    }
}

async fn run_writer(path: PathBuf, mut rx: mpsc::Receiver<WriterMsg>, overflow_pending: Arc<AtomicBool>) {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            tracing::error!(error = %e, "failed to create request log directory");
        }
    }

    while let Some(msg) = rx.recv().await {
        match msg {
            WriterMsg::Append(mut record) => {
                record.overflow = overflow_pending.swap(false, Ordering::SeqCst);
                match serde_json::to_string(&record) {
                    Ok(line) => {
                        if let Err(e) = append_line(&path, &line).await {
                            tracing::error!(error = %e, path = %path.display(), "failed to append request log line");
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "failed to serialize request record"),
                }
            }
            WriterMsg::Clear => {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(error = %e, "failed to remove request log file on clear");
                    }
                }
                overflow_pending.store(false, Ordering::SeqCst);
            }
        }
    }
}

async fn append_line(path: &std::path::Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(service: Family) -> RequestRecord {
        RequestRecord::new(service, "POST", "/v1/messages", "claude-3", b"{}")
    }

    #[test]
    fn status_never_regresses() {
        let mut r = record(Family::Claude);
        r.advance(RequestStatus::Streaming);
        r.advance(RequestStatus::Pending);
        assert_eq!(r.status, RequestStatus::Streaming);
        r.advance(RequestStatus::Completed);
        assert_eq!(r.status, RequestStatus::Completed);
    }

    #[tokio::test]
    async fn finish_appends_and_updates_ring() {
        let dir = tempfile::tempdir().unwrap();
        let log = RequestLog::new(dir.path(), Family::Claude, 10);
        let mut r = record(Family::Claude);
        log.started(r.clone());
        r.advance(RequestStatus::Completed);
        log.finish(r.clone()).await;

        // writer is async; give it a tick to flush
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let listed = log.list(10);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].request_id, r.request_id);

        let contents = tokio::fs::read_to_string(dir.path().join("data/claude.jsonl")).await.unwrap();
        assert!(contents.contains(&r.request_id));
    }

    #[tokio::test]
    async fn ring_respects_configured_cap() {
        let dir = tempfile::tempdir().unwrap();
        let log = RequestLog::new(dir.path(), Family::Codex, 2);
        for _ in 0..5 {
            log.started(record(Family::Codex));
        }
        assert_eq!(log.list(10).len(), 2);
    }

    #[tokio::test]
    async fn overflow_flag_is_consumed_by_next_successful_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data/overflow.jsonl");
        let (tx, rx) = mpsc::channel(4);
        let overflow_pending = Arc::new(AtomicBool::new(false));
        let writer = tokio::spawn(run_writer(path.clone(), rx, overflow_pending.clone()));

        // Simulate `finish()` having lost a record to a full channel.
        overflow_pending.store(true, Ordering::SeqCst);
        tx.send(WriterMsg::Append(record(Family::Claude))).await.unwrap();
        drop(tx);
        writer.await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.contains("\"overflow\":true"));
        assert!(!overflow_pending.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn clear_empties_ring_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = RequestLog::new(dir.path(), Family::Legacy, 10);
        let mut r = record(Family::Legacy);
        r.advance(RequestStatus::Completed);
        log.finish(r).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        log.clear().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(log.list(10).len(), 0);
        assert!(!dir.path().join("data/legacy.jsonl").exists());
    }
}
