//! Diagnostic trace: one JSON line per finished test, session reset, or
//! path report.
//!
//! Protocol loops must never wait on the disk, so lines go through a bounded
//! channel to a dedicated writer task. When the channel is full the line is
//! dropped and counted; the writer records the gap with an `overflow` marker
//! the next time it gets to run.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::{FailureReason, Outcome, TestKind};

/// Default number of lines that may wait for the writer.
pub const DEFAULT_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// TraceEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TraceEvent {
    /// A client-side test reached its terminal state.
    TestCompleted,
    /// A server-side session reached its terminal state.
    SessionCompleted,
    /// A new handshake replaced a running server session.
    SessionReset,
    /// The orchestrator finished a full run.
    PathReport,
    /// Lines were dropped because the writer fell behind.
    Overflow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    /// RFC 3339 timestamp.
    pub timestamp: String,
    pub event: TraceEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<TestKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_rate: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_sent: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_received: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Event-specific payload (the full report for `path_report`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl TraceEntry {
    pub fn new(event: TraceEvent) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event,
            test_id: None,
            kind: None,
            peer: None,
            success: None,
            observed_rate: None,
            failure: None,
            bytes_sent: None,
            bytes_received: None,
            duration_ms: None,
            detail: None,
        }
    }

    /// Entry describing a finished test.
    pub fn from_outcome(event: TraceEvent, outcome: &Outcome) -> Self {
        Self {
            test_id: Some(outcome.test_id.to_string()),
            kind: Some(outcome.kind),
            peer: Some(outcome.endpoint.to_string()),
            success: Some(outcome.success),
            observed_rate: outcome.observed_rate,
            failure: outcome.failure,
            bytes_sent: Some(outcome.bytes_sent),
            bytes_received: Some(outcome.bytes_received),
            duration_ms: Some(outcome.duration_ms),
            ..Self::new(event)
        }
    }

    pub fn with_peer(mut self, peer: impl ToString) -> Self {
        self.peer = Some(peer.to_string());
        self
    }

    pub fn with_test_id(mut self, test_id: impl ToString) -> Self {
        self.test_id = Some(test_id.to_string());
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Serialize to a single line without the trailing newline.
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"event":"unserializable","error":"{}"}}"#, e)
        })
    }
}

// ---------------------------------------------------------------------------
// LogSink
// ---------------------------------------------------------------------------

/// Best-effort line sink used by protocol loops. Never blocks.
pub trait LogSink: Send + Sync {
    /// Queue one line. Returns `false` if it was dropped.
    fn append(&self, line: String) -> bool;
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LogSink for NullSink {
    fn append(&self, _line: String) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// TraceWriter
// ---------------------------------------------------------------------------

/// Cloneable handle to the trace file. The writer task exits once every
/// handle has been dropped.
#[derive(Debug, Clone)]
pub struct TraceWriter {
    tx: mpsc::Sender<String>,
    dropped: Arc<AtomicU64>,
}

impl TraceWriter {
    /// Open `path` for appending and spawn the writer task. The task resolves
    /// to the number of lines written.
    pub async fn open(path: impl AsRef<Path>, capacity: usize) -> Result<(Self, JoinHandle<Result<u64>>)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create trace directory: {}", parent.display()))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open trace file: {}", path.display()))?;

        debug!(path = %path.display(), "trace file opened");

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(write_lines(path, file, rx, dropped.clone()));
        Ok((Self { tx, dropped }, task))
    }

    /// Queue a line without waiting. A full queue drops the line.
    pub fn try_append(&self, line: String) -> bool {
        match self.tx.try_send(line) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a line, waiting for space. For final reports.
    pub async fn append_blocking(&self, line: String) -> Result<()> {
        self.tx
            .send(line)
            .await
            .map_err(|_| anyhow::anyhow!("trace writer has stopped"))
    }

    /// Lines dropped since the writer last recorded an overflow marker.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl LogSink for TraceWriter {
    fn append(&self, line: String) -> bool {
        self.try_append(line)
    }
}

fn overflow_line(dropped: u64) -> String {
    TraceEntry::new(TraceEvent::Overflow)
        .with_detail(serde_json::json!({ "dropped": dropped }))
        .to_line()
}

async fn write_lines(
    path: PathBuf,
    mut file: tokio::fs::File,
    mut rx: mpsc::Receiver<String>,
    dropped: Arc<AtomicU64>,
) -> Result<u64> {
    let mut written = 0u64;
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        let gap = dropped.swap(0, Ordering::Relaxed);
        if gap > 0 {
            let mut marker = overflow_line(gap);
            marker.push('\n');
            file.write_all(marker.as_bytes())
                .await
                .with_context(|| format!("failed to write trace: {}", path.display()))?;
            written += 1;
        }
        if let Err(e) = file.write_all(line.as_bytes()).await {
            warn!(path = %path.display(), error = %e, "trace write failed");
            return Err(e).with_context(|| format!("failed to write trace: {}", path.display()));
        }
        written += 1;
        // Only flush once the queue is momentarily empty.
        if rx.is_empty() {
            file.flush()
                .await
                .with_context(|| format!("failed to flush trace: {}", path.display()))?;
        }
    }
    let gap = dropped.swap(0, Ordering::Relaxed);
    if gap > 0 {
        let mut marker = overflow_line(gap);
        marker.push('\n');
        file.write_all(marker.as_bytes()).await?;
        written += 1;
    }
    file.flush().await?;
    Ok(written)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FailureReason;

    fn outcome() -> Outcome {
        Outcome {
            test_id: uuid::Uuid::new_v4(),
            kind: TestKind::UdpUpload,
            endpoint: "192.0.2.1:4230".parse().unwrap(),
            success: false,
            observed_rate: None,
            packet_size: Some(1450),
            failure: Some(FailureReason::NoDataTimeout),
            bytes_sent: 14500,
            bytes_received: 12,
            duration_ms: 2300,
        }
    }

    #[tokio::test]
    async fn test_lines_are_appended_as_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/trace.jsonl");

        let (writer, task) = TraceWriter::open(&path, 16).await.unwrap();
        assert!(writer.try_append(TraceEntry::from_outcome(TraceEvent::TestCompleted, &outcome()).to_line()));
        writer
            .append_blocking(TraceEntry::new(TraceEvent::PathReport).with_detail(serde_json::json!({"verdict": "udp"})).to_line())
            .await
            .unwrap();
        drop(writer);
        assert_eq!(task.await.unwrap().unwrap(), 2);

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.trim().split('\n').collect();
        assert_eq!(lines.len(), 2);

        let first: TraceEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.event, TraceEvent::TestCompleted);
        assert_eq!(first.kind, Some(TestKind::UdpUpload));
        assert_eq!(first.failure, Some(FailureReason::NoDataTimeout));
        assert_eq!(first.peer.as_deref(), Some("192.0.2.1:4230"));

        let second: TraceEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.event, TraceEvent::PathReport);
        assert_eq!(second.detail.unwrap()["verdict"], "udp");
    }

    #[tokio::test]
    async fn test_overflow_drops_and_marks() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("trace.jsonl");

        // A current-thread runtime cannot run the writer until we yield, so
        // the queue fills deterministically.
        let (writer, task) = TraceWriter::open(&path, 2).await.unwrap();
        let accepted = (0..10)
            .filter(|i| writer.try_append(format!(r#"{{"n":{}}}"#, i)))
            .count();
        assert_eq!(accepted, 2);
        assert_eq!(writer.dropped(), 8);
        drop(writer);
        task.await.unwrap().unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let markers: Vec<TraceEntry> = content
            .lines()
            .filter_map(|l| serde_json::from_str::<TraceEntry>(l).ok())
            .filter(|e| e.event == TraceEvent::Overflow)
            .collect();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].detail.as_ref().unwrap()["dropped"], 8);
        assert!(content.contains(r#"{"n":0}"#));
        assert!(content.contains(r#"{"n":1}"#));
        assert!(!content.contains(r#"{"n":2}"#));
    }

    #[test]
    fn test_none_fields_omitted() {
        let line = TraceEntry::new(TraceEvent::SessionReset)
            .with_peer("10.0.0.1:5000")
            .with_test_id("abc")
            .to_line();
        assert!(line.contains("\"session_reset\""));
        assert!(line.contains("\"peer\""));
        assert!(!line.contains("\"kind\""));
        assert!(!line.contains("\"detail\""));
    }

    #[test]
    fn test_null_sink_accepts_everything() {
        assert!(NullSink.append("x".into()));
    }
}
