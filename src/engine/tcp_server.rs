//! TCP side of the server.
//!
//! Each accepted connection gets its own task. The handler reads the full
//! first segment before classifying it, then echoes (kind 2), floods until
//! the budget is spent (kind 3), or counts an upload and answers with the
//! measured rate (kind 4).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::rate;
use super::{EngineError, Outcome, TestKind, ThroughputBudget};
use crate::clock;
use crate::trace::{LogSink, TraceEntry, TraceEvent};
use crate::wire::{self, TCP_SEGMENT_SIZE};

#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    pub budget: ThroughputBudget,
    /// Start of an upload excluded from the rate when the upload runs longer.
    pub warmup: Duration,
    /// Longest a single read or write may stall.
    pub idle_timeout: Duration,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            budget: ThroughputBudget::default(),
            warmup: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(5),
        }
    }
}

/// What one connection did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSessionReport {
    pub kind: TestKind,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub observed_rate: Option<u64>,
}

async fn with_idle<F, T>(idle: Duration, what: &'static str, fut: F) -> Result<T, EngineError>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match timeout(idle, fut).await {
        Ok(result) => result.map_err(EngineError::from),
        Err(_) => Err(EngineError::Timeout(what, idle)),
    }
}

/// Upload rate in bytes/sec, leaving out the warm-up window when the transfer
/// outlasted it.
pub fn upload_rate(total: u64, after_warmup: u64, elapsed: Duration, warmup: Duration) -> u64 {
    if elapsed > warmup {
        rate::bytes_per_sec(after_warmup, elapsed - warmup)
    } else {
        rate::bytes_per_sec(total, elapsed)
    }
}

/// Serve one test on an accepted stream.
pub async fn handle_connection<S>(
    stream: &mut S,
    cfg: &TcpServerConfig,
) -> Result<TcpSessionReport, EngineError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let idle = cfg.idle_timeout;
    let mut first = vec![0u8; TCP_SEGMENT_SIZE];
    with_idle(idle, "first segment", stream.read_exact(&mut first)).await?;
    let kind = wire::classify_tcp_first_segment(&first)
        .ok_or_else(|| EngineError::Protocol("unrecognized first segment".into()))?;

    let mut report = TcpSessionReport {
        kind,
        bytes_sent: 0,
        bytes_received: first.len() as u64,
        observed_rate: None,
    };

    match kind {
        TestKind::TcpReachability => {
            with_idle(idle, "echo", stream.write_all(&first)).await?;
            report.bytes_sent = first.len() as u64;
        }
        TestKind::TcpDownload => {
            let block = vec![0x5Au8; TCP_SEGMENT_SIZE];
            let started = Instant::now();
            while !cfg.budget.is_met(report.bytes_sent, started.elapsed()) {
                with_idle(idle, "download write", stream.write_all(&block)).await?;
                report.bytes_sent += block.len() as u64;
            }
            report.observed_rate = Some(rate::bytes_per_sec(report.bytes_sent, started.elapsed()));
        }
        TestKind::TcpUpload => {
            let started = Instant::now();
            let mut buf = vec![0u8; 64 * 1024];
            let mut total = 0u64;
            let mut after_warmup = 0u64;
            loop {
                let n = with_idle(idle, "upload read", stream.read(&mut buf)).await?;
                if n == 0 {
                    break;
                }
                total += n as u64;
                if started.elapsed() > cfg.warmup {
                    after_warmup += n as u64;
                }
            }
            let rate = upload_rate(total, after_warmup, started.elapsed(), cfg.warmup);
            with_idle(idle, "rate trailer", stream.write_all(&rate.to_be_bytes())).await?;
            report.bytes_received += total;
            report.bytes_sent = wire::TCP_RATE_TRAILER_LEN as u64;
            report.observed_rate = Some(rate);
        }
        other => {
            return Err(EngineError::WrongTransport {
                kind: other,
                transport: "tcp",
            })
        }
    }
    with_idle(idle, "shutdown", stream.shutdown()).await?;
    Ok(report)
}

/// Accept connections until `shutdown` is cancelled.
pub async fn serve_tcp(
    listener: TcpListener,
    cfg: TcpServerConfig,
    sink: Arc<dyn LogSink>,
    shutdown: CancellationToken,
) {
    let local = listener.local_addr().ok();
    info!(local = ?local, "tcp server started");
    let cfg = Arc::new(cfg);

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                // Usually fd exhaustion; back off instead of spinning.
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let cfg = cfg.clone();
        let sink = sink.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, error = %e, "could not disable nagle");
            }
            let started = Instant::now();
            let result = tokio::select! {
                _ = shutdown.cancelled() => return,
                result = handle_connection(&mut stream, &cfg) => result,
            };
            log_connection(peer, started, result, sink.as_ref());
        });
    }
    info!(local = ?local, "tcp server stopped");
}

fn log_connection(
    peer: SocketAddr,
    started: Instant,
    result: Result<TcpSessionReport, EngineError>,
    sink: &dyn LogSink,
) {
    let duration_ms = clock::millis_between(started, Instant::now());
    match result {
        Ok(report) => {
            info!(
                %peer,
                kind = %report.kind,
                sent = report.bytes_sent,
                received = report.bytes_received,
                rate = ?report.observed_rate,
                "tcp session finished"
            );
            let outcome = Outcome {
                test_id: Uuid::new_v4(),
                kind: report.kind,
                endpoint: peer,
                success: true,
                observed_rate: report.observed_rate,
                packet_size: None,
                failure: None,
                bytes_sent: report.bytes_sent,
                bytes_received: report.bytes_received,
                duration_ms,
            };
            sink.append(TraceEntry::from_outcome(TraceEvent::SessionCompleted, &outcome).to_line());
        }
        Err(e) => {
            debug!(%peer, error = %e, "tcp session failed");
            sink.append(
                TraceEntry::new(TraceEvent::SessionCompleted)
                    .with_peer(peer)
                    .with_detail(serde_json::json!({ "error": e.to_string() }))
                    .to_line(),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
