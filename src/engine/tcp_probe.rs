//! Client side of the TCP tests (kinds 2, 3 and 4).
//!
//! Every test opens with a fixed-size first segment carrying the kind tag.
//! After that:
//!
//! - reachability: read the echoed segment back;
//! - download: read until the server closes, timing from the first byte;
//! - upload: flood until the budget is spent, half-close, and read the
//!   server's 8-byte rate trailer.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use super::rate;
use super::{EngineError, Outcome, TestKind, ThroughputBudget};
use crate::clock;
use crate::wire::{self, TCP_RATE_TRAILER_LEN, TCP_SEGMENT_SIZE};

#[derive(Debug, Clone)]
pub struct TcpProbeConfig {
    pub connect_timeout: Duration,
    /// Longest a single read or write may stall.
    pub idle_timeout: Duration,
    pub budget: ThroughputBudget,
}

impl Default for TcpProbeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(400),
            idle_timeout: Duration::from_secs(5),
            budget: ThroughputBudget::default(),
        }
    }
}

/// What a TCP test moved and measured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TcpProbeReport {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Bytes/sec; `None` for reachability.
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

/// Run one TCP test over an established stream.
pub async fn run_on_stream<S>(
    stream: &mut S,
    kind: TestKind,
    cfg: &TcpProbeConfig,
) -> Result<TcpProbeReport, EngineError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !kind.is_tcp() {
        return Err(EngineError::WrongTransport {
            kind,
            transport: "tcp",
        });
    }
    let idle = cfg.idle_timeout;
    let first = wire::encode_tcp_first_segment(kind);
    with_idle(idle, "first segment", stream.write_all(&first)).await?;
    let mut report = TcpProbeReport {
        bytes_sent: first.len() as u64,
        ..TcpProbeReport::default()
    };

    match kind {
        TestKind::TcpReachability => {
            let mut echo = vec![0u8; TCP_SEGMENT_SIZE];
            with_idle(idle, "echo", stream.read_exact(&mut echo)).await?;
            report.bytes_received = echo.len() as u64;
        }
        TestKind::TcpDownload => {
            let mut buf = vec![0u8; 64 * 1024];
            let mut first_byte: Option<Instant> = None;
            loop {
                let n = with_idle(idle, "download read", stream.read(&mut buf)).await?;
                if n == 0 {
                    break;
                }
                first_byte.get_or_insert_with(Instant::now);
                report.bytes_received += n as u64;
            }
            let Some(first_byte) = first_byte else {
                return Err(EngineError::Protocol("server closed without sending data".into()));
            };
            report.observed_rate = Some(rate::bytes_per_sec(report.bytes_received, first_byte.elapsed()));
        }
        TestKind::TcpUpload => {
            let block = vec![0xA5u8; TCP_SEGMENT_SIZE];
            let started = Instant::now();
            while !cfg.budget.is_met(report.bytes_sent, started.elapsed()) {
                with_idle(idle, "upload write", stream.write_all(&block)).await?;
                report.bytes_sent += block.len() as u64;
            }
            with_idle(idle, "shutdown", stream.shutdown()).await?;

            let mut trailer = [0u8; TCP_RATE_TRAILER_LEN];
            with_idle(idle, "rate trailer", stream.read_exact(&mut trailer))
                .await
                .map_err(|e| match e {
                    EngineError::Transport(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                        EngineError::Protocol("connection closed before rate trailer".into())
                    }
                    other => other,
                })?;
            report.bytes_received = trailer.len() as u64;
            report.observed_rate = Some(u64::from_be_bytes(trailer));
        }
        TestKind::UdpReachability | TestKind::UdpDownload | TestKind::UdpUpload => {
            return Err(EngineError::WrongTransport {
                kind,
                transport: "tcp",
            });
        }
    }
    Ok(report)
}

async fn connect_and_run(
    peer: SocketAddr,
    kind: TestKind,
    cfg: &TcpProbeConfig,
) -> Result<TcpProbeReport, EngineError> {
    let mut stream = match timeout(cfg.connect_timeout, TcpStream::connect(peer)).await {
        Ok(stream) => stream?,
        Err(_) => return Err(EngineError::Timeout("connect", cfg.connect_timeout)),
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "could not disable nagle");
    }
    run_on_stream(&mut stream, kind, cfg).await
}

/// Connect to `peer` and run one TCP test, mapping every failure onto the
/// outcome.
pub async fn run_tcp_probe(peer: SocketAddr, kind: TestKind, cfg: &TcpProbeConfig) -> Outcome {
    let test_id = Uuid::new_v4();
    let started = Instant::now();
    info!(%test_id, %kind, %peer, "tcp test starting");

    let result = connect_and_run(peer, kind, cfg).await;

    let duration_ms = clock::millis_between(started, Instant::now());
    let outcome = match result {
        Ok(report) => Outcome {
            test_id,
            kind,
            endpoint: peer,
            success: true,
            observed_rate: report.observed_rate,
            packet_size: None,
            failure: None,
            bytes_sent: report.bytes_sent,
            bytes_received: report.bytes_received,
            duration_ms,
        },
        Err(e) => {
            debug!(%test_id, %kind, %peer, error = %e, "tcp test failed");
            Outcome {
                test_id,
                duration_ms,
                ..Outcome::failed(kind, peer, e.failure_reason())
            }
        }
    };
    info!(
        %test_id,
        %kind,
        %peer,
        success = outcome.success,
        rate = ?outcome.observed_rate,
        failure = ?outcome.failure,
        "tcp test finished"
    );
    outcome
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FailureReason;
    use tokio_test::io::Builder;

    fn small_cfg() -> TcpProbeConfig {
        TcpProbeConfig {
            connect_timeout: Duration::from_millis(400),
            idle_timeout: Duration::from_secs(2),
            budget: ThroughputBudget {
                max_bytes: 4 * TCP_SEGMENT_SIZE as u64,
                min_duration: Duration::ZERO,
            },
        }
    }

    #[tokio::test]
    async fn test_reachability_reads_echo() {
        let first = wire::encode_tcp_first_segment(TestKind::TcpReachability);
        let mut mock = Builder::new().write(&first).read(&first).build();
        let report = run_on_stream(&mut mock, TestKind::TcpReachability, &small_cfg())
            .await
            .expect("probe");
        assert_eq!(report.bytes_received, TCP_SEGMENT_SIZE as u64);
        assert_eq!(report.observed_rate, None);
    }

    #[tokio::test]
    async fn test_download_reads_until_close() {
        let first = wire::encode_tcp_first_segment(TestKind::TcpDownload);
        let block = vec![7u8; TCP_SEGMENT_SIZE];
        let mut mock = Builder::new()
            .write(&first)
            .read(&block)
            .read(&block)
            .read(&block)
            .build();
        let report = run_on_stream(&mut mock, TestKind::TcpDownload, &small_cfg())
            .await
            .expect("probe");
        assert_eq!(report.bytes_received, 3 * TCP_SEGMENT_SIZE as u64);
        assert!(report.observed_rate.is_some());
    }

    #[tokio::test]
    async fn test_download_without_data_is_protocol_error() {
        let first = wire::encode_tcp_first_segment(TestKind::TcpDownload);
        let mut mock = Builder::new().write(&first).build();
        let err = run_on_stream(&mut mock, TestKind::TcpDownload, &small_cfg())
            .await
            .unwrap_err();
        assert_eq!(err.failure_reason(), FailureReason::ProtocolError);
    }

    #[tokio::test]
    async fn test_upload_reads_rate_trailer() {
        let first = wire::encode_tcp_first_segment(TestKind::TcpUpload);
        let block = vec![0xA5u8; TCP_SEGMENT_SIZE];
        let mut builder = Builder::new();
        builder.write(&first);
        // First segment counts toward the budget; three blocks complete it.
        for _ in 0..3 {
            builder.write(&block);
        }
        builder.read(&123_456u64.to_be_bytes());
        let mut mock = builder.build();

        let report = run_on_stream(&mut mock, TestKind::TcpUpload, &small_cfg())
            .await
            .expect("probe");
        assert_eq!(report.bytes_sent, 4 * TCP_SEGMENT_SIZE as u64);
        assert_eq!(report.observed_rate, Some(123_456));
    }

    #[tokio::test]
    async fn test_udp_kind_is_rejected() {
        let mut mock = Builder::new().build();
        let err = run_on_stream(&mut mock, TestKind::UdpUpload, &small_cfg())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::WrongTransport { .. }));
    }

    #[tokio::test]
    async fn test_refused_connection_is_unreachable() {
        // Bind then drop to find a port with nothing listening.
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let peer = SocketAddr::from(([127, 0, 0, 1], port));
        let outcome = run_tcp_probe(peer, TestKind::TcpReachability, &small_cfg()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(FailureReason::Unreachable));
    }
}
