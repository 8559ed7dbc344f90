//! Full client run: find a port both protocols can reach, then compare UDP
//! and TCP throughput in each direction.
//!
//! 1. UDP `Test_1` and TCP `Test_2` on every configured port, concurrently.
//! 2. The first port (in configured order) where both succeeded is selected.
//! 3. `repetitions` rounds of (UDP download, TCP download), then
//!    `repetitions` rounds of (UDP upload, TCP upload), one test at a time.
//!
//! Every finished test is reported to a [`TestObserver`] and, when a sink is
//! attached, to the diagnostic trace.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::SystemClock;
use crate::config::PathProbeConfig;
use crate::engine::tcp_probe::{run_tcp_probe, TcpProbeConfig};
use crate::engine::udp_flow::{udp_test, FlowConfig};
use crate::engine::{EngineError, Outcome, TestKind};
use crate::trace::{LogSink, NullSink, TraceEntry, TraceEvent};

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Receives every finished test.
pub trait TestObserver: Send + Sync {
    /// `observed_rate` is packets/sec for UDP kinds and bytes/sec for TCP
    /// kinds.
    fn on_test_complete(
        &self,
        kind: TestKind,
        endpoint: SocketAddr,
        success: bool,
        observed_rate: Option<u64>,
    );
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl TestObserver for NoopObserver {
    fn on_test_complete(&self, _: TestKind, _: SocketAddr, _: bool, _: Option<u64>) {}
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Udp,
    Tcp,
    Inconclusive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortReachability {
    pub port: u16,
    pub udp: bool,
    pub tcp: bool,
}

/// Mean throughput of one direction, both in bytes/sec.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectionSummary {
    pub udp_bytes_per_sec: Option<f64>,
    pub tcp_bytes_per_sec: Option<f64>,
    pub udp_successes: usize,
    pub tcp_successes: usize,
    pub faster: Verdict,
}

#[derive(Debug, Clone, Serialize)]
pub struct PathReport {
    pub run_id: Uuid,
    pub server: IpAddr,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reachability: Vec<PortReachability>,
    pub selected_port: Option<u16>,
    pub download: Option<DirectionSummary>,
    pub upload: Option<DirectionSummary>,
    pub tests: Vec<Outcome>,
}

impl PathReport {
    /// True when some port let both protocols through.
    pub fn reachable(&self) -> bool {
        self.selected_port.is_some()
    }
}

/// Summarize one direction. UDP rates (packets/sec) are scaled by the size of
/// the datagrams they counted, falling back to `payload_size`, so both
/// protocols compare in bytes/sec.
pub fn summarize(udp: &[Outcome], tcp: &[Outcome], payload_size: usize) -> DirectionSummary {
    fn mean(values: &[f64]) -> Option<f64> {
        (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
    }
    let rates = |outcomes: &[Outcome], scale: &dyn Fn(&Outcome) -> f64| -> Vec<f64> {
        outcomes
            .iter()
            .filter(|o| o.success)
            .filter_map(|o| o.observed_rate.map(|r| r as f64 * scale(o)))
            .collect()
    };
    let udp_rates = rates(udp, &|o| o.packet_size.unwrap_or(payload_size) as f64);
    let tcp_rates = rates(tcp, &|_| 1.0);
    let udp_mean = mean(&udp_rates);
    let tcp_mean = mean(&tcp_rates);
    let faster = match (udp_mean, tcp_mean) {
        (Some(u), Some(t)) if u > t => Verdict::Udp,
        (Some(u), Some(t)) if t > u => Verdict::Tcp,
        (Some(_), None) => Verdict::Udp,
        (None, Some(_)) => Verdict::Tcp,
        _ => Verdict::Inconclusive,
    };
    DirectionSummary {
        udp_bytes_per_sec: udp_mean,
        tcp_bytes_per_sec: tcp_mean,
        udp_successes: udp_rates.len(),
        tcp_successes: tcp_rates.len(),
        faster,
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Everything a run needs, resolved from configuration.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub ports: Vec<u16>,
    pub repetitions: u32,
    pub bind_ip: IpAddr,
    pub payload_size: usize,
    flows: PathProbeConfig,
}

impl RunSettings {
    pub fn from_config(config: &PathProbeConfig) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            ports: config.network.ports.clone(),
            repetitions: config.client.repetitions,
            bind_ip: config.network.bind_ip()?,
            payload_size: config.client.payload_size,
            flows: config.clone(),
        })
    }

    pub fn flow_config(&self, kind: TestKind) -> FlowConfig {
        self.flows.flow_config(kind)
    }

    pub fn tcp_config(&self) -> TcpProbeConfig {
        self.flows.tcp_probe_config()
    }
}

pub struct Orchestrator {
    settings: Arc<RunSettings>,
    observer: Arc<dyn TestObserver>,
    sink: Arc<dyn LogSink>,
}

impl Orchestrator {
    pub fn new(settings: RunSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            observer: Arc::new(NoopObserver),
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn TestObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Run every stage against `server` and build the report.
    pub async fn run(&self, server: IpAddr) -> PathReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, %server, ports = ?self.settings.ports, "path probe starting");

        let mut tests = Vec::new();
        let reachability = self.reachability(server, &mut tests).await;
        let selected_port = reachability.iter().find(|p| p.udp && p.tcp).map(|p| p.port);

        let (download, upload) = match selected_port {
            Some(port) => {
                let endpoint = SocketAddr::new(server, port);
                info!(%run_id, %endpoint, "port selected, measuring throughput");
                let download = self
                    .throughput_pair(endpoint, TestKind::UdpDownload, TestKind::TcpDownload, &mut tests)
                    .await;
                let upload = self
                    .throughput_pair(endpoint, TestKind::UdpUpload, TestKind::TcpUpload, &mut tests)
                    .await;
                (Some(download), Some(upload))
            }
            None => {
                warn!(%run_id, %server, "no port passed both reachability tests");
                (None, None)
            }
        };

        let report = PathReport {
            run_id,
            server,
            started_at,
            finished_at: Utc::now(),
            reachability,
            selected_port,
            download,
            upload,
            tests,
        };
        info!(
            %run_id,
            selected_port = ?report.selected_port,
            download = ?report.download.as_ref().map(|d| d.faster),
            upload = ?report.upload.as_ref().map(|d| d.faster),
            "path probe finished"
        );
        report
    }

    /// UDP and TCP reachability on every port at once.
    async fn reachability(&self, server: IpAddr, tests: &mut Vec<Outcome>) -> Vec<PortReachability> {
        let probes = self.settings.ports.iter().map(|&port| {
            let endpoint = SocketAddr::new(server, port);
            let udp = self.spawn_test(endpoint, TestKind::UdpReachability);
            let tcp = self.spawn_test(endpoint, TestKind::TcpReachability);
            async move {
                let (udp, tcp) = futures::join!(udp, tcp);
                (port, udp, tcp)
            }
        });

        let mut ports = Vec::new();
        for (port, udp, tcp) in join_all(probes).await {
            ports.push(PortReachability {
                port,
                udp: udp.success,
                tcp: tcp.success,
            });
            tests.push(udp);
            tests.push(tcp);
        }
        ports
    }

    async fn throughput_pair(
        &self,
        endpoint: SocketAddr,
        udp_kind: TestKind,
        tcp_kind: TestKind,
        tests: &mut Vec<Outcome>,
    ) -> DirectionSummary {
        let mut udp = Vec::new();
        let mut tcp = Vec::new();
        for round in 0..self.settings.repetitions {
            info!(%endpoint, round, %udp_kind, %tcp_kind, "throughput round");
            udp.push(self.spawn_test(endpoint, udp_kind).await);
            tcp.push(self.spawn_test(endpoint, tcp_kind).await);
        }
        let summary = summarize(&udp, &tcp, self.settings.payload_size);
        tests.extend(udp);
        tests.extend(tcp);
        summary
    }

    /// Run one test on its own task and report it.
    fn spawn_test(
        &self,
        endpoint: SocketAddr,
        kind: TestKind,
    ) -> impl std::future::Future<Output = Outcome> + Send + 'static {
        let settings = self.settings.clone();
        let observer = self.observer.clone();
        let sink = self.sink.clone();
        async move {
            let task = tokio::spawn(run_one(settings, endpoint, kind));
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let err = EngineError::Spawn(e.to_string());
                    warn!(%endpoint, %kind, error = %err, "test task failed");
                    Outcome::failed(kind, endpoint, err.failure_reason())
                }
            };
            observer.on_test_complete(kind, endpoint, outcome.success, outcome.observed_rate);
            sink.append(TraceEntry::from_outcome(TraceEvent::TestCompleted, &outcome).to_line());
            outcome
        }
    }
}

async fn run_one(settings: Arc<RunSettings>, endpoint: SocketAddr, kind: TestKind) -> Outcome {
    if kind.is_udp() {
        match udp_test(settings.bind_ip, endpoint, settings.flow_config(kind), &SystemClock).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(%endpoint, %kind, error = %e, "udp test could not start");
                Outcome::failed(kind, endpoint, e.failure_reason())
            }
        }
    } else {
        run_tcp_probe(endpoint, kind, &settings.tcp_config()).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
