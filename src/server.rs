//! The probe server: a UDP loop and a TCP accept loop on every configured
//! port.
//!
//! Ports are bound independently. A port that cannot be bound (already in
//! use, or privileged) is logged and skipped; the server only fails to start
//! when nothing could be bound at all.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::PathProbeConfig;
use crate::engine::tcp_server::{serve_tcp, TcpServerConfig};
use crate::engine::udp_server::{serve_udp, UdpServerConfig};
use crate::engine::EngineError;
use crate::trace::LogSink;

/// Addresses actually bound for one configured port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundPort {
    pub port: u16,
    pub udp: Option<SocketAddr>,
    pub tcp: Option<SocketAddr>,
}

pub struct ProbeServer {
    bind_ip: IpAddr,
    ports: Vec<u16>,
    udp: UdpServerConfig,
    tcp: TcpServerConfig,
    sink: Arc<dyn LogSink>,
    shutdown: CancellationToken,
}

impl ProbeServer {
    pub fn new(config: &PathProbeConfig, sink: Arc<dyn LogSink>) -> Result<Self> {
        Ok(Self {
            bind_ip: config.network.bind_ip()?,
            ports: config.network.ports.clone(),
            udp: config.udp_server_config(),
            tcp: config.tcp_server_config(),
            sink,
            shutdown: CancellationToken::new(),
        })
    }

    /// Token that stops every loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind every port and spawn its loops.
    ///
    /// Port 0 binds TCP on an ephemeral port and then UDP on the same number,
    /// so both protocols share one port as they do for fixed ports.
    pub async fn start(&self) -> Result<RunningServer> {
        let mut tasks = JoinSet::new();
        let mut bound = Vec::new();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        for &port in &self.ports {
            let tcp = match bind_tcp(SocketAddr::new(self.bind_ip, port)).await {
                Ok(listener) => Some(listener),
                Err(e) => {
                    warn!(port, error = %e, "tcp listener not started");
                    None
                }
            };
            let udp_port = match tcp.as_ref().and_then(|l| l.local_addr().ok()) {
                Some(addr) => addr.port(),
                None => port,
            };
            let udp = match bind_udp(SocketAddr::new(self.bind_ip, udp_port)).await {
                Ok(socket) => Some(socket),
                Err(e) => {
                    warn!(port = udp_port, error = %e, "udp socket not started");
                    None
                }
            };

            let entry = BoundPort {
                port: udp_port,
                udp: udp.as_ref().and_then(|s| s.local_addr().ok()),
                tcp: tcp.as_ref().and_then(|l| l.local_addr().ok()),
            };
            if entry.udp.is_none() && entry.tcp.is_none() {
                continue;
            }

            if let Some(listener) = tcp {
                tasks.spawn(serve_tcp(
                    listener,
                    self.tcp.clone(),
                    self.sink.clone(),
                    self.shutdown.clone(),
                ));
            }
            if let Some(socket) = udp {
                let cfg = self.udp.clone();
                let clock = clock.clone();
                let sink = self.sink.clone();
                let shutdown = self.shutdown.clone();
                tasks.spawn(async move {
                    serve_udp(&socket, cfg, clock, sink, shutdown).await;
                });
            }
            info!(port = entry.port, udp = ?entry.udp, tcp = ?entry.tcp, "listening");
            bound.push(entry);
        }

        if bound.is_empty() {
            bail!("no configured port could be bound");
        }
        Ok(RunningServer {
            bound,
            tasks,
            shutdown: self.shutdown.clone(),
        })
    }
}

async fn bind_tcp(addr: SocketAddr) -> Result<TcpListener, EngineError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| EngineError::Bind { addr, source })
}

async fn bind_udp(addr: SocketAddr) -> Result<UdpSocket, EngineError> {
    UdpSocket::bind(addr)
        .await
        .map_err(|source| EngineError::Bind { addr, source })
}

/// Handle to a started server.
pub struct RunningServer {
    bound: Vec<BoundPort>,
    tasks: JoinSet<()>,
    shutdown: CancellationToken,
}

impl RunningServer {
    pub fn bound(&self) -> &[BoundPort] {
        &self.bound
    }

    /// Port numbers with at least one protocol listening.
    pub fn ports(&self) -> Vec<u16> {
        self.bound.iter().map(|b| b.port).collect()
    }

    /// Wait until every loop has exited.
    pub async fn wait(mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "server task ended abnormally");
            }
        }
    }

    /// Cancel every loop and wait for them to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.wait().await;
    }
}
