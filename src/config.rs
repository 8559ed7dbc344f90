//! TOML configuration for pathprobe.
//!
//! Every section has compiled-in defaults, so an empty file (or no file) is a
//! valid configuration. The file is looked up via `PATHPROBE_CONFIG`, then
//! `/etc/pathprobe/pathprobe.toml`; command-line flags override individual
//! values afterwards.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::tcp_probe::TcpProbeConfig;
use crate::engine::tcp_server::TcpServerConfig;
use crate::engine::udp_flow::FlowConfig;
use crate::engine::udp_server::UdpServerConfig;
use crate::engine::udp_session::SessionConfig;
use crate::engine::{TestKind, ThroughputBudget, Timing};
use crate::wire::{MAX_PACKET_SIZE, MIN_PAYLOAD_SIZE};

/// Ports probed for reachability when none are configured.
pub const DEFAULT_PORTS: [u16; 6] = [4230, 2708, 891, 519, 80, 443];

const SYSTEM_CONFIG_PATH: &str = "/etc/pathprobe/pathprobe.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathProbeConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PathProbeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Load from `PATHPROBE_CONFIG`, then the system location, then defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("PATHPROBE_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "PATHPROBE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Reject values the engines cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.network.ports.is_empty() {
            bail!("network.ports must list at least one port");
        }
        self.network
            .bind_ip()
            .with_context(|| format!("invalid network.bind_address: {}", self.network.bind_address))?;
        for (section, payload) in [("client", self.client.payload_size), ("server", self.server.payload_size)] {
            if !(MIN_PAYLOAD_SIZE..=MAX_PACKET_SIZE).contains(&payload) {
                bail!(
                    "{}.payload_size must be between {} and {} (got {})",
                    section,
                    MIN_PAYLOAD_SIZE,
                    MAX_PACKET_SIZE,
                    payload
                );
            }
        }
        if self.client.rate_pps == 0 {
            bail!("client.rate_pps must be greater than zero");
        }
        if self.client.repetitions == 0 {
            bail!("client.repetitions must be at least 1");
        }
        if self.client.retransmit_ms == 0 || self.server.retransmit_ms == 0 {
            bail!("retransmit_ms must be greater than zero");
        }
        if self.server.sessions_per_tick == 0 {
            bail!("server.sessions_per_tick must be at least 1");
        }
        if self.budget.max_bytes == 0 {
            bail!("budget.max_bytes must be greater than zero");
        }
        Ok(())
    }

    pub fn throughput_budget(&self) -> ThroughputBudget {
        ThroughputBudget {
            max_bytes: self.budget.max_bytes,
            min_duration: Duration::from_secs(self.budget.min_duration_sec),
        }
    }

    pub fn flow_config(&self, kind: TestKind) -> FlowConfig {
        FlowConfig {
            kind,
            rate_pps: self.client.rate_pps,
            payload_size: self.client.payload_size,
            timing: self.client.timing(),
            budget: self.throughput_budget(),
            max_burst: self.client.max_burst,
        }
    }

    pub fn tcp_probe_config(&self) -> TcpProbeConfig {
        TcpProbeConfig {
            connect_timeout: Duration::from_millis(self.client.connect_timeout_ms),
            idle_timeout: Duration::from_secs(self.budget.tcp_idle_timeout_sec),
            budget: self.throughput_budget(),
        }
    }

    pub fn udp_server_config(&self) -> UdpServerConfig {
        UdpServerConfig {
            session: SessionConfig {
                payload_size: self.server.payload_size,
                timing: self.server.timing(),
                budget: self.throughput_budget(),
            },
            sessions_per_tick: self.server.sessions_per_tick,
            max_burst: self.server.max_burst,
            ..UdpServerConfig::default()
        }
    }

    pub fn tcp_server_config(&self) -> TcpServerConfig {
        TcpServerConfig {
            budget: self.throughput_budget(),
            warmup: Duration::from_secs(self.server.tcp_warmup_sec),
            idle_timeout: Duration::from_secs(self.budget.tcp_idle_timeout_sec),
        }
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Ports the server listens on and the client probes, in preference order.
    pub ports: Vec<u16>,
    /// Local address to bind (server listeners and client sockets).
    pub bind_address: String,
}

impl NetworkConfig {
    pub fn bind_ip(&self) -> Result<IpAddr> {
        self.bind_address
            .parse()
            .with_context(|| format!("not an IP address: {}", self.bind_address))
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ports: DEFAULT_PORTS.to_vec(),
            bind_address: "0.0.0.0".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Probing side: rates, retransmission policy, and repetitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Requested UDP send rate (packets/sec) for both directions.
    pub rate_pps: u64,
    /// UDP datagram size.
    pub payload_size: usize,
    /// Rounds of each throughput pair in a full run.
    pub repetitions: u32,
    pub retransmit_ms: u64,
    pub retry_limit: u32,
    pub linger_ms: u64,
    pub no_data_ms: u64,
    /// Paced sends per loop iteration.
    pub max_burst: usize,
    pub connect_timeout_ms: u64,
}

impl ClientConfig {
    pub fn timing(&self) -> Timing {
        Timing {
            retransmit_interval: Duration::from_millis(self.retransmit_ms),
            retry_limit: self.retry_limit,
            linger: Duration::from_millis(self.linger_ms),
            no_data_timeout: Duration::from_millis(self.no_data_ms),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        let t = Timing::CLIENT;
        Self {
            rate_pps: 1000,
            payload_size: 1450,
            repetitions: 10,
            retransmit_ms: t.retransmit_interval.as_millis() as u64,
            retry_limit: t.retry_limit,
            linger_ms: t.linger.as_millis() as u64,
            no_data_ms: t.no_data_timeout.as_millis() as u64,
            max_burst: 64,
            connect_timeout_ms: 400,
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub payload_size: usize,
    pub retransmit_ms: u64,
    pub retry_limit: u32,
    pub linger_ms: u64,
    pub no_data_ms: u64,
    /// UDP sessions serviced per loop iteration.
    pub sessions_per_tick: usize,
    pub max_burst: usize,
    /// Leading part of a TCP upload left out of the rate.
    pub tcp_warmup_sec: u64,
}

impl ServerConfig {
    pub fn timing(&self) -> Timing {
        Timing {
            retransmit_interval: Duration::from_millis(self.retransmit_ms),
            retry_limit: self.retry_limit,
            linger: Duration::from_millis(self.linger_ms),
            no_data_timeout: Duration::from_millis(self.no_data_ms),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        let t = Timing::SERVER;
        Self {
            payload_size: 1450,
            retransmit_ms: t.retransmit_interval.as_millis() as u64,
            retry_limit: t.retry_limit,
            linger_ms: t.linger.as_millis() as u64,
            no_data_ms: t.no_data_timeout.as_millis() as u64,
            sessions_per_tick: 64,
            max_burst: 64,
            tcp_warmup_sec: 2,
        }
    }
}

// ---------------------------------------------------------------------------
// Budget
// ---------------------------------------------------------------------------

/// How long throughput senders keep going.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_bytes: u64,
    pub min_duration_sec: u64,
    pub tcp_idle_timeout_sec: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        let budget = ThroughputBudget::default();
        Self {
            max_bytes: budget.max_bytes,
            min_duration_sec: budget.min_duration.as_secs(),
            tcp_idle_timeout_sec: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit logs as JSON lines instead of human-readable text.
    pub json: bool,
    /// Diagnostic trace file; no trace is written when unset.
    pub trace_path: Option<PathBuf>,
    /// Lines that may queue for the trace writer before new ones are dropped.
    pub trace_capacity: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            trace_path: None,
            trace_capacity: crate::trace::DEFAULT_CAPACITY,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
