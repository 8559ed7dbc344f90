//! Test-protocol engine: per-flow state machines and the loops that drive them.
//!
//! UDP tests are sans-IO state machines ([`udp_flow::UdpFlow`] on the probing
//! side, [`udp_session::UdpSession`] on the server side). A machine only sees
//! [`FlowEvent`]s and answers with at most one [`Transmit`]; the driving loop
//! owns the socket, performs the non-blocking send, and reports a completed
//! send back as [`FlowEvent::Sent`]. A send that would block is simply not
//! reported, so the machine's deadline stays due and the same packet is
//! produced again on the next iteration.
//!
//! TCP tests ride on the stream's own reliability and are plain async
//! functions ([`tcp_probe`], [`tcp_server`]).

pub mod ack;
pub mod rate;
pub mod tcp_probe;
pub mod tcp_server;
pub mod udp_flow;
pub mod udp_server;
pub mod udp_session;

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::wire::{self, Decoded};

pub use crate::wire::TestKind;

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Where a flow or session currently is. Exactly one phase is live at a time
/// and `TestFinished` is entered at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Client: handshake sent, awaiting the peer. Server: no test yet.
    StartTest,
    /// Data is flowing in one direction.
    RunTest,
    /// The finish sentinel is out; waiting for the ack that echoes it.
    FinishPacket,
    /// Linger that absorbs late and duplicate packets.
    WaitFinishTimeout,
    /// Terminal. `failure` is `None` on success.
    TestFinished { failure: Option<FailureReason> },
}

impl Phase {
    pub fn is_finished(&self) -> bool {
        matches!(self, Phase::TestFinished { .. })
    }
}

// ---------------------------------------------------------------------------
// Events and transmits
// ---------------------------------------------------------------------------

/// Input to a UDP state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowEvent {
    /// The action deadline (next send, retransmit, or linger end) passed.
    TimerFired,
    /// A datagram from the peer, already decoded; `len` is its wire size.
    PacketArrived { packet: Decoded, len: usize },
    /// A transmit previously returned by the machine left the socket.
    Sent(Transmit),
    /// Nothing arrived within the no-data interval.
    NoDataTimeout,
}

/// A packet the machine wants on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transmit {
    Handshake { pkt_id: u32, rate: Option<u64> },
    Data { pkt_id: u32 },
    /// Finish sentinel; `retransmit` is false for the first one, which also
    /// ends the data stream.
    Finish { pkt_id: u32, retransmit: bool },
}

impl Transmit {
    pub fn pkt_id(&self) -> u32 {
        match *self {
            Transmit::Handshake { pkt_id, .. }
            | Transmit::Data { pkt_id }
            | Transmit::Finish { pkt_id, .. } => pkt_id,
        }
    }

    pub fn encode(&self, kind: TestKind, timestamp: u32, payload_size: usize) -> Bytes {
        match *self {
            Transmit::Handshake { pkt_id, rate } => {
                wire::encode_handshake(kind, pkt_id, timestamp, rate, payload_size)
            }
            Transmit::Data { pkt_id } => wire::encode_data(pkt_id, timestamp, payload_size),
            Transmit::Finish { pkt_id, .. } => wire::encode_finish(pkt_id, timestamp, payload_size),
        }
    }
}

// ---------------------------------------------------------------------------
// Timing and budgets
// ---------------------------------------------------------------------------

/// Retransmission and timeout policy for one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub retransmit_interval: Duration,
    /// Retransmissions allowed after the first send of a handshake or finish
    /// packet.
    pub retry_limit: u32,
    pub linger: Duration,
    pub no_data_timeout: Duration,
}

impl Timing {
    pub const CLIENT: Timing = Timing {
        retransmit_interval: Duration::from_millis(200),
        retry_limit: 10,
        linger: Duration::from_millis(1000),
        no_data_timeout: Duration::from_millis(2000),
    };

    pub const SERVER: Timing = Timing {
        retransmit_interval: Duration::from_millis(400),
        retry_limit: 5,
        linger: Duration::from_millis(1000),
        no_data_timeout: Duration::from_millis(2000),
    };
}

/// When a throughput sender may stop: both limits must be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThroughputBudget {
    pub max_bytes: u64,
    pub min_duration: Duration,
}

impl ThroughputBudget {
    pub fn is_met(&self, sent_bytes: u64, elapsed: Duration) -> bool {
        sent_bytes >= self.max_bytes && elapsed >= self.min_duration
    }
}

impl Default for ThroughputBudget {
    fn default() -> Self {
        Self {
            max_bytes: 3 * (1 << 22),
            min_duration: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Why a test did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    #[error("peer unreachable")]
    Unreachable,
    #[error("retransmission budget exhausted")]
    RetryBudgetExhausted,
    #[error("no data received for too long")]
    NoDataTimeout,
    #[error("protocol error")]
    ProtocolError,
    #[error("local resources exhausted")]
    ResourceExhausted,
    #[error("timed out")]
    Timeout,
}

/// Terminal result of one test, as reported to the orchestrator.
///
/// `observed_rate` is packets/sec for UDP kinds and bytes/sec for TCP kinds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub test_id: Uuid,
    pub kind: TestKind,
    pub endpoint: SocketAddr,
    pub success: bool,
    pub observed_rate: Option<u64>,
    /// Size of the datagrams a UDP rate counts, as they appeared on the wire.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_size: Option<usize>,
    pub failure: Option<FailureReason>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub duration_ms: u64,
}

impl Outcome {
    /// An outcome for a test that never got going.
    pub fn failed(kind: TestKind, endpoint: SocketAddr, reason: FailureReason) -> Self {
        Self {
            test_id: Uuid::new_v4(),
            kind,
            endpoint,
            success: false,
            observed_rate: None,
            packet_size: None,
            failure: Some(reason),
            bytes_sent: 0,
            bytes_received: 0,
            duration_ms: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{kind} cannot run over {transport}")]
    WrongTransport {
        kind: TestKind,
        transport: &'static str,
    },

    #[error("probe task failed: {0}")]
    Spawn(String),
}

impl EngineError {
    /// The terminal reason this error resolves to.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            EngineError::Bind { .. } | EngineError::Spawn(_) => FailureReason::ResourceExhausted,
            EngineError::Transport(_) => FailureReason::Unreachable,
            EngineError::Timeout(..) => FailureReason::Timeout,
            EngineError::Protocol(_) | EngineError::WrongTransport { .. } => {
                FailureReason::ProtocolError
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
