//! UDP side of the server: one socket, many sessions.
//!
//! The loop alternates between draining the socket into per-endpoint
//! [`UdpSession`]s and servicing a bounded slice of those sessions
//! (round-robin), so a large population never starves the receive path.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::udp_session::{SessionConfig, UdpSession};
use super::{FailureReason, FlowEvent, Outcome};
use crate::clock::Clock;
use crate::trace::{LogSink, TraceEntry, TraceEvent};
use crate::transport::{DatagramTransport, IoStatus};
use crate::wire::{self, Decoded, MAX_PACKET_SIZE};

/// Wake-up while sessions exist but none has anything due sooner.
const SERVICE_POLL: Duration = Duration::from_millis(1);
/// Wake-up with no sessions, to notice cancellation promptly.
const IDLE_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct UdpServerConfig {
    pub session: SessionConfig,
    /// Sessions serviced per loop iteration.
    pub sessions_per_tick: usize,
    /// Timer-driven sends per session per visit.
    pub max_burst: usize,
    /// Datagrams read per loop iteration.
    pub recv_per_tick: usize,
}

impl Default for UdpServerConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            sessions_per_tick: 64,
            max_burst: 64,
            recv_per_tick: 256,
        }
    }
}

/// Counters reported when the loop stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UdpServerStats {
    pub sessions_created: u64,
    pub sessions_succeeded: u64,
    pub sessions_failed: u64,
    pub datagrams_dropped: u64,
}

// ---------------------------------------------------------------------------
// SessionTable
// ---------------------------------------------------------------------------

/// What happened to an inbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Created,
    Delivered,
    /// Delivered, and a new handshake replaced the running test `abandoned`.
    Reset { abandoned: Uuid },
    Dropped,
}

/// Sessions keyed by client endpoint, with a round-robin service order.
#[derive(Default)]
pub struct SessionTable {
    sessions: HashMap<SocketAddr, UdpSession>,
    order: VecDeque<SocketAddr>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, peer: &SocketAddr) -> Option<&UdpSession> {
        self.sessions.get(peer)
    }

    /// Route a datagram to its session. Only a UDP handshake may create one.
    pub fn dispatch(
        &mut self,
        from: SocketAddr,
        packet: Decoded,
        len: usize,
        now: Instant,
        cfg: &SessionConfig,
    ) -> Dispatch {
        let event = FlowEvent::PacketArrived { packet, len };
        if let Some(session) = self.sessions.get_mut(&from) {
            let before = session.resets();
            let running = session.test_id();
            session.on_event(now, event);
            return if session.resets() > before {
                Dispatch::Reset { abandoned: running }
            } else {
                Dispatch::Delivered
            };
        }
        match packet {
            Decoded::Handshake { kind, .. } if kind.is_udp() => {
                let mut session = UdpSession::new(from, cfg.clone(), now);
                session.on_event(now, event);
                self.sessions.insert(from, session);
                self.order.push_back(from);
                Dispatch::Created
            }
            _ => Dispatch::Dropped,
        }
    }

    /// Service up to `limit` sessions: flush their acks, fire due timers, and
    /// remove the ones that finished. Returns the removed sessions' outcomes.
    pub fn service<T: DatagramTransport + ?Sized>(
        &mut self,
        transport: &T,
        clock: &dyn Clock,
        limit: usize,
        max_burst: usize,
    ) -> Vec<Outcome> {
        let mut finished = Vec::new();
        let visits = limit.min(self.order.len());
        for _ in 0..visits {
            let Some(peer) = self.order.pop_front() else {
                break;
            };
            let Some(session) = self.sessions.get_mut(&peer) else {
                continue;
            };
            service_one(session, transport, clock, max_burst);
            if session.is_finished() {
                if let Some(session) = self.sessions.remove(&peer) {
                    if let Some(outcome) = session.outcome() {
                        finished.push(outcome);
                    }
                }
            } else {
                self.order.push_back(peer);
            }
        }
        finished
    }

    /// Earliest wake-up any session asked for, or a short poll while some
    /// session has acks queued. Covers sessions not visited this round too.
    pub fn next_wakeup(&mut self, now: Instant) -> Option<Instant> {
        let mut wake: Option<Instant> = None;
        for session in self.sessions.values_mut() {
            let candidate = if session.acks_mut().is_empty() {
                session.next_wakeup()
            } else {
                Some(now + SERVICE_POLL)
            };
            wake = match (wake, candidate) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        wake
    }
}

fn service_one<T: DatagramTransport + ?Sized>(
    session: &mut UdpSession,
    transport: &T,
    clock: &dyn Clock,
    max_burst: usize,
) {
    let peer = session.peer();
    if let Err(e) = session.acks_mut().drain(transport, peer, clock.now()) {
        debug!(%peer, error = %e, "ack send failed");
        session.fail(clock.now(), FailureReason::Unreachable);
        return;
    }
    let Some(kind) = session.kind() else {
        return;
    };
    let payload_size = session.payload_size();
    let mut burst = 0;
    while burst < max_burst.max(1) {
        let now = clock.now();
        let Some(event) = session.due_event(now) else {
            break;
        };
        let Some(tx) = session.on_event(now, event) else {
            continue;
        };
        let bytes = tx.encode(kind, session.timestamp(now), payload_size);
        match transport.try_send_to(&bytes, peer) {
            Ok(IoStatus::Ready(_)) => {
                session.on_event(now, FlowEvent::Sent(tx));
                burst += 1;
            }
            Ok(IoStatus::WouldBlock) => break,
            Err(e) => {
                debug!(%peer, error = %e, "send failed");
                session.fail(now, FailureReason::Unreachable);
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// When the loop should next run. Sessions skipped by the per-tick limit are
/// included, so idle or lingering ones never force a busy loop.
fn wake_at(table: &mut SessionTable, now: Instant) -> Instant {
    table.next_wakeup(now).unwrap_or(now + IDLE_POLL)
}

/// Serve UDP tests on `transport` until `shutdown` is cancelled.
pub async fn serve_udp<T: DatagramTransport + ?Sized>(
    transport: &T,
    cfg: UdpServerConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn LogSink>,
    shutdown: CancellationToken,
) -> UdpServerStats {
    let mut table = SessionTable::new();
    let mut stats = UdpServerStats::default();
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let local = transport.local_addr().ok();

    info!(local = ?local, "udp server started");

    while !shutdown.is_cancelled() {
        for _ in 0..cfg.recv_per_tick.max(1) {
            match transport.try_recv_from(&mut buf) {
                Ok(IoStatus::Ready((len, from))) => {
                    let packet = wire::decode(&buf[..len]);
                    if let Decoded::Malformed(reason) = packet {
                        debug!(%from, %reason, "dropping malformed datagram");
                        stats.datagrams_dropped += 1;
                        continue;
                    }
                    match table.dispatch(from, packet, len, clock.now(), &cfg.session) {
                        Dispatch::Created => stats.sessions_created += 1,
                        Dispatch::Delivered => {}
                        Dispatch::Reset { abandoned } => {
                            debug!(peer = %from, %abandoned, "session reset by new handshake");
                            sink.append(
                                TraceEntry::new(TraceEvent::SessionReset)
                                    .with_peer(from)
                                    .with_test_id(abandoned)
                                    .to_line(),
                            );
                        }
                        Dispatch::Dropped => {
                            debug!(%from, "dropping datagram from unknown endpoint");
                            stats.datagrams_dropped += 1;
                        }
                    }
                }
                Ok(IoStatus::WouldBlock) => break,
                Err(e) => {
                    // ICMP errors from one client surface here; keep serving.
                    debug!(error = %e, "receive failed");
                    break;
                }
            }
        }

        for outcome in table.service(transport, clock.as_ref(), cfg.sessions_per_tick, cfg.max_burst)
        {
            if outcome.success {
                stats.sessions_succeeded += 1;
            } else {
                stats.sessions_failed += 1;
            }
            info!(
                test_id = %outcome.test_id,
                kind = %outcome.kind,
                peer = %outcome.endpoint,
                success = outcome.success,
                rate = ?outcome.observed_rate,
                failure = ?outcome.failure,
                "udp session finished"
            );
            sink.append(TraceEntry::from_outcome(TraceEvent::SessionCompleted, &outcome).to_line());
        }

        let now = clock.now();
        let wake = wake_at(&mut table, now);
        if wake <= now {
            tokio::task::yield_now().await;
            continue;
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            ready = transport.readable() => {
                if let Err(e) = ready {
                    warn!(error = %e, "udp socket failed");
                    break;
                }
            }
            _ = sleep_until(wake) => {}
        }
    }

    info!(
        local = ?local,
        created = stats.sessions_created,
        succeeded = stats.sessions_succeeded,
        failed = stats.sessions_failed,
        dropped = stats.datagrams_dropped,
        "udp server stopped"
    );
    stats
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
