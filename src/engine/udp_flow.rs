//! Client side of a UDP test (kinds 1, 5 and 6).
//!
//! [`UdpFlow`] is the state machine; [`run_udp_flow`] drives it against a
//! [`DatagramTransport`] until it reaches `TestFinished`.
//!
//! | kind | START_TEST exits on            | RUN_TEST                      |
//! |------|--------------------------------|-------------------------------|
//! | 1    | reply echoing the handshake id | not used                      |
//! | 5    | first inbound packet           | ack everything, wait for Finish |
//! | 6    | first inbound packet           | paced data, then Finish        |

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ack::{AckQueue, PendingAck};
use super::rate::{self, PacedSender};
use super::{
    EngineError, FailureReason, FlowEvent, Outcome, Phase, TestKind, ThroughputBudget, Timing,
    Transmit,
};
use crate::clock::{self, Clock};
use crate::transport::{is_unreachable, DatagramTransport, IoStatus};
use crate::wire::{self, Decoded, MAX_PACKET_SIZE};

/// How many timer-driven sends one loop iteration may perform.
pub const DEFAULT_MAX_BURST: usize = 64;

/// Loop wake-up when there is nothing scheduled.
const IDLE_POLL: Duration = Duration::from_millis(50);
/// Loop wake-up while acks are waiting for socket space.
const BACKLOG_POLL: Duration = Duration::from_millis(1);

/// Parameters of one client-side UDP test.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    pub kind: TestKind,
    /// Requested send rate in packets/sec (kinds 5 and 6).
    pub rate_pps: u64,
    pub payload_size: usize,
    pub timing: Timing,
    pub budget: ThroughputBudget,
    pub max_burst: usize,
}

impl FlowConfig {
    pub fn new(kind: TestKind) -> Self {
        Self {
            kind,
            rate_pps: 1000,
            payload_size: 1450,
            timing: Timing::CLIENT,
            budget: ThroughputBudget::default(),
            max_burst: DEFAULT_MAX_BURST,
        }
    }
}

// ---------------------------------------------------------------------------
// UdpFlow
// ---------------------------------------------------------------------------

pub struct UdpFlow {
    cfg: FlowConfig,
    test_id: Uuid,
    phase: Phase,
    started_at: Instant,
    finished_at: Option<Instant>,
    handshake_id: u32,
    handshake_sends: u32,
    sender: PacedSender,
    recv_bytes: u64,
    /// Wire length of the first download datagram; the rate counts in it.
    peer_packet_size: Option<usize>,
    first_received: Option<Instant>,
    next_deadline: Option<Instant>,
    no_data_deadline: Option<Instant>,
    observed_rate: Option<u64>,
    acks: AckQueue,
}

impl UdpFlow {
    /// A flow whose handshake is due immediately. `handshake_id` must be
    /// non-zero; data packets of an upload continue from `handshake_id + 1`.
    pub fn new(cfg: FlowConfig, handshake_id: u32, now: Instant) -> Self {
        let sender = PacedSender::new(cfg.rate_pps, cfg.payload_size, handshake_id.wrapping_add(1));
        Self {
            cfg,
            test_id: Uuid::new_v4(),
            phase: Phase::StartTest,
            started_at: now,
            finished_at: None,
            handshake_id,
            handshake_sends: 0,
            sender,
            recv_bytes: 0,
            peer_packet_size: None,
            first_received: None,
            next_deadline: Some(now),
            no_data_deadline: None,
            observed_rate: None,
            acks: AckQueue::new(),
        }
    }

    pub fn test_id(&self) -> Uuid {
        self.test_id
    }

    pub fn kind(&self) -> TestKind {
        self.cfg.kind
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_finished(&self) -> bool {
        self.phase.is_finished()
    }

    pub fn observed_rate(&self) -> Option<u64> {
        self.observed_rate
    }

    pub fn handshake_sends(&self) -> u32 {
        self.handshake_sends
    }

    pub fn acks_mut(&mut self) -> &mut AckQueue {
        &mut self.acks
    }

    /// Wire timestamp for a packet sent at `now`.
    pub fn timestamp(&self, now: Instant) -> u32 {
        clock::wire_timestamp(self.started_at, now)
    }

    /// The earliest instant the machine wants to be woken.
    pub fn next_wakeup(&self) -> Option<Instant> {
        match (self.next_deadline, self.no_data_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// The event due at `now`, if any. Liveness is checked before the action
    /// deadline.
    pub fn due_event(&self, now: Instant) -> Option<FlowEvent> {
        if self.is_finished() {
            return None;
        }
        if self.no_data_deadline.is_some_and(|d| d <= now) {
            return Some(FlowEvent::NoDataTimeout);
        }
        if self.next_deadline.is_some_and(|d| d <= now) {
            return Some(FlowEvent::TimerFired);
        }
        None
    }

    /// Advance the machine. Returns a packet to send, if any.
    pub fn on_event(&mut self, now: Instant, event: FlowEvent) -> Option<Transmit> {
        if self.is_finished() {
            return None;
        }
        match event {
            FlowEvent::TimerFired => self.on_timer(now),
            FlowEvent::PacketArrived { packet, len } => {
                self.on_packet(now, packet, len);
                None
            }
            FlowEvent::Sent(tx) => {
                self.on_sent(now, tx);
                None
            }
            FlowEvent::NoDataTimeout => {
                self.finish(now, Some(FailureReason::NoDataTimeout));
                None
            }
        }
    }

    /// End the test because the transport failed underneath it.
    pub fn fail(&mut self, now: Instant, reason: FailureReason) {
        if !self.is_finished() {
            self.finish(now, Some(reason));
        }
    }

    fn on_timer(&mut self, now: Instant) -> Option<Transmit> {
        match self.phase {
            Phase::StartTest => {
                if self.handshake_sends > self.cfg.timing.retry_limit {
                    self.finish(now, Some(FailureReason::RetryBudgetExhausted));
                    return None;
                }
                let rate = (self.cfg.kind == TestKind::UdpDownload).then_some(self.cfg.rate_pps);
                Some(Transmit::Handshake {
                    pkt_id: self.handshake_id,
                    rate,
                })
            }
            Phase::RunTest if self.cfg.kind == TestKind::UdpUpload => {
                Some(self.sender.poll_data(now, &self.cfg.budget))
            }
            Phase::FinishPacket => match self.sender.poll_finish(self.cfg.timing.retry_limit) {
                Some(tx) => Some(tx),
                None => {
                    self.finish(now, Some(FailureReason::RetryBudgetExhausted));
                    None
                }
            },
            Phase::WaitFinishTimeout => {
                self.finish(now, None);
                None
            }
            _ => {
                self.next_deadline = None;
                None
            }
        }
    }

    fn on_sent(&mut self, now: Instant, tx: Transmit) {
        let rto = self.cfg.timing.retransmit_interval;
        match tx {
            Transmit::Handshake { .. } => {
                self.handshake_sends += 1;
                self.next_deadline = Some(now + rto);
            }
            Transmit::Data { .. } | Transmit::Finish { .. } => {
                self.next_deadline = Some(self.sender.on_sent(tx, now, rto));
                if matches!(tx, Transmit::Finish { retransmit: false, .. }) {
                    self.phase = Phase::FinishPacket;
                }
            }
        }
    }

    fn on_packet(&mut self, now: Instant, packet: Decoded, len: usize) {
        let Some(header) = packet.header() else {
            return;
        };
        match self.cfg.kind {
            TestKind::UdpReachability => {
                if self.phase == Phase::StartTest && header.pkt_id == self.handshake_id {
                    self.recv_bytes += len as u64;
                    self.enter_linger(now);
                }
            }
            TestKind::UdpDownload => {
                self.recv_bytes += len as u64;
                if matches!(packet, Decoded::Data { .. } | Decoded::Finish { .. }) {
                    self.peer_packet_size.get_or_insert(len);
                }
                self.no_data_deadline = Some(now + self.cfg.timing.no_data_timeout);
                if self.phase == Phase::StartTest {
                    self.phase = Phase::RunTest;
                    self.next_deadline = None;
                    self.first_received = Some(now);
                }
                self.acks.push(PendingAck {
                    pkt_id: header.pkt_id,
                    timestamp_echo: header.timestamp,
                    received_at: now,
                    observed_rate: None,
                    pad_to: None,
                });
                if self.phase == Phase::RunTest && matches!(packet, Decoded::Finish { .. }) {
                    let elapsed = clock::millis_between(self.first_received.unwrap_or(now), now);
                    self.observed_rate = Some(rate::observed_rate(
                        self.recv_bytes,
                        self.packet_size().unwrap_or(self.cfg.payload_size),
                        elapsed,
                    ));
                    self.enter_linger(now);
                }
            }
            TestKind::UdpUpload => {
                self.recv_bytes += len as u64;
                self.no_data_deadline = Some(now + self.cfg.timing.no_data_timeout);
                match self.phase {
                    Phase::StartTest => {
                        self.phase = Phase::RunTest;
                        self.first_received = Some(now);
                        self.next_deadline = Some(now);
                    }
                    Phase::FinishPacket if header.pkt_id == self.sender.last_pkt_id() => {
                        let rate = match packet {
                            Decoded::Ack { observed_rate, .. } => observed_rate,
                            _ => None,
                        };
                        self.observed_rate = Some(rate.unwrap_or(0));
                        self.enter_linger(now);
                    }
                    _ => {}
                }
            }
            TestKind::TcpReachability | TestKind::TcpDownload | TestKind::TcpUpload => {}
        }
    }

    /// Datagram size behind the observed rate: what the server sent for a
    /// download, our own payload for an upload.
    pub fn packet_size(&self) -> Option<usize> {
        match self.cfg.kind {
            TestKind::UdpDownload => self.peer_packet_size,
            TestKind::UdpUpload => Some(self.cfg.payload_size),
            _ => None,
        }
    }

    fn enter_linger(&mut self, now: Instant) {
        self.phase = Phase::WaitFinishTimeout;
        self.next_deadline = Some(now + self.cfg.timing.linger);
    }

    fn finish(&mut self, now: Instant, failure: Option<FailureReason>) {
        self.phase = Phase::TestFinished { failure };
        self.finished_at = Some(now);
        self.next_deadline = None;
        self.no_data_deadline = None;
        self.acks.clear();
    }

    /// Summary for the orchestrator. Meaningful once finished.
    pub fn outcome(&self, endpoint: SocketAddr) -> Outcome {
        let failure = match self.phase {
            Phase::TestFinished { failure } => failure,
            _ => Some(FailureReason::Timeout),
        };
        let ended = self.finished_at.unwrap_or(self.started_at);
        Outcome {
            test_id: self.test_id,
            kind: self.cfg.kind,
            endpoint,
            success: failure.is_none(),
            observed_rate: if self.cfg.kind.is_throughput() {
                self.observed_rate
            } else {
                None
            },
            packet_size: self.packet_size(),
            failure,
            bytes_sent: self.sender.sent_bytes(),
            bytes_received: self.recv_bytes,
            duration_ms: clock::millis_between(self.started_at, ended),
        }
    }
}

/// A random non-zero handshake id.
pub fn random_handshake_id() -> u32 {
    loop {
        let id = rand::random::<u32>();
        if id != 0 {
            return id;
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Run one UDP test to completion over an already-bound transport.
pub async fn run_udp_flow<T: DatagramTransport + ?Sized>(
    transport: &T,
    peer: SocketAddr,
    cfg: FlowConfig,
    clock: &dyn Clock,
) -> Outcome {
    let kind = cfg.kind;
    let payload_size = cfg.payload_size;
    let max_burst = cfg.max_burst.max(1);
    let mut flow = UdpFlow::new(cfg, random_handshake_id(), clock.now());
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    info!(test_id = %flow.test_id(), %kind, %peer, "udp test starting");

    while !flow.is_finished() {
        // Timers and paced sends.
        let mut burst = 0;
        while burst < max_burst {
            let now = clock.now();
            let Some(event) = flow.due_event(now) else {
                break;
            };
            let Some(tx) = flow.on_event(now, event) else {
                continue;
            };
            let bytes = tx.encode(kind, flow.timestamp(now), payload_size);
            match transport.try_send_to(&bytes, peer) {
                Ok(IoStatus::Ready(_)) => {
                    flow.on_event(now, FlowEvent::Sent(tx));
                    burst += 1;
                }
                Ok(IoStatus::WouldBlock) => break,
                Err(e) => {
                    warn!(test_id = %flow.test_id(), error = %e, "send failed");
                    flow.fail(now, FailureReason::Unreachable);
                    break;
                }
            }
        }
        if flow.is_finished() {
            break;
        }

        // Acks, each tried once.
        let now = clock.now();
        if let Err(e) = flow.acks_mut().drain(transport, peer, now) {
            warn!(test_id = %flow.test_id(), error = %e, "ack send failed");
            flow.fail(now, FailureReason::Unreachable);
            break;
        }

        // Everything that has already arrived.
        loop {
            match transport.try_recv_from(&mut buf) {
                Ok(IoStatus::Ready((len, from))) => {
                    if from != peer {
                        debug!(%from, "ignoring datagram from unexpected peer");
                        continue;
                    }
                    let packet = wire::decode(&buf[..len]);
                    if let Decoded::Malformed(reason) = packet {
                        debug!(test_id = %flow.test_id(), %reason, "dropping malformed datagram");
                        continue;
                    }
                    flow.on_event(clock.now(), FlowEvent::PacketArrived { packet, len });
                }
                Ok(IoStatus::WouldBlock) => break,
                Err(e) if is_unreachable(&e) => {
                    warn!(test_id = %flow.test_id(), error = %e, "peer unreachable");
                    flow.fail(clock.now(), FailureReason::Unreachable);
                    break;
                }
                Err(e) => {
                    warn!(test_id = %flow.test_id(), error = %e, "receive failed");
                    break;
                }
            }
        }
        if flow.is_finished() {
            break;
        }

        let now = clock.now();
        let wake = if flow.acks_mut().is_empty() {
            flow.next_wakeup().unwrap_or(now + IDLE_POLL)
        } else {
            now + BACKLOG_POLL
        };
        tokio::select! {
            ready = transport.readable() => {
                if let Err(e) = ready {
                    warn!(test_id = %flow.test_id(), error = %e, "socket failed");
                    flow.fail(clock.now(), FailureReason::Unreachable);
                }
            }
            _ = sleep_until(wake) => {}
        }
    }

    let outcome = flow.outcome(peer);
    info!(
        test_id = %outcome.test_id,
        %kind,
        %peer,
        success = outcome.success,
        rate = ?outcome.observed_rate,
        failure = ?outcome.failure,
        "udp test finished"
    );
    outcome
}

/// Bind an ephemeral socket on `bind_ip` and run one UDP test against `peer`.
pub async fn udp_test(
    bind_ip: std::net::IpAddr,
    peer: SocketAddr,
    cfg: FlowConfig,
    clock: &dyn Clock,
) -> Result<Outcome, EngineError> {
    if !cfg.kind.is_udp() {
        return Err(EngineError::WrongTransport {
            kind: cfg.kind,
            transport: "udp",
        });
    }
    let local = SocketAddr::new(bind_ip, 0);
    let socket = tokio::net::UdpSocket::bind(local)
        .await
        .map_err(|source| EngineError::Bind { addr: local, source })?;
    Ok(run_udp_flow(&socket, peer, cfg, clock).await)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Header;

    fn cfg(kind: TestKind) -> FlowConfig {
        FlowConfig {
            kind,
            rate_pps: 100,
            payload_size: 1000,
            timing: Timing::CLIENT,
            budget: ThroughputBudget {
                max_bytes: 3000,
                min_duration: Duration::from_millis(20),
            },
            max_burst: DEFAULT_MAX_BURST,
        }
    }

    fn arrived(packet: Decoded, len: usize) -> FlowEvent {
        FlowEvent::PacketArrived { packet, len }
    }

    fn header(pkt_id: u32) -> Header {
        Header { pkt_id, timestamp: 0 }
    }

    /// Fire the timer and report the resulting transmit as sent.
    fn tick(flow: &mut UdpFlow, now: Instant) -> Option<Transmit> {
        let tx = flow.on_event(now, FlowEvent::TimerFired)?;
        flow.on_event(now, FlowEvent::Sent(tx));
        Some(tx)
    }

    #[test]
    fn test_handshake_retry_budget_is_exact() {
        let start = Instant::now();
        let mut flow = UdpFlow::new(cfg(TestKind::UdpReachability), 42, start);
        let mut now = start;
        let mut sends = 0;
        while let Some(event) = flow.due_event(now) {
            if flow.on_event(now, event).is_some() {
                flow.on_event(now, FlowEvent::Sent(Transmit::Handshake { pkt_id: 42, rate: None }));
                sends += 1;
            }
            now += Timing::CLIENT.retransmit_interval;
        }
        assert_eq!(sends, 1 + Timing::CLIENT.retry_limit);
        assert_eq!(
            flow.phase(),
            Phase::TestFinished {
                failure: Some(FailureReason::RetryBudgetExhausted)
            }
        );
    }

    #[test]
    fn test_unsent_handshake_is_retried_not_counted() {
        let start = Instant::now();
        let mut flow = UdpFlow::new(cfg(TestKind::UdpReachability), 42, start);
        // Would-block: the transmit is produced but never reported as sent.
        assert!(flow.on_event(start, FlowEvent::TimerFired).is_some());
        assert_eq!(flow.handshake_sends(), 0);
        assert_eq!(flow.due_event(start), Some(FlowEvent::TimerFired));
    }

    #[test]
    fn test_reachability_accepts_matching_reply_then_lingers() {
        let start = Instant::now();
        let mut flow = UdpFlow::new(cfg(TestKind::UdpReachability), 42, start);
        tick(&mut flow, start);

        // A reply for another id is ignored.
        flow.on_event(start, arrived(Decoded::Data { header: header(41) }, 512));
        assert_eq!(flow.phase(), Phase::StartTest);

        let t = start + Duration::from_millis(30);
        flow.on_event(t, arrived(Decoded::Data { header: header(42) }, 1000));
        assert_eq!(flow.phase(), Phase::WaitFinishTimeout);

        // Duplicate replies during the linger change nothing.
        flow.on_event(t, arrived(Decoded::Data { header: header(42) }, 1000));
        assert_eq!(flow.due_event(t + Duration::from_millis(999)), None);

        let end = t + Timing::CLIENT.linger;
        assert_eq!(flow.due_event(end), Some(FlowEvent::TimerFired));
        assert_eq!(flow.on_event(end, FlowEvent::TimerFired), None);
        let outcome = flow.outcome("127.0.0.1:4230".parse().unwrap());
        assert!(outcome.success);
        assert_eq!(outcome.observed_rate, None);
    }

    #[test]
    fn test_download_handshake_carries_rate() {
        let start = Instant::now();
        let mut flow = UdpFlow::new(cfg(TestKind::UdpDownload), 42, start);
        assert_eq!(
            flow.on_event(start, FlowEvent::TimerFired),
            Some(Transmit::Handshake { pkt_id: 42, rate: Some(100) })
        );
    }

    #[test]
    fn test_download_acks_everything_and_computes_rate() {
        let start = Instant::now();
        let mut flow = UdpFlow::new(cfg(TestKind::UdpDownload), 42, start);
        tick(&mut flow, start);

        let mut now = start + Duration::from_millis(10);
        for id in 43..53 {
            flow.on_event(now, arrived(Decoded::Data { header: header(id) }, 1000));
            now += Duration::from_millis(10);
        }
        assert_eq!(flow.phase(), Phase::RunTest);
        // No action deadline while receiving; only liveness.
        assert_eq!(flow.due_event(now), None);

        flow.on_event(now, arrived(Decoded::Finish { header: header(53) }, 1000));
        assert_eq!(flow.phase(), Phase::WaitFinishTimeout);
        // 11 packets over 100ms.
        assert_eq!(flow.observed_rate(), Some(110));
        assert_eq!(flow.acks_mut().len(), 11);

        // A retransmitted finish is acked again but the rate stays put.
        flow.on_event(now, arrived(Decoded::Finish { header: header(53) }, 1000));
        assert_eq!(flow.acks_mut().len(), 12);
        assert_eq!(flow.observed_rate(), Some(110));
    }

    #[test]
    fn test_download_rate_counts_server_datagrams() {
        // Configured for 512-byte packets; the server sends 1450-byte ones.
        let mut config = cfg(TestKind::UdpDownload);
        config.payload_size = 512;
        let start = Instant::now();
        let mut flow = UdpFlow::new(config, 42, start);
        tick(&mut flow, start);

        let mut now = start;
        for id in 43..63 {
            flow.on_event(now, arrived(Decoded::Data { header: header(id) }, 1450));
            now += Duration::from_millis(5);
        }
        flow.on_event(now, arrived(Decoded::Finish { header: header(63) }, 1450));
        // 21 packets over 100ms.
        assert_eq!(flow.observed_rate(), Some(210));
        assert_eq!(flow.packet_size(), Some(1450));

        now += Timing::CLIENT.linger;
        flow.on_event(now, FlowEvent::TimerFired);
        let outcome = flow.outcome("127.0.0.1:4230".parse().unwrap());
        assert_eq!(outcome.packet_size, Some(1450));
        assert_eq!(outcome.bytes_received, 21 * 1450);
    }

    #[test]
    fn test_no_data_timeout_is_checked_before_timer() {
        let start = Instant::now();
        let mut flow = UdpFlow::new(cfg(TestKind::UdpDownload), 42, start);
        tick(&mut flow, start);
        flow.on_event(start, arrived(Decoded::Data { header: header(43) }, 1000));

        let late = start + Timing::CLIENT.no_data_timeout;
        assert_eq!(flow.due_event(late), Some(FlowEvent::NoDataTimeout));
        flow.on_event(late, FlowEvent::NoDataTimeout);
        assert_eq!(
            flow.phase(),
            Phase::TestFinished {
                failure: Some(FailureReason::NoDataTimeout)
            }
        );
        // Terminal state absorbs everything.
        assert_eq!(flow.on_event(late, FlowEvent::TimerFired), None);
        assert!(flow.acks_mut().is_empty());
    }

    #[test]
    fn test_upload_sends_paced_data_then_finish() {
        let start = Instant::now();
        let mut flow = UdpFlow::new(cfg(TestKind::UdpUpload), 42, start);
        tick(&mut flow, start);

        // Server's handshake ack opens the data phase immediately.
        flow.on_event(start, arrived(Decoded::Ack { header: header(42), delay_ms: 0, observed_rate: None }, 12));
        assert_eq!(flow.phase(), Phase::RunTest);

        let mut now = start;
        let mut ids = Vec::new();
        loop {
            let tx = tick(&mut flow, now).expect("sender always has a packet");
            ids.push(tx.pkt_id());
            if let Transmit::Finish { .. } = tx {
                break;
            }
            now += Duration::from_millis(10);
        }
        // 3000 bytes and 20ms: three data packets at 10ms spacing, then finish.
        assert_eq!(ids, vec![43, 44, 45, 46]);
        assert_eq!(flow.phase(), Phase::FinishPacket);

        flow.on_event(
            now,
            arrived(Decoded::Ack { header: header(46), delay_ms: 1, observed_rate: Some(97) }, 23),
        );
        assert_eq!(flow.phase(), Phase::WaitFinishTimeout);
        assert_eq!(flow.observed_rate(), Some(97));
    }

    #[test]
    fn test_finish_succeeds_after_losses_within_budget() {
        let start = Instant::now();
        let mut flow = UdpFlow::new(cfg(TestKind::UdpUpload), 42, start);
        tick(&mut flow, start);
        flow.on_event(start, arrived(Decoded::Ack { header: header(42), delay_ms: 0, observed_rate: None }, 12));

        let mut now = start;
        while !matches!(tick(&mut flow, now), Some(Transmit::Finish { .. })) {
            now += Duration::from_millis(10);
        }
        // Lose the first few finish packets.
        for _ in 0..(Timing::CLIENT.retry_limit - 1) {
            now += Timing::CLIENT.retransmit_interval;
            assert!(matches!(
                tick(&mut flow, now),
                Some(Transmit::Finish { retransmit: true, pkt_id: 46 })
            ));
            // Acks for data packets do not complete the test.
            flow.on_event(now, arrived(Decoded::Ack { header: header(44), delay_ms: 0, observed_rate: None }, 12));
        }
        flow.on_event(now, arrived(Decoded::Ack { header: header(46), delay_ms: 0, observed_rate: None }, 12));
        assert_eq!(flow.phase(), Phase::WaitFinishTimeout);
        // No rate in the ack reads as zero.
        assert_eq!(flow.observed_rate(), Some(0));

        now += Timing::CLIENT.linger;
        flow.on_event(now, FlowEvent::TimerFired);
        assert!(flow.outcome("127.0.0.1:80".parse().unwrap()).success);
    }

    #[test]
    fn test_random_handshake_id_is_never_zero() {
        for _ in 0..1000 {
            assert_ne!(random_handshake_id(), 0);
        }
    }

    #[tokio::test]
    async fn test_udp_test_rejects_tcp_kind() {
        let err = udp_test(
            "127.0.0.1".parse().unwrap(),
            "127.0.0.1:9".parse().unwrap(),
            FlowConfig::new(TestKind::TcpDownload),
            &crate::clock::SystemClock,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::WrongTransport { .. }));
    }

    #[tokio::test]
    async fn test_reachability_without_server_exhausts_retries() {
        // A bound socket that never answers.
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let peer = silent.local_addr().expect("addr");
        let mut config = FlowConfig::new(TestKind::UdpReachability);
        config.timing = Timing {
            retransmit_interval: Duration::from_millis(5),
            retry_limit: 2,
            ..Timing::CLIENT
        };
        let outcome = udp_test("127.0.0.1".parse().unwrap(), peer, config, &crate::clock::SystemClock)
            .await
            .expect("bind");
        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(FailureReason::RetryBudgetExhausted));
    }
}
