//! Server side of a UDP test, one per client endpoint.
//!
//! A session exists only after a valid UDP handshake. A repeated handshake
//! (same id, same kind) is answered idempotently; any other handshake from the
//! same endpoint abandons the running test and starts over.

use std::net::SocketAddr;

use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::ack::{AckQueue, PendingAck};
use super::rate::{self, PacedSender};
use super::{
    FailureReason, FlowEvent, Outcome, Phase, TestKind, ThroughputBudget, Timing, Transmit,
};
use crate::clock;
use crate::wire::{Decoded, Header};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub payload_size: usize,
    pub timing: Timing,
    pub budget: ThroughputBudget,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            payload_size: 1450,
            timing: Timing::SERVER,
            budget: ThroughputBudget::default(),
        }
    }
}

pub struct UdpSession {
    peer: SocketAddr,
    cfg: SessionConfig,
    test_id: Uuid,
    kind: Option<TestKind>,
    phase: Phase,
    started_at: Instant,
    finished_at: Option<Instant>,
    handshake_id: u32,
    sender: Option<PacedSender>,
    recv_bytes: u64,
    /// Wire length of the first upload datagram; the rate counts in it.
    peer_packet_size: Option<usize>,
    acks_received: u64,
    first_received: Option<Instant>,
    next_deadline: Option<Instant>,
    no_data_deadline: Option<Instant>,
    observed_rate: Option<u64>,
    acks: AckQueue,
    resets: u32,
}

impl UdpSession {
    /// A session waiting for its handshake.
    pub fn new(peer: SocketAddr, cfg: SessionConfig, now: Instant) -> Self {
        Self {
            peer,
            cfg,
            test_id: Uuid::new_v4(),
            kind: None,
            phase: Phase::StartTest,
            started_at: now,
            finished_at: None,
            handshake_id: 0,
            sender: None,
            recv_bytes: 0,
            peer_packet_size: None,
            acks_received: 0,
            first_received: None,
            next_deadline: None,
            no_data_deadline: None,
            observed_rate: None,
            acks: AckQueue::new(),
            resets: 0,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn test_id(&self) -> Uuid {
        self.test_id
    }

    pub fn kind(&self) -> Option<TestKind> {
        self.kind
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

    pub fn payload_size(&self) -> usize {
        self.cfg.payload_size
    }

    /// Datagram size behind the observed rate: our own payload for a
    /// download, what the client sent for an upload.
    pub fn packet_size(&self) -> Option<usize> {
        match self.kind {
            Some(TestKind::UdpDownload) => Some(self.cfg.payload_size),
            Some(TestKind::UdpUpload) => self.peer_packet_size,
            _ => None,
        }
    }

    /// How many times a new handshake replaced a running test.
    pub fn resets(&self) -> u32 {
        self.resets
    }

    pub fn acks_mut(&mut self) -> &mut AckQueue {
        &mut self.acks
    }

    pub fn timestamp(&self, now: Instant) -> u32 {
        clock::wire_timestamp(self.started_at, now)
    }

    pub fn next_wakeup(&self) -> Option<Instant> {
        match (self.next_deadline, self.no_data_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

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

    pub fn on_event(&mut self, now: Instant, event: FlowEvent) -> Option<Transmit> {
        match event {
            FlowEvent::PacketArrived { packet, len } => {
                self.on_packet(now, packet, len);
                None
            }
            _ if self.is_finished() => None,
            FlowEvent::TimerFired => self.on_timer(now),
            FlowEvent::Sent(tx) => {
                if let Some(sender) = self.sender.as_mut() {
                    self.next_deadline =
                        Some(sender.on_sent(tx, now, self.cfg.timing.retransmit_interval));
                    if matches!(tx, Transmit::Finish { retransmit: false, .. }) {
                        self.phase = Phase::FinishPacket;
                    }
                }
                None
            }
            FlowEvent::NoDataTimeout => {
                self.finish(now, Some(FailureReason::NoDataTimeout));
                None
            }
        }
    }

    /// End the running test because the socket failed underneath it.
    pub fn fail(&mut self, now: Instant, reason: FailureReason) {
        if self.kind.is_some() && !self.is_finished() {
            self.finish(now, Some(reason));
        }
    }

    fn on_timer(&mut self, now: Instant) -> Option<Transmit> {
        match self.phase {
            Phase::RunTest if self.kind == Some(TestKind::UdpDownload) => self
                .sender
                .as_ref()
                .map(|sender| sender.poll_data(now, &self.cfg.budget)),
            Phase::FinishPacket => {
                let retransmit = self
                    .sender
                    .as_ref()
                    .and_then(|sender| sender.poll_finish(self.cfg.timing.retry_limit));
                if retransmit.is_none() {
                    self.finish(now, Some(FailureReason::RetryBudgetExhausted));
                }
                retransmit
            }
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

    fn on_packet(&mut self, now: Instant, packet: Decoded, len: usize) {
        match packet {
            Decoded::Malformed(_) => {}
            Decoded::Handshake { header, kind, rate } => {
                if !kind.is_udp() {
                    debug!(peer = %self.peer, %kind, "dropping tcp handshake received over udp");
                    return;
                }
                let duplicate = !self.is_finished()
                    && self.kind == Some(kind)
                    && self.handshake_id == header.pkt_id;
                if duplicate {
                    self.on_duplicate_handshake(now, header, len);
                } else {
                    self.start(now, header, kind, rate, len);
                }
            }
            Decoded::Data { header } | Decoded::Finish { header } | Decoded::Ack { header, .. } => {
                if self.is_finished() {
                    return;
                }
                match self.kind {
                    Some(TestKind::UdpDownload) => {
                        self.recv_bytes += len as u64;
                        self.acks_received += 1;
                        self.no_data_deadline = Some(now + self.cfg.timing.no_data_timeout);
                        let last = self.sender.as_ref().map(|s| s.last_pkt_id());
                        if self.phase == Phase::FinishPacket && last == Some(header.pkt_id) {
                            self.observed_rate = Some(self.acked_rate(now));
                            self.enter_linger(now);
                        }
                    }
                    Some(TestKind::UdpUpload) => {
                        self.recv_bytes += len as u64;
                        if !matches!(packet, Decoded::Ack { .. }) {
                            self.peer_packet_size.get_or_insert(len);
                        }
                        self.no_data_deadline = Some(now + self.cfg.timing.no_data_timeout);
                        if self.phase == Phase::RunTest && matches!(packet, Decoded::Finish { .. }) {
                            let elapsed =
                                clock::millis_between(self.first_received.unwrap_or(now), now);
                            self.observed_rate = Some(rate::observed_rate(
                                self.recv_bytes,
                                self.packet_size().unwrap_or(self.cfg.payload_size),
                                elapsed,
                            ));
                            self.enter_linger(now);
                        }
                        self.queue_ack(now, header, self.observed_rate, None);
                    }
                    _ => {}
                }
            }
        }
    }

    fn on_duplicate_handshake(&mut self, now: Instant, header: Header, len: usize) {
        match self.kind {
            Some(TestKind::UdpReachability) => self.queue_ack(now, header, None, Some(len)),
            Some(TestKind::UdpDownload) => {
                if self.phase == Phase::RunTest {
                    self.next_deadline = Some(now);
                }
            }
            Some(TestKind::UdpUpload) => {
                self.no_data_deadline = Some(now + self.cfg.timing.no_data_timeout);
                self.queue_ack(now, header, self.observed_rate, None);
            }
            _ => {}
        }
    }

    fn start(&mut self, now: Instant, header: Header, kind: TestKind, rate: Option<u64>, len: usize) {
        if self.kind.is_some() {
            if !self.is_finished() {
                self.resets += 1;
                info!(
                    peer = %self.peer,
                    abandoned = %self.test_id,
                    "new handshake replaces running test"
                );
            }
            self.test_id = Uuid::new_v4();
        }
        self.kind = Some(kind);
        self.handshake_id = header.pkt_id;
        self.started_at = now;
        self.finished_at = None;
        self.sender = None;
        self.recv_bytes = 0;
        self.peer_packet_size = None;
        self.acks_received = 0;
        self.first_received = Some(now);
        self.next_deadline = None;
        self.no_data_deadline = None;
        self.observed_rate = None;
        self.acks.clear();

        debug!(peer = %self.peer, test_id = %self.test_id, %kind, "session started");

        match kind {
            TestKind::UdpReachability => {
                self.queue_ack(now, header, None, Some(len));
                self.enter_linger(now);
            }
            TestKind::UdpDownload => {
                let rate = rate.unwrap_or(0);
                if rate == 0 {
                    self.finish(now, Some(FailureReason::ProtocolError));
                    return;
                }
                self.sender = Some(PacedSender::new(
                    rate,
                    self.cfg.payload_size,
                    header.pkt_id.wrapping_add(1),
                ));
                self.phase = Phase::RunTest;
                self.next_deadline = Some(now);
                self.no_data_deadline = Some(now + self.cfg.timing.no_data_timeout);
            }
            TestKind::UdpUpload => {
                self.phase = Phase::RunTest;
                self.no_data_deadline = Some(now + self.cfg.timing.no_data_timeout);
                self.queue_ack(now, header, None, None);
            }
            TestKind::TcpReachability | TestKind::TcpDownload | TestKind::TcpUpload => {}
        }
    }

    fn queue_ack(
        &mut self,
        now: Instant,
        header: Header,
        observed_rate: Option<u64>,
        pad_to: Option<usize>,
    ) {
        self.acks.push(PendingAck {
            pkt_id: header.pkt_id,
            timestamp_echo: header.timestamp,
            received_at: now,
            observed_rate,
            pad_to,
        });
    }

    /// Acks per second over the send window; logged, never sent.
    fn acked_rate(&self, now: Instant) -> u64 {
        let first = self
            .sender
            .as_ref()
            .and_then(|s| s.first_sent())
            .unwrap_or(now);
        let elapsed = clock::millis_between(first, now);
        if elapsed == 0 {
            0
        } else {
            self.acks_received * 1000 / elapsed
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
    }

    /// Summary for logs and traces; `None` before any handshake.
    pub fn outcome(&self) -> Option<Outcome> {
        let kind = self.kind?;
        let failure = match self.phase {
            Phase::TestFinished { failure } => failure,
            _ => Some(FailureReason::Timeout),
        };
        let ended = self.finished_at.unwrap_or(self.started_at);
        Some(Outcome {
            test_id: self.test_id,
            kind,
            endpoint: self.peer,
            success: failure.is_none(),
            observed_rate: self.observed_rate,
            packet_size: self.packet_size(),
            failure,
            bytes_sent: self.sender.as_ref().map(|s| s.sent_bytes()).unwrap_or(0),
            bytes_received: self.recv_bytes,
            duration_ms: clock::millis_between(self.started_at, ended),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::wire;

    fn peer() -> SocketAddr {
        "10.0.0.2:50000".parse().unwrap()
    }

    fn cfg() -> SessionConfig {
        SessionConfig {
            payload_size: 1000,
            timing: Timing::SERVER,
            budget: ThroughputBudget {
                max_bytes: 2000,
                min_duration: Duration::from_millis(10),
            },
        }
    }

    fn header(pkt_id: u32, timestamp: u32) -> Header {
        Header { pkt_id, timestamp }
    }

    fn handshake(kind: TestKind, pkt_id: u32, rate: Option<u64>) -> FlowEvent {
        FlowEvent::PacketArrived {
            packet: Decoded::Handshake {
                header: header(pkt_id, 1000),
                kind,
                rate,
            },
            len: 1450,
        }
    }

    fn data(pkt_id: u32) -> FlowEvent {
        data_sized(pkt_id, 1000)
    }

    fn data_sized(pkt_id: u32, len: usize) -> FlowEvent {
        FlowEvent::PacketArrived {
            packet: Decoded::Data { header: header(pkt_id, 5) },
            len,
        }
    }

    fn finish_pkt(pkt_id: u32) -> FlowEvent {
        finish_sized(pkt_id, 1000)
    }

    fn finish_sized(pkt_id: u32, len: usize) -> FlowEvent {
        FlowEvent::PacketArrived {
            packet: Decoded::Finish { header: header(pkt_id, 5) },
            len,
        }
    }

    fn ack(pkt_id: u32) -> FlowEvent {
        FlowEvent::PacketArrived {
            packet: Decoded::Ack { header: header(pkt_id, 5), delay_ms: 0, observed_rate: None },
            len: 12,
        }
    }

    fn tick(session: &mut UdpSession, now: Instant) -> Option<Transmit> {
        let tx = session.on_event(now, FlowEvent::TimerFired)?;
        session.on_event(now, FlowEvent::Sent(tx));
        Some(tx)
    }

    #[test]
    fn test_reachability_reply_echoes_handshake() {
        let now = Instant::now();
        let mut session = UdpSession::new(peer(), cfg(), now);
        session.on_event(now, handshake(TestKind::UdpReachability, 42, None));

        let pending: Vec<_> = session.acks_mut().iter().copied().collect();
        assert_eq!(pending.len(), 1);
        let bytes = pending[0].encode(now);
        assert_eq!(bytes.len(), 1450);
        assert_eq!(&bytes[0..4], &42u32.to_be_bytes());
        assert_eq!(&bytes[4..8], &1000u32.to_ne_bytes());
        assert_eq!(session.phase(), Phase::WaitFinishTimeout);
    }

    #[test]
    fn test_duplicate_reachability_handshake_is_idempotent() {
        let now = Instant::now();
        let mut session = UdpSession::new(peer(), cfg(), now);
        session.on_event(now, handshake(TestKind::UdpReachability, 42, None));
        let id = session.test_id();
        for _ in 0..3 {
            session.on_event(now, handshake(TestKind::UdpReachability, 42, None));
        }
        // One reply per handshake, all for the same test.
        assert_eq!(session.acks_mut().len(), 4);
        assert!(session.acks_mut().iter().all(|a| a.pkt_id == 42));
        assert_eq!(session.test_id(), id);
        assert_eq!(session.resets(), 0);
    }

    #[test]
    fn test_new_handshake_resets_session() {
        let now = Instant::now();
        let mut session = UdpSession::new(peer(), cfg(), now);
        session.on_event(now, handshake(TestKind::UdpUpload, 7, None));
        session.on_event(now, data(8));
        let first = session.test_id();

        session.on_event(now, handshake(TestKind::UdpDownload, 99, Some(100)));
        assert_ne!(session.test_id(), first);
        assert_eq!(session.kind(), Some(TestKind::UdpDownload));
        assert_eq!(session.resets(), 1);
        assert!(session.acks_mut().is_empty());
        assert_eq!(tick(&mut session, now), Some(Transmit::Data { pkt_id: 100 }));
    }

    #[test]
    fn test_download_with_zero_rate_is_protocol_error() {
        let now = Instant::now();
        let mut session = UdpSession::new(peer(), cfg(), now);
        session.on_event(now, handshake(TestKind::UdpDownload, 1, Some(0)));
        assert_eq!(
            session.phase(),
            Phase::TestFinished {
                failure: Some(FailureReason::ProtocolError)
            }
        );
    }

    #[test]
    fn test_tcp_kind_over_udp_is_dropped() {
        let now = Instant::now();
        let mut session = UdpSession::new(peer(), cfg(), now);
        session.on_event(now, handshake(TestKind::TcpDownload, 1, None));
        assert_eq!(session.kind(), None);
        assert!(session.outcome().is_none());
    }

    #[test]
    fn test_download_sends_then_retransmits_finish_until_acked() {
        let start = Instant::now();
        let mut session = UdpSession::new(peer(), cfg(), start);
        session.on_event(start, handshake(TestKind::UdpDownload, 42, Some(100)));

        let mut now = start;
        let mut ids = Vec::new();
        loop {
            let tx = tick(&mut session, now).expect("sending");
            ids.push(tx.pkt_id());
            session.on_event(now, ack(tx.pkt_id()));
            if matches!(tx, Transmit::Finish { .. }) {
                break;
            }
            now += Duration::from_millis(10);
        }
        assert_eq!(ids, vec![43, 44, 45]);
        // The data acks above do not end the test; only the finish id does.
        assert_eq!(session.phase(), Phase::WaitFinishTimeout);
        assert!(session.observed_rate().is_some());

        now += Timing::SERVER.linger;
        assert_eq!(session.due_event(now), Some(FlowEvent::TimerFired));
        session.on_event(now, FlowEvent::TimerFired);
        let outcome = session.outcome().expect("outcome");
        assert!(outcome.success);
        assert_eq!(outcome.bytes_sent, 3000);
    }

    #[test]
    fn test_download_finish_gives_up_after_retry_limit() {
        let start = Instant::now();
        let mut session = UdpSession::new(peer(), cfg(), start);
        session.on_event(start, handshake(TestKind::UdpDownload, 42, Some(100)));

        let mut now = start;
        let mut finish_sends = 0;
        // Acks keep the session alive; none echoes the finish id.
        while !session.is_finished() {
            if let Some(Transmit::Finish { .. }) = tick(&mut session, now) {
                finish_sends += 1;
            }
            session.on_event(now, ack(43));
            now += Duration::from_millis(10).max(Timing::SERVER.retransmit_interval);
        }
        assert_eq!(finish_sends, 1 + Timing::SERVER.retry_limit);
        assert_eq!(
            session.phase(),
            Phase::TestFinished {
                failure: Some(FailureReason::RetryBudgetExhausted)
            }
        );
    }

    #[test]
    fn test_duplicate_download_handshake_rearms_send() {
        let start = Instant::now();
        let mut session = UdpSession::new(peer(), cfg(), start);
        session.on_event(start, handshake(TestKind::UdpDownload, 42, Some(1)));
        tick(&mut session, start);
        // At 1 pps the next send is a second away.
        let later = start + Duration::from_millis(100);
        assert_eq!(session.due_event(later), None);

        session.on_event(later, handshake(TestKind::UdpDownload, 42, Some(1)));
        assert_eq!(session.due_event(later), Some(FlowEvent::TimerFired));
        assert_eq!(session.resets(), 0);
    }

    #[test]
    fn test_upload_acks_data_and_reports_rate_after_finish() {
        let start = Instant::now();
        let mut session = UdpSession::new(peer(), cfg(), start);
        session.on_event(start, handshake(TestKind::UdpUpload, 42, None));
        assert_eq!(session.acks_mut().len(), 1);

        let mut now = start;
        for id in 43..63 {
            now += Duration::from_millis(5);
            session.on_event(now, data(id));
        }
        // 20 packets, then finish, over 105ms.
        now += Duration::from_millis(5);
        session.on_event(now, finish_pkt(63));
        assert_eq!(session.phase(), Phase::WaitFinishTimeout);
        let rate = session.observed_rate().expect("rate");
        assert_eq!(rate, 200);

        // A retransmitted finish is acked with the same rate.
        session.on_event(now + Duration::from_millis(200), finish_pkt(63));
        assert_eq!(session.observed_rate(), Some(rate));

        let pending: Vec<_> = session.acks_mut().iter().copied().collect();
        assert_eq!(pending.len(), 1 + 20 + 2);
        let last = pending.last().expect("ack").encode(now);
        assert_eq!(last.len(), wire::ACK_WITH_RATE_LEN);
        assert!(matches!(
            wire::decode(&last),
            wire::Decoded::Ack { observed_rate: Some(200), header, .. } if header.pkt_id == 63
        ));
        // Data acks before the finish carry no rate.
        assert_eq!(pending[1].encode(now).len(), wire::ACK_LEN);
    }

    #[test]
    fn test_upload_rate_counts_client_datagrams() {
        // Configured for 1000-byte packets; the client sends 512-byte ones.
        let start = Instant::now();
        let mut session = UdpSession::new(peer(), cfg(), start);
        session.on_event(start, handshake(TestKind::UdpUpload, 42, None));

        let mut now = start;
        for id in 43..63 {
            now += Duration::from_millis(5);
            session.on_event(now, data_sized(id, 512));
        }
        now += Duration::from_millis(5);
        session.on_event(now, finish_sized(63, 512));
        // 21 packets over 105ms.
        assert_eq!(session.observed_rate(), Some(200));
        assert_eq!(session.packet_size(), Some(512));
    }

    #[test]
    fn test_send_failure_ends_session_unreachable() {
        let start = Instant::now();
        let mut session = UdpSession::new(peer(), cfg(), start);
        // Nothing to fail before a handshake.
        session.fail(start, FailureReason::Unreachable);
        assert!(!session.is_finished());

        session.on_event(start, handshake(TestKind::UdpDownload, 42, Some(100)));
        session.fail(start, FailureReason::Unreachable);
        assert_eq!(
            session.outcome().and_then(|o| o.failure),
            Some(FailureReason::Unreachable)
        );
        // A terminal session keeps its first failure.
        session.fail(start, FailureReason::Timeout);
        assert_eq!(
            session.phase(),
            Phase::TestFinished {
                failure: Some(FailureReason::Unreachable)
            }
        );
    }

    #[test]
    fn test_upload_rate_grows_with_volume() {
        let mut previous = 0;
        for packets in [10u32, 20, 40] {
            let start = Instant::now();
            let mut session = UdpSession::new(peer(), cfg(), start);
            session.on_event(start, handshake(TestKind::UdpUpload, 1, None));
            let step = Duration::from_millis(400) / packets;
            let mut now = start;
            for id in 0..packets {
                now += step;
                session.on_event(now, data(id + 2));
            }
            session.on_event(start + Duration::from_millis(400), finish_pkt(packets + 2));
            let rate = session.observed_rate().expect("rate");
            assert!(rate >= previous, "{} < {}", rate, previous);
            previous = rate;
        }
    }

    #[test]
    fn test_silent_upload_times_out() {
        let start = Instant::now();
        let mut session = UdpSession::new(peer(), cfg(), start);
        session.on_event(start, handshake(TestKind::UdpUpload, 42, None));
        let late = start + Timing::SERVER.no_data_timeout;
        assert_eq!(session.due_event(late), Some(FlowEvent::NoDataTimeout));
        session.on_event(late, FlowEvent::NoDataTimeout);
        assert_eq!(
            session.outcome().and_then(|o| o.failure),
            Some(FailureReason::NoDataTimeout)
        );
    }
}
