//! Send pacing and observed-rate arithmetic.
//!
//! The pacer accumulates a fractional nanosecond offset from the first send,
//! so long runs do not drift the way summing rounded intervals would.

use std::time::Duration;

use tokio::time::Instant;

use super::{ThroughputBudget, Transmit};

/// Fixed-rate schedule expressed as offsets from the first send.
#[derive(Debug, Clone)]
pub struct Pacer {
    interval_ns: f64,
    next_offset_ns: f64,
}

impl Pacer {
    pub fn new(rate_pps: u64) -> Self {
        let interval_ns = if rate_pps == 0 {
            0.0
        } else {
            1e9 / rate_pps as f64
        };
        Self {
            interval_ns,
            next_offset_ns: 0.0,
        }
    }

    /// Move one slot forward and return the new offset from the first send.
    pub fn advance(&mut self) -> Duration {
        self.next_offset_ns += self.interval_ns;
        Duration::from_nanos(self.next_offset_ns as u64)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_nanos(self.interval_ns as u64)
    }
}

/// Packets per second given bytes received over `elapsed_ms`.
///
/// Zero when nothing measurable elapsed.
pub fn observed_rate(recv_bytes: u64, payload_size: usize, elapsed_ms: u64) -> u64 {
    if elapsed_ms == 0 || payload_size == 0 {
        return 0;
    }
    // One division, so exact quotients are not truncated to one less.
    (recv_bytes as f64 * 1000.0 / (payload_size as f64 * elapsed_ms as f64)) as u64
}

/// Bytes per second over `elapsed`, zero when `elapsed` is zero.
pub fn bytes_per_sec(bytes: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0;
    }
    (bytes as f64 / secs) as u64
}

// ---------------------------------------------------------------------------
// PacedSender
// ---------------------------------------------------------------------------

/// Sending half of a UDP throughput test: rate-paced data, then a finish
/// sentinel that is retransmitted until acknowledged.
///
/// Used by the client for uploads and by the server for downloads.
#[derive(Debug, Clone)]
pub struct PacedSender {
    pacer: Pacer,
    payload_size: usize,
    next_pkt_id: u32,
    last_pkt_id: u32,
    sent_bytes: u64,
    first_sent: Option<Instant>,
    finish_sends: u32,
}

impl PacedSender {
    pub fn new(rate_pps: u64, payload_size: usize, first_pkt_id: u32) -> Self {
        Self {
            pacer: Pacer::new(rate_pps),
            payload_size,
            next_pkt_id: first_pkt_id,
            last_pkt_id: first_pkt_id,
            sent_bytes: 0,
            first_sent: None,
            finish_sends: 0,
        }
    }

    /// The next packet of the stream. Becomes the finish sentinel once the
    /// budget has been spent.
    pub fn poll_data(&self, now: Instant, budget: &ThroughputBudget) -> Transmit {
        let finishing = self
            .first_sent
            .map(|first| budget.is_met(self.sent_bytes, now.saturating_duration_since(first)))
            .unwrap_or(false);
        if finishing {
            Transmit::Finish {
                pkt_id: self.next_pkt_id,
                retransmit: false,
            }
        } else {
            Transmit::Data {
                pkt_id: self.next_pkt_id,
            }
        }
    }

    /// A finish retransmission, or `None` once `retry_limit` retransmissions
    /// have gone out.
    pub fn poll_finish(&self, retry_limit: u32) -> Option<Transmit> {
        (self.finish_sends <= retry_limit).then_some(Transmit::Finish {
            pkt_id: self.last_pkt_id,
            retransmit: true,
        })
    }

    /// Account for a packet that left the socket and return when the sender
    /// wants to act next.
    pub fn on_sent(&mut self, tx: Transmit, now: Instant, retransmit_interval: Duration) -> Instant {
        match tx {
            Transmit::Handshake { .. } => now + retransmit_interval,
            Transmit::Data { pkt_id } => {
                self.sent_bytes += self.payload_size as u64;
                self.next_pkt_id = pkt_id.wrapping_add(1);
                let first = *self.first_sent.get_or_insert(now);
                first + self.pacer.advance()
            }
            Transmit::Finish { pkt_id, retransmit } => {
                self.sent_bytes += self.payload_size as u64;
                self.first_sent.get_or_insert(now);
                if retransmit {
                    self.finish_sends += 1;
                } else {
                    self.last_pkt_id = pkt_id;
                    self.next_pkt_id = pkt_id.wrapping_add(1);
                    self.finish_sends = 1;
                }
                now + retransmit_interval
            }
        }
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes
    }

    pub fn first_sent(&self) -> Option<Instant> {
        self.first_sent
    }

    /// Id of the finish sentinel once it has been sent.
    pub fn last_pkt_id(&self) -> u32 {
        self.last_pkt_id
    }

    pub fn finish_sends(&self) -> u32 {
        self.finish_sends
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pacer_does_not_drift() {
        let mut pacer = Pacer::new(3);
        let mut offset = Duration::ZERO;
        for _ in 0..3000 {
            offset = pacer.advance();
        }
        // 3000 slots at 3 pps is exactly 1000s; rounding each interval to
        // whole nanoseconds would lose 1us.
        let expected = Duration::from_secs(1000);
        let diff = if offset > expected {
            offset - expected
        } else {
            expected - offset
        };
        assert!(diff < Duration::from_micros(1), "drifted by {:?}", diff);
    }

    #[test]
    fn test_pacer_zero_rate_does_not_wait() {
        let mut pacer = Pacer::new(0);
        assert_eq!(pacer.advance(), Duration::ZERO);
        assert_eq!(Pacer::new(1000).interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_observed_rate() {
        // 100 packets of 1450 bytes over 500ms is 200 pps.
        assert_eq!(observed_rate(145_000, 1450, 500), 200);
        assert_eq!(observed_rate(145_000, 1450, 0), 0);
        assert_eq!(bytes_per_sec(4000, Duration::from_secs(2)), 2000);
        assert_eq!(bytes_per_sec(4000, Duration::ZERO), 0);
    }

    #[test]
    fn test_observed_rate_is_monotonic_in_bytes() {
        let mut previous = 0;
        for packets in [10u64, 20, 40, 80, 160] {
            let rate = observed_rate(packets * 1450, 1450, 1000);
            assert!(rate >= previous);
            previous = rate;
        }
    }

    #[test]
    fn test_paced_sender_switches_to_finish_after_budget() {
        let budget = ThroughputBudget {
            max_bytes: 300,
            min_duration: Duration::from_millis(20),
        };
        let start = Instant::now();
        let rto = Duration::from_millis(200);
        let mut sender = PacedSender::new(100, 100, 7);

        // Ids start at the given value and increment.
        for expected_id in 7..10 {
            let tx = sender.poll_data(start, &budget);
            assert_eq!(tx, Transmit::Data { pkt_id: expected_id });
            sender.on_sent(tx, start, rto);
        }
        // Bytes reached but not the minimum duration.
        assert!(matches!(sender.poll_data(start, &budget), Transmit::Data { .. }));

        let later = start + Duration::from_millis(30);
        let fin = sender.poll_data(later, &budget);
        assert_eq!(fin, Transmit::Finish { pkt_id: 10, retransmit: false });
        assert_eq!(sender.on_sent(fin, later, rto), later + rto);
        assert_eq!(sender.last_pkt_id(), 10);
        assert_eq!(sender.finish_sends(), 1);
    }

    #[test]
    fn test_finish_retransmits_are_bounded() {
        let start = Instant::now();
        let rto = Duration::from_millis(400);
        let mut sender = PacedSender::new(10, 100, 1);
        sender.on_sent(Transmit::Finish { pkt_id: 1, retransmit: false }, start, rto);

        let mut retransmits = 0;
        while let Some(tx) = sender.poll_finish(3) {
            assert_eq!(tx.pkt_id(), 1);
            sender.on_sent(tx, start, rto);
            retransmits += 1;
        }
        // One initial send plus three retransmissions.
        assert_eq!(retransmits, 3);
        assert_eq!(sender.finish_sends(), 4);
    }

    #[test]
    fn test_data_deadline_follows_pacer() {
        let start = Instant::now();
        let mut sender = PacedSender::new(4, 100, 0);
        let next = sender.on_sent(Transmit::Data { pkt_id: 0 }, start, Duration::ZERO);
        assert_eq!(next, start + Duration::from_millis(250));
        // Late sends do not shift the schedule.
        let next = sender.on_sent(
            Transmit::Data { pkt_id: 1 },
            start + Duration::from_millis(400),
            Duration::ZERO,
        );
        assert_eq!(next, start + Duration::from_millis(500));
    }
}
