//! Pending acknowledgements.
//!
//! Acks are queued when a packet arrives and encoded when they actually leave,
//! so the delay field measures time spent queued on this side.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::time::Instant;

use crate::clock::millis_between;
use crate::transport::{DatagramTransport, IoStatus};
use crate::wire;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAck {
    pub pkt_id: u32,
    pub timestamp_echo: u32,
    pub received_at: Instant,
    pub observed_rate: Option<u64>,
    /// Reachability replies are padded to the size of the handshake.
    pub pad_to: Option<usize>,
}

impl PendingAck {
    pub fn encode(&self, now: Instant) -> Bytes {
        let delay = millis_between(self.received_at, now).min(u32::MAX as u64) as u32;
        match self.pad_to {
            Some(len) => wire::encode_padded_ack(self.pkt_id, self.timestamp_echo, delay, len),
            None => wire::encode_ack(self.pkt_id, self.timestamp_echo, delay, self.observed_rate),
        }
    }
}

/// FIFO of acks waiting for socket space.
#[derive(Debug, Default)]
pub struct AckQueue {
    pending: VecDeque<PendingAck>,
}

impl AckQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, ack: PendingAck) {
        self.pending.push_back(ack);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingAck> {
        self.pending.iter()
    }

    /// Send queued acks in order until the queue empties or the socket would
    /// block. Each ack is attempted at most once per call. Returns how many
    /// left the socket.
    pub fn drain<T: DatagramTransport + ?Sized>(
        &mut self,
        transport: &T,
        peer: SocketAddr,
        now: Instant,
    ) -> io::Result<usize> {
        let mut sent = 0;
        while let Some(ack) = self.pending.front() {
            match transport.try_send_to(&ack.encode(now), peer)? {
                IoStatus::Ready(_) => {
                    self.pending.pop_front();
                    sent += 1;
                }
                IoStatus::WouldBlock => break,
            }
        }
        Ok(sent)
    }
}
