//! Fixed-offset binary packet format shared by every test kind.
//!
//! ```text
//! offset  width  field
//!      0      4  pkt_id      (big-endian, opaque echo token)
//!      4      4  timestamp   (author's native endianness, echoed verbatim)
//!      8      7  kind tag "Test_N\0" | finish sentinel "Finish\0" | ack delay (4, BE)
//!     15      8  rate        (u64 BE, packets/sec)
//! ```
//!
//! Acks are 12 bytes (`pkt_id`, `timestamp` echo, `delay`) or 23 bytes when
//! they carry an observed rate. Everything longer is a handshake, a finish
//! packet, or a data packet, told apart by the 7 bytes at offset 8.
//! Reachability replies are acks zero-padded to the size of the handshake
//! they answer.
//!
//! Decoding never fails hard: anything the codec cannot classify comes back as
//! [`Decoded::Malformed`] and the caller drops it.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Layout constants
// ---------------------------------------------------------------------------

pub const PKT_ID_OFFSET: usize = 0;
pub const TIMESTAMP_OFFSET: usize = 4;
pub const TAG_OFFSET: usize = 8;
pub const DELAY_OFFSET: usize = 8;
pub const RATE_OFFSET: usize = 15;

pub const TAG_LEN: usize = 7;
pub const RATE_LEN: usize = 8;

/// Ack without an observed-rate field.
pub const ACK_LEN: usize = 12;
/// Ack carrying an observed-rate field.
pub const ACK_WITH_RATE_LEN: usize = RATE_OFFSET + RATE_LEN;

/// Largest datagram any test kind sends.
pub const MAX_PACKET_SIZE: usize = 1500;
/// Smallest configurable payload size; keeps data packets clear of ack lengths.
pub const MIN_PAYLOAD_SIZE: usize = 64;
/// Reachability replies are never shorter than this.
pub const REACHABILITY_REPLY_MIN: usize = 512;

/// Size of the first TCP segment and of every TCP flood block.
pub const TCP_SEGMENT_SIZE: usize = 1500;
/// Size of the rate trailer returned at the end of a TCP upload test.
pub const TCP_RATE_TRAILER_LEN: usize = 8;

const TAG_PREFIX: &[u8; 5] = b"Test_";
const FINISH_SENTINEL: &[u8; TAG_LEN] = b"Finish\0";
const FILL_BYTE: u8 = 0xA0;

// ---------------------------------------------------------------------------
// TestKind
// ---------------------------------------------------------------------------

/// The six test kinds, numbered as on the wire (`Test_1` .. `Test_6`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    /// `Test_1`: one UDP round trip.
    UdpReachability,
    /// `Test_2`: one TCP segment echoed back.
    TcpReachability,
    /// `Test_3`: TCP server -> client throughput.
    TcpDownload,
    /// `Test_4`: TCP client -> server throughput.
    TcpUpload,
    /// `Test_5`: UDP server -> client throughput.
    UdpDownload,
    /// `Test_6`: UDP client -> server throughput.
    UdpUpload,
}

impl TestKind {
    pub const ALL: [TestKind; 6] = [
        TestKind::UdpReachability,
        TestKind::TcpReachability,
        TestKind::TcpDownload,
        TestKind::TcpUpload,
        TestKind::UdpDownload,
        TestKind::UdpUpload,
    ];

    /// Numeric code used in the tag (`1..=6`).
    pub fn code(self) -> u8 {
        match self {
            TestKind::UdpReachability => 1,
            TestKind::TcpReachability => 2,
            TestKind::TcpDownload => 3,
            TestKind::TcpUpload => 4,
            TestKind::UdpDownload => 5,
            TestKind::UdpUpload => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.code() == code)
    }

    /// The 7-byte tag written at [`TAG_OFFSET`] (or at the start of a TCP
    /// first segment).
    pub fn tag(self) -> [u8; TAG_LEN] {
        let mut tag = [0u8; TAG_LEN];
        tag[..TAG_PREFIX.len()].copy_from_slice(TAG_PREFIX);
        tag[TAG_PREFIX.len()] = b'0' + self.code();
        tag
    }

    pub fn is_udp(self) -> bool {
        matches!(
            self,
            TestKind::UdpReachability | TestKind::UdpDownload | TestKind::UdpUpload
        )
    }

    pub fn is_tcp(self) -> bool {
        !self.is_udp()
    }

    /// Throughput kinds measure a rate; the reachability kinds do not.
    pub fn is_throughput(self) -> bool {
        !matches!(self, TestKind::UdpReachability | TestKind::TcpReachability)
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Test_{}", self.code())
    }
}

// ---------------------------------------------------------------------------
// Decoded packets
// ---------------------------------------------------------------------------

/// The two fields every packet starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub pkt_id: u32,
    pub timestamp: u32,
}

/// Why a datagram was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Malformed {
    #[error("datagram too short ({0} bytes)")]
    TooShort(usize),
    #[error("unknown test tag digit {0:#04x}")]
    UnknownTag(u8),
    #[error("handshake truncated ({0} bytes)")]
    ShortHandshake(usize),
}

/// Result of classifying one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    Handshake {
        header: Header,
        kind: TestKind,
        /// Requested send rate; only meaningful for [`TestKind::UdpDownload`].
        rate: Option<u64>,
    },
    Data {
        header: Header,
    },
    Finish {
        header: Header,
    },
    Ack {
        header: Header,
        delay_ms: u32,
        observed_rate: Option<u64>,
    },
    Malformed(Malformed),
}

impl Decoded {
    pub fn header(&self) -> Option<Header> {
        match self {
            Decoded::Handshake { header, .. }
            | Decoded::Data { header }
            | Decoded::Finish { header }
            | Decoded::Ack { header, .. } => Some(*header),
            Decoded::Malformed(_) => None,
        }
    }

    pub fn pkt_id(&self) -> Option<u32> {
        self.header().map(|h| h.pkt_id)
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn filled(size: usize, pkt_id: u32, timestamp: u32) -> BytesMut {
    let size = size.clamp(ACK_WITH_RATE_LEN + 1, MAX_PACKET_SIZE);
    let mut buf = BytesMut::with_capacity(size);
    buf.put_u32(pkt_id);
    buf.put_slice(&timestamp.to_ne_bytes());
    buf.resize(size, FILL_BYTE);
    buf
}

/// First packet of a UDP test. `rate` is written for rate-controlled tests.
pub fn encode_handshake(
    kind: TestKind,
    pkt_id: u32,
    timestamp: u32,
    rate: Option<u64>,
    size: usize,
) -> Bytes {
    let mut buf = filled(size, pkt_id, timestamp);
    buf[TAG_OFFSET..TAG_OFFSET + TAG_LEN].copy_from_slice(&kind.tag());
    if let Some(rate) = rate {
        buf[RATE_OFFSET..RATE_OFFSET + RATE_LEN].copy_from_slice(&rate.to_be_bytes());
    }
    buf.freeze()
}

pub fn encode_data(pkt_id: u32, timestamp: u32, size: usize) -> Bytes {
    filled(size, pkt_id, timestamp).freeze()
}

/// Data packet carrying the finish sentinel.
pub fn encode_finish(pkt_id: u32, timestamp: u32, size: usize) -> Bytes {
    let mut buf = filled(size, pkt_id, timestamp);
    buf[TAG_OFFSET..TAG_OFFSET + TAG_LEN].copy_from_slice(FINISH_SENTINEL);
    buf.freeze()
}

pub fn encode_ack(
    pkt_id: u32,
    timestamp_echo: u32,
    delay_ms: u32,
    observed_rate: Option<u64>,
) -> Bytes {
    let len = if observed_rate.is_some() {
        ACK_WITH_RATE_LEN
    } else {
        ACK_LEN
    };
    let mut buf = BytesMut::with_capacity(len);
    buf.put_u32(pkt_id);
    buf.put_slice(&timestamp_echo.to_ne_bytes());
    buf.put_u32(delay_ms);
    if let Some(rate) = observed_rate {
        buf.resize(RATE_OFFSET, 0);
        buf.put_u64(rate);
    }
    buf.freeze()
}

/// Ack zero-padded to `len` bytes (at least [`REACHABILITY_REPLY_MIN`]).
pub fn encode_padded_ack(pkt_id: u32, timestamp_echo: u32, delay_ms: u32, len: usize) -> Bytes {
    let len = len.clamp(REACHABILITY_REPLY_MIN, MAX_PACKET_SIZE);
    let mut buf = BytesMut::with_capacity(len);
    buf.put_u32(pkt_id);
    buf.put_slice(&timestamp_echo.to_ne_bytes());
    buf.put_u32(delay_ms);
    buf.resize(len, 0);
    buf.freeze()
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn read_u32_be(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(raw)
}

fn read_u64_be(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(raw)
}

fn read_header(buf: &[u8]) -> Header {
    let mut ts = [0u8; 4];
    ts.copy_from_slice(&buf[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 4]);
    Header {
        pkt_id: read_u32_be(buf, PKT_ID_OFFSET),
        timestamp: u32::from_ne_bytes(ts),
    }
}

/// Classify a datagram.
pub fn decode(buf: &[u8]) -> Decoded {
    if buf.len() < ACK_LEN {
        return Decoded::Malformed(Malformed::TooShort(buf.len()));
    }
    let header = read_header(buf);

    if buf.len() <= ACK_WITH_RATE_LEN {
        // A handshake truncated into ack range must not pass as an ack.
        if buf.len() >= TAG_OFFSET + TAG_PREFIX.len()
            && &buf[TAG_OFFSET..TAG_OFFSET + TAG_PREFIX.len()] == TAG_PREFIX
        {
            return Decoded::Malformed(Malformed::ShortHandshake(buf.len()));
        }
        let observed_rate =
            (buf.len() == ACK_WITH_RATE_LEN).then(|| read_u64_be(buf, RATE_OFFSET));
        return Decoded::Ack {
            header,
            delay_ms: read_u32_be(buf, DELAY_OFFSET),
            observed_rate,
        };
    }

    let tag = &buf[TAG_OFFSET..TAG_OFFSET + TAG_LEN];
    if tag == FINISH_SENTINEL {
        return Decoded::Finish { header };
    }
    if &tag[..TAG_PREFIX.len()] == TAG_PREFIX {
        let digit = tag[TAG_PREFIX.len()];
        let kind = match digit.checked_sub(b'0').and_then(TestKind::from_code) {
            Some(kind) => kind,
            None => return Decoded::Malformed(Malformed::UnknownTag(digit)),
        };
        let rate = (kind == TestKind::UdpDownload).then(|| read_u64_be(buf, RATE_OFFSET));
        return Decoded::Handshake { header, kind, rate };
    }
    Decoded::Data { header }
}

// ---------------------------------------------------------------------------
// TCP first segment
// ---------------------------------------------------------------------------

/// The fixed-size first segment a TCP probe opens with.
pub fn encode_tcp_first_segment(kind: TestKind) -> Bytes {
    let mut buf = BytesMut::with_capacity(TCP_SEGMENT_SIZE);
    buf.put_slice(&kind.tag());
    buf.resize(TCP_SEGMENT_SIZE, FILL_BYTE);
    buf.freeze()
}

/// Classify a complete TCP first segment. Only TCP kinds are accepted.
pub fn classify_tcp_first_segment(segment: &[u8]) -> Option<TestKind> {
    if segment.len() < TCP_SEGMENT_SIZE || &segment[..TAG_PREFIX.len()] != TAG_PREFIX {
        return None;
    }
    segment[TAG_PREFIX.len()]
        .checked_sub(b'0')
        .and_then(TestKind::from_code)
        .filter(|kind| kind.is_tcp())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
