//! Non-blocking datagram transport.
//!
//! Every call either completes immediately, reports [`IoStatus::WouldBlock`],
//! or returns a hard error. Would-block is not an error: the caller simply
//! retries on its next loop iteration.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;

/// Outcome of a non-blocking I/O attempt that did not hard-fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus<T> {
    Ready(T),
    WouldBlock,
}

impl<T> IoStatus<T> {
    pub fn is_would_block(&self) -> bool {
        matches!(self, IoStatus::WouldBlock)
    }
}

/// Map an I/O result onto [`IoStatus`], keeping hard errors as errors.
pub fn non_blocking<T>(result: io::Result<T>) -> io::Result<IoStatus<T>> {
    match result {
        Ok(value) => Ok(IoStatus::Ready(value)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(IoStatus::WouldBlock),
        Err(e) => Err(e),
    }
}

/// Errors that mean the peer or the path refused us, as opposed to a local
/// fault.
pub fn is_unreachable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::TimedOut
    )
}

/// A datagram socket driven by a polling loop.
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<IoStatus<usize>>;

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<IoStatus<(usize, SocketAddr)>>;

    /// Resolve once a receive is likely to make progress.
    async fn readable(&self) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramTransport for UdpSocket {
    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<IoStatus<usize>> {
        non_blocking(UdpSocket::try_send_to(self, buf, target))
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<IoStatus<(usize, SocketAddr)>> {
        non_blocking(UdpSocket::try_recv_from(self, buf))
    }

    async fn readable(&self) -> io::Result<()> {
        UdpSocket::readable(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}
