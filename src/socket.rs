//! Shared UDP socket demultiplexer
//!
//! One UDP socket is shared by the QUIC engine and, optionally, one
//! non-QUIC consumer (e.g. a WebRTC stack sharing the listen port).
//! [`MuxSocket`] sits between the socket and the engine: every QUIC
//! datagram carries the fixed bit (RFC 9000 §17), so datagrams without it
//! are diverted to a bounded channel for the non-QUIC reader and never
//! reach the engine. Writes from the non-QUIC side go straight out the
//! same socket.

use std::fmt;
use std::io::{self, IoSliceMut};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, UdpPoller};
use tokio::sync::mpsc;
use tracing::trace;

/// Queue depth for diverted non-QUIC datagrams. Packets beyond this are
/// dropped, the same as a full OS receive buffer would.
const NON_QUIC_QUEUE_LEN: usize = 32;

/// Maximum UDP datagram size.
const MAX_DATAGRAM_SIZE: usize = 65535;

/// A datagram diverted to the non-QUIC reader.
pub(crate) struct Datagram {
    pub data: Bytes,
    pub from: SocketAddr,
}

/// Whether a datagram is a QUIC packet: all QUIC packets have the fixed
/// bit set in the first byte.
pub(crate) fn is_quic_datagram(data: &[u8]) -> bool {
    data.first().is_some_and(|b| b & 0x40 != 0)
}

/// The socket handed to the QUIC engine.
pub(crate) struct MuxSocket {
    inner: Arc<tokio::net::UdpSocket>,
    local_addr: SocketAddr,
    non_quic_tx: mpsc::Sender<Datagram>,
}

impl MuxSocket {
    /// Wrap a bound socket. Returns the socket and the receive side of
    /// the non-QUIC channel.
    pub fn new(socket: tokio::net::UdpSocket) -> io::Result<(Arc<Self>, mpsc::Receiver<Datagram>)> {
        let local_addr = socket.local_addr()?;
        let (non_quic_tx, non_quic_rx) = mpsc::channel(NON_QUIC_QUEUE_LEN);
        let mux = Arc::new(Self {
            inner: Arc::new(socket),
            local_addr,
            non_quic_tx,
        });
        Ok((mux, non_quic_rx))
    }

    pub fn bound_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send a raw datagram on behalf of the non-QUIC sharer.
    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(data, addr).await
    }
}

impl fmt::Debug for MuxSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxSocket")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

struct MuxPoller {
    inner: Arc<tokio::net::UdpSocket>,
}

impl fmt::Debug for MuxPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxPoller").finish_non_exhaustive()
    }
}

impl UdpPoller for MuxPoller {
    fn poll_writable(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        self.inner.poll_send_ready(cx)
    }
}

impl AsyncUdpSocket for MuxSocket {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        Box::pin(MuxPoller {
            inner: self.inner.clone(),
        })
    }

    fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
        self.inner
            .try_send_to(transmit.contents, transmit.destination)
            .map(|_| ())
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        debug_assert!(!bufs.is_empty() && !meta.is_empty());

        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            let mut read_buf = tokio::io::ReadBuf::new(&mut buf);
            let from = match self.inner.poll_recv_from(cx, &mut read_buf) {
                Poll::Ready(Ok(from)) => from,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };
            let received = read_buf.filled();

            if !is_quic_datagram(received) {
                match self.non_quic_tx.try_send(Datagram {
                    data: Bytes::copy_from_slice(received),
                    from,
                }) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        trace!(%from, "non-QUIC queue full, dropping datagram");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        trace!(%from, "no non-QUIC reader, dropping datagram");
                    }
                }
                continue;
            }

            let copy_len = received.len().min(bufs[0].len());
            bufs[0][..copy_len].copy_from_slice(&received[..copy_len]);
            meta[0] = RecvMeta {
                addr: from,
                len: copy_len,
                stride: copy_len,
                ecn: None,
                dst_ip: None,
            };
            return Poll::Ready(Ok(1));
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn max_transmit_segments(&self) -> usize {
        1
    }

    fn max_receive_segments(&self) -> usize {
        1
    }

    fn may_fragment(&self) -> bool {
        true
    }
}
