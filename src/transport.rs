//! QUIC transports and reference counting
//!
//! A [`QuicTransport`] ties one UDP socket to one QUIC endpoint and
//! carries the process-long keys into the engine. [`RefcountedTransport`]
//! layers the sharing contract on top: every listener, dialer, and
//! non-QUIC sharer holds one borrow, and the last release either closes
//! the endpoint (owned transports) or fires the done signal (borrowed
//! transports) so the outside owner knows it may close the socket.
//!
//! A transport never points back at the pool that registered it; the pool
//! installs a release hook at insertion and the hook runs exactly once
//! when the count reaches zero.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::crypto::HandshakeTokenKey;
use quinn::VarInt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::config::{QuicConfig, StatelessResetKey, TokenGeneratorKey};
use crate::error::{Error, Result};
use crate::metrics;
use crate::socket::{Datagram, MuxSocket};

/// Close code sent when the endpoint shuts down.
const CLOSE_CODE_SHUTDOWN: u32 = 0;

static NEXT_ASSOCIATION: AtomicU64 = AtomicU64::new(0);

/// Opaque tag attaching a transport to a caller-defined purpose.
///
/// Listeners tag their transport with an association; later dials carrying
/// the same association prefer that transport. Compared only for equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Association(u64);

impl Association {
    /// Mint a new, process-unique association.
    pub fn new() -> Self {
        Self(NEXT_ASSOCIATION.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for Association {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds transports from bound sockets, carrying the endpoint keys.
pub(crate) struct EndpointFactory {
    reset_key: StatelessResetKey,
    token_key: TokenGeneratorKey,
}

impl EndpointFactory {
    pub fn new(reset_key: StatelessResetKey, token_key: TokenGeneratorKey) -> Self {
        Self {
            reset_key,
            token_key,
        }
    }

    /// Wrap a bound UDP socket in a QUIC endpoint.
    pub fn build(&self, socket: std::net::UdpSocket) -> Result<Arc<QuicTransport>> {
        // Custom binders may hand over blocking sockets.
        socket.set_nonblocking(true)?;
        let socket = tokio::net::UdpSocket::from_std(socket)?;
        let (mux, non_quic_rx) = MuxSocket::new(socket)?;
        let local_addr = mux.bound_addr();

        let endpoint_config = quinn::EndpointConfig::new(self.reset_key.hmac_key());
        let runtime = quinn::default_runtime()
            .ok_or_else(|| Error::Config("no async runtime available".into()))?;
        let endpoint =
            quinn::Endpoint::new_with_abstract_socket(endpoint_config, None, mux.clone(), runtime)?;

        trace!(%local_addr, "created QUIC transport");
        Ok(Arc::new(QuicTransport {
            endpoint,
            socket: mux,
            non_quic_rx: tokio::sync::Mutex::new(non_quic_rx),
            local_addr,
            token_key: self.token_key.handshake_token_key(),
        }))
    }
}

/// One UDP socket plus one QUIC endpoint.
pub struct QuicTransport {
    endpoint: quinn::Endpoint,
    socket: Arc<MuxSocket>,
    non_quic_rx: tokio::sync::Mutex<mpsc::Receiver<Datagram>>,
    local_addr: SocketAddr,
    token_key: Arc<dyn HandshakeTokenKey>,
}

impl QuicTransport {
    /// The effective local address after binding.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Install (or replace) the server-side TLS configuration. New
    /// incoming handshakes use the new configuration.
    pub(crate) fn install_server_config(
        &self,
        tls: rustls::ServerConfig,
        quic: &QuicConfig,
    ) -> Result<()> {
        let crypto =
            QuicServerConfig::try_from(tls).map_err(|e| Error::Tls(e.to_string()))?;
        let mut server = quinn::ServerConfig::new(Arc::new(crypto), self.token_key.clone());
        server.transport_config(Arc::new(quic.build_transport()?));
        // The endpoint is a shared handle; the server config lives behind
        // it, so installing through a clone applies to all holders.
        let mut endpoint = self.endpoint.clone();
        endpoint.set_server_config(Some(server));
        Ok(())
    }

    /// Wait for the next incoming connection attempt. Returns `None` once
    /// the endpoint is closed.
    pub(crate) async fn accept(&self) -> Option<quinn::Incoming> {
        self.endpoint.accept().await
    }

    /// Dial `remote` through this transport's socket.
    pub(crate) async fn dial(
        &self,
        remote: SocketAddr,
        tls: rustls::ClientConfig,
        quic: &QuicConfig,
    ) -> Result<quinn::Connection> {
        let crypto = QuicClientConfig::try_from(tls).map_err(|e| Error::Tls(e.to_string()))?;
        let mut client = quinn::ClientConfig::new(Arc::new(crypto));
        client.transport_config(Arc::new(quic.build_transport()?));
        let connecting = self
            .endpoint
            .connect_with(client, remote, &remote.ip().to_string())?;
        Ok(connecting.await?)
    }

    /// Send a raw datagram on behalf of the non-QUIC sharer.
    pub async fn write_to(&self, data: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(data, addr).await?)
    }

    /// Receive the next datagram the QUIC engine did not claim.
    pub async fn read_non_quic_packet(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let datagram = self
            .non_quic_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::TransportClosed)?;
        let len = datagram.data.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram.data[..len]);
        Ok((len, datagram.from))
    }

    pub(crate) fn close(&self) {
        self.endpoint
            .close(VarInt::from_u32(CLOSE_CODE_SHUTDOWN), b"");
    }
}

struct CountState {
    count: usize,
    /// Borrowed transports are inserted with one count reserved for the
    /// first listener; that listener claims the reservation instead of
    /// incrementing.
    prepaid: bool,
    released: bool,
}

/// A [`QuicTransport`] shared by counted borrowers.
pub struct RefcountedTransport {
    transport: Arc<QuicTransport>,
    bound_local: SocketAddr,
    borrowed: bool,
    pooled: bool,
    state: Mutex<CountState>,
    associations: Mutex<HashSet<Association>>,
    release_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    done_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl std::fmt::Debug for RefcountedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefcountedTransport")
            .field("bound_local", &self.bound_local)
            .field("borrowed", &self.borrowed)
            .field("pooled", &self.pooled)
            .finish()
    }
}

impl RefcountedTransport {
    /// A transport owned by this subsystem, with one borrow for its
    /// creator. `pooled` is false for the fresh-socket-per-use transports
    /// created when reuseport is disabled.
    pub(crate) fn new_owned(transport: Arc<QuicTransport>, pooled: bool) -> Arc<Self> {
        let bound_local = transport.local_addr();
        metrics::TRANSPORTS_ACTIVE.inc();
        Arc::new(Self {
            transport,
            bound_local,
            borrowed: false,
            pooled,
            state: Mutex::new(CountState {
                count: 1,
                prepaid: false,
                released: false,
            }),
            associations: Mutex::new(HashSet::new()),
            release_hook: Mutex::new(None),
            done_tx: Mutex::new(None),
        })
    }

    /// A transport lent by an outside owner. The returned receiver fires
    /// when the last borrower releases it; the initial count is reserved
    /// for the first listener.
    pub(crate) fn new_borrowed(
        transport: Arc<QuicTransport>,
    ) -> (Arc<Self>, oneshot::Receiver<()>) {
        let bound_local = transport.local_addr();
        let (done_tx, done_rx) = oneshot::channel();
        metrics::TRANSPORTS_ACTIVE.inc();
        let this = Arc::new(Self {
            transport,
            bound_local,
            borrowed: true,
            pooled: true,
            state: Mutex::new(CountState {
                count: 1,
                prepaid: true,
                released: false,
            }),
            associations: Mutex::new(HashSet::new()),
            release_hook: Mutex::new(None),
            done_tx: Mutex::new(Some(done_tx)),
        });
        (this, done_rx)
    }

    pub fn transport(&self) -> &Arc<QuicTransport> {
        &self.transport
    }

    /// The local address fixed at creation.
    pub fn bound_local(&self) -> SocketAddr {
        self.bound_local
    }

    /// Whether this transport was lent by an outside owner.
    pub fn is_borrowed(&self) -> bool {
        self.borrowed
    }

    pub(crate) fn is_pooled(&self) -> bool {
        self.pooled
    }

    /// Take another borrow. Fails once the transport has been released.
    pub fn increase_count(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.released {
            return Err(Error::TransportClosed);
        }
        state.count += 1;
        Ok(())
    }

    /// Listener-path borrow: consumes the lend-time reservation when one
    /// is present, otherwise increments.
    pub(crate) fn claim_or_increase(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.released {
            return Err(Error::TransportClosed);
        }
        if state.prepaid {
            state.prepaid = false;
        } else {
            state.count += 1;
        }
        Ok(())
    }

    /// Release one borrow. The release reaching zero unregisters the
    /// transport from its pool, then closes it (owned) or fires the done
    /// signal (borrowed).
    pub fn decrease_count(&self) -> Result<()> {
        let released = {
            let mut state = self.state.lock();
            if state.released || state.count == 0 {
                warn!(local = %self.bound_local, "transport released more often than borrowed");
                return Err(Error::TransportClosed);
            }
            state.count -= 1;
            if state.count == 0 {
                state.released = true;
                true
            } else {
                false
            }
        };
        if released {
            self.release();
        }
        Ok(())
    }

    fn release(&self) {
        if let Some(hook) = self.release_hook.lock().take() {
            hook();
        }
        metrics::TRANSPORTS_ACTIVE.dec();
        if self.borrowed {
            if let Some(done) = self.done_tx.lock().take() {
                let _ = done.send(());
            }
            debug!(local = %self.bound_local, "borrowed transport released, signalling owner");
        } else {
            self.transport.close();
            debug!(local = %self.bound_local, "transport released and closed");
        }
    }

    /// Tag the transport. Idempotent.
    pub fn associate(&self, tag: Association) {
        self.associations.lock().insert(tag);
    }

    pub fn has_association(&self, tag: Association) -> bool {
        self.associations.lock().contains(&tag)
    }

    pub(crate) fn set_release_hook(&self, hook: Box<dyn FnOnce() + Send>) {
        *self.release_hook.lock() = Some(hook);
    }

    #[cfg(test)]
    pub(crate) fn count(&self) -> usize {
        self.state.lock().count
    }
}

/// An established QUIC connection.
///
/// Dialed connections hold a borrow on their transport which is returned
/// when the connection is dropped. Dereferences to [`quinn::Connection`]
/// for stream and datagram operations.
pub struct Connection {
    inner: quinn::Connection,
    _borrow: Option<TransportBorrow>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("inner", &self.inner)
            .finish()
    }
}

impl Connection {
    pub(crate) fn accepted(inner: quinn::Connection) -> Self {
        Self {
            inner,
            _borrow: None,
        }
    }

    pub(crate) fn dialed(inner: quinn::Connection, borrow: TransportBorrow) -> Self {
        Self {
            inner,
            _borrow: Some(borrow),
        }
    }

    /// The ALPN negotiated during the handshake.
    pub fn alpn(&self) -> Option<Vec<u8>> {
        self.inner
            .handshake_data()
            .and_then(|data| data.downcast::<quinn::crypto::rustls::HandshakeData>().ok())
            .and_then(|data| data.protocol)
    }
}

impl Deref for Connection {
    type Target = quinn::Connection;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// One counted borrow on a transport, returned when dropped. Dials take
/// the borrow before awaiting the handshake so that failure and
/// cancellation release it the same way.
pub(crate) struct TransportBorrow(Arc<RefcountedTransport>);

impl TransportBorrow {
    pub(crate) fn new(transport: Arc<RefcountedTransport>) -> Self {
        Self(transport)
    }
}

impl Drop for TransportBorrow {
    fn drop(&mut self) {
        let _ = self.0.decrease_count();
    }
}
