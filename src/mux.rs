//! Listener multiplexing
//!
//! One bound address carries one QUIC endpoint but many logical
//! listeners, told apart by ALPN. The [`ListenerMux`] owns the accept
//! loop: each finished handshake is routed to the logical listener whose
//! ALPN set contains the negotiated protocol. The endpoint's TLS
//! configuration is rebuilt whenever listeners come or go — the ALPN list
//! is the union over all routes and the certificate is resolved per
//! handshake from the client's offered protocols.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use quinn::VarInt;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::ClientHello;
use rustls::sign::CertifiedKey;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::addr::QuicAddr;
use crate::config::QuicConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::transport::{Connection, RefcountedTransport};

/// Queue depth of accepted connections per logical listener.
const ACCEPT_QUEUE_LEN: usize = 16;

/// Application close code for handshakes no listener claims.
const CLOSE_CODE_NO_LISTENER: u32 = 0x1;

/// Decides whether an incoming, not-yet-validated source address must
/// prove ownership via a retry token before the handshake proceeds.
pub(crate) type SourceVerifier = Arc<dyn Fn(SocketAddr) -> bool + Send + Sync>;

/// Server-side TLS material for one logical listener.
pub struct TlsServerIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    /// ALPNs this listener accepts. Must be disjoint from every other
    /// listener on the same bound address.
    pub alpns: Vec<Vec<u8>>,
}

/// Picks the certificate by the client's offered ALPNs.
struct AlpnCertResolver {
    keys: Arc<Mutex<HashMap<Vec<u8>, Arc<CertifiedKey>>>>,
}

impl fmt::Debug for AlpnCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlpnCertResolver").finish_non_exhaustive()
    }
}

impl rustls::server::ResolvesServerCert for AlpnCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let keys = self.keys.lock();
        if let Some(offered) = client_hello.alpn() {
            for alpn in offered {
                if let Some(key) = keys.get(alpn) {
                    return Some(key.clone());
                }
            }
        }
        // No usable ALPN: hand out any key and let ALPN negotiation fail
        // the handshake with the proper alert.
        keys.values().next().cloned()
    }
}

/// Fans one QUIC endpoint out to logical listeners keyed by ALPN.
pub(crate) struct ListenerMux {
    transport: Arc<RefcountedTransport>,
    server_quic: QuicConfig,
    routes: Arc<Mutex<HashMap<Vec<u8>, mpsc::Sender<Connection>>>>,
    keys: Arc<Mutex<HashMap<Vec<u8>, Arc<CertifiedKey>>>>,
    accept_task: JoinHandle<()>,
    closed: AtomicBool,
}

impl ListenerMux {
    /// Take over the transport's creator borrow and start accepting.
    pub fn new(
        transport: Arc<RefcountedTransport>,
        server_quic: QuicConfig,
        verify: SourceVerifier,
    ) -> Arc<Self> {
        let routes: Arc<Mutex<HashMap<Vec<u8>, mpsc::Sender<Connection>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let engine = transport.transport().clone();
        let task_routes = routes.clone();
        let accept_task = tokio::spawn(async move {
            while let Some(incoming) = engine.accept().await {
                if !incoming.remote_address_validated() && verify(incoming.remote_address()) {
                    metrics::ADDRESS_RETRIES_TOTAL.inc();
                    trace!(remote = %incoming.remote_address(), "challenging unverified source");
                    let _ = incoming.retry();
                    continue;
                }
                let routes = task_routes.clone();
                tokio::spawn(route_incoming(incoming, routes));
            }
            trace!("accept loop finished");
        });

        Arc::new(Self {
            transport,
            server_quic,
            routes,
            keys: Arc::new(Mutex::new(HashMap::new())),
            accept_task,
            closed: AtomicBool::new(false),
        })
    }

    pub fn transport(&self) -> &Arc<RefcountedTransport> {
        &self.transport
    }

    /// Add a logical listener. Its ALPNs must not overlap any existing
    /// route on this address.
    pub fn add(
        self: &Arc<Self>,
        identity: TlsServerIdentity,
        local_addr: QuicAddr,
        on_close: Box<dyn FnOnce() + Send>,
    ) -> Result<Listener> {
        if identity.alpns.is_empty() {
            return Err(Error::Tls("listener requires at least one ALPN".into()));
        }
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&identity.key)
            .map_err(|e| Error::Tls(e.to_string()))?;
        let certified = Arc::new(CertifiedKey::new(identity.cert_chain, signing_key));

        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE_LEN);
        {
            let mut routes = self.routes.lock();
            let mut keys = self.keys.lock();
            for alpn in &identity.alpns {
                if routes.contains_key(alpn) {
                    return Err(Error::ListenerConflict(
                        String::from_utf8_lossy(alpn).into_owned(),
                    ));
                }
            }
            for alpn in &identity.alpns {
                routes.insert(alpn.clone(), tx.clone());
                keys.insert(alpn.clone(), certified.clone());
            }
        }
        if let Err(e) = self.reinstall_server_config() {
            self.drop_routes(&identity.alpns);
            return Err(e);
        }

        metrics::LISTENERS_ACTIVE.inc();
        debug!(local = %local_addr, alpns = identity.alpns.len(), "listener added");
        Ok(Listener {
            rx: tokio::sync::Mutex::new(rx),
            mux: self.clone(),
            alpns: identity.alpns,
            local_addr,
            on_close: Mutex::new(Some(on_close)),
        })
    }

    pub(crate) fn remove_routes(&self, alpns: &[Vec<u8>]) {
        self.drop_routes(alpns);
        // Remaining listeners keep accepting under the narrowed ALPN set.
        let _ = self.reinstall_server_config();
    }

    fn drop_routes(&self, alpns: &[Vec<u8>]) {
        let mut routes = self.routes.lock();
        let mut keys = self.keys.lock();
        for alpn in alpns {
            routes.remove(alpn);
            keys.remove(alpn);
        }
    }

    fn reinstall_server_config(&self) -> Result<()> {
        let alpns: Vec<Vec<u8>> = self.keys.lock().keys().cloned().collect();
        if alpns.is_empty() {
            return Ok(());
        }
        let resolver = Arc::new(AlpnCertResolver {
            keys: self.keys.clone(),
        });
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut tls = rustls::ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| Error::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        tls.alpn_protocols = alpns;
        self.transport
            .transport()
            .install_server_config(tls, &self.server_quic)
    }

    /// Stop accepting and return the transport borrow. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.accept_task.abort();
        let _ = self.transport.decrease_count();
    }
}

impl Drop for ListenerMux {
    fn drop(&mut self) {
        self.close();
    }
}

async fn route_incoming(
    incoming: quinn::Incoming,
    routes: Arc<Mutex<HashMap<Vec<u8>, mpsc::Sender<Connection>>>>,
) {
    let remote = incoming.remote_address();
    let connecting = match incoming.accept() {
        Ok(connecting) => connecting,
        Err(e) => {
            debug!(%remote, error = %e, "incoming connection rejected");
            return;
        }
    };
    let connection = match connecting.await {
        Ok(connection) => connection,
        Err(e) => {
            debug!(%remote, error = %e, "handshake failed");
            return;
        }
    };
    let connection = Connection::accepted(connection);
    let Some(alpn) = connection.alpn() else {
        connection.close(VarInt::from_u32(CLOSE_CODE_NO_LISTENER), b"no ALPN");
        return;
    };
    let tx = routes.lock().get(&alpn).cloned();
    match tx {
        Some(tx) => {
            metrics::CONNECTIONS_ACCEPTED_TOTAL.inc();
            if let Err(returned) = tx.send(connection).await {
                returned.0.close(
                    VarInt::from_u32(CLOSE_CODE_NO_LISTENER),
                    b"listener closed",
                );
            }
        }
        None => {
            metrics::CONNECTIONS_UNROUTED_TOTAL.inc();
            trace!(%remote, ?alpn, "no listener for negotiated protocol");
            connection.close(
                VarInt::from_u32(CLOSE_CODE_NO_LISTENER),
                b"no listener for protocol",
            );
        }
    }
}

/// A logical QUIC listener delivering connections that negotiated one of
/// its ALPNs.
pub struct Listener {
    rx: tokio::sync::Mutex<mpsc::Receiver<Connection>>,
    mux: Arc<ListenerMux>,
    alpns: Vec<Vec<u8>>,
    local_addr: QuicAddr,
    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl Listener {
    /// Wait for the next accepted connection.
    pub async fn accept(&self) -> Result<Connection> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ListenerClosed)
    }

    /// The resolved bound address of this listener.
    pub fn local_addr(&self) -> &QuicAddr {
        &self.local_addr
    }

    pub fn alpns(&self) -> &[Vec<u8>] {
        &self.alpns
    }

    /// Close the listener. The first close removes its ALPN routes and
    /// releases its share of the bound address; later calls are no-ops.
    pub fn close(&self) {
        let Some(on_close) = self.on_close.lock().take() else {
            return;
        };
        self.mux.remove_routes(&self.alpns);
        metrics::LISTENERS_ACTIVE.dec();
        on_close();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}
