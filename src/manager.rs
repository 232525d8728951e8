//! Connection manager
//!
//! The top-level façade over the reuse machinery. It owns one reuse pool
//! per IP family (unless reuseport is disabled), the table of listener
//! multiplexers keyed by bound address, the QUIC configuration templates,
//! and the composed source-address verifier. Listen requests share one
//! socket per bound address across ALPNs; dial requests reuse listen
//! sockets where the policy allows; non-QUIC consumers may share a listen
//! socket through a counted packet-conn wrapper.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tracing::debug;

use crate::addr::{Family, QuicAddr, QuicVersion};
use crate::binder::{SocketBinder, SystemBinder};
use crate::config::{QuicConfig, StatelessResetKey, TokenGeneratorKey};
use crate::error::{Error, Result};
use crate::metrics;
use crate::mux::{Listener, ListenerMux, SourceVerifier, TlsServerIdentity};
use crate::reuse::ReusePool;
use crate::source_ip::{RouteSelector, SourceIpSelector};
use crate::transport::{
    Association, Connection, EndpointFactory, QuicTransport, RefcountedTransport, TransportBorrow,
};

/// Sustained rate of new connections from unverified source addresses.
const UNVERIFIED_ADDRESS_RPS: u32 = 1000;
/// Burst budget for new connections from unverified source addresses.
const UNVERIFIED_ADDRESS_BURST: u32 = 1000;

/// Caller-supplied source-address verification hook.
pub type VerifySourceAddress = Arc<dyn Fn(SocketAddr) -> bool + Send + Sync>;

struct ListenerEntry {
    ref_count: usize,
    mux: Arc<ListenerMux>,
}

/// Builder for [`ConnManager`].
pub struct ConnManagerBuilder {
    reset_key: StatelessResetKey,
    token_key: TokenGeneratorKey,
    enable_reuseport: bool,
    binder: Arc<dyn SocketBinder>,
    selector: Arc<dyn SourceIpSelector>,
    registry: Option<prometheus::Registry>,
    verify_source_address: Option<VerifySourceAddress>,
    server_quic: QuicConfig,
    client_quic: QuicConfig,
}

impl ConnManagerBuilder {
    /// Bind every listen and dial to a fresh socket; no reuse pools.
    pub fn disable_reuseport(mut self) -> Self {
        self.enable_reuseport = false;
        self
    }

    /// Override how UDP sockets are opened.
    pub fn socket_binder(mut self, binder: Arc<dyn SocketBinder>) -> Self {
        self.binder = binder;
        self
    }

    /// Override how dial source IPs are selected.
    pub fn source_ip_selector(mut self, selector: Arc<dyn SourceIpSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Register the manager's metrics with `registry`.
    pub fn enable_metrics(mut self, registry: prometheus::Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Decide per incoming connection whether the source address must be
    /// verified. Composed with the built-in rate limiter: once the
    /// unverified-address budget is spent, every new arrival is
    /// challenged regardless of this hook.
    pub fn verify_source_address<F>(mut self, verify: F) -> Self
    where
        F: Fn(SocketAddr) -> bool + Send + Sync + 'static,
    {
        self.verify_source_address = Some(Arc::new(verify));
        self
    }

    /// Tuning template for listen endpoints.
    pub fn server_config(mut self, config: QuicConfig) -> Self {
        self.server_quic = config;
        self
    }

    /// Tuning template for dialed connections.
    pub fn client_config(mut self, config: QuicConfig) -> Self {
        self.client_quic = config;
        self
    }

    pub fn build(self) -> ConnManager {
        if let Some(registry) = &self.registry {
            metrics::register_metrics(registry);
        }

        let limiter = TokenBucket::new(UNVERIFIED_ADDRESS_BURST, UNVERIFIED_ADDRESS_RPS);
        let hook = self.verify_source_address;
        let verify: SourceVerifier = Arc::new(move |addr| {
            if limiter.allow() {
                match &hook {
                    Some(hook) => hook(addr),
                    None => false,
                }
            } else {
                // Budget spent: challenge everyone until tokens refill.
                true
            }
        });

        let factory = Arc::new(EndpointFactory::new(self.reset_key, self.token_key));
        let (reuse4, reuse6) = if self.enable_reuseport {
            let make = |family| {
                Arc::new(ReusePool::new(
                    family,
                    self.binder.clone(),
                    self.selector.clone(),
                    factory.clone(),
                ))
            };
            (Some(make(Family::Udp4)), Some(make(Family::Udp6)))
        } else {
            (None, None)
        };

        ConnManager {
            reuse4,
            reuse6,
            binder: self.binder,
            factory,
            server_quic: self.server_quic,
            client_quic: self.client_quic,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            verify,
        }
    }
}

/// Shares a small pool of UDP sockets between QUIC listeners, dialers,
/// and non-QUIC packet consumers.
///
/// All methods that create endpoints (listen, dial, lend) must run inside
/// a tokio runtime; the QUIC engine spawns its driver there.
pub struct ConnManager {
    reuse4: Option<Arc<ReusePool>>,
    reuse6: Option<Arc<ReusePool>>,
    binder: Arc<dyn SocketBinder>,
    factory: Arc<EndpointFactory>,
    server_quic: QuicConfig,
    client_quic: QuicConfig,
    listeners: Arc<Mutex<HashMap<String, ListenerEntry>>>,
    verify: SourceVerifier,
}

impl ConnManager {
    pub fn builder(
        reset_key: StatelessResetKey,
        token_key: TokenGeneratorKey,
    ) -> ConnManagerBuilder {
        ConnManagerBuilder {
            reset_key,
            token_key,
            enable_reuseport: true,
            binder: Arc::new(SystemBinder),
            selector: Arc::new(RouteSelector),
            registry: None,
            verify_source_address: None,
            server_quic: QuicConfig::default(),
            client_quic: QuicConfig::default(),
        }
    }

    /// Listen for QUIC connections negotiating one of the identity's
    /// ALPNs on `addr`. The same address can be shared by listeners with
    /// disjoint ALPN sets.
    pub fn listen(&self, addr: &QuicAddr, identity: TlsServerIdentity) -> Result<Listener> {
        self.listen_and_associate(None, addr, identity)
    }

    /// Like [`listen`](Self::listen), additionally tagging the underlying
    /// transport so later dials carrying the same association prefer it.
    pub fn listen_and_associate(
        &self,
        association: Option<Association>,
        addr: &QuicAddr,
        identity: TlsServerIdentity,
    ) -> Result<Listener> {
        addr.version()?;
        let family = addr.family();
        let local = addr.socket_addr();

        let mut table = self.listeners.lock();
        let mut key = local.to_string();
        if let Some(entry) = table.get(&key) {
            if let (Some(tag), Some(pool)) = (association, self.pool(family)) {
                pool.assert_transport_exists(entry.mux.transport())?;
                entry.mux.transport().associate(tag);
            }
        } else {
            let transport = self.transport_for_listen(association, family, local)?;
            key = transport.bound_local().to_string();
            let mux = ListenerMux::new(transport, self.server_quic.clone(), self.verify.clone());
            table.insert(
                key.clone(),
                ListenerEntry { ref_count: 0, mux },
            );
        }

        let mux = table.get(&key).expect("entry present").mux.clone();
        let bound = QuicAddr::new(mux.transport().bound_local());
        let on_close = {
            let table = self.listeners.clone();
            let key = key.clone();
            Box::new(move || Self::on_listener_closed(&table, &key))
        };
        match mux.add(identity, bound, on_close) {
            Ok(listener) => {
                table.get_mut(&key).expect("entry inserted above").ref_count += 1;
                Ok(listener)
            }
            Err(e) => {
                if table.get(&key).is_some_and(|entry| entry.ref_count == 0) {
                    let entry = table.remove(&key).expect("entry present");
                    entry.mux.close();
                }
                Err(e)
            }
        }
    }

    fn on_listener_closed(table: &Mutex<HashMap<String, ListenerEntry>>, key: &str) {
        let mut table = table.lock();
        let Some(entry) = table.get_mut(key) else {
            return;
        };
        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            let entry = table.remove(key).expect("entry present");
            debug!(%key, "last listener closed, releasing bound address");
            entry.mux.close();
        }
    }

    /// Dial `addr`, reusing a pooled transport where the policy allows.
    pub async fn dial(&self, addr: &QuicAddr, tls: rustls::ClientConfig) -> Result<Connection> {
        self.dial_inner(None, addr, tls).await
    }

    /// Dial `addr`, preferring the transport previously tagged with
    /// `association` by [`listen_and_associate`](Self::listen_and_associate).
    pub async fn dial_with_association(
        &self,
        association: Association,
        addr: &QuicAddr,
        tls: rustls::ClientConfig,
    ) -> Result<Connection> {
        self.dial_inner(Some(association), addr, tls).await
    }

    async fn dial_inner(
        &self,
        association: Option<Association>,
        addr: &QuicAddr,
        tls: rustls::ClientConfig,
    ) -> Result<Connection> {
        // Version gate runs before any socket is touched.
        addr.version()?;
        let remote = addr.socket_addr();
        let transport = self.transport_for_dial(association, addr.family(), remote)?;
        // Held as a guard so error and cancellation both return the borrow.
        let borrow = TransportBorrow::new(transport.clone());

        metrics::DIALS_TOTAL.inc();
        match transport
            .transport()
            .dial(remote, tls, &self.client_quic)
            .await
        {
            Ok(connection) => Ok(Connection::dialed(connection, borrow)),
            Err(e) => {
                metrics::DIAL_FAILURES_TOTAL.inc();
                drop(borrow);
                Err(e)
            }
        }
    }

    /// Select (and borrow) the transport a dial to `remote` would use.
    pub fn transport_for_dial(
        &self,
        association: Option<Association>,
        family: Family,
        remote: SocketAddr,
    ) -> Result<Arc<RefcountedTransport>> {
        if !family.contains(&remote) {
            return Err(Error::InvalidFamily(format!(
                "remote {remote} does not belong to {family}"
            )));
        }
        match self.pool(family) {
            Some(pool) => pool.transport_for_dial(association, remote),
            None => {
                let socket = self
                    .binder
                    .bind(family, family.wildcard())
                    .map_err(Error::Bind)?;
                let transport = self.factory.build(socket)?;
                Ok(RefcountedTransport::new_owned(transport, false))
            }
        }
    }

    /// Lend an externally owned transport for listening at its bound
    /// address. The returned signal fires when the manager is done with
    /// it; only then may the owner close the underlying socket.
    pub fn lend_transport(
        &self,
        family: Family,
        transport: Arc<QuicTransport>,
    ) -> Result<oneshot::Receiver<()>> {
        let pool = self
            .pool(family)
            .ok_or(Error::NotShareable("reuseport is disabled"))?;
        if !family.contains(&transport.local_addr()) {
            return Err(Error::InvalidFamily(format!(
                "transport bound to {} lent to the {} pool",
                transport.local_addr(),
                family
            )));
        }
        let (borrowed, done) = RefcountedTransport::new_borrowed(transport);
        if let Err(e) = pool.add_borrowed_transport(borrowed.clone()) {
            let _ = borrowed.decrease_count();
            return Err(e);
        }
        Ok(done)
    }

    /// Share the non-QUIC side of an existing QUIC listener's socket.
    pub fn shared_non_quic_packet_conn(&self, local: SocketAddr) -> Result<SharedPacketConn> {
        let table = self.listeners.lock();
        let entry = table.get(&local.to_string()).ok_or(Error::NotShareable(
            "no QUIC listener on this address; the QUIC listener must start first",
        ))?;
        let transport = entry.mux.transport().clone();
        if !transport.is_pooled() {
            return Err(Error::NotShareable(
                "listener transport is not shared; reuseport must be enabled",
            ));
        }
        transport.increase_count()?;
        Ok(SharedPacketConn::new(transport))
    }

    /// The QUIC versions this manager speaks.
    pub fn supported_versions(&self) -> &'static [QuicVersion] {
        &[QuicVersion::V1]
    }

    /// The tuning template applied to dialed connections.
    pub fn client_quic_config(&self) -> &QuicConfig {
        &self.client_quic
    }

    /// Close both reuse pools. Listener and dialer teardown remains the
    /// owners' responsibility.
    pub fn close(&self) {
        if let Some(pool) = &self.reuse6 {
            pool.close();
        }
        if let Some(pool) = &self.reuse4 {
            pool.close();
        }
    }

    fn pool(&self, family: Family) -> Option<&Arc<ReusePool>> {
        match family {
            Family::Udp4 => self.reuse4.as_ref(),
            Family::Udp6 => self.reuse6.as_ref(),
        }
    }

    fn transport_for_listen(
        &self,
        association: Option<Association>,
        family: Family,
        local: SocketAddr,
    ) -> Result<Arc<RefcountedTransport>> {
        let transport = match self.pool(family) {
            Some(pool) => pool.transport_for_listen(local)?,
            None => {
                let socket = self.binder.bind(family, local).map_err(Error::Bind)?;
                RefcountedTransport::new_owned(self.factory.build(socket)?, false)
            }
        };
        if let Some(tag) = association {
            transport.associate(tag);
        }
        Ok(transport)
    }
}

/// A packet socket sharing a QUIC listener's address.
///
/// Reads deliver only the datagrams the QUIC engine did not claim; writes
/// go out the shared socket. Closing returns the borrow on the underlying
/// transport and cancels pending reads.
pub struct SharedPacketConn {
    transport: Arc<RefcountedTransport>,
    local_addr: SocketAddr,
    closed: AtomicBool,
    cancel: Notify,
}

impl std::fmt::Debug for SharedPacketConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPacketConn")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl SharedPacketConn {
    fn new(transport: Arc<RefcountedTransport>) -> Self {
        let local_addr = transport.bound_local();
        Self {
            transport,
            local_addr,
            closed: AtomicBool::new(false),
            cancel: Notify::new(),
        }
    }

    /// Same local address as the QUIC listener this socket shares with.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        use std::sync::atomic::Ordering;
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportClosed);
        }
        tokio::select! {
            _ = self.cancel.notified() => Err(Error::TransportClosed),
            result = self.transport.transport().read_non_quic_packet(buf) => result,
        }
    }

    pub async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize> {
        use std::sync::atomic::Ordering;
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportClosed);
        }
        self.transport.transport().write_to(buf, addr).await
    }

    /// Release the borrow and cancel pending reads. Idempotent.
    pub fn close(&self) {
        use std::sync::atomic::Ordering;
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.cancel.notify_waiters();
            let _ = self.transport.decrease_count();
        }
    }
}

impl Drop for SharedPacketConn {
    fn drop(&mut self) {
        self.close();
    }
}

/// Token bucket limiting how many unverified source addresses may start
/// handshakes per second.
struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_sec: f64::from(refill_per_sec),
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
            }),
        }
    }

    fn allow(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> ConnManager {
        ConnManager::builder(StatelessResetKey::generate(), TokenGeneratorKey::generate()).build()
    }

    fn identity(alpns: &[&str]) -> TlsServerIdentity {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        TlsServerIdentity {
            cert_chain: vec![cert.cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der())),
            alpns: alpns.iter().map(|a| a.as_bytes().to_vec()).collect(),
        }
    }

    fn maddr(s: &str) -> QuicAddr {
        s.parse().unwrap()
    }

    #[derive(Debug, Default)]
    struct CountingBinder(AtomicUsize);

    impl CountingBinder {
        fn binds(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl SocketBinder for CountingBinder {
        fn bind(&self, family: Family, addr: SocketAddr) -> std::io::Result<std::net::UdpSocket> {
            self.0.fetch_add(1, Ordering::SeqCst);
            SystemBinder.bind(family, addr)
        }
    }

    #[derive(Debug)]
    struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

    impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::pki_types::CertificateDer<'_>,
            _intermediates: &[rustls::pki_types::CertificateDer<'_>],
            _server_name: &rustls::pki_types::ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls::pki_types::UnixTime,
        ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error>
        {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &rustls::pki_types::CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
        {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &rustls::pki_types::CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
        {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    fn client_tls(alpn: &str) -> rustls::ClientConfig {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .unwrap()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
            .with_no_client_auth();
        config.alpn_protocols = vec![alpn.as_bytes().to_vec()];
        config
    }

    #[tokio::test]
    async fn listen_share_listen() {
        let manager = manager();
        let first = manager
            .listen(&maddr("/ip4/127.0.0.1/udp/0/quic-v1"), identity(&["proto-a"]))
            .unwrap();
        let port = first.local_addr().socket_addr().port();
        assert_ne!(port, 0);

        let second = manager
            .listen(
                &maddr(&format!("/ip4/127.0.0.1/udp/{port}/quic-v1")),
                identity(&["proto-b"]),
            )
            .unwrap();
        assert_eq!(first.local_addr(), second.local_addr());

        let table = manager.listeners.lock();
        assert_eq!(table.len(), 1);
        assert_eq!(table.values().next().unwrap().ref_count, 2);
    }

    #[tokio::test]
    async fn listen_then_dial_reuses_transport() {
        let binder = Arc::new(CountingBinder::default());
        let manager = ConnManager::builder(
            StatelessResetKey::generate(),
            TokenGeneratorKey::generate(),
        )
        .socket_binder(binder.clone())
        .build();

        let listener = manager
            .listen(&maddr("/ip4/127.0.0.1/udp/0/quic-v1"), identity(&["proto-a"]))
            .unwrap();
        let bound = listener.local_addr().socket_addr();
        assert_eq!(binder.binds(), 1);

        let transport = manager
            .transport_for_dial(None, Family::Udp4, "127.0.0.1:9001".parse().unwrap())
            .unwrap();
        assert_eq!(transport.bound_local(), bound);
        assert_eq!(binder.binds(), 1, "dial must not bind a new socket");
        transport.decrease_count().unwrap();
    }

    #[tokio::test]
    async fn dial_prefers_association_over_ip_preference() {
        let manager = manager();
        let tag_x = Association::new();
        let tag_y = Association::new();

        let first = manager
            .listen_and_associate(
                Some(tag_x),
                &maddr("/ip4/127.0.0.1/udp/0/quic-v1"),
                identity(&["proto-a"]),
            )
            .unwrap();
        let second = manager
            .listen_and_associate(
                Some(tag_y),
                &maddr("/ip4/127.0.0.1/udp/0/quic-v1"),
                identity(&["proto-a"]),
            )
            .unwrap();

        let picked = manager
            .transport_for_dial(Some(tag_y), Family::Udp4, "127.0.0.1:9001".parse().unwrap())
            .unwrap();
        assert_eq!(
            picked.bound_local().port(),
            second.local_addr().socket_addr().port()
        );
        assert_ne!(
            picked.bound_local().port(),
            first.local_addr().socket_addr().port()
        );
        picked.decrease_count().unwrap();
    }

    #[tokio::test]
    async fn association_on_existing_entry() {
        let manager = manager();
        let tag = Association::new();
        let first = manager
            .listen(&maddr("/ip4/127.0.0.1/udp/0/quic-v1"), identity(&["proto-a"]))
            .unwrap();
        let port = first.local_addr().socket_addr().port();

        // Second listen on the same entry tags the shared transport.
        let _second = manager
            .listen_and_associate(
                Some(tag),
                &maddr(&format!("/ip4/127.0.0.1/udp/{port}/quic-v1")),
                identity(&["proto-b"]),
            )
            .unwrap();
        let picked = manager
            .transport_for_dial(Some(tag), Family::Udp4, "127.0.0.1:9001".parse().unwrap())
            .unwrap();
        assert_eq!(picked.bound_local().port(), port);
        picked.decrease_count().unwrap();
    }

    #[tokio::test]
    async fn borrowed_transport_lifetime() {
        let manager = manager();
        let socket = SystemBinder
            .bind(Family::Udp4, "127.0.0.1:0".parse().unwrap())
            .unwrap();
        let external = manager.factory.build(socket).unwrap();
        let local = external.local_addr();

        let done = manager
            .lend_transport(Family::Udp4, external.clone())
            .unwrap();

        let listener = manager
            .listen(
                &maddr(&format!("/ip4/127.0.0.1/udp/{}/quic-v1", local.port())),
                identity(&["proto-a"]),
            )
            .unwrap();
        assert_eq!(listener.local_addr().socket_addr(), local);

        listener.close();
        done.await.expect("done signal fires after last release");

        // The same address can be lent again.
        manager
            .lend_transport(Family::Udp4, external)
            .unwrap();
    }

    #[tokio::test]
    async fn conflicting_listen_same_port_different_ip() {
        let manager = manager();
        let wildcard = manager
            .listen(&maddr("/ip4/0.0.0.0/udp/0/quic-v1"), identity(&["proto-a"]))
            .unwrap();
        let port = wildcard.local_addr().socket_addr().port();

        let err = manager
            .listen(
                &maddr(&format!("/ip4/127.0.0.1/udp/{port}/quic-v1")),
                identity(&["proto-b"]),
            )
            .unwrap_err();
        assert!(matches!(err, Error::AddressInUse(_)));
    }

    #[tokio::test]
    async fn unknown_version_binds_nothing() {
        let binder = Arc::new(CountingBinder::default());
        let manager = ConnManager::builder(
            StatelessResetKey::generate(),
            TokenGeneratorKey::generate(),
        )
        .socket_binder(binder.clone())
        .build();

        let addr = maddr("/ip4/1.2.3.4/udp/9000/quic-draft-29");
        let err = manager.dial(&addr, client_tls("proto-a")).await.unwrap_err();
        assert!(matches!(err, Error::UnknownVersion(tag) if tag == "quic-draft-29"));
        assert_eq!(binder.binds(), 0);

        let err = manager.listen(&addr, identity(&["proto-a"])).unwrap_err();
        assert!(matches!(err, Error::UnknownVersion(_)));
        assert_eq!(binder.binds(), 0);
    }

    #[tokio::test]
    async fn disabled_reuseport_binds_fresh_sockets() {
        let binder = Arc::new(CountingBinder::default());
        let manager = ConnManager::builder(
            StatelessResetKey::generate(),
            TokenGeneratorKey::generate(),
        )
        .disable_reuseport()
        .socket_binder(binder.clone())
        .build();

        let listener = manager
            .listen(&maddr("/ip4/127.0.0.1/udp/0/quic-v1"), identity(&["proto-a"]))
            .unwrap();
        let _listener2 = manager
            .listen(&maddr("/ip4/127.0.0.1/udp/0/quic-v1"), identity(&["proto-b"]))
            .unwrap();
        assert_eq!(binder.binds(), 2);

        let t1 = manager
            .transport_for_dial(None, Family::Udp4, "127.0.0.1:9001".parse().unwrap())
            .unwrap();
        let t2 = manager
            .transport_for_dial(None, Family::Udp4, "127.0.0.1:9001".parse().unwrap())
            .unwrap();
        assert_eq!(binder.binds(), 4, "each dial binds its own socket");
        assert!(!Arc::ptr_eq(&t1, &t2));

        // Non-QUIC sharing requires pooled transports.
        let err = manager
            .shared_non_quic_packet_conn(listener.local_addr().socket_addr())
            .unwrap_err();
        assert!(matches!(err, Error::NotShareable(_)));

        t1.decrease_count().unwrap();
        t2.decrease_count().unwrap();
    }

    #[tokio::test]
    async fn double_close_releases_entry_once() {
        let manager = manager();
        let listener = manager
            .listen(&maddr("/ip4/127.0.0.1/udp/0/quic-v1"), identity(&["proto-a"]))
            .unwrap();
        listener.close();
        listener.close();
        assert!(manager.listeners.lock().is_empty());

        // The address is free for a fresh listen.
        manager
            .listen(&maddr("/ip4/127.0.0.1/udp/0/quic-v1"), identity(&["proto-a"]))
            .unwrap();
    }

    #[tokio::test]
    async fn closed_manager_refuses_new_work() {
        let manager = manager();
        manager.close();
        assert!(matches!(
            manager.listen(&maddr("/ip4/127.0.0.1/udp/0/quic-v1"), identity(&["proto-a"])),
            Err(Error::PoolClosed)
        ));
        assert!(matches!(
            manager.transport_for_dial(None, Family::Udp4, "127.0.0.1:9001".parse().unwrap()),
            Err(Error::PoolClosed)
        ));
    }

    #[tokio::test]
    async fn shared_packet_conn_roundtrip() {
        let manager = manager();
        let listener = manager
            .listen(&maddr("/ip4/127.0.0.1/udp/0/quic-v1"), identity(&["proto-a"]))
            .unwrap();
        let bound = listener.local_addr().socket_addr();

        let shared = manager.shared_non_quic_packet_conn(bound).unwrap();
        assert_eq!(shared.local_addr(), bound);

        // A datagram without the QUIC fixed bit reaches the sharer.
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(&[0x00, 0x01, 0x02, 0x03], bound).await.unwrap();

        let mut buf = [0u8; 1500];
        let (len, from) = shared.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &[0x00, 0x01, 0x02, 0x03]);
        assert_eq!(from, peer.local_addr().unwrap());

        // Writes go out the shared socket from the listener's address.
        shared.send_to(b"pong", from).await.unwrap();
        let (len, from_shared) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"pong");
        assert_eq!(from_shared, bound);

        shared.close();
        assert!(matches!(
            shared.recv_from(&mut buf).await,
            Err(Error::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn verifier_requires_validation_once_depleted() {
        let manager = manager();
        let addr: SocketAddr = "192.0.2.1:1234".parse().unwrap();

        // Hook unset: no verification while tokens remain.
        for _ in 0..UNVERIFIED_ADDRESS_BURST {
            assert!(!(manager.verify)(addr));
        }
        // Budget spent: every new arrival is challenged.
        assert!((manager.verify)(addr));
    }

    #[tokio::test]
    async fn caller_hook_decides_while_tokens_remain() {
        let manager = ConnManager::builder(
            StatelessResetKey::generate(),
            TokenGeneratorKey::generate(),
        )
        .verify_source_address(|addr| addr.port() == 7)
        .build();

        assert!((manager.verify)("192.0.2.1:7".parse().unwrap()));
        assert!(!(manager.verify)("192.0.2.1:8".parse().unwrap()));
    }

    #[tokio::test]
    async fn end_to_end_dial_and_accept() {
        let manager = manager();
        let listener = manager
            .listen(&maddr("/ip4/127.0.0.1/udp/0/quic-v1"), identity(&["echo/1"]))
            .unwrap();
        let bound = QuicAddr::new(listener.local_addr().socket_addr());

        let dialed = tokio::spawn({
            let addr = bound.clone();
            let manager = ConnManager::builder(
                StatelessResetKey::generate(),
                TokenGeneratorKey::generate(),
            )
            .build();
            async move { manager.dial(&addr, client_tls("echo/1")).await }
        });

        let accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.alpn().as_deref(), Some("echo/1".as_bytes()));

        let outbound = dialed.await.unwrap().unwrap();
        assert_eq!(outbound.alpn().as_deref(), Some("echo/1".as_bytes()));
        assert_eq!(
            outbound.remote_address(),
            listener.local_addr().socket_addr()
        );
    }

    #[tokio::test]
    async fn mismatched_alpn_is_not_delivered() {
        let manager = manager();
        let listener = manager
            .listen(&maddr("/ip4/127.0.0.1/udp/0/quic-v1"), identity(&["proto-a"]))
            .unwrap();
        let bound = QuicAddr::new(listener.local_addr().socket_addr());

        let dialer = ConnManager::builder(
            StatelessResetKey::generate(),
            TokenGeneratorKey::generate(),
        )
        .build();
        // The server does not speak this ALPN, so the handshake fails.
        let result = dialer.dial(&bound, client_tls("proto-b")).await;
        assert!(result.is_err());
    }

    #[test]
    fn token_bucket_refills_over_time() {
        let bucket = TokenBucket::new(2, 1000);
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(!bucket.allow());
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(bucket.allow());
    }

    #[tokio::test]
    async fn supported_versions_lists_v1() {
        assert_eq!(manager().supported_versions(), &[QuicVersion::V1]);
    }
}
