//! Per-family transport reuse pool
//!
//! Each IP family has one pool tracking the transports currently serving
//! listeners (indexed by local port) and the transports created solely for
//! outbound dials. Listen requests reuse an exact address match or bind a
//! fresh socket; dial requests walk a fixed preference order over both
//! registries. All pool state sits behind one mutex with short critical
//! sections; binding happens outside the lock with a post-bind recheck.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::addr::Family;
use crate::binder::SocketBinder;
use crate::error::{Error, Result};
use crate::source_ip::SourceIpSelector;
use crate::transport::{Association, EndpointFactory, RefcountedTransport};

pub(crate) struct ReusePool {
    family: Family,
    binder: Arc<dyn SocketBinder>,
    selector: Arc<dyn SourceIpSelector>,
    factory: Arc<EndpointFactory>,
    inner: Arc<Mutex<PoolInner>>,
}

#[derive(Default)]
struct PoolInner {
    /// Transports currently serving listeners, by local port.
    listeners: HashMap<u16, Vec<Arc<RefcountedTransport>>>,
    /// Transports created for outbound dials, eligible for further reuse.
    dialers: Vec<Arc<RefcountedTransport>>,
    closed: bool,
}

impl ReusePool {
    pub fn new(
        family: Family,
        binder: Arc<dyn SocketBinder>,
        selector: Arc<dyn SourceIpSelector>,
        factory: Arc<EndpointFactory>,
    ) -> Self {
        Self {
            family,
            binder,
            selector,
            factory,
            inner: Arc::new(Mutex::new(PoolInner::default())),
        }
    }

    /// Find or create the transport serving `local`.
    ///
    /// An existing transport bound to exactly `local` is shared. A second
    /// unicast IP on a port that already has a listener is refused: the
    /// sharing contract is one socket per port.
    pub fn transport_for_listen(&self, local: SocketAddr) -> Result<Arc<RefcountedTransport>> {
        self.check_family(&local)?;
        {
            let inner = self.inner.lock();
            if inner.closed {
                return Err(Error::PoolClosed);
            }
            if local.port() != 0 {
                if let Some(on_port) = inner.listeners.get(&local.port()) {
                    for transport in on_port {
                        if transport.bound_local().ip() == local.ip()
                            && transport.claim_or_increase().is_ok()
                        {
                            trace!(%local, "reusing listen transport");
                            return Ok(transport.clone());
                        }
                    }
                    if on_port.iter().any(|t| t.bound_local().ip() != local.ip()) {
                        return Err(Error::AddressInUse(local));
                    }
                }
            }
        }

        let transport = self.bind_transport(local)?;
        let mut inner = self.inner.lock();
        if inner.closed {
            drop(inner);
            let _ = transport.decrease_count();
            return Err(Error::PoolClosed);
        }
        self.register_release(&transport);
        let port = transport.bound_local().port();
        inner.listeners.entry(port).or_default().push(transport.clone());
        debug!(local = %transport.bound_local(), "new listen transport");
        Ok(transport)
    }

    /// Pick the transport to dial `remote` from.
    ///
    /// Preference order: a listener transport carrying `association`, any
    /// listener transport (exact source IP, then wildcard, then any), any
    /// dialer transport with the same IP preference, then a fresh
    /// ephemeral wildcard socket.
    pub fn transport_for_dial(
        &self,
        association: Option<Association>,
        remote: SocketAddr,
    ) -> Result<Arc<RefcountedTransport>> {
        self.check_family(&remote)?;
        let source_ip = self.selector.preferred_source_ip(remote).ok();
        {
            let inner = self.inner.lock();
            if inner.closed {
                return Err(Error::PoolClosed);
            }
            if let Some(tag) = association {
                for transport in inner.listeners.values().flatten() {
                    if transport.has_association(tag) && transport.increase_count().is_ok() {
                        trace!(local = %transport.bound_local(), "dial reusing associated listener");
                        return Ok(transport.clone());
                    }
                }
            }
            if let Some(transport) = pick(inner.listeners.values().flatten(), source_ip) {
                trace!(local = %transport.bound_local(), "dial reusing listener transport");
                return Ok(transport);
            }
            if let Some(transport) = pick(inner.dialers.iter(), source_ip) {
                trace!(local = %transport.bound_local(), "dial reusing dialer transport");
                return Ok(transport);
            }
        }

        let transport = self.bind_transport(self.family.wildcard())?;
        let mut inner = self.inner.lock();
        if inner.closed {
            drop(inner);
            let _ = transport.decrease_count();
            return Err(Error::PoolClosed);
        }
        self.register_release(&transport);
        inner.dialers.push(transport.clone());
        debug!(local = %transport.bound_local(), "new dial transport");
        Ok(transport)
    }

    /// Register an externally bound, borrowed transport as a listener
    /// transport. Fails if the exact `(port, ip)` is already occupied.
    pub fn add_borrowed_transport(&self, transport: Arc<RefcountedTransport>) -> Result<()> {
        let local = transport.bound_local();
        self.check_family(&local)?;
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::PoolClosed);
        }
        if let Some(on_port) = inner.listeners.get(&local.port()) {
            if on_port.iter().any(|t| t.bound_local().ip() == local.ip()) {
                return Err(Error::AddressInUse(local));
            }
        }
        self.register_release(&transport);
        inner
            .listeners
            .entry(local.port())
            .or_default()
            .push(transport);
        debug!(%local, "registered borrowed transport");
        Ok(())
    }

    /// Check that `transport` is still registered. Guards against tagging
    /// a transport that raced with its own release.
    pub fn assert_transport_exists(&self, transport: &Arc<RefcountedTransport>) -> Result<()> {
        let inner = self.inner.lock();
        let registered = inner
            .listeners
            .values()
            .flatten()
            .chain(inner.dialers.iter())
            .any(|t| Arc::ptr_eq(t, transport));
        if registered {
            Ok(())
        } else {
            Err(Error::ReuseAssertionFailed)
        }
    }

    /// Refuse all further operations. Live transports are not torn down;
    /// they fall out as their owners release them.
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }

    fn check_family(&self, addr: &SocketAddr) -> Result<()> {
        if self.family.contains(addr) {
            Ok(())
        } else {
            Err(Error::InvalidFamily(format!(
                "{} address used with the {} pool",
                Family::of_addr(addr).name(),
                self.family.name()
            )))
        }
    }

    fn bind_transport(&self, local: SocketAddr) -> Result<Arc<RefcountedTransport>> {
        let socket = self.binder.bind(self.family, local).map_err(Error::Bind)?;
        let transport = self.factory.build(socket)?;
        Ok(RefcountedTransport::new_owned(transport, true))
    }

    /// The release hook unregisters the transport; the transport itself
    /// holds no pool back-pointer.
    fn register_release(&self, transport: &Arc<RefcountedTransport>) {
        let pool = Arc::downgrade(&self.inner);
        let target = Arc::downgrade(transport);
        transport.set_release_hook(Box::new(move || {
            let (Some(pool), Some(target)) = (pool.upgrade(), target.upgrade()) else {
                return;
            };
            let mut inner = pool.lock();
            let port = target.bound_local().port();
            if let Some(on_port) = inner.listeners.get_mut(&port) {
                on_port.retain(|t| !Arc::ptr_eq(t, &target));
                if on_port.is_empty() {
                    inner.listeners.remove(&port);
                }
            }
            inner.dialers.retain(|t| !Arc::ptr_eq(t, &target));
        }));
    }
}

fn pick<'a, I>(candidates: I, source_ip: Option<IpAddr>) -> Option<Arc<RefcountedTransport>>
where
    I: Iterator<Item = &'a Arc<RefcountedTransport>> + Clone,
{
    if let Some(ip) = source_ip {
        for transport in candidates.clone() {
            if transport.bound_local().ip() == ip && transport.increase_count().is_ok() {
                return Some(transport.clone());
            }
        }
    }
    for transport in candidates.clone() {
        if transport.bound_local().ip().is_unspecified() && transport.increase_count().is_ok() {
            return Some(transport.clone());
        }
    }
    for transport in candidates {
        if transport.increase_count().is_ok() {
            return Some(transport.clone());
        }
    }
    None
}
