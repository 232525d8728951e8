//! Prometheus metrics
//!
//! Counters and gauges are process-global and always updated; enabling
//! metrics on the manager only controls registration into the
//! caller-supplied registry.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, Registry};

lazy_static! {
    // === Dial metrics ===

    /// Total outbound dials attempted
    pub static ref DIALS_TOTAL: IntCounter = IntCounter::new(
        "quicmux_dials_total",
        "Total number of outbound QUIC dials attempted"
    ).unwrap();

    /// Failed outbound dials
    pub static ref DIAL_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "quicmux_dial_failures_total",
        "Total number of outbound QUIC dials that failed"
    ).unwrap();

    // === Listener metrics ===

    /// Currently open logical listeners
    pub static ref LISTENERS_ACTIVE: IntGauge = IntGauge::new(
        "quicmux_listeners_active",
        "Number of currently open logical listeners"
    ).unwrap();

    /// Inbound connections accepted and routed to a listener
    pub static ref CONNECTIONS_ACCEPTED_TOTAL: IntCounter = IntCounter::new(
        "quicmux_connections_accepted_total",
        "Total inbound connections accepted and routed by ALPN"
    ).unwrap();

    /// Inbound handshakes rejected because no listener owned the ALPN
    pub static ref CONNECTIONS_UNROUTED_TOTAL: IntCounter = IntCounter::new(
        "quicmux_connections_unrouted_total",
        "Total inbound connections closed for lack of a matching ALPN listener"
    ).unwrap();

    /// Address-validation retries sent to unverified sources
    pub static ref ADDRESS_RETRIES_TOTAL: IntCounter = IntCounter::new(
        "quicmux_address_retries_total",
        "Total incoming connection attempts challenged with an address-validation retry"
    ).unwrap();

    // === Transport metrics ===

    /// Live refcounted transports (sockets) across both families
    pub static ref TRANSPORTS_ACTIVE: IntGauge = IntGauge::new(
        "quicmux_transports_active",
        "Number of live reference-counted transports"
    ).unwrap();
}

/// Register all metrics with the given registry
pub fn register_metrics(registry: &Registry) {
    registry.register(Box::new(DIALS_TOTAL.clone())).ok();
    registry.register(Box::new(DIAL_FAILURES_TOTAL.clone())).ok();
    registry.register(Box::new(LISTENERS_ACTIVE.clone())).ok();
    registry
        .register(Box::new(CONNECTIONS_ACCEPTED_TOTAL.clone()))
        .ok();
    registry
        .register(Box::new(CONNECTIONS_UNROUTED_TOTAL.clone()))
        .ok();
    registry
        .register(Box::new(ADDRESS_RETRIES_TOTAL.clone()))
        .ok();
    registry.register(Box::new(TRANSPORTS_ACTIVE.clone())).ok();
}
