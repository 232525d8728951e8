//! Error types for quicmux

use std::net::SocketAddr;

use thiserror::Error;

/// Main error type for quicmux
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid network family: {0}")]
    InvalidFamily(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("address {0} already in use by a reused transport bound to a different IP")]
    AddressInUse(SocketAddr),

    #[error("socket bind failed: {0}")]
    Bind(std::io::Error),

    #[error("unknown QUIC version: {0}")]
    UnknownVersion(String),

    #[error("transport closed")]
    TransportClosed,

    #[error("reuse pool closed")]
    PoolClosed,

    #[error("listener closed")]
    ListenerClosed,

    #[error("ALPN {0} already claimed by another listener on this address")]
    ListenerConflict(String),

    #[error("address not shareable: {0}")]
    NotShareable(&'static str),

    #[error("transport is no longer registered in the reuse pool")]
    ReuseAssertionFailed,

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("dial failed: {0}")]
    Dial(#[from] quinn::ConnectError),

    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),
}

/// Result type alias for quicmux
pub type Result<T> = std::result::Result<T, Error>;
