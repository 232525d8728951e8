//! Quicmux - QUIC transport reuse and socket sharing
//!
//! # Architecture
//!
//! ```text
//! listen / dial / share
//!         ↓
//! ConnManager            (listener table, config templates, verifier)
//!         ↓
//! ReusePool (v4) ReusePool (v6)   (per-family transport selection)
//!         ↓
//! RefcountedTransport    (one UDP socket + one QUIC endpoint, counted)
//!         ↓
//! MuxSocket              (QUIC vs non-QUIC datagram demultiplexing)
//! ```
//!
//! ## Core Principles
//!
//! - One UDP socket per bound address, shared by every listener, dialer,
//!   and non-QUIC consumer that can use it
//! - Every user of a transport holds one counted borrow; the last release
//!   closes the socket (owned) or signals the outside owner (borrowed)
//! - Listeners on one address are told apart by ALPN
//! - Dials prefer transports tagged with their association, then listen
//!   sockets on the routed source IP
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── addr         # Multiaddress parsing, families, QUIC versions
//! ├── binder       # Socket binding (swappable)
//! ├── source_ip    # Routing-table source-IP selection (swappable)
//! ├── socket       # Shared-socket datagram demultiplexer
//! ├── transport    # QUIC endpoint wrapper + reference counting
//! ├── reuse        # Per-family reuse pools
//! ├── mux          # ALPN listener multiplexer
//! └── manager      # ConnManager façade
//! ```

// Core types
pub mod addr;
pub mod config;
pub mod error;

// Collaborator seams
pub mod binder;
pub mod source_ip;

// Transport machinery
mod reuse;
mod socket;
pub mod transport;

// Listener multiplexing and the façade
pub mod manager;
pub mod mux;

// Supporting modules
pub mod metrics;

// Re-exports for convenience
pub use addr::{Family, QuicAddr, QuicVersion};
pub use config::{QuicConfig, StatelessResetKey, TokenGeneratorKey};
pub use error::{Error, Result};
pub use manager::{ConnManager, ConnManagerBuilder, SharedPacketConn};
pub use mux::{Listener, TlsServerIdentity};
pub use transport::{Association, Connection, QuicTransport};
