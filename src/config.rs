//! QUIC endpoint configuration
//!
//! [`QuicConfig`] is the tunable template cloned into every listen and
//! dial; the manager keeps separate server and client templates. The two
//! key types are process-long secrets handed to the QUIC engine at
//! endpoint construction: the stateless-reset key keys the reset-token
//! HMAC, the token key seeds address-validation token generation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::{HandshakeTokenKey, HmacKey};
use quinn::{IdleTimeout, TransportConfig, VarInt};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tuning knobs applied to every connection of an endpoint.
///
/// Defaults favour many small concurrent streams over bulk throughput.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuicConfig {
    /// Connection idle timeout
    pub max_idle_timeout: Duration,
    /// Keep-alive interval; `None` disables keep-alives
    pub keep_alive_interval: Option<Duration>,
    /// Maximum concurrent bidirectional streams per connection
    pub max_concurrent_bidi_streams: u32,
    /// Per-stream receive window in bytes
    pub stream_receive_window: u32,
    /// Per-connection receive window in bytes
    pub connection_receive_window: u32,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            max_idle_timeout: Duration::from_secs(30),
            keep_alive_interval: Some(Duration::from_secs(10)),
            max_concurrent_bidi_streams: 256,
            stream_receive_window: 1024 * 1024,
            connection_receive_window: 8 * 1024 * 1024,
        }
    }
}

impl QuicConfig {
    pub(crate) fn build_transport(&self) -> Result<TransportConfig> {
        let mut transport = TransportConfig::default();
        let idle = IdleTimeout::try_from(self.max_idle_timeout)
            .map_err(|e| Error::Config(format!("idle timeout out of range: {e}")))?;
        transport.max_idle_timeout(Some(idle));
        transport.keep_alive_interval(self.keep_alive_interval);
        transport.max_concurrent_bidi_streams(VarInt::from_u32(self.max_concurrent_bidi_streams));
        transport.stream_receive_window(VarInt::from_u32(self.stream_receive_window));
        transport.receive_window(VarInt::from_u32(self.connection_receive_window));
        Ok(transport)
    }
}

/// Process-long key for stateless reset tokens.
#[derive(Clone)]
pub struct StatelessResetKey([u8; 32]);

/// Process-long key for address-validation token generation.
#[derive(Clone)]
pub struct TokenGeneratorKey([u8; 32]);

macro_rules! secret_key_impl {
    ($name:ident) => {
        impl $name {
            /// Generate a fresh random key.
            pub fn generate() -> Self {
                let mut bytes = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                Self(bytes)
            }

            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub(crate) fn as_bytes(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // Never print key material.
                write!(f, concat!(stringify!($name), "(..)"))
            }
        }
    };
}

secret_key_impl!(StatelessResetKey);
secret_key_impl!(TokenGeneratorKey);

impl StatelessResetKey {
    /// The HMAC key the QUIC engine uses to derive reset tokens.
    pub(crate) fn hmac_key(&self) -> Arc<dyn HmacKey> {
        Arc::new(ring::hmac::Key::new(ring::hmac::HMAC_SHA256, &self.0))
    }
}

impl TokenGeneratorKey {
    /// The handshake-token key handed to the QUIC engine's server side.
    pub(crate) fn handshake_token_key(&self) -> Arc<dyn HandshakeTokenKey> {
        let prk = ring::hkdf::Salt::new(ring::hkdf::HKDF_SHA256, &[]).extract(&self.0);
        Arc::new(prk)
    }
}
