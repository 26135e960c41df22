//! Tunnel backend abstraction
//!
//! A backend is one tunnel-protocol implementation (handshake, key
//! exchange, crypto) living outside this crate. The router only needs
//! the raw send/recv primitive, lifecycle control, and the asynchronous
//! reports backends emit after connecting (assigned address, subnet,
//! DNS). Adding a protocol means adding a variant and a backend
//! implementation, not branching logic throughout the router.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use super::buffer::PacketBuffer;
use crate::config::{ServerCandidate, TunnelConfig};
use crate::error::EndpointError;

/// Tunnel protocol kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// OpenVPN-style backend
    OpenVpn,
    /// WireGuard-style backend
    WireGuard,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenVpn => write!(f, "openvpn"),
            Self::WireGuard => write!(f, "wireguard"),
        }
    }
}

/// Backend-reported connection state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendState {
    /// Not yet asked to connect
    Idle,
    /// Handshake in progress
    Connecting,
    /// Tunnel is up and passing traffic
    Connected,
    /// Transport-level failure; the endpoint decides whether to reconnect
    Failed(String),
    /// Torn down, will not recover
    Stopped,
}

/// Address, subnet, and DNS assignment reported by a backend after
/// connecting (drives the subnet allocator)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelAssignment {
    /// Local tunnel address assigned by the remote server
    pub address: IpAddr,
    /// Prefix length of the assigned subnet
    pub prefix: u8,
    /// DNS servers pushed by the remote server
    pub dns_servers: Vec<IpAddr>,
}

/// Per-packet send failures
///
/// Small and cloneable so the hot path can branch on them without
/// allocation beyond the `BackendRejected` reason.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// Tunnel not yet connected; the caller should buffer, not drop
    #[error("Tunnel is not ready")]
    NotReady,

    /// Tunnel torn down; the caller should drop and may trigger reconnect
    #[error("Tunnel is disconnected")]
    Disconnected,

    /// Payload violates the backend's framing or size constraints
    #[error("Backend rejected payload: {reason}")]
    BackendRejected { reason: String },
}

impl SendError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::NotReady | Self::Disconnected => true,
            Self::BackendRejected { .. } => false,
        }
    }

    /// Create a rejection error
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::BackendRejected {
            reason: reason.into(),
        }
    }
}

/// The raw primitive one tunnel-protocol implementation exposes.
///
/// Backends run their own I/O; `recv` resolves as decrypted inbound
/// packets arrive and returns `None` only on teardown. Every
/// [`PacketBuffer`] passed to `send` satisfies the headroom/tailroom
/// contract — backends may extend it in place without reallocating.
#[async_trait]
pub trait TunnelBackend: Send + Sync {
    /// Protocol kind of this backend
    fn protocol(&self) -> ProtocolKind;

    /// Establish the tunnel (handshake, key exchange).
    ///
    /// # Errors
    ///
    /// Returns `EndpointError::ConnectFailed` on handshake failure.
    async fn connect(&self) -> Result<(), EndpointError>;

    /// Tear the tunnel down. Idempotent; causes `recv` to return `None`.
    async fn disconnect(&self);

    /// Encrypt and transmit one packet.
    ///
    /// # Errors
    ///
    /// Returns a [`SendError`] kind the router maps to buffer/drop/reconnect.
    async fn send(&self, packet: PacketBuffer) -> Result<(), SendError>;

    /// Receive the next decrypted inbound packet.
    ///
    /// Not restartable: after it returns `None` the tunnel is gone.
    async fn recv(&self) -> Option<Bytes>;

    /// Subscribe to backend state transitions
    fn state(&self) -> watch::Receiver<BackendState>;

    /// Subscribe to address/subnet/DNS reports (`None` until assigned)
    fn assignment(&self) -> watch::Receiver<Option<TunnelAssignment>>;
}

/// Creates backends for tunnels the orchestrator establishes on demand.
///
/// The factory is host-provided: it wires protocol implementations,
/// credentials, and transport sockets together outside this crate.
pub trait BackendFactory: Send + Sync {
    /// Create a backend for `tunnel` pointed at the selected `server`
    fn create(&self, tunnel: &TunnelConfig, server: &ServerCandidate) -> Arc<dyn TunnelBackend>;
}
