//! External collaborator interfaces
//!
//! The router core is an in-process engine; the host service provides the
//! virtual network interface, the direct-internet path, and the
//! flow-owner identity resolver. This module defines those seams as
//! traits so the core can be driven by real OS primitives in production
//! and by in-memory fakes in tests.

use std::net::IpAddr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::FlowError;
use crate::flow::FlowKey;

/// A full interface (re)configuration request.
///
/// Emitted when the set of primary tunnels changes; the host applies it
/// as one atomic reconfigure, not incremental adds. Secondary tunnels
/// sharing a subnet are intentionally absent — they are routed purely by
/// flow tracking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceUpdate {
    /// Addresses to expose on the interface, one per subnet
    pub addresses: Vec<(IpAddr, u8)>,

    /// DNS servers reported by the primary tunnels
    pub dns_servers: Vec<IpAddr>,
}

/// The host-provided local virtual network interface.
///
/// `read_packet` is consumed by exactly one sequential reader;
/// `write_packet` calls are serialized by the router's single-writer
/// path, so implementations need not be re-entrant.
#[async_trait]
pub trait VirtualInterface: Send + Sync {
    /// Read the next outbound packet from the interface.
    ///
    /// Returns `None` when the interface has been torn down.
    async fn read_packet(&self) -> Option<Bytes>;

    /// Write one inbound packet back to the interface.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the interface rejects the write.
    async fn write_packet(&self, packet: Bytes) -> std::io::Result<()>;

    /// Apply a new address/DNS configuration to the interface.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if reconfiguration fails.
    async fn configure(&self, update: InterfaceUpdate) -> std::io::Result<()>;
}

/// The host-provided direct-internet path (outside any tunnel).
///
/// Used for applications whose rule says "direct", for unmatched
/// applications when policy allows, and for JIT fallback after an
/// establishment failure.
#[async_trait]
pub trait DirectPath: Send + Sync {
    /// Send one packet outside all tunnels.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the packet cannot be injected.
    async fn send(&self, packet: Bytes) -> std::io::Result<()>;
}

/// Resolves the owning application of a flow.
///
/// Called at most once per flow, from the interface-reader path, so
/// implementations should be a fast kernel-table lookup (with their own
/// caching if needed). The result is pinned for the flow's lifetime by
/// the `ConnectionTracker`.
pub trait IdentityResolver: Send + Sync {
    /// Resolve the application that owns `key`.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::ClassificationUnavailable` when the owner
    /// cannot be determined; the affected packet is dropped, never
    /// routed blind.
    fn resolve(&self, key: &FlowKey) -> Result<String, FlowError>;
}
