//! Subnet conflict resolution
//!
//! The local virtual interface can expose only one address per subnet.
//! When two tunnels are independently assigned addresses in the same
//! subnet by their remote servers, the first to report becomes
//! **primary** for that subnet and its address is the one configured on
//! the interface; later tunnels become **secondary**. Secondary tunnels
//! stay fully routable because the router forwards by flow -> tunnel
//! binding, never by interface address.
//!
//! Interface reconfiguration is requested only when the set of primaries
//! changes: first assignment in a subnet, or promotion of a secondary
//! after the primary releases its address. The allocator never asks the
//! host to add a second address for a subnet that already has one, so
//! the host's double-add behavior is never exercised.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::endpoint::TunnelAssignment;
use crate::iface::{InterfaceUpdate, VirtualInterface};

/// Subnet allocation errors
#[derive(Debug, Error)]
pub enum SubnetError {
    /// Backend reported an address with an impossible prefix length
    #[error("Invalid prefix length {prefix} for address {addr}")]
    InvalidPrefix { addr: IpAddr, prefix: u8 },
}

/// Role of a tunnel within its subnet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubnetRole {
    /// This tunnel's address is reflected on the interface
    Primary,
    /// Routed purely by flow tracking; no interface address
    Secondary,
}

/// Outcome of an address report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressDecision {
    /// Role assigned to the reporting tunnel
    pub role: SubnetRole,
    /// Whether the host interface must be reconfigured
    pub interface_action_required: bool,
}

/// Outcome of an address release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseDecision {
    /// Secondary promoted to primary, if any
    pub promoted: Option<String>,
    /// Whether the host interface must be reconfigured
    pub interface_action_required: bool,
}

/// Snapshot of one subnet's assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetAssignment {
    /// The shared subnet
    pub subnet: IpNet,
    /// Primary tunnel tag
    pub primary: String,
    /// Secondary tunnel tags, oldest first
    pub secondaries: Vec<String>,
}

#[derive(Debug, Clone)]
struct TunnelAddress {
    addr: IpAddr,
    prefix: u8,
    subnet: IpNet,
    dns_servers: Vec<IpAddr>,
}

#[derive(Debug, Default)]
struct Inner {
    /// subnet -> (primary tag, secondary tags oldest-first)
    subnets: HashMap<IpNet, (String, Vec<String>)>,
    /// tunnel tag -> reported address
    tunnels: HashMap<String, TunnelAddress>,
}

/// Resolves address conflicts between tunnels sharing a subnet
///
/// State is derived from backend address reports and recomputed on every
/// assignment or release; it is not independently persisted.
pub struct SubnetAllocator {
    inner: Mutex<Inner>,
}

impl SubnetAllocator {
    /// Create an empty allocator
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Record an address assignment reported by a tunnel backend.
    ///
    /// Re-reporting by the same tunnel (reconnect with the same or a new
    /// address) first releases its previous assignment, then re-elects.
    ///
    /// # Errors
    ///
    /// Returns `SubnetError::InvalidPrefix` for impossible prefixes.
    pub fn on_address_assigned(
        &self,
        tunnel_tag: &str,
        addr: IpAddr,
        prefix: u8,
    ) -> Result<AddressDecision, SubnetError> {
        let subnet = IpNet::new(addr, prefix)
            .map_err(|_| SubnetError::InvalidPrefix { addr, prefix })?
            .trunc();

        let mut inner = self.inner.lock();

        // A reconnecting tunnel may report again; treat as re-assignment.
        // Releasing its old subnet can promote a secondary there, which
        // must be reflected even if the new role needs no action itself.
        let mut carried_action = false;
        let previous_dns = if inner.tunnels.contains_key(tunnel_tag) {
            let dns = inner
                .tunnels
                .get(tunnel_tag)
                .map(|t| t.dns_servers.clone())
                .unwrap_or_default();
            let release = Self::release_locked(&mut inner, tunnel_tag);
            carried_action = release.interface_action_required;
            dns
        } else {
            Vec::new()
        };

        inner.tunnels.insert(
            tunnel_tag.to_string(),
            TunnelAddress {
                addr,
                prefix,
                subnet,
                dns_servers: previous_dns,
            },
        );

        match inner.subnets.get_mut(&subnet) {
            None => {
                inner
                    .subnets
                    .insert(subnet, (tunnel_tag.to_string(), Vec::new()));
                info!(
                    "Tunnel {} is primary for {} (address {}/{})",
                    tunnel_tag, subnet, addr, prefix
                );
                Ok(AddressDecision {
                    role: SubnetRole::Primary,
                    interface_action_required: true,
                })
            }
            Some((primary, secondaries)) => {
                // Degraded-capability condition, not an error: the
                // interface keeps the primary's address and this tunnel
                // is reached via flow tracking only.
                warn!(
                    "Subnet conflict on {}: {} joins as secondary behind {}",
                    subnet, tunnel_tag, primary
                );
                secondaries.push(tunnel_tag.to_string());
                Ok(AddressDecision {
                    role: SubnetRole::Secondary,
                    interface_action_required: carried_action,
                })
            }
        }
    }

    /// Record DNS servers reported by a tunnel backend.
    ///
    /// DNS from primary tunnels is folded into the next interface update.
    pub fn on_dns_configured(&self, tunnel_tag: &str, dns_servers: Vec<IpAddr>) {
        let mut inner = self.inner.lock();
        if let Some(tunnel) = inner.tunnels.get_mut(tunnel_tag) {
            debug!("Tunnel {} reported DNS {:?}", tunnel_tag, dns_servers);
            tunnel.dns_servers = dns_servers;
        } else {
            // Reports arrive address-first; DNS without an address is
            // ignored until the backend re-reports with one.
            debug!("Tunnel {} reported DNS without an address", tunnel_tag);
        }
    }

    /// Release a tunnel's address (teardown or reconnect).
    ///
    /// Releasing a primary promotes the oldest secondary in the subnet,
    /// which requires an interface reconfiguration.
    pub fn on_address_released(&self, tunnel_tag: &str) -> ReleaseDecision {
        let mut inner = self.inner.lock();
        let decision = Self::release_locked(&mut inner, tunnel_tag);
        inner.tunnels.remove(tunnel_tag);
        decision
    }

    fn release_locked(inner: &mut Inner, tunnel_tag: &str) -> ReleaseDecision {
        let Some(subnet) = inner.tunnels.get(tunnel_tag).map(|t| t.subnet) else {
            return ReleaseDecision {
                promoted: None,
                interface_action_required: false,
            };
        };

        let Some((primary, secondaries)) = inner.subnets.get_mut(&subnet) else {
            return ReleaseDecision {
                promoted: None,
                interface_action_required: false,
            };
        };

        if primary == tunnel_tag {
            if secondaries.is_empty() {
                inner.subnets.remove(&subnet);
                info!("Subnet {} released (no tunnels remain)", subnet);
                ReleaseDecision {
                    promoted: None,
                    interface_action_required: true,
                }
            } else {
                let promoted = secondaries.remove(0);
                info!(
                    "Tunnel {} promoted to primary for {} after {} released",
                    promoted, subnet, tunnel_tag
                );
                *primary = promoted.clone();
                ReleaseDecision {
                    promoted: Some(promoted),
                    interface_action_required: true,
                }
            }
        } else {
            secondaries.retain(|t| t != tunnel_tag);
            ReleaseDecision {
                promoted: None,
                interface_action_required: false,
            }
        }
    }

    /// Snapshot of the assignment for the subnet containing `addr/prefix`
    #[must_use]
    pub fn assignment(&self, subnet: &IpNet) -> Option<SubnetAssignment> {
        let inner = self.inner.lock();
        inner
            .subnets
            .get(subnet)
            .map(|(primary, secondaries)| SubnetAssignment {
                subnet: *subnet,
                primary: primary.clone(),
                secondaries: secondaries.clone(),
            })
    }

    /// Current role of a tunnel, if it has reported an address
    #[must_use]
    pub fn role_of(&self, tunnel_tag: &str) -> Option<SubnetRole> {
        let inner = self.inner.lock();
        let subnet = inner.tunnels.get(tunnel_tag)?.subnet;
        let (primary, _) = inner.subnets.get(&subnet)?;
        Some(if primary == tunnel_tag {
            SubnetRole::Primary
        } else {
            SubnetRole::Secondary
        })
    }

    /// Compute the interface configuration reflecting all current
    /// primaries: one address per subnet plus their DNS servers.
    #[must_use]
    pub fn interface_update(&self) -> InterfaceUpdate {
        let inner = self.inner.lock();
        let mut update = InterfaceUpdate::default();

        // Deterministic order for the host and for tests
        let mut subnets: Vec<&IpNet> = inner.subnets.keys().collect();
        subnets.sort();

        for subnet in subnets {
            let (primary, _) = &inner.subnets[subnet];
            if let Some(tunnel) = inner.tunnels.get(primary) {
                update.addresses.push((tunnel.addr, tunnel.prefix));
                for dns in &tunnel.dns_servers {
                    if !update.dns_servers.contains(dns) {
                        update.dns_servers.push(*dns);
                    }
                }
            }
        }

        update
    }

    /// Number of subnets with at least one assigned tunnel
    #[must_use]
    pub fn subnet_count(&self) -> usize {
        self.inner.lock().subnets.len()
    }
}

impl Default for SubnetAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SubnetAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubnetAllocator")
            .field("subnets", &self.subnet_count())
            .finish()
    }
}

/// Watch a tunnel's address reports and keep the allocator and host
/// interface current.
///
/// The task ends when the backend drops its report channel (teardown).
/// Interface reconfiguration happens only when the allocator says the
/// primary set changed.
pub fn spawn_assignment_watcher(
    tunnel_tag: String,
    mut assignments: watch::Receiver<Option<TunnelAssignment>>,
    allocator: Arc<SubnetAllocator>,
    iface: Arc<dyn VirtualInterface>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let report = assignments.borrow_and_update().clone();
            if let Some(assignment) = report {
                match allocator.on_address_assigned(
                    &tunnel_tag,
                    assignment.address,
                    assignment.prefix,
                ) {
                    Ok(decision) => {
                        allocator.on_dns_configured(&tunnel_tag, assignment.dns_servers);
                        if decision.interface_action_required {
                            let update = allocator.interface_update();
                            if let Err(e) = iface.configure(update).await {
                                warn!(
                                    "Interface reconfiguration for {} failed: {}",
                                    tunnel_tag, e
                                );
                            }
                        }
                    }
                    Err(e) => warn!("Rejected address report from {}: {}", tunnel_tag, e),
                }
            }

            if assignments.changed().await.is_err() {
                break;
            }
        }
    })
}
