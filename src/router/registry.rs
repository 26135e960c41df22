//! Tunnel registry
//!
//! An arena of live tunnel endpoints keyed by stable tunnel tag. All
//! lookups go through this registry; there is no ambient global map of
//! sessions reachable from arbitrary call sites. Tags are chosen by the
//! caller ("region-code" style) and never reused concurrently — a tag is
//! free again only after its endpoint is removed.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::endpoint::{
    EndpointState, EndpointStatsSnapshot, ProtocolKind, TunnelAssignment, TunnelEndpoint,
};
use crate::error::EndpointError;

/// Metadata view of one registered tunnel
#[derive(Debug, Clone)]
pub struct TunnelRecord {
    /// Stable tunnel tag
    pub tag: String,
    /// Protocol kind
    pub protocol: ProtocolKind,
    /// Lifecycle state at snapshot time
    pub state: EndpointState,
    /// Latest backend address/subnet/DNS report, if any
    pub assignment: Option<TunnelAssignment>,
}

/// Registry of live tunnel endpoints
pub struct TunnelRegistry {
    tunnels: DashMap<String, Arc<TunnelEndpoint>>,
}

impl TunnelRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            tunnels: DashMap::new(),
        }
    }

    /// Register an endpoint under its tag.
    ///
    /// # Errors
    ///
    /// Returns `EndpointError::AlreadyExists` if the tag is taken; the
    /// caller keeps ownership of the rejected endpoint for cleanup.
    pub fn insert(&self, endpoint: Arc<TunnelEndpoint>) -> Result<(), EndpointError> {
        let tag = endpoint.tag().to_string();
        match self.tunnels.entry(tag.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(EndpointError::AlreadyExists {
                tunnel: tag,
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!(
                    "Registered tunnel {} ({})",
                    tag,
                    endpoint.protocol()
                );
                slot.insert(endpoint);
                Ok(())
            }
        }
    }

    /// Get an endpoint by tag
    #[must_use]
    pub fn get(&self, tag: &str) -> Option<Arc<TunnelEndpoint>> {
        self.tunnels.get(tag).map(|r| Arc::clone(r.value()))
    }

    /// Remove an endpoint by tag, returning it for teardown
    pub fn remove(&self, tag: &str) -> Option<Arc<TunnelEndpoint>> {
        let removed = self.tunnels.remove(tag).map(|(_, v)| v);
        if removed.is_some() {
            info!("Removed tunnel {}", tag);
        }
        removed
    }

    /// Check if a tag is registered
    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.tunnels.contains_key(tag)
    }

    /// All registered tags
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        self.tunnels.iter().map(|r| r.key().clone()).collect()
    }

    /// All registered endpoints
    #[must_use]
    pub fn endpoints(&self) -> Vec<Arc<TunnelEndpoint>> {
        self.tunnels.iter().map(|r| Arc::clone(r.value())).collect()
    }

    /// Number of registered tunnels
    #[must_use]
    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    /// Check if the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Metadata records for all registered tunnels
    #[must_use]
    pub fn records(&self) -> Vec<TunnelRecord> {
        self.tunnels
            .iter()
            .map(|r| {
                let endpoint = r.value();
                TunnelRecord {
                    tag: endpoint.tag().to_string(),
                    protocol: endpoint.protocol(),
                    state: endpoint.state(),
                    assignment: endpoint.assignment_watch().borrow().clone(),
                }
            })
            .collect()
    }

    /// Traffic counters for all registered tunnels
    #[must_use]
    pub fn stats_summary(&self) -> HashMap<String, EndpointStatsSnapshot> {
        self.tunnels
            .iter()
            .map(|r| (r.key().clone(), r.value().stats()))
            .collect()
    }

    /// Log current status of all tunnels
    pub fn log_status(&self) {
        for entry in &self.tunnels {
            let endpoint = entry.value();
            let stats = endpoint.stats();
            debug!(
                "Tunnel {}: protocol={} state={} tx={} rx={}",
                endpoint.tag(),
                endpoint.protocol(),
                endpoint.state(),
                stats.tx_packets,
                stats.rx_packets
            );
        }
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TunnelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelRegistry")
            .field("count", &self.len())
            .field("tags", &self.tags())
            .finish()
    }
}
