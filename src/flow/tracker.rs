//! Connection tracking
//!
//! Maps active flows to the application that opened them and to the
//! routing decision made for them, so packets of an already-classified
//! flow never need re-classification. Classification is stable for the
//! lifetime of a flow: rule changes apply to new flows only, which keeps
//! an in-flight connection on its original tunnel instead of breaking
//! transport state mid-stream.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::key::FlowKey;
use crate::error::FlowError;
use crate::iface::IdentityResolver;

/// Final routing decision for a classified flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Forward through the tunnel with this tag
    Tunnel(String),
    /// Forward outside all tunnels
    Direct,
    /// Drop this flow's traffic (no rule and policy forbids direct, or
    /// establishment failed without fallback)
    Deny,
}

/// One tracked flow
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    /// Owning application identity
    pub app: String,
    /// Routing decision; `None` while JIT establishment is pending
    pub route: Option<RouteDecision>,
    /// Last packet seen for this flow
    last_activity: Instant,
}

impl ConnectionEntry {
    fn new(app: String) -> Self {
        Self {
            app,
            route: None,
            last_activity: Instant::now(),
        }
    }
}

/// Concurrency-safe flow table
///
/// Reads and inserts come from the interface-reader path while eviction
/// sweeps and JIT completion run on their own tasks, so the table is a
/// sharded `DashMap` rather than a single mutex.
pub struct ConnectionTracker {
    flows: DashMap<FlowKey, ConnectionEntry>,
}

impl ConnectionTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self {
            flows: DashMap::new(),
        }
    }

    /// Classify a flow, resolving its owner on first sight.
    ///
    /// Subsequent calls for the same key return the stored identity
    /// without touching the resolver. Concurrent first-sight calls
    /// resolve to a single winner (idempotent insert); both callers
    /// observe the winning entry.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::ClassificationUnavailable` if the external
    /// resolver cannot determine the owner. No entry is created, so a
    /// later packet of the same flow retries resolution.
    pub fn classify(
        &self,
        key: &FlowKey,
        resolver: &dyn IdentityResolver,
    ) -> Result<String, FlowError> {
        if let Some(mut entry) = self.flows.get_mut(key) {
            entry.last_activity = Instant::now();
            return Ok(entry.app.clone());
        }

        let app = resolver.resolve(key)?;
        trace!("New flow {} owned by {}", key, app);

        let entry = self
            .flows
            .entry(*key)
            .or_insert_with(|| ConnectionEntry::new(app));
        Ok(entry.app.clone())
    }

    /// Routing decision recorded for a flow, if any
    #[must_use]
    pub fn route(&self, key: &FlowKey) -> Option<RouteDecision> {
        self.flows.get(key).and_then(|e| e.route.clone())
    }

    /// Owning application of a tracked flow, if any
    #[must_use]
    pub fn app_of(&self, key: &FlowKey) -> Option<String> {
        self.flows.get(key).map(|e| e.app.clone())
    }

    /// Record the routing decision for a flow.
    ///
    /// The decision sticks for the flow's lifetime; callers only invoke
    /// this on first classification or on JIT resolution, never to move
    /// a live flow between tunnels.
    pub fn bind_route(&self, key: &FlowKey, decision: RouteDecision) {
        if let Some(mut entry) = self.flows.get_mut(key) {
            entry.route = Some(decision);
        }
    }

    /// Refresh a flow's last-activity timestamp
    pub fn touch(&self, key: &FlowKey) {
        if let Some(mut entry) = self.flows.get_mut(key) {
            entry.last_activity = Instant::now();
        }
    }

    /// Remove entries whose inactivity exceeds `ttl`.
    ///
    /// Returns the number of evicted flows.
    pub fn evict_stale(&self, ttl: Duration) -> usize {
        let before = self.flows.len();
        self.flows
            .retain(|_, entry| entry.last_activity.elapsed() <= ttl);
        let evicted = before.saturating_sub(self.flows.len());
        if evicted > 0 {
            debug!("Evicted {} stale flows", evicted);
        }
        evicted
    }

    /// Remove every flow bound to `tunnel_tag` (interface or tunnel
    /// teardown). Returns the number of evicted flows.
    pub fn evict_tunnel(&self, tunnel_tag: &str) -> usize {
        let before = self.flows.len();
        self.flows.retain(|_, entry| {
            !matches!(&entry.route, Some(RouteDecision::Tunnel(tag)) if tag == tunnel_tag)
        });
        let evicted = before.saturating_sub(self.flows.len());
        if evicted > 0 {
            debug!("Evicted {} flows bound to tunnel {}", evicted, tunnel_tag);
        }
        evicted
    }

    /// Number of live flows currently bound to `tunnel_tag`.
    ///
    /// Drives idle teardown: a tunnel with zero referencing flows is a
    /// teardown candidate.
    #[must_use]
    pub fn flows_for_tunnel(&self, tunnel_tag: &str) -> usize {
        self.flows
            .iter()
            .filter(|e| {
                matches!(&e.value().route, Some(RouteDecision::Tunnel(tag)) if tag == tunnel_tag)
            })
            .count()
    }

    /// Total tracked flows
    #[must_use]
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Check if no flows are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTracker")
            .field("flows", &self.len())
            .finish()
    }
}

/// Spawn the periodic eviction sweep for stale flows.
///
/// The task runs until aborted; teardown of the router aborts it.
pub fn spawn_flow_sweeper(
    tracker: Arc<ConnectionTracker>,
    ttl: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            tracker.evict_stale(ttl);
        }
    })
}
