//! Per-packet routing
//!
//! The router ties the components together: for each packet read from
//! the local interface, classify (connection tracker, falling back to
//! the rule cache plus identity resolution), then forward to a tunnel
//! endpoint, the direct path, or the JIT orchestrator's buffer. Inbound
//! packets from all tunnels funnel through one bounded channel into a
//! single writer task, so backend threading never dictates interface
//! write ordering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::registry::TunnelRegistry;
use crate::config::Config;
use crate::endpoint::{InboundPacket, SendError, TunnelEndpoint};
use crate::flow::{ConnectionTracker, FlowKey, RouteDecision};
use crate::iface::{DirectPath, IdentityResolver, VirtualInterface};
use crate::jit::JitOrchestrator;
use crate::rules::{RuleCache, RuleTarget};

/// Why a packet was not forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Identity resolver failed; never route blind
    ClassificationUnavailable,
    /// No rule and policy forbids direct
    NoRuleMatch,
    /// Flow was denied (failed establishment without fallback)
    Denied,
    /// Tunnel torn down mid-flow
    TunnelDisconnected,
    /// Backend refused the payload (framing/size)
    BackendRejected,
    /// The direct path refused the packet
    DirectUnavailable,
    /// Not routable and policy forbids passthrough
    Unroutable,
}

/// Outcome of routing one packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Sent through the tunnel with this tag
    Tunneled(String),
    /// Sent outside all tunnels
    Direct,
    /// Held by the JIT orchestrator for this tunnel
    Buffered(String),
    /// Not forwarded
    Dropped(DropReason),
}

/// Router counters
#[derive(Debug, Default)]
struct RouterCounters {
    packets_in: AtomicU64,
    tunneled: AtomicU64,
    direct: AtomicU64,
    buffered: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of router counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStatsSnapshot {
    /// Packets read from the interface
    pub packets_in: u64,
    /// Packets sent into tunnels
    pub tunneled: u64,
    /// Packets sent via the direct path
    pub direct: u64,
    /// Packets buffered awaiting establishment
    pub buffered: u64,
    /// Packets dropped
    pub dropped: u64,
}

/// The per-packet decision engine
pub struct PacketRouter {
    config: Arc<Config>,
    rules: Arc<RuleCache>,
    tracker: Arc<ConnectionTracker>,
    registry: Arc<TunnelRegistry>,
    jit: Arc<JitOrchestrator>,
    resolver: Arc<dyn IdentityResolver>,
    direct: Arc<dyn DirectPath>,
    iface: Arc<dyn VirtualInterface>,
    counters: RouterCounters,
}

impl PacketRouter {
    /// Create a router over already-wired components
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        rules: Arc<RuleCache>,
        tracker: Arc<ConnectionTracker>,
        registry: Arc<TunnelRegistry>,
        jit: Arc<JitOrchestrator>,
        resolver: Arc<dyn IdentityResolver>,
        direct: Arc<dyn DirectPath>,
        iface: Arc<dyn VirtualInterface>,
    ) -> Self {
        Self {
            config,
            rules,
            tracker,
            registry,
            jit,
            resolver,
            direct,
            iface,
            counters: RouterCounters::default(),
        }
    }

    /// Route one outbound packet read from the local interface.
    ///
    /// Never fatal: every failure path degrades exactly this packet (or
    /// its flow), and the outcome says what happened.
    pub async fn route_outbound(&self, packet: Bytes) -> RouteOutcome {
        self.counters.packets_in.fetch_add(1, Ordering::Relaxed);

        let key = match FlowKey::parse(&packet) {
            Ok(key) => key,
            Err(e) => {
                // No flow identity (ICMP, malformed, ...): policy decides
                trace!("Unclassifiable packet: {}", e);
                return if self.config.policy.unmatched_direct {
                    self.send_direct(packet).await
                } else {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    RouteOutcome::Dropped(DropReason::Unroutable)
                };
            }
        };

        let app = match self.tracker.classify(&key, self.resolver.as_ref()) {
            Ok(app) => app,
            Err(e) => {
                debug!("Flow {} unclassifiable: {}", key, e);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return RouteOutcome::Dropped(DropReason::ClassificationUnavailable);
            }
        };

        // A decided flow never re-consults the rules: rule changes apply
        // to new flows only.
        if let Some(decision) = self.tracker.route(&key) {
            return self.forward(key, decision, packet).await;
        }

        match self.rules.lookup(&app) {
            Some(RuleTarget::Tunnel(tag)) => {
                if let Some(endpoint) = self.registry.get(&tag) {
                    self.tracker
                        .bind_route(&key, RouteDecision::Tunnel(tag.clone()));
                    self.send_tunnel(key, &tag, &endpoint, packet).await
                } else {
                    // Route stays unbound until establishment resolves
                    self.jit.buffer_packet(key, &tag, packet);
                    self.counters.buffered.fetch_add(1, Ordering::Relaxed);
                    RouteOutcome::Buffered(tag)
                }
            }
            Some(RuleTarget::Direct) => {
                self.tracker.bind_route(&key, RouteDecision::Direct);
                self.send_direct(packet).await
            }
            None => {
                if self.config.policy.unmatched_direct {
                    self.tracker.bind_route(&key, RouteDecision::Direct);
                    self.send_direct(packet).await
                } else {
                    debug!("No rule for {} and direct is disallowed", app);
                    self.tracker.bind_route(&key, RouteDecision::Deny);
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    RouteOutcome::Dropped(DropReason::NoRuleMatch)
                }
            }
        }
    }

    async fn forward(
        &self,
        key: FlowKey,
        decision: RouteDecision,
        packet: Bytes,
    ) -> RouteOutcome {
        match decision {
            RouteDecision::Tunnel(tag) => match self.registry.get(&tag) {
                Some(endpoint) => self.send_tunnel(key, &tag, &endpoint, packet).await,
                None => {
                    // Tunnel went away under the flow; re-establish
                    self.jit.buffer_packet(key, &tag, packet);
                    self.counters.buffered.fetch_add(1, Ordering::Relaxed);
                    RouteOutcome::Buffered(tag)
                }
            },
            RouteDecision::Direct => self.send_direct(packet).await,
            RouteDecision::Deny => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                RouteOutcome::Dropped(DropReason::Denied)
            }
        }
    }

    async fn send_tunnel(
        &self,
        key: FlowKey,
        tag: &str,
        endpoint: &Arc<TunnelEndpoint>,
        packet: Bytes,
    ) -> RouteOutcome {
        match endpoint.send(&packet).await {
            Ok(()) => {
                self.counters.tunneled.fetch_add(1, Ordering::Relaxed);
                RouteOutcome::Tunneled(tag.to_string())
            }
            Err(SendError::NotReady) => {
                // Connecting or degraded: buffer, never drop
                self.jit.buffer_packet(key, tag, packet);
                self.counters.buffered.fetch_add(1, Ordering::Relaxed);
                RouteOutcome::Buffered(tag.to_string())
            }
            Err(SendError::Disconnected) => {
                // Reconnect runs inside the endpoint; in-flight packets
                // are dropped, not re-buffered
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                RouteOutcome::Dropped(DropReason::TunnelDisconnected)
            }
            Err(SendError::BackendRejected { reason }) => {
                warn!("Tunnel {} rejected packet for {}: {}", tag, key, reason);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                RouteOutcome::Dropped(DropReason::BackendRejected)
            }
        }
    }

    async fn send_direct(&self, packet: Bytes) -> RouteOutcome {
        match self.direct.send(packet).await {
            Ok(()) => {
                self.counters.direct.fetch_add(1, Ordering::Relaxed);
                RouteOutcome::Direct
            }
            Err(e) => {
                debug!("Direct path refused packet: {}", e);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                RouteOutcome::Dropped(DropReason::DirectUnavailable)
            }
        }
    }

    /// Run the interface reader loop until the interface closes.
    ///
    /// Exactly one caller may run this; the interface contract is a
    /// single sequential reader.
    pub async fn run(&self) {
        info!("Packet router running");
        while let Some(packet) = self.iface.read_packet().await {
            self.route_outbound(packet).await;
        }
        info!("Local interface closed; router loop exiting");
    }

    /// Router counters snapshot
    #[must_use]
    pub fn stats(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            packets_in: self.counters.packets_in.load(Ordering::Relaxed),
            tunneled: self.counters.tunneled.load(Ordering::Relaxed),
            direct: self.counters.direct.load(Ordering::Relaxed),
            buffered: self.counters.buffered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for PacketRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketRouter")
            .field("tunnels", &self.registry.len())
            .field("flows", &self.tracker.len())
            .finish()
    }
}

/// Spawn the single interface writer.
///
/// All tunnel endpoints feed `rx`; this task is the only writer to the
/// interface, so inbound packets from concurrent tunnels never
/// interleave mid-write.
pub fn spawn_interface_writer(
    iface: Arc<dyn VirtualInterface>,
    mut rx: mpsc::Receiver<InboundPacket>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(inbound) = rx.recv().await {
            trace!(
                "Writing {} bytes from tunnel {} to interface",
                inbound.packet.len(),
                inbound.tunnel
            );
            if let Err(e) = iface.write_packet(inbound.packet).await {
                warn!("Interface write failed: {}", e);
            }
        }
        debug!("Inbound channel closed; interface writer exiting");
    })
}
