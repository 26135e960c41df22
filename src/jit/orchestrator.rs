//! Just-in-time tunnel establishment
//!
//! On the first packet for an application whose target tunnel is not
//! live, the packet is buffered and establishment starts off the hot
//! path: probe candidates, create a backend for the winner, connect
//! under a hard timeout. On success, buffered packets flush in arrival
//! order before the tunnel becomes visible to the router, so nothing
//! overtakes them. On failure, buffers are dropped and the affected
//! flows fall back to direct or deny per their rule. A reaper tears down
//! tunnels no live flow references anymore.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::pending::{GlobalBudget, PendingFlowBuffer};
use super::probe;
use crate::config::Config;
use crate::endpoint::{BackendFactory, EndpointState, InboundPacket, TunnelEndpoint};
use crate::error::{JitError, RouterError};
use crate::flow::{ConnectionTracker, FlowKey, RouteDecision};
use crate::iface::VirtualInterface;
use crate::router::TunnelRegistry;
use crate::rules::RuleCache;
use crate::subnet::{spawn_assignment_watcher, SubnetAllocator};

/// One flow's buffered packets and the tunnel they wait for
struct PendingFlow {
    target: String,
    buffer: PendingFlowBuffer,
}

/// Orchestrator counters
#[derive(Debug, Default)]
struct JitCounters {
    packets_buffered: AtomicU64,
    packets_flushed: AtomicU64,
    packets_dropped: AtomicU64,
    establishments: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time copy of orchestrator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitStatsSnapshot {
    /// Packets accepted into pending buffers
    pub packets_buffered: u64,
    /// Packets flushed into tunnels after establishment
    pub packets_flushed: u64,
    /// Packets dropped (budget pressure or failed establishment)
    pub packets_dropped: u64,
    /// Tunnels successfully established on demand
    pub establishments: u64,
    /// Establishment attempts that failed or timed out
    pub failures: u64,
}

/// Just-in-time tunnel orchestrator
pub struct JitOrchestrator {
    config: Arc<Config>,
    registry: Arc<TunnelRegistry>,
    tracker: Arc<ConnectionTracker>,
    rules: Arc<RuleCache>,
    factory: Arc<dyn BackendFactory>,
    allocator: Arc<SubnetAllocator>,
    iface: Arc<dyn VirtualInterface>,
    inbound_tx: tokio::sync::mpsc::Sender<InboundPacket>,
    pending: DashMap<FlowKey, PendingFlow>,
    global: GlobalBudget,
    connecting: DashMap<String, ()>,
    counters: JitCounters,
}

impl JitOrchestrator {
    /// Create an orchestrator wired to the router's shared components
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        registry: Arc<TunnelRegistry>,
        tracker: Arc<ConnectionTracker>,
        rules: Arc<RuleCache>,
        factory: Arc<dyn BackendFactory>,
        allocator: Arc<SubnetAllocator>,
        iface: Arc<dyn VirtualInterface>,
        inbound_tx: tokio::sync::mpsc::Sender<InboundPacket>,
    ) -> Self {
        let global = GlobalBudget::new(config.jit.global_max_bytes);
        Self {
            config,
            registry,
            tracker,
            rules,
            factory,
            allocator,
            iface,
            inbound_tx,
            pending: DashMap::new(),
            global,
            connecting: DashMap::new(),
            counters: JitCounters::default(),
        }
    }

    /// Buffer a packet for a flow whose tunnel is not live yet and make
    /// sure establishment is running for its target.
    pub fn buffer_packet(self: &Arc<Self>, key: FlowKey, target: &str, packet: Bytes) {
        {
            let mut entry = self.pending.entry(key).or_insert_with(|| PendingFlow {
                target: target.to_string(),
                buffer: PendingFlowBuffer::new(
                    self.config.jit.per_flow_max_packets,
                    self.config.jit.per_flow_max_bytes,
                ),
            });
            let outcome = entry.buffer.push(packet, &self.global);

            if outcome.dropped_oldest > 0 {
                let err = JitError::BufferBudgetExceeded {
                    dropped: outcome.dropped_oldest,
                };
                warn!("Flow {}: {}", key, err);
                self.counters
                    .packets_dropped
                    .fetch_add(outcome.dropped_oldest as u64, Ordering::Relaxed);
            }
            if outcome.enqueued {
                self.counters.packets_buffered.fetch_add(1, Ordering::Relaxed);
            } else {
                warn!("Flow {}: packet refused by pending buffer", key);
                self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.ensure_connected(target);
    }

    /// Start establishment for `target` unless the tunnel is already
    /// live or establishment is already in flight.
    pub fn ensure_connected(self: &Arc<Self>, target: &str) {
        if self.registry.contains(target) {
            return;
        }
        if self.connecting.insert(target.to_string(), ()).is_some() {
            return;
        }

        debug!("Starting JIT establishment for tunnel {}", target);
        let this = Arc::clone(self);
        let tag = target.to_string();
        tokio::spawn(async move {
            this.establish(tag).await;
        });
    }

    /// Tear down a live tunnel: cancels its recv, releases any pending
    /// buffers without re-attempting flush, evicts its flows, and
    /// reconfigures the interface if the tunnel was a subnet primary.
    ///
    /// Returns false when no such tunnel is registered.
    pub async fn teardown_tunnel(&self, tag: &str) -> bool {
        let Some(endpoint) = self.registry.remove(tag) else {
            return false;
        };

        endpoint.shutdown().await;
        self.release_pending(tag);
        self.tracker.evict_tunnel(tag);

        let release = self.allocator.on_address_released(tag);
        if release.interface_action_required {
            if let Err(e) = self.iface.configure(self.allocator.interface_update()).await {
                warn!("Interface reconfiguration after {} teardown failed: {}", tag, e);
            }
        }
        true
    }

    /// Orchestrator counters snapshot
    #[must_use]
    pub fn stats(&self) -> JitStatsSnapshot {
        JitStatsSnapshot {
            packets_buffered: self.counters.packets_buffered.load(Ordering::Relaxed),
            packets_flushed: self.counters.packets_flushed.load(Ordering::Relaxed),
            packets_dropped: self.counters.packets_dropped.load(Ordering::Relaxed),
            establishments: self.counters.establishments.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Bytes currently held in pending buffers
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.global.used()
    }

    async fn establish(self: Arc<Self>, tag: String) {
        let timeout = self.config.jit.establish_timeout();
        let result = tokio::time::timeout(timeout, self.establish_inner(&tag)).await;

        match result {
            Ok(Ok(endpoint)) => {
                self.counters.establishments.fetch_add(1, Ordering::Relaxed);
                self.flush_and_register(endpoint).await;
                self.connecting.remove(&tag);
                // Packets that raced past the pre-registration flush
                if let Some(endpoint) = self.registry.get(&tag) {
                    self.flush_into(&endpoint).await;
                }
            }
            Ok(Err(e)) => {
                warn!("Establishment for {} failed: {}", tag, e);
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.fail_establishment(&tag);
                self.connecting.remove(&tag);
            }
            Err(_) => {
                let err = JitError::EstablishmentTimeout {
                    tunnel: tag.clone(),
                    timeout_secs: self.config.jit.establish_timeout_secs,
                };
                warn!("{}", err);
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.fail_establishment(&tag);
                self.connecting.remove(&tag);
            }
        }
    }

    async fn establish_inner(&self, tag: &str) -> Result<Arc<TunnelEndpoint>, RouterError> {
        let tunnel_cfg = self
            .config
            .tunnel(tag)
            .ok_or_else(|| JitError::NoCandidates { tunnel: tag.into() })?
            .clone();

        let (server, latency) =
            probe::select_candidate(&tunnel_cfg.servers, self.config.jit.probe_timeout())
                .await
                .ok_or_else(|| JitError::NoCandidates { tunnel: tag.into() })?;

        info!(
            "Establishing tunnel {} via {} (probe {:?})",
            tag, server.name, latency
        );

        let backend = self.factory.create(&tunnel_cfg, server);
        let endpoint = Arc::new(TunnelEndpoint::new(
            tag,
            backend,
            self.config.buffer.headroom,
            self.config.buffer.tailroom,
            tunnel_cfg.mtu,
            self.inbound_tx.clone(),
        ));

        endpoint.connect().await?;
        Ok(endpoint)
    }

    /// Flush buffered traffic, then make the endpoint visible.
    ///
    /// Flushing happens while the endpoint is `Established` and not yet
    /// in the registry: packets arriving meanwhile keep landing in the
    /// pending buffers, so flushed packets cannot be overtaken.
    async fn flush_and_register(self: &Arc<Self>, endpoint: Arc<TunnelEndpoint>) {
        let tag = endpoint.tag().to_string();

        self.flush_into(&endpoint).await;
        endpoint.activate();

        spawn_assignment_watcher(
            tag.clone(),
            endpoint.assignment_watch(),
            Arc::clone(&self.allocator),
            Arc::clone(&self.iface),
        );
        self.spawn_reflush_watcher(&endpoint);

        if let Err(e) = self.registry.insert(Arc::clone(&endpoint)) {
            warn!("Tunnel {} lost registration race: {}", tag, e);
            endpoint.shutdown().await;
        }
    }

    /// Re-flush pending buffers whenever the endpoint returns to
    /// `Active`. Packets buffered while a registered tunnel is degraded
    /// have no establishment task to flush them; the reconnect inside
    /// the endpoint is what makes them sendable again.
    fn spawn_reflush_watcher(self: &Arc<Self>, endpoint: &Arc<TunnelEndpoint>) {
        let this = Arc::clone(self);
        let endpoint = Arc::clone(endpoint);
        let mut state_rx = endpoint.state_watch();
        tokio::spawn(async move {
            loop {
                if state_rx.changed().await.is_err() {
                    break;
                }
                let state = *state_rx.borrow();
                if state == EndpointState::Active {
                    this.flush_into(&endpoint).await;
                }
                if state.is_terminal() {
                    break;
                }
            }
        });
    }

    async fn flush_into(&self, endpoint: &Arc<TunnelEndpoint>) {
        let tag = endpoint.tag();
        loop {
            let keys: Vec<FlowKey> = self
                .pending
                .iter()
                .filter(|e| e.value().target == tag)
                .map(|e| *e.key())
                .collect();
            if keys.is_empty() {
                return;
            }

            for key in keys {
                let Some((_, mut flow)) = self.pending.remove(&key) else {
                    continue;
                };
                let packets = flow.buffer.drain(&self.global);
                debug!("Flushing {} buffered packets for {}", packets.len(), key);

                for packet in packets {
                    match endpoint.send(&packet).await {
                        Ok(()) => {
                            self.counters.packets_flushed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            warn!("Flush send for {} failed: {}", key, e);
                            self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                self.tracker
                    .bind_route(&key, RouteDecision::Tunnel(tag.to_string()));
            }
        }
    }

    /// Drop all buffers destined for `tag` and bind the affected flows
    /// per their rule: direct when fallback is allowed, deny otherwise.
    fn fail_establishment(&self, tag: &str) {
        let keys: Vec<FlowKey> = self
            .pending
            .iter()
            .filter(|e| e.value().target == tag)
            .map(|e| *e.key())
            .collect();

        for key in keys {
            let Some((_, mut flow)) = self.pending.remove(&key) else {
                continue;
            };
            let dropped = flow.buffer.drain(&self.global).len();
            self.counters
                .packets_dropped
                .fetch_add(dropped as u64, Ordering::Relaxed);

            let fallback = self
                .tracker
                .app_of(&key)
                .is_some_and(|app| self.rules.fallback_allowed(&app));
            let decision = if fallback {
                info!("Flow {} falls back to direct after {} failed", key, tag);
                RouteDecision::Direct
            } else {
                info!("Flow {} denied after {} failed", key, tag);
                RouteDecision::Deny
            };
            self.tracker.bind_route(&key, decision);
        }
    }

    /// Release pending buffers for `tag` without flushing (teardown path)
    fn release_pending(&self, tag: &str) {
        let keys: Vec<FlowKey> = self
            .pending
            .iter()
            .filter(|e| e.value().target == tag)
            .map(|e| *e.key())
            .collect();
        for key in keys {
            if let Some((_, mut flow)) = self.pending.remove(&key) {
                let dropped = flow.buffer.drain(&self.global).len();
                self.counters
                    .packets_dropped
                    .fetch_add(dropped as u64, Ordering::Relaxed);
            }
        }
    }

    /// Spawn the idle reaper: tunnels with zero referencing flows for
    /// longer than the idle threshold are torn down lazily. A tunnel
    /// with at least one live flow is never reaped.
    pub fn spawn_idle_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let idle_after = this.config.jit.idle_timeout();
            let mut tick = tokio::time::interval(this.config.jit.reap_interval());
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut idle_since: HashMap<String, Instant> = HashMap::new();

            loop {
                tick.tick().await;

                for endpoint in this.registry.endpoints() {
                    let tag = endpoint.tag().to_string();
                    if this.tracker.flows_for_tunnel(&tag) > 0 {
                        idle_since.remove(&tag);
                        continue;
                    }

                    let since = idle_since.entry(tag.clone()).or_insert_with(Instant::now);
                    if since.elapsed() >= idle_after {
                        info!("Tearing down idle tunnel {}", tag);
                        this.teardown_tunnel(&tag).await;
                        idle_since.remove(&tag);
                    }
                }

                idle_since.retain(|tag, _| this.registry.contains(tag));
            }
        })
    }
}

impl std::fmt::Debug for JitOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitOrchestrator")
            .field("pending_flows", &self.pending.len())
            .field("pending_bytes", &self.pending_bytes())
            .field("connecting", &self.connecting.len())
            .finish()
    }
}
