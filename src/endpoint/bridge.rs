//! Tunnel endpoint: the bridge between raw packets and one backend
//!
//! The endpoint enforces the buffer headroom/tailroom contract on every
//! outbound packet, pumps decrypted inbound packets into the router's
//! single-writer channel, and runs bounded-backoff reconnection when the
//! transport drops — all without discarding the tunnel's identity, so
//! flow bindings survive a reconnect.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::backend::{ProtocolKind, SendError, TunnelAssignment, TunnelBackend};
use super::buffer::PacketBuffer;
use super::state::EndpointState;
use crate::error::EndpointError;

/// First reconnect attempt delay
const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Ceiling for the exponential backoff
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Reconnect attempts before the endpoint gives up and goes terminal
const RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// One decrypted packet on its way back to the interface
#[derive(Debug, Clone)]
pub struct InboundPacket {
    /// Tag of the tunnel that produced the packet
    pub tunnel: String,
    /// Decrypted packet bytes
    pub packet: Bytes,
}

/// Endpoint traffic counters
#[derive(Debug, Default)]
pub struct EndpointStats {
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    send_errors: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of endpoint counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStatsSnapshot {
    /// Packets transmitted
    pub tx_packets: u64,
    /// Bytes transmitted (payload, before encryption overhead)
    pub tx_bytes: u64,
    /// Packets received
    pub rx_packets: u64,
    /// Bytes received (decrypted)
    pub rx_bytes: u64,
    /// Failed sends
    pub send_errors: u64,
    /// Completed reconnections
    pub reconnects: u64,
}

impl EndpointStats {
    fn snapshot(&self) -> EndpointStatsSnapshot {
        EndpointStatsSnapshot {
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Bidirectional bridge to one tunnel backend
pub struct TunnelEndpoint {
    tag: String,
    backend: Arc<dyn TunnelBackend>,
    state_tx: watch::Sender<EndpointState>,
    headroom: usize,
    tailroom: usize,
    mtu: usize,
    inbound_tx: mpsc::Sender<InboundPacket>,
    stats: EndpointStats,
    pump: parking_lot::Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl TunnelEndpoint {
    /// Create an endpoint in the `Idle` state.
    ///
    /// `inbound_tx` is the shared bounded channel feeding the router's
    /// single interface writer.
    #[must_use]
    pub fn new(
        tag: impl Into<String>,
        backend: Arc<dyn TunnelBackend>,
        headroom: usize,
        tailroom: usize,
        mtu: usize,
        inbound_tx: mpsc::Sender<InboundPacket>,
    ) -> Self {
        let (state_tx, _) = watch::channel(EndpointState::Idle);
        Self {
            tag: tag.into(),
            backend,
            state_tx,
            headroom,
            tailroom,
            mtu,
            inbound_tx,
            stats: EndpointStats::default(),
            pump: parking_lot::Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Stable tunnel tag
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Protocol kind of the underlying backend
    #[must_use]
    pub fn protocol(&self) -> ProtocolKind {
        self.backend.protocol()
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> EndpointState {
        *self.state_tx.borrow()
    }

    /// Subscribe to lifecycle transitions (observability for the
    /// embedding service; no acknowledgement is required)
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<EndpointState> {
        self.state_tx.subscribe()
    }

    /// Subscribe to the backend's address/subnet/DNS reports
    #[must_use]
    pub fn assignment_watch(&self) -> watch::Receiver<Option<TunnelAssignment>> {
        self.backend.assignment()
    }

    /// Traffic counters snapshot
    #[must_use]
    pub fn stats(&self) -> EndpointStatsSnapshot {
        self.stats.snapshot()
    }

    fn transition(&self, next: EndpointState) -> bool {
        let mut moved = false;
        self.state_tx.send_if_modified(|state| {
            if state.can_transition(next) {
                debug!("Tunnel {}: {} -> {}", self.tag, state, next);
                *state = next;
                moved = true;
                true
            } else {
                false
            }
        });
        moved
    }

    /// Establish the tunnel: `Idle -> Connecting -> Established`.
    ///
    /// The caller applies the hard establishment timeout around this.
    ///
    /// # Errors
    ///
    /// Returns the backend's `EndpointError` and rolls the state back to
    /// `Idle` on failure.
    pub async fn connect(&self) -> Result<(), EndpointError> {
        if !self.transition(EndpointState::Connecting) {
            return Err(EndpointError::AlreadyExists {
                tunnel: self.tag.clone(),
            });
        }

        match self.backend.connect().await {
            Ok(()) => {
                self.transition(EndpointState::Established);
                info!("Tunnel {} established", self.tag);
                Ok(())
            }
            Err(e) => {
                warn!("Tunnel {} failed to connect: {}", self.tag, e);
                self.transition(EndpointState::Idle);
                Err(e)
            }
        }
    }

    /// Mark the endpoint active and start the inbound pump.
    ///
    /// Called once buffered traffic has been flushed; idempotent for an
    /// already-active endpoint.
    pub fn activate(self: &Arc<Self>) {
        if !self.transition(EndpointState::Active) {
            return;
        }

        let mut pump = self.pump.lock();
        if pump.is_none() {
            let endpoint = Arc::clone(self);
            *pump = Some(tokio::spawn(endpoint.pump_loop()));
        }
    }

    /// Encrypt and transmit one raw packet.
    ///
    /// The packet is copied into a freshly allocated buffer with the
    /// configured headroom and tailroom before the backend sees it; the
    /// bridge, not the packet source, owns the layout.
    ///
    /// # Errors
    ///
    /// - `SendError::NotReady` while connecting or degraded (buffer it)
    /// - `SendError::Disconnected` after teardown (drop it)
    /// - `SendError::BackendRejected` for oversized payloads
    pub async fn send(&self, payload: &[u8]) -> Result<(), SendError> {
        let state = self.state();
        if !state.can_send() {
            return match state {
                EndpointState::Disconnected => Err(SendError::Disconnected),
                _ => Err(SendError::NotReady),
            };
        }

        if payload.len() > self.mtu {
            self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            return Err(SendError::rejected(format!(
                "payload {} exceeds MTU {}",
                payload.len(),
                self.mtu
            )));
        }

        let buffer = PacketBuffer::new(payload, self.headroom, self.tailroom);
        match self.backend.send(buffer).await {
            Ok(()) => {
                self.stats.tx_packets.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .tx_bytes
                    .fetch_add(payload.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                if e == SendError::Disconnected {
                    // The pump notices the drop via recv and runs the
                    // reconnect; here we only reflect the degradation.
                    self.transition(EndpointState::Degraded);
                }
                Err(e)
            }
        }
    }

    /// Notify the endpoint of an external network change.
    ///
    /// Enters `Degraded`; the inbound pump observes the dropped
    /// transport and reconnects with backoff.
    pub fn on_network_changed(&self) {
        if self.transition(EndpointState::Degraded) {
            info!("Tunnel {} degraded by network change", self.tag);
        }
    }

    /// Tear the endpoint down: cancels the pump, disconnects the
    /// backend, and moves to the terminal state.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);

        // Terminal entry is forced, not validated: teardown must win
        // from any state.
        self.state_tx.send_replace(EndpointState::Disconnected);
        self.backend.disconnect().await;

        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        info!("Tunnel {} shut down", self.tag);
    }

    async fn pump_loop(self: Arc<Self>) {
        loop {
            match self.backend.recv().await {
                Some(packet) => {
                    self.stats.rx_packets.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .rx_bytes
                        .fetch_add(packet.len() as u64, Ordering::Relaxed);
                    trace!("Tunnel {}: {} bytes inbound", self.tag, packet.len());

                    let inbound = InboundPacket {
                        tunnel: self.tag.clone(),
                        packet,
                    };
                    if self.inbound_tx.send(inbound).await.is_err() {
                        debug!("Tunnel {}: interface writer gone, pump exiting", self.tag);
                        break;
                    }
                }
                None => {
                    if self.shutting_down.load(Ordering::Acquire)
                        || self.state().is_terminal()
                    {
                        break;
                    }

                    warn!("Tunnel {}: transport dropped", self.tag);
                    self.transition(EndpointState::Degraded);

                    if self.reconnect_with_backoff().await {
                        self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                        self.transition(EndpointState::Active);
                        info!("Tunnel {} reconnected", self.tag);
                    } else {
                        self.state_tx.send_replace(EndpointState::Disconnected);
                        warn!("Tunnel {}: reconnect exhausted, disconnecting", self.tag);
                        break;
                    }
                }
            }
        }
    }

    async fn reconnect_with_backoff(&self) -> bool {
        let mut delay = RECONNECT_BASE_DELAY;
        for attempt in 1..=RECONNECT_MAX_ATTEMPTS {
            if self.shutting_down.load(Ordering::Acquire) {
                return false;
            }

            tokio::time::sleep(delay).await;
            debug!(
                "Tunnel {}: reconnect attempt {}/{}",
                self.tag, attempt, RECONNECT_MAX_ATTEMPTS
            );

            match self.backend.connect().await {
                Ok(()) => return true,
                Err(e) => {
                    warn!("Tunnel {}: reconnect attempt {} failed: {}", self.tag, attempt, e);
                    delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                }
            }
        }
        false
    }
}

impl std::fmt::Debug for TunnelEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelEndpoint")
            .field("tag", &self.tag)
            .field("protocol", &self.protocol())
            .field("state", &self.state())
            .finish()
    }
}
