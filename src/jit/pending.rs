//! Pending-flow packet buffers
//!
//! Packets intercepted before their tunnel is ready wait in a per-flow
//! queue bounded in both packets and bytes, under a global byte budget
//! shared by all pending flows. When any bound is exceeded the *oldest*
//! packet of the affected flow is dropped: dropping the newest would
//! stall the flow indefinitely on a single lost packet, while bounded
//! staleness lets the transport recover normally.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;

/// Byte budget shared across all pending flows
#[derive(Debug)]
pub struct GlobalBudget {
    used: AtomicUsize,
    max: usize,
}

impl GlobalBudget {
    /// Create a budget of `max` bytes
    #[must_use]
    pub const fn new(max: usize) -> Self {
        Self {
            used: AtomicUsize::new(0),
            max,
        }
    }

    /// Try to reserve `n` bytes; false when the budget cannot fit them
    pub fn try_reserve(&self, n: usize) -> bool {
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            if used + n > self.max {
                return false;
            }
            match self.used.compare_exchange_weak(
                used,
                used + n,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => used = actual,
            }
        }
    }

    /// Return `n` bytes to the budget
    pub fn release(&self, n: usize) {
        self.used.fetch_sub(n, Ordering::AcqRel);
    }

    /// Bytes currently reserved
    #[must_use]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

/// Outcome of buffering one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    /// Whether the incoming packet was enqueued
    pub enqueued: bool,
    /// Oldest packets dropped to make room
    pub dropped_oldest: usize,
}

/// Bounded FIFO of raw packets for one flow awaiting its tunnel
#[derive(Debug)]
pub struct PendingFlowBuffer {
    packets: VecDeque<Bytes>,
    bytes: usize,
    max_packets: usize,
    max_bytes: usize,
}

impl PendingFlowBuffer {
    /// Create a buffer bounded to `max_packets` and `max_bytes`
    #[must_use]
    pub fn new(max_packets: usize, max_bytes: usize) -> Self {
        Self {
            packets: VecDeque::new(),
            bytes: 0,
            max_packets,
            max_bytes,
        }
    }

    /// Enqueue a packet, evicting oldest entries as needed to respect
    /// the per-flow bounds and the global budget.
    pub fn push(&mut self, packet: Bytes, global: &GlobalBudget) -> PushOutcome {
        let incoming = packet.len();
        let mut dropped = 0;

        // A packet that can never fit is refused outright
        if incoming > self.max_bytes {
            return PushOutcome {
                enqueued: false,
                dropped_oldest: 0,
            };
        }

        // Make room within the per-flow bounds
        while self.packets.len() + 1 > self.max_packets || self.bytes + incoming > self.max_bytes {
            match self.pop_oldest(global) {
                Some(_) => dropped += 1,
                None => break,
            }
        }

        // Then within the global budget, still at this flow's expense
        while !global.try_reserve(incoming) {
            match self.pop_oldest(global) {
                Some(_) => dropped += 1,
                None => {
                    return PushOutcome {
                        enqueued: false,
                        dropped_oldest: dropped,
                    }
                }
            }
        }

        self.packets.push_back(packet);
        self.bytes += incoming;
        PushOutcome {
            enqueued: true,
            dropped_oldest: dropped,
        }
    }

    fn pop_oldest(&mut self, global: &GlobalBudget) -> Option<Bytes> {
        let oldest = self.packets.pop_front()?;
        self.bytes -= oldest.len();
        global.release(oldest.len());
        Some(oldest)
    }

    /// Drain all packets in original arrival order, releasing their
    /// global reservation
    pub fn drain(&mut self, global: &GlobalBudget) -> Vec<Bytes> {
        global.release(self.bytes);
        self.bytes = 0;
        self.packets.drain(..).collect()
    }

    /// Buffered packet count
    #[must_use]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Check if nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Buffered byte count
    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.bytes
    }
}
