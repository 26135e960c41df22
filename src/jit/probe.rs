//! Server latency probing
//!
//! Candidate servers are probed with a lightweight UDP echo (a
//! handshake-time measurement, not full establishment) and the
//! lowest-latency candidate wins. Ties — including the all-timeouts
//! case — are broken by stable server-list order, so selection is
//! deterministic for a given set of measurements.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::ServerCandidate;

/// Measure round-trip latency to a server with a single UDP probe.
///
/// Returns `None` when the probe cannot be sent or no reply arrives
/// within `probe_timeout`.
pub async fn measure_latency(endpoint: SocketAddr, probe_timeout: Duration) -> Option<Duration> {
    let bind_addr: SocketAddr = if endpoint.is_ipv4() {
        "0.0.0.0:0".parse().ok()?
    } else {
        "[::]:0".parse().ok()?
    };

    let socket = UdpSocket::bind(bind_addr).await.ok()?;

    let probe = [0u8; 1];
    let start = Instant::now();

    if socket.send_to(&probe, endpoint).await.is_err() {
        return None;
    }

    let mut buf = [0u8; 64];
    match timeout(probe_timeout, socket.recv_from(&mut buf)).await {
        Ok(Ok(_)) => Some(start.elapsed()),
        _ => None,
    }
}

/// Probe all candidates and pick the lowest-latency one.
///
/// Candidates that time out rank behind any that answered. When every
/// probe fails, the first candidate is returned (stable-order tie
/// break), so the caller can still attempt establishment.
///
/// Returns `None` only for an empty candidate list.
pub async fn select_candidate<'a>(
    candidates: &'a [ServerCandidate],
    probe_timeout: Duration,
) -> Option<(&'a ServerCandidate, Option<Duration>)> {
    if candidates.is_empty() {
        return None;
    }

    let mut best: Option<(&ServerCandidate, Duration)> = None;
    for candidate in candidates {
        let latency = measure_latency(candidate.endpoint, probe_timeout).await;
        trace!(
            "Probe {} ({}): {:?}",
            candidate.name,
            candidate.endpoint,
            latency
        );

        if let Some(latency) = latency {
            // Strictly-less keeps the earlier candidate on ties
            if best.map_or(true, |(_, b)| latency < b) {
                best = Some((candidate, latency));
            }
        }
    }

    match best {
        Some((candidate, latency)) => {
            debug!(
                "Selected server {} ({:?} round-trip)",
                candidate.name, latency
            );
            Some((candidate, Some(latency)))
        }
        None => {
            debug!(
                "All probes failed; falling back to first candidate {}",
                candidates[0].name
            );
            Some((&candidates[0], None))
        }
    }
}
