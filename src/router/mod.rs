//! Packet routing and the tunnel registry
//!
//! The registry is the arena of live tunnel endpoints; the router is the
//! per-packet decision function over it.

mod registry;
#[allow(clippy::module_inception)]
mod router;

pub use registry::{TunnelRecord, TunnelRegistry};
pub use router::{
    spawn_interface_writer, DropReason, PacketRouter, RouteOutcome, RouterStatsSnapshot,
};
