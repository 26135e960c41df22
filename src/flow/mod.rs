//! Flow identification and connection tracking
//!
//! A flow is one transport-layer connection (5-tuple). This module
//! extracts flow keys from raw IP packets and tracks the owning
//! application and routing decision per flow.

mod key;
mod tracker;

pub use key::{FlowKey, Transport};
pub use tracker::{spawn_flow_sweeper, ConnectionEntry, ConnectionTracker, RouteDecision};
