//! Tunnel endpoints and the encryption-bridge buffer contract
//!
//! One endpoint wraps one tunnel backend: it owns the headroom/tailroom
//! buffer layout on the send path, the inbound pump on the receive path,
//! and the per-tunnel lifecycle state machine.

mod backend;
mod bridge;
mod buffer;
mod state;

pub use backend::{
    BackendFactory, BackendState, ProtocolKind, SendError, TunnelAssignment, TunnelBackend,
};
pub use bridge::{EndpointStats, EndpointStatsSnapshot, InboundPacket, TunnelEndpoint};
pub use buffer::{BufferError, PacketBuffer, DEFAULT_HEADROOM, DEFAULT_TAILROOM};
pub use state::EndpointState;
