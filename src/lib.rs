//! tunnel-router: per-application multi-tunnel packet routing engine
//!
//! This crate routes individual IP packets from a single local virtual
//! network interface to one of several independently-encrypted outbound
//! tunnels, chosen per originating application rather than per
//! destination. Different applications on one device can simultaneously
//! appear to originate from different network regions.
//!
//! # Features
//!
//! - **Flow Tracking**: 5-tuple connection tracking with stable per-flow
//!   classification, immune to mid-flow rule changes
//! - **Reactive Rules**: lock-free rule cache fed by the external rule
//!   store's snapshot stream
//! - **Buffer Bridge**: enforced headroom/tailroom layout on every
//!   packet handed to an encryption backend
//! - **Subnet Conflicts**: primary/secondary election when tunnels share
//!   an address space on one interface
//! - **JIT Establishment**: buffer-probe-connect-flush on first demand,
//!   with idle teardown
//!
//! # Architecture
//!
//! ```text
//! Interface read -> PacketRouter::classify -> TunnelEndpoint::send
//!                        |                        | (headroom/tailroom)
//!                  ConnectionTracker         Tunnel backend
//!                  RuleCache (ArcSwap)
//!                        |
//!                  JitOrchestrator::buffer (no live tunnel yet)
//!
//! Tunnel backend recv -> bounded channel -> single writer -> Interface
//! ```
//!
//! # Wiring
//!
//! ```no_run
//! use std::sync::Arc;
//! use tunnel_router::config::Config;
//! use tunnel_router::flow::ConnectionTracker;
//! use tunnel_router::jit::JitOrchestrator;
//! use tunnel_router::router::{spawn_interface_writer, PacketRouter, TunnelRegistry};
//! use tunnel_router::rules::{spawn_rule_subscriber, RuleCache};
//! use tunnel_router::subnet::SubnetAllocator;
//!
//! # async fn example(
//! #     factory: Arc<dyn tunnel_router::endpoint::BackendFactory>,
//! #     resolver: Arc<dyn tunnel_router::iface::IdentityResolver>,
//! #     direct: Arc<dyn tunnel_router::iface::DirectPath>,
//! #     iface: Arc<dyn tunnel_router::iface::VirtualInterface>,
//! #     rule_feed: tokio::sync::watch::Receiver<Arc<tunnel_router::rules::RuleSnapshot>>,
//! # ) {
//! let config = Arc::new(Config::default_config());
//! let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(config.inbound.queue_depth);
//!
//! let rules = Arc::new(RuleCache::new());
//! let tracker = Arc::new(ConnectionTracker::new());
//! let registry = Arc::new(TunnelRegistry::new());
//! let allocator = Arc::new(SubnetAllocator::new());
//! let jit = Arc::new(JitOrchestrator::new(
//!     Arc::clone(&config),
//!     Arc::clone(&registry),
//!     Arc::clone(&tracker),
//!     Arc::clone(&rules),
//!     factory,
//!     Arc::clone(&allocator),
//!     Arc::clone(&iface),
//!     inbound_tx,
//! ));
//!
//! let _rules_task = spawn_rule_subscriber(Arc::clone(&rules), rule_feed);
//! let _writer_task = spawn_interface_writer(Arc::clone(&iface), inbound_rx);
//! let _reaper_task = jit.spawn_idle_reaper();
//!
//! let router = PacketRouter::new(
//!     config, rules, tracker, registry, jit, resolver, direct, iface,
//! );
//! router.run().await;
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`endpoint`]: Tunnel endpoints and the buffer contract
//! - [`error`]: Error taxonomy
//! - [`flow`]: Flow keys and connection tracking
//! - [`iface`]: External collaborator traits
//! - [`jit`]: Just-in-time establishment and idle teardown
//! - [`router`]: Per-packet routing and the tunnel registry
//! - [`rules`]: Rule snapshots and the reactive cache
//! - [`subnet`]: Subnet conflict resolution

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod endpoint;
pub mod error;
pub mod flow;
pub mod iface;
pub mod jit;
pub mod router;
pub mod rules;
pub mod subnet;

// Re-export commonly used types at the crate root
pub use config::{Config, JitConfig, TunnelConfig};
pub use endpoint::{
    BackendFactory, PacketBuffer, ProtocolKind, SendError, TunnelBackend, TunnelEndpoint,
};
pub use error::{ConfigError, EndpointError, FlowError, JitError, RouterError, RuleError};
pub use flow::{ConnectionTracker, FlowKey, RouteDecision, Transport};
pub use iface::{DirectPath, IdentityResolver, InterfaceUpdate, VirtualInterface};
pub use jit::JitOrchestrator;
pub use router::{PacketRouter, RouteOutcome, TunnelRegistry};
pub use rules::{RoutingRule, RuleCache, RuleSnapshot, RuleTarget};
pub use subnet::{SubnetAllocator, SubnetRole};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
