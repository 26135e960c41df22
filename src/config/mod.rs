//! Configuration module for tunnel-router
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use tunnel_router::config::{load_config, Config};
//!
//! let config = load_config("/etc/tunnel-router/config.json").unwrap();
//! println!("Configured tunnels: {}", config.tunnels.len());
//! ```

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{
    BufferConfig, Config, FlowConfig, InboundConfig, JitConfig, PolicyConfig, ServerCandidate,
    TunnelConfig,
};
