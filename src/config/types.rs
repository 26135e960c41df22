//! Configuration types for tunnel-router
//!
//! This module defines all configuration structures used by the router.
//! Configuration is loaded from JSON and validated at startup.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::endpoint::{ProtocolKind, DEFAULT_HEADROOM, DEFAULT_TAILROOM};
use crate::error::ConfigError;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Tunnel definitions (one per stable tunnel tag)
    pub tunnels: Vec<TunnelConfig>,

    /// Routing policy for applications without a matching rule
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Buffer layout for the encryption bridge
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Flow table tuning
    #[serde(default)]
    pub flow: FlowConfig,

    /// Just-in-time establishment tuning
    #[serde(default)]
    pub jit: JitConfig,

    /// Inbound (tunnel -> interface) write path tuning
    #[serde(default)]
    pub inbound: InboundConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tunnels.is_empty() {
            return Err(ConfigError::validation(
                "At least one tunnel must be configured",
            ));
        }

        let mut tags: HashSet<&str> = HashSet::new();
        for tunnel in &self.tunnels {
            tunnel.validate()?;
            if !tags.insert(&tunnel.tag) {
                return Err(ConfigError::validation(format!(
                    "Duplicate tunnel tag: {}",
                    tunnel.tag
                )));
            }
        }

        self.buffer.validate()?;
        self.flow.validate()?;
        self.jit.validate()?;
        self.inbound.validate()?;

        Ok(())
    }

    /// Look up a tunnel definition by tag
    #[must_use]
    pub fn tunnel(&self, tag: &str) -> Option<&TunnelConfig> {
        self.tunnels.iter().find(|t| t.tag == tag)
    }

    /// Create a minimal default configuration with a single tunnel
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            tunnels: vec![TunnelConfig::new(
                "default",
                ProtocolKind::OpenVpn,
                vec![ServerCandidate::new("default-1", "127.0.0.1:1194")],
            )],
            policy: PolicyConfig::default(),
            buffer: BufferConfig::default(),
            flow: FlowConfig::default(),
            jit: JitConfig::default(),
            inbound: InboundConfig::default(),
        }
    }
}

/// One tunnel definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunnelConfig {
    /// Stable tunnel tag ("region-code" style), never reused concurrently
    pub tag: String,

    /// Tunnel protocol kind
    pub protocol: ProtocolKind,

    /// Candidate servers for this tunnel, in stable preference order
    pub servers: Vec<ServerCandidate>,

    /// MTU for packets entering this tunnel
    #[serde(default = "default_mtu")]
    pub mtu: usize,
}

impl TunnelConfig {
    /// Create a new tunnel definition
    #[must_use]
    pub fn new(
        tag: impl Into<String>,
        protocol: ProtocolKind,
        servers: Vec<ServerCandidate>,
    ) -> Self {
        Self {
            tag: tag.into(),
            protocol,
            servers,
            mtu: default_mtu(),
        }
    }

    /// Validate this tunnel definition
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tag.trim().is_empty() {
            return Err(ConfigError::validation("Tunnel tag must not be empty"));
        }
        if self.servers.is_empty() {
            return Err(ConfigError::validation(format!(
                "Tunnel '{}' has no server candidates",
                self.tag
            )));
        }
        if self.mtu < 576 || self.mtu > 9000 {
            return Err(ConfigError::validation(format!(
                "Tunnel '{}' MTU {} out of range (576..=9000)",
                self.tag, self.mtu
            )));
        }
        Ok(())
    }
}

/// One candidate server for a tunnel
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerCandidate {
    /// Human-readable server name
    pub name: String,

    /// Server endpoint
    pub endpoint: SocketAddr,
}

impl ServerCandidate {
    /// Create a new candidate
    ///
    /// # Panics
    ///
    /// Panics if `endpoint` is not a valid socket address. Intended for
    /// static configuration in tests and defaults.
    #[must_use]
    pub fn new(name: impl Into<String>, endpoint: &str) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.parse().expect("valid socket address"),
        }
    }
}

/// Routing policy for applications without a matching rule
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolicyConfig {
    /// Route unmatched applications direct (true) or drop them (false)
    #[serde(default = "default_true")]
    pub unmatched_direct: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            unmatched_direct: true,
        }
    }
}

/// Buffer layout for the encryption bridge
///
/// The headroom/tailroom defaults are sized to the worst case across
/// supported cipher suites, not tuned per suite.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BufferConfig {
    /// Bytes reserved before the payload for protocol/encryption headers
    #[serde(default = "default_headroom")]
    pub headroom: usize,

    /// Bytes reserved after the payload for authentication tags/padding
    #[serde(default = "default_tailroom")]
    pub tailroom: usize,
}

impl BufferConfig {
    /// Validate the buffer layout
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if either reservation is
    /// below the protocol-mandated minimum.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.headroom < DEFAULT_HEADROOM {
            return Err(ConfigError::validation(format!(
                "Headroom {} below minimum {DEFAULT_HEADROOM}",
                self.headroom
            )));
        }
        if self.tailroom < DEFAULT_TAILROOM {
            return Err(ConfigError::validation(format!(
                "Tailroom {} below minimum {DEFAULT_TAILROOM}",
                self.tailroom
            )));
        }
        Ok(())
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            headroom: default_headroom(),
            tailroom: default_tailroom(),
        }
    }
}

/// Flow table tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlowConfig {
    /// Seconds of inactivity before a flow entry is evicted
    #[serde(default = "default_flow_ttl_secs")]
    pub ttl_secs: u64,

    /// Seconds between eviction sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl FlowConfig {
    /// TTL as a `Duration`
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Sweep interval as a `Duration`
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Validate flow table tuning
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_secs == 0 {
            return Err(ConfigError::validation("Flow TTL must be non-zero"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::validation(
                "Flow sweep interval must be non-zero",
            ));
        }
        Ok(())
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_flow_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Just-in-time establishment tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JitConfig {
    /// Maximum buffered packets per pending flow
    #[serde(default = "default_per_flow_packets")]
    pub per_flow_max_packets: usize,

    /// Maximum buffered bytes per pending flow
    #[serde(default = "default_per_flow_bytes")]
    pub per_flow_max_bytes: usize,

    /// Global byte budget shared across all pending flows
    #[serde(default = "default_global_bytes")]
    pub global_max_bytes: usize,

    /// Hard timeout for tunnel establishment in seconds
    #[serde(default = "default_establish_timeout_secs")]
    pub establish_timeout_secs: u64,

    /// Per-candidate latency probe timeout in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Idle period after which an unreferenced tunnel is torn down, seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Seconds between idle reaper sweeps
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
}

impl JitConfig {
    /// Establishment timeout as a `Duration`
    #[must_use]
    pub const fn establish_timeout(&self) -> Duration {
        Duration::from_secs(self.establish_timeout_secs)
    }

    /// Probe timeout as a `Duration`
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Idle timeout as a `Duration`
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Reap interval as a `Duration`
    #[must_use]
    pub const fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    /// Validate JIT tuning
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.per_flow_max_packets == 0 {
            return Err(ConfigError::validation(
                "Per-flow packet bound must be non-zero",
            ));
        }
        if self.per_flow_max_bytes == 0 || self.global_max_bytes == 0 {
            return Err(ConfigError::validation("Byte budgets must be non-zero"));
        }
        if self.per_flow_max_bytes > self.global_max_bytes {
            return Err(ConfigError::validation(
                "Per-flow byte bound exceeds the global budget",
            ));
        }
        if self.establish_timeout_secs == 0 {
            return Err(ConfigError::validation(
                "Establishment timeout must be non-zero",
            ));
        }
        if self.probe_timeout_ms == 0 || self.reap_interval_secs == 0 {
            return Err(ConfigError::validation(
                "Probe timeout and reap interval must be non-zero",
            ));
        }
        Ok(())
    }
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            per_flow_max_packets: default_per_flow_packets(),
            per_flow_max_bytes: default_per_flow_bytes(),
            global_max_bytes: default_global_bytes(),
            establish_timeout_secs: default_establish_timeout_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            reap_interval_secs: default_reap_interval_secs(),
        }
    }
}

/// Inbound (tunnel -> interface) write path tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InboundConfig {
    /// Depth of the bounded channel feeding the single interface writer
    #[serde(default = "default_inbound_queue_depth")]
    pub queue_depth: usize,
}

impl InboundConfig {
    /// Validate inbound tuning
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_depth == 0 {
            return Err(ConfigError::validation(
                "Inbound queue depth must be non-zero",
            ));
        }
        Ok(())
    }
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_inbound_queue_depth(),
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_mtu() -> usize {
    1500
}

const fn default_headroom() -> usize {
    DEFAULT_HEADROOM
}

const fn default_tailroom() -> usize {
    DEFAULT_TAILROOM
}

const fn default_flow_ttl_secs() -> u64 {
    300
}

const fn default_sweep_interval_secs() -> u64 {
    30
}

const fn default_per_flow_packets() -> usize {
    64
}

const fn default_per_flow_bytes() -> usize {
    128 * 1024
}

const fn default_global_bytes() -> usize {
    4 * 1024 * 1024
}

const fn default_establish_timeout_secs() -> u64 {
    15
}

const fn default_probe_timeout_ms() -> u64 {
    2000
}

const fn default_idle_timeout_secs() -> u64 {
    180
}

const fn default_reap_interval_secs() -> u64 {
    15
}

const fn default_inbound_queue_depth() -> usize {
    1024
}
