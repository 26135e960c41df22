//! Error types for tunnel-router
//!
//! This module defines the error hierarchy for the per-application packet
//! router. All errors are categorized by subsystem and include recovery
//! hints. Nothing in this taxonomy is fatal to the process: every failure
//! degrades a single flow or tunnel, never the router as a whole.

use std::io;

use thiserror::Error;

use crate::endpoint::SendError;

/// Top-level error type for tunnel-router
#[derive(Debug, Error)]
pub enum RouterError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Flow classification errors
    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    /// Rule snapshot errors
    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    /// Tunnel endpoint errors
    #[error("Endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    /// Just-in-time establishment errors
    #[error("JIT error: {0}")]
    Jit(#[from] JitError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RouterError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Flow(e) => e.is_recoverable(),
            Self::Rule(e) => e.is_recoverable(),
            Self::Endpoint(e) => e.is_recoverable(),
            Self::Jit(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are generally not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// Flow classification errors
///
/// A classification failure drops the affected packet; it is never routed
/// blind to a tunnel it may not belong to.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Packet is not IPv4 or IPv6, or too short to carry an IP header
    #[error("Not an IP packet ({0} bytes)")]
    NotIp(usize),

    /// Packet carries a transport protocol without ports (no flow identity)
    #[error("Unsupported transport protocol: {0}")]
    UnsupportedTransport(u8),

    /// Packet is truncated mid-header
    #[error("Truncated packet: {0}")]
    Truncated(String),

    /// The external identity resolver failed for this flow
    #[error("Classification unavailable: {0}")]
    ClassificationUnavailable(String),
}

impl FlowError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::NotIp(_) | Self::UnsupportedTransport(_) | Self::Truncated(_) => false,
            // The resolver may succeed on a later packet of the same flow
            Self::ClassificationUnavailable(_) => true,
        }
    }
}

/// Rule snapshot errors
#[derive(Debug, Error)]
pub enum RuleError {
    /// Two rules target the same application in one snapshot
    #[error("Duplicate rule for application: {app}")]
    DuplicateRule { app: String },

    /// A rule references a tunnel id that is not configured
    #[error("Rule for {app} references unknown tunnel: {tunnel}")]
    UnknownTunnel { app: String, tunnel: String },
}

impl RuleError {
    /// Rule errors reject the offending snapshot; the previous one stays
    /// active, so the condition clears on the next valid snapshot.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }
}

/// Tunnel endpoint errors (lifecycle, not per-packet send)
///
/// Per-packet send failures are reported via [`SendError`] so the hot
/// path can branch on them without allocation.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// Backend failed to establish the tunnel
    #[error("Connect failed for tunnel {tunnel}: {reason}")]
    ConnectFailed { tunnel: String, reason: String },

    /// Establishment exceeded the hard timeout
    #[error("Tunnel {tunnel} did not connect within {timeout_secs}s")]
    ConnectTimeout { tunnel: String, timeout_secs: u64 },

    /// A tunnel with this id is already registered
    #[error("Tunnel already exists: {tunnel}")]
    AlreadyExists { tunnel: String },

    /// Tunnel id not present in the registry
    #[error("Tunnel not found: {tunnel}")]
    NotFound { tunnel: String },

    /// The endpoint is shutting down
    #[error("Endpoint is shutting down")]
    ShuttingDown,

    /// Per-packet send failure surfaced through the lifecycle API
    #[error("Send failed: {0}")]
    Send(#[from] SendError),
}

impl EndpointError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ConnectFailed { .. } | Self::ConnectTimeout { .. } => true,
            Self::AlreadyExists { .. } | Self::NotFound { .. } | Self::ShuttingDown => false,
            Self::Send(e) => e.is_recoverable(),
        }
    }

    /// Create a connect-failed error
    pub fn connect_failed(tunnel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            tunnel: tunnel.into(),
            reason: reason.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(tunnel: impl Into<String>) -> Self {
        Self::NotFound {
            tunnel: tunnel.into(),
        }
    }
}

/// Just-in-time establishment errors
#[derive(Debug, Error)]
pub enum JitError {
    /// The per-flow or global buffer budget was exceeded; the oldest
    /// buffered packet for the affected flow was dropped
    #[error("Buffer budget exceeded for flow (dropped {dropped} oldest)")]
    BufferBudgetExceeded { dropped: usize },

    /// No server candidates configured for the requested tunnel
    #[error("No server candidates for tunnel: {tunnel}")]
    NoCandidates { tunnel: String },

    /// Establishment did not complete within the hard timeout
    #[error("Establishment timed out for tunnel {tunnel} after {timeout_secs}s")]
    EstablishmentTimeout { tunnel: String, timeout_secs: u64 },

    /// Establishment is already in flight for this tunnel
    #[error("Establishment already in progress for tunnel: {tunnel}")]
    AlreadyConnecting { tunnel: String },
}

impl JitError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::BufferBudgetExceeded { .. }
            | Self::EstablishmentTimeout { .. }
            | Self::AlreadyConnecting { .. } => true,
            Self::NoCandidates { .. } => false,
        }
    }
}

/// Type alias for Result with `RouterError`
pub type Result<T> = std::result::Result<T, RouterError>;
