//! Routing rule types
//!
//! A rule maps one application identity to a tunnel tag or to the direct
//! path. Rules are owned by the external rule store; this crate only ever
//! holds immutable snapshots of them.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::RuleError;

/// Where a rule sends an application's traffic
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "tunnel")]
pub enum RuleTarget {
    /// Route through the tunnel with this tag
    Tunnel(String),
    /// Route outside all tunnels
    Direct,
}

impl RuleTarget {
    /// The tunnel tag, if this target is a tunnel
    #[must_use]
    pub fn tunnel_tag(&self) -> Option<&str> {
        match self {
            Self::Tunnel(tag) => Some(tag),
            Self::Direct => None,
        }
    }
}

/// One routing rule: application identity -> target
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RoutingRule {
    /// Application identity (package/executable name style)
    pub app: String,

    /// Target for this application's new flows
    pub target: RuleTarget,

    /// Fall back to the direct path when the target tunnel cannot be
    /// established; when false, the flow's traffic is dropped instead
    #[serde(default)]
    pub fallback_to_direct: bool,
}

impl RoutingRule {
    /// Create a rule routing `app` through `tunnel`
    #[must_use]
    pub fn tunnel(app: impl Into<String>, tunnel: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            target: RuleTarget::Tunnel(tunnel.into()),
            fallback_to_direct: false,
        }
    }

    /// Create a rule routing `app` direct
    #[must_use]
    pub fn direct(app: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            target: RuleTarget::Direct,
            fallback_to_direct: false,
        }
    }

    /// Enable fallback-to-direct on establishment failure
    #[must_use]
    pub fn with_fallback(mut self) -> Self {
        self.fallback_to_direct = true;
        self
    }
}

/// An immutable, versioned snapshot of the full rule set.
///
/// At most one rule per application identity. Snapshots are replaced
/// wholesale; they are never mutated after construction.
#[derive(Debug, Default)]
pub struct RuleSnapshot {
    rules: HashMap<String, RoutingRule>,
    version: u64,
}

impl RuleSnapshot {
    /// An empty snapshot at version 0
    #[must_use]
    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Look up the rule for an application identity
    #[must_use]
    pub fn get(&self, app: &str) -> Option<&RoutingRule> {
        self.rules.get(app)
    }

    /// Snapshot version (monotonically increasing across applied snapshots)
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Number of rules in this snapshot
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Check if the snapshot holds no rules
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Builder for a `RuleSnapshot`
#[derive(Debug, Default)]
pub struct RuleSnapshotBuilder {
    rules: HashMap<String, RoutingRule>,
    version: u64,
}

impl RuleSnapshotBuilder {
    /// Create an empty builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule
    ///
    /// # Errors
    ///
    /// Returns `RuleError::DuplicateRule` if a rule for the same
    /// application identity was already added.
    pub fn add_rule(&mut self, rule: RoutingRule) -> Result<&mut Self, RuleError> {
        if self.rules.contains_key(&rule.app) {
            return Err(RuleError::DuplicateRule {
                app: rule.app.clone(),
            });
        }
        self.rules.insert(rule.app.clone(), rule);
        Ok(self)
    }

    /// Set the snapshot version
    #[must_use]
    pub fn version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Build the immutable snapshot
    #[must_use]
    pub fn build(self) -> Arc<RuleSnapshot> {
        Arc::new(RuleSnapshot {
            rules: self.rules,
            version: self.version,
        })
    }
}
