//! Routing rules: snapshot types and the reactive cache
//!
//! The external rule store owns the app -> tunnel mapping and pushes full
//! snapshots on every change; this module consumes that feed and serves
//! lock-free lookups to the packet-routing hot path.

mod cache;
mod types;

pub use cache::{spawn_rule_subscriber, RuleCache};
pub use types::{RoutingRule, RuleSnapshot, RuleSnapshotBuilder, RuleTarget};
