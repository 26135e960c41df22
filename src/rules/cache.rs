//! Reactive rule cache with lock-free reads
//!
//! The cache holds an immutable [`RuleSnapshot`] behind an `ArcSwap` so
//! the packet-routing hot path can look up rules without taking a lock,
//! while snapshot updates from the external rule store swap the whole
//! map atomically.
//!
//! ```text
//! Packet -> RuleCache::lookup() -> ArcSwap::load() -> RuleSnapshot
//!                                        |
//!                                 (lock-free read)
//!
//! Rule store -> watch feed -> subscriber task -> ArcSwap::store()
//!                                                     |
//!                                               (atomic swap)
//! ```
//!
//! Concurrent lookups therefore always observe exactly one applied
//! snapshot, never a mix of two. Propagation from the external store is
//! eventually consistent; routing one packet against a stale rule is a
//! staleness window, not a correctness violation.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::types::{RuleSnapshot, RuleTarget};

/// In-memory mapping from application identity to routing target
pub struct RuleCache {
    snapshot: ArcSwap<RuleSnapshot>,
}

impl RuleCache {
    /// Create a cache holding an empty snapshot
    #[must_use]
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::new(RuleSnapshot::empty()),
        }
    }

    /// Create a cache from an initial snapshot
    #[must_use]
    pub fn with_snapshot(snapshot: Arc<RuleSnapshot>) -> Self {
        Self {
            snapshot: ArcSwap::new(snapshot),
        }
    }

    /// Look up the routing target for an application identity.
    ///
    /// Non-blocking and O(1); safe to call from the interface-reader
    /// context. An unknown identity yields `None` — the caller decides
    /// between direct routing and dropping per policy.
    #[must_use]
    pub fn lookup(&self, app: &str) -> Option<RuleTarget> {
        let snapshot = self.snapshot.load();
        let rule = snapshot.get(app)?;
        trace!(
            "Rule hit for {}: {:?} (snapshot v{})",
            app,
            rule.target,
            snapshot.version()
        );
        Some(rule.target.clone())
    }

    /// Whether the rule permits falling back to the direct path when its
    /// target tunnel cannot be established
    #[must_use]
    pub fn fallback_allowed(&self, app: &str) -> bool {
        self.snapshot
            .load()
            .get(app)
            .is_some_and(|r| r.fallback_to_direct)
    }

    /// Atomically replace the entire rule set.
    ///
    /// Lookups racing with this call observe either the old snapshot or
    /// the new one in full.
    pub fn apply_snapshot(&self, snapshot: Arc<RuleSnapshot>) {
        debug!(
            "Applying rule snapshot v{} ({} rules)",
            snapshot.version(),
            snapshot.len()
        );
        self.snapshot.store(snapshot);
    }

    /// Version of the currently applied snapshot
    #[must_use]
    pub fn current_version(&self) -> u64 {
        self.snapshot.load().version()
    }

    /// Number of rules currently visible
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    /// Check if no rules are visible
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }
}

impl Default for RuleCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RuleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleCache")
            .field("version", &self.current_version())
            .field("rules", &self.len())
            .finish()
    }
}

/// Spawn the subscriber task that keeps `cache` current from the rule
/// store's snapshot feed.
///
/// The task ends when the feed's sender side is dropped. Each received
/// value is a full snapshot; there is no incremental patching, so a
/// missed intermediate update only widens the staleness window.
pub fn spawn_rule_subscriber(
    cache: Arc<RuleCache>,
    mut feed: watch::Receiver<Arc<RuleSnapshot>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // Apply whatever the store currently holds before waiting for
        // changes, so a late-starting router doesn't route against an
        // empty cache.
        cache.apply_snapshot(feed.borrow_and_update().clone());

        while feed.changed().await.is_ok() {
            let snapshot = feed.borrow_and_update().clone();
            cache.apply_snapshot(snapshot);
        }
        debug!("Rule feed closed; subscriber exiting");
    })
}
