//! Membership Diff Tracker
//!
//! Turns successive children snapshots into join/leave sets relative to
//! the previously tracked set.

use std::collections::BTreeSet;

/// Difference between the tracked set and a new snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDiff {
    pub joined: BTreeSet<String>,
    pub left: BTreeSet<String>,
    pub unchanged: BTreeSet<String>,
}

impl MembershipDiff {
    /// Compute `left = P - N`, `joined = N - P`, `unchanged = P ∩ N`
    pub fn between(previous: &BTreeSet<String>, snapshot: &BTreeSet<String>) -> Self {
        Self {
            joined: snapshot.difference(previous).cloned().collect(),
            left: previous.difference(snapshot).cloned().collect(),
            unchanged: previous.intersection(snapshot).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

/// Result of feeding a snapshot to the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerUpdate {
    /// The tracker was unsynchronised; the snapshot replaced it wholesale
    Resynced(BTreeSet<String>),
    /// Incremental change relative to the tracked set
    Diff(MembershipDiff),
}

/// Process-local cache of the last observed children
#[derive(Debug, Default)]
pub struct MembershipDiffTracker {
    tracked: BTreeSet<String>,
    synced: bool,
}

impl MembershipDiffTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently tracked members
    pub fn tracked(&self) -> &BTreeSet<String> {
        &self.tracked
    }

    /// Whether the next snapshot will be diffed (true) or adopted (false)
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Forget the tracked set; the next snapshot is adopted without a diff.
    /// Called after any session interruption.
    pub fn reset(&mut self) {
        self.tracked.clear();
        self.synced = false;
    }

    /// Adopt `snapshot` as the tracked set
    pub fn resync(&mut self, snapshot: &BTreeSet<String>) {
        self.tracked = snapshot.clone();
        self.synced = true;
    }

    /// Feed a snapshot. Afterwards the tracked set equals `snapshot`.
    pub fn apply(&mut self, snapshot: &BTreeSet<String>) -> TrackerUpdate {
        if !self.synced {
            self.resync(snapshot);
            return TrackerUpdate::Resynced(snapshot.clone());
        }
        let diff = MembershipDiff::between(&self.tracked, snapshot);
        self.tracked = snapshot.clone();
        TrackerUpdate::Diff(diff)
    }
}
