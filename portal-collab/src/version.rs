//! Per-room version tracking.
//!
//! The tracker remembers, for each user, the last logical timestamp it has
//! accepted from them, plus a bounded window of recent changes. A new change
//! is reconciled against every change from *another* user on the *same*
//! widget that is newer than the submitter's recorded version, i.e. the
//! edits the submitter could not have seen.

use std::collections::HashMap;

use crate::change::Change;

/// Recent-change list length that triggers a trim.
pub const CHANGE_LOG_HIGH_WATER: usize = 1000;
/// Entries kept after a trim.
pub const CHANGE_LOG_KEEP: usize = 500;

/// User id → last accepted logical timestamp.
pub type VersionVector = HashMap<String, u64>;

/// Version vector plus bounded change window for a single room.
#[derive(Debug, Default, Clone)]
pub struct VersionTracker {
    versions: VersionVector,
    changes: Vec<Change>,
}

impl VersionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `change` and return the prior changes concurrent with it,
    /// oldest first, together with the updated version vector.
    ///
    /// Never fails; an empty window simply yields no concurrent changes.
    pub fn record_and_get_concurrent(&mut self, change: &Change) -> (Vec<Change>, VersionVector) {
        let user_version = self.version_of(&change.user_id);

        let mut concurrent: Vec<Change> = self
            .changes
            .iter()
            .filter(|h| {
                h.timestamp > user_version
                    && h.user_id != change.user_id
                    && h.widget_id == change.widget_id
            })
            .cloned()
            .collect();
        concurrent.sort_by_key(|c| c.timestamp);

        let entry = self.versions.entry(change.user_id.clone()).or_insert(0);
        *entry = (*entry).max(change.timestamp);

        self.changes.push(change.clone());
        if self.changes.len() > CHANGE_LOG_HIGH_WATER {
            let excess = self.changes.len() - CHANGE_LOG_KEEP;
            self.changes.drain(..excess);
        }

        (concurrent, self.versions.clone())
    }

    /// Last accepted timestamp for `user_id` (0 if never seen).
    pub fn version_of(&self, user_id: &str) -> u64 {
        self.versions.get(user_id).copied().unwrap_or(0)
    }

    pub fn versions(&self) -> &VersionVector {
        &self.versions
    }

    pub fn change_count(&self) -> usize {
        self.changes.len()
    }

    pub fn clear(&mut self) {
        self.versions.clear();
        self.changes.clear();
    }
}
