//! Per-session position cache and the staleness policy.
//!
//! This is the only place that decides whether a cached position may be
//! broadcast; both event queue bodies go through it.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use together_common::PositionState;

/// Positions not refreshed within this window are stale.
pub const INACTIVITY_WINDOW: Duration = Duration::from_secs(60);

/// Current wall-clock time in unix epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Whether `entry` may appear in an outbound snapshot at `now_ms`.
pub fn is_valid(entry: &PositionState, now_ms: i64, window: Duration) -> bool {
    let oldest_allowed = now_ms.saturating_sub(window.as_millis() as i64);
    !entry.selector.is_empty() && !entry.location.is_empty() && entry.updated_at >= oldest_allowed
}

/// Drop every stale entry from `cache` in place.
pub fn filter_valid(cache: &mut HashMap<i64, PositionState>, now_ms: i64, window: Duration) {
    cache.retain(|_, entry| is_valid(entry, now_ms, window));
}

/// Last known position per member, plus the dirty flag the fan-out loop polls.
#[derive(Debug, Default)]
pub struct PositionCache {
    entries: HashMap<i64, PositionState>,
    outdated: bool,
}

impl PositionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the cache from a recovered snapshot. Stale entries are pruned.
    pub fn restore(&mut self, entries: HashMap<i64, PositionState>, now_ms: i64, window: Duration) {
        self.entries = entries;
        filter_valid(&mut self.entries, now_ms, window);
        self.outdated = !self.entries.is_empty();
    }

    /// Record `update` as the member's latest position (last write wins).
    pub fn apply(&mut self, update: PositionState) {
        self.entries.insert(update.member_id, update);
        self.outdated = true;
    }

    pub fn remove(&mut self, member_id: i64) -> bool {
        let removed = self.entries.remove(&member_id).is_some();
        if removed {
            self.outdated = true;
        }
        removed
    }

    /// Drop stale entries. A member ageing out changes what everyone should
    /// see, so the cache is marked outdated when anything was dropped.
    pub fn prune(&mut self, now_ms: i64, window: Duration) -> bool {
        let before = self.entries.len();
        filter_valid(&mut self.entries, now_ms, window);
        let dropped = self.entries.len() != before;
        if dropped {
            self.outdated = true;
        }
        dropped
    }

    /// Prune, clear the dirty flag and return the remaining entries ordered by member id.
    pub fn take_snapshot(&mut self, now_ms: i64, window: Duration) -> Vec<PositionState> {
        self.prune(now_ms, window);
        self.outdated = false;
        let mut snapshot: Vec<PositionState> = self.entries.values().cloned().collect();
        snapshot.sort_by_key(|entry| entry.member_id);
        snapshot
    }

    pub fn mark_outdated(&mut self) {
        self.outdated = true;
    }

    pub fn is_outdated(&self) -> bool {
        self.outdated
    }

    pub fn entries(&self) -> &HashMap<i64, PositionState> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn position(member_id: i64, selector: &str, updated_at: i64) -> PositionState {
        PositionState {
            member_id,
            x: 10.0,
            y: 20.0,
            selector: selector.to_string(),
            location: "/p".to_string(),
            updated_at,
        }
    }

    #[test]
    fn empty_selector_or_location_is_stale() {
        assert!(!is_valid(&position(1, "", NOW), NOW, INACTIVITY_WINDOW));

        let mut no_location = position(1, "#a", NOW);
        no_location.location.clear();
        assert!(!is_valid(&no_location, NOW, INACTIVITY_WINDOW));

        assert!(is_valid(&position(1, "#a", NOW), NOW, INACTIVITY_WINDOW));
    }

    #[test]
    fn entries_older_than_window_are_stale() {
        let edge = NOW - 60_000;
        assert!(is_valid(&position(1, "#a", edge), NOW, INACTIVITY_WINDOW));
        assert!(!is_valid(&position(1, "#a", edge - 1), NOW, INACTIVITY_WINDOW));
    }

    #[test]
    fn last_write_wins_per_member() {
        let mut cache = PositionCache::new();
        cache.apply(position(1, "#a", NOW));
        cache.apply(position(1, "#b", NOW + 1));
        cache.apply(position(2, "#c", NOW));

        let snapshot = cache.take_snapshot(NOW + 1, INACTIVITY_WINDOW);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].member_id, 1);
        assert_eq!(snapshot[0].selector, "#b");
        assert_eq!(snapshot[1].member_id, 2);
    }

    #[test]
    fn snapshot_removes_stale_entries_from_cache() {
        let mut cache = PositionCache::new();
        cache.apply(position(1, "#a", NOW - 120_000));
        cache.apply(position(2, "#b", NOW));
        cache.apply(position(3, "", NOW));

        let snapshot = cache.take_snapshot(NOW, INACTIVITY_WINDOW);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].member_id, 2);
        // Pruned, not just hidden.
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn snapshot_clears_dirty_flag() {
        let mut cache = PositionCache::new();
        assert!(!cache.is_outdated());
        cache.apply(position(1, "#a", NOW));
        assert!(cache.is_outdated());
        cache.take_snapshot(NOW, INACTIVITY_WINDOW);
        assert!(!cache.is_outdated());
    }

    #[test]
    fn remove_marks_dirty_only_when_something_left() {
        let mut cache = PositionCache::new();
        assert!(!cache.remove(9));
        assert!(!cache.is_outdated());

        cache.apply(position(9, "#a", NOW));
        cache.take_snapshot(NOW, INACTIVITY_WINDOW);
        assert!(cache.remove(9));
        assert!(cache.is_outdated());
        assert!(cache.is_empty());
    }

    #[test]
    fn ageing_out_marks_dirty() {
        let mut cache = PositionCache::new();
        cache.apply(position(1, "#a", NOW));
        cache.take_snapshot(NOW, INACTIVITY_WINDOW);

        assert!(!cache.prune(NOW + 1_000, INACTIVITY_WINDOW));
        assert!(!cache.is_outdated());

        assert!(cache.prune(NOW + 60_001, INACTIVITY_WINDOW));
        assert!(cache.is_outdated());
        assert!(cache.take_snapshot(NOW + 60_001, INACTIVITY_WINDOW).is_empty());
    }

    #[test]
    fn restore_prunes_recovered_entries() {
        let mut cache = PositionCache::new();
        let recovered = HashMap::from([
            (1, position(1, "#a", NOW)),
            (2, position(2, "#b", NOW - 600_000)),
        ]);
        cache.restore(recovered, NOW, INACTIVITY_WINDOW);
        assert_eq!(cache.len(), 1);
        assert!(cache.entries().contains_key(&1));
        assert!(cache.is_outdated());
    }
}
