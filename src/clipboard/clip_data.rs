//! Clip-Data Ledger
//!
//! Server-side snapshots of client clipboard locks. A
//! [`ClipDataEntry`] is created on `LockClipboardData` (or implicitly
//! for lock-less clients), replaced when the client reuses an id, and
//! destroyed on `UnlockClipboardData`, drop timeout, or forced LRU
//! eviction when every id is in use.

use std::collections::HashMap;

use tracing::{debug, warn};

/// Default lifetime of a dropped-but-busy entry.
pub const CLIP_DATA_DROP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// One locked client clipboard snapshot.
#[derive(Debug)]
pub struct ClipDataEntry {
    /// Client-chosen id; `None` for the implicit lock-less entry.
    pub clip_data_id: Option<u32>,
    /// Unique, monotonically assigned serial.
    pub serial: u64,
    /// The snapshot announced a FileGroupDescriptorW.
    pub has_file_list: bool,
    /// File-contents requests against this entry are currently legal.
    pub requests_allowed: bool,
    /// Set when the selection was re-advertised and the entry now
    /// lives independently of the active selection.
    pub is_independent: bool,
    /// Main-loop timer id of the pending drop, if any.
    pub drop_timer: Option<u64>,
    /// Order marker for forced eviction.
    dropped_at: Option<u64>,
}

/// The per-session ledger of clipboard locks.
pub struct ClipDataLedger {
    entries: HashMap<u32, ClipDataEntry>,
    /// Implicit entry for clients without clip-data locking.
    implicit: Option<ClipDataEntry>,
    next_serial: u64,
    drop_counter: u64,
    capacity: usize,
}

impl Default for ClipDataLedger {
    fn default() -> Self {
        Self::new(u32::MAX as usize)
    }
}

impl ClipDataLedger {
    /// Ledger with a bounded id capacity (the protocol allows 2³²).
    pub fn new(capacity: usize) -> Self {
        ClipDataLedger {
            entries: HashMap::new(),
            implicit: None,
            next_serial: 1,
            drop_counter: 0,
            capacity: capacity.max(1),
        }
    }

    /// Lock a clipboard snapshot. Returns the replaced entry when the
    /// client reused an id (an abandoned lock), which the caller frees.
    pub fn lock(&mut self, clip_data_id: u32, has_file_list: bool) -> Option<ClipDataEntry> {
        let serial = self.next_serial;
        self.next_serial += 1;

        if self.entries.len() >= self.capacity && !self.entries.contains_key(&clip_data_id) {
            self.evict_least_recently_dropped();
        }

        let entry = ClipDataEntry {
            clip_data_id: Some(clip_data_id),
            serial,
            has_file_list,
            requests_allowed: true,
            is_independent: false,
            drop_timer: None,
            dropped_at: None,
        };

        let replaced = self.entries.insert(clip_data_id, entry);
        if replaced.is_some() {
            warn!(
                "protocol violation: clip data id {} locked twice, replacing entry",
                clip_data_id
            );
        }
        replaced
    }

    /// Release a lock. Returns the entry for the caller to drop or park
    /// behind its drop timer.
    pub fn unlock(&mut self, clip_data_id: u32) -> Option<ClipDataEntry> {
        let mut entry = self.entries.remove(&clip_data_id)?;
        self.drop_counter += 1;
        entry.dropped_at = Some(self.drop_counter);
        entry.requests_allowed = false;
        Some(entry)
    }

    /// Replace the implicit (lock-less) entry for a new selection.
    pub fn replace_implicit(&mut self, has_file_list: bool) -> (u64, Option<ClipDataEntry>) {
        let serial = self.next_serial;
        self.next_serial += 1;
        let old = self.implicit.replace(ClipDataEntry {
            clip_data_id: None,
            serial,
            has_file_list,
            requests_allowed: true,
            is_independent: false,
            drop_timer: None,
            dropped_at: None,
        });
        (serial, old)
    }

    pub fn get(&self, clip_data_id: u32) -> Option<&ClipDataEntry> {
        self.entries.get(&clip_data_id)
    }

    pub fn get_mut(&mut self, clip_data_id: u32) -> Option<&mut ClipDataEntry> {
        self.entries.get_mut(&clip_data_id)
    }

    pub fn implicit(&self) -> Option<&ClipDataEntry> {
        self.implicit.as_ref()
    }

    /// Entry count excluding the implicit one.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serials of every live entry, implicit included.
    pub fn serials(&self) -> Vec<u64> {
        let mut serials: Vec<u64> = self.entries.values().map(|e| e.serial).collect();
        if let Some(implicit) = &self.implicit {
            serials.push(implicit.serial);
        }
        serials
    }

    /// Drop everything (teardown).
    pub fn clear(&mut self) -> Vec<ClipDataEntry> {
        let mut entries: Vec<ClipDataEntry> = self.entries.drain().map(|(_, e)| e).collect();
        if let Some(implicit) = self.implicit.take() {
            entries.push(implicit);
        }
        entries
    }

    fn evict_least_recently_dropped(&mut self) {
        // All ids in use: evict the entry that was dropped longest ago,
        // falling back to the oldest serial.
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, e)| (e.dropped_at.unwrap_or(u64::MAX), e.serial))
            .map(|(&id, _)| id);
        if let Some(id) = victim {
            debug!("evicting clip data entry {}", id);
            self.entries.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_unlock_lifecycle() {
        let mut ledger = ClipDataLedger::default();

        assert!(ledger.lock(7, true).is_none());
        assert_eq!(ledger.len(), 1);
        let entry = ledger.get(7).unwrap();
        assert_eq!(entry.serial, 1);
        assert!(entry.has_file_list);

        let entry = ledger.unlock(7).unwrap();
        assert_eq!(entry.serial, 1);
        assert!(!entry.requests_allowed);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_relock_replaces_entry() {
        let mut ledger = ClipDataLedger::default();

        ledger.lock(7, false);
        let replaced = ledger.lock(7, true).unwrap();
        assert_eq!(replaced.serial, 1);
        assert_eq!(ledger.get(7).unwrap().serial, 2);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_serials_unique_across_entries() {
        let mut ledger = ClipDataLedger::default();
        ledger.lock(1, false);
        ledger.lock(2, false);
        let (implicit_serial, _) = ledger.replace_implicit(false);

        let mut serials = ledger.serials();
        serials.sort_unstable();
        assert_eq!(serials, vec![1, 2, implicit_serial]);
    }

    #[test]
    fn test_unlock_unknown_id() {
        let mut ledger = ClipDataLedger::default();
        assert!(ledger.unlock(42).is_none());
    }

    #[test]
    fn test_capacity_eviction() {
        let mut ledger = ClipDataLedger::new(2);
        ledger.lock(1, false);
        ledger.lock(2, false);

        // Ledger full: locking a third id evicts the oldest entry.
        ledger.lock(3, false);
        assert_eq!(ledger.len(), 2);
        assert!(ledger.get(1).is_none());
        assert!(ledger.get(2).is_some());
        assert!(ledger.get(3).is_some());
    }

    #[test]
    fn test_implicit_replacement() {
        let mut ledger = ClipDataLedger::default();
        let (first, old) = ledger.replace_implicit(false);
        assert!(old.is_none());

        let (second, old) = ledger.replace_implicit(true);
        assert_eq!(old.unwrap().serial, first);
        assert!(second > first);
        assert!(ledger.implicit().unwrap().has_file_list);
    }
}
