//! Regions (chunks): contiguous spans of the logical address space with
//! uniform kind flags, per-region usage accounting, and a free-space
//! index.
//!
//! A region's mutable state sits behind its own lock; the region itself is
//! shared via `Arc` and destroyed only by the allocator, never by the
//! relocation engine.

use cbfs_types::LogicalAddress;
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;

/// One region of the logical address space.
#[derive(Debug)]
pub struct Region {
    /// First logical byte covered by this region.
    pub start: LogicalAddress,
    /// Region size in bytes.
    pub length: u64,
    /// Kind flags (`REGION_METADATA`, replication bits, ...).
    pub kind: u64,
    state: Mutex<RegionState>,
}

/// Counters and free-space index, guarded by the per-region lock.
#[derive(Debug)]
pub struct RegionState {
    /// Bytes currently allocated out of this region.
    pub used: u64,
    pub readonly: bool,
    /// Set while the balance driver is draining this region.
    pub relocating: bool,
    /// Free spans: start -> length, non-overlapping, coalesced.
    free: BTreeMap<u64, u64>,
}

impl Region {
    /// A fresh region is fully free.
    #[must_use]
    pub fn new(start: LogicalAddress, length: u64, kind: u64) -> Self {
        let mut free = BTreeMap::new();
        if length > 0 {
            free.insert(start.0, length);
        }
        Self {
            start,
            length,
            kind,
            state: Mutex::new(RegionState {
                used: 0,
                readonly: false,
                relocating: false,
                free,
            }),
        }
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.start.0.saturating_add(self.length)
    }

    #[must_use]
    pub fn contains(&self, address: LogicalAddress) -> bool {
        address.0 >= self.start.0 && address.0 < self.end()
    }

    pub fn lock(&self) -> MutexGuard<'_, RegionState> {
        self.state.lock()
    }
}

impl RegionState {
    pub fn adjust_used(&mut self, delta: i64) {
        if delta >= 0 {
            self.used = self.used.saturating_add(delta.unsigned_abs());
        } else {
            self.used = self.used.saturating_sub(delta.unsigned_abs());
        }
    }

    /// First-fit search for `len` contiguous free bytes. Does not mutate.
    #[must_use]
    pub fn find_span(&self, len: u64) -> Option<u64> {
        self.free
            .iter()
            .find(|(_, span_len)| **span_len >= len)
            .map(|(start, _)| *start)
    }

    /// Remove `[start, start+len)` from the free index. Returns `false`
    /// when the range is not fully contained in one free span.
    pub fn take_span(&mut self, start: u64, len: u64) -> bool {
        let Some((&span_start, &span_len)) = self.free.range(..=start).next_back() else {
            return false;
        };
        let Some(end) = start.checked_add(len) else {
            return false;
        };
        let span_end = span_start.saturating_add(span_len);
        if start < span_start || end > span_end {
            return false;
        }
        self.free.remove(&span_start);
        if start > span_start {
            self.free.insert(span_start, start - span_start);
        }
        if end < span_end {
            self.free.insert(end, span_end - end);
        }
        true
    }

    /// Return `[start, start+len)` to the free index, coalescing with
    /// adjacent spans.
    pub fn put_span(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut start = start;
        let mut len = len;
        let prev = self
            .free
            .range(..start)
            .next_back()
            .map(|(s, l)| (*s, *l));
        if let Some((prev_start, prev_len)) = prev {
            if prev_start.saturating_add(prev_len) == start {
                self.free.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        let next = self
            .free
            .range(start + len..)
            .next()
            .map(|(s, l)| (*s, *l));
        if let Some((next_start, next_len)) = next {
            if start + len == next_start {
                self.free.remove(&next_start);
                len += next_len;
            }
        }
        self.free.insert(start, len);
    }

    /// Total free bytes tracked by the index.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.free.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_region_is_fully_free() {
        let region = Region::new(LogicalAddress(0x10_0000), 0x4_0000, cbfs_types::REGION_METADATA);
        let state = region.lock();
        assert_eq!(state.free_bytes(), 0x4_0000);
        assert_eq!(state.find_span(0x1000), Some(0x10_0000));
    }

    #[test]
    fn take_splits_span() {
        let region = Region::new(LogicalAddress(0x1000), 0x3000, 0);
        let mut state = region.lock();
        assert!(state.take_span(0x2000, 0x1000));
        assert_eq!(state.free_bytes(), 0x2000);
        // Remaining spans: [0x1000,0x2000) and [0x3000,0x4000).
        assert_eq!(state.find_span(0x1000), Some(0x1000));
        assert!(state.take_span(0x1000, 0x1000));
        assert_eq!(state.find_span(0x1000), Some(0x3000));
    }

    #[test]
    fn take_rejects_uncovered_range() {
        let region = Region::new(LogicalAddress(0x1000), 0x1000, 0);
        let mut state = region.lock();
        assert!(!state.take_span(0x1800, 0x1000));
        assert!(!state.take_span(0x0, 0x800));
        assert_eq!(state.free_bytes(), 0x1000);
    }

    #[test]
    fn put_coalesces_neighbors() {
        let region = Region::new(LogicalAddress(0x1000), 0x3000, 0);
        let mut state = region.lock();
        assert!(state.take_span(0x1000, 0x3000));
        state.put_span(0x1000, 0x1000);
        state.put_span(0x3000, 0x1000);
        assert_eq!(state.free_bytes(), 0x2000);
        state.put_span(0x2000, 0x1000);
        assert_eq!(state.free_bytes(), 0x3000);
        assert_eq!(state.find_span(0x3000), Some(0x1000));
    }

    #[test]
    fn contains_respects_bounds() {
        let region = Region::new(LogicalAddress(0x1000), 0x1000, 0);
        assert!(region.contains(LogicalAddress(0x1000)));
        assert!(region.contains(LogicalAddress(0x1FFF)));
        assert!(!region.contains(LogicalAddress(0x2000)));
        assert!(!region.contains(LogicalAddress(0xFFF)));
    }
}
