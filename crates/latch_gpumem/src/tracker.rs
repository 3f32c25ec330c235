//! Interval bookkeeping for one contiguous byte range.
//!
//! Used inside every resource block for its sub-allocations, and inside every
//! chunk for its block placements. Entries are kept sorted by offset and
//! always tile `[0, size)` exactly; adjacent free entries are merged eagerly.

use crate::ids::{ResourceKind, SubAllocId};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubAllocState {
    Free,
    Occupied,
}

/// One interval of a tracked range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAllocation {
    pub id: SubAllocId,
    pub offset: u64,
    pub size: u64,
    pub kind: Option<ResourceKind>,
    pub state: SubAllocState,
}

impl SubAllocation {
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.state == SubAllocState::Free
    }
}

/// One step of a compaction plan: move `id` from `from` down to `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubMove {
    pub id: SubAllocId,
    pub from: u64,
    pub to: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    #[error("sub-allocation {0:?} does not exist")]
    Unknown(SubAllocId),
    #[error("sub-allocation {0:?} is already free")]
    AlreadyFree(SubAllocId),
    #[error("range {offset}..{end} is not free")]
    NotFree { offset: u64, end: u64 },
    #[error("size {0} is invalid here")]
    BadSize(u64),
}

/// Occupied/free interval list covering `[0, size)`.
#[derive(Debug, Clone)]
pub struct SubAllocationTracker {
    size: u64,
    entries: Vec<SubAllocation>,
    next_id: u32,
}

impl SubAllocationTracker {
    /// A tracker whose whole range is one free interval.
    pub fn new(size: u64) -> Self {
        assert!(size > 0, "tracked range must not be empty");
        Self {
            size,
            entries: vec![SubAllocation {
                id: SubAllocId(0),
                offset: 0,
                size,
                kind: None,
                state: SubAllocState::Free,
            }],
            next_id: 1,
        }
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubAllocation> {
        self.entries.iter()
    }

    pub fn occupied(&self) -> impl Iterator<Item = &SubAllocation> {
        self.entries.iter().filter(|e| !e.is_free())
    }

    pub fn get(&self, id: SubAllocId) -> Option<&SubAllocation> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn free_bytes(&self) -> u64 {
        self.entries.iter().filter(|e| e.is_free()).map(|e| e.size).sum()
    }

    pub fn occupied_bytes(&self) -> u64 {
        self.size - self.free_bytes()
    }

    pub fn largest_free_run(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.is_free())
            .map(|e| e.size)
            .max()
            .unwrap_or(0)
    }

    /// `freeBytes / size`.
    pub fn fragmentation(&self) -> f32 {
        self.free_bytes() as f32 / self.size as f32
    }

    /// True when no interval is occupied.
    pub fn is_empty(&self) -> bool {
        self.entries.len() == 1 && self.entries[0].is_free()
    }

    /// True when all occupied data is packed from offset 0 with at most one
    /// trailing free interval.
    pub fn is_compact(&self) -> bool {
        self.entries
            .iter()
            .position(|e| e.is_free())
            .map_or(true, |first_free| first_free == self.entries.len() - 1)
    }

    /// Smallest free interval that can hold `size` bytes.
    pub fn best_fit(&self, size: u64) -> Option<&SubAllocation> {
        self.entries
            .iter()
            .filter(|e| e.is_free() && e.size >= size)
            .min_by_key(|e| (e.size, e.offset))
    }

    /// Place `size` bytes in the best-fitting free interval.
    pub fn allocate(&mut self, size: u64, kind: Option<ResourceKind>) -> Option<SubAllocId> {
        if size == 0 {
            return None;
        }
        let offset = self.best_fit(size)?.offset;
        let id = self.fresh_id();
        self.carve(offset, size, id, kind).ok()?;
        Some(id)
    }

    /// Mark an interval free and merge it with free neighbours.
    pub fn free(&mut self, id: SubAllocId) -> Result<u64, TrackerError> {
        let idx = self.index_of(id)?;
        if self.entries[idx].is_free() {
            return Err(TrackerError::AlreadyFree(id));
        }
        let size = self.entries[idx].size;
        // Free intervals never keep an occupant's id.
        let id = self.fresh_id();
        let entry = &mut self.entries[idx];
        entry.id = id;
        entry.state = SubAllocState::Free;
        entry.kind = None;
        self.merge_around(idx);
        Ok(size)
    }

    /// Grow an occupied interval in place by absorbing its right free
    /// neighbour. Returns false (and changes nothing) if it does not fit.
    pub fn try_grow(&mut self, id: SubAllocId, new_size: u64) -> Result<bool, TrackerError> {
        let idx = self.index_of(id)?;
        let current = self.entries[idx].size;
        if new_size <= current {
            return Err(TrackerError::BadSize(new_size));
        }
        let delta = new_size - current;
        match self.entries.get(idx + 1) {
            Some(next) if next.is_free() && next.size >= delta => {}
            _ => return Ok(false),
        }
        self.entries[idx].size = new_size;
        let next = &mut self.entries[idx + 1];
        if next.size == delta {
            self.entries.remove(idx + 1);
        } else {
            next.offset += delta;
            next.size -= delta;
        }
        Ok(true)
    }

    /// Shrink an occupied interval, freeing its tail immediately.
    pub fn shrink(&mut self, id: SubAllocId, new_size: u64) -> Result<(), TrackerError> {
        let tail = self.split_tail(id, new_size)?;
        self.free(tail).map(|_| ())
    }

    /// Split the tail beyond `keep` bytes into its own occupied interval so it
    /// can be freed later.
    pub fn split_tail(&mut self, id: SubAllocId, keep: u64) -> Result<SubAllocId, TrackerError> {
        let idx = self.index_of(id)?;
        let entry = &self.entries[idx];
        if entry.is_free() {
            return Err(TrackerError::AlreadyFree(id));
        }
        if keep == 0 || keep >= entry.size {
            return Err(TrackerError::BadSize(keep));
        }
        let tail = SubAllocation {
            id: SubAllocId(self.next_id),
            offset: entry.offset + keep,
            size: entry.size - keep,
            kind: entry.kind,
            state: SubAllocState::Occupied,
        };
        self.next_id += 1;
        let tail_id = tail.id;
        self.entries[idx].size = keep;
        self.entries.insert(idx + 1, tail);
        Ok(tail_id)
    }

    /// Moves that pack every occupied interval from offset 0 upward, in
    /// ascending order. Each move only writes into free space or its own
    /// previous range, so applying a prefix of the plan is always consistent.
    pub fn plan_compaction(&self) -> Vec<SubMove> {
        let mut cursor = 0;
        let mut moves = Vec::new();
        for entry in self.occupied() {
            if entry.offset != cursor {
                moves.push(SubMove {
                    id: entry.id,
                    from: entry.offset,
                    to: cursor,
                    size: entry.size,
                });
            }
            cursor += entry.size;
        }
        moves
    }

    /// Move an occupied interval to `to`. The destination must be free once
    /// the interval's own range is released.
    pub fn relocate(&mut self, id: SubAllocId, to: u64) -> Result<(), TrackerError> {
        let idx = self.index_of(id)?;
        let entry = self.entries[idx].clone();
        if entry.is_free() {
            return Err(TrackerError::AlreadyFree(id));
        }
        self.free(id)?;
        if let Err(err) = self.carve(to, entry.size, id, entry.kind) {
            // Put it back where it was; that range was just freed.
            self.carve(entry.offset, entry.size, id, entry.kind)?;
            return Err(err);
        }
        Ok(())
    }

    /// Verify ordering, coverage and eager merging.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut cursor = 0;
        let mut prev_free = false;
        for entry in &self.entries {
            if entry.size == 0 {
                return Err(format!("{:?} is empty", entry.id));
            }
            if entry.offset != cursor {
                return Err(format!(
                    "{:?} starts at {} but previous interval ends at {}",
                    entry.id, entry.offset, cursor
                ));
            }
            if prev_free && entry.is_free() {
                return Err(format!("adjacent free intervals at {}", entry.offset));
            }
            prev_free = entry.is_free();
            cursor = entry.end();
        }
        if cursor != self.size {
            return Err(format!("intervals cover {} of {} bytes", cursor, self.size));
        }
        Ok(())
    }

    fn fresh_id(&mut self) -> SubAllocId {
        let id = SubAllocId(self.next_id);
        self.next_id += 1;
        id
    }

    fn index_of(&self, id: SubAllocId) -> Result<usize, TrackerError> {
        self.entries
            .iter()
            .position(|e| e.id == id)
            .ok_or(TrackerError::Unknown(id))
    }

    /// Turn `[offset, offset + size)` inside one free interval into an
    /// occupied interval, splitting off free leftovers on either side.
    fn carve(
        &mut self,
        offset: u64,
        size: u64,
        id: SubAllocId,
        kind: Option<ResourceKind>,
    ) -> Result<(), TrackerError> {
        let end = offset + size;
        let idx = self
            .entries
            .iter()
            .position(|e| e.is_free() && e.offset <= offset && end <= e.end())
            .ok_or(TrackerError::NotFree { offset, end })?;
        let free = self.entries[idx].clone();

        let mut replacement = Vec::with_capacity(3);
        if free.offset < offset {
            replacement.push(SubAllocation {
                id: free.id,
                offset: free.offset,
                size: offset - free.offset,
                kind: None,
                state: SubAllocState::Free,
            });
        }
        replacement.push(SubAllocation {
            id,
            offset,
            size,
            kind,
            state: SubAllocState::Occupied,
        });
        if end < free.end() {
            let tail_id = if free.offset < offset {
                self.fresh_id()
            } else {
                free.id
            };
            replacement.push(SubAllocation {
                id: tail_id,
                offset: end,
                size: free.end() - end,
                kind: None,
                state: SubAllocState::Free,
            });
        }
        self.entries.splice(idx..=idx, replacement);
        Ok(())
    }

    fn merge_around(&mut self, mut idx: usize) {
        if idx > 0 && self.entries[idx - 1].is_free() {
            let absorbed = self.entries.remove(idx);
            self.entries[idx - 1].size += absorbed.size;
            idx -= 1;
        }
        if idx + 1 < self.entries.len() && self.entries[idx + 1].is_free() {
            let absorbed = self.entries.remove(idx + 1);
            self.entries[idx].size += absorbed.size;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const K: u64 = 1024;

    fn filled(tracker: &mut SubAllocationTracker, count: usize, size: u64) -> Vec<SubAllocId> {
        (0..count)
            .map(|_| tracker.allocate(size, Some(ResourceKind::Vertex)).unwrap())
            .collect()
    }

    #[test]
    fn allocate_splits_and_keeps_remainder_free() {
        let mut t = SubAllocationTracker::new(1024 * K);
        let a = t.allocate(64 * K, None).unwrap();
        assert_eq!(t.get(a).unwrap().offset, 0);
        assert_eq!(t.free_bytes(), 960 * K);
        assert_eq!(t.iter().count(), 2);
        t.check_invariants().unwrap();
    }

    #[test]
    fn free_merges_left_and_right() {
        let mut t = SubAllocationTracker::new(256 * K);
        let ids = filled(&mut t, 4, 64 * K);
        t.free(ids[0]).unwrap();
        t.free(ids[2]).unwrap();
        assert_eq!(t.iter().count(), 4);
        t.free(ids[1]).unwrap();
        // 0..192K is one free run now.
        assert_eq!(t.iter().count(), 2);
        assert_eq!(t.largest_free_run(), 192 * K);
        t.check_invariants().unwrap();
        t.free(ids[3]).unwrap();
        assert!(t.is_empty());
    }

    #[test]
    fn double_free_is_rejected() {
        let mut t = SubAllocationTracker::new(64 * K);
        let a = t.allocate(K, None).unwrap();
        t.free(a).unwrap();
        assert_eq!(t.free(a), Err(TrackerError::Unknown(a)));
        assert!(t.get(a).is_none());
    }

    #[test]
    fn best_fit_prefers_smallest_hole() {
        let mut t = SubAllocationTracker::new(1024 * K);
        let ids = filled(&mut t, 6, 64 * K);
        // holes: 64K at ids[1], 128K at ids[3..5]
        t.free(ids[3]).unwrap();
        t.free(ids[4]).unwrap();
        t.free(ids[1]).unwrap();
        let b = t.allocate(32 * K, None).unwrap();
        assert_eq!(t.get(b).unwrap().offset, 64 * K);
        let c = t.allocate(100 * K, None).unwrap();
        assert_eq!(t.get(c).unwrap().offset, 192 * K);
        t.check_invariants().unwrap();
    }

    #[test]
    fn reuse_of_freed_space_at_equal_size() {
        let mut t = SubAllocationTracker::new(128 * K);
        let ids = filled(&mut t, 2, 64 * K);
        assert!(t.allocate(K, None).is_none());
        t.free(ids[0]).unwrap();
        let again = t.allocate(64 * K, None).unwrap();
        assert_eq!(t.get(again).unwrap().offset, 0);
    }

    #[test]
    fn grow_in_place_absorbs_right_neighbour() {
        let mut t = SubAllocationTracker::new(256 * K);
        let ids = filled(&mut t, 3, 64 * K);
        assert!(!t.try_grow(ids[0], 96 * K).unwrap());
        t.free(ids[1]).unwrap();
        assert!(t.try_grow(ids[0], 96 * K).unwrap());
        assert_eq!(t.get(ids[0]).unwrap().size, 96 * K);
        assert!(t.try_grow(ids[0], 128 * K).unwrap());
        // The hole was consumed entirely.
        assert_eq!(t.iter().filter(|e| e.is_free()).count(), 1);
        t.check_invariants().unwrap();
    }

    #[test]
    fn shrink_and_split_tail() {
        let mut t = SubAllocationTracker::new(256 * K);
        let a = t.allocate(128 * K, None).unwrap();
        let tail = t.split_tail(a, 32 * K).unwrap();
        assert_eq!(t.get(tail).unwrap().offset, 32 * K);
        assert_eq!(t.occupied_bytes(), 128 * K);
        t.free(tail).unwrap();
        assert_eq!(t.occupied_bytes(), 32 * K);
        t.shrink(a, 16 * K).unwrap();
        assert_eq!(t.occupied_bytes(), 16 * K);
        t.check_invariants().unwrap();
    }

    #[test]
    fn compaction_plan_packs_from_zero() {
        let mut t = SubAllocationTracker::new(512 * K);
        let ids = filled(&mut t, 6, 64 * K);
        t.free(ids[0]).unwrap();
        t.free(ids[2]).unwrap();
        t.free(ids[3]).unwrap();
        assert!(!t.is_compact());

        let plan = t.plan_compaction();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0], SubMove { id: ids[1], from: 64 * K, to: 0, size: 64 * K });
        for mv in &plan {
            t.relocate(mv.id, mv.to).unwrap();
            t.check_invariants().unwrap();
        }
        assert!(t.is_compact());
        assert_eq!(t.largest_free_run(), 320 * K);
        assert!(t.plan_compaction().is_empty());
    }

    #[test]
    fn relocate_into_occupied_range_is_rolled_back() {
        let mut t = SubAllocationTracker::new(256 * K);
        let ids = filled(&mut t, 2, 64 * K);
        assert!(t.relocate(ids[1], 0).is_err());
        assert_eq!(t.get(ids[1]).unwrap().offset, 64 * K);
        t.check_invariants().unwrap();
    }

    #[test]
    fn fragmentation_metrics() {
        let mut t = SubAllocationTracker::new(100 * K);
        let a = t.allocate(70 * K, None).unwrap();
        assert!((t.fragmentation() - 0.3).abs() < 1e-6);
        assert_eq!(t.largest_free_run(), 30 * K);
        t.free(a).unwrap();
        assert_eq!(t.fragmentation(), 1.0);
    }
}
