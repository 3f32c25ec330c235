//! Producer-side handle table.
//!
//! Slots are recycled through a free list with a bumped generation, so a
//! discarded handle never resolves to the resource that reuses its slot.

use crate::ids::{BlockId, FrameId, Handle, ResourceKind, Residency, SubAllocId};
use crate::metadata::HandleRecord;
use std::collections::HashMap;

/// Where one live resource currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleEntry {
    pub block: BlockId,
    pub sub: SubAllocId,
    /// Offset of the sub-allocation inside its block.
    pub offset: u64,
    /// Aligned interval size.
    pub size: u64,
    /// Bytes of live data.
    pub len: u64,
    pub kind: ResourceKind,
    pub residency: Residency,
    /// Pending frame in which this placement was made.
    pub placed_at: FrameId,
}

impl HandleEntry {
    pub fn record(&self) -> HandleRecord {
        HandleRecord {
            block: self.block,
            sub: self.sub,
            offset: self.offset,
            len: self.len,
            kind: self.kind,
        }
    }

    /// True once a commit at or after `placed_at` made it visible.
    #[inline]
    pub fn is_published(&self, committed: FrameId) -> bool {
        self.placed_at <= committed
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<HandleEntry>,
}

#[derive(Debug, Default)]
pub struct HandleTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    owners: HashMap<(BlockId, SubAllocId), Handle>,
}

impl HandleTable {
    pub fn insert(&mut self, entry: HandleEntry) -> Handle {
        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(entry);
                Handle::new(index, slot.generation)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                Handle::new(index, 0)
            }
        };
        self.owners.insert((entry.block, entry.sub), handle);
        handle
    }

    pub fn get(&self, handle: Handle) -> Option<&HandleEntry> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    /// Point `handle` at a new placement; returns the previous entry.
    pub fn replace(&mut self, handle: Handle, entry: HandleEntry) -> Option<HandleEntry> {
        let slot = self.slot_mut(handle)?;
        let previous = slot.entry.replace(entry)?;
        self.owners.remove(&(previous.block, previous.sub));
        self.owners.insert((entry.block, entry.sub), handle);
        Some(previous)
    }

    /// Change fields that do not move the placement.
    pub fn update(&mut self, handle: Handle, f: impl FnOnce(&mut HandleEntry)) -> Option<HandleEntry> {
        let entry = self.slot_mut(handle)?.entry.as_mut()?;
        let (block, sub) = (entry.block, entry.sub);
        f(entry);
        debug_assert_eq!((block, sub), (entry.block, entry.sub), "update moved a handle");
        Some(*entry)
    }

    pub fn remove(&mut self, handle: Handle) -> Option<HandleEntry> {
        let slot = self.slot_mut(handle)?;
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.owners.remove(&(entry.block, entry.sub));
        Some(entry)
    }

    /// Live handle occupying `sub` of `block`, if any.
    pub fn owner(&self, block: BlockId, sub: SubAllocId) -> Option<Handle> {
        self.owners.get(&(block, sub)).copied()
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &HandleEntry)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry
                .as_ref()
                .map(|entry| (Handle::new(index as u32, slot.generation), entry))
        })
    }

    fn slot_mut(&mut self, handle: Handle) -> Option<&mut Slot> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
    }
}
