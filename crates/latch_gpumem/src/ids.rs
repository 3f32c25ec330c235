//! Identity types shared by every component.
//!
//! Chunks, blocks and sub-allocations are referenced by index, never by
//! address, so relocating data only rewrites table entries.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Frame counter. Frame 0 is the empty directory published at startup.
pub type FrameId = u64;

/// Address in the backend's GPU address space.
pub type GpuAddress = u64;

/// Identity of a chunk owned by the chunk pool. Never reused.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(pub(crate) u32);

/// Identity of a resource block. Never reused.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub(crate) u32);

/// Identity of a sub-allocation, unique within its tracker.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubAllocId(pub(crate) u32);

impl ChunkId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl BlockId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl SubAllocId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk#{}", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block#{}", self.0)
    }
}

/// Producer-issued resource handle (generation-indexed for safety).
///
/// Format: [32-bit index | 32-bit generation]
/// - Index: slot in the producer's handle table
/// - Generation: bumped when the slot is recycled, so a discarded handle
///   never aliases the resource that reuses its slot
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl Handle {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Pack into a single `u64` (index in the low half).
    pub fn to_raw(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}v{}", self.index, self.generation)
    }
}

/// What a sub-allocation holds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Vertex,
    Index,
    Other,
}

/// Lifetime class chosen at create time.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Residency {
    /// Regular data: freely compacted and relocated.
    #[default]
    Transient,
    /// Effectively permanent data: kept in dedicated blocks and only moved
    /// when a chunk cannot be emptied otherwise.
    LongLived,
}

impl Residency {
    #[inline]
    pub fn is_long_lived(self) -> bool {
        matches!(self, Residency::LongLived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_raw_packing() {
        let h = Handle::new(7, 3);
        let raw = h.to_raw();
        assert_eq!(raw, (3u64 << 32) | 7);
        assert_eq!(Handle::from_raw(raw), h);
    }

    #[test]
    fn handles_differ_by_generation() {
        assert_ne!(Handle::new(1, 0), Handle::new(1, 1));
    }
}
