//! Resource blocks: variable-size placements inside one chunk.

use crate::ids::{BlockId, ChunkId, FrameId, ResourceKind};
use crate::metadata::BlockRecord;
use crate::tracker::SubAllocationTracker;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Lifecycle of a block as seen by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Accepting allocations and visible to consumers.
    Active,
    /// Still visible, but its live data is being moved to other chunks.
    Draining,
    /// Invalid since `since` until its contents are packed from offset 0.
    Compacting { since: FrameId },
    /// Invalid since `since`; destroyed once idle and unreferenced.
    Retiring { since: FrameId },
}

/// One block and its sub-allocation list.
#[derive(Debug)]
pub struct ResourceBlock {
    pub(crate) id: BlockId,
    pub(crate) chunk: ChunkId,
    pub(crate) offset: u64,
    pub(crate) kind: ResourceKind,
    pub(crate) long_lived: bool,
    pub(crate) state: BlockState,
    pub(crate) frame_tag: FrameId,
    pub(crate) usage: Arc<AtomicU32>,
    pub(crate) tracker: SubAllocationTracker,
}

impl ResourceBlock {
    pub(crate) fn new(
        id: BlockId,
        chunk: ChunkId,
        offset: u64,
        size: u64,
        kind: ResourceKind,
        long_lived: bool,
        frame_tag: FrameId,
    ) -> Self {
        Self {
            id,
            chunk,
            offset,
            kind,
            long_lived,
            state: BlockState::Active,
            frame_tag,
            usage: Arc::new(AtomicU32::new(0)),
            tracker: SubAllocationTracker::new(size),
        }
    }

    #[inline]
    pub fn id(&self) -> BlockId {
        self.id
    }

    #[inline]
    pub fn chunk(&self) -> ChunkId {
        self.chunk
    }

    /// Byte offset of the block inside its chunk.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.tracker.size()
    }

    #[inline]
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    #[inline]
    pub fn is_long_lived(&self) -> bool {
        self.long_lived
    }

    #[inline]
    pub fn state(&self) -> BlockState {
        self.state
    }

    #[inline]
    pub fn frame_tag(&self) -> FrameId {
        self.frame_tag
    }

    pub fn tracker(&self) -> &SubAllocationTracker {
        &self.tracker
    }

    /// Consumers may read this block's data.
    #[inline]
    pub fn is_valid(&self) -> bool {
        matches!(self.state, BlockState::Active | BlockState::Draining)
    }

    /// New sub-allocations and in-place growth may land here.
    #[inline]
    pub fn accepts_allocations(&self) -> bool {
        self.state == BlockState::Active
    }

    /// In-flight consumer uses.
    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.usage.load(Ordering::Acquire)
    }

    /// Directory entry describing this block.
    pub(crate) fn record(&self) -> BlockRecord {
        BlockRecord {
            chunk: self.chunk,
            offset: self.offset,
            size: self.size(),
            kind: self.kind,
            valid: self.is_valid(),
            frame_tag: self.frame_tag,
            long_lived: self.long_lived,
            usage: Arc::clone(&self.usage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity_follows_state() {
        let mut block = ResourceBlock::new(
            BlockId(1),
            ChunkId(0),
            0,
            4096,
            ResourceKind::Vertex,
            false,
            1,
        );
        assert!(block.is_valid() && block.accepts_allocations());
        block.state = BlockState::Draining;
        assert!(block.is_valid() && !block.accepts_allocations());
        block.state = BlockState::Compacting { since: 2 };
        assert!(!block.is_valid());
        assert!(!block.record().valid);
    }

    #[test]
    fn record_shares_the_reference_count() {
        let block = ResourceBlock::new(BlockId(1), ChunkId(0), 0, 4096, ResourceKind::Index, true, 3);
        let record = block.record();
        record.usage.fetch_add(2, Ordering::AcqRel);
        assert_eq!(block.ref_count(), 2);
        assert_eq!(record.frame_tag, 3);
        assert!(record.long_lived);
    }
}
