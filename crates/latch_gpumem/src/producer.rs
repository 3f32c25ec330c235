//! Geometry producer: the single writer.
//!
//! Every mutation lands in the pending frame's journal and becomes visible
//! to consumers only when [`Producer::commit`] publishes it. Data that may
//! already be visible is never overwritten: updates go to a fresh interval,
//! and the old interval is retired until no busy frame can still observe it.

use crate::allocator::{AllocRequest, BlockAllocator, Placement};
use crate::backend::GpuBackend;
use crate::block::BlockState;
use crate::config::GpuMemConfig;
use crate::defrag::{DefragReport, Defragmenter};
use crate::error::{GpuMemError, GpuMemResult};
use crate::handles::{HandleEntry, HandleTable};
use crate::ids::{BlockId, FrameId, GpuAddress, Handle, ResourceKind, Residency, SubAllocId};
use crate::metadata::{ChunkRecord, DirectoryEdit, Journal};
use crate::Shared;
use latch_metrics::{Counter, FrameLedger};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Frames of history kept by the per-frame ledger.
const LEDGER_FRAMES: usize = 120;

/// Something waiting for every frame that could observe it to go idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retiree {
    Sub { block: BlockId, sub: SubAllocId },
    Block(BlockId),
}

/// Retirees in the order they were queued, tagged with the first frame
/// that no longer references them.
#[derive(Debug, Default)]
pub(crate) struct RetireQueue {
    entries: VecDeque<(FrameId, Retiree)>,
}

impl RetireQueue {
    pub(crate) fn push(&mut self, frame: FrameId, item: Retiree) {
        self.entries.push_back((frame, item));
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Remove every retired interval of `block`.
    pub(crate) fn drain_block_subs(&mut self, block: BlockId) -> Vec<SubAllocId> {
        let mut subs = Vec::new();
        self.entries.retain(|&(_, item)| match item {
            Retiree::Sub { block: b, sub } if b == block => {
                subs.push(sub);
                false
            }
            _ => true,
        });
        subs
    }
}

/// Result of a commit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommitOutcome {
    Committed { frame: FrameId, edits: usize },
    Deferred(DeferReason),
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeferReason {
    /// Too many frames in flight; waiting on this frame's fence.
    FencePending(FrameId),
    /// A consumer still holds the copy that would be overwritten.
    ReadersActive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub subs_freed: usize,
    pub blocks_destroyed: usize,
}

/// Memory accounting snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub committed_frame: FrameId,
    pub chunks: usize,
    pub blocks: usize,
    pub handles: usize,
    /// Bytes of device memory held in chunks.
    pub resident_bytes: u64,
    /// Bytes covered by blocks.
    pub placed_bytes: u64,
    /// Bytes covered by occupied sub-allocations, live or retired.
    pub occupied_bytes: u64,
    /// Free bytes inside blocks.
    pub free_bytes: u64,
    pub pending_retirements: usize,
    pub deferred_retries: u64,
    pub in_flight_frames: usize,
}

/// Everything [`Producer::end_frame`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameReport {
    pub commit: CommitOutcome,
    pub gc: GcReport,
    pub defrag: DefragReport,
    pub stats: MemoryStats,
}

/// Producer bookkeeping shared with the defragmenter.
#[derive(Debug)]
pub(crate) struct ProducerState {
    pub(crate) config: GpuMemConfig,
    pub(crate) allocator: BlockAllocator,
    pub(crate) handles: HandleTable,
    pub(crate) journal: Journal,
    pub(crate) retired: RetireQueue,
    /// Frame currently visible to consumers.
    pub(crate) committed: FrameId,
    pub(crate) deferred_retries: u64,
    pub(crate) counters: Counter,
}

impl ProducerState {
    /// Frame the journal is building.
    #[inline]
    pub(crate) fn pending(&self) -> FrameId {
        self.committed + 1
    }

    pub(crate) fn address_of(&self, block: BlockId, sub: SubAllocId) -> GpuMemResult<GpuAddress> {
        self.allocator
            .address_of(block, sub)
            .ok_or(GpuMemError::MissingInterval { block, sub })
    }

    pub(crate) fn publish_block(&mut self, id: BlockId) {
        if let Some(block) = self.allocator.block(id) {
            self.journal.record(DirectoryEdit::UpsertBlock(id, block.record()));
        }
    }

    /// Journal the block and chunk a placement created.
    pub(crate) fn publish_placement(&mut self, placement: &Placement) {
        if let Some(chunk_id) = placement.new_chunk {
            if let Some(chunk) = self.allocator.pool().get(chunk_id) {
                let record = ChunkRecord {
                    base: chunk.base(),
                    capacity: chunk.capacity(),
                };
                self.journal.record(DirectoryEdit::UpsertChunk(chunk_id, record));
            }
            self.counters.increment("chunks_acquired", 1);
        }
        if placement.new_block {
            self.publish_block(placement.block);
            self.counters.increment("blocks_created", 1);
        }
    }

    pub(crate) fn publish_handle(&mut self, handle: Handle, entry: &HandleEntry) {
        self.journal
            .record(DirectoryEdit::UpsertHandle(handle, entry.record()));
    }

    /// Give an interval back: immediately if nobody has seen it, otherwise
    /// once every frame that could is idle.
    pub(crate) fn release_sub(&mut self, block: BlockId, sub: SubAllocId, published: bool) {
        if published {
            let frame = self.pending();
            self.retired.push(frame, Retiree::Sub { block, sub });
        } else {
            self.allocator.free_sub(block, sub);
            self.retire_if_empty(block);
        }
    }

    /// Invalidate a block that no longer holds any data.
    pub(crate) fn retire_if_empty(&mut self, id: BlockId) {
        let since = self.pending();
        let Some(block) = self.allocator.block_mut(id) else {
            return;
        };
        if !block.tracker.is_empty() || matches!(block.state, BlockState::Retiring { .. }) {
            return;
        }
        block.state = BlockState::Retiring { since };
        self.publish_block(id);
        self.retired.push(since, Retiree::Block(id));
        trace!(block = %id, since, "retiring empty block");
    }

    /// Reclaim everything retired at or before `oldest_busy`.
    pub(crate) fn collect(&mut self, oldest_busy: FrameId) -> GcReport {
        let mut report = GcReport::default();
        let mut waiting = VecDeque::new();
        for (frame, item) in std::mem::take(&mut self.retired.entries) {
            if frame > oldest_busy {
                waiting.push_back((frame, item));
                continue;
            }
            match item {
                Retiree::Sub { block, sub } => {
                    if self.allocator.free_sub(block, sub) {
                        report.subs_freed += 1;
                    }
                    self.retire_if_empty(block);
                }
                Retiree::Block(id) => match self.allocator.block(id) {
                    Some(block) if block.ref_count() > 0 => waiting.push_back((frame, item)),
                    Some(_) => {
                        self.allocator.destroy_block(id);
                        self.journal.record(DirectoryEdit::RemoveBlock(id));
                        self.counters.increment("blocks_destroyed", 1);
                        report.blocks_destroyed += 1;
                    }
                    None => {}
                },
            }
        }
        // Blocks emptied above were queued behind the waiting entries.
        waiting.extend(self.retired.entries.drain(..));
        self.retired.entries = waiting;
        report
    }
}

/// The single writer. Unique by construction: not `Clone`.
pub struct Producer<B: GpuBackend> {
    shared: Arc<Shared<B>>,
    state: ProducerState,
    defrag: Defragmenter,
    ledger: FrameLedger,
}

impl<B: GpuBackend> Producer<B> {
    pub(crate) fn new(shared: Arc<Shared<B>>, config: GpuMemConfig) -> Self {
        let committed = shared.store.current_frame();
        Self {
            shared,
            defrag: Defragmenter::new(&config),
            state: ProducerState {
                allocator: BlockAllocator::new(&config),
                config,
                handles: HandleTable::default(),
                journal: Journal::default(),
                retired: RetireQueue::default(),
                committed,
                deferred_retries: 0,
                counters: Counter::new(),
            },
            ledger: FrameLedger::new(LEDGER_FRAMES),
        }
    }

    pub fn config(&self) -> &GpuMemConfig {
        &self.state.config
    }

    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    pub fn allocator(&self) -> &BlockAllocator {
        &self.state.allocator
    }

    pub fn defragmenter(&self) -> &Defragmenter {
        &self.defrag
    }

    pub fn counters(&self) -> &Counter {
        &self.state.counters
    }

    pub fn ledger(&self) -> &FrameLedger {
        &self.ledger
    }

    /// Frame currently visible to consumers.
    pub fn committed_frame(&self) -> FrameId {
        self.state.committed
    }

    /// Frame the next commit will publish.
    pub fn pending_frame(&self) -> FrameId {
        self.state.pending()
    }

    /// Producer-side view of a live handle.
    pub fn get(&self, handle: Handle) -> Option<&HandleEntry> {
        self.state.handles.get(handle)
    }

    pub fn address_of(&self, handle: Handle) -> Option<GpuAddress> {
        let entry = self.state.handles.get(handle)?;
        self.state.allocator.address_of(entry.block, entry.sub)
    }

    pub fn create(&mut self, kind: ResourceKind, bytes: &[u8]) -> GpuMemResult<Handle> {
        self.create_with(kind, bytes, Residency::Transient)
    }

    /// Create effectively permanent data in a dedicated long-lived block.
    pub fn create_long_lived(&mut self, kind: ResourceKind, bytes: &[u8]) -> GpuMemResult<Handle> {
        self.create_with(kind, bytes, Residency::LongLived)
    }

    pub fn create_with(
        &mut self,
        kind: ResourceKind,
        bytes: &[u8],
        residency: Residency,
    ) -> GpuMemResult<Handle> {
        let size = self.aligned_size(bytes.len() as u64)?;
        let placement = self.place(size, kind, residency)?;
        self.upload_into(&placement, bytes)?;
        self.state.publish_placement(&placement);

        let entry = HandleEntry {
            block: placement.block,
            sub: placement.sub,
            offset: placement.offset,
            size,
            len: bytes.len() as u64,
            kind,
            residency,
            placed_at: self.state.pending(),
        };
        let handle = self.state.handles.insert(entry);
        self.state.publish_handle(handle, &entry);
        self.defrag.observe_request(size);
        trace!(%handle, block = %entry.block, size, "created resource");
        Ok(handle)
    }

    /// Replace a resource's contents.
    pub fn update(&mut self, handle: Handle, bytes: &[u8]) -> GpuMemResult<()> {
        let entry = *self
            .state
            .handles
            .get(handle)
            .ok_or(GpuMemError::HandleNotFound(handle))?;
        let size = self.aligned_size(bytes.len() as u64)?;
        let published = entry.is_published(self.state.committed);

        if !published && size <= entry.size {
            let address = self.state.address_of(entry.block, entry.sub)?;
            self.shared.backend.upload_bytes(address, bytes)?;
            self.state.counters.increment("bytes_uploaded", bytes.len() as u64);
            if let Some(updated) = self.state.handles.update(handle, |e| e.len = bytes.len() as u64) {
                self.state.publish_handle(handle, &updated);
            }
            return Ok(());
        }

        let placement = self.place(size, entry.kind, entry.residency)?;
        self.upload_into(&placement, bytes)?;
        self.move_handle(handle, &entry, &placement, size, bytes.len() as u64);
        self.defrag.observe_request(size);
        trace!(%handle, block = %placement.block, size, "updated resource out of place");
        Ok(())
    }

    /// Reject empty and chunk-sized-plus requests before rounding.
    fn aligned_size(&self, len: u64) -> GpuMemResult<u64> {
        let limit = self.state.config.chunk_size;
        if len == 0 {
            return Err(GpuMemError::ZeroSized);
        }
        if len > limit {
            return Err(GpuMemError::AllocationTooLarge { requested: len, limit });
        }
        Ok(self.state.config.align(len))
    }

    /// Change a resource's length. Bytes past the old length are undefined.
    pub fn resize(&mut self, handle: Handle, len: u64) -> GpuMemResult<()> {
        let entry = *self
            .state
            .handles
            .get(handle)
            .ok_or(GpuMemError::HandleNotFound(handle))?;
        let size = self.aligned_size(len)?;
        let published = entry.is_published(self.state.committed);

        if size > entry.size && !self.state.allocator.try_grow(entry.block, entry.sub, size) {
            return self.relocate_for_growth(handle, &entry, size, len);
        }
        if size < entry.size {
            if published {
                // Older frames may still read the tail; retire it separately.
                let tail = self
                    .state
                    .allocator
                    .split_tail(entry.block, entry.sub, size)
                    .ok_or(GpuMemError::HandleNotFound(handle))?;
                self.state.release_sub(entry.block, tail, true);
            } else if !self.state.allocator.shrink_sub(entry.block, entry.sub, size) {
                return Err(GpuMemError::MissingInterval {
                    block: entry.block,
                    sub: entry.sub,
                });
            }
        }
        if let Some(updated) = self.state.handles.update(handle, |e| {
            e.size = size;
            e.len = len;
        }) {
            self.state.publish_handle(handle, &updated);
        }
        Ok(())
    }

    /// Drop a resource. Its bytes are reclaimed once no busy frame can
    /// observe them.
    pub fn discard(&mut self, handle: Handle) -> GpuMemResult<()> {
        let entry = self
            .state
            .handles
            .remove(handle)
            .ok_or(GpuMemError::HandleNotFound(handle))?;
        self.state.journal.record(DirectoryEdit::RemoveHandle(handle));
        let published = entry.is_published(self.state.committed);
        self.state.release_sub(entry.block, entry.sub, published);
        trace!(%handle, published, "discarded resource");
        Ok(())
    }

    /// Publish the pending frame if the fences allow it.
    pub fn commit(&mut self) -> CommitOutcome {
        let frame = self.state.pending();
        let token = match self.shared.sync.ready_to_commit(frame, &self.shared.backend) {
            Ok(token) => token,
            Err(blocking) => {
                self.state.counters.increment("deferred_commits", 1);
                return CommitOutcome::Deferred(DeferReason::FencePending(blocking));
            }
        };
        match self.shared.store.publish(&mut self.state.journal, token) {
            Some(edits) => {
                self.state.committed = frame;
                self.state.counters.increment("commits", 1);
                debug!(frame, edits, "committed frame");
                CommitOutcome::Committed { frame, edits }
            }
            None => {
                self.state.counters.increment("deferred_commits", 1);
                debug!(frame, "commit deferred: readers hold the next copy");
                CommitOutcome::Deferred(DeferReason::ReadersActive)
            }
        }
    }

    /// Reclaim retired intervals and blocks no busy frame can observe.
    pub fn collect_garbage(&mut self) -> GcReport {
        let oldest = self.oldest_busy();
        self.state.collect(oldest)
    }

    /// Run one budgeted defragmentation step.
    pub fn defragment(&mut self) -> DefragReport {
        let oldest = self.oldest_busy();
        self.defrag
            .run(&mut self.state, &self.shared.backend, oldest)
    }

    /// Commit, collect garbage, and defragment.
    pub fn end_frame(&mut self) -> FrameReport {
        let commit = self.commit();
        let gc = self.collect_garbage();
        let defrag = self.defragment();
        let stats = self.stats();
        latch_metrics::metrics! {
            let frame = stats.committed_frame;
            self.ledger.record(frame, "resident_bytes", stats.resident_bytes);
            self.ledger.record(frame, "occupied_bytes", stats.occupied_bytes);
            self.ledger.record(frame, "chunks", stats.chunks as u64);
            self.ledger.record(frame, "relocations", defrag.relocations as u64);
        }
        FrameReport {
            commit,
            gc,
            defrag,
            stats,
        }
    }

    pub fn stats(&self) -> MemoryStats {
        let allocator = &self.state.allocator;
        let (placed_bytes, occupied_bytes) = allocator
            .blocks()
            .fold((0, 0), |(placed, occupied), b| {
                (placed + b.size(), occupied + b.tracker().occupied_bytes())
            });
        MemoryStats {
            committed_frame: self.state.committed,
            chunks: allocator.pool().len(),
            blocks: allocator.blocks().count(),
            handles: self.state.handles.len(),
            resident_bytes: allocator.pool().len() as u64 * allocator.pool().chunk_size(),
            placed_bytes,
            occupied_bytes,
            free_bytes: placed_bytes - occupied_bytes,
            pending_retirements: self.state.retired.len(),
            deferred_retries: self.state.deferred_retries,
            in_flight_frames: self.shared.sync.in_flight(),
        }
    }

    /// Cross-check the handle table against the allocator.
    pub fn check_invariants(&self) -> Result<(), String> {
        self.state.allocator.check_invariants()?;
        for (handle, entry) in self.state.handles.iter() {
            let block = self
                .state
                .allocator
                .block(entry.block)
                .ok_or_else(|| format!("{handle} points at missing {}", entry.block))?;
            let sub = block
                .tracker()
                .get(entry.sub)
                .ok_or_else(|| format!("{handle} points at a missing interval"))?;
            if sub.is_free() || sub.offset != entry.offset || sub.size != entry.size {
                return Err(format!(
                    "{handle} expects {}+{} but {} has {:?}",
                    entry.offset, entry.size, entry.block, sub
                ));
            }
            if entry.len > entry.size {
                return Err(format!("{handle} length {} exceeds its interval", entry.len));
            }
        }
        Ok(())
    }

    fn oldest_busy(&self) -> FrameId {
        self.shared.sync.poll(&self.shared.backend);
        self.shared.sync.oldest_busy(self.state.committed)
    }

    /// Place without growing the pool first; collect garbage and retry
    /// before acquiring a chunk.
    fn place(&mut self, size: u64, kind: ResourceKind, residency: Residency) -> GpuMemResult<Placement> {
        let req = AllocRequest::new(size, kind, residency.is_long_lived());
        let pending = self.state.pending();
        let existing = AllocRequest {
            allow_new_chunk: false,
            ..req
        };
        match self.state.allocator.allocate(existing, pending, &self.shared.backend) {
            Err(GpuMemError::OutOfDeviceMemory { .. }) => {}
            other => return other,
        }
        self.collect_garbage();
        self.state.allocator.allocate(req, pending, &self.shared.backend)
    }

    /// Upload into a fresh placement, rolling it back on failure.
    fn upload_into(&mut self, placement: &Placement, bytes: &[u8]) -> GpuMemResult<()> {
        let result = self
            .state
            .address_of(placement.block, placement.sub)
            .and_then(|address| Ok(self.shared.backend.upload_bytes(address, bytes)?));
        match result {
            Ok(()) => {
                self.state.counters.increment("bytes_uploaded", bytes.len() as u64);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "upload failed, rolling back placement");
                self.state.allocator.rollback(*placement, &self.shared.backend);
                Err(err)
            }
        }
    }

    fn relocate_for_growth(
        &mut self,
        handle: Handle,
        entry: &HandleEntry,
        size: u64,
        len: u64,
    ) -> GpuMemResult<()> {
        let placement = self.place(size, entry.kind, entry.residency)?;
        let copied = self
            .state
            .address_of(entry.block, entry.sub)
            .and_then(|src| {
                let dst = self.state.address_of(placement.block, placement.sub)?;
                Ok(self.shared.backend.copy_range(src, dst, entry.size)?)
            });
        if let Err(err) = copied {
            warn!(%handle, error = %err, "copy failed, rolling back resize");
            self.state.allocator.rollback(placement, &self.shared.backend);
            return Err(err);
        }
        self.state.counters.increment("bytes_copied", entry.size);
        self.move_handle(handle, entry, &placement, size, len);
        trace!(%handle, block = %placement.block, size, "resized resource out of place");
        Ok(())
    }

    /// Point `handle` at `placement` and release its previous interval.
    fn move_handle(&mut self, handle: Handle, entry: &HandleEntry, placement: &Placement, size: u64, len: u64) {
        self.state.publish_placement(placement);
        let moved = HandleEntry {
            block: placement.block,
            sub: placement.sub,
            offset: placement.offset,
            size,
            len,
            placed_at: self.state.pending(),
            ..*entry
        };
        self.state.handles.replace(handle, moved);
        self.state.publish_handle(handle, &moved);
        let published = entry.is_published(self.state.committed);
        self.state.release_sub(entry.block, entry.sub, published);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;

    #[test]
    fn missing_interval_is_reported_as_such() {
        let (mut producer, _consumers) = crate::init(GpuMemConfig::default(), HostBackend::new()).unwrap();
        let handle = producer.create(ResourceKind::Vertex, &[1u8; 512]).unwrap();
        let entry = *producer.get(handle).unwrap();

        let err = producer.state.address_of(entry.block, SubAllocId(u32::MAX)).unwrap_err();
        assert!(matches!(
            err,
            GpuMemError::MissingInterval { block, sub } if block == entry.block && sub == SubAllocId(u32::MAX)
        ));
        assert!(producer.state.address_of(entry.block, entry.sub).is_ok());
    }
}
