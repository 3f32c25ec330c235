//! Defragmentation manager.
//!
//! Runs on the producer between frames, in budgeted steps:
//!
//! 1. Finish compactions whose invalidation no busy frame can observe.
//! 2. Start (or continue) draining one under-utilized chunk into the others.
//! 3. Start compacting fragmented blocks by invalidating them.
//! 4. Release empty chunks above the resident minimum.
//!
//! A compaction packs a block's intervals from offset 0 with GPU copies; a
//! consolidation relocates intervals into other chunks one at a time. Both
//! leave the directory consistent after every single move, so a failed copy
//! just ends the step and is retried on a later frame.

use crate::allocator::AllocRequest;
use crate::backend::GpuBackend;
use crate::block::BlockState;
use crate::config::GpuMemConfig;
use crate::handles::HandleEntry;
use crate::ids::{BlockId, ChunkId, FrameId, Handle, SubAllocId};
use crate::metadata::DirectoryEdit;
use crate::producer::ProducerState;
use latch_metrics::RingBuffer;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DefragReport {
    pub compactions_started: usize,
    pub compactions_finished: usize,
    /// Intervals moved inside compacted blocks.
    pub sub_moves: usize,
    /// Intervals moved out of the draining chunk.
    pub relocations: usize,
    pub chunks_released: usize,
    pub failed_copies: usize,
}

enum RelocateError {
    /// No other chunk has room; growing the pool to consolidate is pointless.
    NoRoom,
    CopyFailed,
}

#[derive(Debug)]
pub struct Defragmenter {
    requests: RingBuffer<u64>,
    fragmentation_threshold: f32,
    low_utilization_threshold: f32,
    max_relocations: usize,
    revalidate_after: u64,
    consolidating: Option<ChunkId>,
}

impl Defragmenter {
    pub fn new(config: &GpuMemConfig) -> Self {
        Self {
            requests: RingBuffer::new(config.request_window),
            fragmentation_threshold: config.fragmentation_threshold,
            low_utilization_threshold: config.low_utilization_threshold,
            max_relocations: config.max_relocations_per_frame,
            revalidate_after: config.max_frames_in_flight,
            consolidating: None,
        }
    }

    /// Feed an allocation size into the rolling request window.
    pub fn observe_request(&mut self, size: u64) {
        self.requests.push(size);
    }

    /// Rolling average of recent allocation sizes.
    pub fn typical_request(&self) -> u64 {
        self.requests.average()
    }

    /// Chunk currently being emptied, if any.
    pub fn consolidating(&self) -> Option<ChunkId> {
        self.consolidating
    }

    pub(crate) fn run(
        &mut self,
        st: &mut ProducerState,
        backend: &dyn GpuBackend,
        oldest_busy: FrameId,
    ) -> DefragReport {
        let mut report = DefragReport::default();
        let mut budget = self.max_relocations;

        self.finish_compactions(st, backend, oldest_busy, &mut budget, &mut report);
        if self.consolidating.is_none() {
            self.start_consolidation(st);
        }
        self.continue_consolidation(st, backend, &mut budget, &mut report);
        self.start_compactions(st, budget, &mut report);
        self.release_empty_chunks(st, backend, &mut report);
        report
    }

    fn finish_compactions(
        &mut self,
        st: &mut ProducerState,
        backend: &dyn GpuBackend,
        oldest_busy: FrameId,
        budget: &mut usize,
        report: &mut DefragReport,
    ) {
        let ready: Vec<BlockId> = st
            .allocator
            .blocks()
            .filter(|b| match b.state() {
                BlockState::Compacting { since } => since <= oldest_busy && b.ref_count() == 0,
                _ => false,
            })
            .map(|b| b.id())
            .collect();
        for id in ready {
            if *budget == 0 {
                break;
            }
            *budget -= 1;
            self.compact(st, backend, id, report);
        }
    }

    /// Pack one invalidated block and make it visible again.
    fn compact(&mut self, st: &mut ProducerState, backend: &dyn GpuBackend, id: BlockId, report: &mut DefragReport) {
        // Nothing can observe this block any more, so retired intervals go first.
        for sub in st.retired.drain_block_subs(id) {
            st.allocator.free_sub(id, sub);
        }
        let Some(base) = st.allocator.block_address(id) else {
            return;
        };
        let moves = st
            .allocator
            .block(id)
            .map(|b| b.tracker().plan_compaction())
            .unwrap_or_default();

        for mv in moves {
            if let Err(err) = backend.copy_range(base + mv.from, base + mv.to, mv.size) {
                warn!(block = %id, error = %err, "compaction copy failed, retrying later");
                st.deferred_retries += 1;
                report.failed_copies += 1;
                break;
            }
            let Some(block) = st.allocator.block_mut(id) else {
                return;
            };
            if let Err(err) = block.tracker.relocate(mv.id, mv.to) {
                warn!(block = %id, error = %err, "compaction move rejected");
                break;
            }
            st.counters.increment("bytes_copied", mv.size);
            if let Some(handle) = st.handles.owner(id, mv.id) {
                if let Some(entry) = st.handles.update(handle, |e| e.offset = mv.to) {
                    st.publish_handle(handle, &entry);
                }
            }
            report.sub_moves += 1;
        }

        let pending = st.pending();
        let draining = st.allocator.draining();
        if let Some(block) = st.allocator.block_mut(id) {
            block.state = if draining == Some(block.chunk) {
                BlockState::Draining
            } else {
                BlockState::Active
            };
            block.frame_tag = pending;
        }
        st.publish_block(id);
        st.retire_if_empty(id);
        st.counters.increment("compactions", 1);
        report.compactions_finished += 1;
        debug!(block = %id, frame = pending, "compacted block");
    }

    fn start_compactions(&mut self, st: &mut ProducerState, budget: usize, report: &mut DefragReport) {
        let typical = self.typical_request();
        let threshold = self.fragmentation_threshold;
        let mut candidates: Vec<(f32, BlockId)> = st
            .allocator
            .blocks()
            .filter(|b| b.accepts_allocations() && !b.is_long_lived())
            .filter(|b| {
                let tracker = b.tracker();
                !tracker.is_empty()
                    && !tracker.is_compact()
                    && tracker.free_bytes() >= typical
                    && (tracker.fragmentation() > threshold || tracker.largest_free_run() < typical)
            })
            .map(|b| (b.tracker().fragmentation(), b.id()))
            .collect();
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));

        let since = st.pending();
        for (fragmentation, id) in candidates.into_iter().take(budget) {
            if let Some(block) = st.allocator.block_mut(id) {
                block.state = BlockState::Compacting { since };
                block.frame_tag = since + self.revalidate_after;
            }
            st.publish_block(id);
            report.compactions_started += 1;
            debug!(block = %id, since, fragmentation, "invalidated block for compaction");
        }
    }

    fn start_consolidation(&mut self, st: &mut ProducerState) {
        let allocator = &st.allocator;
        if !allocator.pool().above_minimum() {
            return;
        }
        let threshold = self.low_utilization_threshold;
        let candidate = allocator
            .pool()
            .iter()
            .filter(|c| !c.is_empty())
            .filter_map(|c| {
                let occupied = allocator.chunk_occupied_bytes(c.id());
                let utilization = occupied as f32 / c.capacity() as f32;
                (utilization < threshold).then_some((c.hosts_long_lived(), occupied, c.id()))
            })
            .filter(|&(_, occupied, id)| allocator.spare_capacity_excluding(id) >= occupied)
            .min();
        let Some((_, occupied, chunk)) = candidate else {
            return;
        };

        let blocks: Vec<BlockId> = allocator
            .pool()
            .get(chunk)
            .map(|c| c.blocks().collect())
            .unwrap_or_default();
        for id in blocks {
            if let Some(block) = st.allocator.block_mut(id) {
                if block.state == BlockState::Active {
                    block.state = BlockState::Draining;
                }
            }
        }
        st.allocator.set_draining(Some(chunk));
        self.consolidating = Some(chunk);
        info!(%chunk, occupied, "consolidating chunk");
    }

    fn continue_consolidation(
        &mut self,
        st: &mut ProducerState,
        backend: &dyn GpuBackend,
        budget: &mut usize,
        report: &mut DefragReport,
    ) {
        let Some(chunk) = self.consolidating else {
            return;
        };
        let Some(blocks) = st.allocator.pool().get(chunk).map(|c| c.blocks().collect::<Vec<_>>()) else {
            self.finish_consolidation(st);
            return;
        };

        // Transient data first; long-lived data only because the chunk must empty.
        let mut work: Vec<(bool, BlockId, SubAllocId, Handle)> = Vec::new();
        for id in blocks {
            let Some(block) = st.allocator.block(id) else {
                continue;
            };
            if block.state() != BlockState::Draining {
                continue;
            }
            for sub in block.tracker().occupied() {
                if let Some(handle) = st.handles.owner(id, sub.id) {
                    work.push((block.is_long_lived(), id, sub.id, handle));
                }
            }
        }
        work.sort();

        for (_, _, _, handle) in work {
            if *budget == 0 {
                return;
            }
            match Self::relocate(st, backend, chunk, handle) {
                Ok(()) => {
                    *budget -= 1;
                    report.relocations += 1;
                }
                Err(RelocateError::NoRoom) => {
                    warn!(%chunk, "no room left elsewhere, abandoning consolidation");
                    self.abandon_consolidation(st, chunk);
                    return;
                }
                Err(RelocateError::CopyFailed) => {
                    st.deferred_retries += 1;
                    report.failed_copies += 1;
                    return;
                }
            }
        }
    }

    /// Move one live interval out of `chunk`.
    fn relocate(
        st: &mut ProducerState,
        backend: &dyn GpuBackend,
        chunk: ChunkId,
        handle: Handle,
    ) -> Result<(), RelocateError> {
        let Some(entry) = st.handles.get(handle).copied() else {
            return Ok(());
        };
        let req = AllocRequest {
            exclude: Some(chunk),
            allow_new_chunk: false,
            ..AllocRequest::new(entry.size, entry.kind, entry.residency.is_long_lived())
        };
        let pending = st.pending();
        let placement = st
            .allocator
            .allocate(req, pending, backend)
            .map_err(|_| RelocateError::NoRoom)?;

        let copied = match (
            st.allocator.address_of(entry.block, entry.sub),
            st.allocator.address_of(placement.block, placement.sub),
        ) {
            (Some(src), Some(dst)) => backend.copy_range(src, dst, entry.size).map_err(|e| e.to_string()),
            _ => Err("interval has no address".to_string()),
        };
        if let Err(err) = copied {
            warn!(%handle, error = %err, "relocation copy failed, retrying later");
            st.allocator.rollback(placement, backend);
            return Err(RelocateError::CopyFailed);
        }

        st.publish_placement(&placement);
        let moved = HandleEntry {
            block: placement.block,
            sub: placement.sub,
            offset: placement.offset,
            placed_at: pending,
            ..entry
        };
        st.handles.replace(handle, moved);
        st.publish_handle(handle, &moved);
        let published = entry.is_published(st.committed);
        st.release_sub(entry.block, entry.sub, published);
        st.counters.increment("relocations", 1);
        st.counters.increment("bytes_copied", entry.size);
        debug!(%handle, from = %entry.block, to = %placement.block, size = entry.size, "relocated interval");
        Ok(())
    }

    fn abandon_consolidation(&mut self, st: &mut ProducerState, chunk: ChunkId) {
        let blocks: Vec<BlockId> = st
            .allocator
            .pool()
            .get(chunk)
            .map(|c| c.blocks().collect())
            .unwrap_or_default();
        for id in blocks {
            if let Some(block) = st.allocator.block_mut(id) {
                if block.state == BlockState::Draining {
                    block.state = BlockState::Active;
                }
            }
        }
        self.finish_consolidation(st);
    }

    fn finish_consolidation(&mut self, st: &mut ProducerState) {
        self.consolidating = None;
        st.allocator.set_draining(None);
    }

    fn release_empty_chunks(&mut self, st: &mut ProducerState, backend: &dyn GpuBackend, report: &mut DefragReport) {
        for chunk in st.allocator.pool().empty_chunks() {
            match st.allocator.pool_mut().release_chunk(chunk, backend) {
                Ok(true) => {
                    st.journal.record(DirectoryEdit::RemoveChunk(chunk));
                    st.counters.increment("chunks_released", 1);
                    report.chunks_released += 1;
                }
                Ok(false) => {}
                Err(err) => warn!(%chunk, error = %err, "chunk release rejected"),
            }
            // An emptied chunk kept resident is done draining either way.
            if self.consolidating == Some(chunk) {
                self.finish_consolidation(st);
            }
        }
    }
}
