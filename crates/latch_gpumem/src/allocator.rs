//! Block allocator: best-fit placement across blocks and chunks.
//!
//! Lookup order for a request:
//! 1. the smallest sufficient free interval in any compatible block,
//! 2. a new block in an existing chunk with a large enough free run,
//! 3. a new chunk from the pool, with the block at offset 0.

use crate::backend::GpuBackend;
use crate::block::ResourceBlock;
use crate::chunk_pool::ChunkPool;
use crate::config::{GpuMemConfig, PlacementPolicy};
use crate::error::{GpuMemError, GpuMemResult};
use crate::ids::{BlockId, ChunkId, FrameId, GpuAddress, ResourceKind, SubAllocId};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// What the caller needs placed.
#[derive(Debug, Clone, Copy)]
pub struct AllocRequest {
    /// Aligned size in bytes.
    pub size: u64,
    pub kind: ResourceKind,
    pub long_lived: bool,
    /// Never place into this chunk (the chunk being emptied).
    pub exclude: Option<ChunkId>,
    pub allow_new_chunk: bool,
}

impl AllocRequest {
    pub fn new(size: u64, kind: ResourceKind, long_lived: bool) -> Self {
        Self {
            size,
            kind,
            long_lived,
            exclude: None,
            allow_new_chunk: true,
        }
    }
}

/// Where a request landed, and what had to be created for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub block: BlockId,
    pub sub: SubAllocId,
    /// Offset of the sub-allocation inside its block.
    pub offset: u64,
    pub size: u64,
    pub new_block: bool,
    pub new_chunk: Option<ChunkId>,
}

/// Per-block fragmentation figures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockMetrics {
    pub block: BlockId,
    pub size: u64,
    pub free_bytes: u64,
    pub largest_free_run: u64,
    pub fragmentation: f32,
    pub compact: bool,
}

/// Chunks, blocks and the placement policy.
#[derive(Debug)]
pub struct BlockAllocator {
    pool: ChunkPool,
    blocks: BTreeMap<BlockId, ResourceBlock>,
    next_block: u32,
    block_size: u64,
    placement: PlacementPolicy,
    draining: Option<ChunkId>,
}

impl BlockAllocator {
    pub fn new(config: &GpuMemConfig) -> Self {
        Self {
            pool: ChunkPool::new(config.chunk_size, config.min_resident_chunks, config.max_chunks),
            blocks: BTreeMap::new(),
            next_block: 0,
            block_size: config.block_size,
            placement: config.placement,
            draining: None,
        }
    }

    pub fn pool(&self) -> &ChunkPool {
        &self.pool
    }

    pub(crate) fn pool_mut(&mut self) -> &mut ChunkPool {
        &mut self.pool
    }

    pub fn block(&self, id: BlockId) -> Option<&ResourceBlock> {
        self.blocks.get(&id)
    }

    pub(crate) fn block_mut(&mut self, id: BlockId) -> Option<&mut ResourceBlock> {
        self.blocks.get_mut(&id)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &ResourceBlock> {
        self.blocks.values()
    }

    /// Chunk whose contents are being consolidated away, if any.
    pub fn draining(&self) -> Option<ChunkId> {
        self.draining
    }

    pub(crate) fn set_draining(&mut self, chunk: Option<ChunkId>) {
        self.draining = chunk;
    }

    /// Absolute address of a sub-allocation.
    pub fn address_of(&self, block: BlockId, sub: SubAllocId) -> Option<GpuAddress> {
        let block = self.blocks.get(&block)?;
        let chunk = self.pool.get(block.chunk)?;
        let entry = block.tracker.get(sub)?;
        Some(chunk.base() + block.offset + entry.offset)
    }

    /// Place `req.size` bytes, growing the pool only as a last resort.
    pub fn allocate(
        &mut self,
        req: AllocRequest,
        frame: FrameId,
        backend: &dyn GpuBackend,
    ) -> GpuMemResult<Placement> {
        if req.size > self.pool.chunk_size() {
            return Err(GpuMemError::AllocationTooLarge {
                requested: req.size,
                limit: self.pool.chunk_size(),
            });
        }
        if req.size == 0 {
            return Err(GpuMemError::ZeroSized);
        }

        if let Some(placement) = self.place_in_existing_block(&req) {
            return Ok(placement);
        }
        if let Some((chunk, block_size)) = self.choose_chunk(&req) {
            if let Some(placement) = self.place_in_new_block(chunk, block_size, &req, frame, None) {
                return Ok(placement);
            }
        }
        if !req.allow_new_chunk {
            return Err(GpuMemError::OutOfDeviceMemory {
                requested: req.size,
                source: None,
            });
        }

        let chunk = self.pool.acquire_chunk(backend)?;
        let block_size = self.desired_block_size(req.size);
        match self.place_in_new_block(chunk, block_size, &req, frame, Some(chunk)) {
            Some(placement) => Ok(placement),
            None => {
                // A fresh chunk always fits a request no larger than itself.
                self.pool.discard_fresh(chunk, backend);
                Err(GpuMemError::AllocationTooLarge {
                    requested: req.size,
                    limit: self.pool.chunk_size(),
                })
            }
        }
    }

    /// Undo a placement that was never published.
    pub fn rollback(&mut self, placement: Placement, backend: &dyn GpuBackend) {
        if let Some(block) = self.blocks.get_mut(&placement.block) {
            let _ = block.tracker.free(placement.sub);
        }
        if placement.new_block {
            self.destroy_block(placement.block);
        }
        if let Some(chunk) = placement.new_chunk {
            self.pool.discard_fresh(chunk, backend);
        }
        debug!(block = %placement.block, "rolled back placement");
    }

    /// Grow a sub-allocation in place if its block allows it and the
    /// adjacent free interval absorbs the delta.
    pub fn try_grow(&mut self, block: BlockId, sub: SubAllocId, new_size: u64) -> bool {
        match self.blocks.get_mut(&block) {
            Some(b) if b.accepts_allocations() => b.tracker.try_grow(sub, new_size).unwrap_or(false),
            _ => false,
        }
    }

    /// Cut an interval down to `keep` bytes, returning the tail as its own
    /// occupied interval.
    pub fn split_tail(&mut self, block: BlockId, sub: SubAllocId, keep: u64) -> Option<SubAllocId> {
        self.blocks.get_mut(&block)?.tracker.split_tail(sub, keep).ok()
    }

    /// Cut an interval down to `keep` bytes, freeing the tail now.
    pub fn shrink_sub(&mut self, block: BlockId, sub: SubAllocId, keep: u64) -> bool {
        self.blocks
            .get_mut(&block)
            .is_some_and(|b| b.tracker.shrink(sub, keep).is_ok())
    }

    /// Absolute address of a block's first byte.
    pub fn block_address(&self, id: BlockId) -> Option<GpuAddress> {
        let block = self.blocks.get(&id)?;
        Some(self.pool.get(block.chunk)?.base() + block.offset)
    }

    /// Return a sub-allocation's bytes to its block's free list.
    pub fn free_sub(&mut self, block: BlockId, sub: SubAllocId) -> bool {
        self.blocks
            .get_mut(&block)
            .is_some_and(|b| b.tracker.free(sub).is_ok())
    }

    /// Remove a block and hand its placement back to the chunk.
    pub fn destroy_block(&mut self, id: BlockId) -> Option<ResourceBlock> {
        let block = self.blocks.remove(&id)?;
        self.pool.remove_block(block.chunk, id, block.long_lived);
        trace!(block = %id, chunk = %block.chunk, "destroyed block");
        Some(block)
    }

    pub fn block_metrics(&self, id: BlockId) -> Option<BlockMetrics> {
        let block = self.blocks.get(&id)?;
        Some(BlockMetrics {
            block: id,
            size: block.size(),
            free_bytes: block.tracker.free_bytes(),
            largest_free_run: block.tracker.largest_free_run(),
            fragmentation: block.tracker.fragmentation(),
            compact: block.tracker.is_compact(),
        })
    }

    /// Live (occupied) bytes in all blocks of a chunk.
    pub fn chunk_occupied_bytes(&self, chunk: ChunkId) -> u64 {
        self.pool.get(chunk).map_or(0, |c| {
            c.blocks()
                .filter_map(|id| self.blocks.get(&id))
                .map(|b| b.tracker.occupied_bytes())
                .sum()
        })
    }

    /// Bytes other chunks could absorb without growing the pool.
    pub fn spare_capacity_excluding(&self, chunk: ChunkId) -> u64 {
        let unplaced: u64 = self
            .pool
            .iter()
            .filter(|c| c.id() != chunk)
            .map(|c| c.capacity() - c.used_bytes())
            .sum();
        let in_blocks: u64 = self
            .blocks
            .values()
            .filter(|b| b.chunk != chunk && b.accepts_allocations())
            .map(|b| b.tracker.free_bytes())
            .sum();
        unplaced + in_blocks
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        for block in self.blocks.values() {
            block
                .tracker
                .check_invariants()
                .map_err(|e| format!("{}: {e}", block.id))?;
            let chunk = self
                .pool
                .get(block.chunk)
                .ok_or_else(|| format!("{} points at missing {}", block.id, block.chunk))?;
            if !chunk.blocks().any(|b| b == block.id) {
                return Err(format!("{} is not listed by {}", block.id, block.chunk));
            }
        }
        for chunk in self.pool.iter() {
            chunk
                .placements()
                .check_invariants()
                .map_err(|e| format!("{}: {e}", chunk.id()))?;
        }
        Ok(())
    }

    fn compatible(&self, block: &ResourceBlock, req: &AllocRequest) -> bool {
        let kind_ok = match self.placement {
            PlacementPolicy::SegregateByKind => block.kind == req.kind,
            PlacementPolicy::PackByArrival => true,
        };
        kind_ok
            && block.accepts_allocations()
            && block.long_lived == req.long_lived
            && Some(block.chunk) != req.exclude
            && Some(block.chunk) != self.draining
    }

    fn place_in_existing_block(&mut self, req: &AllocRequest) -> Option<Placement> {
        let (block_id, _) = self
            .blocks
            .values()
            .filter(|b| self.compatible(b, req))
            .filter_map(|b| b.tracker.best_fit(req.size).map(|run| (b.id, run.size)))
            .min_by_key(|&(id, run)| (run, id))?;
        let block = self.blocks.get_mut(&block_id)?;
        let sub = block.tracker.allocate(req.size, Some(req.kind))?;
        let offset = block.tracker.get(sub)?.offset;
        trace!(block = %block_id, size = req.size, offset, "placed in existing block");
        Some(Placement {
            block: block_id,
            sub,
            offset,
            size: req.size,
            new_block: false,
            new_chunk: None,
        })
    }

    fn desired_block_size(&self, size: u64) -> u64 {
        size.max(self.block_size).min(self.pool.chunk_size())
    }

    /// Pick a chunk for a new block, returning the block size to place.
    ///
    /// Prefers chunks whose long-lived affinity matches the request, then
    /// runs that fit a full-size block, then the tightest such run.
    fn choose_chunk(&self, req: &AllocRequest) -> Option<(ChunkId, u64)> {
        let desired = self.desired_block_size(req.size);
        self.pool
            .iter()
            .filter(|c| Some(c.id()) != req.exclude && Some(c.id()) != self.draining)
            .filter_map(|c| {
                let placements = c.placements();
                let (run, full) = match placements.best_fit(desired) {
                    Some(run) => (run.size, true),
                    None => (placements.best_fit(req.size)?.size, false),
                };
                let affinity_miss = c.hosts_long_lived() != req.long_lived;
                let block_size = if full { desired } else { run };
                Some(((affinity_miss, !full, run, c.id()), (c.id(), block_size)))
            })
            .min_by_key(|(rank, _)| *rank)
            .map(|(_, choice)| choice)
    }

    fn place_in_new_block(
        &mut self,
        chunk: ChunkId,
        block_size: u64,
        req: &AllocRequest,
        frame: FrameId,
        new_chunk: Option<ChunkId>,
    ) -> Option<Placement> {
        if block_size < req.size {
            return None;
        }
        let id = BlockId(self.next_block);
        let offset = self.pool.place_block(chunk, id, block_size, req.long_lived)?;
        self.next_block += 1;

        let mut block = ResourceBlock::new(id, chunk, offset, block_size, req.kind, req.long_lived, frame);
        let Some(sub) = block.tracker.allocate(req.size, Some(req.kind)) else {
            self.pool.remove_block(chunk, id, req.long_lived);
            return None;
        };
        let sub_offset = block.tracker.get(sub).map_or(0, |e| e.offset);
        self.blocks.insert(id, block);
        debug!(block = %id, %chunk, offset, size = block_size, kind = ?req.kind, long_lived = req.long_lived, "created block");
        Some(Placement {
            block: id,
            sub,
            offset: sub_offset,
            size: req.size,
            new_block: true,
            new_chunk,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;
    use crate::config::{KIB, MIB};

    fn config() -> GpuMemConfig {
        GpuMemConfig {
            chunk_size: 16 * MIB,
            block_size: 2 * MIB,
            ..Default::default()
        }
    }

    fn vertex(size: u64) -> AllocRequest {
        AllocRequest::new(size, ResourceKind::Vertex, false)
    }

    #[test]
    fn first_allocation_grows_the_pool() {
        let backend = HostBackend::new();
        let mut alloc = BlockAllocator::new(&config());
        let p = alloc.allocate(vertex(64 * KIB), 1, &backend).unwrap();
        assert!(p.new_block);
        assert!(p.new_chunk.is_some());
        assert_eq!(p.offset, 0);
        assert_eq!(alloc.block(p.block).unwrap().size(), 2 * MIB);
        alloc.check_invariants().unwrap();
    }

    #[test]
    fn freed_space_is_reused_without_a_new_chunk() {
        let backend = HostBackend::new();
        let mut alloc = BlockAllocator::new(&config());
        let placements: Vec<_> = (0..10)
            .map(|_| alloc.allocate(vertex(64 * KIB), 1, &backend).unwrap())
            .collect();
        for p in placements.iter().step_by(2) {
            assert!(alloc.free_sub(p.block, p.sub));
        }
        let big = alloc.allocate(vertex(256 * KIB), 2, &backend).unwrap();
        assert!(big.new_chunk.is_none());
        assert_eq!(backend.chunk_allocations(), 1);
        assert_eq!(alloc.pool().len(), 1);
        alloc.check_invariants().unwrap();
    }

    #[test]
    fn free_then_allocate_same_size_reuses_interval() {
        let backend = HostBackend::new();
        let mut alloc = BlockAllocator::new(&GpuMemConfig {
            chunk_size: MIB,
            block_size: MIB,
            ..Default::default()
        });
        let a = alloc.allocate(vertex(512 * KIB), 1, &backend).unwrap();
        let _b = alloc.allocate(vertex(512 * KIB), 1, &backend).unwrap();
        alloc.free_sub(a.block, a.sub);
        let c = alloc.allocate(vertex(256 * KIB), 1, &backend).unwrap();
        assert_eq!(c.block, a.block);
        assert_eq!(c.offset, 0);
        assert_eq!(backend.chunk_allocations(), 1);
    }

    #[test]
    fn kinds_are_segregated_by_default() {
        let backend = HostBackend::new();
        let mut alloc = BlockAllocator::new(&config());
        let v = alloc.allocate(vertex(KIB), 1, &backend).unwrap();
        let i = alloc
            .allocate(AllocRequest::new(KIB, ResourceKind::Index, false), 1, &backend)
            .unwrap();
        assert_ne!(v.block, i.block);
        assert_eq!(alloc.pool().len(), 1);
    }

    #[test]
    fn pack_by_arrival_colocates_kinds() {
        let backend = HostBackend::new();
        let mut alloc = BlockAllocator::new(&GpuMemConfig {
            placement: PlacementPolicy::PackByArrival,
            ..config()
        });
        let v = alloc.allocate(vertex(KIB), 1, &backend).unwrap();
        let i = alloc
            .allocate(AllocRequest::new(KIB, ResourceKind::Index, false), 1, &backend)
            .unwrap();
        assert_eq!(v.block, i.block);
    }

    #[test]
    fn long_lived_data_gets_dedicated_blocks() {
        let backend = HostBackend::new();
        let mut alloc = BlockAllocator::new(&config());
        let t = alloc.allocate(vertex(KIB), 1, &backend).unwrap();
        let l = alloc
            .allocate(AllocRequest::new(KIB, ResourceKind::Vertex, true), 1, &backend)
            .unwrap();
        assert_ne!(t.block, l.block);
        assert!(alloc.block(l.block).unwrap().is_long_lived());
        let chunk = alloc.block(l.block).unwrap().chunk();
        assert!(alloc.pool().get(chunk).unwrap().hosts_long_lived());
    }

    #[test]
    fn oversized_requests_are_rejected() {
        let backend = HostBackend::new();
        let mut alloc = BlockAllocator::new(&config());
        let err = alloc.allocate(vertex(17 * MIB), 1, &backend).unwrap_err();
        assert!(matches!(err, GpuMemError::AllocationTooLarge { limit, .. } if limit == 16 * MIB));
        assert_eq!(backend.chunk_allocations(), 0);
    }

    #[test]
    fn rollback_restores_previous_state() {
        let backend = HostBackend::new();
        let mut alloc = BlockAllocator::new(&GpuMemConfig {
            min_resident_chunks: 1,
            ..config()
        });
        let p = alloc.allocate(vertex(KIB), 1, &backend).unwrap();
        alloc.rollback(p, &backend);
        assert_eq!(alloc.blocks().count(), 0);
        assert_eq!(alloc.pool().len(), 0);
        assert_eq!(backend.live_chunks(), 0);
    }

    #[test]
    fn new_blocks_fill_existing_chunks_before_growing() {
        let backend = HostBackend::new();
        let mut alloc = BlockAllocator::new(&config());
        // Each 1.5 MiB request fills most of a 2 MiB block, forcing new blocks.
        for _ in 0..8 {
            alloc.allocate(vertex(1536 * KIB), 1, &backend).unwrap();
        }
        assert_eq!(alloc.pool().len(), 1);
        alloc.allocate(vertex(1536 * KIB), 1, &backend).unwrap();
        assert_eq!(alloc.pool().len(), 2);
        alloc.check_invariants().unwrap();
    }

    #[test]
    fn excluded_chunk_is_skipped_and_new_chunks_can_be_forbidden() {
        let backend = HostBackend::new();
        let mut alloc = BlockAllocator::new(&config());
        let p = alloc.allocate(vertex(KIB), 1, &backend).unwrap();
        let chunk = alloc.block(p.block).unwrap().chunk();
        let req = AllocRequest {
            exclude: Some(chunk),
            allow_new_chunk: false,
            ..vertex(KIB)
        };
        assert!(matches!(
            alloc.allocate(req, 1, &backend),
            Err(GpuMemError::OutOfDeviceMemory { .. })
        ));
    }
}
