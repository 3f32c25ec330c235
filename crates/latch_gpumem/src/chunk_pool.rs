//! Chunk pool: the only component that allocates device memory.
//!
//! Chunks are fixed-size regions acquired on demand and released only after
//! the defragmenter has emptied them. Like a paged pool, growth happens one
//! page (chunk) at a time when nothing existing has room, and trailing empty
//! pages are handed back; unlike a paged pool, a floor of resident chunks is
//! kept to avoid thrashing under oscillating load.

use crate::backend::GpuBackend;
use crate::error::{GpuMemError, GpuMemResult};
use crate::ids::{BlockId, ChunkId, GpuAddress, SubAllocId};
use crate::tracker::SubAllocationTracker;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// One fixed-size device region and the blocks placed inside it.
#[derive(Debug)]
pub struct Chunk {
    id: ChunkId,
    base: GpuAddress,
    placements: SubAllocationTracker,
    blocks: BTreeMap<BlockId, SubAllocId>,
    long_lived_blocks: usize,
}

impl Chunk {
    #[inline]
    pub fn id(&self) -> ChunkId {
        self.id
    }

    #[inline]
    pub fn base(&self) -> GpuAddress {
        self.base
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.placements.size()
    }

    /// Bytes covered by block placements.
    #[inline]
    pub fn used_bytes(&self) -> u64 {
        self.placements.occupied_bytes()
    }

    #[inline]
    pub fn largest_free_run(&self) -> u64 {
        self.placements.largest_free_run()
    }

    pub fn blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.keys().copied()
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    #[inline]
    pub fn hosts_long_lived(&self) -> bool {
        self.long_lived_blocks > 0
    }

    pub fn placements(&self) -> &SubAllocationTracker {
        &self.placements
    }
}

/// Growable/shrinkable set of chunks.
#[derive(Debug)]
pub struct ChunkPool {
    chunk_size: u64,
    min_resident: usize,
    max_chunks: Option<usize>,
    chunks: BTreeMap<ChunkId, Chunk>,
    next_id: u32,
}

impl ChunkPool {
    pub fn new(chunk_size: u64, min_resident: usize, max_chunks: Option<usize>) -> Self {
        Self {
            chunk_size,
            min_resident,
            max_chunks,
            chunks: BTreeMap::new(),
            next_id: 0,
        }
    }

    #[inline]
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn get(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    /// Allocate a new chunk from the backend.
    pub fn acquire_chunk(&mut self, backend: &dyn GpuBackend) -> GpuMemResult<ChunkId> {
        if self.max_chunks.is_some_and(|max| self.chunks.len() >= max) {
            return Err(GpuMemError::OutOfDeviceMemory {
                requested: self.chunk_size,
                source: None,
            });
        }
        let base = backend
            .allocate_chunk(self.chunk_size)
            .map_err(|err| GpuMemError::OutOfDeviceMemory {
                requested: self.chunk_size,
                source: Some(err),
            })?;
        let id = ChunkId(self.next_id);
        self.next_id += 1;
        self.chunks.insert(
            id,
            Chunk {
                id,
                base,
                placements: SubAllocationTracker::new(self.chunk_size),
                blocks: BTreeMap::new(),
                long_lived_blocks: 0,
            },
        );
        info!(%id, base, size = self.chunk_size, resident = self.chunks.len(), "acquired chunk");
        Ok(id)
    }

    /// True if releasing one more chunk keeps the pool at or above its floor.
    #[inline]
    pub fn above_minimum(&self) -> bool {
        self.chunks.len() > self.min_resident
    }

    /// Return an empty chunk to the backend.
    ///
    /// Returns `Ok(false)` if the chunk stays resident because the pool is at
    /// its minimum size.
    pub fn release_chunk(&mut self, id: ChunkId, backend: &dyn GpuBackend) -> GpuMemResult<bool> {
        let Some(chunk) = self.chunks.get(&id) else {
            return Ok(false);
        };
        if !chunk.is_empty() {
            debug_assert!(false, "release of {id} with {} live blocks", chunk.block_count());
            return Err(GpuMemError::ChunkNotEmpty {
                chunk: id,
                blocks: chunk.block_count(),
            });
        }
        if !self.above_minimum() {
            debug!(%id, "keeping empty chunk resident");
            return Ok(false);
        }
        if let Some(chunk) = self.chunks.remove(&id) {
            backend.free_chunk(chunk.base);
            info!(%id, resident = self.chunks.len(), "released chunk");
        }
        Ok(true)
    }

    /// Drop a chunk acquired for an allocation that was rolled back,
    /// ignoring the resident floor.
    pub(crate) fn discard_fresh(&mut self, id: ChunkId, backend: &dyn GpuBackend) {
        if self.chunks.get(&id).is_some_and(Chunk::is_empty) {
            if let Some(chunk) = self.chunks.remove(&id) {
                backend.free_chunk(chunk.base);
                debug!(%id, "discarded unused chunk");
            }
        }
    }

    /// Place a block of exactly `size` bytes in the chunk's best-fitting
    /// free run. Returns the block's byte offset inside the chunk.
    pub fn place_block(
        &mut self,
        id: ChunkId,
        block: BlockId,
        size: u64,
        long_lived: bool,
    ) -> Option<u64> {
        let chunk = self.chunks.get_mut(&id)?;
        let placement = chunk.placements.allocate(size, None)?;
        let offset = chunk.placements.get(placement)?.offset;
        chunk.blocks.insert(block, placement);
        if long_lived {
            chunk.long_lived_blocks += 1;
        }
        Some(offset)
    }

    /// Give a block's placement back to its chunk's free space.
    pub fn remove_block(&mut self, id: ChunkId, block: BlockId, long_lived: bool) {
        let Some(chunk) = self.chunks.get_mut(&id) else {
            return;
        };
        if let Some(placement) = chunk.blocks.remove(&block) {
            // The placement id came from this tracker, so freeing cannot fail.
            let _ = chunk.placements.free(placement);
            if long_lived {
                chunk.long_lived_blocks -= 1;
            }
        }
    }

    /// Ids of chunks holding no blocks.
    pub fn empty_chunks(&self) -> Vec<ChunkId> {
        self.chunks
            .values()
            .filter(|c| c.is_empty())
            .map(|c| c.id)
            .collect()
    }
}
