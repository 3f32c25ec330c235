//! Double-buffered resource directory.
//!
//! Two full copies of the directory exist. Consumers only ever lock the
//! copy named by the selector; the producer writes the other copy and then
//! flips the selector. Instead of cloning the whole directory at every
//! commit, the edits applied to one copy are replayed onto the other at the
//! following commit, so both copies converge.

use crate::ids::{BlockId, ChunkId, FrameId, GpuAddress, Handle, ResourceKind, SubAllocId};
use crate::sync::FenceToken;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};
use tracing::trace;

/// What consumers know about a block.
#[derive(Debug, Clone)]
pub struct BlockRecord {
    pub chunk: ChunkId,
    /// Offset of the block inside its chunk.
    pub offset: u64,
    pub size: u64,
    pub kind: ResourceKind,
    pub valid: bool,
    /// Frame in which the block's data last became valid.
    pub frame_tag: FrameId,
    pub long_lived: bool,
    /// In-flight uses; shared by both directory copies and the producer.
    pub usage: Arc<AtomicU32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRecord {
    pub base: GpuAddress,
    pub capacity: u64,
}

/// Where a handle's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleRecord {
    pub block: BlockId,
    pub sub: SubAllocId,
    /// Offset of the sub-allocation inside its block.
    pub offset: u64,
    /// Length of the live data, which may be shorter than the interval.
    pub len: u64,
    pub kind: ResourceKind,
}

/// One directory copy.
#[derive(Debug, Default)]
pub struct Directory {
    frame: FrameId,
    blocks: HashMap<BlockId, BlockRecord>,
    chunks: HashMap<ChunkId, ChunkRecord>,
    handles: HashMap<Handle, HandleRecord>,
}

impl Directory {
    /// Frame this copy was committed for.
    #[inline]
    pub fn frame(&self) -> FrameId {
        self.frame
    }

    pub fn block(&self, id: BlockId) -> Option<&BlockRecord> {
        self.blocks.get(&id)
    }

    pub fn chunk(&self, id: ChunkId) -> Option<&ChunkRecord> {
        self.chunks.get(&id)
    }

    pub fn handle(&self, handle: Handle) -> Option<&HandleRecord> {
        self.handles.get(&handle)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    fn apply(&mut self, edit: &DirectoryEdit) {
        match edit {
            DirectoryEdit::UpsertBlock(id, record) => {
                self.blocks.insert(*id, record.clone());
            }
            DirectoryEdit::RemoveBlock(id) => {
                self.blocks.remove(id);
            }
            DirectoryEdit::UpsertChunk(id, record) => {
                self.chunks.insert(*id, *record);
            }
            DirectoryEdit::RemoveChunk(id) => {
                self.chunks.remove(id);
            }
            DirectoryEdit::UpsertHandle(handle, record) => {
                self.handles.insert(*handle, *record);
            }
            DirectoryEdit::RemoveHandle(handle) => {
                self.handles.remove(handle);
            }
        }
    }
}

/// A single mutation of the directory.
#[derive(Debug, Clone)]
pub enum DirectoryEdit {
    UpsertBlock(BlockId, BlockRecord),
    RemoveBlock(BlockId),
    UpsertChunk(ChunkId, ChunkRecord),
    RemoveChunk(ChunkId),
    UpsertHandle(Handle, HandleRecord),
    RemoveHandle(Handle),
}

/// Producer-owned edit log.
///
/// `pending` holds edits not yet visible to anyone; `stale` holds the edits
/// of the last commit, which the non-current copy has not seen yet.
#[derive(Debug, Default)]
pub struct Journal {
    pending: Vec<DirectoryEdit>,
    stale: Vec<DirectoryEdit>,
}

impl Journal {
    pub fn record(&mut self, edit: DirectoryEdit) {
        self.pending.push(edit);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Exclusive access to the non-current copy for one commit.
pub struct ViewWriter<'a> {
    store: &'a MetadataStore,
    next: usize,
    view: RwLockWriteGuard<'a, Directory>,
}

impl ViewWriter<'_> {
    /// Apply one edit to the copy being prepared.
    pub fn apply(&mut self, edit: &DirectoryEdit) {
        self.view.apply(edit);
    }

    /// Stamp the copy with `token`'s frame and make it current.
    pub fn commit(mut self, token: FenceToken) -> FrameId {
        let frame = token.frame();
        self.view.frame = frame;
        self.store.current.store(self.next, Ordering::Release);
        frame
    }
}

/// Two directory copies and the selector between them.
#[derive(Debug, Default)]
pub struct MetadataStore {
    views: [RwLock<Directory>; 2],
    current: AtomicUsize,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the current copy for reading.
    ///
    /// Retries if the selector flipped between loading it and taking the
    /// lock, so the returned copy was current when it was locked.
    pub fn read_current(&self) -> RwLockReadGuard<'_, Directory> {
        loop {
            let idx = self.current.load(Ordering::Acquire);
            let view = self.views[idx].read().unwrap_or_else(PoisonError::into_inner);
            if self.current.load(Ordering::Acquire) == idx {
                return view;
            }
        }
    }

    /// Frame of the current copy.
    pub fn current_frame(&self) -> FrameId {
        self.read_current().frame
    }

    /// Take the non-current copy for writing and bring it up to date with
    /// the last commit.
    ///
    /// Returns `None` while a consumer still holds the non-current copy.
    pub fn begin_update(&self, journal: &mut Journal) -> Option<ViewWriter<'_>> {
        let next = 1 - self.current.load(Ordering::Acquire);
        let mut view = match self.views[next].try_write() {
            Ok(view) => view,
            Err(TryLockError::WouldBlock) => return None,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        for edit in journal.stale.drain(..) {
            view.apply(&edit);
        }
        Some(ViewWriter {
            store: self,
            next,
            view,
        })
    }

    /// Publish every pending edit of `journal` at `token`'s frame.
    ///
    /// Returns `None` (and keeps the edits pending) if the non-current copy
    /// is still being read.
    pub fn publish(&self, journal: &mut Journal, token: FenceToken) -> Option<usize> {
        let mut writer = self.begin_update(journal)?;
        for edit in &journal.pending {
            writer.apply(edit);
        }
        let frame = writer.commit(token);
        let applied = journal.pending.len();
        journal.stale = std::mem::take(&mut journal.pending);
        trace!(frame, applied, "published directory");
        Some(applied)
    }
}
