//! Render consumers: lock-free-ish readers of the current directory.
//!
//! A consumer thread opens a [`FrameReader`], resolves handles through it
//! while recording draw commands, then finishes the reader. Every block a
//! reader touches gets one reference-count lease that stays held until the
//! frame's fence signals, so neither compaction nor reclamation can move or
//! free bytes the GPU may still read.

use crate::backend::GpuBackend;
use crate::ids::{BlockId, FrameId, GpuAddress, Handle, ResourceKind};
use crate::metadata::Directory;
use crate::sync::FrameSync;
use crate::Shared;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLockReadGuard};

/// A resolved, safe-to-use byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceView {
    pub address: GpuAddress,
    pub size: u64,
    pub kind: ResourceKind,
    pub block: BlockId,
}

/// Why a handle was skipped this frame. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Unknown, discarded, or not yet committed.
    NotFound,
    /// The owning block is being compacted or retired.
    Invalid,
    /// The owning block only becomes valid in a later frame.
    NotYetResident,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Read {
    Ready(ResourceView),
    Skip(SkipReason),
}

impl Read {
    pub fn ready(self) -> Option<ResourceView> {
        match self {
            Read::Ready(view) => Some(view),
            Read::Skip(_) => None,
        }
    }
}

/// Shared front for every consumer thread.
pub struct Consumers<B: GpuBackend> {
    shared: Arc<Shared<B>>,
}

impl<B: GpuBackend> Clone for Consumers<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: GpuBackend> Consumers<B> {
    pub(crate) fn new(shared: Arc<Shared<B>>) -> Self {
        Self { shared }
    }

    /// Open a reader on the current frame.
    pub fn reader(&self) -> FrameReader<'_> {
        let store = &self.shared.store;
        let (view, frame) = self.shared.sync.open_reader(|| {
            let view = store.read_current();
            let frame = view.frame();
            (view, frame)
        });
        FrameReader {
            view,
            frame,
            sync: &self.shared.sync,
            leases: HashMap::new(),
        }
    }

    pub fn current_frame(&self) -> FrameId {
        self.shared.store.current_frame()
    }

    /// Signal `frame`'s fence after its command lists were submitted.
    pub fn submit_frame(&self, frame: FrameId) {
        self.shared.sync.submit(frame, &self.shared.backend);
    }

    pub fn backend(&self) -> &B {
        &self.shared.backend
    }
}

/// One consumer's pinned view of one frame.
pub struct FrameReader<'a> {
    view: RwLockReadGuard<'a, Directory>,
    frame: FrameId,
    sync: &'a FrameSync,
    leases: HashMap<BlockId, Arc<AtomicU32>>,
}

impl FrameReader<'_> {
    #[inline]
    pub fn frame(&self) -> FrameId {
        self.frame
    }

    /// Resolve `handle`, taking a lease on its block.
    pub fn try_read(&mut self, handle: Handle) -> Read {
        let Some(entry) = self.view.handle(handle) else {
            return Read::Skip(SkipReason::NotFound);
        };
        let Some(block) = self.view.block(entry.block) else {
            return Read::Skip(SkipReason::NotFound);
        };
        if !block.valid {
            return Read::Skip(SkipReason::Invalid);
        }
        if block.frame_tag > self.frame {
            return Read::Skip(SkipReason::NotYetResident);
        }
        let Some(chunk) = self.view.chunk(block.chunk) else {
            return Read::Skip(SkipReason::NotFound);
        };

        self.leases.entry(entry.block).or_insert_with(|| {
            block.usage.fetch_add(1, Ordering::AcqRel);
            Arc::clone(&block.usage)
        });
        Read::Ready(ResourceView {
            address: chunk.base + block.offset + entry.offset,
            size: entry.len,
            kind: entry.kind,
            block: entry.block,
        })
    }

    /// Number of blocks this reader holds leases on.
    pub fn leased_blocks(&self) -> usize {
        self.leases.len()
    }

    /// Done recording; leases now wait for the frame's fence.
    pub fn finish(self) -> FrameId {
        self.frame
    }
}

impl Drop for FrameReader<'_> {
    fn drop(&mut self) {
        let leases = self.leases.drain().map(|(_, usage)| usage).collect();
        self.sync.close_reader(self.frame, leases);
    }
}
