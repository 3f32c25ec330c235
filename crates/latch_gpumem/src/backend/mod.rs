//! Graphics backend abstraction
//!
//! The allocator never talks to a device directly. Everything it needs from
//! the GPU goes through [`GpuBackend`]: chunk allocation, staging uploads,
//! GPU-side copies and per-frame fences.

mod host;
#[cfg(feature = "wgpu")]
mod wgpu;

pub use host::{FenceMode, HostBackend};
#[cfg(feature = "wgpu")]
pub use self::wgpu::WgpuBackend;

use crate::error::BackendError;
use crate::ids::{FrameId, GpuAddress};
use std::collections::BTreeMap;

/// Services the allocator consumes from the graphics layer.
///
/// Uploads and copies are asynchronous with respect to command-list
/// building: they must be ordered before any work submitted for a later
/// frame, but the caller never waits on them.
pub trait GpuBackend: Send + Sync {
    /// Allocate a contiguous region of `size` bytes.
    fn allocate_chunk(&self, size: u64) -> Result<GpuAddress, BackendError>;

    /// Return a region previously handed out by `allocate_chunk`.
    fn free_chunk(&self, address: GpuAddress);

    /// Stage `bytes` for upload to `dst`.
    fn upload_bytes(&self, dst: GpuAddress, bytes: &[u8]) -> Result<(), BackendError>;

    /// Schedule a GPU-side copy. Source and destination may overlap; the
    /// result must be as if the source was read entirely before writing.
    fn copy_range(&self, src: GpuAddress, dst: GpuAddress, size: u64) -> Result<(), BackendError>;

    /// Enqueue a fence that signals once all work submitted for `frame` is done.
    fn signal_fence(&self, frame: FrameId);

    /// Non-blocking check of a fence enqueued with `signal_fence`.
    fn wait_fence(&self, frame: FrameId) -> bool;
}

/// Address-ordered map from chunk base addresses to backing storage.
///
/// Backends hand out monotonically increasing, never-overlapping base
/// addresses so any address can be resolved to `(chunk, offset)`.
#[derive(Debug)]
pub(crate) struct AddressSpace<T> {
    next_base: GpuAddress,
    regions: BTreeMap<GpuAddress, (u64, T)>,
}

impl<T> AddressSpace<T> {
    /// Keeps address 0 unused so a zero address is always a bug.
    const FIRST_BASE: GpuAddress = 0x1_0000;

    pub(crate) fn new() -> Self {
        Self {
            next_base: Self::FIRST_BASE,
            regions: BTreeMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, size: u64, storage: T) -> GpuAddress {
        let base = self.next_base;
        // Leave a guard gap so adjacent chunks never look contiguous.
        self.next_base += size.next_multiple_of(Self::FIRST_BASE) + Self::FIRST_BASE;
        self.regions.insert(base, (size, storage));
        base
    }

    pub(crate) fn remove(&mut self, base: GpuAddress) -> Option<T> {
        self.regions.remove(&base).map(|(_, storage)| storage)
    }

    /// Resolve `[address, address + len)` to its region, checking bounds.
    pub(crate) fn resolve(&self, address: GpuAddress, len: u64) -> Result<(GpuAddress, u64), BackendError> {
        let (&base, (size, _)) = self
            .regions
            .range(..=address)
            .next_back()
            .ok_or(BackendError::InvalidAddress { address, len })?;
        let offset = address - base;
        if offset + len > *size {
            return Err(BackendError::InvalidAddress { address, len });
        }
        Ok((base, offset))
    }

    pub(crate) fn get(&self, base: GpuAddress) -> Option<&T> {
        self.regions.get(&base).map(|(_, storage)| storage)
    }

    pub(crate) fn get_mut(&mut self, base: GpuAddress) -> Option<&mut T> {
        self.regions.get_mut(&base).map(|(_, storage)| storage)
    }

    pub(crate) fn len(&self) -> usize {
        self.regions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_addresses_inside_regions() {
        let mut space = AddressSpace::new();
        let a = space.insert(4096, ());
        let b = space.insert(4096, ());
        assert!(b > a + 4096);
        assert_eq!(space.resolve(a + 10, 100).unwrap(), (a, 10));
        assert_eq!(space.resolve(b, 4096).unwrap(), (b, 0));
        assert!(space.resolve(a + 4000, 200).is_err());
        assert!(space.resolve(1, 1).is_err());
        space.remove(a);
        assert!(space.resolve(a, 1).is_err());
        assert_eq!(space.len(), 1);
    }
}
