//! Host-memory device used by tests and the simulator.
//!
//! Chunks are plain byte vectors, uploads and copies complete immediately,
//! and fences either signal on submission or wait for an explicit
//! [`HostBackend::complete_fences_through`].

use super::{AddressSpace, GpuBackend};
use crate::error::BackendError;
use crate::ids::{FrameId, GpuAddress};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceMode {
    /// Every fence signals as soon as it is enqueued.
    Immediate,
    /// Fences signal only when the test completes them.
    Manual,
}

#[derive(Debug)]
struct HostDevice {
    chunks: AddressSpace<Vec<u8>>,
    memory_limit: Option<u64>,
    allocated: u64,
    fence_mode: FenceMode,
    signaled_through: Option<FrameId>,
    enqueued: Vec<FrameId>,
    failing_copies: u32,
    chunk_allocations: usize,
    bytes_uploaded: u64,
    bytes_copied: u64,
}

/// Simulated device memory living in host RAM.
#[derive(Debug)]
pub struct HostBackend {
    device: Mutex<HostDevice>,
}

impl HostBackend {
    pub fn new() -> Self {
        Self {
            device: Mutex::new(HostDevice {
                chunks: AddressSpace::new(),
                memory_limit: None,
                allocated: 0,
                fence_mode: FenceMode::Immediate,
                signaled_through: None,
                enqueued: Vec::new(),
                failing_copies: 0,
                chunk_allocations: 0,
                bytes_uploaded: 0,
                bytes_copied: 0,
            }),
        }
    }

    /// Fail chunk allocations that would exceed `bytes` in total.
    pub fn with_memory_limit(self, bytes: u64) -> Self {
        self.lock().memory_limit = Some(bytes);
        self
    }

    pub fn with_fence_mode(self, mode: FenceMode) -> Self {
        self.lock().fence_mode = mode;
        self
    }

    /// Signal every enqueued fence up to and including `frame`.
    pub fn complete_fences_through(&self, frame: FrameId) {
        let mut device = self.lock();
        device.enqueued.retain(|&f| f > frame);
        device.signaled_through = Some(device.signaled_through.map_or(frame, |s| s.max(frame)));
    }

    /// Make the next `count` calls to `copy_range` fail.
    pub fn fail_next_copies(&self, count: u32) {
        self.lock().failing_copies = count;
    }

    /// Read back device bytes; `None` if the range is not inside a live chunk.
    pub fn read_bytes(&self, address: GpuAddress, len: u64) -> Option<Vec<u8>> {
        let device = self.lock();
        let (base, offset) = device.chunks.resolve(address, len).ok()?;
        let chunk = device.chunks.get(base)?;
        Some(chunk[offset as usize..(offset + len) as usize].to_vec())
    }

    /// Number of `allocate_chunk` calls that succeeded.
    pub fn chunk_allocations(&self) -> usize {
        self.lock().chunk_allocations
    }

    pub fn live_chunks(&self) -> usize {
        self.lock().chunks.len()
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.lock().bytes_uploaded
    }

    pub fn bytes_copied(&self) -> u64 {
        self.lock().bytes_copied
    }

    fn lock(&self) -> MutexGuard<'_, HostDevice> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuBackend for HostBackend {
    fn allocate_chunk(&self, size: u64) -> Result<GpuAddress, BackendError> {
        let mut device = self.lock();
        if let Some(limit) = device.memory_limit {
            if device.allocated + size > limit {
                return Err(BackendError::OutOfMemory { requested: size });
            }
        }
        device.allocated += size;
        device.chunk_allocations += 1;
        Ok(device.chunks.insert(size, vec![0u8; size as usize]))
    }

    fn free_chunk(&self, address: GpuAddress) {
        let mut device = self.lock();
        if let Some(storage) = device.chunks.remove(address) {
            device.allocated -= storage.len() as u64;
        }
    }

    fn upload_bytes(&self, dst: GpuAddress, bytes: &[u8]) -> Result<(), BackendError> {
        let mut device = self.lock();
        let (base, offset) = device.chunks.resolve(dst, bytes.len() as u64)?;
        let chunk = device
            .chunks
            .get_mut(base)
            .ok_or(BackendError::InvalidAddress { address: dst, len: bytes.len() as u64 })?;
        let start = offset as usize;
        chunk[start..start + bytes.len()].copy_from_slice(bytes);
        device.bytes_uploaded += bytes.len() as u64;
        Ok(())
    }

    fn copy_range(&self, src: GpuAddress, dst: GpuAddress, size: u64) -> Result<(), BackendError> {
        let mut device = self.lock();
        if device.failing_copies > 0 {
            device.failing_copies -= 1;
            return Err(BackendError::CopyFailed("injected failure".into()));
        }
        let (src_base, src_off) = device.chunks.resolve(src, size)?;
        let (dst_base, dst_off) = device.chunks.resolve(dst, size)?;
        let len = size as usize;
        if src_base == dst_base {
            let chunk = device
                .chunks
                .get_mut(src_base)
                .ok_or(BackendError::InvalidAddress { address: src, len: size })?;
            chunk.copy_within(src_off as usize..src_off as usize + len, dst_off as usize);
        } else {
            let staged = device
                .chunks
                .get(src_base)
                .map(|chunk| chunk[src_off as usize..src_off as usize + len].to_vec())
                .ok_or(BackendError::InvalidAddress { address: src, len: size })?;
            let chunk = device
                .chunks
                .get_mut(dst_base)
                .ok_or(BackendError::InvalidAddress { address: dst, len: size })?;
            chunk[dst_off as usize..dst_off as usize + len].copy_from_slice(&staged);
        }
        device.bytes_copied += size;
        Ok(())
    }

    fn signal_fence(&self, frame: FrameId) {
        let mut device = self.lock();
        match device.fence_mode {
            FenceMode::Immediate => {
                device.signaled_through =
                    Some(device.signaled_through.map_or(frame, |s| s.max(frame)));
            }
            FenceMode::Manual => device.enqueued.push(frame),
        }
    }

    fn wait_fence(&self, frame: FrameId) -> bool {
        let device = self.lock();
        let signaled = device.signaled_through.is_some_and(|s| s >= frame);
        signaled && !device.enqueued.iter().any(|&f| f <= frame)
    }
}
