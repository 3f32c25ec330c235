//! wgpu-backed chunk storage.
//!
//! Every chunk is one `wgpu::Buffer` usable as vertex and index data.
//! Frame fences are `Queue::on_submitted_work_done` callbacks polled with
//! `Maintain::Poll`, so `wait_fence` never blocks.

use super::{AddressSpace, GpuBackend};
use crate::error::BackendError;
use crate::ids::{FrameId, GpuAddress};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    chunks: Mutex<AddressSpace<wgpu::Buffer>>,
    fences: Mutex<HashMap<FrameId, Arc<AtomicBool>>>,
}

impl WgpuBackend {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self {
            device,
            queue,
            chunks: Mutex::new(AddressSpace::new()),
            fences: Mutex::new(HashMap::new()),
        }
    }

    /// Borrow the buffer backing `address`, with the offset inside it.
    pub fn with_buffer<R>(
        &self,
        address: GpuAddress,
        len: u64,
        f: impl FnOnce(&wgpu::Buffer, u64) -> R,
    ) -> Result<R, BackendError> {
        let chunks = self.chunks();
        let (base, offset) = chunks.resolve(address, len)?;
        let buffer = chunks
            .get(base)
            .ok_or(BackendError::InvalidAddress { address, len })?;
        Ok(f(buffer, offset))
    }

    fn chunks(&self) -> MutexGuard<'_, AddressSpace<wgpu::Buffer>> {
        self.chunks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fences(&self) -> MutexGuard<'_, HashMap<FrameId, Arc<AtomicBool>>> {
        self.fences.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl GpuBackend for WgpuBackend {
    fn allocate_chunk(&self, size: u64) -> Result<GpuAddress, BackendError> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("latch_gpumem_chunk"),
            size,
            usage: wgpu::BufferUsages::VERTEX
                | wgpu::BufferUsages::INDEX
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if pollster::block_on(self.device.pop_error_scope()).is_some() {
            buffer.destroy();
            return Err(BackendError::OutOfMemory { requested: size });
        }
        Ok(self.chunks().insert(size, buffer))
    }

    fn free_chunk(&self, address: GpuAddress) {
        if let Some(buffer) = self.chunks().remove(address) {
            buffer.destroy();
        }
    }

    fn upload_bytes(&self, dst: GpuAddress, bytes: &[u8]) -> Result<(), BackendError> {
        // write_buffer wants a multiple of COPY_BUFFER_ALIGNMENT.
        let padded_len = (bytes.len() as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        self.with_buffer(dst, padded_len, |buffer, offset| {
            if padded_len == bytes.len() as u64 {
                self.queue.write_buffer(buffer, offset, bytes);
            } else {
                let mut padded = bytes.to_vec();
                padded.resize(padded_len as usize, 0);
                self.queue.write_buffer(buffer, offset, &padded);
            }
        })
    }

    fn copy_range(&self, src: GpuAddress, dst: GpuAddress, size: u64) -> Result<(), BackendError> {
        let chunks = self.chunks();
        let (src_base, src_off) = chunks.resolve(src, size)?;
        let (dst_base, dst_off) = chunks.resolve(dst, size)?;
        let src_buf = chunks
            .get(src_base)
            .ok_or(BackendError::InvalidAddress { address: src, len: size })?;
        let dst_buf = chunks
            .get(dst_base)
            .ok_or(BackendError::InvalidAddress { address: dst, len: size })?;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("latch_gpumem_relocate"),
            });
        if src_base == dst_base {
            // Same-buffer copies are not allowed; bounce through scratch.
            let scratch = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("latch_gpumem_scratch"),
                size,
                usage: wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            encoder.copy_buffer_to_buffer(src_buf, src_off, &scratch, 0, size);
            encoder.copy_buffer_to_buffer(&scratch, 0, dst_buf, dst_off, size);
        } else {
            encoder.copy_buffer_to_buffer(src_buf, src_off, dst_buf, dst_off, size);
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn signal_fence(&self, frame: FrameId) {
        let flag = Arc::new(AtomicBool::new(false));
        let done = flag.clone();
        self.queue
            .on_submitted_work_done(move || done.store(true, Ordering::Release));
        self.fences().insert(frame, flag);
    }

    fn wait_fence(&self, frame: FrameId) -> bool {
        let _ = self.device.poll(wgpu::Maintain::Poll);
        let mut fences = self.fences();
        let signaled = fences
            .get(&frame)
            .is_some_and(|flag| flag.load(Ordering::Acquire));
        if signaled {
            fences.retain(|&f, _| f > frame);
        }
        signaled
    }
}
