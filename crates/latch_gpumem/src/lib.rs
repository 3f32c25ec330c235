//! Latch GPU Memory
//!
//! A growable GPU memory manager for buffer-resident geometry:
//! - Chunk pool: fixed-size device regions acquired and released on demand
//! - Resource blocks with per-block sub-allocation tracking
//! - Double-buffered metadata directory published at frame boundaries
//! - One producer, any number of consumers, fenced reclamation
//! - Budgeted compaction and chunk consolidation
//!
//! ```ignore
//! use latch_gpumem::{init, GpuMemConfig, HostBackend, ResourceKind};
//!
//! let (mut producer, consumers) = init(GpuMemConfig::default(), HostBackend::new())?;
//! let mesh = producer.create(ResourceKind::Vertex, &vertex_bytes)?;
//! producer.end_frame();
//!
//! let mut reader = consumers.reader();
//! if let Some(view) = reader.try_read(mesh).ready() {
//!     // bind view.address .. view.address + view.size
//! }
//! let frame = reader.finish();
//! consumers.submit_frame(frame);
//! ```

pub mod allocator;
pub mod backend;
pub mod block;
pub mod chunk_pool;
pub mod config;
pub mod consumer;
pub mod defrag;
pub mod error;
pub mod handles;
pub mod ids;
pub mod metadata;
pub mod producer;
pub mod sync;
pub mod tracker;

pub use backend::{FenceMode, GpuBackend, HostBackend};
#[cfg(feature = "wgpu")]
pub use backend::WgpuBackend;
pub use config::{GpuMemConfig, PlacementPolicy, KIB, MIB};
pub use consumer::{Consumers, FrameReader, Read, ResourceView, SkipReason};
pub use defrag::DefragReport;
pub use error::{BackendError, ConfigError, GpuMemError, GpuMemResult};
pub use ids::{BlockId, ChunkId, FrameId, GpuAddress, Handle, ResourceKind, Residency};
pub use producer::{CommitOutcome, DeferReason, FrameReport, GcReport, MemoryStats, Producer};

use metadata::MetadataStore;
use std::sync::Arc;
use sync::FrameSync;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// State reachable from both the producer and the consumers.
pub(crate) struct Shared<B: GpuBackend> {
    pub(crate) store: MetadataStore,
    pub(crate) sync: FrameSync,
    pub(crate) backend: B,
}

/// Validate `config` and build the producer/consumer pair around `backend`.
pub fn init<B: GpuBackend>(config: GpuMemConfig, backend: B) -> GpuMemResult<(Producer<B>, Consumers<B>)> {
    config.validate()?;
    tracing::info!(
        chunk_size = config.chunk_size,
        block_size = config.block_size,
        frames_in_flight = config.max_frames_in_flight,
        "initializing gpu memory manager"
    );
    let shared = Arc::new(Shared {
        store: MetadataStore::new(),
        sync: FrameSync::new(config.max_frames_in_flight),
        backend,
    });
    let consumers = Consumers::new(Arc::clone(&shared));
    Ok((Producer::new(shared, config), consumers))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn init_rejects_bad_config() {
        let config = GpuMemConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            init(config, HostBackend::new()),
            Err(GpuMemError::InvalidConfig(_))
        ));
    }

    #[test]
    fn consumers_are_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Consumers<HostBackend>>();
        assert_send_sync::<Producer<HostBackend>>();
    }
}
