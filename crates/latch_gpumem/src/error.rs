use crate::ids::{BlockId, ChunkId, GpuAddress, Handle, SubAllocId};
use thiserror::Error;

/// Failures reported by a [`GpuBackend`](crate::backend::GpuBackend).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("device could not allocate {requested} bytes")]
    OutOfMemory { requested: u64 },

    #[error("address {address:#x} (+{len} bytes) is not inside a live chunk")]
    InvalidAddress { address: GpuAddress, len: u64 },

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("copy could not be scheduled: {0}")]
    CopyFailed(String),
}

/// Errors surfaced to the producer.
///
/// Consumers never see these: an unknown or discarded handle on the read
/// path is a [`Read::Skip`](crate::consumer::Read::Skip), not an error.
#[derive(Debug, Error)]
pub enum GpuMemError {
    #[error("out of device memory while acquiring a {requested} byte chunk")]
    OutOfDeviceMemory {
        requested: u64,
        #[source]
        source: Option<BackendError>,
    },

    #[error("{chunk} still holds {blocks} block(s)")]
    ChunkNotEmpty { chunk: ChunkId, blocks: usize },

    #[error("{0} is stale or unknown")]
    HandleNotFound(Handle),

    #[error("allocation of {requested} bytes exceeds the {limit} byte chunk size")]
    AllocationTooLarge { requested: u64, limit: u64 },

    #[error("zero-sized allocations are not allowed")]
    ZeroSized,

    /// Producer bookkeeping points at an interval its block no longer has.
    #[error("{block} has no live interval {sub:?}")]
    MissingInterval { block: BlockId, sub: SubAllocId },

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Configuration rejected by [`GpuMemConfig::validate`](crate::GpuMemConfig::validate).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("alignment {0} must be a power of two")]
    Alignment(u64),

    #[error("{field} ({value}) must be a multiple of the alignment ({alignment})")]
    Unaligned {
        field: &'static str,
        value: u64,
        alignment: u64,
    },

    #[error("block_size ({block}) exceeds chunk_size ({chunk})")]
    BlockLargerThanChunk { block: u64, chunk: u64 },

    #[error("{field} must lie in (0, 1), got {value}")]
    Ratio { field: &'static str, value: f32 },

    #[error("max_chunks ({max}) is below min_resident_chunks ({min})")]
    ChunkBounds { min: usize, max: usize },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type GpuMemResult<T> = Result<T, GpuMemError>;
