//! Allocator settings

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;

/// Whether sub-allocations of different [`ResourceKind`](crate::ResourceKind)s
/// may share a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementPolicy {
    /// Vertex, index and other data live in separate blocks.
    #[default]
    SegregateByKind,
    /// Any block with room takes the allocation, regardless of kind.
    PackByArrival,
}

/// Tunables for the chunk pool, block allocator and defragmenter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuMemConfig {
    /// Size of every chunk requested from the backend.
    pub chunk_size: u64,
    /// Preferred size of a freshly placed block.
    pub block_size: u64,
    /// Granularity of every placement and sub-allocation.
    pub alignment: u64,
    /// `freeBytes / blockSize` above which a block is compacted.
    pub fragmentation_threshold: f32,
    /// Occupied fraction of a chunk below which it is consolidated away.
    pub low_utilization_threshold: f32,
    /// Cap on block moves (compactions plus relocations) per frame.
    pub max_relocations_per_frame: usize,
    /// Chunks kept resident even when empty.
    pub min_resident_chunks: usize,
    /// Device budget in chunks; `None` means limited only by the backend.
    pub max_chunks: Option<usize>,
    /// Frames the GPU may lag behind the producer.
    pub max_frames_in_flight: u64,
    pub placement: PlacementPolicy,
    /// Number of recent request sizes averaged into the typical request size.
    pub request_window: usize,
}

impl Default for GpuMemConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16 * MIB,
            block_size: 2 * MIB,
            alignment: 256,
            fragmentation_threshold: 0.30,
            low_utilization_threshold: 0.20,
            max_relocations_per_frame: 4,
            min_resident_chunks: 1,
            max_chunks: None,
            max_frames_in_flight: 2,
            placement: PlacementPolicy::SegregateByKind,
            request_window: 64,
        }
    }
}

impl GpuMemConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.alignment == 0 || !self.alignment.is_power_of_two() {
            return Err(ConfigError::Alignment(self.alignment));
        }
        for (field, value) in [("chunk_size", self.chunk_size), ("block_size", self.block_size)] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
            if value % self.alignment != 0 {
                return Err(ConfigError::Unaligned {
                    field,
                    value,
                    alignment: self.alignment,
                });
            }
        }
        if self.block_size > self.chunk_size {
            return Err(ConfigError::BlockLargerThanChunk {
                block: self.block_size,
                chunk: self.chunk_size,
            });
        }
        for (field, value) in [
            ("fragmentation_threshold", self.fragmentation_threshold),
            ("low_utilization_threshold", self.low_utilization_threshold),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return Err(ConfigError::Ratio { field, value });
            }
        }
        if self.max_relocations_per_frame == 0 {
            return Err(ConfigError::Zero {
                field: "max_relocations_per_frame",
            });
        }
        if self.max_frames_in_flight == 0 {
            return Err(ConfigError::Zero {
                field: "max_frames_in_flight",
            });
        }
        if self.request_window == 0 {
            return Err(ConfigError::Zero {
                field: "request_window",
            });
        }
        if let Some(max) = self.max_chunks {
            if max == 0 || max < self.min_resident_chunks {
                return Err(ConfigError::ChunkBounds {
                    min: self.min_resident_chunks,
                    max,
                });
            }
        }
        Ok(())
    }

    /// Round `size` up to the configured alignment. Saturates to the
    /// largest aligned value instead of wrapping.
    #[inline]
    pub fn align(&self, size: u64) -> u64 {
        let mask = self.alignment - 1;
        size.saturating_add(mask) & !mask
    }
}
