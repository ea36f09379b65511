//! Fills fixed-capacity GPU buffers with repeated copies ("tiles") of a payload.
//!
//! Tile `k` occupies `[k * tile, (k + 1) * tile)`. Only whole tiles are
//! written; the remainder past the last tile is never touched and must never
//! be read.

use crate::model::vertex::GpuVertex;
use crate::renderer::device::{BufferId, DeviceError, GraphicsDevice};
use std::ops::Range;
use thiserror::Error;

/// Upper bound for a single staged write; whole tiles are grouped up to this size.
const MAX_BATCH_BYTES: u64 = 4 << 20;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PackError {
    #[error("payload is empty")]
    EmptyPayload,

    #[error("index tile {tile} overflows u32 (stride {stride})")]
    IndexOverflow { tile: u64, stride: u32 },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Placement of whole tiles inside a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePlan {
    pub capacity: u64,
    pub tile_bytes: u64,
    pub tile_count: u64,
}

impl TilePlan {
    /// `floor(capacity / tile_bytes)` tiles. A payload larger than the buffer
    /// is a device error: it would produce zero tiles.
    pub fn new(capacity: u64, tile_bytes: u64) -> Result<Self, PackError> {
        if tile_bytes == 0 {
            return Err(PackError::EmptyPayload);
        }
        if tile_bytes > capacity {
            return Err(DeviceError::CapacityExceeded {
                size: tile_bytes,
                capacity,
            }
            .into());
        }
        Ok(Self {
            capacity,
            tile_bytes,
            tile_count: capacity / tile_bytes,
        })
    }

    pub fn tile_range(&self, k: u64) -> Option<Range<u64>> {
        (k < self.tile_count).then(|| k * self.tile_bytes..(k + 1) * self.tile_bytes)
    }

    pub fn bytes_written(&self) -> u64 {
        self.tile_count * self.tile_bytes
    }

    /// Bytes after the last tile that stay unwritten.
    pub fn remainder(&self) -> u64 {
        self.capacity - self.bytes_written()
    }

    fn tiles_per_batch(&self) -> u64 {
        (MAX_BATCH_BYTES / self.tile_bytes).max(1)
    }
}

/// How render-model buffers are sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferStrategy {
    /// Capacity equals one copy of the payload.
    #[default]
    Exact,
    /// Fixed capacities filled with as many tiles as fit. Index tile `t` is
    /// offset by `t * index_stride_tiles * vertex_count`.
    Tiled {
        vertex_capacity: u64,
        index_capacity: u64,
        index_stride_tiles: u32,
    },
}

impl BufferStrategy {
    /// Buffer sizing used for performance-compatibility runs.
    pub const REFERENCE_TILED: BufferStrategy = BufferStrategy::Tiled {
        vertex_capacity: 40_740_000,
        index_capacity: 19_012_000,
        index_stride_tiles: 3,
    };

    /// Vertex buffer capacity for a payload of `tile_bytes`.
    pub fn vertex_capacity(&self, tile_bytes: u64) -> u64 {
        match *self {
            BufferStrategy::Exact => tile_bytes,
            BufferStrategy::Tiled { vertex_capacity, .. } => vertex_capacity,
        }
    }

    pub fn index_stride_tiles(&self) -> u32 {
        match *self {
            BufferStrategy::Exact => 0,
            BufferStrategy::Tiled { index_stride_tiles, .. } => index_stride_tiles.max(1),
        }
    }

    /// Index buffer capacity for a payload of `tile_bytes`, limited so that
    /// every written index tile addresses one of `vertex_tiles` written vertex tiles.
    pub fn index_capacity(&self, tile_bytes: u64, vertex_tiles: u64) -> u64 {
        match *self {
            BufferStrategy::Exact => tile_bytes,
            BufferStrategy::Tiled { index_capacity, .. } => {
                let stride = u64::from(self.index_stride_tiles());
                let addressable = vertex_tiles.saturating_sub(1) / stride + 1;
                index_capacity.min(addressable * tile_bytes)
            }
        }
    }
}

/// Writes `vertices` as many times as whole copies fit in `capacity` bytes.
pub fn pack_vertices<D: GraphicsDevice + ?Sized>(
    gpu: &mut D,
    buffer: BufferId,
    capacity: u64,
    vertices: &[GpuVertex],
) -> Result<TilePlan, PackError> {
    let tile: &[u8] = bytemuck::cast_slice(vertices);
    let plan = TilePlan::new(capacity, tile.len() as u64)?;

    let per_batch = plan.tiles_per_batch().min(plan.tile_count);
    let batch = tile.repeat(per_batch as usize);

    let mut k = 0;
    while k < plan.tile_count {
        let n = per_batch.min(plan.tile_count - k);
        gpu.write_buffer(buffer, k * plan.tile_bytes, &batch[..(n * plan.tile_bytes) as usize])?;
        k += n;
    }

    log::trace!(
        "packed {} vertex tiles of {} bytes ({} bytes left unwritten)",
        plan.tile_count,
        plan.tile_bytes,
        plan.remainder()
    );

    Ok(plan)
}

/// Same tiling as [`pack_vertices`], with tile `t` holding `indices[j] + t * stride`.
///
/// `stride` must match the vertex tiling so that index tile `t` addresses
/// vertex data that was actually written. This cannot be checked here.
pub fn pack_indices<D: GraphicsDevice + ?Sized>(
    gpu: &mut D,
    buffer: BufferId,
    capacity: u64,
    indices: &[u32],
    stride: u32,
) -> Result<TilePlan, PackError> {
    let plan = TilePlan::new(capacity, std::mem::size_of_val(indices) as u64)?;
    let max_index = u64::from(indices.iter().copied().max().unwrap_or(0));
    let stride64 = u64::from(stride);

    // Nothing is written unless the last tile's values fit in u32.
    let last_base = (plan.tile_count - 1).checked_mul(stride64);
    if last_base.map_or(true, |b| b + max_index > u64::from(u32::MAX)) {
        let tile = (u64::from(u32::MAX) - max_index) / stride64 + 1;
        return Err(PackError::IndexOverflow { tile, stride });
    }

    let per_batch = plan.tiles_per_batch().min(plan.tile_count);
    let mut batch = Vec::<u32>::with_capacity(per_batch as usize * indices.len());

    let mut k = 0;
    while k < plan.tile_count {
        let n = per_batch.min(plan.tile_count - k);
        batch.clear();

        for t in k..k + n {
            let base = (t * stride64) as u32;
            batch.extend(indices.iter().map(|&i| i + base));
        }

        gpu.write_buffer(buffer, k * plan.tile_bytes, bytemuck::cast_slice(&batch))?;
        k += n;
    }

    log::trace!(
        "packed {} index tiles of {} bytes, stride {}",
        plan.tile_count,
        plan.tile_bytes,
        stride
    );

    Ok(plan)
}
