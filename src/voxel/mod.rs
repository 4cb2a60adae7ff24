//! # Voxel Module
//!
//! Owned voxel payloads exchanged between the paging store, the backing
//! stream and the worker tasks.

mod buffer;

pub use buffer::VoxelBuffer;

/// Voxel value representing empty space.
pub const AIR_VOXEL: u16 = 0;
