//! # Math Module
//!
//! Integer block-grid math shared by the paging and meshing stores.
//!
//! Terrain state is keyed by `Point3<i32>` block coordinates at two
//! independent power-of-two granularities (data blocks and mesh blocks).
//! This module provides the conversions between voxel space and block space
//! and the [`Box3i`] integer box used to describe viewer interest regions.

use cgmath::{Point3, Vector3};

mod box3i;

pub use box3i::Box3i;

/// Converts a voxel coordinate to the block coordinate containing it.
///
/// Uses an arithmetic shift so negative coordinates floor toward negative
/// infinity, which keeps the block grid uniform across the origin.
///
/// # Arguments
/// * `voxel_pos` - A position in voxel coordinates
/// * `block_size_po2` - Base-2 logarithm of the block size
pub fn voxel_to_block_po2(voxel_pos: Point3<i32>, block_size_po2: u32) -> Point3<i32> {
    Point3::new(
        voxel_pos.x >> block_size_po2,
        voxel_pos.y >> block_size_po2,
        voxel_pos.z >> block_size_po2,
    )
}

/// Converts a block coordinate to the voxel coordinate of its minimum corner.
///
/// Inverse of [`voxel_to_block_po2`] in the sense that
/// `voxel_to_block_po2(block_to_voxel_po2(b, p), p) == b` for every `b`.
pub fn block_to_voxel_po2(block_pos: Point3<i32>, block_size_po2: u32) -> Point3<i32> {
    Point3::new(
        block_pos.x << block_size_po2,
        block_pos.y << block_size_po2,
        block_pos.z << block_size_po2,
    )
}

/// Componentwise minimum of two points.
pub fn point_min(a: Point3<i32>, b: Point3<i32>) -> Point3<i32> {
    Point3::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z))
}

/// Componentwise maximum of two points.
pub fn point_max(a: Point3<i32>, b: Point3<i32>) -> Point3<i32> {
    Point3::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z))
}

/// Componentwise maximum of a vector and zero, used to clamp box sizes.
pub fn vector_max_zero(v: Vector3<i32>) -> Vector3<i32> {
    Vector3::new(v.x.max(0), v.y.max(0), v.z.max(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voxel_block_round_trip() {
        for po2 in 1..6 {
            for n in [-65, -17, -16, -1, 0, 1, 15, 16, 31, 64] {
                let b = Point3::new(n, -n, n * 3);
                let v = block_to_voxel_po2(b, po2);
                assert_eq!(voxel_to_block_po2(v, po2), b);
            }
        }
    }

    #[test]
    fn negative_voxels_floor() {
        // Voxel -1 belongs to block -1, not block 0.
        assert_eq!(
            voxel_to_block_po2(Point3::new(-1, -16, -17), 4),
            Point3::new(-1, -1, -2)
        );
    }
}
