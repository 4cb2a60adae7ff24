//! Dense cubic voxel storage.
//!
//! The paging store needs O(1) random reads and writes, so blocks are stored
//! as a flat `Vec<u16>` in x-innermost order rather than a compressed form.
//! Compression is left to the backing stream's codec.

use cgmath::Point3;
use serde::{Deserialize, Serialize};

use super::AIR_VOXEL;

/// A cubic grid of voxel values with a power-of-two side length.
///
/// Value `0` ([`AIR_VOXEL`]) is empty space; any other value is an opaque
/// voxel id interpreted by the mesher and game code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoxelBuffer {
    size_po2: u32,
    data: Vec<u16>,
}

impl VoxelBuffer {
    /// Creates a buffer of side `1 << size_po2` filled with air.
    pub fn new(size_po2: u32) -> Self {
        let side = 1usize << size_po2;
        VoxelBuffer {
            size_po2,
            data: vec![AIR_VOXEL; side * side * side],
        }
    }

    /// Creates a buffer filled with a single value.
    pub fn filled(size_po2: u32, value: u16) -> Self {
        let side = 1usize << size_po2;
        VoxelBuffer {
            size_po2,
            data: vec![value; side * side * side],
        }
    }

    /// Side length in voxels.
    pub fn size(&self) -> i32 {
        1 << self.size_po2
    }

    /// Base-2 logarithm of the side length.
    pub fn size_po2(&self) -> u32 {
        self.size_po2
    }

    #[inline]
    fn index(&self, pos: Point3<i32>) -> usize {
        debug_assert!(self.contains_local(pos), "voxel {:?} out of buffer", pos);
        let side = 1usize << self.size_po2;
        pos.x as usize + side * (pos.y as usize + side * pos.z as usize)
    }

    /// Returns true if the buffer-local position is inside the cube.
    pub fn contains_local(&self, pos: Point3<i32>) -> bool {
        let side = self.size();
        pos.x >= 0 && pos.y >= 0 && pos.z >= 0 && pos.x < side && pos.y < side && pos.z < side
    }

    /// Reads the voxel at a buffer-local position.
    pub fn get_voxel(&self, pos: Point3<i32>) -> u16 {
        self.data[self.index(pos)]
    }

    /// Writes the voxel at a buffer-local position.
    pub fn set_voxel(&mut self, pos: Point3<i32>, value: u16) {
        let i = self.index(pos);
        self.data[i] = value;
    }

    /// Overwrites every voxel with `value`.
    pub fn fill(&mut self, value: u16) {
        self.data.fill(value);
    }

    /// Returns `Some(value)` if every voxel holds the same value.
    pub fn uniform_value(&self) -> Option<u16> {
        let first = *self.data.first()?;
        self.data.iter().all(|&v| v == first).then_some(first)
    }

    /// Raw voxel slice in x-innermost order.
    pub fn raw(&self) -> &[u16] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write() {
        let mut b = VoxelBuffer::new(4);
        assert_eq!(b.size(), 16);
        assert_eq!(b.get_voxel(Point3::new(3, 5, 7)), AIR_VOXEL);
        b.set_voxel(Point3::new(3, 5, 7), 42);
        assert_eq!(b.get_voxel(Point3::new(3, 5, 7)), 42);
        assert_eq!(b.get_voxel(Point3::new(5, 3, 7)), AIR_VOXEL);
    }

    #[test]
    fn uniformity() {
        let mut b = VoxelBuffer::filled(2, 7);
        assert_eq!(b.uniform_value(), Some(7));
        b.set_voxel(Point3::new(0, 0, 0), 1);
        assert_eq!(b.uniform_value(), None);
    }
}
