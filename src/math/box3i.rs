//! Axis-aligned integer box used for viewer interest regions.
//!
//! A `Box3i` covers the half-open cell range `[min, min + size)`. Viewer
//! diffing relies on [`Box3i::for_each_cell_not_in`] to enumerate exactly the
//! cells entering or leaving a region between two ticks.

use cgmath::{Point3, Vector3};
use serde::{Deserialize, Serialize};

use super::{point_max, point_min, vector_max_zero};

/// An axis-aligned box on the integer grid, spanning `[min, min + size)`.
///
/// A box with any zero size component is empty and contains no cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Box3i {
    /// Minimum corner (inclusive).
    pub min: Point3<i32>,
    /// Extent along each axis. Never negative.
    pub size: Vector3<i32>,
}

impl Default for Box3i {
    fn default() -> Self {
        Box3i::empty()
    }
}

impl Box3i {
    /// An empty box at the origin.
    pub fn empty() -> Self {
        Box3i {
            min: Point3::new(0, 0, 0),
            size: Vector3::new(0, 0, 0),
        }
    }

    /// Builds a box from a minimum corner and size, clamping negative sizes
    /// to zero.
    pub fn new(min: Point3<i32>, size: Vector3<i32>) -> Self {
        Box3i {
            min,
            size: vector_max_zero(size),
        }
    }

    /// Builds a box from inclusive minimum and exclusive maximum corners.
    pub fn from_min_max(min: Point3<i32>, max: Point3<i32>) -> Self {
        Box3i::new(min, max - min)
    }

    /// Builds a box centered on `center` extending `extents` cells in every
    /// direction along each axis.
    pub fn from_center_extents(center: Point3<i32>, extents: Vector3<i32>) -> Self {
        Box3i::new(center - extents, extents * 2 + Vector3::new(1, 1, 1))
    }

    /// Exclusive maximum corner.
    pub fn max(&self) -> Point3<i32> {
        self.min + self.size
    }

    /// Returns true if the box contains no cells.
    pub fn is_empty(&self) -> bool {
        self.size.x <= 0 || self.size.y <= 0 || self.size.z <= 0
    }

    /// Number of cells covered by the box.
    pub fn volume(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.size.x as u64 * self.size.y as u64 * self.size.z as u64
        }
    }

    /// Returns true if `pos` lies inside the box.
    pub fn contains(&self, pos: Point3<i32>) -> bool {
        let max = self.max();
        pos.x >= self.min.x
            && pos.y >= self.min.y
            && pos.z >= self.min.z
            && pos.x < max.x
            && pos.y < max.y
            && pos.z < max.z
    }

    /// Returns true if `other` shares at least one cell with this box.
    pub fn intersects(&self, other: &Box3i) -> bool {
        !self.intersection(other).is_empty()
    }

    /// The overlapping region of two boxes; empty if they are disjoint.
    pub fn intersection(&self, other: &Box3i) -> Box3i {
        let min = point_max(self.min, other.min);
        let max = point_min(self.max(), other.max());
        Box3i::from_min_max(min, max)
    }

    /// Alias of [`Box3i::intersection`] reading as a clamp against bounds.
    pub fn clipped(&self, bounds: &Box3i) -> Box3i {
        self.intersection(bounds)
    }

    /// Grows the box by `amount` cells on every side.
    pub fn padded(&self, amount: i32) -> Box3i {
        Box3i::new(
            self.min - Vector3::new(amount, amount, amount),
            self.size + Vector3::new(amount, amount, amount) * 2,
        )
    }

    /// The smallest box at a coarser power-of-two granularity covering this
    /// box. Used to convert a voxel-space region into the data or mesh block
    /// grid.
    pub fn downscaled(&self, po2: u32) -> Box3i {
        if self.is_empty() {
            return Box3i::empty();
        }
        let min = Point3::new(
            self.min.x >> po2,
            self.min.y >> po2,
            self.min.z >> po2,
        );
        let last = self.max() - Vector3::new(1, 1, 1);
        let max = Point3::new(
            (last.x >> po2) + 1,
            (last.y >> po2) + 1,
            (last.z >> po2) + 1,
        );
        Box3i::from_min_max(min, max)
    }

    /// The largest box at a coarser power-of-two granularity whose cells are
    /// fully contained in this box. Used for mesh interest, where a mesh
    /// block may only be wanted once its whole voxel extent is inside the
    /// viewer's data region.
    pub fn downscaled_inner(&self, po2: u32) -> Box3i {
        if self.is_empty() {
            return Box3i::empty();
        }
        let cell = (1 << po2) - 1;
        let min = Point3::new(
            (self.min.x + cell) >> po2,
            (self.min.y + cell) >> po2,
            (self.min.z + cell) >> po2,
        );
        let max = self.max();
        let max = Point3::new(max.x >> po2, max.y >> po2, max.z >> po2);
        Box3i::from_min_max(min, max)
    }

    /// Calls `f` for every cell in the box, in x-innermost order.
    pub fn for_each_cell<F: FnMut(Point3<i32>)>(&self, mut f: F) {
        let max = self.max();
        for z in self.min.z..max.z {
            for y in self.min.y..max.y {
                for x in self.min.x..max.x {
                    f(Point3::new(x, y, z));
                }
            }
        }
    }

    /// Calls `f` for every cell of this box that is not inside `other`.
    ///
    /// This is the set difference `self − other` driving the per-tick viewer
    /// diff: the entering region is `new − old`, the leaving region is
    /// `old − new`.
    pub fn for_each_cell_not_in<F: FnMut(Point3<i32>)>(&self, other: &Box3i, mut f: F) {
        if other.is_empty() || !self.intersects(other) {
            self.for_each_cell(f);
            return;
        }
        self.for_each_cell(|pos| {
            if !other.contains(pos) {
                f(pos);
            }
        });
    }

    /// Collects every cell of the box into a vector.
    pub fn cells(&self) -> Vec<Point3<i32>> {
        let mut out = Vec::with_capacity(self.volume() as usize);
        self.for_each_cell(|p| out.push(p));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn cell_set(b: &Box3i) -> HashSet<(i32, i32, i32)> {
        let mut set = HashSet::new();
        b.for_each_cell(|p| {
            set.insert((p.x, p.y, p.z));
        });
        set
    }

    #[test]
    fn empty_box_has_no_cells() {
        let b = Box3i::empty();
        assert!(b.is_empty());
        assert_eq!(b.volume(), 0);
        assert!(!b.contains(Point3::new(0, 0, 0)));
    }

    #[test]
    fn contains_is_half_open() {
        let b = Box3i::new(Point3::new(-1, -1, -1), Vector3::new(2, 2, 2));
        assert!(b.contains(Point3::new(-1, -1, -1)));
        assert!(b.contains(Point3::new(0, 0, 0)));
        assert!(!b.contains(Point3::new(1, 0, 0)));
    }

    #[test]
    fn difference_matches_set_difference() {
        let a = Box3i::new(Point3::new(0, 0, 0), Vector3::new(3, 3, 3));
        let b = Box3i::new(Point3::new(1, 1, 1), Vector3::new(3, 3, 3));

        let expected: HashSet<_> = cell_set(&a).difference(&cell_set(&b)).cloned().collect();
        let mut got = HashSet::new();
        a.for_each_cell_not_in(&b, |p| {
            got.insert((p.x, p.y, p.z));
        });
        assert_eq!(got, expected);

        // Disjoint boxes: difference is the whole box.
        let c = Box3i::new(Point3::new(10, 10, 10), Vector3::new(2, 2, 2));
        let mut got = HashSet::new();
        a.for_each_cell_not_in(&c, |p| {
            got.insert((p.x, p.y, p.z));
        });
        assert_eq!(got, cell_set(&a));
    }

    #[test]
    fn downscale_covers_partial_blocks() {
        // Voxels [-1, 17) on each axis straddle data blocks -1, 0 and 1 at po2=4.
        let voxels = Box3i::from_min_max(Point3::new(-1, -1, -1), Point3::new(17, 17, 17));
        let blocks = voxels.downscaled(4);
        assert_eq!(blocks.min, Point3::new(-1, -1, -1));
        assert_eq!(blocks.max(), Point3::new(2, 2, 2));
    }

    #[test]
    fn downscale_inner_keeps_only_whole_blocks() {
        // Voxels [-1, 33) contain whole 16-blocks 0 and 1 only.
        let voxels = Box3i::from_min_max(Point3::new(-1, -1, -1), Point3::new(33, 33, 33));
        let blocks = voxels.downscaled_inner(4);
        assert_eq!(blocks.min, Point3::new(0, 0, 0));
        assert_eq!(blocks.max(), Point3::new(2, 2, 2));

        // A box smaller than one block contains no whole block.
        let sliver = Box3i::from_min_max(Point3::new(1, 1, 1), Point3::new(10, 10, 10));
        assert!(sliver.downscaled_inner(4).is_empty());
    }

    #[test]
    fn intersection_and_clip() {
        let a = Box3i::new(Point3::new(0, 0, 0), Vector3::new(4, 4, 4));
        let bounds = Box3i::new(Point3::new(2, -10, 2), Vector3::new(10, 20, 1));
        let clipped = a.clipped(&bounds);
        assert_eq!(clipped.min, Point3::new(2, 0, 2));
        assert_eq!(clipped.max(), Point3::new(4, 4, 3));
        assert!(a.intersects(&bounds));
    }
}
