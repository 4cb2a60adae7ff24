//! # Mesher Module
//!
//! The polygonizer boundary between the terrain engine and whatever geometry
//! algorithm is in use, plus a built-in culled-face implementation.
//!
//! Mesh jobs never read the authoritative data maps. The engine snapshots the
//! mesh block's voxels, together with a margin of neighbor voxels needed to
//! polygonize faces on the block boundary, into a [`MeshInput`] that the job
//! owns outright. Out-of-bounds neighbors are pre-filled as air so a block at
//! the edge of the world is never starved of dependencies.

use bitvec::prelude::BitVec;
use cgmath::{Point3, Vector3};

use crate::voxel::AIR_VOXEL;

/// Identifies one face of a voxel cube.
///
/// The numeric order matches the adjacency arrays used by the face culler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockSide {
    /// -X face
    Front = 0,
    /// +X face
    Back = 1,
    /// -Z face
    Left = 2,
    /// +Z face
    Right = 3,
    /// +Y face
    Top = 4,
    /// -Y face
    Bottom = 5,
}

impl BlockSide {
    /// All six sides in index order.
    pub fn all() -> [BlockSide; 6] {
        [
            BlockSide::Front,
            BlockSide::Back,
            BlockSide::Left,
            BlockSide::Right,
            BlockSide::Top,
            BlockSide::Bottom,
        ]
    }

    /// Unit offset toward the neighboring voxel across this face.
    pub fn offset(self) -> Vector3<i32> {
        match self {
            BlockSide::Front => Vector3::new(-1, 0, 0),
            BlockSide::Back => Vector3::new(1, 0, 0),
            BlockSide::Left => Vector3::new(0, 0, -1),
            BlockSide::Right => Vector3::new(0, 0, 1),
            BlockSide::Top => Vector3::new(0, 1, 0),
            BlockSide::Bottom => Vector3::new(0, -1, 0),
        }
    }
}

/// Self-contained voxel snapshot handed to a mesh-build job.
///
/// Covers the mesh block volume plus `margin` voxels on every side, stored in
/// x-innermost order over the padded cube.
#[derive(Clone, Debug)]
pub struct MeshInput {
    /// Mesh block position (mesh-grid coordinates).
    pub position: Point3<i32>,
    /// Padded voxel values, side `size + 2 * margin`.
    pub voxels: Vec<u16>,
    /// Mesh block side length in voxels.
    pub size: i32,
    /// Number of neighbor voxels included on each side.
    pub margin: i32,
}

impl MeshInput {
    /// Side length of the padded snapshot.
    pub fn padded_side(&self) -> i32 {
        self.size + 2 * self.margin
    }

    /// Reads a voxel at block-local coordinates in
    /// `[-margin, size + margin)` on each axis.
    pub fn get(&self, pos: Point3<i32>) -> u16 {
        let side = self.padded_side();
        let p = pos + Vector3::new(self.margin, self.margin, self.margin);
        debug_assert!(
            p.x >= 0 && p.y >= 0 && p.z >= 0 && p.x < side && p.y < side && p.z < side,
            "mesh input read outside padded snapshot: {:?}",
            pos
        );
        self.voxels[(p.x + side * (p.y + side * p.z)) as usize]
    }
}

/// Built geometry for one mesh block. May legitimately be empty.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BlockMesh {
    /// Vertex positions, block-local voxel units.
    pub positions: Vec<[f32; 3]>,
    /// Per-vertex normals.
    pub normals: Vec<[f32; 3]>,
    /// Triangle indices.
    pub indices: Vec<u32>,
}

impl BlockMesh {
    /// Returns true if the mesh contains no geometry.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Builds renderable/collidable geometry from a voxel snapshot.
///
/// Returning `None` means the block produced no geometry (fully air or fully
/// enclosed); that is a valid terminal state, not a failure.
pub trait Mesher: Send + Sync {
    /// Polygonizes one mesh block.
    fn build(&self, input: &MeshInput) -> Option<BlockMesh>;

    /// Neighbor margin, in voxels, this mesher needs around the block to
    /// polygonize boundary faces correctly.
    fn margin_voxels(&self) -> i32 {
        1
    }
}

/// Culled visible-face mesher: one quad per solid voxel face adjacent to air.
pub struct BlockyMesher;

// Quad corner offsets per side, wound counter-clockwise seen from outside.
const FACE_CORNERS: [[[f32; 3]; 4]; 6] = [
    // Front (-X)
    [[0., 0., 1.], [0., 0., 0.], [0., 1., 0.], [0., 1., 1.]],
    // Back (+X)
    [[1., 0., 0.], [1., 0., 1.], [1., 1., 1.], [1., 1., 0.]],
    // Left (-Z)
    [[0., 0., 0.], [1., 0., 0.], [1., 1., 0.], [0., 1., 0.]],
    // Right (+Z)
    [[1., 0., 1.], [0., 0., 1.], [0., 1., 1.], [1., 1., 1.]],
    // Top (+Y)
    [[0., 1., 0.], [1., 1., 0.], [1., 1., 1.], [0., 1., 1.]],
    // Bottom (-Y)
    [[0., 0., 1.], [1., 0., 1.], [1., 0., 0.], [0., 0., 0.]],
];

impl BlockyMesher {
    /// Builds the padded occupancy mask, one bit per voxel of the snapshot.
    fn occupancy(input: &MeshInput) -> BitVec {
        let mut solid = BitVec::with_capacity(input.voxels.len());
        for &v in &input.voxels {
            solid.push(v != AIR_VOXEL);
        }
        solid
    }
}

impl Mesher for BlockyMesher {
    fn build(&self, input: &MeshInput) -> Option<BlockMesh> {
        let solid = Self::occupancy(input);
        let side = input.padded_side();
        let m = input.margin;
        let is_solid = |p: Point3<i32>| -> bool {
            let x = p.x + m;
            let y = p.y + m;
            let z = p.z + m;
            solid[(x + side * (y + side * z)) as usize]
        };

        let mut mesh = BlockMesh::default();
        for z in 0..input.size {
            for y in 0..input.size {
                for x in 0..input.size {
                    let pos = Point3::new(x, y, z);
                    if !is_solid(pos) {
                        continue;
                    }
                    for facing in BlockSide::all() {
                        if is_solid(pos + facing.offset()) {
                            continue;
                        }
                        let base = mesh.positions.len() as u32;
                        let off = facing.offset();
                        let normal = [off.x as f32, off.y as f32, off.z as f32];
                        for corner in &FACE_CORNERS[facing as usize] {
                            mesh.positions.push([
                                pos.x as f32 + corner[0],
                                pos.y as f32 + corner[1],
                                pos.z as f32 + corner[2],
                            ]);
                            mesh.normals.push(normal);
                        }
                        mesh.indices
                            .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
                    }
                }
            }
        }

        if mesh.is_empty() {
            None
        } else {
            Some(mesh)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input_with(size: i32, margin: i32, solids: &[(i32, i32, i32)]) -> MeshInput {
        let side = size + 2 * margin;
        let mut input = MeshInput {
            position: Point3::new(0, 0, 0),
            voxels: vec![AIR_VOXEL; (side * side * side) as usize],
            size,
            margin,
        };
        for &(x, y, z) in solids {
            let p = Point3::new(x + margin, y + margin, z + margin);
            input.voxels[(p.x + side * (p.y + side * p.z)) as usize] = 1;
        }
        input
    }

    #[test]
    fn lone_voxel_emits_six_faces() {
        let input = input_with(4, 1, &[(1, 1, 1)]);
        let mesh = BlockyMesher.build(&input).unwrap();
        assert_eq!(mesh.positions.len(), 6 * 4);
        assert_eq!(mesh.indices.len(), 6 * 6);
    }

    #[test]
    fn empty_block_yields_none() {
        let input = input_with(4, 1, &[]);
        assert!(BlockyMesher.build(&input).is_none());
    }

    #[test]
    fn face_against_margin_neighbor_is_culled() {
        // Voxel at x=0 with a solid margin neighbor at x=-1: the -X face is
        // covered by the neighboring data block and must not be emitted.
        let input = input_with(2, 1, &[(0, 0, 0), (-1, 0, 0)]);
        let mesh = BlockyMesher.build(&input).unwrap();
        // 5 faces for the in-block voxel; the margin voxel itself is not meshed.
        assert_eq!(mesh.positions.len(), 5 * 4);
    }
}
