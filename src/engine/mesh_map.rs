//! Mesh block bookkeeping.
//!
//! Mesh blocks live on their own grid, which may be coarser or finer than the
//! data grid. Each block tracks two independent refcounts (render interest
//! and collision interest) and a small update state machine that guarantees
//! at most one mesh-build job is in flight per block.

use std::collections::HashMap;

use cgmath::Point3;

use crate::core::RefCount;
use crate::mesher::BlockMesh;

/// Update state of one mesh block.
///
/// Transitions:
/// `UpToDate → RequiresUpdate` (data changed), `RequiresUpdate → UpdateSent`
/// (job issued), `UpdateSent → UpToDate` (result applied). A data change
/// while a job is in flight sets [`MeshBlock::pending_rebuild`] instead of
/// leaving `UpdateSent`, so a fresh job is only issued once the in-flight
/// one lands and single-flight is preserved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeshState {
    /// Geometry matches the current voxel data.
    UpToDate,
    /// Voxel data changed; a build must be scheduled.
    RequiresUpdate,
    /// A build job is in flight.
    UpdateSent,
}

/// One mesh block's geometry and interest.
pub(crate) struct MeshBlock {
    /// Last built geometry; `None` either before the first build or when the
    /// block polygonized to nothing.
    pub mesh: Option<BlockMesh>,
    /// True once at least one build result has been applied. Distinguishes
    /// "not yet meshed" from "meshed to empty".
    pub built: bool,
    /// Viewers needing renderable geometry here.
    pub mesh_viewers: RefCount,
    /// Viewers needing collision geometry here.
    pub collision_viewers: RefCount,
    /// Update state machine.
    pub state: MeshState,
    /// Voxel data changed while a build job was in flight; the block is
    /// re-queued when that job's result is applied.
    pub pending_rebuild: bool,
}

impl MeshBlock {
    pub fn new() -> Self {
        MeshBlock {
            mesh: None,
            built: false,
            mesh_viewers: RefCount::default(),
            collision_viewers: RefCount::default(),
            state: MeshState::RequiresUpdate,
            pending_rebuild: false,
        }
    }

    /// Total interest across both refcounts.
    pub fn total_viewers(&self) -> u32 {
        self.mesh_viewers.get() + self.collision_viewers.get()
    }
}

/// Sparse store of mesh blocks, keyed by mesh-block position.
#[derive(Default)]
pub(crate) struct MeshMap {
    pub blocks: HashMap<Point3<i32>, MeshBlock>,
}

impl MeshMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, position: Point3<i32>) -> Option<&MeshBlock> {
        self.blocks.get(&position)
    }

    pub fn get_mut(&mut self, position: Point3<i32>) -> Option<&mut MeshBlock> {
        self.blocks.get_mut(&position)
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}
