//! Engine events and the listener seam.
//!
//! Events are buffered during a tick and dispatched only after every map
//! mutation of that tick has been committed, so a listener reacting to an
//! event always observes the post-commit state. Listeners must not assume
//! any ordering between events of different blocks within one tick.

use cgmath::Point3;

use crate::engine::viewers::ViewerId;

/// Something observable that happened to the terrain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TerrainEvent {
    /// A data block became available inside a viewer's interest box.
    DataBlockEntered {
        /// Data block position.
        position: Point3<i32>,
        /// Viewer whose box covers the block.
        viewer: ViewerId,
    },
    /// A data block left a viewer's interest box or was unloaded.
    DataBlockExited {
        /// Data block position.
        position: Point3<i32>,
        /// Viewer that no longer covers the block.
        viewer: ViewerId,
    },
    /// A mesh block entered a viewer's mesh interest box.
    MeshBlockEntered {
        /// Mesh block position.
        position: Point3<i32>,
        /// Viewer whose box covers the block.
        viewer: ViewerId,
    },
    /// A mesh block left a viewer's mesh interest box.
    MeshBlockExited {
        /// Mesh block position.
        position: Point3<i32>,
        /// Viewer that no longer covers the block.
        viewer: ViewerId,
    },
    /// Voxels inside `[min, max)` were edited and committed.
    AreaEdited {
        /// Inclusive minimum voxel coordinate.
        min: Point3<i32>,
        /// Exclusive maximum voxel coordinate.
        max: Point3<i32>,
    },
}

/// Receives terrain events after each tick's commit phase.
///
/// Every method has an empty default body so a listener only overrides what
/// it cares about.
pub trait TerrainListener {
    /// A data block became available for a viewer.
    fn on_data_block_entered(&mut self, _position: Point3<i32>, _viewer: ViewerId) {}
    /// A data block stopped being available for a viewer.
    fn on_data_block_exited(&mut self, _position: Point3<i32>, _viewer: ViewerId) {}
    /// A mesh block entered a viewer's mesh box.
    fn on_mesh_block_entered(&mut self, _position: Point3<i32>, _viewer: ViewerId) {}
    /// A mesh block left a viewer's mesh box.
    fn on_mesh_block_exited(&mut self, _position: Point3<i32>, _viewer: ViewerId) {}
    /// A voxel area was edited.
    fn on_area_edited(&mut self, _min: Point3<i32>, _max: Point3<i32>) {}
}

/// Routes one event to the matching listener method.
pub(crate) fn dispatch(listener: &mut dyn TerrainListener, event: &TerrainEvent) {
    match *event {
        TerrainEvent::DataBlockEntered { position, viewer } => {
            listener.on_data_block_entered(position, viewer)
        }
        TerrainEvent::DataBlockExited { position, viewer } => {
            listener.on_data_block_exited(position, viewer)
        }
        TerrainEvent::MeshBlockEntered { position, viewer } => {
            listener.on_mesh_block_entered(position, viewer)
        }
        TerrainEvent::MeshBlockExited { position, viewer } => {
            listener.on_mesh_block_exited(position, viewer)
        }
        TerrainEvent::AreaEdited { min, max } => listener.on_area_edited(min, max),
    }
}
