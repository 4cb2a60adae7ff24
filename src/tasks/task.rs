//! # Task System Core Types
//!
//! Defines the unit of background work and the typed outputs it produces.
//!
//! ## Task Lifecycle
//! 1. A `Task` is created and handed to a [`TaskScheduler`] via `submit()`
//! 2. The task's `run()` method executes on a worker thread
//! 3. The resulting [`TaskOutput`] is buffered by the scheduler
//! 4. The engine drains outputs on the main thread once per tick and applies
//!    each one to its maps, discarding any whose dependency epoch is stale
//!
//! [`TaskScheduler`]: super::TaskScheduler

use cgmath::Point3;

use crate::mesher::BlockMesh;
use crate::voxel::VoxelBuffer;

/// A unit of work executed on a worker thread.
///
/// Tasks own all the data they need; they never touch the engine's
/// authoritative maps. Results flow back through [`TaskOutput`] and are
/// applied on the main thread.
pub trait Task: Send {
    /// Performs the work and produces its output.
    fn run(self: Box<Self>) -> TaskOutput;
}

/// Output of a completed task, drained by the engine once per tick.
#[derive(Debug)]
pub enum TaskOutput {
    /// A load or save job finished.
    Data(BlockDataOutput),
    /// A mesh-build job finished.
    Mesh(BlockMeshOutput),
}

/// Completion record for a data block load or save job.
#[derive(Debug)]
pub struct BlockDataOutput {
    /// Data block position.
    pub position: Point3<i32>,
    /// Streaming dependency epoch the job was issued under.
    pub epoch: u64,
    /// What happened.
    pub kind: BlockDataOutputKind,
}

/// Outcome of a data block job.
#[derive(Debug)]
pub enum BlockDataOutputKind {
    /// The block was read from the stream or produced by the generator.
    Loaded {
        /// The block's voxels.
        voxels: VoxelBuffer,
    },
    /// The stream reported an error; the position stays absent and is only
    /// retried on the next viewer interest.
    LoadFailed,
    /// The block's buffer was persisted.
    Saved,
    /// The save reported an error; retry behavior is decided by the engine's
    /// save retry policy.
    SaveFailed,
}

/// Completion record for a mesh-build job.
#[derive(Debug)]
pub struct BlockMeshOutput {
    /// Mesh block position.
    pub position: Point3<i32>,
    /// Meshing dependency epoch the job was issued under.
    pub epoch: u64,
    /// Built geometry; `None` is a valid empty result.
    pub mesh: Option<BlockMesh>,
}
