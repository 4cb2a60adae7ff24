//! # Streaming Module
//!
//! The engine's boundary to block persistence and procedural generation:
//! the [`VoxelStream`] and [`VoxelGenerator`] collaborator traits, the
//! epoch-stamped dependency handles shared with worker jobs, and the job
//! types themselves.

mod dependency;
mod generator;
mod stream;
mod tasks;

pub use dependency::{MeshingDependency, StreamingDependency};
pub use generator::{NoiseGenerator, UniformGenerator, VoxelGenerator};
pub use stream::{DirectoryStream, LoadOutcome, MemoryStream, StreamError, VoxelStream};
pub use tasks::{BuildMeshTask, LoadBlockTask, SaveBlockTask};
