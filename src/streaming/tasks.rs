//! Job types executed on the worker pool.
//!
//! Each job owns everything it needs: its position, a snapshot or shared
//! buffer, and a clone of the dependency handle current when it was issued.
//! Jobs never touch the engine's maps; they report back through
//! [`TaskOutput`] and the engine applies the result on the main thread.

use std::sync::Arc;

use cgmath::Point3;
use log::error;

use crate::mesher::MeshInput;
use crate::streaming::{LoadOutcome, MeshingDependency, StreamingDependency};
use crate::tasks::{BlockDataOutput, BlockDataOutputKind, BlockMeshOutput, Task, TaskOutput};
use crate::voxel::VoxelBuffer;

/// Loads one data block from the stream, falling back to the generator when
/// the stream has never seen the position.
pub struct LoadBlockTask {
    position: Point3<i32>,
    block_size_po2: u32,
    dependency: Arc<StreamingDependency>,
}

impl LoadBlockTask {
    /// Creates a load job for `position`.
    pub fn new(
        position: Point3<i32>,
        block_size_po2: u32,
        dependency: Arc<StreamingDependency>,
    ) -> Self {
        LoadBlockTask {
            position,
            block_size_po2,
            dependency,
        }
    }

    fn load_or_generate(&self) -> Result<VoxelBuffer, crate::streaming::StreamError> {
        if let Some(stream) = &self.dependency.stream {
            if let LoadOutcome::Found(voxels) = stream.load(self.position)? {
                return Ok(voxels);
            }
        }
        Ok(match &self.dependency.generator {
            Some(generator) => generator.generate(self.position, self.block_size_po2),
            None => VoxelBuffer::new(self.block_size_po2),
        })
    }
}

impl Task for LoadBlockTask {
    fn run(self: Box<Self>) -> TaskOutput {
        let kind = match self.load_or_generate() {
            Ok(voxels) => BlockDataOutputKind::Loaded { voxels },
            Err(e) => {
                error!("failed to load block {:?}: {}", self.position, e);
                BlockDataOutputKind::LoadFailed
            }
        };
        TaskOutput::Data(BlockDataOutput {
            position: self.position,
            epoch: self.dependency.epoch,
            kind,
        })
    }
}

/// Persists one data block buffer.
///
/// The buffer is shared read-only with the main thread for the duration of
/// the job; the engine's copy-on-write editing guarantees no writer touches
/// it while the save is in flight.
pub struct SaveBlockTask {
    position: Point3<i32>,
    voxels: Arc<VoxelBuffer>,
    dependency: Arc<StreamingDependency>,
}

impl SaveBlockTask {
    /// Creates a save job for `position`.
    pub fn new(
        position: Point3<i32>,
        voxels: Arc<VoxelBuffer>,
        dependency: Arc<StreamingDependency>,
    ) -> Self {
        SaveBlockTask {
            position,
            voxels,
            dependency,
        }
    }
}

impl Task for SaveBlockTask {
    fn run(self: Box<Self>) -> TaskOutput {
        let kind = match &self.dependency.stream {
            Some(stream) => match stream.save(self.position, &self.voxels) {
                Ok(()) => BlockDataOutputKind::Saved,
                Err(e) => {
                    error!("failed to save block {:?}: {}", self.position, e);
                    BlockDataOutputKind::SaveFailed
                }
            },
            // Without a stream there is nowhere to persist to; acknowledge so
            // the retained buffer can be released.
            None => BlockDataOutputKind::Saved,
        };
        TaskOutput::Data(BlockDataOutput {
            position: self.position,
            epoch: self.dependency.epoch,
            kind,
        })
    }
}

/// Polygonizes one mesh block from a padded voxel snapshot.
pub struct BuildMeshTask {
    input: MeshInput,
    dependency: Arc<MeshingDependency>,
}

impl BuildMeshTask {
    /// Creates a mesh-build job from a snapshot assembled by the engine.
    pub fn new(input: MeshInput, dependency: Arc<MeshingDependency>) -> Self {
        BuildMeshTask { input, dependency }
    }
}

impl Task for BuildMeshTask {
    fn run(self: Box<Self>) -> TaskOutput {
        let mesh = self.dependency.mesher.build(&self.input);
        TaskOutput::Mesh(BlockMeshOutput {
            position: self.input.position,
            epoch: self.dependency.epoch,
            mesh,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::{MemoryStream, UniformGenerator, VoxelStream};

    fn dependency(stream: Option<Arc<dyn VoxelStream>>) -> Arc<StreamingDependency> {
        Arc::new(StreamingDependency {
            stream,
            generator: Some(Arc::new(UniformGenerator::new(3))),
            epoch: 1,
        })
    }

    #[test]
    fn load_prefers_stream_over_generator() {
        let stream = Arc::new(MemoryStream::new());
        let pos = Point3::new(0, 0, 0);
        let saved = VoxelBuffer::filled(4, 8);
        stream.save(pos, &saved).unwrap();

        let task = Box::new(LoadBlockTask::new(pos, 4, dependency(Some(stream))));
        match task.run() {
            TaskOutput::Data(BlockDataOutput {
                kind: BlockDataOutputKind::Loaded { voxels },
                epoch,
                ..
            }) => {
                assert_eq!(epoch, 1);
                assert_eq!(voxels.uniform_value(), Some(8));
            }
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn load_generates_when_not_found() {
        let task = Box::new(LoadBlockTask::new(
            Point3::new(5, 5, 5),
            4,
            dependency(Some(Arc::new(MemoryStream::new()))),
        ));
        match task.run() {
            TaskOutput::Data(BlockDataOutput {
                kind: BlockDataOutputKind::Loaded { voxels },
                ..
            }) => assert_eq!(voxels.uniform_value(), Some(3)),
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn save_reaches_the_stream() {
        let stream = Arc::new(MemoryStream::new());
        let pos = Point3::new(2, 0, -1);
        let task = Box::new(SaveBlockTask::new(
            pos,
            Arc::new(VoxelBuffer::filled(4, 6)),
            dependency(Some(stream.clone())),
        ));
        match task.run() {
            TaskOutput::Data(BlockDataOutput {
                kind: BlockDataOutputKind::Saved,
                ..
            }) => {}
            other => panic!("unexpected output: {:?}", other),
        }
        assert!(stream.contains(pos));
    }
}
