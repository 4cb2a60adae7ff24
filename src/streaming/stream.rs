//! Backing store collaborator for block persistence.
//!
//! The engine treats the stream as authoritative storage: `load` either
//! returns a previously saved buffer or reports that the position has never
//! been saved, in which case generation takes over.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind};
use std::path::PathBuf;

use cgmath::Point3;
use thiserror::Error;

use crate::core::MtResource;
use crate::voxel::VoxelBuffer;

/// Error reported by stream implementations.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Underlying I/O failure.
    #[error("stream i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// Block payload could not be encoded or decoded.
    #[error("block codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Result of a successful load request.
#[derive(Debug)]
pub enum LoadOutcome {
    /// The stream holds a buffer for this position.
    Found(VoxelBuffer),
    /// The position has never been saved; the caller should generate it.
    NotFound,
}

/// Persistent block storage, shared with worker tasks.
pub trait VoxelStream: Send + Sync {
    /// Reads the block at `position`.
    fn load(&self, position: Point3<i32>) -> Result<LoadOutcome, StreamError>;

    /// Persists the block at `position`.
    fn save(&self, position: Point3<i32>, voxels: &VoxelBuffer) -> Result<(), StreamError>;
}

/// In-memory stream: a block table behind a read-write lock.
///
/// Primary stream for tests and the demo binary; load and save jobs running
/// on different workers share the table through [`MtResource`].
pub struct MemoryStream {
    blocks: MtResource<HashMap<Point3<i32>, VoxelBuffer>>,
}

impl MemoryStream {
    /// Creates an empty stream.
    pub fn new() -> Self {
        MemoryStream {
            blocks: MtResource::new(HashMap::new()),
        }
    }

    /// Number of blocks currently persisted.
    pub fn block_count(&self) -> usize {
        self.blocks.get().len()
    }

    /// Returns true if a block has been saved at `position`.
    pub fn contains(&self, position: Point3<i32>) -> bool {
        self.blocks.get().contains_key(&position)
    }
}

impl Default for MemoryStream {
    fn default() -> Self {
        Self::new()
    }
}

impl VoxelStream for MemoryStream {
    fn load(&self, position: Point3<i32>) -> Result<LoadOutcome, StreamError> {
        match self.blocks.get().get(&position) {
            Some(voxels) => Ok(LoadOutcome::Found(voxels.clone())),
            None => Ok(LoadOutcome::NotFound),
        }
    }

    fn save(&self, position: Point3<i32>, voxels: &VoxelBuffer) -> Result<(), StreamError> {
        self.blocks.get_mut().insert(position, voxels.clone());
        Ok(())
    }
}

/// Directory-backed stream: one bincode-encoded file per block.
///
/// Files are named `x_y_z.vxb` under the stream's root directory. Writes go
/// through a buffered writer and replace the file wholesale.
pub struct DirectoryStream {
    root: PathBuf,
}

impl DirectoryStream {
    /// Opens (and creates if needed) a stream rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StreamError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(DirectoryStream { root })
    }

    fn block_path(&self, position: Point3<i32>) -> PathBuf {
        self.root
            .join(format!("{}_{}_{}.vxb", position.x, position.y, position.z))
    }
}

impl VoxelStream for DirectoryStream {
    fn load(&self, position: Point3<i32>) -> Result<LoadOutcome, StreamError> {
        let file = match File::open(self.block_path(position)) {
            Ok(file) => file,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(LoadOutcome::NotFound),
            Err(error) => return Err(error.into()),
        };
        let voxels: VoxelBuffer = bincode::deserialize_from(BufReader::new(file))?;
        Ok(LoadOutcome::Found(voxels))
    }

    fn save(&self, position: Point3<i32>, voxels: &VoxelBuffer) -> Result<(), StreamError> {
        let file = File::create(self.block_path(position))?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, voxels)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_stream_round_trip() {
        let stream = MemoryStream::new();
        let pos = Point3::new(1, -2, 3);
        assert!(matches!(stream.load(pos), Ok(LoadOutcome::NotFound)));

        let mut voxels = VoxelBuffer::new(4);
        voxels.set_voxel(Point3::new(0, 0, 0), 9);
        stream.save(pos, &voxels).unwrap();

        match stream.load(pos).unwrap() {
            LoadOutcome::Found(loaded) => assert_eq!(loaded, voxels),
            LoadOutcome::NotFound => panic!("block should exist"),
        }
    }

    #[test]
    fn directory_stream_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let stream = DirectoryStream::new(dir.path()).unwrap();
        let pos = Point3::new(-4, 0, 7);

        assert!(matches!(stream.load(pos), Ok(LoadOutcome::NotFound)));

        let mut voxels = VoxelBuffer::new(3);
        voxels.set_voxel(Point3::new(7, 7, 7), 1234);
        stream.save(pos, &voxels).unwrap();

        match stream.load(pos).unwrap() {
            LoadOutcome::Found(loaded) => assert_eq!(loaded, voxels),
            LoadOutcome::NotFound => panic!("block should exist"),
        }
    }
}
