//! Epoch-stamped dependency handles shared with asynchronous jobs.
//!
//! Every job carries a clone of the handle current at submission time. When
//! the stream, generator, or mesher configuration changes, the engine builds
//! a replacement handle with a bumped epoch; a completed job whose epoch no
//! longer matches is discarded at application time instead of mutating any
//! map. This is cancellation without per-job tokens.

use std::sync::Arc;

use crate::mesher::Mesher;
use crate::streaming::{VoxelGenerator, VoxelStream};

/// Stream and generator configuration for load/save jobs.
pub struct StreamingDependency {
    /// Persistent storage; `None` means a purely generated, unsaved world.
    pub stream: Option<Arc<dyn VoxelStream>>,
    /// Generator used when the stream reports no data.
    pub generator: Option<Arc<dyn VoxelGenerator>>,
    /// Configuration epoch this handle was built under.
    pub epoch: u64,
}

/// Mesher configuration for mesh-build jobs.
pub struct MeshingDependency {
    /// The polygonizer.
    pub mesher: Arc<dyn Mesher>,
    /// Configuration epoch this handle was built under.
    pub epoch: u64,
}
