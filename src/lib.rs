#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rustdoc::invalid_rust_codeblocks)]

//! # Voxel Terrain
//!
//! A viewer-driven voxel terrain paging engine.
//!
//! The world is an unbounded grid of fixed-size voxel blocks. Viewers move
//! through it; each tick the engine diffs every viewer's interest region
//! against the previous tick, loads and pins blocks that entered it, releases
//! and saves blocks that left it, and keeps renderable/collidable meshes
//! consistent with the voxel data underneath them.
//!
//! ## Key Modules
//!
//! * `engine` - The [`engine::VoxelTerrain`] driver, viewer registry, data
//!   and mesh maps, and the event listener seam
//! * `streaming` - Persistence ([`streaming::VoxelStream`]) and procedural
//!   generation ([`streaming::VoxelGenerator`]) collaborators, plus the
//!   background job types
//! * `mesher` - The polygonizer boundary and a built-in culled-face mesher
//! * `tasks` - The worker-pool scheduler terrain jobs run on
//! * `voxel`, `math`, `core`, `config` - Storage, block-grid math, shared
//!   primitives, and engine settings
//!
//! ## Architecture
//!
//! All authoritative state is mutated on one thread, inside
//! [`engine::VoxelTerrain::process`]. Background jobs receive snapshots or
//! shared read-only buffers, and report back through typed outputs that the
//! engine applies at the start of a later tick. Configuration changes bump a
//! dependency epoch so results of outdated jobs are discarded instead of
//! corrupting the maps.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use cgmath::Point3;
//! use voxel_terrain::config::TerrainConfig;
//! use voxel_terrain::engine::{Viewer, VoxelTerrain};
//! use voxel_terrain::streaming::NoiseGenerator;
//! use voxel_terrain::tasks::WorkerPool;
//!
//! let mut terrain = VoxelTerrain::new(
//!     TerrainConfig::default(),
//!     Box::new(WorkerPool::new(4)),
//! );
//! terrain.set_generator(Some(Arc::new(NoiseGenerator::new(1, 1))));
//! terrain.viewers_mut().add(Viewer {
//!     position: Point3::new(0.0, 0.0, 0.0),
//!     ..Viewer::default()
//! });
//!
//! loop {
//!     terrain.process();
//!     // render / simulate using terrain.get_mesh(...) etc.
//! }
//! ```

pub mod config;
pub mod core;
pub mod engine;
pub mod math;
pub mod mesher;
pub mod streaming;
pub mod tasks;
pub mod voxel;

pub use config::TerrainConfig;
pub use engine::{Viewer, ViewerId, VoxelTerrain};
