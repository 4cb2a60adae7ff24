//! # Terrain Demo Entry Point
//!
//! Headless demo: streams a noise-generated world around a wandering viewer,
//! carves a few voxels out along the way, and persists edited blocks to a
//! directory-backed world on exit.
//!
//! ## Usage
//!
//! ```bash
//! RUST_LOG=info cargo run --release
//! ```
//!
//! Re-running picks the edited blocks back up from `terrain_world/`.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cgmath::Point3;
use log::info;

use voxel_terrain::config::TerrainConfig;
use voxel_terrain::engine::{Viewer, VoxelTerrain};
use voxel_terrain::streaming::{DirectoryStream, NoiseGenerator, StreamError};
use voxel_terrain::tasks::WorkerPool;
use voxel_terrain::voxel::AIR_VOXEL;

const WORLD_DIR: &str = "terrain_world";
/// Voxel id the generator fills solid terrain with.
const STONE_VOXEL: u16 = 1;
const NUM_WORKERS: usize = 4;
const NUM_TICKS: u32 = 600;
const TICK_INTERVAL: Duration = Duration::from_millis(16);

fn main() -> Result<(), StreamError> {
    let mut log_builder = env_logger::Builder::new();
    log_builder
        .target(env_logger::Target::Stdout)
        .parse_env("RUST_LOG")
        .init();

    info!("Logger initialized");

    let mut terrain = VoxelTerrain::new(
        TerrainConfig::default(),
        Box::new(WorkerPool::new(NUM_WORKERS)),
    );
    terrain.set_stream(Some(Arc::new(DirectoryStream::new(WORLD_DIR)?)));
    terrain.set_generator(Some(Arc::new(NoiseGenerator::new(1, STONE_VOXEL))));

    let viewer = terrain.viewers_mut().add(Viewer {
        position: Point3::new(0.0, 0.0, 0.0),
        horizontal_view_distance: 96,
        vertical_view_distance: 64,
        ..Viewer::default()
    });

    let mut wander = Point3::new(0.0f32, 0.0, 0.0);
    for tick in 0..NUM_TICKS {
        // Random walk, biased to stay near the surface band.
        wander.x += (fastrand::f32() - 0.5) * 8.0;
        wander.z += (fastrand::f32() - 0.5) * 8.0;
        wander.y = (wander.y + (fastrand::f32() - 0.5) * 2.0).clamp(-32.0, 32.0);
        if let Some(v) = terrain.viewers_mut().get_mut(viewer) {
            v.position = wander;
        }

        terrain.process();

        // Occasionally carve out whatever is under the viewer.
        if tick % 50 == 25 {
            let at = Point3::new(wander.x as i32, wander.y as i32, wander.z as i32);
            if terrain.edit_voxel(at, AIR_VOXEL) {
                info!("carved voxel at {:?}", at);
            }
        }

        if tick % 60 == 0 {
            let stats = terrain.stats();
            info!(
                "tick {}: {} mesh updates applied, {} meshed blocks, viewer diff {:?}",
                tick,
                stats.updated_blocks,
                terrain.get_meshed_block_positions().len(),
                stats.time_detect_required_blocks,
            );
        }

        thread::sleep(TICK_INTERVAL);
    }

    let queued = terrain.save_all_modified_blocks();
    info!("flushing {} modified blocks to {}", queued, WORLD_DIR);
    // A few more ticks to submit the saves and drain their completions.
    for _ in 0..20 {
        terrain.process();
        thread::sleep(TICK_INTERVAL);
    }

    info!("done");
    Ok(())
}
