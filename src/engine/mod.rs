//! # Engine Module
//!
//! The viewer-driven terrain engine: paged data blocks, mesh blocks, and the
//! per-tick update loop that keeps them consistent with viewer positions.
//!
//! ## Update Loop
//!
//! All authoritative state lives in [`VoxelTerrain`] and is mutated only
//! inside [`VoxelTerrain::process`], which runs these phases in order each
//! tick:
//!
//! 1. **Viewer diffing**: recompute every viewer's interest boxes and apply
//!    the set difference against last tick's boxes; entering data blocks are
//!    pinned or requested, leaving blocks are released.
//! 2. **Quick reloads**: blocks re-entered while their save was still in
//!    flight are committed straight from the retained buffer, never from the
//!    backing stream.
//! 3. **Job submission**: queued load and save requests go to the scheduler.
//! 4. **Result application**: completed job outputs are drained and applied;
//!    anything issued under a stale dependency epoch is discarded.
//! 5. **Meshing**: mesh blocks whose data dependencies are all loaded get a
//!    snapshot taken and a build job issued.
//! 6. **Event flush**: events buffered during the tick are dispatched, so
//!    listeners always observe fully committed state.
//!
//! Worker jobs never touch the maps; everything they need is snapshotted or
//! shared read-only at submission time.

mod data_map;
mod events;
mod mesh_map;
mod viewers;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cgmath::{Point3, Vector3};
use log::{debug, info, trace};

use crate::config::{SaveRetryPolicy, TerrainConfig};
use crate::core::RefCount;
use crate::math::{block_to_voxel_po2, voxel_to_block_po2, Box3i};
use crate::mesher::{BlockMesh, BlockyMesher, MeshInput, Mesher};
use crate::streaming::{
    BuildMeshTask, LoadBlockTask, MeshingDependency, SaveBlockTask, StreamingDependency,
    VoxelGenerator, VoxelStream,
};
use crate::tasks::{BlockDataOutput, BlockDataOutputKind, BlockMeshOutput, TaskOutput, TaskScheduler};
use crate::voxel::{VoxelBuffer, AIR_VOXEL};

use data_map::{DataBlock, DataMap, LoadingBlock, UnloadedSavingBlock};
use mesh_map::{MeshBlock, MeshMap};
use viewers::{PairedViewer, ViewerState};

pub use data_map::DataBlockState;
pub use events::{TerrainEvent, TerrainListener};
pub use mesh_map::MeshState;
pub use viewers::{Viewer, ViewerId, ViewerRegistry};

/// Per-tick counters and phase timings, reset at the start of each
/// [`VoxelTerrain::process`] call.
#[derive(Clone, Debug, Default)]
pub struct Stats {
    /// Mesh build results applied this tick.
    pub updated_blocks: u32,
    /// Load/save outputs discarded for a stale epoch or a cancelled request.
    pub dropped_block_loads: u32,
    /// Mesh outputs discarded for a stale epoch or an unloaded block.
    pub dropped_block_meshes: u32,
    /// Time spent diffing viewer boxes.
    pub time_detect_required_blocks: Duration,
    /// Time spent submitting load and save jobs.
    pub time_request_blocks_to_load: Duration,
    /// Time spent applying completed job outputs.
    pub time_process_load_responses: Duration,
    /// Time spent gating and issuing mesh build jobs.
    pub time_request_blocks_to_update: Duration,
}

/// A save request staged during a tick, submitted in the job phase.
struct BlockToSave {
    position: Point3<i32>,
    voxels: Arc<VoxelBuffer>,
}

/// A block re-entered while its save was in flight, staged for commit from
/// the retained buffer.
struct QuickReloadingBlock {
    position: Point3<i32>,
    voxels: Arc<VoxelBuffer>,
    /// Whether the buffer still holds unpersisted changes (a failed save
    /// awaiting retry). Carried through so a reload cannot lose the dirty
    /// flag.
    modified: bool,
}

/// Viewer-driven paged voxel terrain.
///
/// Owns the data and mesh maps, the viewer registry, and the job scheduler.
/// All mutation happens on the caller's thread inside [`VoxelTerrain::process`];
/// background jobs only ever see snapshots and shared read-only buffers.
pub struct VoxelTerrain {
    config: TerrainConfig,

    viewers: ViewerRegistry,
    paired_viewers: Vec<PairedViewer>,

    data_map: DataMap,
    mesh_map: MeshMap,

    /// Data blocks whose load request must be submitted this tick.
    blocks_pending_load: Vec<Point3<i32>>,
    /// Mesh blocks that need a build job once their dependencies are loaded.
    blocks_pending_update: Vec<Point3<i32>>,
    /// Save requests staged by unloads and save sweeps.
    blocks_to_save: Vec<BlockToSave>,
    /// Blocks staged for commit from their retained unloaded-saving buffer.
    quick_reloading_blocks: Vec<QuickReloadingBlock>,
    /// Number of save jobs in flight per position. A position's retained
    /// buffer may only be released once this reaches zero, otherwise a
    /// re-entering viewer could race a stream read against an unfinished
    /// write.
    saves_in_flight: HashMap<Point3<i32>, u32>,

    scheduler: Box<dyn TaskScheduler>,
    streaming_dependency: Arc<StreamingDependency>,
    meshing_dependency: Arc<MeshingDependency>,

    listeners: Vec<Box<dyn TerrainListener>>,
    pending_events: Vec<TerrainEvent>,

    stats: Stats,
}

impl VoxelTerrain {
    /// Creates a terrain with no stream and no generator; every loaded block
    /// starts as air until [`VoxelTerrain::set_stream`] or
    /// [`VoxelTerrain::set_generator`] is called.
    pub fn new(config: TerrainConfig, scheduler: Box<dyn TaskScheduler>) -> Self {
        VoxelTerrain {
            config,
            viewers: ViewerRegistry::new(),
            paired_viewers: Vec::new(),
            data_map: DataMap::new(),
            mesh_map: MeshMap::new(),
            blocks_pending_load: Vec::new(),
            blocks_pending_update: Vec::new(),
            blocks_to_save: Vec::new(),
            quick_reloading_blocks: Vec::new(),
            saves_in_flight: HashMap::new(),
            scheduler,
            streaming_dependency: Arc::new(StreamingDependency {
                stream: None,
                generator: None,
                epoch: 0,
            }),
            meshing_dependency: Arc::new(MeshingDependency {
                mesher: Arc::new(BlockyMesher),
                epoch: 0,
            }),
            listeners: Vec::new(),
            pending_events: Vec::new(),
            stats: Stats::default(),
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &TerrainConfig {
        &self.config
    }

    /// World bounds in voxel coordinates.
    pub fn bounds(&self) -> Box3i {
        self.config.bounds
    }

    /// Replaces the world bounds. Takes effect on the next tick's viewer
    /// diff; blocks already loaded outside the new bounds are released as
    /// viewers move.
    pub fn set_bounds(&mut self, bounds: Box3i) {
        self.config.bounds = bounds;
    }

    /// The viewer registry.
    pub fn viewers(&self) -> &ViewerRegistry {
        &self.viewers
    }

    /// Mutable access to the viewer registry. Changes take effect on the
    /// next tick.
    pub fn viewers_mut(&mut self) -> &mut ViewerRegistry {
        &mut self.viewers
    }

    /// Registers an event listener.
    pub fn add_listener(&mut self, listener: Box<dyn TerrainListener>) {
        self.listeners.push(listener);
    }

    /// Counters and timings from the last completed tick.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    // ------------------------------------------------------------------
    // Streaming configuration
    // ------------------------------------------------------------------

    /// Replaces the backing stream and reloads the world.
    ///
    /// Bumps the streaming epoch so results of jobs issued against the old
    /// stream are discarded when they complete.
    pub fn set_stream(&mut self, stream: Option<Arc<dyn VoxelStream>>) {
        let generator = self.streaming_dependency.generator.clone();
        self.rebuild_streaming_dependency(stream, generator);
        self.reset_loaded_state();
    }

    /// Replaces the generator and reloads the world.
    pub fn set_generator(&mut self, generator: Option<Arc<dyn VoxelGenerator>>) {
        let stream = self.streaming_dependency.stream.clone();
        self.rebuild_streaming_dependency(stream, generator);
        self.reset_loaded_state();
    }

    /// Drops every loaded block and reloads everything from the current
    /// stream and generator.
    pub fn restart_stream(&mut self) {
        info!("restarting terrain stream");
        let stream = self.streaming_dependency.stream.clone();
        let generator = self.streaming_dependency.generator.clone();
        self.rebuild_streaming_dependency(stream, generator);
        self.reset_loaded_state();
    }

    fn rebuild_streaming_dependency(
        &mut self,
        stream: Option<Arc<dyn VoxelStream>>,
        generator: Option<Arc<dyn VoxelGenerator>>,
    ) {
        self.streaming_dependency = Arc::new(StreamingDependency {
            stream,
            generator,
            epoch: self.streaming_dependency.epoch + 1,
        });
    }

    /// Clears every map and every staged request, and resets viewer history
    /// so the next tick re-requests the whole visible world.
    fn reset_loaded_state(&mut self) {
        self.data_map.clear();
        self.mesh_map.clear();
        self.blocks_pending_load.clear();
        self.blocks_pending_update.clear();
        self.blocks_to_save.clear();
        self.quick_reloading_blocks.clear();
        self.saves_in_flight.clear();
        for pv in &mut self.paired_viewers {
            pv.prev_state = ViewerState::default();
        }
    }

    // ------------------------------------------------------------------
    // Meshing configuration
    // ------------------------------------------------------------------

    /// Replaces the polygonizer and rebuilds every mesh block.
    pub fn set_mesher(&mut self, mesher: Arc<dyn Mesher>) {
        self.meshing_dependency = Arc::new(MeshingDependency {
            mesher,
            epoch: self.meshing_dependency.epoch + 1,
        });
        self.remesh_all_blocks();
    }

    /// Queues every existing mesh block for a rebuild.
    pub fn remesh_all_blocks(&mut self) {
        let positions: Vec<Point3<i32>> = self.mesh_map.blocks.keys().copied().collect();
        for position in positions {
            self.try_schedule_mesh_update(position);
        }
    }

    /// Changes the mesh block granularity.
    ///
    /// The whole mesh map is rebuilt on the next tick; data blocks are
    /// unaffected.
    pub fn set_mesh_block_size(&mut self, mesh_block_size_po2: u32) {
        if mesh_block_size_po2 == self.config.mesh_block_size_po2 {
            return;
        }
        self.config.mesh_block_size_po2 = mesh_block_size_po2;
        // In-flight builds are for the old grid; invalidate them.
        self.meshing_dependency = Arc::new(MeshingDependency {
            mesher: self.meshing_dependency.mesher.clone(),
            epoch: self.meshing_dependency.epoch + 1,
        });
        self.mesh_map.clear();
        self.blocks_pending_update.clear();
        for pv in &mut self.paired_viewers {
            pv.prev_state.mesh_box = Box3i::empty();
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Returns true if the data block at `position` (block coordinates) is
    /// loaded.
    pub fn has_data_block(&self, position: Point3<i32>) -> bool {
        self.data_map.loaded.contains_key(&position)
    }

    /// Which paging state the data block at `position` is in, if any.
    pub fn data_block_state(&self, position: Point3<i32>) -> Option<DataBlockState> {
        self.data_map.state_of(position)
    }

    /// Shared handle to a loaded block's voxels.
    pub fn get_block_voxels(&self, position: Point3<i32>) -> Option<Arc<VoxelBuffer>> {
        self.data_map.loaded.get(&position).map(|b| b.voxels.clone())
    }

    /// Reads one voxel, or `None` if its block is not loaded.
    pub fn get_voxel(&self, position: Point3<i32>) -> Option<u16> {
        let po2 = self.config.data_block_size_po2;
        let block_pos = voxel_to_block_po2(position, po2);
        let block = self.data_map.loaded.get(&block_pos)?;
        let local = position - block_to_voxel_po2(block_pos, po2);
        Some(block.voxels.get_voxel(Point3::new(local.x, local.y, local.z)))
    }

    /// Built geometry of a mesh block, if it has any.
    pub fn get_mesh(&self, position: Point3<i32>) -> Option<&BlockMesh> {
        self.mesh_map.get(position).and_then(|b| b.mesh.as_ref())
    }

    /// Positions of every mesh block that has had at least one build applied.
    pub fn get_meshed_block_positions(&self) -> Vec<Point3<i32>> {
        self.mesh_map
            .blocks
            .iter()
            .filter(|(_, b)| b.built)
            .map(|(p, _)| *p)
            .collect()
    }

    /// Returns true if every mesh block overlapping the voxel `area` has had
    /// a build applied.
    pub fn is_area_meshed(&self, area: Box3i) -> bool {
        let mesh_box = area.downscaled(self.config.mesh_block_size_po2);
        let max = mesh_box.max();
        for z in mesh_box.min.z..max.z {
            for y in mesh_box.min.y..max.y {
                for x in mesh_box.min.x..max.x {
                    let built = self
                        .mesh_map
                        .get(Point3::new(x, y, z))
                        .map(|b| b.built)
                        .unwrap_or(false);
                    if !built {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Ids of viewers whose data interest overlaps the voxel `area`.
    pub fn get_viewers_in_area(&self, area: Box3i) -> Vec<ViewerId> {
        let block_box = area.downscaled(self.config.data_block_size_po2);
        self.paired_viewers
            .iter()
            .filter(|pv| pv.prev_state.data_box.intersects(&block_box))
            .map(|pv| pv.id)
            .collect()
    }

    // ------------------------------------------------------------------
    // Editing
    // ------------------------------------------------------------------

    /// Writes one voxel. Returns false if the position is out of bounds or
    /// its block is not loaded.
    pub fn edit_voxel(&mut self, position: Point3<i32>, value: u16) -> bool {
        if !self.config.bounds.contains(position) {
            return false;
        }
        let po2 = self.config.data_block_size_po2;
        let block_pos = voxel_to_block_po2(position, po2);
        let Some(block) = self.data_map.loaded.get_mut(&block_pos) else {
            return false;
        };
        let local = position - block_to_voxel_po2(block_pos, po2);
        // Copy-on-write: a buffer shared with an in-flight save job is
        // cloned instead of mutated under it.
        Arc::make_mut(&mut block.voxels).set_voxel(Point3::new(local.x, local.y, local.z), value);
        self.post_edit_area(Box3i::new(position, Vector3::new(1, 1, 1)));
        true
    }

    /// Overwrites every loaded voxel inside `area` with `value`. Blocks that
    /// are not loaded are skipped.
    pub fn fill_area(&mut self, area: Box3i, value: u16) {
        let area = area.clipped(&self.config.bounds);
        if area.is_empty() {
            return;
        }
        let po2 = self.config.data_block_size_po2;
        let block_size = 1i32 << po2;
        let block_box = area.downscaled(po2);
        block_box.for_each_cell(|block_pos| {
            if let Some(block) = self.data_map.loaded.get_mut(&block_pos) {
                let origin = block_to_voxel_po2(block_pos, po2);
                let local_area = Box3i::new(
                    origin,
                    Vector3::new(block_size, block_size, block_size),
                )
                .intersection(&area);
                let buffer = Arc::make_mut(&mut block.voxels);
                local_area.for_each_cell(|wp| {
                    buffer.set_voxel(
                        Point3::new(wp.x - origin.x, wp.y - origin.y, wp.z - origin.z),
                        value,
                    );
                });
            }
        });
        self.post_edit_area(area);
    }

    /// Marks a committed voxel edit: dirties the touched data blocks, queues
    /// mesh rebuilds for every affected mesh block (including neighbors
    /// within the mesher's margin), and stages an area-edited event.
    pub fn post_edit_area(&mut self, voxel_box: Box3i) {
        let block_box = voxel_box.downscaled(self.config.data_block_size_po2);
        block_box.for_each_cell(|block_pos| {
            if let Some(block) = self.data_map.loaded.get_mut(&block_pos) {
                block.modified = true;
            }
        });
        self.schedule_mesh_updates_for_voxel_box(voxel_box);
        if self.config.area_edit_notification_enabled {
            self.pending_events.push(TerrainEvent::AreaEdited {
                min: voxel_box.min,
                max: voxel_box.max(),
            });
        }
    }

    /// Queues a save for every block with unpersisted changes, including
    /// retained buffers whose earlier save failed. Returns the number of
    /// saves queued; they are submitted on the next tick.
    pub fn save_all_modified_blocks(&mut self) -> usize {
        let mut queued = 0;
        for (position, block) in self.data_map.loaded.iter_mut() {
            if block.modified {
                block.modified = false;
                self.blocks_to_save.push(BlockToSave {
                    position: *position,
                    voxels: block.voxels.clone(),
                });
                queued += 1;
            }
        }
        for (position, retained) in self.data_map.unloaded_saving.iter_mut() {
            if retained.needs_retry {
                retained.needs_retry = false;
                self.blocks_to_save.push(BlockToSave {
                    position: *position,
                    voxels: retained.voxels.clone(),
                });
                queued += 1;
            }
        }
        if queued > 0 {
            debug!("queued {} block saves", queued);
        }
        queued
    }

    // ------------------------------------------------------------------
    // The tick
    // ------------------------------------------------------------------

    /// Runs one update tick. See the module docs for the phase order.
    pub fn process(&mut self) {
        self.stats = Stats::default();

        let t = Instant::now();
        self.process_viewers();
        self.process_quick_reloads();
        self.stats.time_detect_required_blocks = t.elapsed();

        let t = Instant::now();
        self.send_load_requests();
        self.send_save_requests();
        self.stats.time_request_blocks_to_load = t.elapsed();

        let t = Instant::now();
        for output in self.scheduler.drain_completed() {
            match output {
                TaskOutput::Data(data) => self.apply_data_block_response(data),
                TaskOutput::Mesh(mesh) => self.apply_mesh_update(mesh),
            }
        }
        self.stats.time_process_load_responses = t.elapsed();

        let t = Instant::now();
        self.process_meshing();
        self.stats.time_request_blocks_to_update = t.elapsed();

        self.flush_events();
    }

    // ------------------------------------------------------------------
    // Phase 1: viewer diffing
    // ------------------------------------------------------------------

    fn process_viewers(&mut self) {
        let mut paired = std::mem::take(&mut self.paired_viewers);

        // Viewers unregistered since last tick release all their interest.
        let mut i = 0;
        while i < paired.len() {
            if self.viewers.get(paired[i].id).is_some() {
                i += 1;
            } else {
                let pv = paired.swap_remove(i);
                debug!("viewer {:?} unregistered, releasing interest", pv.id);
                self.release_viewer_interest(&pv);
            }
        }

        // Newly registered viewers start with empty history so their whole
        // box reads as entering.
        let new_ids: Vec<ViewerId> = self
            .viewers
            .iter()
            .map(|(id, _)| id)
            .filter(|id| !paired.iter().any(|pv| pv.id == *id))
            .collect();
        for id in new_ids {
            debug!("viewer {:?} registered", id);
            paired.push(PairedViewer {
                id,
                state: ViewerState::default(),
                prev_state: ViewerState::default(),
            });
        }

        let can_load = self.config.automatic_loading_enabled;
        for pv in &mut paired {
            let viewer = match self.viewers.get(pv.id) {
                Some(v) => v.clone(),
                None => continue,
            };
            pv.state = self.compute_viewer_state(&viewer);
            if pv.state == pv.prev_state {
                continue;
            }
            let state = pv.state.clone();
            let prev = pv.prev_state.clone();
            let id = pv.id;

            state
                .data_box
                .for_each_cell_not_in(&prev.data_box, |p| self.view_data_block(p, id, can_load));
            prev.data_box
                .for_each_cell_not_in(&state.data_box, |p| self.unview_data_block(p, id));

            let flags_changed = state.requires_meshes != prev.requires_meshes
                || state.requires_collisions != prev.requires_collisions;
            if flags_changed {
                // Refcounts are flag-specific, so a flag flip re-views the
                // whole box under the new flags. Blocks covered both before
                // and after never left coverage, so those re-views must not
                // fire enter/exit events. Viewing before unviewing keeps
                // their refcounts above zero throughout, which keeps their
                // built meshes.
                state.mesh_box.for_each_cell(|p| {
                    let notify = !prev.mesh_box.contains(p);
                    self.view_mesh_block(
                        p,
                        id,
                        state.requires_meshes,
                        state.requires_collisions,
                        notify,
                    )
                });
                prev.mesh_box.for_each_cell(|p| {
                    let notify = !state.mesh_box.contains(p);
                    self.unview_mesh_block(
                        p,
                        id,
                        prev.requires_meshes,
                        prev.requires_collisions,
                        notify,
                    )
                });
            } else {
                state.mesh_box.for_each_cell_not_in(&prev.mesh_box, |p| {
                    self.view_mesh_block(
                        p,
                        id,
                        state.requires_meshes,
                        state.requires_collisions,
                        true,
                    )
                });
                prev.mesh_box.for_each_cell_not_in(&state.mesh_box, |p| {
                    self.unview_mesh_block(
                        p,
                        id,
                        prev.requires_meshes,
                        prev.requires_collisions,
                        true,
                    )
                });
            }

            pv.prev_state = pv.state.clone();
        }

        self.paired_viewers = paired;
    }

    /// Derives a viewer's interest boxes for this tick.
    fn compute_viewer_state(&self, viewer: &Viewer) -> ViewerState {
        let h = viewer
            .horizontal_view_distance
            .min(self.config.max_view_distance_voxels) as i32;
        let v = viewer
            .vertical_view_distance
            .min(self.config.max_view_distance_voxels) as i32;
        let center = Point3::new(
            viewer.position.x.floor() as i32,
            viewer.position.y.floor() as i32,
            viewer.position.z.floor() as i32,
        );
        let view_box = Box3i::from_min_max(
            center - Vector3::new(h, v, h),
            center + Vector3::new(h, v, h),
        )
        .clipped(&self.config.bounds);

        let data_box = view_box.downscaled(self.config.data_block_size_po2);

        // Mesh interest keeps the mesher's margin inside the data box so a
        // mesh block is only wanted once all its voxel dependencies are
        // coverable by loaded data.
        let mesh_box = if viewer.requires_meshes || viewer.requires_collisions {
            view_box
                .padded(-self.meshing_dependency.mesher.margin_voxels())
                .downscaled_inner(self.config.mesh_block_size_po2)
        } else {
            Box3i::empty()
        };

        ViewerState {
            data_box,
            mesh_box,
            requires_meshes: viewer.requires_meshes,
            requires_collisions: viewer.requires_collisions,
        }
    }

    fn release_viewer_interest(&mut self, pv: &PairedViewer) {
        let prev = pv.prev_state.clone();
        let id = pv.id;
        prev.data_box.for_each_cell(|p| self.unview_data_block(p, id));
        prev.mesh_box.for_each_cell(|p| {
            self.unview_mesh_block(p, id, prev.requires_meshes, prev.requires_collisions, true)
        });
    }

    fn view_data_block(&mut self, position: Point3<i32>, viewer: ViewerId, can_load: bool) {
        if let Some(block) = self.data_map.loaded.get_mut(&position) {
            block.viewers.add();
            if self.config.block_enter_notification_enabled {
                self.pending_events
                    .push(TerrainEvent::DataBlockEntered { position, viewer });
            }
        } else if let Some(loading) = self.data_map.loading.get_mut(&position) {
            loading.viewers.add();
            loading.viewers_to_notify.push(viewer);
        } else if let Some(retained) = self.data_map.unloaded_saving.remove(&position) {
            // The save has not resolved; serve the retained buffer instead
            // of racing a stream read against it.
            trace!("quick reload of {:?}", position);
            self.quick_reloading_blocks.push(QuickReloadingBlock {
                position,
                voxels: retained.voxels,
                modified: retained.needs_retry,
            });
            self.data_map.loading.insert(
                position,
                LoadingBlock {
                    viewers: RefCount::new(1),
                    viewers_to_notify: vec![viewer],
                },
            );
        } else if can_load {
            self.data_map.loading.insert(
                position,
                LoadingBlock {
                    viewers: RefCount::new(1),
                    viewers_to_notify: vec![viewer],
                },
            );
            self.blocks_pending_load.push(position);
        }
    }

    fn unview_data_block(&mut self, position: Point3<i32>, viewer: ViewerId) {
        if let Some(loading) = self.data_map.loading.get_mut(&position) {
            loading.viewers_to_notify.retain(|v| *v != viewer);
            if loading.viewers.remove() == 0 {
                self.data_map.loading.remove(&position);
                if let Some(i) = self.blocks_pending_load.iter().position(|p| *p == position) {
                    self.blocks_pending_load.swap_remove(i);
                }
            }
        } else if let Some(block) = self.data_map.loaded.get_mut(&position) {
            if self.config.block_enter_notification_enabled {
                self.pending_events
                    .push(TerrainEvent::DataBlockExited { position, viewer });
            }
            if block.viewers.remove() == 0 && self.config.automatic_loading_enabled {
                if let Some(block) = self.data_map.loaded.remove(&position) {
                    if block.modified {
                        self.data_map.unloaded_saving.insert(
                            position,
                            UnloadedSavingBlock {
                                voxels: block.voxels.clone(),
                                needs_retry: false,
                            },
                        );
                        self.blocks_to_save.push(BlockToSave {
                            position,
                            voxels: block.voxels,
                        });
                    }
                }
            }
        } else {
            // Tolerated: a block never requested because loading was off.
            trace!("unview of absent data block {:?}", position);
        }
    }

    fn view_mesh_block(
        &mut self,
        position: Point3<i32>,
        viewer: ViewerId,
        meshes: bool,
        collisions: bool,
        notify: bool,
    ) {
        let block = match self.mesh_map.blocks.entry(position) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                self.blocks_pending_update.push(position);
                e.insert(MeshBlock::new())
            }
        };
        if meshes {
            block.mesh_viewers.add();
        }
        if collisions {
            block.collision_viewers.add();
        }
        if notify {
            self.pending_events
                .push(TerrainEvent::MeshBlockEntered { position, viewer });
        }
    }

    fn unview_mesh_block(
        &mut self,
        position: Point3<i32>,
        viewer: ViewerId,
        meshes: bool,
        collisions: bool,
        notify: bool,
    ) {
        let Some(block) = self.mesh_map.get_mut(position) else {
            trace!("unview of absent mesh block {:?}", position);
            return;
        };
        if meshes {
            block.mesh_viewers.remove();
        }
        if collisions {
            block.collision_viewers.remove();
        }
        if notify {
            self.pending_events
                .push(TerrainEvent::MeshBlockExited { position, viewer });
        }
        if block.total_viewers() == 0 {
            self.mesh_map.blocks.remove(&position);
            if let Some(i) = self
                .blocks_pending_update
                .iter()
                .position(|p| *p == position)
            {
                self.blocks_pending_update.swap_remove(i);
            }
        }
    }

    // ------------------------------------------------------------------
    // Phase 2: quick reloads
    // ------------------------------------------------------------------

    fn process_quick_reloads(&mut self) {
        let staged = std::mem::take(&mut self.quick_reloading_blocks);
        for qr in staged {
            match self.data_map.loading.remove(&qr.position) {
                Some(loading) => {
                    self.commit_loaded_block(qr.position, qr.voxels, loading, qr.modified)
                }
                None => {
                    // Interest vanished again before commit. Put the buffer
                    // back if a save still needs it, or if it holds changes
                    // that have nowhere else to live.
                    let in_flight =
                        self.saves_in_flight.get(&qr.position).copied().unwrap_or(0) > 0;
                    if in_flight || qr.modified {
                        self.data_map.unloaded_saving.insert(
                            qr.position,
                            UnloadedSavingBlock {
                                voxels: qr.voxels,
                                needs_retry: qr.modified,
                            },
                        );
                    }
                }
            }
        }
    }

    /// Moves a block from loading to loaded and fires its deferred entered
    /// events.
    fn commit_loaded_block(
        &mut self,
        position: Point3<i32>,
        voxels: Arc<VoxelBuffer>,
        loading: LoadingBlock,
        modified: bool,
    ) {
        self.data_map.insert_loaded(
            position,
            DataBlock {
                voxels,
                modified,
                viewers: loading.viewers,
            },
        );
        if self.config.block_enter_notification_enabled {
            for viewer in loading.viewers_to_notify {
                self.pending_events
                    .push(TerrainEvent::DataBlockEntered { position, viewer });
            }
        }
        // Newly available data can unblock meshes overlapping this block.
        let po2 = self.config.data_block_size_po2;
        let size = 1i32 << po2;
        self.schedule_mesh_updates_for_voxel_box(Box3i::new(
            block_to_voxel_po2(position, po2),
            Vector3::new(size, size, size),
        ));
    }

    // ------------------------------------------------------------------
    // Phase 3: job submission
    // ------------------------------------------------------------------

    fn send_load_requests(&mut self) {
        for position in std::mem::take(&mut self.blocks_pending_load) {
            self.scheduler.submit(Box::new(LoadBlockTask::new(
                position,
                self.config.data_block_size_po2,
                self.streaming_dependency.clone(),
            )));
        }
    }

    fn send_save_requests(&mut self) {
        for request in std::mem::take(&mut self.blocks_to_save) {
            *self.saves_in_flight.entry(request.position).or_insert(0) += 1;
            self.scheduler.submit(Box::new(SaveBlockTask::new(
                request.position,
                request.voxels,
                self.streaming_dependency.clone(),
            )));
        }
    }

    // ------------------------------------------------------------------
    // Phase 4: result application
    // ------------------------------------------------------------------

    fn apply_data_block_response(&mut self, output: BlockDataOutput) {
        if output.epoch != self.streaming_dependency.epoch {
            self.stats.dropped_block_loads += 1;
            return;
        }
        let position = output.position;
        match output.kind {
            BlockDataOutputKind::Loaded { voxels } => {
                match self.data_map.loading.remove(&position) {
                    Some(loading) => {
                        self.commit_loaded_block(position, Arc::new(voxels), loading, false)
                    }
                    // Cancelled while in flight.
                    None => self.stats.dropped_block_loads += 1,
                }
            }
            BlockDataOutputKind::LoadFailed => {
                // The job already logged the error. Dropping the loading
                // entry means the next viewer interest retries.
                self.data_map.loading.remove(&position);
            }
            BlockDataOutputKind::Saved => {
                if self.decrement_saves_in_flight(position) == 0 {
                    // All saves for this position resolved; the retained
                    // buffer (if the block was not re-entered) can go.
                    self.data_map.unloaded_saving.remove(&position);
                }
            }
            BlockDataOutputKind::SaveFailed => {
                let remaining = self.decrement_saves_in_flight(position);
                if let Some(block) = self.data_map.loaded.get_mut(&position) {
                    // Re-entered meanwhile; re-dirty so the next sweep or
                    // unload saves again.
                    block.modified = true;
                } else {
                    match self.config.save_retry {
                        SaveRetryPolicy::RetryOnSweep => {
                            if let Some(retained) =
                                self.data_map.unloaded_saving.get_mut(&position)
                            {
                                retained.needs_retry = true;
                            }
                        }
                        SaveRetryPolicy::DiscardOnFailure => {
                            if remaining == 0 {
                                self.data_map.unloaded_saving.remove(&position);
                            }
                        }
                    }
                }
            }
        }
    }

    fn decrement_saves_in_flight(&mut self, position: Point3<i32>) -> u32 {
        match self.saves_in_flight.get_mut(&position) {
            Some(count) => {
                *count = count.saturating_sub(1);
                let remaining = *count;
                if remaining == 0 {
                    self.saves_in_flight.remove(&position);
                }
                remaining
            }
            None => 0,
        }
    }

    fn apply_mesh_update(&mut self, output: BlockMeshOutput) {
        if output.epoch != self.meshing_dependency.epoch {
            self.stats.dropped_block_meshes += 1;
            // The payload is stale, but the block is still parked in
            // UpdateSent waiting for this job to land. Put it back in line
            // so a fresh job goes out under the current epoch.
            if let Some(block) = self.mesh_map.get_mut(output.position) {
                if block.state == MeshState::UpdateSent {
                    block.state = MeshState::RequiresUpdate;
                    block.pending_rebuild = false;
                    self.blocks_pending_update.push(output.position);
                }
            }
            return;
        }
        let Some(block) = self.mesh_map.get_mut(output.position) else {
            // Unviewed while the build was in flight.
            self.stats.dropped_block_meshes += 1;
            return;
        };
        block.mesh = output.mesh;
        block.built = true;
        self.stats.updated_blocks += 1;
        if block.state == MeshState::UpdateSent {
            if block.pending_rebuild {
                block.pending_rebuild = false;
                block.state = MeshState::RequiresUpdate;
                self.blocks_pending_update.push(output.position);
            } else {
                block.state = MeshState::UpToDate;
            }
        }
    }

    // ------------------------------------------------------------------
    // Phase 5: meshing
    // ------------------------------------------------------------------

    /// Marks a mesh block as needing a rebuild, respecting single-flight.
    fn try_schedule_mesh_update(&mut self, position: Point3<i32>) {
        if let Some(block) = self.mesh_map.get_mut(position) {
            match block.state {
                MeshState::UpToDate => {
                    block.state = MeshState::RequiresUpdate;
                    self.blocks_pending_update.push(position);
                }
                MeshState::UpdateSent => {
                    block.pending_rebuild = true;
                }
                // Already queued.
                MeshState::RequiresUpdate => {}
            }
        }
    }

    /// Queues rebuilds for every mesh block whose padded extent overlaps the
    /// edited voxel region.
    fn schedule_mesh_updates_for_voxel_box(&mut self, voxel_box: Box3i) {
        let margin = self.meshing_dependency.mesher.margin_voxels();
        let mesh_box = voxel_box
            .padded(margin)
            .downscaled(self.config.mesh_block_size_po2);
        mesh_box.for_each_cell(|p| self.try_schedule_mesh_update(p));
    }

    /// Voxel region a mesh block's build reads: the block plus the mesher's
    /// margin, clipped to the world bounds.
    fn mesh_dependency_voxel_box(&self, mesh_position: Point3<i32>) -> Box3i {
        let po2 = self.config.mesh_block_size_po2;
        let size = 1i32 << po2;
        Box3i::new(
            block_to_voxel_po2(mesh_position, po2),
            Vector3::new(size, size, size),
        )
        .padded(self.meshing_dependency.mesher.margin_voxels())
        .clipped(&self.config.bounds)
    }

    /// Returns true if every data block a mesh build would read is loaded.
    fn mesh_dependencies_loaded(&self, mesh_position: Point3<i32>) -> bool {
        let data_box = self
            .mesh_dependency_voxel_box(mesh_position)
            .downscaled(self.config.data_block_size_po2);
        let max = data_box.max();
        for z in data_box.min.z..max.z {
            for y in data_box.min.y..max.y {
                for x in data_box.min.x..max.x {
                    if !self.data_map.loaded.contains_key(&Point3::new(x, y, z)) {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn process_meshing(&mut self) {
        let pending = std::mem::take(&mut self.blocks_pending_update);
        let mut deferred = Vec::new();
        for position in pending {
            let state = match self.mesh_map.get(position) {
                Some(block) => block.state,
                // Unviewed since it was queued.
                None => continue,
            };
            if state != MeshState::RequiresUpdate {
                continue;
            }
            if !self.mesh_dependencies_loaded(position) {
                deferred.push(position);
                continue;
            }
            let input = self.build_mesh_input(position);
            if let Some(block) = self.mesh_map.get_mut(position) {
                block.state = MeshState::UpdateSent;
            }
            self.scheduler
                .submit(Box::new(BuildMeshTask::new(
                    input,
                    self.meshing_dependency.clone(),
                )));
        }
        self.blocks_pending_update = deferred;
    }

    /// Snapshots the padded voxel volume a mesh build needs. Voxels outside
    /// the world bounds read as air.
    fn build_mesh_input(&self, mesh_position: Point3<i32>) -> MeshInput {
        let mesh_po2 = self.config.mesh_block_size_po2;
        let data_po2 = self.config.data_block_size_po2;
        let size = 1i32 << mesh_po2;
        let margin = self.meshing_dependency.mesher.margin_voxels();
        let side = size + 2 * margin;
        let origin = block_to_voxel_po2(mesh_position, mesh_po2) - Vector3::new(margin, margin, margin);

        let mut voxels = vec![AIR_VOXEL; (side * side * side) as usize];
        // Consecutive voxels usually hit the same data block; cache the last
        // lookup.
        let mut cached: Option<(Point3<i32>, Option<&VoxelBuffer>)> = None;
        let mut i = 0;
        for z in 0..side {
            for y in 0..side {
                for x in 0..side {
                    let wp = Point3::new(origin.x + x, origin.y + y, origin.z + z);
                    if self.config.bounds.contains(wp) {
                        let block_pos = voxel_to_block_po2(wp, data_po2);
                        let buffer = match cached {
                            Some((p, b)) if p == block_pos => b,
                            _ => {
                                let b = self
                                    .data_map
                                    .loaded
                                    .get(&block_pos)
                                    .map(|block| &*block.voxels);
                                cached = Some((block_pos, b));
                                b
                            }
                        };
                        if let Some(buffer) = buffer {
                            let local = wp - block_to_voxel_po2(block_pos, data_po2);
                            voxels[i] =
                                buffer.get_voxel(Point3::new(local.x, local.y, local.z));
                        }
                    }
                    i += 1;
                }
            }
        }

        MeshInput {
            position: mesh_position,
            voxels,
            size,
            margin,
        }
    }

    // ------------------------------------------------------------------
    // Phase 6: event flush
    // ------------------------------------------------------------------

    fn flush_events(&mut self) {
        if self.pending_events.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending_events);
        for event in &batch {
            for listener in self.listeners.iter_mut() {
                events::dispatch(listener.as_mut(), event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::core::MtResource;
    use crate::streaming::{
        LoadOutcome, MemoryStream, StreamError, UniformGenerator, VoxelStream,
    };
    use crate::tasks::{ManualScheduler, Task};

    /// Lets a test keep a handle to the scheduler the terrain owns.
    #[derive(Clone)]
    struct SharedScheduler(Arc<Mutex<ManualScheduler>>);

    impl SharedScheduler {
        fn new() -> Self {
            SharedScheduler(Arc::new(Mutex::new(ManualScheduler::new())))
        }

        fn pending_count(&self) -> usize {
            self.0.lock().unwrap().pending_count()
        }

        fn run_all(&self) {
            self.0.lock().unwrap().run_all();
        }
    }

    impl TaskScheduler for SharedScheduler {
        fn submit(&mut self, task: Box<dyn Task>) {
            self.0.lock().unwrap().submit(task);
        }

        fn drain_completed(&mut self) -> Vec<TaskOutput> {
            self.0.lock().unwrap().drain_completed()
        }
    }

    /// Stream whose saves fail while the flag is set; loads always work.
    struct FlakyStream {
        inner: MemoryStream,
        fail_saves: MtResource<bool>,
    }

    impl FlakyStream {
        fn new(failing: bool) -> Self {
            FlakyStream {
                inner: MemoryStream::new(),
                fail_saves: MtResource::new(failing),
            }
        }

        fn set_failing(&self, failing: bool) {
            *self.fail_saves.get_mut() = failing;
        }
    }

    impl VoxelStream for FlakyStream {
        fn load(&self, position: Point3<i32>) -> Result<LoadOutcome, StreamError> {
            self.inner.load(position)
        }

        fn save(&self, position: Point3<i32>, voxels: &VoxelBuffer) -> Result<(), StreamError> {
            if *self.fail_saves.get() {
                return Err(StreamError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "save refused",
                )));
            }
            self.inner.save(position, voxels)
        }
    }

    /// Records every dispatched event for later inspection.
    struct Recorder(Arc<Mutex<Vec<TerrainEvent>>>);

    impl TerrainListener for Recorder {
        fn on_data_block_entered(&mut self, position: Point3<i32>, viewer: ViewerId) {
            self.0
                .lock()
                .unwrap()
                .push(TerrainEvent::DataBlockEntered { position, viewer });
        }
        fn on_data_block_exited(&mut self, position: Point3<i32>, viewer: ViewerId) {
            self.0
                .lock()
                .unwrap()
                .push(TerrainEvent::DataBlockExited { position, viewer });
        }
        fn on_mesh_block_entered(&mut self, position: Point3<i32>, viewer: ViewerId) {
            self.0
                .lock()
                .unwrap()
                .push(TerrainEvent::MeshBlockEntered { position, viewer });
        }
        fn on_mesh_block_exited(&mut self, position: Point3<i32>, viewer: ViewerId) {
            self.0
                .lock()
                .unwrap()
                .push(TerrainEvent::MeshBlockExited { position, viewer });
        }
        fn on_area_edited(&mut self, min: Point3<i32>, max: Point3<i32>) {
            self.0
                .lock()
                .unwrap()
                .push(TerrainEvent::AreaEdited { min, max });
        }
    }

    struct Fixture {
        terrain: VoxelTerrain,
        scheduler: SharedScheduler,
        stream: Arc<MemoryStream>,
        events: Arc<Mutex<Vec<TerrainEvent>>>,
    }

    /// Small world: 4-voxel data and mesh blocks, air generator, in-memory
    /// stream, one event recorder.
    fn fixture() -> Fixture {
        let config = TerrainConfig {
            data_block_size_po2: 2,
            mesh_block_size_po2: 2,
            ..TerrainConfig::default()
        };
        let scheduler = SharedScheduler::new();
        let mut terrain = VoxelTerrain::new(config, Box::new(scheduler.clone()));
        let stream = Arc::new(MemoryStream::new());
        terrain.set_stream(Some(stream.clone()));
        terrain.set_generator(Some(Arc::new(UniformGenerator::air())));
        let events = Arc::new(Mutex::new(Vec::new()));
        terrain.add_listener(Box::new(Recorder(events.clone())));
        Fixture {
            terrain,
            scheduler,
            stream,
            events,
        }
    }

    fn add_viewer(terrain: &mut VoxelTerrain, distance: u32) -> ViewerId {
        terrain.viewers_mut().add(Viewer {
            position: Point3::new(0.0, 0.0, 0.0),
            horizontal_view_distance: distance,
            vertical_view_distance: distance,
            ..Viewer::default()
        })
    }

    fn events_of<F: Fn(&TerrainEvent) -> bool>(
        events: &Arc<Mutex<Vec<TerrainEvent>>>,
        f: F,
    ) -> Vec<TerrainEvent> {
        events.lock().unwrap().iter().filter(|e| f(e)).cloned().collect()
    }

    #[test]
    fn viewer_arrival_loads_and_meshes_its_box() {
        let mut fx = fixture();
        let viewer = add_viewer(&mut fx.terrain, 6);

        // Tick 1: everything in the box becomes a pending load.
        fx.terrain.process();
        assert!(fx.terrain.data_block_state(Point3::new(0, 0, 0)) == Some(DataBlockState::Loading));
        let load_count = fx.scheduler.pending_count();
        assert!(load_count > 0);
        // No mesh job may be issued before data arrives.
        assert!(fx.terrain.get_meshed_block_positions().is_empty());

        // Tick 2: loads land, blocks commit, mesh jobs go out.
        fx.scheduler.run_all();
        fx.terrain.process();
        assert!(fx.terrain.has_data_block(Point3::new(0, 0, 0)));
        assert!(fx.scheduler.pending_count() > 0);

        // Tick 3: mesh results land.
        fx.scheduler.run_all();
        fx.terrain.process();
        let meshed = fx.terrain.get_meshed_block_positions();
        assert!(!meshed.is_empty());
        assert!(fx
            .terrain
            .is_area_meshed(Box3i::from_min_max(Point3::new(0, 0, 0), Point3::new(4, 4, 4))));

        let entered = events_of(&fx.events, |e| {
            matches!(e, TerrainEvent::DataBlockEntered { viewer: v, .. } if *v == viewer)
        });
        assert!(!entered.is_empty());
    }

    #[test]
    fn viewer_departure_cancels_in_flight_loads() {
        let mut fx = fixture();
        let viewer = add_viewer(&mut fx.terrain, 6);
        fx.terrain.process();
        assert!(fx.scheduler.pending_count() > 0);

        // Leave before any load completes.
        fx.terrain.viewers_mut().remove(viewer);
        fx.terrain.process();
        assert_eq!(fx.terrain.data_block_state(Point3::new(0, 0, 0)), None);

        // The jobs still complete, but their results are discarded.
        fx.scheduler.run_all();
        fx.terrain.process();
        assert!(!fx.terrain.has_data_block(Point3::new(0, 0, 0)));
        assert!(fx.terrain.stats().dropped_block_loads > 0);
    }

    #[test]
    fn no_enter_event_before_commit() {
        let mut fx = fixture();
        add_viewer(&mut fx.terrain, 6);
        fx.terrain.process();
        // Blocks are only loading; no data enter event may have fired.
        assert!(events_of(&fx.events, |e| matches!(
            e,
            TerrainEvent::DataBlockEntered { .. }
        ))
        .is_empty());

        fx.scheduler.run_all();
        fx.terrain.process();
        let entered = events_of(&fx.events, |e| {
            matches!(e, TerrainEvent::DataBlockEntered { .. })
        });
        assert!(!entered.is_empty());
        // Every announced block is actually resident, and each (block,
        // viewer) pair is announced exactly once.
        let mut seen = std::collections::HashSet::new();
        for event in entered {
            if let TerrainEvent::DataBlockEntered { position, viewer } = event {
                assert!(fx.terrain.has_data_block(position));
                assert!(seen.insert((position.x, position.y, position.z, viewer)));
            }
        }
    }

    #[test]
    fn edits_mark_blocks_and_fire_area_event() {
        let mut fx = fixture();
        add_viewer(&mut fx.terrain, 6);
        fx.terrain.process();
        fx.scheduler.run_all();
        fx.terrain.process();

        assert!(fx.terrain.edit_voxel(Point3::new(1, 1, 1), 7));
        assert_eq!(fx.terrain.get_voxel(Point3::new(1, 1, 1)), Some(7));

        fx.terrain.process();
        let edits = events_of(&fx.events, |e| matches!(e, TerrainEvent::AreaEdited { .. }));
        assert_eq!(
            edits,
            vec![TerrainEvent::AreaEdited {
                min: Point3::new(1, 1, 1),
                max: Point3::new(2, 2, 2),
            }]
        );

        // Editing an unloaded position is refused.
        assert!(!fx.terrain.edit_voxel(Point3::new(10_000, 0, 0), 7));
    }

    #[test]
    fn edit_rebuilds_the_touched_mesh() {
        let mut fx = fixture();
        add_viewer(&mut fx.terrain, 6);
        // Load and mesh the empty world.
        fx.terrain.process();
        fx.scheduler.run_all();
        fx.terrain.process();
        fx.scheduler.run_all();
        fx.terrain.process();
        assert!(fx.terrain.get_mesh(Point3::new(0, 0, 0)).is_none());

        // Place one voxel; its mesh block must rebuild with geometry.
        assert!(fx.terrain.edit_voxel(Point3::new(1, 1, 1), 5));
        fx.terrain.process();
        fx.scheduler.run_all();
        fx.terrain.process();
        let mesh = fx.terrain.get_mesh(Point3::new(0, 0, 0)).unwrap();
        // A lone cube shows all six faces.
        assert_eq!(mesh.positions.len(), 6 * 4);
    }

    #[test]
    fn unload_of_modified_block_saves_it() {
        let mut fx = fixture();
        let viewer = add_viewer(&mut fx.terrain, 6);
        fx.terrain.process();
        fx.scheduler.run_all();
        fx.terrain.process();

        assert!(fx.terrain.edit_voxel(Point3::new(0, 0, 0), 9));

        // Move the viewer far away; the modified block unloads and a save
        // goes out.
        fx.terrain.viewers_mut().get_mut(viewer).unwrap().position =
            Point3::new(1000.0, 0.0, 0.0);
        fx.terrain.process();
        assert_eq!(
            fx.terrain.data_block_state(Point3::new(0, 0, 0)),
            Some(DataBlockState::UnloadedSaving)
        );

        fx.scheduler.run_all();
        fx.terrain.process();
        // Save resolved: retained buffer released, stream has the data.
        assert_eq!(fx.terrain.data_block_state(Point3::new(0, 0, 0)), None);
        assert!(fx.stream.contains(Point3::new(0, 0, 0)));
    }

    #[test]
    fn quick_reload_serves_the_retained_buffer() {
        let mut fx = fixture();
        let viewer = add_viewer(&mut fx.terrain, 6);
        fx.terrain.process();
        fx.scheduler.run_all();
        fx.terrain.process();
        assert!(fx.terrain.edit_voxel(Point3::new(0, 0, 0), 9));

        // Unload with the save still unexecuted in the scheduler.
        fx.terrain.viewers_mut().get_mut(viewer).unwrap().position =
            Point3::new(1000.0, 0.0, 0.0);
        fx.terrain.process();
        assert_eq!(
            fx.terrain.data_block_state(Point3::new(0, 0, 0)),
            Some(DataBlockState::UnloadedSaving)
        );

        // Come back before the save resolves. The block must be resident
        // again within the same tick, with its edited contents, even though
        // the scheduler has run nothing: it was served from the retained
        // buffer, not from a load job or the (still stale) stream.
        fx.terrain.viewers_mut().get_mut(viewer).unwrap().position =
            Point3::new(0.0, 0.0, 0.0);
        fx.terrain.process();
        assert!(fx.terrain.has_data_block(Point3::new(0, 0, 0)));
        assert_eq!(fx.terrain.get_voxel(Point3::new(0, 0, 0)), Some(9));
        assert!(!fx.stream.contains(Point3::new(0, 0, 0)));

        // Letting the save finish later changes nothing in memory.
        fx.scheduler.run_all();
        fx.terrain.process();
        assert_eq!(fx.terrain.get_voxel(Point3::new(0, 0, 0)), Some(9));
        assert!(fx.stream.contains(Point3::new(0, 0, 0)));
    }

    #[test]
    fn stream_change_invalidates_in_flight_loads() {
        let mut fx = fixture();
        add_viewer(&mut fx.terrain, 6);
        fx.terrain.process();
        assert!(fx.scheduler.pending_count() > 0);

        // Swap the stream while the first batch of loads is in flight; the
        // next tick re-requests everything under the new epoch.
        fx.terrain.set_stream(Some(Arc::new(MemoryStream::new())));
        fx.terrain.process();
        fx.scheduler.run_all();
        fx.terrain.process();

        // Old-epoch results were dropped, new-epoch ones committed.
        assert!(fx.terrain.stats().dropped_block_loads > 0);
        assert!(fx.terrain.has_data_block(Point3::new(0, 0, 0)));
    }

    #[test]
    fn save_sweep_persists_all_modified_blocks() {
        let mut fx = fixture();
        add_viewer(&mut fx.terrain, 6);
        fx.terrain.process();
        fx.scheduler.run_all();
        fx.terrain.process();

        assert!(fx.terrain.edit_voxel(Point3::new(0, 0, 0), 3));
        assert!(fx.terrain.edit_voxel(Point3::new(-1, -1, -1), 4));
        assert_eq!(fx.terrain.save_all_modified_blocks(), 2);
        // Blocks are clean now; a second sweep finds nothing.
        assert_eq!(fx.terrain.save_all_modified_blocks(), 0);

        fx.terrain.process();
        fx.scheduler.run_all();
        fx.terrain.process();
        assert!(fx.stream.contains(Point3::new(0, 0, 0)));
        assert!(fx.stream.contains(Point3::new(-1, -1, -1)));
    }

    #[test]
    fn mesh_interest_tracks_viewer_flags() {
        let mut fx = fixture();
        let viewer = fx.terrain.viewers_mut().add(Viewer {
            position: Point3::new(0.0, 0.0, 0.0),
            horizontal_view_distance: 6,
            vertical_view_distance: 6,
            requires_meshes: false,
            requires_collisions: false,
        });
        fx.terrain.process();
        fx.scheduler.run_all();
        fx.terrain.process();
        // Data loads, but no mesh block exists without mesh interest.
        assert!(fx.terrain.has_data_block(Point3::new(0, 0, 0)));
        assert!(fx.terrain.get_meshed_block_positions().is_empty());

        fx.terrain.viewers_mut().get_mut(viewer).unwrap().requires_meshes = true;
        fx.terrain.process();
        fx.scheduler.run_all();
        fx.terrain.process();
        assert!(!fx.terrain.get_meshed_block_positions().is_empty());
    }

    #[test]
    fn data_and_mesh_events_pair_up_per_viewer() {
        let mut fx = fixture();
        let viewer = add_viewer(&mut fx.terrain, 6);
        fx.terrain.process();
        fx.scheduler.run_all();
        fx.terrain.process();

        fx.terrain.viewers_mut().remove(viewer);
        fx.terrain.process();

        let entered = events_of(&fx.events, |e| {
            matches!(e, TerrainEvent::DataBlockEntered { .. })
        })
        .len();
        let exited = events_of(&fx.events, |e| {
            matches!(e, TerrainEvent::DataBlockExited { .. })
        })
        .len();
        assert_eq!(entered, exited);

        let mesh_entered = events_of(&fx.events, |e| {
            matches!(e, TerrainEvent::MeshBlockEntered { .. })
        })
        .len();
        let mesh_exited = events_of(&fx.events, |e| {
            matches!(e, TerrainEvent::MeshBlockExited { .. })
        })
        .len();
        assert_eq!(mesh_entered, mesh_exited);
    }

    #[test]
    fn viewers_in_area_reports_overlap() {
        let mut fx = fixture();
        let near = add_viewer(&mut fx.terrain, 6);
        let far = fx.terrain.viewers_mut().add(Viewer {
            position: Point3::new(1000.0, 0.0, 0.0),
            horizontal_view_distance: 6,
            vertical_view_distance: 6,
            ..Viewer::default()
        });
        fx.terrain.process();

        let around_origin =
            Box3i::from_min_max(Point3::new(-2, -2, -2), Point3::new(2, 2, 2));
        let ids = fx.terrain.get_viewers_in_area(around_origin);
        assert!(ids.contains(&near));
        assert!(!ids.contains(&far));
    }

    #[test]
    fn automatic_loading_disabled_requests_nothing() {
        let config = TerrainConfig {
            data_block_size_po2: 2,
            mesh_block_size_po2: 2,
            automatic_loading_enabled: false,
            ..TerrainConfig::default()
        };
        let scheduler = SharedScheduler::new();
        let mut terrain = VoxelTerrain::new(config, Box::new(scheduler.clone()));
        add_viewer(&mut terrain, 6);
        terrain.process();
        assert_eq!(scheduler.pending_count(), 0);
        assert_eq!(terrain.data_block_state(Point3::new(0, 0, 0)), None);
    }

    #[test]
    fn two_viewers_keep_a_shared_block_alive() {
        let mut fx = fixture();
        let a = add_viewer(&mut fx.terrain, 6);
        let _b = add_viewer(&mut fx.terrain, 6);
        fx.terrain.process();
        fx.scheduler.run_all();
        fx.terrain.process();
        assert!(fx.terrain.has_data_block(Point3::new(0, 0, 0)));

        // One viewer leaves; the block stays loaded for the other.
        fx.terrain.viewers_mut().remove(a);
        fx.terrain.process();
        assert!(fx.terrain.has_data_block(Point3::new(0, 0, 0)));
    }

    #[test]
    fn mesher_swap_recovers_builds_in_flight() {
        let mut fx = fixture();
        add_viewer(&mut fx.terrain, 6);
        fx.terrain.process();
        fx.scheduler.run_all();
        // Loads commit and mesh build jobs go out, but are left in flight.
        fx.terrain.process();
        assert!(fx.scheduler.pending_count() > 0);

        // Swap the polygonizer while those builds are still running. Their
        // results arrive under the old epoch and must not be applied, but
        // the blocks they were for still have to get rebuilt.
        fx.terrain.set_mesher(Arc::new(BlockyMesher));
        fx.scheduler.run_all();
        fx.terrain.process();
        assert!(fx.terrain.stats().dropped_block_meshes > 0);
        // Replacement jobs went out under the new epoch the same tick.
        assert!(fx.scheduler.pending_count() > 0);

        fx.scheduler.run_all();
        fx.terrain.process();
        assert!(!fx.terrain.get_meshed_block_positions().is_empty());
    }

    /// Builds a fixture around a stream whose saves fail until told otherwise.
    fn flaky_fixture(save_retry: SaveRetryPolicy) -> (VoxelTerrain, SharedScheduler, Arc<FlakyStream>) {
        let config = TerrainConfig {
            data_block_size_po2: 2,
            mesh_block_size_po2: 2,
            save_retry,
            ..TerrainConfig::default()
        };
        let scheduler = SharedScheduler::new();
        let mut terrain = VoxelTerrain::new(config, Box::new(scheduler.clone()));
        let stream = Arc::new(FlakyStream::new(true));
        terrain.set_stream(Some(stream.clone()));
        terrain.set_generator(Some(Arc::new(UniformGenerator::air())));
        (terrain, scheduler, stream)
    }

    #[test]
    fn failed_save_is_retained_and_retried_on_sweep() {
        let (mut terrain, scheduler, stream) = flaky_fixture(SaveRetryPolicy::RetryOnSweep);
        let viewer = add_viewer(&mut terrain, 6);
        terrain.process();
        scheduler.run_all();
        terrain.process();
        assert!(terrain.edit_voxel(Point3::new(0, 0, 0), 9));

        // Unload; the save goes out and fails.
        terrain.viewers_mut().get_mut(viewer).unwrap().position = Point3::new(1000.0, 0.0, 0.0);
        terrain.process();
        scheduler.run_all();
        terrain.process();
        // The buffer stays retained, flagged for retry.
        assert_eq!(
            terrain.data_block_state(Point3::new(0, 0, 0)),
            Some(DataBlockState::UnloadedSaving)
        );
        assert!(!stream.inner.contains(Point3::new(0, 0, 0)));

        // The stream heals; an explicit sweep re-queues exactly that block.
        stream.set_failing(false);
        assert_eq!(terrain.save_all_modified_blocks(), 1);
        terrain.process();
        scheduler.run_all();
        terrain.process();
        assert_eq!(terrain.data_block_state(Point3::new(0, 0, 0)), None);
        assert!(stream.inner.contains(Point3::new(0, 0, 0)));
    }

    #[test]
    fn failed_save_is_dropped_under_discard_policy() {
        let (mut terrain, scheduler, stream) = flaky_fixture(SaveRetryPolicy::DiscardOnFailure);
        let viewer = add_viewer(&mut terrain, 6);
        terrain.process();
        scheduler.run_all();
        terrain.process();
        assert!(terrain.edit_voxel(Point3::new(0, 0, 0), 9));

        terrain.viewers_mut().get_mut(viewer).unwrap().position = Point3::new(1000.0, 0.0, 0.0);
        terrain.process();
        scheduler.run_all();
        terrain.process();
        // The buffer is gone and nothing is left to sweep.
        assert_eq!(terrain.data_block_state(Point3::new(0, 0, 0)), None);
        assert_eq!(terrain.save_all_modified_blocks(), 0);
        assert!(!stream.inner.contains(Point3::new(0, 0, 0)));
    }

    #[test]
    fn failed_save_stays_dirty_across_quick_reload() {
        let (mut terrain, scheduler, stream) = flaky_fixture(SaveRetryPolicy::RetryOnSweep);
        let viewer = add_viewer(&mut terrain, 6);
        terrain.process();
        scheduler.run_all();
        terrain.process();
        assert!(terrain.edit_voxel(Point3::new(0, 0, 0), 9));

        // Unload, fail the save, then come back. The quick reload must carry
        // the unpersisted-changes flag along with the buffer.
        terrain.viewers_mut().get_mut(viewer).unwrap().position = Point3::new(1000.0, 0.0, 0.0);
        terrain.process();
        scheduler.run_all();
        terrain.process();
        terrain.viewers_mut().get_mut(viewer).unwrap().position = Point3::new(0.0, 0.0, 0.0);
        terrain.process();
        assert_eq!(terrain.get_voxel(Point3::new(0, 0, 0)), Some(9));

        stream.set_failing(false);
        assert_eq!(terrain.save_all_modified_blocks(), 1);
        terrain.process();
        scheduler.run_all();
        terrain.process();
        assert!(stream.inner.contains(Point3::new(0, 0, 0)));
    }

    #[test]
    fn flag_flip_fires_no_events_for_covered_blocks() {
        let mut fx = fixture();
        let viewer = add_viewer(&mut fx.terrain, 6);
        fx.terrain.process();
        fx.scheduler.run_all();
        fx.terrain.process();
        fx.scheduler.run_all();
        fx.terrain.process();
        assert!(!fx.terrain.get_meshed_block_positions().is_empty());

        let mesh_events = |events: &Arc<Mutex<Vec<TerrainEvent>>>| {
            events_of(events, |e| {
                matches!(
                    e,
                    TerrainEvent::MeshBlockEntered { .. } | TerrainEvent::MeshBlockExited { .. }
                )
            })
            .len()
        };
        let before = mesh_events(&fx.events);

        // Dropping collision interest keeps the mesh box identical; no block
        // leaves coverage, so no enter or exit event may fire and no build
        // job may go out.
        fx.terrain.viewers_mut().get_mut(viewer).unwrap().requires_collisions = false;
        fx.terrain.process();
        assert_eq!(mesh_events(&fx.events), before);
        assert_eq!(fx.scheduler.pending_count(), 0);

        // Same for turning it back on.
        fx.terrain.viewers_mut().get_mut(viewer).unwrap().requires_collisions = true;
        fx.terrain.process();
        assert_eq!(mesh_events(&fx.events), before);
        assert_eq!(fx.scheduler.pending_count(), 0);
        // Built meshes survived the re-view.
        assert!(!fx.terrain.get_meshed_block_positions().is_empty());
    }
}
