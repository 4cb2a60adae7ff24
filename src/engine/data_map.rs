//! The three-map data paging store.
//!
//! Every data block position is resident in at most one of three maps:
//!
//! - **loaded**: authoritative, readable and writable by edits;
//! - **loading**: requested but not yet arrived, with a viewer refcount;
//! - **unloaded-saving**: evicted for lack of interest while an async save
//!   of its buffer is still in flight. The buffer is kept addressable so a
//!   viewer returning before the save resolves is served from memory instead
//!   of re-reading the backing stream, which could still hold stale data.
//!
//! Transitions between the maps happen only on the main thread during the
//! engine's commit phase. Finding a position in two maps at once is a
//! programming fault, asserted in debug builds.

use std::collections::HashMap;
use std::sync::Arc;

use cgmath::Point3;

use crate::core::RefCount;
use crate::engine::viewers::ViewerId;
use crate::voxel::VoxelBuffer;

/// A resident, authoritative data block.
pub(crate) struct DataBlock {
    /// Owned voxels. Shared read-only with save jobs; edits go through
    /// `Arc::make_mut`, so a buffer under an in-flight save is never mutated
    /// in place.
    pub voxels: Arc<VoxelBuffer>,
    /// True if edited since the last save was queued.
    pub modified: bool,
    /// Viewers currently covering this block.
    pub viewers: RefCount,
}

/// A block whose load has been requested but has not arrived.
pub(crate) struct LoadingBlock {
    /// Viewers waiting on this block. Dropping to zero cancels the load.
    pub viewers: RefCount,
    /// Viewers to notify with a block-entered event on arrival, in interest
    /// order.
    pub viewers_to_notify: Vec<ViewerId>,
}

/// A block evicted from the loaded map while its save is still in flight.
pub(crate) struct UnloadedSavingBlock {
    /// The buffer being persisted; served directly on re-entry.
    pub voxels: Arc<VoxelBuffer>,
    /// Set when the save failed and the retry policy keeps the buffer for
    /// the next explicit save sweep.
    pub needs_retry: bool,
}

/// Which map a position currently occupies. Used by tests and invariant
/// checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataBlockState {
    /// Present in the loaded map.
    Loaded,
    /// Present in the loading map.
    Loading,
    /// Present in the unloaded-saving map.
    UnloadedSaving,
}

/// Sparse store of all data block state, keyed by data-block position.
#[derive(Default)]
pub(crate) struct DataMap {
    pub loaded: HashMap<Point3<i32>, DataBlock>,
    pub loading: HashMap<Point3<i32>, LoadingBlock>,
    pub unloaded_saving: HashMap<Point3<i32>, UnloadedSavingBlock>,
}

impl DataMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports which single map holds `position`, if any.
    pub fn state_of(&self, position: Point3<i32>) -> Option<DataBlockState> {
        let mut state = None;
        let mut found = 0;
        if self.loaded.contains_key(&position) {
            state = Some(DataBlockState::Loaded);
            found += 1;
        }
        if self.loading.contains_key(&position) {
            state = Some(DataBlockState::Loading);
            found += 1;
        }
        if self.unloaded_saving.contains_key(&position) {
            state = Some(DataBlockState::UnloadedSaving);
            found += 1;
        }
        debug_assert!(
            found <= 1,
            "data block {:?} resident in {} maps",
            position,
            found
        );
        state
    }

    /// Moves a block into the loaded map.
    ///
    /// # Panics
    /// Asserts in debug builds if the position is already resident anywhere.
    pub fn insert_loaded(&mut self, position: Point3<i32>, block: DataBlock) {
        debug_assert!(
            self.state_of(position).is_none(),
            "block {:?} already resident",
            position
        );
        self.loaded.insert(position, block);
    }

    /// Drops every block in every map.
    pub fn clear(&mut self) {
        self.loaded.clear();
        self.loading.clear();
        self.unloaded_saving.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_of_reports_single_residency() {
        let mut map = DataMap::new();
        let pos = Point3::new(1, 2, 3);
        assert_eq!(map.state_of(pos), None);

        map.loading.insert(
            pos,
            LoadingBlock {
                viewers: RefCount::new(1),
                viewers_to_notify: Vec::new(),
            },
        );
        assert_eq!(map.state_of(pos), Some(DataBlockState::Loading));

        map.loading.remove(&pos);
        map.insert_loaded(
            pos,
            DataBlock {
                voxels: Arc::new(VoxelBuffer::new(4)),
                modified: false,
                viewers: RefCount::new(1),
            },
        );
        assert_eq!(map.state_of(pos), Some(DataBlockState::Loaded));
    }

    #[test]
    #[should_panic(expected = "already resident")]
    #[cfg(debug_assertions)]
    fn double_residency_is_a_fault() {
        let mut map = DataMap::new();
        let pos = Point3::new(0, 0, 0);
        map.loading.insert(
            pos,
            LoadingBlock {
                viewers: RefCount::new(1),
                viewers_to_notify: Vec::new(),
            },
        );
        map.insert_loaded(
            pos,
            DataBlock {
                voxels: Arc::new(VoxelBuffer::new(4)),
                modified: false,
                viewers: RefCount::new(1),
            },
        );
    }
}
