//! # Config Module
//!
//! Engine configuration, deserializable from JSON so worlds can ship their
//! terrain settings as data. Every field has a default; absent fields in a
//! config file fall back to them.

use cgmath::{Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::math::Box3i;

/// What to do when an asynchronous block save reports an error.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveRetryPolicy {
    /// Keep the block's buffer in the unloaded-saving map; the next explicit
    /// save sweep re-queues it.
    #[default]
    RetryOnSweep,
    /// Drop the buffer and log the error. Data loss is accepted.
    DiscardOnFailure,
}

/// Default extent of the world bounds on each side of the origin, in voxels.
const DEFAULT_BOUNDS_EXTENT: i32 = 1 << 20;

/// Terrain engine settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainConfig {
    /// Base-2 logarithm of the data block size in voxels.
    pub data_block_size_po2: u32,
    /// Base-2 logarithm of the mesh block size in voxels. May differ from the
    /// data granularity.
    pub mesh_block_size_po2: u32,
    /// World bounds in voxel coordinates; viewer boxes are clamped to it.
    pub bounds: Box3i,
    /// When false, viewer movement pins and releases blocks but never
    /// requests new loads.
    pub automatic_loading_enabled: bool,
    /// Fire data block enter/exit events per viewer as blocks become
    /// available inside, or drop out of, its box.
    pub block_enter_notification_enabled: bool,
    /// Fire an area-edited event after each committed edit.
    pub area_edit_notification_enabled: bool,
    /// Upper limit applied to viewer view distances, in voxels.
    pub max_view_distance_voxels: u32,
    /// Behavior on save failure.
    pub save_retry: SaveRetryPolicy,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        TerrainConfig {
            data_block_size_po2: 4,
            mesh_block_size_po2: 4,
            bounds: Box3i::from_center_extents(
                Point3::new(0, 0, 0),
                Vector3::new(
                    DEFAULT_BOUNDS_EXTENT,
                    DEFAULT_BOUNDS_EXTENT,
                    DEFAULT_BOUNDS_EXTENT,
                ),
            ),
            automatic_loading_enabled: true,
            block_enter_notification_enabled: true,
            area_edit_notification_enabled: true,
            max_view_distance_voxels: 512,
            save_retry: SaveRetryPolicy::default(),
        }
    }
}

impl TerrainConfig {
    /// Parses a config from a JSON document, filling absent fields with
    /// defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = TerrainConfig::default();
        assert_eq!(config.data_block_size_po2, 4);
        assert!(config.automatic_loading_enabled);
        assert_eq!(config.save_retry, SaveRetryPolicy::RetryOnSweep);
    }

    #[test]
    fn json_overrides_partial_fields() {
        let config = TerrainConfig::from_json(
            r#"{ "mesh_block_size_po2": 5, "automatic_loading_enabled": false }"#,
        )
        .unwrap();
        assert_eq!(config.mesh_block_size_po2, 5);
        assert!(!config.automatic_loading_enabled);
        // Untouched fields keep their defaults.
        assert_eq!(config.data_block_size_po2, 4);
    }
}
