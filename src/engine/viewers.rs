//! Viewer registry and per-viewer interest tracking.
//!
//! A viewer is an external observer whose position defines the region of the
//! world that must be resident. The engine pairs each registered viewer with
//! a [`PairedViewer`] holding the interest boxes computed this tick and the
//! boxes from the previous tick; the per-tick set difference between the two
//! drives every load, unload and mesh view decision.

use cgmath::Point3;

use crate::math::Box3i;

/// Identifies a registered viewer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewerId(pub u32);

/// An observer streaming terrain around itself.
#[derive(Clone, Debug)]
pub struct Viewer {
    /// World-space position.
    pub position: Point3<f32>,
    /// View distance along the horizontal axes, in voxels.
    pub horizontal_view_distance: u32,
    /// View distance along the vertical axis, in voxels.
    pub vertical_view_distance: u32,
    /// Whether this viewer needs renderable meshes.
    pub requires_meshes: bool,
    /// Whether this viewer needs collision geometry.
    pub requires_collisions: bool,
}

impl Default for Viewer {
    fn default() -> Self {
        Viewer {
            position: Point3::new(0.0, 0.0, 0.0),
            horizontal_view_distance: 128,
            vertical_view_distance: 128,
            requires_meshes: true,
            requires_collisions: true,
        }
    }
}

/// Interest boxes derived from a viewer for one tick.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct ViewerState {
    /// Required region in data-block coordinates.
    pub data_box: Box3i,
    /// Required region in mesh-block coordinates; empty when the viewer
    /// needs neither meshes nor collisions.
    pub mesh_box: Box3i,
    pub requires_meshes: bool,
    pub requires_collisions: bool,
}

/// A registered viewer paired with its diffable interest state.
#[derive(Clone, Debug)]
pub(crate) struct PairedViewer {
    pub id: ViewerId,
    pub state: ViewerState,
    pub prev_state: ViewerState,
}

/// Owns the set of active viewers.
///
/// The engine enumerates this registry once per tick; everything else about
/// a viewer's effect on the world is derived state.
#[derive(Default)]
pub struct ViewerRegistry {
    viewers: Vec<(ViewerId, Viewer)>,
    next_id: u32,
}

impl ViewerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a viewer and returns its id.
    pub fn add(&mut self, viewer: Viewer) -> ViewerId {
        let id = ViewerId(self.next_id);
        self.next_id += 1;
        self.viewers.push((id, viewer));
        id
    }

    /// Removes a viewer. Its interest is released on the next tick.
    pub fn remove(&mut self, id: ViewerId) {
        self.viewers.retain(|(v, _)| *v != id);
    }

    /// Looks up a viewer.
    pub fn get(&self, id: ViewerId) -> Option<&Viewer> {
        self.viewers.iter().find(|(v, _)| *v == id).map(|(_, w)| w)
    }

    /// Looks up a viewer mutably.
    pub fn get_mut(&mut self, id: ViewerId) -> Option<&mut Viewer> {
        self.viewers
            .iter_mut()
            .find(|(v, _)| *v == id)
            .map(|(_, w)| w)
    }

    /// Iterates over `(id, viewer)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (ViewerId, &Viewer)> {
        self.viewers.iter().map(|(id, v)| (*id, v))
    }

    /// Number of registered viewers.
    pub fn len(&self) -> usize {
        self.viewers.len()
    }

    /// Returns true if no viewer is registered.
    pub fn is_empty(&self) -> bool {
        self.viewers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_not_reused() {
        let mut registry = ViewerRegistry::new();
        let a = registry.add(Viewer::default());
        registry.remove(a);
        let b = registry.add(Viewer::default());
        assert_ne!(a, b);
        assert!(registry.get(a).is_none());
        assert!(registry.get(b).is_some());
    }
}
