//! Placeholders for content that has not materialized yet.

use std::collections::HashMap;

use crate::construct::draw_placeholder;
use crate::error::SyncResult;
use crate::geometry::{Bounds, Point};
use crate::scene::{NodeHandle, SceneTree};

/// Predict where a new item of `size` should appear.
///
/// To the right of the last item, separated by `gap`. If that would cross
/// the right edge of the viewport, directly under the last item instead.
/// With no existing content, centred in the viewport.
#[must_use]
pub fn predict_placement(
    last: Option<Bounds>,
    viewport: Bounds,
    size: (f32, f32),
    gap: f32,
) -> Bounds {
    let (width, height) = size;
    let Some(last) = last else {
        return Bounds::centered_at(viewport.center(), width, height);
    };
    let beside = Bounds::new(last.right() + gap, last.y, width, height);
    if beside.right() <= viewport.right() {
        beside
    } else {
        Bounds::new(last.x, last.bottom() + gap, width, height)
    }
}

/// A transient subtree standing in for content in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceholderGroup {
    /// Placeholder id; also the id of the content it becomes.
    pub id: String,
    /// Root of the placeholder subtree.
    pub handle: NodeHandle,
    /// Predicted bounds.
    pub bounds: Bounds,
    /// Last reported progress in `0.0..=1.0`.
    pub progress: f32,
}

impl PlaceholderGroup {
    /// Centre of the predicted bounds.
    #[must_use]
    pub fn center(&self) -> Point {
        self.bounds.center()
    }
}

/// Tracks live placeholder groups by id.
#[derive(Debug, Clone, Default)]
pub struct Placeholders {
    groups: HashMap<String, PlaceholderGroup>,
}

impl Placeholders {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw a placeholder and start tracking it.
    ///
    /// # Errors
    ///
    /// Returns an error if `layer` is stale.
    pub fn create(
        &mut self,
        scene: &mut SceneTree,
        layer: NodeHandle,
        id: &str,
        bounds: Bounds,
    ) -> SyncResult<PlaceholderGroup> {
        if let Some(existing) = self.remove(scene, id) {
            tracing::debug!(id = %id, "Replacing existing placeholder {}", existing.handle);
        }
        let handle = draw_placeholder(scene, layer, id, bounds)?;
        let group = PlaceholderGroup {
            id: id.to_string(),
            handle,
            bounds,
            progress: 0.0,
        };
        self.groups.insert(id.to_string(), group.clone());
        Ok(group)
    }

    /// Remove a placeholder and its whole subtree.
    pub fn remove(&mut self, scene: &mut SceneTree, id: &str) -> Option<PlaceholderGroup> {
        let group = self.groups.remove(id)?;
        scene.remove(group.handle);
        Some(group)
    }

    /// Record progress, clamped to `0.0..=1.0`. Returns the stored value.
    pub fn set_progress(&mut self, id: &str, progress: f32) -> Option<f32> {
        let group = self.groups.get_mut(id)?;
        group.progress = progress.clamp(0.0, 1.0);
        Some(group.progress)
    }

    /// Look up a placeholder.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&PlaceholderGroup> {
        self.groups.get(id)
    }

    /// Number of live placeholders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether no placeholder is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Forget placeholders whose subtree no longer exists.
    pub fn prune(&mut self, scene: &SceneTree) {
        self.groups.retain(|_, g| scene.contains(g.handle));
    }

    /// Forget every placeholder without touching the scene.
    pub fn clear(&mut self) {
        self.groups.clear();
    }
}
