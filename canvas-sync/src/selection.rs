//! Pointer-to-content resolution and selection syncing.

use std::iter;

use async_trait::async_trait;

use crate::binding::{helper_role, read_binding, ContentKind, HelperRole};
use crate::engine::SharedEngine;
use crate::geometry::{Bounds, Point};
use crate::model::ImageInstance;
use crate::scene::{Node, NodeHandle, SceneTree};

/// Logical content under the pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HitTarget {
    /// Content kind.
    pub kind: ContentKind,
    /// Content id.
    pub id: String,
    /// Tagged node.
    pub node: NodeHandle,
}

/// Whether hit-testing must ignore this node and everything under it.
///
/// Selection outlines, handles, grid, background and placeholder subtrees are
/// skipped. Hit areas are kept: they exist to be hit.
#[must_use]
pub fn skipped_by_hit_test(node: &Node) -> bool {
    match helper_role(node) {
        Some(role) => role.blocks_hit_test(),
        None => node.data.role.is_some(),
    }
}

/// Resolve the content under `point`.
///
/// The hit-test tolerance is `base_tolerance / zoom`, so it stays constant in
/// screen pixels. From the hit node the ancestor chain is walked: hit areas
/// defer to their parent and the first content-tagged node wins. Reaching a
/// layer first means the canvas itself was hit and `None` is returned.
#[must_use]
pub fn resolve_target(
    scene: &SceneTree,
    point: Point,
    zoom: f32,
    base_tolerance: f32,
) -> Option<HitTarget> {
    let tolerance = base_tolerance / zoom.max(f32::EPSILON);
    let hit = scene.hit_test(point, tolerance, &skipped_by_hit_test)?;
    owning_content(scene, hit)
}

fn owning_content(scene: &SceneTree, handle: NodeHandle) -> Option<HitTarget> {
    for current in iter::once(handle).chain(scene.ancestors(handle)) {
        let node = scene.node(current)?;
        if scene.layers().contains(&current) {
            return None;
        }
        if helper_role(node) == Some(HelperRole::HitArea) {
            continue;
        }
        if let Some(binding) = read_binding(node) {
            return Some(HitTarget {
                kind: binding.kind,
                id: binding.content_id,
                node: current,
            });
        }
    }
    None
}

/// Every content item intersecting `area`, in paint order, without repeats.
#[must_use]
pub fn targets_in_rect(scene: &SceneTree, area: &Bounds) -> Vec<HitTarget> {
    let mut out: Vec<HitTarget> = Vec::new();
    for leaf in scene.hit_test_rect(area, &skipped_by_hit_test) {
        if let Some(target) = owning_content(scene, leaf) {
            if !out.iter().any(|t| t.kind == target.kind && t.id == target.id) {
                out.push(target);
            }
        }
    }
    out
}

/// Identifies one selection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SelectionToken(u64);

/// Monotonic selection counter.
///
/// Every selection change advances the counter. Async work started for one
/// selection compares its token before committing and drops stale results.
#[derive(Debug, Clone, Default)]
pub struct SelectionSync {
    counter: u64,
}

impl SelectionSync {
    /// Create a counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a selection change.
    pub fn advance(&mut self) -> SelectionToken {
        self.counter += 1;
        SelectionToken(self.counter)
    }

    /// Token of the current selection.
    #[must_use]
    pub const fn current(&self) -> SelectionToken {
        SelectionToken(self.counter)
    }

    /// Whether `token` still names the current selection.
    #[must_use]
    pub fn is_current(&self, token: SelectionToken) -> bool {
        token.0 == self.counter
    }
}

/// An auxiliary surface that mirrors the selected images (e.g. a chat panel).
#[async_trait(?Send)]
pub trait SelectionConsumer {
    /// What the consumer builds from a selection.
    type Prepared;

    /// Consumer name, used for reference holds.
    fn name(&self) -> &str;

    /// Build the consumer's view of the selection. May suspend.
    async fn prepare(&self, images: &[ImageInstance]) -> Self::Prepared;

    /// Commit a prepared view. Only called for the current selection.
    fn commit(&self, prepared: Self::Prepared);
}

/// Push the current image selection to `consumer`.
///
/// The selected images' references are held for the consumer so they cannot
/// be revoked while it uses them. If the selection changes while `prepare`
/// is suspended, the result is discarded. Returns whether it was committed.
pub async fn push_selection<C: SelectionConsumer>(engine: &SharedEngine, consumer: &C) -> bool {
    let (token, images) = engine.borrow_mut().capture_selection_for(consumer.name());
    let prepared = consumer.prepare(&images).await;
    if !engine.borrow().is_current_selection(token) {
        tracing::debug!(consumer = consumer.name(), "Discarding stale selection result");
        return false;
    }
    consumer.commit(prepared);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{content_data, helper_data};
    use crate::scene::NodeSpec;

    fn scene_with_group() -> (SceneTree, NodeHandle) {
        let mut scene = SceneTree::new();
        let layer = scene.add_layer("l1", "Layer 1");
        let group = scene
            .insert(layer, NodeSpec::group().with_data(content_data(ContentKind::Image, "img-1")))
            .expect("insert");
        scene
            .insert(group, NodeSpec::rect(Bounds::new(0.0, 0.0, 100.0, 100.0)))
            .expect("insert");
        scene
            .insert(
                group,
                NodeSpec::rect(Bounds::new(0.0, 0.0, 100.0, 100.0))
                    .with_data(helper_data(HelperRole::HitArea, Some("img-1"))),
            )
            .expect("insert");
        (scene, layer)
    }

    #[test]
    fn test_hit_area_defers_to_group() {
        let (scene, _) = scene_with_group();
        let target = resolve_target(&scene, Point::new(50.0, 50.0), 1.0, 4.0).expect("hit");
        assert_eq!(target.kind, ContentKind::Image);
        assert_eq!(target.id, "img-1");
    }

    #[test]
    fn test_tolerance_scales_with_zoom() {
        let (scene, _) = scene_with_group();
        assert!(resolve_target(&scene, Point::new(103.0, 50.0), 1.0, 4.0).is_some());
        assert!(resolve_target(&scene, Point::new(103.0, 50.0), 2.0, 4.0).is_none());
        assert!(resolve_target(&scene, Point::new(107.0, 50.0), 0.5, 4.0).is_some());
    }

    #[test]
    fn test_selection_outline_and_placeholder_skipped() {
        let (mut scene, layer) = scene_with_group();
        scene
            .insert(
                layer,
                NodeSpec::rect(Bounds::new(0.0, 0.0, 100.0, 100.0))
                    .with_data(helper_data(HelperRole::SelectionOutline, Some("img-1"))),
            )
            .expect("insert");
        let placeholder = scene
            .insert(
                layer,
                NodeSpec::group().with_data(helper_data(HelperRole::Placeholder, Some("p"))),
            )
            .expect("insert");
        scene
            .insert(placeholder, NodeSpec::rect(Bounds::new(0.0, 0.0, 100.0, 100.0)))
            .expect("insert");

        let target = resolve_target(&scene, Point::new(50.0, 50.0), 1.0, 0.0).expect("hit");
        assert_eq!(target.id, "img-1");
    }

    #[test]
    fn test_canvas_hit_returns_none() {
        let (mut scene, layer) = scene_with_group();
        scene
            .insert(layer, NodeSpec::rect(Bounds::new(200.0, 200.0, 50.0, 50.0)))
            .expect("insert");
        assert!(resolve_target(&scene, Point::new(210.0, 210.0), 1.0, 0.0).is_none());
        assert!(resolve_target(&scene, Point::new(500.0, 500.0), 1.0, 0.0).is_none());
    }

    #[test]
    fn test_marquee_dedupes_groups() {
        let (scene, _) = scene_with_group();
        let targets = targets_in_rect(&scene, &Bounds::new(-10.0, -10.0, 50.0, 50.0));
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].id, "img-1");
    }

    #[test]
    fn test_tokens_are_monotonic() {
        let mut sync = SelectionSync::new();
        let first = sync.advance();
        assert!(sync.is_current(first));
        let second = sync.advance();
        assert!(second > first);
        assert!(!sync.is_current(first));
        assert_eq!(sync.current(), second);
    }
}
