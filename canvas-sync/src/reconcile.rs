//! Derive the instance registry from the scene tree.
//!
//! A pass runs in three phases:
//!
//! 1. **Cleanup** repairs structural damage in the scene: untagged rasters get
//!    a synthesized tag, content groups without a primitive are removed,
//!    duplicate rasters inside one image group are dropped, groups repeating an
//!    already-seen `(kind, id)` are re-tagged, and hit areas or selection
//!    outlines whose owner is gone are removed.
//! 2. **Derive** walks every layer once and builds fresh entries from tags,
//!    geometry and attributes. Rasters that have not decoded yet produce a
//!    zero-size entry and register a one-shot load continuation.
//! 3. **Merge** combines fresh entries with the previous registry. Previous
//!    non-degenerate bounds win over degenerate fresh ones, and selection state
//!    and payload fields the scene does not carry are inherited. A collection
//!    that ends up identical to the previous one is returned as the same `Rc`.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::asset::AssetResolver;
use crate::binding::{
    helper_data, helper_role, infer_kind, read_binding, tag_content, BindingIndex, ContentKind,
    HelperRole, SceneNodeBinding, ATTR_FILE_NAME, ATTR_FORMAT, ATTR_MODEL_URL,
    ATTR_PENDING_UPLOAD, ATTR_POSTER, ATTR_REMOTE_URL, ATTR_SRC, ATTR_STORAGE_KEY,
};
use crate::geometry::Bounds;
use crate::model::{
    new_content_id, ImageInstance, ImagePayload, Instance, ModelInstance, ModelPayload, Payload,
    TextInstance, TextPayload, VideoInstance, VideoPayload,
};
use crate::registry::{InstanceRegistry, RegistryState};
use crate::scene::{Node, NodeHandle, NodeKind, NodeSpec, SceneTree};

/// Result of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcileOutcome {
    /// The registry is identical to the previous one.
    #[default]
    Unchanged,
    /// At least one collection changed.
    Updated,
    /// The scene is not initialized; the result is empty and must not replace
    /// the live registry.
    RecoveryNeeded,
}

/// A content group that was given a fresh id because its id was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retag {
    /// Content kind.
    pub kind: ContentKind,
    /// Duplicated id.
    pub from: String,
    /// Fresh id.
    pub to: String,
}

/// What a pass did besides deriving the registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Overall outcome.
    pub outcome: ReconcileOutcome,
    /// Content groups removed because they had no primitive.
    pub removed_orphans: usize,
    /// Extra rasters removed from image groups.
    pub removed_duplicates: usize,
    /// Hit areas and selection outlines removed because their owner is gone.
    pub removed_helpers: usize,
    /// Untagged rasters that received a tag.
    pub synthesized: usize,
    /// Groups re-tagged to keep ids unique.
    pub retagged: Vec<Retag>,
    /// Hit areas created or resized.
    pub repaired_hit_areas: usize,
    /// Rasters still decoding.
    pub pending_loads: Vec<NodeHandle>,
}

impl ReconcileReport {
    /// Whether the pass changed the scene.
    #[must_use]
    pub fn mutated_scene(&self) -> bool {
        self.removed_orphans > 0
            || self.removed_duplicates > 0
            || self.removed_helpers > 0
            || self.synthesized > 0
            || !self.retagged.is_empty()
            || self.repaired_hit_areas > 0
    }
}

#[derive(Default)]
struct Derived {
    images: Vec<ImageInstance>,
    models: Vec<ModelInstance>,
    texts: Vec<TextInstance>,
    videos: Vec<VideoInstance>,
}

/// Scene-to-registry reconciler.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    resolver: AssetResolver,
    index: BindingIndex,
    pending: HashMap<NodeHandle, String>,
}

impl Reconciler {
    /// Create a reconciler normalizing references with `resolver`.
    #[must_use]
    pub fn new(resolver: AssetResolver) -> Self {
        Self {
            resolver,
            index: BindingIndex::new(),
            pending: HashMap::new(),
        }
    }

    /// Bindings found by the last pass.
    #[must_use]
    pub const fn index(&self) -> &BindingIndex {
        &self.index
    }

    /// Rasters waiting for their load continuation.
    #[must_use]
    pub fn pending_loads(&self) -> Vec<NodeHandle> {
        let mut handles: Vec<NodeHandle> = self.pending.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    /// Forget all state tied to the current scene.
    pub fn reset(&mut self) {
        self.index.clear();
        self.pending.clear();
    }

    /// Run a full pass.
    pub fn reconcile(
        &mut self,
        scene: &mut SceneTree,
        previous: &RegistryState,
    ) -> (RegistryState, ReconcileReport) {
        let mut report = ReconcileReport::default();
        self.index.clear();
        self.pending.retain(|handle, _| scene.contains(*handle));

        if !scene.is_ready() {
            tracing::debug!("Scene not ready, skipping reconciliation");
            self.pending.clear();
            report.outcome = ReconcileOutcome::RecoveryNeeded;
            return (RegistryState::default(), report);
        }

        let layers = scene.layers().to_vec();
        for layer in layers {
            synthesize_tags(scene, layer, &mut report);
        }
        remove_orphans(scene, &mut report);
        dedupe_ids(scene, &mut report);
        remove_stale_helpers(scene, &mut report);

        let derived = self.derive(scene, &mut report);
        let next = RegistryState {
            images: merge(derived.images, &previous.images),
            models: merge(derived.models, &previous.models),
            texts: merge(derived.texts, &previous.texts),
            videos: merge(derived.videos, &previous.videos),
        };
        report.outcome = if next.ptr_eq(previous) {
            ReconcileOutcome::Unchanged
        } else {
            ReconcileOutcome::Updated
        };

        tracing::debug!(
            outcome = ?report.outcome,
            images = next.images.len(),
            models = next.models.len(),
            texts = next.texts.len(),
            videos = next.videos.len(),
            pending = report.pending_loads.len(),
            "Reconciled scene"
        );
        (next, report)
    }

    /// Load continuation for one raster.
    ///
    /// Re-derives the image's bounds, repairs its hit area and updates the live
    /// registry entry in place. Runs at most once per registered raster.
    /// Returns `true` if the registry was updated.
    pub fn on_raster_loaded(
        &mut self,
        scene: &mut SceneTree,
        registry: &mut InstanceRegistry,
        raster: NodeHandle,
    ) -> bool {
        let Some(id) = self.pending.remove(&raster) else {
            return false;
        };
        let Some(bounds) = scene.bounds(raster) else {
            return false;
        };
        let natural = scene
            .node(raster)
            .and_then(Node::raster)
            .and_then(|r| r.natural_size);
        let group = scene.node(raster).and_then(Node::parent).filter(|p| {
            scene
                .node(*p)
                .and_then(read_binding)
                .is_some_and(|b| b.content_id == id)
        });
        if let Some(group) = group {
            repair_hit_area(scene, group, &id, bounds);
        }

        let updated = registry.modify::<ImagePayload>(&id, |instance| {
            instance.bounds = bounds;
            if let Some((w, h)) = natural {
                instance.payload.natural_width = Some(w);
                instance.payload.natural_height = Some(h);
            }
        });
        match updated {
            Ok(()) => {
                tracing::debug!(id = %id, "Raster loaded, bounds updated");
                true
            }
            Err(e) => {
                tracing::debug!(id = %id, "Raster loaded before registry entry existed: {}", e);
                false
            }
        }
    }

    fn derive(&mut self, scene: &mut SceneTree, report: &mut ReconcileReport) -> Derived {
        let mut derived = Derived::default();
        for handle in content_nodes(scene) {
            let Some(binding) = scene.node(handle).and_then(read_binding) else {
                continue;
            };
            self.index.insert(&binding);
            match binding.kind {
                ContentKind::Image => {
                    if let Some(instance) = self.derive_image(scene, &binding, report) {
                        derived.images.push(instance);
                    }
                }
                ContentKind::Model3D => {
                    if let Some(instance) = derive_model(scene, &binding, report) {
                        derived.models.push(instance);
                    }
                }
                ContentKind::Video => {
                    if let Some(instance) = self.derive_video(scene, &binding, report) {
                        derived.videos.push(instance);
                    }
                }
                ContentKind::Text => {
                    if let Some(instance) = derive_text(scene, &binding) {
                        derived.texts.push(instance);
                    }
                }
                ContentKind::Path => {}
            }
        }
        derived
    }

    fn derive_image(
        &mut self,
        scene: &mut SceneTree,
        binding: &SceneNodeBinding,
        report: &mut ReconcileReport,
    ) -> Option<ImageInstance> {
        let node = scene.node(binding.node)?;
        let raster_handle = if node.raster().is_some() {
            binding.node
        } else {
            primitives(scene, binding.node, ContentKind::Image)
                .first()
                .copied()?
        };
        let raster = scene.node(raster_handle).and_then(Node::raster)?;
        let attrs = &node.data.attrs;
        let payload = ImagePayload {
            src: self
                .resolver
                .normalize(&raster.source)
                .unwrap_or_else(|| raster.source.clone()),
            storage_key: attrs.get(ATTR_STORAGE_KEY).cloned(),
            remote_url: attrs.get(ATTR_REMOTE_URL).cloned(),
            pending_upload: attrs.get(ATTR_PENDING_UPLOAD).is_some_and(|v| v == "true"),
            natural_width: raster.natural_size.map(|(w, _)| w),
            natural_height: raster.natural_size.map(|(_, h)| h),
            file_name: attrs.get(ATTR_FILE_NAME).cloned(),
        };
        let loaded = raster.loaded;
        let visible = node.visible;
        let bounds = if loaded {
            scene.bounds(raster_handle).unwrap_or(Bounds::ZERO)
        } else {
            Bounds::ZERO
        };
        let layer_id = layer_id_of(scene, binding.node);

        if !loaded {
            self.pending
                .insert(raster_handle, binding.content_id.clone());
            report.pending_loads.push(raster_handle);
        } else if raster_handle != binding.node
            && repair_hit_area(scene, binding.node, &binding.content_id, bounds)
        {
            report.repaired_hit_areas += 1;
        }

        let mut instance = Instance::new(binding.content_id.clone(), bounds, payload);
        instance.visible = visible;
        instance.layer_id = layer_id;
        Some(instance)
    }

    fn derive_video(
        &self,
        scene: &mut SceneTree,
        binding: &SceneNodeBinding,
        report: &mut ReconcileReport,
    ) -> Option<VideoInstance> {
        let node = scene.node(binding.node)?;
        let attrs = &node.data.attrs;
        let src = attrs.get(ATTR_SRC).cloned().unwrap_or_default();
        let payload = VideoPayload {
            src: self.resolver.normalize(&src).unwrap_or(src),
            storage_key: attrs.get(ATTR_STORAGE_KEY).cloned(),
            remote_url: attrs.get(ATTR_REMOTE_URL).cloned(),
            poster: attrs.get(ATTR_POSTER).cloned(),
            pending_upload: attrs.get(ATTR_PENDING_UPLOAD).is_some_and(|v| v == "true"),
        };
        let visible = node.visible;
        let (bounds, layer_id) = framed_geometry(scene, binding);
        if repair_hit_area(scene, binding.node, &binding.content_id, bounds) {
            report.repaired_hit_areas += 1;
        }
        let mut instance = Instance::new(binding.content_id.clone(), bounds, payload);
        instance.visible = visible;
        instance.layer_id = layer_id;
        Some(instance)
    }
}

fn derive_model(
    scene: &mut SceneTree,
    binding: &SceneNodeBinding,
    report: &mut ReconcileReport,
) -> Option<ModelInstance> {
    let node = scene.node(binding.node)?;
    let attrs = &node.data.attrs;
    let payload = ModelPayload {
        model_url: attrs.get(ATTR_MODEL_URL).cloned().unwrap_or_default(),
        file_name: attrs.get(ATTR_FILE_NAME).cloned(),
        format: attrs.get(ATTR_FORMAT).cloned(),
    };
    let visible = node.visible;
    let (bounds, layer_id) = framed_geometry(scene, binding);
    if repair_hit_area(scene, binding.node, &binding.content_id, bounds) {
        report.repaired_hit_areas += 1;
    }
    let mut instance = Instance::new(binding.content_id.clone(), bounds, payload);
    instance.visible = visible;
    instance.layer_id = layer_id;
    Some(instance)
}

fn derive_text(scene: &SceneTree, binding: &SceneNodeBinding) -> Option<TextInstance> {
    let node = scene.node(binding.node)?;
    let text_handle = if matches!(node.kind, NodeKind::Text(_)) {
        binding.node
    } else {
        primitives(scene, binding.node, ContentKind::Text)
            .first()
            .copied()?
    };
    let text_node = scene.node(text_handle)?;
    let NodeKind::Text(text) = &text_node.kind else {
        return None;
    };
    let mut instance = Instance::new(
        binding.content_id.clone(),
        scene.bounds(text_handle).unwrap_or(Bounds::ZERO),
        TextPayload {
            content: text.content.clone(),
            font_size: text.font_size,
            color: text.color.clone(),
            font_family: text.font_family.clone(),
        },
    );
    instance.visible = node.visible;
    instance.layer_id = layer_id_of(scene, binding.node);
    Some(instance)
}

fn framed_geometry(scene: &SceneTree, binding: &SceneNodeBinding) -> (Bounds, Option<String>) {
    let bounds = primitives(scene, binding.node, binding.kind)
        .first()
        .and_then(|frame| scene.bounds(*frame))
        .or_else(|| scene.bounds(binding.node))
        .unwrap_or(Bounds::ZERO);
    (bounds, layer_id_of(scene, binding.node))
}

fn layer_id_of(scene: &SceneTree, handle: NodeHandle) -> Option<String> {
    scene
        .layer_of(handle)
        .and_then(|layer| scene.node(layer))
        .and_then(|layer| layer.data.layer_id.clone())
}

/// Content-tagged nodes in paint order.
///
/// Helper subtrees (placeholders included) are skipped entirely and tagged
/// nodes are not descended into.
#[must_use]
pub fn content_nodes(scene: &SceneTree) -> Vec<NodeHandle> {
    let mut out = Vec::new();
    for &layer in scene.layers() {
        collect_content(scene, layer, &mut out);
    }
    out
}

fn collect_content(scene: &SceneTree, parent: NodeHandle, out: &mut Vec<NodeHandle>) {
    for &child in scene.children(parent) {
        let Some(node) = scene.node(child) else {
            continue;
        };
        if node.data.role.is_some() {
            continue;
        }
        if read_binding(node).is_some() {
            out.push(child);
        } else if node.kind.is_container() {
            collect_content(scene, child, out);
        }
    }
}

/// Non-helper children of a content group that carry its primitive.
fn primitives(scene: &SceneTree, group: NodeHandle, kind: ContentKind) -> Vec<NodeHandle> {
    scene
        .children(group)
        .iter()
        .copied()
        .filter(|h| {
            scene.node(*h).is_some_and(|n| {
                n.data.role.is_none()
                    && match kind {
                        ContentKind::Image => n.raster().is_some(),
                        ContentKind::Model3D | ContentKind::Video => {
                            matches!(n.kind, NodeKind::Rect)
                        }
                        ContentKind::Text => matches!(n.kind, NodeKind::Text(_)),
                        ContentKind::Path => matches!(n.kind, NodeKind::Path(_)),
                    }
            })
        })
        .collect()
}

fn synthesize_tags(scene: &mut SceneTree, parent: NodeHandle, report: &mut ReconcileReport) {
    let children = scene.children(parent).to_vec();
    for child in children {
        let Some(node) = scene.node(child) else {
            continue;
        };
        if node.data.role.is_some() || read_binding(node).is_some() {
            continue;
        }
        let is_container = node.kind.is_container();
        let inferred = infer_kind(scene, node);
        if inferred == Some(ContentKind::Image) {
            let id = new_content_id(ContentKind::Image);
            tracing::debug!(node = %child, id = %id, "Synthesized tag for untagged raster");
            tag_content(scene, child, ContentKind::Image, &id);
            report.synthesized += 1;
        } else if is_container {
            synthesize_tags(scene, child, report);
        }
    }
}

fn remove_orphans(scene: &mut SceneTree, report: &mut ReconcileReport) {
    for handle in content_nodes(scene) {
        let Some(node) = scene.node(handle) else {
            continue;
        };
        if !matches!(node.kind, NodeKind::Group) {
            continue;
        }
        let Some(binding) = read_binding(node) else {
            continue;
        };
        let found = primitives(scene, handle, binding.kind);
        let Some(first) = found.first().copied() else {
            if matches!(
                binding.kind,
                ContentKind::Image | ContentKind::Model3D | ContentKind::Video
            ) {
                tracing::warn!(
                    kind = %binding.kind,
                    id = %binding.content_id,
                    "Removing content group without a primitive"
                );
                scene.remove(handle);
                report.removed_orphans += 1;
            }
            continue;
        };
        if binding.kind == ContentKind::Image && found.len() > 1 {
            let keep = found
                .iter()
                .copied()
                .find(|h| {
                    scene
                        .node(*h)
                        .and_then(Node::raster)
                        .is_some_and(|r| r.loaded)
                })
                .unwrap_or(first);
            for extra in found.into_iter().filter(|h| *h != keep) {
                tracing::warn!(id = %binding.content_id, "Removing duplicate raster");
                if scene.remove(extra) {
                    report.removed_duplicates += 1;
                }
            }
        }
    }
}

fn dedupe_ids(scene: &mut SceneTree, report: &mut ReconcileReport) {
    let mut seen: HashSet<(ContentKind, String)> = HashSet::new();
    for handle in content_nodes(scene) {
        let Some(binding) = scene.node(handle).and_then(read_binding) else {
            continue;
        };
        if seen.insert((binding.kind, binding.content_id.clone())) {
            continue;
        }
        let fresh = new_content_id(binding.kind);
        tracing::warn!(
            kind = %binding.kind,
            id = %binding.content_id,
            fresh = %fresh,
            "Duplicate content id, re-tagging"
        );
        tag_content(scene, handle, binding.kind, &fresh);
        let owned_helpers: Vec<NodeHandle> = scene
            .children(handle)
            .iter()
            .copied()
            .filter(|h| {
                scene.node(*h).is_some_and(|n| {
                    n.data.role.is_some()
                        && n.data.content_id.as_deref() == Some(binding.content_id.as_str())
                })
            })
            .collect();
        for helper in owned_helpers {
            if let Some(data) = scene.data_mut(helper) {
                data.content_id = Some(fresh.clone());
            }
        }
        seen.insert((binding.kind, fresh.clone()));
        report.retagged.push(Retag {
            kind: binding.kind,
            from: binding.content_id,
            to: fresh,
        });
    }
}

fn remove_stale_helpers(scene: &mut SceneTree, report: &mut ReconcileReport) {
    let live: HashSet<String> = content_nodes(scene)
        .into_iter()
        .filter_map(|h| scene.node(h).and_then(read_binding))
        .map(|b| b.content_id)
        .collect();
    let doomed: Vec<NodeHandle> = scene
        .all_content()
        .into_iter()
        .filter(|h| {
            let Some(node) = scene.node(*h) else {
                return false;
            };
            if !matches!(
                helper_role(node),
                Some(HelperRole::HitArea | HelperRole::SelectionOutline)
            ) {
                return false;
            }
            let owned = match node.data.content_id.as_deref() {
                Some(owner) => live.contains(owner),
                None => node
                    .parent()
                    .and_then(|p| scene.node(p))
                    .and_then(read_binding)
                    .is_some(),
            };
            !owned
        })
        .collect();
    for handle in doomed {
        if scene.remove(handle) {
            report.removed_helpers += 1;
        }
    }
    if report.removed_helpers > 0 {
        tracing::debug!(count = report.removed_helpers, "Removed stale helper nodes");
    }
}

/// Ensure `group` has a hit area matching `bounds`. Returns `true` if the
/// scene was changed.
fn repair_hit_area(scene: &mut SceneTree, group: NodeHandle, id: &str, bounds: Bounds) -> bool {
    if bounds.is_degenerate() {
        return false;
    }
    let existing = scene
        .children(group)
        .iter()
        .copied()
        .find(|h| scene.node(*h).and_then(helper_role) == Some(HelperRole::HitArea));
    match existing {
        Some(hit) if scene.bounds(hit).is_some_and(|b| b.approx_eq(&bounds)) => false,
        Some(hit) => scene.set_bounds(hit, bounds).is_ok(),
        None => scene
            .insert(
                group,
                NodeSpec::rect(bounds)
                    .with_data(helper_data(HelperRole::HitArea, Some(id)))
                    .with_name("hit-area"),
            )
            .is_ok(),
    }
}

fn merge<P: Payload>(
    derived: Vec<Instance<P>>,
    previous: &Rc<Vec<Instance<P>>>,
) -> Rc<Vec<Instance<P>>> {
    let by_id: HashMap<&str, &Instance<P>> =
        previous.iter().map(|i| (i.id.as_str(), i)).collect();
    let merged: Vec<Instance<P>> = derived
        .into_iter()
        .map(|mut entry| {
            if let Some(prev) = by_id.get(entry.id.as_str()) {
                if entry.bounds.is_degenerate() && !prev.bounds.is_degenerate() {
                    entry.bounds = prev.bounds;
                }
                entry.is_selected = prev.is_selected;
                entry.payload.inherit(&prev.payload);
            }
            entry
        })
        .collect();
    let unchanged = merged.len() == previous.len()
        && merged.iter().zip(previous.iter()).all(|(a, b)| a.same_as(b));
    if unchanged {
        Rc::clone(previous)
    } else {
        Rc::new(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{content_data, helper_data};
    use crate::config::ResolverConfig;
    use crate::construct::{place_image, place_model, place_text};
    use crate::scene::RasterData;
    use crate::signal::SignalBus;

    fn reconciler() -> Reconciler {
        Reconciler::new(AssetResolver::new(ResolverConfig::default()))
    }

    fn image(id: &str, bounds: Bounds) -> ImageInstance {
        Instance::new(
            id,
            bounds,
            ImagePayload {
                src: format!("projects/{id}.png"),
                ..ImagePayload::default()
            },
        )
    }

    fn raster_spec(source: &str) -> NodeSpec {
        NodeSpec::new(NodeKind::Raster(RasterData {
            source: source.to_string(),
            loaded: false,
            placement: None,
            natural_size: None,
        }))
    }

    #[test]
    fn test_uninitialized_scene_needs_recovery() {
        let mut scene = SceneTree::new();
        let (state, report) = reconciler().reconcile(&mut scene, &RegistryState::default());
        assert!(state.is_empty());
        assert_eq!(report.outcome, ReconcileOutcome::RecoveryNeeded);
    }

    #[test]
    fn test_derives_all_kinds() {
        let mut scene = SceneTree::new();
        let layer = scene.add_layer("l1", "Layer 1");
        let bounds = Bounds::new(0.0, 0.0, 100.0, 50.0);
        place_image(
            &mut scene,
            layer,
            &image("img-1", bounds),
            "projects/img-1.png",
            Some((100, 50)),
        )
        .expect("image");
        place_model(
            &mut scene,
            layer,
            &Instance::new(
                "model-1",
                bounds,
                ModelPayload {
                    model_url: "projects/m.glb".into(),
                    ..ModelPayload::default()
                },
            ),
        )
        .expect("model");
        place_text(
            &mut scene,
            layer,
            &Instance::new("text-1", bounds, TextPayload::default()),
        )
        .expect("text");

        let mut reconciler = reconciler();
        let (state, report) = reconciler.reconcile(&mut scene, &RegistryState::default());
        assert_eq!(report.outcome, ReconcileOutcome::Updated);
        assert_eq!(state.ids(ContentKind::Image), vec!["img-1"]);
        assert_eq!(state.ids(ContentKind::Model3D), vec!["model-1"]);
        assert_eq!(state.ids(ContentKind::Text), vec!["text-1"]);
        assert_eq!(state.images[0].bounds, bounds);
        assert_eq!(state.images[0].layer_id.as_deref(), Some("l1"));
        assert_eq!(state.models[0].payload.model_url, "projects/m.glb");
        assert_eq!(reconciler.index().len(), 3);
    }

    #[test]
    fn test_second_pass_returns_same_collections() {
        let mut scene = SceneTree::new();
        let layer = scene.add_layer("l1", "Layer 1");
        place_image(
            &mut scene,
            layer,
            &image("img-1", Bounds::new(0.0, 0.0, 10.0, 10.0)),
            "projects/img-1.png",
            Some((10, 10)),
        )
        .expect("image");
        let mut reconciler = reconciler();
        let (first, _) = reconciler.reconcile(&mut scene, &RegistryState::default());
        let (second, report) = reconciler.reconcile(&mut scene, &first);
        assert!(second.ptr_eq(&first));
        assert_eq!(report.outcome, ReconcileOutcome::Unchanged);
    }

    #[test]
    fn test_orphan_group_and_stale_helper_removed() {
        let mut scene = SceneTree::new();
        let layer = scene.add_layer("l1", "Layer 1");
        let orphan = scene
            .insert(layer, NodeSpec::group().with_data(content_data(ContentKind::Image, "img-x")))
            .expect("insert");
        let stale = scene
            .insert(
                layer,
                NodeSpec::rect(Bounds::new(0.0, 0.0, 5.0, 5.0))
                    .with_data(helper_data(HelperRole::SelectionOutline, Some("gone"))),
            )
            .expect("insert");

        let (state, report) = reconciler().reconcile(&mut scene, &RegistryState::default());
        assert!(state.is_empty());
        assert_eq!(report.removed_orphans, 1);
        assert_eq!(report.removed_helpers, 1);
        assert!(!scene.contains(orphan));
        assert!(!scene.contains(stale));
    }

    #[test]
    fn test_duplicate_rasters_keep_decoded_one() {
        let mut scene = SceneTree::new();
        let layer = scene.add_layer("l1", "Layer 1");
        let group = scene
            .insert(layer, NodeSpec::group().with_data(content_data(ContentKind::Image, "img-1")))
            .expect("insert");
        let first = scene.insert(group, raster_spec("projects/a.png")).expect("insert");
        let second = scene.insert(group, raster_spec("projects/a.png")).expect("insert");
        scene.finish_loading(second, 20, 20).expect("load");

        let (state, report) = reconciler().reconcile(&mut scene, &RegistryState::default());
        assert_eq!(report.removed_duplicates, 1);
        assert!(!scene.contains(first));
        assert!(scene.contains(second));
        assert_eq!(state.images.len(), 1);
        assert_eq!(state.images[0].bounds, Bounds::new(0.0, 0.0, 20.0, 20.0));
    }

    #[test]
    fn test_duplicate_ids_are_retagged() {
        let mut scene = SceneTree::new();
        let layer = scene.add_layer("l1", "Layer 1");
        let b = Bounds::new(0.0, 0.0, 10.0, 10.0);
        let text = Instance::new("t", b, TextPayload::default());
        place_text(&mut scene, layer, &text).expect("text");
        place_text(&mut scene, layer, &text).expect("text");

        let (state, report) = reconciler().reconcile(&mut scene, &RegistryState::default());
        let ids = state.ids(ContentKind::Text);
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], "t");
        assert_ne!(ids[1], "t");
        assert_eq!(report.retagged.len(), 1);
        assert_eq!(report.retagged[0].to, ids[1]);
    }

    #[test]
    fn test_untagged_raster_gets_tag() {
        let mut scene = SceneTree::new();
        let layer = scene.add_layer("l1", "Layer 1");
        let raster = scene.insert(layer, raster_spec("projects/legacy.png")).expect("insert");
        let (state, report) = reconciler().reconcile(&mut scene, &RegistryState::default());
        assert_eq!(report.synthesized, 1);
        assert_eq!(state.images.len(), 1);
        assert!(scene
            .node(raster)
            .and_then(read_binding)
            .is_some_and(|b| b.content_id == state.images[0].id));
    }

    #[test]
    fn test_pending_load_keeps_bounds_of_record_and_updates_in_place() {
        let mut scene = SceneTree::new();
        let layer = scene.add_layer("l1", "Layer 1");
        let bounds = Bounds::new(40.0, 40.0, 300.0, 200.0);
        place_image(&mut scene, layer, &image("img-1", bounds), "projects/img-1.png", None)
            .expect("image");

        let mut previous = RegistryState::default();
        let mut selected = image("img-1", bounds);
        selected.is_selected = true;
        previous.images = Rc::new(vec![selected]);

        let mut reconciler = reconciler();
        let (state, report) = reconciler.reconcile(&mut scene, &previous);
        assert_eq!(report.pending_loads.len(), 1);
        assert_eq!(state.images[0].bounds, bounds);
        assert!(state.images[0].is_selected);

        let mut registry = InstanceRegistry::new(SignalBus::default());
        registry.apply(state);
        let raster = report.pending_loads[0];
        scene.finish_loading(raster, 600, 400).expect("load");
        assert!(reconciler.on_raster_loaded(&mut scene, &mut registry, raster));
        let live = registry.images();
        assert_eq!(live[0].bounds, bounds);
        assert_eq!(live[0].payload.natural_width, Some(600));
        assert!(!reconciler.on_raster_loaded(&mut scene, &mut registry, raster));
    }

    #[test]
    fn test_placeholder_subtree_ignored() {
        let mut scene = SceneTree::new();
        let layer = scene.add_layer("l1", "Layer 1");
        let placeholder = scene
            .insert(
                layer,
                NodeSpec::group().with_data(helper_data(HelperRole::Placeholder, Some("p1"))),
            )
            .expect("insert");
        scene.insert(placeholder, raster_spec("blob:x")).expect("insert");
        let (state, report) = reconciler().reconcile(&mut scene, &RegistryState::default());
        assert!(state.is_empty());
        assert_eq!(report.synthesized, 0);
    }
}
