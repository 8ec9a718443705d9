//! Copy and paste through content-agnostic snapshots.
//!
//! Capture reads the registry (and the scene, for paths) into a [`Snapshot`];
//! restore recreates every record through the shared construction path with
//! fresh ids, shifted by an offset, and leaves the new items selected.

use crate::asset::{AssetReference, AssetResolver};
use crate::binding::{read_binding, ContentKind};
use crate::construct::{
    place_image, place_model, place_path, place_text, place_video, resolve_layer,
};
use crate::error::{SyncError, SyncResult};
use crate::model::new_content_id;
use crate::reconcile::content_nodes;
use crate::registry::{InstanceRegistry, RegistryState};
use crate::scene::{NodeHandle, NodeKind, SceneTree};
use crate::snapshot::{
    ImageAssetSnapshot, ModelAssetSnapshot, PathSnapshot, SkippedItem, Snapshot, TextAssetSnapshot,
    VideoAssetSnapshot,
};

/// Outcome of a restore.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreReport {
    /// Newly created items, in snapshot order.
    pub created: Vec<(ContentKind, String)>,
    /// Records that could not be restored.
    pub skipped: Vec<SkippedItem>,
}

impl RestoreReport {
    /// Ids created for one kind.
    #[must_use]
    pub fn ids(&self, kind: ContentKind) -> Vec<&str> {
        self.created
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, id)| id.as_str())
            .collect()
    }
}

fn skip(skipped: &mut Vec<SkippedItem>, kind: ContentKind, id: &str, reason: &str) {
    tracing::warn!(kind = %kind, id = %id, "Skipping item: {}", reason);
    skipped.push(SkippedItem {
        kind,
        id: Some(id.to_string()),
        reason: reason.to_string(),
    });
}

fn best_reference<'a>(
    resolver: &AssetResolver,
    storage_key: Option<&'a str>,
    remote_url: Option<&'a str>,
    src: &'a str,
) -> Option<AssetReference> {
    resolver.prefer(storage_key.into_iter().chain(remote_url).chain([src]))
}

/// Capture `selection` into a snapshot.
///
/// Images and videos record the best available reference (storage key, then
/// remote URL, then the rendered source). Items with no resolvable reference
/// or no longer present are skipped with a warning.
#[must_use]
pub fn capture(
    registry: &RegistryState,
    scene: &SceneTree,
    selection: &[(ContentKind, String)],
    resolver: &AssetResolver,
) -> (Snapshot, Vec<SkippedItem>) {
    let mut snapshot = Snapshot::default();
    let mut skipped = Vec::new();

    for (kind, id) in selection {
        match kind {
            ContentKind::Image => {
                let Some(instance) = registry.images.iter().find(|i| &i.id == id) else {
                    skip(&mut skipped, *kind, id, "not in registry");
                    continue;
                };
                let p = &instance.payload;
                let storage_key = p.storage_key.as_deref();
                match best_reference(resolver, storage_key, p.remote_url.as_deref(), &p.src) {
                    Some(reference) => snapshot
                        .images
                        .push(ImageAssetSnapshot::capture(instance, reference.value)),
                    None => skip(&mut skipped, *kind, id, "no resolvable reference"),
                }
            }
            ContentKind::Video => {
                let Some(instance) = registry.videos.iter().find(|i| &i.id == id) else {
                    skip(&mut skipped, *kind, id, "not in registry");
                    continue;
                };
                let p = &instance.payload;
                let storage_key = p.storage_key.as_deref();
                match best_reference(resolver, storage_key, p.remote_url.as_deref(), &p.src) {
                    Some(reference) => snapshot
                        .videos
                        .push(VideoAssetSnapshot::capture(instance, reference.value)),
                    None => skip(&mut skipped, *kind, id, "no resolvable reference"),
                }
            }
            ContentKind::Model3D => match registry.models.iter().find(|i| &i.id == id) {
                Some(instance) if resolver.classify(&instance.payload.model_url).is_some() => {
                    snapshot.models.push(ModelAssetSnapshot::capture(instance));
                }
                Some(_) => skip(&mut skipped, *kind, id, "no resolvable reference"),
                None => skip(&mut skipped, *kind, id, "not in registry"),
            },
            ContentKind::Text => match registry.texts.iter().find(|i| &i.id == id) {
                Some(instance) => snapshot.texts.push(TextAssetSnapshot::capture(instance)),
                None => skip(&mut skipped, *kind, id, "not in registry"),
            },
            ContentKind::Path => match capture_path(scene, id) {
                Some(path) => snapshot.paths.push(path),
                None => skip(&mut skipped, *kind, id, "not in scene"),
            },
        }
    }

    tracing::debug!(items = snapshot.len(), skipped = skipped.len(), "Captured snapshot");
    (snapshot, skipped)
}

fn find_path(scene: &SceneTree, id: &str) -> Option<NodeHandle> {
    content_nodes(scene).into_iter().find(|h| {
        scene
            .node(*h)
            .and_then(read_binding)
            .is_some_and(|b| b.kind == ContentKind::Path && b.content_id == id)
    })
}

/// Every path in the scene, as snapshot records.
#[must_use]
pub fn capture_all_paths(scene: &SceneTree) -> Vec<PathSnapshot> {
    content_nodes(scene)
        .into_iter()
        .filter_map(|h| scene.node(h).and_then(read_binding))
        .filter(|b| b.kind == ContentKind::Path)
        .filter_map(|b| capture_path(scene, &b.content_id))
        .collect()
}

fn capture_path(scene: &SceneTree, id: &str) -> Option<PathSnapshot> {
    let handle = find_path(scene, id)?;
    let node = scene.node(handle)?;
    let NodeKind::Path(path) = &node.kind else {
        return None;
    };
    Some(PathSnapshot {
        id: id.to_string(),
        bounds: scene.bounds(handle)?,
        layer_id: scene
            .layer_of(handle)
            .and_then(|l| scene.node(l))
            .and_then(|l| l.data.layer_id.clone()),
        path_data: path.path.clone(),
        stroke_width: path.stroke_width,
        stroke_color: path.stroke_color.clone(),
        fill_color: path.fill_color.clone(),
    })
}

fn layer_for(
    scene: &SceneTree,
    layer_id: Option<&str>,
) -> SyncResult<(NodeHandle, Option<String>)> {
    let layer = resolve_layer(scene, layer_id)?;
    let id = scene.node(layer).and_then(|n| n.data.layer_id.clone());
    Ok((layer, id))
}

/// Recreate every record of `snapshot` under fresh ids, shifted by `offset`.
///
/// Each item goes through the same construction path as uploads and drawing.
/// Records whose reference cannot be resolved are skipped with a warning and
/// their siblings are still restored. The new items end up as the only
/// selection.
///
/// # Errors
///
/// Returns [`SyncError::SceneNotReady`] if the scene has no layers.
pub fn restore(
    scene: &mut SceneTree,
    registry: &mut InstanceRegistry,
    snapshot: &Snapshot,
    offset: (f32, f32),
    resolver: &AssetResolver,
) -> SyncResult<RestoreReport> {
    if !scene.is_ready() {
        return Err(SyncError::SceneNotReady);
    }
    let (dx, dy) = offset;
    let mut report = RestoreReport::default();

    for record in &snapshot.images {
        let Some(reference) = best_reference(
            resolver,
            record.storage_key.as_deref(),
            record.remote_url.as_deref(),
            &record.src,
        ) else {
            skip(&mut report.skipped, ContentKind::Image, &record.id, "unresolvable reference");
            continue;
        };
        let (layer, layer_id) = layer_for(scene, record.layer_id.as_deref())?;
        let id = new_content_id(ContentKind::Image);
        let mut instance = record.instance(&id);
        instance.bounds = record.bounds.translated(dx, dy);
        instance.payload.src = reference.value;
        instance.layer_id = layer_id;
        instance.is_selected = true;
        place_image(scene, layer, &instance, &resolver.to_renderable(&instance.payload.src), None)?;
        registry.upsert(instance);
        report.created.push((ContentKind::Image, id));
    }

    for record in &snapshot.models {
        if resolver.classify(&record.model_url).is_none() {
            skip(&mut report.skipped, ContentKind::Model3D, &record.id, "unresolvable reference");
            continue;
        }
        let (layer, layer_id) = layer_for(scene, record.layer_id.as_deref())?;
        let id = new_content_id(ContentKind::Model3D);
        let mut instance = record.instance(&id);
        instance.bounds = record.bounds.translated(dx, dy);
        instance.layer_id = layer_id;
        instance.is_selected = true;
        place_model(scene, layer, &instance)?;
        registry.upsert(instance);
        report.created.push((ContentKind::Model3D, id));
    }

    for record in &snapshot.texts {
        let (layer, layer_id) = layer_for(scene, record.layer_id.as_deref())?;
        let id = new_content_id(ContentKind::Text);
        let mut instance = record.instance(&id);
        instance.bounds = record.bounds.translated(dx, dy);
        instance.layer_id = layer_id;
        instance.is_selected = true;
        place_text(scene, layer, &instance)?;
        registry.upsert(instance);
        report.created.push((ContentKind::Text, id));
    }

    for record in &snapshot.videos {
        let Some(reference) = best_reference(
            resolver,
            record.storage_key.as_deref(),
            record.remote_url.as_deref(),
            &record.src,
        ) else {
            skip(&mut report.skipped, ContentKind::Video, &record.id, "unresolvable reference");
            continue;
        };
        let (layer, layer_id) = layer_for(scene, record.layer_id.as_deref())?;
        let id = new_content_id(ContentKind::Video);
        let mut instance = record.instance(&id);
        instance.bounds = record.bounds.translated(dx, dy);
        instance.payload.src = reference.value;
        instance.layer_id = layer_id;
        instance.is_selected = true;
        place_video(scene, layer, &instance)?;
        registry.upsert(instance);
        report.created.push((ContentKind::Video, id));
    }

    for record in &snapshot.paths {
        let (layer, _) = layer_for(scene, record.layer_id.as_deref())?;
        let id = new_content_id(ContentKind::Path);
        let path = PathSnapshot {
            id: id.clone(),
            bounds: record.bounds.translated(dx, dy),
            ..record.clone()
        };
        place_path(scene, layer, &path)?;
        report.created.push((ContentKind::Path, id));
    }

    let selection: Vec<(ContentKind, String)> = report
        .created
        .iter()
        .filter(|(kind, _)| *kind != ContentKind::Path)
        .cloned()
        .collect();
    registry.select_only(&selection);

    tracing::info!(
        created = report.created.len(),
        skipped = report.skipped.len(),
        "Restored snapshot"
    );
    Ok(report)
}

/// Last copied snapshot plus a paste counter for cascading offsets.
#[derive(Debug, Clone, Default)]
pub struct Clipboard {
    snapshot: Option<Snapshot>,
    pastes: u32,
}

impl Clipboard {
    /// Create an empty clipboard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the clipboard contents.
    pub fn store(&mut self, snapshot: Snapshot) {
        self.snapshot = Some(snapshot);
        self.pastes = 0;
    }

    /// Current contents.
    #[must_use]
    pub const fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    /// Offset for the next paste: `base` for the first, `2 * base` for the
    /// second and so on, so repeated pastes cascade instead of stacking.
    pub fn next_offset(&mut self, base: (f32, f32)) -> (f32, f32) {
        self.pastes += 1;
        #[allow(clippy::cast_precision_loss)]
        let n = self.pastes as f32;
        (base.0 * n, base.1 * n)
    }

    /// Forget the contents.
    pub fn clear(&mut self) {
        self.snapshot = None;
        self.pastes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolverConfig;
    use crate::geometry::Bounds;
    use crate::model::{ImagePayload, Instance, TextPayload};
    use crate::signal::SignalBus;

    fn resolver() -> AssetResolver {
        AssetResolver::new(ResolverConfig::default())
    }

    fn image_record(id: &str, src: &str, bounds: Bounds) -> ImageAssetSnapshot {
        ImageAssetSnapshot::capture(
            &Instance::new(
                id,
                bounds,
                ImagePayload {
                    src: src.to_string(),
                    ..ImagePayload::default()
                },
            ),
            src.to_string(),
        )
    }

    #[test]
    fn test_capture_prefers_storage_key() {
        let mut state = RegistryState::default();
        state.images = std::rc::Rc::new(vec![Instance::new(
            "img-1",
            Bounds::new(0.0, 0.0, 10.0, 10.0),
            ImagePayload {
                src: "blob:local".into(),
                storage_key: Some("projects/p1/a.png".into()),
                ..ImagePayload::default()
            },
        )]);
        let (snapshot, skipped) = capture(
            &state,
            &SceneTree::new(),
            &[(ContentKind::Image, "img-1".into()), (ContentKind::Text, "gone".into())],
            &resolver(),
        );
        assert_eq!(snapshot.images[0].src, "projects/p1/a.png");
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].id.as_deref(), Some("gone"));
    }

    #[test]
    fn test_restore_offsets_and_selects() {
        let mut scene = SceneTree::new();
        scene.add_layer("l1", "Layer 1");
        let mut registry = InstanceRegistry::new(SignalBus::default());
        let mut text = Instance::new(
            "text-1",
            Bounds::new(5.0, 5.0, 50.0, 20.0),
            TextPayload::default(),
        );
        text.payload.content = "hi".into();
        let snapshot = Snapshot {
            images: vec![image_record(
                "img-1",
                "projects/a.png",
                Bounds::new(10.0, 20.0, 100.0, 50.0),
            )],
            texts: vec![TextAssetSnapshot::capture(&text)],
            ..Snapshot::default()
        };

        let report = restore(&mut scene, &mut registry, &snapshot, (32.0, 32.0), &resolver())
            .expect("restore");
        assert_eq!(report.created.len(), 2);
        let new_image = report.ids(ContentKind::Image)[0].to_string();
        assert_ne!(new_image, "img-1");
        let restored = registry.get::<ImagePayload>(&new_image).expect("image");
        assert_eq!(restored.bounds, Bounds::new(42.0, 52.0, 100.0, 50.0));
        assert!(restored.is_selected);
        assert_eq!(restored.layer_id.as_deref(), Some("l1"));
        assert_eq!(registry.state().selected().len(), 2);
    }

    #[test]
    fn test_restore_skips_unresolvable_items() {
        let mut scene = SceneTree::new();
        scene.add_layer("l1", "Layer 1");
        let mut registry = InstanceRegistry::new(SignalBus::default());
        let snapshot = Snapshot {
            images: vec![
                image_record("img-1", "projects/a.png", Bounds::new(0.0, 0.0, 10.0, 10.0)),
                image_record("img-2", "not a reference", Bounds::new(0.0, 0.0, 10.0, 10.0)),
            ],
            ..Snapshot::default()
        };
        let report = restore(&mut scene, &mut registry, &snapshot, (0.0, 0.0), &resolver())
            .expect("restore");
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].id.as_deref(), Some("img-2"));
        assert_eq!(registry.images().len(), 1);
    }

    #[test]
    fn test_path_roundtrip_keeps_style() {
        let mut scene = SceneTree::new();
        let layer = scene.add_layer("l1", "Layer 1");
        let original = PathSnapshot {
            id: "path-1".into(),
            bounds: Bounds::new(0.0, 0.0, 40.0, 40.0),
            layer_id: Some("l1".into()),
            path_data: "M0 0 L40 40".into(),
            stroke_width: 3.0,
            stroke_color: Some("#ff0000".into()),
            fill_color: Some("#00ff00".into()),
        };
        place_path(&mut scene, layer, &original).expect("place");

        let (snapshot, skipped) = capture(
            &RegistryState::default(),
            &scene,
            &[(ContentKind::Path, "path-1".into())],
            &resolver(),
        );
        assert!(skipped.is_empty());
        assert_eq!(snapshot.paths, vec![original.clone()]);

        let mut registry = InstanceRegistry::new(SignalBus::default());
        let report = restore(&mut scene, &mut registry, &snapshot, (10.0, 0.0), &resolver())
            .expect("restore");
        let new_id = report.ids(ContentKind::Path)[0].to_string();
        let copy = capture_path(&scene, &new_id).expect("copy");
        assert_eq!(copy.bounds, Bounds::new(10.0, 0.0, 40.0, 40.0));
        assert_eq!(copy.stroke_width, 3.0);
        assert_eq!(copy.fill_color.as_deref(), Some("#00ff00"));
        assert_eq!(copy.layer_id.as_deref(), Some("l1"));
    }

    #[test]
    fn test_restore_requires_ready_scene() {
        let mut scene = SceneTree::new();
        let mut registry = InstanceRegistry::new(SignalBus::default());
        let result = restore(
            &mut scene,
            &mut registry,
            &Snapshot::default(),
            (0.0, 0.0),
            &resolver(),
        );
        assert!(matches!(result, Err(SyncError::SceneNotReady)));
    }

    #[test]
    fn test_cascading_offsets() {
        let mut clipboard = Clipboard::new();
        clipboard.store(Snapshot::default());
        assert_eq!(clipboard.next_offset((32.0, 32.0)), (32.0, 32.0));
        assert_eq!(clipboard.next_offset((32.0, 32.0)), (64.0, 64.0));
        clipboard.store(Snapshot::default());
        assert_eq!(clipboard.next_offset((32.0, 32.0)), (32.0, 32.0));
    }
}
