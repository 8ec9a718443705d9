//! Scene construction for every content kind.
//!
//! Uploads, paste, recovery and history all create scene nodes through these
//! functions so that every item gets the same structure: a tagged content
//! group (or node), its drawable primitive and a hit-area helper.

use std::collections::BTreeMap;

use crate::binding::{
    content_data, helper_data, ContentKind, HelperRole, ATTR_FILE_NAME, ATTR_FORMAT,
    ATTR_MODEL_URL, ATTR_PENDING_UPLOAD, ATTR_POSTER, ATTR_REMOTE_URL, ATTR_SRC,
    ATTR_STORAGE_KEY,
};
use crate::error::{SyncError, SyncResult};
use crate::geometry::Bounds;
use crate::model::{ImageInstance, ModelInstance, TextInstance, VideoInstance};
use crate::scene::{
    NodeData, NodeHandle, NodeKind, NodeSpec, PathData, RasterData, SceneTree, TextData,
};
use crate::snapshot::PathSnapshot;

/// Pick the layer for new content.
///
/// A known `layer_id` wins; otherwise the topmost layer is used.
///
/// # Errors
///
/// Returns [`SyncError::SceneNotReady`] if the scene has no layers.
pub fn resolve_layer(scene: &SceneTree, layer_id: Option<&str>) -> SyncResult<NodeHandle> {
    if let Some(id) = layer_id {
        if let Some(layer) = scene.layer_by_id(id) {
            return Ok(layer);
        }
        tracing::debug!(layer_id = id, "Layer missing, using topmost layer");
    }
    scene.layers().last().copied().ok_or(SyncError::SceneNotReady)
}

fn set_attr(attrs: &mut BTreeMap<String, String>, key: &str, value: Option<&str>) {
    match value {
        Some(v) if !v.is_empty() => {
            attrs.insert(key.to_string(), v.to_string());
        }
        _ => {
            attrs.remove(key);
        }
    }
}

fn usable(bounds: Bounds) -> Option<Bounds> {
    (!bounds.is_degenerate()).then_some(bounds)
}

fn add_hit_area(
    scene: &mut SceneTree,
    group: NodeHandle,
    owner: &str,
    bounds: Option<Bounds>,
) -> SyncResult<()> {
    if let Some(bounds) = bounds {
        let mut spec =
            NodeSpec::rect(bounds).with_data(helper_data(HelperRole::HitArea, Some(owner)));
        spec.name = Some("hit-area".to_string());
        scene.insert(group, spec)?;
    }
    Ok(())
}

/// Image group: tagged group, raster child, hit area.
///
/// `source` is what the raster renders. `decoded` marks the raster as already
/// decoded with that natural size, for local previews the host has in memory.
///
/// # Errors
///
/// Returns an error if `layer` is stale.
pub fn place_image(
    scene: &mut SceneTree,
    layer: NodeHandle,
    instance: &ImageInstance,
    source: &str,
    decoded: Option<(u32, u32)>,
) -> SyncResult<NodeHandle> {
    let payload = &instance.payload;
    let mut data = content_data(ContentKind::Image, &instance.id);
    set_attr(&mut data.attrs, ATTR_STORAGE_KEY, payload.storage_key.as_deref());
    set_attr(&mut data.attrs, ATTR_REMOTE_URL, payload.remote_url.as_deref());
    set_attr(&mut data.attrs, ATTR_FILE_NAME, payload.file_name.as_deref());
    if payload.pending_upload {
        data.attrs.insert(ATTR_PENDING_UPLOAD.to_string(), "true".to_string());
    }

    let mut group_spec = NodeSpec::group().with_data(data);
    group_spec.visible = instance.visible;
    let group = scene.insert(layer, group_spec)?;

    let placement = usable(instance.bounds);
    let raster = scene.insert(
        group,
        NodeSpec::new(NodeKind::Raster(RasterData {
            source: source.to_string(),
            loaded: false,
            placement,
            natural_size: None,
        })),
    )?;
    if let Some((w, h)) = decoded {
        scene.finish_loading(raster, w, h)?;
    }
    let hit_bounds = scene.bounds(raster).or(placement);
    add_hit_area(scene, group, &instance.id, hit_bounds)?;
    Ok(group)
}

/// 3D model card: tagged group, frame rect, hit area.
///
/// # Errors
///
/// Returns an error if `layer` is stale.
pub fn place_model(
    scene: &mut SceneTree,
    layer: NodeHandle,
    instance: &ModelInstance,
) -> SyncResult<NodeHandle> {
    let payload = &instance.payload;
    let mut data = content_data(ContentKind::Model3D, &instance.id);
    set_attr(&mut data.attrs, ATTR_MODEL_URL, Some(&payload.model_url));
    set_attr(&mut data.attrs, ATTR_FILE_NAME, payload.file_name.as_deref());
    set_attr(&mut data.attrs, ATTR_FORMAT, payload.format.as_deref());
    place_framed(scene, layer, &instance.id, instance.bounds, instance.visible, data)
}

/// Video card: tagged group, frame rect, hit area.
///
/// # Errors
///
/// Returns an error if `layer` is stale.
pub fn place_video(
    scene: &mut SceneTree,
    layer: NodeHandle,
    instance: &VideoInstance,
) -> SyncResult<NodeHandle> {
    let payload = &instance.payload;
    let mut data = content_data(ContentKind::Video, &instance.id);
    set_attr(&mut data.attrs, ATTR_SRC, Some(&payload.src));
    set_attr(&mut data.attrs, ATTR_STORAGE_KEY, payload.storage_key.as_deref());
    set_attr(&mut data.attrs, ATTR_REMOTE_URL, payload.remote_url.as_deref());
    set_attr(&mut data.attrs, ATTR_POSTER, payload.poster.as_deref());
    if payload.pending_upload {
        data.attrs.insert(ATTR_PENDING_UPLOAD.to_string(), "true".to_string());
    }
    place_framed(scene, layer, &instance.id, instance.bounds, instance.visible, data)
}

fn place_framed(
    scene: &mut SceneTree,
    layer: NodeHandle,
    id: &str,
    bounds: Bounds,
    visible: bool,
    data: NodeData,
) -> SyncResult<NodeHandle> {
    let mut group_spec = NodeSpec::group().with_data(data);
    group_spec.visible = visible;
    let group = scene.insert(layer, group_spec)?;
    scene.insert(group, NodeSpec::rect(bounds).with_name("frame"))?;
    add_hit_area(scene, group, id, usable(bounds))?;
    Ok(group)
}

/// Text block: a single tagged text node.
///
/// # Errors
///
/// Returns an error if `layer` is stale.
pub fn place_text(
    scene: &mut SceneTree,
    layer: NodeHandle,
    instance: &TextInstance,
) -> SyncResult<NodeHandle> {
    let payload = &instance.payload;
    let mut spec = NodeSpec::new(NodeKind::Text(TextData {
        content: payload.content.clone(),
        font_size: payload.font_size,
        color: payload.color.clone(),
        font_family: payload.font_family.clone(),
    }))
    .with_bounds(instance.bounds)
    .with_data(content_data(ContentKind::Text, &instance.id));
    spec.visible = instance.visible;
    scene.insert(layer, spec)
}

/// Freehand path: a single tagged path node.
///
/// # Errors
///
/// Returns an error if `layer` is stale.
pub fn place_path(
    scene: &mut SceneTree,
    layer: NodeHandle,
    path: &PathSnapshot,
) -> SyncResult<NodeHandle> {
    let spec = NodeSpec::new(NodeKind::Path(PathData {
        path: path.path_data.clone(),
        stroke_width: path.stroke_width,
        stroke_color: path.stroke_color.clone(),
        fill_color: path.fill_color.clone(),
    }))
    .with_bounds(path.bounds)
    .with_data(content_data(ContentKind::Path, &path.id));
    scene.insert(layer, spec)
}

/// Placeholder group for content that has not materialized yet.
///
/// The group carries the placeholder role and its id; everything under it is
/// ignored by hit-testing and reconciliation.
///
/// # Errors
///
/// Returns an error if `layer` is stale.
pub fn draw_placeholder(
    scene: &mut SceneTree,
    layer: NodeHandle,
    id: &str,
    bounds: Bounds,
) -> SyncResult<NodeHandle> {
    let group = scene.insert(
        layer,
        NodeSpec::group()
            .with_data(helper_data(HelperRole::Placeholder, Some(id)))
            .with_name("placeholder"),
    )?;
    scene.insert(group, NodeSpec::rect(bounds).with_name("placeholder-frame"))?;
    Ok(group)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{helper_role, read_binding};
    use crate::model::{ImagePayload, Instance, ModelPayload};

    #[test]
    fn test_image_group_structure() {
        let mut scene = SceneTree::new();
        let layer = scene.add_layer("l1", "Layer 1");
        let instance = Instance::new(
            "img-1",
            Bounds::new(10.0, 10.0, 200.0, 100.0),
            ImagePayload {
                src: "blob:local".into(),
                pending_upload: true,
                ..ImagePayload::default()
            },
        );
        let group = place_image(&mut scene, layer, &instance, "blob:local", Some((400, 200)))
            .expect("place");

        let binding = read_binding(scene.node(group).expect("group")).expect("binding");
        assert_eq!(binding.kind, ContentKind::Image);
        let node = scene.node(group).expect("group");
        assert_eq!(node.data.attrs.get(ATTR_PENDING_UPLOAD).map(String::as_str), Some("true"));

        let children = scene.children(group).to_vec();
        assert_eq!(children.len(), 2);
        let raster = scene.node(children[0]).and_then(|n| n.raster().cloned()).expect("raster");
        assert!(raster.loaded);
        assert_eq!(scene.bounds(children[0]), Some(instance.bounds));
        assert_eq!(
            helper_role(scene.node(children[1]).expect("hit")),
            Some(HelperRole::HitArea)
        );
    }

    #[test]
    fn test_undecoded_image_without_bounds_has_no_hit_area() {
        let mut scene = SceneTree::new();
        let layer = scene.add_layer("l1", "Layer 1");
        let instance = Instance::new("img-2", Bounds::ZERO, ImagePayload::default());
        let group =
            place_image(&mut scene, layer, &instance, "projects/x.png", None).expect("place");
        assert_eq!(scene.children(group).len(), 1);
        assert_eq!(scene.bounds(group), None);
    }

    #[test]
    fn test_model_card_has_frame() {
        let mut scene = SceneTree::new();
        let layer = scene.add_layer("l1", "Layer 1");
        let instance = Instance::new(
            "model-1",
            Bounds::new(0.0, 0.0, 300.0, 300.0),
            ModelPayload {
                model_url: "projects/chair.glb".into(),
                format: Some("glb".into()),
                ..ModelPayload::default()
            },
        );
        let group = place_model(&mut scene, layer, &instance).expect("place");
        assert_eq!(scene.bounds(group), Some(instance.bounds));
        assert_eq!(
            scene.node(group).and_then(|n| n.data.attrs.get(ATTR_MODEL_URL).cloned()),
            Some("projects/chair.glb".to_string())
        );
    }

    #[test]
    fn test_resolve_layer_fallback() {
        let mut scene = SceneTree::new();
        assert!(matches!(resolve_layer(&scene, None), Err(SyncError::SceneNotReady)));
        let a = scene.add_layer("a", "A");
        let b = scene.add_layer("b", "B");
        assert_eq!(resolve_layer(&scene, Some("a")).expect("layer"), a);
        assert_eq!(resolve_layer(&scene, Some("gone")).expect("layer"), b);
    }
}
