//! Plain, content-agnostic records of canvas content.
//!
//! A [`Snapshot`] holds no live node handles and is enough to recreate every
//! item it lists. The JSON shape is shared by the clipboard and by persisted
//! project content:
//!
//! ```json
//! { "images": [...], "models": [...], "texts": [...], "videos": [...], "paths": [...] }
//! ```

use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::binding::ContentKind;
use crate::error::SyncResult;
use crate::geometry::Bounds;
use crate::model::{
    ImageInstance, ImagePayload, Instance, ModelInstance, ModelPayload, TextInstance, TextPayload,
    VideoInstance, VideoPayload,
};
use crate::registry::RegistryState;

const fn default_visible() -> bool {
    true
}

/// Image record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAssetSnapshot {
    /// Content id at capture time.
    pub id: String,
    /// Bounds.
    pub bounds: Bounds,
    /// Layer.
    #[serde(default)]
    pub layer_id: Option<String>,
    /// Visibility.
    #[serde(default = "default_visible")]
    pub visible: bool,
    /// Best available reference.
    pub src: String,
    /// Storage key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<String>,
    /// Remote URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    /// File name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Decoded width.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub natural_width: Option<u32>,
    /// Decoded height.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub natural_height: Option<u32>,
}

impl ImageAssetSnapshot {
    /// Record an instance, rendering from `src`.
    #[must_use]
    pub fn capture(instance: &ImageInstance, src: String) -> Self {
        let p = &instance.payload;
        Self {
            id: instance.id.clone(),
            bounds: instance.bounds,
            layer_id: instance.layer_id.clone(),
            visible: instance.visible,
            src,
            storage_key: p.storage_key.clone(),
            remote_url: p.remote_url.clone(),
            file_name: p.file_name.clone(),
            natural_width: p.natural_width,
            natural_height: p.natural_height,
        }
    }

    /// Recreate an instance under `id`.
    #[must_use]
    pub fn instance(&self, id: &str) -> ImageInstance {
        let mut instance = Instance::new(
            id,
            self.bounds,
            ImagePayload {
                src: self.src.clone(),
                storage_key: self.storage_key.clone(),
                remote_url: self.remote_url.clone(),
                pending_upload: false,
                natural_width: self.natural_width,
                natural_height: self.natural_height,
                file_name: self.file_name.clone(),
            },
        );
        instance.layer_id.clone_from(&self.layer_id);
        instance.visible = self.visible;
        instance
    }
}

/// 3D model record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelAssetSnapshot {
    /// Content id at capture time.
    pub id: String,
    /// Bounds.
    pub bounds: Bounds,
    /// Layer.
    #[serde(default)]
    pub layer_id: Option<String>,
    /// Visibility.
    #[serde(default = "default_visible")]
    pub visible: bool,
    /// Model location.
    pub model_url: String,
    /// File name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Model format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl ModelAssetSnapshot {
    /// Record an instance.
    #[must_use]
    pub fn capture(instance: &ModelInstance) -> Self {
        Self {
            id: instance.id.clone(),
            bounds: instance.bounds,
            layer_id: instance.layer_id.clone(),
            visible: instance.visible,
            model_url: instance.payload.model_url.clone(),
            file_name: instance.payload.file_name.clone(),
            format: instance.payload.format.clone(),
        }
    }

    /// Recreate an instance under `id`.
    #[must_use]
    pub fn instance(&self, id: &str) -> ModelInstance {
        let mut instance = Instance::new(
            id,
            self.bounds,
            ModelPayload {
                model_url: self.model_url.clone(),
                file_name: self.file_name.clone(),
                format: self.format.clone(),
            },
        );
        instance.layer_id.clone_from(&self.layer_id);
        instance.visible = self.visible;
        instance
    }
}

/// Text record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextAssetSnapshot {
    /// Content id at capture time.
    pub id: String,
    /// Bounds.
    pub bounds: Bounds,
    /// Layer.
    #[serde(default)]
    pub layer_id: Option<String>,
    /// Visibility.
    #[serde(default = "default_visible")]
    pub visible: bool,
    /// Text content.
    pub content: String,
    /// Font size.
    pub font_size: f32,
    /// Colour.
    pub color: String,
    /// Font family.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_family: Option<String>,
}

impl TextAssetSnapshot {
    /// Record an instance.
    #[must_use]
    pub fn capture(instance: &TextInstance) -> Self {
        let p = &instance.payload;
        Self {
            id: instance.id.clone(),
            bounds: instance.bounds,
            layer_id: instance.layer_id.clone(),
            visible: instance.visible,
            content: p.content.clone(),
            font_size: p.font_size,
            color: p.color.clone(),
            font_family: p.font_family.clone(),
        }
    }

    /// Recreate an instance under `id`.
    #[must_use]
    pub fn instance(&self, id: &str) -> TextInstance {
        let mut instance = Instance::new(
            id,
            self.bounds,
            TextPayload {
                content: self.content.clone(),
                font_size: self.font_size,
                color: self.color.clone(),
                font_family: self.font_family.clone(),
            },
        );
        instance.layer_id.clone_from(&self.layer_id);
        instance.visible = self.visible;
        instance
    }
}

/// Video record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoAssetSnapshot {
    /// Content id at capture time.
    pub id: String,
    /// Bounds.
    pub bounds: Bounds,
    /// Layer.
    #[serde(default)]
    pub layer_id: Option<String>,
    /// Visibility.
    #[serde(default = "default_visible")]
    pub visible: bool,
    /// Best available reference.
    pub src: String,
    /// Storage key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<String>,
    /// Remote URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    /// Poster frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poster: Option<String>,
}

impl VideoAssetSnapshot {
    /// Record an instance, playing from `src`.
    #[must_use]
    pub fn capture(instance: &VideoInstance, src: String) -> Self {
        let p = &instance.payload;
        Self {
            id: instance.id.clone(),
            bounds: instance.bounds,
            layer_id: instance.layer_id.clone(),
            visible: instance.visible,
            src,
            storage_key: p.storage_key.clone(),
            remote_url: p.remote_url.clone(),
            poster: p.poster.clone(),
        }
    }

    /// Recreate an instance under `id`.
    #[must_use]
    pub fn instance(&self, id: &str) -> VideoInstance {
        let mut instance = Instance::new(
            id,
            self.bounds,
            VideoPayload {
                src: self.src.clone(),
                storage_key: self.storage_key.clone(),
                remote_url: self.remote_url.clone(),
                poster: self.poster.clone(),
                pending_upload: false,
            },
        );
        instance.layer_id.clone_from(&self.layer_id);
        instance.visible = self.visible;
        instance
    }
}

/// Freehand path record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathSnapshot {
    /// Content id at capture time.
    pub id: String,
    /// Bounds.
    pub bounds: Bounds,
    /// Layer.
    #[serde(default)]
    pub layer_id: Option<String>,
    /// Serialized path (SVG path syntax).
    pub path_data: String,
    /// Stroke width.
    pub stroke_width: f32,
    /// Stroke colour.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_color: Option<String>,
    /// Fill colour.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_color: Option<String>,
}

/// An item that could not be captured or restored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedItem {
    /// Kind of the item.
    pub kind: ContentKind,
    /// Its id, if one could be read.
    pub id: Option<String>,
    /// Why it was skipped.
    pub reason: String,
}

/// Where one record sits: the fields a move or resize can touch plus the
/// ones it must not.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement<'a> {
    /// Kind.
    pub kind: ContentKind,
    /// Id.
    pub id: &'a str,
    /// Bounds.
    pub bounds: Bounds,
    /// Layer.
    pub layer_id: Option<&'a str>,
    /// Visibility.
    pub visible: bool,
}

impl<'a> Placement<'a> {
    const fn new(
        kind: ContentKind,
        id: &'a str,
        bounds: Bounds,
        layer_id: Option<&'a str>,
        visible: bool,
    ) -> Self {
        Self {
            kind,
            id,
            bounds,
            layer_id,
            visible,
        }
    }
}

/// Type-partitioned list of content records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    /// Images.
    pub images: Vec<ImageAssetSnapshot>,
    /// 3D models.
    pub models: Vec<ModelAssetSnapshot>,
    /// Text blocks.
    pub texts: Vec<TextAssetSnapshot>,
    /// Videos.
    pub videos: Vec<VideoAssetSnapshot>,
    /// Freehand paths.
    pub paths: Vec<PathSnapshot>,
}

impl Snapshot {
    /// Total number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.images.len()
            + self.models.len()
            + self.texts.len()
            + self.videos.len()
            + self.paths.len()
    }

    /// Whether the snapshot lists nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record every registry instance as-is (ids and sources unchanged),
    /// together with `paths`.
    #[must_use]
    pub fn of_registry(state: &RegistryState, paths: Vec<PathSnapshot>) -> Self {
        Self {
            images: state
                .images
                .iter()
                .map(|i| ImageAssetSnapshot::capture(i, i.payload.src.clone()))
                .collect(),
            models: state.models.iter().map(ModelAssetSnapshot::capture).collect(),
            texts: state.texts.iter().map(TextAssetSnapshot::capture).collect(),
            videos: state
                .videos
                .iter()
                .map(|i| VideoAssetSnapshot::capture(i, i.payload.src.clone()))
                .collect(),
            paths,
        }
    }

    /// Registry collections holding every record under its recorded id.
    #[must_use]
    pub fn registry_state(&self) -> RegistryState {
        RegistryState {
            images: Rc::new(self.images.iter().map(|r| r.instance(&r.id)).collect()),
            models: Rc::new(self.models.iter().map(|r| r.instance(&r.id)).collect()),
            texts: Rc::new(self.texts.iter().map(|r| r.instance(&r.id)).collect()),
            videos: Rc::new(self.videos.iter().map(|r| r.instance(&r.id)).collect()),
        }
    }

    /// `(kind, id, bounds, layer, visible)` for every record, paths included.
    #[must_use]
    pub fn placements(&self) -> Vec<Placement<'_>> {
        let mut out = Vec::with_capacity(self.len());
        for r in &self.images {
            out.push(Placement::new(
                ContentKind::Image,
                &r.id,
                r.bounds,
                r.layer_id.as_deref(),
                r.visible,
            ));
        }
        for r in &self.models {
            out.push(Placement::new(
                ContentKind::Model3D,
                &r.id,
                r.bounds,
                r.layer_id.as_deref(),
                r.visible,
            ));
        }
        for r in &self.texts {
            out.push(Placement::new(
                ContentKind::Text,
                &r.id,
                r.bounds,
                r.layer_id.as_deref(),
                r.visible,
            ));
        }
        for r in &self.videos {
            out.push(Placement::new(
                ContentKind::Video,
                &r.id,
                r.bounds,
                r.layer_id.as_deref(),
                r.visible,
            ));
        }
        for r in &self.paths {
            out.push(Placement::new(
                ContentKind::Path,
                &r.id,
                r.bounds,
                r.layer_id.as_deref(),
                true,
            ));
        }
        out
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Strict parse: any malformed item fails the whole payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON does not match the snapshot shape.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Lenient parse: malformed items are skipped and reported, siblings kept.
    ///
    /// # Errors
    ///
    /// Returns an error only if the payload is not a JSON object at all.
    pub fn from_json_lenient(json: &str) -> SyncResult<(Self, Vec<SkippedItem>)> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let mut skipped = Vec::new();
        let snapshot = Self {
            images: lenient_list(&value, "images", ContentKind::Image, &mut skipped),
            models: lenient_list(&value, "models", ContentKind::Model3D, &mut skipped),
            texts: lenient_list(&value, "texts", ContentKind::Text, &mut skipped),
            videos: lenient_list(&value, "videos", ContentKind::Video, &mut skipped),
            paths: lenient_list(&value, "paths", ContentKind::Path, &mut skipped),
        };
        Ok((snapshot, skipped))
    }
}

fn lenient_list<T: DeserializeOwned>(
    root: &serde_json::Value,
    key: &str,
    kind: ContentKind,
    skipped: &mut Vec<SkippedItem>,
) -> Vec<T> {
    let Some(items) = root.get(key).and_then(serde_json::Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match T::deserialize(item) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                let id = item.get("id").and_then(serde_json::Value::as_str).map(str::to_string);
                tracing::warn!(kind = %kind, id = ?id, "Skipping malformed snapshot item: {}", e);
                skipped.push(SkippedItem {
                    kind,
                    id,
                    reason: e.to_string(),
                });
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shape_is_camel_case() {
        let snapshot = Snapshot {
            paths: vec![PathSnapshot {
                id: "path-1".into(),
                bounds: Bounds::new(0.0, 0.0, 10.0, 10.0),
                layer_id: Some("l1".into()),
                path_data: "M0 0 L10 10".into(),
                stroke_width: 3.0,
                stroke_color: Some("#ff0000".into()),
                fill_color: None,
            }],
            ..Snapshot::default()
        };
        let value: serde_json::Value =
            serde_json::from_str(&snapshot.to_json().expect("json")).expect("value");
        assert_eq!(value["paths"][0]["pathData"], "M0 0 L10 10");
        assert_eq!(value["paths"][0]["strokeWidth"], 3.0);
        assert_eq!(value["paths"][0]["layerId"], "l1");
        assert!(value["images"].as_array().is_some_and(Vec::is_empty));
    }

    #[test]
    fn test_lenient_parse_keeps_siblings() {
        let json = r##"{
            "images": [
                {"id": "img-1", "bounds": {"x": 0, "y": 0, "w": 10, "h": 10},
                 "src": "projects/a.png"},
                {"id": "img-2", "bounds": "nonsense"}
            ],
            "texts": [
                {"id": "t1", "bounds": {"x": 0, "y": 0, "w": 10, "h": 10},
                 "content": "hi", "fontSize": 12, "color": "#000"}
            ]
        }"##;
        let (snapshot, skipped) = Snapshot::from_json_lenient(json).expect("parse");
        assert_eq!(snapshot.images.len(), 1);
        assert_eq!(snapshot.texts.len(), 1);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].id.as_deref(), Some("img-2"));
        assert!(Snapshot::from_json(json).is_err());
    }

    #[test]
    fn test_capture_and_instance_preserve_payload() {
        let mut original = Instance::new(
            "t1",
            Bounds::new(1.0, 2.0, 3.0, 4.0),
            TextPayload {
                content: "hello".into(),
                font_size: 24.0,
                color: "#333".into(),
                font_family: Some("Inter".into()),
            },
        );
        original.layer_id = Some("l1".into());
        let record = TextAssetSnapshot::capture(&original);
        let restored = record.instance("t2");
        assert_eq!(restored.payload, original.payload);
        assert_eq!(restored.layer_id, original.layer_id);
        assert_eq!(restored.id, "t2");
    }
}
