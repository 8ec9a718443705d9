//! Typed content instances held by the registry.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::binding::ContentKind;
use crate::geometry::Bounds;

/// Generate a fresh content id for the given kind.
#[must_use]
pub fn new_content_id(kind: ContentKind) -> String {
    let prefix = match kind {
        ContentKind::Image => "img",
        ContentKind::Model3D => "model",
        ContentKind::Text => "text",
        ContentKind::Video => "video",
        ContentKind::Path => "path",
    };
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

/// Type-specific data carried by an [`Instance`].
pub trait Payload: Clone + PartialEq + fmt::Debug {
    /// Content kind this payload belongs to.
    const KIND: ContentKind;

    /// Fill fields the scene does not carry from the previous registry entry.
    fn inherit(&mut self, previous: &Self);

    /// Asset references the payload keeps alive.
    fn references(&self) -> Vec<&str> {
        Vec::new()
    }
}

/// A content instance: common addressing and geometry plus a typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance<P> {
    /// Stable id, unique per content kind.
    pub id: String,
    /// Bounds of record.
    pub bounds: Bounds,
    /// Visibility.
    pub visible: bool,
    /// Owning layer.
    pub layer_id: Option<String>,
    /// Selection state.
    pub is_selected: bool,
    /// Type-specific data.
    #[serde(flatten)]
    pub payload: P,
}

impl<P: Payload> Instance<P> {
    /// A visible, unselected instance.
    #[must_use]
    pub fn new(id: impl Into<String>, bounds: Bounds, payload: P) -> Self {
        Self {
            id: id.into(),
            bounds,
            visible: true,
            layer_id: None,
            is_selected: false,
            payload,
        }
    }

    /// Content kind.
    #[must_use]
    pub const fn kind(&self) -> ContentKind {
        P::KIND
    }

    /// Structural equality: bounds compared within tolerance, everything else exactly.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        self.id == other.id
            && self.bounds.approx_eq(&other.bounds)
            && self.visible == other.visible
            && self.layer_id == other.layer_id
            && self.is_selected == other.is_selected
            && self.payload == other.payload
    }
}

/// Image payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePayload {
    /// Reference currently rendered.
    pub src: String,
    /// Persisted storage key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<String>,
    /// Persisted remote URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    /// True until the upload has been persisted.
    #[serde(default)]
    pub pending_upload: bool,
    /// Decoded width.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub natural_width: Option<u32>,
    /// Decoded height.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub natural_height: Option<u32>,
    /// Original file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl Payload for ImagePayload {
    const KIND: ContentKind = ContentKind::Image;

    fn inherit(&mut self, previous: &Self) {
        if self.src.is_empty() {
            self.src.clone_from(&previous.src);
        }
        inherit_opt(&mut self.storage_key, &previous.storage_key);
        inherit_opt(&mut self.remote_url, &previous.remote_url);
        inherit_opt(&mut self.natural_width, &previous.natural_width);
        inherit_opt(&mut self.natural_height, &previous.natural_height);
        inherit_opt(&mut self.file_name, &previous.file_name);
    }

    fn references(&self) -> Vec<&str> {
        vec![self.src.as_str()]
    }
}

/// 3D model payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPayload {
    /// Model location.
    pub model_url: String,
    /// Original file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Model format, e.g. `glb`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl Payload for ModelPayload {
    const KIND: ContentKind = ContentKind::Model3D;

    fn inherit(&mut self, previous: &Self) {
        if self.model_url.is_empty() {
            self.model_url.clone_from(&previous.model_url);
        }
        inherit_opt(&mut self.file_name, &previous.file_name);
        inherit_opt(&mut self.format, &previous.format);
    }
}

/// Text payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextPayload {
    /// Text content.
    pub content: String,
    /// Font size in pixels.
    pub font_size: f32,
    /// Fill colour.
    pub color: String,
    /// Optional font family.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_family: Option<String>,
}

impl Default for TextPayload {
    fn default() -> Self {
        Self {
            content: String::new(),
            font_size: 16.0,
            color: "#000000".to_string(),
            font_family: None,
        }
    }
}

impl Payload for TextPayload {
    const KIND: ContentKind = ContentKind::Text;

    fn inherit(&mut self, previous: &Self) {
        inherit_opt(&mut self.font_family, &previous.font_family);
    }
}

/// Video payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoPayload {
    /// Reference currently played.
    pub src: String,
    /// Persisted storage key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<String>,
    /// Persisted remote URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    /// Poster frame reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poster: Option<String>,
    /// True until the upload has been persisted.
    #[serde(default)]
    pub pending_upload: bool,
}

impl Payload for VideoPayload {
    const KIND: ContentKind = ContentKind::Video;

    fn inherit(&mut self, previous: &Self) {
        if self.src.is_empty() {
            self.src.clone_from(&previous.src);
        }
        inherit_opt(&mut self.storage_key, &previous.storage_key);
        inherit_opt(&mut self.remote_url, &previous.remote_url);
        inherit_opt(&mut self.poster, &previous.poster);
    }

    fn references(&self) -> Vec<&str> {
        let mut refs = vec![self.src.as_str()];
        refs.extend(self.poster.as_deref());
        refs
    }
}

fn inherit_opt<T: Clone>(slot: &mut Option<T>, previous: &Option<T>) {
    if slot.is_none() {
        slot.clone_from(previous);
    }
}

/// Registry entry for an image.
pub type ImageInstance = Instance<ImagePayload>;
/// Registry entry for a 3D model card.
pub type ModelInstance = Instance<ModelPayload>;
/// Registry entry for a text block.
pub type TextInstance = Instance<TextPayload>;
/// Registry entry for a video.
pub type VideoInstance = Instance<VideoPayload>;
