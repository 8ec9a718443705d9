//! Content tags on scene nodes.
//!
//! A *binding* links a scene node to a logical content item via
//! `(content_id, kind)` stored in the node's [`NodeData`]. Helper nodes
//! (hit areas, handles, placeholders, grid) carry a role tag instead and are
//! never treated as content.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::scene::{Node, NodeData, NodeHandle, NodeKind, SceneTree};

/// Attribute key: persisted storage key of an image or video.
pub const ATTR_STORAGE_KEY: &str = "storageKey";
/// Attribute key: remote URL of an image or video.
pub const ATTR_REMOTE_URL: &str = "remoteUrl";
/// Attribute key: original file name.
pub const ATTR_FILE_NAME: &str = "fileName";
/// Attribute key: set while an upload has not been persisted yet.
pub const ATTR_PENDING_UPLOAD: &str = "pendingUpload";
/// Attribute key: model URL for 3D content.
pub const ATTR_MODEL_URL: &str = "modelUrl";
/// Attribute key: model format (`glb`, `gltf`, ...).
pub const ATTR_FORMAT: &str = "format";
/// Attribute key: video poster frame reference.
pub const ATTR_POSTER: &str = "poster";
/// Attribute key: media source for videos, whose frame node has no raster.
pub const ATTR_SRC: &str = "src";

/// Kinds of content the registry tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// Bitmap image.
    Image,
    /// 3D model rendered as a 2D card.
    Model3D,
    /// Text block.
    Text,
    /// Video with a poster frame.
    Video,
    /// Free-form vector path (brush strokes, shapes).
    Path,
}

impl ContentKind {
    /// All kinds tracked by the instance registry.
    pub const REGISTRY: [Self; 4] = [Self::Image, Self::Model3D, Self::Text, Self::Video];

    /// Tag value stored on scene nodes.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Model3D => "model3d",
            Self::Text => "text",
            Self::Video => "video",
            Self::Path => "path",
        }
    }

    /// Whether the kind's bounds come from a decoded bitmap.
    #[must_use]
    pub const fn has_raster(self) -> bool {
        matches!(self, Self::Image)
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(Self::Image),
            "model3d" => Ok(Self::Model3D),
            "text" => Ok(Self::Text),
            "video" => Ok(Self::Video),
            "path" => Ok(Self::Path),
            _ => Err(()),
        }
    }
}

/// Non-content roles for nodes that exist only to support interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HelperRole {
    /// Invisible rectangle enlarging the clickable area of a content group.
    HitArea,
    /// Selection outline drawn around selected items.
    SelectionOutline,
    /// Transform handle.
    Handle,
    /// Upload placeholder group.
    Placeholder,
    /// Background grid.
    Grid,
    /// Canvas background.
    Background,
}

impl HelperRole {
    /// Tag value stored on scene nodes.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HitArea => "hit-area",
            Self::SelectionOutline => "selection-outline",
            Self::Handle => "handle",
            Self::Placeholder => "placeholder",
            Self::Grid => "grid",
            Self::Background => "background",
        }
    }

    /// Parse a role tag.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hit-area" => Some(Self::HitArea),
            "selection-outline" => Some(Self::SelectionOutline),
            "handle" => Some(Self::Handle),
            "placeholder" => Some(Self::Placeholder),
            "grid" => Some(Self::Grid),
            "background" => Some(Self::Background),
            _ => None,
        }
    }

    /// Roles that are skipped entirely by hit-testing.
    #[must_use]
    pub const fn blocks_hit_test(self) -> bool {
        !matches!(self, Self::HitArea)
    }
}

/// A resolved `(node, content_id, kind)` triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneNodeBinding {
    /// Logical content id.
    pub content_id: String,
    /// Content kind.
    pub kind: ContentKind,
    /// Node carrying the tag (the group for grouped content).
    pub node: NodeHandle,
}

/// Read the content binding of a node, if it is a tagged content node.
#[must_use]
pub fn read_binding(node: &Node) -> Option<SceneNodeBinding> {
    if node.data.role.is_some() {
        return None;
    }
    let id = node.data.content_id.as_deref().filter(|id| !id.is_empty())?;
    let kind = node.data.kind.as_deref()?.parse().ok()?;
    Some(SceneNodeBinding {
        content_id: id.to_string(),
        kind,
        node: node.handle(),
    })
}

/// Helper role of a node, if any.
#[must_use]
pub fn helper_role(node: &Node) -> Option<HelperRole> {
    node.data.role.as_deref().and_then(HelperRole::parse)
}

/// Data record tagging a node as content.
#[must_use]
pub fn content_data(kind: ContentKind, id: &str) -> NodeData {
    NodeData {
        content_id: Some(id.to_string()),
        kind: Some(kind.as_str().to_string()),
        ..NodeData::default()
    }
}

/// Data record tagging a node as a helper, optionally owned by a content id.
#[must_use]
pub fn helper_data(role: HelperRole, owner: Option<&str>) -> NodeData {
    NodeData {
        content_id: owner.map(str::to_string),
        role: Some(role.as_str().to_string()),
        ..NodeData::default()
    }
}

/// Tag an existing node as content.
pub fn tag_content(scene: &mut SceneTree, node: NodeHandle, kind: ContentKind, id: &str) {
    if let Some(data) = scene.data_mut(node) {
        data.content_id = Some(id.to_string());
        data.kind = Some(kind.as_str().to_string());
        data.role = None;
    }
}

/// Infer the kind of an untagged node from its shape, for legacy scenes.
///
/// Only unambiguous shapes are inferred: a bare raster or a group whose only
/// drawable child is a raster is an image, a bare text node is text, a bare
/// path is a path.
#[must_use]
pub fn infer_kind(scene: &SceneTree, node: &Node) -> Option<ContentKind> {
    match &node.kind {
        NodeKind::Raster(_) => Some(ContentKind::Image),
        NodeKind::Text(_) => Some(ContentKind::Text),
        NodeKind::Path(_) => Some(ContentKind::Path),
        NodeKind::Group => {
            let drawable: Vec<&Node> = scene
                .children(node.handle())
                .iter()
                .filter_map(|h| scene.node(*h))
                .filter(|child| helper_role(child).is_none())
                .collect();
            match drawable.as_slice() {
                [only] if only.raster().is_some() => Some(ContentKind::Image),
                _ => None,
            }
        }
        NodeKind::Layer | NodeKind::Rect => None,
    }
}

/// Bidirectional index between content keys and scene nodes.
///
/// Rebuilt by every reconciliation pass; never authoritative on its own.
#[derive(Debug, Clone, Default)]
pub struct BindingIndex {
    by_content: HashMap<(ContentKind, String), NodeHandle>,
    by_node: HashMap<NodeHandle, (ContentKind, String)>,
}

impl BindingIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a binding, replacing any previous one for the same key or node.
    pub fn insert(&mut self, binding: &SceneNodeBinding) {
        let key = (binding.kind, binding.content_id.clone());
        if let Some(old) = self.by_content.insert(key.clone(), binding.node) {
            self.by_node.remove(&old);
        }
        if let Some(old_key) = self.by_node.insert(binding.node, key) {
            if old_key.0 != binding.kind || old_key.1 != binding.content_id {
                self.by_content.remove(&old_key);
            }
        }
    }

    /// Node bound to a content item.
    #[must_use]
    pub fn node_for(&self, kind: ContentKind, id: &str) -> Option<NodeHandle> {
        self.by_content.get(&(kind, id.to_string())).copied()
    }

    /// Content item bound to a node.
    #[must_use]
    pub fn content_for(&self, node: NodeHandle) -> Option<(ContentKind, &str)> {
        self.by_node.get(&node).map(|(k, id)| (*k, id.as_str()))
    }

    /// Find the node bound to `id` under any kind.
    #[must_use]
    pub fn node_for_any(&self, id: &str) -> Option<(ContentKind, NodeHandle)> {
        self.by_content
            .iter()
            .find(|((_, cid), _)| cid == id)
            .map(|((kind, _), node)| (*kind, *node))
    }

    /// Number of bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_content.len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_content.is_empty()
    }

    /// Remove every binding.
    pub fn clear(&mut self) {
        self.by_content.clear();
        self.by_node.clear();
    }
}
