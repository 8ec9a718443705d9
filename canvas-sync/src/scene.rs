//! Retained-mode scene tree.
//!
//! This is the engine's view of the rendering substrate: an arena of nodes
//! organized into layers, each node carrying geometry plus a small
//! side-channel [`NodeData`] record. Hosts that embed a real vector library
//! mirror it into this tree; tests drive it directly.
//!
//! The tree never interprets `NodeData`. Reading and writing content tags is
//! the job of [`crate::binding`].
//!
//! Mutations are recorded as [`SceneChange`]s which the engine drains and turns
//! into scheduled reconciliation passes.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::geometry::{Bounds, Point};

/// Stable handle to a node in a [`SceneTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeHandle(u64);

impl NodeHandle {
    /// Raw numeric value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Bitmap node payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterData {
    /// Source the substrate renders from.
    pub source: String,
    /// Whether the bitmap has finished decoding.
    #[serde(skip)]
    pub loaded: bool,
    /// Where the bitmap should sit once decoded.
    #[serde(default)]
    pub placement: Option<Bounds>,
    /// Decoded pixel size.
    #[serde(default)]
    pub natural_size: Option<(u32, u32)>,
}

/// Text node payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextData {
    /// Text content.
    pub content: String,
    /// Font size in pixels.
    pub font_size: f32,
    /// Fill colour.
    pub color: String,
    /// Optional font family.
    #[serde(default)]
    pub font_family: Option<String>,
}

/// Vector path payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathData {
    /// Serialized path (SVG path syntax).
    pub path: String,
    /// Stroke width in pixels.
    pub stroke_width: f32,
    /// Stroke colour.
    #[serde(default)]
    pub stroke_color: Option<String>,
    /// Fill colour.
    #[serde(default)]
    pub fill_color: Option<String>,
}

/// What a node draws.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum NodeKind {
    /// Top-level layer.
    Layer,
    /// Container.
    Group,
    /// Bitmap.
    Raster(RasterData),
    /// Text run.
    Text(TextData),
    /// Vector path.
    Path(PathData),
    /// Plain rectangle (frames, hit areas, grid, background).
    Rect,
}

impl NodeKind {
    /// Whether the node can hold children.
    #[must_use]
    pub const fn is_container(&self) -> bool {
        matches!(self, Self::Layer | Self::Group)
    }
}

/// Side-channel data the substrate lets applications attach to nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeData {
    /// Logical content id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    /// Content kind tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Helper role tag (hit area, handle, placeholder, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Layer id, set on layer nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_id: Option<String>,
    /// Free-form attributes (storage keys, model URLs, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
}

/// A node in the tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    handle: NodeHandle,
    parent: Option<NodeHandle>,
    children: Vec<NodeHandle>,
    /// What the node draws.
    pub kind: NodeKind,
    /// Display name.
    pub name: Option<String>,
    /// Own bounds for leaves. Containers derive theirs from children.
    pub bounds: Option<Bounds>,
    /// Visibility flag.
    pub visible: bool,
    /// Application data.
    pub data: NodeData,
}

impl Node {
    /// This node's handle.
    #[must_use]
    pub const fn handle(&self) -> NodeHandle {
        self.handle
    }

    /// Parent handle, `None` for layers.
    #[must_use]
    pub const fn parent(&self) -> Option<NodeHandle> {
        self.parent
    }

    /// Children in paint order (first painted first).
    #[must_use]
    pub fn children(&self) -> &[NodeHandle] {
        &self.children
    }

    /// The raster payload, if this node is a bitmap.
    #[must_use]
    pub const fn raster(&self) -> Option<&RasterData> {
        match &self.kind {
            NodeKind::Raster(raster) => Some(raster),
            _ => None,
        }
    }
}

/// Description of a node to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    /// What to draw.
    pub kind: NodeKind,
    /// Optional name.
    pub name: Option<String>,
    /// Own bounds.
    pub bounds: Option<Bounds>,
    /// Initial visibility.
    pub visible: bool,
    /// Application data.
    pub data: NodeData,
}

impl NodeSpec {
    /// A visible node of the given kind with no data.
    #[must_use]
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            name: None,
            bounds: None,
            visible: true,
            data: NodeData::default(),
        }
    }

    /// An empty group.
    #[must_use]
    pub fn group() -> Self {
        Self::new(NodeKind::Group)
    }

    /// A rectangle with the given bounds.
    #[must_use]
    pub fn rect(bounds: Bounds) -> Self {
        Self::new(NodeKind::Rect).with_bounds(bounds)
    }

    /// Set bounds.
    #[must_use]
    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    /// Set data.
    #[must_use]
    pub fn with_data(mut self, data: NodeData) -> Self {
        self.data = data;
        self
    }

    /// Set name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A change notification emitted by the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneChange {
    /// Nodes were inserted, removed, re-parented or re-tagged.
    Structural,
    /// A node's geometry or visibility changed.
    Geometry(NodeHandle),
    /// A raster finished decoding.
    RasterLoaded(NodeHandle),
    /// The whole tree was replaced or cleared.
    Reset,
}

/// Serialized node, used for JSON export/import.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SerializedNode {
    #[serde(rename = "node")]
    kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bounds: Option<Bounds>,
    #[serde(default = "default_visible")]
    visible: bool,
    #[serde(default)]
    data: NodeData,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    children: Vec<SerializedNode>,
}

const fn default_visible() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SerializedScene {
    layers: Vec<SerializedNode>,
}

/// The retained scene tree.
#[derive(Debug, Clone, Default)]
pub struct SceneTree {
    nodes: HashMap<NodeHandle, Node>,
    layers: Vec<NodeHandle>,
    next_handle: u64,
    revision: u64,
    changes: Vec<SceneChange>,
}

impl SceneTree {
    /// Create an empty, not-yet-ready tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the tree has at least one layer.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        !self.layers.is_empty()
    }

    /// Monotonic revision, bumped on every mutation.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Take all pending change notifications.
    pub fn drain_changes(&mut self) -> Vec<SceneChange> {
        std::mem::take(&mut self.changes)
    }

    /// Whether change notifications are pending.
    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    fn record(&mut self, change: SceneChange) {
        self.revision += 1;
        if !self.changes.contains(&change) {
            self.changes.push(change);
        }
    }

    fn alloc(&mut self) -> NodeHandle {
        self.next_handle += 1;
        NodeHandle(self.next_handle)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Layers in paint order.
    #[must_use]
    pub fn layers(&self) -> &[NodeHandle] {
        &self.layers
    }

    /// Find a layer by its layer id.
    #[must_use]
    pub fn layer_by_id(&self, layer_id: &str) -> Option<NodeHandle> {
        self.layers.iter().copied().find(|h| {
            self.nodes
                .get(h)
                .and_then(|n| n.data.layer_id.as_deref())
                == Some(layer_id)
        })
    }

    /// Get a node.
    #[must_use]
    pub fn node(&self, handle: NodeHandle) -> Option<&Node> {
        self.nodes.get(&handle)
    }

    /// Whether the handle is live.
    #[must_use]
    pub fn contains(&self, handle: NodeHandle) -> bool {
        self.nodes.contains_key(&handle)
    }

    /// Number of nodes including layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Children of a node, empty if the handle is stale.
    #[must_use]
    pub fn children(&self, handle: NodeHandle) -> &[NodeHandle] {
        self.nodes
            .get(&handle)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
    }

    /// Ancestors from the parent up to the layer.
    pub fn ancestors(&self, handle: NodeHandle) -> impl Iterator<Item = NodeHandle> + '_ {
        std::iter::successors(self.nodes.get(&handle).and_then(|n| n.parent), |h| {
            self.nodes.get(h).and_then(|n| n.parent)
        })
    }

    /// The layer containing `handle` (itself if it is a layer).
    #[must_use]
    pub fn layer_of(&self, handle: NodeHandle) -> Option<NodeHandle> {
        if self.layers.contains(&handle) {
            return Some(handle);
        }
        self.ancestors(handle).last().filter(|h| self.layers.contains(h))
    }

    /// All descendants of `handle` in paint order (depth-first, pre-order).
    #[must_use]
    pub fn descendants(&self, handle: NodeHandle) -> Vec<NodeHandle> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeHandle> = self.children(handle).iter().rev().copied().collect();
        while let Some(h) = stack.pop() {
            out.push(h);
            stack.extend(self.children(h).iter().rev().copied());
        }
        out
    }

    /// Every non-layer node in paint order.
    #[must_use]
    pub fn all_content(&self) -> Vec<NodeHandle> {
        self.layers
            .iter()
            .flat_map(|&layer| self.descendants(layer))
            .collect()
    }

    /// Effective bounds: own bounds for leaves, union of children for containers.
    ///
    /// `None` for undecoded rasters and empty groups.
    #[must_use]
    pub fn bounds(&self, handle: NodeHandle) -> Option<Bounds> {
        self.bounds_filtered(handle, &|_| true)
    }

    /// Container bounds counting only children accepted by `include`.
    #[must_use]
    pub fn bounds_filtered(
        &self,
        handle: NodeHandle,
        include: &dyn Fn(&Node) -> bool,
    ) -> Option<Bounds> {
        let node = self.nodes.get(&handle)?;
        if node.kind.is_container() {
            Bounds::union_all(
                node.children
                    .iter()
                    .filter_map(|h| self.nodes.get(h))
                    .filter(|child| include(child))
                    .filter_map(|child| self.bounds_filtered(child.handle, include)),
            )
        } else {
            node.bounds
        }
    }

    /// Whether the node and all its ancestors are visible.
    #[must_use]
    pub fn is_effectively_visible(&self, handle: NodeHandle) -> bool {
        self.nodes.get(&handle).is_some_and(|n| n.visible)
            && self
                .ancestors(handle)
                .all(|h| self.nodes.get(&h).is_some_and(|n| n.visible))
    }

    /// Rasters that are waiting for their bitmap to decode.
    #[must_use]
    pub fn pending_rasters(&self) -> Vec<NodeHandle> {
        self.all_content()
            .into_iter()
            .filter(|h| {
                self.nodes
                    .get(h)
                    .and_then(Node::raster)
                    .is_some_and(|r| !r.loaded)
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Append a layer on top of the existing ones.
    pub fn add_layer(&mut self, layer_id: &str, name: &str) -> NodeHandle {
        let handle = self.alloc();
        self.nodes.insert(
            handle,
            Node {
                handle,
                parent: None,
                children: Vec::new(),
                kind: NodeKind::Layer,
                name: Some(name.to_string()),
                bounds: None,
                visible: true,
                data: NodeData {
                    layer_id: Some(layer_id.to_string()),
                    ..NodeData::default()
                },
            },
        );
        self.layers.push(handle);
        self.record(SceneChange::Structural);
        handle
    }

    /// Insert a node as the topmost child of `parent`.
    ///
    /// # Errors
    ///
    /// Returns an error if `parent` is stale or cannot hold children.
    pub fn insert(&mut self, parent: NodeHandle, spec: NodeSpec) -> SyncResult<NodeHandle> {
        let parent_node = self
            .nodes
            .get(&parent)
            .ok_or(SyncError::NodeNotFound(parent))?;
        if !parent_node.kind.is_container() {
            return Err(SyncError::NodeNotFound(parent));
        }
        let handle = self.alloc();
        self.nodes.insert(
            handle,
            Node {
                handle,
                parent: Some(parent),
                children: Vec::new(),
                kind: spec.kind,
                name: spec.name,
                bounds: spec.bounds,
                visible: spec.visible,
                data: spec.data,
            },
        );
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.push(handle);
        }
        self.record(SceneChange::Structural);
        Ok(handle)
    }

    /// Remove a node and its whole subtree. Removing a layer removes it from
    /// the layer list. Stale handles are ignored.
    pub fn remove(&mut self, handle: NodeHandle) -> bool {
        let Some(node) = self.nodes.get(&handle) else {
            return false;
        };
        let parent = node.parent;
        let mut doomed = self.descendants(handle);
        doomed.push(handle);
        for h in doomed {
            self.nodes.remove(&h);
        }
        if let Some(p) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            p.children.retain(|c| *c != handle);
        }
        self.layers.retain(|l| *l != handle);
        self.record(SceneChange::Structural);
        true
    }

    /// Mutable access to a node's data. Records a structural change.
    pub fn data_mut(&mut self, handle: NodeHandle) -> Option<&mut NodeData> {
        if !self.nodes.contains_key(&handle) {
            return None;
        }
        self.record(SceneChange::Structural);
        self.nodes.get_mut(&handle).map(|n| &mut n.data)
    }

    /// Move a node (and everything under it) to the given bounds.
    ///
    /// Leaves take the bounds directly. Containers remap every descendant leaf
    /// from the current container bounds onto `target`. Undecoded rasters have
    /// their placement updated instead.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is stale.
    pub fn set_bounds(&mut self, handle: NodeHandle, target: Bounds) -> SyncResult<()> {
        let node = self
            .nodes
            .get(&handle)
            .ok_or(SyncError::NodeNotFound(handle))?;

        if node.kind.is_container() {
            let Some(current) = self.placement_bounds(handle) else {
                return Ok(());
            };
            for leaf in self.descendants(handle) {
                if let Some(node) = self.nodes.get_mut(&leaf) {
                    if let Some(b) = node.bounds {
                        node.bounds = Some(current.remap(&b, &target));
                    }
                    if let NodeKind::Raster(raster) = &mut node.kind {
                        if let Some(p) = raster.placement {
                            raster.placement = Some(current.remap(&p, &target));
                        }
                    }
                }
            }
        } else if let Some(node) = self.nodes.get_mut(&handle) {
            if let NodeKind::Raster(raster) = &mut node.kind {
                raster.placement = Some(target);
                if raster.loaded {
                    node.bounds = Some(target);
                }
            } else {
                node.bounds = Some(target);
            }
        }
        self.record(SceneChange::Geometry(handle));
        Ok(())
    }

    /// Bounds including the placement of undecoded rasters.
    #[must_use]
    pub fn placement_bounds(&self, handle: NodeHandle) -> Option<Bounds> {
        let node = self.nodes.get(&handle)?;
        match &node.kind {
            NodeKind::Layer | NodeKind::Group => Bounds::union_all(
                node.children
                    .iter()
                    .filter_map(|h| self.placement_bounds(*h)),
            ),
            NodeKind::Raster(raster) => node.bounds.or(raster.placement),
            _ => node.bounds,
        }
    }

    /// Shift a node by `(dx, dy)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is stale.
    pub fn translate(&mut self, handle: NodeHandle, dx: f32, dy: f32) -> SyncResult<()> {
        match self.placement_bounds(handle) {
            Some(b) => self.set_bounds(handle, b.translated(dx, dy)),
            None if self.contains(handle) => Ok(()),
            None => Err(SyncError::NodeNotFound(handle)),
        }
    }

    /// Show or hide a node.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is stale.
    pub fn set_visible(&mut self, handle: NodeHandle, visible: bool) -> SyncResult<()> {
        let node = self
            .nodes
            .get_mut(&handle)
            .ok_or(SyncError::NodeNotFound(handle))?;
        if node.visible != visible {
            node.visible = visible;
            self.record(SceneChange::Geometry(handle));
        }
        Ok(())
    }

    /// Re-parent a node under another container, on top.
    ///
    /// # Errors
    ///
    /// Returns an error if either handle is stale, the target is not a
    /// container, or the move would create a cycle.
    pub fn reparent(&mut self, handle: NodeHandle, new_parent: NodeHandle) -> SyncResult<()> {
        if handle == new_parent || self.ancestors(new_parent).any(|a| a == handle) {
            return Err(SyncError::NodeNotFound(new_parent));
        }
        let is_container = self
            .nodes
            .get(&new_parent)
            .is_some_and(|n| n.kind.is_container());
        if !is_container {
            return Err(SyncError::NodeNotFound(new_parent));
        }
        let old_parent = self
            .nodes
            .get(&handle)
            .ok_or(SyncError::NodeNotFound(handle))?
            .parent;
        if let Some(old) = old_parent.and_then(|p| self.nodes.get_mut(&p)) {
            old.children.retain(|c| *c != handle);
        }
        if let Some(node) = self.nodes.get_mut(&handle) {
            node.parent = Some(new_parent);
        }
        if let Some(p) = self.nodes.get_mut(&new_parent) {
            p.children.push(handle);
        }
        self.record(SceneChange::Structural);
        Ok(())
    }

    /// Reorder layers to match `order` (layer ids). Unknown ids are ignored and
    /// unlisted layers keep their relative order on top.
    pub fn reorder_layers(&mut self, order: &[String]) {
        let mut ordered: Vec<NodeHandle> = order
            .iter()
            .filter_map(|id| self.layer_by_id(id))
            .collect();
        for layer in &self.layers {
            if !ordered.contains(layer) {
                ordered.push(*layer);
            }
        }
        if ordered != self.layers {
            self.layers = ordered;
            self.record(SceneChange::Structural);
        }
    }

    /// Mark a raster as decoded.
    ///
    /// The bitmap lands on its placement if one was set, otherwise at the
    /// origin with its natural size.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is stale or not a raster.
    pub fn finish_loading(
        &mut self,
        handle: NodeHandle,
        width: u32,
        height: u32,
    ) -> SyncResult<()> {
        let node = self
            .nodes
            .get_mut(&handle)
            .ok_or(SyncError::NodeNotFound(handle))?;
        let NodeKind::Raster(raster) = &mut node.kind else {
            return Err(SyncError::NodeNotFound(handle));
        };
        raster.loaded = true;
        raster.natural_size = Some((width, height));
        #[allow(clippy::cast_precision_loss)]
        let natural = Bounds::new(0.0, 0.0, width as f32, height as f32);
        node.bounds = Some(raster.placement.unwrap_or(natural));
        self.record(SceneChange::RasterLoaded(handle));
        Ok(())
    }

    /// Swap the source of an already-decoded raster without touching its
    /// geometry or decoded state.
    ///
    /// The caller guarantees the new source has been decoded off-tree, so the
    /// on-screen pixels never go blank.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is stale or not a raster.
    pub fn swap_raster_source(&mut self, handle: NodeHandle, source: &str) -> SyncResult<String> {
        let node = self
            .nodes
            .get_mut(&handle)
            .ok_or(SyncError::NodeNotFound(handle))?;
        let NodeKind::Raster(raster) = &mut node.kind else {
            return Err(SyncError::NodeNotFound(handle));
        };
        let previous = std::mem::replace(&mut raster.source, source.to_string());
        self.record(SceneChange::Geometry(handle));
        Ok(previous)
    }

    /// Remove every layer and node.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.layers.clear();
        self.record(SceneChange::Reset);
    }

    // -----------------------------------------------------------------------
    // Hit testing
    // -----------------------------------------------------------------------

    /// Topmost visible leaf whose bounds, grown by `tolerance`, contain `point`.
    ///
    /// Subtrees rooted at nodes rejected by `skip` are not considered at all.
    /// Later layers and later children paint on top and win ties.
    pub fn hit_test(
        &self,
        point: Point,
        tolerance: f32,
        skip: &dyn Fn(&Node) -> bool,
    ) -> Option<NodeHandle> {
        self.layers
            .iter()
            .rev()
            .find_map(|&layer| self.hit_test_node(layer, point, tolerance, skip))
    }

    fn hit_test_node(
        &self,
        handle: NodeHandle,
        point: Point,
        tolerance: f32,
        skip: &dyn Fn(&Node) -> bool,
    ) -> Option<NodeHandle> {
        let node = self.nodes.get(&handle)?;
        if !node.visible || skip(node) {
            return None;
        }
        if node.kind.is_container() {
            return node
                .children
                .iter()
                .rev()
                .find_map(|&child| self.hit_test_node(child, point, tolerance, skip));
        }
        node.bounds
            .filter(|b| b.expanded(tolerance).contains(point))
            .map(|_| handle)
    }

    /// Every visible leaf intersecting `area`, in paint order.
    pub fn hit_test_rect(&self, area: &Bounds, skip: &dyn Fn(&Node) -> bool) -> Vec<NodeHandle> {
        let mut out = Vec::new();
        for &layer in &self.layers {
            self.collect_intersecting(layer, area, skip, &mut out);
        }
        out
    }

    fn collect_intersecting(
        &self,
        handle: NodeHandle,
        area: &Bounds,
        skip: &dyn Fn(&Node) -> bool,
        out: &mut Vec<NodeHandle>,
    ) {
        let Some(node) = self.nodes.get(&handle) else {
            return;
        };
        if !node.visible || skip(node) {
            return;
        }
        if node.kind.is_container() {
            for &child in &node.children {
                self.collect_intersecting(child, area, skip, out);
            }
        } else if node.bounds.is_some_and(|b| b.intersects(area)) {
            out.push(handle);
        }
    }

    // -----------------------------------------------------------------------
    // Serialization
    // -----------------------------------------------------------------------

    /// Serialize the whole tree to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn export_json(&self) -> SyncResult<String> {
        let scene = SerializedScene {
            layers: self
                .layers
                .iter()
                .filter_map(|h| self.serialize_node(*h))
                .collect(),
        };
        Ok(serde_json::to_string(&scene)?)
    }

    fn serialize_node(&self, handle: NodeHandle) -> Option<SerializedNode> {
        let node = self.nodes.get(&handle)?;
        let mut kind = node.kind.clone();
        if let NodeKind::Raster(raster) = &mut kind {
            raster.placement = node.bounds.or(raster.placement);
        }
        Some(SerializedNode {
            kind,
            name: node.name.clone(),
            bounds: match node.kind {
                NodeKind::Raster(_) => None,
                _ => node.bounds,
            },
            visible: node.visible,
            data: node.data.clone(),
            children: node
                .children
                .iter()
                .filter_map(|h| self.serialize_node(*h))
                .collect(),
        })
    }

    /// Replace the whole tree with the contents of a JSON export.
    ///
    /// Imported rasters start undecoded, exactly as after a page reload.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed. The tree is left untouched.
    pub fn import_json(&mut self, json: &str) -> SyncResult<()> {
        let scene: SerializedScene = serde_json::from_str(json)?;
        self.nodes.clear();
        self.layers.clear();
        for layer in scene.layers {
            let handle = self.materialize(None, layer);
            self.layers.push(handle);
        }
        self.record(SceneChange::Reset);
        Ok(())
    }

    fn materialize(
        &mut self,
        parent: Option<NodeHandle>,
        serialized: SerializedNode,
    ) -> NodeHandle {
        let handle = self.alloc();
        let SerializedNode {
            kind,
            name,
            bounds,
            visible,
            data,
            children,
        } = serialized;
        let kind = match (parent, kind) {
            (None, _) => NodeKind::Layer,
            (Some(_), NodeKind::Layer) => NodeKind::Group,
            (Some(_), other) => other,
        };
        self.nodes.insert(
            handle,
            Node {
                handle,
                parent,
                children: Vec::new(),
                kind,
                name,
                bounds,
                visible,
                data,
            },
        );
        let child_handles: Vec<NodeHandle> = children
            .into_iter()
            .map(|child| self.materialize(Some(handle), child))
            .collect();
        if let Some(node) = self.nodes.get_mut(&handle) {
            node.children = child_handles;
        }
        handle
    }
}
