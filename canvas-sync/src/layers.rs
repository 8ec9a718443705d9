//! Layer descriptors and layer-level operations.

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::scene::SceneTree;
use crate::signal::{Signal, SignalBus};

/// A layer as stored in project content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerDescriptor {
    /// Layer id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Visibility.
    #[serde(default = "default_visible")]
    pub visible: bool,
}

const fn default_visible() -> bool {
    true
}

impl LayerDescriptor {
    /// A visible layer.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            visible: true,
        }
    }
}

/// Layers of `scene` in paint order.
#[must_use]
pub fn describe(scene: &SceneTree) -> Vec<LayerDescriptor> {
    scene
        .layers()
        .iter()
        .filter_map(|h| scene.node(*h))
        .filter_map(|node| {
            let id = node.data.layer_id.clone()?;
            Some(LayerDescriptor {
                name: node.name.clone().unwrap_or_else(|| id.clone()),
                id,
                visible: node.visible,
            })
        })
        .collect()
}

/// Layer ids in paint order.
#[must_use]
pub fn layer_order(scene: &SceneTree) -> Vec<String> {
    describe(scene).into_iter().map(|l| l.id).collect()
}

/// Create the layers listed in `descriptors` on top of `scene`.
///
/// # Errors
///
/// Returns an error if a freshly created layer cannot be hidden.
pub fn create_layers(scene: &mut SceneTree, descriptors: &[LayerDescriptor]) -> SyncResult<()> {
    for layer in descriptors {
        let handle = scene.add_layer(&layer.id, &layer.name);
        if !layer.visible {
            scene.set_visible(handle, false)?;
        }
    }
    Ok(())
}

/// Show or hide a layer and announce it.
///
/// # Errors
///
/// Returns [`SyncError::LayerNotFound`] if no layer has this id.
pub fn set_layer_visibility(
    scene: &mut SceneTree,
    bus: &SignalBus,
    layer_id: &str,
    visible: bool,
) -> SyncResult<()> {
    let layer = scene
        .layer_by_id(layer_id)
        .ok_or_else(|| SyncError::LayerNotFound(layer_id.to_string()))?;
    let changed = scene.node(layer).is_some_and(|n| n.visible != visible);
    scene.set_visible(layer, visible)?;
    if changed {
        bus.publish(Signal::LayerVisibilityChanged {
            layer_id: layer_id.to_string(),
            visible,
        });
    }
    Ok(())
}

/// Reorder layers and announce the resulting order.
///
/// Returns the new order. Unknown ids are ignored.
pub fn reorder_layers(scene: &mut SceneTree, bus: &SignalBus, order: &[String]) -> Vec<String> {
    let before = layer_order(scene);
    scene.reorder_layers(order);
    let after = layer_order(scene);
    if after != before {
        bus.publish(Signal::LayerOrderChanged {
            order: after.clone(),
        });
    }
    after
}
