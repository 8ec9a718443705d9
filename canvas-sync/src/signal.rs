//! Typed signal bus.
//!
//! Cross-subsystem notifications (overlays, layer panel, toolbar) flow through
//! a single broadcast channel carrying [`Signal`] values. Publishing never
//! fails: with no subscribers the signal is dropped and logged at debug level.

use tokio::sync::broadcast;

use crate::asset::AssetReference;
use crate::binding::ContentKind;

/// Notifications published by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// The scene gained its first layer.
    SceneReady,
    /// Nodes were added, removed or re-tagged.
    SceneStructurallyChanged,
    /// The scene was cleared.
    SceneCleared,
    /// A reconciliation found the scene uninitialized.
    RecoveryNeeded {
        /// Why recovery is needed.
        reason: String,
    },
    /// An upload was persisted; the payload now carries a durable reference.
    AssetUpgraded {
        /// Placeholder (and content) id of the upload.
        placeholder_id: String,
        /// Durable reference written into the payload.
        reference: AssetReference,
    },
    /// Upload progress for a placeholder, in `0.0..=1.0`.
    PlaceholderProgress {
        /// Placeholder id.
        placeholder_id: String,
        /// Fraction complete.
        progress: f32,
    },
    /// A layer was shown or hidden.
    LayerVisibilityChanged {
        /// Layer id.
        layer_id: String,
        /// New visibility.
        visible: bool,
    },
    /// Layers were reordered.
    LayerOrderChanged {
        /// Layer ids in paint order.
        order: Vec<String>,
    },
    /// A registry collection changed.
    RegistryChanged {
        /// Collection that changed.
        kind: ContentKind,
        /// New collection version.
        version: u64,
    },
    /// The scene was rebuilt from a history snapshot.
    SceneReconstructed {
        /// Label of the commit that was restored.
        label: String,
    },
    /// An upload failed after all retries. The local preview stays.
    UploadFailed {
        /// Placeholder id.
        placeholder_id: String,
        /// Human-readable message for a toast.
        message: String,
    },
    /// The active project changed.
    ProjectSwitched {
        /// New project id.
        project_id: String,
    },
}

impl Signal {
    /// Short signal name, used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SceneReady => "scene-ready",
            Self::SceneStructurallyChanged => "scene-structurally-changed",
            Self::SceneCleared => "scene-cleared",
            Self::RecoveryNeeded { .. } => "recovery-needed",
            Self::AssetUpgraded { .. } => "asset-upgraded",
            Self::PlaceholderProgress { .. } => "placeholder-progress",
            Self::LayerVisibilityChanged { .. } => "layer-visibility-changed",
            Self::LayerOrderChanged { .. } => "layer-order-changed",
            Self::RegistryChanged { .. } => "registry-changed",
            Self::SceneReconstructed { .. } => "scene-reconstructed",
            Self::UploadFailed { .. } => "upload-failed",
            Self::ProjectSwitched { .. } => "project-switched",
        }
    }
}

/// Broadcast broker for [`Signal`]s.
#[derive(Debug, Clone)]
pub struct SignalBus {
    tx: broadcast::Sender<Signal>,
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl SignalBus {
    /// Create a bus whose subscribers lag after `capacity` unread signals.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all future signals.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish a signal to every subscriber.
    pub fn publish(&self, signal: Signal) {
        let name = signal.name();
        if let Err(e) = self.tx.send(signal) {
            tracing::debug!(signal = name, "Signal dropped: no receivers ({})", e);
        }
    }
}
