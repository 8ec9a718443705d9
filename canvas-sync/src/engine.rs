//! The synchronization engine.
//!
//! [`SyncEngine`] owns the scene tree, the instance registry and every
//! subsystem that keeps them in step. It is single-threaded: hosts share it as
//! a [`SharedEngine`] and async drivers ([`crate::upload::run_upload`],
//! [`crate::selection::push_selection`], [`crate::persistence`]) borrow it
//! only between suspension points.
//!
//! Scene changes never reconcile inline. They are queued by the tree, turned
//! into scheduler requests by [`SyncEngine::on_frame`], and at most one pass
//! runs per frame.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use tokio::sync::{broadcast, Notify};

use crate::asset::{AssetKind, AssetReference, AssetResolver};
use crate::binding::{
    read_binding, ContentKind, ATTR_MODEL_URL, ATTR_PENDING_UPLOAD, ATTR_REMOTE_URL, ATTR_SRC,
    ATTR_STORAGE_KEY,
};
use crate::clipboard::{self, Clipboard, RestoreReport};
use crate::config::SyncConfig;
use crate::construct::{
    place_image, place_model, place_path, place_text, place_video, resolve_layer,
};
use crate::error::{SyncError, SyncResult};
use crate::geometry::{Bounds, Point};
use crate::history::{DocumentSnapshot, HistoryManager, ReplayMode, Traversal};
use crate::layers::{self, LayerDescriptor};
use crate::model::{
    new_content_id, ImageInstance, ImagePayload, Instance, ModelPayload, Payload, TextInstance,
    TextPayload, VideoPayload,
};
use crate::persistence::ProjectContent;
use crate::placeholder::{predict_placement, Placeholders};
use crate::reconcile::{content_nodes, ReconcileOutcome, ReconcileReport, Reconciler};
use crate::registry::InstanceRegistry;
use crate::revoke::{
    LocalRefTracker, NoopRevoker, ObjectUrlRevoker, Reachability, RevokeOutcome,
};
use crate::scene::{Node, NodeHandle, SceneChange, SceneTree};
use crate::scheduler::{Debounce, FrameScheduler};
use crate::selection::{
    resolve_target, targets_in_rect, HitTarget, SelectionSync, SelectionToken,
};
use crate::signal::{Signal, SignalBus};
use crate::snapshot::{PathSnapshot, SkippedItem, Snapshot};
use crate::upload::{DecodedAsset, LocalAsset, UploadPhase, UploadReceipt, UploadTracker};

fn owned(refs: Vec<&str>) -> Vec<String> {
    refs.into_iter().map(str::to_string).collect()
}

/// Engine shared between the host and async drivers.
pub type SharedEngine = Rc<RefCell<SyncEngine>>;

/// History document used before any project is opened.
pub const DEFAULT_DOCUMENT: &str = "default";

/// Layer created when content has to be placed into an empty scene.
pub const DEFAULT_LAYER: &str = "default";

/// Default viewport width in pixels.
const DEFAULT_WIDTH: f32 = 800.0;

/// Default viewport height in pixels.
const DEFAULT_HEIGHT: f32 = 600.0;

/// Work requested before the scene was ready, replayed once it is.
#[derive(Debug, Clone)]
enum DeferredOp {
    Restore { snapshot: Snapshot, offset: (f32, f32) },
    AddText(TextInstance),
}

impl DeferredOp {
    const fn name(&self) -> &'static str {
        match self {
            Self::Restore { .. } => "restore",
            Self::AddText(_) => "add-text",
        }
    }
}

/// Result of a paste or snapshot restore.
#[derive(Debug, Clone, PartialEq)]
pub enum PasteOutcome {
    /// Items were created.
    Restored(RestoreReport),
    /// The scene is not ready; the restore runs once it is.
    Deferred,
    /// Nothing to paste.
    Empty,
}

/// Scene/registry synchronization engine.
pub struct SyncEngine {
    config: SyncConfig,
    resolver: AssetResolver,
    bus: SignalBus,
    scene: SceneTree,
    registry: InstanceRegistry,
    reconciler: Reconciler,
    scheduler: FrameScheduler,
    recovery: Debounce,
    placeholders: Placeholders,
    uploads: UploadTracker,
    local_refs: LocalRefTracker,
    revoker: Rc<dyn ObjectUrlRevoker>,
    history: HistoryManager,
    clipboard: Clipboard,
    selection: SelectionSync,
    selected_paths: Vec<String>,
    ready: Rc<Notify>,
    was_ready: bool,
    deferred: Vec<DeferredOp>,
    project_id: Option<String>,
    content_version: u64,
    viewport: Bounds,
    last_placed: Option<Bounds>,
    now_ms: u64,
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("project_id", &self.project_id)
            .field("ready", &self.was_ready)
            .field("nodes", &self.scene.len())
            .field("instances", &self.registry.state().len())
            .field("uploads_in_flight", &self.uploads.in_flight())
            .field("deferred", &self.deferred.len())
            .finish_non_exhaustive()
    }
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new(SyncConfig::default())
    }
}

impl SyncEngine {
    /// Create an engine with an empty, not-yet-ready scene.
    #[must_use]
    pub fn new(config: SyncConfig) -> Self {
        let resolver = AssetResolver::new(config.resolver.clone());
        let bus = SignalBus::new(config.signal_capacity);
        let mut history = HistoryManager::new(config.history_depth);
        history.set_active(DEFAULT_DOCUMENT);
        Self {
            registry: InstanceRegistry::new(bus.clone()),
            reconciler: Reconciler::new(resolver.clone()),
            scheduler: FrameScheduler::new(config.settle_window_ms),
            recovery: Debounce::new(config.recovery_debounce_ms),
            placeholders: Placeholders::new(),
            uploads: UploadTracker::new(),
            local_refs: LocalRefTracker::new(),
            revoker: Rc::new(NoopRevoker),
            history,
            clipboard: Clipboard::new(),
            selection: SelectionSync::new(),
            selected_paths: Vec::new(),
            ready: Rc::new(Notify::new()),
            was_ready: false,
            deferred: Vec::new(),
            project_id: None,
            content_version: 0,
            viewport: Bounds::new(0.0, 0.0, DEFAULT_WIDTH, DEFAULT_HEIGHT),
            last_placed: None,
            now_ms: 0,
            scene: SceneTree::new(),
            resolver,
            bus,
            config,
        }
    }

    /// Create an engine wrapped for sharing with async drivers.
    #[must_use]
    pub fn shared(config: SyncConfig) -> SharedEngine {
        Rc::new(RefCell::new(Self::new(config)))
    }

    /// Install the host hook that releases local handles.
    pub fn set_revoker(&mut self, revoker: Rc<dyn ObjectUrlRevoker>) {
        self.revoker = revoker;
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Configuration.
    #[must_use]
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Asset reference resolver.
    #[must_use]
    pub const fn resolver(&self) -> &AssetResolver {
        &self.resolver
    }

    /// Scene tree.
    #[must_use]
    pub const fn scene(&self) -> &SceneTree {
        &self.scene
    }

    /// Mutable scene tree, for hosts mirroring their renderer into it.
    ///
    /// Changes are picked up on the next [`Self::on_frame`].
    pub fn scene_mut(&mut self) -> &mut SceneTree {
        &mut self.scene
    }

    /// Instance registry.
    #[must_use]
    pub const fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    /// Signal bus.
    #[must_use]
    pub const fn bus(&self) -> &SignalBus {
        &self.bus
    }

    /// Subscribe to engine signals.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.bus.subscribe()
    }

    /// Upload state machines.
    #[must_use]
    pub const fn uploads(&self) -> &UploadTracker {
        &self.uploads
    }

    /// Live placeholders.
    #[must_use]
    pub const fn placeholders(&self) -> &Placeholders {
        &self.placeholders
    }

    /// Pass scheduler.
    #[must_use]
    pub const fn scheduler(&self) -> &FrameScheduler {
        &self.scheduler
    }

    /// Undo/redo stacks.
    #[must_use]
    pub const fn history(&self) -> &HistoryManager {
        &self.history
    }

    /// Local reference holds and deferred revocations.
    #[must_use]
    pub const fn local_refs(&self) -> &LocalRefTracker {
        &self.local_refs
    }

    /// Clipboard.
    #[must_use]
    pub const fn clipboard(&self) -> &Clipboard {
        &self.clipboard
    }

    /// Active project.
    #[must_use]
    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    /// Version of the loaded or last saved content.
    #[must_use]
    pub const fn content_version(&self) -> u64 {
        self.content_version
    }

    /// Whether the scene has at least one layer.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.scene.is_ready()
    }

    /// Number of operations waiting for the scene.
    #[must_use]
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Set the visible canvas area, used to place new content.
    pub fn set_viewport(&mut self, viewport: Bounds) {
        self.viewport = viewport;
    }

    // -----------------------------------------------------------------------
    // Scheduling and reconciliation
    // -----------------------------------------------------------------------

    /// Frame callback. Turns queued scene changes into pass requests and runs
    /// at most one pass. Returns the pass report if one ran.
    pub fn on_frame(&mut self, now_ms: u64) -> Option<ReconcileReport> {
        self.now_ms = now_ms;
        self.pump_changes();
        if !self.scheduler.begin_frame(now_ms) {
            return None;
        }
        let report = self.run_pass(now_ms);
        self.scheduler.finish(now_ms);
        Some(report)
    }

    /// Ask for a pass on the next frame (e.g. after the host reloaded).
    pub fn request_pass(&mut self) -> bool {
        self.scheduler.request()
    }

    /// Run a pass immediately, outside the frame schedule.
    pub fn reconcile_now(&mut self, now_ms: u64) -> ReconcileReport {
        self.now_ms = now_ms;
        self.pump_changes();
        self.run_pass(now_ms)
    }

    /// Report that a raster finished decoding. The load continuation runs
    /// right away.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is stale or not a raster.
    pub fn raster_decoded(
        &mut self,
        raster: NodeHandle,
        width: u32,
        height: u32,
    ) -> SyncResult<()> {
        self.scene.finish_loading(raster, width, height)?;
        self.pump_changes();
        Ok(())
    }

    fn pump_changes(&mut self) {
        self.check_ready();
        let mut structural = false;
        for change in self.scene.drain_changes() {
            match change {
                SceneChange::RasterLoaded(raster) => {
                    if !self
                        .reconciler
                        .on_raster_loaded(&mut self.scene, &mut self.registry, raster)
                    {
                        self.scheduler.request();
                    }
                }
                SceneChange::Structural | SceneChange::Reset => {
                    structural = true;
                    self.scheduler.request();
                }
                SceneChange::Geometry(_) => {
                    self.scheduler.request();
                }
            }
        }
        if structural {
            self.bus.publish(Signal::SceneStructurallyChanged);
        }
    }

    fn run_pass(&mut self, now_ms: u64) -> ReconcileReport {
        let previous = self.registry.state().clone();
        let (next, report) = self.reconciler.reconcile(&mut self.scene, &previous);
        match report.outcome {
            ReconcileOutcome::RecoveryNeeded => {
                if self.recovery.fire(now_ms) {
                    tracing::warn!("Scene has no layers, recovery needed");
                    self.bus.publish(Signal::RecoveryNeeded {
                        reason: "scene has no layers".to_string(),
                    });
                }
            }
            ReconcileOutcome::Updated => self.registry.apply(next),
            ReconcileOutcome::Unchanged => {}
        }
        // Repairs made by the pass are already reflected in its result.
        for change in self.scene.drain_changes() {
            if let SceneChange::RasterLoaded(raster) = change {
                self.reconciler
                    .on_raster_loaded(&mut self.scene, &mut self.registry, raster);
            }
        }
        self.placeholders.prune(&self.scene);
        self.retry_revocations();
        report
    }

    fn check_ready(&mut self) {
        if !self.scene.is_ready() {
            self.was_ready = false;
            return;
        }
        if self.was_ready {
            return;
        }
        self.was_ready = true;
        self.recovery.reset();
        tracing::info!(layers = self.scene.layers().len(), "Scene ready");
        self.bus.publish(Signal::SceneReady);
        self.ready.notify_waiters();
        self.scheduler.request();
        self.replay_deferred();
    }

    fn defer(&mut self, op: DeferredOp) {
        tracing::info!(op = op.name(), "Scene not ready, deferring");
        self.deferred.push(op);
        if self.recovery.fire(self.now_ms) {
            self.bus.publish(Signal::RecoveryNeeded {
                reason: "scene not ready".to_string(),
            });
        }
    }

    fn replay_deferred(&mut self) {
        let ops = std::mem::take(&mut self.deferred);
        if !ops.is_empty() {
            tracing::info!(count = ops.len(), "Replaying deferred operations");
        }
        for op in ops {
            let name = op.name();
            let result = match op {
                DeferredOp::Restore { snapshot, offset } => {
                    self.restore_snapshot(&snapshot, offset).map(|_| ())
                }
                DeferredOp::AddText(instance) => self.insert_text(instance),
            };
            if let Err(e) = result {
                tracing::warn!(op = name, "Deferred operation failed: {}", e);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Layers
    // -----------------------------------------------------------------------

    /// Add a layer on top. The first layer makes the scene ready.
    pub fn add_layer(&mut self, layer_id: &str, name: &str) -> NodeHandle {
        let handle = self.scene.add_layer(layer_id, name);
        self.check_ready();
        handle
    }

    /// Layers in paint order.
    #[must_use]
    pub fn layers(&self) -> Vec<LayerDescriptor> {
        layers::describe(&self.scene)
    }

    /// Show or hide a layer.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer does not exist.
    pub fn set_layer_visible(&mut self, layer_id: &str, visible: bool) -> SyncResult<()> {
        layers::set_layer_visibility(&mut self.scene, &self.bus, layer_id, visible)
    }

    /// Reorder layers. Returns the resulting order.
    pub fn reorder_layers(&mut self, order: &[String]) -> Vec<String> {
        layers::reorder_layers(&mut self.scene, &self.bus, order)
    }

    // -----------------------------------------------------------------------
    // Content
    // -----------------------------------------------------------------------

    fn node_of(&self, kind: ContentKind, id: &str) -> SyncResult<NodeHandle> {
        let matches = |h: NodeHandle| {
            self.scene
                .node(h)
                .and_then(read_binding)
                .is_some_and(|b| b.kind == kind && b.content_id == id)
        };
        if let Some(h) = self.reconciler.index().node_for(kind, id).filter(|h| matches(*h)) {
            return Ok(h);
        }
        content_nodes(&self.scene)
            .into_iter()
            .find(|h| matches(*h))
            .ok_or_else(|| SyncError::ContentNotFound {
                kind,
                id: id.to_string(),
            })
    }

    fn layer_id_of(&self, layer: NodeHandle) -> Option<String> {
        self.scene.node(layer).and_then(|n| n.data.layer_id.clone())
    }

    /// Add an image from an existing reference.
    ///
    /// `decoded` marks the bitmap as already decoded with that natural size.
    ///
    /// # Errors
    ///
    /// Returns an error if the scene is not ready or `src` is unrecognized.
    pub fn add_image(
        &mut self,
        src: &str,
        bounds: Bounds,
        decoded: Option<(u32, u32)>,
    ) -> SyncResult<String> {
        let reference = self
            .resolver
            .parse(src)
            .ok_or_else(|| SyncError::InvalidAsset(src.to_string()))?;
        let layer = resolve_layer(&self.scene, None)?;
        let id = new_content_id(ContentKind::Image);
        let mut instance = Instance::new(
            id.clone(),
            bounds,
            ImagePayload {
                storage_key: (reference.kind == AssetKind::StorageKey)
                    .then(|| reference.value.clone()),
                remote_url: (reference.kind == AssetKind::RemoteUrl)
                    .then(|| reference.value.clone()),
                natural_width: decoded.map(|(w, _)| w),
                natural_height: decoded.map(|(_, h)| h),
                src: reference.value,
                ..ImagePayload::default()
            },
        );
        instance.layer_id = self.layer_id_of(layer);
        let renderable = self.resolver.to_renderable(&instance.payload.src);
        place_image(&mut self.scene, layer, &instance, &renderable, decoded)?;
        self.last_placed = Some(bounds);
        self.registry.upsert(instance);
        Ok(id)
    }

    /// Add a 3D model card.
    ///
    /// # Errors
    ///
    /// Returns an error if the scene is not ready.
    pub fn add_model(&mut self, payload: ModelPayload, bounds: Bounds) -> SyncResult<String> {
        let layer = resolve_layer(&self.scene, None)?;
        let id = new_content_id(ContentKind::Model3D);
        let mut instance = Instance::new(id.clone(), bounds, payload);
        instance.layer_id = self.layer_id_of(layer);
        place_model(&mut self.scene, layer, &instance)?;
        self.last_placed = Some(bounds);
        self.registry.upsert(instance);
        Ok(id)
    }

    /// Add a video card.
    ///
    /// # Errors
    ///
    /// Returns an error if the scene is not ready.
    pub fn add_video(&mut self, payload: VideoPayload, bounds: Bounds) -> SyncResult<String> {
        let layer = resolve_layer(&self.scene, None)?;
        let id = new_content_id(ContentKind::Video);
        let mut instance = Instance::new(id.clone(), bounds, payload);
        instance.layer_id = self.layer_id_of(layer);
        place_video(&mut self.scene, layer, &instance)?;
        self.last_placed = Some(bounds);
        self.registry.upsert(instance);
        Ok(id)
    }

    /// Add a text block. Before the scene is ready the insertion is deferred;
    /// the returned id is valid either way.
    ///
    /// # Errors
    ///
    /// Returns an error if the scene rejects the node.
    pub fn add_text(&mut self, payload: TextPayload, bounds: Bounds) -> SyncResult<String> {
        let id = new_content_id(ContentKind::Text);
        let instance = Instance::new(id.clone(), bounds, payload);
        if self.scene.is_ready() {
            self.insert_text(instance)?;
        } else {
            self.defer(DeferredOp::AddText(instance));
        }
        Ok(id)
    }

    fn insert_text(&mut self, mut instance: TextInstance) -> SyncResult<()> {
        let layer = resolve_layer(&self.scene, instance.layer_id.as_deref())?;
        instance.layer_id = self.layer_id_of(layer);
        place_text(&mut self.scene, layer, &instance)?;
        self.last_placed = Some(instance.bounds);
        self.registry.upsert(instance);
        Ok(())
    }

    /// Draw a freehand path. The record's id is replaced by a fresh one.
    ///
    /// # Errors
    ///
    /// Returns an error if the scene is not ready.
    pub fn draw_path(&mut self, mut path: PathSnapshot) -> SyncResult<String> {
        let layer = resolve_layer(&self.scene, path.layer_id.as_deref())?;
        path.id = new_content_id(ContentKind::Path);
        path.layer_id = self.layer_id_of(layer);
        place_path(&mut self.scene, layer, &path)?;
        Ok(path.id)
    }

    /// Move an item by `(dx, dy)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the item does not exist.
    pub fn move_content(
        &mut self,
        kind: ContentKind,
        id: &str,
        dx: f32,
        dy: f32,
    ) -> SyncResult<()> {
        let node = self.node_of(kind, id)?;
        self.scene.translate(node, dx, dy)?;
        if let Some(bounds) = self.registry.state().bounds_of(kind, id) {
            self.registry.set_bounds(kind, id, bounds.translated(dx, dy))?;
        }
        Ok(())
    }

    /// Set an item's bounds.
    ///
    /// # Errors
    ///
    /// Returns an error if the item does not exist.
    pub fn resize_content(
        &mut self,
        kind: ContentKind,
        id: &str,
        bounds: Bounds,
    ) -> SyncResult<()> {
        let node = self.node_of(kind, id)?;
        self.scene.set_bounds(node, bounds)?;
        if kind != ContentKind::Path {
            self.registry.set_bounds(kind, id, bounds)?;
        }
        Ok(())
    }

    /// Show or hide an item.
    ///
    /// # Errors
    ///
    /// Returns an error if the item does not exist.
    pub fn set_content_visible(
        &mut self,
        kind: ContentKind,
        id: &str,
        visible: bool,
    ) -> SyncResult<()> {
        let node = self.node_of(kind, id)?;
        self.scene.set_visible(node, visible)?;
        if kind != ContentKind::Path {
            self.registry.set_visible(kind, id, visible)?;
        }
        Ok(())
    }

    /// Delete an item and offer its local references for revocation.
    ///
    /// An upload still in flight for the item is failed and dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the item does not exist.
    pub fn delete_content(&mut self, kind: ContentKind, id: &str) -> SyncResult<()> {
        let node = self.node_of(kind, id)?;
        let released: Vec<String> = match kind {
            ContentKind::Image => self
                .registry
                .get::<ImagePayload>(id)
                .map(|i| owned(i.payload.references()))
                .unwrap_or_default(),
            ContentKind::Video => self
                .registry
                .get::<VideoPayload>(id)
                .map(|i| owned(i.payload.references()))
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        self.scene.remove(node);
        self.registry.remove(kind, id);
        self.selected_paths.retain(|p| p != id);
        if self.uploads.phase(id).is_some_and(|p| !p.is_terminal()) {
            self.fail_upload(id, "content deleted during upload")?;
        }
        self.uploads.remove(id);
        tracing::debug!(kind = %kind, id = %id, "Deleted content");
        for reference in released {
            self.request_revoke(&reference);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    /// Select exactly `targets`.
    pub fn select(&mut self, targets: &[(ContentKind, String)]) -> SelectionToken {
        self.registry.select_only(targets);
        self.selected_paths = targets
            .iter()
            .filter(|(kind, _)| *kind == ContentKind::Path)
            .map(|(_, id)| id.clone())
            .collect();
        self.selection.advance()
    }

    /// Current selection, registry items first, then paths.
    #[must_use]
    pub fn selected(&self) -> Vec<(ContentKind, String)> {
        let mut selected = self.registry.state().selected();
        selected.extend(
            self.selected_paths
                .iter()
                .map(|id| (ContentKind::Path, id.clone())),
        );
        selected
    }

    /// Content under a pointer position.
    #[must_use]
    pub fn hit_test(&self, point: Point, zoom: f32) -> Option<HitTarget> {
        resolve_target(&self.scene, point, zoom, self.config.hit_tolerance)
    }

    /// Select whatever is under the pointer, or clear the selection.
    pub fn select_at(&mut self, point: Point, zoom: f32) -> Option<HitTarget> {
        let target = self.hit_test(point, zoom);
        let targets: Vec<(ContentKind, String)> = target
            .iter()
            .map(|t| (t.kind, t.id.clone()))
            .collect();
        self.select(&targets);
        target
    }

    /// Select every item intersecting `area`.
    pub fn select_in_rect(&mut self, area: &Bounds) -> Vec<HitTarget> {
        let hits = targets_in_rect(&self.scene, area);
        let targets: Vec<(ContentKind, String)> =
            hits.iter().map(|t| (t.kind, t.id.clone())).collect();
        self.select(&targets);
        hits
    }

    /// Whether `token` names the current selection.
    #[must_use]
    pub fn is_current_selection(&self, token: SelectionToken) -> bool {
        self.selection.is_current(token)
    }

    /// Snapshot the selected images for `consumer` and hold their references
    /// on its behalf. Earlier holds of the same consumer are released.
    pub fn capture_selection_for(
        &mut self,
        consumer: &str,
    ) -> (SelectionToken, Vec<ImageInstance>) {
        self.local_refs.release_consumer(consumer);
        let images: Vec<ImageInstance> = self
            .registry
            .images()
            .iter()
            .filter(|i| i.is_selected)
            .cloned()
            .collect();
        for image in &images {
            self.local_refs.hold(&image.payload.src, consumer);
        }
        self.retry_revocations();
        (self.selection.current(), images)
    }

    /// Drop every hold of `consumer` and retry deferred revocations.
    pub fn release_consumer(&mut self, consumer: &str) {
        self.local_refs.release_consumer(consumer);
        self.retry_revocations();
    }

    // -----------------------------------------------------------------------
    // Clipboard
    // -----------------------------------------------------------------------

    /// Copy the selection. Returns the number of items captured.
    pub fn copy(&mut self) -> (usize, Vec<SkippedItem>) {
        let selection = self.selected();
        let (snapshot, skipped) =
            clipboard::capture(self.registry.state(), &self.scene, &selection, &self.resolver);
        let count = snapshot.len();
        self.clipboard.store(snapshot);
        (count, skipped)
    }

    /// Clipboard contents as JSON, for the system clipboard.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn clipboard_json(&self) -> SyncResult<Option<String>> {
        self.clipboard.snapshot().map(Snapshot::to_json).transpose()
    }

    /// Paste the clipboard with a cascading offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the scene rejects a node.
    pub fn paste(&mut self) -> SyncResult<PasteOutcome> {
        let Some(snapshot) = self.clipboard.snapshot().cloned() else {
            return Ok(PasteOutcome::Empty);
        };
        let offset = self.clipboard.next_offset(self.config.paste_offset);
        self.restore_snapshot(&snapshot, offset)
    }

    /// Paste snapshot JSON from an external clipboard. Malformed items are
    /// skipped and reported with the rest.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a JSON object.
    pub fn paste_json(&mut self, json: &str) -> SyncResult<PasteOutcome> {
        let (snapshot, parse_skips) = Snapshot::from_json_lenient(json)?;
        let outcome = self.restore_snapshot(&snapshot, self.config.paste_offset)?;
        Ok(match outcome {
            PasteOutcome::Restored(mut report) => {
                let mut skipped = parse_skips;
                skipped.append(&mut report.skipped);
                report.skipped = skipped;
                PasteOutcome::Restored(report)
            }
            other => other,
        })
    }

    /// Restore `snapshot` under fresh ids, shifted by `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the scene rejects a node.
    pub fn restore_snapshot(
        &mut self,
        snapshot: &Snapshot,
        offset: (f32, f32),
    ) -> SyncResult<PasteOutcome> {
        if snapshot.is_empty() {
            return Ok(PasteOutcome::Empty);
        }
        if !self.scene.is_ready() {
            self.defer(DeferredOp::Restore {
                snapshot: snapshot.clone(),
                offset,
            });
            return Ok(PasteOutcome::Deferred);
        }
        let report = clipboard::restore(
            &mut self.scene,
            &mut self.registry,
            snapshot,
            offset,
            &self.resolver,
        )?;
        self.selected_paths = report
            .ids(ContentKind::Path)
            .into_iter()
            .map(str::to_string)
            .collect();
        self.selection.advance();
        Ok(PasteOutcome::Restored(report))
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    fn document_snapshot(&self, label: &str) -> SyncResult<DocumentSnapshot> {
        Ok(DocumentSnapshot {
            label: label.to_string(),
            scene: self.scene.export_json()?,
            assets: Snapshot::of_registry(
                self.registry.state(),
                clipboard::capture_all_paths(&self.scene),
            ),
        })
    }

    /// Record the current document state under `label`.
    ///
    /// Returns `false` if a restore is in progress.
    ///
    /// # Errors
    ///
    /// Returns an error if the scene cannot be serialized.
    pub fn commit(&mut self, label: &str) -> SyncResult<bool> {
        if self.history.is_restoring() {
            return Ok(false);
        }
        let snapshot = self.document_snapshot(label)?;
        Ok(self.history.commit(snapshot))
    }

    /// Undo the last commit.
    ///
    /// # Errors
    ///
    /// Returns an error if there is nothing to undo or the restore fails.
    pub fn undo(&mut self) -> SyncResult<ReplayMode> {
        let traversal = self.history.undo()?;
        self.apply_traversal(&traversal)
    }

    /// Redo the last undone commit.
    ///
    /// # Errors
    ///
    /// Returns an error if there is nothing to redo or the restore fails.
    pub fn redo(&mut self) -> SyncResult<ReplayMode> {
        let traversal = self.history.redo()?;
        self.apply_traversal(&traversal)
    }

    fn apply_traversal(&mut self, traversal: &Traversal) -> SyncResult<ReplayMode> {
        self.history.begin_restore();
        let result = match traversal.mode {
            ReplayMode::BoundsOnly => match self.replay_bounds(&traversal.target.assets) {
                Ok(()) => Ok(ReplayMode::BoundsOnly),
                Err(e) => {
                    tracing::warn!(
                        label = %traversal.label,
                        "Bounds replay failed, rebuilding: {}",
                        e
                    );
                    self.rebuild(&traversal.target, &traversal.label)
                        .map(|()| ReplayMode::Full)
                }
            },
            ReplayMode::Full => self
                .rebuild(&traversal.target, &traversal.label)
                .map(|()| ReplayMode::Full),
        };
        self.history.end_restore();
        self.selection.advance();
        result
    }

    fn replay_bounds(&mut self, assets: &Snapshot) -> SyncResult<()> {
        let placements = assets.placements();
        let nodes = placements
            .iter()
            .map(|p| self.node_of(p.kind, p.id))
            .collect::<SyncResult<Vec<NodeHandle>>>()?;
        for (placement, node) in placements.iter().zip(nodes) {
            let current = self.scene.placement_bounds(node);
            if !current.is_some_and(|b| b.approx_eq(&placement.bounds)) {
                self.scene.set_bounds(node, placement.bounds)?;
            }
            if placement.kind != ContentKind::Path {
                self.registry
                    .set_bounds(placement.kind, placement.id, placement.bounds)?;
            }
        }
        tracing::debug!(items = placements.len(), "Replayed bounds");
        Ok(())
    }

    fn rebuild(&mut self, target: &DocumentSnapshot, label: &str) -> SyncResult<()> {
        self.scene.import_json(&target.scene)?;
        self.reconciler.reset();
        self.placeholders.clear();
        self.selected_paths.clear();
        self.registry.apply(target.assets.registry_state());
        self.run_pass(self.now_ms);
        tracing::info!(label, "Scene reconstructed from history");
        self.bus.publish(Signal::SceneReconstructed {
            label: label.to_string(),
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Uploads
    // -----------------------------------------------------------------------

    fn last_content_bounds(&self) -> Option<Bounds> {
        self.last_placed.or_else(|| {
            self.registry
                .state()
                .all_common()
                .into_iter()
                .rev()
                .map(|(_, c)| c.bounds)
                .find(|b| !b.is_degenerate())
        })
    }

    /// Draw a placeholder at the predicted position and start tracking an
    /// upload. Returns the placeholder id, which becomes the content id.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SceneNotReady`] if the scene has no layers.
    pub fn begin_upload(
        &mut self,
        kind: ContentKind,
        footprint: Option<(f32, f32)>,
    ) -> SyncResult<String> {
        if !matches!(kind, ContentKind::Image | ContentKind::Video | ContentKind::Model3D) {
            return Err(SyncError::InvalidOperation {
                kind,
                reason: "only images, videos and models are uploaded".to_string(),
            });
        }
        let layer = resolve_layer(&self.scene, None)?;
        let id = new_content_id(kind);
        let size = footprint.unwrap_or(self.config.placeholder_size);
        let bounds = predict_placement(
            self.last_content_bounds(),
            self.viewport,
            size,
            self.config.placeholder_gap,
        );
        self.placeholders.create(&mut self.scene, layer, &id, bounds)?;
        self.uploads.request(&id, kind, bounds)?;
        self.last_placed = Some(bounds);
        tracing::info!(id = %id, kind = %kind, "Upload requested");
        Ok(id)
    }

    /// Replace the placeholder with a real instance rendering the local asset.
    ///
    /// # Errors
    ///
    /// Returns an error if the upload is unknown or not in `Requested`.
    pub fn show_local_preview(&mut self, id: &str, local: LocalAsset) -> SyncResult<()> {
        let kind = self
            .uploads
            .get(id)
            .map(|r| r.kind)
            .ok_or_else(|| SyncError::UnknownUpload(id.to_string()))?;
        let placeholder = self
            .placeholders
            .get(id)
            .map(|p| p.bounds)
            .or(self.last_placed)
            .unwrap_or_else(|| Bounds::centered_at(self.viewport.center(), 1.0, 1.0));
        self.uploads.to_local_preview(id, &local.reference)?;
        self.placeholders.remove(&mut self.scene, id);

        let bounds = match local.natural_size {
            #[allow(clippy::cast_precision_loss)]
            Some((w, h)) => placeholder.fit(w as f32, h as f32),
            None => placeholder,
        };
        let layer = resolve_layer(&self.scene, None)?;
        let layer_id = self.layer_id_of(layer);
        match kind {
            ContentKind::Image => {
                let mut instance = Instance::new(
                    id,
                    bounds,
                    ImagePayload {
                        src: local.reference.clone(),
                        pending_upload: true,
                        natural_width: local.natural_size.map(|(w, _)| w),
                        natural_height: local.natural_size.map(|(_, h)| h),
                        file_name: local.file_name,
                        ..ImagePayload::default()
                    },
                );
                instance.layer_id = layer_id;
                place_image(
                    &mut self.scene,
                    layer,
                    &instance,
                    &local.reference,
                    local.natural_size,
                )?;
                self.registry.upsert(instance);
            }
            ContentKind::Video => {
                let mut instance = Instance::new(
                    id,
                    bounds,
                    VideoPayload {
                        src: local.reference,
                        pending_upload: true,
                        ..VideoPayload::default()
                    },
                );
                instance.layer_id = layer_id;
                place_video(&mut self.scene, layer, &instance)?;
                self.registry.upsert(instance);
            }
            ContentKind::Model3D => {
                let mut instance = Instance::new(
                    id,
                    bounds,
                    ModelPayload {
                        model_url: local.reference,
                        file_name: local.file_name,
                        format: None,
                    },
                );
                instance.layer_id = layer_id;
                place_model(&mut self.scene, layer, &instance)?;
                self.registry.upsert(instance);
            }
            ContentKind::Text | ContentKind::Path => {
                return Err(SyncError::InvalidOperation {
                    kind,
                    reason: "not an uploadable kind".to_string(),
                });
            }
        }
        self.last_placed = Some(bounds);
        tracing::info!(id = %id, "Local preview shown");
        Ok(())
    }

    /// Publish upload progress for a placeholder.
    pub fn report_progress(&mut self, id: &str, progress: f32) {
        let progress = self
            .placeholders
            .set_progress(id, progress)
            .unwrap_or_else(|| progress.clamp(0.0, 1.0));
        self.bus.publish(Signal::PlaceholderProgress {
            placeholder_id: id.to_string(),
            progress,
        });
    }

    /// Record the durable reference returned by the backend.
    ///
    /// The key and URL are written into the payload and the node attributes;
    /// the pixels keep coming from the local asset.
    ///
    /// # Errors
    ///
    /// Returns an error if the receipt holds no usable reference, the upload
    /// is not in `LocalPreview`, or the content was removed.
    pub fn record_persisted(
        &mut self,
        id: &str,
        receipt: &UploadReceipt,
    ) -> SyncResult<AssetReference> {
        let durable = self
            .resolver
            .prefer([receipt.key.as_str(), receipt.url.as_str()])
            .filter(|r| r.kind.is_persistable())
            .ok_or_else(|| SyncError::InvalidAsset(receipt.key.clone()))?;
        let kind = self
            .uploads
            .expect_phase(id, "local-preview", "persisted-metadata")?
            .kind;
        let node = match kind {
            ContentKind::Image | ContentKind::Video => Some(self.node_of(kind, id)?),
            _ => None,
        };

        let key = (!receipt.key.is_empty()).then(|| receipt.key.clone());
        let url = (!receipt.url.is_empty()).then(|| receipt.url.clone());
        match kind {
            ContentKind::Image => self.registry.modify::<ImagePayload>(id, |i| {
                i.payload.storage_key.clone_from(&key);
                i.payload.remote_url.clone_from(&url);
            })?,
            ContentKind::Video => self.registry.modify::<VideoPayload>(id, |i| {
                i.payload.storage_key.clone_from(&key);
                i.payload.remote_url.clone_from(&url);
            })?,
            _ => {}
        }
        if let Some(data) = node.and_then(|n| self.scene.data_mut(n)) {
            for (attr, value) in [(ATTR_STORAGE_KEY, &key), (ATTR_REMOTE_URL, &url)] {
                if let Some(v) = value {
                    data.attrs.insert(attr.to_string(), v.clone());
                }
            }
        }
        self.uploads.to_persisted(id, durable.clone())?;
        tracing::info!(id = %id, reference = %durable.value, "Upload persisted");
        self.bus.publish(Signal::AssetUpgraded {
            placeholder_id: id.to_string(),
            reference: durable.clone(),
        });
        Ok(durable)
    }

    /// Switch the rendered source to the durable asset, which the caller has
    /// already decoded off-tree, then offer the local reference for
    /// revocation. The finished upload is no longer tracked.
    ///
    /// # Errors
    ///
    /// Returns an error if the upload is not in `PersistedMetadata` or the
    /// content was removed.
    pub fn complete_swap(&mut self, id: &str, decoded: DecodedAsset) -> SyncResult<()> {
        let record = self
            .uploads
            .expect_phase(id, "persisted-metadata", "remote-swapped")?;
        let kind = record.kind;
        let UploadPhase::PersistedMetadata { durable, .. } = record.phase.clone() else {
            return Err(SyncError::UnknownUpload(id.to_string()));
        };
        let node = self.node_of(kind, id)?;
        let renderable = self.resolver.to_renderable(&durable.value);

        match kind {
            ContentKind::Image => {
                let raster = self
                    .scene
                    .children(node)
                    .iter()
                    .copied()
                    .find(|h| self.scene.node(*h).and_then(Node::raster).is_some())
                    .ok_or(SyncError::NodeNotFound(node))?;
                self.scene.swap_raster_source(raster, &renderable)?;
                if let Some(data) = self.scene.data_mut(node) {
                    data.attrs.remove(ATTR_PENDING_UPLOAD);
                }
                self.registry.modify::<ImagePayload>(id, |i| {
                    i.payload.src.clone_from(&durable.value);
                    i.payload.pending_upload = false;
                    i.payload.natural_width = Some(decoded.width);
                    i.payload.natural_height = Some(decoded.height);
                })?;
            }
            ContentKind::Video => {
                if let Some(data) = self.scene.data_mut(node) {
                    data.attrs.insert(ATTR_SRC.to_string(), durable.value.clone());
                    data.attrs.remove(ATTR_PENDING_UPLOAD);
                }
                self.registry.modify::<VideoPayload>(id, |i| {
                    i.payload.src.clone_from(&durable.value);
                    i.payload.pending_upload = false;
                })?;
            }
            ContentKind::Model3D => {
                if let Some(data) = self.scene.data_mut(node) {
                    data.attrs.insert(ATTR_MODEL_URL.to_string(), durable.value.clone());
                }
                self.registry.modify::<ModelPayload>(id, |i| {
                    i.payload.model_url.clone_from(&durable.value);
                })?;
            }
            ContentKind::Text | ContentKind::Path => {}
        }
        let (released, _) = self.uploads.to_swapped(id)?;
        self.uploads.remove(id);
        tracing::info!(id = %id, reference = %durable.value, "Swapped to durable asset");
        self.request_revoke(&released);
        Ok(())
    }

    /// Mark an upload failed. A local preview, if shown, stays on screen; a
    /// bare placeholder is removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the upload is unknown or already terminal.
    pub fn fail_upload(&mut self, id: &str, message: &str) -> SyncResult<()> {
        self.uploads.fail(id, message)?;
        self.placeholders.remove(&mut self.scene, id);
        tracing::warn!(id = %id, "Upload failed: {}", message);
        self.bus.publish(Signal::UploadFailed {
            placeholder_id: id.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Revocation
    // -----------------------------------------------------------------------

    /// Hold `reference` on behalf of an external consumer.
    pub fn hold_reference(&mut self, reference: &str, consumer: &str) {
        self.local_refs.hold(reference, consumer);
    }

    /// Release a hold and retry deferred revocations.
    pub fn release_reference(&mut self, reference: &str, consumer: &str) {
        self.local_refs.release(reference, consumer);
        self.retry_revocations();
    }

    /// Revoke `reference` if nothing reaches it, otherwise defer.
    pub fn request_revoke(&mut self, reference: &str) -> RevokeOutcome {
        let uploads = self.uploads.local_references();
        let reach = Reachability {
            registry: self.registry.state(),
            scene: &self.scene,
            uploads: &uploads,
        };
        self.local_refs
            .request_revoke(&self.resolver, reference, &reach, self.revoker.as_ref())
    }

    /// Retry deferred revocations. Returns the references revoked.
    pub fn retry_revocations(&mut self) -> Vec<String> {
        if self.local_refs.deferred().is_empty() {
            return Vec::new();
        }
        let uploads = self.uploads.local_references();
        let reach = Reachability {
            registry: self.registry.state(),
            scene: &self.scene,
            uploads: &uploads,
        };
        self.local_refs
            .retry_deferred(&self.resolver, &reach, self.revoker.as_ref())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    fn local_references(&self) -> Vec<String> {
        let mut refs: Vec<String> = self
            .registry
            .state()
            .references()
            .into_iter()
            .chain(self.uploads.local_references())
            .filter(|r| self.resolver.classify(r) == Some(AssetKind::LocalEphemeral))
            .map(str::to_string)
            .collect();
        refs.sort();
        refs.dedup();
        refs
    }

    /// Remove every layer, node and instance.
    pub fn clear_scene(&mut self) {
        let released = self.local_references();
        self.scene.clear();
        self.scene.drain_changes();
        self.reconciler.reset();
        self.placeholders.clear();
        self.uploads.clear();
        self.registry.clear();
        self.scheduler.reset();
        self.selected_paths.clear();
        self.last_placed = None;
        self.was_ready = false;
        self.selection.advance();
        for reference in released {
            self.request_revoke(&reference);
        }
        tracing::info!("Scene cleared");
        self.bus.publish(Signal::SceneCleared);
    }

    /// Switch to another project: clear the scene and select its history.
    pub fn switch_project(&mut self, project_id: &str) {
        self.clear_scene();
        self.deferred.clear();
        self.history.set_active(project_id);
        self.project_id = Some(project_id.to_string());
        self.content_version = 0;
        self.recovery.reset();
        tracing::info!(project = %project_id, "Switched project");
        self.bus.publish(Signal::ProjectSwitched {
            project_id: project_id.to_string(),
        });
    }

    /// Release everything. Deferred revocations are forced.
    pub fn teardown(&mut self) {
        self.clear_scene();
        let forced = self.local_refs.revoke_all(self.revoker.as_ref());
        self.deferred.clear();
        self.history.clear();
        self.clipboard.clear();
        self.project_id = None;
        tracing::info!(forced, "Engine torn down");
    }

    // -----------------------------------------------------------------------
    // Content import/export
    // -----------------------------------------------------------------------

    /// Export the current project content.
    ///
    /// # Errors
    ///
    /// Returns an error if the scene cannot be serialized.
    pub fn export_content(&self) -> SyncResult<ProjectContent> {
        Ok(ProjectContent {
            version: self.content_version,
            layers: layers::describe(&self.scene),
            assets: Snapshot::of_registry(
                self.registry.state(),
                clipboard::capture_all_paths(&self.scene),
            ),
            scene: Some(self.scene.export_json()?),
        })
    }

    /// Record a successful save.
    pub fn mark_saved(&mut self, version: u64) {
        self.content_version = version;
    }

    /// Replace scene and registry with `content`.
    ///
    /// A stored scene is imported as-is; otherwise layers are created from
    /// the descriptors and every record is placed through the construction
    /// path. The records seed the registry so their bounds survive while
    /// rasters decode. The loaded state becomes the history baseline.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored scene is malformed or a node cannot be
    /// placed.
    pub fn load_content(&mut self, content: &ProjectContent) -> SyncResult<()> {
        self.scene.clear();
        self.reconciler.reset();
        self.placeholders.clear();
        self.scheduler.reset();
        self.selected_paths.clear();
        self.last_placed = None;

        match &content.scene {
            Some(json) => self.scene.import_json(json)?,
            None => {
                layers::create_layers(&mut self.scene, &content.layers)?;
                if !self.scene.is_ready() {
                    self.scene.add_layer(DEFAULT_LAYER, "Layer 1");
                }
                self.place_records(&content.assets)?;
            }
        }
        self.registry.apply(content.assets.registry_state());
        self.content_version = content.version;
        self.check_ready();
        self.run_pass(self.now_ms);

        let document = self
            .project_id
            .clone()
            .unwrap_or_else(|| DEFAULT_DOCUMENT.to_string());
        self.history.forget(&document);
        self.history.set_active(&document);
        self.commit("load")?;
        Ok(())
    }

    fn place_records(&mut self, assets: &Snapshot) -> SyncResult<usize> {
        let mut placed = 0;
        for record in &assets.images {
            let layer = resolve_layer(&self.scene, record.layer_id.as_deref())?;
            let instance = record.instance(&record.id);
            let renderable = self.resolver.to_renderable(&record.src);
            place_image(&mut self.scene, layer, &instance, &renderable, None)?;
            placed += 1;
        }
        for record in &assets.models {
            let layer = resolve_layer(&self.scene, record.layer_id.as_deref())?;
            place_model(&mut self.scene, layer, &record.instance(&record.id))?;
            placed += 1;
        }
        for record in &assets.texts {
            let layer = resolve_layer(&self.scene, record.layer_id.as_deref())?;
            place_text(&mut self.scene, layer, &record.instance(&record.id))?;
            placed += 1;
        }
        for record in &assets.videos {
            let layer = resolve_layer(&self.scene, record.layer_id.as_deref())?;
            place_video(&mut self.scene, layer, &record.instance(&record.id))?;
            placed += 1;
        }
        for record in &assets.paths {
            let layer = resolve_layer(&self.scene, record.layer_id.as_deref())?;
            place_path(&mut self.scene, layer, record)?;
            placed += 1;
        }
        Ok(placed)
    }

    /// Rebuild missing scene content from the retained registry.
    ///
    /// Used after the substrate lost its tree (reload, crash) while the
    /// registry survived. Missing layers are recreated from the instances'
    /// layer ids. Returns the number of items placed.
    ///
    /// # Errors
    ///
    /// Returns an error if a node cannot be placed.
    pub fn recover_scene(&mut self) -> SyncResult<usize> {
        let state = self.registry.state().clone();
        let mut layer_ids: Vec<String> = Vec::new();
        for (_, common) in state.all_common() {
            if let Some(layer_id) = common.layer_id {
                if !layer_ids.contains(&layer_id) {
                    layer_ids.push(layer_id);
                }
            }
        }
        for layer_id in &layer_ids {
            if self.scene.layer_by_id(layer_id).is_none() {
                self.scene.add_layer(layer_id, layer_id);
            }
        }
        if !self.scene.is_ready() {
            self.scene.add_layer(DEFAULT_LAYER, "Layer 1");
        }

        let present: Vec<(ContentKind, String)> = content_nodes(&self.scene)
            .into_iter()
            .filter_map(|h| self.scene.node(h).and_then(read_binding))
            .map(|b| (b.kind, b.content_id))
            .collect();
        let missing =
            |kind: ContentKind, id: &str| !present.iter().any(|(k, i)| *k == kind && i == id);

        let mut recovered = Snapshot::of_registry(&state, Vec::new());
        recovered.images.retain(|r| missing(ContentKind::Image, &r.id));
        recovered.models.retain(|r| missing(ContentKind::Model3D, &r.id));
        recovered.texts.retain(|r| missing(ContentKind::Text, &r.id));
        recovered.videos.retain(|r| missing(ContentKind::Video, &r.id));
        let placed = self.place_records(&recovered)?;

        self.check_ready();
        self.run_pass(self.now_ms);
        tracing::info!(placed, "Recovered scene from registry");
        Ok(placed)
    }
}

/// Wait until the engine's scene has at least one layer.
///
/// Never holds a borrow across the wait.
pub async fn wait_until_ready(engine: &SharedEngine) {
    loop {
        let notify = {
            let e = engine.borrow();
            if e.scene.is_ready() {
                return;
            }
            Rc::clone(&e.ready)
        };
        notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_engine() -> SyncEngine {
        let mut engine = SyncEngine::default();
        engine.add_layer("l1", "Layer 1");
        engine
    }

    fn drain(rx: &mut broadcast::Receiver<Signal>) -> Vec<Signal> {
        let mut out = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            out.push(signal);
        }
        out
    }

    #[test]
    fn test_first_layer_publishes_ready_once() {
        let mut engine = SyncEngine::default();
        let mut rx = engine.subscribe();
        engine.add_layer("l1", "Layer 1");
        engine.add_layer("l2", "Layer 2");
        let ready = drain(&mut rx)
            .into_iter()
            .filter(|s| *s == Signal::SceneReady)
            .count();
        assert_eq!(ready, 1);
    }

    #[test]
    fn test_one_pass_per_frame() {
        let mut engine = ready_engine();
        engine
            .add_image("projects/a.png", Bounds::new(0.0, 0.0, 10.0, 10.0), Some((10, 10)))
            .expect("image");
        engine
            .add_image("projects/b.png", Bounds::new(20.0, 0.0, 10.0, 10.0), Some((10, 10)))
            .expect("image");
        assert!(engine.on_frame(0).is_some());
        assert!(engine.on_frame(1).is_none());
        assert_eq!(engine.scheduler().passes(), 1);
        assert_eq!(engine.registry().images().len(), 2);
    }

    #[test]
    fn test_text_deferred_until_ready() {
        let mut engine = SyncEngine::default();
        let mut rx = engine.subscribe();
        let id = engine
            .add_text(TextPayload::default(), Bounds::new(0.0, 0.0, 100.0, 20.0))
            .expect("text");
        assert_eq!(engine.deferred_len(), 1);
        assert!(drain(&mut rx)
            .iter()
            .any(|s| matches!(s, Signal::RecoveryNeeded { .. })));

        engine.add_layer("l1", "Layer 1");
        assert_eq!(engine.deferred_len(), 0);
        let text = engine.registry().get::<TextPayload>(&id).expect("text");
        assert_eq!(text.layer_id.as_deref(), Some("l1"));
    }

    #[test]
    fn test_move_updates_scene_and_registry() {
        let mut engine = ready_engine();
        let id = engine
            .add_image("projects/a.png", Bounds::new(0.0, 0.0, 10.0, 10.0), Some((10, 10)))
            .expect("image");
        engine.move_content(ContentKind::Image, &id, 5.0, 5.0).expect("move");
        assert_eq!(
            engine.registry().state().bounds_of(ContentKind::Image, &id),
            Some(Bounds::new(5.0, 5.0, 10.0, 10.0))
        );
        engine.on_frame(0);
        assert_eq!(
            engine.registry().state().bounds_of(ContentKind::Image, &id),
            Some(Bounds::new(5.0, 5.0, 10.0, 10.0))
        );
    }

    #[test]
    fn test_delete_removes_everywhere() {
        let mut engine = ready_engine();
        let id = engine
            .add_image("projects/a.png", Bounds::new(0.0, 0.0, 10.0, 10.0), Some((10, 10)))
            .expect("image");
        engine.delete_content(ContentKind::Image, &id).expect("delete");
        assert!(engine.registry().images().is_empty());
        assert!(content_nodes(engine.scene()).is_empty());
        assert!(matches!(
            engine.delete_content(ContentKind::Image, &id),
            Err(SyncError::ContentNotFound { .. })
        ));
    }

    #[test]
    fn test_select_at_advances_token() {
        let mut engine = ready_engine();
        let id = engine
            .add_image("projects/a.png", Bounds::new(0.0, 0.0, 100.0, 100.0), Some((100, 100)))
            .expect("image");
        let before = engine.selection.current();
        let target = engine.select_at(Point::new(50.0, 50.0), 1.0).expect("hit");
        assert_eq!(target.id, id);
        assert!(!engine.is_current_selection(before));
        assert_eq!(engine.selected(), vec![(ContentKind::Image, id)]);

        assert!(engine.select_at(Point::new(500.0, 500.0), 1.0).is_none());
        assert!(engine.selected().is_empty());
    }

    #[test]
    fn test_recover_scene_from_registry() {
        let mut engine = ready_engine();
        let id = engine
            .add_image("projects/a.png", Bounds::new(0.0, 0.0, 10.0, 10.0), Some((10, 10)))
            .expect("image");
        engine.on_frame(0);

        engine.scene_mut().clear();
        let report = engine.reconcile_now(100);
        assert_eq!(report.outcome, ReconcileOutcome::RecoveryNeeded);
        assert_eq!(engine.registry().images().len(), 1);

        assert_eq!(engine.recover_scene().expect("recover"), 1);
        assert!(engine.is_ready());
        let image = engine.registry().get::<ImagePayload>(&id).expect("image");
        assert_eq!(image.bounds, Bounds::new(0.0, 0.0, 10.0, 10.0));
        assert_eq!(image.layer_id.as_deref(), Some("l1"));
    }

    #[test]
    fn test_clear_scene_publishes_and_resets() {
        let mut engine = ready_engine();
        engine
            .add_image("projects/a.png", Bounds::new(0.0, 0.0, 10.0, 10.0), None)
            .expect("image");
        let mut rx = engine.subscribe();
        engine.clear_scene();
        assert!(drain(&mut rx).contains(&Signal::SceneCleared));
        assert!(!engine.is_ready());
        assert!(engine.registry().state().is_empty());
    }

    #[test]
    fn test_load_without_project_resets_default_history() {
        let mut engine = ready_engine();
        let id = engine
            .add_image("projects/a.png", Bounds::new(0.0, 0.0, 10.0, 10.0), Some((10, 10)))
            .expect("image");
        assert!(engine.commit("add-image").expect("commit"));
        engine
            .move_content(ContentKind::Image, &id, 5.0, 5.0)
            .expect("move");
        assert!(engine.commit("move-image").expect("commit"));
        assert_eq!(engine.history().undo_depth(), 1);

        let content = ProjectContent {
            layers: vec![LayerDescriptor::new("l1", "Layer 1")],
            ..ProjectContent::default()
        };
        engine.load_content(&content).expect("load");
        assert_eq!(engine.history().active(), Some(DEFAULT_DOCUMENT));
        assert_eq!(engine.history().undo_depth(), 0);
        assert_eq!(
            engine.history().present().map(|p| p.label.as_str()),
            Some("load")
        );
        assert!(engine.undo().is_err());
    }

    #[test]
    fn test_upload_steps_leave_state_untouched_on_error() {
        let mut engine = ready_engine();
        let id = engine
            .begin_upload(ContentKind::Image, Some((64.0, 64.0)))
            .expect("begin");
        engine
            .show_local_preview(
                &id,
                LocalAsset {
                    reference: "blob:https://app.example.com/a".into(),
                    file_name: None,
                    natural_size: Some((64, 64)),
                },
            )
            .expect("preview");

        assert!(engine
            .complete_swap(&id, DecodedAsset { width: 64, height: 64 })
            .is_err());
        let empty = UploadReceipt {
            key: String::new(),
            url: String::new(),
        };
        assert!(matches!(
            engine.record_persisted(&id, &empty),
            Err(SyncError::InvalidAsset(_))
        ));

        assert!(matches!(
            engine.uploads().phase(&id),
            Some(UploadPhase::LocalPreview { .. })
        ));
        let image = engine.registry().get::<ImagePayload>(&id).expect("image");
        assert!(image.payload.pending_upload);
        assert_eq!(image.payload.src, "blob:https://app.example.com/a");
        assert!(image.payload.storage_key.is_none());
    }
}
