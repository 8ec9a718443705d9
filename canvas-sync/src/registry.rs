//! Instance registry: four versioned collections of content instances.
//!
//! Collections are shared as `Rc<Vec<_>>` so that overlays can hold on to a
//! snapshot cheaply and compare versions by pointer. Every mutation goes
//! through the registry, bumps the collection version and publishes
//! [`Signal::RegistryChanged`].

use std::collections::HashMap;
use std::rc::Rc;

use crate::binding::ContentKind;
use crate::error::{SyncError, SyncResult};
use crate::geometry::Bounds;
use crate::model::{
    ImageInstance, ImagePayload, Instance, ModelInstance, ModelPayload, Payload, TextInstance,
    TextPayload, VideoInstance, VideoPayload,
};
use crate::signal::{Signal, SignalBus};

/// The four registry collections at one point in time.
#[derive(Debug, Clone, Default)]
pub struct RegistryState {
    /// Images.
    pub images: Rc<Vec<ImageInstance>>,
    /// 3D model cards.
    pub models: Rc<Vec<ModelInstance>>,
    /// Text blocks.
    pub texts: Rc<Vec<TextInstance>>,
    /// Videos.
    pub videos: Rc<Vec<VideoInstance>>,
}

impl RegistryState {
    /// Whether every collection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
            && self.models.is_empty()
            && self.texts.is_empty()
            && self.videos.is_empty()
    }

    /// Total number of instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.images.len() + self.models.len() + self.texts.len() + self.videos.len()
    }

    /// Ids in one collection, in order. Paths have no collection.
    #[must_use]
    pub fn ids(&self, kind: ContentKind) -> Vec<String> {
        match kind {
            ContentKind::Image => collect_ids(&self.images),
            ContentKind::Model3D => collect_ids(&self.models),
            ContentKind::Text => collect_ids(&self.texts),
            ContentKind::Video => collect_ids(&self.videos),
            ContentKind::Path => Vec::new(),
        }
    }

    /// Whether an instance exists.
    #[must_use]
    pub fn contains(&self, kind: ContentKind, id: &str) -> bool {
        self.common(kind, id).is_some()
    }

    /// Bounds of an instance.
    #[must_use]
    pub fn bounds_of(&self, kind: ContentKind, id: &str) -> Option<Bounds> {
        self.common(kind, id).map(|c| c.bounds)
    }

    /// Shared fields of an instance, regardless of its payload type.
    #[must_use]
    pub fn common(&self, kind: ContentKind, id: &str) -> Option<CommonFields> {
        match kind {
            ContentKind::Image => find_common(&self.images, id),
            ContentKind::Model3D => find_common(&self.models, id),
            ContentKind::Text => find_common(&self.texts, id),
            ContentKind::Video => find_common(&self.videos, id),
            ContentKind::Path => None,
        }
    }

    /// Shared fields of every instance, keyed by `(kind, id)`.
    #[must_use]
    pub fn all_common(&self) -> Vec<(ContentKind, CommonFields)> {
        let mut out = Vec::with_capacity(self.len());
        out.extend(self.images.iter().map(|i| (ContentKind::Image, CommonFields::of(i))));
        out.extend(self.models.iter().map(|i| (ContentKind::Model3D, CommonFields::of(i))));
        out.extend(self.texts.iter().map(|i| (ContentKind::Text, CommonFields::of(i))));
        out.extend(self.videos.iter().map(|i| (ContentKind::Video, CommonFields::of(i))));
        out
    }

    /// Every selected `(kind, id)`.
    #[must_use]
    pub fn selected(&self) -> Vec<(ContentKind, String)> {
        self.all_common()
            .into_iter()
            .filter(|(_, c)| c.is_selected)
            .map(|(kind, c)| (kind, c.id))
            .collect()
    }

    /// Asset references kept alive by registry payloads.
    #[must_use]
    pub fn references(&self) -> Vec<&str> {
        let mut refs = Vec::new();
        refs.extend(self.images.iter().flat_map(|i| i.payload.references()));
        refs.extend(self.videos.iter().flat_map(|i| i.payload.references()));
        refs
    }

    /// Whether every collection is the same allocation as in `other`.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.images, &other.images)
            && Rc::ptr_eq(&self.models, &other.models)
            && Rc::ptr_eq(&self.texts, &other.texts)
            && Rc::ptr_eq(&self.videos, &other.videos)
    }

    /// Typed lookup.
    #[must_use]
    pub fn get<P: Registered>(&self, id: &str) -> Option<&Instance<P>> {
        P::collection(self).iter().find(|i| i.id == id)
    }
}

/// Fields every instance has.
#[derive(Debug, Clone, PartialEq)]
pub struct CommonFields {
    /// Id.
    pub id: String,
    /// Bounds of record.
    pub bounds: Bounds,
    /// Visibility.
    pub visible: bool,
    /// Owning layer.
    pub layer_id: Option<String>,
    /// Selection state.
    pub is_selected: bool,
}

impl CommonFields {
    fn of<P>(instance: &Instance<P>) -> Self {
        Self {
            id: instance.id.clone(),
            bounds: instance.bounds,
            visible: instance.visible,
            layer_id: instance.layer_id.clone(),
            is_selected: instance.is_selected,
        }
    }
}

fn collect_ids<P>(items: &[Instance<P>]) -> Vec<String> {
    items.iter().map(|i| i.id.clone()).collect()
}

fn find_common<P>(items: &[Instance<P>], id: &str) -> Option<CommonFields> {
    items.iter().find(|i| i.id == id).map(CommonFields::of)
}

/// Payloads that have a registry collection.
pub trait Registered: Payload {
    /// The collection holding this payload type.
    fn collection(state: &RegistryState) -> &Rc<Vec<Instance<Self>>>;
    /// Mutable access to the collection.
    fn collection_mut(state: &mut RegistryState) -> &mut Rc<Vec<Instance<Self>>>;
}

macro_rules! registered {
    ($payload:ty, $field:ident) => {
        impl Registered for $payload {
            fn collection(state: &RegistryState) -> &Rc<Vec<Instance<Self>>> {
                &state.$field
            }
            fn collection_mut(state: &mut RegistryState) -> &mut Rc<Vec<Instance<Self>>> {
                &mut state.$field
            }
        }
    };
}

registered!(ImagePayload, images);
registered!(ModelPayload, models);
registered!(TextPayload, texts);
registered!(VideoPayload, videos);

/// Run `$body` against the typed instance for `$kind`.
macro_rules! dispatch {
    ($self:ident, $kind:expr, $id:expr, |$inst:ident| $body:expr) => {
        match $kind {
            ContentKind::Image => $self.modify::<ImagePayload>($id, |$inst| $body),
            ContentKind::Model3D => $self.modify::<ModelPayload>($id, |$inst| $body),
            ContentKind::Text => $self.modify::<TextPayload>($id, |$inst| $body),
            ContentKind::Video => $self.modify::<VideoPayload>($id, |$inst| $body),
            ContentKind::Path => Err(SyncError::InvalidOperation {
                kind: ContentKind::Path,
                reason: "paths have no registry entry".to_string(),
            }),
        }
    };
}

/// Owned, versioned store of content instances.
#[derive(Debug)]
pub struct InstanceRegistry {
    state: RegistryState,
    versions: HashMap<ContentKind, u64>,
    bus: SignalBus,
}

impl InstanceRegistry {
    /// Create an empty registry publishing on `bus`.
    #[must_use]
    pub fn new(bus: SignalBus) -> Self {
        Self {
            state: RegistryState::default(),
            versions: HashMap::new(),
            bus,
        }
    }

    /// Current collections.
    #[must_use]
    pub const fn state(&self) -> &RegistryState {
        &self.state
    }

    /// Current images.
    #[must_use]
    pub fn images(&self) -> Rc<Vec<ImageInstance>> {
        Rc::clone(&self.state.images)
    }

    /// Current 3D model cards.
    #[must_use]
    pub fn models(&self) -> Rc<Vec<ModelInstance>> {
        Rc::clone(&self.state.models)
    }

    /// Current text blocks.
    #[must_use]
    pub fn texts(&self) -> Rc<Vec<TextInstance>> {
        Rc::clone(&self.state.texts)
    }

    /// Current videos.
    #[must_use]
    pub fn videos(&self) -> Rc<Vec<VideoInstance>> {
        Rc::clone(&self.state.videos)
    }

    /// Version of one collection. Starts at 0, bumped on every change.
    #[must_use]
    pub fn version(&self, kind: ContentKind) -> u64 {
        self.versions.get(&kind).copied().unwrap_or(0)
    }

    /// Typed lookup.
    #[must_use]
    pub fn get<P: Registered>(&self, id: &str) -> Option<&Instance<P>> {
        self.state.get::<P>(id)
    }

    fn bump(&mut self, kind: ContentKind) {
        let version = self.versions.entry(kind).or_insert(0);
        *version += 1;
        let version = *version;
        self.bus.publish(Signal::RegistryChanged { kind, version });
    }

    /// Replace collections that differ (by pointer) from the current ones.
    pub fn apply(&mut self, next: RegistryState) {
        let RegistryState {
            images,
            models,
            texts,
            videos,
        } = next;
        self.replace::<ImagePayload>(images);
        self.replace::<ModelPayload>(models);
        self.replace::<TextPayload>(texts);
        self.replace::<VideoPayload>(videos);
    }

    fn replace<P: Registered>(&mut self, next: Rc<Vec<Instance<P>>>) {
        let slot = P::collection_mut(&mut self.state);
        if !Rc::ptr_eq(slot, &next) {
            *slot = next;
            self.bump(P::KIND);
        }
    }

    /// Edit one instance in place.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ContentNotFound`] if no instance has this id.
    pub fn modify<P: Registered>(
        &mut self,
        id: &str,
        f: impl FnOnce(&mut Instance<P>),
    ) -> SyncResult<()> {
        let collection = P::collection_mut(&mut self.state);
        let Some(pos) = collection.iter().position(|i| i.id == id) else {
            return Err(SyncError::ContentNotFound {
                kind: P::KIND,
                id: id.to_string(),
            });
        };
        let Some(current) = collection.get(pos) else {
            return Ok(());
        };
        let mut updated = current.clone();
        f(&mut updated);
        if updated == *current {
            return Ok(());
        }
        if let Some(slot) = Rc::make_mut(collection).get_mut(pos) {
            *slot = updated;
        }
        self.bump(P::KIND);
        Ok(())
    }

    /// Insert or replace an instance by id.
    pub fn upsert<P: Registered>(&mut self, instance: Instance<P>) {
        let collection = P::collection_mut(&mut self.state);
        match collection.iter().position(|i| i.id == instance.id) {
            Some(pos) if collection.get(pos) == Some(&instance) => return,
            Some(pos) => {
                if let Some(slot) = Rc::make_mut(collection).get_mut(pos) {
                    *slot = instance;
                }
            }
            None => Rc::make_mut(collection).push(instance),
        }
        self.bump(P::KIND);
    }

    /// Remove an instance. Returns whether it existed.
    pub fn remove(&mut self, kind: ContentKind, id: &str) -> bool {
        let removed = match kind {
            ContentKind::Image => remove_from(&mut self.state.images, id),
            ContentKind::Model3D => remove_from(&mut self.state.models, id),
            ContentKind::Text => remove_from(&mut self.state.texts, id),
            ContentKind::Video => remove_from(&mut self.state.videos, id),
            ContentKind::Path => false,
        };
        if removed {
            self.bump(kind);
        }
        removed
    }

    /// Set the bounds of record.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance does not exist.
    pub fn set_bounds(&mut self, kind: ContentKind, id: &str, bounds: Bounds) -> SyncResult<()> {
        dispatch!(self, kind, id, |inst| inst.bounds = bounds)
    }

    /// Set visibility.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance does not exist.
    pub fn set_visible(&mut self, kind: ContentKind, id: &str, visible: bool) -> SyncResult<()> {
        dispatch!(self, kind, id, |inst| inst.visible = visible)
    }

    /// Reassign the owning layer.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance does not exist.
    pub fn set_layer(
        &mut self,
        kind: ContentKind,
        id: &str,
        layer_id: Option<&str>,
    ) -> SyncResult<()> {
        dispatch!(self, kind, id, |inst| inst.layer_id = layer_id.map(str::to_string))
    }

    /// Set selection state of one instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance does not exist.
    pub fn set_selected(&mut self, kind: ContentKind, id: &str, selected: bool) -> SyncResult<()> {
        dispatch!(self, kind, id, |inst| inst.is_selected = selected)
    }

    /// Select exactly `targets`, deselecting everything else.
    pub fn select_only(&mut self, targets: &[(ContentKind, String)]) {
        self.select_in::<ImagePayload>(targets);
        self.select_in::<ModelPayload>(targets);
        self.select_in::<TextPayload>(targets);
        self.select_in::<VideoPayload>(targets);
    }

    fn select_in<P: Registered>(&mut self, targets: &[(ContentKind, String)]) {
        let wanted = |id: &str| targets.iter().any(|(k, t)| *k == P::KIND && t == id);
        let collection = P::collection_mut(&mut self.state);
        if collection.iter().all(|i| i.is_selected == wanted(&i.id)) {
            return;
        }
        for instance in Rc::make_mut(collection).iter_mut() {
            instance.is_selected = wanted(&instance.id);
        }
        self.bump(P::KIND);
    }

    /// Remove every instance.
    pub fn clear(&mut self) {
        self.apply(RegistryState::default());
    }
}

fn remove_from<P: Clone>(collection: &mut Rc<Vec<Instance<P>>>, id: &str) -> bool {
    if !collection.iter().any(|i| i.id == id) {
        return false;
    }
    Rc::make_mut(collection).retain(|i| i.id != id);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(id: &str) -> ImageInstance {
        Instance::new(
            id,
            Bounds::new(0.0, 0.0, 100.0, 100.0),
            ImagePayload {
                src: format!("projects/{id}.png"),
                ..ImagePayload::default()
            },
        )
    }

    #[test]
    fn test_upsert_bumps_version_and_signals() {
        let bus = SignalBus::new(16);
        let mut rx = bus.subscribe();
        let mut registry = InstanceRegistry::new(bus);
        registry.upsert(image("a"));
        assert_eq!(registry.version(ContentKind::Image), 1);
        assert_eq!(
            rx.try_recv().expect("signal"),
            Signal::RegistryChanged {
                kind: ContentKind::Image,
                version: 1
            }
        );

        registry.upsert(image("a"));
        assert_eq!(registry.version(ContentKind::Image), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_modify_is_copy_on_write() {
        let mut registry = InstanceRegistry::new(SignalBus::default());
        registry.upsert(image("a"));
        let before = registry.images();
        registry
            .set_bounds(ContentKind::Image, "a", Bounds::new(5.0, 5.0, 10.0, 10.0))
            .expect("set");
        let after = registry.images();
        assert!(!Rc::ptr_eq(&before, &after));
        assert_eq!(before[0].bounds, Bounds::new(0.0, 0.0, 100.0, 100.0));
        assert_eq!(after[0].bounds, Bounds::new(5.0, 5.0, 10.0, 10.0));
    }

    #[test]
    fn test_missing_and_path_errors() {
        let mut registry = InstanceRegistry::new(SignalBus::default());
        assert!(matches!(
            registry.set_visible(ContentKind::Text, "nope", false),
            Err(SyncError::ContentNotFound { .. })
        ));
        assert!(matches!(
            registry.set_visible(ContentKind::Path, "p", false),
            Err(SyncError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn test_apply_only_bumps_changed_collections() {
        let mut registry = InstanceRegistry::new(SignalBus::default());
        registry.upsert(image("a"));
        let mut next = registry.state().clone();
        next.texts = Rc::new(vec![Instance::new(
            "t",
            Bounds::new(0.0, 0.0, 10.0, 10.0),
            TextPayload::default(),
        )]);
        registry.apply(next);
        assert_eq!(registry.version(ContentKind::Image), 1);
        assert_eq!(registry.version(ContentKind::Text), 1);
    }

    #[test]
    fn test_select_only() {
        let mut registry = InstanceRegistry::new(SignalBus::default());
        registry.upsert(image("a"));
        registry.upsert(image("b"));
        registry.select_only(&[(ContentKind::Image, "b".to_string())]);
        assert_eq!(
            registry.state().selected(),
            vec![(ContentKind::Image, "b".to_string())]
        );
        let version = registry.version(ContentKind::Image);
        registry.select_only(&[(ContentKind::Image, "b".to_string())]);
        assert_eq!(registry.version(ContentKind::Image), version);
    }

    #[test]
    fn test_remove() {
        let mut registry = InstanceRegistry::new(SignalBus::default());
        registry.upsert(image("a"));
        assert!(registry.remove(ContentKind::Image, "a"));
        assert!(!registry.remove(ContentKind::Image, "a"));
        assert!(registry.state().is_empty());
    }
}
