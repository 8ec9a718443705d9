//! Shared fakes and helpers for integration tests.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use async_trait::async_trait;
use canvas_sync::{
    AssetPreloader, Bounds, ContentKind, DecodedAsset, ImageInstance, LocalAsset, ObjectUrlRevoker,
    PreloadError, RetryPolicy, SharedEngine, Signal, SyncConfig, SyncEngine, UploadError,
    UploadReceipt, UploadRequest, UploadSource, Uploader,
};
use tokio::sync::broadcast;

/// Install a test subscriber once. Honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config with millisecond retry delays so failure paths finish quickly.
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        upload_retry: RetryPolicy::new(2, 1, 2, 2.0),
        preload_retry: RetryPolicy::new(3, 1, 2, 2.0),
        ..SyncConfig::default()
    }
}

/// Shared engine with one layer, ready for content.
pub fn ready_engine() -> SharedEngine {
    init_tracing();
    let engine = SyncEngine::shared(fast_config());
    engine.borrow_mut().add_layer("layer-1", "Layer 1");
    engine
}

/// Every signal currently queued on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<Signal>) -> Vec<Signal> {
    let mut out = Vec::new();
    while let Ok(signal) = rx.try_recv() {
        out.push(signal);
    }
    out
}

/// Number of `RecoveryNeeded` signals in `signals`.
pub fn recovery_count(signals: &[Signal]) -> usize {
    signals
        .iter()
        .filter(|s| matches!(s, Signal::RecoveryNeeded { .. }))
        .count()
}

/// Add a decoded image at `bounds` with a storage-key source.
pub fn add_image(engine: &SharedEngine, key: &str, bounds: Bounds) -> String {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let size = (bounds.width as u32, bounds.height as u32);
    engine
        .borrow_mut()
        .add_image(key, bounds, Some(size))
        .expect("add image")
}

/// Registry bounds of an image.
pub fn image_bounds(engine: &SharedEngine, id: &str) -> Option<Bounds> {
    engine
        .borrow()
        .registry()
        .state()
        .bounds_of(ContentKind::Image, id)
}

/// Image upload request for a local `blob:` preview.
pub fn image_request(name: &str, natural: (u32, u32)) -> UploadRequest {
    UploadRequest {
        kind: ContentKind::Image,
        source: UploadSource::File {
            name: name.to_string(),
            mime: "image/png".to_string(),
            bytes: vec![0x89, b'P', b'N', b'G'],
        },
        local: LocalAsset {
            reference: format!("blob:https://app.example.com/{name}"),
            file_name: Some(name.to_string()),
            natural_size: Some(natural),
        },
        #[allow(clippy::cast_precision_loss)]
        footprint: Some((natural.0 as f32, natural.1 as f32)),
    }
}

/// Uploader that stores files under `projects/p1/` and can fail on demand.
///
/// When given an engine it records the registry's images at the moment the
/// upload is in flight.
#[derive(Default)]
pub struct FakeUploader {
    pub engine: Option<SharedEngine>,
    pub failures: Cell<u32>,
    pub error: Option<UploadError>,
    pub calls: Cell<u32>,
    pub observed: RefCell<Vec<ImageInstance>>,
    /// Delete every pending image while the upload is in flight.
    pub delete_pending: bool,
    /// Answer with a receipt holding neither key nor URL.
    pub empty_receipt: bool,
}

impl FakeUploader {
    pub fn observing(engine: &SharedEngine) -> Self {
        Self {
            engine: Some(Rc::clone(engine)),
            ..Self::default()
        }
    }

    pub fn failing(times: u32, error: UploadError) -> Self {
        Self {
            failures: Cell::new(times),
            error: Some(error),
            ..Self::default()
        }
    }
}

#[async_trait(?Send)]
impl Uploader for FakeUploader {
    async fn upload(&self, source: &UploadSource) -> Result<UploadReceipt, UploadError> {
        self.calls.set(self.calls.get() + 1);
        if let Some(engine) = &self.engine {
            let images = engine.borrow().registry().images();
            self.observed.borrow_mut().extend(images.iter().cloned());
            if self.delete_pending {
                for image in images.iter().filter(|i| i.payload.pending_upload) {
                    engine
                        .borrow_mut()
                        .delete_content(ContentKind::Image, &image.id)
                        .expect("delete pending image");
                }
            }
        }
        if self.empty_receipt {
            return Ok(UploadReceipt {
                key: String::new(),
                url: String::new(),
            });
        }
        if self.failures.get() > 0 {
            self.failures.set(self.failures.get() - 1);
            if let Some(error) = &self.error {
                return Err(error.clone());
            }
        }
        let name = match source {
            UploadSource::File { name, .. } => name.clone(),
            UploadSource::DataUrl(_) => "inline.png".to_string(),
        };
        Ok(UploadReceipt {
            key: format!("projects/p1/{name}"),
            url: format!("https://cdn.example.com/projects/p1/{name}"),
        })
    }
}

/// Preloader that decodes everything at a fixed size, optionally after a
/// number of not-yet-available responses.
pub struct FakePreloader {
    pub size: (u32, u32),
    pub not_ready: Cell<u32>,
    pub requested: RefCell<Vec<String>>,
}

impl FakePreloader {
    pub fn new(size: (u32, u32)) -> Self {
        Self {
            size,
            not_ready: Cell::new(0),
            requested: RefCell::new(Vec::new()),
        }
    }
}

#[async_trait(?Send)]
impl AssetPreloader for FakePreloader {
    async fn preload(&self, renderable: &str) -> Result<DecodedAsset, PreloadError> {
        self.requested.borrow_mut().push(renderable.to_string());
        if self.not_ready.get() > 0 {
            self.not_ready.set(self.not_ready.get() - 1);
            return Err(PreloadError::NotYetAvailable(renderable.to_string()));
        }
        Ok(DecodedAsset {
            width: self.size.0,
            height: self.size.1,
        })
    }
}

/// Revoker recording every released handle.
#[derive(Debug, Clone, Default)]
pub struct RecordingRevoker {
    pub revoked: Rc<RefCell<Vec<String>>>,
}

impl RecordingRevoker {
    pub fn revoked(&self) -> Vec<String> {
        self.revoked.borrow().clone()
    }
}

impl ObjectUrlRevoker for RecordingRevoker {
    fn revoke(&self, reference: &str) {
        self.revoked.borrow_mut().push(reference.to_string());
    }
}

/// Install a [`RecordingRevoker`] on `engine` and return a handle to it.
pub fn install_revoker(engine: &SharedEngine) -> RecordingRevoker {
    let revoker = RecordingRevoker::default();
    engine.borrow_mut().set_revoker(Rc::new(revoker.clone()));
    revoker
}
