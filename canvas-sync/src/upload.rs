//! Upload lifecycle: optimistic local preview, then a flicker-free swap to a
//! durable reference.
//!
//! ```text
//! Requested ──▶ LocalPreview ──▶ PersistedMetadata ──▶ RemoteSwapped
//!     │              │                  │
//!     └──────────────┴──────────────────┴──▶ Failed
//! ```
//!
//! Pixels are switched only after the durable asset has been preloaded and
//! decoded off-tree, and the local reference is only offered for revocation
//! after the swap.

use std::borrow::Cow;
use std::collections::HashMap;

use async_trait::async_trait;
use futures::future::join_all;

use crate::asset::{decode_inline, AssetFormat, AssetReference};
use crate::binding::ContentKind;
use crate::config::RetryPolicy;
use crate::engine::SharedEngine;
use crate::error::{PreloadError, SyncError, SyncResult, UploadError};
use crate::geometry::Bounds;

/// Lifecycle phase of one upload.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadPhase {
    /// Placeholder drawn at the predicted position.
    Requested {
        /// Predicted bounds.
        placeholder: Bounds,
    },
    /// The local asset is on screen as a real instance.
    LocalPreview {
        /// Local reference being rendered.
        local: String,
    },
    /// The backend persisted the asset; pixels still come from `local`.
    PersistedMetadata {
        /// Local reference being rendered.
        local: String,
        /// Durable reference recorded in the payload.
        durable: AssetReference,
    },
    /// The durable asset is rendered.
    RemoteSwapped {
        /// Durable reference being rendered.
        durable: AssetReference,
    },
    /// The upload failed. Any local preview stays on screen.
    Failed {
        /// Local reference still rendered, if a preview was shown.
        local: Option<String>,
        /// Failure message.
        message: String,
    },
}

impl UploadPhase {
    /// Phase name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Requested { .. } => "requested",
            Self::LocalPreview { .. } => "local-preview",
            Self::PersistedMetadata { .. } => "persisted-metadata",
            Self::RemoteSwapped { .. } => "remote-swapped",
            Self::Failed { .. } => "failed",
        }
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::RemoteSwapped { .. } | Self::Failed { .. })
    }

    /// Local reference rendered in this phase.
    #[must_use]
    pub fn local(&self) -> Option<&str> {
        match self {
            Self::LocalPreview { local } | Self::PersistedMetadata { local, .. } => Some(local),
            Self::Failed { local, .. } => local.as_deref(),
            Self::Requested { .. } | Self::RemoteSwapped { .. } => None,
        }
    }
}

/// One tracked upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRecord {
    /// Content kind being uploaded.
    pub kind: ContentKind,
    /// Current phase.
    pub phase: UploadPhase,
}

/// Upload state machines keyed by placeholder id.
#[derive(Debug, Clone, Default)]
pub struct UploadTracker {
    uploads: HashMap<String, UploadRecord>,
}

impl UploadTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current record.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&UploadRecord> {
        self.uploads.get(id)
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self, id: &str) -> Option<&UploadPhase> {
        self.uploads.get(id).map(|r| &r.phase)
    }

    /// Number of uploads not yet in a terminal phase.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.uploads
            .values()
            .filter(|r| !r.phase.is_terminal())
            .count()
    }

    /// Local references held by uploads still in flight.
    ///
    /// A failed upload's preview stays reachable through the registry only,
    /// so deleting it lets the reference go.
    #[must_use]
    pub fn local_references(&self) -> Vec<&str> {
        self.uploads
            .values()
            .filter(|r| !r.phase.is_terminal())
            .filter_map(|r| r.phase.local())
            .collect()
    }

    /// The record for `id`, if it is in phase `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnknownUpload`] or
    /// [`SyncError::InvalidTransition`] towards `to`.
    pub fn expect_phase(
        &self,
        id: &str,
        expected: &'static str,
        to: &'static str,
    ) -> SyncResult<&UploadRecord> {
        let record = self
            .uploads
            .get(id)
            .ok_or_else(|| SyncError::UnknownUpload(id.to_string()))?;
        if record.phase.name() == expected {
            Ok(record)
        } else {
            Err(invalid(id, &record.phase, to))
        }
    }

    /// Start tracking an upload.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidTransition`] if an upload with this id is
    /// still in flight.
    pub fn request(&mut self, id: &str, kind: ContentKind, placeholder: Bounds) -> SyncResult<()> {
        if let Some(existing) = self.uploads.get(id) {
            if !existing.phase.is_terminal() {
                return Err(SyncError::InvalidTransition {
                    id: id.to_string(),
                    from: existing.phase.name(),
                    to: "requested",
                });
            }
        }
        self.uploads.insert(
            id.to_string(),
            UploadRecord {
                kind,
                phase: UploadPhase::Requested { placeholder },
            },
        );
        Ok(())
    }

    fn record_mut(&mut self, id: &str) -> SyncResult<&mut UploadRecord> {
        self.uploads
            .get_mut(id)
            .ok_or_else(|| SyncError::UnknownUpload(id.to_string()))
    }

    /// `Requested → LocalPreview`.
    ///
    /// # Errors
    ///
    /// Returns an error if the upload is unknown or not in `Requested`.
    pub fn to_local_preview(&mut self, id: &str, local: &str) -> SyncResult<()> {
        let record = self.record_mut(id)?;
        match &record.phase {
            UploadPhase::Requested { .. } => {
                record.phase = UploadPhase::LocalPreview {
                    local: local.to_string(),
                };
                Ok(())
            }
            other => Err(invalid(id, other, "local-preview")),
        }
    }

    /// `LocalPreview → PersistedMetadata`.
    ///
    /// # Errors
    ///
    /// Returns an error if the upload is unknown or not in `LocalPreview`.
    pub fn to_persisted(&mut self, id: &str, durable: AssetReference) -> SyncResult<()> {
        let record = self.record_mut(id)?;
        match &record.phase {
            UploadPhase::LocalPreview { local } => {
                record.phase = UploadPhase::PersistedMetadata {
                    local: local.clone(),
                    durable,
                };
                Ok(())
            }
            other => Err(invalid(id, other, "persisted-metadata")),
        }
    }

    /// `PersistedMetadata → RemoteSwapped`. Returns the released local
    /// reference and the durable one now rendered.
    ///
    /// # Errors
    ///
    /// Returns an error if the upload is unknown or not in `PersistedMetadata`.
    pub fn to_swapped(&mut self, id: &str) -> SyncResult<(String, AssetReference)> {
        let record = self.record_mut(id)?;
        match &record.phase {
            UploadPhase::PersistedMetadata { local, durable } => {
                let released = local.clone();
                let durable = durable.clone();
                record.phase = UploadPhase::RemoteSwapped {
                    durable: durable.clone(),
                };
                Ok((released, durable))
            }
            other => Err(invalid(id, other, "remote-swapped")),
        }
    }

    /// Any non-terminal phase `→ Failed`.
    ///
    /// # Errors
    ///
    /// Returns an error if the upload is unknown or already terminal.
    pub fn fail(&mut self, id: &str, message: &str) -> SyncResult<()> {
        let record = self.record_mut(id)?;
        if record.phase.is_terminal() {
            return Err(invalid(id, &record.phase, "failed"));
        }
        let local = record.phase.local().map(str::to_string);
        record.phase = UploadPhase::Failed {
            local,
            message: message.to_string(),
        };
        Ok(())
    }

    /// Stop tracking an upload.
    pub fn remove(&mut self, id: &str) -> Option<UploadRecord> {
        self.uploads.remove(id)
    }

    /// Stop tracking everything.
    pub fn clear(&mut self) {
        self.uploads.clear();
    }
}

fn invalid(id: &str, from: &UploadPhase, to: &'static str) -> SyncError {
    SyncError::InvalidTransition {
        id: id.to_string(),
        from: from.name(),
        to,
    }
}

/// What to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadSource {
    /// Raw file bytes.
    File {
        /// File name.
        name: String,
        /// MIME type.
        mime: String,
        /// Contents.
        bytes: Vec<u8>,
    },
    /// A `data:` URL.
    DataUrl(String),
}

impl UploadSource {
    /// Check that the source decodes and matches `kind`.
    ///
    /// Images need PNG, JPEG, WebP or GIF data and videos MP4 or WebM, by
    /// magic bytes or declared MIME type. Models only need to be non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::Unsupported`] for empty, undecodable or
    /// mismatched sources.
    pub fn validate(&self, kind: ContentKind) -> Result<AssetFormat, UploadError> {
        let (mime, bytes) = match self {
            Self::File { mime, bytes, .. } => (mime.clone(), Cow::Borrowed(bytes.as_slice())),
            Self::DataUrl(url) => {
                let inline =
                    decode_inline(url).map_err(|e| UploadError::Unsupported(e.to_string()))?;
                (inline.mime, Cow::Owned(inline.bytes))
            }
        };
        if bytes.is_empty() {
            return Err(UploadError::Unsupported("empty source".to_string()));
        }
        let format = AssetFormat::detect(&bytes, &mime);
        let matches = match kind {
            ContentKind::Image => format.is_image(),
            ContentKind::Video => format.is_video(),
            ContentKind::Model3D => true,
            ContentKind::Text | ContentKind::Path => false,
        };
        if matches {
            Ok(format)
        } else {
            Err(UploadError::Unsupported(format!("{mime} is not a {kind} source")))
        }
    }
}

/// Backend response to a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Storage key.
    pub key: String,
    /// Remote URL.
    pub url: String,
}

/// Result of decoding an asset off-tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedAsset {
    /// Natural width.
    pub width: u32,
    /// Natural height.
    pub height: u32,
}

/// The local asset shown while uploading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAsset {
    /// `blob:` or `data:` reference.
    pub reference: String,
    /// Original file name.
    pub file_name: Option<String>,
    /// Decoded size, if the host already decoded it.
    pub natural_size: Option<(u32, u32)>,
}

/// Upload collaborator. Failures are values, never panics.
#[async_trait(?Send)]
pub trait Uploader {
    /// Upload `source`.
    async fn upload(&self, source: &UploadSource) -> Result<UploadReceipt, UploadError>;
}

/// Off-tree decoder for durable assets.
#[async_trait(?Send)]
pub trait AssetPreloader {
    /// Fetch and fully decode `renderable`.
    async fn preload(&self, renderable: &str) -> Result<DecodedAsset, PreloadError>;
}

/// Upload with bounded exponential backoff on retryable failures.
///
/// # Errors
///
/// Returns the last error once attempts are exhausted, or the first
/// non-retryable error.
pub async fn upload_with_retry(
    uploader: &dyn Uploader,
    source: &UploadSource,
    policy: &RetryPolicy,
) -> Result<UploadReceipt, UploadError> {
    let mut attempt = 0;
    loop {
        match uploader.upload(source).await {
            Ok(receipt) => return Ok(receipt),
            Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(attempt = attempt + 1, ?delay, "Upload failed, retrying: {}", e);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Preload with bounded exponential backoff.
///
/// Freshly uploaded objects are often not fetchable right away, so
/// not-yet-available and network errors are retried.
///
/// # Errors
///
/// Returns the last error once attempts are exhausted, or the first
/// non-retryable error.
pub async fn preload_with_retry(
    preloader: &dyn AssetPreloader,
    renderable: &str,
    policy: &RetryPolicy,
) -> Result<DecodedAsset, PreloadError> {
    let mut attempt = 0;
    loop {
        match preloader.preload(renderable).await {
            Ok(decoded) => return Ok(decoded),
            Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(
                    attempt = attempt + 1,
                    ?delay,
                    url = renderable,
                    "Preload not ready: {}",
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Everything needed to drive one upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Kind of content being uploaded.
    pub kind: ContentKind,
    /// Bytes for the backend.
    pub source: UploadSource,
    /// Local asset for the immediate preview.
    pub local: LocalAsset,
    /// Expected footprint, defaults to the configured placeholder size.
    pub footprint: Option<(f32, f32)>,
}

/// Drive one upload from placeholder to remote swap.
///
/// Waits for the scene to become ready, then moves through every phase.
/// Engine borrows are never held across an await, so other work (including
/// concurrent uploads) proceeds while this one is suspended.
///
/// On failure the local preview stays, [`crate::Signal::UploadFailed`] is
/// published and the error is returned.
///
/// # Errors
///
/// Returns the upload or preload error after retries are exhausted, or an
/// engine error if the content was removed mid-flight.
pub async fn run_upload(
    engine: &SharedEngine,
    uploader: &dyn Uploader,
    preloader: &dyn AssetPreloader,
    request: UploadRequest,
) -> SyncResult<String> {
    crate::engine::wait_until_ready(engine).await;

    let format = request.source.validate(request.kind).map_err(|e| {
        tracing::warn!(kind = %request.kind, "Rejected upload source: {}", e);
        e
    })?;
    tracing::debug!(kind = %request.kind, ?format, "Upload source accepted");

    let (id, upload_policy, preload_policy) = {
        let mut e = engine.borrow_mut();
        let id = e.begin_upload(request.kind, request.footprint)?;
        let config = e.config();
        (id, config.upload_retry.clone(), config.preload_retry.clone())
    };
    let UploadRequest { source, local, .. } = request;
    let steps = async {
        engine.borrow_mut().show_local_preview(&id, local)?;
        engine.borrow_mut().report_progress(&id, 0.25);

        let receipt = upload_with_retry(uploader, &source, &upload_policy).await?;
        let durable = engine.borrow_mut().record_persisted(&id, &receipt)?;
        engine.borrow_mut().report_progress(&id, 0.75);

        let renderable = engine.borrow().resolver().to_renderable(&durable.value);
        let decoded = preload_with_retry(preloader, &renderable, &preload_policy).await?;
        engine.borrow_mut().complete_swap(&id, decoded)?;
        engine.borrow_mut().report_progress(&id, 1.0);
        SyncResult::Ok(())
    };
    match steps.await {
        Ok(()) => Ok(id),
        Err(err) => {
            if let Err(fail) = engine.borrow_mut().fail_upload(&id, &err.to_string()) {
                tracing::debug!(id = %id, error = %fail, "Upload already settled");
            }
            Err(err)
        }
    }
}

/// Drive several uploads concurrently on the current task.
///
/// Results are returned in request order. One failing upload does not affect
/// the others.
pub async fn run_uploads(
    engine: &SharedEngine,
    uploader: &dyn Uploader,
    preloader: &dyn AssetPreloader,
    requests: Vec<UploadRequest>,
) -> Vec<SyncResult<String>> {
    let count = requests.len();
    let results = join_all(
        requests
            .into_iter()
            .map(|request| run_upload(engine, uploader, preloader, request)),
    )
    .await;
    let failed = results.iter().filter(|r| r.is_err()).count();
    tracing::info!(count, failed, "Upload batch finished");
    results
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::asset::AssetKind;

    fn durable() -> AssetReference {
        AssetReference {
            kind: AssetKind::StorageKey,
            value: "projects/p1/a.png".into(),
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut tracker = UploadTracker::new();
        tracker
            .request("img-1", ContentKind::Image, Bounds::new(0.0, 0.0, 1.0, 1.0))
            .expect("request");
        tracker.to_local_preview("img-1", "blob:a").expect("preview");
        assert_eq!(tracker.local_references(), vec!["blob:a"]);
        tracker.to_persisted("img-1", durable()).expect("persist");
        let (released, now) = tracker.to_swapped("img-1").expect("swap");
        assert_eq!(released, "blob:a");
        assert_eq!(now, durable());
        assert_eq!(tracker.in_flight(), 0);
        assert!(tracker.local_references().is_empty());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut tracker = UploadTracker::new();
        tracker
            .request("img-1", ContentKind::Image, Bounds::ZERO)
            .expect("request");
        assert!(matches!(
            tracker.to_persisted("img-1", durable()),
            Err(SyncError::InvalidTransition {
                from: "requested",
                to: "persisted-metadata",
                ..
            })
        ));
        assert!(tracker.to_swapped("img-1").is_err());
        assert!(tracker.request("img-1", ContentKind::Image, Bounds::ZERO).is_err());
        assert!(matches!(
            tracker.to_local_preview("nope", "blob:x"),
            Err(SyncError::UnknownUpload(_))
        ));
    }

    #[test]
    fn test_failure_keeps_local_reference() {
        let mut tracker = UploadTracker::new();
        tracker
            .request("img-1", ContentKind::Image, Bounds::ZERO)
            .expect("request");
        tracker.to_local_preview("img-1", "blob:a").expect("preview");
        tracker.fail("img-1", "offline").expect("fail");
        assert_eq!(tracker.phase("img-1").and_then(UploadPhase::local), Some("blob:a"));
        assert!(tracker.local_references().is_empty());
        assert!(tracker.fail("img-1", "again").is_err());
        tracker
            .request("img-1", ContentKind::Image, Bounds::ZERO)
            .expect("retry after terminal");
    }

    #[test]
    fn test_expect_phase() {
        let mut tracker = UploadTracker::new();
        tracker
            .request("img-1", ContentKind::Image, Bounds::ZERO)
            .expect("request");
        assert!(tracker
            .expect_phase("img-1", "requested", "local-preview")
            .is_ok());
        assert!(matches!(
            tracker.expect_phase("img-1", "local-preview", "persisted-metadata"),
            Err(SyncError::InvalidTransition {
                from: "requested",
                to: "persisted-metadata",
                ..
            })
        ));
        assert!(matches!(
            tracker.expect_phase("img-2", "requested", "local-preview"),
            Err(SyncError::UnknownUpload(_))
        ));
    }

    #[test]
    fn test_validate_sources() {
        let png = UploadSource::File {
            name: "a.png".into(),
            mime: "application/octet-stream".into(),
            bytes: vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A],
        };
        assert_eq!(png.validate(ContentKind::Image), Ok(AssetFormat::Png));
        assert!(matches!(
            png.validate(ContentKind::Video),
            Err(UploadError::Unsupported(_))
        ));

        let by_mime = UploadSource::File {
            name: "clip".into(),
            mime: "video/webm".into(),
            bytes: vec![1, 2, 3],
        };
        assert_eq!(by_mime.validate(ContentKind::Video), Ok(AssetFormat::WebM));

        let inline = UploadSource::DataUrl("data:image/gif;base64,R0lGODlh".into());
        assert_eq!(inline.validate(ContentKind::Image), Ok(AssetFormat::Gif));

        let broken = UploadSource::DataUrl("data:image/png;base64,@@@".into());
        assert!(broken.validate(ContentKind::Image).is_err());
        let empty = UploadSource::DataUrl("data:,".into());
        assert!(empty.validate(ContentKind::Model3D).is_err());
        assert!(png.validate(ContentKind::Text).is_err());
    }

    struct FlakyUploader {
        failures: Cell<u32>,
        calls: Cell<u32>,
    }

    #[async_trait(?Send)]
    impl Uploader for FlakyUploader {
        async fn upload(&self, _source: &UploadSource) -> Result<UploadReceipt, UploadError> {
            self.calls.set(self.calls.get() + 1);
            if self.failures.get() > 0 {
                self.failures.set(self.failures.get() - 1);
                return Err(UploadError::Network("reset".into()));
            }
            Ok(UploadReceipt {
                key: "projects/p1/a.png".into(),
                url: "https://cdn.example.com/projects/p1/a.png".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_upload_retries_then_succeeds() {
        let uploader = FlakyUploader {
            failures: Cell::new(2),
            calls: Cell::new(0),
        };
        let policy = RetryPolicy::new(3, 1, 2, 2.0);
        let source = UploadSource::DataUrl("data:,x".into());
        let receipt = upload_with_retry(&uploader, &source, &policy)
            .await
            .expect("upload");
        assert_eq!(receipt.key, "projects/p1/a.png");
        assert_eq!(uploader.calls.get(), 3);
    }

    #[tokio::test]
    async fn test_upload_gives_up_after_max_attempts() {
        let uploader = FlakyUploader {
            failures: Cell::new(10),
            calls: Cell::new(0),
        };
        let policy = RetryPolicy::new(3, 1, 2, 2.0);
        let result =
            upload_with_retry(&uploader, &UploadSource::DataUrl("data:,x".into()), &policy).await;
        assert!(matches!(result, Err(UploadError::Network(_))));
        assert_eq!(uploader.calls.get(), 3);
    }

    struct RejectingPreloader;

    #[async_trait(?Send)]
    impl AssetPreloader for RejectingPreloader {
        async fn preload(&self, _renderable: &str) -> Result<DecodedAsset, PreloadError> {
            Err(PreloadError::Decode("corrupt".into()))
        }
    }

    #[tokio::test]
    async fn test_preload_does_not_retry_decode_errors() {
        let policy = RetryPolicy::new(6, 1, 2, 2.0);
        let result = preload_with_retry(&RejectingPreloader, "https://x/a.png", &policy).await;
        assert_eq!(result, Err(PreloadError::Decode("corrupt".into())));
    }
}
