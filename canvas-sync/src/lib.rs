//! # Saorsa Canvas Sync
//!
//! Keeps the retained scene graph the canvas renders and the typed content
//! registry the rest of the application reads in step.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       SyncEngine                         │
//! ├───────────────────┬──────────────────────────────────────┤
//! │  SceneTree        │  InstanceRegistry                    │
//! │  - Layers         │  - Images / Models / Texts / Videos  │
//! │  - Tagged groups  │  - Versioned, copy-on-write          │
//! ├───────────────────┴──────────────────────────────────────┤
//! │  Reconciler (one pass per frame, FrameScheduler)         │
//! ├───────────────────┬──────────────────┬───────────────────┤
//! │  Uploads          │  History         │  Clipboard        │
//! │  - Placeholders   │  - Bounds replay │  - Snapshots      │
//! │  - Remote swap    │  - Full rebuild  │  - Fresh ids      │
//! ├───────────────────┴──────────────────┴───────────────────┤
//! │  SignalBus (tokio broadcast)  │  ContentStore (persist)  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine is single-threaded. Hosts share it as a [`SharedEngine`] and
//! drive frames, pointer input and uploads into it; async collaborators
//! ([`Uploader`], [`AssetPreloader`], [`ContentStore`], [`SelectionConsumer`])
//! are awaited without holding an engine borrow.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod asset;
pub mod binding;
pub mod clipboard;
pub mod config;
pub mod construct;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod history;
pub mod layers;
pub mod model;
pub mod persistence;
pub mod placeholder;
pub mod reconcile;
pub mod registry;
pub mod revoke;
pub mod scene;
pub mod scheduler;
pub mod selection;
pub mod signal;
pub mod snapshot;
pub mod upload;

pub use asset::{AssetFormat, AssetKind, AssetReference, AssetResolver};
pub use binding::{ContentKind, HelperRole, SceneNodeBinding};
pub use clipboard::{Clipboard, RestoreReport};
pub use config::{ResolverConfig, RetryPolicy, SyncConfig};
pub use engine::{wait_until_ready, PasteOutcome, SharedEngine, SyncEngine};
pub use error::{PersistenceError, PreloadError, SyncError, SyncResult, UploadError};
pub use geometry::{Bounds, Point};
pub use history::{DocumentSnapshot, HistoryManager, ReplayMode};
pub use layers::LayerDescriptor;
pub use model::{
    ImageInstance, ImagePayload, Instance, ModelInstance, ModelPayload, TextInstance, TextPayload,
    VideoInstance, VideoPayload,
};
pub use persistence::{
    load_project, save_project, ContentStore, MemoryContentStore, ProjectContent, SaveReceipt,
};
pub use reconcile::{ReconcileOutcome, ReconcileReport, Reconciler};
pub use registry::{InstanceRegistry, RegistryState};
pub use revoke::{NoopRevoker, ObjectUrlRevoker, RevokeOutcome};
pub use scene::{NodeHandle, NodeKind, NodeSpec, SceneChange, SceneTree};
pub use scheduler::{FrameScheduler, PassState};
pub use selection::{push_selection, HitTarget, SelectionConsumer, SelectionToken};
pub use signal::{Signal, SignalBus};
pub use snapshot::{PathSnapshot, SkippedItem, Snapshot};
pub use upload::{
    run_upload, run_uploads, AssetPreloader, DecodedAsset, LocalAsset, UploadPhase, UploadReceipt,
    UploadRequest, UploadSource, Uploader,
};

/// Canvas sync version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
