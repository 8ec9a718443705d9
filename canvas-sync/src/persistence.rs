//! Project content and the persistence collaborator.
//!
//! The engine never talks to a backend directly. It exports a
//! [`ProjectContent`] and hands it to a [`ContentStore`]; on load it reads the
//! current content back and rebuilds scene and registry from it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::asset::AssetResolver;
use crate::binding::ContentKind;
use crate::engine::SharedEngine;
use crate::error::{PersistenceError, SyncError, SyncResult};
use crate::layers::LayerDescriptor;
use crate::snapshot::Snapshot;

/// Everything saved for one project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectContent {
    /// Version this content was read at or saved as.
    #[serde(default)]
    pub version: u64,
    /// Layers in paint order.
    #[serde(default)]
    pub layers: Vec<LayerDescriptor>,
    /// Content records.
    #[serde(default)]
    pub assets: Snapshot,
    /// Serialized scene, when the backend keeps one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene: Option<String>,
}

/// A reference that should not be persisted as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransientReference {
    /// Kind of the item holding it.
    pub kind: ContentKind,
    /// Item id.
    pub id: String,
    /// The reference.
    pub reference: String,
}

impl ProjectContent {
    /// Items whose only reference is inline, local or unrecognized.
    ///
    /// Persisted items must carry a storage key or a remote URL. Enforcing
    /// that is the store's job; this lets a host check before saving.
    #[must_use]
    pub fn transient_references(&self, resolver: &AssetResolver) -> Vec<TransientReference> {
        let mut out = Vec::new();
        let mut check = |kind: ContentKind, id: &str, candidates: &[Option<&str>]| {
            let persistable = candidates
                .iter()
                .flatten()
                .any(|c| resolver.is_persistable(c));
            if !persistable {
                let reference = candidates.iter().flatten().next().copied().unwrap_or_default();
                out.push(TransientReference {
                    kind,
                    id: id.to_string(),
                    reference: reference.to_string(),
                });
            }
        };
        for r in &self.assets.images {
            check(
                ContentKind::Image,
                &r.id,
                &[Some(&r.src), r.storage_key.as_deref(), r.remote_url.as_deref()],
            );
        }
        for r in &self.assets.videos {
            check(
                ContentKind::Video,
                &r.id,
                &[Some(&r.src), r.storage_key.as_deref(), r.remote_url.as_deref()],
            );
        }
        for r in &self.assets.models {
            check(ContentKind::Model3D, &r.id, &[Some(&r.model_url)]);
        }
        out
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Store response to a successful save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveReceipt {
    /// New content version.
    pub version: u64,
    /// Save time, milliseconds since the Unix epoch.
    pub saved_at_ms: u64,
}

/// Persistence collaborator.
#[async_trait(?Send)]
pub trait ContentStore {
    /// Current content of a project, `None` if nothing was saved yet.
    async fn read_current(
        &self,
        project_id: &str,
    ) -> Result<Option<ProjectContent>, PersistenceError>;

    /// Save `content`, based on `content.version`.
    async fn save_content(
        &self,
        project_id: &str,
        content: &ProjectContent,
    ) -> Result<SaveReceipt, PersistenceError>;
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// In-memory [`ContentStore`] with optimistic versioning.
///
/// Saves based on a stale version are rejected with
/// [`PersistenceError::Conflict`].
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    projects: RefCell<HashMap<String, ProjectContent>>,
}

impl MemoryContentStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored content, if any.
    #[must_use]
    pub fn get(&self, project_id: &str) -> Option<ProjectContent> {
        self.projects.borrow().get(project_id).cloned()
    }

    /// Seed a project directly.
    pub fn insert(&self, project_id: &str, content: ProjectContent) {
        self.projects.borrow_mut().insert(project_id.to_string(), content);
    }
}

#[async_trait(?Send)]
impl ContentStore for MemoryContentStore {
    async fn read_current(
        &self,
        project_id: &str,
    ) -> Result<Option<ProjectContent>, PersistenceError> {
        Ok(self.get(project_id))
    }

    async fn save_content(
        &self,
        project_id: &str,
        content: &ProjectContent,
    ) -> Result<SaveReceipt, PersistenceError> {
        let mut projects = self.projects.borrow_mut();
        let current = projects.get(project_id).map_or(0, |c| c.version);
        if content.version != current {
            return Err(PersistenceError::Conflict {
                expected: content.version,
                found: current,
            });
        }
        let mut stored = content.clone();
        stored.version = current + 1;
        let receipt = SaveReceipt {
            version: stored.version,
            saved_at_ms: now_ms(),
        };
        projects.insert(project_id.to_string(), stored);
        Ok(receipt)
    }
}

/// Save the active project.
///
/// Transient references are logged; the store decides whether to accept them.
///
/// # Errors
///
/// Returns an error if no project is active, the content cannot be exported
/// or the store rejects the save.
pub async fn save_project(
    engine: &SharedEngine,
    store: &dyn ContentStore,
) -> SyncResult<SaveReceipt> {
    let (project_id, content) = {
        let e = engine.borrow();
        let project_id = e
            .project_id()
            .ok_or_else(|| PersistenceError::NotFound("no active project".to_string()))?
            .to_string();
        let content = e.export_content()?;
        for transient in content.transient_references(e.resolver()) {
            tracing::warn!(
                kind = %transient.kind,
                id = %transient.id,
                reference = %transient.reference,
                "Saving item without a persistable reference"
            );
        }
        (project_id, content)
    };
    let receipt = store.save_content(&project_id, &content).await?;
    engine.borrow_mut().mark_saved(receipt.version);
    tracing::info!(project = %project_id, version = receipt.version, "Saved project");
    Ok(receipt)
}

/// Switch to `project_id` and load its current content.
///
/// Returns `false` if the project has no saved content yet; the engine is
/// then left with an empty scene for it.
///
/// # Errors
///
/// Returns an error if the store fails or the content cannot be applied.
pub async fn load_project(
    engine: &SharedEngine,
    store: &dyn ContentStore,
    project_id: &str,
) -> SyncResult<bool> {
    engine.borrow_mut().switch_project(project_id);
    let content = store.read_current(project_id).await?;
    let mut e = engine.borrow_mut();
    if e.project_id() != Some(project_id) {
        tracing::debug!(project = %project_id, "Project switched during load, discarding");
        return Err(SyncError::Persistence(PersistenceError::NotFound(format!(
            "project {project_id} is no longer active"
        ))));
    }
    match content {
        Some(content) => {
            e.load_content(&content)?;
            tracing::info!(project = %project_id, version = content.version, "Loaded project");
            Ok(true)
        }
        None => {
            tracing::info!(project = %project_id, "Project has no saved content");
            Ok(false)
        }
    }
}
