//! Whole-document undo/redo.
//!
//! Every commit stores a full [`DocumentSnapshot`]: the serialized scene plus
//! the asset records. Traversing a commit whose label marks a pure bounds
//! change (`move*`, `resize*`) between two snapshots with the same items can
//! be replayed as bounds deltas instead of a full scene rebuild.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::snapshot::Snapshot;

/// One committed document state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    /// Label of the action that produced this state.
    pub label: String,
    /// Serialized scene tree.
    pub scene: String,
    /// Asset records, ids unchanged.
    pub assets: Snapshot,
}

/// How a traversal must be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    /// Only bounds differ; replay them through the registry.
    BoundsOnly,
    /// Rebuild the scene from the snapshot.
    Full,
}

/// Result of an undo or redo.
#[derive(Debug, Clone, PartialEq)]
pub struct Traversal {
    /// Label of the commit that was undone or redone.
    pub label: String,
    /// State to restore.
    pub target: DocumentSnapshot,
    /// How to restore it.
    pub mode: ReplayMode,
}

/// Whether a commit label describes a pure bounds change.
#[must_use]
pub fn is_bounds_only_label(label: &str) -> bool {
    let label = label.trim().to_ascii_lowercase();
    label.starts_with("move") || label.starts_with("resize")
}

/// Pick the replay mode for traversing `label` between `from` and `to`.
///
/// The fast path needs a bounds-only label and the same items on both sides,
/// each on the same layer with the same visibility. Anything else is a full
/// restore.
#[must_use]
pub fn replay_mode(label: &str, from: &Snapshot, to: &Snapshot) -> ReplayMode {
    if !is_bounds_only_label(label) {
        return ReplayMode::Full;
    }
    let mut a = from.placements();
    let mut b = to.placements();
    if a.len() != b.len() {
        return ReplayMode::Full;
    }
    a.sort_by(|x, y| (x.kind, x.id).cmp(&(y.kind, y.id)));
    b.sort_by(|x, y| (x.kind, x.id).cmp(&(y.kind, y.id)));
    let parity = a.iter().zip(&b).all(|(x, y)| {
        x.kind == y.kind && x.id == y.id && x.layer_id == y.layer_id && x.visible == y.visible
    });
    if parity {
        ReplayMode::BoundsOnly
    } else {
        tracing::debug!(label, "Bounds-only commit changed items, using full restore");
        ReplayMode::Full
    }
}

#[derive(Debug, Clone, Default)]
struct DocumentHistory {
    past: Vec<DocumentSnapshot>,
    present: Option<DocumentSnapshot>,
    future: Vec<DocumentSnapshot>,
}

/// Bounded undo/redo stacks, one set per open document.
#[derive(Debug, Clone)]
pub struct HistoryManager {
    documents: HashMap<String, DocumentHistory>,
    active: Option<String>,
    depth: usize,
    restoring: bool,
}

impl HistoryManager {
    /// Create a manager keeping at most `depth` undo steps per document.
    #[must_use]
    pub fn new(depth: usize) -> Self {
        Self {
            documents: HashMap::new(),
            active: None,
            depth: depth.max(1),
            restoring: false,
        }
    }

    /// Switch to `document`. Its stacks are kept if it was open before.
    pub fn set_active(&mut self, document: &str) {
        self.active = Some(document.to_string());
        self.documents.entry(document.to_string()).or_default();
    }

    /// Active document id.
    #[must_use]
    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Whether a restore is in progress.
    #[must_use]
    pub const fn is_restoring(&self) -> bool {
        self.restoring
    }

    /// Mark the start of a restore. Commits are ignored until [`Self::end_restore`].
    pub fn begin_restore(&mut self) {
        self.restoring = true;
    }

    /// Mark the end of a restore.
    pub fn end_restore(&mut self) {
        self.restoring = false;
    }

    fn current(&mut self) -> SyncResult<&mut DocumentHistory> {
        let active = self
            .active
            .as_ref()
            .ok_or_else(|| SyncError::History("no active document".to_string()))?;
        Ok(self.documents.entry(active.clone()).or_default())
    }

    /// Record a new state. Clears the redo stack.
    ///
    /// Returns `false` without recording while a restore is in progress or
    /// when no document is active.
    pub fn commit(&mut self, snapshot: DocumentSnapshot) -> bool {
        if self.restoring {
            tracing::debug!(label = %snapshot.label, "Ignoring commit during restore");
            return false;
        }
        let depth = self.depth;
        let Ok(history) = self.current() else {
            tracing::warn!(label = %snapshot.label, "Commit without an active document");
            return false;
        };
        if let Some(previous) = history.present.take() {
            history.past.push(previous);
            if history.past.len() > depth {
                let excess = history.past.len() - depth;
                history.past.drain(..excess);
            }
        }
        history.future.clear();
        tracing::debug!(label = %snapshot.label, undo = history.past.len(), "Committed");
        history.present = Some(snapshot);
        true
    }

    /// Step back one commit.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::History`] if there is nothing to undo.
    pub fn undo(&mut self) -> SyncResult<Traversal> {
        let history = self.current()?;
        if history.present.is_none() || history.past.is_empty() {
            return Err(SyncError::History("nothing to undo".to_string()));
        }
        let (Some(present), Some(target)) = (history.present.take(), history.past.pop()) else {
            return Err(SyncError::History("nothing to undo".to_string()));
        };
        let mode = replay_mode(&present.label, &present.assets, &target.assets);
        let label = present.label.clone();
        history.future.push(present);
        history.present = Some(target.clone());
        Ok(Traversal { label, target, mode })
    }

    /// Step forward one commit.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::History`] if there is nothing to redo.
    pub fn redo(&mut self) -> SyncResult<Traversal> {
        let history = self.current()?;
        if history.present.is_none() || history.future.is_empty() {
            return Err(SyncError::History("nothing to redo".to_string()));
        }
        let (Some(present), Some(target)) = (history.present.take(), history.future.pop()) else {
            return Err(SyncError::History("nothing to redo".to_string()));
        };
        let mode = replay_mode(&target.label, &present.assets, &target.assets);
        history.past.push(present);
        history.present = Some(target.clone());
        Ok(Traversal {
            label: target.label.clone(),
            target,
            mode,
        })
    }

    /// Number of available undo steps.
    #[must_use]
    pub fn undo_depth(&self) -> usize {
        self.active_history().map_or(0, |h| h.past.len())
    }

    /// Number of available redo steps.
    #[must_use]
    pub fn redo_depth(&self) -> usize {
        self.active_history().map_or(0, |h| h.future.len())
    }

    /// Most recent committed state.
    #[must_use]
    pub fn present(&self) -> Option<&DocumentSnapshot> {
        self.active_history().and_then(|h| h.present.as_ref())
    }

    fn active_history(&self) -> Option<&DocumentHistory> {
        self.active.as_ref().and_then(|a| self.documents.get(a))
    }

    /// Drop the stacks of one document.
    pub fn forget(&mut self, document: &str) {
        self.documents.remove(document);
        if self.active.as_deref() == Some(document) {
            self.active = None;
        }
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.documents.clear();
        self.active = None;
        self.restoring = false;
    }
}
