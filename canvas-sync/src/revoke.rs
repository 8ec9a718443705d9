//! Deferred revocation of local-ephemeral references.
//!
//! A `blob:` handle is revoked only after a reachability scan finds no
//! consumer: no registry payload, no scene node and no external hold (chat or
//! editing surfaces). Otherwise the revocation is deferred and retried later.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::asset::{AssetKind, AssetResolver};
use crate::registry::RegistryState;
use crate::scene::{NodeKind, SceneTree};

/// Host hook that releases a local handle.
pub trait ObjectUrlRevoker {
    /// Release `reference`.
    fn revoke(&self, reference: &str);
}

/// Revoker for hosts without releasable handles. Only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRevoker;

impl ObjectUrlRevoker for NoopRevoker {
    fn revoke(&self, reference: &str) {
        tracing::debug!(reference, "No revoker installed, dropping handle");
    }
}

/// Something still referencing a local handle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Holder {
    /// A registry payload.
    Registry,
    /// A scene node (raster source or attribute).
    Scene,
    /// An upload that still renders it.
    Upload,
    /// A named external consumer.
    External(String),
}

/// Result of a revocation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevokeOutcome {
    /// Revoked now.
    Revoked,
    /// Still reachable; queued for retry.
    Deferred {
        /// Who still holds it.
        holders: Vec<Holder>,
    },
    /// Not a local-ephemeral reference; nothing to revoke.
    NotLocal,
}

/// Everything a reachability scan looks at.
#[derive(Debug, Clone, Copy)]
pub struct Reachability<'a> {
    /// Live registry.
    pub registry: &'a RegistryState,
    /// Live scene.
    pub scene: &'a SceneTree,
    /// Local references still rendered by uploads in flight.
    pub uploads: &'a [&'a str],
}

impl Reachability<'_> {
    /// Every holder of `reference`.
    #[must_use]
    pub fn holders(&self, reference: &str, external: Option<&HashSet<String>>) -> Vec<Holder> {
        let mut holders = Vec::new();
        if self.registry.references().contains(&reference) {
            holders.push(Holder::Registry);
        }
        if scene_references(self.scene, reference) {
            holders.push(Holder::Scene);
        }
        if self.uploads.contains(&reference) {
            holders.push(Holder::Upload);
        }
        if let Some(consumers) = external {
            let mut names: Vec<&String> = consumers.iter().collect();
            names.sort();
            holders.extend(names.into_iter().map(|c| Holder::External(c.clone())));
        }
        holders
    }
}

fn scene_references(scene: &SceneTree, reference: &str) -> bool {
    scene.all_content().into_iter().any(|h| {
        scene.node(h).is_some_and(|node| {
            let raster_hit = matches!(&node.kind, NodeKind::Raster(r) if r.source == reference);
            raster_hit || node.data.attrs.values().any(|v| v == reference)
        })
    })
}

/// Tracks external holds and deferred revocations.
#[derive(Debug, Clone, Default)]
pub struct LocalRefTracker {
    holds: HashMap<String, HashSet<String>>,
    deferred: BTreeSet<String>,
    revoked: HashSet<String>,
}

impl LocalRefTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `consumer` as holding `reference`.
    pub fn hold(&mut self, reference: &str, consumer: &str) {
        self.holds
            .entry(reference.to_string())
            .or_default()
            .insert(consumer.to_string());
    }

    /// Drop `consumer`'s hold on `reference`.
    pub fn release(&mut self, reference: &str, consumer: &str) {
        if let Some(consumers) = self.holds.get_mut(reference) {
            consumers.remove(consumer);
            if consumers.is_empty() {
                self.holds.remove(reference);
            }
        }
    }

    /// Drop every hold of `consumer`.
    pub fn release_consumer(&mut self, consumer: &str) {
        self.holds.retain(|_, consumers| {
            consumers.remove(consumer);
            !consumers.is_empty()
        });
    }

    /// References waiting for a retry.
    #[must_use]
    pub fn deferred(&self) -> Vec<String> {
        self.deferred.iter().cloned().collect()
    }

    /// Whether `reference` has been revoked.
    #[must_use]
    pub fn is_revoked(&self, reference: &str) -> bool {
        self.revoked.contains(reference)
    }

    /// Revoke `reference` if nothing reaches it, otherwise defer.
    pub fn request_revoke(
        &mut self,
        resolver: &AssetResolver,
        reference: &str,
        reach: &Reachability<'_>,
        revoker: &dyn ObjectUrlRevoker,
    ) -> RevokeOutcome {
        if resolver.classify(reference) != Some(AssetKind::LocalEphemeral) {
            return RevokeOutcome::NotLocal;
        }
        if self.revoked.contains(reference) {
            return RevokeOutcome::Revoked;
        }
        let holders = reach.holders(reference, self.holds.get(reference));
        if holders.is_empty() {
            revoker.revoke(reference);
            self.deferred.remove(reference);
            self.revoked.insert(reference.to_string());
            tracing::debug!(reference, "Revoked local reference");
            RevokeOutcome::Revoked
        } else {
            tracing::warn!(
                reference,
                ?holders,
                "Local reference still reachable, deferring revocation"
            );
            self.deferred.insert(reference.to_string());
            RevokeOutcome::Deferred { holders }
        }
    }

    /// Retry every deferred revocation. Returns the references revoked.
    pub fn retry_deferred(
        &mut self,
        resolver: &AssetResolver,
        reach: &Reachability<'_>,
        revoker: &dyn ObjectUrlRevoker,
    ) -> Vec<String> {
        let pending: Vec<String> = self.deferred.iter().cloned().collect();
        pending
            .into_iter()
            .filter(|reference| {
                matches!(
                    self.request_revoke(resolver, reference, reach, revoker),
                    RevokeOutcome::Revoked
                )
            })
            .collect()
    }

    /// Revoke every deferred reference unconditionally and forget all holds.
    ///
    /// Used on teardown, when no consumer outlives the document.
    pub fn revoke_all(&mut self, revoker: &dyn ObjectUrlRevoker) -> usize {
        let pending = std::mem::take(&mut self.deferred);
        let count = pending.len();
        for reference in pending {
            revoker.revoke(&reference);
            self.revoked.insert(reference);
        }
        self.holds.clear();
        count
    }
}
