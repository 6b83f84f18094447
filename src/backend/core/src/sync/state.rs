//! Persistent synchronizer bookkeeping.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path as FsPath;

use crate::error::{ErrorCode, NotesError, Result};
use crate::events::Revision;

/// Revisions at which the two replicas of an aggregate last had equal content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncBase {
    pub local: Revision,
    pub remote: Revision,
}

/// An aggregate the merge strategies could not reconcile, and the revisions
/// they gave up on. It is retried once either side moves past them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedMarker {
    pub local: Revision,
    pub remote: Revision,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynchronizerState {
    #[serde(default)]
    pub bases: BTreeMap<String, SyncBase>,
    /// Failed attempts since the last successful reconciliation
    #[serde(default)]
    pub retries: BTreeMap<String, u32>,
    #[serde(default)]
    pub unresolved: BTreeMap<String, UnresolvedMarker>,
}

impl SynchronizerState {
    pub fn base(&self, agg_id: &str) -> Option<SyncBase> {
        self.bases.get(agg_id).copied()
    }

    /// Record a successful reconciliation.
    pub fn synchronized(&mut self, agg_id: &str, base: SyncBase) {
        self.bases.insert(agg_id.to_string(), base);
        self.retries.remove(agg_id);
        self.unresolved.remove(agg_id);
    }

    /// Count a failed attempt and return the number of failures so far.
    pub fn record_failure(&mut self, agg_id: &str) -> u32 {
        let count = self.retries.entry(agg_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn mark_unresolved(&mut self, agg_id: &str, local: Revision, remote: Revision, reason: impl Into<String>) {
        self.unresolved.insert(
            agg_id.to_string(),
            UnresolvedMarker {
                local,
                remote,
                reason: reason.into(),
            },
        );
    }

    /// The marker for `agg_id` if neither side changed since it was set.
    pub fn unresolved_at(&self, agg_id: &str, local: Revision, remote: Revision) -> Option<&UnresolvedMarker> {
        self.unresolved
            .get(agg_id)
            .filter(|marker| marker.local == local && marker.remote == remote)
    }

    /// Load state from `path`; a missing file is an empty state.
    pub async fn load(path: impl AsRef<FsPath>) -> Result<Self> {
        let path = path.as_ref();
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                NotesError::with_internal(
                    ErrorCode::SerializationError,
                    format!("Could not read synchronizer state from {}", path.display()),
                    e.to_string(),
                )
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, path: impl AsRef<FsPath>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(self)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
