//! Snapshot cache backends.
//!
//! Provides:
//! - `AggregateCache` trait defining the snapshot contract
//! - `NoopAggregateCache`: always misses, never stores
//! - `InMemoryAggregateCache`: DashMap of per-aggregate revision maps
//! - `FileAggregateCache`: one JSON snapshot per `(agg_id, revision)`
//!
//! A snapshot at revision `r` is equivalent to replaying revisions `1..=r` and
//! is immutable once written. A missing entry is a miss, never an error.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path as FsPath, PathBuf};

use crate::error::{ErrorCode, NotesError, Result};
use crate::event_log::validate_agg_id;
use crate::events::{Aggregate, Revision};

// =============================================================================
// Cache Trait
// =============================================================================

/// Storage for materialized aggregate states.
#[async_trait]
pub trait AggregateCache<A: Aggregate>: Send + Sync {
    /// The snapshot at exactly `revision`.
    async fn get(&self, agg_id: &str, revision: Revision) -> Result<Option<A>>;

    /// The snapshot with the highest revision not above `max_revision`.
    async fn get_latest(&self, agg_id: &str, max_revision: Option<Revision>) -> Result<Option<A>>;

    /// Store a snapshot. Storing an existing `(agg_id, revision)` is a no-op.
    async fn put(&self, aggregate: &A) -> Result<()>;

    /// Drop every snapshot above `revision`.
    async fn remove_after(&self, agg_id: &str, revision: Revision) -> Result<()>;

    /// Backend name for logging.
    fn name(&self) -> &'static str;
}

// =============================================================================
// No-op Cache
// =============================================================================

/// Cache that never stores anything; every read replays from revision 1.
pub struct NoopAggregateCache<A>(PhantomData<fn() -> A>);

impl<A> NoopAggregateCache<A> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<A> Default for NoopAggregateCache<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<A: Aggregate> AggregateCache<A> for NoopAggregateCache<A> {
    async fn get(&self, _agg_id: &str, _revision: Revision) -> Result<Option<A>> {
        Ok(None)
    }

    async fn get_latest(&self, _agg_id: &str, _max_revision: Option<Revision>) -> Result<Option<A>> {
        Ok(None)
    }

    async fn put(&self, _aggregate: &A) -> Result<()> {
        Ok(())
    }

    async fn remove_after(&self, _agg_id: &str, _revision: Revision) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

// =============================================================================
// In-Memory Cache
// =============================================================================

/// Snapshot cache held in memory.
pub struct InMemoryAggregateCache<A> {
    entries: DashMap<String, BTreeMap<Revision, A>>,
}

impl<A> InMemoryAggregateCache<A> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of stored snapshots across all aggregates.
    pub fn len(&self) -> usize {
        self.entries.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<A> Default for InMemoryAggregateCache<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<A: Aggregate> AggregateCache<A> for InMemoryAggregateCache<A> {
    async fn get(&self, agg_id: &str, revision: Revision) -> Result<Option<A>> {
        Ok(self
            .entries
            .get(agg_id)
            .and_then(|snapshots| snapshots.get(&revision).cloned()))
    }

    async fn get_latest(&self, agg_id: &str, max_revision: Option<Revision>) -> Result<Option<A>> {
        let max = max_revision.unwrap_or(Revision::MAX);
        Ok(self.entries.get(agg_id).and_then(|snapshots| {
            snapshots
                .range(..=max)
                .next_back()
                .map(|(_, aggregate)| aggregate.clone())
        }))
    }

    async fn put(&self, aggregate: &A) -> Result<()> {
        self.entries
            .entry(aggregate.agg_id().to_string())
            .or_default()
            .entry(aggregate.revision())
            .or_insert_with(|| aggregate.clone());
        Ok(())
    }

    async fn remove_after(&self, agg_id: &str, revision: Revision) -> Result<()> {
        if let Some(mut snapshots) = self.entries.get_mut(agg_id) {
            snapshots.split_off(&revision.saturating_add(1));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// =============================================================================
// File Cache
// =============================================================================

/// Snapshot cache stored as `<root>/<agg_id>/<revision:010>.json`.
pub struct FileAggregateCache<A> {
    root: PathBuf,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A> FileAggregateCache<A> {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            _aggregate: PhantomData,
        }
    }

    fn snapshot_path(&self, agg_id: &str, revision: Revision) -> PathBuf {
        self.root.join(agg_id).join(format!("{:010}.json", revision))
    }

    /// Stored revisions of one aggregate, ascending.
    async fn revisions(&self, agg_id: &str) -> Result<Vec<Revision>> {
        let dir = self.root.join(agg_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut revisions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(revision) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<Revision>().ok())
            {
                revisions.push(revision);
            }
        }
        revisions.sort_unstable();
        Ok(revisions)
    }

    async fn read(&self, path: &FsPath) -> Result<Option<A>>
    where
        A: Aggregate,
    {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl<A: Aggregate> AggregateCache<A> for FileAggregateCache<A> {
    async fn get(&self, agg_id: &str, revision: Revision) -> Result<Option<A>> {
        validate_agg_id(agg_id)?;
        self.read(&self.snapshot_path(agg_id, revision)).await
    }

    async fn get_latest(&self, agg_id: &str, max_revision: Option<Revision>) -> Result<Option<A>> {
        validate_agg_id(agg_id)?;
        let max = max_revision.unwrap_or(Revision::MAX);
        let best = self
            .revisions(agg_id)
            .await?
            .into_iter()
            .filter(|revision| *revision <= max)
            .next_back();

        match best {
            Some(revision) => self.read(&self.snapshot_path(agg_id, revision)).await,
            None => Ok(None),
        }
    }

    async fn put(&self, aggregate: &A) -> Result<()> {
        validate_agg_id(aggregate.agg_id())?;
        let path = self.snapshot_path(aggregate.agg_id(), aggregate.revision());
        if tokio::fs::try_exists(&path).await? {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(aggregate)?).await?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| {
            NotesError::with_internal(
                ErrorCode::StorageError,
                format!("Could not store snapshot {}", path.display()),
                e.to_string(),
            )
        })
    }

    async fn remove_after(&self, agg_id: &str, revision: Revision) -> Result<()> {
        validate_agg_id(agg_id)?;
        for stored in self.revisions(agg_id).await? {
            if stored > revision {
                tokio::fs::remove_file(self.snapshot_path(agg_id, stored)).await?;
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Folder, Path};

    fn folder(revision: Revision) -> Folder {
        let path = Path::parse("inbox");
        Folder {
            agg_id: Folder::agg_id_for(&path),
            revision,
            exists: revision % 2 == 1,
            path,
        }
    }

    #[tokio::test]
    async fn test_noop_cache_always_misses() {
        let cache = NoopAggregateCache::<Folder>::new();
        cache.put(&folder(1)).await.unwrap();
        assert!(cache.get(&folder(1).agg_id, 1).await.unwrap().is_none());
        assert!(cache.get_latest(&folder(1).agg_id, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_memory_get_latest_respects_cap() {
        let cache = InMemoryAggregateCache::new();
        let id = folder(1).agg_id;
        for revision in [1, 3, 5] {
            cache.put(&folder(revision)).await.unwrap();
        }

        assert_eq!(cache.get_latest(&id, Some(4)).await.unwrap().unwrap().revision, 3);
        assert_eq!(cache.get_latest(&id, None).await.unwrap().unwrap().revision, 5);
        assert!(cache.get_latest(&id, Some(0)).await.unwrap().is_none());

        cache.remove_after(&id, 3).await.unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_file_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileAggregateCache::<Folder>::new(dir.path());
        let id = folder(1).agg_id;

        assert!(cache.get_latest(&id, None).await.unwrap().is_none());

        cache.put(&folder(2)).await.unwrap();
        cache.put(&folder(7)).await.unwrap();

        assert_eq!(cache.get(&id, 2).await.unwrap(), Some(folder(2)));
        assert_eq!(cache.get_latest(&id, Some(6)).await.unwrap(), Some(folder(2)));

        cache.remove_after(&id, 2).await.unwrap();
        assert!(cache.get(&id, 7).await.unwrap().is_none());
    }
}
