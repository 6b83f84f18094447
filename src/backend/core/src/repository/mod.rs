//! Aggregate reconstruction.
//!
//! [`AggregateRepository`] rebuilds an aggregate by taking the newest snapshot
//! at or below the requested revision and replaying the remaining events from
//! the log. Snapshots are an optimization only: a failing cache is logged and
//! treated as a miss, and the result is always what a full replay would give.

mod cache;

pub use cache::{AggregateCache, FileAggregateCache, InMemoryAggregateCache, NoopAggregateCache};

use metrics::counter;
use std::sync::Arc;
use tracing::instrument;

use crate::error::{NotesError, Result};
use crate::event_log::EventLog;
use crate::events::{fold, Aggregate, Event, Revision};

/// Default number of replayed events after which a snapshot is written.
pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 20;

/// Loads aggregates of one type from an event log.
pub struct AggregateRepository<A: Aggregate> {
    log: Arc<dyn EventLog>,
    cache: Arc<dyn AggregateCache<A>>,
    snapshot_interval: u64,
}

impl<A: Aggregate> Clone for AggregateRepository<A> {
    fn clone(&self) -> Self {
        Self {
            log: Arc::clone(&self.log),
            cache: Arc::clone(&self.cache),
            snapshot_interval: self.snapshot_interval,
        }
    }
}

impl<A: Aggregate> AggregateRepository<A> {
    /// `snapshot_interval` of 0 disables snapshot writes.
    pub fn new(
        log: Arc<dyn EventLog>,
        cache: Arc<dyn AggregateCache<A>>,
        snapshot_interval: u64,
    ) -> Self {
        Self {
            log,
            cache,
            snapshot_interval,
        }
    }

    /// Repository that always replays from revision 1.
    pub fn uncached(log: Arc<dyn EventLog>) -> Self {
        Self::new(log, Arc::new(NoopAggregateCache::new()), 0)
    }

    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    /// Current state of an aggregate; the empty aggregate if it has no events.
    pub async fn get_latest(&self, agg_id: &str) -> Result<A> {
        let latest = self.log.latest_revision(agg_id).await?;
        self.load(agg_id, latest).await
    }

    /// State of an aggregate after exactly `revision` events.
    ///
    /// Revision 0 is the empty aggregate. A revision above the newest stored
    /// one fails with `NotFound`.
    pub async fn get_at(&self, agg_id: &str, revision: Revision) -> Result<A> {
        if revision == 0 {
            return Ok(A::empty(agg_id));
        }
        let latest = self.log.latest_revision(agg_id).await?;
        if revision > latest {
            return Err(NotesError::not_found(
                A::AGGREGATE_TYPE.to_string(),
                format!("{}@{}", agg_id, revision),
            )
            .with_context("latest_revision", latest));
        }
        self.load(agg_id, revision).await
    }

    /// Forget snapshots above `revision`, e.g. before the tail is rewritten.
    pub async fn invalidate_after(&self, agg_id: &str, revision: Revision) -> Result<()> {
        self.cache.remove_after(agg_id, revision).await
    }

    #[instrument(skip(self), fields(cache = self.cache.name()))]
    async fn load(&self, agg_id: &str, target: Revision) -> Result<A> {
        let base = match self.cache.get_latest(agg_id, Some(target)).await {
            Ok(Some(snapshot)) => {
                counter!("wmsnotes_snapshot_cache_total", "result" => "hit").increment(1);
                snapshot
            }
            Ok(None) => {
                counter!("wmsnotes_snapshot_cache_total", "result" => "miss").increment(1);
                A::empty(agg_id)
            }
            Err(e) => {
                counter!("wmsnotes_snapshot_cache_total", "result" => "error").increment(1);
                tracing::warn!(error = %e, "Snapshot cache read failed, replaying from the log");
                A::empty(agg_id)
            }
        };

        if base.revision() == target {
            return Ok(base);
        }

        let events: Vec<_> = self
            .log
            .get_events_of_aggregate(agg_id, Some(base.revision()))
            .await?
            .into_iter()
            .take_while(|event| event.revision <= target)
            .collect();
        let replayed = events.len() as u64;
        let state = fold(base, &events)?;

        if state.revision() != target {
            return Err(NotesError::replay_failed(
                agg_id,
                events.last().map(|e| e.event_id).unwrap_or(0),
                state.revision(),
                format!("expected revision {}, reached {}", target, state.revision()),
            ));
        }

        if self.snapshot_interval > 0 && replayed >= self.snapshot_interval {
            if let Some(last) = events.last() {
                self.write_snapshot(&state, last, replayed).await;
            }
        }

        Ok(state)
    }

    /// Store `state` unless the event it was built from has since been replaced.
    ///
    /// The snapshot is written first and checked afterwards: a tail rewrite
    /// removes events before it invalidates snapshots, so either the check
    /// sees the removal or the rewrite's invalidation drops the snapshot.
    async fn write_snapshot(&self, state: &A, last: &Event, replayed: u64) {
        if let Err(e) = self.cache.put(state).await {
            tracing::warn!(error = %e, revision = state.revision(), "Snapshot write failed");
            return;
        }

        let stored = self
            .log
            .get_events_of_aggregate(state.agg_id(), Some(last.revision - 1))
            .await
            .map(|events| events.first().map(|event| event.event_id) == Some(last.event_id));
        match stored {
            Ok(true) => {
                tracing::debug!(revision = state.revision(), replayed, "Snapshot written");
            }
            Ok(false) | Err(_) => {
                tracing::debug!(revision = state.revision(), "Replayed event was replaced, dropping snapshot");
                if let Err(e) = self.cache.remove_after(state.agg_id(), last.revision - 1).await {
                    tracing::warn!(error = %e, revision = state.revision(), "Snapshot removal failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::InMemoryEventLog;
    use crate::events::{EventPayload, Folder, Path};
    use async_trait::async_trait;

    async fn seed(log: &InMemoryEventLog, path: &Path, revisions: u64) -> String {
        let agg_id = Folder::agg_id_for(path);
        for revision in 1..=revisions {
            let payload = if revision % 2 == 1 {
                EventPayload::FolderCreated { path: path.clone() }
            } else {
                EventPayload::FolderDeleted { path: path.clone() }
            };
            log.append(Event::new(agg_id.clone(), revision, payload))
                .await
                .unwrap();
        }
        agg_id
    }

    #[tokio::test]
    async fn test_get_at_bounds() {
        let log = Arc::new(InMemoryEventLog::default());
        let path = Path::parse("projects");
        let agg_id = seed(&log, &path, 3).await;
        let repository = AggregateRepository::<Folder>::uncached(log);

        assert_eq!(repository.get_at(&agg_id, 0).await.unwrap().revision, 0);
        assert!(!repository.get_at(&agg_id, 2).await.unwrap().exists);
        assert!(repository.get_latest(&agg_id).await.unwrap().exists);
        assert_eq!(
            repository.get_at(&agg_id, 4).await.unwrap_err().code(),
            crate::error::ErrorCode::NotFound
        );
    }

    #[tokio::test]
    async fn test_snapshot_written_after_interval() {
        let log = Arc::new(InMemoryEventLog::default());
        let path = Path::parse("projects");
        let agg_id = seed(&log, &path, 5).await;

        let cache = Arc::new(InMemoryAggregateCache::<Folder>::new());
        let repository = AggregateRepository::new(log, cache.clone(), 3);

        let first = repository.get_latest(&agg_id).await.unwrap();
        assert_eq!(cache.len(), 1);

        let second = repository.get_latest(&agg_id).await.unwrap();
        assert_eq!(first, second);
    }

    /// Replaces the newest event of the aggregate while a snapshot is being stored.
    struct ReplacedDuringPut {
        inner: InMemoryAggregateCache<Folder>,
        log: Arc<InMemoryEventLog>,
    }

    #[async_trait]
    impl AggregateCache<Folder> for ReplacedDuringPut {
        async fn get(&self, agg_id: &str, revision: Revision) -> Result<Option<Folder>> {
            self.inner.get(agg_id, revision).await
        }

        async fn get_latest(&self, agg_id: &str, max_revision: Option<Revision>) -> Result<Option<Folder>> {
            self.inner.get_latest(agg_id, max_revision).await
        }

        async fn put(&self, aggregate: &Folder) -> Result<()> {
            let tail = self
                .log
                .get_events_of_aggregate(&aggregate.agg_id, Some(aggregate.revision - 1))
                .await?;
            let replaced = &tail[0];
            self.log.remove(replaced).await?;
            self.inner.remove_after(&aggregate.agg_id, aggregate.revision - 1).await?;
            self.log
                .append(Event::new(&aggregate.agg_id, replaced.revision, replaced.payload.clone()))
                .await?;
            self.inner.put(aggregate).await
        }

        async fn remove_after(&self, agg_id: &str, revision: Revision) -> Result<()> {
            self.inner.remove_after(agg_id, revision).await
        }

        fn name(&self) -> &'static str {
            "replaced-during-put"
        }
    }

    #[tokio::test]
    async fn test_snapshot_of_replaced_event_is_dropped() {
        let log = Arc::new(InMemoryEventLog::default());
        let path = Path::parse("projects");
        let agg_id = seed(&log, &path, 3).await;

        let cache = Arc::new(ReplacedDuringPut {
            inner: InMemoryAggregateCache::new(),
            log: Arc::clone(&log),
        });
        let repository = AggregateRepository::new(log.clone(), cache.clone(), 2);

        repository.get_latest(&agg_id).await.unwrap();

        assert!(cache.inner.get(&agg_id, 3).await.unwrap().is_none());
        assert_eq!(log.get_events_of_aggregate(&agg_id, Some(2)).await.unwrap()[0].event_id, 4);
    }
}
