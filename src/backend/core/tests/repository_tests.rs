//! Aggregate repository tests.
//!
//! Tests cover:
//! - Cached and uncached repositories agree
//! - Historic states and their bounds
//! - Snapshots persisted by the file cache
//! - Invalidation before a tail is replaced

use std::sync::Arc;

use wmsnotes_core::error::ErrorCode;
use wmsnotes_core::event_log::{EventLog, InMemoryEventLog};
use wmsnotes_core::events::{Event, EventPayload, Note, Path};
use wmsnotes_core::repository::{
    AggregateCache, AggregateRepository, FileAggregateCache, InMemoryAggregateCache,
};

/// A note with `revisions` events: a creation followed by content changes.
async fn seed_note(log: &dyn EventLog, revisions: u64) -> String {
    let agg_id = Note::new_agg_id();
    log.append(Event::new(
        &agg_id,
        1,
        EventPayload::NoteCreated {
            path: Path::parse("inbox"),
            title: "Draft".to_string(),
            content: "v1".to_string(),
        },
    ))
    .await
    .unwrap();
    for revision in 2..=revisions {
        log.append(Event::new(
            &agg_id,
            revision,
            EventPayload::ContentChanged {
                content: format!("v{}", revision),
            },
        ))
        .await
        .unwrap();
    }
    agg_id
}

// ============================================================================
// Replay
// ============================================================================

#[tokio::test]
async fn test_cached_and_uncached_agree() {
    let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::default());
    let agg_id = seed_note(log.as_ref(), 12).await;

    let uncached = AggregateRepository::<Note>::uncached(Arc::clone(&log));
    let cache = Arc::new(InMemoryAggregateCache::<Note>::new());
    let cached = AggregateRepository::new(Arc::clone(&log), cache.clone(), 4);

    for revision in [3, 12, 7, 12, 1] {
        let expected = uncached.get_at(&agg_id, revision).await.unwrap();
        let actual = cached.get_at(&agg_id, revision).await.unwrap();
        assert_eq!(actual, expected, "revision {}", revision);
        assert_eq!(actual.content, format!("v{}", revision));
    }
    assert!(!cache.is_empty());
}

#[tokio::test]
async fn test_unknown_aggregate_is_empty() {
    let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::default());
    let repository = AggregateRepository::<Note>::uncached(log);

    let id = Note::new_agg_id();
    let note = repository.get_latest(&id).await.unwrap();
    assert_eq!(note.revision, 0);
    assert!(!note.exists);
    assert_eq!(
        repository.get_at(&id, 1).await.unwrap_err().code(),
        ErrorCode::NotFound
    );
}

// ============================================================================
// Snapshots
// ============================================================================

#[tokio::test]
async fn test_file_snapshots_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::default());
    let agg_id = seed_note(log.as_ref(), 6).await;

    let first = AggregateRepository::new(
        Arc::clone(&log),
        Arc::new(FileAggregateCache::<Note>::new(dir.path())),
        2,
    );
    let latest = first.get_latest(&agg_id).await.unwrap();

    let cache = FileAggregateCache::<Note>::new(dir.path());
    let snapshot = cache.get(&agg_id, 6).await.unwrap().unwrap();
    assert_eq!(snapshot, latest);

    let second = AggregateRepository::new(Arc::clone(&log), Arc::new(cache), 2);
    assert_eq!(second.get_latest(&agg_id).await.unwrap(), latest);
}

#[tokio::test]
async fn test_invalidate_after_replaced_tail() {
    let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::default());
    let agg_id = seed_note(log.as_ref(), 5).await;

    let cache = Arc::new(InMemoryAggregateCache::<Note>::new());
    let repository = AggregateRepository::new(Arc::clone(&log), cache.clone(), 1);
    assert_eq!(repository.get_latest(&agg_id).await.unwrap().content, "v5");

    let tail = log.get_events_of_aggregate(&agg_id, Some(4)).await.unwrap();
    log.remove(&tail[0]).await.unwrap();
    repository.invalidate_after(&agg_id, 4).await.unwrap();
    assert!(cache.get(&agg_id, 5).await.unwrap().is_none());

    log.append(Event::new(
        &agg_id,
        5,
        EventPayload::ContentChanged {
            content: "replaced".to_string(),
        },
    ))
    .await
    .unwrap();

    let note = repository.get_latest(&agg_id).await.unwrap();
    assert_eq!(note.revision, 5);
    assert_eq!(note.content, "replaced");
}
