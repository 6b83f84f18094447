//! Event log contract tests, run against both backends.
//!
//! Tests cover:
//! - Id assignment and revision checks on append
//! - History queries (global and per aggregate)
//! - Removal of the newest event and id reuse
//! - Live updates and the history/live boundary
//! - Persistence of the file backend, including revisions replaced after removal

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

use wmsnotes_core::error::ErrorCode;
use wmsnotes_core::event_log::{EventLog, FileEventLog, InMemoryEventLog};
use wmsnotes_core::events::{Event, EventId, EventPayload, Path};

fn created(agg_id: &str, title: &str) -> Event {
    Event::new(
        agg_id,
        1,
        EventPayload::NoteCreated {
            path: Path::parse("inbox"),
            title: title.to_string(),
            content: String::new(),
        },
    )
}

fn content(agg_id: &str, revision: u64, content: &str) -> Event {
    Event::new(
        agg_id,
        revision,
        EventPayload::ContentChanged {
            content: content.to_string(),
        },
    )
}

async fn ids(log: &dyn EventLog, after: Option<EventId>) -> Vec<EventId> {
    log.get_events(after)
        .map(|event| event.unwrap().event_id)
        .collect()
        .await
}

// ============================================================================
// Shared contract
// ============================================================================

async fn check_append_and_query(log: &dyn EventLog) {
    let a1 = log.append(created("n-a", "A")).await.unwrap();
    let b1 = log.append(created("n-b", "B")).await.unwrap();
    let a2 = log.append(content("n-a", 2, "text")).await.unwrap();

    assert_eq!((a1.event_id, b1.event_id, a2.event_id), (1, 2, 3));
    assert_eq!(ids(log, None).await, vec![1, 2, 3]);
    assert_eq!(ids(log, Some(1)).await, vec![2, 3]);
    assert!(ids(log, Some(3)).await.is_empty());

    let of_a = log.get_events_of_aggregate("n-a", None).await.unwrap();
    assert_eq!(of_a, vec![a1.clone(), a2.clone()]);
    let after_1 = log.get_events_of_aggregate("n-a", Some(1)).await.unwrap();
    assert_eq!(after_1, vec![a2]);

    assert_eq!(log.latest_revision("n-a").await.unwrap(), 2);
    assert_eq!(log.latest_revision("n-unknown").await.unwrap(), 0);
    assert_eq!(
        log.get_aggregate_ids().await.unwrap().into_iter().collect::<Vec<_>>(),
        vec!["n-a".to_string(), "n-b".to_string()]
    );
}

async fn check_append_rejections(log: &dyn EventLog) {
    let stored = log.append(created("n-a", "A")).await.unwrap();

    let duplicate = log.append(created("n-a", "again")).await.unwrap_err();
    assert_eq!(duplicate.code(), ErrorCode::DuplicateRevision);

    let gap = log.append(content("n-a", 3, "skipped 2")).await.unwrap_err();
    assert_eq!(gap.code(), ErrorCode::InvalidEvent);

    let reused_id = log
        .append(content("n-a", 2, "x").with_event_id(stored.event_id))
        .await
        .unwrap_err();
    assert_eq!(reused_id.code(), ErrorCode::DuplicateEventId);

    assert_eq!(ids(log, None).await, vec![1]);
}

async fn check_remove(log: &dyn EventLog) {
    let first = log.append(created("n-a", "A")).await.unwrap();
    let second = log.append(content("n-a", 2, "one")).await.unwrap();

    let not_latest = log.remove(&first).await.unwrap_err();
    assert_eq!(not_latest.code(), ErrorCode::InvalidEvent);

    log.remove(&second).await.unwrap();
    assert_eq!(log.latest_revision("n-a").await.unwrap(), 1);
    assert_eq!(log.remove(&second).await.unwrap_err().code(), ErrorCode::NotFound);

    // The revision is free again, the id is not.
    let replacement = log.append(content("n-a", 2, "two")).await.unwrap();
    assert_eq!(replacement.revision, 2);
    assert_eq!(replacement.event_id, 3);
}

async fn check_live_updates(log: Arc<dyn EventLog>) {
    log.append(created("n-a", "A")).await.unwrap();

    let mut stream = log.get_events_with_updates(None);
    let writer = Arc::clone(&log);
    tokio::spawn(async move {
        writer.append(content("n-a", 2, "live")).await.unwrap();
    });

    let mut seen = Vec::new();
    while seen.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for events")
            .unwrap()
            .unwrap();
        seen.push(event.event_id);
    }
    assert_eq!(seen, vec![1, 2]);
}

// ============================================================================
// In-memory backend
// ============================================================================

#[tokio::test]
async fn test_memory_append_and_query() {
    check_append_and_query(&InMemoryEventLog::default()).await;
}

#[tokio::test]
async fn test_memory_append_rejections() {
    check_append_rejections(&InMemoryEventLog::default()).await;
}

#[tokio::test]
async fn test_memory_remove() {
    check_remove(&InMemoryEventLog::default()).await;
}

#[tokio::test]
async fn test_memory_live_updates() {
    check_live_updates(Arc::new(InMemoryEventLog::default())).await;
}

// ============================================================================
// File backend
// ============================================================================

#[tokio::test]
async fn test_file_append_and_query() {
    let dir = tempfile::tempdir().unwrap();
    check_append_and_query(&FileEventLog::open(dir.path()).await.unwrap()).await;
}

#[tokio::test]
async fn test_file_append_rejections() {
    let dir = tempfile::tempdir().unwrap();
    check_append_rejections(&FileEventLog::open(dir.path()).await.unwrap()).await;
}

#[tokio::test]
async fn test_file_remove() {
    let dir = tempfile::tempdir().unwrap();
    check_remove(&FileEventLog::open(dir.path()).await.unwrap()).await;
}

#[tokio::test]
async fn test_file_live_updates() {
    let dir = tempfile::tempdir().unwrap();
    check_live_updates(Arc::new(FileEventLog::open(dir.path()).await.unwrap())).await;
}

#[tokio::test]
async fn test_file_log_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let log = FileEventLog::open(dir.path()).await.unwrap();
        log.append(created("n-a", "A")).await.unwrap();
        log.append(created("n-b", "B")).await.unwrap();
        let removed = log.append(content("n-b", 2, "gone")).await.unwrap();
        log.remove(&removed).await.unwrap();
    }

    let log = FileEventLog::open(dir.path()).await.unwrap();
    assert_eq!(ids(&log, None).await, vec![1, 2]);
    assert_eq!(log.latest_revision("n-b").await.unwrap(), 1);

    let next = log.append(content("n-b", 2, "again")).await.unwrap();
    assert_eq!(next.event_id, 4);
}

#[tokio::test]
async fn test_file_stream_skips_replaced_revision() {
    let dir = tempfile::tempdir().unwrap();
    let log = FileEventLog::open(dir.path()).await.unwrap();
    log.append(created("n-a", "A")).await.unwrap();
    let a2 = log.append(content("n-a", 2, "old")).await.unwrap();
    log.append(created("n-b", "B")).await.unwrap();

    let stream = log.get_events(None);
    log.remove(&a2).await.unwrap();
    log.append(content("n-a", 2, "new")).await.unwrap();

    let seen: Vec<EventId> = stream.map(|event| event.unwrap().event_id).collect().await;
    assert_eq!(seen, vec![1, 3]);
    assert_eq!(ids(&log, None).await, vec![1, 3, 4]);
}

#[tokio::test]
async fn test_file_id_mark_is_replaced_whole() {
    let dir = tempfile::tempdir().unwrap();
    let log = FileEventLog::open(dir.path()).await.unwrap();
    log.append(created("n-a", "A")).await.unwrap();
    let removed = log.append(content("n-a", 2, "gone")).await.unwrap();
    log.remove(&removed).await.unwrap();

    let mark = std::fs::read_to_string(dir.path().join("last-event-id")).unwrap();
    assert_eq!(mark, "2");
    assert!(!dir.path().join("last-event-id.tmp").exists());

    // A leftover temporary file from an interrupted write is ignored.
    std::fs::write(dir.path().join("last-event-id.tmp"), "9").unwrap();
    let reopened = FileEventLog::open(dir.path()).await.unwrap();
    let next = reopened.append(content("n-a", 2, "again")).await.unwrap();
    assert_eq!(next.event_id, 3);
}

#[tokio::test]
async fn test_file_log_rejects_unsafe_ids() {
    let dir = tempfile::tempdir().unwrap();
    let log = FileEventLog::open(dir.path()).await.unwrap();

    let error = log.append(created("../escape", "X")).await.unwrap_err();
    assert_eq!(error.code(), ErrorCode::InvalidEvent);
}
