//! Note title policy tests.
//!
//! Tests cover:
//! - Title commands derived from stale content changes are rejected
//! - The running policy keeps titles in step with content
//! - Shutdown stops title derivation

use std::sync::Arc;
use std::time::Duration;

use wmsnotes_core::command::{
    CommandError, CommandExecutor, CommandProcessor, CommandRequest, NoteCommand,
};
use wmsnotes_core::event_log::{EventLog, InMemoryEventLog};
use wmsnotes_core::events::{Event, Note, Path};
use wmsnotes_core::policy::{derive_command, NoteTitlePolicy};

fn processor() -> Arc<CommandProcessor> {
    Arc::new(CommandProcessor::uncached(Arc::new(InMemoryEventLog::default())))
}

async fn create_note(processor: &CommandProcessor) -> String {
    let id = Note::new_agg_id();
    let result = processor
        .process(CommandRequest::single(
            &id,
            NoteCommand::Create {
                agg_id: id.clone(),
                path: Path::parse("inbox"),
                title: "Untitled".to_string(),
                content: String::new(),
            },
        ))
        .await;
    assert!(result.is_success());
    id
}

async fn change_content(processor: &CommandProcessor, id: &str, content: &str) -> Event {
    let result = processor
        .process(CommandRequest::single(
            id,
            NoteCommand::ChangeContent {
                content: content.to_string(),
            },
        ))
        .await;
    result.events()[0].clone()
}

async fn wait_for_title(processor: &CommandProcessor, id: &str, title: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if processor.notes().get_latest(id).await.unwrap().title == title {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("title never became {:?}", title));
}

#[tokio::test]
async fn test_stale_title_command_is_rejected() {
    let processor = processor();
    let id = create_note(&processor).await;
    change_content(&processor, &id, "draft").await;

    let third = change_content(&processor, &id, "# First").await;
    let fourth = change_content(&processor, &id, "# Second").await;
    assert_eq!((third.revision, fourth.revision), (3, 4));

    let stale = processor.execute(derive_command(&third).unwrap()).await;
    assert_eq!(
        stale.first_failure(),
        Some(&CommandError::RevisionConflict {
            agg_id: id.clone(),
            expected: 3,
            actual: 4,
        })
    );

    let current = processor.execute(derive_command(&fourth).unwrap()).await;
    assert!(current.is_success());

    let note = processor.notes().get_latest(&id).await.unwrap();
    assert_eq!(note.title, "Second");
    assert_eq!(note.revision, 5);
}

#[tokio::test]
async fn test_policy_derives_titles() {
    let processor = processor();
    let log: Arc<dyn EventLog> = Arc::clone(processor.log());
    let executor: Arc<dyn CommandExecutor> = Arc::clone(&processor) as Arc<dyn CommandExecutor>;
    let policy = NoteTitlePolicy::new(log, executor);
    policy.start();
    assert!(policy.is_running());

    let id = create_note(&processor).await;
    change_content(&processor, &id, "\n# Groceries\n- milk\n- eggs").await;
    wait_for_title(&processor, &id, "Groceries").await;

    change_content(&processor, &id, "Errands\n- post office").await;
    wait_for_title(&processor, &id, "Errands").await;

    policy.shutdown().await;
    assert!(!policy.is_running());
}

#[tokio::test]
async fn test_stopped_policy_derives_nothing() {
    let processor = processor();
    let log: Arc<dyn EventLog> = Arc::clone(processor.log());
    let policy = NoteTitlePolicy::new(log, Arc::clone(&processor) as Arc<dyn CommandExecutor>);
    policy.start();
    policy.shutdown().await;

    let id = create_note(&processor).await;
    change_content(&processor, &id, "# Ignored").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let note = processor.notes().get_latest(&id).await.unwrap();
    assert_eq!(note.title, "Untitled");
    assert_eq!(note.revision, 2);
}
