//! Command processing.
//!
//! For each command the processor loads the aggregate, checks the revision the
//! issuer expected, lets the aggregate validate the candidate event and appends
//! it. Requests for the same aggregate are serialized through a striped set of
//! locks; requests for different aggregates proceed in parallel.

use async_trait::async_trait;
use metrics::counter;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::instrument;

use super::model::{
    Command, CommandError, CommandOutcome, CommandRequest, CommandResult, ExecutionResult,
};
use super::CommandExecutor;
use crate::error::Result;
use crate::event_log::EventLog;
use crate::events::{Aggregate, AggregateType, Event, Folder, Note, Revision, FOLDER_ID_PREFIX};
use crate::repository::AggregateRepository;

/// Default number of aggregate lock stripes.
pub const DEFAULT_LOCK_STRIPES: usize = 64;

/// Executes commands against one event log.
pub struct CommandProcessor {
    log: Arc<dyn EventLog>,
    notes: AggregateRepository<Note>,
    folders: AggregateRepository<Folder>,
    locks: Vec<Mutex<()>>,
}

impl CommandProcessor {
    pub fn new(
        log: Arc<dyn EventLog>,
        notes: AggregateRepository<Note>,
        folders: AggregateRepository<Folder>,
        lock_stripes: usize,
    ) -> Self {
        let locks = (0..lock_stripes.max(1)).map(|_| Mutex::new(())).collect();
        Self {
            log,
            notes,
            folders,
            locks,
        }
    }

    /// Processor without snapshot caches.
    pub fn uncached(log: Arc<dyn EventLog>) -> Self {
        Self::new(
            Arc::clone(&log),
            AggregateRepository::uncached(Arc::clone(&log)),
            AggregateRepository::uncached(log),
            DEFAULT_LOCK_STRIPES,
        )
    }

    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    pub fn notes(&self) -> &AggregateRepository<Note> {
        &self.notes
    }

    pub fn folders(&self) -> &AggregateRepository<Folder> {
        &self.folders
    }

    fn lock_for(&self, agg_id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        agg_id.hash(&mut hasher);
        let stripe = (hasher.finish() % self.locks.len() as u64) as usize;
        &self.locks[stripe]
    }

    /// Execute a request; see [`CommandExecutor::execute`].
    #[instrument(
        skip(self, request),
        fields(log = self.log.name(), agg_id = %request.agg_id, request_id = %request.request_id)
    )]
    pub async fn process(&self, request: CommandRequest) -> CommandResult {
        let _guard = self.lock_for(&request.agg_id).lock().await;
        self.process_locked(&request).await
    }

    /// Replace everything above `keep_revision` with the outcome of `request`.
    ///
    /// Under the aggregate's lock the newer events are removed newest-first,
    /// snapshots above `keep_revision` are dropped and the request is executed.
    /// Nothing is removed unless the aggregate is still at `expected_latest`;
    /// otherwise the request is rejected with a revision conflict.
    #[instrument(skip(self, request), fields(log = self.log.name(), agg_id = %request.agg_id))]
    pub async fn rewrite_tail(
        &self,
        keep_revision: Revision,
        expected_latest: Revision,
        request: CommandRequest,
    ) -> Result<CommandResult> {
        let _guard = self.lock_for(&request.agg_id).lock().await;

        let actual = self.log.latest_revision(&request.agg_id).await?;
        if actual != expected_latest {
            tracing::debug!(expected_latest, actual, "Aggregate changed before its tail was rewritten");
            return Ok(CommandResult::rejected(
                &request,
                CommandError::RevisionConflict {
                    agg_id: request.agg_id.clone(),
                    expected: expected_latest,
                    actual,
                },
            ));
        }

        let tail = self
            .log
            .get_events_of_aggregate(&request.agg_id, Some(keep_revision))
            .await?;
        for event in tail.iter().rev() {
            self.log.remove(event).await?;
        }
        self.notes.invalidate_after(&request.agg_id, keep_revision).await?;
        self.folders.invalidate_after(&request.agg_id, keep_revision).await?;

        tracing::info!(removed = tail.len(), keep_revision, "Rewrote aggregate tail");
        Ok(self.process_locked(&request).await)
    }

    async fn process_locked(&self, request: &CommandRequest) -> CommandResult {
        let family = match request.commands.first() {
            Some(command) => command.family(),
            None => return CommandResult::for_request(request, Vec::new()),
        };

        let outcomes = match family {
            AggregateType::Note => self.run(&self.notes, request).await,
            AggregateType::Folder => self.run(&self.folders, request).await,
        };

        let result = CommandResult::for_request(request, outcomes);
        if let Some(error) = result.first_failure() {
            tracing::debug!(error = %error, "Request failed");
        }
        result
    }

    async fn run<A: Aggregate>(
        &self,
        repository: &AggregateRepository<A>,
        request: &CommandRequest,
    ) -> Vec<CommandOutcome> {
        let mut outcomes = Vec::with_capacity(request.commands.len());

        let mut state = match repository.get_latest(&request.agg_id).await {
            Ok(state) => state,
            Err(e) => {
                let result = CommandResult::rejected(request, e.into());
                return result.outcomes;
            }
        };

        let mut expected = request.last_revision;
        for command in &request.commands {
            let result = self.step(&mut state, &request.agg_id, command, expected).await;
            let outcome = match &result {
                ExecutionResult::Success(Some(_)) => "success",
                ExecutionResult::Success(None) => "noop",
                ExecutionResult::Failure(_) => "failure",
            };
            counter!("wmsnotes_commands_total", "command" => command.name(), "outcome" => outcome)
                .increment(1);

            let failed = !result.is_success();
            outcomes.push(CommandOutcome {
                command: command.clone(),
                result,
            });
            if failed {
                break;
            }
            expected = Some(state.revision());
        }
        outcomes
    }

    async fn step<A: Aggregate>(
        &self,
        state: &mut A,
        agg_id: &str,
        command: &Command,
        expected: Option<Revision>,
    ) -> ExecutionResult {
        if let Err(e) = check_target::<A>(agg_id, command) {
            return ExecutionResult::Failure(e);
        }

        if let Some(expected) = expected {
            if state.revision() != expected {
                return ExecutionResult::Failure(CommandError::RevisionConflict {
                    agg_id: agg_id.to_string(),
                    expected,
                    actual: state.revision(),
                });
            }
        }

        let candidate = Event::new(agg_id, state.revision() + 1, command.to_payload());
        let (next, event) = match state.apply(&candidate) {
            Ok(applied) => applied,
            Err(e) => return ExecutionResult::Failure(CommandError::InvalidCommand(e.to_string())),
        };
        let Some(event) = event else {
            return ExecutionResult::Success(None);
        };

        match self.log.append(event).await {
            Ok(stored) => {
                *state = next;
                ExecutionResult::Success(Some(stored))
            }
            Err(e) => ExecutionResult::Failure(e.into()),
        }
    }
}

/// Commands must match both the aggregate type and the identity of the request.
fn check_target<A: Aggregate>(agg_id: &str, command: &Command) -> std::result::Result<(), CommandError> {
    if command.family() != A::AGGREGATE_TYPE {
        return Err(CommandError::InvalidCommand(format!(
            "{} cannot be applied to a {}",
            command.name(),
            A::AGGREGATE_TYPE
        )));
    }
    let is_folder_id = agg_id.starts_with(FOLDER_ID_PREFIX);
    if is_folder_id != (A::AGGREGATE_TYPE == AggregateType::Folder) {
        return Err(CommandError::InvalidCommand(format!(
            "{} is not a {} id",
            agg_id,
            A::AGGREGATE_TYPE
        )));
    }
    if let Some(named) = command.agg_id() {
        if named != agg_id {
            return Err(CommandError::InvalidCommand(format!(
                "{} targets {} but the request is for {}",
                command.name(),
                named,
                agg_id
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl CommandExecutor for CommandProcessor {
    async fn execute(&self, request: CommandRequest) -> CommandResult {
        self.process(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{FolderCommand, NoteCommand};
    use crate::event_log::InMemoryEventLog;
    use crate::events::Path;

    fn processor() -> CommandProcessor {
        CommandProcessor::uncached(Arc::new(InMemoryEventLog::default()))
    }

    fn create(agg_id: &str) -> NoteCommand {
        NoteCommand::Create {
            agg_id: agg_id.to_string(),
            path: Path::parse("inbox"),
            title: "Title".to_string(),
            content: "Text".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_then_change() {
        let processor = processor();
        let id = Note::new_agg_id();

        let result = processor
            .process(CommandRequest::new(
                &id,
                vec![
                    create(&id).into(),
                    NoteCommand::ChangeContent {
                        content: "More".to_string(),
                    }
                    .into(),
                ],
            ))
            .await;

        assert!(result.is_success());
        assert_eq!(result.last_revision(), Some(2));
        assert_eq!(processor.notes().get_latest(&id).await.unwrap().content, "More");
    }

    #[tokio::test]
    async fn test_stale_revision_is_rejected() {
        let processor = processor();
        let id = Note::new_agg_id();
        processor.process(CommandRequest::single(&id, create(&id))).await;

        let result = processor
            .process(CommandRequest::single(&id, NoteCommand::Delete).with_last_revision(0))
            .await;

        assert_eq!(
            result.first_failure(),
            Some(&CommandError::RevisionConflict {
                agg_id: id.clone(),
                expected: 0,
                actual: 1,
            })
        );
        assert_eq!(processor.log().latest_revision(&id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_no_op_stores_nothing() {
        let processor = processor();
        let id = Note::new_agg_id();
        processor.process(CommandRequest::single(&id, create(&id))).await;

        let result = processor
            .process(CommandRequest::single(
                &id,
                NoteCommand::ChangeTitle {
                    title: "Title".to_string(),
                },
            ))
            .await;

        assert_eq!(result.outcomes[0].result, ExecutionResult::Success(None));
        assert_eq!(processor.log().latest_revision(&id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_family_mismatch_is_invalid() {
        let processor = processor();
        let path = Path::parse("projects");
        let folder_id = Folder::agg_id_for(&path);

        let result = processor
            .process(CommandRequest::single(&folder_id, NoteCommand::Delete))
            .await;
        assert!(matches!(
            result.first_failure(),
            Some(CommandError::InvalidCommand(_))
        ));

        let result = processor
            .process(CommandRequest::single(
                Note::new_agg_id(),
                FolderCommand::Create { path },
            ))
            .await;
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn test_rewrite_tail() {
        let processor = processor();
        let id = Note::new_agg_id();
        processor
            .process(CommandRequest::new(
                &id,
                vec![
                    create(&id).into(),
                    NoteCommand::ChangeContent {
                        content: "Local".to_string(),
                    }
                    .into(),
                ],
            ))
            .await;

        let stale = processor
            .rewrite_tail(1, 1, CommandRequest::single(&id, NoteCommand::Delete))
            .await
            .unwrap();
        assert!(matches!(
            stale.first_failure(),
            Some(CommandError::RevisionConflict { expected: 1, actual: 2, .. })
        ));
        assert_eq!(processor.log().latest_revision(&id).await.unwrap(), 2);

        let result = processor
            .rewrite_tail(
                1,
                2,
                CommandRequest::single(
                    &id,
                    NoteCommand::ChangeContent {
                        content: "Remote".to_string(),
                    },
                )
                .with_last_revision(1),
            )
            .await
            .unwrap();

        assert!(result.is_success());
        let note = processor.notes().get_latest(&id).await.unwrap();
        assert_eq!(note.revision, 2);
        assert_eq!(note.content, "Remote");
    }
}
