//! Command, request and result types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorCode, NotesError};
use crate::events::event::base64_bytes;
use crate::events::{AggregateType, Event, EventPayload, Folder, Path, Revision};

// =============================================================================
// Commands
// =============================================================================

/// An intention to change a note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum NoteCommand {
    Create {
        agg_id: String,
        path: Path,
        title: String,
        content: String,
    },
    Delete,
    Undelete,
    AddAttachment {
        name: String,
        #[serde(with = "base64_bytes")]
        content: Vec<u8>,
    },
    DeleteAttachment {
        name: String,
    },
    ChangeContent {
        content: String,
    },
    ChangeTitle {
        title: String,
    },
    Move {
        path: Path,
    },
}

/// An intention to change a folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum FolderCommand {
    Create { path: Path },
    Delete { path: Path },
}

/// Any command the processor accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Note(NoteCommand),
    Folder(FolderCommand),
}

impl Command {
    pub fn family(&self) -> AggregateType {
        match self {
            Command::Note(_) => AggregateType::Note,
            Command::Folder(_) => AggregateType::Folder,
        }
    }

    /// The identity a command names itself, if it carries one.
    pub fn agg_id(&self) -> Option<String> {
        match self {
            Command::Note(NoteCommand::Create { agg_id, .. }) => Some(agg_id.clone()),
            Command::Note(_) => None,
            Command::Folder(FolderCommand::Create { path } | FolderCommand::Delete { path }) => {
                Some(Folder::agg_id_for(path))
            }
        }
    }

    /// Short name for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Note(command) => match command {
                NoteCommand::Create { .. } => "CreateNote",
                NoteCommand::Delete => "DeleteNote",
                NoteCommand::Undelete => "UndeleteNote",
                NoteCommand::AddAttachment { .. } => "AddAttachment",
                NoteCommand::DeleteAttachment { .. } => "DeleteAttachment",
                NoteCommand::ChangeContent { .. } => "ChangeContent",
                NoteCommand::ChangeTitle { .. } => "ChangeTitle",
                NoteCommand::Move { .. } => "MoveNote",
            },
            Command::Folder(FolderCommand::Create { .. }) => "CreateFolder",
            Command::Folder(FolderCommand::Delete { .. }) => "DeleteFolder",
        }
    }

    /// The payload of the event this command would produce.
    pub fn to_payload(&self) -> EventPayload {
        match self.clone() {
            Command::Note(command) => match command {
                NoteCommand::Create {
                    path,
                    title,
                    content,
                    ..
                } => EventPayload::NoteCreated {
                    path,
                    title,
                    content,
                },
                NoteCommand::Delete => EventPayload::NoteDeleted,
                NoteCommand::Undelete => EventPayload::NoteUndeleted,
                NoteCommand::AddAttachment { name, content } => {
                    EventPayload::AttachmentAdded { name, content }
                }
                NoteCommand::DeleteAttachment { name } => EventPayload::AttachmentDeleted { name },
                NoteCommand::ChangeContent { content } => EventPayload::ContentChanged { content },
                NoteCommand::ChangeTitle { title } => EventPayload::TitleChanged { title },
                NoteCommand::Move { path } => EventPayload::Moved { path },
            },
            Command::Folder(FolderCommand::Create { path }) => EventPayload::FolderCreated { path },
            Command::Folder(FolderCommand::Delete { path }) => EventPayload::FolderDeleted { path },
        }
    }

    /// The command that reproduces a stored event on another replica.
    pub fn from_event(event: &Event) -> Self {
        match event.payload.clone() {
            EventPayload::NoteCreated {
                path,
                title,
                content,
            } => Command::Note(NoteCommand::Create {
                agg_id: event.agg_id.clone(),
                path,
                title,
                content,
            }),
            EventPayload::NoteDeleted => Command::Note(NoteCommand::Delete),
            EventPayload::NoteUndeleted => Command::Note(NoteCommand::Undelete),
            EventPayload::AttachmentAdded { name, content } => {
                Command::Note(NoteCommand::AddAttachment { name, content })
            }
            EventPayload::AttachmentDeleted { name } => {
                Command::Note(NoteCommand::DeleteAttachment { name })
            }
            EventPayload::ContentChanged { content } => {
                Command::Note(NoteCommand::ChangeContent { content })
            }
            EventPayload::TitleChanged { title } => Command::Note(NoteCommand::ChangeTitle { title }),
            EventPayload::Moved { path } => Command::Note(NoteCommand::Move { path }),
            EventPayload::FolderCreated { path } => Command::Folder(FolderCommand::Create { path }),
            EventPayload::FolderDeleted { path } => Command::Folder(FolderCommand::Delete { path }),
        }
    }
}

impl From<NoteCommand> for Command {
    fn from(command: NoteCommand) -> Self {
        Command::Note(command)
    }
}

impl From<FolderCommand> for Command {
    fn from(command: FolderCommand) -> Self {
        Command::Folder(command)
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Who issued a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandOrigin {
    /// A user or a local policy
    Local,
    /// The synchronizer replaying changes from another replica
    Remote,
}

/// An ordered batch of commands for one aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub request_id: Uuid,
    pub agg_id: String,
    pub commands: Vec<Command>,
    /// Revision the issuer based its decision on; `None` means "whatever is current"
    pub last_revision: Option<Revision>,
    pub origin: CommandOrigin,
}

impl CommandRequest {
    pub fn new(agg_id: impl Into<String>, commands: Vec<Command>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            agg_id: agg_id.into(),
            commands,
            last_revision: None,
            origin: CommandOrigin::Local,
        }
    }

    pub fn single(agg_id: impl Into<String>, command: impl Into<Command>) -> Self {
        Self::new(agg_id, vec![command.into()])
    }

    pub fn with_last_revision(mut self, revision: Revision) -> Self {
        self.last_revision = Some(revision);
        self
    }

    pub fn with_origin(mut self, origin: CommandOrigin) -> Self {
        self.origin = origin;
        self
    }
}

// =============================================================================
// Results
// =============================================================================

/// Why a command was not executed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("revision conflict on {agg_id}: expected {expected}, aggregate is at {actual}")]
    RevisionConflict {
        agg_id: String,
        expected: Revision,
        actual: Revision,
    },

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("[{code}] {message}")]
    Other { code: ErrorCode, message: String },
}

impl CommandError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CommandError::RevisionConflict { .. } => ErrorCode::RevisionConflict,
            CommandError::InvalidCommand(_) => ErrorCode::InvalidCommand,
            CommandError::Storage(_) => ErrorCode::StorageError,
            CommandError::Other { code, .. } => *code,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

impl From<NotesError> for CommandError {
    fn from(error: NotesError) -> Self {
        match error.code() {
            ErrorCode::InvalidCommand => CommandError::InvalidCommand(error.message().to_string()),
            ErrorCode::StorageError => CommandError::Storage(error.message().to_string()),
            code => CommandError::Other {
                code,
                message: error.message().to_string(),
            },
        }
    }
}

impl From<CommandError> for NotesError {
    fn from(error: CommandError) -> Self {
        match error {
            CommandError::RevisionConflict {
                agg_id,
                expected,
                actual,
            } => NotesError::revision_conflict(&agg_id, expected, actual),
            other => NotesError::new(other.code(), other.to_string()),
        }
    }
}

/// Outcome of a single command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// Executed; `None` when the command did not change anything
    Success(Option<Event>),
    Failure(CommandError),
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success(_))
    }

    pub fn event(&self) -> Option<&Event> {
        match self {
            ExecutionResult::Success(event) => event.as_ref(),
            ExecutionResult::Failure(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub command: Command,
    pub result: ExecutionResult,
}

/// Outcomes of a request, one per command that was attempted.
///
/// Execution stops at the first failure, so `outcomes` can be shorter than the
/// request's command list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub request_id: Uuid,
    pub agg_id: String,
    pub origin: CommandOrigin,
    pub outcomes: Vec<CommandOutcome>,
}

impl CommandResult {
    pub(crate) fn for_request(request: &CommandRequest, outcomes: Vec<CommandOutcome>) -> Self {
        Self {
            request_id: request.request_id,
            agg_id: request.agg_id.clone(),
            origin: request.origin,
            outcomes,
        }
    }

    /// A result that fails the request's first command without running anything.
    pub fn rejected(request: &CommandRequest, error: CommandError) -> Self {
        let outcomes = request
            .commands
            .first()
            .map(|command| CommandOutcome {
                command: command.clone(),
                result: ExecutionResult::Failure(error),
            })
            .into_iter()
            .collect();
        Self::for_request(request, outcomes)
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.result.is_success())
    }

    /// Stored events, in execution order.
    pub fn events(&self) -> Vec<&Event> {
        self.outcomes
            .iter()
            .filter_map(|outcome| outcome.result.event())
            .collect()
    }

    pub fn first_failure(&self) -> Option<&CommandError> {
        self.outcomes.iter().find_map(|outcome| match &outcome.result {
            ExecutionResult::Failure(error) => Some(error),
            ExecutionResult::Success(_) => None,
        })
    }

    /// Revision of the last event this request stored.
    pub fn last_revision(&self) -> Option<Revision> {
        self.events().last().map(|event| event.revision)
    }
}
