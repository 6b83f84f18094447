#![allow(clippy::result_large_err)]
//! # wmsnotes core
//!
//! Event-sourced storage for notes and folders, with synchronization between
//! two replicas.
//!
//! ## Architecture
//!
//! - **Events**: immutable, revisioned changes to `Note` and `Folder` aggregates
//! - **Event Log**: append-only store with replay, per-aggregate queries and live updates
//! - **Repository**: aggregate state by folding events, with optional snapshot caches
//! - **Commands**: validated against the current state under per-aggregate locks
//! - **Policy**: derives note titles from content changes
//! - **Sync**: reconciles a local and a remote replica, merging divergent histories
//! - **Telemetry**: structured logging and Prometheus metrics

pub mod command;
pub mod config;
pub mod error;
pub mod event_log;
pub mod events;
pub mod policy;
pub mod replica;
pub mod repository;
pub mod sync;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, NotesError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::command::{
        Command, CommandBus, CommandError, CommandExecutor, CommandOrigin, CommandProcessor,
        CommandRequest, CommandResult, ExecutionResult, FolderCommand, NoteCommand,
    };
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, ErrorContext, NotesError, Result};
    pub use crate::event_log::{EventLog, FileEventLog, InMemoryEventLog};
    pub use crate::events::{
        fold, Aggregate, AggregateType, Event, EventId, EventPayload, Folder, Note, Path, Revision,
    };
    pub use crate::policy::NoteTitlePolicy;
    pub use crate::replica::Replica;
    pub use crate::repository::{AggregateCache, AggregateRepository};
    pub use crate::sync::{
        ConflictPolicy, SyncReport, SynchronizationTask, Synchronizer, SynchronizerState, TailPolicy,
    };
}
