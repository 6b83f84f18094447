//! Synchronization between two replicas of the event log.
//!
//! - [`difference`]: field-level differences and compensating commands
//! - [`merge`]: pure merge strategies over aggregate states
//! - [`strategy`]: per-family reconciliation of divergent histories
//! - [`synchronizer`]: the pass over all aggregates
//! - [`task`]: running passes periodically

pub mod difference;
pub mod merge;
pub mod state;
pub mod strategy;
pub mod synchronizer;
pub mod task;

pub use difference::{compensate_folder, compensate_note, Existence, FolderDifference, NoteDifference};
pub use merge::{
    ConflictPolicy, EqualsMergeStrategy, KeepBothMergeStrategy, MergeOutcome, MergeStrategy,
    MultipleMergeStrategy, ThreeWayMergeStrategy, DEFAULT_CONFLICT_TITLE_SUFFIX,
};
pub use state::{SyncBase, SynchronizerState, UnresolvedMarker};
pub use strategy::{
    folder_strategy, note_strategy, AggregateCopy, MergingSynchronizationStrategy, ReconcileInput, Resolution,
    SynchronizationStrategy,
};
pub use synchronizer::{AggregateSync, SyncReport, Synchronizer, TailPolicy, DEFAULT_MAX_CONCURRENCY};
pub use task::{SynchronizationTask, DEFAULT_SYNC_INTERVAL};
