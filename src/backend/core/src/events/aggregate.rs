//! Aggregate trait for event-sourced state reconstruction.
//!
//! Aggregates are immutable values rebuilt from the ordered events of one
//! identity. `apply` validates the revision and identity of each event before
//! folding it, so a reconstructed state is always explained by a well-formed
//! event sequence.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

use super::event::{AggregateType, Event, Revision};
use crate::command::Command;
use crate::error::{NotesError, Result};

// =============================================================================
// Apply Errors
// =============================================================================

/// Why an aggregate refused an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    /// The event's revision is not `current + 1`
    #[error("{event} must have revision {expected}, got {actual}")]
    UnexpectedRevision {
        event: String,
        expected: Revision,
        actual: Revision,
    },

    /// The event targets a different identity
    #[error("{event} must target {expected}, got {actual}")]
    UnexpectedAggregate {
        event: String,
        expected: String,
        actual: String,
    },

    /// The payload is not valid in the aggregate's current state
    #[error("{event} is not allowed: {reason}")]
    IllegalState { event: String, reason: String },

    /// The payload itself is malformed
    #[error("{event} is invalid: {reason}")]
    InvalidEvent { event: String, reason: String },
}

impl ApplyError {
    pub(crate) fn illegal_state(event: &Event, reason: impl Into<String>) -> Self {
        Self::IllegalState {
            event: event.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_event(event: &Event, reason: impl Into<String>) -> Self {
        Self::InvalidEvent {
            event: event.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result of applying one event: the new state and the event if it changed anything.
pub type Applied<A> = std::result::Result<(A, Option<Event>), ApplyError>;

// =============================================================================
// Aggregate Trait
// =============================================================================

/// A replayable state machine over the events of one identity.
pub trait Aggregate:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// The event family this aggregate consumes.
    const AGGREGATE_TYPE: AggregateType;

    /// The state before the first event (revision 0).
    fn empty(agg_id: &str) -> Self;

    fn agg_id(&self) -> &str;

    fn revision(&self) -> Revision;

    /// Whether the aggregate has been created and not deleted.
    fn exists(&self) -> bool;

    /// Fold one event.
    ///
    /// Returns `(self, None)` when the event would not change anything; the
    /// revision does not advance in that case.
    fn apply(&self, event: &Event) -> Applied<Self>;

    /// Compare content fields only.
    fn equals_ignoring_revision(&self, other: &Self) -> bool;

    /// Commands that turn `self` into a state equal (ignoring revision) to `target`.
    fn commands_towards(&self, target: &Self) -> Vec<Command>;
}

/// Check the revision and identity invariants shared by every aggregate.
///
/// At revision 0 only a creation event with revision 1 is accepted and it
/// assigns the identity; afterwards the event must be `revision + 1` for the
/// same identity.
pub(crate) fn check_sequence(
    agg_id: &str,
    revision: Revision,
    event: &Event,
) -> std::result::Result<(), ApplyError> {
    if event.revision != revision + 1 {
        return Err(ApplyError::UnexpectedRevision {
            event: event.to_string(),
            expected: revision + 1,
            actual: event.revision,
        });
    }
    if revision == 0 {
        if !event.payload.is_creation() {
            return Err(ApplyError::illegal_state(
                event,
                "only a creation event can be the first event",
            ));
        }
    } else if event.agg_id != agg_id {
        return Err(ApplyError::UnexpectedAggregate {
            event: event.to_string(),
            expected: agg_id.to_string(),
            actual: event.agg_id.clone(),
        });
    }
    Ok(())
}

/// Replay stored events on top of `base`.
///
/// Every stored event must advance the state; a rejected or ineffective event
/// fails the whole reconstruction.
pub fn fold<'a, A, I>(base: A, events: I) -> Result<A>
where
    A: Aggregate,
    I: IntoIterator<Item = &'a Event>,
{
    let mut state = base;
    for event in events {
        let (next, applied) = state.apply(event).map_err(|e| {
            NotesError::replay_failed(&event.agg_id, event.event_id, event.revision, e.to_string())
        })?;
        if applied.is_none() {
            return Err(NotesError::replay_failed(
                &event.agg_id,
                event.event_id,
                event.revision,
                format!("event had no effect on revision {}", state.revision()),
            ));
        }
        state = next;
    }
    Ok(state)
}
