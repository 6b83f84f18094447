//! Append-only event logs.
//!
//! An [`EventLog`] stores the events of every aggregate under a global,
//! strictly increasing id and a per-aggregate revision. Two backends share one
//! contract:
//!
//! - [`InMemoryEventLog`]: volatile, used by tests and as a scratch replica
//! - [`FileEventLog`]: one JSON file per event under `<root>/<agg_id>/`
//!
//! # Concurrency
//!
//! `append` and `remove` are serialized per log instance. Reads work on a
//! snapshot of the index taken when the call is made and never block appenders.
//! Live updates are delivered through a bounded broadcast channel: every
//! subscriber has its own cursor, and a subscriber that falls behind by more
//! than the channel capacity skips the missed events (a warning is logged)
//! instead of slowing down `append`.
//!
//! # History/live boundary
//!
//! Draining [`EventLog::get_events`] and then calling
//! [`EventLog::get_event_updates`] can miss an event appended between the two
//! calls. [`EventLog::get_events_with_updates`] closes that gap by subscribing
//! before reading history and dropping live events already seen in history.

mod file;
mod index;
mod memory;

pub use file::FileEventLog;
pub use memory::InMemoryEventLog;

pub(crate) use file::validate_agg_id;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use crate::error::Result;
use crate::events::{Event, EventId, Revision};

/// Finite, restartable sequence of stored events in ascending id order.
pub type EventStream = BoxStream<'static, Result<Event>>;

/// Infinite stream of events appended after subscription.
pub type LiveEvents = BoxStream<'static, Event>;

/// Default capacity of the live update channel.
pub const DEFAULT_UPDATE_BUFFER: usize = 1024;

/// Append-only, globally ordered event storage.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Short label used in logs ("local", "remote", a directory).
    fn name(&self) -> &str;

    /// Store an event that has no id yet and publish it to live subscribers.
    ///
    /// Fails with `DuplicateRevision` if the aggregate already has an event at
    /// that revision and with `DuplicateEventId` if the event carries an id that
    /// was already assigned. Returns the event with its new id.
    async fn append(&self, event: Event) -> Result<Event>;

    /// All stored events with an id above `after_event_id`, ascending.
    fn get_events(&self, after_event_id: Option<EventId>) -> EventStream;

    /// Events appended from now on. Dropping the stream unsubscribes.
    fn get_event_updates(&self) -> LiveEvents;

    /// Events of one aggregate with a revision above `after_revision`, ascending.
    async fn get_events_of_aggregate(
        &self,
        agg_id: &str,
        after_revision: Option<Revision>,
    ) -> Result<Vec<Event>>;

    /// Revision of the newest event of an aggregate, `0` if it has none.
    async fn latest_revision(&self, agg_id: &str) -> Result<Revision>;

    /// Every aggregate id with at least one stored event.
    async fn get_aggregate_ids(&self) -> Result<BTreeSet<String>>;

    /// Remove a stored event. Only the newest event of an aggregate can be
    /// removed; fails with `NotFound` if the event is not stored.
    async fn remove(&self, event: &Event) -> Result<()>;

    /// History after `after_event_id` followed by live updates, without gaps
    /// or duplicates.
    fn get_events_with_updates(&self, after_event_id: Option<EventId>) -> EventStream {
        let live = self.get_event_updates();
        let history = self.get_events(after_event_id);
        replay_then_tail(history, live, after_event_id)
    }
}

/// Chain a history stream with a live stream subscribed before the history was read.
pub fn replay_then_tail(
    history: EventStream,
    live: LiveEvents,
    after_event_id: Option<EventId>,
) -> EventStream {
    let last_seen = Arc::new(AtomicU64::new(after_event_id.unwrap_or(0)));
    let seen_in_history = Arc::clone(&last_seen);

    let history = history.inspect(move |event| {
        if let Ok(event) = event {
            seen_in_history.fetch_max(event.event_id, Ordering::SeqCst);
        }
    });
    let live = live
        .filter(move |event| futures::future::ready(event.event_id > last_seen.load(Ordering::SeqCst)))
        .map(Ok);

    history.chain(live).boxed()
}

/// Turn a broadcast receiver into a live stream that skips over lag.
pub(crate) fn live_stream(receiver: broadcast::Receiver<Event>, log_name: String) -> LiveEvents {
    BroadcastStream::new(receiver)
        .filter_map(move |item| {
            let item = match item {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(log = %log_name, skipped, "Live event subscriber lagged behind");
                    None
                }
            };
            futures::future::ready(item)
        })
        .boxed()
}
