//! Volatile event log.

use async_trait::async_trait;
use futures::stream::StreamExt;
use metrics::counter;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::broadcast;
use tracing::instrument;

use super::index::LogIndex;
use super::{live_stream, EventLog, EventStream, LiveEvents, DEFAULT_UPDATE_BUFFER};
use crate::error::Result;
use crate::events::{Event, EventId, Revision};

#[derive(Default)]
struct State {
    index: LogIndex,
    events: BTreeMap<EventId, Event>,
}

/// Event log kept entirely in memory.
pub struct InMemoryEventLog {
    name: String,
    state: RwLock<State>,
    updates: broadcast::Sender<Event>,
}

impl InMemoryEventLog {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_update_buffer(name, DEFAULT_UPDATE_BUFFER)
    }

    pub fn with_update_buffer(name: impl Into<String>, update_buffer: usize) -> Self {
        let (updates, _) = broadcast::channel(update_buffer.max(1));
        Self {
            name: name.into(),
            state: RwLock::new(State::default()),
            updates,
        }
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.state.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, event), fields(log = %self.name, agg_id = %event.agg_id, revision = event.revision))]
    async fn append(&self, event: Event) -> Result<Event> {
        let mut state = self.state.write();
        let event_id = state.index.prepare_append(&event)?;
        let event = event.with_event_id(event_id);

        state.index.insert(&event);
        state.events.insert(event_id, event.clone());

        // Published under the lock so subscribers observe ids in order.
        let _ = self.updates.send(event.clone());
        drop(state);

        counter!("wmsnotes_events_appended_total", "log" => self.name.clone()).increment(1);
        tracing::debug!(event_id, event_type = event.event_type(), "Event appended");
        Ok(event)
    }

    fn get_events(&self, after_event_id: Option<EventId>) -> EventStream {
        let start = after_event_id.map(|id| id.saturating_add(1)).unwrap_or(0);
        let snapshot: Vec<Result<Event>> = self
            .state
            .read()
            .events
            .range(start..)
            .map(|(_, event)| Ok(event.clone()))
            .collect();
        futures::stream::iter(snapshot).boxed()
    }

    fn get_event_updates(&self) -> LiveEvents {
        live_stream(self.updates.subscribe(), self.name.clone())
    }

    async fn get_events_of_aggregate(
        &self,
        agg_id: &str,
        after_revision: Option<Revision>,
    ) -> Result<Vec<Event>> {
        let state = self.state.read();
        Ok(state
            .index
            .aggregate_event_ids(agg_id, after_revision)
            .into_iter()
            .filter_map(|id| state.events.get(&id).cloned())
            .collect())
    }

    async fn latest_revision(&self, agg_id: &str) -> Result<Revision> {
        Ok(self.state.read().index.latest_revision(agg_id))
    }

    async fn get_aggregate_ids(&self) -> Result<BTreeSet<String>> {
        Ok(self.state.read().index.aggregate_ids())
    }

    #[instrument(skip(self, event), fields(log = %self.name, event_id = event.event_id))]
    async fn remove(&self, event: &Event) -> Result<()> {
        let mut state = self.state.write();
        state.index.prepare_remove(event)?;
        state.index.remove(event);
        state.events.remove(&event.event_id);

        tracing::debug!(agg_id = %event.agg_id, revision = event.revision, "Event removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPayload;

    #[tokio::test]
    async fn test_append_assigns_ids() {
        let log = InMemoryEventLog::default();
        assert!(log.is_empty());

        let first = log.append(Event::new("a", 1, EventPayload::NoteDeleted)).await.unwrap();
        let second = log.append(Event::new("b", 1, EventPayload::NoteDeleted)).await.unwrap();

        assert_eq!(first.event_id, 1);
        assert_eq!(second.event_id, 2);
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_append() {
        let log = InMemoryEventLog::with_update_buffer("tiny", 2);
        let mut updates = log.get_event_updates();

        for revision in 1..=5 {
            log.append(Event::new("a", revision, EventPayload::NoteDeleted))
                .await
                .unwrap();
        }

        // The first three events were overwritten; the subscriber resumes with the rest.
        let next = updates.next().await.unwrap();
        assert_eq!(next.revision, 4);
    }
}
