//! Bookkeeping shared by the event log backends: id assignment, per-aggregate
//! revision tracking and the append/remove integrity checks.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{NotesError, Result};
use crate::events::{Event, EventId, Revision};

/// Where an event lives: `(agg_id, revision)`.
pub(crate) type Location = (String, Revision);

#[derive(Debug, Default)]
pub(crate) struct LogIndex {
    /// Highest id ever assigned; never decreases, so removed ids are not reused
    last_event_id: EventId,
    events: BTreeMap<EventId, Location>,
    aggregates: BTreeMap<String, BTreeMap<Revision, EventId>>,
}

impl LogIndex {
    pub fn last_event_id(&self) -> EventId {
        self.last_event_id
    }

    /// Never hand out ids up to `event_id`, even if no stored event has them.
    pub fn reserve_up_to(&mut self, event_id: EventId) {
        self.last_event_id = self.last_event_id.max(event_id);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn latest_revision(&self, agg_id: &str) -> Revision {
        self.aggregates
            .get(agg_id)
            .and_then(|revisions| revisions.keys().next_back().copied())
            .unwrap_or(0)
    }

    /// Check that `event` can be appended and return the id it will receive.
    pub fn prepare_append(&self, event: &Event) -> Result<EventId> {
        if event.event_id != 0 {
            if event.event_id <= self.last_event_id {
                return Err(NotesError::duplicate_event_id(event.event_id));
            }
            return Err(NotesError::invalid_event(format!(
                "{} already carries an id; ids are assigned on append",
                event
            )));
        }

        let contains = self
            .aggregates
            .get(&event.agg_id)
            .map(|revisions| revisions.contains_key(&event.revision))
            .unwrap_or(false);
        if contains {
            return Err(NotesError::duplicate_revision(&event.agg_id, event.revision));
        }

        let expected = self.latest_revision(&event.agg_id) + 1;
        if event.revision != expected {
            return Err(NotesError::invalid_event(format!(
                "{} must have revision {}",
                event, expected
            )));
        }

        Ok(self.last_event_id + 1)
    }

    pub fn insert(&mut self, event: &Event) {
        self.last_event_id = self.last_event_id.max(event.event_id);
        self.events
            .insert(event.event_id, (event.agg_id.clone(), event.revision));
        self.aggregates
            .entry(event.agg_id.clone())
            .or_default()
            .insert(event.revision, event.event_id);
    }

    /// Check that `event` is stored and is the newest event of its aggregate.
    pub fn prepare_remove(&self, event: &Event) -> Result<()> {
        match self.events.get(&event.event_id) {
            Some((agg_id, revision)) if *agg_id == event.agg_id && *revision == event.revision => {}
            _ => return Err(NotesError::not_found("event", event.to_string())),
        }
        let latest = self.latest_revision(&event.agg_id);
        if event.revision != latest {
            return Err(NotesError::invalid_event(format!(
                "only the latest event of {} (revision {}) can be removed, not {}",
                event.agg_id, latest, event
            )));
        }
        Ok(())
    }

    pub fn remove(&mut self, event: &Event) {
        self.events.remove(&event.event_id);
        if let Some(revisions) = self.aggregates.get_mut(&event.agg_id) {
            revisions.remove(&event.revision);
            if revisions.is_empty() {
                self.aggregates.remove(&event.agg_id);
            }
        }
    }

    /// Locations of all events with an id above `after`, in id order.
    pub fn locations_after(&self, after: Option<EventId>) -> Vec<(EventId, Location)> {
        let start = after.map(|id| id.saturating_add(1)).unwrap_or(0);
        self.events
            .range(start..)
            .map(|(id, location)| (*id, location.clone()))
            .collect()
    }

    /// Ids of the events of one aggregate above `after_revision`, in revision order.
    pub fn aggregate_event_ids(&self, agg_id: &str, after_revision: Option<Revision>) -> Vec<EventId> {
        let start = after_revision.map(|r| r.saturating_add(1)).unwrap_or(0);
        self.aggregates
            .get(agg_id)
            .map(|revisions| revisions.range(start..).map(|(_, id)| *id).collect())
            .unwrap_or_default()
    }

    pub fn aggregate_revisions(&self, agg_id: &str, after_revision: Option<Revision>) -> Vec<Revision> {
        let start = after_revision.map(|r| r.saturating_add(1)).unwrap_or(0);
        self.aggregates
            .get(agg_id)
            .map(|revisions| revisions.range(start..).map(|(r, _)| *r).collect())
            .unwrap_or_default()
    }

    pub fn aggregate_ids(&self) -> BTreeSet<String> {
        self.aggregates.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::events::EventPayload;

    fn stored(index: &mut LogIndex, agg_id: &str, revision: Revision) -> Event {
        let event = Event::new(agg_id, revision, EventPayload::NoteDeleted);
        let id = index.prepare_append(&event).unwrap();
        let event = event.with_event_id(id);
        index.insert(&event);
        event
    }

    #[test]
    fn test_append_checks() {
        let mut index = LogIndex::default();
        stored(&mut index, "a", 1);
        stored(&mut index, "a", 2);

        let duplicate = Event::new("a", 2, EventPayload::NoteDeleted);
        assert_eq!(
            index.prepare_append(&duplicate).unwrap_err().code(),
            ErrorCode::DuplicateRevision
        );

        let gap = Event::new("a", 4, EventPayload::NoteDeleted);
        assert_eq!(index.prepare_append(&gap).unwrap_err().code(), ErrorCode::InvalidEvent);

        let reused = Event::new("b", 1, EventPayload::NoteDeleted).with_event_id(1);
        assert_eq!(
            index.prepare_append(&reused).unwrap_err().code(),
            ErrorCode::DuplicateEventId
        );
    }

    #[test]
    fn test_remove_only_latest() {
        let mut index = LogIndex::default();
        let first = stored(&mut index, "a", 1);
        let second = stored(&mut index, "a", 2);

        assert_eq!(index.prepare_remove(&first).unwrap_err().code(), ErrorCode::InvalidEvent);
        index.prepare_remove(&second).unwrap();
        index.remove(&second);

        assert_eq!(index.latest_revision("a"), 1);
        assert_eq!(index.last_event_id(), 2);
        assert_eq!(index.prepare_remove(&second).unwrap_err().code(), ErrorCode::NotFound);

        // Ids are never reused after a removal.
        let next = Event::new("a", 2, EventPayload::NoteDeleted);
        assert_eq!(index.prepare_append(&next).unwrap(), 3);
    }

    #[test]
    fn test_locations_after() {
        let mut index = LogIndex::default();
        stored(&mut index, "a", 1);
        stored(&mut index, "b", 1);
        stored(&mut index, "a", 2);

        let ids: Vec<EventId> = index.locations_after(Some(1)).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(index.aggregate_revisions("a", Some(1)), vec![2]);
        assert_eq!(index.aggregate_ids().len(), 2);
    }
}
