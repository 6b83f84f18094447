//! The note aggregate.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::aggregate::{check_sequence, Aggregate, Applied, ApplyError};
use super::event::{base64_map, AggregateType, Event, EventPayload, Path, Revision};
use crate::command::Command;
use crate::sync::difference;

/// Prefix of every note identity.
pub const NOTE_ID_PREFIX: &str = "n-";

/// Reconstructed state of a note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub agg_id: String,
    pub revision: Revision,
    pub exists: bool,
    pub path: Path,
    pub title: String,
    pub content: String,
    #[serde(with = "base64_map")]
    pub attachments: BTreeMap<String, Vec<u8>>,
    /// sha256 hex digest per attachment name
    pub attachment_hashes: BTreeMap<String, String>,
}

impl Note {
    /// Generate a fresh note identity.
    pub fn new_agg_id() -> String {
        format!("{}{}", NOTE_ID_PREFIX, uuid::Uuid::new_v4())
    }

    /// Whether `agg_id` has the `n-<uuid>` shape.
    pub fn is_valid_agg_id(agg_id: &str) -> bool {
        agg_id
            .strip_prefix(NOTE_ID_PREFIX)
            .map(|rest| uuid::Uuid::parse_str(rest).is_ok())
            .unwrap_or(false)
    }

    /// Replace characters that are unsafe in attachment file names.
    pub fn sanitize_attachment_name(name: &str) -> String {
        name.replace(['\\', '\t', ' ', '/', '&'], "_")
    }

    pub fn hash(content: &[u8]) -> String {
        hex::encode(Sha256::digest(content))
    }

    /// Created at some point, and currently deleted.
    pub fn is_deleted(&self) -> bool {
        !self.exists && self.revision > 0
    }

    fn advance(&self, event: &Event) -> Self {
        Self {
            revision: event.revision,
            ..self.clone()
        }
    }

    fn require_exists(&self, event: &Event) -> Result<(), ApplyError> {
        if self.exists {
            Ok(())
        } else {
            Err(ApplyError::illegal_state(event, "the note does not exist"))
        }
    }

    fn apply_created(&self, event: &Event, path: &Path, title: &str, content: &str) -> Applied<Self> {
        if self.revision > 0 {
            return Err(ApplyError::illegal_state(event, "the note has already been created"));
        }
        if !Self::is_valid_agg_id(&event.agg_id) {
            return Err(ApplyError::invalid_event(
                event,
                format!("{} is not a valid note id", event.agg_id),
            ));
        }
        let note = Self {
            agg_id: event.agg_id.clone(),
            revision: event.revision,
            exists: true,
            path: path.clone(),
            title: title.to_string(),
            content: content.to_string(),
            attachments: BTreeMap::new(),
            attachment_hashes: BTreeMap::new(),
        };
        Ok((note, Some(event.clone())))
    }

    fn apply_attachment_added(&self, event: &Event, name: &str, content: &[u8]) -> Applied<Self> {
        self.require_exists(event)?;
        if name.is_empty() {
            return Err(ApplyError::invalid_event(event, "an attachment name must not be empty"));
        }
        let name = Self::sanitize_attachment_name(name);
        match self.attachments.get(&name) {
            Some(existing) if existing.as_slice() == content => Ok((self.clone(), None)),
            Some(_) => Err(ApplyError::illegal_state(
                event,
                format!("an attachment named {} already exists with different data", name),
            )),
            None => {
                let mut note = self.advance(event);
                note.attachment_hashes.insert(name.clone(), Self::hash(content));
                note.attachments.insert(name, content.to_vec());
                Ok((note, Some(event.clone())))
            }
        }
    }

    fn apply_attachment_deleted(&self, event: &Event, name: &str) -> Applied<Self> {
        let name = Self::sanitize_attachment_name(name);
        if !self.attachments.contains_key(&name) {
            return Ok((self.clone(), None));
        }
        let mut note = self.advance(event);
        note.attachments.remove(&name);
        note.attachment_hashes.remove(&name);
        Ok((note, Some(event.clone())))
    }
}

impl Aggregate for Note {
    const AGGREGATE_TYPE: AggregateType = AggregateType::Note;

    fn empty(agg_id: &str) -> Self {
        Self {
            agg_id: agg_id.to_string(),
            revision: 0,
            exists: false,
            path: Path::default(),
            title: String::new(),
            content: String::new(),
            attachments: BTreeMap::new(),
            attachment_hashes: BTreeMap::new(),
        }
    }

    fn agg_id(&self) -> &str {
        &self.agg_id
    }

    fn revision(&self) -> Revision {
        self.revision
    }

    fn exists(&self) -> bool {
        self.exists
    }

    fn apply(&self, event: &Event) -> Applied<Self> {
        check_sequence(&self.agg_id, self.revision, event)?;

        match &event.payload {
            EventPayload::NoteCreated {
                path,
                title,
                content,
            } => self.apply_created(event, path, title, content),
            EventPayload::NoteDeleted => {
                if self.exists {
                    let mut note = self.advance(event);
                    note.exists = false;
                    Ok((note, Some(event.clone())))
                } else {
                    Ok((self.clone(), None))
                }
            }
            EventPayload::NoteUndeleted => {
                if self.exists {
                    Ok((self.clone(), None))
                } else {
                    let mut note = self.advance(event);
                    note.exists = true;
                    Ok((note, Some(event.clone())))
                }
            }
            EventPayload::AttachmentAdded { name, content } => {
                self.apply_attachment_added(event, name, content)
            }
            EventPayload::AttachmentDeleted { name } => self.apply_attachment_deleted(event, name),
            EventPayload::ContentChanged { content } => {
                self.require_exists(event)?;
                if &self.content == content {
                    return Ok((self.clone(), None));
                }
                let mut note = self.advance(event);
                note.content = content.clone();
                Ok((note, Some(event.clone())))
            }
            EventPayload::TitleChanged { title } => {
                self.require_exists(event)?;
                if &self.title == title {
                    return Ok((self.clone(), None));
                }
                let mut note = self.advance(event);
                note.title = title.clone();
                Ok((note, Some(event.clone())))
            }
            EventPayload::Moved { path } => {
                self.require_exists(event)?;
                if &self.path == path {
                    return Ok((self.clone(), None));
                }
                let mut note = self.advance(event);
                note.path = path.clone();
                Ok((note, Some(event.clone())))
            }
            EventPayload::FolderCreated { .. } | EventPayload::FolderDeleted { .. } => Err(
                ApplyError::invalid_event(event, "folder events cannot be applied to a note"),
            ),
        }
    }

    fn equals_ignoring_revision(&self, other: &Self) -> bool {
        self.agg_id == other.agg_id
            && self.exists == other.exists
            && self.path == other.path
            && self.title == other.title
            && self.content == other.content
            && self.attachment_hashes == other.attachment_hashes
    }

    fn commands_towards(&self, target: &Self) -> Vec<Command> {
        difference::compensate_note(self, target)
    }
}
