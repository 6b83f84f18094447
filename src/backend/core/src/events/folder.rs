//! The folder aggregate.
//!
//! A folder's identity is derived from its path, so two replicas that create
//! the same folder independently end up with the same aggregate id.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::aggregate::{check_sequence, Aggregate, Applied, ApplyError};
use super::event::{AggregateType, Event, EventPayload, Path, Revision};
use crate::command::Command;
use crate::sync::difference;

/// Prefix of every folder identity.
pub const FOLDER_ID_PREFIX: &str = "f-";

/// Reconstructed state of a folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub agg_id: String,
    pub revision: Revision,
    pub exists: bool,
    pub path: Path,
}

impl Folder {
    /// The identity of the folder at `path`.
    pub fn agg_id_for(path: &Path) -> String {
        let digest = Sha256::digest(path.to_string().as_bytes());
        format!("{}{}", FOLDER_ID_PREFIX, hex::encode(digest))
    }

    /// Display name of the folder.
    pub fn title(&self) -> &str {
        self.path.title()
    }
}

impl Aggregate for Folder {
    const AGGREGATE_TYPE: AggregateType = AggregateType::Folder;

    fn empty(agg_id: &str) -> Self {
        Self {
            agg_id: agg_id.to_string(),
            revision: 0,
            exists: false,
            path: Path::default(),
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
            EventPayload::FolderCreated { path } => {
                if event.agg_id != Self::agg_id_for(path) {
                    return Err(ApplyError::invalid_event(
                        event,
                        format!("{} is not the id of folder {}", event.agg_id, path),
                    ));
                }
                if self.exists {
                    return Ok((self.clone(), None));
                }
                let folder = Self {
                    agg_id: event.agg_id.clone(),
                    revision: event.revision,
                    exists: true,
                    path: path.clone(),
                };
                Ok((folder, Some(event.clone())))
            }
            EventPayload::FolderDeleted { .. } => {
                if !self.exists {
                    return Ok((self.clone(), None));
                }
                let folder = Self {
                    revision: event.revision,
                    exists: false,
                    ..self.clone()
                };
                Ok((folder, Some(event.clone())))
            }
            EventPayload::NoteCreated { .. }
            | EventPayload::NoteDeleted
            | EventPayload::NoteUndeleted
            | EventPayload::AttachmentAdded { .. }
            | EventPayload::AttachmentDeleted { .. }
            | EventPayload::ContentChanged { .. }
            | EventPayload::TitleChanged { .. }
            | EventPayload::Moved { .. } => Err(ApplyError::invalid_event(
                event,
                "note events cannot be applied to a folder",
            )),
        }
    }

    fn equals_ignoring_revision(&self, other: &Self) -> bool {
        self.agg_id == other.agg_id && self.exists == other.exists && self.path == other.path
    }

    fn commands_towards(&self, target: &Self) -> Vec<Command> {
        difference::compensate_folder(self, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::aggregate::fold;

    #[test]
    fn test_agg_id_is_derived_from_path() {
        let a = Folder::agg_id_for(&Path::parse("projects/rust"));
        let b = Folder::agg_id_for(&Path::parse("projects/rust"));
        let c = Folder::agg_id_for(&Path::parse("projects/go"));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with(FOLDER_ID_PREFIX));
        assert_eq!(a.len(), FOLDER_ID_PREFIX.len() + 64);
    }

    #[test]
    fn test_folder_lifecycle() {
        let path = Path::parse("projects/rust");
        let id = Folder::agg_id_for(&path);

        let folder = fold(
            Folder::empty(&id),
            &[
                Event::new(&id, 1, EventPayload::FolderCreated { path: path.clone() }),
                Event::new(&id, 2, EventPayload::FolderDeleted { path: path.clone() }),
                Event::new(&id, 3, EventPayload::FolderCreated { path: path.clone() }),
            ],
        )
        .unwrap();

        assert!(folder.exists);
        assert_eq!(folder.revision, 3);
        assert_eq!(folder.title(), "rust");
    }

    #[test]
    fn test_created_with_foreign_id_is_rejected() {
        let path = Path::parse("a");
        let event = Event::new(Folder::agg_id_for(&Path::parse("b")), 1, EventPayload::FolderCreated { path });
        assert!(Folder::empty("").apply(&event).is_err());
    }

    #[test]
    fn test_deleted_cannot_be_first_event() {
        let path = Path::parse("a");
        let id = Folder::agg_id_for(&path);
        let event = Event::new(&id, 1, EventPayload::FolderDeleted { path });
        assert!(Folder::empty(&id).apply(&event).is_err());
    }

    #[test]
    fn test_note_events_are_rejected() {
        let path = Path::parse("a");
        let id = Folder::agg_id_for(&path);
        let (folder, _) = Folder::empty(&id)
            .apply(&Event::new(&id, 1, EventPayload::FolderCreated { path }))
            .unwrap();

        for payload in [
            EventPayload::NoteDeleted,
            EventPayload::ContentChanged { content: "x".to_string() },
            EventPayload::Moved { path: Path::parse("b") },
        ] {
            assert!(folder.apply(&Event::new(&id, 2, payload)).is_err());
        }
    }

    #[test]
    fn test_create_existing_folder_is_no_op() {
        let path = Path::parse("a");
        let id = Folder::agg_id_for(&path);
        let (folder, _) = Folder::empty(&id)
            .apply(&Event::new(&id, 1, EventPayload::FolderCreated { path: path.clone() }))
            .unwrap();

        let (same, event) = folder
            .apply(&Event::new(&id, 2, EventPayload::FolderCreated { path }))
            .unwrap();
        assert!(event.is_none());
        assert_eq!(same.revision, 1);
    }
}
