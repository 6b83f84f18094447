//! Field-level differences between two states of an aggregate and the
//! commands that remove them.
//!
//! Compensating commands are ordered create, undelete, field changes, delete,
//! so that every field change is applied to an existing aggregate.

use crate::command::{Command, FolderCommand, NoteCommand};
use crate::events::{Folder, Note, Path};

/// Lifecycle stage of an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Existence {
    NotYetCreated,
    Exists,
    Deleted,
}

impl Existence {
    fn of(exists: bool, revision: u64) -> Self {
        match (exists, revision) {
            (true, _) => Existence::Exists,
            (false, 0) => Existence::NotYetCreated,
            (false, _) => Existence::Deleted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoteDifference {
    Existence { current: Existence, target: Existence },
    Path { current: Path, target: Path },
    Title { current: String, target: String },
    Content { current: String, target: String },
    Attachment {
        name: String,
        current: Option<Vec<u8>>,
        target: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderDifference {
    Existence { current: Existence, target: Existence },
}

/// Everything that differs between two notes, ignoring revisions.
pub fn note_differences(current: &Note, target: &Note) -> Vec<NoteDifference> {
    let mut differences = Vec::new();

    let (from, to) = (
        Existence::of(current.exists, current.revision),
        Existence::of(target.exists, target.revision),
    );
    if from != to {
        differences.push(NoteDifference::Existence {
            current: from,
            target: to,
        });
    }
    if current.path != target.path {
        differences.push(NoteDifference::Path {
            current: current.path.clone(),
            target: target.path.clone(),
        });
    }
    if current.title != target.title {
        differences.push(NoteDifference::Title {
            current: current.title.clone(),
            target: target.title.clone(),
        });
    }
    if current.content != target.content {
        differences.push(NoteDifference::Content {
            current: current.content.clone(),
            target: target.content.clone(),
        });
    }

    let names: std::collections::BTreeSet<&String> = current
        .attachment_hashes
        .keys()
        .chain(target.attachment_hashes.keys())
        .collect();
    for name in names {
        if current.attachment_hashes.get(name) != target.attachment_hashes.get(name) {
            differences.push(NoteDifference::Attachment {
                name: name.clone(),
                current: current.attachments.get(name).cloned(),
                target: target.attachments.get(name).cloned(),
            });
        }
    }

    differences
}

pub fn folder_differences(current: &Folder, target: &Folder) -> Vec<FolderDifference> {
    let (from, to) = (
        Existence::of(current.exists, current.revision),
        Existence::of(target.exists, target.revision),
    );
    if from == to {
        Vec::new()
    } else {
        vec![FolderDifference::Existence {
            current: from,
            target: to,
        }]
    }
}

/// Commands that turn `current` into a note equal to `target` ignoring revision.
///
/// A created note cannot become uncreated again; for such a target the note is
/// deleted instead.
pub fn compensate_note(current: &Note, target: &Note) -> Vec<Command> {
    let differences = note_differences(current, target);
    if differences.is_empty() {
        return Vec::new();
    }

    let from = Existence::of(current.exists, current.revision);
    let to = Existence::of(target.exists, target.revision);
    if to == Existence::NotYetCreated {
        return if current.exists {
            vec![NoteCommand::Delete.into()]
        } else {
            Vec::new()
        };
    }

    let creating = from == Existence::NotYetCreated;

    let mut fields = Vec::new();
    for difference in differences {
        match difference {
            NoteDifference::Existence { .. } => {}
            // Creation already carries the target's path, title and content.
            NoteDifference::Path { target, .. } if !creating => {
                fields.push(NoteCommand::Move { path: target })
            }
            NoteDifference::Title { target, .. } if !creating => {
                fields.push(NoteCommand::ChangeTitle { title: target })
            }
            NoteDifference::Content { target, .. } if !creating => {
                fields.push(NoteCommand::ChangeContent { content: target })
            }
            NoteDifference::Path { .. }
            | NoteDifference::Title { .. }
            | NoteDifference::Content { .. } => {}
            NoteDifference::Attachment {
                name,
                current,
                target,
            } => {
                if current.is_some() {
                    fields.push(NoteCommand::DeleteAttachment { name: name.clone() });
                }
                if let Some(content) = target {
                    fields.push(NoteCommand::AddAttachment { name, content });
                }
            }
        }
    }

    let mut commands: Vec<NoteCommand> = Vec::new();
    if creating {
        commands.push(NoteCommand::Create {
            agg_id: current.agg_id.clone(),
            path: target.path.clone(),
            title: target.title.clone(),
            content: target.content.clone(),
        });
    }
    let exists_before_fields = creating || current.exists;
    let undelete = !exists_before_fields && (target.exists || !fields.is_empty());
    if undelete {
        commands.push(NoteCommand::Undelete);
    }
    commands.append(&mut fields);
    if !target.exists && (exists_before_fields || undelete) {
        commands.push(NoteCommand::Delete);
    }

    commands.into_iter().map(Command::from).collect()
}

/// Commands that turn `current` into a folder equal to `target` ignoring revision.
pub fn compensate_folder(current: &Folder, target: &Folder) -> Vec<Command> {
    let path = if current.revision > 0 {
        current.path.clone()
    } else {
        target.path.clone()
    };

    let mut commands = Vec::new();
    for difference in folder_differences(current, target) {
        let FolderDifference::Existence { current: from, target: to } = difference;
        match (from, to) {
            (Existence::NotYetCreated, Existence::Exists) | (Existence::Deleted, Existence::Exists) => {
                commands.push(FolderCommand::Create { path: path.clone() });
            }
            (Existence::NotYetCreated, Existence::Deleted) => {
                commands.push(FolderCommand::Create { path: path.clone() });
                commands.push(FolderCommand::Delete { path: path.clone() });
            }
            (Existence::Exists, _) => commands.push(FolderCommand::Delete { path: path.clone() }),
            _ => {}
        }
    }
    commands.into_iter().map(Command::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{fold, Aggregate, Event};

    fn note(exists: bool, revision: u64) -> Note {
        Note {
            exists,
            revision,
            path: Path::parse("inbox"),
            title: "Title".to_string(),
            content: "Text".to_string(),
            ..Note::empty("n-00000000-0000-4000-8000-000000000000")
        }
    }

    fn with_attachment(mut note: Note, name: &str, content: &[u8]) -> Note {
        note.attachment_hashes.insert(name.to_string(), Note::hash(content));
        note.attachments.insert(name.to_string(), content.to_vec());
        note
    }

    /// Apply the commands' payloads to `current` the way the processor would.
    fn replay(current: &Note, commands: &[Command]) -> Note {
        let events: Vec<Event> = commands
            .iter()
            .enumerate()
            .map(|(i, command)| {
                Event::new(&current.agg_id, current.revision + 1 + i as u64, command.to_payload())
            })
            .collect();
        fold(current.clone(), &events).unwrap()
    }

    #[test]
    fn test_no_differences_no_commands() {
        assert!(compensate_note(&note(true, 3), &note(true, 7)).is_empty());
    }

    #[test]
    fn test_create_carries_target_fields() {
        let current = Note::empty("n-00000000-0000-4000-8000-000000000000");
        let target = with_attachment(note(true, 2), "a.png", b"png");

        let commands = compensate_note(&current, &target);

        assert_eq!(commands.len(), 2);
        assert!(matches!(commands[0], Command::Note(NoteCommand::Create { .. })));
        assert!(replay(&current, &commands).equals_ignoring_revision(&target));
    }

    #[test]
    fn test_changed_attachment_is_replaced() {
        let current = with_attachment(note(true, 2), "a.png", b"old");
        let target = with_attachment(note(true, 2), "a.png", b"new");

        let commands = compensate_note(&current, &target);

        assert_eq!(
            commands,
            vec![
                NoteCommand::DeleteAttachment { name: "a.png".to_string() }.into(),
                NoteCommand::AddAttachment {
                    name: "a.png".to_string(),
                    content: b"new".to_vec()
                }
                .into(),
            ]
        );
        assert!(replay(&current, &commands).equals_ignoring_revision(&target));
    }

    #[test]
    fn test_deleted_note_with_changed_fields() {
        let current = note(false, 4);
        let mut target = note(false, 6);
        target.content = "Other".to_string();

        let commands = compensate_note(&current, &target);

        assert_eq!(commands.first(), Some(&NoteCommand::Undelete.into()));
        assert_eq!(commands.last(), Some(&NoteCommand::Delete.into()));
        assert!(replay(&current, &commands).equals_ignoring_revision(&target));
    }

    #[test]
    fn test_existing_to_deleted() {
        let current = note(true, 2);
        let mut target = note(false, 3);
        target.title = "Gone".to_string();

        let commands = compensate_note(&current, &target);
        assert_eq!(commands.last(), Some(&NoteCommand::Delete.into()));
        assert!(replay(&current, &commands).equals_ignoring_revision(&target));
    }

    #[test]
    fn test_folder_compensation() {
        let path = Path::parse("projects");
        let id = Folder::agg_id_for(&path);
        let empty = Folder::empty(&id);
        let existing = Folder {
            agg_id: id.clone(),
            revision: 1,
            exists: true,
            path: path.clone(),
        };
        let deleted = Folder {
            revision: 2,
            exists: false,
            ..existing.clone()
        };

        assert_eq!(
            compensate_folder(&empty, &existing),
            vec![FolderCommand::Create { path: path.clone() }.into()]
        );
        assert_eq!(
            compensate_folder(&existing, &deleted),
            vec![FolderCommand::Delete { path: path.clone() }.into()]
        );
        assert_eq!(compensate_folder(&empty, &deleted).len(), 2);
        assert!(compensate_folder(&existing, &existing).is_empty());
    }
}
