//! Note commands.
//!
//! Every change is checked against the revision the note had when it was read,
//! so concurrent edits from the daemon or another CLI call are rejected rather
//! than overwritten.

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use serde::Serialize;
use std::path::PathBuf;
use tabled::Tabled;

use wmsnotes_core::command::{CommandRequest, NoteCommand};
use wmsnotes_core::events::{Note, Path};

use crate::output::{self, OutputFormat};
use crate::workspace::{Options, Workspace};

#[derive(Subcommand)]
pub enum NoteCommands {
    /// Create a note
    Create {
        /// Folder path, e.g. "projects/house"
        #[arg(short, long, default_value = "")]
        path: String,

        /// Initial title; derived from the content when omitted
        #[arg(short, long)]
        title: Option<String>,

        /// Initial content
        #[arg(long, conflicts_with = "file")]
        content: Option<String>,

        /// Read the initial content from a file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// List notes
    List {
        /// Include deleted notes
        #[arg(short, long)]
        all: bool,
    },

    /// Show a note
    Show {
        /// Note ID
        id: String,
    },

    /// Replace a note's content
    Edit {
        /// Note ID
        id: String,

        #[arg(long, conflicts_with = "file")]
        content: Option<String>,

        /// Read the content from a file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Change a note's title
    Rename {
        /// Note ID
        id: String,
        title: String,
    },

    /// Move a note to another folder
    Move {
        /// Note ID
        id: String,
        path: String,
    },

    /// Delete a note
    Delete {
        /// Note ID
        id: String,
    },

    /// Restore a deleted note
    Undelete {
        /// Note ID
        id: String,
    },

    /// Attach a file to a note
    Attach {
        /// Note ID
        id: String,
        file: PathBuf,

        /// Attachment name; defaults to the file name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Remove an attachment from a note
    Detach {
        /// Note ID
        id: String,
        name: String,
    },
}

#[derive(Debug, Serialize, Tabled)]
struct NoteRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Path")]
    path: String,
    #[tabled(rename = "Title")]
    title: String,
    #[tabled(rename = "Revision")]
    revision: u64,
    #[tabled(rename = "Attachments")]
    attachments: usize,
    #[tabled(rename = "Status")]
    status: String,
}

impl From<&Note> for NoteRow {
    fn from(note: &Note) -> Self {
        Self {
            id: note.agg_id.clone(),
            path: note.path.to_string(),
            title: note.title.clone(),
            revision: note.revision,
            attachments: note.attachments.len(),
            status: if note.exists { "active" } else { "deleted" }.to_string(),
        }
    }
}

/// A note as shown to the user: attachment digests instead of bytes.
#[derive(Debug, Serialize)]
struct NoteView<'a> {
    id: &'a str,
    revision: u64,
    exists: bool,
    path: String,
    title: &'a str,
    content: &'a str,
    attachments: &'a std::collections::BTreeMap<String, String>,
}

async fn read_content(content: Option<String>, file: Option<PathBuf>) -> Result<Option<String>> {
    match (content, file) {
        (Some(content), _) => Ok(Some(content)),
        (None, Some(file)) => Ok(Some(
            tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?,
        )),
        (None, None) => Ok(None),
    }
}

/// Run a single command against the note's current revision.
async fn change(workspace: &Workspace, id: &str, command: NoteCommand) -> Result<u64> {
    let note = workspace.note(id).await?;
    let request = CommandRequest::single(id, command).with_last_revision(note.revision);
    let result = workspace.execute(request).await?;
    Ok(result.last_revision().unwrap_or(note.revision))
}

pub async fn execute(cmd: NoteCommands, options: &Options, format: OutputFormat) -> Result<()> {
    let workspace = Workspace::open(options).await?;

    match cmd {
        NoteCommands::Create {
            path,
            title,
            content,
            file,
        } => {
            let content = read_content(content, file).await?.unwrap_or_default();
            let title = title
                .or_else(|| wmsnotes_core::policy::extract_title(&content))
                .unwrap_or_else(|| "Untitled".to_string());
            let id = Note::new_agg_id();
            let request = CommandRequest::single(
                &id,
                NoteCommand::Create {
                    agg_id: id.clone(),
                    path: Path::parse(&path),
                    title,
                    content,
                },
            )
            .with_last_revision(0);
            workspace.execute(request).await?;

            match format {
                OutputFormat::Table => output::print_success(&format!("Created note {}", id)),
                _ => output::print_item(&serde_json::json!({ "id": id }), format)?,
            }
        }

        NoteCommands::List { all } => {
            let rows: Vec<NoteRow> = workspace
                .notes()
                .await?
                .iter()
                .filter(|note| all || note.exists)
                .map(NoteRow::from)
                .collect();
            output::print_list(&rows, format)?;
        }

        NoteCommands::Show { id } => {
            let note = workspace.note(&id).await?;
            match format {
                OutputFormat::Table => {
                    output::print_header(&note.title);
                    output::print_detail("ID", &note.agg_id);
                    output::print_detail("Path", &note.path.to_string());
                    output::print_detail("Revision", &note.revision.to_string());
                    output::print_detail("Status", if note.exists { "active" } else { "deleted" });
                    for (name, hash) in &note.attachment_hashes {
                        output::print_detail("Attachment", &format!("{} ({})", name, &hash[..12.min(hash.len())]));
                    }
                    println!();
                    println!("{}", note.content);
                }
                _ => output::print_item(
                    &NoteView {
                        id: &note.agg_id,
                        revision: note.revision,
                        exists: note.exists,
                        path: note.path.to_string(),
                        title: &note.title,
                        content: &note.content,
                        attachments: &note.attachment_hashes,
                    },
                    format,
                )?,
            }
        }

        NoteCommands::Edit { id, content, file } => {
            let Some(content) = read_content(content, file).await? else {
                bail!("Either --content or --file is required");
            };
            let revision = change(&workspace, &id, NoteCommand::ChangeContent { content }).await?;
            output::print_success(&format!("Updated note {} (revision {})", id, revision));
        }

        NoteCommands::Rename { id, title } => {
            let revision = change(&workspace, &id, NoteCommand::ChangeTitle { title }).await?;
            output::print_success(&format!("Renamed note {} (revision {})", id, revision));
        }

        NoteCommands::Move { id, path } => {
            let path = Path::parse(&path);
            let revision = change(&workspace, &id, NoteCommand::Move { path: path.clone() }).await?;
            output::print_success(&format!("Moved note {} to '{}' (revision {})", id, path, revision));
        }

        NoteCommands::Delete { id } => {
            change(&workspace, &id, NoteCommand::Delete).await?;
            output::print_success(&format!("Deleted note {}", id));
        }

        NoteCommands::Undelete { id } => {
            change(&workspace, &id, NoteCommand::Undelete).await?;
            output::print_success(&format!("Restored note {}", id));
        }

        NoteCommands::Attach { id, file, name } => {
            let name = match name {
                Some(name) => name,
                None => file
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .context("The file has no name; pass --name")?,
            };
            let content = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let name = Note::sanitize_attachment_name(&name);
            change(&workspace, &id, NoteCommand::AddAttachment { name: name.clone(), content }).await?;
            output::print_success(&format!("Attached '{}' to note {}", name, id));
        }

        NoteCommands::Detach { id, name } => {
            change(&workspace, &id, NoteCommand::DeleteAttachment { name: name.clone() }).await?;
            output::print_success(&format!("Removed '{}' from note {}", name, id));
        }
    }

    Ok(())
}
