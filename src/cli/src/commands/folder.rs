//! Folder commands.

use anyhow::{bail, Result};
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use wmsnotes_core::command::{CommandRequest, FolderCommand};
use wmsnotes_core::events::{Folder, Path};

use crate::output::{self, OutputFormat};
use crate::workspace::{Options, Workspace};

#[derive(Subcommand)]
pub enum FolderCommands {
    /// Create a folder
    Create {
        /// Folder path, e.g. "projects/house"
        path: String,
    },

    /// Delete a folder
    Delete { path: String },

    /// List folders
    List {
        /// Include deleted folders
        #[arg(short, long)]
        all: bool,
    },
}

#[derive(Debug, Serialize, Tabled)]
struct FolderRow {
    #[tabled(rename = "Path")]
    path: String,
    #[tabled(rename = "Title")]
    title: String,
    #[tabled(rename = "Revision")]
    revision: u64,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "ID")]
    id: String,
}

impl From<&Folder> for FolderRow {
    fn from(folder: &Folder) -> Self {
        Self {
            path: folder.path.to_string(),
            title: folder.title().to_string(),
            revision: folder.revision,
            status: if folder.exists { "active" } else { "deleted" }.to_string(),
            id: folder.agg_id.clone(),
        }
    }
}

pub async fn execute(cmd: FolderCommands, options: &Options, format: OutputFormat) -> Result<()> {
    let workspace = Workspace::open(options).await?;

    match cmd {
        FolderCommands::Create { path } => {
            let path = Path::parse(&path);
            if path.is_root() {
                bail!("The root folder always exists");
            }
            let folder = workspace.folder(&path).await?;
            let request = CommandRequest::single(&folder.agg_id, FolderCommand::Create { path: path.clone() })
                .with_last_revision(folder.revision);
            workspace.execute(request).await?;
            output::print_success(&format!("Created folder '{}'", path));
        }

        FolderCommands::Delete { path } => {
            let path = Path::parse(&path);
            let folder = workspace.folder(&path).await?;
            if !folder.exists {
                bail!("Folder '{}' does not exist", path);
            }
            let request = CommandRequest::single(&folder.agg_id, FolderCommand::Delete { path: path.clone() })
                .with_last_revision(folder.revision);
            workspace.execute(request).await?;
            output::print_success(&format!("Deleted folder '{}'", path));
        }

        FolderCommands::List { all } => {
            let mut rows: Vec<FolderRow> = workspace
                .folders()
                .await?
                .iter()
                .filter(|folder| all || folder.exists)
                .map(FolderRow::from)
                .collect();
            rows.sort_by(|a, b| a.path.cmp(&b.path));
            output::print_list(&rows, format)?;
        }
    }

    Ok(())
}
