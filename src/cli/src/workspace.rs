//! Opening the replica a command works on.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;

use wmsnotes_core::command::{CommandExecutor, CommandRequest, CommandResult};
use wmsnotes_core::config::Config;
use wmsnotes_core::events::{Folder, Note, Path};
use wmsnotes_core::policy::derive_command;
use wmsnotes_core::replica::Replica;

use crate::commands::config as cli_config;

/// Global options shared by all commands.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

impl Options {
    /// Replica configuration: file or environment, then CLI settings, then flags.
    pub fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(&path.to_string_lossy())
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => Config::load().context("Failed to load configuration from the environment")?,
        };

        let data_dir = self
            .data_dir
            .clone()
            .or_else(|| cli_config::load_value("data-dir").map(PathBuf::from))
            .unwrap_or_else(|| config.storage.data_dir.clone());
        config.storage = config.storage.at(data_dir);

        if config.sync.remote_dir.is_none() {
            config.sync.remote_dir = cli_config::load_value("remote-dir").map(PathBuf::from);
        }
        Ok(config)
    }
}

/// The local replica plus its configuration.
pub struct Workspace {
    pub config: Config,
    pub replica: Replica,
}

impl Workspace {
    pub async fn open(options: &Options) -> Result<Self> {
        let config = options.load_config()?;
        let replica = Replica::open("local", &config.storage, &config.commands)
            .await
            .with_context(|| format!("Failed to open replica at {}", config.storage.data_dir.display()))?;
        Ok(Self { config, replica })
    }

    /// Execute a request and the title commands its content changes call for.
    pub async fn execute(&self, request: CommandRequest) -> Result<CommandResult> {
        let processor = self.replica.processor();
        let result = processor.execute(request).await;
        if let Some(error) = result.first_failure() {
            bail!("{}", error);
        }

        for event in result.events() {
            if let Some(derived) = derive_command(event) {
                let derived = processor.execute(derived).await;
                if let Some(error) = derived.first_failure() {
                    crate::output::print_warning(&format!("Title not updated: {}", error));
                }
            }
        }
        Ok(result)
    }

    /// A note that has been created, deleted or not.
    pub async fn note(&self, agg_id: &str) -> Result<Note> {
        let note = self.replica.processor().notes().get_latest(agg_id).await?;
        if note.revision == 0 {
            bail!("Note '{}' not found", agg_id);
        }
        Ok(note)
    }

    pub async fn notes(&self) -> Result<Vec<Note>> {
        let mut notes = Vec::new();
        for agg_id in self.replica.log().get_aggregate_ids().await? {
            if Note::is_valid_agg_id(&agg_id) {
                notes.push(self.replica.processor().notes().get_latest(&agg_id).await?);
            }
        }
        Ok(notes)
    }

    pub async fn folder(&self, path: &Path) -> Result<Folder> {
        Ok(self
            .replica
            .processor()
            .folders()
            .get_latest(&Folder::agg_id_for(path))
            .await?)
    }

    pub async fn folders(&self) -> Result<Vec<Folder>> {
        let mut folders = Vec::new();
        for agg_id in self.replica.log().get_aggregate_ids().await? {
            if agg_id.starts_with(wmsnotes_core::events::FOLDER_ID_PREFIX) {
                folders.push(self.replica.processor().folders().get_latest(&agg_id).await?);
            }
        }
        Ok(folders)
    }
}
