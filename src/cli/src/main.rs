//! wmsnotes CLI - Command-line interface for file-backed note replicas.
//!
//! Provides commands for notes, folders, the raw event log, synchronization
//! with a second replica and configuration.

mod commands;
mod output;
mod workspace;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use commands::{config, folder, log, note, sync};
use output::OutputFormat;

/// wmsnotes - event-sourced notes
#[derive(Parser)]
#[command(
    name = "wmsnotes",
    version,
    about = "wmsnotes - event-sourced notes",
    long_about = "CLI tool for editing notes and folders in a local replica and synchronizing it with another one.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Replica directory (overrides the configuration)
    #[arg(short, long, global = true, env = "WMSNOTES_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Configuration file of the replica (TOML, YAML or JSON)
    #[arg(short, long, global = true, env = "WMSNOTES_CONFIG")]
    config: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Note operations
    #[command(subcommand)]
    Note(note::NoteCommands),

    /// Folder operations
    #[command(subcommand)]
    Folder(folder::FolderCommands),

    /// Show stored events
    Log(log::LogArgs),

    /// Synchronize with another replica
    Sync(sync::SyncArgs),

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let format = cli.output;
    let options = workspace::Options {
        data_dir: cli.data_dir.clone(),
        config: cli.config.clone(),
    };

    let result = match cli.command {
        Commands::Note(cmd) => note::execute(cmd, &options, format).await,
        Commands::Folder(cmd) => folder::execute(cmd, &options, format).await,
        Commands::Log(args) => log::execute(args, &options, format).await,
        Commands::Sync(args) => sync::execute(args, &options, format).await,
        Commands::Config(cmd) => config::execute(cmd, &options, format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
