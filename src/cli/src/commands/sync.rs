//! One synchronization pass against another replica.

use anyhow::{bail, Context, Result};
use clap::Args;
use std::path::PathBuf;

use wmsnotes_core::replica::Replica;
use wmsnotes_core::sync::{ConflictPolicy, SyncReport, SynchronizerState, TailPolicy};

use crate::output::{self, OutputFormat};
use crate::workspace::{Options, Workspace};

#[derive(Args)]
pub struct SyncArgs {
    /// Directory of the remote replica; defaults to the configured one
    #[arg(short, long)]
    remote: Option<PathBuf>,

    /// What to do with the local history when both sides changed
    #[arg(long, value_parser = parse_tail_policy)]
    tail_policy: Option<TailPolicy>,

    /// How to settle a field changed on both sides
    #[arg(long, value_parser = parse_conflict_policy)]
    conflict_policy: Option<ConflictPolicy>,
}

fn parse_tail_policy(value: &str) -> Result<TailPolicy, String> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| "expected 'keep' or 'rewrite'".to_string())
}

fn parse_conflict_policy(value: &str) -> Result<ConflictPolicy, String> {
    serde_json::from_value(serde_json::Value::String(value.replace('-', "_")))
        .map_err(|_| "expected 'prefer-local', 'prefer-remote', 'keep-both' or 'unresolved'".to_string())
}

pub async fn execute(args: SyncArgs, options: &Options, format: OutputFormat) -> Result<()> {
    let mut workspace = Workspace::open(options).await?;
    let sync = &mut workspace.config.sync;
    if let Some(tail_policy) = args.tail_policy {
        sync.tail_policy = tail_policy;
    }
    if let Some(conflict_policy) = args.conflict_policy {
        sync.conflict_policy = conflict_policy;
    }

    let Some(remote_dir) = args.remote.or_else(|| sync.remote_dir.clone()) else {
        bail!("No remote replica given; pass --remote or set 'remote-dir'");
    };
    if remote_dir == workspace.config.storage.data_dir {
        bail!("The remote replica must differ from the local one");
    }

    let remote_storage = workspace.config.storage.at(&remote_dir);
    let remote = Replica::open("remote", &remote_storage, &workspace.config.commands)
        .await
        .with_context(|| format!("Failed to open remote replica at {}", remote_dir.display()))?;

    let state_file = workspace.config.sync.state_file_in(&workspace.config.storage.data_dir);
    let state = SynchronizerState::load(&state_file).await?;
    let synchronizer = workspace
        .replica
        .synchronizer(&remote, &workspace.config.sync)
        .with_state(state);

    let report = synchronizer.synchronize().await?;
    synchronizer.state().save(&state_file).await?;

    match format {
        OutputFormat::Table => print_report(&report),
        _ => output::print_item(&report, format)?,
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    output::print_header("Synchronization");
    output::print_detail("Synchronized", &report.synchronized.len().to_string());
    output::print_detail("Unchanged", &report.unchanged.to_string());
    output::print_detail("Commands executed", &report.commands_executed.to_string());

    for (agg_id, reason) in &report.deferred {
        output::print_warning(&format!("{} deferred: {}", agg_id, reason));
    }
    for (agg_id, reason) in &report.unresolved {
        output::print_warning(&format!("{} needs manual resolution: {}", agg_id, reason));
    }

    if report.is_clean() {
        output::print_success("Replicas are in sync");
    } else {
        output::print_info("Run sync again to retry deferred aggregates");
    }
}
