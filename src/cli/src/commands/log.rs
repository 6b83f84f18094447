//! Event log inspection.

use anyhow::Result;
use clap::Args;
use futures::StreamExt;
use serde::Serialize;
use tabled::Tabled;

use wmsnotes_core::events::{Event, EventId};

use crate::output::{self, OutputFormat};
use crate::workspace::{Options, Workspace};

#[derive(Args)]
pub struct LogArgs {
    /// Only events with an id above this one
    #[arg(short, long)]
    after: Option<EventId>,

    /// Only events of this aggregate
    #[arg(long)]
    agg_id: Option<String>,

    /// Maximum number of events
    #[arg(short, long, default_value = "100")]
    limit: usize,
}

#[derive(Debug, Serialize, Tabled)]
struct EventRow {
    #[tabled(rename = "Event")]
    event_id: EventId,
    #[tabled(rename = "Aggregate")]
    agg_id: String,
    #[tabled(rename = "Revision")]
    revision: u64,
    #[tabled(rename = "Type")]
    event_type: String,
}

impl From<&Event> for EventRow {
    fn from(event: &Event) -> Self {
        Self {
            event_id: event.event_id,
            agg_id: event.agg_id.clone(),
            revision: event.revision,
            event_type: event.event_type().to_string(),
        }
    }
}

pub async fn execute(args: LogArgs, options: &Options, format: OutputFormat) -> Result<()> {
    let workspace = Workspace::open(options).await?;

    let mut events = workspace.replica.log().get_events(args.after);
    let mut selected = Vec::new();
    while let Some(event) = events.next().await {
        let event = event?;
        if args.agg_id.as_deref().is_some_and(|agg_id| agg_id != event.agg_id) {
            continue;
        }
        selected.push(event);
        if selected.len() >= args.limit {
            break;
        }
    }

    match format {
        OutputFormat::Table => {
            let rows: Vec<EventRow> = selected.iter().map(EventRow::from).collect();
            output::print_list(&rows, format)?;
        }
        _ => output::print_item(&selected, format)?,
    }
    Ok(())
}
