//! Derived-command policies.
//!
//! [`NoteTitlePolicy`] keeps a note's title in sync with the first line of its
//! content: every `ContentChanged` event produces a `ChangeTitle` command based
//! on the revision of that event. If the note changed again in the meantime the
//! command fails with a revision conflict and is dropped; the newer content
//! change produces its own title command.

use futures::stream::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::command::{CommandExecutor, CommandRequest, NoteCommand};
use crate::event_log::{EventLog, LiveEvents};
use crate::events::{Event, EventPayload};

/// Title of a note with the given content: the first non-blank line without a
/// leading `"# "`, trimmed. `None` if the content has no non-blank line.
pub fn extract_title(content: &str) -> Option<String> {
    content
        .lines()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.strip_prefix("# ").unwrap_or(line).trim().to_string())
}

/// The title command an event calls for, if any.
pub fn derive_command(event: &Event) -> Option<CommandRequest> {
    let EventPayload::ContentChanged { content } = &event.payload else {
        return None;
    };
    let title = extract_title(content)?;
    Some(
        CommandRequest::single(&event.agg_id, NoteCommand::ChangeTitle { title })
            .with_last_revision(event.revision),
    )
}

/// Background task deriving titles from content changes.
pub struct NoteTitlePolicy {
    log: Arc<dyn EventLog>,
    executor: Arc<dyn CommandExecutor>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl NoteTitlePolicy {
    pub fn new(log: Arc<dyn EventLog>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            log,
            executor,
            running: Mutex::new(None),
        }
    }

    /// Start listening. Events appended after this call returns are handled.
    /// Starting a running policy does nothing.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let updates = self.log.get_event_updates();
        let handle = tokio::spawn(run(updates, Arc::clone(&self.executor), token.clone()));
        tracing::debug!(log = self.log.name(), "Note title policy started");
        *running = Some((token, handle));
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Stop listening and wait for the task to finish.
    pub async fn shutdown(&self) {
        let running = self.running.lock().take();
        if let Some((token, handle)) = running {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Note title policy task panicked");
            }
            tracing::debug!("Note title policy stopped");
        }
    }
}

async fn run(mut updates: LiveEvents, executor: Arc<dyn CommandExecutor>, token: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = updates.next() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let Some(request) = derive_command(&event) else {
            continue;
        };
        tracing::debug!(agg_id = %event.agg_id, revision = event.revision, "Deriving note title");

        let result = executor.execute(request).await;
        if let Some(error) = result.first_failure() {
            tracing::debug!(agg_id = %event.agg_id, error = %error, "Title command not applied");
        }
    }
}
