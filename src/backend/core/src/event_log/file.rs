//! File-backed event log.
//!
//! Layout: `<root>/<agg_id>/<revision:010>.json`, one self-describing JSON
//! document per event. Files are written to a temporary name and renamed into
//! place. The id index is rebuilt by scanning the tree when the log is opened.

use async_trait::async_trait;
use futures::stream::StreamExt;
use metrics::counter;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::instrument;

use super::index::LogIndex;
use super::{live_stream, EventLog, EventStream, LiveEvents, DEFAULT_UPDATE_BUFFER};
use crate::error::{ErrorCode, ErrorContext, NotesError, Result};
use crate::events::{Event, EventId, Revision};

/// Event log persisted as one file per event.
pub struct FileEventLog {
    name: String,
    root: Arc<PathBuf>,
    index: RwLock<LogIndex>,
    append_lock: Mutex<()>,
    updates: broadcast::Sender<Event>,
}

impl FileEventLog {
    /// Open (or create) a log rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_update_buffer(root, DEFAULT_UPDATE_BUFFER).await
    }

    #[instrument(skip_all)]
    pub async fn open_with_update_buffer(root: impl Into<PathBuf>, update_buffer: usize) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let index = scan(&root).await?;

        tracing::info!(
            root = %root.display(),
            events = index.len(),
            last_event_id = index.last_event_id(),
            "Opened file event log"
        );

        let (updates, _) = broadcast::channel(update_buffer.max(1));
        Ok(Self {
            name: root.display().to_string(),
            root: Arc::new(root),
            index: RwLock::new(index),
            append_lock: Mutex::new(()),
            updates,
        })
    }

    pub fn root(&self) -> &FsPath {
        &self.root
    }
}

/// Highest id handed out, kept once events have been removed.
const ID_MARK_FILE: &str = "last-event-id";

/// Path of the file holding `(agg_id, revision)`.
fn event_path(root: &FsPath, agg_id: &str, revision: Revision) -> PathBuf {
    root.join(agg_id).join(format!("{:010}.json", revision))
}

/// Aggregate ids become directory names; refuse anything that could escape the root.
pub(crate) fn validate_agg_id(agg_id: &str) -> Result<()> {
    let valid = !agg_id.is_empty()
        && !agg_id.starts_with('.')
        && agg_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(NotesError::invalid_event(format!(
            "{:?} cannot be used as an aggregate id",
            agg_id
        )))
    }
}

async fn read_event(path: &FsPath) -> Result<Event> {
    let bytes = tokio::fs::read(path).await?;
    let event = serde_json::from_slice(&bytes).map_err(|e| {
        NotesError::with_internal(
            ErrorCode::SerializationError,
            format!("Could not parse event file {}", path.display()),
            e.to_string(),
        )
        .with_source(e)
    })?;
    Ok(event)
}

/// Write `bytes` next to `path` and rename into place.
async fn write_atomic(path: &FsPath, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn write_event(path: &FsPath, event: &Event) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    write_atomic(path, &serde_json::to_vec_pretty(event)?).await
}

/// Rebuild the index from the files under `root`.
async fn scan(root: &FsPath) -> Result<LogIndex> {
    let mut events = Vec::new();

    let mut aggregates = tokio::fs::read_dir(root).await?;
    while let Some(entry) = aggregates.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let agg_id = entry.file_name().to_string_lossy().into_owned();
        let mut files = tokio::fs::read_dir(entry.path()).await?;
        while let Some(file) = files.next_entry().await? {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let event = read_event(&path).await?;
            let expected = event_path(root, &event.agg_id, event.revision);
            if event.agg_id != agg_id || expected != path {
                return Err(NotesError::storage(format!(
                    "{} is stored at {} instead of {}",
                    event,
                    path.display(),
                    expected.display()
                )));
            }
            events.push(event);
        }
    }

    events.sort_by_key(|event| event.event_id);
    let mut index = LogIndex::default();
    for event in &events {
        if event.revision != index.latest_revision(&event.agg_id) + 1 {
            return Err(NotesError::storage(format!(
                "{} does not follow revision {} of its aggregate",
                event,
                index.latest_revision(&event.agg_id)
            )));
        }
        index.insert(event);
    }

    match tokio::fs::read_to_string(root.join(ID_MARK_FILE)).await {
        Ok(mark) => {
            let mark = mark
                .trim()
                .parse::<EventId>()
                .with_error_code(ErrorCode::StorageError)?;
            index.reserve_up_to(mark);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(index)
}

#[async_trait]
impl EventLog for FileEventLog {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, event), fields(log = %self.name, agg_id = %event.agg_id, revision = event.revision))]
    async fn append(&self, event: Event) -> Result<Event> {
        validate_agg_id(&event.agg_id)?;
        let _guard = self.append_lock.lock().await;

        let event_id = self.index.read().prepare_append(&event)?;
        let event = event.with_event_id(event_id);
        write_event(&event_path(&self.root, &event.agg_id, event.revision), &event).await?;

        self.index.write().insert(&event);
        let _ = self.updates.send(event.clone());

        counter!("wmsnotes_events_appended_total", "log" => "file").increment(1);
        tracing::debug!(event_id, event_type = event.event_type(), "Event appended");
        Ok(event)
    }

    fn get_events(&self, after_event_id: Option<EventId>) -> EventStream {
        let locations = self.index.read().locations_after(after_event_id);
        let root = Arc::clone(&self.root);

        futures::stream::iter(locations)
            .then(move |(event_id, (agg_id, revision))| {
                let path = event_path(&root, &agg_id, revision);
                async move {
                    match read_event(&path).await {
                        Ok(event) if event.event_id == event_id => Some(Ok(event)),
                        // Revision was removed and appended again; the newer event
                        // comes later in the id order.
                        Ok(_) => None,
                        // Removed after the snapshot was taken.
                        Err(e) if e.code() == ErrorCode::NotFound => None,
                        Err(e) => Some(Err(e)),
                    }
                }
            })
            .filter_map(futures::future::ready)
            .boxed()
    }

    fn get_event_updates(&self) -> LiveEvents {
        live_stream(self.updates.subscribe(), self.name.clone())
    }

    async fn get_events_of_aggregate(
        &self,
        agg_id: &str,
        after_revision: Option<Revision>,
    ) -> Result<Vec<Event>> {
        let revisions = self.index.read().aggregate_revisions(agg_id, after_revision);
        let mut events = Vec::with_capacity(revisions.len());
        for revision in revisions {
            events.push(read_event(&event_path(&self.root, agg_id, revision)).await?);
        }
        Ok(events)
    }

    async fn latest_revision(&self, agg_id: &str) -> Result<Revision> {
        Ok(self.index.read().latest_revision(agg_id))
    }

    async fn get_aggregate_ids(&self) -> Result<BTreeSet<String>> {
        Ok(self.index.read().aggregate_ids())
    }

    #[instrument(skip(self, event), fields(log = %self.name, event_id = event.event_id))]
    async fn remove(&self, event: &Event) -> Result<()> {
        let _guard = self.append_lock.lock().await;
        self.index.read().prepare_remove(event)?;

        let last_event_id = self.index.read().last_event_id();
        write_atomic(&self.root.join(ID_MARK_FILE), last_event_id.to_string().as_bytes()).await?;
        tokio::fs::remove_file(event_path(&self.root, &event.agg_id, event.revision)).await?;
        self.index.write().remove(event);

        tracing::debug!(agg_id = %event.agg_id, revision = event.revision, "Event removed");
        Ok(())
    }
}
