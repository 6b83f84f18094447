//! Wiring of one replica: event log, snapshot caches and command processor.

use std::sync::Arc;

use crate::command::{CommandExecutor, CommandProcessor};
use crate::config::{CommandsConfig, LogBackend, SnapshotBackend, StorageConfig, SyncConfig};
use crate::error::Result;
use crate::event_log::{EventLog, FileEventLog, InMemoryEventLog};
use crate::events::Aggregate;
use crate::repository::{
    AggregateCache, AggregateRepository, FileAggregateCache, InMemoryAggregateCache,
    NoopAggregateCache,
};
use crate::sync::{folder_strategy, note_strategy, SynchronizationStrategy, Synchronizer};

/// A named event log with the processor that writes to it.
#[derive(Clone)]
pub struct Replica {
    name: String,
    log: Arc<dyn EventLog>,
    processor: Arc<CommandProcessor>,
}

impl Replica {
    /// Open the replica described by `storage`, creating directories as needed.
    pub async fn open(name: impl Into<String>, storage: &StorageConfig, commands: &CommandsConfig) -> Result<Self> {
        let name = name.into();
        let log: Arc<dyn EventLog> = match storage.log {
            LogBackend::Memory => Arc::new(InMemoryEventLog::new(name.clone())),
            LogBackend::File => Arc::new(FileEventLog::open(storage.events_dir()).await?),
        };

        let processor = CommandProcessor::new(
            Arc::clone(&log),
            repository(&log, storage, "notes"),
            repository(&log, storage, "folders"),
            commands.lock_stripes,
        );

        tracing::info!(
            replica = %name,
            data_dir = %storage.data_dir.display(),
            log = ?storage.log,
            snapshots = ?storage.snapshots,
            "Replica opened"
        );
        Ok(Self {
            name,
            log,
            processor: Arc::new(processor),
        })
    }

    /// Replica with an in-memory log and no snapshots.
    pub fn in_memory(name: impl Into<String>) -> Self {
        let name = name.into();
        let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new(name.clone()));
        Self {
            name,
            processor: Arc::new(CommandProcessor::uncached(Arc::clone(&log))),
            log,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    pub fn processor(&self) -> &Arc<CommandProcessor> {
        &self.processor
    }

    /// Synchronizer keeping this replica and `remote` in step.
    pub fn synchronizer(&self, remote: &Replica, sync: &SyncConfig) -> Synchronizer {
        let strategies: Vec<Arc<dyn SynchronizationStrategy>> = vec![
            Arc::new(note_strategy(
                self.processor.notes().clone(),
                AggregateRepository::uncached(Arc::clone(&remote.log)),
                sync.conflict_policy,
                &sync.conflict_title_suffix,
            )),
            Arc::new(folder_strategy(
                self.processor.folders().clone(),
                AggregateRepository::uncached(Arc::clone(&remote.log)),
                sync.conflict_policy,
            )),
        ];

        let remote_executor: Arc<dyn CommandExecutor> = Arc::clone(&remote.processor) as Arc<dyn CommandExecutor>;
        Synchronizer::new(
            Arc::clone(&self.processor),
            Arc::clone(&remote.log),
            remote_executor,
            strategies,
        )
        .with_tail_policy(sync.tail_policy)
        .with_max_concurrency(sync.max_concurrency)
    }
}

fn repository<A: Aggregate>(log: &Arc<dyn EventLog>, storage: &StorageConfig, family: &str) -> AggregateRepository<A> {
    let cache: Arc<dyn AggregateCache<A>> = match storage.snapshots {
        SnapshotBackend::None => Arc::new(NoopAggregateCache::new()),
        SnapshotBackend::Memory => Arc::new(InMemoryAggregateCache::new()),
        SnapshotBackend::File => Arc::new(FileAggregateCache::new(storage.snapshots_dir().join(family))),
    };
    AggregateRepository::new(Arc::clone(log), cache, storage.snapshot_interval)
}
