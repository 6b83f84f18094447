//! Periodic synchronization in the background.

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::synchronizer::{SyncReport, Synchronizer};
use crate::error::Result;

/// Default time between two passes.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Runs [`Synchronizer::synchronize`] on an interval, starting immediately.
///
/// The task can be paused without being stopped. After every pass the
/// synchronizer's bookkeeping is written to the state file, if one is set.
pub struct SynchronizationTask {
    synchronizer: Arc<Synchronizer>,
    interval: Duration,
    state_path: Option<PathBuf>,
    paused: watch::Sender<bool>,
    reports: watch::Sender<Option<SyncReport>>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SynchronizationTask {
    pub fn new(synchronizer: Arc<Synchronizer>, interval: Duration) -> Self {
        Self {
            synchronizer,
            interval,
            state_path: None,
            paused: watch::channel(false).0,
            reports: watch::channel(None).0,
            running: Mutex::new(None),
        }
    }

    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        tracing::debug!(interval = ?self.interval, "Starting synchronization");
        let token = CancellationToken::new();
        let worker = Worker {
            synchronizer: Arc::clone(&self.synchronizer),
            state_path: self.state_path.clone(),
            reports: self.reports.clone(),
        };
        let handle = tokio::spawn(worker.run(self.interval, self.paused.subscribe(), token.clone()));
        *running = Some((token, handle));
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Skip passes until [`resume`](Self::resume) is called. A pass in progress finishes.
    pub fn pause(&self) {
        if !self.paused.send_replace(true) {
            tracing::debug!("Pausing synchronization");
        }
    }

    pub fn resume(&self) {
        if self.paused.send_replace(false) {
            tracing::debug!("Resuming synchronization");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Receiver of the report of the most recent pass.
    pub fn reports(&self) -> watch::Receiver<Option<SyncReport>> {
        self.reports.subscribe()
    }

    /// Run one pass right now, independent of the interval and of pausing.
    pub async fn run_once(&self) -> Result<SyncReport> {
        let worker = Worker {
            synchronizer: Arc::clone(&self.synchronizer),
            state_path: self.state_path.clone(),
            reports: self.reports.clone(),
        };
        worker.pass().await
    }

    /// Stop the background loop and wait for a pass in progress to finish.
    pub async fn shutdown(&self) {
        let running = self.running.lock().take();
        if let Some((token, handle)) = running {
            tracing::debug!("Stopping synchronization");
            token.cancel();
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Synchronization task panicked");
            }
        }
    }
}

struct Worker {
    synchronizer: Arc<Synchronizer>,
    state_path: Option<PathBuf>,
    reports: watch::Sender<Option<SyncReport>>,
}

impl Worker {
    async fn run(self, interval: Duration, mut paused: watch::Receiver<bool>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if *paused.borrow_and_update() {
                continue;
            }
            if let Err(e) = self.pass().await {
                e.log();
            }
        }
    }

    async fn pass(&self) -> Result<SyncReport> {
        tracing::debug!("Synchronizing");
        let report = self.synchronizer.synchronize().await?;
        if let Some(path) = &self.state_path {
            self.synchronizer.state().save(path).await?;
        }
        self.reports.send_replace(Some(report.clone()));
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandExecutor, CommandProcessor, CommandRequest, NoteCommand};
    use crate::event_log::{EventLog, InMemoryEventLog};
    use crate::events::{Note, Path};

    fn replicas() -> (Arc<CommandProcessor>, Arc<dyn EventLog>, Arc<Synchronizer>) {
        let local = Arc::new(CommandProcessor::uncached(Arc::new(InMemoryEventLog::new("local"))));
        let remote_log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new("remote"));
        let remote = Arc::new(CommandProcessor::uncached(Arc::clone(&remote_log)));
        let synchronizer = Arc::new(Synchronizer::new(
            Arc::clone(&local),
            Arc::clone(&remote_log),
            remote,
            Vec::new(),
        ));
        (local, remote_log, synchronizer)
    }

    #[tokio::test]
    async fn test_run_once_saves_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let (local, remote_log, synchronizer) = replicas();

        let id = Note::new_agg_id();
        let result = local
            .execute(CommandRequest::single(
                &id,
                NoteCommand::Create {
                    agg_id: id.clone(),
                    path: Path::default(),
                    title: "Title".to_string(),
                    content: "Text".to_string(),
                },
            ))
            .await;
        assert!(result.is_success());

        let task = SynchronizationTask::new(synchronizer, DEFAULT_SYNC_INTERVAL).with_state_path(&path);
        let report = task.run_once().await.unwrap();

        assert_eq!(report.synchronized, vec![id.clone()]);
        assert_eq!(remote_log.latest_revision(&id).await.unwrap(), 1);
        assert!(path.exists());
        assert_eq!(task.reports().borrow().as_ref(), Some(&report));
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let (_, _, synchronizer) = replicas();
        let task = SynchronizationTask::new(synchronizer, Duration::from_millis(10));

        task.start();
        task.start();
        assert!(task.is_running());

        task.pause();
        assert!(task.is_paused());
        task.resume();
        assert!(!task.is_paused());

        task.shutdown().await;
        assert!(!task.is_running());
    }
}
