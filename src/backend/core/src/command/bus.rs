//! Asynchronous command bus.
//!
//! Requests are queued on a bounded channel and executed one at a time by a
//! worker task, which keeps the submission order of requests for the same
//! aggregate. Results are published on a broadcast channel; callers that need
//! the result of their own request use [`CommandBus::execute_and_wait`].

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::model::{CommandError, CommandRequest, CommandResult};
use super::CommandExecutor;
use crate::error::{ErrorCode, NotesError, Result};

/// Default capacity of the request queue and the result channel.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Default time `execute` waits for a result.
pub const DEFAULT_RESULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Queue in front of a [`CommandExecutor`].
pub struct CommandBus {
    requests: mpsc::Sender<CommandRequest>,
    results: broadcast::Sender<CommandResult>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    result_timeout: Duration,
}

impl CommandBus {
    /// Spawn the worker task. Must be called inside a tokio runtime.
    pub fn start(executor: Arc<dyn CommandExecutor>, capacity: usize, result_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        let (requests, receiver) = mpsc::channel(capacity);
        let (results, _) = broadcast::channel(capacity);
        let shutdown = CancellationToken::new();

        let worker = tokio::spawn(run_worker(
            executor,
            receiver,
            results.clone(),
            shutdown.clone(),
        ));

        Self {
            requests,
            results,
            shutdown,
            worker: Mutex::new(Some(worker)),
            result_timeout,
        }
    }

    /// Queue a request without waiting for its result.
    pub async fn submit(&self, request: CommandRequest) -> Result<Uuid> {
        let request_id = request.request_id;
        self.requests.send(request).await.map_err(|_| {
            NotesError::new(ErrorCode::ChannelClosed, "The command bus has been shut down")
        })?;
        Ok(request_id)
    }

    /// Results of every request executed from now on.
    pub fn results(&self) -> BoxStream<'static, CommandResult> {
        BroadcastStream::new(self.results.subscribe())
            .filter_map(|item| {
                let item = match item {
                    Ok(result) => Some(result),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Command result subscriber lagged behind");
                        None
                    }
                };
                futures::future::ready(item)
            })
            .boxed()
    }

    /// Submit a request and wait for its result.
    pub async fn execute_and_wait(&self, request: CommandRequest, timeout: Duration) -> Result<CommandResult> {
        // Subscribe first so the result cannot be published before we listen.
        let mut results = self.results.subscribe();
        let request_id = self.submit(request).await?;

        let wait = async {
            loop {
                match results.recv().await {
                    Ok(result) if result.request_id == request_id => return Ok(result),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(%request_id, skipped, "Missed command results while waiting");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(NotesError::new(
                            ErrorCode::ChannelClosed,
                            "The command bus stopped before the request completed",
                        ))
                    }
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            NotesError::new(
                ErrorCode::Timeout,
                format!("No result for request {} within {:?}", request_id, timeout),
            )
        })?
    }

    /// Stop the worker after the request it is currently executing.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Command bus worker panicked");
            }
        }
    }
}

async fn run_worker(
    executor: Arc<dyn CommandExecutor>,
    mut receiver: mpsc::Receiver<CommandRequest>,
    results: broadcast::Sender<CommandResult>,
    shutdown: CancellationToken,
) {
    tracing::info!("Command bus started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            request = receiver.recv() => {
                let Some(request) = request else { break };
                let result = executor.execute(request).await;
                // No subscribers is fine.
                let _ = results.send(result);
            }
        }
    }
    tracing::info!("Command bus stopped");
}

#[async_trait]
impl CommandExecutor for CommandBus {
    async fn execute(&self, request: CommandRequest) -> CommandResult {
        let fallback = request.clone();
        match self.execute_and_wait(request, self.result_timeout).await {
            Ok(result) => result,
            Err(e) => CommandResult::rejected(&fallback, CommandError::from(e)),
        }
    }
}
