//! Reconciliation of two replicas.
//!
//! A pass visits every aggregate known to either side. For each one the
//! synchronizer finds the revisions at which both sides last agreed, reads
//! what each side appended since, and then:
//!
//! - replays the other side's new events when only one side changed
//! - asks a [`SynchronizationStrategy`] for compensating commands when both changed
//!
//! Commands go through the local [`CommandProcessor`] and the remote
//! [`CommandExecutor`], so they are subject to the same revision checks as any
//! other command. A failed command defers the aggregate to the next pass. An
//! aggregate without a merge solution is skipped until either side changes.
//! A resolution may also create new aggregates on both sides, e.g. a copy of
//! a conflicting local note.

use dashmap::DashSet;
use futures::stream::{self, StreamExt};
use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument;

use super::state::{SyncBase, SynchronizerState};
use super::strategy::{ReconcileInput, Resolution, SynchronizationStrategy};
use crate::command::{
    Command, CommandExecutor, CommandOrigin, CommandProcessor, CommandRequest, CommandResult,
};
use crate::error::{ErrorCode, NotesError, Result};
use crate::event_log::EventLog;
use crate::events::{Event, Revision};

/// Default number of aggregates reconciled at the same time.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// What happens to the local history when both sides diverged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TailPolicy {
    /// Keep both histories and append compensating events on each side
    #[default]
    Keep,
    /// Replace the local divergent events with the remote ones plus the merge result
    Rewrite,
}

/// Outcome for one aggregate in a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateSync {
    Unchanged,
    Synchronized { commands: usize },
    /// A command or read failed; retried next pass
    Deferred { code: ErrorCode, reason: String },
    /// No strategy could merge; retried once either side changes
    Unresolved { reason: String },
    /// Another reconciliation of the same aggregate is in flight
    Busy,
}

impl AggregateSync {
    fn label(&self) -> &'static str {
        match self {
            AggregateSync::Unchanged => "unchanged",
            AggregateSync::Synchronized { .. } => "synchronized",
            AggregateSync::Deferred { .. } => "deferred",
            AggregateSync::Unresolved { .. } => "unresolved",
            AggregateSync::Busy => "busy",
        }
    }
}

/// Summary of one synchronization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub synchronized: Vec<String>,
    pub unchanged: usize,
    pub deferred: BTreeMap<String, String>,
    pub unresolved: BTreeMap<String, String>,
    pub busy: Vec<String>,
    pub commands_executed: usize,
}

impl SyncReport {
    /// Nothing was deferred or left unresolved.
    pub fn is_clean(&self) -> bool {
        self.deferred.is_empty() && self.unresolved.is_empty()
    }

    fn record(&mut self, agg_id: String, outcome: AggregateSync) {
        match outcome {
            AggregateSync::Unchanged => self.unchanged += 1,
            AggregateSync::Synchronized { commands } => {
                self.synchronized.push(agg_id);
                self.commands_executed += commands;
            }
            AggregateSync::Deferred { reason, .. } => {
                self.deferred.insert(agg_id, reason);
            }
            AggregateSync::Unresolved { reason } => {
                self.unresolved.insert(agg_id, reason);
            }
            AggregateSync::Busy => self.busy.push(agg_id),
        }
    }
}

/// Marks an aggregate as being reconciled for as long as it lives.
struct InFlight<'a> {
    set: &'a DashSet<String>,
    agg_id: String,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a DashSet<String>, agg_id: &str) -> Option<Self> {
        set.insert(agg_id.to_string()).then(|| Self {
            set,
            agg_id: agg_id.to_string(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.agg_id);
    }
}

fn ensure_success(result: &CommandResult) -> Result<()> {
    match result.first_failure() {
        Some(error) => Err(NotesError::from(error.clone())),
        None => Ok(()),
    }
}

fn commands_for(events: &[Event]) -> Vec<Command> {
    events.iter().map(Command::from_event).collect()
}

fn last_revision(events: &[Event], otherwise: Revision) -> Revision {
    events.last().map(|event| event.revision).unwrap_or(otherwise)
}

/// Brings a local replica and a remote replica to the same content.
pub struct Synchronizer {
    local: Arc<CommandProcessor>,
    remote_log: Arc<dyn EventLog>,
    remote: Arc<dyn CommandExecutor>,
    strategies: Vec<Arc<dyn SynchronizationStrategy>>,
    state: Mutex<SynchronizerState>,
    in_flight: DashSet<String>,
    tail_policy: TailPolicy,
    max_concurrency: usize,
}

impl Synchronizer {
    pub fn new(
        local: Arc<CommandProcessor>,
        remote_log: Arc<dyn EventLog>,
        remote: Arc<dyn CommandExecutor>,
        strategies: Vec<Arc<dyn SynchronizationStrategy>>,
    ) -> Self {
        Self {
            local,
            remote_log,
            remote,
            strategies,
            state: Mutex::new(SynchronizerState::default()),
            in_flight: DashSet::new(),
            tail_policy: TailPolicy::default(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    pub fn with_state(self, state: SynchronizerState) -> Self {
        *self.state.lock() = state;
        self
    }

    pub fn with_tail_policy(mut self, tail_policy: TailPolicy) -> Self {
        self.tail_policy = tail_policy;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// A copy of the current bookkeeping, e.g. for persisting it.
    pub fn state(&self) -> SynchronizerState {
        self.state.lock().clone()
    }

    /// Run one pass over every aggregate known to either side.
    #[instrument(skip(self), fields(local = self.local.log().name(), remote = self.remote_log.name()))]
    pub async fn synchronize(&self) -> Result<SyncReport> {
        let started = Instant::now();
        let mut agg_ids = self.local.log().get_aggregate_ids().await?;
        agg_ids.extend(self.remote_log.get_aggregate_ids().await?);

        let outcomes: Vec<(String, AggregateSync)> = stream::iter(agg_ids)
            .map(|agg_id| async move {
                let outcome = self.synchronize_aggregate(&agg_id).await;
                (agg_id, outcome)
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        let mut report = SyncReport::default();
        for (agg_id, outcome) in outcomes {
            report.record(agg_id, outcome);
        }
        report.synchronized.sort();
        report.busy.sort();

        counter!("wmsnotes_sync_passes_total").increment(1);
        histogram!("wmsnotes_sync_pass_duration_seconds").record(started.elapsed().as_secs_f64());
        tracing::info!(
            synchronized = report.synchronized.len(),
            unchanged = report.unchanged,
            deferred = report.deferred.len(),
            unresolved = report.unresolved.len(),
            commands = report.commands_executed,
            "Synchronization pass finished"
        );
        Ok(report)
    }

    /// Reconcile a single aggregate.
    pub async fn synchronize_aggregate(&self, agg_id: &str) -> AggregateSync {
        let Some(_in_flight) = InFlight::acquire(&self.in_flight, agg_id) else {
            tracing::debug!(agg_id, "Reconciliation already in flight");
            return AggregateSync::Busy;
        };

        let outcome = match self.reconcile(agg_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let retries = self.state.lock().record_failure(agg_id);
                tracing::warn!(agg_id, error = %e, retries, "Synchronization deferred");
                AggregateSync::Deferred {
                    code: e.code(),
                    reason: e.message().to_string(),
                }
            }
        };

        counter!("wmsnotes_sync_aggregates_total", "outcome" => outcome.label()).increment(1);
        outcome
    }

    async fn reconcile(&self, agg_id: &str) -> Result<AggregateSync> {
        let local_log = self.local.log();
        let local_latest = local_log.latest_revision(agg_id).await?;
        let remote_latest = self.remote_log.latest_revision(agg_id).await?;

        let unresolved = self
            .state
            .lock()
            .unresolved_at(agg_id, local_latest, remote_latest)
            .map(|marker| marker.reason.clone());
        if let Some(reason) = unresolved {
            return Ok(AggregateSync::Unresolved { reason });
        }

        let stored = self
            .state
            .lock()
            .base(agg_id)
            .filter(|base| base.local <= local_latest && base.remote <= remote_latest);
        let base = match stored {
            Some(base) => base,
            None => self.common_base(agg_id).await?,
        };

        let local_tail = local_log.get_events_of_aggregate(agg_id, Some(base.local)).await?;
        let remote_tail = self
            .remote_log
            .get_events_of_aggregate(agg_id, Some(base.remote))
            .await?;

        tracing::debug!(
            agg_id,
            local_base = base.local,
            remote_base = base.remote,
            local_new = local_tail.len(),
            remote_new = remote_tail.len(),
            "Comparing replicas"
        );

        match (local_tail.is_empty(), remote_tail.is_empty()) {
            (true, true) => {
                if stored.is_none() {
                    self.state.lock().synchronized(agg_id, base);
                }
                Ok(AggregateSync::Unchanged)
            }
            (true, false) => {
                let request = CommandRequest::new(agg_id, commands_for(&remote_tail))
                    .with_last_revision(base.local)
                    .with_origin(CommandOrigin::Remote);
                let result = self.local.process(request).await;
                ensure_success(&result)?;

                self.state.lock().synchronized(
                    agg_id,
                    SyncBase {
                        local: result.last_revision().unwrap_or(base.local),
                        remote: last_revision(&remote_tail, base.remote),
                    },
                );
                Ok(AggregateSync::Synchronized {
                    commands: result.events().len(),
                })
            }
            (false, true) => {
                let request = CommandRequest::new(agg_id, commands_for(&local_tail))
                    .with_last_revision(base.remote)
                    .with_origin(CommandOrigin::Remote);
                let result = self.remote.execute(request).await;
                ensure_success(&result)?;

                self.state.lock().synchronized(
                    agg_id,
                    SyncBase {
                        local: last_revision(&local_tail, base.local),
                        remote: result.last_revision().unwrap_or(base.remote),
                    },
                );
                Ok(AggregateSync::Synchronized {
                    commands: result.events().len(),
                })
            }
            (false, false) => {
                let input = ReconcileInput {
                    agg_id: agg_id.to_string(),
                    local_base: base.local,
                    remote_base: base.remote,
                    local_tail,
                    remote_tail,
                };
                self.merge(input).await
            }
        }
    }

    /// Both sides changed: resolve with a strategy and apply its commands.
    async fn merge(&self, input: ReconcileInput) -> Result<AggregateSync> {
        let agg_id = input.agg_id.as_str();
        let local_last = last_revision(&input.local_tail, input.local_base);
        let remote_last = last_revision(&input.remote_tail, input.remote_base);

        let strategy = self.strategies.iter().find(|strategy| {
            strategy.can_handle_event(&input.local_tail[0]) && strategy.can_handle_event(&input.remote_tail[0])
        });
        let resolution = match strategy {
            Some(strategy) => strategy.reconcile(&input).await?,
            None => Resolution::NoSolution(format!(
                "no strategy handles {} events",
                input.local_tail[0].family()
            )),
        };

        let (local_commands, remote_commands, copies) = match resolution {
            Resolution::Solved {
                local_commands,
                remote_commands,
                copies,
            } => (local_commands, remote_commands, copies),
            Resolution::NoSolution(reason) => {
                NotesError::merge_unresolved(agg_id, reason.as_str()).log();
                self.state
                    .lock()
                    .mark_unresolved(agg_id, local_last, remote_last, reason.as_str());
                return Ok(AggregateSync::Unresolved { reason });
            }
        };

        let mut executed = 0;

        // Copies exist on both sides before either side gives up its version.
        let sides: [(&str, &dyn CommandExecutor); 2] =
            [("local", self.local.as_ref()), ("remote", self.remote.as_ref())];
        for copy in copies {
            for (side, target) in sides {
                let request = CommandRequest::new(&copy.agg_id, copy.commands.clone())
                    .with_last_revision(0)
                    .with_origin(CommandOrigin::Remote);
                let result = target.execute(request).await;
                ensure_success(&result)?;
                executed += result.events().len();
                tracing::info!(agg_id, copy = %copy.agg_id, side, "Kept conflicting version as a new aggregate");
            }
        }

        // Remote first: if the local side fails afterwards, nothing merged is lost.
        let mut remote_revision = remote_last;
        if !remote_commands.is_empty() {
            let request = CommandRequest::new(agg_id, remote_commands.clone())
                .with_last_revision(remote_last)
                .with_origin(CommandOrigin::Remote);
            let result = self.remote.execute(request).await;
            ensure_success(&result)?;
            executed += result.events().len();
            remote_revision = result.last_revision().unwrap_or(remote_last);
        }

        let local_revision = match self.tail_policy {
            TailPolicy::Keep if local_commands.is_empty() => local_last,
            TailPolicy::Keep => {
                let request = CommandRequest::new(agg_id, local_commands)
                    .with_last_revision(local_last)
                    .with_origin(CommandOrigin::Remote);
                let result = self.local.process(request).await;
                ensure_success(&result)?;
                executed += result.events().len();
                result.last_revision().unwrap_or(local_last)
            }
            TailPolicy::Rewrite => {
                let mut commands = commands_for(&input.remote_tail);
                commands.extend(remote_commands);
                let request = CommandRequest::new(agg_id, commands)
                    .with_last_revision(input.local_base)
                    .with_origin(CommandOrigin::Remote);
                let result = self
                    .local
                    .rewrite_tail(input.local_base, local_last, request)
                    .await?;
                ensure_success(&result)?;
                executed += result.events().len();
                result.last_revision().unwrap_or(input.local_base)
            }
        };

        self.state.lock().synchronized(
            agg_id,
            SyncBase {
                local: local_revision,
                remote: remote_revision,
            },
        );
        tracing::info!(agg_id, executed, policy = ?self.tail_policy, "Merged divergent aggregate");
        Ok(AggregateSync::Synchronized { commands: executed })
    }

    /// Revision up to which both histories hold the same events.
    async fn common_base(&self, agg_id: &str) -> Result<SyncBase> {
        let local = self.local.log().get_events_of_aggregate(agg_id, None).await?;
        let remote = self.remote_log.get_events_of_aggregate(agg_id, None).await?;
        let common = local
            .iter()
            .zip(remote.iter())
            .take_while(|(l, r)| l.same_content(r))
            .count() as Revision;
        Ok(SyncBase {
            local: common,
            remote: common,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::InMemoryEventLog;

    #[test]
    fn test_in_flight_guard() {
        let set = DashSet::new();
        let first = InFlight::acquire(&set, "n-1");
        assert!(first.is_some());
        assert!(InFlight::acquire(&set, "n-1").is_none());

        drop(first);
        assert!(InFlight::acquire(&set, "n-1").is_some());
    }

    #[test]
    fn test_report_record() {
        let mut report = SyncReport::default();
        report.record("a".to_string(), AggregateSync::Synchronized { commands: 2 });
        report.record("b".to_string(), AggregateSync::Unchanged);
        report.record(
            "c".to_string(),
            AggregateSync::Deferred {
                code: ErrorCode::RevisionConflict,
                reason: "stale".to_string(),
            },
        );

        assert_eq!(report.commands_executed, 2);
        assert_eq!(report.unchanged, 1);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_empty_replicas() {
        let local = Arc::new(CommandProcessor::uncached(Arc::new(InMemoryEventLog::new("local"))));
        let remote_log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new("remote"));
        let remote = Arc::new(CommandProcessor::uncached(Arc::clone(&remote_log)));

        let synchronizer = Synchronizer::new(local, remote_log, remote, Vec::new());
        let report = synchronizer.synchronize().await.unwrap();

        assert_eq!(report, SyncReport::default());
    }
}
