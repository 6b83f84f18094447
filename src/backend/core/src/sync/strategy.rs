//! Synchronization strategies.
//!
//! When both replicas changed an aggregate since their last common revision,
//! the synchronizer hands both tails to the first strategy that can handle the
//! aggregate's events. A strategy answers with the commands each side needs to
//! reach the same content, or with `NoSolution`.

use async_trait::async_trait;

use super::merge::{
    ConflictPolicy, EqualsMergeStrategy, KeepBothMergeStrategy, MergeOutcome, MergeStrategy,
    MultipleMergeStrategy, ThreeWayMergeStrategy,
};
use crate::command::Command;
use crate::error::Result;
use crate::events::{fold, Aggregate, Event, Folder, Note, Revision};
use crate::repository::AggregateRepository;

/// Divergent histories of one aggregate.
#[derive(Debug, Clone)]
pub struct ReconcileInput {
    pub agg_id: String,
    /// Last local revision known to match the remote side
    pub local_base: Revision,
    /// Last remote revision known to match the local side
    pub remote_base: Revision,
    pub local_tail: Vec<Event>,
    pub remote_tail: Vec<Event>,
}

/// A new aggregate a resolution creates on both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateCopy {
    pub agg_id: String,
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Commands to execute on top of each side's current state
    Solved {
        local_commands: Vec<Command>,
        remote_commands: Vec<Command>,
        copies: Vec<AggregateCopy>,
    },
    NoSolution(String),
}

#[async_trait]
pub trait SynchronizationStrategy: Send + Sync {
    /// Whether this strategy understands the aggregate an event belongs to.
    fn can_handle_event(&self, event: &Event) -> bool;

    async fn reconcile(&self, input: &ReconcileInput) -> Result<Resolution>;
}

/// Reconciles by merging the two current states against their common ancestor.
pub struct MergingSynchronizationStrategy<A: Aggregate> {
    local: AggregateRepository<A>,
    remote: AggregateRepository<A>,
    merge: Box<dyn MergeStrategy<A>>,
}

impl<A: Aggregate> MergingSynchronizationStrategy<A> {
    pub fn new(
        local: AggregateRepository<A>,
        remote: AggregateRepository<A>,
        merge: Box<dyn MergeStrategy<A>>,
    ) -> Self {
        Self {
            local,
            remote,
            merge,
        }
    }
}

#[async_trait]
impl<A: Aggregate> SynchronizationStrategy for MergingSynchronizationStrategy<A> {
    fn can_handle_event(&self, event: &Event) -> bool {
        event.family() == A::AGGREGATE_TYPE
    }

    async fn reconcile(&self, input: &ReconcileInput) -> Result<Resolution> {
        let ancestor = self.local.get_at(&input.agg_id, input.local_base).await?;
        let local = fold(ancestor.clone(), &input.local_tail)?;
        let remote_base = self.remote.get_at(&input.agg_id, input.remote_base).await?;
        let remote = fold(remote_base, &input.remote_tail)?;

        if local.equals_ignoring_revision(&remote) {
            tracing::debug!(agg_id = %input.agg_id, "Both sides have the same content");
            return Ok(Resolution::Solved {
                local_commands: Vec::new(),
                remote_commands: Vec::new(),
                copies: Vec::new(),
            });
        }

        let (merged, copy) = match self.merge.merge(&ancestor, &local, &remote) {
            MergeOutcome::Merged(merged) => (merged, None),
            MergeOutcome::MergedWithCopy { merged, copy } => (merged, Some(copy)),
            MergeOutcome::NoSolution(reason) => return Ok(Resolution::NoSolution(reason)),
        };

        let local_commands = local.commands_towards(&merged);
        let remote_commands = remote.commands_towards(&merged);
        let copies: Vec<AggregateCopy> = copy
            .map(|copy| AggregateCopy {
                agg_id: copy.agg_id().to_string(),
                commands: A::empty(copy.agg_id()).commands_towards(&copy),
            })
            .into_iter()
            .collect();
        tracing::debug!(
            agg_id = %input.agg_id,
            local_commands = local_commands.len(),
            remote_commands = remote_commands.len(),
            copies = copies.len(),
            "Merged divergent histories"
        );
        Ok(Resolution::Solved {
            local_commands,
            remote_commands,
            copies,
        })
    }
}

/// Default merge chain: identical content first, then a three-way merge.
fn default_merge<A: Aggregate>(policy: ConflictPolicy) -> Box<dyn MergeStrategy<A>>
where
    ThreeWayMergeStrategy: MergeStrategy<A>,
{
    Box::new(MultipleMergeStrategy::new(vec![
        Box::new(EqualsMergeStrategy),
        Box::new(ThreeWayMergeStrategy::new(policy)),
    ]))
}

/// Note reconciliation. With [`ConflictPolicy::KeepBoth`] a conflicting local
/// note is kept as a new note titled with `conflict_title_suffix`.
pub fn note_strategy(
    local: AggregateRepository<Note>,
    remote: AggregateRepository<Note>,
    policy: ConflictPolicy,
    conflict_title_suffix: &str,
) -> MergingSynchronizationStrategy<Note> {
    let merge: Box<dyn MergeStrategy<Note>> = match policy {
        ConflictPolicy::KeepBoth => Box::new(MultipleMergeStrategy::new(vec![
            Box::new(EqualsMergeStrategy),
            Box::new(KeepBothMergeStrategy::new(conflict_title_suffix)),
        ])),
        ConflictPolicy::PreferLocal | ConflictPolicy::PreferRemote | ConflictPolicy::Unresolved => {
            default_merge(policy)
        }
    };
    MergingSynchronizationStrategy::new(local, remote, merge)
}

pub fn folder_strategy(
    local: AggregateRepository<Folder>,
    remote: AggregateRepository<Folder>,
    policy: ConflictPolicy,
) -> MergingSynchronizationStrategy<Folder> {
    MergingSynchronizationStrategy::new(local, remote, default_merge(policy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::{EventLog, InMemoryEventLog};
    use crate::sync::merge::DEFAULT_CONFLICT_TITLE_SUFFIX;
    use crate::events::{EventPayload, Path};
    use std::sync::Arc;

    fn created(agg_id: &str) -> Event {
        Event::new(
            agg_id,
            1,
            EventPayload::NoteCreated {
                path: Path::parse("inbox"),
                title: "Title".to_string(),
                content: "Text".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_reconcile_divergent_fields() {
        let id = Note::new_agg_id();
        let local_log = Arc::new(InMemoryEventLog::new("local"));
        let remote_log = Arc::new(InMemoryEventLog::new("remote"));
        local_log.append(created(&id)).await.unwrap();
        remote_log.append(created(&id)).await.unwrap();

        let local_tail = vec![local_log
            .append(Event::new(&id, 2, EventPayload::TitleChanged { title: "Mine".to_string() }))
            .await
            .unwrap()];
        let remote_tail = vec![remote_log
            .append(Event::new(&id, 2, EventPayload::ContentChanged { content: "Theirs".to_string() }))
            .await
            .unwrap()];

        let strategy = note_strategy(
            AggregateRepository::uncached(local_log),
            AggregateRepository::uncached(remote_log),
            ConflictPolicy::Unresolved,
            DEFAULT_CONFLICT_TITLE_SUFFIX,
        );
        assert!(strategy.can_handle_event(&local_tail[0]));

        let resolution = strategy
            .reconcile(&ReconcileInput {
                agg_id: id.clone(),
                local_base: 1,
                remote_base: 1,
                local_tail,
                remote_tail,
            })
            .await
            .unwrap();

        assert_eq!(
            resolution,
            Resolution::Solved {
                local_commands: vec![crate::command::NoteCommand::ChangeContent {
                    content: "Theirs".to_string()
                }
                .into()],
                remote_commands: vec![crate::command::NoteCommand::ChangeTitle {
                    title: "Mine".to_string()
                }
                .into()],
                copies: Vec::new(),
            }
        );
    }

    #[test]
    fn test_folder_strategy_ignores_note_events() {
        let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::default());
        let strategy = folder_strategy(
            AggregateRepository::uncached(Arc::clone(&log)),
            AggregateRepository::uncached(log),
            ConflictPolicy::PreferLocal,
        );
        assert!(!strategy.can_handle_event(&created(&Note::new_agg_id())));
    }
}
