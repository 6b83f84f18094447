//! Merge strategies.
//!
//! A merge strategy is a pure function from the common ancestor and the two
//! divergent states of an aggregate to the state both replicas should end up
//! in. Field-level policies are pluggable: [`EqualsMergeStrategy`] only accepts
//! identical content, [`ThreeWayMergeStrategy`] takes each field from the side
//! that changed it and settles true conflicts with a [`ConflictPolicy`], and
//! [`KeepBothMergeStrategy`] settles note conflicts in favour of the remote side
//! while keeping the local version as a new note.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::events::{Aggregate, Folder, Note};

/// Result of a merge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome<A> {
    Merged(A),
    /// Both sides take `merged`; `copy` is a new aggregate holding what `merged` dropped
    MergedWithCopy { merged: A, copy: A },
    NoSolution(String),
}

pub trait MergeStrategy<A: Aggregate>: Send + Sync {
    fn merge(&self, ancestor: &A, local: &A, remote: &A) -> MergeOutcome<A>;
}

// =============================================================================
// Equals
// =============================================================================

/// Succeeds only when both sides already have the same content.
#[derive(Debug, Clone, Copy, Default)]
pub struct EqualsMergeStrategy;

impl<A: Aggregate> MergeStrategy<A> for EqualsMergeStrategy {
    fn merge(&self, _ancestor: &A, local: &A, remote: &A) -> MergeOutcome<A> {
        if local.equals_ignoring_revision(remote) {
            MergeOutcome::Merged(local.clone())
        } else {
            MergeOutcome::NoSolution("local and remote content differ".to_string())
        }
    }
}

// =============================================================================
// Three-way
// =============================================================================

/// How to settle a field both sides changed to different values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    PreferLocal,
    PreferRemote,
    /// Take the remote value and keep the local note as a new note
    KeepBoth,
    /// Leave the aggregate unsynchronized until a human intervenes
    Unresolved,
}

/// Field-by-field merge against the common ancestor.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreeWayMergeStrategy {
    policy: ConflictPolicy,
}

impl ThreeWayMergeStrategy {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }

    fn field<T: PartialEq + Clone>(
        &self,
        name: &str,
        ancestor: &T,
        local: &T,
        remote: &T,
    ) -> Result<T, String> {
        if local == remote || remote == ancestor {
            return Ok(local.clone());
        }
        if local == ancestor {
            return Ok(remote.clone());
        }
        match self.policy {
            ConflictPolicy::PreferLocal => Ok(local.clone()),
            // Only notes can be copied; other aggregates fall back to the remote value.
            ConflictPolicy::PreferRemote | ConflictPolicy::KeepBoth => Ok(remote.clone()),
            ConflictPolicy::Unresolved => Err(format!("{} was changed on both sides", name)),
        }
    }

    fn merge_note(&self, ancestor: &Note, local: &Note, remote: &Note) -> Result<Note, String> {
        let mut merged = local.clone();
        merged.exists = self.field("existence", &ancestor.exists, &local.exists, &remote.exists)?;
        merged.path = self.field("path", &ancestor.path, &local.path, &remote.path)?;
        merged.title = self.field("title", &ancestor.title, &local.title, &remote.title)?;
        merged.content = self.field("content", &ancestor.content, &local.content, &remote.content)?;

        let names: BTreeSet<&String> = ancestor
            .attachment_hashes
            .keys()
            .chain(local.attachment_hashes.keys())
            .chain(remote.attachment_hashes.keys())
            .collect();
        merged.attachments.clear();
        merged.attachment_hashes.clear();
        for name in names {
            let chosen = self.field(
                &format!("attachment {}", name),
                &ancestor.attachment_hashes.get(name),
                &local.attachment_hashes.get(name),
                &remote.attachment_hashes.get(name),
            )?;
            let Some(hash) = chosen else { continue };
            let content = if local.attachment_hashes.get(name) == Some(hash) {
                local.attachments.get(name)
            } else {
                remote.attachments.get(name)
            };
            if let Some(content) = content {
                merged.attachment_hashes.insert(name.clone(), hash.clone());
                merged.attachments.insert(name.clone(), content.clone());
            }
        }
        Ok(merged)
    }
}

impl MergeStrategy<Note> for ThreeWayMergeStrategy {
    fn merge(&self, ancestor: &Note, local: &Note, remote: &Note) -> MergeOutcome<Note> {
        match self.merge_note(ancestor, local, remote) {
            Ok(merged) => MergeOutcome::Merged(merged),
            Err(reason) => MergeOutcome::NoSolution(reason),
        }
    }
}

impl MergeStrategy<Folder> for ThreeWayMergeStrategy {
    fn merge(&self, ancestor: &Folder, local: &Folder, remote: &Folder) -> MergeOutcome<Folder> {
        match self.field("existence", &ancestor.exists, &local.exists, &remote.exists) {
            Ok(exists) => MergeOutcome::Merged(Folder {
                exists,
                ..local.clone()
            }),
            Err(reason) => MergeOutcome::NoSolution(reason),
        }
    }
}

// =============================================================================
// Keep both
// =============================================================================

/// Suffix appended to the title of a note kept because of a conflict.
pub const DEFAULT_CONFLICT_TITLE_SUFFIX: &str = " (conflict)";

/// Three-way merge that never drops a local note edit.
///
/// Without conflicting fields this is a plain three-way merge. Otherwise the
/// aggregate takes the remote value for every conflicting field and the local
/// note is copied into a new note whose title carries `title_suffix`.
#[derive(Debug, Clone)]
pub struct KeepBothMergeStrategy {
    title_suffix: String,
}

impl KeepBothMergeStrategy {
    pub fn new(title_suffix: impl Into<String>) -> Self {
        Self {
            title_suffix: title_suffix.into(),
        }
    }
}

impl Default for KeepBothMergeStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_CONFLICT_TITLE_SUFFIX)
    }
}

impl MergeStrategy<Note> for KeepBothMergeStrategy {
    fn merge(&self, ancestor: &Note, local: &Note, remote: &Note) -> MergeOutcome<Note> {
        let strict = ThreeWayMergeStrategy::new(ConflictPolicy::Unresolved);
        if let Ok(merged) = strict.merge_note(ancestor, local, remote) {
            return MergeOutcome::Merged(merged);
        }

        let merged = match ThreeWayMergeStrategy::new(ConflictPolicy::PreferRemote).merge_note(ancestor, local, remote) {
            Ok(merged) => merged,
            Err(reason) => return MergeOutcome::NoSolution(reason),
        };
        if !local.exists {
            return MergeOutcome::Merged(merged);
        }

        let copy = Note {
            agg_id: Note::new_agg_id(),
            title: format!("{}{}", local.title, self.title_suffix),
            ..local.clone()
        };
        tracing::debug!(agg_id = %local.agg_id, copy = %copy.agg_id, "Keeping local note as a copy");
        MergeOutcome::MergedWithCopy { merged, copy }
    }
}

// =============================================================================
// Multiple
// =============================================================================

/// Tries strategies in order; the first merged state wins.
pub struct MultipleMergeStrategy<A> {
    strategies: Vec<Box<dyn MergeStrategy<A>>>,
}

impl<A: Aggregate> MultipleMergeStrategy<A> {
    pub fn new(strategies: Vec<Box<dyn MergeStrategy<A>>>) -> Self {
        Self { strategies }
    }
}

impl<A: Aggregate> MergeStrategy<A> for MultipleMergeStrategy<A> {
    fn merge(&self, ancestor: &A, local: &A, remote: &A) -> MergeOutcome<A> {
        let mut reasons = Vec::new();
        for strategy in &self.strategies {
            match strategy.merge(ancestor, local, remote) {
                MergeOutcome::NoSolution(reason) => reasons.push(reason),
                solved => return solved,
            }
        }
        MergeOutcome::NoSolution(reasons.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Path;

    fn note() -> Note {
        Note {
            exists: true,
            revision: 1,
            path: Path::parse("inbox"),
            title: "Title".to_string(),
            content: "Text".to_string(),
            ..Note::empty("n-00000000-0000-4000-8000-000000000000")
        }
    }

    #[test]
    fn test_equals_strategy() {
        let local = note();
        let mut remote = note();
        remote.revision = 5;
        assert!(matches!(
            EqualsMergeStrategy.merge(&note(), &local, &remote),
            MergeOutcome::Merged(_)
        ));

        remote.title = "Other".to_string();
        assert!(matches!(
            EqualsMergeStrategy.merge(&note(), &local, &remote),
            MergeOutcome::NoSolution(_)
        ));
    }

    #[test]
    fn test_three_way_takes_each_sides_changes() {
        let ancestor = note();
        let mut local = note();
        local.title = "Local title".to_string();
        let mut remote = note();
        remote.content = "Remote text".to_string();
        remote.path = Path::parse("archive");

        let MergeOutcome::Merged(merged) =
            ThreeWayMergeStrategy::new(ConflictPolicy::Unresolved).merge(&ancestor, &local, &remote)
        else {
            panic!("expected a merge");
        };

        assert_eq!(merged.title, "Local title");
        assert_eq!(merged.content, "Remote text");
        assert_eq!(merged.path, Path::parse("archive"));
    }

    #[test]
    fn test_three_way_conflict_policy() {
        let ancestor = note();
        let mut local = note();
        local.content = "A".to_string();
        let mut remote = note();
        remote.content = "B".to_string();

        let merge = |policy| ThreeWayMergeStrategy::new(policy).merge(&ancestor, &local, &remote);

        assert!(matches!(merge(ConflictPolicy::PreferLocal), MergeOutcome::Merged(n) if n.content == "A"));
        assert!(matches!(merge(ConflictPolicy::PreferRemote), MergeOutcome::Merged(n) if n.content == "B"));
        assert!(matches!(merge(ConflictPolicy::Unresolved), MergeOutcome::NoSolution(_)));
    }

    #[test]
    fn test_three_way_attachments_per_name() {
        let ancestor = note();
        let mut local = note();
        local.attachments.insert("a".to_string(), b"a".to_vec());
        local.attachment_hashes.insert("a".to_string(), Note::hash(b"a"));
        let mut remote = note();
        remote.attachments.insert("b".to_string(), b"b".to_vec());
        remote.attachment_hashes.insert("b".to_string(), Note::hash(b"b"));

        let MergeOutcome::Merged(merged) = ThreeWayMergeStrategy::default().merge(&ancestor, &local, &remote)
        else {
            panic!("expected a merge");
        };

        assert_eq!(merged.attachments.len(), 2);
        assert_eq!(merged.attachment_hashes["b"], Note::hash(b"b"));
    }

    #[test]
    fn test_keep_both_copies_local_note_on_conflict() {
        let ancestor = note();
        let mut local = note();
        local.content = "Mine".to_string();
        local.attachments.insert("a".to_string(), b"a".to_vec());
        local.attachment_hashes.insert("a".to_string(), Note::hash(b"a"));
        let mut remote = note();
        remote.content = "Theirs".to_string();

        let MergeOutcome::MergedWithCopy { merged, copy } =
            KeepBothMergeStrategy::default().merge(&ancestor, &local, &remote)
        else {
            panic!("expected a copy");
        };

        assert_eq!(merged.content, "Theirs");
        assert!(merged.attachments.contains_key("a"));
        assert_ne!(copy.agg_id, local.agg_id);
        assert_eq!(copy.content, "Mine");
        assert_eq!(copy.title, "Title (conflict)");
        assert_eq!(copy.attachments, local.attachments);
    }

    #[test]
    fn test_keep_both_without_conflict_is_three_way() {
        let ancestor = note();
        let mut local = note();
        local.title = "Local title".to_string();
        let mut remote = note();
        remote.content = "Remote text".to_string();

        let MergeOutcome::Merged(merged) = KeepBothMergeStrategy::new(" (other)").merge(&ancestor, &local, &remote)
        else {
            panic!("expected a plain merge");
        };
        assert_eq!(merged.title, "Local title");
        assert_eq!(merged.content, "Remote text");
    }

    #[test]
    fn test_multiple_uses_first_solution() {
        let strategy: MultipleMergeStrategy<Note> = MultipleMergeStrategy::new(vec![
            Box::new(EqualsMergeStrategy),
            Box::new(ThreeWayMergeStrategy::new(ConflictPolicy::PreferRemote)),
        ]);
        let mut remote = note();
        remote.title = "Remote".to_string();

        let MergeOutcome::Merged(merged) = strategy.merge(&note(), &note(), &remote) else {
            panic!("expected a merge");
        };
        assert_eq!(merged.title, "Remote");
    }
}
