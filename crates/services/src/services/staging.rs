//! The staging state machine: what a user action does to a path, both in the
//! engine and in the path's tag-set.

use git::StageSide;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;

use super::status::{ConflictKind, PathStatus, StatusTag, TagSet, tag_set};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case", tag = "type", content = "side")]
pub enum StagingAction {
    Stage,
    Unstage,
    Resolve,
    Toggle,
    /// Throw away unstaged changes.
    Revert,
    /// Settle a conflict by taking one side.
    ResolveWith(StageSide),
}

/// The single engine call a transition issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EngineCommand {
    AddToIndex,
    RemoveFromIndex,
    ResetPath,
    CheckoutPath,
    /// Check out one side of a conflict and stage it.
    TakeSide { side: StageSide },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("{path} carries a conflict sub-kind without the Conflict tag")]
    InconsistentTags { path: String },
}

/// The state a tag-set puts a path in, checked in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkingState {
    Conflicted(Option<ConflictKind>),
    Missing,
    Untracked,
    Modified,
    StagedRemoval,
    StagedAddition,
    StagedModification,
    StagedOther,
    UntrackedFolder,
    Clean,
    Unclassified,
}

impl WorkingState {
    pub fn derive(status: &PathStatus) -> Result<Self, TransitionError> {
        let tags = &status.tags;
        if status.conflict.is_some() && !tags.contains(&StatusTag::Conflict) {
            return Err(TransitionError::InconsistentTags {
                path: status.path.clone(),
            });
        }

        let state = if tags.contains(&StatusTag::Conflict) {
            WorkingState::Conflicted(status.conflict)
        } else if tags.contains(&StatusTag::Missing) {
            WorkingState::Missing
        } else if tags.contains(&StatusTag::Untracked) {
            WorkingState::Untracked
        } else if tags.contains(&StatusTag::Modified) {
            WorkingState::Modified
        } else if *tags == tag_set([StatusTag::Removed, StatusTag::Uncommitted]) {
            WorkingState::StagedRemoval
        } else if *tags
            == tag_set([StatusTag::Added, StatusTag::Changed, StatusTag::Uncommitted])
        {
            WorkingState::StagedAddition
        } else if *tags == tag_set([StatusTag::Uncommitted]) {
            WorkingState::StagedModification
        } else if tags.contains(&StatusTag::Added) || tags.contains(&StatusTag::Uncommitted) {
            WorkingState::StagedOther
        } else if tags.contains(&StatusTag::UntrackedFolder) {
            WorkingState::UntrackedFolder
        } else if tags.is_empty() {
            WorkingState::Clean
        } else {
            WorkingState::Unclassified
        };
        Ok(state)
    }

    pub fn is_unstaged(self) -> bool {
        matches!(
            self,
            WorkingState::Missing | WorkingState::Untracked | WorkingState::Modified
        )
    }

    pub fn is_staged(self) -> bool {
        matches!(
            self,
            WorkingState::StagedRemoval
                | WorkingState::StagedAddition
                | WorkingState::StagedModification
                | WorkingState::StagedOther
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub command: Option<EngineCommand>,
    pub next: TagSet,
    /// The optimistic `next` cannot be trusted; read the path back from the
    /// engine once the command has run.
    pub resynthesize: bool,
}

impl Plan {
    fn noop(tags: &TagSet) -> Self {
        Self {
            command: None,
            next: tags.clone(),
            resynthesize: false,
        }
    }

    fn run(command: EngineCommand, next: TagSet) -> Self {
        let resynthesize = next.is_empty();
        Self {
            command: Some(command),
            next,
            resynthesize,
        }
    }

    fn run_and_rescan(command: EngineCommand, next: TagSet) -> Self {
        Self {
            command: Some(command),
            next,
            resynthesize: true,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.command.is_none()
    }
}

/// Transition table. Any action outside its row leaves the tags untouched and
/// issues nothing.
pub fn plan(state: WorkingState, tags: &TagSet, action: StagingAction, on_disk: bool) -> Plan {
    use StagingAction::*;
    use WorkingState::*;

    let action = match action {
        Toggle if state.is_unstaged() => Stage,
        Toggle if state.is_staged() => Unstage,
        Toggle if matches!(state, Conflicted(_)) => Resolve,
        Toggle if state == UntrackedFolder => Stage,
        other => other,
    };

    match (state, action) {
        (Missing, Stage) => {
            let mut next = tags.clone();
            next.remove(&StatusTag::Missing);
            next.insert(StatusTag::Removed);
            // The index entry is gone; read back what the engine reports so
            // the path lands in a state that can be unstaged.
            Plan::run_and_rescan(EngineCommand::RemoveFromIndex, next)
        }
        (Untracked, Stage) => Plan::run(
            EngineCommand::AddToIndex,
            tag_set([StatusTag::Added, StatusTag::Changed, StatusTag::Uncommitted]),
        ),
        (Modified, Stage) => {
            let mut next = tags.clone();
            next.remove(&StatusTag::Modified);
            Plan::run(EngineCommand::AddToIndex, next)
        }
        // The folder entry turns into one entry per file inside it.
        (UntrackedFolder, Stage) => Plan::run_and_rescan(EngineCommand::AddToIndex, TagSet::new()),
        (StagedRemoval, Unstage) => {
            Plan::run(EngineCommand::ResetPath, tag_set([StatusTag::Missing]))
        }
        (StagedAddition, Unstage) => {
            Plan::run(EngineCommand::ResetPath, tag_set([StatusTag::Untracked]))
        }
        (StagedModification, Unstage) => {
            Plan::run(EngineCommand::ResetPath, tag_set([StatusTag::Modified]))
        }
        (Conflicted(Some(kind)), Resolve) if kind.involves_deletion() => {
            if on_disk {
                Plan::run(
                    EngineCommand::AddToIndex,
                    tag_set([StatusTag::Changed, StatusTag::Uncommitted]),
                )
            } else {
                Plan::run_and_rescan(EngineCommand::RemoveFromIndex, tag_set([StatusTag::Removed]))
            }
        }
        (Conflicted(Some(_)), Resolve) => Plan::run(
            EngineCommand::AddToIndex,
            tag_set([StatusTag::Changed, StatusTag::Uncommitted]),
        ),
        (Conflicted(_), ResolveWith(side)) => Plan::run_and_rescan(
            EngineCommand::TakeSide { side },
            tag_set([StatusTag::Changed, StatusTag::Uncommitted]),
        ),
        (Modified | Missing, Revert) => {
            let mut next = tags.clone();
            next.remove(&StatusTag::Modified);
            next.remove(&StatusTag::Missing);
            Plan::run_and_rescan(EngineCommand::CheckoutPath, next)
        }
        _ => Plan::noop(tags),
    }
}

/// Derive the state of `status` and plan `action` against it.
pub fn apply(
    status: &PathStatus,
    action: StagingAction,
    on_disk: bool,
) -> Result<Plan, TransitionError> {
    let state = WorkingState::derive(status)?;
    let plan = plan(state, &status.tags, action, on_disk);
    tracing::debug!(
        path = %status.path,
        ?state,
        ?action,
        command = ?plan.command,
        next = ?plan.next,
        "Planned staging transition"
    );
    Ok(plan)
}
