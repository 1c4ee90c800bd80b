//! Classification of raw status facts into per-path tag-sets.

use std::collections::{BTreeMap, BTreeSet};

use git::{ConflictStages, FactKind, StatusScan};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusTag {
    Added,
    Modified,
    Missing,
    Removed,
    Changed,
    Uncommitted,
    Untracked,
    UntrackedFolder,
    Conflict,
    ConflictBothDeleted,
    ConflictAddedByUs,
    ConflictAddedByThem,
    ConflictDeletedByUs,
    ConflictDeletedByThem,
    ConflictBothAdded,
    ConflictBothModified,
}

/// Membership and size matter, order does not.
pub type TagSet = BTreeSet<StatusTag>;

pub fn tag_set<I: IntoIterator<Item = StatusTag>>(tags: I) -> TagSet {
    tags.into_iter().collect()
}

/// How the two sides of a merge disagree about a conflicted path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictKind {
    BothDeleted,
    AddedByUs,
    AddedByThem,
    DeletedByUs,
    DeletedByThem,
    BothAdded,
    BothModified,
}

impl ConflictKind {
    /// Sub-kind implied by which index stages exist for the path.
    pub fn from_stages(stages: ConflictStages) -> Option<Self> {
        match (stages.ancestor, stages.ours, stages.theirs) {
            (true, false, false) => Some(ConflictKind::BothDeleted),
            (false, true, false) => Some(ConflictKind::AddedByUs),
            (false, false, true) => Some(ConflictKind::AddedByThem),
            (true, true, false) => Some(ConflictKind::DeletedByThem),
            (true, false, true) => Some(ConflictKind::DeletedByUs),
            (false, true, true) => Some(ConflictKind::BothAdded),
            (true, true, true) => Some(ConflictKind::BothModified),
            (false, false, false) => None,
        }
    }

    /// At least one side deleted the path.
    pub fn involves_deletion(self) -> bool {
        matches!(
            self,
            ConflictKind::BothDeleted | ConflictKind::DeletedByUs | ConflictKind::DeletedByThem
        )
    }
}

impl From<ConflictKind> for StatusTag {
    fn from(kind: ConflictKind) -> Self {
        match kind {
            ConflictKind::BothDeleted => StatusTag::ConflictBothDeleted,
            ConflictKind::AddedByUs => StatusTag::ConflictAddedByUs,
            ConflictKind::AddedByThem => StatusTag::ConflictAddedByThem,
            ConflictKind::DeletedByUs => StatusTag::ConflictDeletedByUs,
            ConflictKind::DeletedByThem => StatusTag::ConflictDeletedByThem,
            ConflictKind::BothAdded => StatusTag::ConflictBothAdded,
            ConflictKind::BothModified => StatusTag::ConflictBothModified,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct PathStatus {
    pub path: String,
    pub tags: TagSet,
    pub conflict: Option<ConflictKind>,
}

impl PathStatus {
    pub fn new(path: impl Into<String>, tags: TagSet) -> Self {
        Self {
            path: path.into(),
            tags,
            conflict: None,
        }
    }

    pub fn with_conflict(mut self, conflict: Option<ConflictKind>) -> Self {
        self.conflict = conflict;
        self
    }

    pub fn is_staged(&self) -> bool {
        self.tags.contains(&StatusTag::Added) || self.tags.contains(&StatusTag::Uncommitted)
    }

    pub fn is_unstaged(&self) -> bool {
        self.tags.contains(&StatusTag::Modified)
            || self.tags.contains(&StatusTag::Missing)
            || self.tags.contains(&StatusTag::Untracked)
    }

    pub fn is_conflicted(&self) -> bool {
        self.tags.contains(&StatusTag::Conflict)
    }

    /// Tags plus the conflict sub-kind rendered as its tag, for display.
    pub fn display_tags(&self) -> Vec<StatusTag> {
        let mut tags: Vec<StatusTag> = self.tags.iter().copied().collect();
        if let Some(kind) = self.conflict {
            tags.push(kind.into());
        }
        tags
    }
}

/// Tags contributed by a single fact.
pub fn tags_for_fact(kind: FactKind) -> &'static [StatusTag] {
    match kind {
        FactKind::Added => &[StatusTag::Added, StatusTag::Changed],
        FactKind::Modified => &[StatusTag::Modified],
        FactKind::Missing => &[StatusTag::Missing],
        FactKind::Removed => &[StatusTag::Removed],
        FactKind::Uncommitted => &[StatusTag::Uncommitted],
        FactKind::Untracked => &[StatusTag::Untracked],
        FactKind::UntrackedFolder => &[StatusTag::UntrackedFolder],
        FactKind::Conflicting => &[StatusTag::Conflict],
    }
}

/// Aggregate the facts of one scan into a status per path.
pub fn classify_map(scan: &StatusScan) -> BTreeMap<String, PathStatus> {
    let mut statuses: BTreeMap<String, PathStatus> = BTreeMap::new();
    for fact in &scan.facts {
        let status = statuses
            .entry(fact.path.clone())
            .or_insert_with(|| PathStatus::new(fact.path.clone(), TagSet::new()));
        status.tags.extend(tags_for_fact(fact.kind).iter().copied());
    }
    for status in statuses.values_mut() {
        if status.is_conflicted() {
            status.conflict = scan
                .conflicts
                .get(&status.path)
                .copied()
                .and_then(ConflictKind::from_stages);
        }
    }
    statuses
}

/// Same as [`classify_map`], sorted by path.
pub fn classify(scan: &StatusScan) -> Vec<PathStatus> {
    classify_map(scan).into_values().collect()
}
