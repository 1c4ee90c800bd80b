use std::{collections::BTreeMap, fmt, path::Path};

use git2::{Repository, Status, StatusOptions};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::{GitService, GitServiceError};

/// One raw observation about how a path differs from HEAD and the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FactKind {
    Added,
    Modified,
    Missing,
    Removed,
    Uncommitted,
    Untracked,
    UntrackedFolder,
    Conflicting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct StatusFact {
    pub path: String,
    pub kind: FactKind,
}

impl StatusFact {
    pub fn new(path: impl Into<String>, kind: FactKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Which index stages exist for a conflicted path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct ConflictStages {
    pub ancestor: bool,
    pub ours: bool,
    pub theirs: bool,
}

impl ConflictStages {
    pub fn new(ancestor: bool, ours: bool, theirs: bool) -> Self {
        Self {
            ancestor,
            ours,
            theirs,
        }
    }
}

/// Everything one status pass observed, optionally limited to a single path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct StatusScan {
    pub facts: Vec<StatusFact>,
    pub conflicts: BTreeMap<String, ConflictStages>,
    pub path_filter: Option<String>,
}

impl StatusScan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scoped(path: impl Into<String>) -> Self {
        Self {
            path_filter: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn with_fact(mut self, path: impl Into<String>, kind: FactKind) -> Self {
        self.facts.push(StatusFact::new(path, kind));
        self
    }

    pub fn with_conflict(mut self, path: impl Into<String>, stages: ConflictStages) -> Self {
        let path = path.into();
        self.facts
            .push(StatusFact::new(path.clone(), FactKind::Conflicting));
        self.conflicts.insert(path, stages);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }
}

/// Side of a conflict to take when resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(rename_all = "snake_case")]
pub enum StageSide {
    Ours,
    Theirs,
}

impl StageSide {
    pub(crate) fn checkout_flag(self) -> &'static str {
        match self {
            StageSide::Ours => "--ours",
            StageSide::Theirs => "--theirs",
        }
    }
}

impl fmt::Display for StageSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageSide::Ours => f.write_str("ours"),
            StageSide::Theirs => f.write_str("theirs"),
        }
    }
}

/// Facts reported for a single libgit2 status entry.
///
/// A conflicted entry yields only `Conflicting`; the conflict stages carry the
/// rest of the story.
pub(crate) fn facts_for_status(status: Status, is_dir: bool) -> Vec<FactKind> {
    if status.is_conflicted() {
        return vec![FactKind::Conflicting];
    }
    let mut facts = Vec::new();
    if status.is_index_new() {
        facts.push(FactKind::Added);
        facts.push(FactKind::Uncommitted);
    }
    if status.is_index_modified() || status.is_index_renamed() || status.is_index_typechange() {
        facts.push(FactKind::Uncommitted);
    }
    if status.is_index_deleted() {
        facts.push(FactKind::Removed);
        facts.push(FactKind::Uncommitted);
    }
    if status.is_wt_modified() || status.is_wt_typechange() || status.is_wt_renamed() {
        facts.push(FactKind::Modified);
    }
    if status.is_wt_deleted() {
        facts.push(FactKind::Missing);
    }
    if status.is_wt_new() {
        facts.push(if is_dir {
            FactKind::UntrackedFolder
        } else {
            FactKind::Untracked
        });
    }
    facts.dedup();
    facts
}

impl GitService {
    /// Read the working copy status with libgit2.
    ///
    /// Untracked directories are reported once as `UntrackedFolder` rather than
    /// file by file. `path_filter` names one repository-relative path; when it
    /// is a directory, everything below it is included too.
    pub fn scan_status(
        &self,
        repo_path: &Path,
        path_filter: Option<&str>,
    ) -> Result<StatusScan, GitServiceError> {
        let repo = self.open_repo(repo_path)?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(false)
            .include_ignored(false)
            .renames_head_to_index(false)
            .include_unmodified(false);
        if let Some(filter) = path_filter {
            let is_dir = repo_path.join(filter).is_dir();
            opts.pathspec(filter).disable_pathspec_match(!is_dir);
        }

        let mut scan = StatusScan {
            path_filter: path_filter.map(str::to_string),
            ..StatusScan::default()
        };
        let statuses = repo.statuses(Some(&mut opts))?;
        for entry in statuses.iter() {
            let raw = String::from_utf8_lossy(entry.path_bytes()).to_string();
            let is_dir = raw.ends_with('/');
            let path = raw.trim_end_matches('/').to_string();
            if path_filter.is_some_and(|filter| !within_filter(&path, filter)) {
                continue;
            }
            for kind in facts_for_status(entry.status(), is_dir) {
                scan.facts.push(StatusFact::new(path.clone(), kind));
            }
        }

        scan.conflicts = conflict_stages(&repo, path_filter)?;
        tracing::debug!(
            repo = %repo_path.display(),
            filter = ?path_filter,
            facts = scan.facts.len(),
            conflicts = scan.conflicts.len(),
            "Status scan finished"
        );
        Ok(scan)
    }

    /// True when `path` exists in the working tree (a dangling symlink counts).
    pub fn path_exists(&self, repo_path: &Path, path: &str) -> bool {
        repo_path.join(path).symlink_metadata().is_ok()
    }
}

fn within_filter(path: &str, filter: &str) -> bool {
    let filter = filter.trim_end_matches('/');
    path == filter
        || path
            .strip_prefix(filter)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn conflict_stages(
    repo: &Repository,
    path_filter: Option<&str>,
) -> Result<BTreeMap<String, ConflictStages>, GitServiceError> {
    let index = repo.index()?;
    let mut stages = BTreeMap::new();
    if !index.has_conflicts() {
        return Ok(stages);
    }
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        let Some(entry) = conflict
            .our
            .as_ref()
            .or(conflict.their.as_ref())
            .or(conflict.ancestor.as_ref())
        else {
            continue;
        };
        let path = String::from_utf8_lossy(&entry.path).to_string();
        if path_filter.is_some_and(|filter| !within_filter(&path, filter)) {
            continue;
        }
        stages.insert(
            path,
            ConflictStages::new(
                conflict.ancestor.is_some(),
                conflict.our.is_some(),
                conflict.their.is_some(),
            ),
        );
    }
    Ok(stages)
}
