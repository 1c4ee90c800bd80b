//! Index and working-tree mutations go through the `git` CLI.
//!
//! The CLI refuses to clobber uncommitted tracked changes and untracked files
//! unless told to, respects sparse-checkout, and has proven more reliable than
//! libgit2 on repositories shared between WSL and Windows. libgit2 stays in
//! charge of read-only queries (status scans, conflict stages) and of
//! credentialed network operations, where its callbacks give us progress and a
//! place to hand over credentials.
use std::{
    ffi::{OsStr, OsString},
    path::Path,
    process::{Command, Stdio},
};

use thiserror::Error;
use utils::shell::resolve_git_executable;

use crate::StageSide;

#[derive(Debug, Error)]
pub enum GitCliError {
    #[error("git executable not found or not runnable")]
    NotAvailable,
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("{path} has no {side} version to check out")]
    SideMissing { path: String, side: StageSide },
    #[error("merge stopped with conflicts in {}", .0.join(", "))]
    MergeConflicts(Vec<String>),
}

#[derive(Clone, Default)]
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self {}
    }

    /// `git add -- <path>`; also stages the deletion of a path missing on disk
    /// and marks a conflicted path as resolved.
    pub fn add_path(&self, repo_path: &Path, path: &str) -> Result<(), GitCliError> {
        self.git(repo_path, ["add", "--", path])?;
        Ok(())
    }

    /// Remove a path from the index only, leaving the working tree alone.
    pub fn remove_cached(&self, repo_path: &Path, path: &str) -> Result<(), GitCliError> {
        self.git(
            repo_path,
            ["rm", "--cached", "-q", "--ignore-unmatch", "--", path],
        )?;
        Ok(())
    }

    /// Remove a path from both the index and the working tree.
    pub fn remove_path(&self, repo_path: &Path, path: &str) -> Result<(), GitCliError> {
        self.git(repo_path, ["rm", "-q", "--ignore-unmatch", "--", path])?;
        Ok(())
    }

    /// Restore the index entry of `path` from HEAD. On an unborn branch there is
    /// nothing to restore from, so the entry is dropped from the index instead.
    pub fn reset_path(&self, repo_path: &Path, path: &str, unborn: bool) -> Result<(), GitCliError> {
        if unborn {
            return self.remove_cached(repo_path, path);
        }
        self.git(repo_path, ["reset", "-q", "HEAD", "--", path])?;
        Ok(())
    }

    /// `git checkout [--ours|--theirs] -- <path>`
    pub fn checkout_path(
        &self,
        repo_path: &Path,
        path: &str,
        side: Option<StageSide>,
    ) -> Result<(), GitCliError> {
        let mut args: Vec<OsString> = vec!["checkout".into()];
        if let Some(side) = side {
            args.push(side.checkout_flag().into());
        }
        args.push("--".into());
        args.push(path.into());
        match self.git(repo_path, args) {
            Ok(_) => Ok(()),
            Err(GitCliError::CommandFailed(msg)) => match side {
                Some(side) if msg.contains("does not have") => Err(GitCliError::SideMissing {
                    path: path.to_string(),
                    side,
                }),
                _ => Err(GitCliError::CommandFailed(msg)),
            },
            Err(e) => Err(e),
        }
    }

    /// Commit staged changes with the given message.
    pub fn commit(&self, repo_path: &Path, message: &str) -> Result<(), GitCliError> {
        self.git(repo_path, ["commit", "-q", "-m", message])?;
        Ok(())
    }

    /// Return true if there are staged changes (index differs from HEAD)
    pub fn has_staged_changes(&self, repo_path: &Path) -> Result<bool, GitCliError> {
        // `git diff --cached --quiet` returns exit code 1 if there are differences
        let out = Command::new(resolve_git_executable().ok_or(GitCliError::NotAvailable)?)
            .arg("-C")
            .arg(repo_path)
            .args(["diff", "--cached", "--quiet"])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| GitCliError::CommandFailed(e.to_string()))?;
        match out.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(GitCliError::CommandFailed(
                String::from_utf8_lossy(&out.stderr).trim().to_string(),
            )),
        }
    }

    /// Merge `target` into the current branch. A stop on conflicts is reported
    /// as [`GitCliError::MergeConflicts`] and the merge is left in progress so
    /// the conflicts show up in the next status scan.
    pub fn merge(&self, repo_path: &Path, target: &str, ff_only: bool) -> Result<(), GitCliError> {
        let mut args = vec!["merge", "--no-edit"];
        if ff_only {
            args.push("--ff-only");
        }
        args.push(target);
        match self.git(repo_path, args) {
            Ok(_) => Ok(()),
            Err(GitCliError::CommandFailed(msg)) => {
                let conflicted = self.get_conflicted_files(repo_path).unwrap_or_default();
                if conflicted.is_empty() {
                    Err(GitCliError::CommandFailed(msg))
                } else {
                    Err(GitCliError::MergeConflicts(conflicted))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Return true if a merge is in progress (MERGE_HEAD exists).
    pub fn is_merge_in_progress(&self, repo_path: &Path) -> Result<bool, GitCliError> {
        match self.git(repo_path, ["rev-parse", "-q", "--verify", "MERGE_HEAD"]) {
            Ok(_) => Ok(true),
            Err(GitCliError::CommandFailed(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// List files currently in a conflicted (unmerged) state.
    pub fn get_conflicted_files(&self, repo_path: &Path) -> Result<Vec<String>, GitCliError> {
        // `--diff-filter=U` lists paths with unresolved conflicts
        let out = self.git(
            repo_path,
            [
                "-c",
                "core.quotepath=false",
                "diff",
                "--name-only",
                "--diff-filter=U",
            ],
        )?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Run `git -C <repo_path> <args...>` and return stdout on success.
    ///
    /// Prefer a dedicated helper over calling this directly so command choices
    /// and parsing stay in this module.
    pub fn git<I, S>(&self, repo_path: &Path, args: I) -> Result<String, GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let out = self.git_impl(repo_path, args)?;
        Ok(String::from_utf8_lossy(&out).to_string())
    }
}

// Private methods
impl GitCli {
    fn git_impl<I, S>(&self, repo_path: &Path, args: I) -> Result<Vec<u8>, GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let git = resolve_git_executable().ok_or(GitCliError::NotAvailable)?;
        let mut cmd = Command::new(&git);
        cmd.arg("-C").arg(repo_path);
        // Never let a CLI call block on an interactive credential prompt.
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        for a in args {
            cmd.arg(a);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::trace!(repo = ?repo_path, "Running git command: {:?}", cmd);

        let out = cmd
            .output()
            .map_err(|e| GitCliError::CommandFailed(e.to_string()))?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
            let combined = match (stdout.is_empty(), stderr.is_empty()) {
                (true, true) => "Command failed with no output".to_string(),
                (false, false) => format!("{stderr}\n{stdout}"),
                (false, true) => stdout,
                (true, false) => stderr,
            };
            return Err(GitCliError::CommandFailed(combined));
        }
        Ok(out.stdout)
    }
}
