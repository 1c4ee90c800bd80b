use std::path::Path;

use git2::{Error as GitError, ErrorCode, Repository};
use thiserror::Error;

mod cli;
mod remote;
mod status;

pub use cli::{GitCli, GitCliError};
pub use remote::{
    NoProgress, ProgressMonitor, RemoteCredentials, RemoteOperationResult, ResultCode,
    classify_remote_failure,
};
pub use status::{ConflictStages, FactKind, StageSide, StatusFact, StatusScan};

#[derive(Debug, Error)]
pub enum GitServiceError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    GitCLI(#[from] GitCliError),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Invalid repository: {0}")]
    InvalidRepository(String),
    #[error("Branch not found: {0}")]
    BranchNotFound(String),
    #[error("Merge conflicts: {message}")]
    MergeConflicts {
        message: String,
        conflicted_files: Vec<String>,
    },
    #[error("Push rejected: {0}")]
    PushRejected(String),
}

/// Stateless access to repositories on disk. Every call takes the repository
/// path, so one instance can serve any number of working copies.
#[derive(Clone, Debug, Default)]
pub struct GitService {}

impl GitService {
    pub fn new() -> Self {
        Self {}
    }

    /// Open the repository
    pub fn open_repo(&self, repo_path: &Path) -> Result<Repository, GitServiceError> {
        Repository::open(repo_path).map_err(GitServiceError::from)
    }

    /// Ensure local (repo-scoped) identity exists for CLI commits.
    /// Sets user.name/email only if missing in the repo config.
    fn ensure_cli_commit_identity(&self, repo_path: &Path) -> Result<(), GitServiceError> {
        let repo = self.open_repo(repo_path)?;
        let cfg = repo.config()?;
        let has_name = cfg.get_string("user.name").is_ok();
        let has_email = cfg.get_string("user.email").is_ok();
        if !(has_name && has_email) {
            let mut cfg = repo.config()?;
            cfg.set_str("user.name", "Stagehand")?;
            cfg.set_str("user.email", "stagehand@localhost")?;
        }
        Ok(())
    }

    /// Get a signature for libgit2 commits with a safe fallback identity.
    fn signature_with_fallback<'a>(
        &self,
        repo: &'a Repository,
    ) -> Result<git2::Signature<'a>, GitServiceError> {
        match repo.signature() {
            Ok(sig) => Ok(sig),
            Err(_) => git2::Signature::now("Stagehand", "stagehand@localhost")
                .map_err(GitServiceError::from),
        }
    }

    /// Name of the remote network operations talk to: `remote.pushDefault`,
    /// then `origin`, then the first configured remote.
    fn default_remote_name(&self, repo: &Repository) -> Result<String, GitServiceError> {
        let remotes = repo.remotes()?;
        let names: Vec<&str> = remotes.iter().flatten().collect();

        if let Ok(config) = repo.config()
            && let Ok(default_name) = config.get_string("remote.pushDefault")
            && names.contains(&default_name.as_str())
        {
            return Ok(default_name);
        }
        if names.contains(&"origin") {
            return Ok("origin".to_string());
        }
        names
            .first()
            .map(|name| name.to_string())
            .ok_or_else(|| GitServiceError::InvalidRepository("No remotes configured".to_string()))
    }

    /// URL of the default remote, used to key saved credentials.
    pub fn get_default_remote_url(&self, repo_path: &Path) -> Result<String, GitServiceError> {
        let repo = self.open_repo(repo_path)?;
        let name = self.default_remote_name(&repo)?;
        let remote = repo.find_remote(&name)?;
        remote.url().map(str::to_string).ok_or_else(|| {
            GitServiceError::InvalidRepository(format!("Remote '{name}' has no URL"))
        })
    }

    /// Short name of the branch HEAD points at, including an unborn branch.
    pub fn get_current_branch(&self, repo: &Repository) -> Result<String, GitServiceError> {
        let head = repo.find_reference("HEAD")?;
        let target = match head.symbolic_target() {
            Some(target) => target.to_string(),
            None => {
                return Err(GitServiceError::InvalidRepository(
                    "HEAD is detached".to_string(),
                ));
            }
        };
        target
            .strip_prefix("refs/heads/")
            .map(str::to_string)
            .ok_or_else(|| GitServiceError::BranchNotFound(target.clone()))
    }

    fn is_head_unborn(&self, repo: &Repository) -> Result<bool, GitServiceError> {
        match repo.head() {
            Ok(_) => Ok(false),
            Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => {
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Initialize a new git repository with a main branch and initial commit
    pub fn initialize_repo_with_main_branch(
        &self,
        repo_path: &Path,
    ) -> Result<(), GitServiceError> {
        if !repo_path.exists() {
            std::fs::create_dir_all(repo_path)?;
        }

        let repo = Repository::init_opts(
            repo_path,
            git2::RepositoryInitOptions::new()
                .initial_head("main")
                .mkdir(true),
        )?;

        self.create_initial_commit(&repo)?;
        Ok(())
    }

    pub fn create_initial_commit(&self, repo: &Repository) -> Result<(), GitServiceError> {
        let signature = self.signature_with_fallback(repo)?;

        let tree_id = {
            let tree_builder = repo.treebuilder(None)?;
            tree_builder.write()?
        };
        let tree = repo.find_tree(tree_id)?;

        repo.commit(
            Some("refs/heads/main"),
            &signature,
            &signature,
            "Initial commit",
            &tree,
            &[],
        )?;
        repo.set_head("refs/heads/main")?;
        Ok(())
    }

    /// Commit what is staged. Returns `false` when the index matches HEAD.
    pub fn commit(&self, repo_path: &Path, message: &str) -> Result<bool, GitServiceError> {
        let git = GitCli::new();
        if !git.has_staged_changes(repo_path)? {
            tracing::debug!("No staged changes to commit");
            return Ok(false);
        }
        // Only ensure identity once we know we're about to commit
        self.ensure_cli_commit_identity(repo_path)?;
        git.commit(repo_path, message)?;
        Ok(true)
    }

    /// Stage the working-tree content of `path` (or its deletion).
    pub fn add_to_index(&self, repo_path: &Path, path: &str) -> Result<(), GitServiceError> {
        GitCli::new().add_path(repo_path, path)?;
        Ok(())
    }

    /// Drop `path` from the index, keeping whatever is on disk.
    pub fn remove_from_index(&self, repo_path: &Path, path: &str) -> Result<(), GitServiceError> {
        GitCli::new().remove_cached(repo_path, path)?;
        Ok(())
    }

    /// Make the index entry of `path` match HEAD again.
    pub fn reset_path(&self, repo_path: &Path, path: &str) -> Result<(), GitServiceError> {
        let repo = self.open_repo(repo_path)?;
        let unborn = self.is_head_unborn(&repo)?;
        GitCli::new().reset_path(repo_path, path, unborn)?;
        Ok(())
    }

    /// Overwrite the working-tree copy of `path` from the index, or from one
    /// side of a conflict.
    pub fn checkout_path(
        &self,
        repo_path: &Path,
        path: &str,
        side: Option<StageSide>,
    ) -> Result<(), GitServiceError> {
        GitCli::new().checkout_path(repo_path, path, side)?;
        Ok(())
    }

    /// Resolve a conflict by taking one side wholesale and staging the result.
    /// When the chosen side deleted the path, the deletion is staged.
    pub fn take_side(
        &self,
        repo_path: &Path,
        path: &str,
        side: StageSide,
    ) -> Result<(), GitServiceError> {
        let git = GitCli::new();
        match git.checkout_path(repo_path, path, Some(side)) {
            Ok(()) => git.add_path(repo_path, path)?,
            Err(GitCliError::SideMissing { .. }) => {
                tracing::debug!(%path, %side, "Side deleted the path; staging the deletion");
                git.remove_path(repo_path, path)?
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}
