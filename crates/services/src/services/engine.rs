//! The seam between the working-copy core and the version-control engine.

use std::path::{Path, PathBuf};

use git::{
    GitService, GitServiceError, ProgressMonitor, RemoteCredentials, RemoteOperationResult,
    StageSide, StatusScan,
};

use super::staging::EngineCommand;

/// Blocking engine operations the working copy relies on. Callers run them on
/// blocking workers.
pub trait VcsEngine: Send + Sync {
    fn scan_status(&self, path_filter: Option<&str>) -> Result<StatusScan, GitServiceError>;
    fn add_to_index(&self, path: &str) -> Result<(), GitServiceError>;
    fn remove_from_index(&self, path: &str) -> Result<(), GitServiceError>;
    fn reset_path(&self, path: &str) -> Result<(), GitServiceError>;
    fn checkout_path(&self, path: &str, side: Option<StageSide>) -> Result<(), GitServiceError>;
    fn take_side(&self, path: &str, side: StageSide) -> Result<(), GitServiceError>;
    fn path_exists(&self, path: &str) -> bool;

    fn execute(&self, path: &str, command: EngineCommand) -> Result<(), GitServiceError> {
        match command {
            EngineCommand::AddToIndex => self.add_to_index(path),
            EngineCommand::RemoveFromIndex => self.remove_from_index(path),
            EngineCommand::ResetPath => self.reset_path(path),
            EngineCommand::CheckoutPath => self.checkout_path(path, None),
            EngineCommand::TakeSide { side } => self.take_side(path, side),
        }
    }
}

/// A repository on disk driven through [`GitService`].
#[derive(Clone, Debug)]
pub struct LocalRepo {
    repo_path: PathBuf,
    git: GitService,
}

impl LocalRepo {
    pub fn open(repo_path: impl Into<PathBuf>) -> Result<Self, GitServiceError> {
        let repo_path = repo_path.into();
        let git = GitService::new();
        git.open_repo(&repo_path)?;
        Ok(Self { repo_path, git })
    }

    pub fn path(&self) -> &Path {
        &self.repo_path
    }

    pub fn remote_url(&self) -> Result<String, GitServiceError> {
        self.git.get_default_remote_url(&self.repo_path)
    }

    pub fn commit(&self, message: &str) -> Result<bool, GitServiceError> {
        self.git.commit(&self.repo_path, message)
    }

    pub fn fetch(
        &self,
        credentials: &RemoteCredentials,
        monitor: &dyn ProgressMonitor,
    ) -> RemoteOperationResult {
        self.git.fetch(&self.repo_path, credentials, monitor)
    }

    pub fn pull(
        &self,
        credentials: &RemoteCredentials,
        monitor: &dyn ProgressMonitor,
    ) -> RemoteOperationResult {
        self.git.pull(&self.repo_path, credentials, monitor)
    }

    pub fn push(
        &self,
        refspec: Option<&str>,
        credentials: &RemoteCredentials,
        monitor: &dyn ProgressMonitor,
    ) -> RemoteOperationResult {
        self.git
            .push(&self.repo_path, refspec, credentials, monitor)
    }
}

impl VcsEngine for LocalRepo {
    fn scan_status(&self, path_filter: Option<&str>) -> Result<StatusScan, GitServiceError> {
        self.git.scan_status(&self.repo_path, path_filter)
    }

    fn add_to_index(&self, path: &str) -> Result<(), GitServiceError> {
        self.git.add_to_index(&self.repo_path, path)
    }

    fn remove_from_index(&self, path: &str) -> Result<(), GitServiceError> {
        self.git.remove_from_index(&self.repo_path, path)
    }

    fn reset_path(&self, path: &str) -> Result<(), GitServiceError> {
        self.git.reset_path(&self.repo_path, path)
    }

    fn checkout_path(&self, path: &str, side: Option<StageSide>) -> Result<(), GitServiceError> {
        self.git.checkout_path(&self.repo_path, path, side)
    }

    fn take_side(&self, path: &str, side: StageSide) -> Result<(), GitServiceError> {
        self.git.take_side(&self.repo_path, path, side)
    }

    fn path_exists(&self, path: &str) -> bool {
        self.git.path_exists(&self.repo_path, path)
    }
}
