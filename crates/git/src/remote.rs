use std::{
    cell::{Cell, RefCell},
    fmt,
    path::{Path, PathBuf},
};

use git2::{
    AutotagOption, Cred, CredentialType, FetchOptions, PushOptions, RemoteCallbacks, Repository,
    build::RepoBuilder,
};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::{GitCli, GitCliError, GitService, GitServiceError};

const AUTH_REQUIRED: &str = "authentication is required";
const SSH_AUTH_FAILED: &str = "auth fail: ssh credentials required";
const NOT_AUTHORIZED: &str = "not authorized: the remote rejected the supplied credentials";

/// Outcome class of a remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    Ok,
    Error,
    AuthRequired,
    VcsAuthRequired,
    NotAuthorized,
    Cancel,
}

impl ResultCode {
    /// The codes that can be fixed by asking the user for credentials.
    pub fn needs_credentials(self) -> bool {
        matches!(
            self,
            ResultCode::AuthRequired | ResultCode::VcsAuthRequired | ResultCode::NotAuthorized
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
pub struct RemoteOperationResult {
    pub code: ResultCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub payload: Option<serde_json::Value>,
}

impl RemoteOperationResult {
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            payload: None,
        }
    }

    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(ResultCode::Ok, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ResultCode::Error, message)
    }

    pub fn cancel(message: impl Into<String>) -> Self {
        Self::new(ResultCode::Cancel, message)
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Build a result from an engine failure message, recognising the
    /// authentication failures that warrant a credential round.
    pub fn from_failure(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(classify_remote_failure(&message), message)
    }
}

impl From<GitServiceError> for RemoteOperationResult {
    fn from(err: GitServiceError) -> Self {
        match err {
            GitServiceError::Git(e) => Self::from_failure(e.message().to_string()),
            other => Self::from_failure(other.to_string()),
        }
    }
}

/// Map an engine failure message onto a [`ResultCode`].
pub fn classify_remote_failure(message: &str) -> ResultCode {
    let lower = message.to_ascii_lowercase();
    if lower.contains("not authorized")
        || lower.contains("authentication replays")
        || lower.contains("status code: 403")
        || lower.contains("invalid username or password")
    {
        ResultCode::NotAuthorized
    } else if lower.contains("auth fail")
        || lower.contains("userauth fail")
        || lower.contains("failed to authenticate ssh session")
    {
        ResultCode::VcsAuthRequired
    } else if lower.contains(AUTH_REQUIRED)
        || lower.contains("authentication required")
        || lower.contains("status code: 401")
    {
        ResultCode::AuthRequired
    } else {
        ResultCode::Error
    }
}

/// Credentials handed to the engine for one remote operation.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RemoteCredentials {
    pub remote_url: String,
    pub repo_path: PathBuf,
    pub username: Option<String>,
    pub secret: Option<String>,
    pub key_path: Option<PathBuf>,
    pub remember: bool,
}

impl RemoteCredentials {
    pub fn new(remote_url: impl Into<String>, repo_path: impl Into<PathBuf>) -> Self {
        Self {
            remote_url: remote_url.into(),
            repo_path: repo_path.into(),
            ..Self::default()
        }
    }

    pub fn has_secret(&self) -> bool {
        self.secret.as_deref().is_some_and(|s| !s.is_empty())
    }
}

impl fmt::Debug for RemoteCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCredentials")
            .field("remote_url", &self.remote_url)
            .field("repo_path", &self.repo_path)
            .field("username", &self.username)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("key_path", &self.key_path)
            .field("remember", &self.remember)
            .finish()
    }
}

/// Receives progress of a long-running engine task.
///
/// `update` takes the cumulative amount of work done so far, matching what
/// libgit2 reports.
pub trait ProgressMonitor: Send + Sync {
    fn begin_task(&self, label: &str, total: u64);
    fn update(&self, completed: u64);
    fn end_task(&self);
}

/// A monitor that drops every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressMonitor for NoProgress {
    fn begin_task(&self, _label: &str, _total: u64) {}
    fn update(&self, _completed: u64) {}
    fn end_task(&self) {}
}

/// Turns libgit2's callback stream into begin/update/end task calls.
struct TaskTracker<'m> {
    monitor: &'m dyn ProgressMonitor,
    current: Option<(&'static str, u64)>,
}

impl<'m> TaskTracker<'m> {
    fn new(monitor: &'m dyn ProgressMonitor) -> Self {
        Self {
            monitor,
            current: None,
        }
    }

    fn report(&mut self, label: &'static str, completed: u64, total: u64) {
        match self.current {
            Some((current, current_total)) if current == label && current_total == total => {}
            _ => {
                self.finish();
                self.monitor.begin_task(label, total);
                self.current = Some((label, total));
            }
        }
        self.monitor.update(completed);
    }

    fn finish(&mut self) {
        if self.current.take().is_some() {
            self.monitor.end_task();
        }
    }
}

/// Install credential and progress callbacks shared by fetch, push and clone.
///
/// libgit2 asks again when the answer it got was refused; the second request
/// is turned into an authentication failure instead of looping.
fn remote_callbacks<'a, 'm: 'a>(
    credentials: &'a RemoteCredentials,
    tracker: &'a RefCell<TaskTracker<'m>>,
    attempts: &'a Cell<u32>,
) -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, username_from_url, allowed| {
        let username = credentials
            .username
            .as_deref()
            .filter(|u| !u.is_empty())
            .or(username_from_url)
            .unwrap_or("git");

        if allowed.contains(CredentialType::USERNAME) {
            return Cred::username(username);
        }

        attempts.set(attempts.get() + 1);
        if attempts.get() > 1 {
            let message = if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
                NOT_AUTHORIZED
            } else {
                SSH_AUTH_FAILED
            };
            return Err(git2::Error::from_str(message));
        }
        if allowed.contains(CredentialType::SSH_KEY) {
            if let Some(key_path) = &credentials.key_path {
                return Cred::ssh_key(username, None, key_path, credentials.secret.as_deref());
            }
            if let Ok(cred) = Cred::ssh_key_from_agent(username) {
                return Ok(cred);
            }
            // Fallback to key file (~/.ssh/id_rsa)
            if let Some(home) = dirs::home_dir() {
                let key_path = home.join(".ssh").join("id_rsa");
                if key_path.exists() {
                    return Cred::ssh_key(username, None, &key_path, credentials.secret.as_deref());
                }
            }
            if !allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
                return Err(git2::Error::from_str(SSH_AUTH_FAILED));
            }
        }
        if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
            return match (credentials.username.as_deref(), credentials.secret.as_deref()) {
                (Some(user), Some(secret)) if !user.is_empty() => {
                    Cred::userpass_plaintext(user, secret)
                }
                _ => Err(git2::Error::from_str(AUTH_REQUIRED)),
            };
        }
        Err(git2::Error::from_str(AUTH_REQUIRED))
    });
    callbacks.transfer_progress(move |progress| {
        let mut tracker = tracker.borrow_mut();
        if progress.received_objects() < progress.total_objects() {
            tracker.report(
                "Receiving objects",
                progress.received_objects() as u64,
                progress.total_objects() as u64,
            );
        } else if progress.total_deltas() > 0 {
            tracker.report(
                "Resolving deltas",
                progress.indexed_deltas() as u64,
                progress.total_deltas() as u64,
            );
        } else {
            tracker.report(
                "Receiving objects",
                progress.received_objects() as u64,
                progress.total_objects() as u64,
            );
        }
        true
    });
    callbacks.push_transfer_progress(move |current, total, _bytes| {
        tracker
            .borrow_mut()
            .report("Writing objects", current as u64, total as u64);
    });
    callbacks
}

impl GitService {
    /// Fetch every configured refspec of the default remote.
    pub fn fetch(
        &self,
        repo_path: &Path,
        credentials: &RemoteCredentials,
        monitor: &dyn ProgressMonitor,
    ) -> RemoteOperationResult {
        match self.fetch_impl(repo_path, credentials, monitor) {
            Ok(updated) => fetch_result(updated),
            Err(e) => {
                tracing::error!(repo = %repo_path.display(), "Fetch failed: {e}");
                e.into()
            }
        }
    }

    /// Fetch, then merge the upstream of the current branch.
    pub fn pull(
        &self,
        repo_path: &Path,
        credentials: &RemoteCredentials,
        monitor: &dyn ProgressMonitor,
    ) -> RemoteOperationResult {
        let updated = match self.fetch_impl(repo_path, credentials, monitor) {
            Ok(updated) => updated,
            Err(e) => {
                tracing::error!(repo = %repo_path.display(), "Pull failed while fetching: {e}");
                return e.into();
            }
        };
        match self.merge_upstream(repo_path) {
            Ok(message) => RemoteOperationResult::ok(message)
                .with_payload(serde_json::json!({ "updated_refs": updated })),
            Err(GitServiceError::MergeConflicts {
                message,
                conflicted_files,
            }) => RemoteOperationResult::error(message)
                .with_payload(serde_json::json!({ "conflicted_files": conflicted_files })),
            Err(e) => {
                tracing::error!(repo = %repo_path.display(), "Pull failed while merging: {e}");
                RemoteOperationResult::error(e.to_string())
            }
        }
    }

    /// Push `refspec` (`local:remote`) to the default remote. Without a refspec
    /// the current branch is pushed to the branch of the same name.
    pub fn push(
        &self,
        repo_path: &Path,
        refspec: Option<&str>,
        credentials: &RemoteCredentials,
        monitor: &dyn ProgressMonitor,
    ) -> RemoteOperationResult {
        match self.push_impl(repo_path, refspec, credentials, monitor) {
            Ok(refspec) => RemoteOperationResult::ok(format!("Pushed {refspec}")),
            Err(e) => {
                tracing::error!(repo = %repo_path.display(), "Push failed: {e}");
                e.into()
            }
        }
    }

    /// Clone `clone_url` into `target_path`; the result message is the path of
    /// the new repository.
    pub fn clone_repository(
        &self,
        clone_url: &str,
        target_path: &Path,
        credentials: &RemoteCredentials,
        monitor: &dyn ProgressMonitor,
    ) -> RemoteOperationResult {
        match self.clone_impl(clone_url, target_path, credentials, monitor) {
            Ok(repo) => {
                let path = repo
                    .workdir()
                    .unwrap_or_else(|| repo.path())
                    .display()
                    .to_string();
                tracing::info!("Cloned repository from {clone_url} to {path}");
                RemoteOperationResult::ok(path)
            }
            Err(e) => {
                tracing::error!("Clone of {clone_url} failed: {e}");
                e.into()
            }
        }
    }

    fn fetch_impl(
        &self,
        repo_path: &Path,
        credentials: &RemoteCredentials,
        monitor: &dyn ProgressMonitor,
    ) -> Result<Vec<String>, GitServiceError> {
        let repo = self.open_repo(repo_path)?;
        let remote_name = self.default_remote_name(&repo)?;
        let mut remote = repo.find_remote(&remote_name)?;

        let tracker = RefCell::new(TaskTracker::new(monitor));
        let attempts = Cell::new(0);
        let updated = RefCell::new(Vec::new());
        let mut callbacks = remote_callbacks(credentials, &tracker, &attempts);
        callbacks.update_tips(|refname, _old, _new| {
            updated.borrow_mut().push(refname.to_string());
            true
        });

        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(callbacks);
        fetch_opts.download_tags(AutotagOption::Auto);
        let no_refspecs: &[&str] = &[];
        let outcome = remote.fetch(no_refspecs, Some(&mut fetch_opts), None);
        drop(fetch_opts);
        tracker.borrow_mut().finish();
        outcome?;

        Ok(updated.into_inner())
    }

    fn merge_upstream(&self, repo_path: &Path) -> Result<String, GitServiceError> {
        let repo = self.open_repo(repo_path)?;
        let upstream = self.upstream_of_head(&repo)?;
        let target = repo
            .revparse_single(&upstream)
            .map_err(|_| GitServiceError::BranchNotFound(upstream.clone()))?;
        let annotated = repo.find_annotated_commit(target.peel_to_commit()?.id())?;
        let (analysis, _) = repo.merge_analysis(&[&annotated])?;

        if analysis.is_up_to_date() {
            return Ok("Already up to date".to_string());
        }
        let cli = GitCli::new();
        let ff_only = analysis.is_fast_forward() || analysis.is_unborn();
        if !ff_only {
            self.ensure_cli_commit_identity(repo_path)?;
        }
        match cli.merge(repo_path, &upstream, ff_only) {
            Ok(()) if ff_only => Ok(format!("Fast-forwarded to {upstream}")),
            Ok(()) => Ok(format!("Merged {upstream}")),
            Err(GitCliError::MergeConflicts(files)) => Err(GitServiceError::MergeConflicts {
                message: format!("Merge of {upstream} stopped with conflicts in {}", files.join(", ")),
                conflicted_files: files,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// `refs/remotes/...` name of the branch HEAD tracks, falling back to the
    /// same branch name on the default remote.
    fn upstream_of_head(&self, repo: &Repository) -> Result<String, GitServiceError> {
        let branch = self.get_current_branch(repo)?;
        if let Ok(local) = repo.find_branch(&branch, git2::BranchType::Local)
            && let Ok(upstream) = local.upstream()
            && let Some(name) = upstream.get().name()
        {
            return Ok(name.to_string());
        }
        let remote = self.default_remote_name(repo)?;
        Ok(format!("refs/remotes/{remote}/{branch}"))
    }

    fn push_impl(
        &self,
        repo_path: &Path,
        refspec: Option<&str>,
        credentials: &RemoteCredentials,
        monitor: &dyn ProgressMonitor,
    ) -> Result<String, GitServiceError> {
        let repo = self.open_repo(repo_path)?;
        let remote_name = self.default_remote_name(&repo)?;
        let mut remote = repo.find_remote(&remote_name)?;
        let branch = self.get_current_branch(&repo)?;
        let refspec = match refspec {
            Some(spec) => spec.to_string(),
            None => format!("refs/heads/{branch}:refs/heads/{branch}"),
        };

        let tracker = RefCell::new(TaskTracker::new(monitor));
        let attempts = Cell::new(0);
        let rejected = RefCell::new(Vec::new());
        let mut callbacks = remote_callbacks(credentials, &tracker, &attempts);
        callbacks.push_update_reference(|refname, status| {
            if let Some(reason) = status {
                rejected.borrow_mut().push(format!("{refname}: {reason}"));
            }
            Ok(())
        });

        let mut push_opts = PushOptions::new();
        push_opts.remote_callbacks(callbacks);
        let outcome = remote.push(&[refspec.as_str()], Some(&mut push_opts));
        drop(push_opts);
        tracker.borrow_mut().finish();
        outcome?;

        let rejected = rejected.into_inner();
        if !rejected.is_empty() {
            return Err(GitServiceError::PushRejected(rejected.join("; ")));
        }

        // Track the pushed branch when it has no upstream yet.
        if refspec.trim_start_matches('+').starts_with(&format!("refs/heads/{branch}:"))
            && let Ok(mut local) = repo.find_branch(&branch, git2::BranchType::Local)
            && local.upstream().is_err()
        {
            let remote_branch = refspec
                .rsplit(':')
                .next()
                .and_then(|r| r.strip_prefix("refs/heads/"))
                .unwrap_or(&branch)
                .to_string();
            if let Err(e) = local.set_upstream(Some(&format!("{remote_name}/{remote_branch}"))) {
                tracing::warn!("Could not set upstream for {branch}: {e}");
            }
        }
        Ok(refspec)
    }

    fn clone_impl(
        &self,
        clone_url: &str,
        target_path: &Path,
        credentials: &RemoteCredentials,
        monitor: &dyn ProgressMonitor,
    ) -> Result<Repository, GitServiceError> {
        if let Some(parent) = target_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tracker = RefCell::new(TaskTracker::new(monitor));
        let attempts = Cell::new(0);
        let callbacks = remote_callbacks(credentials, &tracker, &attempts);
        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(callbacks);

        let mut builder = RepoBuilder::new();
        builder.fetch_options(fetch_opts);
        let outcome = builder.clone(clone_url, target_path);
        drop(builder);
        tracker.borrow_mut().finish();
        Ok(outcome?)
    }
}

fn fetch_result(updated: Vec<String>) -> RemoteOperationResult {
    if updated.is_empty() {
        RemoteOperationResult::ok("Nothing changed")
    } else {
        RemoteOperationResult::ok(format!("Found {} refs to process.", updated.len()))
            .with_payload(serde_json::json!({ "updated_refs": updated }))
    }
}
