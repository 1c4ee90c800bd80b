use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use git::{
    GitCli, GitService, NoProgress, ProgressMonitor, RemoteCredentials, ResultCode,
};
use tempfile::TempDir;

#[derive(Default)]
struct CountingMonitor {
    events: Mutex<Vec<String>>,
}

impl ProgressMonitor for CountingMonitor {
    fn begin_task(&self, label: &str, _total: u64) {
        self.events.lock().unwrap().push(format!("begin:{label}"));
    }
    fn update(&self, _completed: u64) {}
    fn end_task(&self) {
        self.events.lock().unwrap().push("end".to_string());
    }
}

fn write_file(base: &Path, rel: &str, content: &str) {
    fs::write(base.join(rel), content).unwrap();
}

fn configure_user(repo_path: &Path) {
    let repo = git2::Repository::open(repo_path).unwrap();
    let mut cfg = repo.config().unwrap();
    cfg.set_str("user.name", "Test User").unwrap();
    cfg.set_str("user.email", "test@example.com").unwrap();
}

fn commit_file(repo_path: &Path, rel: &str, content: &str) {
    write_file(repo_path, rel, content);
    let git = GitCli::new();
    git.git(repo_path, ["add", "--", rel]).unwrap();
    git.git(repo_path, ["commit", "-q", "-m", rel]).unwrap();
}

/// A working repository on `main` wired to an empty bare `origin`.
fn repo_with_bare_origin(td: &TempDir) -> (PathBuf, PathBuf) {
    let bare = td.path().join("origin.git");
    git2::Repository::init_opts(
        &bare,
        git2::RepositoryInitOptions::new()
            .bare(true)
            .initial_head("main"),
    )
    .unwrap();

    let work = td.path().join("work");
    GitService::new()
        .initialize_repo_with_main_branch(&work)
        .unwrap();
    configure_user(&work);
    let repo = git2::Repository::open(&work).unwrap();
    repo.remote("origin", bare.to_str().unwrap()).unwrap();
    (work, bare)
}

fn creds_for(repo: &Path, url: &Path) -> RemoteCredentials {
    RemoteCredentials::new(url.display().to_string(), repo)
}

#[test]
fn push_then_clone_round_trip() {
    let td = TempDir::new().unwrap();
    let (work, bare) = repo_with_bare_origin(&td);
    commit_file(&work, "readme.md", "hello\n");
    let s = GitService::new();

    let pushed = s.push(&work, None, &creds_for(&work, &bare), &NoProgress);
    assert_eq!(pushed.code, ResultCode::Ok, "{}", pushed.message);
    assert_eq!(pushed.message, "Pushed refs/heads/main:refs/heads/main");

    let target = td.path().join("nested").join("clone");
    let monitor = CountingMonitor::default();
    let cloned = s.clone_repository(
        bare.to_str().unwrap(),
        &target,
        &creds_for(&target, &bare),
        &monitor,
    );
    assert_eq!(cloned.code, ResultCode::Ok, "{}", cloned.message);
    assert!(Path::new(&cloned.message).join(".git").exists());
    assert_eq!(
        fs::read_to_string(target.join("readme.md")).unwrap(),
        "hello\n"
    );
    let events = monitor.events.lock().unwrap();
    let begins = events.iter().filter(|e| e.starts_with("begin:")).count();
    let ends = events.iter().filter(|e| *e == "end").count();
    assert_eq!(begins, ends);
}

#[test]
fn fetch_reports_moved_refs_and_pull_fast_forwards() {
    let td = TempDir::new().unwrap();
    let (work, bare) = repo_with_bare_origin(&td);
    commit_file(&work, "a.txt", "1\n");
    let s = GitService::new();
    assert_eq!(
        s.push(&work, None, &creds_for(&work, &bare), &NoProgress).code,
        ResultCode::Ok
    );

    let clone = td.path().join("clone");
    let cloned = s.clone_repository(
        bare.to_str().unwrap(),
        &clone,
        &creds_for(&clone, &bare),
        &NoProgress,
    );
    assert_eq!(cloned.code, ResultCode::Ok);
    configure_user(&clone);

    let idle = s.fetch(&clone, &creds_for(&clone, &bare), &NoProgress);
    assert_eq!(idle.code, ResultCode::Ok);
    assert_eq!(idle.message, "Nothing changed");

    commit_file(&work, "b.txt", "2\n");
    assert_eq!(
        s.push(&work, None, &creds_for(&work, &bare), &NoProgress).code,
        ResultCode::Ok
    );

    let pulled = s.pull(&clone, &creds_for(&clone, &bare), &NoProgress);
    assert_eq!(pulled.code, ResultCode::Ok, "{}", pulled.message);
    assert!(pulled.message.starts_with("Fast-forwarded"));
    assert_eq!(fs::read_to_string(clone.join("b.txt")).unwrap(), "2\n");

    commit_file(&work, "c.txt", "3\n");
    s.push(&work, None, &creds_for(&work, &bare), &NoProgress);
    let fetched = s.fetch(&clone, &creds_for(&clone, &bare), &NoProgress);
    assert_eq!(fetched.code, ResultCode::Ok);
    assert_eq!(fetched.message, "Found 1 refs to process.");
}

#[test]
fn rejected_push_is_an_error() {
    let td = TempDir::new().unwrap();
    let (work, bare) = repo_with_bare_origin(&td);
    commit_file(&work, "a.txt", "1\n");
    let s = GitService::new();
    assert_eq!(
        s.push(&work, None, &creds_for(&work, &bare), &NoProgress).code,
        ResultCode::Ok
    );

    let other = td.path().join("other");
    s.clone_repository(
        bare.to_str().unwrap(),
        &other,
        &creds_for(&other, &bare),
        &NoProgress,
    );
    configure_user(&other);
    commit_file(&other, "b.txt", "theirs\n");
    assert_eq!(
        s.push(&other, None, &creds_for(&other, &bare), &NoProgress).code,
        ResultCode::Ok
    );

    commit_file(&work, "c.txt", "ours\n");
    let rejected = s.push(&work, None, &creds_for(&work, &bare), &NoProgress);
    assert_eq!(rejected.code, ResultCode::Error);
}

#[test]
fn pull_with_diverged_history_reports_conflicts() {
    let td = TempDir::new().unwrap();
    let (work, bare) = repo_with_bare_origin(&td);
    commit_file(&work, "same.txt", "base\n");
    let s = GitService::new();
    s.push(&work, None, &creds_for(&work, &bare), &NoProgress);

    let other = td.path().join("other");
    s.clone_repository(
        bare.to_str().unwrap(),
        &other,
        &creds_for(&other, &bare),
        &NoProgress,
    );
    configure_user(&other);
    commit_file(&other, "same.txt", "theirs\n");
    s.push(&other, None, &creds_for(&other, &bare), &NoProgress);

    commit_file(&work, "same.txt", "ours\n");
    let pulled = s.pull(&work, &creds_for(&work, &bare), &NoProgress);
    assert_eq!(pulled.code, ResultCode::Error);
    let payload = pulled.payload.expect("conflict payload");
    assert_eq!(payload["conflicted_files"][0], "same.txt");
}

#[test]
fn missing_remote_is_a_plain_error() {
    let td = TempDir::new().unwrap();
    let (work, _bare) = repo_with_bare_origin(&td);
    let nowhere = td.path().join("does-not-exist.git");
    let repo = git2::Repository::open(&work).unwrap();
    repo.remote_set_url("origin", nowhere.to_str().unwrap())
        .unwrap();

    let result = GitService::new().fetch(&work, &creds_for(&work, &nowhere), &NoProgress);
    assert_eq!(result.code, ResultCode::Error);
}
