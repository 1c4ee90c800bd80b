use std::{
    fs,
    path::{Path, PathBuf},
};

use git::{ConflictStages, FactKind, GitCli, GitService, StageSide, StatusScan};
use tempfile::TempDir;

fn write_file(base: &Path, rel: &str, content: &str) {
    let path = base.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

fn configure_user(repo_path: &Path) {
    let repo = git2::Repository::open(repo_path).unwrap();
    let mut cfg = repo.config().unwrap();
    cfg.set_str("user.name", "Test User").unwrap();
    cfg.set_str("user.email", "test@example.com").unwrap();
}

fn init_repo_main(root: &TempDir) -> PathBuf {
    let path = root.path().join("repo");
    GitService::new()
        .initialize_repo_with_main_branch(&path)
        .unwrap();
    configure_user(&path);
    path
}

fn commit_all(repo_path: &Path, message: &str) {
    let git = GitCli::new();
    git.git(repo_path, ["add", "-A"]).unwrap();
    git.git(repo_path, ["commit", "-q", "-m", message]).unwrap();
}

fn kinds_for(scan: &StatusScan, path: &str) -> Vec<FactKind> {
    let mut kinds: Vec<FactKind> = scan
        .facts
        .iter()
        .filter(|f| f.path == path)
        .map(|f| f.kind)
        .collect();
    kinds.sort();
    kinds
}

#[test]
fn scan_reports_each_kind_of_change() {
    let td = TempDir::new().unwrap();
    let repo = init_repo_main(&td);
    write_file(&repo, "tracked.txt", "one\n");
    write_file(&repo, "gone.txt", "bye\n");
    write_file(&repo, "staged.txt", "v1\n");
    commit_all(&repo, "base");

    write_file(&repo, "tracked.txt", "two\n");
    fs::remove_file(repo.join("gone.txt")).unwrap();
    write_file(&repo, "staged.txt", "v2\n");
    write_file(&repo, "fresh.txt", "new\n");
    write_file(&repo, "added.txt", "added\n");
    write_file(&repo, "newdir/inner.txt", "x\n");
    let git = GitCli::new();
    git.git(&repo, ["add", "--", "staged.txt", "added.txt"]).unwrap();

    let scan = GitService::new().scan_status(&repo, None).unwrap();

    assert_eq!(kinds_for(&scan, "tracked.txt"), vec![FactKind::Modified]);
    assert_eq!(kinds_for(&scan, "gone.txt"), vec![FactKind::Missing]);
    assert_eq!(kinds_for(&scan, "staged.txt"), vec![FactKind::Uncommitted]);
    assert_eq!(kinds_for(&scan, "fresh.txt"), vec![FactKind::Untracked]);
    assert_eq!(
        kinds_for(&scan, "added.txt"),
        vec![FactKind::Added, FactKind::Uncommitted]
    );
    assert_eq!(kinds_for(&scan, "newdir"), vec![FactKind::UntrackedFolder]);
    assert!(kinds_for(&scan, "newdir/inner.txt").is_empty());
    assert!(scan.conflicts.is_empty());
}

#[test]
fn scoped_scan_only_reports_the_requested_path() {
    let td = TempDir::new().unwrap();
    let repo = init_repo_main(&td);
    write_file(&repo, "a.txt", "a\n");
    write_file(&repo, "b.txt", "b\n");

    let scan = GitService::new().scan_status(&repo, Some("b.txt")).unwrap();
    assert_eq!(scan.path_filter.as_deref(), Some("b.txt"));
    assert_eq!(scan.facts.len(), 1);
    assert_eq!(scan.facts[0].path, "b.txt");
    assert_eq!(scan.facts[0].kind, FactKind::Untracked);
}

#[test]
fn scoped_scan_of_a_folder_includes_its_files() {
    let td = TempDir::new().unwrap();
    let repo = init_repo_main(&td);
    write_file(&repo, "top.txt", "t\n");
    write_file(&repo, "newdir/one.txt", "1\n");
    write_file(&repo, "newdir/two.txt", "2\n");
    let s = GitService::new();

    let scan = s.scan_status(&repo, Some("newdir")).unwrap();
    assert_eq!(kinds_for(&scan, "newdir"), vec![FactKind::UntrackedFolder]);
    assert!(kinds_for(&scan, "top.txt").is_empty());

    s.add_to_index(&repo, "newdir").unwrap();
    let scan = s.scan_status(&repo, Some("newdir")).unwrap();
    assert!(kinds_for(&scan, "newdir").is_empty());
    for file in ["newdir/one.txt", "newdir/two.txt"] {
        assert_eq!(
            kinds_for(&scan, file),
            vec![FactKind::Added, FactKind::Uncommitted]
        );
    }
    assert!(kinds_for(&scan, "top.txt").is_empty());
}

#[test]
fn index_mutations_move_paths_between_states() {
    let td = TempDir::new().unwrap();
    let repo = init_repo_main(&td);
    write_file(&repo, "file.txt", "base\n");
    write_file(&repo, "doomed.txt", "x\n");
    commit_all(&repo, "base");
    let s = GitService::new();

    write_file(&repo, "file.txt", "changed\n");
    s.add_to_index(&repo, "file.txt").unwrap();
    let scan = s.scan_status(&repo, Some("file.txt")).unwrap();
    assert_eq!(kinds_for(&scan, "file.txt"), vec![FactKind::Uncommitted]);

    s.reset_path(&repo, "file.txt").unwrap();
    let scan = s.scan_status(&repo, Some("file.txt")).unwrap();
    assert_eq!(kinds_for(&scan, "file.txt"), vec![FactKind::Modified]);

    s.checkout_path(&repo, "file.txt", None).unwrap();
    assert!(s.scan_status(&repo, Some("file.txt")).unwrap().is_empty());
    assert_eq!(fs::read_to_string(repo.join("file.txt")).unwrap(), "base\n");

    fs::remove_file(repo.join("doomed.txt")).unwrap();
    assert!(!s.path_exists(&repo, "doomed.txt"));
    s.remove_from_index(&repo, "doomed.txt").unwrap();
    let scan = s.scan_status(&repo, Some("doomed.txt")).unwrap();
    assert_eq!(
        kinds_for(&scan, "doomed.txt"),
        vec![FactKind::Removed, FactKind::Uncommitted]
    );
}

#[test]
fn reset_on_unborn_branch_unstages_new_file() {
    let td = TempDir::new().unwrap();
    let repo = td.path().join("empty");
    git2::Repository::init(&repo).unwrap();
    write_file(&repo, "first.txt", "hello\n");
    let s = GitService::new();

    s.add_to_index(&repo, "first.txt").unwrap();
    let scan = s.scan_status(&repo, None).unwrap();
    assert_eq!(
        kinds_for(&scan, "first.txt"),
        vec![FactKind::Added, FactKind::Uncommitted]
    );

    s.reset_path(&repo, "first.txt").unwrap();
    let scan = s.scan_status(&repo, None).unwrap();
    assert_eq!(kinds_for(&scan, "first.txt"), vec![FactKind::Untracked]);
}

fn conflicting_repo(td: &TempDir) -> PathBuf {
    let repo = init_repo_main(td);
    write_file(&repo, "shared.txt", "base\n");
    commit_all(&repo, "base");
    let git = GitCli::new();
    git.git(&repo, ["checkout", "-q", "-b", "feature"]).unwrap();
    write_file(&repo, "shared.txt", "feature\n");
    write_file(&repo, "theirs-only.txt", "from feature\n");
    commit_all(&repo, "feature change");
    git.git(&repo, ["checkout", "-q", "main"]).unwrap();
    write_file(&repo, "shared.txt", "main\n");
    write_file(&repo, "theirs-only.txt", "from main\n");
    commit_all(&repo, "main change");
    let err = GitCli::new().merge(&repo, "feature", false).unwrap_err();
    assert!(matches!(err, git::GitCliError::MergeConflicts(ref files) if files.len() == 2));
    assert!(git.is_merge_in_progress(&repo).unwrap());
    repo
}

#[test]
fn conflicts_report_their_stages() {
    let td = TempDir::new().unwrap();
    let repo = conflicting_repo(&td);

    let scan = GitService::new().scan_status(&repo, None).unwrap();
    assert_eq!(kinds_for(&scan, "shared.txt"), vec![FactKind::Conflicting]);
    assert_eq!(
        scan.conflicts.get("shared.txt"),
        Some(&ConflictStages::new(true, true, true))
    );
    // both sides created it independently, no common ancestor
    assert_eq!(
        scan.conflicts.get("theirs-only.txt"),
        Some(&ConflictStages::new(false, true, true))
    );
}

#[test]
fn take_side_resolves_with_the_chosen_content() {
    let td = TempDir::new().unwrap();
    let repo = conflicting_repo(&td);
    let s = GitService::new();

    s.take_side(&repo, "shared.txt", StageSide::Theirs).unwrap();
    assert_eq!(
        fs::read_to_string(repo.join("shared.txt")).unwrap(),
        "feature\n"
    );
    let scan = s.scan_status(&repo, Some("shared.txt")).unwrap();
    assert_eq!(kinds_for(&scan, "shared.txt"), vec![FactKind::Uncommitted]);
    assert!(scan.conflicts.is_empty());

    s.take_side(&repo, "theirs-only.txt", StageSide::Ours).unwrap();
    s.add_to_index(&repo, "theirs-only.txt").unwrap();
    assert!(s.commit(&repo, "merge feature").unwrap());
    assert!(!s.commit(&repo, "nothing left").unwrap());
}
