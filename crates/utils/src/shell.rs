//! Executable resolution for the engine adapter.

use std::{
    collections::HashSet,
    env::{join_paths, split_paths},
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::Mutex,
};

/// Environment variable that pins the `git` executable used by the engine adapter.
pub const GIT_EXECUTABLE_ENV: &str = "STAGEHAND_GIT";

static RESOLVED: Mutex<Vec<(String, PathBuf)>> = Mutex::new(Vec::new());

/// Resolve an executable by name, falling back to a refreshed PATH if needed.
///
/// The search order is:
/// 1. Absolute paths to an existing file.
/// 2. The current process PATH via `which`.
/// 3. The PATH reported by the user's login shell (Unix only), after which the
///    lookup is retried against the merged PATH.
///
/// Successful lookups are memoized for the lifetime of the process.
pub fn resolve_executable_path_blocking(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    if let Ok(cache) = RESOLVED.lock()
        && let Some((_, found)) = cache.iter().find(|(name, _)| name == executable)
    {
        return Some(found.clone());
    }

    let found = lookup(executable)?;
    if let Ok(mut cache) = RESOLVED.lock() {
        cache.push((executable.to_string(), found.clone()));
    }
    Some(found)
}

/// Resolve the `git` executable, honouring [`GIT_EXECUTABLE_ENV`].
pub fn resolve_git_executable() -> Option<PathBuf> {
    if let Some(pinned) = std::env::var_os(GIT_EXECUTABLE_ENV) {
        let pinned = PathBuf::from(pinned);
        if pinned.is_file() {
            return Some(pinned);
        }
        tracing::warn!(path = %pinned.display(), "{GIT_EXECUTABLE_ENV} does not point to a file");
    }
    resolve_executable_path_blocking("git")
}

fn lookup(executable: &str) -> Option<PathBuf> {
    let path = Path::new(executable);
    if path.is_absolute() && path.is_file() {
        return Some(path.to_path_buf());
    }

    if let Ok(found) = which::which(executable) {
        return Some(found);
    }

    let existing = std::env::var_os("PATH").unwrap_or_default();
    let refreshed = login_shell_path()?;
    let merged = merge_paths(&existing, &refreshed);
    if merged == existing {
        return None;
    }
    tracing::debug!(?existing, ?merged, "Retrying lookup of {executable} with login shell PATH");
    let cwd = std::env::current_dir().ok()?;
    which::which_in(executable, Some(&merged), cwd).ok()
}

/// Merge two PATH strings into a single, de-duplicated PATH.
///
/// Keeps the order of entries from `primary` and appends only unseen entries
/// from `secondary`. Empty components are dropped.
pub fn merge_paths(primary: impl AsRef<OsStr>, secondary: impl AsRef<OsStr>) -> OsString {
    let mut seen = HashSet::<PathBuf>::new();
    let mut merged = Vec::<PathBuf>::new();

    for p in split_paths(primary.as_ref()).chain(split_paths(secondary.as_ref())) {
        if !p.as_os_str().is_empty() && seen.insert(p.clone()) {
            merged.push(p);
        }
    }

    join_paths(merged).unwrap_or_default()
}

#[cfg(not(windows))]
fn login_shell_path() -> Option<OsString> {
    let shell = std::env::var_os("SHELL")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute() && p.is_file())
        .unwrap_or_else(|| PathBuf::from("/bin/sh"));

    let output = Command::new(&shell)
        .arg("-l")
        .arg("-c")
        .arg("printf '%s' \"$PATH\"")
        .env("TERM", "dumb")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8(output.stdout).ok()?;
    let path = path.trim();
    if path.is_empty() {
        None
    } else {
        Some(OsString::from(path))
    }
}

#[cfg(windows)]
fn login_shell_path() -> Option<OsString> {
    None
}
