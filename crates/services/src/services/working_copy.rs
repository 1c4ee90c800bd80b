//! In-memory view of a working copy's changed paths, kept in step with the
//! engine while transitions and rescans race each other.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use git::{GitServiceError, StatusScan};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use ts_rs::TS;

use super::{
    engine::VcsEngine,
    staging::{self, EngineCommand, StagingAction, TransitionError, WorkingState},
    status::{PathStatus, TagSet, classify_map},
};

#[derive(Debug, Error)]
pub enum WorkingCopyError {
    #[error(transparent)]
    Engine(#[from] GitServiceError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("engine worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkingCopyEvent {
    Refreshed {
        changed: usize,
        total: usize,
    },
    PathChanged {
        status: PathStatus,
    },
    PathRemoved {
        path: String,
    },
    TransitionFailed {
        path: String,
        action: StagingAction,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub path: String,
    pub command: Option<EngineCommand>,
    /// Status afterwards; `None` once the path has no differences left.
    pub status: Option<PathStatus>,
    /// The status was read back from the engine rather than predicted.
    pub resynthesized: bool,
}

pub type BatchOutcome = Vec<(String, Result<TransitionOutcome, WorkingCopyError>)>;

#[derive(Debug, Default, Clone, Copy)]
struct Mark {
    /// Bumped on every write to the path, from any source.
    revision: u64,
    /// Epoch of the last write made by a transition.
    touched: u64,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, PathStatus>,
    marks: HashMap<String, Mark>,
}

impl State {
    fn revision(&self, path: &str) -> u64 {
        self.marks.get(path).map_or(0, |m| m.revision)
    }

    fn touched(&self, path: &str) -> u64 {
        self.marks.get(path).map_or(0, |m| m.touched)
    }

    fn touch(&mut self, path: &str, epoch: u64) {
        self.marks.entry(path.to_string()).or_default().touched = epoch;
    }

    /// Returns whether anything changed.
    fn put(&mut self, status: PathStatus) -> bool {
        if status.tags.is_empty() {
            return self.remove(&status.path);
        }
        if self.entries.get(&status.path) == Some(&status) {
            return false;
        }
        self.marks.entry(status.path.clone()).or_default().revision += 1;
        self.entries.insert(status.path.clone(), status);
        true
    }

    fn remove(&mut self, path: &str) -> bool {
        if self.entries.remove(path).is_none() {
            return false;
        }
        self.marks.entry(path.to_string()).or_default().revision += 1;
        true
    }

    /// Forget marks of paths that are no longer listed, unless a rescan that
    /// started before `floor` still has to skip them or `busy` holds the path.
    fn prune(&mut self, floor: Option<u64>, busy: impl Fn(&str) -> bool) {
        let Self { entries, marks } = self;
        marks.retain(|path, mark| {
            entries.contains_key(path)
                || busy(path)
                || floor.is_some_and(|start| mark.touched > start)
        });
    }
}

pub struct WorkingCopy {
    engine: Arc<dyn VcsEngine>,
    state: RwLock<State>,
    epoch: AtomicU64,
    /// Start epochs of rescans still in flight.
    rescans: Mutex<BTreeMap<u64, usize>>,
    path_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<WorkingCopyEvent>>>,
    rescan_after_transition: bool,
}

impl WorkingCopy {
    pub fn new(engine: Arc<dyn VcsEngine>) -> Self {
        Self {
            engine,
            state: RwLock::new(State::default()),
            epoch: AtomicU64::new(0),
            rescans: Mutex::new(BTreeMap::new()),
            path_locks: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            rescan_after_transition: false,
        }
    }

    /// Always read a path back from the engine after a transition instead of
    /// trusting the predicted tags.
    pub fn with_rescan_after_transition(mut self, enabled: bool) -> Self {
        self.rescan_after_transition = enabled;
        self
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<WorkingCopyEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn snapshot(&self) -> Vec<PathStatus> {
        self.read_state().entries.values().cloned().collect()
    }

    pub fn get(&self, path: &str) -> Option<PathStatus> {
        self.read_state().entries.get(path).cloned()
    }

    /// Rescan the whole working copy and fold the result in. Paths written by a
    /// transition after the scan started keep the transition's result.
    pub async fn refresh(&self) -> Result<usize, WorkingCopyError> {
        let start = self.rescan_started();
        let result = self
            .full_scan()
            .await
            .map(|scan| self.fold_scan(start, &scan));
        self.rescan_finished(start);
        self.prune_marks();
        result
    }

    async fn full_scan(&self) -> Result<StatusScan, WorkingCopyError> {
        let engine = self.engine.clone();
        Ok(tokio::task::spawn_blocking(move || engine.scan_status(None)).await??)
    }

    fn fold_scan(&self, start: u64, scan: &StatusScan) -> usize {
        let fresh = classify_map(scan);

        let mut events = Vec::new();
        let mut skipped = 0usize;
        let total = {
            let mut state = self.write_state();
            let paths: BTreeSet<String> = state
                .entries
                .keys()
                .chain(fresh.keys())
                .cloned()
                .collect();
            for path in paths {
                if state.touched(&path) > start {
                    skipped += 1;
                    continue;
                }
                match fresh.get(&path) {
                    Some(status) => {
                        if state.put(status.clone()) {
                            events.push(WorkingCopyEvent::PathChanged {
                                status: status.clone(),
                            });
                        }
                    }
                    None => {
                        if state.remove(&path) {
                            events.push(WorkingCopyEvent::PathRemoved { path });
                        }
                    }
                }
            }
            state.entries.len()
        };

        if skipped > 0 {
            tracing::warn!(skipped, "Kept paths written by transitions during the rescan");
        }
        let changed = events.len();
        tracing::debug!(changed, total, "Working copy refreshed");
        for event in events {
            self.emit(event);
        }
        self.emit(WorkingCopyEvent::Refreshed { changed, total });
        changed
    }

    /// Apply `action` to `path`: plan from the current tags, run the one engine
    /// command, then record the new tags. On failure the tags are left alone.
    #[tracing::instrument(skip(self))]
    pub async fn transition(
        &self,
        path: &str,
        action: StagingAction,
    ) -> Result<TransitionOutcome, WorkingCopyError> {
        let lock = self.path_lock(path);
        let result = {
            let _guard = lock.lock().await;
            self.transition_locked(path, action).await
        };
        self.release_path_lock(path, lock);
        self.prune_marks();
        result
    }

    async fn transition_locked(
        &self,
        path: &str,
        action: StagingAction,
    ) -> Result<TransitionOutcome, WorkingCopyError> {
        let (current, revision) = {
            let state = self.read_state();
            let current = state
                .entries
                .get(path)
                .cloned()
                .unwrap_or_else(|| PathStatus::new(path, TagSet::new()));
            (current, state.revision(path))
        };

        let on_disk = if current.is_conflicted() {
            let engine = self.engine.clone();
            let owned = path.to_string();
            match tokio::task::spawn_blocking(move || engine.path_exists(&owned)).await {
                Ok(exists) => exists,
                Err(e) => return Err(self.fail(path, action, e.into())),
            }
        } else {
            true
        };

        let plan = match staging::apply(&current, action, on_disk) {
            Ok(plan) => plan,
            Err(e) => return Err(self.fail(path, action, e.into())),
        };
        let Some(command) = plan.command else {
            return Ok(TransitionOutcome {
                path: path.to_string(),
                command: None,
                status: self.get(path),
                resynthesized: false,
            });
        };

        tracing::info!(?command, "Running engine command");
        let engine = self.engine.clone();
        let owned = path.to_string();
        let failure = match tokio::task::spawn_blocking(move || engine.execute(&owned, command))
            .await
        {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(WorkingCopyError::Engine(e)),
            Err(e) => Some(WorkingCopyError::Join(e)),
        };
        if let Some(err) = failure {
            return Err(self.fail(path, action, err));
        }

        if !(plan.resynthesize || self.rescan_after_transition) {
            let written = {
                let mut state = self.write_state();
                if state.revision(path) == revision {
                    let status = PathStatus::new(path, plan.next.clone());
                    state.touch(path, self.next_epoch());
                    state.put(status.clone());
                    Some(status)
                } else {
                    None
                }
            };
            match written {
                Some(status) => {
                    self.emit(WorkingCopyEvent::PathChanged {
                        status: status.clone(),
                    });
                    return Ok(TransitionOutcome {
                        path: path.to_string(),
                        command: Some(command),
                        status: Some(status),
                        resynthesized: false,
                    });
                }
                None => {
                    tracing::warn!("Path was rescanned during the transition, reading it back");
                }
            }
        }

        // The command already ran; a failed read-back leaves the old tags.
        let status = match self.resynthesize(path).await {
            Ok(status) => status,
            Err(e) => return Err(self.fail(path, action, e)),
        };
        Ok(TransitionOutcome {
            path: path.to_string(),
            command: Some(command),
            status,
            resynthesized: true,
        })
    }

    /// Stage every path that has unstaged changes, one at a time.
    pub async fn stage_all(&self) -> BatchOutcome {
        self.apply_to_all(StagingAction::Stage, |state| {
            state.is_unstaged() || state == WorkingState::UntrackedFolder
        })
        .await
    }

    /// Unstage every path that has staged changes, one at a time.
    pub async fn unstage_all(&self) -> BatchOutcome {
        self.apply_to_all(StagingAction::Unstage, WorkingState::is_staged)
            .await
    }

    async fn apply_to_all(
        &self,
        action: StagingAction,
        wanted: impl Fn(WorkingState) -> bool,
    ) -> BatchOutcome {
        let targets: Vec<String> = self
            .snapshot()
            .into_iter()
            .filter(|status| WorkingState::derive(status).is_ok_and(&wanted))
            .map(|status| status.path)
            .collect();

        let mut outcomes = Vec::with_capacity(targets.len());
        for path in targets {
            let outcome = self.transition(&path, action).await;
            outcomes.push((path, outcome));
        }
        outcomes
    }

    /// Replace whatever is known about `path` (and anything below it) with a
    /// fresh scoped scan.
    async fn resynthesize(&self, path: &str) -> Result<Option<PathStatus>, WorkingCopyError> {
        let engine = self.engine.clone();
        let owned = path.to_string();
        let scan = tokio::task::spawn_blocking(move || engine.scan_status(Some(&owned))).await??;
        let fresh = classify_map(&scan);

        let mut events = Vec::new();
        let status = {
            let mut state = self.write_state();
            let epoch = self.next_epoch();
            let prefix = format!("{path}/");
            let stale: Vec<String> = state
                .entries
                .keys()
                .filter(|k| (k.as_str() == path || k.starts_with(&prefix)) && !fresh.contains_key(*k))
                .cloned()
                .collect();
            state.touch(path, epoch);
            for key in stale {
                state.touch(&key, epoch);
                if state.remove(&key) {
                    events.push(WorkingCopyEvent::PathRemoved { path: key });
                }
            }
            for (key, status) in fresh {
                state.touch(&key, epoch);
                if state.put(status.clone()) {
                    events.push(WorkingCopyEvent::PathChanged { status });
                }
            }
            state.entries.get(path).cloned()
        };
        for event in events {
            self.emit(event);
        }
        Ok(status)
    }

    /// Report a failed transition to subscribers and hand the error back.
    fn fail(&self, path: &str, action: StagingAction, err: WorkingCopyError) -> WorkingCopyError {
        let message = err.to_string();
        tracing::warn!(%path, ?action, "Transition failed: {message}");
        self.emit(WorkingCopyEvent::TransitionFailed {
            path: path.to_string(),
            action,
            message,
        });
        err
    }

    fn emit(&self, event: WorkingCopyEvent) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn path_lock(&self, path: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .path_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the lock for `path` unless another transition is holding or
    /// waiting for it.
    fn release_path_lock(&self, path: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self
            .path_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(path);
        }
    }

    /// Take a start epoch and register it before any mark can be pruned
    /// against it.
    fn rescan_started(&self) -> u64 {
        let mut rescans = self.rescans.lock().unwrap_or_else(PoisonError::into_inner);
        let start = self.next_epoch();
        *rescans.entry(start).or_default() += 1;
        start
    }

    fn rescan_finished(&self, start: u64) {
        let mut rescans = self.rescans.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = rescans.get_mut(&start) {
            *count -= 1;
            if *count == 0 {
                rescans.remove(&start);
            }
        }
    }

    fn prune_marks(&self) {
        let floor = self
            .rescans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .next()
            .copied();
        let mut state = self.write_state();
        let locks = self
            .path_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.prune(floor, |path| locks.contains_key(path));
    }

    fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn read_state(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
