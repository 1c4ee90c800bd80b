use std::sync::{Mutex, PoisonError};

use git::ProgressMonitor;
use serde::Serialize;
use tokio::sync::watch;
use ts_rs::TS;

#[derive(Debug, Clone, Default, PartialEq, Serialize, TS)]
pub struct ProgressUpdate {
    pub label: String,
    /// Always within `0.0..=1.0`.
    pub fraction: f64,
}

type ProgressSink = Box<dyn Fn(&ProgressUpdate) + Send + Sync>;

/// Forwards engine progress to the presentation layer as fractions. The latest
/// update is kept in a watch channel; an optional sink sees every one.
pub struct ProgressRelay {
    tx: watch::Sender<ProgressUpdate>,
    task: Mutex<(String, u64)>,
    sink: Option<ProgressSink>,
}

impl Default for ProgressRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressRelay {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ProgressUpdate::default());
        Self {
            tx,
            task: Mutex::new((String::new(), 0)),
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: impl Fn(&ProgressUpdate) + Send + Sync + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressUpdate> {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> ProgressUpdate {
        self.tx.borrow().clone()
    }

    fn publish(&self, label: &str, fraction: f64) {
        let update = ProgressUpdate {
            label: label.to_string(),
            fraction,
        };
        if let Some(sink) = &self.sink {
            sink(&update);
        }
        self.tx.send_replace(update);
    }

    fn task(&self) -> std::sync::MutexGuard<'_, (String, u64)> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `completed / total`, clamped; an unknown (zero) total counts as no progress.
pub fn fraction(completed: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (completed as f64 / total as f64).clamp(0.0, 1.0)
}

impl ProgressMonitor for ProgressRelay {
    fn begin_task(&self, label: &str, total: u64) {
        *self.task() = (label.to_string(), total);
        self.publish(label, 0.0);
    }

    fn update(&self, completed: u64) {
        let (label, total) = self.task().clone();
        self.publish(&label, fraction(completed, total));
    }

    fn end_task(&self) {
        let label = self.task().0.clone();
        self.publish(&label, 1.0);
    }
}
