use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use services::services::progress::ProgressUpdate;
use tokio::{sync::watch, task::JoinHandle};

/// Terminal bar that follows the fractions a remote operation reports.
pub struct ProgressView {
    bar: ProgressBar,
    follower: JoinHandle<()>,
}

impl ProgressView {
    pub fn follow(mut updates: watch::Receiver<ProgressUpdate>, title: &str) -> Self {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} {prefix} {msg:<20} [{bar:30.cyan/blue}] {percent:>3}%",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
        );
        bar.set_prefix(title.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));

        let follower = {
            let bar = bar.clone();
            tokio::spawn(async move {
                while updates.changed().await.is_ok() {
                    let update = updates.borrow_and_update().clone();
                    bar.set_message(update.label);
                    bar.set_position(percent(update.fraction));
                }
            })
        };
        Self { bar, follower }
    }

    /// Handle for hiding the bar while something else draws on the terminal.
    pub fn bar(&self) -> ProgressBar {
        self.bar.clone()
    }

    pub fn finish(self) {
        self.follower.abort();
        self.bar.finish_and_clear();
    }
}

fn percent(fraction: f64) -> u64 {
    (fraction.clamp(0.0, 1.0) * 100.0).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fractions_map_to_whole_percent() {
        assert_eq!(percent(0.0), 0);
        assert_eq!(percent(0.255), 26);
        assert_eq!(percent(1.0), 100);
        assert_eq!(percent(3.0), 100);
    }
}
