use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

use crate::ui::icons::RUNNING;

/// Spinner shown while a run is being driven.
///
/// The stage shown is whatever the last checkpoint recorded, so it lags the
/// executing handler by at most one poll. Hidden when `quiet` (scripted use).
pub struct RunProgress {
    bar: ProgressBar,
    started: Instant,
}

impl RunProgress {
    pub fn new(run_id: &str, quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new_spinner()
        };
        let spinner = ProgressStyle::with_template("{prefix:.bold.dim} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        bar.set_style(spinner);
        bar.set_prefix(format!("{}{}", RUNNING, short_id(run_id)));
        bar.enable_steady_tick(Duration::from_millis(100));
        Self {
            bar,
            started: Instant::now(),
        }
    }

    /// Refresh the message with the checkpointed stage and elapsed time.
    pub fn update(&self, stage: Option<&str>, stages_done: usize) {
        self.bar.set_message(format!(
            "{} {}",
            style(stage.unwrap_or("-")).yellow(),
            style(format!(
                "({} stage(s) done, {})",
                stages_done,
                format_elapsed(self.started.elapsed())
            ))
            .dim()
        ));
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

/// First segment of a UUID-style run id, for compact display.
pub fn short_id(run_id: &str) -> &str {
    run_id.split('-').next().unwrap_or(run_id)
}

/// `Xs` below a minute, `Xm Ys` above.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_formatting() {
        assert_eq!(format_elapsed(Duration::from_secs(5)), "5s");
        assert_eq!(format_elapsed(Duration::from_secs(125)), "2m 5s");
    }

    #[test]
    fn short_id_takes_first_segment() {
        assert_eq!(short_id("3f2a9c1e-aaaa-bbbb"), "3f2a9c1e");
        assert_eq!(short_id("plain"), "plain");
    }
}
