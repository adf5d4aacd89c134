//! Single-line progress output, overwritten every iteration

use super::metrics::LossBundle;

#[cfg(feature = "progress-bar")]
use indicatif::{ProgressBar, ProgressStyle};

pub fn format_progress(iteration: usize, total: usize, losses: &LossBundle) -> String {
    format!(
        "iteration:[{:06}/{:06}], L_rec={:.2}, L_sim={:.2}, L_adv_C={:.2}, L_adv_E={:.2}",
        iteration, total, losses.l_rec, losses.l_sim, losses.l_adv_c, losses.l_adv_e
    )
}

/// Reports one line per iteration.
///
/// With the `progress-bar` feature the line is a spinner message. When
/// indicatif would draw nothing (stderr is not a terminal, e.g. a log file)
/// the line is written to stderr behind a `\r` instead, as it is without the
/// feature.
pub struct ProgressReporter {
    total: usize,
    #[cfg(feature = "progress-bar")]
    bar: ProgressBar,
    // Write `\r`-prefixed lines to stderr
    plain: bool,
}

impl ProgressReporter {
    #[cfg(feature = "progress-bar")]
    pub fn new(total: usize) -> Self {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}") {
            bar.set_style(style);
        }
        Self::from_bar(total, bar)
    }

    #[cfg(not(feature = "progress-bar"))]
    pub fn new(total: usize) -> Self {
        Self { total, plain: true }
    }

    #[cfg(feature = "progress-bar")]
    fn from_bar(total: usize, bar: ProgressBar) -> Self {
        let plain = bar.is_hidden();
        Self { total, bar, plain }
    }

    /// Reporter that draws nothing, for tests and library callers
    #[cfg(feature = "progress-bar")]
    pub fn hidden(total: usize) -> Self {
        Self {
            total,
            bar: ProgressBar::hidden(),
            plain: false,
        }
    }

    #[cfg(not(feature = "progress-bar"))]
    pub fn hidden(total: usize) -> Self {
        Self { total, plain: false }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn update(&self, iteration: usize, losses: &LossBundle) {
        let line = format_progress(iteration, self.total, losses);
        if self.plain {
            use std::io::Write;
            eprint!("\r{}", line);
            let _ = std::io::stderr().flush();
            return;
        }
        #[cfg(feature = "progress-bar")]
        {
            self.bar.set_message(line);
            self.bar.tick();
        }
    }

    /// Leave the last line on screen and move to a fresh one
    pub fn finish(&self) {
        if self.plain {
            eprintln!();
            return;
        }
        #[cfg(feature = "progress-bar")]
        self.bar.abandon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_matches_log_line() {
        let losses = LossBundle {
            l_rec: 1.234,
            l_sim: 0.006,
            l_adv_c: 1.386,
            l_adv_e: 0.693,
        };
        assert_eq!(
            format_progress(42, 100000, &losses),
            "iteration:[000042/100000], L_rec=1.23, L_sim=0.01, L_adv_C=1.39, L_adv_E=0.69"
        );
    }

    #[test]
    fn test_hidden_reporter_accepts_updates() {
        let reporter = ProgressReporter::hidden(10);
        let losses = LossBundle {
            l_rec: 0.0,
            l_sim: 0.0,
            l_adv_c: 0.0,
            l_adv_e: 0.0,
        };
        reporter.update(3, &losses);
        reporter.finish();
        assert_eq!(reporter.total(), 10);
        assert!(!reporter.plain);
    }

    #[cfg(feature = "progress-bar")]
    #[test]
    fn test_undrawable_bar_falls_back_to_plain_lines() {
        // What indicatif gives for a spinner on a non-terminal stderr
        let reporter = ProgressReporter::from_bar(4, ProgressBar::hidden());
        assert!(reporter.plain);
        let losses = LossBundle {
            l_rec: 0.5,
            l_sim: 0.0,
            l_adv_c: 1.0,
            l_adv_e: 0.7,
        };
        reporter.update(1, &losses);
        reporter.finish();
    }

    #[cfg(not(feature = "progress-bar"))]
    #[test]
    fn test_plain_lines_without_bar() {
        assert!(ProgressReporter::new(4).plain);
    }
}
