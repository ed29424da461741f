//! Terminal progress and logging for the `nyc311` binary.
//!
//! [`init_logger`] routes `log` output through `indicatif-log-bridge` so log
//! lines and progress bars share the terminal without tearing.

use std::sync::Arc;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use nyc311_source::progress::ProgressCallback;

/// An `indicatif` bar behind [`ProgressCallback`].
///
/// Starts as a spinner; a stage that announces its total switches it to
/// `bar_style`.
pub struct IndicatifProgress {
    bar: ProgressBar,
    bar_style: ProgressStyle,
}

fn spinner(multi: &MultiProgress, template: &str, message: &str) -> ProgressBar {
    let bar = multi.add(ProgressBar::new_spinner());
    bar.enable_steady_tick(Duration::from_millis(100));
    bar.set_style(
        ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.set_message(message.to_string());
    bar
}

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-")
}

impl IndicatifProgress {
    /// A spinner for extract loads, where the row total is not known ahead.
    #[must_use]
    pub fn load_spinner(multi: &MultiProgress, message: &str) -> Arc<dyn ProgressCallback> {
        let bar = spinner(multi, "{spinner:.cyan} {msg} {human_pos} rows [{elapsed}]", message);
        Arc::new(Self {
            bar,
            bar_style: bar_style("  {msg} {wide_bar:.cyan/dim} {pos}/{len} rows [{eta}]"),
        })
    }

    /// A document bar for window syncs; becomes a bar once the window's row
    /// count is read.
    #[must_use]
    pub fn sync_bar(multi: &MultiProgress, message: &str) -> Arc<dyn ProgressCallback> {
        let bar = spinner(multi, "{spinner:.yellow} {msg}", message);
        Arc::new(Self {
            bar,
            bar_style: bar_style(
                "  {msg} {wide_bar:.yellow/dim} {pos}/{len} docs {percent}% [{eta}]",
            ),
        })
    }

    /// A bar over the stages of a multi-step command.
    #[must_use]
    pub fn steps_bar(multi: &MultiProgress, message: &str, total: u64) -> Arc<dyn ProgressCallback> {
        let style = bar_style("{msg} {wide_bar:.green/dim} {pos}/{len} [{elapsed_precise}]");
        let bar = multi.add(ProgressBar::new(total));
        bar.set_style(style.clone());
        bar.set_message(message.to_string());
        Arc::new(Self {
            bar,
            bar_style: style,
        })
    }
}

impl ProgressCallback for IndicatifProgress {
    fn begin(&self, label: &str, total: Option<u64>) {
        self.bar.set_message(label.to_string());
        if let Some(total) = total {
            self.bar.set_length(total);
            self.bar.set_position(0);
            self.bar.set_style(self.bar_style.clone());
        }
    }

    fn note(&self, label: &str) {
        self.bar.set_message(label.to_string());
    }

    fn advance(&self, applied: u64) {
        self.bar.inc(applied);
    }

    fn end(&self, summary: Option<&str>) {
        match summary {
            Some(summary) => self.bar.finish_with_message(summary.to_string()),
            None => self.bar.finish_and_clear(),
        }
    }
}

/// Installs `pretty_env_logger` (filtered by `RUST_LOG`) behind
/// `indicatif-log-bridge`.
///
/// Every progress bar must be added to the returned [`MultiProgress`].
#[must_use]
pub fn init_logger() -> MultiProgress {
    let multi = MultiProgress::new();

    let logger = pretty_env_logger::formatted_builder()
        .parse_env("RUST_LOG")
        .build();
    let level = logger.filter();

    // A logger may already be installed in tests.
    indicatif_log_bridge::LogWrapper::new(multi.clone(), logger)
        .try_init()
        .ok();

    log::set_max_level(level);

    multi
}
