use std::fmt;
use std::io::IsTerminal;
use std::sync::Mutex;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use crate::store::types::ImageRecord;

/// Where the engine currently is in a reconciliation run. Phases execute
/// in a fixed order: removals, then uploads, then metadata updates.
/// `Complete` and `Canceled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Deleting,
    Uploading,
    Updating,
    Complete,
    Canceled,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Deleting => "deleting",
            SyncPhase::Uploading => "uploading",
            SyncPhase::Updating => "updating",
            SyncPhase::Complete => "complete",
            SyncPhase::Canceled => "canceled",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observer for reconciliation progress.
///
/// The engine reports through this trait only; it never touches the
/// terminal itself. Implementations must tolerate being called from an
/// async context and must not block for long.
pub trait ProgressSink: Send + Sync {
    /// One engine step finished (or a phase boundary was crossed).
    /// `percent` is pre-computed from `step`/`total` with 100 reserved for
    /// the terminal update.
    fn on_progress(&self, step: usize, total: usize, percent: u8, message: &str, phase: SyncPhase);

    /// Cumulative byte progress, fired after each binary transfer
    /// completes. `uploaded` and `total` span the whole batch;
    /// `bytes_per_sec` is the rate of the transfer that just finished.
    fn on_file_progress(&self, uploaded: u64, total: u64, bytes_per_sec: f64);

    /// The run finished without cancellation. `success` is false when any
    /// per-item failure was recorded; `new_images` holds the records the
    /// run created or updated, in applied order.
    fn on_complete(&self, success: bool, new_images: &[ImageRecord]);

    /// The run stopped at a cancellation point. Terminal: a run reports
    /// either this or `on_complete`, never both.
    fn on_cancel(&self);
}

/// Create a progress bar with a consistent template.
///
/// Returns `ProgressBar::hidden()` when the user passed `--no-progress-bar`
/// or stdout is not a TTY (piped output, cron jobs), so redraws never
/// corrupt captured output.
fn create_progress_bar(no_progress_bar: bool, total: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )
        .expect("valid template")
        .progress_chars("=> "),
    );
    pb
}

/// Terminal-facing sink: drives an indicatif bar when stdout is a TTY,
/// falls back to debug-level log lines otherwise.
pub struct ConsoleProgress {
    bar: Mutex<ProgressBar>,
    enabled: bool,
}

impl ConsoleProgress {
    pub fn new(no_progress_bar: bool) -> Self {
        Self {
            bar: Mutex::new(ProgressBar::hidden()),
            enabled: !no_progress_bar && std::io::stdout().is_terminal(),
        }
    }
}

impl ProgressSink for ConsoleProgress {
    fn on_progress(&self, step: usize, total: usize, _percent: u8, message: &str, _phase: SyncPhase) {
        if !self.enabled {
            tracing::debug!("{}", message);
            return;
        }
        let Ok(mut bar) = self.bar.lock() else { return };
        // A fresh run (or the first step) needs a fresh bar; reuse the live
        // one otherwise so elapsed time stays continuous.
        if bar.is_finished() || bar.length() != Some(total as u64) {
            *bar = create_progress_bar(!self.enabled, total as u64);
        }
        bar.set_position(step as u64);
        bar.set_message(message.to_string());
    }

    fn on_file_progress(&self, uploaded: u64, total: u64, bytes_per_sec: f64) {
        let line = format!(
            "  transferred {} of {} ({})",
            format_bytes(uploaded),
            format_bytes(total),
            format_speed(bytes_per_sec)
        );
        if self.enabled {
            if let Ok(bar) = self.bar.lock() {
                // Log lines must go through `suspend` so they do not
                // interleave with bar redraws.
                bar.suspend(|| tracing::debug!("{}", line));
                return;
            }
        }
        tracing::debug!("{}", line);
    }

    fn on_complete(&self, success: bool, new_images: &[ImageRecord]) {
        if let Ok(bar) = self.bar.lock() {
            bar.finish_and_clear();
        }
        if success {
            tracing::info!("Gallery in sync: {} image(s) created or updated", new_images.len());
        } else {
            tracing::warn!(
                "Sync finished with failures; {} image(s) created or updated",
                new_images.len()
            );
        }
    }

    fn on_cancel(&self) {
        if let Ok(bar) = self.bar.lock() {
            bar.finish_and_clear();
        }
        tracing::warn!("Sync canceled before completion");
    }
}

pub fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec.max(0.0).round() as u64))
}
