use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Stages reported while an analysis runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AnalysisStage {
    GridSearch,
    Permutations,
    NullAccumulation,
}

impl AnalysisStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::GridSearch => "grid search",
            Self::Permutations => "permutations",
            Self::NullAccumulation => "null accumulation",
        }
    }
}

impl fmt::Display for AnalysisStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting incremental progress. Never required for correctness.
pub trait ProgressObserver {
    fn on_stage_start(&mut self, stage: AnalysisStage, total: usize) {
        let _ = (stage, total);
    }
    fn on_stage_advance(&mut self, stage: AnalysisStage, completed: usize) {
        let _ = (stage, completed);
    }
    fn on_stage_finish(&mut self, stage: AnalysisStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl ProgressObserver for NoopProgress {}

/// Terminal progress bars showing elapsed time and an ETA per stage.
#[derive(Default)]
pub struct ProgressBars {
    bars: HashMap<AnalysisStage, (ProgressBar, Instant)>,
}

impl ProgressBars {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressObserver for ProgressBars {
    fn on_stage_start(&mut self, stage: AnalysisStage, total: usize) {
        let bar = ProgressBar::new(total as u64);
        let style = ProgressStyle::with_template(
            "> {msg:<18} [{bar:40.cyan/blue}] {pos}/{len} ({elapsed_precise}, eta {eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏ "));
        bar.set_message(stage.describe());
        self.bars.insert(stage, (bar, Instant::now()));
    }

    fn on_stage_advance(&mut self, stage: AnalysisStage, completed: usize) {
        if let Some((bar, _)) = self.bars.get(&stage) {
            bar.set_position(completed as u64);
        }
    }

    fn on_stage_finish(&mut self, stage: AnalysisStage) {
        if let Some((bar, started)) = self.bars.remove(&stage) {
            bar.finish_and_clear();
            log::info!(
                "{} finished in {}",
                stage,
                format_duration(started.elapsed())
            );
        }
    }
}

/// Formats a duration as `1 HR 2 MIN 3 SEC`, dropping zero components.
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    let (hours, remainder) = (seconds / 3600, seconds % 3600);
    let (minutes, seconds) = (remainder / 60, remainder % 60);

    let mut parts = Vec::with_capacity(3);
    match hours {
        0 => {}
        1 => parts.push("1 HR".to_string()),
        h => parts.push(format!("{h} HRS")),
    }
    if minutes > 0 {
        parts.push(format!("{minutes} MIN"));
    }
    if seconds > 0 || parts.is_empty() {
        parts.push(format!("{seconds} SEC"));
    }
    parts.join(" ")
}

/// Projects the remaining time from the mean duration of completed units.
pub fn estimate_remaining(elapsed: Duration, completed: usize, total: usize) -> Duration {
    if completed == 0 || completed >= total {
        return Duration::ZERO;
    }
    elapsed.div_f64(completed as f64).mul_f64((total - completed) as f64)
}
