//! Terminal rendering: a progress bar fed by [`RunEvent`]s and coloured
//! summaries.
//!
//! The orchestrator never talks to the terminal; [`RunProgress`] subscribes
//! to its event channel instead.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::analyzer::SheetLayout;
use crate::grid::column_letter;
use crate::orchestrator::{LogLevel, RunEvent, RunSummary};
use crate::tasks::{ProcessingStatus, TaskRegistry};

/// Progress bar for one run, advanced by the orchestrator's events.
///
/// Finished tasks are printed above the bar: green for processed, red for
/// errors, dim for blank rows. Retries show in yellow.
pub struct RunProgress {
    // Bar sized to the task count of the run.
    pb: ProgressBar,
    // Processed tasks.
    green: Style,
    // Failed tasks and error logs.
    red: Style,
    // Retries and warnings.
    yellow: Style,
    // Skipped rows and info logs.
    dim: Style,
}

impl Default for RunProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl RunProgress {
    /// Creates an empty bar; its length is set by the `Started` event.
    pub fn new() -> Self {
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .expect("invalid template")
                .progress_chars("=> "),
        );
        pb.enable_steady_tick(Duration::from_millis(100));
        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    /// Renders events until the orchestrator drops its sender.
    pub async fn drive(self, mut rx: UnboundedReceiver<RunEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle(&event);
        }
        self.pb.finish_and_clear();
    }

    /// Applies one event to the bar. Error logs are skipped here because
    /// the matching `TaskFinished` already printed them.
    pub fn handle(&self, event: &RunEvent) {
        match event {
            RunEvent::Started { sheet, total, pending } => {
                self.pb.set_length(*total as u64);
                self.pb.set_position((total - pending) as u64);
                self.pb.set_message(format!("{sheet}: {pending} pending"));
            }
            RunEvent::TaskStarted { task, worker } => {
                self.pb.set_message(format!("{task} → {worker}"));
            }
            RunEvent::Retry {
                task,
                attempt,
                max_attempts,
                delay,
                error,
            } => {
                self.pb.println(format!(
                    "  {} {task} retry {attempt}/{max_attempts} in {}s: {error}",
                    self.yellow.apply_to("↻"),
                    delay.as_secs()
                ));
            }
            RunEvent::TaskFinished(progress) => {
                self.pb.set_position(progress.progress.completed as u64);
                match progress.status {
                    ProcessingStatus::Processed => {
                        self.pb
                            .println(format!("  {} {}", self.green.apply_to("✓"), progress.task));
                    }
                    ProcessingStatus::Error => {
                        self.pb.println(format!(
                            "  {} {}: {}",
                            self.red.apply_to("✗"),
                            progress.task,
                            progress.error_message
                        ));
                    }
                    ProcessingStatus::Skipped => {
                        self.pb.println(format!(
                            "  {} {} (blank)",
                            self.dim.apply_to("-"),
                            progress.task
                        ));
                    }
                    _ => {}
                }
            }
            RunEvent::Log(log) => {
                let marker = match log.level {
                    LogLevel::Info => self.dim.apply_to("i"),
                    LogLevel::Warn => self.yellow.apply_to("!"),
                    LogLevel::Error => self.red.apply_to("!"),
                };
                if log.level != LogLevel::Error {
                    self.pb.println(format!("  {marker} {}", log.message));
                }
            }
            RunEvent::Finished(_) => self.pb.finish_and_clear(),
        }
    }
}

/// Prints the counters of a finished run under a coloured headline.
pub fn print_summary(summary: &RunSummary) {
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    let p = &summary.progress;
    let headline = if p.failed == 0 {
        green.apply_to("─── Run complete ───")
    } else {
        red.apply_to("─── Run complete (with failures) ───")
    };
    println!();
    println!("{headline}");
    println!(
        "  {:.0}% done: processed {}  failed {}  skipped {}  pending {}  ({} attempted in {:.1}s)",
        p.ratio() * 100.0,
        p.successful,
        p.failed,
        p.skipped,
        p.pending(),
        summary.attempted,
        summary.elapsed.as_secs_f64()
    );
    if summary.stopped {
        println!("  {}", Style::new().yellow().apply_to("stopped before all tasks were visited"));
    }
}

/// Prints the detected header, task columns and the derived columns.
pub fn print_layout(layout: &SheetLayout, registry: &TaskRegistry) {
    let bold = Style::new().bold();
    let yellow = Style::new().yellow();
    println!("{}", bold.apply_to("─── Sheet layout ───"));
    println!("  header row   {}", layout.header_row + 1);
    match (layout.task_rows.first(), layout.task_rows.last()) {
        (Some(first), Some(last)) => println!(
            "  task rows    {}..={} ({} rows)",
            first + 1,
            last + 1,
            layout.task_rows.len()
        ),
        _ => println!("  task rows    none"),
    }
    for m in &layout.mappings {
        let letter = |col: isize| {
            if col < 0 {
                "-".to_string()
            } else {
                column_letter(col as usize)
            }
        };
        let line = format!(
            "  column {:<4} status {:<3} error {:<3} result {:<3}",
            column_letter(m.copy_col),
            letter(m.process_col),
            letter(m.error_col),
            letter(m.paste_col),
        );
        if m.is_valid {
            println!("{line}");
        } else {
            println!("{line} {}", yellow.apply_to("(partially outside the sheet)"));
        }
    }
    let p = registry.progress();
    println!(
        "  tasks        {} total, {} done, {} blank, {} pending",
        layout.task_count(),
        p.successful,
        p.skipped,
        p.pending()
    );
}

/// Lists every failed task with its error text.
pub fn print_failures(registry: &TaskRegistry) {
    let red = Style::new().red();
    for task in registry.tasks_with_status(ProcessingStatus::Error) {
        println!("  {} {}: {}", red.apply_to("✗"), task.key(), task.error_message);
    }
}
