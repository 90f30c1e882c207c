use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a single task.
///
/// ```text
/// UNPROCESSED -> PROCESSING -> PROCESSED
///                PROCESSING -> ERROR -> (reset) -> UNPROCESSED
/// UNPROCESSED | PROCESSING -> SKIPPED   (blank source cell)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    Unprocessed,
    Processing,
    Processed,
    Error,
    Skipped,
}

impl ProcessingStatus {
    pub fn can_transition_to(self, next: ProcessingStatus) -> bool {
        use ProcessingStatus::*;
        matches!(
            (self, next),
            (Unprocessed, Processing)
                | (Unprocessed, Skipped)
                | (Processing, Processed)
                | (Processing, Error)
                | (Processing, Skipped)
                | (Error, Unprocessed)
        )
    }

    /// PROCESSED and SKIPPED never change again within a run.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessingStatus::Processed | ProcessingStatus::Skipped)
    }

    /// Whether the task counts towards `completed` in the progress counters.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            ProcessingStatus::Processed | ProcessingStatus::Error | ProcessingStatus::Skipped
        )
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingStatus::Unprocessed => write!(f, "UNPROCESSED"),
            ProcessingStatus::Processing => write!(f, "PROCESSING"),
            ProcessingStatus::Processed => write!(f, "PROCESSED"),
            ProcessingStatus::Error => write!(f, "ERROR"),
            ProcessingStatus::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// Identity of a task: one source cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub row: usize,
    pub col: usize,
}

impl TaskKey {
    pub fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", crate::grid::a1_notation(self.row, self.col))
    }
}

/// One (row, task column) pair to be executed by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingTask {
    /// 0-based sheet row.
    pub row: usize,
    /// 0-based task column.
    pub copy_col: usize,
    /// Source cell text, refreshed when the task is picked up.
    pub source_text: String,
    pub status: ProcessingStatus,
    /// Last error; empty unless the task is in ERROR.
    pub error_message: String,
    /// Retries spent, not counting the first attempt.
    pub retry_count: u32,
}

impl ProcessingTask {
    pub fn new(row: usize, copy_col: usize, source_text: String, status: ProcessingStatus) -> Self {
        Self {
            row,
            copy_col,
            source_text,
            status,
            error_message: String::new(),
            retry_count: 0,
        }
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.row, self.copy_col)
    }
}

/// Aggregate counters, adjusted on every status change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingProgress {
    pub total: usize,
    /// Tasks in PROCESSED, ERROR or SKIPPED.
    pub completed: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl ProcessingProgress {
    /// Tasks not yet finished, including one in flight.
    pub fn pending(&self) -> usize {
        self.total - self.completed
    }

    /// Completion ratio in `[0.0, 1.0]`; an empty run counts as complete.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }

    pub(super) fn add(&mut self, status: ProcessingStatus) {
        self.bucket(status, true);
    }

    pub(super) fn remove(&mut self, status: ProcessingStatus) {
        self.bucket(status, false);
    }

    fn bucket(&mut self, status: ProcessingStatus, add: bool) {
        let counter = match status {
            ProcessingStatus::Processed => Some(&mut self.successful),
            ProcessingStatus::Error => Some(&mut self.failed),
            ProcessingStatus::Skipped => Some(&mut self.skipped),
            ProcessingStatus::Unprocessed | ProcessingStatus::Processing => None,
        };
        if let Some(counter) = counter {
            if add {
                *counter += 1;
            } else {
                *counter -= 1;
            }
        }
        if status.is_finished() {
            if add {
                self.completed += 1;
            } else {
                self.completed -= 1;
            }
        }
    }
}
