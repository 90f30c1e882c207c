use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::tasks::{ProcessingProgress, ProcessingStatus, TaskKey};

/// Emitted whenever a task reaches a new status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub task: TaskKey,
    pub status: ProcessingStatus,
    pub error_message: String,
    pub progress: ProcessingProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
}

/// Outcome of one `run()` pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub progress: ProcessingProgress,
    /// Tasks handed to a worker in this pass.
    pub attempted: usize,
    /// The stop flag ended the pass before every task was visited.
    pub stopped: bool,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

/// Everything a front-end needs to render a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RunEvent {
    Started {
        sheet: String,
        total: usize,
        pending: usize,
    },
    TaskStarted {
        task: TaskKey,
        worker: String,
    },
    Retry {
        task: TaskKey,
        attempt: u32,
        max_attempts: u32,
        #[serde(with = "duration_ms")]
        delay: Duration,
        error: String,
    },
    TaskFinished(ProgressEvent),
    Log(LogEvent),
    Finished(RunSummary),
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Cooperative cancellation flag, checked by the orchestrator between tasks.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
