use std::collections::HashMap;

use tracing::debug;

use super::task::{ProcessingProgress, ProcessingStatus, ProcessingTask, TaskKey};
use crate::analyzer::ColumnMapping;
use crate::error::RegistryError;
use crate::grid::Grid;

/// Owns every task of a run and the aggregate progress counters.
///
/// Tasks are stored in processing order: ascending task column, then
/// ascending row. They are created once and only mutated in place.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Vec<ProcessingTask>,
    index: HashMap<TaskKey, usize>,
    progress: ProcessingProgress,
}

impl TaskRegistry {
    /// One task per (row, task column). With `skip_empty`, blank source
    /// cells start out SKIPPED.
    pub fn create_tasks(
        grid: &Grid,
        mappings: &[ColumnMapping],
        rows: &[usize],
        skip_empty: bool,
    ) -> Self {
        Self::build(grid, mappings, rows, skip_empty, None)
    }

    /// Like [`create_tasks`](Self::create_tasks), but a task whose status
    /// column already holds `processed_label` starts out PROCESSED.
    pub fn create_tasks_resuming(
        grid: &Grid,
        mappings: &[ColumnMapping],
        rows: &[usize],
        skip_empty: bool,
        processed_label: &str,
    ) -> Self {
        Self::build(grid, mappings, rows, skip_empty, Some(processed_label))
    }

    fn build(
        grid: &Grid,
        mappings: &[ColumnMapping],
        rows: &[usize],
        skip_empty: bool,
        processed_label: Option<&str>,
    ) -> Self {
        let mut columns: Vec<&ColumnMapping> = mappings.iter().collect();
        columns.sort_by_key(|m| m.copy_col);
        let mut rows = rows.to_vec();
        rows.sort_unstable();

        let mut registry = Self::default();
        for mapping in columns {
            for &row in &rows {
                let key = TaskKey::new(row, mapping.copy_col);
                if registry.index.contains_key(&key) {
                    continue;
                }
                let source = grid.cell(row, mapping.copy_col).to_string();
                let already_done = match (processed_label, mapping.status_target()) {
                    (Some(label), Some(col)) => grid.cell(row, col).trim() == label,
                    _ => false,
                };
                let status = if already_done {
                    ProcessingStatus::Processed
                } else if skip_empty && source.trim().is_empty() {
                    ProcessingStatus::Skipped
                } else {
                    ProcessingStatus::Unprocessed
                };
                registry.progress.total += 1;
                registry.progress.add(status);
                registry.index.insert(key, registry.tasks.len());
                registry.tasks.push(ProcessingTask::new(row, mapping.copy_col, source, status));
            }
        }
        debug!(
            total = registry.progress.total,
            skipped = registry.progress.skipped,
            already_processed = registry.progress.successful,
            "tasks created"
        );
        registry
    }

    pub fn tasks(&self) -> &[ProcessingTask] {
        &self.tasks
    }

    pub fn keys(&self) -> Vec<TaskKey> {
        self.tasks.iter().map(ProcessingTask::key).collect()
    }

    pub fn get(&self, key: TaskKey) -> Option<&ProcessingTask> {
        self.index.get(&key).map(|&i| &self.tasks[i])
    }

    pub fn progress(&self) -> ProcessingProgress {
        self.progress
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks_with_status(&self, status: ProcessingStatus) -> impl Iterator<Item = &ProcessingTask> {
        self.tasks.iter().filter(move |t| t.status == status)
    }

    /// The only way a task's status changes during a run. Moves the task
    /// between progress buckets. Reaching PROCESSED clears the error text;
    /// ERROR records `error_message`.
    pub fn update_status(
        &mut self,
        key: TaskKey,
        new_status: ProcessingStatus,
        error_message: &str,
    ) -> Result<(), RegistryError> {
        let idx = *self.index.get(&key).ok_or(RegistryError::UnknownTask {
            row: key.row,
            col: key.col,
        })?;
        let task = &mut self.tasks[idx];
        let old = task.status;
        if !old.can_transition_to(new_status) {
            return Err(RegistryError::InvalidTransition {
                row: key.row,
                col: key.col,
                from: old,
                to: new_status,
            });
        }

        task.status = new_status;
        match new_status {
            ProcessingStatus::Error => task.error_message = error_message.to_string(),
            ProcessingStatus::Processed | ProcessingStatus::Unprocessed => task.error_message.clear(),
            _ => {}
        }
        self.progress.remove(old);
        self.progress.add(new_status);
        debug!(task = %key, from = %old, to = %new_status, "task status changed");
        Ok(())
    }

    /// Stores the source text read at execution time.
    pub fn set_source_text(&mut self, key: TaskKey, text: &str) -> Result<(), RegistryError> {
        let task = self.task_mut(key)?;
        task.source_text = text.to_string();
        Ok(())
    }

    /// Records one more retry for the task; returns the new count.
    pub fn record_retry(&mut self, key: TaskKey) -> Result<u32, RegistryError> {
        let task = self.task_mut(key)?;
        task.retry_count += 1;
        Ok(task.retry_count)
    }

    /// Moves every matching task that may legally return to UNPROCESSED
    /// (i.e. ERROR tasks) back, clearing error text and retry count.
    pub fn reset<F>(&mut self, filter: F) -> usize
    where
        F: Fn(&ProcessingTask) -> bool,
    {
        let keys: Vec<TaskKey> = self
            .tasks
            .iter()
            .filter(|t| t.status.can_transition_to(ProcessingStatus::Unprocessed) && filter(t))
            .map(ProcessingTask::key)
            .collect();
        for &key in &keys {
            if self.update_status(key, ProcessingStatus::Unprocessed, "").is_ok() {
                if let Ok(task) = self.task_mut(key) {
                    task.retry_count = 0;
                }
            }
        }
        keys.len()
    }

    fn task_mut(&mut self, key: TaskKey) -> Result<&mut ProcessingTask, RegistryError> {
        let idx = *self.index.get(&key).ok_or(RegistryError::UnknownTask {
            row: key.row,
            col: key.col,
        })?;
        Ok(&mut self.tasks[idx])
    }
}
