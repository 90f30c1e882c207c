//! Drives every task of a sheet to a terminal state.
//!
//! Tasks run one at a time in (column, row) order. For each task the
//! orchestrator marks the status cell, reads the source text, invokes the
//! worker bound to the column under a [`RetryPolicy`], and writes the
//! outcome back in a single store transaction. Progress is published as
//! [`RunEvent`]s on an optional channel.

mod events;
mod retry;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

pub use events::{LogEvent, LogLevel, ProgressEvent, RunEvent, RunSummary, StopHandle};
pub use retry::RetryPolicy;

use crate::analyzer::{ColumnMapping, SheetLayout};
use crate::config::RunConfig;
use crate::error::{CellRelayError, ConfigError, ErrorKind, RegistryError, StoreError, WorkerError};
use crate::grid::{Grid, SheetRef, column_letter};
use crate::store::{TabularStore, TransactionalDataStore};
use crate::tasks::{ProcessingStatus, TaskKey, TaskRegistry};
use crate::workers::{Worker, WorkerRegistry};

/// Creates the tasks of a detected layout. With `resume_processed`, rows
/// whose status cell holds the processed label start out PROCESSED.
pub fn build_registry(config: &RunConfig, grid: &Grid, layout: &SheetLayout) -> TaskRegistry {
    if config.resume_processed {
        TaskRegistry::create_tasks_resuming(
            grid,
            &layout.mappings,
            &layout.task_rows,
            config.skip_empty_cells,
            &config.status_labels.processed,
        )
    } else {
        TaskRegistry::create_tasks(grid, &layout.mappings, &layout.task_rows, config.skip_empty_cells)
    }
}

enum TaskOutcome {
    Completed(String),
    Blank,
}

pub struct TaskOrchestrator<S> {
    config: RunConfig,
    sheet: SheetRef,
    store: TransactionalDataStore<S>,
    column_workers: BTreeMap<usize, Arc<dyn Worker>>,
    default_worker: Option<Arc<dyn Worker>>,
    policy: RetryPolicy,
    registry: TaskRegistry,
    layout: Option<SheetLayout>,
    events: Option<UnboundedSender<RunEvent>>,
    stop: StopHandle,
}

impl<S: TabularStore> TaskOrchestrator<S> {
    /// Resolves every configured worker up front; an unknown worker id is a
    /// configuration error, not a per-task failure.
    pub fn new(config: RunConfig, backend: S, workers: &WorkerRegistry) -> Result<Self, CellRelayError> {
        let sheet = config.sheet_ref()?;
        debug!(available = ?workers.ids().collect::<Vec<_>>(), "worker registry");

        let mut column_workers = BTreeMap::new();
        for (col, id) in config.column_worker_map()? {
            if !workers.contains(&id) {
                return Err(ConfigError::UnknownWorker {
                    worker: id,
                    target: format!("column {}", column_letter(col)),
                }
                .into());
            }
            column_workers.insert(col, workers.build(&id, &config)?);
        }
        let default_worker = match &config.default_worker {
            Some(id) if !workers.contains(id) => {
                return Err(ConfigError::UnknownWorker {
                    worker: id.clone(),
                    target: "default_worker".into(),
                }
                .into());
            }
            Some(id) => Some(workers.build(id, &config)?),
            None => None,
        };

        let store = TransactionalDataStore::new(backend, config.store_options());
        Ok(Self {
            policy: config.retry_policy(),
            sheet,
            store,
            column_workers,
            default_worker,
            registry: TaskRegistry::default(),
            layout: None,
            events: None,
            stop: StopHandle::default(),
            config,
        })
    }

    /// Publishes [`RunEvent`]s on `tx`. A closed receiver is ignored.
    pub fn with_events(mut self, tx: UnboundedSender<RunEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Drops the event sender so a subscriber sees the channel close.
    pub fn close_events(&mut self) {
        self.events = None;
    }

    /// Handle that ends the run after the task in flight.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Tasks of the prepared sheet; empty before `prepare`.
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn store(&self) -> &TransactionalDataStore<S> {
        &self.store
    }

    pub fn sheet(&self) -> &SheetRef {
        &self.sheet
    }

    /// Reads the sheet, detects its structure and creates the tasks.
    ///
    /// Structure errors abort here, before any task exists. Rows whose
    /// status cell already holds the processed label start out PROCESSED.
    pub async fn prepare(&mut self) -> Result<&SheetLayout, CellRelayError> {
        let grid = self
            .store
            .read_grid(&self.sheet, self.config.max_rows, self.config.max_columns)
            .await?;
        let layout = self.config.structure_analyzer().analyze(&grid)?;

        for mapping in &layout.mappings {
            if !mapping.is_valid {
                self.log(
                    LogLevel::Warn,
                    format!(
                        "column {}: derived columns fall outside the sheet, only in-range cells are written",
                        column_letter(mapping.copy_col)
                    ),
                );
            }
            if self.worker_for(mapping.copy_col).is_none() {
                self.log(
                    LogLevel::Warn,
                    format!("column {}: no worker bound", column_letter(mapping.copy_col)),
                );
            }
        }

        self.registry = build_registry(&self.config, &grid, &layout);
        if self.registry.is_empty() {
            self.log(LogLevel::Warn, "no task rows below the header".into());
        }
        info!(
            sheet = %self.sheet.sheet_name,
            tasks = self.registry.len(),
            already_done = self.registry.tasks().iter().filter(|t| t.status.is_terminal()).count(),
            pending = self.registry.tasks_with_status(ProcessingStatus::Unprocessed).count(),
            "sheet prepared"
        );
        Ok(self.layout.insert(layout))
    }

    /// Processes every UNPROCESSED task once. Prepares the sheet first if
    /// [`prepare`](Self::prepare) has not run yet.
    ///
    /// A failing task never aborts the run; only structure and
    /// configuration problems do.
    pub async fn run(&mut self) -> Result<RunSummary, CellRelayError> {
        if self.layout.is_none() {
            self.prepare().await?;
        }
        let started = Instant::now();
        let mappings: BTreeMap<usize, ColumnMapping> = self
            .layout
            .iter()
            .flat_map(|l| l.mappings.iter().map(|m| (m.copy_col, *m)))
            .collect();

        let pending = self.registry.tasks_with_status(ProcessingStatus::Unprocessed).count();
        self.emit(RunEvent::Started {
            sheet: self.sheet.sheet_name.clone(),
            total: self.registry.len(),
            pending,
        });

        let mut attempted = 0;
        let mut stopped = false;
        for key in self.registry.keys() {
            if self.stop.is_stopped() {
                stopped = true;
                info!(attempted, "stop requested, ending run");
                self.log(LogLevel::Info, "stop requested, remaining tasks left unprocessed".into());
                break;
            }
            let Some(task) = self.registry.get(key) else {
                continue;
            };
            if task.status != ProcessingStatus::Unprocessed {
                continue;
            }
            let Some(mapping) = mappings.get(&key.col).copied() else {
                continue;
            };
            attempted += 1;
            self.process_task(key, mapping).await?;
        }

        let summary = RunSummary {
            progress: self.registry.progress(),
            attempted,
            stopped,
            elapsed: started.elapsed(),
        };
        info!(
            successful = summary.progress.successful,
            failed = summary.progress.failed,
            skipped = summary.progress.skipped,
            attempted,
            "run finished"
        );
        self.emit(RunEvent::Finished(summary.clone()));
        Ok(summary)
    }

    /// Returns ERROR tasks to UNPROCESSED so the next `run()` retries them.
    pub fn reset_failed(&mut self) -> usize {
        let n = self.registry.reset(|t| t.status == ProcessingStatus::Error);
        if n > 0 {
            info!(tasks = n, "failed tasks reset");
        }
        n
    }

    /// Rewrites status cells left in the processing or error state (e.g.
    /// after a crash) to the unprocessed label and clears their error text,
    /// in one transaction. Returns the number of rows reset.
    pub async fn reset_sheet(&mut self) -> Result<usize, CellRelayError> {
        if self.layout.is_none() {
            self.prepare().await?;
        }
        let Some(layout) = self.layout.clone() else {
            return Ok(0);
        };
        let labels = self.config.status_labels.clone();
        let mut reset_keys = Vec::new();

        self.store.begin_transaction()?;
        let block: Result<(), CellRelayError> = async {
            for mapping in &layout.mappings {
                let Some(status_col) = mapping.status_target() else {
                    continue;
                };
                for &row in &layout.task_rows {
                    let current = self.store.read_cell(&self.sheet, row, status_col).await?;
                    let current = current.trim();
                    if current != labels.processing && current != labels.error {
                        continue;
                    }
                    self.store
                        .write_cell(&self.sheet, row, status_col, &labels.unprocessed)
                        .await?;
                    if let Some(error_col) = mapping.error_target() {
                        self.store.write_cell(&self.sheet, row, error_col, "").await?;
                    }
                    reset_keys.push(TaskKey::new(row, mapping.copy_col));
                }
            }
            Ok(())
        }
        .await;
        self.store.finish_transaction(block).await?;

        self.registry.reset(|t| reset_keys.contains(&t.key()));
        info!(rows = reset_keys.len(), "sheet status reset");
        Ok(reset_keys.len())
    }

    async fn process_task(&mut self, key: TaskKey, mapping: ColumnMapping) -> Result<(), CellRelayError> {
        self.registry.update_status(key, ProcessingStatus::Processing, "")?;
        let worker_name = self
            .worker_for(mapping.copy_col)
            .map(|w| w.name().to_string())
            .unwrap_or_else(|| "-".to_string());
        info!(task = %key, worker = %worker_name, "task started");
        self.emit(RunEvent::TaskStarted {
            task: key,
            worker: worker_name,
        });

        match self.execute(key, &mapping).await {
            Ok(TaskOutcome::Blank) => {
                if let Some(col) = mapping.status_target() {
                    let label = &self.config.status_labels.skipped;
                    if let Err(err) = self.store.write_cell(&self.sheet, key.row, col, label).await {
                        warn!(task = %key, error = %err, "could not write skipped label");
                    }
                }
                self.finish(key, ProcessingStatus::Skipped, "")?;
            }
            Ok(TaskOutcome::Completed(result)) => match self.write_success(key, &mapping, &result).await {
                Ok(()) => self.finish(key, ProcessingStatus::Processed, "")?,
                Err(err) => {
                    let message = format!("failed to write result: {err}");
                    self.write_failure(key, &mapping, &message).await;
                    self.finish(key, ProcessingStatus::Error, &message)?;
                }
            },
            Err(message) => {
                self.write_failure(key, &mapping, &message).await;
                self.finish(key, ProcessingStatus::Error, &message)?;
            }
        }
        Ok(())
    }

    /// Everything between pickup and write-back. `Err` carries the message
    /// persisted to the error column.
    async fn execute(&mut self, key: TaskKey, mapping: &ColumnMapping) -> Result<TaskOutcome, String> {
        if let Some(col) = mapping.status_target() {
            self.store
                .write_cell(&self.sheet, key.row, col, &self.config.status_labels.processing)
                .await
                .map_err(|e| format!("failed to mark task as processing: {e}"))?;
        }

        let source = self
            .store
            .read_cell(&self.sheet, key.row, key.col)
            .await
            .map_err(|e| format!("failed to read source text: {e}"))?;
        self.registry
            .set_source_text(key, &source)
            .map_err(|e| e.to_string())?;
        if source.trim().is_empty() {
            debug!(task = %key, "source cell is blank");
            return Ok(TaskOutcome::Blank);
        }

        let worker = self
            .worker_for(mapping.copy_col)
            .ok_or_else(|| format!("no worker bound to column {}", column_letter(mapping.copy_col)))?;
        let limit = self.config.worker_timeout();
        let max_attempts = self.policy.max_attempts();

        let mut attempt = 0;
        loop {
            let result = match timeout(limit, worker.execute(&source, limit)).await {
                Ok(result) => result,
                Err(_) => Err(WorkerError::Retryable(format!(
                    "worker timed out after {}s",
                    limit.as_secs()
                ))),
            };
            let err = match result {
                Ok(text) => return Ok(TaskOutcome::Completed(text)),
                Err(err) => err,
            };
            let message = err.message().to_string();
            if err.kind() == ErrorKind::Fatal {
                warn!(task = %key, attempt = attempt + 1, error = %message, "fatal worker error");
                return Err(message);
            }
            if !self.policy.has_attempt_after(attempt) {
                warn!(task = %key, attempts = attempt + 1, error = %message, "retries exhausted");
                return Err(message);
            }
            let delay = self.policy.backoff(attempt);
            self.registry.record_retry(key).map_err(|e| e.to_string())?;
            warn!(
                task = %key,
                attempt = attempt + 1,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "worker failed, retrying"
            );
            self.emit(RunEvent::Retry {
                task: key,
                attempt: attempt + 1,
                max_attempts,
                delay,
                error: message,
            });
            sleep(delay).await;
            attempt += 1;
        }
    }

    /// Result to the paste column, cleared error column, processed label.
    async fn write_success(&mut self, key: TaskKey, mapping: &ColumnMapping, result: &str) -> Result<(), StoreError> {
        self.store.begin_transaction()?;
        let block: Result<(), StoreError> = async {
            if let Some(col) = mapping.paste_target() {
                self.store.write_cell(&self.sheet, key.row, col, result).await?;
            }
            if let Some(col) = mapping.error_target() {
                self.store.write_cell(&self.sheet, key.row, col, "").await?;
            }
            if let Some(col) = mapping.status_target() {
                self.store
                    .write_cell(&self.sheet, key.row, col, &self.config.status_labels.processed)
                    .await?;
            }
            Ok(())
        }
        .await;
        self.store.finish_transaction(block).await
    }

    /// Error text and error label. A failure here is logged; the task is
    /// marked ERROR regardless.
    async fn write_failure(&mut self, key: TaskKey, mapping: &ColumnMapping, message: &str) {
        let written: Result<(), StoreError> = async {
            self.store.begin_transaction()?;
            let block: Result<(), StoreError> = async {
                if let Some(col) = mapping.error_target() {
                    self.store.write_cell(&self.sheet, key.row, col, message).await?;
                }
                if let Some(col) = mapping.status_target() {
                    self.store
                        .write_cell(&self.sheet, key.row, col, &self.config.status_labels.error)
                        .await?;
                }
                Ok(())
            }
            .await;
            self.store.finish_transaction(block).await
        }
        .await;
        if let Err(err) = written {
            warn!(task = %key, error = %err, "could not persist task error");
        }
    }

    fn finish(&mut self, key: TaskKey, status: ProcessingStatus, message: &str) -> Result<(), RegistryError> {
        self.registry.update_status(key, status, message)?;
        match status {
            ProcessingStatus::Error => {
                warn!(task = %key, error = message, "task failed");
                self.log(LogLevel::Error, format!("{key}: {message}"));
            }
            _ => info!(task = %key, status = %status, "task finished"),
        }
        self.emit(RunEvent::TaskFinished(ProgressEvent {
            task: key,
            status,
            error_message: message.to_string(),
            progress: self.registry.progress(),
        }));
        Ok(())
    }

    fn worker_for(&self, col: usize) -> Option<Arc<dyn Worker>> {
        self.column_workers
            .get(&col)
            .or(self.default_worker.as_ref())
            .cloned()
    }

    fn log(&self, level: LogLevel, message: String) {
        if level == LogLevel::Warn {
            warn!("{message}");
        }
        self.emit(RunEvent::Log(LogEvent { level, message }));
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::error::{StructureError, TransportError};
    use crate::store::{MemoryStore, TransactionStatus};

    const H: &str = "作業指示行";
    const C: &str = "コピー";

    /// Replays a fixed list of results, then echoes.
    struct ScriptedWorker {
        script: Mutex<VecDeque<Result<String, WorkerError>>>,
        calls: AtomicU32,
    }

    impl ScriptedWorker {
        fn new(script: Vec<Result<String, WorkerError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Worker for ScriptedWorker {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn execute(&self, prompt: &str, _timeout: Duration) -> Result<String, WorkerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.script.lock().unwrap().pop_front() {
                Some(Err(WorkerError::Retryable(m))) => Err(WorkerError::Retryable(format!("{m} {n}"))),
                Some(result) => result,
                None => Ok(prompt.to_string()),
            }
        }
    }

    struct AlwaysRetryable(AtomicU32);

    #[async_trait]
    impl Worker for AlwaysRetryable {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn execute(&self, _prompt: &str, _timeout: Duration) -> Result<String, WorkerError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            Err(WorkerError::Retryable(format!("busy {n}")))
        }
    }

    struct Hangs;

    #[async_trait]
    impl Worker for Hangs {
        fn name(&self) -> &str {
            "hangs"
        }

        async fn execute(&self, _prompt: &str, _timeout: Duration) -> Result<String, WorkerError> {
            sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }
    }

    /// Echoes and raises the stop flag on its first call.
    struct StopsRun(StopHandle);

    #[async_trait]
    impl Worker for StopsRun {
        fn name(&self) -> &str {
            "stopper"
        }

        async fn execute(&self, prompt: &str, _timeout: Duration) -> Result<String, WorkerError> {
            self.0.stop();
            Ok(prompt.to_uppercase())
        }
    }

    fn sheet() -> SheetRef {
        SheetRef::new("book", "Sheet1")
    }

    fn config(default_worker: &str) -> RunConfig {
        RunConfig {
            spreadsheet: "book".into(),
            sheet_name: "Sheet1".into(),
            default_worker: Some(default_worker.into()),
            ..RunConfig::default()
        }
    }

    /// Header in row 1, one task column D (status B, error C, paste E).
    fn single_task_grid(source: &str) -> Grid {
        Grid::from_strs(&[&[H, "", "", C, ""], &["1", "", "", source, ""]])
    }

    fn build(
        grid: Grid,
        config: RunConfig,
        extra: Vec<(&str, Arc<dyn Worker>)>,
    ) -> (MemoryStore, TaskOrchestrator<MemoryStore>) {
        let backend = MemoryStore::new();
        backend.insert_sheet(&sheet(), grid);
        let mut workers = WorkerRegistry::with_builtin();
        for (id, worker) in extra {
            workers.register_instance(id, worker);
        }
        let orch = TaskOrchestrator::new(config, backend.clone(), &workers).unwrap();
        (backend, orch)
    }

    #[tokio::test]
    async fn end_to_end_with_echo_worker() {
        let mut rows: Vec<Vec<String>> = vec![vec![String::new(); 6]; 8];
        rows[4][0] = H.into();
        rows[4][1] = C.into();
        rows[4][4] = C.into();
        for (i, row) in (5..8).enumerate() {
            rows[row][0] = (i + 1).to_string();
            rows[row][1] = format!("left {i}");
            rows[row][4] = format!("right {i}");
        }
        let (backend, mut orch) = build(Grid::from_rows(rows), config("echo"), vec![]);

        let layout = orch.prepare().await.unwrap().clone();
        assert_eq!(layout.header_row, 4);
        assert_eq!(layout.task_rows, vec![5, 6, 7]);
        assert_eq!(orch.registry().len(), 6);

        let summary = orch.run().await.unwrap();
        assert_eq!(summary.attempted, 6);
        assert_eq!(summary.progress.successful, 6);
        assert!(!summary.stopped);
        assert!(
            orch.registry()
                .tasks()
                .iter()
                .all(|t| t.status == ProcessingStatus::Processed && t.error_message.is_empty())
        );

        for (i, row) in (5..8).enumerate() {
            // Column E: status C, error D, paste F.
            assert_eq!(backend.cell(&sheet(), row, 5), format!("right {i}"));
            assert_eq!(backend.cell(&sheet(), row, 2), "処理済み");
            assert_eq!(backend.cell(&sheet(), row, 3), "");
        }
        // Column B pastes into C, which column E later uses for its status.
        let log = orch.store().transaction_log();
        assert_eq!(log.len(), 6);
        assert!(log.iter().all(|t| t.status == TransactionStatus::Committed));
        for (i, row) in (5..8).enumerate() {
            assert!(log.iter().any(|t| t
                .updates
                .iter()
                .any(|w| w.update.row == row && w.update.col == 2 && w.update.value == format!("left {i}"))));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_fifth_attempt() {
        let worker = ScriptedWorker::new(vec![
            Err(WorkerError::Retryable("busy".into())),
            Err(WorkerError::Retryable("busy".into())),
            Err(WorkerError::Retryable("busy".into())),
            Err(WorkerError::Retryable("busy".into())),
            Ok("answer".into()),
        ]);
        let (backend, mut orch) = build(
            single_task_grid("question"),
            config("scripted"),
            vec![("scripted", worker.clone() as Arc<dyn Worker>)],
        );
        let start = Instant::now();
        orch.run().await.unwrap();

        let task = orch.registry().get(TaskKey::new(1, 3)).unwrap();
        assert_eq!(task.status, ProcessingStatus::Processed);
        assert!(task.error_message.is_empty());
        assert_eq!(task.retry_count, 4);
        assert_eq!(worker.calls(), 5);
        // 10 + 20 + 40 + 60 seconds of backoff.
        assert!(start.elapsed() >= Duration::from_secs(130));

        assert_eq!(backend.cell(&sheet(), 1, 4), "answer");
        assert_eq!(backend.cell(&sheet(), 1, 1), "処理済み");
        assert_eq!(backend.cell(&sheet(), 1, 2), "");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_exactly_max_attempts() {
        let flaky = Arc::new(AlwaysRetryable(AtomicU32::new(0)));
        let (backend, mut orch) = build(
            single_task_grid("question"),
            config("flaky"),
            vec![("flaky", flaky.clone() as Arc<dyn Worker>)],
        );
        let summary = orch.run().await.unwrap();

        assert_eq!(flaky.0.load(Ordering::SeqCst), 5);
        let task = orch.registry().get(TaskKey::new(1, 3)).unwrap();
        assert_eq!(task.status, ProcessingStatus::Error);
        assert_eq!(task.error_message, "busy 5");
        assert_eq!(summary.progress.failed, 1);
        assert_eq!(backend.cell(&sheet(), 1, 2), "busy 5");
        assert_eq!(backend.cell(&sheet(), 1, 1), "エラー");
        assert_eq!(backend.cell(&sheet(), 1, 4), "");
    }

    #[tokio::test]
    async fn fatal_error_stops_retrying() {
        let worker = ScriptedWorker::new(vec![Err(WorkerError::Fatal("authentication required".into()))]);
        let (backend, mut orch) = build(
            single_task_grid("question"),
            config("scripted"),
            vec![("scripted", worker.clone() as Arc<dyn Worker>)],
        );
        orch.run().await.unwrap();

        assert_eq!(worker.calls(), 1);
        let task = orch.registry().get(TaskKey::new(1, 3)).unwrap();
        assert_eq!(task.status, ProcessingStatus::Error);
        assert_eq!(task.retry_count, 0);
        assert_eq!(backend.cell(&sheet(), 1, 2), "authentication required");
    }

    #[tokio::test(start_paused = true)]
    async fn worker_timeout_counts_as_retryable() {
        let mut cfg = config("hangs");
        cfg.worker_timeout_seconds = 5;
        cfg.max_retries = 2;
        let (_backend, mut orch) = build(single_task_grid("q"), cfg, vec![("hangs", Arc::new(Hangs) as Arc<dyn Worker>)]);
        orch.run().await.unwrap();

        let task = orch.registry().get(TaskKey::new(1, 3)).unwrap();
        assert_eq!(task.status, ProcessingStatus::Error);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.error_message, "worker timed out after 5s");
    }

    #[tokio::test]
    async fn blank_source_found_at_execution_is_skipped() {
        let mut cfg = config("echo");
        cfg.skip_empty_cells = false;
        let (backend, mut orch) = build(single_task_grid("  "), cfg, vec![]);
        assert_eq!(orch.prepare().await.unwrap().task_count(), 1);
        assert_eq!(
            orch.registry().get(TaskKey::new(1, 3)).unwrap().status,
            ProcessingStatus::Unprocessed
        );

        let summary = orch.run().await.unwrap();
        assert_eq!(summary.progress.skipped, 1);
        assert_eq!(backend.cell(&sheet(), 1, 1), "スキップ");
        assert!(orch.store().transaction_log().is_empty());
    }

    #[tokio::test]
    async fn blank_source_skipped_at_creation_is_left_alone() {
        let (backend, mut orch) = build(single_task_grid(""), config("echo"), vec![]);
        let summary = orch.run().await.unwrap();
        assert_eq!(summary.attempted, 0);
        assert_eq!(summary.progress.skipped, 1);
        assert_eq!(backend.write_calls(), 0);
    }

    #[tokio::test]
    async fn column_without_worker_errors_every_task() {
        let mut cfg = config("echo");
        cfg.default_worker = None;
        cfg.column_workers.insert("G".into(), "echo".into());
        let grid = Grid::from_strs(&[
            &[H, "", "", C, "", "", C, ""],
            &["1", "", "", "a", "", "", "b", ""],
        ]);
        let (backend, mut orch) = build(grid, cfg, vec![]);
        let summary = orch.run().await.unwrap();

        assert_eq!(summary.progress.failed, 1);
        assert_eq!(summary.progress.successful, 1);
        let task = orch.registry().get(TaskKey::new(1, 3)).unwrap();
        assert_eq!(task.error_message, "no worker bound to column D");
        assert_eq!(backend.cell(&sheet(), 1, 7), "b");
    }

    #[test]
    fn unknown_worker_is_rejected_up_front() {
        let mut cfg = config("echo");
        cfg.column_workers.insert("D".into(), "gpt".into());
        let err = TaskOrchestrator::new(cfg, MemoryStore::new(), &WorkerRegistry::with_builtin())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            CellRelayError::Config(ConfigError::UnknownWorker { ref worker, ref target })
                if worker == "gpt" && target == "column D"
        ));

        let err = TaskOrchestrator::new(config("gpt"), MemoryStore::new(), &WorkerRegistry::with_builtin())
            .err()
            .unwrap();
        assert!(matches!(err, CellRelayError::Config(ConfigError::UnknownWorker { .. })));
    }

    #[tokio::test]
    async fn missing_header_aborts_before_any_write() {
        let grid = Grid::from_strs(&[&["1", "x", "", C]]);
        let (backend, mut orch) = build(grid, config("echo"), vec![]);
        let err = orch.run().await.unwrap_err();
        assert!(matches!(
            err,
            CellRelayError::Structure(StructureError::HeaderNotFound { .. })
        ));
        assert!(orch.registry().is_empty());
        assert_eq!(backend.write_calls(), 0);
    }

    #[tokio::test]
    async fn stop_flag_ends_run_after_current_task() {
        let rows = Grid::from_strs(&[
            &[H, "", "", C, ""],
            &["1", "", "", "a", ""],
            &["2", "", "", "b", ""],
            &["3", "", "", "c", ""],
        ]);
        let backend = MemoryStore::new();
        backend.insert_sheet(&sheet(), rows);
        let mut orch =
            TaskOrchestrator::new(config("echo"), backend.clone(), &WorkerRegistry::with_builtin()).unwrap();
        let mut workers = WorkerRegistry::new();
        workers.register_instance("stopper", Arc::new(StopsRun(orch.stop_handle())));
        orch.default_worker = Some(workers.build("stopper", &RunConfig::default()).unwrap());

        let summary = orch.run().await.unwrap();
        assert!(summary.stopped);
        assert_eq!(summary.attempted, 1);
        assert_eq!(backend.cell(&sheet(), 1, 4), "A");
        assert_eq!(
            orch.registry().tasks_with_status(ProcessingStatus::Unprocessed).count(),
            2
        );
        assert_eq!(backend.cell(&sheet(), 2, 1), "");
    }

    #[tokio::test]
    async fn resumed_rows_are_not_repeated() {
        let grid = Grid::from_strs(&[
            &[H, "", "", C, ""],
            &["1", "処理済み", "", "a", "old"],
            &["2", "エラー", "boom", "b", ""],
        ]);
        let (backend, mut orch) = build(grid, config("echo"), vec![]);
        let summary = orch.run().await.unwrap();
        assert_eq!(summary.attempted, 1);
        assert_eq!(backend.cell(&sheet(), 1, 4), "old");
        assert_eq!(backend.cell(&sheet(), 2, 4), "b");
        assert_eq!(backend.cell(&sheet(), 2, 2), "");
    }

    #[tokio::test]
    async fn processed_label_is_ignored_without_resume() {
        let grid = Grid::from_strs(&[&[H, "", "", C, ""], &["1", "処理済み", "", "a", "old"]]);
        let mut cfg = config("echo");
        cfg.resume_processed = false;
        let (backend, mut orch) = build(grid, cfg, vec![]);
        let summary = orch.run().await.unwrap();
        assert_eq!(summary.attempted, 1);
        assert_eq!(backend.cell(&sheet(), 1, 4), "a");
    }

    #[test]
    fn build_registry_honours_resume_flag() {
        let grid = Grid::from_strs(&[&[H, "", "", C, ""], &["1", "処理済み", "", "a", "old"]]);
        let mut cfg = config("echo");
        let layout = cfg.structure_analyzer().analyze(&grid).unwrap();

        let resumed = build_registry(&cfg, &grid, &layout);
        assert_eq!(resumed.progress().successful, 1);

        cfg.resume_processed = false;
        let fresh = build_registry(&cfg, &grid, &layout);
        assert_eq!(fresh.progress().successful, 0);
        assert_eq!(fresh.tasks_with_status(ProcessingStatus::Unprocessed).count(), 1);
    }

    #[tokio::test]
    async fn reset_failed_allows_second_pass() {
        let worker = ScriptedWorker::new(vec![Err(WorkerError::Fatal("denied".into()))]);
        let (backend, mut orch) = build(
            single_task_grid("question"),
            config("scripted"),
            vec![("scripted", worker.clone() as Arc<dyn Worker>)],
        );
        let first = orch.run().await.unwrap();
        assert_eq!(first.progress.failed, 1);

        let second = orch.run().await.unwrap();
        assert_eq!(second.attempted, 0);

        assert_eq!(orch.reset_failed(), 1);
        let third = orch.run().await.unwrap();
        assert_eq!(third.attempted, 1);
        assert_eq!(third.progress.successful, 1);
        assert_eq!(third.progress.failed, 0);
        assert_eq!(backend.cell(&sheet(), 1, 4), "question");
        assert_eq!(backend.cell(&sheet(), 1, 2), "");
    }

    #[tokio::test]
    async fn reset_sheet_clears_stuck_rows_in_one_transaction() {
        let grid = Grid::from_strs(&[
            &[H, "", "", C, ""],
            &["1", "処理中", "", "a", ""],
            &["2", "エラー", "boom", "b", ""],
            &["3", "処理済み", "", "c", "done"],
        ]);
        let (backend, mut orch) = build(grid, config("echo"), vec![]);
        assert_eq!(orch.reset_sheet().await.unwrap(), 2);

        assert_eq!(backend.cell(&sheet(), 1, 1), "未処理");
        assert_eq!(backend.cell(&sheet(), 2, 1), "未処理");
        assert_eq!(backend.cell(&sheet(), 2, 2), "");
        assert_eq!(backend.cell(&sheet(), 3, 1), "処理済み");
        let log = orch.store().transaction_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].updates.len(), 4);
    }

    #[tokio::test]
    async fn events_describe_the_run() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let (_backend, orch) = build(single_task_grid("q"), config("echo"), vec![]);
        let mut orch = orch.with_events(tx);
        orch.run().await.unwrap();
        drop(orch);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert!(matches!(
            events.first(),
            Some(RunEvent::Started { total: 1, pending: 1, .. })
        ));
        assert!(events.iter().any(|e| matches!(e, RunEvent::TaskStarted { worker, .. } if worker == "echo")));
        assert!(events.iter().any(|e| matches!(
            e,
            RunEvent::TaskFinished(ProgressEvent { status: ProcessingStatus::Processed, .. })
        )));
        assert!(matches!(events.last(), Some(RunEvent::Finished(s)) if s.progress.successful == 1));
    }

    /// Echoes after noting what the status cell of its task holds.
    struct SeesStatusCell {
        backend: MemoryStore,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Worker for SeesStatusCell {
        fn name(&self) -> &str {
            "sees-status"
        }

        async fn execute(&self, prompt: &str, _timeout: Duration) -> Result<String, WorkerError> {
            self.seen.lock().unwrap().push(self.backend.cell(&sheet(), 1, 1));
            Ok(prompt.to_string())
        }
    }

    #[tokio::test]
    async fn status_cell_reads_processing_while_worker_runs() {
        let backend = MemoryStore::new();
        backend.insert_sheet(&sheet(), single_task_grid("question"));
        let watcher = Arc::new(SeesStatusCell {
            backend: backend.clone(),
            seen: Mutex::new(Vec::new()),
        });
        let mut workers = WorkerRegistry::new();
        workers.register_instance("sees-status", watcher.clone());
        let mut orch = TaskOrchestrator::new(config("sees-status"), backend.clone(), &workers).unwrap();
        orch.run().await.unwrap();

        assert_eq!(*watcher.seen.lock().unwrap(), vec!["処理中".to_string()]);
        assert_eq!(backend.cell(&sheet(), 1, 1), "処理済み");
    }

    /// Echoes, but makes the store reject the next write.
    struct BreaksStore(MemoryStore);

    #[async_trait]
    impl Worker for BreaksStore {
        fn name(&self) -> &str {
            "breaks-store"
        }

        async fn execute(&self, prompt: &str, _timeout: Duration) -> Result<String, WorkerError> {
            self.0.fail_writes(
                1,
                TransportError::Api {
                    status: 400,
                    message: "bad range".into(),
                },
            );
            Ok(prompt.to_string())
        }
    }

    #[tokio::test]
    async fn failed_result_write_rolls_back_and_marks_error() {
        let backend = MemoryStore::new();
        backend.insert_sheet(&sheet(), single_task_grid("question"));
        let mut workers = WorkerRegistry::new();
        workers.register_instance("breaks-store", Arc::new(BreaksStore(backend.clone())));
        let mut orch = TaskOrchestrator::new(config("breaks-store"), backend.clone(), &workers).unwrap();
        orch.run().await.unwrap();

        let task = orch.registry().get(TaskKey::new(1, 3)).unwrap();
        assert_eq!(task.status, ProcessingStatus::Error);
        assert!(task.error_message.starts_with("failed to write result"));
        assert_eq!(backend.cell(&sheet(), 1, 4), "");
        assert_eq!(backend.cell(&sheet(), 1, 1), "エラー");
        let log = orch.store().transaction_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].status, TransactionStatus::RolledBack);
        assert_eq!(log[1].status, TransactionStatus::Committed);
    }
}
