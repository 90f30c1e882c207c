use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::TabularStore;
use super::rate_limit::RateLimiter;
use crate::error::{StoreError, TransportError};
use crate::grid::{CellUpdate, Grid, SheetRef, a1_notation, column_letter};

/// Tuning for the store layer.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Store calls admitted per rolling minute.
    pub rate_limit_per_minute: usize,
    /// Total attempts per store call, including the first.
    pub transport_attempts: u32,
    /// Delay before the second attempt; doubles after each failure.
    pub transport_base_delay: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: 90,
            transport_attempts: 3,
            transport_base_delay: Duration::from_millis(1000),
        }
    }
}

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Committed,
    RolledBack,
}

/// A buffered write together with the sheet it targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub sheet: SheetRef,
    #[serde(flatten)]
    pub update: CellUpdate,
}

/// One entry per finished transaction, committed or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionLog {
    pub id: Uuid,
    /// Buffered writes, one per cell, last value wins.
    pub updates: Vec<PendingWrite>,
    /// When the transaction finished.
    pub timestamp: DateTime<Utc>,
    pub status: TransactionStatus,
    /// Why it was rolled back, including a failed compensating write.
    pub error_message: Option<String>,
}

#[derive(Debug)]
struct OpenTransaction {
    id: Uuid,
    writes: Vec<PendingWrite>,
    originals: Vec<PendingWrite>,
    touched: HashSet<(SheetRef, usize, usize)>,
}

impl OpenTransaction {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            writes: Vec::new(),
            originals: Vec::new(),
            touched: HashSet::new(),
        }
    }

    fn buffered(&self, sheet: &SheetRef, row: usize, col: usize) -> Option<&str> {
        self.writes
            .iter()
            .rev()
            .find(|w| &w.sheet == sheet && w.update.row == row && w.update.col == col)
            .map(|w| w.update.value.as_str())
    }

    fn buffer(&mut self, sheet: &SheetRef, update: CellUpdate) {
        match self
            .writes
            .iter_mut()
            .find(|w| &w.sheet == sheet && w.update.row == update.row && w.update.col == update.col)
        {
            Some(existing) => existing.update.value = update.value,
            None => self.writes.push(PendingWrite {
                sheet: sheet.clone(),
                update,
            }),
        }
    }
}

/// Groups writes by sheet, preserving first-seen order.
fn by_sheet(writes: &[PendingWrite]) -> Vec<(SheetRef, Vec<CellUpdate>)> {
    let mut groups: Vec<(SheetRef, Vec<CellUpdate>)> = Vec::new();
    for w in writes {
        match groups.iter_mut().find(|(s, _)| s == &w.sheet) {
            Some((_, updates)) => updates.push(w.update.clone()),
            None => groups.push((w.sheet.clone(), vec![w.update.clone()])),
        }
    }
    groups
}

/// The single path through which the orchestrator touches the store.
///
/// Reads are cached per cell. Every network call goes through the
/// rate limiter and is retried on transient transport errors. Writes made
/// while a transaction is open are buffered and sent as one batch on
/// commit; on rollback the touched cells are restored to the values they
/// had before the transaction. The external store has no transaction
/// primitive, so rollback is a compensating write, not isolation.
pub struct TransactionalDataStore<S> {
    backend: S,
    limiter: RateLimiter,
    options: StoreOptions,
    cache: HashMap<SheetRef, HashMap<(usize, usize), String>>,
    open: Option<OpenTransaction>,
    log: Vec<TransactionLog>,
}

impl<S: TabularStore> TransactionalDataStore<S> {
    /// Wraps `backend` with an empty cache and a fresh rate-limit window.
    pub fn new(backend: S, options: StoreOptions) -> Self {
        Self {
            backend,
            limiter: RateLimiter::per_minute(options.rate_limit_per_minute),
            options,
            cache: HashMap::new(),
            open: None,
            log: Vec::new(),
        }
    }

    /// Every finished transaction, oldest first.
    pub fn transaction_log(&self) -> &[TransactionLog] {
        &self.log
    }

    pub fn in_transaction(&self) -> bool {
        self.open.is_some()
    }

    /// Cached value of a cell, without touching the network.
    pub fn cached(&self, sheet: &SheetRef, row: usize, col: usize) -> Option<&str> {
        self.cache
            .get(sheet)
            .and_then(|cells| cells.get(&(row, col)))
            .map(String::as_str)
    }

    /// Sheet titles of a spreadsheet. Rate limited and retried like any
    /// other call.
    pub async fn get_sheet_names(&mut self, spreadsheet_id: &str) -> Result<Vec<String>, StoreError> {
        let mut attempt = 0;
        loop {
            self.limiter.acquire().await;
            match self.backend.get_sheet_names(spreadsheet_id).await {
                Ok(names) => return Ok(names),
                Err(err) => self.backoff_or_fail("get_sheet_names", &mut attempt, err).await?,
            }
        }
    }

    /// Reads `A1:<last col><max_rows>` in one call, pads the result to
    /// `max_columns` and primes the cache with every cell.
    pub async fn read_grid(
        &mut self,
        sheet: &SheetRef,
        max_rows: usize,
        max_columns: usize,
    ) -> Result<Grid, StoreError> {
        let range = format!("A1:{}{}", column_letter(max_columns.max(1) - 1), max_rows.max(1));
        let raw = self.fetch_range(sheet, &range).await?;
        let rows: Vec<Vec<String>> = raw.rows().map(<[String]>::to_vec).collect();
        let grid = Grid::padded(rows, max_columns);

        let cells = self.cache.entry(sheet.clone()).or_default();
        for (r, row) in grid.rows().enumerate() {
            for (c, value) in row.iter().enumerate() {
                cells.insert((r, c), value.clone());
            }
        }
        info!(
            sheet = %sheet.sheet_name,
            rows = grid.height(),
            columns = grid.width(),
            "sheet snapshot loaded"
        );
        Ok(grid)
    }

    /// Reads one cell. Inside a transaction, a buffered write to the same
    /// cell is returned. Otherwise the cache answers, and a miss costs one
    /// rate-limited read.
    pub async fn read_cell(&mut self, sheet: &SheetRef, row: usize, col: usize) -> Result<String, StoreError> {
        if let Some(value) = self.open.as_ref().and_then(|tx| tx.buffered(sheet, row, col)) {
            return Ok(value.to_string());
        }
        self.read_committed(sheet, row, col).await
    }

    async fn read_committed(&mut self, sheet: &SheetRef, row: usize, col: usize) -> Result<String, StoreError> {
        if let Some(value) = self.cached(sheet, row, col) {
            return Ok(value.to_string());
        }
        let grid = self.fetch_range(sheet, &a1_notation(row, col)).await?;
        let value = grid.cell(0, 0).to_string();
        self.cache
            .entry(sheet.clone())
            .or_default()
            .insert((row, col), value.clone());
        debug!(cell = %a1_notation(row, col), "cell read from store");
        Ok(value)
    }

    /// Writes one cell: buffered when a transaction is open, immediate
    /// otherwise. The first write to a cell inside a transaction captures
    /// its pre-transaction value for rollback.
    pub async fn write_cell(
        &mut self,
        sheet: &SheetRef,
        row: usize,
        col: usize,
        value: &str,
    ) -> Result<(), StoreError> {
        let Some(first_touch) = self
            .open
            .as_ref()
            .map(|tx| !tx.touched.contains(&(sheet.clone(), row, col)))
        else {
            return self.batch_write(sheet, &[CellUpdate::new(row, col, value)]).await;
        };

        let original = if first_touch {
            Some(self.read_committed(sheet, row, col).await?)
        } else {
            None
        };
        let tx = self.open.as_mut().ok_or(StoreError::NoOpenTransaction)?;
        if let Some(original) = original {
            tx.touched.insert((sheet.clone(), row, col));
            tx.originals.push(PendingWrite {
                sheet: sheet.clone(),
                update: CellUpdate::new(row, col, original),
            });
        }
        tx.buffer(sheet, CellUpdate::new(row, col, value));
        Ok(())
    }

    /// Sends all updates in one call. On success the cache entries of the
    /// updated cells are dropped.
    pub async fn batch_write(&mut self, sheet: &SheetRef, updates: &[CellUpdate]) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut attempt = 0;
        loop {
            self.limiter.acquire().await;
            match self.backend.batch_update(sheet, updates).await {
                Ok(()) => break,
                Err(err) => self.backoff_or_fail("batch_update", &mut attempt, err).await?,
            }
        }
        if let Some(cells) = self.cache.get_mut(sheet) {
            for u in updates {
                cells.remove(&(u.row, u.col));
            }
        }
        debug!(sheet = %sheet.sheet_name, cells = updates.len(), "batch write applied");
        Ok(())
    }

    /// Opens a transaction. Transactions do not nest.
    pub fn begin_transaction(&mut self) -> Result<(), StoreError> {
        if self.in_transaction() {
            return Err(StoreError::TransactionAlreadyOpen);
        }
        let tx = OpenTransaction::new();
        debug!(transaction = %tx.id, "transaction opened");
        self.open = Some(tx);
        Ok(())
    }

    /// Closes the open transaction according to the outcome of the work done
    /// inside it: `Ok` commits, `Err` rolls back. A failed commit is rolled
    /// back as well and reported through `E`.
    pub async fn finish_transaction<T, E>(&mut self, outcome: Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError> + Display,
    {
        match outcome {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback(&err.to_string()).await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Sends every buffered write as one batch per sheet.
    pub async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.open.take().ok_or(StoreError::NoOpenTransaction)?;
        for (sheet, updates) in by_sheet(&tx.writes) {
            if let Err(err) = self.batch_write(&sheet, &updates).await {
                warn!(transaction = %tx.id, error = %err, "commit failed, restoring touched cells");
                let message = match self.restore(&tx).await {
                    Ok(()) => err.to_string(),
                    Err(restore_err) => format!("{err}; compensating write failed: {restore_err}"),
                };
                self.record(tx, TransactionStatus::RolledBack, Some(message));
                return Err(err);
            }
        }
        debug!(transaction = %tx.id, writes = tx.writes.len(), "transaction committed");
        self.record(tx, TransactionStatus::Committed, None);
        Ok(())
    }

    /// Discards buffered writes and restores every touched cell to its
    /// pre-transaction value.
    pub async fn rollback(&mut self, reason: &str) -> Result<(), StoreError> {
        let tx = self.open.take().ok_or(StoreError::NoOpenTransaction)?;
        warn!(transaction = %tx.id, reason, "rolling back transaction");
        let restored = self.restore(&tx).await;
        self.record(tx, TransactionStatus::RolledBack, Some(reason.to_string()));
        restored
    }

    async fn restore(&mut self, tx: &OpenTransaction) -> Result<(), StoreError> {
        let mut result = Ok(());
        for (sheet, originals) in by_sheet(&tx.originals) {
            if let Err(err) = self.batch_write(&sheet, &originals).await {
                warn!(transaction = %tx.id, error = %err, "compensating write failed");
                result = Err(err);
            }
        }
        result
    }

    fn record(&mut self, tx: OpenTransaction, status: TransactionStatus, error_message: Option<String>) {
        self.log.push(TransactionLog {
            id: tx.id,
            updates: tx.writes,
            timestamp: Utc::now(),
            status,
            error_message,
        });
    }

    async fn fetch_range(&mut self, sheet: &SheetRef, range: &str) -> Result<Grid, StoreError> {
        let mut attempt = 0;
        loop {
            self.limiter.acquire().await;
            match self.backend.read_range(sheet, range).await {
                Ok(grid) => return Ok(grid),
                Err(err) => self.backoff_or_fail("read_range", &mut attempt, err).await?,
            }
        }
    }

    /// Sleeps before the next attempt, or returns the error once it is not
    /// retryable or the attempts are used up.
    async fn backoff_or_fail(
        &self,
        call: &str,
        attempt: &mut u32,
        err: TransportError,
    ) -> Result<(), StoreError> {
        *attempt += 1;
        if !err.is_retryable() || *attempt >= self.options.transport_attempts {
            warn!(call, attempts = *attempt, error = %err, "store call failed");
            return Err(err.into());
        }
        let mut delay = self
            .options
            .transport_base_delay
            .saturating_mul(2u32.saturating_pow(*attempt - 1));
        if let TransportError::RateLimited { retry_after_ms } = err {
            delay = delay.max(Duration::from_millis(retry_after_ms));
        }
        warn!(
            call,
            attempt = *attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "store call failed, retrying"
        );
        sleep(delay).await;
        Ok(())
    }
}
