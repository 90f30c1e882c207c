use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::TabularStore;
use crate::error::TransportError;
use crate::grid::{CellUpdate, Grid, SheetRef, parse_a1};

#[derive(Debug, Default)]
struct MemoryState {
    sheets: HashMap<SheetRef, Grid>,
    read_calls: usize,
    write_calls: usize,
    read_failures: VecDeque<TransportError>,
    write_failures: VecDeque<TransportError>,
}

/// In-process tabular store. Backs the `demo` command and the tests.
///
/// Clones share state, so a test can keep a handle for inspection while the
/// data store owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_sheet(&self, sheet: &SheetRef, grid: Grid) {
        self.lock().sheets.insert(sheet.clone(), grid);
    }

    pub fn grid(&self, sheet: &SheetRef) -> Option<Grid> {
        self.lock().sheets.get(sheet).cloned()
    }

    #[cfg(test)]
    pub fn cell(&self, sheet: &SheetRef, row: usize, col: usize) -> String {
        self.lock()
            .sheets
            .get(sheet)
            .map(|g| g.cell(row, col).to_string())
            .unwrap_or_default()
    }

    /// Number of `read_range` calls, failed ones included.
    pub fn read_calls(&self) -> usize {
        self.lock().read_calls
    }

    /// Number of `batch_update` calls, failed ones included.
    pub fn write_calls(&self) -> usize {
        self.lock().write_calls
    }

    /// Makes the next `count` reads fail with `err`.
    #[cfg(test)]
    pub fn fail_reads(&self, count: usize, err: TransportError) {
        let mut state = self.lock();
        state.read_failures.extend(std::iter::repeat_n(err, count));
    }

    /// Makes the next `count` writes fail with `err`.
    #[cfg(test)]
    pub fn fail_writes(&self, count: usize, err: TransportError) {
        let mut state = self.lock();
        state.write_failures.extend(std::iter::repeat_n(err, count));
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Parses "B5" or "A1:Z10" into inclusive 0-based corners.
fn parse_range(a1_range: &str) -> Result<((usize, usize), (usize, usize)), TransportError> {
    let bad = || TransportError::Api {
        status: 400,
        message: format!("Unable to parse range: {a1_range}"),
    };
    let (start, end) = match a1_range.split_once(':') {
        Some((s, e)) => (s, e),
        None => (a1_range, a1_range),
    };
    let start = parse_a1(start).ok_or_else(bad)?;
    let end = parse_a1(end).ok_or_else(bad)?;
    Ok((start, end))
}

#[async_trait]
impl TabularStore for MemoryStore {
    async fn get_sheet_names(&self, spreadsheet_id: &str) -> Result<Vec<String>, TransportError> {
        let state = self.lock();
        let mut names: Vec<String> = state
            .sheets
            .keys()
            .filter(|s| s.spreadsheet_id == spreadsheet_id)
            .map(|s| s.sheet_name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn read_range(&self, sheet: &SheetRef, a1_range: &str) -> Result<Grid, TransportError> {
        let mut state = self.lock();
        state.read_calls += 1;
        if let Some(err) = state.read_failures.pop_front() {
            return Err(err);
        }
        let ((r0, c0), (r1, c1)) = parse_range(a1_range)?;
        let grid = state.sheets.get(sheet).ok_or_else(|| TransportError::Api {
            status: 400,
            message: format!("Unable to parse range: {}", sheet.range(a1_range)),
        })?;
        // Like the real API, trailing blank rows and columns are not returned.
        let height = grid.height().min(r1 + 1).saturating_sub(r0);
        let width = grid.width().min(c1 + 1).saturating_sub(c0);
        if height == 0 || width == 0 {
            return Ok(Grid::default());
        }
        Ok(grid.slice(r0, c0, height, width))
    }

    async fn batch_update(&self, sheet: &SheetRef, updates: &[CellUpdate]) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.write_calls += 1;
        if let Some(err) = state.write_failures.pop_front() {
            return Err(err);
        }
        let grid = state.sheets.entry(sheet.clone()).or_default();
        for u in updates {
            grid.set(u.row, u.col, u.value.clone());
        }
        Ok(())
    }
}
