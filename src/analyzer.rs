//! Sheet structure detection.
//!
//! A sheet is laid out around a single header row, found by an exact match
//! of the header marker in column A. Every header cell equal to the column
//! marker is a task column; its neighbours hold status (`c-2`), error text
//! (`c-1`) and the result (`c+1`). Task rows follow the header and are
//! numbered `1, 2, 3, …` in column A.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::StructureError;
use crate::grid::{Grid, column_letter};

/// Derived column positions for one task column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ColumnMapping {
    /// Task column; holds the source text of each row.
    pub copy_col: usize,
    /// Status label column, `copy_col - 2`. Negative near the left edge.
    pub process_col: isize,
    /// Error text column, `copy_col - 1`.
    pub error_col: isize,
    /// Result column, `copy_col + 1`.
    pub paste_col: isize,
    /// False when any derived column falls outside the grid.
    pub is_valid: bool,
}

impl ColumnMapping {
    /// Status column, if it can be written without touching column A.
    pub fn status_target(&self) -> Option<usize> {
        writable(self.process_col)
    }

    /// Error text column, under the same rule.
    pub fn error_target(&self) -> Option<usize> {
        writable(self.error_col)
    }

    /// Result column, under the same rule.
    pub fn paste_target(&self) -> Option<usize> {
        writable(self.paste_col)
    }
}

// Column A carries the header marker and the row numbering.
fn writable(col: isize) -> Option<usize> {
    (col >= 1).then_some(col as usize)
}

/// Result of analysing a grid: everything the run needs to create tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SheetLayout {
    /// 0-based index of the header row.
    pub header_row: usize,
    /// One mapping per task column, ascending.
    pub mappings: Vec<ColumnMapping>,
    /// 0-based indices of the numbered rows below the header.
    pub task_rows: Vec<usize>,
}

impl SheetLayout {
    /// Tasks the layout yields: one per (row, task column).
    pub fn task_count(&self) -> usize {
        self.mappings.len() * self.task_rows.len()
    }
}

/// Returns the first row (within `scan_limit` rows) whose trimmed column-A
/// value equals `marker`.
pub fn find_header_row(grid: &Grid, marker: &str, scan_limit: usize) -> Option<usize> {
    grid.rows()
        .take(scan_limit)
        .position(|row| row.first().map(|c| c.trim() == marker).unwrap_or(false))
}

/// Every column index whose trimmed value equals `marker`, ascending.
pub fn find_marked_columns(header_row: &[String], marker: &str) -> Vec<usize> {
    header_row
        .iter()
        .enumerate()
        .filter(|(_, cell)| cell.trim() == marker)
        .map(|(idx, _)| idx)
        .collect()
}

/// Pure position arithmetic around a task column. `max_col` is the grid
/// width; a paste column at or beyond it lies outside the grid.
pub fn compute_column_mapping(copy_col: usize, max_col: usize) -> ColumnMapping {
    let copy = copy_col as isize;
    let process_col = copy - 2;
    let error_col = copy - 1;
    let paste_col = copy + 1;
    ColumnMapping {
        copy_col,
        process_col,
        error_col,
        paste_col,
        is_valid: process_col >= 0 && error_col >= 0 && paste_col < max_col as isize,
    }
}

/// Rows after the header whose column A continues the sequence `1, 2, 3, …`.
///
/// Scanning stops at the first blank cell or the first value that is not the
/// next expected number; a gap ends the range even if numbering resumes later.
pub fn find_task_row_range(grid: &Grid, header_row_idx: usize) -> Vec<usize> {
    let mut rows = Vec::new();
    let mut expected: u64 = 1;
    for row_idx in header_row_idx + 1..grid.height() {
        let value = grid.cell(row_idx, 0).trim();
        if value.is_empty() {
            debug!(row = row_idx, "task row scan stopped at blank cell");
            break;
        }
        match value.parse::<u64>() {
            Ok(n) if n == expected => {
                rows.push(row_idx);
                expected += 1;
            }
            _ => {
                debug!(row = row_idx, value, expected, "task row scan stopped at out-of-sequence value");
                break;
            }
        }
    }
    rows
}

/// Locates header, task columns and task rows in a grid.
#[derive(Debug, Clone)]
pub struct GridStructureAnalyzer {
    // Exact column-A text of the header row.
    header_marker: String,
    // Exact header text of a task column.
    column_marker: String,
    // Rows searched for the header, from the top.
    scan_limit: usize,
}

impl GridStructureAnalyzer {
    /// Analyzer with the default scan limit of 1000 rows.
    pub fn new(header_marker: impl Into<String>, column_marker: impl Into<String>) -> Self {
        Self {
            header_marker: header_marker.into(),
            column_marker: column_marker.into(),
            scan_limit: 1000,
        }
    }

    /// Caps how many rows are searched for the header marker.
    pub fn with_scan_limit(mut self, scan_limit: usize) -> Self {
        self.scan_limit = scan_limit;
        self
    }

    /// Header row index, or `HeaderNotFound` naming the marker.
    pub fn header_row(&self, grid: &Grid) -> Result<usize, StructureError> {
        find_header_row(grid, &self.header_marker, self.scan_limit).ok_or_else(|| {
            StructureError::HeaderNotFound {
                marker: self.header_marker.clone(),
                scanned: grid.height().min(self.scan_limit),
            }
        })
    }

    /// Marked columns of the header row, or `NoTaskColumns` when none.
    pub fn task_columns(&self, grid: &Grid, header_row: usize) -> Result<Vec<usize>, StructureError> {
        let columns = grid
            .row(header_row)
            .map(|row| find_marked_columns(row, &self.column_marker))
            .unwrap_or_default();
        if columns.is_empty() {
            return Err(StructureError::NoTaskColumns {
                marker: self.column_marker.clone(),
                header_row,
            });
        }
        Ok(columns)
    }

    /// Runs the full detection. Missing header or task columns are fatal;
    /// invalid mappings and an empty row range are only reported.
    pub fn analyze(&self, grid: &Grid) -> Result<SheetLayout, StructureError> {
        let header_row = self.header_row(grid)?;
        info!(row = header_row + 1, "header row found");

        let columns = self.task_columns(grid, header_row)?;
        let mappings: Vec<ColumnMapping> = columns
            .iter()
            .map(|&c| compute_column_mapping(c, grid.width()))
            .collect();
        for m in &mappings {
            if m.is_valid {
                debug!(column = %column_letter(m.copy_col), "task column mapped");
            } else {
                warn!(
                    column = %column_letter(m.copy_col),
                    process_col = m.process_col,
                    error_col = m.error_col,
                    paste_col = m.paste_col,
                    "task column has derived columns outside the grid"
                );
            }
        }
        info!(
            columns = ?columns.iter().map(|&c| column_letter(c)).collect::<Vec<_>>(),
            "task columns found"
        );

        let task_rows = find_task_row_range(grid, header_row);
        if task_rows.is_empty() {
            warn!("no numbered task rows below the header");
        } else {
            info!(count = task_rows.len(), first = task_rows[0] + 1, "task rows found");
        }

        Ok(SheetLayout {
            header_row,
            mappings,
            task_rows,
        })
    }
}
