//! Grid snapshot and cell addressing.
//!
//! A [`Grid`] is the read-only, rectangular copy of a sheet taken once per
//! run. Rows and columns are 0-based everywhere in the crate; conversion to
//! A1 notation happens only at the store boundary.

use serde::{Deserialize, Serialize};

/// Rectangular 2D snapshot of string cells.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Grid {
    rows: Vec<Vec<String>>,
    width: usize,
}

impl Grid {
    /// Builds a grid from ragged rows, padding every row with empty cells
    /// up to the longest one.
    pub fn from_rows(rows: Vec<Vec<String>>) -> Self {
        let width = rows.iter().map(Vec::len).max().unwrap_or(0);
        Self::padded(rows, width)
    }

    /// Builds a grid padded to at least `min_width` columns.
    pub fn padded(mut rows: Vec<Vec<String>>, min_width: usize) -> Self {
        let width = rows.iter().map(Vec::len).max().unwrap_or(0).max(min_width);
        for row in &mut rows {
            row.resize(width, String::new());
        }
        Self { rows, width }
    }

    /// Convenience constructor for literals in tests and the demo sheet.
    pub fn from_strs(rows: &[&[&str]]) -> Self {
        Self::from_rows(
            rows.iter()
                .map(|r| r.iter().map(|c| (*c).to_string()).collect())
                .collect(),
        )
    }

    pub fn height(&self) -> usize {
        self.rows.len()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Cell value, or `""` when the address lies outside the grid.
    pub fn cell(&self, row: usize, col: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn row(&self, row: usize) -> Option<&[String]> {
        self.rows.get(row).map(Vec::as_slice)
    }

    pub fn rows(&self) -> impl Iterator<Item = &[String]> {
        self.rows.iter().map(Vec::as_slice)
    }

    /// Writes a cell, growing the grid when needed.
    pub fn set(&mut self, row: usize, col: usize, value: impl Into<String>) {
        if col >= self.width {
            self.width = col + 1;
            for r in &mut self.rows {
                r.resize(self.width, String::new());
            }
        }
        while self.rows.len() <= row {
            self.rows.push(vec![String::new(); self.width]);
        }
        self.rows[row][col] = value.into();
    }

    /// Returns the sub-grid starting at (`row`, `col`) with the given shape.
    pub fn slice(&self, row: usize, col: usize, height: usize, width: usize) -> Grid {
        let rows = (row..row + height)
            .map(|r| (col..col + width).map(|c| self.cell(r, c).to_string()).collect())
            .collect();
        Grid::from_rows(rows)
    }
}

/// Address of one sheet (tab) inside a spreadsheet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SheetRef {
    pub spreadsheet_id: String,
    pub sheet_name: String,
}

impl SheetRef {
    pub fn new(spreadsheet_id: impl Into<String>, sheet_name: impl Into<String>) -> Self {
        Self {
            spreadsheet_id: spreadsheet_id.into(),
            sheet_name: sheet_name.into(),
        }
    }

    /// Qualifies an A1 range with the sheet name: `'Sheet 1'!B5`.
    pub fn range(&self, a1: &str) -> String {
        format!("'{}'!{a1}", self.sheet_name.replace('\'', "''"))
    }
}

/// One pending cell write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellUpdate {
    pub row: usize,
    pub col: usize,
    pub value: String,
}

impl CellUpdate {
    pub fn new(row: usize, col: usize, value: impl Into<String>) -> Self {
        Self {
            row,
            col,
            value: value.into(),
        }
    }

    pub fn a1(&self) -> String {
        a1_notation(self.row, self.col)
    }
}

/// 0 → "A", 25 → "Z", 26 → "AA".
pub fn column_letter(col: usize) -> String {
    let mut n = col + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

/// 0-based (row, col) → A1 notation, e.g. (4, 1) → "B5".
pub fn a1_notation(row: usize, col: usize) -> String {
    format!("{}{}", column_letter(col), row + 1)
}

/// Parses a column reference such as "C" or "aa" into a 0-based index.
pub fn parse_column(letters: &str) -> Option<usize> {
    if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let n = letters
        .chars()
        .map(|c| c.to_ascii_uppercase())
        .try_fold(0usize, |acc, c| {
            acc.checked_mul(26)?.checked_add(c as usize - 'A' as usize + 1)
        })?;
    Some(n - 1)
}

/// Parses A1 notation into a 0-based (row, col) pair.
pub fn parse_a1(a1: &str) -> Option<(usize, usize)> {
    let split = a1.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = a1.split_at(split);
    let col = parse_column(letters)?;
    let row: usize = digits.parse().ok()?;
    if row == 0 {
        return None;
    }
    Some((row - 1, col))
}

/// Extracts the spreadsheet id from a share URL. A bare id is returned as-is.
pub fn spreadsheet_id_from_url(input: &str) -> Option<String> {
    let input = input.trim();
    const MARKER: &str = "/spreadsheets/d/";
    if let Some(start) = input.find(MARKER) {
        let rest = &input[start + MARKER.len()..];
        let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        let id = &rest[..end];
        return (!id.is_empty()).then(|| id.to_string());
    }
    let is_bare_id = !input.is_empty()
        && input
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    is_bare_id.then(|| input.to_string())
}
