//! Access to the external tabular store.
//!
//! [`TabularStore`] is the raw contract of the spreadsheet API. Everything
//! the orchestrator reads or writes goes through [`TransactionalDataStore`],
//! which adds caching, rate limiting, transport retries and compensating
//! multi-cell transactions on top of it.

mod data_store;
mod memory;
mod rate_limit;
mod sheets;

pub use data_store::{StoreOptions, TransactionStatus, TransactionalDataStore};
pub use memory::MemoryStore;
pub use sheets::SheetsClient;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::grid::{CellUpdate, Grid, SheetRef};

/// The spreadsheet API as consumed by this crate.
#[async_trait]
pub trait TabularStore: Send + Sync {
    /// Titles of every sheet (tab) in the spreadsheet.
    async fn get_sheet_names(&self, spreadsheet_id: &str) -> Result<Vec<String>, TransportError>;

    /// Reads an A1 range (without the sheet prefix) from one sheet. Trailing
    /// empty cells may be missing from the returned grid.
    async fn read_range(&self, sheet: &SheetRef, a1_range: &str) -> Result<Grid, TransportError>;

    /// Writes every update in a single call.
    async fn batch_update(&self, sheet: &SheetRef, updates: &[CellUpdate]) -> Result<(), TransportError>;
}
