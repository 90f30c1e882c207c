//! Run configuration loaded from `cellrelay.toml`.
//!
//! Every field has a default, so a missing file or a partial file both
//! work. Secrets can come from the environment (`ANTHROPIC_API_KEY`,
//! `GOOGLE_SHEETS_ACCESS_TOKEN`), which takes precedence over the file.
//! The config is built once in `main` and handed to constructors.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::analyzer::GridStructureAnalyzer;
use crate::error::ConfigError;
use crate::grid::{SheetRef, parse_column, spreadsheet_id_from_url};
use crate::orchestrator::RetryPolicy;
use crate::store::StoreOptions;

pub const DEFAULT_CONFIG_FILE: &str = "cellrelay.toml";

/// Everything a run needs, read once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// Spreadsheet URL or bare id.
    #[serde(default)]
    pub spreadsheet: String,

    /// Tab holding the task table.
    #[serde(default = "default_sheet_name")]
    pub sheet_name: String,

    /// Worker attempts per task before it is marked ERROR.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay between worker attempts; doubles per retry.
    #[serde(default = "default_base_delay_seconds")]
    pub base_delay_seconds: u64,

    /// Upper bound for a single backoff delay.
    #[serde(default = "default_max_backoff_seconds")]
    pub max_backoff_seconds: u64,

    /// Hard cap on store calls in any rolling 60 second window.
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: usize,

    /// Create tasks with a blank source cell as SKIPPED.
    #[serde(default = "default_true")]
    pub skip_empty_cells: bool,

    /// Rows whose status cell already reads the processed label are not
    /// run again.
    #[serde(default = "default_true")]
    pub resume_processed: bool,

    /// Column-A text that identifies the header row.
    #[serde(default = "default_header_marker")]
    pub header_marker: String,

    /// Header text that marks a task (copy) column.
    #[serde(default = "default_column_marker")]
    pub column_marker: String,

    /// Column key (0-based index or letter) → worker id.
    #[serde(default)]
    pub column_workers: BTreeMap<String, String>,

    /// Worker for task columns absent from `column_workers`.
    #[serde(default)]
    pub default_worker: Option<String>,

    /// Limit for one worker call; exceeding it costs one attempt.
    #[serde(default = "default_worker_timeout_seconds")]
    pub worker_timeout_seconds: u64,

    /// Rows searched for the header marker.
    #[serde(default = "default_max_header_scan_rows")]
    pub max_header_scan_rows: usize,

    /// Rows read into the sheet snapshot.
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,

    /// Columns read into the sheet snapshot.
    #[serde(default = "default_max_columns")]
    pub max_columns: usize,

    /// Attempts per store call on transient transport errors.
    #[serde(default = "default_transport_retries")]
    pub transport_retries: u32,

    /// First delay between store attempts, in milliseconds.
    #[serde(default = "default_transport_base_delay_ms")]
    pub transport_base_delay_ms: u64,

    /// Status column text per task state.
    #[serde(default)]
    pub status_labels: StatusLabels,

    /// Settings of the `anthropic` worker.
    #[serde(default)]
    pub anthropic: AnthropicSettings,

    /// OAuth bearer token for the Sheets API, used as-is.
    #[serde(default)]
    pub sheets_access_token: String,
}

/// Text written to the status column for each task state.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatusLabels {
    /// Row not started yet.
    #[serde(default = "default_unprocessed_label")]
    pub unprocessed: String,
    /// Worker running; left behind if the process dies mid-task.
    #[serde(default = "default_processing_label")]
    pub processing: String,
    /// Result written.
    #[serde(default = "default_processed_label")]
    pub processed: String,
    /// Retries exhausted or fatal worker error.
    #[serde(default = "default_error_label")]
    pub error: String,
    /// Blank source cell.
    #[serde(default = "default_skipped_label")]
    pub skipped: String,
}

/// Connection settings for the Anthropic Messages API worker.
#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicSettings {
    /// Messages API key; `ANTHROPIC_API_KEY` overrides it.
    #[serde(default)]
    pub api_key: String,
    /// Model id sent with every request.
    #[serde(default = "default_anthropic_model")]
    pub model: String,
    /// Response length limit.
    #[serde(default = "default_anthropic_max_tokens")]
    pub max_tokens: u32,
    /// Messages endpoint; overridden in tests.
    #[serde(default = "default_anthropic_url")]
    pub base_url: String,
}

// Sheet name when none is configured: "Sheet1".
fn default_sheet_name() -> String {
    "Sheet1".to_string()
}

// Five worker attempts per task.
fn default_max_retries() -> u32 {
    5
}

// First backoff step: 10 seconds.
fn default_base_delay_seconds() -> u64 {
    10
}

// Backoff never exceeds one minute.
fn default_max_backoff_seconds() -> u64 {
    60
}

// 90 store calls per rolling minute.
fn default_rate_limit_per_minute() -> usize {
    90
}

fn default_true() -> bool {
    true
}

// Header marker text: "作業指示行".
fn default_header_marker() -> String {
    "作業指示行".to_string()
}

// Task column marker text: "コピー".
fn default_column_marker() -> String {
    "コピー".to_string()
}

// Five minutes per worker call.
fn default_worker_timeout_seconds() -> u64 {
    300
}

fn default_max_header_scan_rows() -> usize {
    1000
}

fn default_max_rows() -> usize {
    1000
}

// A:Z
fn default_max_columns() -> usize {
    26
}

// Three attempts per store call.
fn default_transport_retries() -> u32 {
    3
}

fn default_transport_base_delay_ms() -> u64 {
    1000
}

// Status labels use the vocabulary already written in the sheets.
fn default_unprocessed_label() -> String {
    "未処理".to_string()
}

fn default_processing_label() -> String {
    "処理中".to_string()
}

fn default_processed_label() -> String {
    "処理済み".to_string()
}

fn default_error_label() -> String {
    "エラー".to_string()
}

fn default_skipped_label() -> String {
    "スキップ".to_string()
}

// Model used when `anthropic.model` is absent.
fn default_anthropic_model() -> String {
    "claude-sonnet-4-5-20250929".to_string()
}

fn default_anthropic_max_tokens() -> u32 {
    4096
}

fn default_anthropic_url() -> String {
    "https://api.anthropic.com/v1/messages".to_string()
}

impl Default for StatusLabels {
    fn default() -> Self {
        Self {
            unprocessed: default_unprocessed_label(),
            processing: default_processing_label(),
            processed: default_processed_label(),
            error: default_error_label(),
            skipped: default_skipped_label(),
        }
    }
}

impl Default for AnthropicSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_anthropic_model(),
            max_tokens: default_anthropic_max_tokens(),
            base_url: default_anthropic_url(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            spreadsheet: String::new(),
            sheet_name: default_sheet_name(),
            max_retries: default_max_retries(),
            base_delay_seconds: default_base_delay_seconds(),
            max_backoff_seconds: default_max_backoff_seconds(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
            skip_empty_cells: true,
            resume_processed: true,
            header_marker: default_header_marker(),
            column_marker: default_column_marker(),
            column_workers: BTreeMap::new(),
            default_worker: None,
            worker_timeout_seconds: default_worker_timeout_seconds(),
            max_header_scan_rows: default_max_header_scan_rows(),
            max_rows: default_max_rows(),
            max_columns: default_max_columns(),
            transport_retries: default_transport_retries(),
            transport_base_delay_ms: default_transport_base_delay_ms(),
            status_labels: StatusLabels::default(),
            anthropic: AnthropicSettings::default(),
            sheets_access_token: String::new(),
        }
    }
}

/// Accepts "3" (0-based index) or "D" / "d" (column letter).
pub fn parse_column_key(key: &str) -> Option<usize> {
    let key = key.trim();
    if !key.is_empty() && key.chars().all(|c| c.is_ascii_digit()) {
        return key.parse().ok();
    }
    parse_column(key)
}

impl RunConfig {
    /// Loads `cellrelay.toml` from the working directory.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Loads the given file, falling back to defaults if it does not exist,
    /// then applies environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<RunConfig>(&contents)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Environment values take precedence over the file for secrets.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("ANTHROPIC_API_KEY").filter(|v| !v.is_empty()) {
            self.anthropic.api_key = key;
        }
        if let Some(token) = lookup("GOOGLE_SHEETS_ACCESS_TOKEN").filter(|v| !v.is_empty()) {
            self.sheets_access_token = token;
        }
    }

    pub fn spreadsheet_id(&self) -> Result<String, ConfigError> {
        if self.spreadsheet.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "no spreadsheet configured (set `spreadsheet` or pass --spreadsheet)".into(),
            ));
        }
        spreadsheet_id_from_url(&self.spreadsheet).ok_or_else(|| {
            ConfigError::Invalid(format!("'{}' is not a spreadsheet URL or id", self.spreadsheet))
        })
    }

    pub fn sheet_ref(&self) -> Result<SheetRef, ConfigError> {
        Ok(SheetRef::new(self.spreadsheet_id()?, self.sheet_name.clone()))
    }

    /// Resolves `column_workers` keys to 0-based column indices.
    pub fn column_worker_map(&self) -> Result<BTreeMap<usize, String>, ConfigError> {
        self.column_workers
            .iter()
            .map(|(key, worker)| {
                parse_column_key(key)
                    .map(|col| (col, worker.clone()))
                    .ok_or_else(|| ConfigError::InvalidColumnKey(key.clone()))
            })
            .collect()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_secs(self.base_delay_seconds),
            Duration::from_secs(self.max_backoff_seconds),
        )
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            rate_limit_per_minute: self.rate_limit_per_minute,
            transport_attempts: self.transport_retries.max(1),
            transport_base_delay: Duration::from_millis(self.transport_base_delay_ms),
        }
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_seconds)
    }

    pub fn structure_analyzer(&self) -> GridStructureAnalyzer {
        GridStructureAnalyzer::new(&self.header_marker, &self.column_marker)
            .with_scan_limit(self.max_header_scan_rows)
    }
}
