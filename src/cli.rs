//! Command-line interface built on clap.
//!
//! [`Cli`] carries the global flags (`--config`, `--spreadsheet`, `--sheet`,
//! `--max-retries`, `--verbose`) and one [`Command`].

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::RunConfig;

/// Dispatches spreadsheet rows to workers and writes the results back.
#[derive(Debug, Parser)]
#[command(name = "cellrelay", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the TOML config file (default: ./cellrelay.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Spreadsheet URL or id; overrides the config file.
    #[arg(long, global = true)]
    pub spreadsheet: Option<String>,

    /// Sheet (tab) name; overrides the config file.
    #[arg(long, global = true)]
    pub sheet: Option<String>,

    /// Worker attempts per task before it is marked as failed.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Enables debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Processes every unprocessed row of the sheet.
    Run {
        /// After the first pass, retry rows that failed once more.
        #[arg(long)]
        rerun_failed: bool,
    },

    /// Prints the detected sheet layout without invoking any worker.
    Analyze,

    /// Lists the sheets (tabs) of the spreadsheet.
    Sheets,

    /// Resets rows left in the processing or error state to unprocessed.
    Reset,

    /// Runs the full pipeline on a built-in in-memory sheet with the echo worker.
    Demo,
}

impl Cli {
    /// Applies flag overrides on top of the loaded config.
    pub fn apply_overrides(&self, config: &mut RunConfig) {
        if let Some(spreadsheet) = &self.spreadsheet {
            config.spreadsheet = spreadsheet.clone();
        }
        if let Some(sheet) = &self.sheet {
            config.sheet_name = sheet.clone();
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
    }
}
