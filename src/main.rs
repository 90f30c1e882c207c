mod analyzer;
mod cli;
mod config;
mod error;
mod grid;
mod orchestrator;
mod store;
mod tasks;
mod ui;
mod workers;

use anyhow::{Context, Result, bail};
use clap::Parser;
use console::Style;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Command};
use config::RunConfig;
use grid::{Grid, SheetRef};
use orchestrator::{RunSummary, TaskOrchestrator};
use store::{MemoryStore, SheetsClient, TabularStore, TransactionStatus, TransactionalDataStore};
use ui::RunProgress;
use workers::WorkerRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => RunConfig::load_from(path)?,
        None => RunConfig::load()?,
    };
    cli.apply_overrides(&mut config);

    match cli.command {
        Command::Run { rerun_failed } => run(config, rerun_failed).await,
        Command::Analyze => analyze(config).await,
        Command::Sheets => sheets(config).await,
        Command::Reset => reset(config).await,
        Command::Demo => demo(config).await,
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "cellrelay=debug,info" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn sheets_client(config: &RunConfig) -> Result<SheetsClient> {
    if config.sheets_access_token.is_empty() {
        bail!("no Sheets access token: set GOOGLE_SHEETS_ACCESS_TOKEN or `sheets_access_token`");
    }
    SheetsClient::new(config.sheets_access_token.clone()).context("building Sheets client")
}

async fn run(config: RunConfig, rerun_failed: bool) -> Result<()> {
    let client = sheets_client(&config)?;
    let orch = TaskOrchestrator::new(config, client, &WorkerRegistry::with_builtin())?;
    let (orch, summary) = run_with_progress(orch, rerun_failed).await?;
    ui::print_summary(&summary);
    ui::print_failures(orch.registry());
    Ok(())
}

/// Runs the orchestrator with the progress renderer attached and Ctrl-C
/// wired to the stop flag. Returns the orchestrator for inspection.
async fn run_with_progress<S: TabularStore>(
    orch: TaskOrchestrator<S>,
    rerun_failed: bool,
) -> Result<(TaskOrchestrator<S>, RunSummary)> {
    let (tx, rx) = unbounded_channel();
    let mut orch = orch.with_events(tx);

    let stop = orch.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing the current task");
            stop.stop();
        }
    });
    let progress = tokio::spawn(RunProgress::new().drive(rx));

    let result = async {
        let mut summary = orch.run().await?;
        if rerun_failed && summary.progress.failed > 0 && !summary.stopped {
            let n = orch.reset_failed();
            info!(tasks = n, "retrying failed tasks");
            summary = orch.run().await?;
        }
        Ok::<_, error::CellRelayError>(summary)
    }
    .await;

    orch.close_events();
    progress.await.context("progress renderer panicked")?;
    Ok((orch, result?))
}

async fn analyze(config: RunConfig) -> Result<()> {
    let sheet = config.sheet_ref()?;
    let mut store = TransactionalDataStore::new(sheets_client(&config)?, config.store_options());
    let grid = store
        .read_grid(&sheet, config.max_rows, config.max_columns)
        .await
        .with_context(|| format!("reading sheet '{}'", sheet.sheet_name))?;
    let layout = config.structure_analyzer().analyze(&grid)?;
    let registry = orchestrator::build_registry(&config, &grid, &layout);
    ui::print_layout(&layout, &registry);
    Ok(())
}

async fn sheets(config: RunConfig) -> Result<()> {
    let spreadsheet_id = config.spreadsheet_id()?;
    let mut store = TransactionalDataStore::new(sheets_client(&config)?, config.store_options());
    for name in store.get_sheet_names(&spreadsheet_id).await? {
        println!("{name}");
    }
    Ok(())
}

async fn reset(mut config: RunConfig) -> Result<()> {
    // Resetting never invokes a worker.
    config.column_workers.clear();
    config.default_worker = None;
    let client = sheets_client(&config)?;
    let mut orch = TaskOrchestrator::new(config, client, &WorkerRegistry::new())?;
    let n = orch.reset_sheet().await?;
    println!("{n} row(s) reset to unprocessed");
    Ok(())
}

fn demo_grid(header_marker: &str, column_marker: &str) -> Grid {
    let h = header_marker;
    let c = column_marker;
    Grid::from_strs(&[
        &["cellrelay demo"],
        &[],
        &[h, "", "", c, "", "", "", c, ""],
        &["1", "", "", "Summarise the quarterly report", "", "", "", "Translate: おはよう", ""],
        &["2", "", "", "", "", "", "", "List three risks", ""],
        &["3", "", "", "Draft a reply to the supplier", "", "", "", "", ""],
    ])
}

async fn demo(mut config: RunConfig) -> Result<()> {
    config.spreadsheet = "demo".into();
    config.sheet_name = "Demo".into();
    config.column_workers.clear();
    config.default_worker = Some("echo".into());
    config.base_delay_seconds = 1;

    let backend = MemoryStore::new();
    let sheet = SheetRef::new("demo", "Demo");
    backend.insert_sheet(&sheet, demo_grid(&config.header_marker, &config.column_marker));

    let orch = TaskOrchestrator::new(config, backend.clone(), &WorkerRegistry::with_builtin())?;
    let (orch, summary) = run_with_progress(orch, false).await?;
    ui::print_summary(&summary);

    let dim = Style::new().dim();
    println!();
    if let Some(grid) = backend.grid(orch.sheet()) {
        for row in grid.rows() {
            let cells: Vec<String> = row
                .iter()
                .map(|c| {
                    if c.is_empty() {
                        dim.apply_to("·").to_string()
                    } else {
                        c.clone()
                    }
                })
                .collect();
            println!("  {}", cells.join(" | "));
        }
    }
    let log = orch.store().transaction_log();
    let rolled_back = log
        .iter()
        .filter(|t| t.status == TransactionStatus::RolledBack)
        .count();
    println!(
        "\n  {} store calls ({} reads, {} writes), {} transactions ({} rolled back)",
        backend.read_calls() + backend.write_calls(),
        backend.read_calls(),
        backend.write_calls(),
        log.len(),
        rolled_back
    );
    Ok(())
}
