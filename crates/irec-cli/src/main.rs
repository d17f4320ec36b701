use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use irec_storage::{MemoryTableStore, SchemaManager, TableStore, ML_RESULTS_SCHEMA};
use irec_sync::{MergeRun, PersistRun, PipelineConfig, RecordSource};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "irec")]
#[command(about = "Issue record reconciliation and results-table loader")]
struct Cli {
    /// Pipeline config file (defaults to $IREC_CONFIG, then ./irec.yaml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile the annotation datasets and export the canonical records.
    Merge,
    /// Load the canonical JSON document into the results table.
    Write {
        /// Write to an in-process table instead of the database.
        #[arg(long)]
        dry_run: bool,
    },
    /// Merge, then write the merged records.
    Run {
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the results-table DDL.
    Schema {
        /// Compare the live table against the declared layout.
        #[arg(long)]
        validate: bool,
    },
    /// Resolve the database endpoint and probe it.
    CheckConnection,
    /// List discovered database instances, best candidate first.
    Discover,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing report")?);
    Ok(())
}

async fn store_for(config: &PipelineConfig, dry_run: bool) -> Result<Arc<dyn TableStore>> {
    if dry_run {
        info!("dry run: writing to an in-process table");
        return Ok(Arc::new(MemoryTableStore::new(
            config.database.table_name.clone(),
            &ML_RESULTS_SCHEMA,
        )));
    }
    irec_sync::connect_store(config).await
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = PipelineConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_logging(&config.logging.level);
    config.validate().context("validating configuration")?;

    match cli.command.unwrap_or(Commands::Run { dry_run: false }) {
        Commands::Merge => {
            let outcome = MergeRun::from_config(&config).run().await?;
            print_json(&outcome.report)?;
        }
        Commands::Write { dry_run } => {
            let store = store_for(&config, dry_run).await?;
            let report = PersistRun::new(store, config.writer_settings())
                .run(RecordSource::File(config.data_paths.final_json_file.clone()))
                .await?;
            print_json(&report)?;
        }
        Commands::Run { dry_run } => {
            let merged = MergeRun::from_config(&config).run().await?;
            let store = store_for(&config, dry_run).await?;
            let persisted = PersistRun::new(store, config.writer_settings())
                .run(RecordSource::Records(merged.canonical_records()))
                .await?;
            print_json(&json!({ "merge": merged.report, "persist": persisted }))?;
        }
        Commands::Schema { validate } => {
            if !validate {
                println!("{}", ML_RESULTS_SCHEMA.create_table_sql(&config.database.table_name));
                return Ok(ExitCode::SUCCESS);
            }
            let store = irec_sync::connect_store(&config).await?;
            let manager = SchemaManager::new(store.as_ref());
            let drift = manager.validate().await.context("validating table schema")?;
            let table = manager.table_info().await.context("describing table")?;
            store.close().await;
            print_json(&json!({ "table": table, "drift": drift }))?;
        }
        Commands::CheckConnection => {
            let manager = irec_sync::connection_manager(&config).await?;
            let reachable = manager.test_connection().await;
            print_json(&json!({
                "target": manager.descriptor().display_target(),
                "source": manager.descriptor().source,
                "reachable": reachable,
            }))?;
            if !reachable {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Discover => {
            let resolver = irec_sync::resolver_for(&config).await?;
            print_json(&resolver.candidates().await)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
