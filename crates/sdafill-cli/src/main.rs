use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sdafill_core::{chunk, format_count, TypeMap};
use sdafill_pipeline::{
    report_runs_markdown, write_reports, EnrichConfig, Enricher, TaskConfig,
};
use sdafill_source::{extract_keys, SqliteTable};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "sdafill")]
#[command(about = "Fill soil survey tables with Soil Data Access attributes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List the task profiles in the registry.
    Tasks,
    /// Extract and batch keys, then print the queries a run would send.
    Keys(TargetArgs),
    /// Run a task against a table and write its report.
    Run(TargetArgs),
    /// Summarize the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[derive(Debug, Args)]
struct TargetArgs {
    /// SQLite database or GeoPackage holding the table.
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    table: String,
    #[arg(long, default_value = "natmusym")]
    task: String,
    /// Overrides the task's key column.
    #[arg(long)]
    key_column: Option<String>,
    /// Overrides the task's maximum batch size.
    #[arg(long)]
    batch_size: Option<usize>,
}

fn resolve_task(config: &EnrichConfig, args: &TargetArgs) -> Result<TaskConfig> {
    let registry = config.load_registry()?;
    let mut task = registry
        .get(&args.task)
        .cloned()
        .with_context(|| format!("unknown task `{}`", args.task))?;
    if let Some(key_column) = &args.key_column {
        task.key_column = key_column.clone();
    }
    if let Some(batch_size) = args.batch_size {
        task.max_batch_size = batch_size;
    }
    Ok(task)
}

async fn open_table(args: &TargetArgs) -> Result<SqliteTable> {
    SqliteTable::open(&args.db, &args.table)
        .await
        .with_context(|| format!("opening {} in {}", args.table, args.db.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = EnrichConfig::from_env();

    match cli.command {
        Commands::Tasks => {
            let registry = config.load_registry()?;
            for task in &registry.tasks {
                println!(
                    "{:<20} {:<12} batch={:<5} format={:<26} {}",
                    task.task_id,
                    task.key_column,
                    task.max_batch_size,
                    task.format.as_str(),
                    task.display_name
                );
            }
        }
        Commands::Keys(args) => {
            let task = resolve_task(&config, &args)?;
            let plan = task.validate(&TypeMap::default())?;
            let table = open_table(&args).await?;

            let extraction = extract_keys(&table, &task.key_column, plan.key_kind).await?;
            let batches = chunk(&extraction.keys, task.max_batch_size)?;
            println!(
                "{}: {} unique {} values in {} rows, {} batches",
                args.table,
                format_count(extraction.keys.len()),
                extraction.column,
                format_count(extraction.rows_scanned),
                format_count(batches.len())
            );
            for (raw, err) in &extraction.rejected {
                println!("skipped `{raw}`: {err}");
            }
            for batch in &batches {
                println!("-- batch {} ({} keys)", batch.index, batch.len());
                println!("{}", plan.template.render(batch));
            }
        }
        Commands::Run(args) => {
            let task = resolve_task(&config, &args)?;
            let enricher = Enricher::from_config(&config)?;
            let table = open_table(&args).await?;
            info!(task = %task.task_id, table = %args.table, endpoint = %config.sda_url, "starting run");

            match enricher.run(&task, &table).await {
                Ok(report) => {
                    let dir = write_reports(&config.reports_dir, &report).await?;
                    println!(
                        "run complete: run_id={} missing={} rows_updated={} reports={}",
                        report.run_id,
                        report.missing_keys().len(),
                        report.apply.as_ref().map(|a| a.rows_updated).unwrap_or(0),
                        dir.display()
                    );
                }
                Err(failure) => {
                    let dir = write_reports(&config.reports_dir, &failure.report).await?;
                    println!(
                        "run failed: run_id={} reports={}",
                        failure.report.run_id,
                        dir.display()
                    );
                    return Err(failure.into());
                }
            }
        }
        Commands::Report { runs } => {
            println!("{}", report_runs_markdown(&config.reports_dir, runs).await?);
        }
    }

    Ok(())
}
