//! `jobsdb` operator command line.

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use jobsdb_core::{DatasetIndex, JobQuery, compute_idx_for_cluster_migration_str, compute_insert_idx_str};
use jobsdb_infra::{DatabaseConfig, Handle, HandleConfig, Mode, PostgresBackingStore, TracingStats};

#[derive(Parser, Debug)]
#[command(name = "jobsdb", about = "Inspect and maintain a jobsdb queue", disable_help_subcommand = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List datasets in queue order.
    Catalog,
    /// Create the first dataset if the queue has none.
    Init,
    /// Append a tail dataset when the current tail is full.
    Rotate,
    /// Split after an existing dataset.
    InsertAfter {
        #[arg(value_name = "INDEX")]
        index: String,
    },
    /// Create an import dataset ahead of `anchor`.
    Migrate {
        #[arg(long, value_name = "INDEX")]
        anchor: String,
    },
    /// Drop finished datasets older than the retention window.
    DropExpired,
    /// Print unprocessed jobs as JSON lines.
    Pending {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long = "custom-val", value_name = "VALUE")]
        custom_vals: Vec<String>,
    },
    /// Compute the index between two indexes without touching the database.
    ComputeInsert { before: String, after: String },
    /// Compute the next import index for a list of existing indexes.
    ComputeMigration {
        #[arg(long, default_value = "jobs")]
        prefix: String,
        #[arg(long)]
        anchor: String,
        #[arg(required = true)]
        existing: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobsdb_observability::init();
    let cli = Cli::parse();
    let mut out = std::io::stdout().lock();

    match &cli.command {
        Command::ComputeInsert { before, after } => {
            let index = compute_insert_idx_str(before, after)?;
            writeln!(out, "{index}")?;
            return Ok(());
        }
        Command::ComputeMigration {
            prefix,
            anchor,
            existing,
        } => {
            let existing: Vec<&str> = existing.iter().map(String::as_str).collect();
            let index = compute_idx_for_cluster_migration_str(prefix, &existing, anchor)?;
            writeln!(out, "{index}")?;
            return Ok(());
        }
        _ => {}
    }

    let mut config = HandleConfig::from_env().context("reading handle configuration")?;
    if matches!(cli.command, Command::Catalog | Command::Pending { .. }) {
        config.mode = Mode::ReadOnly;
    }
    let db = DatabaseConfig::from_env().context("reading database configuration")?;
    let store = Arc::new(PostgresBackingStore::connect(&db).await.context("connecting to postgres")?);
    let handle = Handle::setup(config, store, Arc::new(TracingStats))
        .await
        .context("opening jobsdb handle")?;

    match cli.command {
        Command::Catalog | Command::Init => {
            for dataset in handle.get_ds_list(false).await? {
                writeln!(out, "{}\t{}\t{}", dataset.index, dataset.job_table, dataset.job_status_table)?;
            }
        }
        Command::Rotate => match handle.add_new_ds_if_full().await? {
            Some(dataset) => writeln!(out, "created {}", dataset.index)?,
            None => writeln!(out, "tail not full")?,
        },
        Command::InsertAfter { index } => {
            let index = DatasetIndex::parse(&index)?;
            let dataset = handle.insert_ds_after(&index).await?;
            writeln!(out, "created {}", dataset.index)?;
        }
        Command::Migrate { anchor } => {
            let anchor = DatasetIndex::parse(&anchor)?;
            let dataset = handle.add_ds_for_cluster_migration(&anchor).await?;
            writeln!(out, "created {}", dataset.index)?;
        }
        Command::DropExpired => {
            let dropped = handle.drop_expired_datasets(chrono::Utc::now()).await?;
            for dataset in &dropped {
                writeln!(out, "dropped {}", dataset.index)?;
            }
            tracing::info!(dropped = dropped.len(), "retention pass finished");
        }
        Command::Pending { limit, custom_vals } => {
            let query = custom_vals
                .into_iter()
                .fold(JobQuery::new(limit), |query, value| query.custom_val(value));
            for job in handle.get_unprocessed(&query).await? {
                writeln!(out, "{}", serde_json::to_string(&job)?)?;
            }
        }
        Command::ComputeInsert { .. } | Command::ComputeMigration { .. } => {}
    }

    handle.shutdown().await;
    Ok(())
}
