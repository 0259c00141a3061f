use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use boxsync_engine::{EngineConfig, Reconciler};
use boxsync_provider::{BackoffPolicy, NbaStatsClient, ProviderConfig};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "boxsync")]
#[command(about = "Incremental NBA box-score collection and reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch missing games and append them to the flat files and database.
    Collect,
    /// Report missing games per season and category without fetching them.
    Audit,
    /// Insert file rows absent from the database tables.
    UpdateDb,
    /// (Re)build backing tables from the flat files.
    BuildTables {
        /// Rebuild stat tables wholesale instead of appending.
        #[arg(long)]
        rebuild: bool,
    },
    /// Generate and materialize the combined team/player tables.
    Combine,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = EngineConfig::from_env();
    let provider = NbaStatsClient::new(ProviderConfig {
        backoff: BackoffPolicy {
            max_retries: config.retry_cap,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        },
        ..ProviderConfig::default()
    })?;
    let reconciler = Reconciler::new(config, Arc::new(provider));

    match Cli::parse().command {
        Commands::Collect => {
            let summary = reconciler.collect().await?;
            info!(
                run_id = %summary.run_id,
                units = summary.units.len(),
                failures = summary.failures(),
                issues = summary.issues(),
                "collect finished"
            );
            println!(
                "collect complete: run_id={} units={} failures={} issues={}",
                summary.run_id,
                summary.units.len(),
                summary.failures(),
                summary.issues()
            );
        }
        Commands::Audit => {
            let units = reconciler.audit().await?;
            let behind: usize = units.iter().filter(|u| u.missing > 0).count();
            for unit in units.iter().filter(|u| u.missing > 0) {
                println!(
                    "{} {}: {} missing",
                    unit.season, unit.category, unit.missing
                );
            }
            println!("audit complete: {behind} unit(s) behind");
        }
        Commands::UpdateDb => {
            let reports = reconciler.update_database()?;
            let failures = reports.iter().filter(|r| r.error.is_some()).count();
            let inserted: i64 = reports
                .iter()
                .flat_map(|r| r.tables.iter())
                .map(|t| t.inserted_rows)
                .sum();
            println!("update-db complete: inserted={inserted} failed_categories={failures}");
        }
        Commands::BuildTables { rebuild } => {
            let summary = reconciler.build_tables(rebuild)?;
            println!(
                "build-tables complete: tables={} failures={}",
                summary.reports.len(),
                summary.failures
            );
        }
        Commands::Combine => {
            let reports = reconciler.combine()?;
            for report in &reports {
                println!("materialized {} ({})", report.output_table, report.sql_path.display());
            }
            println!("combine complete: {} table(s)", reports.len());
        }
    }

    Ok(())
}
