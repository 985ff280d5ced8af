use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use ipeds_core::Catalog;
use ipeds_sync::{DatasetOutcome, RunOptions, RunSummary, SyncConfig};
use ipeds_transform::rule_set_for;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Exit status when a required dataset failed.
const EXIT_REQUIRED_FAILED: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "ipeds-ingest")]
#[command(about = "Fetch, reshape and upsert IPEDS survey datasets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline for one or more reporting years.
    Sync(SyncArgs),
    /// Create or widen every ingest table.
    Migrate(ConfigArgs),
    /// List catalog keys with this year's candidate identifiers.
    Datasets {
        #[arg(long, default_value_t = 2023)]
        year: i32,
    },
}

#[derive(Debug, Args)]
struct ConfigArgs {
    /// YAML overlay; defaults to IPEDS_CONFIG.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[command(flatten)]
    config: ConfigArgs,
    #[arg(long = "year", value_delimiter = ',', required = true)]
    years: Vec<i32>,
    /// Catalog keys to run; all when omitted.
    #[arg(long, value_delimiter = ',')]
    datasets: Vec<String>,
    /// Keys whose failure makes the run fail.
    #[arg(long, value_delimiter = ',')]
    required: Vec<String>,
    #[arg(long, conflicts_with = "required")]
    require_all: bool,
    #[arg(long)]
    concurrency: Option<usize>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Keep records in memory instead of writing to postgres.
    #[arg(long)]
    dry_run: bool,
}

impl ConfigArgs {
    fn load(&self) -> Result<SyncConfig> {
        Ok(SyncConfig::load(self.config.as_deref())?)
    }
}

impl SyncArgs {
    fn apply(&self, mut config: SyncConfig) -> SyncConfig {
        if !self.datasets.is_empty() {
            config.datasets = Some(self.datasets.clone());
        }
        if !self.required.is_empty() {
            config.required = self.required.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        config
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn print_summary(summary: &RunSummary) {
    println!(
        "year {}: run_id={} succeeded={} failed={}{}",
        summary.year,
        summary.run_id,
        summary.succeeded(),
        summary.failed().len(),
        summary
            .report_path
            .as_ref()
            .map(|p| format!(" report={}", p.display()))
            .unwrap_or_default()
    );
    for (key, outcome) in &summary.outcomes {
        let required = if summary.required.contains(key) { "*" } else { " " };
        match outcome {
            DatasetOutcome::Ingested {
                table,
                records,
                rows_written,
                ..
            } => println!("  {required} {key}: ingested {rows_written}/{records} into {table}"),
            DatasetOutcome::Fetched { dir, .. } => {
                println!("  {required} {key}: fetched to {}", dir.display())
            }
            DatasetOutcome::Failed { stage, error, .. } => {
                println!("  {required} {key}: failed at {stage:?}: {error}")
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Sync(args) => {
            let config = args.apply(args.config.load()?);
            let summaries = ipeds_sync::run_sync(
                &config,
                &args.years,
                RunOptions {
                    dry_run: args.dry_run,
                    require_all: args.require_all,
                },
            )
            .await?;
            summaries.iter().for_each(print_summary);
            if summaries.iter().all(RunSummary::is_success) {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_REQUIRED_FAILED))
            }
        }
        Commands::Migrate(args) => {
            let config = args.load()?;
            let tables = ipeds_sync::migrate(&config).await?;
            println!("migrated {tables} tables");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Datasets { year } => {
            let catalog = Catalog::builtin();
            for key in catalog.keys() {
                let descriptor = catalog.descriptor(key, year)?;
                let table = rule_set_for(key)
                    .map(|rules| rules.table)
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{key:<36} {:<28} {table}",
                    descriptor.candidate_identifiers.join(",")
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn sync_flags_override_configuration() {
        let cli = Cli::parse_from([
            "ipeds-ingest",
            "sync",
            "--year",
            "2022,2023",
            "--datasets",
            "institutions,admissions",
            "--required",
            "institutions",
            "--concurrency",
            "3",
            "--dry-run",
        ]);
        let Commands::Sync(args) = cli.command else {
            panic!("expected sync");
        };
        assert_eq!(args.years, vec![2022, 2023]);
        assert!(args.dry_run);

        let config = args.apply(SyncConfig::from_lookup(|_| None));
        assert_eq!(config.concurrency, 3);
        assert_eq!(
            config.datasets,
            Some(vec!["institutions".to_string(), "admissions".to_string()])
        );
        assert_eq!(config.required, vec!["institutions"]);
    }

    #[test]
    fn require_all_conflicts_with_explicit_required() {
        let parsed = Cli::try_parse_from([
            "ipeds-ingest",
            "sync",
            "--year",
            "2023",
            "--required",
            "institutions",
            "--require-all",
        ]);
        assert!(parsed.is_err());
    }
}
