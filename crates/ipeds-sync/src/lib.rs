//! Ingest orchestration: configuration, record stores and the per-year pipeline.

use std::sync::Arc;

use anyhow::{Context, Result};
use ipeds_core::Catalog;
use ipeds_storage::{ArchiveFetcher, ExtractionCache, HttpClientConfig, HttpFetcher};
use ipeds_transform::builtin_rule_sets;
use tracing::info;

mod config;
mod pipeline;
pub mod sql;
mod store;

pub use config::{ConfigError, FileConfig, SyncConfig, DEFAULT_CONCURRENCY};
pub use pipeline::{
    DatasetOutcome, IngestPipeline, PipelineOptions, Requirement, RunSummary, Stage,
};
pub use store::{IngestError, MemoryStore, PgStore, RecordStore, UpsertReport};

pub const CRATE_NAME: &str = "ipeds-sync";

const REPORTS_DIR: &str = "reports";

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Persist into an in-process store instead of postgres.
    pub dry_run: bool,
    /// Every requested dataset must succeed.
    pub require_all: bool,
}

pub async fn connect_store(config: &SyncConfig) -> Result<PgStore> {
    PgStore::connect(&config.database_url, config.pool_size()).await
}

pub fn build_pipeline(
    config: &SyncConfig,
    catalog: Catalog,
    store: Arc<dyn RecordStore>,
    options: RunOptions,
) -> Result<IngestPipeline> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout(),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;
    let fetcher = ArchiveFetcher::new(
        Arc::new(http),
        config.source_locations.clone(),
        ExtractionCache::new(&config.data_dir),
    )
    .context("configuring source locations")?;

    let required = if options.require_all {
        Requirement::All
    } else {
        Requirement::from_keys(&config.required)
    };
    Ok(IngestPipeline::new(
        catalog,
        Arc::new(fetcher),
        store,
        PipelineOptions {
            concurrency: config.concurrency,
            run_deadline: config.run_deadline,
            required,
            reports_root: Some(config.data_dir.join(REPORTS_DIR)),
        },
    ))
}

/// Validates configuration, then runs every requested year in order.
pub async fn run_sync(
    config: &SyncConfig,
    years: &[i32],
    options: RunOptions,
) -> Result<Vec<RunSummary>> {
    let catalog = Catalog::builtin();
    config
        .validate(&catalog)
        .context("invalid ingest configuration")?;
    let keys = config.dataset_keys(&catalog);

    let store: Arc<dyn RecordStore> = if options.dry_run {
        info!("dry run: records are kept in memory");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(connect_store(config).await?)
    };

    let pipeline = build_pipeline(config, catalog, store, options)?;
    info!(run_id = %pipeline.run_id(), ?years, datasets = keys.len(), "sync starting");
    pipeline.run_years(&keys, years).await
}

/// Creates or widens every table the built-in rule sets write to.
pub async fn migrate(config: &SyncConfig) -> Result<usize> {
    let store = connect_store(config).await?;
    let mut tables = 0usize;
    for rules in builtin_rule_sets() {
        let target = rules.target();
        store
            .ensure_table(&target)
            .await
            .with_context(|| format!("migrating {}", target.table))?;
        info!(table = %target.table, columns = target.columns.len(), "table ready");
        tables += 1;
    }
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipeds_core::CatalogError;

    #[tokio::test]
    async fn missing_source_locations_abort_before_any_task() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SyncConfig::from_lookup(|_| None);
        config.data_dir = dir.path().to_path_buf();
        config.source_locations.clear();

        let err = run_sync(
            &config,
            &[2023],
            RunOptions {
                dry_run: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        let config_err = err.downcast_ref::<ConfigError>().unwrap();
        assert!(matches!(
            config_err,
            ConfigError::Catalog(CatalogError::NoSourceLocations)
        ));
        assert!(!dir.path().join(REPORTS_DIR).exists());
    }

    #[test]
    fn every_rule_table_gets_a_valid_target() {
        for rules in builtin_rule_sets() {
            sql::check_target(&rules.target()).unwrap();
        }
    }
}
