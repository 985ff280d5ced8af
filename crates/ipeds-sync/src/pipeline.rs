use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ipeds_core::{Catalog, DatasetDescriptor};
use ipeds_storage::{read_extraction_dir, ArchiveFetcher, Extraction};
use ipeds_transform::{rule_set_for, transform, RuleSet, TransformOutput};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::DEFAULT_CONCURRENCY;
use crate::store::RecordStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Read,
    Transform,
    Persist,
    Deadline,
    Panic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DatasetOutcome {
    /// Transformed and upserted.
    Ingested {
        table: String,
        cached: bool,
        source_url: Option<String>,
        rows_scanned: usize,
        rows_skipped: usize,
        records: usize,
        rows_written: usize,
        #[serde(default)]
        missing_columns: Vec<String>,
    },
    /// Extracted only; the dataset has no rule set.
    Fetched {
        dir: PathBuf,
        cached: bool,
        source_url: Option<String>,
    },
    Failed {
        stage: Stage,
        error: String,
        #[serde(default)]
        rows_written: usize,
    },
}

impl DatasetOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, DatasetOutcome::Failed { .. })
    }

    fn failed(stage: Stage, error: impl std::fmt::Display) -> Self {
        DatasetOutcome::Failed {
            stage,
            error: error.to_string(),
            rows_written: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub year: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: BTreeMap<String, DatasetOutcome>,
    pub required: BTreeSet<String>,
    #[serde(default)]
    pub report_path: Option<PathBuf>,
}

impl RunSummary {
    /// Every required dataset succeeded. Optional datasets never fail a run.
    pub fn is_success(&self) -> bool {
        self.required.iter().all(|key| {
            self.outcomes
                .get(key)
                .map(DatasetOutcome::is_success)
                .unwrap_or(false)
        })
    }

    pub fn failed(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.is_success())
            .map(|(key, _)| key.as_str())
            .collect()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_success()).count()
    }
}

/// Which requested datasets decide the run's exit status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Requirement {
    /// Best effort for every dataset.
    #[default]
    None,
    All,
    Keys(BTreeSet<String>),
}

impl Requirement {
    pub fn from_keys(keys: &[String]) -> Self {
        if keys.is_empty() {
            Requirement::None
        } else {
            Requirement::Keys(keys.iter().cloned().collect())
        }
    }

    fn resolve(&self, requested: &[String]) -> BTreeSet<String> {
        match self {
            Requirement::None => BTreeSet::new(),
            Requirement::All => requested.iter().cloned().collect(),
            Requirement::Keys(keys) => requested
                .iter()
                .filter(|key| keys.contains(*key))
                .cloned()
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub concurrency: usize,
    pub run_deadline: Option<Duration>,
    pub required: Requirement,
    /// Root for `<run_id>/<year>.json` reports; `None` skips writing them.
    pub reports_root: Option<PathBuf>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            run_deadline: None,
            required: Requirement::None,
            reports_root: None,
        }
    }
}

/// Shared, read-only state handed to every dataset task.
struct TaskContext {
    fetcher: Arc<ArchiveFetcher>,
    store: Arc<dyn RecordStore>,
}

/// Fetch → read → transform → persist for many datasets under a bounded task pool.
pub struct IngestPipeline {
    run_id: Uuid,
    catalog: Catalog,
    context: Arc<TaskContext>,
    options: PipelineOptions,
}

impl IngestPipeline {
    pub fn new(
        catalog: Catalog,
        fetcher: Arc<ArchiveFetcher>,
        store: Arc<dyn RecordStore>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            catalog,
            context: Arc::new(TaskContext { fetcher, store }),
            options,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Runs one year. Unknown keys fail before any task starts; per-dataset
    /// failures are recorded in the summary.
    pub async fn run(&self, keys: &[String], year: i32) -> Result<RunSummary> {
        let descriptors = self
            .catalog
            .descriptors(keys, year)
            .context("resolving dataset keys")?;
        let started_at = Utc::now();
        let run_id = self.run_id;
        info!(%run_id, year, datasets = descriptors.len(), "starting ingest run");

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut keys_by_task = HashMap::new();

        for descriptor in descriptors {
            let key = descriptor.key.clone();
            let context = self.context.clone();
            let semaphore = semaphore.clone();
            let span = info_span!("dataset", %run_id, dataset = %key, year);
            let task_key = key.clone();
            let handle = tasks.spawn(
                async move {
                    // Held for the task's lifetime; the semaphore is never closed.
                    let _permit = semaphore.acquire_owned().await;
                    let outcome = process_dataset(&context, &descriptor, year).await;
                    (task_key, outcome)
                }
                .instrument(span),
            );
            keys_by_task.insert(handle.id(), key);
        }

        let mut outcomes = BTreeMap::new();
        let collect = collect_outcomes(&mut tasks, &keys_by_task, &mut outcomes);
        match self.options.run_deadline {
            Some(deadline) => {
                if tokio::time::timeout(deadline, collect).await.is_err() {
                    warn!(%run_id, year, ?deadline, "run deadline reached; aborting remaining datasets");
                    tasks.shutdown().await;
                }
            }
            None => collect.await,
        }
        for key in keys_by_task.values() {
            outcomes.entry(key.clone()).or_insert_with(|| {
                DatasetOutcome::failed(Stage::Deadline, "run deadline reached before completion")
            });
        }

        let mut summary = RunSummary {
            run_id,
            year,
            started_at,
            finished_at: Utc::now(),
            outcomes,
            required: self.options.required.resolve(keys),
            report_path: None,
        };
        if let Some(root) = &self.options.reports_root {
            summary.report_path = Some(write_report(root, &summary).await?);
        }

        info!(
            %run_id,
            year,
            succeeded = summary.succeeded(),
            failed = summary.failed().len(),
            success = summary.is_success(),
            "ingest run finished"
        );
        Ok(summary)
    }

    /// Years run one after another, each through [`IngestPipeline::run`].
    pub async fn run_years(&self, keys: &[String], years: &[i32]) -> Result<Vec<RunSummary>> {
        let mut summaries = Vec::with_capacity(years.len());
        for &year in years {
            summaries.push(self.run(keys, year).await?);
        }
        Ok(summaries)
    }
}

async fn collect_outcomes(
    tasks: &mut JoinSet<(String, DatasetOutcome)>,
    keys_by_task: &HashMap<tokio::task::Id, String>,
    outcomes: &mut BTreeMap<String, DatasetOutcome>,
) {
    while let Some(joined) = tasks.join_next_with_id().await {
        match joined {
            Ok((_, (key, outcome))) => {
                outcomes.insert(key, outcome);
            }
            Err(err) => {
                let Some(key) = keys_by_task.get(&err.id()) else {
                    continue;
                };
                let stage = if err.is_panic() {
                    Stage::Panic
                } else {
                    Stage::Deadline
                };
                error!(dataset = %key, error = %err, "dataset task did not complete");
                outcomes.insert(key.clone(), DatasetOutcome::failed(stage, &err));
            }
        }
    }
}

async fn process_dataset(
    context: &TaskContext,
    descriptor: &DatasetDescriptor,
    year: i32,
) -> DatasetOutcome {
    let extraction = match context.fetcher.fetch(descriptor, year).await {
        Ok(extraction) => extraction,
        Err(err) => {
            warn!(error = %err, "fetch failed");
            return DatasetOutcome::failed(Stage::Fetch, &err);
        }
    };

    let Some(rules) = rule_set_for(&descriptor.key) else {
        info!(dir = %extraction.dir.display(), "no rule set; fetched only");
        return DatasetOutcome::Fetched {
            dir: extraction.dir,
            cached: extraction.cached,
            source_url: extraction.source_url,
        };
    };

    let output = match read_and_transform(&extraction, rules.clone(), year).await {
        Ok(output) => output,
        Err((stage, err)) => {
            warn!(?stage, error = %err, "dataset rejected");
            return DatasetOutcome::failed(stage, err);
        }
    };

    let target = rules.target();
    match context.store.persist(&target, &output.records).await {
        Ok(report) => {
            info!(
                table = %target.table,
                records = output.records.len(),
                rows_written = report.rows_written,
                "dataset ingested"
            );
            DatasetOutcome::Ingested {
                table: target.table,
                cached: extraction.cached,
                source_url: extraction.source_url,
                rows_scanned: output.rows_scanned,
                rows_skipped: output.rows_skipped,
                records: output.records.len(),
                rows_written: report.rows_written,
                missing_columns: output.missing_columns,
            }
        }
        Err(err) => {
            warn!(table = %target.table, error = %err, "persist failed");
            DatasetOutcome::Failed {
                stage: Stage::Persist,
                error: err.to_string(),
                rows_written: err.rows_written(),
            }
        }
    }
}

/// File reading and pivoting are CPU and disk bound; both run off the async workers.
async fn read_and_transform(
    extraction: &Extraction,
    rules: RuleSet,
    year: i32,
) -> Result<TransformOutput, (Stage, String)> {
    let dir = extraction.dir.clone();
    tokio::task::spawn_blocking(move || {
        let table = read_extraction_dir(&dir).map_err(|err| (Stage::Read, err.to_string()))?;
        transform(&table, &rules, year).map_err(|err| (Stage::Transform, err.to_string()))
    })
    .await
    .unwrap_or_else(|join| Err((Stage::Panic, join.to_string())))
}

async fn write_report(root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let dir = root.join(summary.run_id.to_string());
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(format!("{}.json", summary.year));
    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    tokio::fs::write(&path, json)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IngestError, MemoryStore, UpsertReport};
    use async_trait::async_trait;
    use ipeds_core::{CanonicalRecord, NaturalKey, PersistenceTarget, SourceLocation, Value};
    use ipeds_storage::{ArchiveTransport, ExtractionCache, FetchError};
    use std::collections::HashMap;
    use std::io::{Cursor, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    const ORIGIN: &str = "http://fixtures.test/{id}.zip";

    fn zip_bytes(name: &str, body: &str) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file(name, SimpleFileOptions::default()).unwrap();
        writer.write_all(body.as_bytes()).unwrap();
        writer.finish().unwrap().into_inner()
    }

    /// Serves archives by URL, 404 otherwise, optionally after a delay.
    #[derive(Default)]
    struct FixtureTransport {
        archives: HashMap<String, Vec<u8>>,
        delay: Option<Duration>,
        calls: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FixtureTransport {
        fn serve(mut self, identifier: &str, member: &str, csv: &str) -> Self {
            self.archives
                .insert(ORIGIN.replace("{id}", identifier), zip_bytes(member, csv));
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ArchiveTransport for FixtureTransport {
        async fn get(&self, _source: &str, url: &str) -> Result<Vec<u8>, FetchError> {
            self.calls.lock().unwrap().push(url.to_string());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.archives.get(url).cloned().ok_or_else(|| FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })
        }
    }

    const ADMISSIONS_CSV: &str = "UNITID,APPLCN,ADMSSN,ENRLT\n100,1000,200,50\n200,0,0,0\n";

    fn catalog() -> Catalog {
        Catalog::empty()
            .with_entry("admissions", &["ADM{year}"])
            .with_entry("broken", &["BROKEN{year}", "BROKEN{year}_RV"])
            .with_entry("institutional_mission", &["IC{year}Mission"])
    }

    fn pipeline(
        transport: Arc<FixtureTransport>,
        store: Arc<dyn RecordStore>,
        cache_root: &Path,
        options: PipelineOptions,
    ) -> IngestPipeline {
        let fetcher = ArchiveFetcher::new(
            transport,
            vec![SourceLocation::new("fixtures", ORIGIN).unwrap()],
            ExtractionCache::new(cache_root),
        )
        .unwrap();
        IngestPipeline::new(catalog(), Arc::new(fetcher), store, options)
    }

    fn keys(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    fn unitid(id: &str) -> NaturalKey {
        NaturalKey::new(vec![id.into()], 2023)
    }

    #[tokio::test]
    async fn failing_dataset_does_not_block_siblings() {
        let root = tempdir().unwrap();
        let transport =
            Arc::new(FixtureTransport::default().serve("ADM2023", "adm2023.csv", ADMISSIONS_CSV));
        let store = MemoryStore::new();
        let pipeline = pipeline(
            transport,
            Arc::new(store.clone()),
            root.path(),
            PipelineOptions::default(),
        );

        let summary = pipeline
            .run(&keys(&["broken", "admissions"]), 2023)
            .await
            .unwrap();

        assert!(matches!(
            summary.outcomes["admissions"],
            DatasetOutcome::Ingested { records: 2, rows_written: 2, .. }
        ));
        assert!(matches!(
            summary.outcomes["broken"],
            DatasetOutcome::Failed { stage: Stage::Fetch, .. }
        ));
        assert_eq!(summary.failed(), vec!["broken"]);
        assert!(summary.is_success());

        let row = store.row("ipeds_admissions", &unitid("100")).await.unwrap();
        assert_eq!(row.get("acceptance_rate"), Some(&Value::Decimal(20.0)));
        assert_eq!(row.get("yield_rate"), Some(&Value::Decimal(25.0)));
        let zero = store.row("ipeds_admissions", &unitid("200")).await.unwrap();
        assert_eq!(zero.get("acceptance_rate"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn required_datasets_decide_success() {
        let root = tempdir().unwrap();
        let transport =
            Arc::new(FixtureTransport::default().serve("ADM2023", "adm2023.csv", ADMISSIONS_CSV));
        let options = PipelineOptions {
            required: Requirement::from_keys(&keys(&["broken"])),
            ..Default::default()
        };
        let pipeline = pipeline(transport, Arc::new(MemoryStore::new()), root.path(), options);
        let summary = pipeline
            .run(&keys(&["broken", "admissions"]), 2023)
            .await
            .unwrap();
        assert!(!summary.is_success());

        let all = RunSummary {
            required: Requirement::All.resolve(&keys(&["admissions"])),
            ..summary.clone()
        };
        assert!(all.is_success());
    }

    #[tokio::test]
    async fn rerun_uses_cache_and_converges() {
        let root = tempdir().unwrap();
        let transport =
            Arc::new(FixtureTransport::default().serve("ADM2023", "adm2023.csv", ADMISSIONS_CSV));
        let store = MemoryStore::new();
        let pipeline = pipeline(
            transport.clone(),
            Arc::new(store.clone()),
            root.path(),
            PipelineOptions::default(),
        );
        let requested = keys(&["admissions"]);

        pipeline.run(&requested, 2023).await.unwrap();
        let calls = transport.call_count();
        let before = store.row("ipeds_admissions", &unitid("100")).await;

        let second = pipeline.run(&requested, 2023).await.unwrap();
        assert_eq!(transport.call_count(), calls);
        assert!(matches!(
            second.outcomes["admissions"],
            DatasetOutcome::Ingested { cached: true, .. }
        ));
        assert_eq!(store.row_count("ipeds_admissions").await, 2);
        assert_eq!(store.row("ipeds_admissions", &unitid("100")).await, before);
    }

    #[tokio::test]
    async fn datasets_without_rules_are_fetched_only() {
        let root = tempdir().unwrap();
        let transport = Arc::new(FixtureTransport::default().serve(
            "IC2023Mission",
            "ic2023mission.csv",
            "UNITID,MISSION\n1,Teach\n",
        ));
        let store = MemoryStore::new();
        let pipeline = pipeline(
            transport,
            Arc::new(store.clone()),
            root.path(),
            PipelineOptions::default(),
        );
        let summary = pipeline
            .run(&keys(&["institutional_mission"]), 2023)
            .await
            .unwrap();
        assert!(matches!(
            summary.outcomes["institutional_mission"],
            DatasetOutcome::Fetched { cached: false, .. }
        ));
        assert!(store.tables().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_keys_fail_before_any_task() {
        let root = tempdir().unwrap();
        let transport = Arc::new(FixtureTransport::default());
        let pipeline = pipeline(
            transport.clone(),
            Arc::new(MemoryStore::new()),
            root.path(),
            PipelineOptions::default(),
        );
        assert!(pipeline.run(&keys(&["admissions", "nope"]), 2023).await.is_err());
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn concurrency_is_capped() {
        let root = tempdir().unwrap();
        let transport = Arc::new(FixtureTransport::default().with_delay(Duration::from_millis(20)));
        let mut catalog = Catalog::empty();
        let mut requested = Vec::new();
        for idx in 0..6 {
            let key = format!("dataset_{idx}");
            catalog = catalog.with_entry(key.clone(), &["MISSING{year}"]);
            requested.push(key);
        }
        let fetcher = ArchiveFetcher::new(
            transport.clone(),
            vec![SourceLocation::new("fixtures", ORIGIN).unwrap()],
            ExtractionCache::new(root.path()),
        )
        .unwrap();
        let options = PipelineOptions {
            concurrency: 2,
            ..Default::default()
        };
        let pipeline =
            IngestPipeline::new(catalog, Arc::new(fetcher), Arc::new(MemoryStore::new()), options);

        let summary = pipeline.run(&requested, 2023).await.unwrap();
        assert_eq!(summary.outcomes.len(), 6);
        assert_eq!(transport.call_count(), 6);
        assert!(transport.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn deadline_marks_unfinished_datasets() {
        let root = tempdir().unwrap();
        let transport = Arc::new(
            FixtureTransport::default()
                .serve("ADM2023", "adm2023.csv", ADMISSIONS_CSV)
                .with_delay(Duration::from_secs(30)),
        );
        let options = PipelineOptions {
            run_deadline: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let pipeline = pipeline(transport, Arc::new(MemoryStore::new()), root.path(), options);
        let summary = pipeline.run(&keys(&["admissions"]), 2023).await.unwrap();
        assert!(matches!(
            summary.outcomes["admissions"],
            DatasetOutcome::Failed { stage: Stage::Deadline, .. }
        ));
    }

    struct PanickingStore;

    #[async_trait]
    impl RecordStore for PanickingStore {
        async fn ensure_table(&self, _target: &PersistenceTarget) -> Result<(), IngestError> {
            Ok(())
        }

        async fn upsert(
            &self,
            _target: &PersistenceTarget,
            _records: &[CanonicalRecord],
        ) -> Result<UpsertReport, IngestError> {
            panic!("store exploded");
        }
    }

    #[tokio::test]
    async fn panics_are_captured_per_dataset() {
        let root = tempdir().unwrap();
        let transport = Arc::new(
            FixtureTransport::default()
                .serve("ADM2023", "adm2023.csv", ADMISSIONS_CSV)
                .serve("IC2023Mission", "m.csv", "UNITID\n1\n"),
        );
        let pipeline = pipeline(
            transport,
            Arc::new(PanickingStore),
            root.path(),
            PipelineOptions::default(),
        );
        let summary = pipeline
            .run(&keys(&["admissions", "institutional_mission"]), 2023)
            .await
            .unwrap();
        assert!(matches!(
            summary.outcomes["admissions"],
            DatasetOutcome::Failed { stage: Stage::Panic, .. }
        ));
        assert!(summary.outcomes["institutional_mission"].is_success());
    }

    #[tokio::test]
    async fn persist_failures_carry_rows_written() {
        let root = tempdir().unwrap();
        let transport =
            Arc::new(FixtureTransport::default().serve("ADM2023", "adm2023.csv", ADMISSIONS_CSV));
        let store = MemoryStore::new();
        store.fail_after("ipeds_admissions", 1).await;
        let pipeline = pipeline(
            transport,
            Arc::new(store.clone()),
            root.path(),
            PipelineOptions::default(),
        );
        let summary = pipeline.run(&keys(&["admissions"]), 2023).await.unwrap();
        assert!(matches!(
            summary.outcomes["admissions"],
            DatasetOutcome::Failed { stage: Stage::Persist, rows_written: 1, .. }
        ));
    }

    #[tokio::test]
    async fn report_is_written_per_year() {
        let root = tempdir().unwrap();
        let reports = root.path().join("reports");
        let transport =
            Arc::new(FixtureTransport::default().serve("ADM2023", "adm2023.csv", ADMISSIONS_CSV));
        let options = PipelineOptions {
            reports_root: Some(reports.clone()),
            ..Default::default()
        };
        let pipeline = pipeline(transport, Arc::new(MemoryStore::new()), root.path(), options);
        let summaries = pipeline
            .run_years(&keys(&["admissions"]), &[2022, 2023])
            .await
            .unwrap();

        assert_eq!(summaries.len(), 2);
        assert!(!summaries[0].outcomes["admissions"].is_success());
        let path = reports
            .join(pipeline.run_id().to_string())
            .join("2023.json");
        assert_eq!(summaries[1].report_path.as_deref(), Some(path.as_path()));

        let written: RunSummary =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written.year, 2023);
        assert_eq!(written.outcomes, summaries[1].outcomes);
    }
}
