use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use ipeds_core::{CanonicalRecord, ColumnKind, NaturalKey, PersistenceTarget, Value};
use serde::Serialize;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::sql;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid sql identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("{table}: key {column} value {value:?} is not a valid {kind:?}")]
    InvalidKey {
        table: String,
        column: String,
        value: String,
        kind: ColumnKind,
    },
    #[error("{table}: record has {found} key parts, expected {expected}")]
    KeyArity {
        table: String,
        expected: usize,
        found: usize,
    },
    #[error("preparing table {table}: {source}")]
    Schema {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("writing {table} failed after {written} rows: {source}")]
    Write {
        table: String,
        written: usize,
        #[source]
        source: sqlx::Error,
    },
    #[error("writing {table} failed after {written} rows: {reason}")]
    Rejected {
        table: String,
        written: usize,
        reason: String,
    },
}

impl IngestError {
    /// Rows durably upserted before the failure.
    pub fn rows_written(&self) -> usize {
        match self {
            IngestError::Write { written, .. } | IngestError::Rejected { written, .. } => *written,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub rows_written: usize,
}

/// Natural-key upsert sink. Implementations update exactly `target.columns`
/// on conflict and never delete rows.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn ensure_table(&self, target: &PersistenceTarget) -> Result<(), IngestError>;

    async fn upsert(
        &self,
        target: &PersistenceTarget,
        records: &[CanonicalRecord],
    ) -> Result<UpsertReport, IngestError>;

    async fn persist(
        &self,
        target: &PersistenceTarget,
        records: &[CanonicalRecord],
    ) -> Result<UpsertReport, IngestError> {
        self.ensure_table(target).await?;
        self.upsert(target, records).await
    }
}

/// Key parts coerced to their column kinds, as postgres compares them.
fn key_values(target: &PersistenceTarget, key: &NaturalKey) -> Result<Vec<Value>, IngestError> {
    if key.parts.len() != target.key_columns.len() {
        return Err(IngestError::KeyArity {
            table: target.table.clone(),
            expected: target.key_columns.len(),
            found: key.parts.len(),
        });
    }
    target
        .key_columns
        .iter()
        .zip(&key.parts)
        .map(|(column, part)| {
            let value = column.kind.coerce(part);
            if value.is_null() {
                Err(IngestError::InvalidKey {
                    table: target.table.clone(),
                    column: column.name.clone(),
                    value: part.clone(),
                    kind: column.kind,
                })
            } else {
                Ok(value)
            }
        })
        .collect()
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// Typed bind so nulls carry the column's type.
fn bind_value<'q>(query: PgQuery<'q>, kind: ColumnKind, value: Option<&Value>) -> PgQuery<'q> {
    match kind {
        ColumnKind::Integer => query.bind(value.and_then(Value::as_i64)),
        ColumnKind::Decimal => query.bind(value.and_then(Value::as_f64)),
        ColumnKind::Text => query.bind(value.and_then(Value::to_text)),
    }
}

fn bind_key<'q>(
    query: PgQuery<'q>,
    target: &PersistenceTarget,
    key: &NaturalKey,
) -> Result<PgQuery<'q>, IngestError> {
    let mut query = query;
    for (column, value) in target.key_columns.iter().zip(key_values(target, key)?) {
        query = bind_value(query, column.kind, Some(&value));
    }
    Ok(query.bind(key.year))
}

#[async_trait]
impl RecordStore for PgStore {
    async fn ensure_table(&self, target: &PersistenceTarget) -> Result<(), IngestError> {
        sql::check_target(target)?;
        let schema_error = |source| IngestError::Schema {
            table: target.table.clone(),
            source,
        };

        let mut ddl = String::new();
        // Writing into a String cannot fail.
        let _ = sql::create_table(&mut ddl, target);
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(schema_error)?;
        for alter in sql::add_columns(target) {
            sqlx::query(&alter)
                .execute(&self.pool)
                .await
                .map_err(schema_error)?;
        }
        Ok(())
    }

    async fn upsert(
        &self,
        target: &PersistenceTarget,
        records: &[CanonicalRecord],
    ) -> Result<UpsertReport, IngestError> {
        sql::check_target(target)?;
        let mut statement = String::new();
        let _ = sql::upsert(&mut statement, target);

        let mut written = 0usize;
        for record in records {
            let mut query = bind_key(sqlx::query(&statement), target, &record.key).map_err(
                |err| match err {
                    IngestError::InvalidKey { .. } | IngestError::KeyArity { .. } => {
                        IngestError::Rejected {
                            table: target.table.clone(),
                            written,
                            reason: err.to_string(),
                        }
                    }
                    other => other,
                },
            )?;
            for column in &target.columns {
                query = bind_value(query, column.kind, record.get(&column.name));
            }
            query
                .execute(&self.pool)
                .await
                .map_err(|source| IngestError::Write {
                    table: target.table.clone(),
                    written,
                    source,
                })?;
            written += 1;
        }
        debug!(table = %target.table, rows = written, "upserted");
        Ok(UpsertReport {
            rows_written: written,
        })
    }
}

type Row = BTreeMap<String, Value>;

#[derive(Debug, Default)]
struct MemoryTable {
    columns: Vec<String>,
    rows: BTreeMap<NaturalKey, Row>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
    fail_after: BTreeMap<String, usize>,
}

/// In-process store with the same merge semantics as [`PgStore`].
/// Used by `--dry-run` and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes upserts into `table` fail once `rows` rows have been written.
    pub async fn fail_after(&self, table: &str, rows: usize) {
        self.state
            .lock()
            .await
            .fail_after
            .insert(table.to_string(), rows);
    }

    pub async fn row(&self, table: &str, key: &NaturalKey) -> Option<Row> {
        let state = self.state.lock().await;
        state.tables.get(table)?.rows.get(key).cloned()
    }

    pub async fn row_count(&self, table: &str) -> usize {
        let state = self.state.lock().await;
        state.tables.get(table).map(|t| t.rows.len()).unwrap_or(0)
    }

    pub async fn columns(&self, table: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)
            .map(|t| t.columns.clone())
            .unwrap_or_default()
    }

    pub async fn tables(&self) -> Vec<String> {
        self.state.lock().await.tables.keys().cloned().collect()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn ensure_table(&self, target: &PersistenceTarget) -> Result<(), IngestError> {
        sql::check_target(target)?;
        let mut state = self.state.lock().await;
        let table = state.tables.entry(target.table.clone()).or_default();
        for column in &target.columns {
            if !table.columns.contains(&column.name) {
                table.columns.push(column.name.clone());
            }
        }
        Ok(())
    }

    async fn upsert(
        &self,
        target: &PersistenceTarget,
        records: &[CanonicalRecord],
    ) -> Result<UpsertReport, IngestError> {
        let mut state = self.state.lock().await;
        let limit = state.fail_after.get(&target.table).copied();
        let table = state
            .tables
            .get_mut(&target.table)
            .ok_or_else(|| IngestError::Rejected {
                table: target.table.clone(),
                written: 0,
                reason: "table does not exist".to_string(),
            })?;

        let mut written = 0usize;
        for record in records {
            let rejected = |reason: String| IngestError::Rejected {
                table: target.table.clone(),
                written,
                reason,
            };
            if limit == Some(written) {
                return Err(rejected("injected failure".to_string()));
            }
            let parts = key_values(target, &record.key)
                .map_err(|err| rejected(err.to_string()))?
                .iter()
                .filter_map(Value::to_text)
                .collect();
            let key = NaturalKey::new(parts, record.key.year);
            if let Some(unknown) = target
                .columns
                .iter()
                .find(|c| !table.columns.contains(&c.name))
            {
                return Err(rejected(format!("column {} does not exist", unknown.name)));
            }

            let row = table.rows.entry(key).or_default();
            for column in &target.columns {
                let value = record.get(&column.name).cloned().unwrap_or_default();
                row.insert(column.name.clone(), value);
            }
            written += 1;
        }
        Ok(UpsertReport {
            rows_written: written,
        })
    }
}
