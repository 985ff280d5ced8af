use std::fmt::Write as _;

use ipeds_core::{ColumnKind, PersistenceTarget, YEAR_COLUMN};

use crate::store::IngestError;

/// Lower-case ASCII identifiers only; everything interpolated into SQL passes here.
pub fn check_identifier(name: &str) -> Result<(), IngestError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c == '_')
        .unwrap_or(false);
    if valid_start && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        Ok(())
    } else {
        Err(IngestError::InvalidIdentifier(name.to_string()))
    }
}

pub fn check_target(target: &PersistenceTarget) -> Result<(), IngestError> {
    check_identifier(&target.table)?;
    for name in target
        .key_columns
        .iter()
        .map(|c| &c.name)
        .chain(target.columns.iter().map(|c| &c.name))
    {
        check_identifier(name)?;
    }
    Ok(())
}

fn year_type() -> &'static str {
    "INTEGER"
}

pub fn create_table(out: &mut String, target: &PersistenceTarget) -> std::fmt::Result {
    writeln!(out, "CREATE TABLE IF NOT EXISTS {} (", target.table)?;
    for key in &target.key_columns {
        writeln!(out, "  {} {} NOT NULL,", key.name, key.kind.sql_type())?;
    }
    writeln!(out, "  {YEAR_COLUMN} {} NOT NULL,", year_type())?;
    for column in &target.columns {
        writeln!(out, "  {} {},", column.name, column.kind.sql_type())?;
    }
    writeln!(out, "  PRIMARY KEY ({})", target.conflict_columns().join(", "))?;
    write!(out, ")")?;
    Ok(())
}

/// One statement per data column so columns introduced in later years reach
/// tables created by earlier runs.
pub fn add_columns(target: &PersistenceTarget) -> Vec<String> {
    target
        .columns
        .iter()
        .map(|column| {
            format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                target.table,
                column.name,
                column.kind.sql_type()
            )
        })
        .collect()
}

/// Placeholders follow column order: key columns, year, then data columns.
pub fn upsert(out: &mut String, target: &PersistenceTarget) -> std::fmt::Result {
    let conflict = target.conflict_columns();
    let names = conflict
        .iter()
        .copied()
        .chain(target.columns.iter().map(|c| c.name.as_str()))
        .collect::<Vec<_>>();
    let kinds = target
        .key_columns
        .iter()
        .map(|c| Some(c.kind))
        .chain(std::iter::once(None))
        .chain(target.columns.iter().map(|c| Some(c.kind)));

    writeln!(out, "INSERT INTO {} ({})", target.table, names.join(", "))?;
    let placeholders = kinds
        .enumerate()
        .map(|(idx, kind)| {
            let ty = kind.map(ColumnKind::sql_type).unwrap_or_else(year_type);
            format!("${}::{ty}", idx + 1)
        })
        .collect::<Vec<_>>();
    writeln!(out, "VALUES ({})", placeholders.join(", "))?;
    writeln!(out, "ON CONFLICT ({})", conflict.join(", "))?;
    if target.columns.is_empty() {
        write!(out, "DO NOTHING")?;
    } else {
        writeln!(out, "DO UPDATE SET")?;
        let assignments = target
            .columns
            .iter()
            .map(|c| format!("  {0} = EXCLUDED.{0}", c.name))
            .collect::<Vec<_>>();
        write!(out, "{}", assignments.join(",\n"))?;
    }
    Ok(())
}
