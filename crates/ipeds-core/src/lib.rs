//! Core domain model for IPEDS ingest: dataset catalog, source locations,
//! raw tables and canonical records.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "ipeds-core";

/// Placeholder every source location template must carry.
pub const IDENTIFIER_PLACEHOLDER: &str = "{id}";

pub const ARCHIVE_MIRROR_TEMPLATE: &str =
    "https://web.archive.org/web/20240822183521/https://nces.ed.gov/ipeds/datacenter/data/{id}.zip";
pub const PRIMARY_ORIGIN_TEMPLATE: &str = "https://nces.ed.gov/ipeds/datacenter/data/{id}.zip";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("unknown dataset key: {0}")]
    UnknownDataset(String),
    #[error("source location {name} has no {{id}} placeholder: {template}")]
    MissingPlaceholder { name: String, template: String },
    #[error("no source locations configured")]
    NoSourceLocations,
}

/// Static catalog table: logical dataset key to candidate identifier templates.
///
/// Templates are rendered per reporting year. `{year}` is the four digit year,
/// `{span}` the academic-year span (`2223` for 2023). Candidates are tried in
/// the listed order.
const BUILTIN_CATALOG: &[(&str, &[&str])] = &[
    ("institutions", &["HD{year}"]),
    ("institutional_characteristics", &["IC{year}"]),
    ("institutional_characteristics_ay", &["IC{year}_AY"]),
    ("institutional_characteristics_py", &["IC{year}_PY"]),
    ("institutional_mission", &["IC{year}Mission"]),
    ("institutional_campuses", &["IC{year}_PCCAMPUSES"]),
    ("enrollment_fall", &["EF{year}A"]),
    ("enrollment_fall_age", &["EF{year}B"]),
    ("enrollment_fall_residence", &["EF{year}C"]),
    ("enrollment_fall_distance", &["EF{year}A_DIST"]),
    ("enrollment_fall_full", &["EF{year}D"]),
    ("enrollment_12month", &["EF{year}"]),
    ("enrollment_12month_dist", &["EFFY{year}_DIST"]),
    ("enrollment_high_school", &["EFFY{year}_HS"]),
    ("completions", &["C{year}_A"]),
    ("staff_instructional", &["S{year}_IS"]),
    ("salaries_instructional", &["SAL{year}_IS"]),
    ("finance_public", &["F{span}_F2", "F{span}"]),
    ("admissions", &["ADM{year}"]),
    ("graduation_rates", &["GR{year}"]),
    ("graduation_rates_pell", &["GR{year}_PELL_SSL"]),
    ("financial_aid_summary", &["SFAV{span}"]),
    ("outcome_measures", &["OM{year}"]),
    ("academic_libraries", &["AL{year}"]),
];

/// Logical dataset resolved for one reporting year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub key: String,
    pub candidate_identifiers: Vec<String>,
}

/// Registry of dataset keys and their per-year identifier templates.
#[derive(Debug, Clone)]
pub struct Catalog {
    entries: BTreeMap<String, Vec<String>>,
}

impl Catalog {
    pub fn builtin() -> Self {
        let entries = BUILTIN_CATALOG
            .iter()
            .map(|(key, templates)| {
                (
                    (*key).to_string(),
                    templates.iter().map(|t| (*t).to_string()).collect(),
                )
            })
            .collect();
        Self { entries }
    }

    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Adds or replaces an entry. Later naming conventions are a data change here.
    pub fn with_entry(mut self, key: impl Into<String>, templates: &[&str]) -> Self {
        self.entries.insert(
            key.into(),
            templates.iter().map(|t| (*t).to_string()).collect(),
        );
        self
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn descriptor(&self, key: &str, year: i32) -> Result<DatasetDescriptor, CatalogError> {
        let templates = self
            .entries
            .get(key)
            .ok_or_else(|| CatalogError::UnknownDataset(key.to_string()))?;
        Ok(DatasetDescriptor {
            key: key.to_string(),
            candidate_identifiers: templates
                .iter()
                .map(|t| render_identifier(t, year))
                .collect(),
        })
    }

    /// Resolves every key or fails on the first unknown one.
    pub fn descriptors(
        &self,
        keys: &[String],
        year: i32,
    ) -> Result<Vec<DatasetDescriptor>, CatalogError> {
        keys.iter().map(|k| self.descriptor(k, year)).collect()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Two-digit previous year followed by two-digit year: 2023 -> "2223".
pub fn academic_span(year: i32) -> String {
    format!("{:02}{:02}", (year - 1).rem_euclid(100), year.rem_euclid(100))
}

pub fn render_identifier(template: &str, year: i32) -> String {
    template
        .replace("{year}", &year.to_string())
        .replace("{span}", &academic_span(year))
}

/// URL template for one retrieval origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub name: String,
    pub template: String,
}

impl SourceLocation {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Result<Self, CatalogError> {
        let location = Self {
            name: name.into(),
            template: template.into(),
        };
        location.validate()?;
        Ok(location)
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.template.contains(IDENTIFIER_PLACEHOLDER) {
            Ok(())
        } else {
            Err(CatalogError::MissingPlaceholder {
                name: self.name.clone(),
                template: self.template.clone(),
            })
        }
    }

    pub fn url_for(&self, identifier: &str) -> String {
        self.template.replace(IDENTIFIER_PLACEHOLDER, identifier)
    }
}

/// Mirror first, then origin. The origin frequently rejects automated clients.
pub fn default_source_locations() -> Vec<SourceLocation> {
    vec![
        SourceLocation {
            name: "wayback".to_string(),
            template: ARCHIVE_MIRROR_TEMPLATE.to_string(),
        },
        SourceLocation {
            name: "nces".to_string(),
            template: PRIMARY_ORIGIN_TEMPLATE.to_string(),
        },
    ]
}

pub fn validate_source_locations(locations: &[SourceLocation]) -> Result<(), CatalogError> {
    if locations.is_empty() {
        return Err(CatalogError::NoSourceLocations);
    }
    locations.iter().try_for_each(SourceLocation::validate)
}

/// Parsed delimited file: header row plus column-aligned data rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { headers, rows }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h.trim() == name)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Trimmed cell at `idx`, empty when the row is short.
pub fn cell(row: &[String], idx: usize) -> &str {
    row.get(idx).map(|c| c.trim()).unwrap_or("")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Integer,
    Decimal,
    Text,
}

impl ColumnKind {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnKind::Integer => "BIGINT",
            ColumnKind::Decimal => "DOUBLE PRECISION",
            ColumnKind::Text => "TEXT",
        }
    }

    /// Coerces a raw cell. Empty or malformed cells become `Value::Null`.
    pub fn coerce(self, raw: &str) -> Value {
        let raw = raw.trim();
        if raw.is_empty() {
            return Value::Null;
        }
        match self {
            ColumnKind::Text => Value::Text(raw.to_string()),
            ColumnKind::Decimal => raw
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(Value::Decimal)
                .unwrap_or(Value::Null),
            ColumnKind::Integer => match raw.parse::<i64>() {
                Ok(v) => Value::Integer(v),
                Err(_) => raw
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64)
                    .map(|v| Value::Integer(v as i64))
                    .unwrap_or(Value::Null),
            },
        }
    }

    /// Canonical spelling of a key cell (`"0100"` and `"100.0"` both give `"100"`
    /// for integers). `None` when the cell does not coerce.
    pub fn canonical_key(self, raw: &str) -> Option<String> {
        self.coerce(raw).to_text()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Integer(i64),
    Decimal(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Decimal(v) => Some(*v),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Null => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            Value::Decimal(v) if v.fract() == 0.0 => Some(*v as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Integer(v) => Some(v.to_string()),
            Value::Decimal(v) => Some(v.to_string()),
            Value::Text(s) => Some(s.clone()),
        }
    }

    /// Total order used to pick a winner between conflicting rows:
    /// nulls lowest, numbers numerically, text lexicographically, numbers before text.
    pub fn merge_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Text(_), _) => Ordering::Greater,
            (_, Value::Text(_)) => Ordering::Less,
            (a, b) => {
                let a = a.as_f64().unwrap_or(f64::NAN);
                let b = b.as_f64().unwrap_or(f64::NAN);
                a.total_cmp(&b)
            }
        }
    }
}

/// Business identifier of a canonical record: entity key parts plus year.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub parts: Vec<String>,
    pub year: i32,
}

impl NaturalKey {
    pub fn new(parts: Vec<String>, year: i32) -> Self {
        Self { parts, year }
    }
}

/// One wide row per natural key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub key: NaturalKey,
    pub fields: BTreeMap<String, Value>,
}

impl CanonicalRecord {
    pub fn new(key: NaturalKey) -> Self {
        Self {
            key,
            fields: BTreeMap::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyColumn {
    pub name: String,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataColumn {
    pub name: String,
    pub kind: ColumnKind,
}

pub const YEAR_COLUMN: &str = "year";

/// Destination table plus its conflict target. `year` is always the last key column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceTarget {
    pub table: String,
    pub key_columns: Vec<KeyColumn>,
    pub columns: Vec<DataColumn>,
}

impl PersistenceTarget {
    pub fn conflict_columns(&self) -> Vec<&str> {
        self.key_columns
            .iter()
            .map(|c| c.name.as_str())
            .chain(std::iter::once(YEAR_COLUMN))
            .collect()
    }

    pub fn column_kind(&self, name: &str) -> Option<ColumnKind> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn academic_span_uses_two_digit_years() {
        assert_eq!(academic_span(2023), "2223");
        assert_eq!(academic_span(2000), "9900");
        assert_eq!(academic_span(2010), "0910");
    }

    #[test]
    fn builtin_catalog_resolves_year_dependent_identifiers() {
        let catalog = Catalog::builtin();
        let finance = catalog.descriptor("finance_public", 2023).unwrap();
        assert_eq!(finance.candidate_identifiers, vec!["F2223_F2", "F2223"]);

        let hd = catalog.descriptor("institutions", 2021).unwrap();
        assert_eq!(hd.candidate_identifiers, vec!["HD2021"]);
    }

    #[test]
    fn unknown_dataset_is_an_error() {
        let err = Catalog::builtin()
            .descriptors(&["institutions".into(), "nope".into()], 2023)
            .unwrap_err();
        assert_eq!(err, CatalogError::UnknownDataset("nope".into()));
    }

    #[test]
    fn source_location_requires_placeholder() {
        assert!(SourceLocation::new("bad", "https://example.org/file.zip").is_err());
        let loc = SourceLocation::new("ok", "https://example.org/{id}.zip").unwrap();
        assert_eq!(loc.url_for("HD2023"), "https://example.org/HD2023.zip");
        assert_eq!(
            validate_source_locations(&[]),
            Err(CatalogError::NoSourceLocations)
        );
        assert!(validate_source_locations(&default_source_locations()).is_ok());
    }

    #[test]
    fn coercion_nulls_malformed_cells() {
        assert_eq!(ColumnKind::Integer.coerce(" 500 "), Value::Integer(500));
        assert_eq!(ColumnKind::Integer.coerce("12.0"), Value::Integer(12));
        assert_eq!(ColumnKind::Integer.coerce("12.5"), Value::Null);
        assert_eq!(ColumnKind::Integer.coerce("n/a"), Value::Null);
        assert_eq!(ColumnKind::Decimal.coerce("0.25"), Value::Decimal(0.25));
        assert_eq!(ColumnKind::Decimal.coerce(""), Value::Null);
        assert_eq!(ColumnKind::Text.coerce(" Yale "), Value::Text("Yale".into()));
    }

    #[test]
    fn key_spellings_collapse_to_one_canonical_form() {
        for raw in ["100", "0100", "100.0", " 100 "] {
            assert_eq!(ColumnKind::Integer.canonical_key(raw).as_deref(), Some("100"));
        }
        assert_eq!(ColumnKind::Integer.canonical_key("N/A"), None);
        assert_eq!(ColumnKind::Integer.canonical_key(""), None);
        assert_eq!(ColumnKind::Text.canonical_key(" ab "), Some("ab".into()));
    }

    #[test]
    fn merge_order_ranks_nulls_lowest() {
        assert_eq!(Value::Null.merge_cmp(&Value::Integer(0)), Ordering::Less);
        assert_eq!(
            Value::Integer(90).merge_cmp(&Value::Decimal(500.0)),
            Ordering::Less
        );
        assert_eq!(
            Value::Text("b".into()).merge_cmp(&Value::Text("a".into())),
            Ordering::Greater
        );
    }
}
