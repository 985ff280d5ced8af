//! Rule-driven reshaping of raw survey tables into canonical records.
//!
//! Dataset knowledge lives in [`RuleSet`] tables (see [`rule_set_for`]); the
//! engine in this module is shared by every dataset.

use std::collections::{BTreeMap, BTreeSet};

use ipeds_core::{
    cell, CanonicalRecord, ColumnKind, DataColumn, KeyColumn, NaturalKey, PersistenceTarget,
    RawTable, Value,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

mod rules;

pub use rules::{builtin_rule_sets, rule_set_for};

pub const CRATE_NAME: &str = "ipeds-transform";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("{dataset}: key column {column} not present in header")]
    MissingKeyColumn { dataset: String, column: String },
    #[error("{dataset}: table has no data rows")]
    EmptyTable { dataset: String },
    #[error("{dataset}: invalid rule set: {reason}")]
    InvalidRuleSet { dataset: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformMode {
    /// One input row per entity; rules rename/select columns.
    Direct,
    /// Many category-coded rows per entity folded into one record per key.
    Pivot,
}

/// Exact match of a trimmed cell against any of the listed codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub column: String,
    pub any_of: Vec<String>,
}

/// Conjunction of conditions; empty always matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predicate {
    pub conditions: Vec<Condition>,
}

impl Predicate {
    pub fn always() -> Self {
        Self::default()
    }

    pub fn equals(column: &str, value: &str) -> Self {
        Self::always().and(column, value)
    }

    pub fn and(self, column: &str, value: &str) -> Self {
        self.and_any(column, &[value])
    }

    pub fn and_any(mut self, column: &str, values: &[&str]) -> Self {
        self.conditions.push(Condition {
            column: column.to_string(),
            any_of: values.iter().map(|v| v.to_string()).collect(),
        });
        self
    }

    pub fn is_always(&self) -> bool {
        self.conditions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    /// Copy (and coerce) the named cell.
    Column(String),
    /// Count matching rows.
    CountRows,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformationRule {
    pub field: String,
    pub kind: ColumnKind,
    pub source: FieldSource,
    #[serde(default)]
    pub when: Predicate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Derivation {
    /// `numerator / denominator * scale`, rounded; null when undefined.
    Ratio {
        field: String,
        numerator: String,
        denominator: String,
        scale: f64,
        decimals: u32,
    },
}

impl Derivation {
    pub fn field(&self) -> &str {
        match self {
            Derivation::Ratio { field, .. } => field,
        }
    }

    fn evaluate(&self, fields: &BTreeMap<String, Value>) -> Value {
        match self {
            Derivation::Ratio {
                numerator,
                denominator,
                scale,
                decimals,
                ..
            } => {
                let num = fields.get(numerator).and_then(Value::as_f64);
                let den = fields.get(denominator).and_then(Value::as_f64);
                match (num, den) {
                    (Some(num), Some(den)) if den != 0.0 => {
                        let factor = 10f64.powi(*decimals as i32);
                        Value::Decimal((num / den * scale * factor).round() / factor)
                    }
                    _ => Value::Null,
                }
            }
        }
    }
}

/// Source column that contributes one part of the natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRule {
    pub source: String,
    pub field: String,
    pub kind: ColumnKind,
}

/// Everything needed to turn one dataset's raw table into canonical records
/// and to persist them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub dataset_key: String,
    pub table: String,
    pub mode: TransformMode,
    pub keys: Vec<KeyRule>,
    pub rules: Vec<TransformationRule>,
    #[serde(default)]
    pub derivations: Vec<Derivation>,
}

impl RuleSet {
    pub fn direct(dataset_key: &str, table: &str) -> Self {
        Self::new(dataset_key, table, TransformMode::Direct)
    }

    pub fn pivot(dataset_key: &str, table: &str) -> Self {
        Self::new(dataset_key, table, TransformMode::Pivot)
    }

    fn new(dataset_key: &str, table: &str, mode: TransformMode) -> Self {
        Self {
            dataset_key: dataset_key.to_string(),
            table: table.to_string(),
            mode,
            keys: Vec::new(),
            rules: Vec::new(),
            derivations: Vec::new(),
        }
    }

    pub fn key(mut self, source: &str, field: &str, kind: ColumnKind) -> Self {
        self.keys.push(KeyRule {
            source: source.to_string(),
            field: field.to_string(),
            kind,
        });
        self
    }

    pub fn column(self, source: &str, field: &str, kind: ColumnKind) -> Self {
        self.column_when(source, field, kind, Predicate::always())
    }

    pub fn column_when(
        mut self,
        source: &str,
        field: &str,
        kind: ColumnKind,
        when: Predicate,
    ) -> Self {
        self.rules.push(TransformationRule {
            field: field.to_string(),
            kind,
            source: FieldSource::Column(source.to_string()),
            when,
        });
        self
    }

    pub fn int(self, source: &str, field: &str) -> Self {
        self.column(source, field, ColumnKind::Integer)
    }

    pub fn dec(self, source: &str, field: &str) -> Self {
        self.column(source, field, ColumnKind::Decimal)
    }

    pub fn text(self, source: &str, field: &str) -> Self {
        self.column(source, field, ColumnKind::Text)
    }

    pub fn count_when(mut self, field: &str, when: Predicate) -> Self {
        self.rules.push(TransformationRule {
            field: field.to_string(),
            kind: ColumnKind::Integer,
            source: FieldSource::CountRows,
            when,
        });
        self
    }

    pub fn ratio(
        mut self,
        field: &str,
        numerator: &str,
        denominator: &str,
        scale: f64,
        decimals: u32,
    ) -> Self {
        self.derivations.push(Derivation::Ratio {
            field: field.to_string(),
            numerator: numerator.to_string(),
            denominator: denominator.to_string(),
            scale,
            decimals,
        });
        self
    }

    /// Output columns in declaration order, each listed once.
    pub fn output_columns(&self) -> Vec<DataColumn> {
        let mut columns: Vec<DataColumn> = Vec::new();
        let declared = self
            .rules
            .iter()
            .map(|r| (r.field.as_str(), r.kind))
            .chain(
                self.derivations
                    .iter()
                    .map(|d| (d.field(), ColumnKind::Decimal)),
            );
        for (name, kind) in declared {
            if !columns.iter().any(|c| c.name == name) {
                columns.push(DataColumn {
                    name: name.to_string(),
                    kind,
                });
            }
        }
        columns
    }

    pub fn target(&self) -> PersistenceTarget {
        PersistenceTarget {
            table: self.table.clone(),
            key_columns: self
                .keys
                .iter()
                .map(|k| KeyColumn {
                    name: k.field.clone(),
                    kind: k.kind,
                })
                .collect(),
            columns: self.output_columns(),
        }
    }

    pub fn validate(&self) -> Result<(), TransformError> {
        let invalid = |reason: String| TransformError::InvalidRuleSet {
            dataset: self.dataset_key.clone(),
            reason,
        };
        if self.keys.is_empty() {
            return Err(invalid("no key columns".into()));
        }
        let mut seen: BTreeMap<&str, ColumnKind> = BTreeMap::new();
        for rule in &self.rules {
            if self.mode == TransformMode::Direct && !rule.when.is_always() {
                return Err(invalid(format!(
                    "direct projection rule for {} has a predicate",
                    rule.field
                )));
            }
            if self.keys.iter().any(|k| k.field == rule.field) {
                return Err(invalid(format!("{} is both key and field", rule.field)));
            }
            if let Some(previous) = seen.insert(rule.field.as_str(), rule.kind) {
                if previous != rule.kind {
                    return Err(invalid(format!("{} declared with two kinds", rule.field)));
                }
            }
        }
        let counted = self
            .rules
            .iter()
            .filter(|r| r.source == FieldSource::CountRows)
            .map(|r| r.field.as_str());
        for field in counted {
            let mixed = self
                .rules
                .iter()
                .any(|r| r.field == field && r.source != FieldSource::CountRows);
            if mixed {
                return Err(invalid(format!("{field} mixes counted and copied rules")));
            }
        }
        let mut derived = BTreeSet::new();
        for derivation in &self.derivations {
            let field = derivation.field();
            let taken = seen.contains_key(field)
                || self.keys.iter().any(|k| k.field == field)
                || !derived.insert(field);
            if taken {
                return Err(invalid(format!("derived field {field} is already declared")));
            }
            let Derivation::Ratio {
                numerator,
                denominator,
                ..
            } = derivation;
            for input in [numerator, denominator] {
                if !seen.contains_key(input.as_str()) {
                    return Err(invalid(format!(
                        "{field} derives from unknown field {input}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Records plus what the engine had to skip on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutput {
    pub records: Vec<CanonicalRecord>,
    pub rows_scanned: usize,
    /// Rows whose key cells are empty or do not coerce to the key's kind.
    pub rows_skipped: usize,
    /// Source columns referenced by rules but absent from this year's header.
    pub missing_columns: Vec<String>,
}

struct ResolvedCondition {
    index: Option<usize>,
    any_of: Vec<String>,
}

impl ResolvedCondition {
    fn matches(&self, row: &[String]) -> bool {
        match self.index {
            Some(idx) => {
                let value = cell(row, idx);
                self.any_of.iter().any(|v| v == value)
            }
            None => false,
        }
    }
}

struct ResolvedRule<'a> {
    rule: &'a TransformationRule,
    source_index: Option<usize>,
    conditions: Vec<ResolvedCondition>,
}

impl ResolvedRule<'_> {
    fn matches(&self, row: &[String]) -> bool {
        self.conditions.iter().all(|c| c.matches(row))
    }
}

/// Value written by a column rule, ranked by (rule order, value).
struct Slot {
    rule_index: usize,
    value: Value,
}

#[derive(Default)]
struct Accumulator {
    slots: BTreeMap<String, Slot>,
    counts: BTreeMap<String, i64>,
}

impl Accumulator {
    fn write(&mut self, field: &str, rule_index: usize, value: Value) {
        if value.is_null() {
            return;
        }
        match self.slots.get_mut(field) {
            Some(slot) => {
                let wins = rule_index > slot.rule_index
                    || (rule_index == slot.rule_index && value.merge_cmp(&slot.value).is_gt());
                if wins {
                    slot.rule_index = rule_index;
                    slot.value = value;
                }
            }
            None => {
                self.slots
                    .insert(field.to_string(), Slot { rule_index, value });
            }
        }
    }

    fn count(&mut self, field: &str) {
        *self.counts.entry(field.to_string()).or_default() += 1;
    }
}

/// Applies `rules` to `table`, producing one record per natural key sorted by key.
///
/// Within a row, rules are applied in declared order and a later rule overrides
/// an earlier one for the same field. When several rows of one key hit the same
/// rule, the greatest value wins, so the output never depends on row order.
/// Null (empty or malformed) cells never overwrite anything.
pub fn transform(
    table: &RawTable,
    rules: &RuleSet,
    year: i32,
) -> Result<TransformOutput, TransformError> {
    rules.validate()?;
    if table.is_empty() {
        return Err(TransformError::EmptyTable {
            dataset: rules.dataset_key.clone(),
        });
    }

    let key_indices = rules
        .keys
        .iter()
        .map(|k| {
            table
                .column_index(&k.source)
                .ok_or_else(|| TransformError::MissingKeyColumn {
                    dataset: rules.dataset_key.clone(),
                    column: k.source.clone(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut missing_columns = Vec::new();
    let mut note_missing = |column: &str| {
        if !missing_columns.iter().any(|c: &String| c == column) {
            missing_columns.push(column.to_string());
        }
    };

    let resolved = rules
        .rules
        .iter()
        .map(|rule| {
            let source_index = match &rule.source {
                FieldSource::Column(name) => {
                    let idx = table.column_index(name);
                    if idx.is_none() {
                        note_missing(name);
                    }
                    idx
                }
                FieldSource::CountRows => None,
            };
            let conditions = rule
                .when
                .conditions
                .iter()
                .map(|c| {
                    let index = table.column_index(&c.column);
                    if index.is_none() {
                        note_missing(&c.column);
                    }
                    ResolvedCondition {
                        index,
                        any_of: c.any_of.clone(),
                    }
                })
                .collect();
            ResolvedRule {
                rule,
                source_index,
                conditions,
            }
        })
        .collect::<Vec<_>>();

    if !missing_columns.is_empty() {
        warn!(
            dataset = %rules.dataset_key,
            year,
            missing = ?missing_columns,
            "rule columns absent from header; affected fields stay null"
        );
    }

    let mut accumulators: BTreeMap<NaturalKey, Accumulator> = BTreeMap::new();
    let mut rows_skipped = 0usize;

    for row in &table.rows {
        let parts = rules
            .keys
            .iter()
            .zip(&key_indices)
            .map(|(key, &idx)| key.kind.canonical_key(cell(row, idx)))
            .collect::<Option<Vec<_>>>();
        let Some(parts) = parts else {
            rows_skipped += 1;
            continue;
        };

        let acc = accumulators
            .entry(NaturalKey::new(parts, year))
            .or_default();

        for (rule_index, resolved) in resolved.iter().enumerate() {
            if rules.mode == TransformMode::Pivot && !resolved.matches(row) {
                continue;
            }
            match resolved.rule.source {
                FieldSource::CountRows => acc.count(&resolved.rule.field),
                FieldSource::Column(_) => {
                    let value = resolved
                        .source_index
                        .map(|idx| resolved.rule.kind.coerce(cell(row, idx)))
                        .unwrap_or(Value::Null);
                    acc.write(&resolved.rule.field, rule_index, value);
                }
            }
        }
    }

    let records = accumulators
        .into_iter()
        .map(|(key, acc)| build_record(rules, key, acc))
        .collect();

    Ok(TransformOutput {
        records,
        rows_scanned: table.len(),
        rows_skipped,
        missing_columns,
    })
}

/// Every declared field is present; unset ones are null and counts default to zero.
fn build_record(rules: &RuleSet, key: NaturalKey, mut acc: Accumulator) -> CanonicalRecord {
    let mut record = CanonicalRecord::new(key);
    for rule in &rules.rules {
        if record.fields.contains_key(&rule.field) {
            continue;
        }
        let value = match rule.source {
            FieldSource::CountRows => {
                Value::Integer(acc.counts.get(&rule.field).copied().unwrap_or(0))
            }
            FieldSource::Column(_) => acc
                .slots
                .remove(&rule.field)
                .map(|slot| slot.value)
                .unwrap_or(Value::Null),
        };
        record.fields.insert(rule.field.clone(), value);
    }
    for derivation in &rules.derivations {
        let value = derivation.evaluate(&record.fields);
        record.fields.insert(derivation.field().to_string(), value);
    }
    record
}
