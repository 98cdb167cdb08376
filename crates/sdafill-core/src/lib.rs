//! Core domain model for sdafill: foreign keys, batches, attribute tables and reconciliation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

pub const CRATE_NAME: &str = "sdafill-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("max batch size must be greater than zero (got {0})")]
    InvalidBatchSize(usize),
    #[error("invalid query template: {0}")]
    InvalidTemplate(String),
    #[error("unsupported source type `{source_type}` for column `{column}`")]
    UnsupportedType { column: String, source_type: String },
    #[error("invalid task `{task_id}`: {reason}")]
    InvalidTask { task_id: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("blank key value")]
    Blank,
    #[error("`{0}` is not an integer key")]
    NotInteger(String),
    #[error("`{value}` contains invalid character {character:?}")]
    InvalidCharacter { value: String, character: char },
    #[error("`{value}` has {actual} characters, expected {expected}")]
    WrongWidth {
        value: String,
        expected: usize,
        actual: usize,
    },
}

/// How raw key values are validated and normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Numeric identifiers such as MUKEY.
    Integer,
    /// Alphanumeric codes such as AREASYMBOL, optionally fixed-width.
    Code { width: Option<usize> },
}

impl KeyKind {
    /// Parse a raw cell value (from the destination table or from a service response)
    /// into its canonical key.
    pub fn parse(&self, raw: &str) -> Result<Key, KeyError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(KeyError::Blank);
        }
        match *self {
            KeyKind::Integer => parse_integer_key(trimmed),
            KeyKind::Code { width } => parse_code_key(trimmed, width),
        }
    }
}

fn parse_integer_key(text: &str) -> Result<Key, KeyError> {
    // REAL-typed columns hand back "753571.0".
    let digits = match text.split_once('.') {
        Some((whole, frac)) if !frac.is_empty() && frac.bytes().all(|b| b == b'0') => whole,
        Some(_) => return Err(KeyError::NotInteger(text.to_string())),
        None => text,
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(KeyError::NotInteger(text.to_string()));
    }
    digits
        .parse::<u64>()
        .map(Key::Integer)
        .map_err(|_| KeyError::NotInteger(text.to_string()))
}

fn parse_code_key(text: &str, width: Option<usize>) -> Result<Key, KeyError> {
    if let Some(character) = text.chars().find(|c| !c.is_ascii_alphanumeric()) {
        return Err(KeyError::InvalidCharacter {
            value: text.to_string(),
            character,
        });
    }
    if let Some(expected) = width {
        if text.len() != expected {
            return Err(KeyError::WrongWidth {
                value: text.to_string(),
                expected,
                actual: text.len(),
            });
        }
    }
    Ok(Key::Code(text.to_ascii_uppercase()))
}

/// Canonical foreign-key value. Only constructible through [`KeyKind::parse`] or the
/// variants themselves, so its text form is always safe to place in a query.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Integer(u64),
    Code(String),
}

impl Key {
    pub fn as_query_literal(&self) -> String {
        match self {
            Key::Integer(value) => value.to_string(),
            Key::Code(code) => format!("'{code}'"),
        }
    }

    /// The kind that parses raw cells into keys like this one, without a width check.
    pub fn kind(&self) -> KeyKind {
        match self {
            Key::Integer(_) => KeyKind::Integer,
            Key::Code(_) => KeyKind::Code { width: None },
        }
    }

    /// Whether a raw stored value denotes this key under the key's own kind.
    pub fn matches_raw(&self, raw: &str) -> bool {
        self.kind().parse(raw).is_ok_and(|parsed| parsed == *self)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Integer(value) => write!(f, "{value}"),
            Key::Code(code) => f.write_str(code),
        }
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Unique keys in sorted order, with the number of source rows carrying each key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySet {
    occurrences: BTreeMap<Key, usize>,
}

impl KeySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the key was not present before.
    pub fn insert(&mut self, key: Key) -> bool {
        let count = self.occurrences.entry(key).or_insert(0);
        *count += 1;
        *count == 1
    }

    pub fn len(&self) -> usize {
        self.occurrences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occurrences.is_empty()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.occurrences.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Key> {
        self.occurrences.keys()
    }

    pub fn occurrences(&self, key: &Key) -> usize {
        self.occurrences.get(key).copied().unwrap_or(0)
    }
}

impl FromIterator<Key> for KeySet {
    fn from_iter<I: IntoIterator<Item = Key>>(iter: I) -> Self {
        let mut set = KeySet::new();
        for key in iter {
            set.insert(key);
        }
        set
    }
}

/// A bounded chunk of keys sent in one remote request. `index` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch {
    pub index: usize,
    pub keys: Vec<Key>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Partition a key set into batches of at most `max_batch_size` keys.
///
/// Every batch but the last is full; the last holds the remainder and is never empty.
pub fn chunk(keys: &KeySet, max_batch_size: usize) -> Result<Vec<Batch>, ConfigError> {
    if max_batch_size == 0 {
        return Err(ConfigError::InvalidBatchSize(max_batch_size));
    }

    let mut batches = Vec::with_capacity(keys.len().div_ceil(max_batch_size));
    let mut current = Vec::with_capacity(max_batch_size.min(keys.len()));
    for key in keys.iter() {
        current.push(key.clone());
        if current.len() == max_batch_size {
            batches.push(Batch {
                index: batches.len() + 1,
                keys: std::mem::take(&mut current),
            });
        }
    }
    if !current.is_empty() {
        batches.push(Batch {
            index: batches.len() + 1,
            keys: current,
        });
    }
    Ok(batches)
}

/// Attribute values for one key, aligned with [`AttributeTable::columns`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct AttributeRow {
    pub values: Vec<Option<String>>,
}

impl AttributeRow {
    pub fn new(values: Vec<Option<String>>) -> Self {
        Self { values }
    }
}

/// Key → attribute row mapping accumulated across batch responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeTable {
    columns: Vec<String>,
    rows: BTreeMap<Key, AttributeRow>,
}

impl AttributeTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: BTreeMap::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Insert or replace the row for `key` (last write wins). Rows are padded or
    /// truncated to the column count.
    pub fn insert(&mut self, key: Key, mut row: AttributeRow) -> Option<AttributeRow> {
        row.values.resize(self.columns.len(), None);
        self.rows.insert(key, row)
    }

    pub fn get(&self, key: &Key) -> Option<&AttributeRow> {
        self.rows.get(key)
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        self.rows.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.rows.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &AttributeRow)> {
        self.rows.iter()
    }
}

/// Destination column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Long,
    Short,
    Double,
    Float,
    Date,
    Blob,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Long => "long",
            FieldType::Short => "short",
            FieldType::Double => "double",
            FieldType::Float => "float",
            FieldType::Date => "date",
            FieldType::Blob => "blob",
        }
    }
}

/// Column metadata reported by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ColumnHint {
    pub source_type: String,
    pub size: Option<u32>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
}

/// A destination column to create when missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub length: Option<u32>,
    #[serde(default)]
    pub precision: Option<u32>,
    #[serde(default)]
    pub scale: Option<u32>,
    #[serde(default)]
    pub alias: Option<String>,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            length: None,
            precision: None,
            scale: None,
            alias: None,
        }
    }

    pub fn text(name: impl Into<String>, length: u32) -> Self {
        Self {
            length: Some(length),
            ..Self::new(name, FieldType::Text)
        }
    }
}

const DEFAULT_TEXT_LENGTH: u32 = 255;
const MAX_TEXT_LENGTH: u32 = 8000;
// SQL Server reports 255 for "not applicable" precision/scale.
const NOT_APPLICABLE: u32 = 255;

/// Source type name → destination type lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMap {
    entries: BTreeMap<String, FieldType>,
}

impl Default for TypeMap {
    fn default() -> Self {
        let mut map = Self::empty();
        for (name, field_type) in [
            ("int", FieldType::Long),
            ("smallint", FieldType::Short),
            ("bit", FieldType::Short),
            ("varbinary", FieldType::Blob),
            ("nvarchar", FieldType::Text),
            ("varchar", FieldType::Text),
            ("char", FieldType::Text),
            ("datetime", FieldType::Date),
            ("datetime2", FieldType::Date),
            ("smalldatetime", FieldType::Date),
            ("decimal", FieldType::Double),
            ("numeric", FieldType::Float),
            ("float", FieldType::Double),
            ("real", FieldType::Double),
        ] {
            map.insert(name, field_type);
        }
        map
    }
}

impl TypeMap {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, source_type: &str, field_type: FieldType) {
        self.entries
            .insert(source_type.trim().to_ascii_lowercase(), field_type);
    }

    pub fn resolve(&self, column: &str, source_type: &str) -> Result<FieldType, ConfigError> {
        self.entries
            .get(&source_type.trim().to_ascii_lowercase())
            .copied()
            .ok_or_else(|| ConfigError::UnsupportedType {
                column: column.to_string(),
                source_type: source_type.to_string(),
            })
    }

    /// Build a destination column from a service metadata hint.
    pub fn column_spec(&self, name: &str, hint: &ColumnHint) -> Result<ColumnSpec, ConfigError> {
        let field_type = self.resolve(name, &hint.source_type)?;
        let mut spec = ColumnSpec::new(name, field_type);
        match field_type {
            FieldType::Text => {
                let length = hint
                    .size
                    .filter(|size| *size > 0 && *size <= MAX_TEXT_LENGTH)
                    .unwrap_or(DEFAULT_TEXT_LENGTH);
                spec.length = Some(length);
            }
            FieldType::Double | FieldType::Float => {
                spec.precision = hint.precision.filter(|p| *p != NOT_APPLICABLE);
                spec.scale = hint.scale.filter(|s| *s != NOT_APPLICABLE);
            }
            _ => {}
        }
        Ok(spec)
    }
}

/// Requested keys compared with what the service returned.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Reconciliation {
    pub requested: usize,
    pub returned: usize,
    pub missing: BTreeSet<Key>,
    pub unexpected: BTreeSet<Key>,
}

impl Reconciliation {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// Human-readable discrepancy report; `label` names the key column (e.g. "MUKEY").
    pub fn report(&self, label: &str) -> String {
        if self.missing.is_empty() && self.unexpected.is_empty() {
            return format!(
                "Values were returned for all {} requested {label} values",
                format_count(self.requested)
            );
        }

        let mut lines = Vec::new();
        if !self.missing.is_empty() {
            lines.push(format!(
                "Values were not returned for {} of {} {label} values: {}",
                format_count(self.missing.len()),
                format_count(self.requested),
                join_keys(&self.missing)
            ));
        }
        if !self.unexpected.is_empty() {
            lines.push(format!(
                "Service returned {} {label} values that were not requested: {}",
                format_count(self.unexpected.len()),
                join_keys(&self.unexpected)
            ));
        }
        lines.join("\n")
    }
}

fn join_keys(keys: &BTreeSet<Key>) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Difference the requested keys against the accumulated attribute table.
pub fn reconcile<'a, I>(requested: I, table: &AttributeTable) -> Reconciliation
where
    I: IntoIterator<Item = &'a Key>,
{
    let requested: BTreeSet<&Key> = requested.into_iter().collect();
    let missing = requested
        .iter()
        .filter(|key| !table.contains_key(key))
        .map(|key| (*key).clone())
        .collect();
    let unexpected = table
        .keys()
        .filter(|key| !requested.contains(key))
        .cloned()
        .collect();
    Reconciliation {
        requested: requested.len(),
        returned: table.len(),
        missing,
        unexpected,
    }
}

/// Format a count with thousands separators: `1234567` → `"1,234,567"`.
pub fn format_count(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_keys(values: &[u64]) -> KeySet {
        values.iter().map(|v| Key::Integer(*v)).collect()
    }

    fn table_with(keys: &[&str]) -> AttributeTable {
        let mut table = AttributeTable::new(vec!["natmusym".to_string()]);
        for raw in keys {
            let key = KeyKind::Integer.parse(raw).unwrap();
            table.insert(key, AttributeRow::new(vec![Some(format!("sym-{raw}"))]));
        }
        table
    }

    #[test]
    fn integer_keys_normalize_whitespace_zeros_and_fraction() {
        let kind = KeyKind::Integer;
        let expected = Key::Integer(753571);
        assert_eq!(kind.parse("753571").unwrap(), expected);
        assert_eq!(kind.parse(" 0753571 ").unwrap(), expected);
        assert_eq!(kind.parse("753571.0").unwrap(), expected);
        assert_eq!(kind.parse("753571").unwrap().to_string(), "753571");
    }

    #[test]
    fn integer_keys_reject_non_digits() {
        let kind = KeyKind::Integer;
        assert_eq!(kind.parse("  "), Err(KeyError::Blank));
        assert!(matches!(kind.parse("7535a1"), Err(KeyError::NotInteger(_))));
        assert!(matches!(kind.parse("753571.5"), Err(KeyError::NotInteger(_))));
        assert!(matches!(kind.parse("1,2"), Err(KeyError::NotInteger(_))));
        assert!(matches!(kind.parse("-4"), Err(KeyError::NotInteger(_))));
    }

    #[test]
    fn code_keys_are_uppercased_and_width_checked() {
        let kind = KeyKind::Code { width: Some(5) };
        assert_eq!(kind.parse("wi025").unwrap(), Key::Code("WI025".to_string()));
        assert!(matches!(
            kind.parse("WI02"),
            Err(KeyError::WrongWidth { expected: 5, actual: 4, .. })
        ));
        assert!(matches!(
            kind.parse("WI'25"),
            Err(KeyError::InvalidCharacter { character: '\'', .. })
        ));
    }

    #[test]
    fn query_literals_quote_codes_only() {
        assert_eq!(Key::Integer(2809844).as_query_literal(), "2809844");
        assert_eq!(Key::Code("WI025".into()).as_query_literal(), "'WI025'");
    }

    #[test]
    fn raw_values_match_keys_of_the_same_kind() {
        assert!(Key::Integer(753574).matches_raw("753574"));
        assert!(Key::Integer(753574).matches_raw("753574.0"));
        assert!(!Key::Integer(753574).matches_raw("753571"));
        assert!(Key::Code("WI025".into()).matches_raw(" wi025"));
        assert!(!Key::Code("WI025".into()).matches_raw("WI025X"));
    }

    #[test]
    fn key_set_counts_occurrences_and_sorts() {
        let mut set = KeySet::new();
        assert!(set.insert(Key::Integer(753574)));
        assert!(set.insert(Key::Integer(753571)));
        assert!(!set.insert(Key::Integer(753574)));
        assert_eq!(set.len(), 2);
        assert_eq!(set.occurrences(&Key::Integer(753574)), 2);
        assert_eq!(set.occurrences(&Key::Integer(1)), 0);
        let order: Vec<_> = set.iter().cloned().collect();
        assert_eq!(order, vec![Key::Integer(753571), Key::Integer(753574)]);
    }

    #[test]
    fn chunk_rejects_zero_batch_size() {
        let keys = int_keys(&[1, 2, 3]);
        assert_eq!(chunk(&keys, 0), Err(ConfigError::InvalidBatchSize(0)));
    }

    #[test]
    fn chunk_partitions_key_sets_of_every_size() {
        for size in 0..40u64 {
            let keys = int_keys(&(1..=size).collect::<Vec<_>>());
            for max in [1usize, 2, 3, 7, 30, 300] {
                let batches = chunk(&keys, max).unwrap();
                assert_eq!(batches.len(), keys.len().div_ceil(max), "size={size} max={max}");

                let mut seen = BTreeSet::new();
                for (i, batch) in batches.iter().enumerate() {
                    assert_eq!(batch.index, i + 1);
                    assert!(!batch.is_empty());
                    assert!(batch.len() <= max);
                    if i + 1 < batches.len() {
                        assert_eq!(batch.len(), max);
                    }
                    for key in &batch.keys {
                        assert!(keys.contains(key));
                        assert!(seen.insert(key.clone()), "key {key} requested twice");
                    }
                }
                assert_eq!(seen.len(), keys.len());
            }
        }
    }

    #[test]
    fn chunk_splits_three_mukeys_into_two_batches() {
        let keys = int_keys(&[2809844, 753574, 753571]);
        let batches = chunk(&keys, 2).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].keys, vec![Key::Integer(753571), Key::Integer(753574)]);
        assert_eq!(batches[1].keys, vec![Key::Integer(2809844)]);
    }

    #[test]
    fn attribute_table_last_write_wins_and_pads_rows() {
        let mut table = AttributeTable::new(vec!["natmusym".into(), "muname".into()]);
        assert!(table
            .insert(Key::Integer(1), AttributeRow::new(vec![Some("a".into())]))
            .is_none());
        let previous = table.insert(
            Key::Integer(1),
            AttributeRow::new(vec![Some("b".into()), Some("Name".into()), Some("extra".into())]),
        );
        assert_eq!(previous.unwrap().values, vec![Some("a".to_string()), None]);
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.get(&Key::Integer(1)).unwrap().values,
            vec![Some("b".to_string()), Some("Name".to_string())]
        );
    }

    #[test]
    fn reconcile_is_empty_when_every_key_returns() {
        let requested = int_keys(&[753571, 753574, 2809844]);
        let table = table_with(&["753571", "753574", "2809844"]);
        let result = reconcile(requested.iter(), &table);
        assert!(result.is_complete());
        assert!(result.unexpected.is_empty());
        assert_eq!(result.requested, 3);
        assert_eq!(result.returned, 3);
    }

    #[test]
    fn reconcile_matches_across_representations() {
        let requested = int_keys(&[753571, 753574, 2809844]);
        let table = table_with(&[" 753571", "0753574"]);
        let result = reconcile(requested.iter(), &table);
        assert_eq!(
            result.missing.into_iter().collect::<Vec<_>>(),
            vec![Key::Integer(2809844)]
        );
    }

    #[test]
    fn reconcile_reports_missing_and_unexpected_keys() {
        let requested = int_keys(&[1, 2, 3, 4]);
        let table = table_with(&["2", "4", "9"]);
        let result = reconcile(requested.iter(), &table);
        assert_eq!(result.missing.len(), 2);
        assert_eq!(result.unexpected.len(), 1);
        let report = result.report("MUKEY");
        assert!(report.contains("not returned for 2 of 4 MUKEY values: 1, 3"));
        assert!(report.contains("not requested: 9"));
    }

    #[test]
    fn reconciliation_serializes_keys_as_text() {
        let requested = int_keys(&[5]);
        let table = AttributeTable::new(vec![]);
        let json = serde_json::to_value(reconcile(requested.iter(), &table)).unwrap();
        assert_eq!(json["missing"], serde_json::json!(["5"]));
    }

    #[test]
    fn type_map_resolves_sql_server_names() {
        let map = TypeMap::default();
        assert_eq!(map.resolve("mukey", "INT").unwrap(), FieldType::Long);
        assert_eq!(map.resolve("natmusym", " varchar ").unwrap(), FieldType::Text);
        assert_eq!(map.resolve("x", "numeric").unwrap(), FieldType::Float);
        assert_eq!(
            map.resolve("x", "money"),
            Err(ConfigError::UnsupportedType {
                column: "x".into(),
                source_type: "money".into()
            })
        );
    }

    #[test]
    fn type_map_builds_column_specs_from_hints() {
        let map = TypeMap::default();
        let text = map
            .column_spec(
                "natmusym",
                &ColumnHint {
                    source_type: "VarChar".into(),
                    size: Some(6),
                    precision: Some(255),
                    scale: Some(255),
                },
            )
            .unwrap();
        assert_eq!(text, ColumnSpec::text("natmusym", 6));

        let wide = map
            .column_spec(
                "notes",
                &ColumnHint {
                    source_type: "nvarchar".into(),
                    size: Some(2_147_483_647),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(wide.length, Some(DEFAULT_TEXT_LENGTH));

        let number = map
            .column_spec(
                "slope",
                &ColumnHint {
                    source_type: "real".into(),
                    size: Some(4),
                    precision: Some(24),
                    scale: Some(255),
                },
            )
            .unwrap();
        assert_eq!(number.field_type, FieldType::Double);
        assert_eq!(number.precision, Some(24));
        assert_eq!(number.scale, None);
    }

    #[test]
    fn format_count_inserts_thousands_separators() {
        assert_eq!(format_count(0), "0");
        assert_eq!(format_count(999), "999");
        assert_eq!(format_count(1000), "1,000");
        assert_eq!(format_count(1234567), "1,234,567");
    }
}
