//! Destination table contract, key extraction and attribute write-back.

use async_trait::async_trait;
use sdafill_core::{format_count, AttributeTable, ColumnSpec, Key, KeyError, KeyKind, KeySet};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

mod memory;
mod sqlite;

pub use memory::MemoryTable;
pub use sqlite::SqliteTable;

pub const CRATE_NAME: &str = "sdafill-source";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("column `{column}` not found in {table}")]
    MissingColumn { table: String, column: String },
    #[error("{table} has no rows")]
    EmptySource { table: String },
    #[error("no valid {column} values found in {table}")]
    EmptyKeySet { table: String, column: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOrder {
    Unordered,
    Ascending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub column: String,
    pub value: Option<String>,
}

/// Tabular destination: a feature class, shapefile attribute table, GeoPackage layer, ...
///
/// Column arguments are names as returned by [`TableSource::columns`].
#[async_trait]
pub trait TableSource: Send + Sync {
    fn name(&self) -> &str;

    async fn columns(&self) -> Result<Vec<String>, SourceError>;

    async fn row_count(&self) -> Result<usize, SourceError>;

    async fn read_column(
        &self,
        column: &str,
        order: ReadOrder,
    ) -> Result<Vec<Option<String>>, SourceError>;

    async fn add_column(&self, spec: &ColumnSpec) -> Result<(), SourceError>;

    /// Update every row whose `key_column` holds `key`; returns the number of rows changed.
    async fn update_rows(
        &self,
        key_column: &str,
        key: &Key,
        assignments: &[Assignment],
    ) -> Result<u64, SourceError>;
}

fn unqualified(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name).trim()
}

/// Resolve a column name: an exact match wins, then a case-insensitive match on the
/// unqualified name (`db.owner.table.MUKEY` → `MUKEY`), preferring unqualified columns.
pub fn find_column(columns: &[String], wanted: &str) -> Option<String> {
    let wanted = wanted.trim();
    if let Some(exact) = columns.iter().find(|c| c.as_str() == wanted) {
        return Some(exact.clone());
    }
    let wanted = unqualified(wanted);
    let candidates: Vec<&String> = columns
        .iter()
        .filter(|c| unqualified(c).eq_ignore_ascii_case(wanted))
        .collect();
    candidates
        .iter()
        .find(|c| !c.contains('.'))
        .or(candidates.first())
        .map(|c| (*c).clone())
}

#[derive(Debug, Clone)]
pub struct Extraction {
    /// Column name as stored in the source.
    pub column: String,
    pub keys: KeySet,
    pub rows_scanned: usize,
    pub blank_values: usize,
    pub rejected: Vec<(String, KeyError)>,
}

/// Read the unique, valid keys of `key_column`. Invalid values are logged and skipped.
pub async fn extract_keys(
    source: &dyn TableSource,
    key_column: &str,
    kind: KeyKind,
) -> Result<Extraction, SourceError> {
    let columns = source.columns().await?;
    let column = find_column(&columns, key_column).ok_or_else(|| SourceError::MissingColumn {
        table: source.name().to_string(),
        column: key_column.to_string(),
    })?;

    if source.row_count().await? == 0 {
        return Err(SourceError::EmptySource {
            table: source.name().to_string(),
        });
    }

    let values = source.read_column(&column, ReadOrder::Ascending).await?;
    let mut keys = KeySet::new();
    let mut blank_values = 0usize;
    let mut rejected = Vec::new();

    for raw in &values {
        let Some(raw) = raw.as_deref() else {
            blank_values += 1;
            continue;
        };
        match kind.parse(raw) {
            Ok(key) => {
                keys.insert(key);
            }
            Err(KeyError::Blank) => blank_values += 1,
            Err(err) => {
                warn!(table = source.name(), column = %column, value = raw, error = %err, "skipping invalid key value");
                rejected.push((raw.to_string(), err));
            }
        }
    }

    if keys.is_empty() {
        return Err(SourceError::EmptyKeySet {
            table: source.name().to_string(),
            column,
        });
    }

    debug!(
        table = source.name(),
        column = %column,
        rows = values.len(),
        unique = keys.len(),
        blank = blank_values,
        rejected = rejected.len(),
        "extracted keys"
    );

    Ok(Extraction {
        column,
        keys,
        rows_scanned: values.len(),
        blank_values,
        rejected,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnsuredColumns {
    pub created: Vec<String>,
    pub reused: Vec<String>,
    /// Destination column name for each requested spec, in request order.
    pub resolved_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedKey {
    pub key: Key,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyStats {
    pub keys_applied: usize,
    pub rows_updated: u64,
    pub rows_expected: u64,
    pub failed_keys: Vec<FailedKey>,
}

pub struct AttributeWriter<'a> {
    source: &'a dyn TableSource,
}

impl<'a> AttributeWriter<'a> {
    pub fn new(source: &'a dyn TableSource) -> Self {
        Self { source }
    }

    /// Add the columns that do not exist yet. Existing columns are reused as they are.
    pub async fn ensure_columns(
        &self,
        desired: &[ColumnSpec],
    ) -> Result<EnsuredColumns, SourceError> {
        let mut existing = self.source.columns().await?;
        let mut ensured = EnsuredColumns::default();

        for spec in desired {
            if let Some(found) = find_column(&existing, &spec.name) {
                debug!(table = self.source.name(), column = %found, "reusing existing column");
                ensured.reused.push(found.clone());
                ensured.resolved_names.push(found);
                continue;
            }

            self.source.add_column(spec).await?;
            info!(
                table = self.source.name(),
                column = %spec.name,
                field_type = spec.field_type.as_str(),
                length = ?spec.length,
                "added column"
            );
            existing.push(spec.name.clone());
            ensured.created.push(spec.name.clone());
            ensured.resolved_names.push(spec.name.clone());
        }

        Ok(ensured)
    }

    /// Write every attribute row to all destination rows sharing its key. Failures are
    /// per key: logged, recorded and skipped.
    pub async fn apply(
        &self,
        key_column: &str,
        table: &AttributeTable,
        target_columns: &[String],
        expected: &KeySet,
    ) -> ApplyStats {
        let mut stats = ApplyStats::default();

        for (key, row) in table.iter() {
            let assignments = target_columns
                .iter()
                .zip(&row.values)
                .map(|(column, value)| Assignment {
                    column: column.clone(),
                    value: value.clone(),
                })
                .collect::<Vec<_>>();

            match self.source.update_rows(key_column, key, &assignments).await {
                Ok(updated) => {
                    stats.keys_applied += 1;
                    stats.rows_updated += updated;
                    stats.rows_expected += expected.occurrences(key) as u64;
                }
                Err(err) => {
                    warn!(table = self.source.name(), %key, error = %err, "row update failed");
                    stats.failed_keys.push(FailedKey {
                        key: key.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        if stats.rows_updated != stats.rows_expected {
            warn!(
                table = self.source.name(),
                expected = stats.rows_expected,
                updated = stats.rows_updated,
                "updated row count differs from the rows carrying the applied keys"
            );
        }
        info!(
            table = self.source.name(),
            "updated {} rows for {} keys",
            format_count(stats.rows_updated as usize),
            format_count(stats.keys_applied)
        );

        stats
    }
}
