use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use sdafill_core::{ColumnSpec, FieldType, Key, KeyKind};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{find_column, Assignment, ReadOrder, SourceError, TableSource};

/// Largest number of rowids bound into one `UPDATE`.
const ROWIDS_PER_UPDATE: usize = 500;

/// Rowids grouped by the key their key cell parses to.
#[derive(Debug)]
struct RowIndex {
    column: String,
    kind: KeyKind,
    rows: HashMap<Key, Vec<i64>>,
}

/// A rowid table inside a SQLite database, such as a GeoPackage feature layer.
///
/// Updates locate rows through an index of parsed key cells, so a row matches exactly
/// when [`extract_keys`](crate::extract_keys) would read the same key from it. The index
/// is rebuilt after every `read_column`.
#[derive(Debug, Clone)]
pub struct SqliteTable {
    pool: SqlitePool,
    table: String,
    index: Arc<Mutex<Option<RowIndex>>>,
}

impl SqliteTable {
    pub fn new(pool: SqlitePool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
            index: Arc::new(Mutex::new(None)),
        }
    }

    /// Open an existing database file and check that `table` is present.
    pub async fn open(path: impl AsRef<Path>, table: &str) -> Result<Self, SourceError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(false);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let source = Self::new(pool, table);
        if source.columns().await?.is_empty() {
            return Err(SourceError::Message(format!(
                "table {table} not found in {}",
                path.as_ref().display()
            )));
        }
        Ok(source)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn resolve(&self, column: &str) -> Result<String, SourceError> {
        let columns = self.columns().await?;
        find_column(&columns, column).ok_or_else(|| SourceError::MissingColumn {
            table: self.table.clone(),
            column: column.to_string(),
        })
    }

    async fn build_index(&self, column: &str, kind: KeyKind) -> Result<RowIndex, SourceError> {
        let sql = format!(
            "SELECT rowid, CAST({} AS TEXT) FROM {}",
            quote_ident(column),
            quote_ident(&self.table)
        );
        let cells: Vec<(i64, Option<String>)> =
            sqlx::query_as(&sql).fetch_all(&self.pool).await?;

        let mut rows: HashMap<Key, Vec<i64>> = HashMap::new();
        for (rowid, raw) in cells {
            if let Some(key) = raw.and_then(|raw| kind.parse(&raw).ok()) {
                rows.entry(key).or_default().push(rowid);
            }
        }
        debug!(table = %self.table, column, keys = rows.len(), "built row index");
        Ok(RowIndex {
            column: column.to_string(),
            kind,
            rows,
        })
    }

    async fn rowids_for(&self, column: &str, key: &Key) -> Result<Vec<i64>, SourceError> {
        let kind = key.kind();
        let mut index = self.index.lock().await;
        let current = index
            .as_ref()
            .is_some_and(|index| index.column == column && index.kind == kind);
        if !current {
            *index = Some(self.build_index(column, kind).await?);
        }
        Ok(index
            .as_ref()
            .and_then(|index| index.rows.get(key))
            .cloned()
            .unwrap_or_default())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Declared column type, using the names GeoPackage readers recognise.
fn sql_type(spec: &ColumnSpec) -> String {
    match spec.field_type {
        FieldType::Text => match spec.length {
            Some(length) => format!("TEXT({length})"),
            None => "TEXT".to_string(),
        },
        FieldType::Long => "INTEGER".to_string(),
        FieldType::Short => "SMALLINT".to_string(),
        FieldType::Double => "DOUBLE".to_string(),
        FieldType::Float => "FLOAT".to_string(),
        FieldType::Date => "DATETIME".to_string(),
        FieldType::Blob => "BLOB".to_string(),
    }
}

#[async_trait]
impl TableSource for SqliteTable {
    fn name(&self) -> &str {
        &self.table
    }

    async fn columns(&self) -> Result<Vec<String>, SourceError> {
        let rows = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(&self.table)))
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.try_get::<String, _>("name")?);
        }
        Ok(out)
    }

    async fn row_count(&self) -> Result<usize, SourceError> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {}",
            quote_ident(&self.table)
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn read_column(
        &self,
        column: &str,
        order: ReadOrder,
    ) -> Result<Vec<Option<String>>, SourceError> {
        self.index.lock().await.take();
        let column = quote_ident(&self.resolve(column).await?);
        let mut sql = format!(
            "SELECT CAST({column} AS TEXT) FROM {}",
            quote_ident(&self.table)
        );
        if order == ReadOrder::Ascending {
            sql.push_str(&format!(" ORDER BY {column}"));
        }

        let values: Vec<Option<String>> = sqlx::query_scalar(&sql).fetch_all(&self.pool).await?;
        Ok(values)
    }

    async fn add_column(&self, spec: &ColumnSpec) -> Result<(), SourceError> {
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            quote_ident(&self.table),
            quote_ident(&spec.name),
            sql_type(spec)
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        if let Some(alias) = &spec.alias {
            // SQLite has no column aliases.
            debug!(table = %self.table, column = %spec.name, alias = %alias, "column alias not stored");
        }
        Ok(())
    }

    async fn update_rows(
        &self,
        key_column: &str,
        key: &Key,
        assignments: &[Assignment],
    ) -> Result<u64, SourceError> {
        if assignments.is_empty() {
            return Ok(0);
        }

        let key_column = self.resolve(key_column).await?;
        let mut targets = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            targets.push(self.resolve(&assignment.column).await?);
        }

        let rowids = self.rowids_for(&key_column, key).await?;
        if rowids.is_empty() {
            return Ok(0);
        }

        let sets = targets
            .iter()
            .map(|column| format!("{} = ?", quote_ident(column)))
            .collect::<Vec<_>>()
            .join(", ");
        let mut updated = 0u64;
        for ids in rowids.chunks(ROWIDS_PER_UPDATE) {
            let sql = format!(
                "UPDATE {} SET {sets} WHERE rowid IN ({})",
                quote_ident(&self.table),
                vec!["?"; ids.len()].join(", ")
            );
            let mut query = sqlx::query(&sql);
            for assignment in assignments {
                query = query.bind(assignment.value.clone());
            }
            for id in ids {
                query = query.bind(*id);
            }
            updated += query.execute(&self.pool).await?.rows_affected();
        }

        if targets.contains(&key_column) {
            self.index.lock().await.take();
        }
        Ok(updated)
    }
}
