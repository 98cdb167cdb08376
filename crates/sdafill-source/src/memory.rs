use async_trait::async_trait;
use sdafill_core::{ColumnSpec, FieldType, Key};
use tokio::sync::Mutex;

use crate::{find_column, Assignment, ReadOrder, SourceError, TableSource};

#[derive(Debug, Default)]
struct MemoryState {
    columns: Vec<ColumnSpec>,
    rows: Vec<Vec<Option<String>>>,
}

/// In-process table. Rows are plain text cells; `None` is NULL.
#[derive(Debug)]
pub struct MemoryTable {
    name: String,
    state: Mutex<MemoryState>,
}

impl MemoryTable {
    /// A table whose initial columns are all text.
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self::with_columns(
            name,
            columns
                .iter()
                .map(|c| ColumnSpec::new(*c, FieldType::Text))
                .collect(),
        )
    }

    pub fn with_columns(name: impl Into<String>, columns: Vec<ColumnSpec>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemoryState {
                columns,
                rows: Vec::new(),
            }),
        }
    }

    /// Append a row; short rows are padded with NULLs.
    pub fn with_row(mut self, values: &[Option<&str>]) -> Self {
        let state = self.state.get_mut();
        let mut row: Vec<Option<String>> = values.iter().map(|v| v.map(str::to_string)).collect();
        row.resize(state.columns.len(), None);
        state.rows.push(row);
        self
    }

    pub async fn column_specs(&self) -> Vec<ColumnSpec> {
        self.state.lock().await.columns.clone()
    }

    pub async fn column_values(&self, column: &str) -> Option<Vec<Option<String>>> {
        let state = self.state.lock().await;
        let index = column_index(&state.columns, column)?;
        Some(state.rows.iter().map(|row| row[index].clone()).collect())
    }
}

fn column_index(columns: &[ColumnSpec], wanted: &str) -> Option<usize> {
    let names = columns.iter().map(|c| c.name.clone()).collect::<Vec<_>>();
    let found = find_column(&names, wanted)?;
    names.iter().position(|n| *n == found)
}

impl MemoryTable {
    fn missing(&self, column: &str) -> SourceError {
        SourceError::MissingColumn {
            table: self.name.clone(),
            column: column.to_string(),
        }
    }
}

#[async_trait]
impl TableSource for MemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn columns(&self) -> Result<Vec<String>, SourceError> {
        let state = self.state.lock().await;
        Ok(state.columns.iter().map(|c| c.name.clone()).collect())
    }

    async fn row_count(&self) -> Result<usize, SourceError> {
        Ok(self.state.lock().await.rows.len())
    }

    async fn read_column(
        &self,
        column: &str,
        order: ReadOrder,
    ) -> Result<Vec<Option<String>>, SourceError> {
        let state = self.state.lock().await;
        let index = column_index(&state.columns, column).ok_or_else(|| self.missing(column))?;
        let mut values: Vec<Option<String>> =
            state.rows.iter().map(|row| row[index].clone()).collect();
        if order == ReadOrder::Ascending {
            values.sort();
        }
        Ok(values)
    }

    async fn add_column(&self, spec: &ColumnSpec) -> Result<(), SourceError> {
        let mut state = self.state.lock().await;
        if column_index(&state.columns, &spec.name).is_some() {
            return Err(SourceError::Message(format!(
                "column `{}` already exists in {}",
                spec.name, self.name
            )));
        }
        state.columns.push(spec.clone());
        for row in &mut state.rows {
            row.push(None);
        }
        Ok(())
    }

    async fn update_rows(
        &self,
        key_column: &str,
        key: &Key,
        assignments: &[Assignment],
    ) -> Result<u64, SourceError> {
        let mut state = self.state.lock().await;
        let key_index =
            column_index(&state.columns, key_column).ok_or_else(|| self.missing(key_column))?;
        let targets = assignments
            .iter()
            .map(|a| {
                column_index(&state.columns, &a.column)
                    .map(|index| (index, a.value.clone()))
                    .ok_or_else(|| self.missing(&a.column))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut updated = 0u64;
        for row in &mut state.rows {
            let matches = row[key_index]
                .as_deref()
                .is_some_and(|raw| key.matches_raw(raw));
            if !matches {
                continue;
            }
            for (index, value) in &targets {
                row[*index] = value.clone();
            }
            updated += 1;
        }
        Ok(updated)
    }
}
