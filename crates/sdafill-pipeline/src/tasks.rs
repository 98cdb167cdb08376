use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use sdafill_core::{ColumnSpec, ConfigError, FieldType, KeyKind, TypeMap};
use sdafill_sda::{QueryTemplate, ResponseFormat};
use serde::{Deserialize, Serialize};

pub const BUILTIN_TASKS_YAML: &str = include_str!("../tasks.yaml");

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskRegistry {
    pub tasks: Vec<TaskConfig>,
}

impl TaskRegistry {
    pub fn builtin() -> Result<Self> {
        Self::from_yaml_str(BUILTIN_TASKS_YAML).context("parsing bundled tasks.yaml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&yaml).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let registry: TaskRegistry = serde_yaml::from_str(yaml)?;
        let mut seen = BTreeSet::new();
        for task in &registry.tasks {
            if !seen.insert(task.task_id.as_str()) {
                anyhow::bail!("duplicate task_id `{}`", task.task_id);
            }
        }
        Ok(registry)
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskConfig> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn validate_all(&self, base: &TypeMap) -> Result<(), ConfigError> {
        for task in &self.tasks {
            task.validate(base)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKindConfig {
    Integer,
    Code,
}

fn default_key_kind() -> KeyKindConfig {
    KeyKindConfig::Integer
}

/// One enrichment profile: which key to read, what to ask SDA, and where the answers go.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskConfig {
    pub task_id: String,
    pub display_name: String,
    pub key_column: String,
    #[serde(default = "default_key_kind")]
    pub key_kind: KeyKindConfig,
    #[serde(default)]
    pub key_width: Option<usize>,
    /// Key column name in the response header; defaults to `key_column`.
    #[serde(default)]
    pub response_key_column: Option<String>,
    pub max_batch_size: usize,
    pub format: ResponseFormat,
    pub query: String,
    #[serde(default)]
    pub columns: Vec<ColumnConfig>,
    /// Extra or replacement source type mappings.
    #[serde(default)]
    pub type_map: BTreeMap<String, FieldType>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ColumnConfig {
    pub source: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub field_type: Option<FieldType>,
    #[serde(default)]
    pub source_type: Option<String>,
    #[serde(default)]
    pub length: Option<u32>,
    #[serde(default)]
    pub precision: Option<u32>,
    #[serde(default)]
    pub scale: Option<u32>,
    #[serde(default)]
    pub alias: Option<String>,
}

impl ColumnConfig {
    pub fn target(&self) -> &str {
        self.target.as_deref().unwrap_or(&self.source)
    }
}

/// A destination column to fill. `spec` is `None` until a metadata hint types it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedColumn {
    pub source: String,
    pub target: String,
    pub spec: Option<ColumnSpec>,
    pub alias: Option<String>,
}

/// A validated task, ready to run.
#[derive(Debug, Clone)]
pub struct TaskPlan {
    pub template: QueryTemplate,
    pub key_kind: KeyKind,
    pub response_key_column: String,
    pub type_map: TypeMap,
    /// Empty when every returned column is taken from the response.
    pub columns: Vec<PlannedColumn>,
}

impl TaskPlan {
    pub fn auto_columns(&self) -> bool {
        self.columns.is_empty()
    }
}

impl TaskConfig {
    pub fn key_kind(&self) -> KeyKind {
        match self.key_kind {
            KeyKindConfig::Integer => KeyKind::Integer,
            KeyKindConfig::Code => KeyKind::Code {
                width: self.key_width,
            },
        }
    }

    pub fn response_key_column(&self) -> &str {
        self.response_key_column
            .as_deref()
            .unwrap_or(&self.key_column)
    }

    fn invalid(&self, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidTask {
            task_id: self.task_id.clone(),
            reason: reason.into(),
        }
    }

    /// Check the task and resolve every declared column type.
    pub fn validate(&self, base: &TypeMap) -> Result<TaskPlan, ConfigError> {
        if self.task_id.trim().is_empty() {
            return Err(self.invalid("task_id is blank"));
        }
        if self.key_column.trim().is_empty() {
            return Err(self.invalid("key_column is blank"));
        }
        if self.key_kind == KeyKindConfig::Integer && self.key_width.is_some() {
            return Err(self.invalid("key_width applies to code keys only"));
        }
        if self.key_width == Some(0) {
            return Err(self.invalid("key_width must be greater than zero"));
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize(self.max_batch_size));
        }
        let template = QueryTemplate::new(self.query.clone(), self.format)?;

        if self.columns.is_empty() && !self.format.has_column_names() {
            return Err(self.invalid(
                "columns must be declared when the response format carries no column names",
            ));
        }

        let mut type_map = base.clone();
        for (source_type, field_type) in &self.type_map {
            type_map.insert(source_type, *field_type);
        }

        let mut targets = BTreeSet::new();
        let mut columns = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let target = column.target().trim().to_string();
            if column.source.trim().is_empty() || target.is_empty() {
                return Err(self.invalid("column source and target must not be blank"));
            }
            if !targets.insert(target.to_ascii_lowercase()) {
                return Err(self.invalid(format!("target column `{target}` is declared twice")));
            }

            let field_type = match (&column.field_type, &column.source_type) {
                (Some(_), Some(_)) => {
                    return Err(self.invalid(format!(
                        "column `{}` sets both field_type and source_type",
                        column.source
                    )))
                }
                (Some(field_type), None) => Some(*field_type),
                (None, Some(source_type)) => Some(type_map.resolve(&column.source, source_type)?),
                (None, None) if self.format.has_metadata() => None,
                (None, None) => {
                    return Err(self.invalid(format!(
                        "column `{}` needs a field_type or source_type without response metadata",
                        column.source
                    )))
                }
            };

            let spec = field_type.map(|field_type| ColumnSpec {
                name: target.clone(),
                field_type,
                length: column.length.or(match field_type {
                    FieldType::Text => Some(255),
                    _ => None,
                }),
                precision: column.precision,
                scale: column.scale,
                alias: column.alias.clone(),
            });
            columns.push(PlannedColumn {
                source: column.source.trim().to_string(),
                target,
                spec,
                alias: column.alias.clone(),
            });
        }

        Ok(TaskPlan {
            template,
            key_kind: self.key_kind(),
            response_key_column: self.response_key_column().trim().to_string(),
            type_map,
            columns,
        })
    }
}
