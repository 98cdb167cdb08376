//! Enrichment runs: environment configuration, task profiles, the run state machine,
//! progress messages and on-disk run reports.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sdafill_core::{
    chunk, format_count, reconcile, AttributeRow, AttributeTable, ColumnHint, ColumnSpec,
    ConfigError, Key, Reconciliation, TypeMap,
};
use sdafill_sda::{
    ArchivedBatch, BatchResponse, FetchError, HttpClientConfig, ResponseArchive, ResponseTable,
    RetryPolicy, SdaClient, SDA_POST_URL,
};
use sdafill_source::{
    extract_keys, find_column, ApplyStats, AttributeWriter, EnsuredColumns, SourceError,
    TableSource,
};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, warn};
use uuid::Uuid;

mod tasks;

pub use tasks::{
    ColumnConfig, KeyKindConfig, PlannedColumn, TaskConfig, TaskPlan, TaskRegistry,
    BUILTIN_TASKS_YAML,
};

pub const CRATE_NAME: &str = "sdafill-pipeline";

#[derive(Debug, Clone)]
pub struct EnrichConfig {
    pub sda_url: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub max_attempts: usize,
    pub tasks_file: Option<PathBuf>,
    pub reports_dir: PathBuf,
    pub artifacts_dir: Option<PathBuf>,
}

impl EnrichConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let path = |name: &str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
        };
        Self {
            sda_url: lookup("SDA_URL").unwrap_or_else(|| SDA_POST_URL.to_string()),
            http_timeout_secs: lookup("SDAFILL_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            user_agent: lookup("SDAFILL_USER_AGENT")
                .unwrap_or_else(|| format!("sdafill/{}", env!("CARGO_PKG_VERSION"))),
            max_attempts: lookup("SDAFILL_MAX_ATTEMPTS")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(3),
            tasks_file: path("SDAFILL_TASKS_FILE"),
            reports_dir: path("SDAFILL_REPORTS_DIR").unwrap_or_else(|| PathBuf::from("./reports")),
            artifacts_dir: path("SDAFILL_ARTIFACTS_DIR"),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            endpoint: self.sda_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                ..Default::default()
            },
        }
    }

    /// The YAML registry named by `SDAFILL_TASKS_FILE`, or the bundled one.
    pub fn load_registry(&self) -> Result<TaskRegistry> {
        match &self.tasks_file {
            Some(path) => TaskRegistry::load(path),
            None => TaskRegistry::builtin(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Receives one message after each run phase. Must not block.
pub trait ProgressSink: Send + Sync {
    fn message(&self, severity: Severity, text: &str);
}

#[derive(Debug, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn message(&self, severity: Severity, text: &str) {
        match severity {
            Severity::Info => info!("{text}"),
            Severity::Warning => warn!("{text}"),
            Severity::Error => error!("{text}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Extracting,
    Batching,
    Fetching { index: usize, total: usize },
    Reconciling,
    Writing,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => f.write_str("idle"),
            RunState::Extracting => f.write_str("extracting"),
            RunState::Batching => f.write_str("batching"),
            RunState::Fetching { index, total } => write!(f, "fetching ({index}/{total})"),
            RunState::Reconciling => f.write_str("reconciling"),
            RunState::Writing => f.write_str("writing"),
            RunState::Done => f.write_str("done"),
            RunState::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub state: RunState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Fetched,
    /// Answered without a `Table`.
    Empty,
    /// Answered, but the header lacks the key or a requested column.
    Unusable,
    /// No usable answer within the attempt budget.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub index: usize,
    pub keys: usize,
    pub status: BatchStatus,
    pub attempts: usize,
    pub rows: usize,
    pub archived: Option<ArchivedBatch>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedBatch {
    pub index: usize,
    pub keys: Vec<Key>,
    pub attempts: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub task_id: String,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: RunState,
    pub transitions: Vec<StateTransition>,
    pub key_column: Option<String>,
    pub rows_scanned: usize,
    pub unique_keys: usize,
    pub blank_values: usize,
    pub rejected_values: Vec<String>,
    pub batches: Vec<BatchOutcome>,
    pub failed_batches: Vec<FailedBatch>,
    /// Response key cells that did not parse as keys.
    pub unparsed_response_keys: Vec<String>,
    pub attributes_returned: usize,
    pub reconciliation: Option<Reconciliation>,
    pub columns: Option<EnsuredColumns>,
    pub apply: Option<ApplyStats>,
    pub error: Option<String>,
}

impl RunReport {
    fn new(task_id: &str, source: &str) -> Self {
        let started_at = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            task_id: task_id.to_string(),
            source: source.to_string(),
            started_at,
            finished_at: None,
            state: RunState::Idle,
            transitions: vec![StateTransition {
                state: RunState::Idle,
                at: started_at,
            }],
            key_column: None,
            rows_scanned: 0,
            unique_keys: 0,
            blank_values: 0,
            rejected_values: Vec::new(),
            batches: Vec::new(),
            failed_batches: Vec::new(),
            unparsed_response_keys: Vec::new(),
            attributes_returned: 0,
            reconciliation: None,
            columns: None,
            apply: None,
            error: None,
        }
    }

    fn transition(&mut self, state: RunState) {
        info!(run_id = %self.run_id, task = %self.task_id, %state, "run state");
        self.state = state;
        self.transitions.push(StateTransition {
            state,
            at: Utc::now(),
        });
    }

    fn finish(&mut self, state: RunState) {
        self.transition(state);
        self.finished_at = self.transitions.last().map(|t| t.at);
    }

    pub fn is_success(&self) -> bool {
        self.state == RunState::Done
    }

    /// Keys of fetched batches that came back without attributes.
    pub fn missing_keys(&self) -> Vec<&Key> {
        self.reconciliation
            .as_ref()
            .map(|r| r.missing.iter().collect())
            .unwrap_or_default()
    }

    pub fn failed_keys(&self) -> impl Iterator<Item = &Key> {
        self.failed_batches.iter().flat_map(|b| b.keys.iter())
    }

    pub fn summary_markdown(&self) -> String {
        let label = self.key_column.as_deref().unwrap_or("key");
        let count = |status: BatchStatus| self.batches.iter().filter(|b| b.status == status).count();
        let finished = self
            .finished_at
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());

        let mut lines = vec![
            format!("# sdafill run `{}`", self.run_id),
            String::new(),
            format!("- Task: `{}`", self.task_id),
            format!("- Source: {}", self.source),
            format!("- State: {}", self.state),
            format!("- Started: {}", self.started_at),
            format!("- Finished: {finished}"),
            format!("- Key column: {label}"),
            format!(
                "- Rows scanned: {} ({} unique keys, {} blank, {} rejected)",
                format_count(self.rows_scanned),
                format_count(self.unique_keys),
                format_count(self.blank_values),
                format_count(self.rejected_values.len())
            ),
            format!(
                "- Batches: {} fetched, {} empty, {} unusable, {} failed",
                count(BatchStatus::Fetched),
                count(BatchStatus::Empty),
                count(BatchStatus::Unusable),
                count(BatchStatus::Failed)
            ),
            format!(
                "- Attribute rows returned: {}",
                format_count(self.attributes_returned)
            ),
        ];
        if let Some(apply) = &self.apply {
            lines.push(format!(
                "- Rows updated: {} of {} expected ({} keys not written)",
                format_count(apply.rows_updated as usize),
                format_count(apply.rows_expected as usize),
                apply.failed_keys.len()
            ));
        }
        if let Some(columns) = &self.columns {
            lines.push(format!(
                "- Columns: created [{}], reused [{}]",
                columns.created.join(", "),
                columns.reused.join(", ")
            ));
        }
        if let Some(error) = &self.error {
            lines.push(format!("- Error: {error}"));
        }

        if let Some(reconciliation) = &self.reconciliation {
            lines.push(String::new());
            lines.push("## Reconciliation".to_string());
            lines.push(reconciliation.report(label));
        }

        if !self.failed_batches.is_empty() {
            lines.push(String::new());
            lines.push("## Failed Batches".to_string());
            for batch in &self.failed_batches {
                lines.push(format!(
                    "- batch {} ({} keys, {} attempts): {}",
                    batch.index,
                    batch.keys.len(),
                    batch.attempts,
                    batch.reason
                ));
            }
        }

        lines.push(String::new());
        lines.push("## State Transitions".to_string());
        for transition in &self.transitions {
            lines.push(format!("- {} at {}", transition.state, transition.at));
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Source(#[from] SourceError),
    /// A header lacked the key or a requested column. Recorded against its batch.
    #[error("unusable response for batch {batch}: {reason}")]
    Response { batch: usize, reason: String },
    #[error("{failed} of {total} batches failed")]
    BatchesFailed { failed: usize, total: usize },
}

/// A run that ended `Failed`, with everything recorded up to that point.
#[derive(Debug, Error)]
#[error("task `{}` failed", .report.task_id)]
pub struct RunFailure {
    #[source]
    pub error: EnrichError,
    pub report: Box<RunReport>,
}

fn header_index(header: &[String], wanted: &str) -> Option<usize> {
    let found = find_column(header, wanted)?;
    header.iter().position(|name| *name == found)
}

/// Merges batch responses into one attribute table keyed by canonical keys.
struct Collector<'a> {
    plan: &'a TaskPlan,
    /// Response column names, in attribute order.
    sources: Vec<String>,
    hints: Vec<Option<ColumnHint>>,
    table: Option<AttributeTable>,
    unparsed: Vec<String>,
}

impl<'a> Collector<'a> {
    fn new(plan: &'a TaskPlan) -> Self {
        let sources: Vec<String> = plan.columns.iter().map(|c| c.source.clone()).collect();
        Self {
            plan,
            hints: vec![None; sources.len()],
            sources,
            table: None,
            unparsed: Vec::new(),
        }
    }

    /// Add one response; returns the number of rows taken from it.
    fn absorb(&mut self, batch: usize, response: &ResponseTable) -> Result<usize, EnrichError> {
        let unusable = |reason: String| EnrichError::Response { batch, reason };

        let (key_index, value_indexes) = match &response.columns {
            Some(header) => {
                let key_index = header_index(header, &self.plan.response_key_column)
                    .ok_or_else(|| {
                        unusable(format!(
                            "no `{}` column in [{}]",
                            self.plan.response_key_column,
                            header.join(", ")
                        ))
                    })?;
                if self.plan.auto_columns() && self.table.is_none() {
                    self.sources = header
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| *i != key_index)
                        .map(|(_, name)| name.clone())
                        .collect();
                    self.hints = vec![None; self.sources.len()];
                }
                let mut indexes = Vec::with_capacity(self.sources.len());
                for source in &self.sources {
                    let index = header_index(header, source)
                        .ok_or_else(|| unusable(format!("no `{source}` column in response")))?;
                    indexes.push(index);
                }
                (key_index, indexes)
            }
            // Plain JSON rows: key first, then the declared columns in order.
            None => (0, (1..=self.sources.len()).collect()),
        };

        if let Some(hints) = &response.hints {
            for (slot, index) in self.hints.iter_mut().zip(&value_indexes) {
                if slot.is_none() {
                    *slot = hints.get(*index).cloned();
                }
            }
        }

        let sources = &self.sources;
        let table = self
            .table
            .get_or_insert_with(|| AttributeTable::new(sources.clone()));
        let mut absorbed = 0usize;
        for row in &response.rows {
            let raw = row.get(key_index).cloned().flatten().unwrap_or_default();
            match self.plan.key_kind.parse(&raw) {
                Ok(key) => {
                    let values = value_indexes
                        .iter()
                        .map(|index| row.get(*index).cloned().flatten())
                        .collect();
                    table.insert(key, AttributeRow::new(values));
                    absorbed += 1;
                }
                Err(err) => {
                    warn!(batch, value = %raw, error = %err, "response row has no usable key");
                    self.unparsed.push(raw);
                }
            }
        }
        Ok(absorbed)
    }

    fn take_table(&mut self) -> AttributeTable {
        self.table
            .take()
            .unwrap_or_else(|| AttributeTable::new(self.sources.clone()))
    }

    /// Destination columns, typed from the task or from the response metadata.
    fn column_specs(&self) -> Result<Vec<ColumnSpec>, ConfigError> {
        let type_map = &self.plan.type_map;
        if self.plan.auto_columns() {
            return self
                .sources
                .iter()
                .zip(&self.hints)
                .map(|(source, hint)| match hint {
                    Some(hint) => type_map.column_spec(source, hint),
                    None => Ok(ColumnSpec::text(source.clone(), 255)),
                })
                .collect();
        }

        self.plan
            .columns
            .iter()
            .zip(&self.hints)
            .map(|(planned, hint)| match (&planned.spec, hint) {
                (Some(spec), _) => Ok(spec.clone()),
                (None, Some(hint)) => {
                    let mut spec = type_map.column_spec(&planned.target, hint)?;
                    spec.alias = planned.alias.clone();
                    Ok(spec)
                }
                (None, None) => Ok(ColumnSpec {
                    alias: planned.alias.clone(),
                    ..ColumnSpec::text(planned.target.clone(), 255)
                }),
            })
            .collect()
    }
}

/// Runs task profiles against table sources.
pub struct Enricher {
    client: SdaClient,
    type_map: TypeMap,
    progress: Box<dyn ProgressSink>,
    archive: Option<ResponseArchive>,
}

impl Enricher {
    pub fn new(client: SdaClient) -> Self {
        Self {
            client,
            type_map: TypeMap::default(),
            progress: Box::<TracingProgress>::default(),
            archive: None,
        }
    }

    pub fn from_config(config: &EnrichConfig) -> Result<Self> {
        let client = SdaClient::new(&config.http_client_config())?;
        let mut enricher = Self::new(client);
        if let Some(dir) = &config.artifacts_dir {
            enricher = enricher.with_archive(ResponseArchive::new(dir.clone()));
        }
        Ok(enricher)
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_type_map(mut self, type_map: TypeMap) -> Self {
        self.type_map = type_map;
        self
    }

    pub fn with_archive(mut self, archive: ResponseArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Run one task end to end. Rows written before a failure stay written.
    pub async fn run(
        &self,
        task: &TaskConfig,
        source: &dyn TableSource,
    ) -> Result<RunReport, RunFailure> {
        let mut report = RunReport::new(&task.task_id, source.name());
        match self.execute(task, source, &mut report).await {
            Ok(()) => {
                report.finish(RunState::Done);
                self.progress.message(
                    Severity::Info,
                    &format!("Finished {} for {}", task.task_id, source.name()),
                );
                Ok(report)
            }
            Err(error) => {
                report.error = Some(error.to_string());
                report.finish(RunState::Failed);
                self.progress.message(
                    Severity::Error,
                    &format!("{} failed for {}: {error}", task.task_id, source.name()),
                );
                Err(RunFailure {
                    error,
                    report: Box::new(report),
                })
            }
        }
    }

    async fn execute(
        &self,
        task: &TaskConfig,
        source: &dyn TableSource,
        report: &mut RunReport,
    ) -> Result<(), EnrichError> {
        let plan = task.validate(&self.type_map)?;

        report.transition(RunState::Extracting);
        let extraction = extract_keys(source, &task.key_column, plan.key_kind).await?;
        let label = extraction.column.clone();
        report.key_column = Some(label.clone());
        report.rows_scanned = extraction.rows_scanned;
        report.unique_keys = extraction.keys.len();
        report.blank_values = extraction.blank_values;
        report.rejected_values = extraction.rejected.iter().map(|(raw, _)| raw.clone()).collect();
        self.progress.message(
            Severity::Info,
            &format!(
                "Found {} unique {label} values in {} rows of {}",
                format_count(extraction.keys.len()),
                format_count(extraction.rows_scanned),
                source.name()
            ),
        );
        if !extraction.rejected.is_empty() {
            self.progress.message(
                Severity::Warning,
                &format!(
                    "Skipped {} invalid {label} values",
                    format_count(extraction.rejected.len())
                ),
            );
        }

        report.transition(RunState::Batching);
        let batches = chunk(&extraction.keys, task.max_batch_size)?;
        let total = batches.len();
        self.progress.message(
            Severity::Info,
            &format!(
                "Requesting attributes in {} batches of up to {} keys",
                format_count(total),
                format_count(task.max_batch_size)
            ),
        );

        let mut collector = Collector::new(&plan);
        let mut answered: Vec<&Key> = Vec::with_capacity(extraction.keys.len());
        for batch in &batches {
            report.transition(RunState::Fetching {
                index: batch.index,
                total,
            });
            let (status, attempts, archived, reason) = match self.client.fetch(batch, &plan.template).await {
                Ok(response) => {
                    let archived = self.archive_response(report, batch.index, &response).await;
                    match collector.absorb(batch.index, &response.table) {
                        Ok(rows) => {
                            answered.extend(&batch.keys);
                            report.batches.push(BatchOutcome {
                                index: batch.index,
                                keys: batch.len(),
                                status: BatchStatus::Fetched,
                                attempts: response.attempts,
                                rows,
                                archived,
                            });
                            self.progress.message(
                                Severity::Info,
                                &format!(
                                    "Fetched batch {} of {total}: {} rows for {} keys",
                                    batch.index,
                                    format_count(rows),
                                    format_count(batch.len())
                                ),
                            );
                            continue;
                        }
                        Err(err) => (
                            BatchStatus::Unusable,
                            response.attempts,
                            archived,
                            err.to_string(),
                        ),
                    }
                }
                Err(err @ FetchError::EmptyResponse { .. }) => {
                    (BatchStatus::Empty, err.attempts(), None, err.to_string())
                }
                Err(err) => (BatchStatus::Failed, err.attempts(), None, err.to_string()),
            };

            report.batches.push(BatchOutcome {
                index: batch.index,
                keys: batch.len(),
                status,
                attempts,
                rows: 0,
                archived,
            });
            report.failed_batches.push(FailedBatch {
                index: batch.index,
                keys: batch.keys.clone(),
                attempts,
                reason: reason.clone(),
            });
            self.progress.message(
                Severity::Error,
                &format!("Batch {} of {total} failed: {reason}", batch.index),
            );
        }

        let table = collector.take_table();
        report.attributes_returned = table.len();
        report.unparsed_response_keys = collector.unparsed.clone();

        report.transition(RunState::Reconciling);
        let reconciliation = reconcile(answered, &table);
        let severity = if reconciliation.is_complete() && reconciliation.unexpected.is_empty() {
            Severity::Info
        } else {
            Severity::Warning
        };
        self.progress.message(severity, &reconciliation.report(&label));
        report.reconciliation = Some(reconciliation);

        report.transition(RunState::Writing);
        if table.is_empty() {
            self.progress
                .message(Severity::Warning, "No attribute values returned; nothing to write");
        } else {
            let specs = collector.column_specs()?;
            let writer = AttributeWriter::new(source);
            let ensured = writer.ensure_columns(&specs).await?;
            if !ensured.created.is_empty() {
                self.progress.message(
                    Severity::Info,
                    &format!("Added columns {}", ensured.created.join(", ")),
                );
            }
            report.columns = Some(ensured.clone());

            let stats = writer
                .apply(&extraction.column, &table, &ensured.resolved_names, &extraction.keys)
                .await;
            self.progress.message(
                Severity::Info,
                &format!(
                    "Updated {} rows for {} {label} values",
                    format_count(stats.rows_updated as usize),
                    format_count(stats.keys_applied)
                ),
            );
            if !stats.failed_keys.is_empty() {
                self.progress.message(
                    Severity::Warning,
                    &format!(
                        "Rows for {} {label} values were not updated",
                        format_count(stats.failed_keys.len())
                    ),
                );
            }
            report.apply = Some(stats);
        }

        if !report.failed_batches.is_empty() {
            return Err(EnrichError::BatchesFailed {
                failed: report.failed_batches.len(),
                total,
            });
        }
        Ok(())
    }

    async fn archive_response(
        &self,
        report: &RunReport,
        batch: usize,
        response: &BatchResponse,
    ) -> Option<ArchivedBatch> {
        let archive = self.archive.as_ref()?;
        let run_id = report.run_id.to_string();
        match archive
            .store(&report.task_id, &run_id, batch, &response.request, &response.body)
            .await
        {
            Ok(stored) => Some(stored),
            Err(err) => {
                warn!(task = %report.task_id, batch, error = %format!("{err:#}"), "could not archive SDA exchange");
                None
            }
        }
    }
}

/// Write `run_summary.md` and `run_report.json` under `<reports_root>/<run_id>/`.
pub async fn write_reports(reports_root: &Path, report: &RunReport) -> Result<PathBuf> {
    let reports_dir = reports_root.join(report.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    fs::write(reports_dir.join("run_summary.md"), report.summary_markdown())
        .await
        .context("writing run_summary.md")?;

    let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(reports_dir.join("run_report.json"), json)
        .await
        .context("writing run_report.json")?;

    Ok(reports_dir)
}

/// Markdown digest of the most recent `runs` reports under `reports_root`.
pub async fn report_runs_markdown(reports_root: &Path, runs: usize) -> Result<String> {
    let mut entries = fs::read_dir(reports_root)
        .await
        .with_context(|| format!("reading {}", reports_root.display()))?;
    let mut dirs = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("listing {}", reports_root.display()))?
    {
        let report_path = entry.path().join("run_report.json");
        if let Ok(metadata) = fs::metadata(&report_path).await {
            if metadata.is_file() {
                dirs.push((metadata.modified().ok(), entry.file_name(), report_path));
            }
        }
    }
    dirs.sort_by(|a, b| b.0.cmp(&a.0));

    let mut lines = vec!["# sdafill runs".to_string(), String::new()];
    for (_, run_dir, report_path) in dirs.into_iter().take(runs.max(1)) {
        let raw = fs::read_to_string(&report_path)
            .await
            .with_context(|| format!("reading {}", report_path.display()))?;
        let report: serde_json::Value = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", report_path.display()))?;

        let text = |name: &str| {
            report
                .get(name)
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string()
        };
        let state = report
            .get("state")
            .and_then(|v| v.get("state"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let failed = report
            .get("failed_batches")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);
        let missing = report
            .get("reconciliation")
            .and_then(|v| v.get("missing"))
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);
        let rows_updated = report
            .get("apply")
            .and_then(|v| v.get("rows_updated"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        lines.push(format!("## Run `{}`", run_dir.to_string_lossy()));
        lines.push(format!("- task: `{}` on {}", text("task_id"), text("source")));
        lines.push(format!("- state: {state}"));
        lines.push(format!("- started: {}", text("started_at")));
        lines.push(format!("- rows updated: {rows_updated}"));
        lines.push(format!("- missing keys: {missing}"));
        lines.push(format!("- failed batches: {failed}"));
        lines.push(format!("- report: `{}`", report_path.display()));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
