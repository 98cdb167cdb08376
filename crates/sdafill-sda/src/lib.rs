//! Soil Data Access client: query rendering, HTTP transport with retry, response parsing
//! and a per-run archive of request/response pairs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
pub use reqwest::StatusCode;
use sdafill_core::{Batch, ColumnHint, ConfigError, Key};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{info_span, warn, Instrument};

pub const CRATE_NAME: &str = "sdafill-sda";

pub const SDA_POST_URL: &str =
    "https://sdmdataaccess.nrcs.usda.gov/Tabular/SDMTabularService/post.rest";

pub const KEYS_PLACEHOLDER: &str = "{keys}";

/// Response shape requested through the `FORMAT` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseFormat {
    #[serde(rename = "JSON")]
    Json,
    #[serde(rename = "JSON+COLUMNNAME")]
    JsonColumnName,
    #[serde(rename = "JSON+COLUMNNAME+METADATA")]
    JsonColumnNameMetadata,
}

impl ResponseFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseFormat::Json => "JSON",
            ResponseFormat::JsonColumnName => "JSON+COLUMNNAME",
            ResponseFormat::JsonColumnNameMetadata => "JSON+COLUMNNAME+METADATA",
        }
    }

    pub fn has_column_names(&self) -> bool {
        !matches!(self, ResponseFormat::Json)
    }

    pub fn has_metadata(&self) -> bool {
        matches!(self, ResponseFormat::JsonColumnNameMetadata)
    }
}

/// Request body accepted by the SDA post.rest endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SdaRequest {
    #[serde(rename = "FORMAT")]
    pub format: ResponseFormat,
    #[serde(rename = "QUERY")]
    pub query: String,
}

/// SQL text with a single `{keys}` placeholder for the batch's `IN (...)` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTemplate {
    sql: String,
    format: ResponseFormat,
}

impl QueryTemplate {
    pub fn new(sql: impl Into<String>, format: ResponseFormat) -> Result<Self, ConfigError> {
        let sql = sql.into();
        let placeholders = sql.matches(KEYS_PLACEHOLDER).count();
        if placeholders != 1 {
            return Err(ConfigError::InvalidTemplate(format!(
                "expected exactly one {KEYS_PLACEHOLDER} placeholder, found {placeholders}"
            )));
        }
        Ok(Self { sql, format })
    }

    pub fn format(&self) -> ResponseFormat {
        self.format
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Keys are canonical (digits or alphanumerics), so they are interpolated verbatim.
    pub fn render(&self, batch: &Batch) -> String {
        let list = batch
            .keys
            .iter()
            .map(Key::as_query_literal)
            .collect::<Vec<_>>()
            .join(",");
        self.sql.replace(KEYS_PLACEHOLDER, &list)
    }

    pub fn request(&self, batch: &Batch) -> SdaRequest {
        SdaRequest {
            format: self.format,
            query: self.render(batch),
        }
    }
}

/// Parsed `Table` payload. `columns` and `hints` are present only when the format asks for them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponseTable {
    pub columns: Option<Vec<String>>,
    pub hints: Option<Vec<ColumnHint>>,
    pub rows: Vec<Vec<Option<String>>>,
}

#[derive(Debug, Deserialize)]
struct SdaEnvelope {
    #[serde(rename = "Table")]
    table: Option<Vec<Vec<JsonValue>>>,
}

fn cell_text(value: JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(text) => Some(text),
        JsonValue::Number(number) => Some(number.to_string()),
        JsonValue::Bool(flag) => Some(flag.to_string()),
        other => Some(other.to_string()),
    }
}

/// Parse a response body. `Ok(None)` means the service answered without a `Table`
/// (no rows matched).
pub fn parse_response_body(
    body: &[u8],
    format: ResponseFormat,
) -> Result<Option<ResponseTable>, String> {
    let envelope: SdaEnvelope = serde_json::from_slice(body).map_err(|e| e.to_string())?;
    let Some(table) = envelope.table else {
        return Ok(None);
    };

    let mut rows = table
        .into_iter()
        .map(|row| row.into_iter().map(cell_text).collect::<Vec<_>>());

    let columns = if format.has_column_names() {
        let header = rows.next().ok_or("missing column name row")?;
        Some(
            header
                .into_iter()
                .map(|name| name.unwrap_or_default())
                .collect::<Vec<_>>(),
        )
    } else {
        None
    };
    let hints = if format.has_metadata() {
        let metadata = rows.next().ok_or("missing column metadata row")?;
        Some(
            metadata
                .iter()
                .map(|cell| parse_column_metadata(cell.as_deref().unwrap_or_default()))
                .collect::<Vec<_>>(),
        )
    } else {
        None
    };

    Ok(Some(ResponseTable {
        columns,
        hints,
        rows: rows.collect(),
    }))
}

/// Parse one metadata cell such as
/// `ColumnOrdinal=0,ColumnSize=4,NumericPrecision=10,NumericScale=255,ProviderType=Int,...`.
pub fn parse_column_metadata(text: &str) -> ColumnHint {
    let fields: HashMap<&str, &str> = text
        .split(',')
        .filter_map(|part| part.split_once('='))
        .map(|(name, value)| (name.trim(), value.trim()))
        .collect();
    let number = |name: &str| fields.get(name).and_then(|v| v.parse::<u32>().ok());
    ColumnHint {
        source_type: fields
            .get("ProviderType")
            .or_else(|| fields.get("DataTypeName"))
            .map(|t| t.to_ascii_lowercase())
            .unwrap_or_default(),
        size: number("ColumnSize"),
        precision: number("NumericPrecision"),
        scale: number("NumericScale"),
    }
}

/// 5xx, 408 and 429 answers are worth another attempt; any other status is final.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
        )
}

/// Attempt budget for one batch request, with a doubling wait between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub first_wait: Duration,
    pub wait_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            first_wait: Duration::from_millis(500),
            wait_cap: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Wait before 1-based attempt `attempt`. The first attempt goes out immediately.
    pub fn wait_before(&self, attempt: usize) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let doublings = u32::try_from(attempt - 2).unwrap_or(u32::MAX).min(16);
        self.first_wait
            .saturating_mul(1u32 << doublings)
            .min(self.wait_cap)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub endpoint: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            endpoint: SDA_POST_URL.to_string(),
            timeout: Duration::from_secs(30),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if err.is_request() || err.is_body() || err.is_decode() {
            TransportError::Malformed(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }

    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::Other(_))
    }
}

/// One POST of a JSON request body. Retry lives in [`SdaClient`], not here.
#[async_trait]
pub trait QueryTransport: Send + Sync {
    async fn post_json(
        &self,
        url: &str,
        request: &SdaRequest,
    ) -> Result<TransportResponse, TransportError>;
}

#[derive(Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl QueryTransport for ReqwestTransport {
    async fn post_json(
        &self,
        url: &str,
        request: &SdaRequest,
    ) -> Result<TransportResponse, TransportError> {
        let resp = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(TransportError::from_reqwest)?;
        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(TransportError::from_reqwest)?
            .to_vec();
        Ok(TransportResponse { status, body })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempt(s): {reason}")]
    Remote {
        url: String,
        attempts: usize,
        status: Option<u16>,
        reason: String,
    },
    /// The service answered, but without a `Table`. Not retried.
    #[error("{url} returned no data table")]
    EmptyResponse { url: String, attempts: usize },
}

impl FetchError {
    pub fn attempts(&self) -> usize {
        match self {
            FetchError::Remote { attempts, .. } | FetchError::EmptyResponse { attempts, .. } => {
                *attempts
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchResponse {
    pub attempts: usize,
    pub request: SdaRequest,
    pub table: ResponseTable,
    pub body: Vec<u8>,
}

struct AttemptFailure {
    status: Option<u16>,
    reason: String,
    transient: bool,
}

pub struct SdaClient {
    url: String,
    transport: Arc<dyn QueryTransport>,
    retry: RetryPolicy,
}

impl SdaClient {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(config)?;
        Ok(Self::with_transport(
            config.endpoint.clone(),
            Arc::new(transport),
            config.retry,
        ))
    }

    pub fn with_transport(
        url: impl Into<String>,
        transport: Arc<dyn QueryTransport>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            url: url.into(),
            transport,
            retry,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch attributes for one batch, retrying transient failures up to
    /// `retry.max_attempts` attempts in total.
    pub async fn fetch(
        &self,
        batch: &Batch,
        template: &QueryTemplate,
    ) -> Result<BatchResponse, FetchError> {
        let request = template.request(batch);
        let span = info_span!("sda_fetch", batch = batch.index, keys = batch.len());
        self.fetch_with_retry(request).instrument(span).await
    }

    async fn fetch_with_retry(&self, request: SdaRequest) -> Result<BatchResponse, FetchError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            let wait = self.retry.wait_before(attempt);
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }

            match self.attempt_once(&request).await {
                Ok(Some((table, body))) => {
                    return Ok(BatchResponse {
                        attempts: attempt,
                        request,
                        table,
                        body,
                    })
                }
                Ok(None) => {
                    return Err(FetchError::EmptyResponse {
                        url: self.url.clone(),
                        attempts: attempt,
                    })
                }
                Err(failure) if failure.transient && attempt < max_attempts => {
                    warn!(
                        attempt,
                        max_attempts,
                        reason = %failure.reason,
                        "SDA request failed; retrying"
                    );
                }
                Err(failure) => {
                    return Err(FetchError::Remote {
                        url: self.url.clone(),
                        attempts: attempt,
                        status: failure.status,
                        reason: failure.reason,
                    })
                }
            }
        }
    }

    /// One POST. `Ok(None)` means the body parsed but held no `Table`.
    async fn attempt_once(
        &self,
        request: &SdaRequest,
    ) -> Result<Option<(ResponseTable, Vec<u8>)>, AttemptFailure> {
        let resp = self
            .transport
            .post_json(&self.url, request)
            .await
            .map_err(|err| AttemptFailure {
                status: None,
                transient: err.is_transient(),
                reason: err.to_string(),
            })?;

        if !resp.status.is_success() {
            return Err(AttemptFailure {
                status: Some(resp.status.as_u16()),
                reason: format!("http status {}", resp.status),
                transient: is_transient_status(resp.status),
            });
        }

        match parse_response_body(&resp.body, request.format) {
            Ok(Some(table)) => Ok(Some((table, resp.body))),
            Ok(None) => Ok(None),
            Err(reason) => Err(AttemptFailure {
                status: Some(resp.status.as_u16()),
                reason: format!("malformed response: {reason}"),
                transient: true,
            }),
        }
    }
}

/// Where one batch exchange was archived, relative to the archive root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchivedBatch {
    pub batch: usize,
    pub query_hash: String,
    pub request_path: PathBuf,
    pub response_path: PathBuf,
}

/// Audit trail of SDA exchanges, one directory per run:
/// `<root>/<task_id>/<run_id>/batch-0001-<query hash>.{request,response}.json`.
#[derive(Debug, Clone)]
pub struct ResponseArchive {
    root: PathBuf,
}

impl ResponseArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// First 16 hex digits of the SHA-256 of the rendered SQL.
    pub fn query_hash(query: &str) -> String {
        let digest = Sha256::digest(query.as_bytes());
        hex::encode(&digest[..8])
    }

    /// Store the request body next to the raw response it produced.
    pub async fn store(
        &self,
        task_id: &str,
        run_id: &str,
        batch: usize,
        request: &SdaRequest,
        response: &[u8],
    ) -> anyhow::Result<ArchivedBatch> {
        let run_dir = PathBuf::from(task_id).join(run_id);
        let absolute_dir = self.root.join(&run_dir);
        fs::create_dir_all(&absolute_dir)
            .await
            .with_context(|| format!("creating archive directory {}", absolute_dir.display()))?;

        let query_hash = Self::query_hash(&request.query);
        let stem = format!("batch-{batch:04}-{query_hash}");
        let request_path = run_dir.join(format!("{stem}.request.json"));
        let response_path = run_dir.join(format!("{stem}.response.json"));

        let request_json =
            serde_json::to_vec_pretty(request).context("serializing SDA request")?;
        fs::write(self.root.join(&request_path), request_json)
            .await
            .with_context(|| format!("writing {}", request_path.display()))?;
        fs::write(self.root.join(&response_path), response)
            .await
            .with_context(|| format!("writing {}", response_path.display()))?;

        Ok(ArchivedBatch {
            batch,
            query_hash,
            request_path,
            response_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdafill_core::{FieldType, KeyKind, TypeMap};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::tempdir;

    const NATMUSYM_BODY: &str = r#"{"Table": [["mukey", "natmusym"],
        ["ColumnOrdinal=0,ColumnSize=4,NumericPrecision=10,NumericScale=255,ProviderType=Int,IsLong=False,ProviderSpecificDataType=System.Data.SqlTypes.SqlInt32,DataTypeName=int",
         "ColumnOrdinal=1,ColumnSize=6,NumericPrecision=255,NumericScale=255,ProviderType=VarChar,IsLong=False,ProviderSpecificDataType=System.Data.SqlTypes.SqlString,DataTypeName=varchar"],
        ["753571", "2tjpl"],
        ["753574", "2szdz"],
        ["2809844", "2v3f0"]]}"#;

    struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
        requests: Mutex<Vec<SdaRequest>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Result<TransportResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl QueryTransport for ScriptedTransport {
        async fn post_json(
            &self,
            _url: &str,
            request: &SdaRequest,
        ) -> Result<TransportResponse, TransportError> {
            self.requests.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(TransportError::Other("no scripted reply".into())))
        }
    }

    fn ok(body: &str) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse {
            status: StatusCode::OK,
            body: body.as_bytes().to_vec(),
        })
    }

    fn status(code: StatusCode) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse {
            status: code,
            body: b"error".to_vec(),
        })
    }

    fn no_delay() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            first_wait: Duration::ZERO,
            wait_cap: Duration::ZERO,
        }
    }

    fn batch(keys: &[&str]) -> Batch {
        Batch {
            index: 1,
            keys: keys
                .iter()
                .map(|k| KeyKind::Integer.parse(k).unwrap())
                .collect(),
        }
    }

    fn natmusym_template() -> QueryTemplate {
        QueryTemplate::new(
            "SELECT m.mukey, m.nationalmusym AS natmusym FROM mapunit m WHERE m.mukey IN ({keys})",
            ResponseFormat::JsonColumnNameMetadata,
        )
        .unwrap()
    }

    #[test]
    fn template_renders_bare_integers_and_quoted_codes() {
        let template = natmusym_template();
        assert_eq!(
            template.render(&batch(&["753571", "2809844"])),
            "SELECT m.mukey, m.nationalmusym AS natmusym FROM mapunit m WHERE m.mukey IN (753571,2809844)"
        );

        let areas = QueryTemplate::new(
            "SELECT areasymbol, areaname FROM sacatalog WHERE areasymbol IN ({keys})",
            ResponseFormat::Json,
        )
        .unwrap();
        let kind = KeyKind::Code { width: Some(5) };
        let area_batch = Batch {
            index: 1,
            keys: vec![kind.parse("wi025").unwrap(), kind.parse("WI027").unwrap()],
        };
        assert!(areas.render(&area_batch).ends_with("IN ('WI025','WI027')"));
    }

    #[test]
    fn template_requires_exactly_one_placeholder() {
        assert!(matches!(
            QueryTemplate::new("SELECT mukey FROM mapunit", ResponseFormat::Json),
            Err(ConfigError::InvalidTemplate(_))
        ));
        assert!(matches!(
            QueryTemplate::new("SELECT {keys} WHERE x IN ({keys})", ResponseFormat::Json),
            Err(ConfigError::InvalidTemplate(_))
        ));
    }

    #[test]
    fn request_serializes_format_and_query_fields() {
        let request = natmusym_template().request(&batch(&["753571"]));
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["FORMAT"], "JSON+COLUMNNAME+METADATA");
        assert!(json["QUERY"].as_str().unwrap().ends_with("IN (753571)"));
    }

    #[test]
    fn parses_header_metadata_and_rows() {
        let table = parse_response_body(
            NATMUSYM_BODY.as_bytes(),
            ResponseFormat::JsonColumnNameMetadata,
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            table.columns.as_deref(),
            Some(&["mukey".to_string(), "natmusym".to_string()][..])
        );
        let hints = table.hints.unwrap();
        assert_eq!(hints[0].source_type, "int");
        assert_eq!(hints[1].source_type, "varchar");
        assert_eq!(hints[1].size, Some(6));
        assert_eq!(hints[1].precision, Some(255));
        assert_eq!(table.rows.len(), 3);
        assert_eq!(
            table.rows[2],
            vec![Some("2809844".to_string()), Some("2v3f0".to_string())]
        );

        let spec = TypeMap::default()
            .column_spec("natmusym", &hints[1])
            .unwrap();
        assert_eq!(spec.field_type, FieldType::Text);
        assert_eq!(spec.length, Some(6));
    }

    #[test]
    fn plain_json_rows_keep_nulls_and_stringify_numbers() {
        let body = r#"{"Table": [["753571", "2tjpl", null], [2809844, "2v3f0", "Plainfield sand"]]}"#;
        let table = parse_response_body(body.as_bytes(), ResponseFormat::Json)
            .unwrap()
            .unwrap();
        assert!(table.columns.is_none());
        assert!(table.hints.is_none());
        assert_eq!(table.rows[0][2], None);
        assert_eq!(table.rows[1][0].as_deref(), Some("2809844"));
    }

    #[test]
    fn missing_table_key_means_no_rows_matched() {
        assert_eq!(parse_response_body(b"{}", ResponseFormat::Json), Ok(None));
        assert!(parse_response_body(b"<html>", ResponseFormat::Json).is_err());
        assert!(parse_response_body(
            br#"{"Table": []}"#,
            ResponseFormat::JsonColumnName
        )
        .is_err());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Timeout),
            Err(TransportError::Connect("connection reset".into())),
            ok(NATMUSYM_BODY),
        ]);
        let client = SdaClient::with_transport(SDA_POST_URL, transport.clone(), no_delay());

        let response = client
            .fetch(&batch(&["753571", "753574", "2809844"]), &natmusym_template())
            .await
            .unwrap();

        assert_eq!(response.attempts, 3);
        assert_eq!(transport.calls(), 3);
        assert_eq!(response.table.rows.len(), 3);
        assert!(response.request.query.ends_with("IN (753571,753574,2809844)"));
    }

    #[tokio::test]
    async fn exhausted_retries_surface_remote_error() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Timeout),
            status(StatusCode::SERVICE_UNAVAILABLE),
            ok("not json"),
            ok(NATMUSYM_BODY),
        ]);
        let client = SdaClient::with_transport(SDA_POST_URL, transport.clone(), no_delay());

        let err = client
            .fetch(&batch(&["753571"]), &natmusym_template())
            .await
            .unwrap_err();

        assert_eq!(transport.calls(), 3);
        match err {
            FetchError::Remote {
                url,
                attempts,
                status,
                reason,
            } => {
                assert_eq!(url, SDA_POST_URL);
                assert_eq!(attempts, 3);
                assert_eq!(status, Some(200));
                assert!(reason.starts_with("malformed response"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let transport = ScriptedTransport::new(vec![status(StatusCode::BAD_REQUEST), ok(NATMUSYM_BODY)]);
        let client = SdaClient::with_transport(SDA_POST_URL, transport.clone(), no_delay());

        let err = client
            .fetch(&batch(&["753571"]), &natmusym_template())
            .await
            .unwrap_err();

        assert_eq!(transport.calls(), 1);
        assert!(matches!(
            err,
            FetchError::Remote {
                attempts: 1,
                status: Some(400),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn empty_table_is_reported_without_retry() {
        let transport = ScriptedTransport::new(vec![ok("{}")]);
        let client = SdaClient::with_transport(SDA_POST_URL, transport.clone(), no_delay());

        let err = client
            .fetch(&batch(&["1"]), &natmusym_template())
            .await
            .unwrap_err();

        assert_eq!(transport.calls(), 1);
        assert_eq!(
            err,
            FetchError::EmptyResponse {
                url: SDA_POST_URL.to_string(),
                attempts: 1,
            }
        );
    }

    #[tokio::test]
    async fn empty_table_after_a_timeout_counts_both_attempts() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Timeout), ok("{}")]);
        let client = SdaClient::with_transport(SDA_POST_URL, transport.clone(), no_delay());

        let err = client
            .fetch(&batch(&["1"]), &natmusym_template())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::EmptyResponse { .. }));
        assert_eq!(err.attempts(), 2);
    }

    #[test]
    fn only_transient_failures_are_retried() {
        assert!(TransportError::Timeout.is_transient());
        assert!(TransportError::Malformed("bad status line".into()).is_transient());
        assert!(!TransportError::Other("builder".into()).is_transient());
        assert!(is_transient_status(StatusCode::GATEWAY_TIMEOUT));
        assert!(is_transient_status(StatusCode::REQUEST_TIMEOUT));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn waits_double_between_attempts_up_to_the_cap() {
        let policy = RetryPolicy {
            max_attempts: 5,
            first_wait: Duration::from_millis(100),
            wait_cap: Duration::from_millis(350),
        };

        let waits: Vec<_> = (1..=4).map(|attempt| policy.wait_before(attempt)).collect();
        assert_eq!(
            waits,
            vec![
                Duration::ZERO,
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(350)
            ]
        );
        assert_eq!(policy.wait_before(usize::MAX), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn archive_keeps_each_request_next_to_its_response() {
        let dir = tempdir().expect("tempdir");
        let archive = ResponseArchive::new(dir.path());
        let template = natmusym_template();
        let first = template.request(&batch(&["753571", "753574"]));
        let second = template.request(&batch(&["2809844"]));

        let one = archive
            .store("natmusym", "run-1", 1, &first, NATMUSYM_BODY.as_bytes())
            .await
            .expect("store batch 1");
        let two = archive
            .store("natmusym", "run-1", 2, &second, b"{}")
            .await
            .expect("store batch 2");

        assert_ne!(one.query_hash, two.query_hash);
        assert_eq!(one.query_hash.len(), 16);
        assert_eq!(
            one.request_path,
            PathBuf::from("natmusym")
                .join("run-1")
                .join(format!("batch-0001-{}.request.json", one.query_hash))
        );
        assert_eq!(two.response_path.parent(), one.response_path.parent());

        let stored: serde_json::Value = serde_json::from_slice(
            &std::fs::read(dir.path().join(&one.request_path)).unwrap(),
        )
        .unwrap();
        assert_eq!(stored["QUERY"], first.query.as_str());
        assert_eq!(
            std::fs::read(dir.path().join(&two.response_path)).unwrap(),
            b"{}"
        );
    }
}
