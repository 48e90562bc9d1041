//! Immutable artifact storage, HTTP fetch utilities and the remote feature store client.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use alertsync_core::{CanonicalRecord, FieldValue, LayerSchema, SinkGeometry};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, PRAGMA};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "alertsync-storage";

/// Where a cached source document came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentOrigin {
    pub pipeline_id: String,
    /// Fetched URL, or the local path of an offline run.
    pub location: String,
    /// File extension of the document format (`kml`, `csv`).
    pub format: String,
    pub retrieved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachedDocument {
    #[serde(flatten)]
    pub origin: DocumentOrigin,
    pub sha256: String,
    pub relative_path: PathBuf,
    #[serde(skip)]
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// Identical bytes were already cached for this pipeline and retrieval time.
    pub reused: bool,
}

/// Write-once cache of every source document a run reads, laid out as
/// `<YYYYMMDD_HHMMSS>/<pipeline_id>/<sha256>.<format>` with a `<sha256>.json` origin record
/// beside each document.
#[derive(Debug, Clone)]
pub struct DocumentCache {
    root: PathBuf,
}

impl DocumentCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn digest(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn document_path(origin: &DocumentOrigin, sha256: &str) -> PathBuf {
        let format = match origin.format.trim().trim_start_matches('.') {
            "" => "bin",
            format => format,
        };
        PathBuf::from(origin.retrieved_at.format("%Y%m%d_%H%M%S").to_string())
            .join(&origin.pipeline_id)
            .join(format!("{sha256}.{format}"))
    }

    pub async fn put(&self, origin: DocumentOrigin, bytes: &[u8]) -> anyhow::Result<CachedDocument> {
        let sha256 = Self::digest(bytes);
        let relative_path = Self::document_path(&origin, &sha256);
        let absolute_path = self.root.join(&relative_path);
        let Some(dir) = absolute_path.parent().map(Path::to_path_buf) else {
            return Err(anyhow!("cache path {} has no parent", absolute_path.display()));
        };
        let mut cached = CachedDocument {
            origin,
            sha256,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            reused: true,
        };
        if fs::try_exists(&cached.absolute_path).await.unwrap_or(false) {
            debug!(path = %cached.relative_path.display(), "document already cached");
            return Ok(cached);
        }

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating cache directory {}", dir.display()))?;
        let partial = dir.join(format!("{}.{}.partial", cached.sha256, Uuid::new_v4().simple()));
        fs::write(&partial, bytes)
            .await
            .with_context(|| format!("writing {}", partial.display()))?;
        if let Err(err) = fs::rename(&partial, &cached.absolute_path).await {
            let _ = fs::remove_file(&partial).await;
            return Err(err).with_context(|| format!("moving document into {}", cached.absolute_path.display()));
        }

        cached.reused = false;
        let record = dir.join(format!("{}.json", cached.sha256));
        fs::write(&record, serde_json::to_vec_pretty(&cached)?)
            .await
            .with_context(|| format!("writing {}", record.display()))?;
        Ok(cached)
    }
}

/// Capped exponential delays between attempts to fetch a source document.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: usize,
    pub first_delay: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            first_delay: Duration::from_millis(500),
            ceiling: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn delay_before_retry(&self, retry: usize) -> Duration {
        (0..retry)
            .fold(self.first_delay, |delay, _| delay.saturating_mul(2))
            .min(self.ceiling)
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

fn build_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build().context("building reqwest client")
}

/// Appends a `v=<stamp>` query parameter so intermediate caches cannot serve a stale copy.
pub fn cache_busted_url(url: &str, stamp: i64) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}v={stamp}")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub cache_bust: bool,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_cache_bust(mut self, cache_bust: bool) -> Self {
        self.cache_bust = cache_bust;
        self
    }

    pub fn effective_url(&self, now: DateTime<Utc>) -> String {
        if self.cache_bust {
            cache_busted_url(&self.url, now.timestamp())
        } else {
            self.url.clone()
        }
    }

    pub fn header_map(&self) -> Result<HeaderMap, FetchError> {
        let mut map = HeaderMap::new();
        if self.cache_bust {
            map.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            map.insert(PRAGMA, HeaderValue::from_static("no-cache"));
        }
        for (name, value) in &self.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| FetchError::InvalidHeader { name: name.clone() })?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|_| FetchError::InvalidHeader { name: name.clone() })?;
            map.insert(header_name, header_value);
        }
        Ok(map)
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub fetched_at: DateTime<Utc>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid request header {name:?}")]
    InvalidHeader { name: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(&config)?,
            retry: config.retry,
        })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        pipeline_id: &str,
        request: &FetchRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let fetched_at = Utc::now();
        let url = request.effective_url(fetched_at);
        let headers = request.header_map()?;
        let span = info_span!("http_fetch", %run_id, pipeline_id, url = %url);
        self.get_with_retries(&url, headers, fetched_at)
            .instrument(span)
            .await
    }

    async fn get_with_retries(
        &self,
        url: &str,
        headers: HeaderMap,
        fetched_at: DateTime<Utc>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut retry = 0usize;
        loop {
            let failure = match self.client.get(url).headers(headers.clone()).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    debug!(status = status.as_u16(), bytes = body.len(), "fetched document");
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        fetched_at,
                        body,
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let failure = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    if !is_transient_status(status) {
                        return Err(failure);
                    }
                    failure
                }
                Err(err) if is_transient_error(&err) => FetchError::Request(err),
                Err(err) => return Err(FetchError::Request(err)),
            };
            if retry >= self.retry.retries {
                return Err(failure);
            }
            let delay = self.retry.delay_before_retry(retry);
            warn!(error = %failure, retry = retry + 1, delay_ms = delay.as_millis() as u64, "transient fetch failure");
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }
}

/// Failure of a whole feature store call. For an add call this means no per-item result
/// exists and every record of the batch counts as failed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("feature store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("feature store returned http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("feature store error {code}: {message}")]
    Service { code: i64, message: String },
    #[error("encoding features: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("unexpected feature store response: {0}")]
    UnexpectedResponse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub deleted_count: usize,
}

/// Per-record result of an add call, aligned positionally with the submitted batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddItemResult {
    pub success: bool,
    pub object_id: Option<i64>,
    pub error: Option<String>,
}

impl AddItemResult {
    pub fn succeeded(object_id: Option<i64>) -> Self {
        Self {
            success: true,
            object_id,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            object_id: None,
            error: Some(message.into()),
        }
    }
}

#[async_trait]
pub trait FeatureStore: Send + Sync {
    async fn schema(&self) -> Result<LayerSchema, StoreError>;

    async fn delete_all(&self, filter: &str) -> Result<DeleteOutcome, StoreError>;

    async fn add_batch(&self, records: &[CanonicalRecord]) -> Result<Vec<AddItemResult>, StoreError>;
}

#[derive(Serialize)]
struct WireFeature<'a> {
    attributes: &'a BTreeMap<String, FieldValue>,
    geometry: &'a SinkGeometry,
}

/// JSON array of `{attributes, geometry}` objects as accepted by `addFeatures`.
pub fn encode_features(records: &[CanonicalRecord]) -> Result<String, StoreError> {
    let features: Vec<WireFeature<'_>> = records
        .iter()
        .map(|r| WireFeature {
            attributes: &r.attributes,
            geometry: &r.geometry,
        })
        .collect();
    Ok(serde_json::to_string(&features)?)
}

/// Feature services answer application errors with HTTP 200 and an `error` object.
fn check_service_error(body: &Value) -> Result<(), StoreError> {
    let Some(error) = body.get("error") else {
        return Ok(());
    };
    let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
    let mut message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    if let Some(details) = error.get("details").and_then(Value::as_array) {
        let details: Vec<&str> = details.iter().filter_map(Value::as_str).collect();
        if !details.is_empty() {
            message = format!("{message} ({})", details.join("; "));
        }
    }
    Err(StoreError::Service { code, message })
}

fn item_error(item: &Value) -> String {
    let error = item.get("error");
    let description = error
        .and_then(|e| e.get("description"))
        .and_then(Value::as_str)
        .unwrap_or("record rejected");
    match error.and_then(|e| e.get("code")).and_then(Value::as_i64) {
        Some(code) => format!("{description} (code {code})"),
        None => description.to_string(),
    }
}

pub fn decode_delete_response(body: &Value) -> Result<DeleteOutcome, StoreError> {
    check_service_error(body)?;
    if let Some(results) = body.get("deleteResults").and_then(Value::as_array) {
        let deleted_count = results
            .iter()
            .filter(|r| r.get("success").and_then(Value::as_bool).unwrap_or(false))
            .count();
        return Ok(DeleteOutcome { deleted_count });
    }
    match body.get("success").and_then(Value::as_bool) {
        Some(true) => Ok(DeleteOutcome { deleted_count: 0 }),
        Some(false) => Err(StoreError::UnexpectedResponse(
            "delete reported success=false".to_string(),
        )),
        None => Err(StoreError::UnexpectedResponse(
            "response has neither deleteResults nor success".to_string(),
        )),
    }
}

/// Per-item results for a batch of `submitted` records. Missing trailing results count as
/// failures; a response without `addResults` is a call-level error.
pub fn decode_add_response(body: &Value, submitted: usize) -> Result<Vec<AddItemResult>, StoreError> {
    check_service_error(body)?;
    let results = body
        .get("addResults")
        .and_then(Value::as_array)
        .ok_or_else(|| StoreError::UnexpectedResponse("response has no addResults".to_string()))?;
    if results.len() > submitted {
        warn!(submitted, returned = results.len(), "more add results than records; extras ignored");
    }
    let mut decoded: Vec<AddItemResult> = results
        .iter()
        .take(submitted)
        .map(|item| {
            if item.get("success").and_then(Value::as_bool).unwrap_or(false) {
                AddItemResult::succeeded(item.get("objectId").and_then(Value::as_i64))
            } else {
                AddItemResult::failed(item_error(item))
            }
        })
        .collect();
    decoded.resize_with(submitted, || AddItemResult::failed("no result returned for this record"));
    Ok(decoded)
}

/// REST client for one feature layer (`.../FeatureServer/<n>`).
#[derive(Debug, Clone)]
pub struct FeatureServiceClient {
    client: reqwest::Client,
    layer_url: String,
    token: Option<String>,
}

impl FeatureServiceClient {
    pub fn new(
        layer_url: impl Into<String>,
        token: Option<String>,
        config: &HttpClientConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            layer_url: layer_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn layer_url(&self) -> &str {
        &self.layer_url
    }

    fn params<'a>(&'a self, extra: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
        let mut params = vec![("f", "json")];
        params.extend_from_slice(extra);
        if let Some(token) = &self.token {
            params.push(("token", token.as_str()));
        }
        params
    }

    async fn read_json(resp: reqwest::Response) -> Result<Value, StoreError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(StoreError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.json::<Value>().await?)
    }

    async fn post(&self, operation: &str, extra: &[(&str, &str)]) -> Result<Value, StoreError> {
        let url = format!("{}/{operation}", self.layer_url);
        let resp = self
            .client
            .post(&url)
            .form(&self.params(extra))
            .send()
            .await?;
        Self::read_json(resp).await
    }

    async fn fetch_schema(&self) -> Result<LayerSchema, StoreError> {
        let resp = self
            .client
            .get(&self.layer_url)
            .query(&self.params(&[]))
            .send()
            .await?;
        let body = Self::read_json(resp).await?;
        check_service_error(&body)?;
        serde_json::from_value::<LayerSchema>(body)
            .map_err(|e| StoreError::UnexpectedResponse(format!("layer descriptor: {e}")))
    }

    async fn delete_where(&self, filter: &str) -> Result<DeleteOutcome, StoreError> {
        let body = self.post("deleteFeatures", &[("where", filter)]).await?;
        decode_delete_response(&body)
    }

    async fn add_features(&self, records: &[CanonicalRecord]) -> Result<Vec<AddItemResult>, StoreError> {
        let features = encode_features(records)?;
        let body = self
            .post(
                "addFeatures",
                &[("features", features.as_str()), ("rollbackOnFailure", "false")],
            )
            .await?;
        decode_add_response(&body, records.len())
    }
}

#[async_trait]
impl FeatureStore for FeatureServiceClient {
    async fn schema(&self) -> Result<LayerSchema, StoreError> {
        let span = info_span!("feature_store", op = "schema", layer = %self.layer_url);
        self.fetch_schema().instrument(span).await
    }

    async fn delete_all(&self, filter: &str) -> Result<DeleteOutcome, StoreError> {
        let span = info_span!("feature_store", op = "deleteFeatures", layer = %self.layer_url);
        self.delete_where(filter).instrument(span).await
    }

    async fn add_batch(&self, records: &[CanonicalRecord]) -> Result<Vec<AddItemResult>, StoreError> {
        let span = info_span!(
            "feature_store",
            op = "addFeatures",
            layer = %self.layer_url,
            records = records.len()
        );
        self.add_features(records).instrument(span).await
    }
}
