//! Alert pipeline core: attribute normalization, classification, record assembly and the
//! truncate-then-append batch synchronizer, plus the registry, run orchestration and scheduler.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use alertsync_adapters::{
    adapter_for, clean_key, parse_attribute_table, read_document_file, DocumentSpec, EmbeddedPair,
    SourceDocument,
};
use alertsync_core::{
    convert_geometry, CanonicalRecord, CoercionError, FieldValue, LayerSchema, RawValue,
    SourceFeature,
};
use alertsync_storage::{
    AddItemResult, DocumentCache, DocumentOrigin, FeatureServiceClient, FeatureStore, FetchRequest,
    HttpClientConfig, HttpFetcher,
};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "alertsync-sync";

pub const DEFAULT_CHUNK_SIZE: usize = 100;
pub const DEFAULT_DELETE_FILTER: &str = "1=1";

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineRegistry {
    pub pipelines: Vec<PipelineProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSettings {
    /// URL template; `{year}`, `{yyyymmdd}` and `{yyyy_mm_dd}` are filled with the run date.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub cache_bust: bool,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub document: DocumentSpec,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationStrategy {
    #[default]
    TrailingNumeral,
    Lookup,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClassificationConfig {
    #[serde(default)]
    pub strategy: ClassificationStrategy,
    #[serde(default)]
    pub default_code: i64,
    /// Sink fields that receive the code, each coerced to its declared type.
    #[serde(default)]
    pub target_fields: Vec<String>,
    #[serde(default)]
    pub table: BTreeMap<String, i64>,
}

/// A label whose n-th occurrence in an embedded table feeds `fields[n]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PositionalLabel {
    pub label: String,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct InclusionPolicy {
    #[serde(default)]
    pub require_label: bool,
    #[serde(default)]
    pub require_mapped_attributes: bool,
}

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_delete_filter() -> String {
    DEFAULT_DELETE_FILTER.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineProfile {
    pub pipeline_id: String,
    pub display_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub source: SourceSettings,
    pub layer_url: String,
    #[serde(default)]
    pub label_column: Option<String>,
    #[serde(default)]
    pub description_column: Option<String>,
    #[serde(default)]
    pub name_field: Option<String>,
    #[serde(default)]
    pub classification: ClassificationConfig,
    #[serde(default)]
    pub field_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub positional_labels: Vec<PositionalLabel>,
    #[serde(default)]
    pub inclusion: InclusionPolicy,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_delete_filter")]
    pub delete_filter: String,
}

impl PipelineRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing pipeline registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for profile in &self.pipelines {
            if !seen.insert(profile.pipeline_id.as_str()) {
                bail!("duplicate pipeline_id {:?}", profile.pipeline_id);
            }
            if profile.chunk_size == 0 {
                bail!("pipeline {:?}: chunk_size must be positive", profile.pipeline_id);
            }
        }
        Ok(())
    }

    pub fn get(&self, pipeline_id: &str) -> Option<&PipelineProfile> {
        self.pipelines.iter().find(|p| p.pipeline_id == pipeline_id)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &PipelineProfile> {
        self.pipelines.iter().filter(|p| p.enabled)
    }
}

pub fn render_source_url(template: &str, date: NaiveDate) -> String {
    template
        .replace("{year}", &date.format("%Y").to_string())
        .replace("{yyyymmdd}", &date.format("%Y%m%d").to_string())
        .replace("{yyyy_mm_dd}", &date.format("%Y-%m-%d").to_string())
}

/// Maps raw column names and embedded table labels onto canonical field names.
/// Keys are matched verbatim first, then by their cleaned identifier.
#[derive(Debug, Clone)]
pub struct SchemaNormalizer {
    mapping: HashMap<String, String>,
    positional: Vec<(String, Vec<String>)>,
}

impl SchemaNormalizer {
    pub fn new(field_mapping: &BTreeMap<String, String>, positional: &[PositionalLabel]) -> Self {
        let mut mapping = HashMap::new();
        for (raw, canonical) in field_mapping {
            mapping
                .entry(clean_key(raw))
                .or_insert_with(|| canonical.clone());
        }
        for (raw, canonical) in field_mapping {
            mapping.insert(raw.clone(), canonical.clone());
        }
        let positional = positional
            .iter()
            .map(|p| (clean_key(&p.label), p.fields.clone()))
            .collect();
        Self {
            mapping,
            positional,
        }
    }

    pub fn normalize(&self, raw_key: &str) -> Option<&str> {
        self.mapping
            .get(raw_key)
            .or_else(|| self.mapping.get(&clean_key(raw_key)))
            .map(String::as_str)
    }

    /// Native columns, minus the ones listed in `skip`. Unmapped columns are dropped.
    pub fn normalize_columns(
        &self,
        columns: &BTreeMap<String, RawValue>,
        skip: &[&str],
    ) -> BTreeMap<String, RawValue> {
        columns
            .iter()
            .filter(|(name, _)| !skip.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                self.normalize(name)
                    .map(|field| (field.to_string(), value.clone()))
            })
            .collect()
    }

    /// Embedded pairs in document order. Positional labels are routed by occurrence;
    /// any other repeated key keeps its last value.
    pub fn normalize_embedded(&self, pairs: &[EmbeddedPair]) -> BTreeMap<String, RawValue> {
        let mut occurrences: HashMap<&str, usize> = HashMap::new();
        let mut out = BTreeMap::new();
        for pair in pairs {
            if let Some((label, fields)) = self.positional.iter().find(|(key, _)| *key == pair.key) {
                let seen = occurrences.entry(label.as_str()).or_default();
                match fields.get(*seen) {
                    Some(field) => {
                        out.insert(field.clone(), RawValue::text(pair.value.as_str()));
                    }
                    None => debug!(label = %pair.label, occurrence = *seen, "extra positional label ignored"),
                }
                *seen += 1;
                continue;
            }
            if let Some(field) = self.normalize(&pair.label) {
                out.insert(field.to_string(), RawValue::text(pair.value.as_str()));
            }
        }
        out
    }
}

static TRAILING_NUMERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\d.]+$").expect("trailing numeral pattern"));

const LABEL_SEPARATORS: &[char] = &['-', '–', '—', ':'];

#[derive(Debug, Clone, PartialEq)]
pub enum ClassCode {
    Default(i64),
    /// Numeral taken from the end of the label, kept as text so string targets get it verbatim.
    Numeral { text: String, value: f64 },
    Mapped(i64),
}

impl ClassCode {
    pub fn is_default(&self) -> bool {
        matches!(self, Self::Default(_))
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            Self::Default(code) | Self::Mapped(code) => *code,
            Self::Numeral { value, .. } => value.trunc() as i64,
        }
    }

    pub fn raw_value(&self) -> RawValue {
        match self {
            Self::Numeral { text, .. } => RawValue::Text(text.clone()),
            other => RawValue::Number(other.as_i64() as f64),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub display_name: Option<String>,
    pub code: ClassCode,
}

#[derive(Debug, Clone)]
pub struct ClassificationResolver {
    strategy: ClassificationStrategy,
    default_code: i64,
    table: HashMap<String, i64>,
}

impl ClassificationResolver {
    pub fn new(config: &ClassificationConfig) -> Self {
        Self {
            strategy: config.strategy,
            default_code: config.default_code,
            table: config
                .table
                .iter()
                .map(|(label, code)| (label.trim().to_string(), *code))
                .collect(),
        }
    }

    pub fn default_code(&self) -> i64 {
        self.default_code
    }

    pub fn resolve(&self, label: Option<&str>) -> Classification {
        let label = label.map(str::trim).unwrap_or_default();
        if label.is_empty() {
            return Classification {
                display_name: None,
                code: ClassCode::Default(self.default_code),
            };
        }
        match self.strategy {
            ClassificationStrategy::Lookup => Classification {
                display_name: Some(label.to_string()),
                code: self
                    .table
                    .get(label)
                    .map(|code| ClassCode::Mapped(*code))
                    .unwrap_or(ClassCode::Default(self.default_code)),
            },
            ClassificationStrategy::TrailingNumeral => self.resolve_numeral(label),
        }
    }

    fn resolve_numeral(&self, label: &str) -> Classification {
        let numeral = TRAILING_NUMERAL.find(label).and_then(|m| {
            m.as_str()
                .parse::<f64>()
                .ok()
                .map(|value| (m.start(), m.as_str().to_string(), value))
        });
        let Some((start, text, value)) = numeral else {
            return Classification {
                display_name: Some(label.to_string()),
                code: ClassCode::Default(self.default_code),
            };
        };
        let remainder = label[..start]
            .trim_end()
            .trim_end_matches(LABEL_SEPARATORS)
            .trim_end();
        let display_name = if remainder.is_empty() {
            text.clone()
        } else {
            remainder.to_string()
        };
        Classification {
            display_name: Some(display_name),
            code: ClassCode::Numeral { text, value },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExclusionReason {
    MissingGeometry,
    InvalidGeometry(String),
    MissingLabel,
    NoMappedAttributes,
    /// Default code, no display name and no non-null attribute.
    Uninformative,
}

impl ExclusionReason {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingGeometry => "missing_geometry",
            Self::InvalidGeometry(_) => "invalid_geometry",
            Self::MissingLabel => "missing_label",
            Self::NoMappedAttributes => "no_mapped_attributes",
            Self::Uninformative => "uninformative",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assembled {
    pub record: CanonicalRecord,
    pub coercion_failures: Vec<CoercionError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssemblyOutcome {
    Included(Box<Assembled>),
    Excluded(ExclusionReason),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssemblySummary {
    pub features: usize,
    pub included: usize,
    pub excluded: BTreeMap<&'static str, usize>,
    pub coercion_failures: usize,
}

#[derive(Debug, Clone, Default)]
pub struct AssemblyRun {
    pub records: Vec<CanonicalRecord>,
    pub summary: AssemblySummary,
}

/// Turns source features into canonical records for one layer schema.
#[derive(Debug, Clone)]
pub struct RecordAssembler {
    label_column: Option<String>,
    description_column: Option<String>,
    name_field: Option<String>,
    target_fields: Vec<String>,
    inclusion: InclusionPolicy,
    normalizer: SchemaNormalizer,
    resolver: ClassificationResolver,
    schema: LayerSchema,
}

impl RecordAssembler {
    pub fn new(profile: &PipelineProfile, schema: LayerSchema) -> Self {
        for field in profile
            .field_mapping
            .values()
            .chain(profile.positional_labels.iter().flat_map(|p| p.fields.iter()))
            .chain(profile.classification.target_fields.iter())
            .chain(profile.name_field.iter())
        {
            if schema.field(field).is_none() {
                warn!(pipeline_id = %profile.pipeline_id, field = %field, "mapped field missing from layer schema; it will be dropped");
            }
        }
        Self {
            label_column: profile.label_column.clone(),
            description_column: profile.description_column.clone(),
            name_field: profile.name_field.clone(),
            target_fields: profile.classification.target_fields.clone(),
            inclusion: profile.inclusion,
            normalizer: SchemaNormalizer::new(&profile.field_mapping, &profile.positional_labels),
            resolver: ClassificationResolver::new(&profile.classification),
            schema,
        }
    }

    pub fn schema(&self) -> &LayerSchema {
        &self.schema
    }

    fn coerce_into(
        &self,
        attributes: &mut BTreeMap<String, FieldValue>,
        failures: &mut Vec<CoercionError>,
        field: &str,
        raw: &RawValue,
    ) {
        let Some(spec) = self.schema.field(field) else {
            return;
        };
        let value = match FieldValue::coerce(raw, spec) {
            Ok(value) => value,
            Err(err) => {
                failures.push(err);
                FieldValue::Null
            }
        };
        attributes.insert(field.to_string(), value);
    }

    pub fn assemble(&self, feature: &SourceFeature) -> AssemblyOutcome {
        let Some(raw_geometry) = feature.geometry.as_ref() else {
            return AssemblyOutcome::Excluded(ExclusionReason::MissingGeometry);
        };
        let geometry = match convert_geometry(raw_geometry) {
            Ok(geometry) => geometry,
            Err(err) => return AssemblyOutcome::Excluded(ExclusionReason::InvalidGeometry(err.to_string())),
        };

        let label = self
            .label_column
            .as_deref()
            .and_then(|column| feature.column_text(column));
        if self.inclusion.require_label && label.is_none() {
            return AssemblyOutcome::Excluded(ExclusionReason::MissingLabel);
        }
        let classification = self.resolver.resolve(label.as_deref());

        let skip: Vec<&str> = self
            .label_column
            .iter()
            .chain(self.description_column.iter())
            .map(String::as_str)
            .collect();
        let mut merged = self.normalizer.normalize_columns(&feature.columns, &skip);
        if let Some(fragment) = self
            .description_column
            .as_deref()
            .and_then(|column| feature.column_text(column))
        {
            let embedded = self
                .normalizer
                .normalize_embedded(&parse_attribute_table(&fragment));
            for (field, value) in embedded {
                let slot = merged.entry(field).or_insert(RawValue::Null);
                if slot.is_null() {
                    *slot = value;
                }
            }
        }
        if self.inclusion.require_mapped_attributes && merged.values().all(RawValue::is_null) {
            return AssemblyOutcome::Excluded(ExclusionReason::NoMappedAttributes);
        }

        let mut attributes = BTreeMap::new();
        let mut failures = Vec::new();
        for (field, raw) in &merged {
            self.coerce_into(&mut attributes, &mut failures, field, raw);
        }

        let unnamed = classification
            .display_name
            .as_deref()
            .map_or(true, |name| name.trim().is_empty());
        if classification.code.is_default() && unnamed && attributes.values().all(FieldValue::is_null) {
            return AssemblyOutcome::Excluded(ExclusionReason::Uninformative);
        }

        if let Some(name_field) = &self.name_field {
            let name = classification
                .display_name
                .as_deref()
                .map(RawValue::text)
                .unwrap_or(RawValue::Null);
            self.coerce_into(&mut attributes, &mut failures, name_field, &name);
        }
        let code = classification.code.raw_value();
        for target in &self.target_fields {
            self.coerce_into(&mut attributes, &mut failures, target, &code);
        }

        AssemblyOutcome::Included(Box::new(Assembled {
            record: CanonicalRecord {
                name: classification.display_name,
                classification_code: classification.code.as_i64(),
                attributes,
                geometry,
            },
            coercion_failures: failures,
        }))
    }

    pub fn assemble_all(&self, features: &[SourceFeature]) -> AssemblyRun {
        let mut run = AssemblyRun {
            records: Vec::with_capacity(features.len()),
            summary: AssemblySummary {
                features: features.len(),
                ..AssemblySummary::default()
            },
        };
        for (index, feature) in features.iter().enumerate() {
            match self.assemble(feature) {
                AssemblyOutcome::Included(assembled) => {
                    let Assembled {
                        record,
                        coercion_failures,
                    } = *assembled;
                    for failure in &coercion_failures {
                        warn!(feature_index = index, error = %failure, "value stored as null");
                    }
                    run.summary.coercion_failures += coercion_failures.len();
                    run.records.push(record);
                }
                AssemblyOutcome::Excluded(reason) => {
                    match &reason {
                        ExclusionReason::InvalidGeometry(message) => {
                            warn!(feature_index = index, error = %message, "feature excluded")
                        }
                        other => debug!(feature_index = index, reason = other.kind(), "feature excluded"),
                    }
                    *run.summary.excluded.entry(reason.kind()).or_default() += 1;
                }
            }
        }
        run.summary.included = run.records.len();
        run
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeletePhase {
    Deleted { deleted_count: usize },
    Failed { error: String },
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    /// Position of the record in the submitted sequence.
    pub index: usize,
    /// 1-based chunk number.
    pub batch: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkOutcome {
    pub batch: usize,
    pub submitted: usize,
    pub added: usize,
    pub failed: usize,
    pub transport_error: Option<String>,
    #[serde(skip)]
    pub failures: Vec<RecordFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub delete: DeletePhase,
    pub added_count: usize,
    pub failed_count: usize,
    pub chunks: Vec<ChunkOutcome>,
    pub errors: Vec<RecordFailure>,
}

impl SyncReport {
    pub fn from_chunks(delete: DeletePhase, chunks: Vec<ChunkOutcome>) -> Self {
        let (added_count, failed_count, errors) = chunks.iter().fold(
            (0, 0, Vec::new()),
            |(added, failed, mut errors), chunk| {
                errors.extend(chunk.failures.iter().cloned());
                (added + chunk.added, failed + chunk.failed, errors)
            },
        );
        Self {
            delete,
            added_count,
            failed_count,
            chunks,
            errors,
        }
    }

    pub fn submitted(&self) -> usize {
        self.added_count + self.failed_count
    }
}

/// Full-replace writer: one delete, then sequential chunked adds. Never retries, never aborts.
#[derive(Debug, Clone)]
pub struct BatchSynchronizer {
    chunk_size: usize,
    delete_filter: String,
    delete_enabled: bool,
}

impl BatchSynchronizer {
    pub fn new(chunk_size: usize, delete_filter: impl Into<String>) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            delete_filter: delete_filter.into(),
            delete_enabled: true,
        }
    }

    pub fn from_profile(profile: &PipelineProfile) -> Self {
        Self::new(profile.chunk_size, profile.delete_filter.clone())
    }

    /// For layers that do not accept deletes; the add phase still runs.
    pub fn without_delete(mut self) -> Self {
        self.delete_enabled = false;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    async fn delete_phase(&self, store: &dyn FeatureStore) -> DeletePhase {
        if !self.delete_enabled {
            info!("layer does not support deletes; skipping delete phase");
            return DeletePhase::Skipped;
        }
        match store.delete_all(&self.delete_filter).await {
            Ok(outcome) => {
                info!(deleted = outcome.deleted_count, filter = %self.delete_filter, "deleted existing features");
                DeletePhase::Deleted {
                    deleted_count: outcome.deleted_count,
                }
            }
            Err(err) => {
                warn!(error = %err, "delete phase failed; continuing with adds");
                DeletePhase::Failed {
                    error: err.to_string(),
                }
            }
        }
    }

    async fn submit_chunk(
        &self,
        store: &dyn FeatureStore,
        batch: usize,
        offset: usize,
        chunk: &[CanonicalRecord],
    ) -> ChunkOutcome {
        match store.add_batch(chunk).await {
            Ok(results) => {
                if results.len() != chunk.len() {
                    warn!(batch, submitted = chunk.len(), returned = results.len(), "result count does not match batch size");
                }
                let mut added = 0;
                let mut failures = Vec::new();
                for i in 0..chunk.len() {
                    let message = match results.get(i) {
                        Some(result) if result.success => {
                            added += 1;
                            continue;
                        }
                        Some(result) => item_message(result),
                        None => "no result returned".to_string(),
                    };
                    warn!(batch, index = offset + i, error = %message, "record rejected");
                    failures.push(RecordFailure {
                        index: offset + i,
                        batch,
                        message,
                    });
                }
                info!(batch, submitted = chunk.len(), added, failed = failures.len(), "chunk submitted");
                ChunkOutcome {
                    batch,
                    submitted: chunk.len(),
                    added,
                    failed: failures.len(),
                    transport_error: None,
                    failures,
                }
            }
            Err(err) => {
                error!(batch, submitted = chunk.len(), error = %err, "chunk failed");
                let message = format!("batch {batch}: {err}");
                ChunkOutcome {
                    batch,
                    submitted: chunk.len(),
                    added: 0,
                    failed: chunk.len(),
                    transport_error: Some(err.to_string()),
                    failures: (0..chunk.len())
                        .map(|i| RecordFailure {
                            index: offset + i,
                            batch,
                            message: message.clone(),
                        })
                        .collect(),
                }
            }
        }
    }

    pub async fn synchronize(&self, records: &[CanonicalRecord], store: &dyn FeatureStore) -> SyncReport {
        let delete = self.delete_phase(store).await;
        let mut chunks = Vec::with_capacity(records.len().div_ceil(self.chunk_size));
        for (i, chunk) in records.chunks(self.chunk_size).enumerate() {
            chunks.push(
                self.submit_chunk(store, i + 1, i * self.chunk_size, chunk)
                    .await,
            );
        }
        let report = SyncReport::from_chunks(delete, chunks);
        info!(
            added = report.added_count,
            failed = report.failed_count,
            chunks = report.chunks.len(),
            "synchronization finished"
        );
        report
    }
}

fn item_message(result: &AddItemResult) -> String {
    result
        .error
        .clone()
        .unwrap_or_else(|| "record rejected".to_string())
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub store_token: Option<String>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let workspace_root = lookup("ALERTSYNC_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            artifacts_dir: lookup("ALERTSYNC_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("artifacts")),
            reports_dir: lookup("ALERTSYNC_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("reports")),
            user_agent: lookup("ALERTSYNC_USER_AGENT").unwrap_or_else(|| "alertsync/0.1".to_string()),
            http_timeout_secs: lookup("ALERTSYNC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            store_token: lookup("ALERTSYNC_STORE_TOKEN").filter(|t| !t.trim().is_empty()),
            scheduler_enabled: lookup("ALERTSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: lookup("ALERTSYNC_SYNC_CRON").unwrap_or_else(|| "0 7 * * *".to_string()),
            workspace_root,
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("pipelines.yaml")
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentSource {
    Remote,
    LocalFile(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Nothing to synchronize; the layer was left untouched.
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRunReport {
    pub run_id: Uuid,
    pub pipeline_id: String,
    pub display_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub source: Option<String>,
    pub artifact: Option<String>,
    pub features: usize,
    pub discarded_geometries: usize,
    pub skipped_rows: usize,
    pub assembly: AssemblySummary,
    pub sync: Option<SyncReport>,
    pub error: Option<String>,
}

impl PipelineRunReport {
    fn failed(run_id: Uuid, profile: &PipelineProfile, started_at: DateTime<Utc>, err: &anyhow::Error) -> Self {
        Self {
            run_id,
            pipeline_id: profile.pipeline_id.clone(),
            display_name: profile.display_name.clone(),
            started_at,
            finished_at: Utc::now(),
            status: RunStatus::Failed,
            source: None,
            artifact: None,
            features: 0,
            discarded_geometries: 0,
            skipped_rows: 0,
            assembly: AssemblySummary::default(),
            sync: None,
            error: Some(format!("{err:#}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pipelines: Vec<PipelineRunReport>,
    pub reports_dir: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InspectOutcome {
    pub pipeline_id: String,
    pub features: usize,
    pub discarded_geometries: usize,
    pub skipped_rows: usize,
    pub assembly: AssemblySummary,
    pub records: Vec<CanonicalRecord>,
}

/// Parses a document and assembles its records without contacting the feature store.
pub fn inspect_document(profile: &PipelineProfile, bytes: &[u8], schema: LayerSchema) -> Result<InspectOutcome> {
    let document = adapter_for(&profile.source.document)
        .parse_document(bytes)
        .with_context(|| format!("parsing document for {}", profile.pipeline_id))?;
    let run = RecordAssembler::new(profile, schema).assemble_all(&document.features);
    Ok(InspectOutcome {
        pipeline_id: profile.pipeline_id.clone(),
        features: document.features.len(),
        discarded_geometries: document.discarded_geometries,
        skipped_rows: document.skipped_rows,
        assembly: run.summary,
        records: run.records,
    })
}

pub struct SyncPipeline {
    config: SyncConfig,
    document_cache: DocumentCache,
    http: HttpFetcher,
}

struct LoadedDocument {
    source: String,
    artifact: String,
    document: SourceDocument,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let document_cache = DocumentCache::new(config.artifacts_dir.clone());
        let http = HttpFetcher::new(config.http_config())?;
        Ok(Self {
            config,
            document_cache,
            http,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn load_registry(&self) -> Result<PipelineRegistry> {
        PipelineRegistry::load(&self.config.registry_path()).await
    }

    pub fn feature_store_for(&self, profile: &PipelineProfile) -> Result<FeatureServiceClient> {
        FeatureServiceClient::new(
            profile.layer_url.clone(),
            self.config.store_token.clone(),
            &self.config.http_config(),
        )
        .with_context(|| format!("building feature store client for {}", profile.pipeline_id))
    }

    async fn load_document(
        &self,
        run_id: Uuid,
        profile: &PipelineProfile,
        source: &DocumentSource,
    ) -> Result<LoadedDocument> {
        let (origin, fetched_at, bytes) = match source {
            DocumentSource::LocalFile(path) => (
                path.display().to_string(),
                Utc::now(),
                read_document_file(path)?,
            ),
            DocumentSource::Remote => {
                let template = profile
                    .source
                    .url
                    .as_deref()
                    .with_context(|| format!("pipeline {} has no source url", profile.pipeline_id))?;
                let url = render_source_url(template, Utc::now().date_naive());
                let mut request = FetchRequest::new(url).with_cache_bust(profile.source.cache_bust);
                for (name, value) in &profile.source.headers {
                    request = request.with_header(name.clone(), value.clone());
                }
                let response = self
                    .http
                    .fetch_bytes(run_id, &profile.pipeline_id, &request)
                    .await
                    .with_context(|| format!("fetching {}", request.url))?;
                (response.final_url, response.fetched_at, response.body)
            }
        };

        let cached = self
            .document_cache
            .put(
                DocumentOrigin {
                    pipeline_id: profile.pipeline_id.clone(),
                    location: origin.clone(),
                    format: profile.source.document.extension().to_string(),
                    retrieved_at: fetched_at,
                },
                &bytes,
            )
            .await?;
        debug!(path = %cached.relative_path.display(), reused = cached.reused, "document cached");

        let document = adapter_for(&profile.source.document)
            .parse_document(&bytes)
            .with_context(|| format!("parsing {origin}"))?;
        if document.discarded_geometries > 0 {
            warn!(
                pipeline_id = %profile.pipeline_id,
                discarded = document.discarded_geometries,
                "features with invalid geometry"
            );
        }
        Ok(LoadedDocument {
            source: origin,
            artifact: cached.relative_path.display().to_string(),
            document,
        })
    }

    /// Fetch (or read), cache, parse, assemble and synchronize one pipeline against `store`.
    pub async fn run_pipeline_with_store(
        &self,
        run_id: Uuid,
        profile: &PipelineProfile,
        source: &DocumentSource,
        store: &dyn FeatureStore,
    ) -> Result<PipelineRunReport> {
        let started_at = Utc::now();
        info!(%run_id, pipeline_id = %profile.pipeline_id, "pipeline started");

        let loaded = self.load_document(run_id, profile, source).await?;
        let schema = store
            .schema()
            .await
            .with_context(|| format!("reading layer schema for {}", profile.pipeline_id))?;
        let supports_delete = schema.supports_delete();

        let assembly = RecordAssembler::new(profile, schema).assemble_all(&loaded.document.features);
        info!(
            pipeline_id = %profile.pipeline_id,
            features = assembly.summary.features,
            included = assembly.summary.included,
            "records assembled"
        );

        let (status, sync) = if assembly.records.is_empty() {
            warn!(pipeline_id = %profile.pipeline_id, "no records to synchronize; layer left untouched");
            (RunStatus::Skipped, None)
        } else {
            let mut synchronizer = BatchSynchronizer::from_profile(profile);
            if !supports_delete {
                synchronizer = synchronizer.without_delete();
            }
            let report = synchronizer.synchronize(&assembly.records, store).await;
            (RunStatus::Completed, Some(report))
        };

        let report = PipelineRunReport {
            run_id,
            pipeline_id: profile.pipeline_id.clone(),
            display_name: profile.display_name.clone(),
            started_at,
            finished_at: Utc::now(),
            status,
            source: Some(loaded.source),
            artifact: Some(loaded.artifact),
            features: loaded.document.features.len(),
            discarded_geometries: loaded.document.discarded_geometries,
            skipped_rows: loaded.document.skipped_rows,
            assembly: assembly.summary,
            sync,
            error: None,
        };
        self.write_pipeline_report(&report).await?;
        Ok(report)
    }

    pub async fn run_pipeline(
        &self,
        run_id: Uuid,
        profile: &PipelineProfile,
        source: &DocumentSource,
    ) -> Result<PipelineRunReport> {
        let store = self.feature_store_for(profile)?;
        self.run_pipeline_with_store(run_id, profile, source, &store)
            .await
    }

    /// Runs every enabled pipeline in registry order. A failing pipeline is reported and the
    /// rest still run.
    pub async fn run_all(&self, registry: &PipelineRegistry) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let mut pipelines = Vec::new();

        for profile in registry.enabled() {
            let pipeline_started = Utc::now();
            match self.run_pipeline(run_id, profile, &DocumentSource::Remote).await {
                Ok(report) => pipelines.push(report),
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(pipeline_id = %profile.pipeline_id, error = %message, "pipeline failed");
                    let report = PipelineRunReport::failed(run_id, profile, pipeline_started, &err);
                    self.write_pipeline_report(&report).await?;
                    pipelines.push(report);
                }
            }
        }

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            pipelines,
            reports_dir: self.run_reports_dir(run_id).display().to_string(),
        };
        self.write_summary(&summary).await?;
        Ok(summary)
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let registry = self.load_registry().await?;
        self.run_all(&registry).await
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        build_scheduler(self.config.clone()).await.map(Some)
    }

    fn run_reports_dir(&self, run_id: Uuid) -> PathBuf {
        self.config.reports_dir.join(run_id.to_string())
    }

    async fn write_pipeline_report(&self, report: &PipelineRunReport) -> Result<PathBuf> {
        let dir = self.run_reports_dir(report.run_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(format!("{}.json", report.pipeline_id));
        let json = serde_json::to_vec_pretty(report).context("serializing pipeline report")?;
        fs::write(&path, json)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    async fn write_summary(&self, summary: &SyncRunSummary) -> Result<()> {
        let dir = self.run_reports_dir(summary.run_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(dir.join("summary.json"), json)
            .await
            .context("writing summary.json")
    }
}

pub async fn run_sync_once(config: SyncConfig) -> Result<SyncRunSummary> {
    SyncPipeline::new(config)?.run_once().await
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    run_sync_once(SyncConfig::from_env()).await
}

/// Scheduler that runs every enabled pipeline on `config.sync_cron`. Not started.
pub async fn build_scheduler(config: SyncConfig) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.clone();
    let config = Arc::new(config);
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let config = Arc::clone(&config);
        Box::pin(async move {
            match run_sync_once(config.as_ref().clone()).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    pipelines = summary.pipelines.len(),
                    "scheduled sync finished"
                ),
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(error = %message, "scheduled sync failed");
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Markdown digest of the most recent run summaries under `reports_dir`.
pub fn report_recent_runs(runs: usize, reports_dir: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().join("summary.json").exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Alert Sync Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let summary_path = dir.path().join("summary.json");
        let summary: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;

        lines.push(format!("## Run `{}`", dir.file_name().to_string_lossy()));
        if let Some(started) = summary.get("started_at").and_then(|v| v.as_str()) {
            lines.push(format!("- started: {started}"));
        }
        for pipeline in summary
            .get("pipelines")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
        {
            let id = pipeline.get("pipeline_id").and_then(|v| v.as_str()).unwrap_or("?");
            let status = pipeline.get("status").and_then(|v| v.as_str()).unwrap_or("?");
            let sync = pipeline.get("sync");
            let added = sync.and_then(|s| s.get("added_count")).and_then(|v| v.as_u64()).unwrap_or(0);
            let failed = sync.and_then(|s| s.get("failed_count")).and_then(|v| v.as_u64()).unwrap_or(0);
            let mut line = format!("- {id}: {status}, added {added}, failed {failed}");
            if let Some(err) = pipeline.get("error").and_then(|v| v.as_str()) {
                line.push_str(&format!(" ({err})"));
            }
            lines.push(line);
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alertsync_core::{SinkGeometry, SinkShape, SpatialReference};
    use alertsync_storage::{DeleteOutcome, StoreError};
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture(pipeline_id: &str, file: &str) -> PathBuf {
        workspace_root()
            .join("fixtures")
            .join(pipeline_id)
            .join("sample")
            .join(file)
    }

    fn fixture_schema(pipeline_id: &str) -> LayerSchema {
        let text = std::fs::read_to_string(fixture(pipeline_id, "layer.json")).expect("layer.json");
        serde_json::from_str(&text).expect("layer schema")
    }

    fn registry() -> PipelineRegistry {
        let text = std::fs::read_to_string(workspace_root().join("pipelines.yaml")).expect("pipelines.yaml");
        PipelineRegistry::from_yaml_str(&text).expect("registry")
    }

    fn profile(pipeline_id: &str) -> PipelineProfile {
        registry().get(pipeline_id).cloned().expect("profile")
    }

    fn point_record(i: usize) -> CanonicalRecord {
        CanonicalRecord {
            name: Some(format!("alerta {i}")),
            classification_code: 1,
            attributes: BTreeMap::from([("Name".to_string(), FieldValue::Text(format!("alerta {i}")))]),
            geometry: SinkGeometry {
                shape: SinkShape::Point {
                    x: -75.5 + i as f64 * 0.001,
                    y: 6.2,
                },
                spatial_reference: SpatialReference { wkid: 4326 },
            },
        }
    }

    /// In-memory feature store with injectable failures.
    #[derive(Default)]
    struct ScriptedStore {
        schema: LayerSchema,
        fail_delete: bool,
        transport_failures: BTreeSet<usize>,
        reject_every: Option<usize>,
        /// Answers every add with this many results regardless of the batch size.
        result_count: Option<usize>,
        add_calls: Mutex<Vec<usize>>,
        delete_calls: Mutex<Vec<String>>,
        stored: Mutex<Vec<CanonicalRecord>>,
    }

    #[async_trait]
    impl FeatureStore for ScriptedStore {
        async fn schema(&self) -> Result<LayerSchema, StoreError> {
            Ok(self.schema.clone())
        }

        async fn delete_all(&self, filter: &str) -> Result<DeleteOutcome, StoreError> {
            self.delete_calls.lock().unwrap().push(filter.to_string());
            if self.fail_delete {
                return Err(StoreError::UnexpectedResponse("delete refused".to_string()));
            }
            let mut stored = self.stored.lock().unwrap();
            let deleted_count = stored.len();
            stored.clear();
            Ok(DeleteOutcome { deleted_count })
        }

        async fn add_batch(&self, records: &[CanonicalRecord]) -> Result<Vec<AddItemResult>, StoreError> {
            let call = {
                let mut calls = self.add_calls.lock().unwrap();
                calls.push(records.len());
                calls.len()
            };
            if self.transport_failures.contains(&call) {
                return Err(StoreError::HttpStatus {
                    status: 504,
                    url: "https://example.org/addFeatures".to_string(),
                });
            }
            let mut stored = self.stored.lock().unwrap();
            let mut results: Vec<_> = records
                .iter()
                .enumerate()
                .map(|(i, record)| match self.reject_every {
                    Some(n) if i % n == 0 => AddItemResult::failed("Invalid geometry"),
                    _ => {
                        stored.push(record.clone());
                        AddItemResult::succeeded(Some(stored.len() as i64))
                    }
                })
                .collect();
            if let Some(count) = self.result_count {
                results.resize(count, AddItemResult::succeeded(None));
            }
            Ok(results)
        }
    }

    fn resolver(strategy: ClassificationStrategy, default_code: i64) -> ClassificationResolver {
        ClassificationResolver::new(&ClassificationConfig {
            strategy,
            default_code,
            target_fields: Vec::new(),
            table: BTreeMap::from([
                ("Susc: 1".to_string(), 2),
                ("Susc: 2".to_string(), 1),
                ("Susc: 3".to_string(), 0),
            ]),
        })
    }

    #[test]
    fn trailing_numeral_splits_name_and_code() {
        let resolver = resolver(ClassificationStrategy::TrailingNumeral, 0);

        let c = resolver.resolve(Some("Deslizamiento – 2"));
        assert_eq!(c.display_name.as_deref(), Some("Deslizamiento"));
        assert_eq!(c.code.as_i64(), 2);

        let c = resolver.resolve(Some("  "));
        assert_eq!(c.display_name, None);
        assert_eq!(c.code, ClassCode::Default(0));

        let c = resolver.resolve(None);
        assert_eq!(c.code, ClassCode::Default(0));

        let c = resolver.resolve(Some("3"));
        assert_eq!(c.display_name.as_deref(), Some("3"));
        assert_eq!(c.code.as_i64(), 3);

        let c = resolver.resolve(Some("Sin clasificar"));
        assert_eq!(c.display_name.as_deref(), Some("Sin clasificar"));
        assert!(c.code.is_default());

        let c = resolver.resolve(Some("Nivel: 2.5"));
        assert_eq!(c.display_name.as_deref(), Some("Nivel"));
        assert_eq!(c.code.as_i64(), 2);
        assert_eq!(c.code.raw_value(), RawValue::Text("2.5".to_string()));

        let c = resolver.resolve(Some("Versión 1.2.3"));
        assert_eq!(c.display_name.as_deref(), Some("Versión 1.2.3"));
        assert!(c.code.is_default());
    }

    #[test]
    fn lookup_table_maps_exact_labels_and_falls_back_to_default() {
        let resolver = resolver(ClassificationStrategy::Lookup, -1);
        assert_eq!(resolver.resolve(Some("Susc: 2")).code, ClassCode::Mapped(1));
        assert_eq!(resolver.resolve(Some(" Susc: 1 ")).code.as_i64(), 2);
        assert_eq!(resolver.resolve(Some("Susc: 3")).code.as_i64(), 0);

        let unmapped = resolver.resolve(Some("Susc: 9"));
        assert_eq!(unmapped.code, ClassCode::Default(-1));
        assert_eq!(unmapped.display_name.as_deref(), Some("Susc: 9"));
        assert_eq!(resolver.resolve(Some("")).display_name, None);
    }

    fn pair(label: &str, value: &str) -> EmbeddedPair {
        EmbeddedPair {
            label: label.to_string(),
            key: clean_key(label),
            value: value.to_string(),
        }
    }

    #[test]
    fn normalizer_routes_repeated_area_label_by_position() {
        let profile = profile("mass-movements");
        let normalizer = SchemaNormalizer::new(&profile.field_mapping, &profile.positional_labels);

        assert_eq!(normalizer.normalize("Municipio"), Some("Municipio"));
        assert_eq!(normalizer.normalize("Acu_90_7"), Some("Acu_90_7"));
        assert_eq!(normalizer.normalize("Acu 7"), Some("Acu_7"));
        assert_eq!(normalizer.normalize("Temperatura"), None);

        let out = normalizer.normalize_embedded(&[
            pair("Municipio", "Medellín"),
            pair("Área", "Urbana"),
            pair("Barrio", "Primero"),
            pair("Área", "12,5"),
            pair("Área", "sobrante"),
            pair("Barrio", "Segundo"),
            pair("Desconocido", "x"),
        ]);
        assert_eq!(out.get("Area_Texto"), Some(&RawValue::Text("Urbana".into())));
        assert_eq!(out.get("Area_Numerica"), Some(&RawValue::Text("12,5".into())));
        assert_eq!(out.get("Barrio"), Some(&RawValue::Text("Segundo".into())));
        assert_eq!(out.len(), 4);
    }

    fn uninformative_profile() -> PipelineProfile {
        let mut profile = profile("mass-movements");
        profile.description_column = None;
        profile.field_mapping = BTreeMap::from([("municipio".to_string(), "Municipio".to_string())]);
        profile
    }

    fn square_feature() -> SourceFeature {
        SourceFeature::new(Some(alertsync_core::RawGeometry::Polygon(alertsync_core::Polygon::new(
            vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]],
            Vec::new(),
        ))))
    }

    #[test]
    fn uninformative_features_are_excluded() {
        let assembler = RecordAssembler::new(&uninformative_profile(), fixture_schema("mass-movements"));

        let empty = square_feature()
            .with_column("Name", RawValue::Null)
            .with_column("municipio", RawValue::Null);
        assert_eq!(
            assembler.assemble(&empty),
            AssemblyOutcome::Excluded(ExclusionReason::Uninformative)
        );

        let informative = square_feature()
            .with_column("Name", RawValue::Null)
            .with_column("municipio", RawValue::text("Bello"));
        let AssemblyOutcome::Included(assembled) = assembler.assemble(&informative) else {
            panic!("feature with an attribute must be included");
        };
        assert_eq!(assembled.record.name, None);
        assert_eq!(assembled.record.classification_code, 0);
        assert_eq!(
            assembled.record.attributes.get("Municipio"),
            Some(&FieldValue::Text("Bello".into()))
        );
        assert_eq!(assembled.record.attributes.get("SymbolID"), Some(&FieldValue::Integer(0)));
        assert_eq!(assembled.record.attributes.get("Name"), Some(&FieldValue::Null));

        let named = square_feature().with_column("Name", RawValue::text("Deslizamiento"));
        assert!(matches!(assembler.assemble(&named), AssemblyOutcome::Included(_)));

        assert_eq!(
            assembler.assemble(&SourceFeature::new(None).with_column("municipio", RawValue::text("Bello"))),
            AssemblyOutcome::Excluded(ExclusionReason::MissingGeometry)
        );
    }

    #[test]
    fn invalid_geometry_is_excluded_and_counted() {
        let assembler = RecordAssembler::new(&uninformative_profile(), fixture_schema("mass-movements"));
        let open_ring = SourceFeature::new(Some(alertsync_core::RawGeometry::Polygon(
            alertsync_core::Polygon::new(vec![[0.0, 0.0], [1.0, 0.0], [0.0, 0.0]], Vec::new()),
        )))
        .with_column("Name", RawValue::text("Deslizamiento – 2"))
        .with_column("municipio", RawValue::text("Bello"));

        assert!(matches!(
            assembler.assemble(&open_ring),
            AssemblyOutcome::Excluded(ExclusionReason::InvalidGeometry(_))
        ));

        let named = square_feature().with_column("Name", RawValue::text("Flujo – 1"));
        let run = assembler.assemble_all(&[open_ring, named]);
        assert_eq!(run.summary.included, 1);
        assert_eq!(run.summary.excluded.get("invalid_geometry"), Some(&1));
    }

    #[test]
    fn stricter_inclusion_filters_are_opt_in() {
        let mut profile = uninformative_profile();
        profile.inclusion = InclusionPolicy {
            require_label: true,
            require_mapped_attributes: true,
        };
        let assembler = RecordAssembler::new(&profile, fixture_schema("mass-movements"));

        let unlabeled = square_feature().with_column("municipio", RawValue::text("Bello"));
        assert_eq!(
            assembler.assemble(&unlabeled),
            AssemblyOutcome::Excluded(ExclusionReason::MissingLabel)
        );
        let bare = square_feature().with_column("Name", RawValue::text("Flujo – 1"));
        assert_eq!(
            assembler.assemble(&bare),
            AssemblyOutcome::Excluded(ExclusionReason::NoMappedAttributes)
        );
    }

    #[test]
    fn native_columns_win_and_bad_values_become_null() {
        let mut profile = profile("mass-movements");
        profile
            .field_mapping
            .insert("Municipio".to_string(), "Municipio".to_string());
        let assembler = RecordAssembler::new(&profile, fixture_schema("mass-movements"));

        let html = "<table><tr><td>Municipio</td><td>Bello</td></tr>\
                    <tr><td>Vereda</td><td>Granizal</td></tr>\
                    <tr><td>Área</td><td>Rural</td></tr>\
                    <tr><td>Área</td><td>n/a</td></tr></table>";
        let feature = square_feature()
            .with_column("Name", RawValue::text("Flujo de lodo – 1"))
            .with_column("Description", RawValue::text(html))
            .with_column("Municipio", RawValue::text("Copacabana"));

        let AssemblyOutcome::Included(assembled) = assembler.assemble(&feature) else {
            panic!("expected record");
        };
        let attrs = &assembled.record.attributes;
        assert_eq!(attrs.get("Municipio"), Some(&FieldValue::Text("Copacabana".into())));
        assert_eq!(attrs.get("Vereda"), Some(&FieldValue::Text("Granizal".into())));
        assert_eq!(attrs.get("Area_Texto"), Some(&FieldValue::Text("Rural".into())));
        assert_eq!(attrs.get("Area_Numerica"), Some(&FieldValue::Null));
        assert_eq!(attrs.get("categoria"), Some(&FieldValue::Text("1".into())));
        assert_eq!(attrs.get("Name"), Some(&FieldValue::Text("Flujo de lodo".into())));
        assert!(!attrs.contains_key("Description"));
        assert_eq!(assembled.coercion_failures.len(), 1);
    }

    #[tokio::test]
    async fn chunked_adds_cover_every_record_once() {
        let records: Vec<_> = (0..250).map(point_record).collect();
        let store = ScriptedStore {
            reject_every: Some(7),
            ..ScriptedStore::default()
        };
        let report = BatchSynchronizer::new(100, "1=1")
            .synchronize(&records, &store)
            .await;

        assert_eq!(*store.add_calls.lock().unwrap(), vec![100, 100, 50]);
        assert_eq!(*store.delete_calls.lock().unwrap(), vec!["1=1".to_string()]);
        assert_eq!(report.added_count + report.failed_count, 250);
        assert_eq!(report.failed_count, 15 + 15 + 8);
        assert_eq!(report.errors.len(), report.failed_count);
        assert_eq!(report.errors[0].index, 0);
        assert_eq!(report.errors[15].index, 100);
        assert_eq!(report.errors[15].batch, 2);
        assert_eq!(report.delete, DeletePhase::Deleted { deleted_count: 0 });
    }

    #[tokio::test]
    async fn transport_failure_fails_whole_chunk_and_later_chunks_still_run() {
        let records: Vec<_> = (0..250).map(point_record).collect();
        let store = ScriptedStore {
            fail_delete: true,
            transport_failures: BTreeSet::from([2]),
            ..ScriptedStore::default()
        };
        let report = BatchSynchronizer::new(100, "1=1")
            .synchronize(&records, &store)
            .await;

        assert_eq!(store.add_calls.lock().unwrap().len(), 3);
        assert_eq!(report.added_count, 150);
        assert_eq!(report.failed_count, 100);
        assert!(matches!(report.delete, DeletePhase::Failed { .. }));
        assert!(report.chunks[1].transport_error.is_some());
        assert_eq!(report.chunks[2].added, 50);
        assert!(report.errors.iter().all(|e| e.batch == 2));
        assert_eq!(report.errors.first().map(|e| e.index), Some(100));
        assert_eq!(report.errors.last().map(|e| e.index), Some(199));
    }

    #[tokio::test]
    async fn short_result_lists_count_missing_records_as_failed() {
        let records: Vec<_> = (0..3).map(point_record).collect();
        let store = ScriptedStore {
            result_count: Some(1),
            ..ScriptedStore::default()
        };
        let report = BatchSynchronizer::new(100, "1=1")
            .synchronize(&records, &store)
            .await;

        assert_eq!(report.added_count, 1);
        assert_eq!(report.failed_count, 2);
        assert_eq!(report.errors.len(), 2);
        assert_eq!(
            report.errors.iter().map(|e| e.index).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(report.errors.iter().all(|e| e.message == "no result returned"));
    }

    #[tokio::test]
    async fn extra_results_beyond_the_batch_are_ignored() {
        let records: Vec<_> = (0..3).map(point_record).collect();
        let store = ScriptedStore {
            result_count: Some(5),
            ..ScriptedStore::default()
        };
        let report = BatchSynchronizer::new(100, "1=1")
            .synchronize(&records, &store)
            .await;

        assert_eq!(report.added_count, 3);
        assert_eq!(report.failed_count, 0);
        assert_eq!(report.submitted(), records.len());
        assert_eq!(report.chunks[0].added, 3);
    }

    #[tokio::test]
    async fn delete_can_be_skipped_and_empty_input_issues_no_adds() {
        let store = ScriptedStore::default();
        let report = BatchSynchronizer::new(100, "1=1")
            .without_delete()
            .synchronize(&[], &store)
            .await;
        assert_eq!(report.delete, DeletePhase::Skipped);
        assert!(store.delete_calls.lock().unwrap().is_empty());
        assert!(store.add_calls.lock().unwrap().is_empty());
        assert_eq!(report.submitted(), 0);
    }

    #[test]
    fn registry_loads_workspace_pipelines() {
        let registry = registry();
        let ids: Vec<_> = registry.pipelines.iter().map(|p| p.pipeline_id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["mass-movements", "fire-susceptibility", "operational", "station-increases"]
        );
        assert_eq!(registry.enabled().count(), 2);

        let mass = registry.get("mass-movements").expect("mass-movements");
        assert_eq!(mass.chunk_size, 100);
        assert_eq!(mass.delete_filter, "1=1");
        assert_eq!(mass.positional_labels[0].fields, vec!["Area_Texto", "Area_Numerica"]);

        let fire = registry.get("fire-susceptibility").expect("fire");
        assert_eq!(fire.classification.strategy, ClassificationStrategy::Lookup);
        assert_eq!(fire.classification.default_code, -1);
        assert!(fire.source.cache_bust);

        let operational = registry.get("operational").expect("operational");
        assert!(matches!(operational.source.document, DocumentSpec::Csv(ref o) if o.skip_rows == 4));

        let increases = registry.get("station-increases").expect("station-increases");
        assert!(!increases.enabled);
        let DocumentSpec::Csv(options) = &increases.source.document else {
            panic!("station increases are a csv table");
        };
        assert_eq!(options.skip_rows, 0);
        assert_eq!(options.max_empty_cells, None);
        let merge = options.datetime_merge.as_ref().expect("date/time merge");
        assert!(merge.drop_time_column);
        assert_eq!(merge.utc_offset_hours, -5);
        assert_eq!(
            increases.field_mapping.get("Código Estación").map(String::as_str),
            Some("Código_Estación")
        );

        let dup = "pipelines:\n  - {pipeline_id: a, display_name: A, layer_url: x, source: {document: {format: kml}}}\n  - {pipeline_id: a, display_name: B, layer_url: y, source: {document: {format: kml}}}\n";
        assert!(PipelineRegistry::from_yaml_str(dup).is_err());
    }

    #[test]
    fn source_url_templates_use_run_date() {
        let date = NaiveDate::from_ymd_opt(2025, 5, 19).expect("date");
        assert_eq!(
            render_source_url(
                "https://siata.gov.co/geotecnia/COE_{year}/modelos/{yyyymmdd}/AM/alertas_7d_{yyyy_mm_dd}.kml",
                date
            ),
            "https://siata.gov.co/geotecnia/COE_2025/modelos/20250519/AM/alertas_7d_2025-05-19.kml"
        );
    }

    #[test]
    fn config_defaults_and_overrides() {
        let config = SyncConfig::from_lookup(|_| None);
        assert_eq!(config.artifacts_dir, PathBuf::from("./artifacts"));
        assert_eq!(config.http_timeout_secs, 60);
        assert_eq!(config.sync_cron, "0 7 * * *");
        assert!(!config.scheduler_enabled);
        assert_eq!(config.store_token, None);

        let env = BTreeMap::from([
            ("ALERTSYNC_WORKSPACE_ROOT", "/srv/alertsync"),
            ("ALERTSYNC_HTTP_TIMEOUT_SECS", "15"),
            ("ALERTSYNC_SCHEDULER_ENABLED", "true"),
            ("ALERTSYNC_STORE_TOKEN", "abc"),
        ]);
        let config = SyncConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.reports_dir, PathBuf::from("/srv/alertsync/reports"));
        assert_eq!(config.registry_path(), PathBuf::from("/srv/alertsync/pipelines.yaml"));
        assert_eq!(config.http_timeout_secs, 15);
        assert!(config.scheduler_enabled);
        assert_eq!(config.store_token.as_deref(), Some("abc"));
    }

    fn pipeline_in(dir: &Path) -> SyncPipeline {
        SyncPipeline::new(SyncConfig::from_lookup(|k| match k {
            "ALERTSYNC_WORKSPACE_ROOT" => Some(dir.display().to_string()),
            _ => None,
        }))
        .expect("pipeline")
    }

    #[tokio::test]
    async fn mass_movements_fixture_runs_end_to_end() {
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline_in(dir.path());
        let store = ScriptedStore {
            schema: fixture_schema("mass-movements"),
            ..ScriptedStore::default()
        };
        let run_id = Uuid::new_v4();
        let report = pipeline
            .run_pipeline_with_store(
                run_id,
                &profile("mass-movements"),
                &DocumentSource::LocalFile(fixture("mass-movements", "alertas.kml")),
                &store,
            )
            .await
            .expect("run");

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.features, 4);
        assert_eq!(report.discarded_geometries, 1);
        assert_eq!(report.assembly.included, 2);
        assert_eq!(report.assembly.excluded.get("missing_geometry"), Some(&1));
        assert_eq!(report.assembly.excluded.get("uninformative"), Some(&1));
        let sync = report.sync.as_ref().expect("sync report");
        assert_eq!(sync.added_count, 2);
        assert_eq!(*store.add_calls.lock().unwrap(), vec![2]);

        let stored = store.stored.lock().unwrap();
        let first = &stored[0];
        assert_eq!(first.name.as_deref(), Some("Deslizamiento"));
        assert_eq!(first.classification_code, 2);
        assert_eq!(first.geometry.ring_count(), 2);
        let attrs = &first.attributes;
        assert_eq!(attrs.get("SymbolID"), Some(&FieldValue::Integer(2)));
        assert_eq!(attrs.get("categoria"), Some(&FieldValue::Text("2".into())));
        assert_eq!(attrs.get("Municipio"), Some(&FieldValue::Text("Medellín".into())));
        assert_eq!(attrs.get("Area_Texto"), Some(&FieldValue::Text("Urbana".into())));
        assert_eq!(attrs.get("Area_Numerica"), Some(&FieldValue::Float(12.5)));
        assert_eq!(attrs.get("Vereda"), Some(&FieldValue::Null));
        assert_eq!(attrs.get("Acu_90_7"), Some(&FieldValue::Float(410.75)));

        let second = &stored[1];
        assert_eq!(second.name.as_deref(), Some("Flujo de lodo"));
        assert_eq!(second.attributes.get("Vereda"), Some(&FieldValue::Text("Granizal".into())));
        assert_eq!(second.geometry.ring_count(), 2);

        let report_path = dir
            .path()
            .join("reports")
            .join(run_id.to_string())
            .join("mass-movements.json");
        assert!(report_path.exists());
        let artifacts: Vec<_> = std::fs::read_dir(dir.path().join("artifacts"))
            .expect("artifacts dir")
            .collect();
        assert_eq!(artifacts.len(), 1);
    }

    #[tokio::test]
    async fn fire_susceptibility_uses_lookup_codes() {
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline_in(dir.path());
        let store = ScriptedStore {
            schema: fixture_schema("fire-susceptibility"),
            ..ScriptedStore::default()
        };
        let report = pipeline
            .run_pipeline_with_store(
                Uuid::new_v4(),
                &profile("fire-susceptibility"),
                &DocumentSource::LocalFile(fixture("fire-susceptibility", "susceptibilidad.kml")),
                &store,
            )
            .await
            .expect("run");

        assert_eq!(report.assembly.included, 4);
        let stored = store.stored.lock().unwrap();
        let codes: Vec<_> = stored
            .iter()
            .map(|r| r.attributes.get("SymbolID").cloned())
            .collect();
        assert_eq!(
            codes,
            vec![
                Some(FieldValue::Integer(2)),
                Some(FieldValue::Integer(1)),
                Some(FieldValue::Integer(0)),
                Some(FieldValue::Integer(-1)),
            ]
        );
        assert_eq!(stored[3].attributes.get("Name"), Some(&FieldValue::Text("Sin evaluar".into())));
        assert_eq!(stored[0].attributes.get("Zona"), Some(&FieldValue::Text("Norte".into())));
    }

    #[test]
    fn operational_table_inspects_without_store() {
        let profile = profile("operational");
        let bytes = read_document_file(fixture("operational", "alertas.csv")).expect("csv");
        let outcome = inspect_document(&profile, &bytes, fixture_schema("operational")).expect("inspect");

        assert_eq!(outcome.features, 3);
        assert_eq!(outcome.skipped_rows, 1);
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.assembly.excluded.get("missing_geometry"), Some(&1));

        let first = &outcome.records[0].attributes;
        let expected = DateTime::parse_from_rfc3339("2025-05-19T19:30:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        assert_eq!(first.get("fecha"), Some(&FieldValue::Timestamp(expected)));
        assert_eq!(first.get("descripcion"), Some(&FieldValue::Text("Movimiento en masa e".into())));
        assert_eq!(first.get("fenomeno"), Some(&FieldValue::Text("Deslizamiento".into())));
        assert!(!first.contains_key("Hora (00:00)"));

        let second = &outcome.records[1].attributes;
        assert_eq!(second.get("fecha"), Some(&FieldValue::Null));
        assert_eq!(second.get("observaciones"), Some(&FieldValue::Null));
    }

    #[tokio::test]
    async fn empty_assembly_skips_synchronization() {
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline_in(dir.path());
        let kml = dir.path().join("vacio.kml");
        std::fs::write(
            &kml,
            "<kml><Document><Placemark><name></name><Point><coordinates>-75.5,6.2</coordinates></Point></Placemark></Document></kml>",
        )
        .expect("write kml");
        let store = ScriptedStore {
            schema: fixture_schema("mass-movements"),
            ..ScriptedStore::default()
        };
        let report = pipeline
            .run_pipeline_with_store(
                Uuid::new_v4(),
                &profile("mass-movements"),
                &DocumentSource::LocalFile(kml),
                &store,
            )
            .await
            .expect("run");
        assert_eq!(report.status, RunStatus::Skipped);
        assert!(report.sync.is_none());
        assert!(store.delete_calls.lock().unwrap().is_empty());
    }

    #[test]
    fn recent_runs_report_lists_pipeline_outcomes() {
        let dir = tempdir().expect("tempdir");
        let run_dir = dir.path().join("run-1");
        std::fs::create_dir_all(&run_dir).expect("mkdir");
        std::fs::write(
            run_dir.join("summary.json"),
            serde_json::json!({
                "started_at": "2025-05-19T12:00:00Z",
                "pipelines": [
                    {"pipeline_id": "mass-movements", "status": "completed", "sync": {"added_count": 40, "failed_count": 2}},
                    {"pipeline_id": "fire-susceptibility", "status": "failed", "sync": null, "error": "fetching: http status 404"}
                ]
            })
            .to_string(),
        )
        .expect("write summary");

        let markdown = report_recent_runs(5, dir.path()).expect("report");
        assert!(markdown.contains("## Run `run-1`"));
        assert!(markdown.contains("- mass-movements: completed, added 40, failed 2"));
        assert!(markdown.contains("- fire-susceptibility: failed, added 0, failed 0 (fetching: http status 404)"));
    }
}
