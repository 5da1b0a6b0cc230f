//! Incremental review sync: dedup key selection, merging, and the per-source
//! sync cycle that ties fetching, merging and watermarks together.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Days, NaiveDate, Utc};
use parquet::arrow::ArrowWriter;
use revsync_adapters::{
    CommandFetcher, FetchError, FetchRequest, IdentityError, ResolvedSource, ReviewFetcher,
    SourceIdentity,
};
use revsync_core::{
    DatasetSchema, FetchParams, MergeResult, ReviewColumn, ReviewRecord, ScrapeWatermark,
    SourceKey,
};
use revsync_normalize::{canonicalize_review, resolve_review_date};
use revsync_storage::{
    read_dataset, sha256_hex, write_atomic, write_dataset, DatasetError, JsonFileWatermarkStore,
    RawDataset, StorageError, WatermarkStore,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "revsync-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    /// Relative paths resolve against `data_dir`.
    pub state_file: PathBuf,
    pub fetch_program: String,
    pub project_dir: Option<PathBuf>,
    pub overlap_days: u64,
    pub max_reviews: Option<usize>,
    pub parquet_snapshots: bool,
    pub log_level: String,
    pub workspace_root: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("scraped_data"),
            state_file: PathBuf::from("scraper_state.json"),
            fetch_program: "scrapy".to_string(),
            project_dir: None,
            overlap_days: 1,
            max_reviews: None,
            parquet_snapshots: false,
            log_level: "info".to_string(),
            workspace_root: PathBuf::from("."),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("REVSYNC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            state_file: std::env::var("REVSYNC_STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_file),
            fetch_program: std::env::var("REVSYNC_FETCH_PROGRAM")
                .unwrap_or(defaults.fetch_program),
            project_dir: std::env::var("REVSYNC_PROJECT_DIR").ok().map(PathBuf::from),
            overlap_days: std::env::var("REVSYNC_OVERLAP_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.overlap_days),
            max_reviews: std::env::var("REVSYNC_MAX_REVIEWS")
                .ok()
                .and_then(|v| v.parse().ok()),
            parquet_snapshots: std::env::var("REVSYNC_PARQUET_SNAPSHOTS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.parquet_snapshots),
            log_level: std::env::var("REVSYNC_LOG").unwrap_or(defaults.log_level),
            workspace_root: std::env::var("REVSYNC_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
        }
    }

    pub fn state_path(&self) -> PathBuf {
        if self.state_file.is_absolute() {
            self.state_file.clone()
        } else {
            self.data_dir.join(&self.state_file)
        }
    }

    /// Canonical dataset location for a source.
    pub fn output_path(&self, key: &SourceKey) -> PathBuf {
        self.data_dir.join(format!("{key}_reviews.csv"))
    }

    /// Where the fetch collaborator writes one cycle's output.
    pub fn fetch_artifact_path(&self, key: &SourceKey) -> PathBuf {
        self.data_dir.join(format!("{key}_new_reviews.csv"))
    }

    pub fn snapshot_dir(&self, key: &SourceKey) -> PathBuf {
        self.data_dir.join("snapshots").join(key.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    InvalidSource(#[from] IdentityError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("merge input unreadable: {0}")]
    MergeIo(#[source] DatasetError),
    #[error("dataset not persisted, state untouched: {0}")]
    Persist(#[source] DatasetError),
    #[error(transparent)]
    State(#[from] StorageError),
    #[error("preparing {}: {source}", path.display())]
    Workspace { path: PathBuf, source: io::Error },
}

impl SyncError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSource(_) => "invalid_source",
            Self::Fetch(_) => "fetch",
            Self::MergeIo(_) => "merge_io",
            Self::Persist(_) => "persist",
            Self::State(_) => "state",
            Self::Workspace { .. } => "workspace",
        }
    }
}

/// Conditions a cycle recovered from. They are reported, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncWarning {
    /// The state file was unreadable and the cycle ran as a first sync.
    StateCorrupt { detail: String },
    /// No reliable dedup key; new records were appended without deduplication.
    DegradedDedup { new_count: usize },
    /// Dataset written but the watermark was not; the next cycle re-requests
    /// an overlapping window that the merge absorbs.
    PersistencePartial { detail: String },
    /// Records already in the existing dataset that share a dedup key.
    ExistingDuplicates { count: usize },
}

impl fmt::Display for SyncWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateCorrupt { detail } => {
                write!(f, "state file unreadable, ran as first sync: {detail}")
            }
            Self::DegradedDedup { new_count } => write!(
                f,
                "no reliable dedup key; appended {new_count} records without deduplication"
            ),
            Self::PersistencePartial { detail } => {
                write!(f, "dataset written but watermark not saved: {detail}")
            }
            Self::ExistingDuplicates { count } => {
                write!(f, "{count} existing records share a dedup key and were kept")
            }
        }
    }
}

/// Canonical records plus the columns their dataset carried.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReviewSet {
    pub schema: DatasetSchema,
    pub extra_columns: Vec<String>,
    pub records: Vec<ReviewRecord>,
}

impl ReviewSet {
    /// Canonicalize every raw row.
    pub fn from_raw(raw: RawDataset) -> Self {
        Self {
            records: raw.rows.iter().map(canonicalize_review).collect(),
            schema: raw.schema,
            extra_columns: raw.extra_columns,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Columns written for this set. `canonical_text` is always derived, so
    /// it is always written.
    pub fn output_schema(&self) -> DatasetSchema {
        let mut schema = self.schema.clone();
        schema.insert(ReviewColumn::CanonicalText);
        schema
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStrategy {
    /// Source-provided review id on every record.
    ReviewId,
    /// Normalized reviewer name joined with the review date.
    ReviewerAndDate,
    /// No reliable key; union without removal.
    Degraded,
}

impl fmt::Display for DedupStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReviewId => "review_id",
            Self::ReviewerAndDate => "reviewer_and_date",
            Self::Degraded => "degraded",
        })
    }
}

/// Pick the dedup strategy for merging `new` into `existing`.
///
/// Only the shared schema and id coverage matter, so the choice is
/// deterministic for the same two inputs. A set with no records imposes no
/// column constraint.
pub fn select_strategy(existing: &ReviewSet, new: &ReviewSet) -> DedupStrategy {
    let shared = match (existing.is_empty(), new.is_empty()) {
        (false, false) => existing.schema.intersection(&new.schema),
        (false, true) => existing.schema.clone(),
        (true, false) => new.schema.clone(),
        (true, true) => existing.schema.intersection(&new.schema),
    };

    let every_record_has_id = existing
        .records
        .iter()
        .chain(&new.records)
        .all(|r| r.review_id.is_some());
    if shared.contains(ReviewColumn::ReviewId) && every_record_has_id {
        return DedupStrategy::ReviewId;
    }
    if shared.contains(ReviewColumn::ReviewerName) && shared.contains(ReviewColumn::ReviewDate) {
        return DedupStrategy::ReviewerAndDate;
    }
    DedupStrategy::Degraded
}

pub fn normalize_key_fragment(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Separator for composite keys; cannot appear in a normalized fragment.
const KEY_SEPARATOR: char = '\u{1f}';

/// Dedup key of one record under `strategy`. Records without a key are
/// always kept.
pub fn dedup_key(record: &ReviewRecord, strategy: DedupStrategy) -> Option<String> {
    match strategy {
        DedupStrategy::ReviewId => record.review_id.as_ref().map(ToString::to_string),
        DedupStrategy::ReviewerAndDate => {
            let reviewer = normalize_key_fragment(record.reviewer_name.as_deref()?);
            let date_text = record.review_date.as_deref()?;
            let date = match resolve_review_date(date_text) {
                Some(date) => date.format("%Y-%m-%d").to_string(),
                None => normalize_key_fragment(date_text),
            };
            if reviewer.is_empty() || date.is_empty() {
                return None;
            }
            Some(format!("{reviewer}{KEY_SEPARATOR}{date}"))
        }
        DedupStrategy::Degraded => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub set: ReviewSet,
    pub result: MergeResult,
    pub strategy: DedupStrategy,
    pub existing_duplicates: usize,
}

impl MergeOutcome {
    pub fn warnings(&self) -> Vec<SyncWarning> {
        let mut warnings = Vec::new();
        if self.strategy == DedupStrategy::Degraded && self.result.new_count > 0 {
            warnings.push(SyncWarning::DegradedDedup {
                new_count: self.result.new_count,
            });
        }
        if self.existing_duplicates > 0 {
            warnings.push(SyncWarning::ExistingDuplicates {
                count: self.existing_duplicates,
            });
        }
        warnings
    }
}

/// Unions an existing and a new record set. Existing records always win a key
/// collision and are never removed.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeEngine;

impl MergeEngine {
    pub fn merge(&self, existing: ReviewSet, new: ReviewSet) -> MergeOutcome {
        let strategy = select_strategy(&existing, &new);
        let existing_count = existing.len();
        let new_count = new.len();

        let schema = existing.schema.union(&new.schema);
        let mut extra_columns = existing.extra_columns;
        for column in new.extra_columns {
            if !extra_columns.contains(&column) {
                extra_columns.push(column);
            }
        }

        let mut seen = HashSet::new();
        let mut records = Vec::with_capacity(existing_count + new_count);
        let mut existing_duplicates = 0;
        for record in existing.records {
            if let Some(key) = dedup_key(&record, strategy) {
                if !seen.insert(key) {
                    existing_duplicates += 1;
                }
            }
            records.push(record);
        }

        let mut new_added_count = 0;
        for record in new.records {
            if let Some(key) = dedup_key(&record, strategy) {
                if !seen.insert(key) {
                    continue;
                }
            }
            records.push(record);
            new_added_count += 1;
        }

        let result = MergeResult {
            existing_count,
            new_count,
            merged_count: records.len(),
            new_added_count,
        };
        debug_assert!(result.is_consistent());

        MergeOutcome {
            set: ReviewSet {
                schema,
                extra_columns,
                records,
            },
            result,
            strategy,
            existing_duplicates,
        }
    }
}

/// Incremental bounds for the next fetch: the watermark date backed off by
/// `overlap_days`, and the watermark id. No watermark means a full fetch.
pub fn fetch_params_for(watermark: Option<&ScrapeWatermark>, overlap_days: u64) -> FetchParams {
    let Some(watermark) = watermark else {
        return FetchParams::default();
    };
    FetchParams {
        since_date: watermark
            .latest_date
            .map(|d| d.checked_sub_days(Days::new(overlap_days)).unwrap_or(d)),
        since_id: watermark.review_id.clone(),
    }
}

/// Watermark for a merged set. The latest resolvable review date wins (first
/// occurrence on ties) and supplies the id. Without any dates the id comes
/// from the first record carrying one.
pub fn derive_watermark(set: &ReviewSet, url: &str, now: DateTime<Utc>) -> ScrapeWatermark {
    let mut latest: Option<(NaiveDate, &ReviewRecord)> = None;
    for record in &set.records {
        let Some(date) = record.review_date.as_deref().and_then(resolve_review_date) else {
            continue;
        };
        if latest.map_or(true, |(best, _)| date > best) {
            latest = Some((date, record));
        }
    }

    let (latest_date, review_id) = match latest {
        Some((date, record)) => (Some(date), record.review_id.clone()),
        None => (
            None,
            set.records.iter().find_map(|r| r.review_id.clone()),
        ),
    };

    ScrapeWatermark {
        latest_date,
        review_id,
        total_reviews: set.len(),
        last_scrape_time: now,
        last_scrape_url: url.to_string(),
    }
}

/// Shape of one fetched batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestSummary {
    pub fetched: usize,
    pub average_rating: Option<f64>,
    pub rating_distribution: BTreeMap<u8, usize>,
    pub distinct_pages: usize,
}

pub fn summarize_ingest(records: &[ReviewRecord]) -> IngestSummary {
    let ratings: Vec<f64> = records.iter().filter_map(|r| r.rating).collect();
    let average_rating = if ratings.is_empty() {
        None
    } else {
        let mean = ratings.iter().sum::<f64>() / ratings.len() as f64;
        Some((mean * 100.0).round() / 100.0)
    };

    let mut rating_distribution = BTreeMap::new();
    for rating in &ratings {
        *rating_distribution.entry(rating.round() as u8).or_insert(0) += 1;
    }

    let distinct_pages = records
        .iter()
        .filter_map(|r| r.page_number)
        .collect::<HashSet<_>>()
        .len();

    IngestSummary {
        fetched: records.len(),
        average_rating,
        rating_distribution,
        distinct_pages,
    }
}

/// Phases of one sync cycle, in order. `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    ParamsComputed,
    Fetched,
    Merged,
    Persisted,
    Failed,
}

/// Per-invocation overrides of configuration and identity-derived defaults.
#[derive(Debug, Clone, Default)]
pub struct SyncOverrides {
    pub output: Option<PathBuf>,
    pub spider: Option<String>,
    pub max_reviews: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub source_key: SourceKey,
    pub url: String,
    pub spider: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub params: FetchParams,
    pub merge: MergeResult,
    pub strategy: DedupStrategy,
    pub ingest: IngestSummary,
    pub warnings: Vec<SyncWarning>,
    pub output_path: PathBuf,
    pub watermark: ScrapeWatermark,
    /// False when the watermark write failed or an empty first sync had
    /// nothing to record.
    pub watermark_saved: bool,
    pub snapshot_manifest: Option<PathBuf>,
    pub phases: Vec<SyncPhase>,
}

struct Cycle {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    url: String,
    source: ResolvedSource,
    spider: String,
    params: FetchParams,
    max_reviews: Option<usize>,
    artifact_path: PathBuf,
    output_path: PathBuf,
    phases: Vec<SyncPhase>,
    warnings: Vec<SyncWarning>,
}

impl Cycle {
    fn enter(&mut self, phase: SyncPhase) {
        debug!(source_key = %self.source.key, ?phase, "sync phase");
        self.phases.push(phase);
    }
}

/// Runs sync cycles for individual sources.
///
/// Cycles for the same source must not overlap, and cycles sharing a state
/// file must be serialized by the caller; neither is enforced here.
pub struct SyncPipeline {
    config: SyncConfig,
    identity: SourceIdentity,
    fetcher: Box<dyn ReviewFetcher>,
    watermarks: Box<dyn WatermarkStore>,
    merge: MergeEngine,
}

impl SyncPipeline {
    /// Pipeline with the command fetcher and the JSON state file from `config`.
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        let watermarks = JsonFileWatermarkStore::load(config.state_path())?;
        let fetcher = CommandFetcher::new(config.fetch_program.clone())
            .with_project_dir(config.project_dir.clone());
        Ok(Self {
            config,
            identity: SourceIdentity::new(),
            fetcher: Box::new(fetcher),
            watermarks: Box::new(watermarks),
            merge: MergeEngine,
        })
    }

    pub fn with_fetcher(mut self, fetcher: Box<dyn ReviewFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_watermark_store(mut self, watermarks: Box<dyn WatermarkStore>) -> Self {
        self.watermarks = watermarks;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn identity(&self) -> &SourceIdentity {
        &self.identity
    }

    pub fn watermarks(&self) -> &dyn WatermarkStore {
        self.watermarks.as_ref()
    }

    /// Forget the watermark for `url`, forcing a full fetch next cycle.
    pub fn reset(&mut self, url: &str) -> Result<bool, SyncError> {
        let key = self.identity.key_for(url)?;
        let removed = self.watermarks.remove(&key)?;
        info!(source_key = %key, removed, "watermark reset");
        Ok(removed)
    }

    /// One full cycle for `url`: compute params, fetch, merge, persist.
    pub async fn run_once(
        &mut self,
        url: &str,
        overrides: &SyncOverrides,
    ) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_cycle", %run_id, url);
        self.run_cycle(run_id, url, overrides).instrument(span).await
    }

    async fn run_cycle(
        &mut self,
        run_id: Uuid,
        url: &str,
        overrides: &SyncOverrides,
    ) -> Result<SyncRunSummary, SyncError> {
        let source = match self.identity.resolve(url) {
            Ok(source) => source,
            Err(err) => {
                let err = SyncError::from(err);
                error!(kind = err.kind(), source_key = "-", error = %err, "sync cycle failed");
                return Err(err);
            }
        };

        let mut warnings = Vec::new();
        if let Some(detail) = self.watermarks.recovered_from() {
            warnings.push(SyncWarning::StateCorrupt {
                detail: detail.to_string(),
            });
        }

        let watermark = self.watermarks.get(&source.key);
        let params = fetch_params_for(watermark.as_ref(), self.config.overlap_days);
        let mut cycle = Cycle {
            run_id,
            started_at: Utc::now(),
            url: url.to_string(),
            spider: overrides
                .spider
                .clone()
                .unwrap_or_else(|| source.spider.clone()),
            params,
            max_reviews: overrides.max_reviews.or(self.config.max_reviews),
            artifact_path: self.config.fetch_artifact_path(&source.key),
            output_path: overrides
                .output
                .clone()
                .unwrap_or_else(|| self.config.output_path(&source.key)),
            source,
            phases: vec![SyncPhase::Idle],
            warnings,
        };
        cycle.enter(SyncPhase::ParamsComputed);
        info!(
            source_key = %cycle.source.key,
            spider = %cycle.spider,
            incremental = cycle.params.is_incremental(),
            since_date = ?cycle.params.since_date,
            since_id = ?cycle.params.since_id,
            "fetch parameters computed"
        );

        let outcome = self.fetch_merge_persist(&mut cycle).await;
        remove_artifact(&cycle.artifact_path);

        match outcome {
            Ok(summary) => Ok(summary),
            Err(err) => {
                cycle.enter(SyncPhase::Failed);
                error!(
                    kind = err.kind(),
                    source_key = %cycle.source.key,
                    error = %err,
                    "sync cycle failed"
                );
                Err(err)
            }
        }
    }

    async fn fetch_merge_persist(&mut self, cycle: &mut Cycle) -> Result<SyncRunSummary, SyncError> {
        tokio::fs::create_dir_all(&self.config.data_dir)
            .await
            .map_err(|source| SyncError::Workspace {
                path: self.config.data_dir.clone(),
                source,
            })?;
        remove_artifact(&cycle.artifact_path);

        let request = FetchRequest {
            url: cycle.url.clone(),
            spider: cycle.spider.clone(),
            params: cycle.params.clone(),
            max_reviews: cycle.max_reviews,
            output_path: cycle.artifact_path.clone(),
        };
        self.fetcher.fetch(&request).await?;

        let fetched = read_dataset(&cycle.artifact_path)
            .map_err(SyncError::MergeIo)?
            .ok_or_else(|| FetchError::MissingOutput {
                path: cycle.artifact_path.clone(),
            })?;
        cycle.enter(SyncPhase::Fetched);

        let new = ReviewSet::from_raw(fetched);
        let ingest = summarize_ingest(&new.records);
        let existing = read_dataset(&cycle.output_path)
            .map_err(SyncError::MergeIo)?
            .map(ReviewSet::from_raw)
            .unwrap_or_default();

        let outcome = self.merge.merge(existing, new);
        for warning in outcome.warnings() {
            warn!(source_key = %cycle.source.key, %warning, "merge warning");
            cycle.warnings.push(warning);
        }
        cycle.enter(SyncPhase::Merged);
        info!(
            source_key = %cycle.source.key,
            strategy = %outcome.strategy,
            existing = outcome.result.existing_count,
            new = outcome.result.new_count,
            merged = outcome.result.merged_count,
            new_added = outcome.result.new_added_count,
            "merged reviews"
        );

        write_dataset(
            &cycle.output_path,
            &outcome.set.output_schema(),
            &outcome.set.extra_columns,
            &outcome.set.records,
        )
        .map_err(SyncError::Persist)?;

        let finished_at = Utc::now();
        let watermark = derive_watermark(&outcome.set, &cycle.url, finished_at);
        let mut watermark_saved = false;
        if outcome.set.is_empty() && self.watermarks.get(&cycle.source.key).is_none() {
            info!(source_key = %cycle.source.key, "nothing ingested yet; no watermark recorded");
        } else if let Err(err) = self.watermarks.put(cycle.source.key.clone(), watermark.clone()) {
            let warning = SyncWarning::PersistencePartial {
                detail: err.to_string(),
            };
            warn!(source_key = %cycle.source.key, %warning, "watermark not saved");
            cycle.warnings.push(warning);
        } else {
            watermark_saved = true;
        }
        cycle.enter(SyncPhase::Persisted);

        let snapshot_manifest = if self.config.parquet_snapshots {
            let dir = self.config.snapshot_dir(&cycle.source.key);
            match export_snapshot(&dir, &cycle.source.key, &outcome.set, finished_at) {
                Ok(path) => Some(path),
                Err(err) => {
                    warn!(source_key = %cycle.source.key, error = %err, "parquet snapshot failed");
                    None
                }
            }
        } else {
            None
        };

        cycle.enter(SyncPhase::Idle);
        info!(
            source_key = %cycle.source.key,
            output = %cycle.output_path.display(),
            total_reviews = watermark.total_reviews,
            "sync cycle complete"
        );

        Ok(SyncRunSummary {
            run_id: cycle.run_id,
            source_key: cycle.source.key.clone(),
            url: cycle.url.clone(),
            spider: cycle.spider.clone(),
            started_at: cycle.started_at,
            finished_at,
            params: cycle.params.clone(),
            merge: outcome.result,
            strategy: outcome.strategy,
            ingest,
            warnings: cycle.warnings.clone(),
            output_path: cycle.output_path.clone(),
            watermark,
            watermark_saved,
            snapshot_manifest,
            phases: cycle.phases.clone(),
        })
    }
}

fn remove_artifact(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed fetch artifact"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "could not remove fetch artifact"),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub spider: Option<String>,
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(default)]
    pub max_reviews: Option<usize>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl SourceConfig {
    pub fn overrides(&self) -> SyncOverrides {
        SyncOverrides {
            output: self.output.clone(),
            spider: self.spider.clone(),
            max_reviews: self.max_reviews,
        }
    }
}

impl SourceRegistry {
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug)]
pub struct SourceOutcome {
    pub url: String,
    pub outcome: Result<SyncRunSummary, SyncError>,
}

/// Run every enabled source in turn. One source failing does not stop the
/// others.
pub async fn run_sync_all(
    pipeline: &mut SyncPipeline,
    registry: &SourceRegistry,
) -> Vec<SourceOutcome> {
    let mut outcomes = Vec::new();
    for source in registry.enabled() {
        let outcome = pipeline.run_once(&source.url, &source.overrides()).await;
        outcomes.push(SourceOutcome {
            url: source.url.clone(),
            outcome,
        });
    }
    let failed = outcomes.iter().filter(|o| o.outcome.is_err()).count();
    info!(sources = outcomes.len(), failed, "sync-all finished");
    outcomes
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub result: MergeResult,
    pub strategy: DedupStrategy,
    pub warnings: Vec<SyncWarning>,
    pub output_path: PathBuf,
}

/// Merge two dataset files without touching any state. The result replaces
/// `existing` unless `output` is given.
pub fn merge_files(
    existing: &Path,
    new: &Path,
    output: Option<&Path>,
) -> Result<MergeReport, SyncError> {
    let new_set = read_dataset(new)
        .map_err(SyncError::MergeIo)?
        .map(ReviewSet::from_raw)
        .ok_or_else(|| {
            SyncError::MergeIo(DatasetError::Io {
                path: new.to_path_buf(),
                source: io::Error::new(io::ErrorKind::NotFound, "dataset not found"),
            })
        })?;
    let existing_set = read_dataset(existing)
        .map_err(SyncError::MergeIo)?
        .map(ReviewSet::from_raw)
        .unwrap_or_default();

    let outcome = MergeEngine.merge(existing_set, new_set);
    let warnings = outcome.warnings();
    for warning in &warnings {
        warn!(%warning, "merge warning");
    }

    let output_path = output.unwrap_or(existing).to_path_buf();
    write_dataset(
        &output_path,
        &outcome.set.output_schema(),
        &outcome.set.extra_columns,
        &outcome.set.records,
    )
    .map_err(SyncError::Persist)?;

    Ok(MergeReport {
        result: outcome.result,
        strategy: outcome.strategy,
        warnings,
        output_path,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub source_key: SourceKey,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `reviews.parquet` and `manifest.json` under `dir`.
pub fn export_snapshot(
    dir: &Path,
    key: &SourceKey,
    set: &ReviewSet,
    generated_at: DateTime<Utc>,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let reviews_path = dir.join("reviews.parquet");
    write_reviews_parquet(&reviews_path, &set.records)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        source_key: key.clone(),
        generated_at,
        files: vec![manifest_entry("reviews", dir, &reviews_path)?],
    };
    let manifest_path = dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    write_atomic(&manifest_path, &bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_reviews_parquet(path: &Path, records: &[ReviewRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("review_id", DataType::Utf8, true),
        ArrowField::new("product_name", DataType::Utf8, true),
        ArrowField::new("reviewer_name", DataType::Utf8, true),
        ArrowField::new("review_date", DataType::Utf8, true),
        ArrowField::new("rating", DataType::Float64, true),
        ArrowField::new("canonical_text", DataType::Utf8, false),
        ArrowField::new("helpful_votes", DataType::UInt32, false),
        ArrowField::new("verified_purchase", DataType::Boolean, true),
        ArrowField::new("page_number", DataType::UInt32, true),
    ]));

    let review_ids = StringArray::from(
        records
            .iter()
            .map(|r| r.review_id.as_ref().map(ToString::to_string))
            .collect::<Vec<_>>(),
    );
    let product_names = StringArray::from(
        records
            .iter()
            .map(|r| r.product_name.as_deref())
            .collect::<Vec<_>>(),
    );
    let reviewers = StringArray::from(
        records
            .iter()
            .map(|r| r.reviewer_name.as_deref())
            .collect::<Vec<_>>(),
    );
    let dates = StringArray::from(
        records
            .iter()
            .map(|r| r.review_date.as_deref())
            .collect::<Vec<_>>(),
    );
    let ratings = Float64Array::from(records.iter().map(|r| r.rating).collect::<Vec<_>>());
    let texts = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.canonical_text.as_str()))
            .collect::<Vec<_>>(),
    );
    let votes = UInt32Array::from(records.iter().map(|r| r.helpful_votes).collect::<Vec<_>>());
    let verified =
        BooleanArray::from(records.iter().map(|r| r.verified_purchase).collect::<Vec<_>>());
    let pages = UInt32Array::from(records.iter().map(|r| r.page_number).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(review_ids),
            Arc::new(product_names),
            Arc::new(reviewers),
            Arc::new(dates),
            Arc::new(ratings),
            Arc::new(texts),
            Arc::new(votes),
            Arc::new(verified),
            Arc::new(pages),
        ],
    )
    .context("building reviews record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, dir: &Path, path: &Path) -> Result<SnapshotFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}
