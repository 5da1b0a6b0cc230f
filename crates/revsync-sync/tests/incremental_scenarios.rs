use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use revsync_adapters::{FetchError, FetchRequest, FileFetcher, ReviewFetcher};
use revsync_core::{ReviewId, ScrapeWatermark, SourceKey};
use revsync_storage::{read_dataset, JsonFileWatermarkStore, StorageError, WatermarkStore};
use revsync_sync::{
    run_sync_all, DedupStrategy, SourceRegistry, SyncConfig, SyncOverrides, SyncPhase,
    SyncPipeline, SyncWarning,
};
use tempfile::{tempdir, TempDir};

const PRODUCT_URL: &str = "https://www.amazon.com/dp/B08N5WRWNW";
const PRODUCT_KEY: &str = "amazon.com_B08N5WRWNW";

enum Batch {
    Csv(String),
    NoOutput,
    Fail,
}

/// Plays back one batch per fetch and records every request.
struct ScriptedFetcher {
    batches: Mutex<VecDeque<Batch>>,
    requests: Arc<Mutex<Vec<FetchRequest>>>,
}

impl ScriptedFetcher {
    fn new(batches: Vec<Batch>) -> (Self, Arc<Mutex<Vec<FetchRequest>>>) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let fetcher = Self {
            batches: Mutex::new(batches.into()),
            requests: Arc::clone(&requests),
        };
        (fetcher, requests)
    }
}

#[async_trait]
impl ReviewFetcher for ScriptedFetcher {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<(), FetchError> {
        self.requests.lock().unwrap().push(request.clone());
        let batch = self.batches.lock().unwrap().pop_front();
        match batch {
            Some(Batch::Csv(body)) => {
                std::fs::write(&request.output_path, body).expect("write fetch output");
                Ok(())
            }
            Some(Batch::NoOutput) => Ok(()),
            Some(Batch::Fail) | None => Err(FetchError::Exit {
                program: "scripted".into(),
                status: "exit status: 1".into(),
                stderr: "spider closed: blocked".into(),
            }),
        }
    }
}

/// Accepts nothing; every write fails.
struct ReadOnlyStore;

impl WatermarkStore for ReadOnlyStore {
    fn get(&self, _key: &SourceKey) -> Option<ScrapeWatermark> {
        None
    }

    fn put(&mut self, _key: SourceKey, _watermark: ScrapeWatermark) -> Result<(), StorageError> {
        Err(StorageError::Write {
            path: "readonly.json".into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
        })
    }

    fn remove(&mut self, _key: &SourceKey) -> Result<bool, StorageError> {
        Ok(false)
    }

    fn entries(&self) -> Vec<(SourceKey, ScrapeWatermark)> {
        Vec::new()
    }
}

fn reviews_csv(ids: impl IntoIterator<Item = u32>) -> String {
    let mut out = String::from("review_id,reviewer_name,review_date,rating,review_text,page_number\n");
    for id in ids {
        out.push_str(&format!(
            "{id},Reviewer {id},2024-01-{id:02},{rating} out of 5 stars,\"<p>Review {id} &amp; more</p>\",{page}\n",
            rating = 1 + id % 5,
            page = 1 + (id - 1) / 5,
        ));
    }
    out
}

fn config(dir: &TempDir) -> SyncConfig {
    SyncConfig {
        data_dir: dir.path().join("data"),
        ..SyncConfig::default()
    }
}

fn pipeline(dir: &TempDir, batches: Vec<Batch>) -> (SyncPipeline, Arc<Mutex<Vec<FetchRequest>>>) {
    let (fetcher, requests) = ScriptedFetcher::new(batches);
    let pipeline = SyncPipeline::new(config(dir))
        .expect("pipeline")
        .with_fetcher(Box::new(fetcher));
    (pipeline, requests)
}

fn stored_watermark(dir: &TempDir) -> Option<ScrapeWatermark> {
    JsonFileWatermarkStore::load(config(dir).state_path())
        .expect("state")
        .get(&SourceKey::new(PRODUCT_KEY))
}

fn dataset_len(path: &Path) -> usize {
    read_dataset(path).expect("dataset").map_or(0, |d| d.len())
}

#[tokio::test]
async fn first_sync_creates_dataset_and_watermark() {
    let dir = tempdir().expect("tempdir");
    let (mut pipeline, requests) = pipeline(&dir, vec![Batch::Csv(reviews_csv(1..=10))]);

    let summary = pipeline
        .run_once(PRODUCT_URL, &SyncOverrides::default())
        .await
        .expect("sync");

    assert_eq!(summary.source_key.as_str(), PRODUCT_KEY);
    assert_eq!(summary.spider, "amazon");
    assert_eq!(summary.merge.existing_count, 0);
    assert_eq!(summary.merge.new_count, 10);
    assert_eq!(summary.merge.merged_count, 10);
    assert_eq!(summary.merge.new_added_count, 10);
    assert_eq!(summary.strategy, DedupStrategy::ReviewId);
    assert!(summary.warnings.is_empty());
    assert_eq!(
        summary.phases,
        vec![
            SyncPhase::Idle,
            SyncPhase::ParamsComputed,
            SyncPhase::Fetched,
            SyncPhase::Merged,
            SyncPhase::Persisted,
            SyncPhase::Idle,
        ]
    );
    assert_eq!(summary.ingest.distinct_pages, 2);

    let requests = requests.lock().unwrap();
    assert!(!requests[0].params.is_incremental());

    let watermark = stored_watermark(&dir).expect("watermark created");
    assert_eq!(watermark.latest_date, NaiveDate::from_ymd_opt(2024, 1, 10));
    assert_eq!(watermark.review_id, Some(ReviewId::Numeric(10)));
    assert_eq!(watermark.total_reviews, 10);
    assert_eq!(watermark.last_scrape_url, PRODUCT_URL);

    let output = config(&dir).output_path(&summary.source_key);
    let text = std::fs::read_to_string(&output).expect("dataset");
    assert!(text.lines().next().unwrap().contains("canonical_text"));
    assert!(text.contains("Review 1 & more"));
    assert!(!config(&dir).fetch_artifact_path(&summary.source_key).exists());
}

#[tokio::test]
async fn overlapping_resync_requests_one_day_back_and_dedups() {
    let dir = tempdir().expect("tempdir");
    let (mut pipeline, requests) = pipeline(
        &dir,
        vec![
            Batch::Csv(reviews_csv(1..=10)),
            Batch::Csv(reviews_csv(9..=13)),
        ],
    );

    pipeline
        .run_once(PRODUCT_URL, &SyncOverrides::default())
        .await
        .expect("first sync");
    let summary = pipeline
        .run_once(PRODUCT_URL, &SyncOverrides::default())
        .await
        .expect("resync");

    {
        let requests = requests.lock().unwrap();
        assert_eq!(requests[1].params.since_date, NaiveDate::from_ymd_opt(2024, 1, 9));
        assert_eq!(requests[1].params.since_id, Some(ReviewId::Numeric(10)));
    }

    assert_eq!(summary.merge.existing_count, 10);
    assert_eq!(summary.merge.new_count, 5);
    assert_eq!(summary.merge.merged_count, 13);
    assert_eq!(summary.merge.new_added_count, 3);

    let watermark = stored_watermark(&dir).expect("watermark");
    assert_eq!(watermark.latest_date, NaiveDate::from_ymd_opt(2024, 1, 13));
    assert_eq!(watermark.total_reviews, 13);
    assert_eq!(dataset_len(&summary.output_path), 13);
}

#[tokio::test]
async fn empty_fetch_advances_only_the_scrape_time() {
    let dir = tempdir().expect("tempdir");
    let (mut pipeline, _) = pipeline(
        &dir,
        vec![
            Batch::Csv(reviews_csv(1..=10)),
            Batch::Csv(reviews_csv(std::iter::empty())),
        ],
    );

    pipeline
        .run_once(PRODUCT_URL, &SyncOverrides::default())
        .await
        .expect("first sync");
    let before = stored_watermark(&dir).expect("watermark");
    std::thread::sleep(Duration::from_millis(5));

    let summary = pipeline
        .run_once(PRODUCT_URL, &SyncOverrides::default())
        .await
        .expect("empty sync");
    assert_eq!(summary.merge.new_count, 0);
    assert_eq!(summary.merge.new_added_count, 0);
    assert_eq!(summary.merge.merged_count, summary.merge.existing_count);

    let after = stored_watermark(&dir).expect("watermark");
    assert!(after.last_scrape_time > before.last_scrape_time);
    assert_eq!(after.latest_date, before.latest_date);
    assert_eq!(after.review_id, before.review_id);
}

#[tokio::test]
async fn degraded_dedup_appends_and_warns() {
    let dir = tempdir().expect("tempdir");
    let text_only = "review_text,rating\nGreat mug,5\nGreat mug,5\n".to_string();
    let (mut pipeline, _) = pipeline(
        &dir,
        vec![Batch::Csv(text_only.clone()), Batch::Csv(text_only)],
    );

    pipeline
        .run_once(PRODUCT_URL, &SyncOverrides::default())
        .await
        .expect("first sync");
    let summary = pipeline
        .run_once(PRODUCT_URL, &SyncOverrides::default())
        .await
        .expect("second sync");

    assert_eq!(summary.strategy, DedupStrategy::Degraded);
    assert_eq!(summary.merge.new_added_count, summary.merge.new_count);
    assert_eq!(summary.merge.merged_count, 4);
    assert!(summary
        .warnings
        .contains(&SyncWarning::DegradedDedup { new_count: 2 }));
}

#[tokio::test]
async fn fetch_failure_leaves_state_and_data_untouched() {
    let dir = tempdir().expect("tempdir");
    let (mut pipeline, _) = pipeline(&dir, vec![Batch::Csv(reviews_csv(1..=10)), Batch::Fail]);

    let first = pipeline
        .run_once(PRODUCT_URL, &SyncOverrides::default())
        .await
        .expect("first sync");
    let state_before = std::fs::read_to_string(config(&dir).state_path()).unwrap();
    let data_before = std::fs::read_to_string(&first.output_path).unwrap();

    let err = pipeline
        .run_once(PRODUCT_URL, &SyncOverrides::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "fetch");
    assert_eq!(std::fs::read_to_string(config(&dir).state_path()).unwrap(), state_before);
    assert_eq!(std::fs::read_to_string(&first.output_path).unwrap(), data_before);
}

#[tokio::test]
async fn stale_artifact_does_not_pass_as_fetch_output() {
    let dir = tempdir().expect("tempdir");
    let (mut pipeline, _) = pipeline(&dir, vec![Batch::NoOutput]);
    let artifact = config(&dir).fetch_artifact_path(&SourceKey::new(PRODUCT_KEY));
    std::fs::create_dir_all(artifact.parent().unwrap()).unwrap();
    std::fs::write(&artifact, reviews_csv(1..=3)).unwrap();

    let err = pipeline
        .run_once(PRODUCT_URL, &SyncOverrides::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        revsync_sync::SyncError::Fetch(FetchError::MissingOutput { .. })
    ));
    assert!(stored_watermark(&dir).is_none());
    assert!(!artifact.exists());
}

#[tokio::test]
async fn corrupt_state_file_runs_as_first_sync() {
    let dir = tempdir().expect("tempdir");
    let state_path = config(&dir).state_path();
    std::fs::create_dir_all(state_path.parent().unwrap()).unwrap();
    std::fs::write(&state_path, "{\"amazon.com_B08N5WRWNW\": {\"latest_date\": ").unwrap();

    let (mut pipeline, requests) = pipeline(&dir, vec![Batch::Csv(reviews_csv(1..=4))]);
    let summary = pipeline
        .run_once(PRODUCT_URL, &SyncOverrides::default())
        .await
        .expect("sync despite corrupt state");

    assert!(matches!(
        summary.warnings.first(),
        Some(SyncWarning::StateCorrupt { .. })
    ));
    assert!(!requests.lock().unwrap()[0].params.is_incremental());
    assert_eq!(stored_watermark(&dir).expect("rewritten").total_reviews, 4);
}

#[tokio::test]
async fn invalid_source_fails_before_fetching() {
    let dir = tempdir().expect("tempdir");
    let (mut pipeline, requests) = pipeline(&dir, vec![Batch::Csv(reviews_csv(1..=2))]);

    let err = pipeline
        .run_once("amazon.com/dp/B08N5WRWNW", &SyncOverrides::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_source");
    assert!(requests.lock().unwrap().is_empty());
    assert!(!config(&dir).state_path().exists());
}

#[tokio::test]
async fn watermark_write_failure_is_partial_persistence() {
    let dir = tempdir().expect("tempdir");
    let (pipeline, _) = pipeline(&dir, vec![Batch::Csv(reviews_csv(1..=3))]);
    let mut pipeline = pipeline.with_watermark_store(Box::new(ReadOnlyStore));

    let summary = pipeline
        .run_once(PRODUCT_URL, &SyncOverrides::default())
        .await
        .expect("dataset persisted");
    assert!(matches!(
        summary.warnings.as_slice(),
        [SyncWarning::PersistencePartial { .. }]
    ));
    assert!(!summary.watermark_saved);
    assert_eq!(dataset_len(&summary.output_path), 3);
}

#[tokio::test]
async fn unreadable_existing_dataset_is_merge_io() {
    let dir = tempdir().expect("tempdir");
    let (mut pipeline, _) = pipeline(&dir, vec![Batch::Csv(reviews_csv(1..=3))]);
    let blocked = dir.path().join("blocked");
    std::fs::create_dir_all(blocked.join("occupied")).unwrap();

    let err = pipeline
        .run_once(
            PRODUCT_URL,
            &SyncOverrides {
                output: Some(blocked),
                ..SyncOverrides::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "merge_io");
    assert!(stored_watermark(&dir).is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn dataset_write_failure_is_persist_and_keeps_state() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempdir().expect("tempdir");
    let (mut pipeline, _) = pipeline(
        &dir,
        vec![
            Batch::Csv(reviews_csv(1..=3)),
            Batch::Csv(reviews_csv(3..=5)),
        ],
    );
    pipeline
        .run_once(PRODUCT_URL, &SyncOverrides::default())
        .await
        .expect("first sync");
    let state_before = std::fs::read_to_string(config(&dir).state_path()).unwrap();

    let locked = dir.path().join("locked");
    std::fs::create_dir(&locked).unwrap();
    std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();
    if std::fs::write(locked.join("writable-check"), b"").is_ok() {
        // Permission bits are not enforced for this user (root).
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
        return;
    }

    let err = pipeline
        .run_once(
            PRODUCT_URL,
            &SyncOverrides {
                output: Some(locked.join("reviews.csv")),
                ..SyncOverrides::default()
            },
        )
        .await
        .unwrap_err();
    std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

    assert_eq!(err.kind(), "persist");
    assert!(matches!(err, revsync_sync::SyncError::Persist(_)));
    assert_eq!(
        std::fs::read_to_string(config(&dir).state_path()).unwrap(),
        state_before
    );
    assert!(!locked.join("reviews.csv").exists());
}

#[tokio::test]
async fn empty_first_sync_records_no_watermark() {
    let dir = tempdir().expect("tempdir");
    let (mut pipeline, requests) = pipeline(
        &dir,
        vec![
            Batch::Csv(reviews_csv(std::iter::empty())),
            Batch::Csv(reviews_csv(1..=2)),
        ],
    );

    let summary = pipeline
        .run_once(PRODUCT_URL, &SyncOverrides::default())
        .await
        .expect("empty first sync");
    assert_eq!(summary.merge.merged_count, 0);
    assert!(!summary.watermark_saved);
    assert!(stored_watermark(&dir).is_none());

    let summary = pipeline
        .run_once(PRODUCT_URL, &SyncOverrides::default())
        .await
        .expect("second sync");
    assert!(!requests.lock().unwrap()[1].params.is_incremental());
    assert!(summary.watermark_saved);
    assert_eq!(stored_watermark(&dir).expect("watermark").total_reviews, 2);
}

#[tokio::test]
async fn replayed_json_file_runs_the_full_cycle() {
    let dir = tempdir().expect("tempdir");
    let fixture = dir.path().join("fetched.json");
    std::fs::write(
        &fixture,
        r#"[
            {"review_id": 1, "author": "Ann", "date": "Reviewed on January 3, 2024", "rating": "8/10", "body": "Solid 👍 Read more", "sentiment": "positive"},
            {"review_id": 2, "author": "Bob", "date": "January 5, 2024", "rating": 3, "body": "<b>Okay</b>"}
        ]"#,
    )
    .unwrap();

    let mut pipeline = SyncPipeline::new(config(&dir))
        .expect("pipeline")
        .with_fetcher(Box::new(FileFetcher::new(&fixture)));
    let summary = pipeline
        .run_once(PRODUCT_URL, &SyncOverrides::default())
        .await
        .expect("sync");

    assert_eq!(summary.merge.new_added_count, 2);
    assert_eq!(summary.ingest.average_rating, Some(3.5));
    assert_eq!(summary.watermark.latest_date, NaiveDate::from_ymd_opt(2024, 1, 5));
    assert_eq!(summary.watermark.review_id, Some(ReviewId::Numeric(2)));

    let text = std::fs::read_to_string(&summary.output_path).unwrap();
    let header = text.lines().next().unwrap();
    assert!(header.ends_with(",sentiment"));
    assert!(text.contains(",Solid,"));
    assert!(fixture.exists());
}

#[tokio::test]
async fn sync_all_continues_past_failing_sources() {
    let dir = tempdir().expect("tempdir");
    std::fs::write(
        dir.path().join("sources.yaml"),
        format!(
            "sources:\n  - url: {PRODUCT_URL}\n  - url: not-a-url\n  - url: https://www.etsy.com/listing/42\n    enabled: false\n"
        ),
    )
    .unwrap();
    let registry = SourceRegistry::load(dir.path()).expect("registry");
    let (mut pipeline, requests) = pipeline(&dir, vec![Batch::Csv(reviews_csv(1..=2))]);

    let outcomes = run_sync_all(&mut pipeline, &registry).await;
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes[0].outcome.is_ok());
    assert_eq!(
        outcomes[1].outcome.as_ref().unwrap_err().kind(),
        "invalid_source"
    );
    assert_eq!(requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn reset_forces_a_full_fetch() {
    let dir = tempdir().expect("tempdir");
    let (mut pipeline, requests) = pipeline(
        &dir,
        vec![
            Batch::Csv(reviews_csv(1..=3)),
            Batch::Csv(reviews_csv(1..=3)),
        ],
    );
    pipeline
        .run_once(PRODUCT_URL, &SyncOverrides::default())
        .await
        .expect("first sync");
    assert!(pipeline.reset(PRODUCT_URL).expect("reset"));
    assert!(stored_watermark(&dir).is_none());

    let summary = pipeline
        .run_once(PRODUCT_URL, &SyncOverrides::default())
        .await
        .expect("second sync");
    assert!(!requests.lock().unwrap()[1].params.is_incremental());
    assert_eq!(summary.merge.new_added_count, 0);
    assert_eq!(summary.merge.merged_count, 3);
}
