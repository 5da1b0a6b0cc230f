//! Core domain model for revsync: review records, source identities and watermarks.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "revsync-core";

/// Stable identity key for one tracked product/source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceKey(String);

impl SourceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source-provided review identifier. Numeric sources keep numeric ids so the
/// state file round-trips them as JSON numbers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(untagged)]
pub enum ReviewId {
    Numeric(u64),
    Text(String),
}

impl ReviewId {
    /// Parse a raw cell. Empty input has no id; `"123"` and `"123.0"` (a float
    /// column written by a tabular tool) both become `Numeric(123)`. Digits
    /// with a leading zero (`"007"`) stay `Text`, since `007` and `7` are
    /// different source ids.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        let digits = trimmed.strip_suffix(".0").unwrap_or(trimmed);
        if let Some(n) = canonical_number(digits) {
            return Some(Self::Numeric(n));
        }
        Some(Self::Text(trimmed.to_string()))
    }
}

/// `Some` only when `digits` is the exact decimal rendering of the number.
fn canonical_number(digits: &str) -> Option<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    digits.parse().ok()
}

impl fmt::Display for ReviewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for ReviewId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Int(u64),
            Float(f64),
            Str(String),
        }

        match RawId::deserialize(deserializer)? {
            RawId::Int(n) => Ok(Self::Numeric(n)),
            RawId::Float(f) if f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 => {
                Ok(Self::Numeric(f as u64))
            }
            RawId::Float(f) => Ok(Self::Text(f.to_string())),
            RawId::Str(s) => Self::parse(&s).ok_or_else(|| D::Error::custom("empty review id")),
        }
    }
}

/// Known dataset columns. Declaration order is the canonical column order
/// used when writing datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReviewColumn {
    ProductName,
    ProductUrl,
    ReviewTitle,
    ReviewText,
    CanonicalText,
    Rating,
    ReviewDate,
    ReviewerName,
    ReviewId,
    HelpfulVotes,
    VerifiedPurchase,
    PageNumber,
    ScrapedAt,
}

impl ReviewColumn {
    pub const ALL: [ReviewColumn; 13] = [
        ReviewColumn::ProductName,
        ReviewColumn::ProductUrl,
        ReviewColumn::ReviewTitle,
        ReviewColumn::ReviewText,
        ReviewColumn::CanonicalText,
        ReviewColumn::Rating,
        ReviewColumn::ReviewDate,
        ReviewColumn::ReviewerName,
        ReviewColumn::ReviewId,
        ReviewColumn::HelpfulVotes,
        ReviewColumn::VerifiedPurchase,
        ReviewColumn::PageNumber,
        ReviewColumn::ScrapedAt,
    ];

    /// Header written for this column.
    pub fn header(self) -> &'static str {
        self.aliases()[0]
    }

    fn aliases(self) -> &'static [&'static str] {
        match self {
            Self::ProductName => &["product_name", "product", "product_title"],
            Self::ProductUrl => &["product_url", "url", "source_url"],
            Self::ReviewTitle => &["review_title", "title", "headline"],
            Self::ReviewText => &["review_text", "raw_text", "text", "body", "content", "comment"],
            Self::CanonicalText => &["canonical_text", "cleaned_text", "clean_text"],
            Self::Rating => &["rating", "stars", "score", "review_rating"],
            Self::ReviewDate => &[
                "review_date",
                "date",
                "posted",
                "posted_at",
                "posted_date",
                "reviewed_at",
                "review_time",
            ],
            Self::ReviewerName => &["reviewer_name", "reviewer", "author", "user", "username", "user_name"],
            Self::ReviewId => &["review_id", "reviewid", "id"],
            Self::HelpfulVotes => &["helpful_votes", "helpful", "helpful_count"],
            Self::VerifiedPurchase => &["verified_purchase", "verified"],
            Self::PageNumber => &["page_number", "page"],
            Self::ScrapedAt => &["scraped_at", "fetched_at"],
        }
    }

    /// Resolve a dataset header (case and separator insensitive) to a known column.
    pub fn from_header(header: &str) -> Option<Self> {
        let normalized = header
            .trim()
            .to_ascii_lowercase()
            .replace([' ', '-'], "_");
        Self::ALL
            .into_iter()
            .find(|col| col.aliases().contains(&normalized.as_str()))
    }
}

impl fmt::Display for ReviewColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.header())
    }
}

/// The set of known columns a dataset exposes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetSchema {
    columns: BTreeSet<ReviewColumn>,
}

impl DatasetSchema {
    pub fn new(columns: impl IntoIterator<Item = ReviewColumn>) -> Self {
        Self {
            columns: columns.into_iter().collect(),
        }
    }

    pub fn contains(&self, column: ReviewColumn) -> bool {
        self.columns.contains(&column)
    }

    pub fn insert(&mut self, column: ReviewColumn) {
        self.columns.insert(column);
    }

    pub fn union(&self, other: &Self) -> Self {
        Self {
            columns: self.columns.union(&other.columns).copied().collect(),
        }
    }

    pub fn intersection(&self, other: &Self) -> Self {
        Self {
            columns: self.columns.intersection(&other.columns).copied().collect(),
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = ReviewColumn> + '_ {
        self.columns.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// One dataset row as read from disk, before canonicalization. Only non-empty
/// cells are present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawReview {
    pub fields: BTreeMap<ReviewColumn, String>,
    pub extra: BTreeMap<String, String>,
}

impl RawReview {
    pub fn get(&self, column: ReviewColumn) -> Option<&str> {
        self.fields.get(&column).map(String::as_str)
    }
}

/// One ingested review.
///
/// `canonical_text` is always derived from `raw_text` by the text canonicalizer.
/// `review_date` holds the cleaned date text; resolution to a calendar date
/// happens where dates are compared.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub product_name: Option<String>,
    pub product_url: Option<String>,
    pub review_title: Option<String>,
    pub raw_text: Option<String>,
    pub canonical_text: String,
    pub rating: Option<f64>,
    pub review_date: Option<String>,
    pub reviewer_name: Option<String>,
    pub review_id: Option<ReviewId>,
    pub helpful_votes: u32,
    pub verified_purchase: Option<bool>,
    pub page_number: Option<u32>,
    pub scraped_at: Option<String>,
    /// Columns the model doesn't know, carried through untouched.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl ReviewRecord {
    /// Cell value written for `column`, or `None` for an empty cell.
    pub fn column_value(&self, column: ReviewColumn) -> Option<String> {
        match column {
            ReviewColumn::ProductName => self.product_name.clone(),
            ReviewColumn::ProductUrl => self.product_url.clone(),
            ReviewColumn::ReviewTitle => self.review_title.clone(),
            ReviewColumn::ReviewText => self.raw_text.clone(),
            ReviewColumn::CanonicalText => Some(self.canonical_text.clone()),
            ReviewColumn::Rating => self.rating.map(|r| r.to_string()),
            ReviewColumn::ReviewDate => self.review_date.clone(),
            ReviewColumn::ReviewerName => self.reviewer_name.clone(),
            ReviewColumn::ReviewId => self.review_id.as_ref().map(ToString::to_string),
            ReviewColumn::HelpfulVotes => Some(self.helpful_votes.to_string()),
            ReviewColumn::VerifiedPurchase => self.verified_purchase.map(|v| v.to_string()),
            ReviewColumn::PageNumber => self.page_number.map(|p| p.to_string()),
            ReviewColumn::ScrapedAt => self.scraped_at.clone(),
        }
    }
}

/// Per-source high-water mark of ingested data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeWatermark {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "lenient_date"
    )]
    pub latest_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_id: Option<ReviewId>,
    #[serde(default)]
    pub total_reviews: usize,
    #[serde(deserialize_with = "lenient_datetime")]
    pub last_scrape_time: DateTime<Utc>,
    pub last_scrape_url: String,
}

/// Incremental fetch parameters handed to the fetch collaborator. Both absent
/// means a full fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchParams {
    pub since_date: Option<NaiveDate>,
    pub since_id: Option<ReviewId>,
}

impl FetchParams {
    pub fn is_incremental(&self) -> bool {
        self.since_date.is_some() || self.since_id.is_some()
    }
}

/// Statistics of one merge. `merged_count == existing_count + new_added_count`
/// and `new_added_count <= new_count` always hold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    pub existing_count: usize,
    pub new_count: usize,
    pub merged_count: usize,
    pub new_added_count: usize,
}

impl MergeResult {
    pub fn is_consistent(&self) -> bool {
        self.merged_count == self.existing_count + self.new_added_count
            && self.new_added_count <= self.new_count
    }
}

/// Dates are written as `YYYY-MM-DD`; older state files carried full
/// timestamps, which are truncated to their date on read.
mod lenient_date {
    use chrono::{NaiveDate, NaiveDateTime};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<NaiveDate>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(date) => serializer.serialize_str(&date.format("%Y-%m-%d").to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<NaiveDate>, D::Error> {
        let Some(raw) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            return Ok(Some(date));
        }
        if let Ok(ts) = chrono::DateTime::parse_from_rfc3339(raw) {
            return Ok(Some(ts.date_naive()));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|ts| Some(ts.date()))
            .map_err(serde::de::Error::custom)
    }
}

fn lenient_datetime<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw.trim()) {
        return Ok(ts.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(D::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn review_id_parse_keeps_numeric_domain() {
        assert_eq!(ReviewId::parse(" 42 "), Some(ReviewId::Numeric(42)));
        assert_eq!(ReviewId::parse("42.0"), Some(ReviewId::Numeric(42)));
        assert_eq!(
            ReviewId::parse("R2XK9ZQ"),
            Some(ReviewId::Text("R2XK9ZQ".to_string()))
        );
        assert_eq!(ReviewId::parse("   "), None);
    }

    #[test]
    fn review_id_with_leading_zero_stays_text() {
        assert_eq!(ReviewId::parse("007"), Some(ReviewId::Text("007".to_string())));
        assert_eq!(ReviewId::parse("007.0"), Some(ReviewId::Text("007.0".to_string())));
        assert_eq!(ReviewId::parse("0"), Some(ReviewId::Numeric(0)));
        assert_ne!(ReviewId::parse("007"), ReviewId::parse("7"));
    }

    #[test]
    fn header_aliases_resolve_case_insensitively() {
        assert_eq!(ReviewColumn::from_header("Review ID"), Some(ReviewColumn::ReviewId));
        assert_eq!(ReviewColumn::from_header("author"), Some(ReviewColumn::ReviewerName));
        assert_eq!(ReviewColumn::from_header("Posted"), Some(ReviewColumn::ReviewDate));
        assert_eq!(ReviewColumn::from_header("raw_text"), Some(ReviewColumn::ReviewText));
        assert_eq!(ReviewColumn::from_header("sentiment"), None);
    }

    #[test]
    fn schema_intersection_and_union() {
        let a = DatasetSchema::new([ReviewColumn::ReviewId, ReviewColumn::ReviewText]);
        let b = DatasetSchema::new([ReviewColumn::ReviewText, ReviewColumn::Rating]);
        assert_eq!(
            a.intersection(&b).columns().collect::<Vec<_>>(),
            vec![ReviewColumn::ReviewText]
        );
        assert_eq!(a.union(&b).columns().count(), 3);
    }

    #[test]
    fn watermark_reads_legacy_timestamps_and_float_ids() {
        let legacy = r#"{
            "latest_date": "2024-01-10T00:00:00",
            "review_id": 17.0,
            "total_reviews": 10,
            "last_scrape_time": "2024-01-11T08:30:12.345678",
            "last_scrape_url": "https://www.amazon.com/dp/B08N5WRWNW"
        }"#;
        let wm: ScrapeWatermark = serde_json::from_str(legacy).unwrap();
        assert_eq!(wm.latest_date, NaiveDate::from_ymd_opt(2024, 1, 10));
        assert_eq!(wm.review_id, Some(ReviewId::Numeric(17)));
        assert_eq!(wm.total_reviews, 10);

        let json = serde_json::to_value(&wm).unwrap();
        assert_eq!(json["latest_date"], "2024-01-10");
        assert_eq!(json["review_id"], 17);
    }

    #[test]
    fn watermark_without_date_or_id_omits_them() {
        let wm = ScrapeWatermark {
            latest_date: None,
            review_id: None,
            total_reviews: 3,
            last_scrape_time: DateTime::parse_from_rfc3339("2024-02-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            last_scrape_url: "https://example.com/p".to_string(),
        };
        let json = serde_json::to_value(&wm).unwrap();
        assert!(json.get("latest_date").is_none());
        assert!(json.get("review_id").is_none());
        let back: ScrapeWatermark = serde_json::from_value(json).unwrap();
        assert_eq!(back, wm);
    }

    #[test]
    fn column_values_render_defaults() {
        let record = ReviewRecord {
            canonical_text: "solid".to_string(),
            rating: Some(4.5),
            review_id: Some(ReviewId::Numeric(9)),
            ..Default::default()
        };
        assert_eq!(record.column_value(ReviewColumn::Rating).as_deref(), Some("4.5"));
        assert_eq!(record.column_value(ReviewColumn::HelpfulVotes).as_deref(), Some("0"));
        assert_eq!(record.column_value(ReviewColumn::ReviewId).as_deref(), Some("9"));
        assert_eq!(record.column_value(ReviewColumn::ReviewDate), None);
    }
}
