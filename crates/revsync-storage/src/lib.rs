//! On-disk state for revsync: atomic writes, the watermark state file and
//! tabular review datasets.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use revsync_core::{DatasetSchema, RawReview, ReviewColumn, ReviewRecord, ScrapeWatermark, SourceKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "revsync-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write `bytes` to `path` through a temp file in the same directory and a
/// rename, so readers see either the old file or the new one.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let written = (|| {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, path)
    })();

    if written.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    written
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("reading state file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("writing state file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("encoding state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Durable `SourceKey -> ScrapeWatermark` mapping.
///
/// Implementations assume a single writer per backing file. Two processes
/// updating different keys of the same file race on the whole-file write;
/// callers serialize cycles that share a state file.
pub trait WatermarkStore: Send {
    fn get(&self, key: &SourceKey) -> Option<ScrapeWatermark>;

    /// Replace the watermark for `key` and persist the whole store.
    fn put(&mut self, key: SourceKey, watermark: ScrapeWatermark) -> Result<(), StorageError>;

    /// Forget `key`; returns whether it was present.
    fn remove(&mut self, key: &SourceKey) -> Result<bool, StorageError>;

    fn entries(&self) -> Vec<(SourceKey, ScrapeWatermark)>;

    /// Set when loading found an unreadable state document and started empty.
    fn recovered_from(&self) -> Option<&str> {
        None
    }
}

/// Watermarks kept in one pretty-printed JSON object on disk.
#[derive(Debug)]
pub struct JsonFileWatermarkStore {
    path: PathBuf,
    entries: BTreeMap<SourceKey, ScrapeWatermark>,
    recovered_from: Option<String>,
}

impl JsonFileWatermarkStore {
    /// Load the store. An absent file is an empty store; an unparseable one is
    /// logged and treated as empty. Other read failures are errors.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no state file; starting empty");
                return Ok(Self::empty(path));
            }
            Err(source) => return Err(StorageError::Read { path, source }),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::empty(path));
        }

        match serde_json::from_slice::<BTreeMap<SourceKey, ScrapeWatermark>>(&bytes) {
            Ok(entries) => Ok(Self {
                path,
                entries,
                recovered_from: None,
            }),
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "state file unparseable; treating as empty"
                );
                Ok(Self {
                    path,
                    entries: BTreeMap::new(),
                    recovered_from: Some(err.to_string()),
                })
            }
        }
    }

    fn empty(path: PathBuf) -> Self {
        Self {
            path,
            entries: BTreeMap::new(),
            recovered_from: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), StorageError> {
        let mut body = serde_json::to_vec_pretty(&self.entries)?;
        body.push(b'\n');
        write_atomic(&self.path, &body).map_err(|source| StorageError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

impl WatermarkStore for JsonFileWatermarkStore {
    fn get(&self, key: &SourceKey) -> Option<ScrapeWatermark> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: SourceKey, watermark: ScrapeWatermark) -> Result<(), StorageError> {
        let previous = self.entries.insert(key.clone(), watermark);
        if let Err(err) = self.persist() {
            match previous {
                Some(prev) => self.entries.insert(key, prev),
                None => self.entries.remove(&key),
            };
            return Err(err);
        }
        self.recovered_from = None;
        Ok(())
    }

    fn remove(&mut self, key: &SourceKey) -> Result<bool, StorageError> {
        let Some(previous) = self.entries.remove(key) else {
            return Ok(false);
        };
        if let Err(err) = self.persist() {
            self.entries.insert(key.clone(), previous);
            return Err(err);
        }
        Ok(true)
    }

    fn entries(&self) -> Vec<(SourceKey, ScrapeWatermark)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn recovered_from(&self) -> Option<&str> {
        self.recovered_from.as_deref()
    }
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("reading dataset {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("parsing csv dataset {path}: {source}")]
    Csv { path: PathBuf, source: csv::Error },
    #[error("parsing json dataset {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("json dataset {path} is not an array of objects")]
    NotTabular { path: PathBuf },
    #[error("writing dataset {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Rows of a dataset file before canonicalization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawDataset {
    /// Known columns present in the header.
    pub schema: DatasetSchema,
    /// Unknown headers, in first-seen order.
    pub extra_columns: Vec<String>,
    pub rows: Vec<RawReview>,
}

impl RawDataset {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetFormat {
    Csv,
    Json,
}

impl DatasetFormat {
    /// Format implied by the file name: `.json` is JSON, anything else CSV.
    /// [`write_dataset`] writes this format, so a written file reads back.
    pub fn for_path(path: &Path) -> Self {
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            Self::Json
        } else {
            Self::Csv
        }
    }

    /// `.json` files are JSON; otherwise sniff for a leading `[`.
    pub fn detect(path: &Path, bytes: &[u8]) -> Self {
        match Self::for_path(path) {
            Self::Json => Self::Json,
            Self::Csv if bytes.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'[') => {
                Self::Json
            }
            Self::Csv => Self::Csv,
        }
    }
}

/// Read a dataset file. A missing file is `Ok(None)`, distinct from an empty
/// dataset.
pub fn read_dataset(path: &Path) -> Result<Option<RawDataset>, DatasetError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(DatasetError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let dataset = match DatasetFormat::detect(path, &bytes) {
        DatasetFormat::Csv => parse_csv(path, &bytes)?,
        DatasetFormat::Json => parse_json(path, &bytes)?,
    };
    Ok(Some(dataset))
}

/// Header position resolved against the column model.
enum HeaderSlot {
    Known(ReviewColumn),
    Extra(String),
}

#[derive(Default)]
struct HeaderMap {
    schema: DatasetSchema,
    extra_columns: Vec<String>,
}

impl HeaderMap {
    /// First header naming a known column claims it; later aliases of the
    /// same column are carried as extras.
    fn slot(&mut self, header: &str) -> HeaderSlot {
        let trimmed = header.trim().trim_start_matches('\u{feff}').trim();
        match ReviewColumn::from_header(trimmed) {
            Some(col) if !self.schema.contains(col) => {
                self.schema.insert(col);
                HeaderSlot::Known(col)
            }
            _ => {
                if !self.extra_columns.iter().any(|h| h == trimmed) {
                    self.extra_columns.push(trimmed.to_string());
                }
                HeaderSlot::Extra(trimmed.to_string())
            }
        }
    }
}

fn place(row: &mut RawReview, slot: &HeaderSlot, value: String) {
    if value.trim().is_empty() {
        return;
    }
    match slot {
        HeaderSlot::Known(col) => {
            row.fields.insert(*col, value);
        }
        HeaderSlot::Extra(name) => {
            row.extra.insert(name.clone(), value);
        }
    }
}

fn parse_csv(path: &Path, bytes: &[u8]) -> Result<RawDataset, DatasetError> {
    let csv_err = |source| DatasetError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);

    let mut headers = HeaderMap::default();
    let slots: Vec<HeaderSlot> = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(|h| headers.slot(h))
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        let mut row = RawReview::default();
        for (slot, cell) in slots.iter().zip(record.iter()) {
            place(&mut row, slot, cell.to_string());
        }
        rows.push(row);
    }

    Ok(RawDataset {
        schema: headers.schema,
        extra_columns: headers.extra_columns,
        rows,
    })
}

fn parse_json(path: &Path, bytes: &[u8]) -> Result<RawDataset, DatasetError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|source| DatasetError::Json {
            path: path.to_path_buf(),
            source,
        })?;
    let not_tabular = || DatasetError::NotTabular {
        path: path.to_path_buf(),
    };
    let items = value.as_array().ok_or_else(not_tabular)?;

    let mut headers = HeaderMap::default();
    let mut slots: BTreeMap<String, HeaderSlot> = BTreeMap::new();
    let mut rows = Vec::with_capacity(items.len());
    for item in items {
        let object = item.as_object().ok_or_else(not_tabular)?;
        let mut row = RawReview::default();
        for (key, cell) in object {
            let slot = slots
                .entry(key.clone())
                .or_insert_with(|| headers.slot(key));
            let text = match cell {
                serde_json::Value::Null => continue,
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            place(&mut row, slot, text);
        }
        rows.push(row);
    }

    Ok(RawDataset {
        schema: headers.schema,
        extra_columns: headers.extra_columns,
        rows,
    })
}

/// Write canonical records: known columns of `schema` in model order, then
/// `extra_columns`. A `.json` path gets an array of objects (empty cells
/// omitted), anything else CSV. The file is replaced atomically.
pub fn write_dataset(
    path: &Path,
    schema: &DatasetSchema,
    extra_columns: &[String],
    records: &[ReviewRecord],
) -> Result<(), DatasetError> {
    let columns: Vec<ReviewColumn> = schema.columns().collect();
    let header: Vec<&str> = columns
        .iter()
        .map(|c| c.header())
        .chain(extra_columns.iter().map(String::as_str))
        .collect();
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|record| {
            columns
                .iter()
                .map(|c| record.column_value(*c).unwrap_or_default())
                .chain(
                    extra_columns
                        .iter()
                        .map(|name| record.extra.get(name).cloned().unwrap_or_default()),
                )
                .collect()
        })
        .collect();

    let bytes = match DatasetFormat::for_path(path) {
        DatasetFormat::Csv => encode_csv(path, &header, &rows)?,
        DatasetFormat::Json => encode_json(path, &header, &rows)?,
    };
    write_atomic(path, &bytes).map_err(|source| DatasetError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn encode_csv(path: &Path, header: &[&str], rows: &[Vec<String>]) -> Result<Vec<u8>, DatasetError> {
    let csv_err = |source| DatasetError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(header).map_err(csv_err)?;
    for row in rows {
        writer.write_record(row).map_err(csv_err)?;
    }
    writer.into_inner().map_err(|err| DatasetError::Write {
        path: path.to_path_buf(),
        source: err.into_error(),
    })
}

fn encode_json(path: &Path, header: &[&str], rows: &[Vec<String>]) -> Result<Vec<u8>, DatasetError> {
    let objects: Vec<serde_json::Map<String, serde_json::Value>> = rows
        .iter()
        .map(|row| {
            header
                .iter()
                .zip(row)
                .filter(|(_, cell)| !cell.is_empty())
                .map(|(name, cell)| (name.to_string(), serde_json::Value::String(cell.clone())))
                .collect()
        })
        .collect();
    serde_json::to_vec_pretty(&objects).map_err(|source| DatasetError::Json {
        path: path.to_path_buf(),
        source,
    })
}
