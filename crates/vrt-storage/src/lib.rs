//! History store with atomic file replacement, snapshot CSV I/O and the HTTP fetcher.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;
use vrt_core::{
    CleanListing, HistoryRow, HistoryTable, RawListing, CLEAN_COLUMNS, HISTORY_COLUMNS, RAW_COLUMNS,
    REQUIRED_SNAPSHOT_COLUMNS,
};

pub const CRATE_NAME: &str = "vrt-storage";

/// Coarse classification used by callers to pick an exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    InputMalformed,
    HistoryCorrupt,
    WriteFailure,
    Io,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot {path} is missing required columns: {}", .missing.join(", "))]
    MissingColumns { path: PathBuf, missing: Vec<String> },
    #[error("snapshot {path} is malformed: {reason}")]
    MalformedSnapshot { path: PathBuf, reason: String },
    #[error("history table {path} is corrupt ({reason}); resolve it manually before retrying")]
    HistoryCorrupt { path: PathBuf, reason: String },
    #[error("writing {path} failed: {source}")]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("reading {path} failed: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::MissingColumns { .. } | Self::MalformedSnapshot { .. } => FailureClass::InputMalformed,
            Self::HistoryCorrupt { .. } => FailureClass::HistoryCorrupt,
            Self::WriteFailure { .. } => FailureClass::WriteFailure,
            Self::Read { .. } => FailureClass::Io,
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replace `path` with `bytes` via a temp file in the same directory and a rename.
///
/// The previous file is never opened for writing; on failure the temp file is
/// removed and the previous content stays in place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|source| StoreError::WriteFailure {
        path: path.to_path_buf(),
        source,
    })?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "history".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let written = (|| -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, path)
    })();

    if let Err(source) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(StoreError::WriteFailure {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

fn render_csv<T: Serialize>(columns: &[&str], rows: &[T]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(columns)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.into_inner().map_err(|e| e.into_error().into())
}

fn write_csv_atomic<T: Serialize>(path: &Path, columns: &[&str], rows: &[T]) -> Result<(), StoreError> {
    let bytes = render_csv(columns, rows).map_err(|e| StoreError::WriteFailure {
        path: path.to_path_buf(),
        source: io::Error::other(e),
    })?;
    write_atomic(path, &bytes)
}

enum CsvProblem {
    MissingColumns(Vec<String>),
    Malformed(String),
}

fn parse_csv<T: DeserializeOwned>(bytes: &[u8], required: &[&str]) -> Result<Vec<T>, CsvProblem> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::Headers)
        .from_reader(bytes);

    let headers = reader
        .headers()
        .map_err(|e| CsvProblem::Malformed(format!("header row: {e}")))?
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    let missing = required
        .iter()
        .filter(|col| !headers.iter().any(|h| h == *col))
        .map(|col| col.to_string())
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(CsvProblem::MissingColumns(missing));
    }

    let mut rows = Vec::new();
    for (idx, record) in reader.deserialize::<T>().enumerate() {
        let row = record.map_err(|e| CsvProblem::Malformed(format!("data row {}: {e}", idx + 1)))?;
        rows.push(row);
    }
    Ok(rows)
}

/// Outcome of reading an ephemeral per-run snapshot file.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotInput<T> {
    Missing,
    Empty,
    Rows(Vec<T>),
}

impl<T> SnapshotInput<T> {
    pub fn rows(&self) -> &[T] {
        match self {
            Self::Rows(rows) => rows,
            Self::Missing | Self::Empty => &[],
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Empty => "empty",
            Self::Rows(_) => "loaded",
        }
    }
}

fn read_snapshot<T: DeserializeOwned>(path: &Path, required: &[&str]) -> Result<SnapshotInput<T>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(SnapshotInput::Missing),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(SnapshotInput::Empty);
    }

    match parse_csv::<T>(&bytes, required) {
        Ok(rows) if rows.is_empty() => Ok(SnapshotInput::Empty),
        Ok(rows) => Ok(SnapshotInput::Rows(rows)),
        Err(CsvProblem::MissingColumns(missing)) => Err(StoreError::MissingColumns {
            path: path.to_path_buf(),
            missing,
        }),
        Err(CsvProblem::Malformed(reason)) => Err(StoreError::MalformedSnapshot {
            path: path.to_path_buf(),
            reason,
        }),
    }
}

pub fn read_clean_snapshot(path: impl AsRef<Path>) -> Result<SnapshotInput<CleanListing>, StoreError> {
    read_snapshot(path.as_ref(), REQUIRED_SNAPSHOT_COLUMNS)
}

pub fn read_raw_snapshot(path: impl AsRef<Path>) -> Result<SnapshotInput<RawListing>, StoreError> {
    read_snapshot(path.as_ref(), RAW_COLUMNS)
}

pub fn write_clean_snapshot(path: impl AsRef<Path>, rows: &[CleanListing]) -> Result<(), StoreError> {
    write_csv_atomic(path.as_ref(), CLEAN_COLUMNS, rows)
}

pub fn write_raw_snapshot(path: impl AsRef<Path>, rows: &[RawListing]) -> Result<(), StoreError> {
    write_csv_atomic(path.as_ref(), RAW_COLUMNS, rows)
}

/// Load/save seam for the history table. It has no delete operation.
pub trait HistoryBackend {
    fn load(&self) -> Result<HistoryTable, StoreError>;
    fn save(&self, table: &HistoryTable) -> Result<(), StoreError>;
    fn location(&self) -> String;
}

/// The one durable artifact: a CSV file holding every merged observation.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn corrupt(&self, reason: impl Into<String>) -> StoreError {
        StoreError::HistoryCorrupt {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }
}

impl HistoryBackend for HistoryStore {
    fn load(&self) -> Result<HistoryTable, StoreError> {
        let span = info_span!("history_load", path = %self.path.display());
        let _guard = span.enter();

        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!("no history file yet; starting an empty history");
                return Ok(HistoryTable::new());
            }
            Err(err) => return Err(self.corrupt(format!("unreadable: {err}"))),
        };
        if bytes.is_empty() {
            return Err(self.corrupt("file is empty, expected at least a header row"));
        }

        let rows = parse_csv::<HistoryRow>(&bytes, HISTORY_COLUMNS).map_err(|problem| match problem {
            CsvProblem::MissingColumns(missing) => {
                self.corrupt(format!("missing columns: {}", missing.join(", ")))
            }
            CsvProblem::Malformed(reason) => self.corrupt(reason),
        })?;
        let table = HistoryTable::from_rows(rows);
        info!(rows = table.len(), "history loaded");
        Ok(table)
    }

    fn save(&self, table: &HistoryTable) -> Result<(), StoreError> {
        let span = info_span!("history_save", path = %self.path.display(), rows = table.len());
        let _guard = span.enter();
        write_csv_atomic(&self.path, HISTORY_COLUMNS, table.rows())?;
        info!("history saved");
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("retries exhausted for {url}")]
    Exhausted { url: String },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        for attempt in 0..=self.backoff.max_retries {
            let last_attempt = attempt == self.backoff.max_retries;
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && !last_attempt {
                        warn!(attempt, status = status.as_u16(), "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && !last_attempt {
                        warn!(attempt, error = %err, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Exhausted {
            url: url.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;
    use vrt_core::{fingerprint, FingerprintScheme, ListingKey, ListingStatus};

    fn listing(link: &str, price: Option<f64>) -> CleanListing {
        CleanListing {
            link: link.to_string(),
            price,
            size: Some(60.0),
            rooms: Some(2),
            district: Some(1010),
            has_outdoor: true,
            is_neubau: false,
            is_furnished: false,
            price_per_m2: price.map(|p| p / 60.0),
            dist_center: Some(0.3),
            dist_ubahn: Some(0.1),
            raw_text: "1010 Wien | 60 m² | 2 Zimmer | € 1.200".to_string(),
        }
    }

    fn table_with_one_row() -> HistoryTable {
        let date = NaiveDate::from_ymd_opt(2026, 1, 13).unwrap();
        let l = listing("https://example.test/d/a/1", Some(1200.0));
        let fp = fingerprint(&ListingKey::from(&l), FingerprintScheme::Physical, &l.link);
        let mut table = HistoryTable::new();
        table.replace_snapshot(date, vec![HistoryRow::observe(&l, &fp, date, ListingStatus::New, None, date)]);
        table
    }

    fn leftover_temp_files(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count()
    }

    #[test]
    fn sha256_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn missing_history_file_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let store = HistoryStore::new(dir.path().join("history.csv"));
        let table = store.load().expect("load");
        assert!(table.is_empty());
    }

    #[test]
    fn history_round_trips_through_atomic_save() {
        let dir = tempdir().expect("tempdir");
        let store = HistoryStore::new(dir.path().join("data").join("history.csv"));
        let table = table_with_one_row();

        store.save(&table).expect("save");
        let loaded = store.load().expect("load");

        assert_eq!(loaded, table);
        assert_eq!(leftover_temp_files(&dir.path().join("data")), 0);
        let text = fs::read_to_string(store.path()).unwrap();
        assert!(text.starts_with("fingerprint,low_confidence,snapshot_date,status,price_delta"));
    }

    #[test]
    fn empty_table_saves_a_header_row() {
        let dir = tempdir().expect("tempdir");
        let store = HistoryStore::new(dir.path().join("history.csv"));
        store.save(&HistoryTable::new()).expect("save");
        assert!(store.load().expect("load").is_empty());
    }

    #[test]
    fn zero_byte_history_is_corrupt_not_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("history.csv");
        fs::write(&path, b"").unwrap();
        let err = HistoryStore::new(&path).load().unwrap_err();
        assert_eq!(err.class(), FailureClass::HistoryCorrupt);
    }

    #[test]
    fn garbage_history_is_corrupt() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("history.csv");
        let store = HistoryStore::new(&path);
        store.save(&table_with_one_row()).unwrap();
        let mut text = fs::read_to_string(&path).unwrap();
        text.push_str("deadbeef,1,not-a-date\n");
        fs::write(&path, text).unwrap();

        let err = store.load().unwrap_err();
        assert!(matches!(err, StoreError::HistoryCorrupt { .. }));
        assert!(err.to_string().contains("data row 2"));
    }

    #[test]
    fn history_without_fingerprint_column_is_corrupt() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("history.csv");
        fs::write(&path, "link,price\nhttps://example.test/d/a/1,1200\n").unwrap();
        let err = HistoryStore::new(&path).load().unwrap_err();
        assert!(err.to_string().contains("fingerprint"));
    }

    #[test]
    fn failed_save_leaves_target_and_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("history.csv");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("keep.txt"), b"keep").unwrap();

        let err = HistoryStore::new(&target).save(&table_with_one_row()).unwrap_err();

        assert_eq!(err.class(), FailureClass::WriteFailure);
        assert_eq!(fs::read(target.join("keep.txt")).unwrap(), b"keep");
        assert_eq!(leftover_temp_files(dir.path()), 0);
    }

    #[test]
    fn clean_snapshot_accepts_pandas_style_cells() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("clean.csv");
        fs::write(
            &path,
            "link,price,size,rooms,district,has_outdoor,is_neubau,is_furnished,dist_center,dist_ubahn\n\
             https://example.test/d/a/1,1200.0,60.0,2.0,1010.0,1,0,false,0.4,0.1\n\
             https://example.test/d/a/2,,45,,,0,1,1,,\n",
        )
        .unwrap();

        let SnapshotInput::Rows(rows) = read_clean_snapshot(&path).expect("read") else {
            panic!("expected rows");
        };
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].rooms, Some(2));
        assert_eq!(rows[0].district, Some(1010));
        assert!(rows[0].has_outdoor);
        assert_eq!(rows[1].price, None);
        assert!(rows[1].is_neubau && rows[1].is_furnished);
    }

    #[test]
    fn clean_snapshot_missing_columns_is_malformed() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("clean.csv");
        fs::write(&path, "link,price,size\nhttps://example.test/d/a/1,1200,60\n").unwrap();

        let err = read_clean_snapshot(&path).unwrap_err();
        assert_eq!(err.class(), FailureClass::InputMalformed);
        let StoreError::MissingColumns { missing, .. } = err else {
            panic!("expected missing columns");
        };
        assert!(missing.contains(&"district".to_string()));
        assert!(missing.contains(&"dist_ubahn".to_string()));
    }

    #[test]
    fn clean_snapshot_rejects_non_positive_price_or_size() {
        let dir = tempdir().expect("tempdir");
        let header = "link,price,size,rooms,district,has_outdoor,is_neubau,is_furnished,dist_center,dist_ubahn\n";
        for (name, row) in [
            ("zero_price.csv", "https://example.test/d/a/1,0,60,2,1010,0,0,0,0.4,0.1\n"),
            ("negative_size.csv", "https://example.test/d/a/1,1200,-60,2,1010,0,0,0,0.4,0.1\n"),
        ] {
            let path = dir.path().join(name);
            fs::write(&path, format!("{header}{row}")).unwrap();

            let err = read_clean_snapshot(&path).unwrap_err();
            assert_eq!(err.class(), FailureClass::InputMalformed, "{name}");
            let StoreError::MalformedSnapshot { reason, .. } = err else {
                panic!("expected malformed snapshot for {name}");
            };
            assert!(reason.contains("data row 1"), "{reason}");
        }
    }

    #[test]
    fn absent_or_header_only_snapshot_is_not_an_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("clean.csv");
        assert_eq!(read_clean_snapshot(&path).unwrap(), SnapshotInput::Missing);

        write_clean_snapshot(&path, &[]).unwrap();
        assert_eq!(read_clean_snapshot(&path).unwrap(), SnapshotInput::Empty);
    }

    #[test]
    fn clean_snapshot_round_trips() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("clean.csv");
        let rows = vec![listing("https://example.test/d/a/1", Some(1200.0)), listing("https://example.test/d/a/2", None)];
        write_clean_snapshot(&path, &rows).unwrap();
        assert_eq!(read_clean_snapshot(&path).unwrap(), SnapshotInput::Rows(rows));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn retryable_statuses_are_classified() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }
}
