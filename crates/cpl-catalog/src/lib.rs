//! Catalog snapshot loading: file and HTTP sources plus raw row conversion.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cpl_core::{EventRecord, IdentityError};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "cpl-catalog";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("reading snapshot {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing snapshot {origin}: {source}")]
    Json {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("request for {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("snapshot row {index} has no event id")]
    MissingId { index: usize },
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("event {id} ends at {end_time} but starts at {start_time} for {duration_minutes} minutes")]
    EndTimeMismatch {
        id: String,
        start_time: DateTime<Utc>,
        duration_minutes: i32,
        end_time: DateTime<Utc>,
    },
    #[error("event {id} lists {tickets} tickets, more than a stored event can hold")]
    TicketCountOutOfRange { id: String, tickets: u32 },
}

/// One event row as the catalog publishes it, before identity derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEventRow {
    #[serde(default)]
    pub event_id: String,
    pub title: String,
    #[serde(default)]
    pub short_description: String,
    #[serde(default)]
    pub long_description: String,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub game_system: String,
    #[serde(default)]
    pub short_category: String,
    #[serde(default)]
    pub cluster_key: String,
    pub start_time: DateTime<Utc>,
    #[serde(alias = "duration")]
    pub duration_minutes: i32,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub room_name: String,
    #[serde(default)]
    pub table_number: String,
    #[serde(default)]
    pub tickets_available: u32,
    pub last_modified: DateTime<Utc>,
}

impl RawEventRow {
    /// Stamps identity and checks the time window. A missing end time is
    /// derived from start and duration.
    pub fn into_record(self, index: usize) -> Result<EventRecord, CatalogError> {
        if self.event_id.trim().is_empty() {
            return Err(CatalogError::MissingId { index });
        }
        let short_category = if self.short_category.trim().is_empty() {
            self.event_type
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_string()
        } else {
            self.short_category
        };

        let mut record = EventRecord {
            id: self.event_id.trim().to_string(),
            category: String::new(),
            year: 0,
            active: true,
            title: self.title,
            short_description: self.short_description,
            long_description: self.long_description,
            event_type: self.event_type,
            game_system: self.game_system,
            short_category,
            cluster_key: self.cluster_key,
            start_time: self.start_time,
            duration_minutes: self.duration_minutes,
            end_time: self.start_time,
            location: self.location,
            room_name: self.room_name,
            table_number: self.table_number,
            tickets_available: self.tickets_available,
            last_modified: self.last_modified,
        };
        record.stamp_identity()?;
        if !record.has_storable_ticket_count() {
            return Err(CatalogError::TicketCountOutOfRange {
                id: record.id,
                tickets: record.tickets_available,
            });
        }
        let expected_end = record.expected_end_time();
        record.end_time = self.end_time.unwrap_or(expected_end);
        if !record.has_consistent_end_time() {
            return Err(CatalogError::EndTimeMismatch {
                id: record.id,
                start_time: record.start_time,
                duration_minutes: record.duration_minutes,
                end_time: record.end_time,
            });
        }
        Ok(record)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SnapshotDocument {
    Full {
        #[serde(default)]
        year: Option<i32>,
        #[serde(default)]
        published_at: Option<DateTime<Utc>>,
        events: Vec<RawEventRow>,
    },
    Rows(Vec<RawEventRow>),
}

/// A fetched snapshot: rows in catalog order plus where they came from.
#[derive(Debug, Clone)]
pub struct LoadedSnapshot {
    pub origin: String,
    pub digest: String,
    pub year: Option<i32>,
    pub published_at: Option<DateTime<Utc>>,
    pub rows: Vec<RawEventRow>,
}

impl LoadedSnapshot {
    /// Converts every row, failing on the first bad one.
    pub fn into_records(self) -> Result<Vec<EventRecord>, CatalogError> {
        self.rows
            .into_iter()
            .enumerate()
            .map(|(index, row)| row.into_record(index))
            .collect()
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn parse_snapshot(origin: &str, bytes: &[u8]) -> Result<LoadedSnapshot, CatalogError> {
    let document: SnapshotDocument =
        serde_json::from_slice(bytes).map_err(|source| CatalogError::Json {
            origin: origin.to_string(),
            source,
        })?;
    let (year, published_at, rows) = match document {
        SnapshotDocument::Full {
            year,
            published_at,
            events,
        } => (year, published_at, events),
        SnapshotDocument::Rows(rows) => (None, None, rows),
    };
    Ok(LoadedSnapshot {
        origin: origin.to_string(),
        digest: sha256_hex(bytes),
        year,
        published_at,
        rows,
    })
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    fn origin(&self) -> String;
    async fn fetch(&self) -> Result<LoadedSnapshot, CatalogError>;
}

#[derive(Debug, Clone)]
pub struct FileCatalogSource {
    path: PathBuf,
}

impl FileCatalogSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CatalogSource for FileCatalogSource {
    fn origin(&self) -> String {
        self.path.display().to_string()
    }

    async fn fetch(&self) -> Result<LoadedSnapshot, CatalogError> {
        let bytes = fs::read(&self.path).await.map_err(|source| CatalogError::Io {
            path: self.origin(),
            source,
        })?;
        let snapshot = parse_snapshot(&self.origin(), &bytes)?;
        info!(origin = %snapshot.origin, rows = snapshot.rows.len(), "loaded catalog snapshot");
        Ok(snapshot)
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
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
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
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Downloads the published catalog, retrying transient failures.
#[derive(Debug, Clone)]
pub struct HttpCatalogSource {
    client: reqwest::Client,
    url: String,
    backoff: BackoffPolicy,
}

impl HttpCatalogSource {
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> Result<Self, CatalogError> {
        let url = url.into();
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().map_err(|source| CatalogError::Request {
            url: url.clone(),
            source,
        })?;
        Ok(Self {
            client,
            url,
            backoff: config.backoff,
        })
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    fn origin(&self) -> String {
        self.url.clone()
    }

    async fn fetch(&self) -> Result<LoadedSnapshot, CatalogError> {
        let span = info_span!("catalog_fetch", url = %self.url);
        self.fetch_with_retries().instrument(span).await
    }
}

impl HttpCatalogSource {
    async fn fetch_with_retries(&self) -> Result<LoadedSnapshot, CatalogError> {
        let mut attempt = 0;
        loop {
            let retry = attempt < self.backoff.max_retries;
            match self.client.get(&self.url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let bytes = resp.bytes().await.map_err(|source| CatalogError::Request {
                        url: self.url.clone(),
                        source,
                    })?;
                    let snapshot = parse_snapshot(&self.url, &bytes)?;
                    info!(rows = snapshot.rows.len(), attempt, "downloaded catalog snapshot");
                    return Ok(snapshot);
                }
                Ok(resp) if retry && is_retryable_status(resp.status()) => {
                    warn!(status = %resp.status(), attempt, "retrying catalog download");
                }
                Ok(resp) => {
                    return Err(CatalogError::HttpStatus {
                        status: resp.status().as_u16(),
                        url: self.url.clone(),
                    });
                }
                Err(err) if retry && (err.is_timeout() || err.is_connect()) => {
                    warn!(error = %err, attempt, "retrying catalog download");
                }
                Err(source) => {
                    return Err(CatalogError::Request {
                        url: self.url.clone(),
                        source,
                    });
                }
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

/// Picks an HTTP source for `http(s)://` locations and a file source otherwise.
pub fn source_for_location(
    location: &str,
    http: HttpClientConfig,
) -> Result<Box<dyn CatalogSource>, CatalogError> {
    if location.starts_with("http://") || location.starts_with("https://") {
        Ok(Box::new(HttpCatalogSource::new(location, http)?))
    } else {
        Ok(Box::new(FileCatalogSource::new(location)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SNAPSHOT: &str = r#"{
        "year": 2018,
        "published_at": "2018-07-01T12:00:00Z",
        "events": [
            {
                "event_id": "RPG18000101",
                "title": "Tomb of Horrors",
                "event_type": "RPG - Role Playing Game",
                "game_system": "D&D 5e",
                "cluster_key": "tomb",
                "start_time": "2018-08-02T14:00:00Z",
                "duration": 240,
                "tickets_available": 6,
                "last_modified": "2018-06-30T08:00:00Z"
            },
            {
                "event_id": "BGM18000102",
                "title": "Catan",
                "short_category": "BGM",
                "start_time": "2018-08-03T14:00:00Z",
                "duration_minutes": 60,
                "end_time": "2018-08-03T15:00:00Z",
                "last_modified": "2018-06-30T08:00:00Z"
            }
        ]
    }"#;

    #[test]
    fn parses_snapshot_document_and_stamps_identity() {
        let snapshot = parse_snapshot("inline", SNAPSHOT.as_bytes()).expect("snapshot parses");
        assert_eq!(snapshot.year, Some(2018));
        assert_eq!(snapshot.digest, sha256_hex(SNAPSHOT.as_bytes()));

        let records = snapshot.into_records().expect("rows convert");
        assert_eq!(records.len(), 2);
        let tomb = &records[0];
        assert_eq!(tomb.category, "RPG");
        assert_eq!(tomb.year, 2018);
        assert_eq!(tomb.short_category, "RPG");
        assert_eq!(tomb.end_time, tomb.expected_end_time());
        assert!(tomb.active);
        assert_eq!(records[1].tickets_available, 0);
    }

    #[test]
    fn bare_row_arrays_are_accepted() {
        let rows = r#"[{"event_id":"BGM18000102","title":"Catan","start_time":"2018-08-03T14:00:00Z","duration":60,"last_modified":"2018-06-30T08:00:00Z"}]"#;
        let snapshot = parse_snapshot("inline", rows.as_bytes()).expect("rows parse");
        assert_eq!(snapshot.year, None);
        assert_eq!(snapshot.rows.len(), 1);
    }

    #[test]
    fn inconsistent_end_time_is_fatal() {
        let rows = r#"[{"event_id":"BGM18000102","title":"Catan","start_time":"2018-08-03T14:00:00Z","duration":60,"end_time":"2018-08-03T16:00:00Z","last_modified":"2018-06-30T08:00:00Z"}]"#;
        let err = parse_snapshot("inline", rows.as_bytes())
            .expect("rows parse")
            .into_records()
            .expect_err("conversion fails");
        assert!(matches!(err, CatalogError::EndTimeMismatch { id, .. } if id == "BGM18000102"));
    }

    #[test]
    fn missing_id_and_bad_year_are_fatal() {
        let rows = r#"[
            {"event_id":"BGM18000102","title":"Catan","start_time":"2018-08-03T14:00:00Z","duration":60,"last_modified":"2018-06-30T08:00:00Z"},
            {"title":"Nameless","start_time":"2018-08-03T14:00:00Z","duration":60,"last_modified":"2018-06-30T08:00:00Z"}
        ]"#;
        let err = parse_snapshot("inline", rows.as_bytes())
            .expect("rows parse")
            .into_records()
            .expect_err("conversion fails");
        assert!(matches!(err, CatalogError::MissingId { index: 1 }));

        let rows = r#"[{"event_id":"BGM21000102","title":"Catan","start_time":"2021-08-03T14:00:00Z","duration":60,"last_modified":"2021-06-30T08:00:00Z"}]"#;
        let err = parse_snapshot("inline", rows.as_bytes())
            .expect("rows parse")
            .into_records()
            .expect_err("conversion fails");
        assert!(matches!(
            err,
            CatalogError::Identity(IdentityError::UnsupportedYear { two_digit_year: 21, .. })
        ));
    }

    #[test]
    fn ticket_count_beyond_column_range_is_fatal() {
        let rows = format!(
            r#"[{{"event_id":"BGM18000102","title":"Catan","start_time":"2018-08-03T14:00:00Z","duration":60,"tickets_available":{},"last_modified":"2018-06-30T08:00:00Z"}}]"#,
            u32::MAX
        );
        let err = parse_snapshot("inline", rows.as_bytes())
            .expect("rows parse")
            .into_records()
            .expect_err("conversion fails");
        assert!(matches!(
            err,
            CatalogError::TicketCountOutOfRange { id, tickets } if id == "BGM18000102" && tickets == u32::MAX
        ));
    }

    #[tokio::test]
    async fn file_source_reads_snapshot_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(SNAPSHOT.as_bytes()).expect("write snapshot");
        let source = source_for_location(
            file.path().to_str().expect("utf-8 path"),
            HttpClientConfig::default(),
        )
        .expect("file source");
        let snapshot = source.fetch().await.expect("fetch snapshot");
        assert_eq!(snapshot.rows.len(), 2);
        assert_eq!(snapshot.origin, file.path().display().to_string());
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let source = FileCatalogSource::new("/definitely/not/here.json");
        assert!(matches!(source.fetch().await, Err(CatalogError::Io { .. })));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
    }
}
