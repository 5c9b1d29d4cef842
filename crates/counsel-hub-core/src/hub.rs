//! Record Store Adapter: the Hub is an append-only worksheet of counseling records.
//!
//! Backends implement [`RecordStore`] (raw rows). [`Hub`] layers the canonical schema on top:
//! the live header is checked before every append, and scans are mapped by header name.

use crate::record::{canonical_header, Category, CounselingRecord, RecordError, RiskLevel, TargetType};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("spreadsheet titled {0:?} not found (check the title and that it is shared with the service account)")]
    SpreadsheetNotFound(String),
    #[error("worksheet {0:?} not found in the Hub")]
    WorksheetNotFound(String),
    #[error("Hub header does not match the record schema: expected {expected:?}, found {found:?}")]
    SchemaDrift {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("Hub permission denied: {0}")]
    Permission(String),
    #[error("Hub API {status}: {body}")]
    Api { status: u16, body: String },
    #[error("Hub request: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Hub auth: {0}")]
    Auth(String),
    #[error("local Hub: {0}")]
    Sled(#[from] sled::Error),
    #[error("Hub row: {0}")]
    Row(String),
    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Raw row storage. Rows are returned in insertion order; `scan_all` excludes the header.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// First row of the worksheet; empty when the sheet has never been written.
    async fn read_header(&self) -> Result<Vec<String>, HubError>;
    async fn write_header(&self, header: &[String]) -> Result<(), HubError>;
    /// Exactly one new row per call. No idempotency key.
    async fn append(&self, row: Vec<String>) -> Result<(), HubError>;
    async fn scan_all(&self) -> Result<Vec<Vec<String>>, HubError>;
    /// Human-readable location, for logs and diagnostics.
    fn describe(&self) -> String;
}

/// Local sled-backed Hub. Keys are big-endian ids from `generate_id`, so iteration
/// order equals insertion order.
pub struct SledHub {
    rows: sled::Tree,
    meta: sled::Tree,
    db: sled::Db,
    path: String,
}

const HEADER_KEY: &[u8] = b"header";

impl SledHub {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HubError> {
        let path_ref = path.as_ref();
        let db = sled::open(path_ref)?;
        Self::from_db(db, path_ref.display().to_string())
    }

    /// Throwaway in-memory Hub.
    pub fn temporary() -> Result<Self, HubError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, "<temporary>".to_string())
    }

    fn from_db(db: sled::Db, path: String) -> Result<Self, HubError> {
        Ok(Self {
            rows: db.open_tree("rows")?,
            meta: db.open_tree("meta")?,
            db,
            path,
        })
    }

    fn decode(bytes: &[u8]) -> Result<Vec<String>, HubError> {
        serde_json::from_slice(bytes).map_err(|e| HubError::Row(e.to_string()))
    }

    fn encode(row: &[String]) -> Result<Vec<u8>, HubError> {
        serde_json::to_vec(row).map_err(|e| HubError::Row(e.to_string()))
    }
}

#[async_trait]
impl RecordStore for SledHub {
    async fn read_header(&self) -> Result<Vec<String>, HubError> {
        match self.meta.get(HEADER_KEY)? {
            Some(v) => Self::decode(&v),
            None => Ok(Vec::new()),
        }
    }

    async fn write_header(&self, header: &[String]) -> Result<(), HubError> {
        self.meta.insert(HEADER_KEY, Self::encode(header)?)?;
        self.meta.flush_async().await?;
        Ok(())
    }

    async fn append(&self, row: Vec<String>) -> Result<(), HubError> {
        let id = self.db.generate_id()?;
        self.rows.insert(id.to_be_bytes(), Self::encode(&row)?)?;
        self.rows.flush_async().await?;
        Ok(())
    }

    async fn scan_all(&self) -> Result<Vec<Vec<String>>, HubError> {
        self.rows
            .iter()
            .values()
            .map(|v| Self::decode(&v?))
            .collect()
    }

    fn describe(&self) -> String {
        format!("sled:{}", self.path)
    }
}

/// Aggregate counts over the whole Hub.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct HubStats {
    pub total: usize,
    /// Rows that could not be mapped to the record schema.
    pub skipped_rows: usize,
    pub by_category: BTreeMap<Category, usize>,
    pub by_target_type: BTreeMap<TargetType, usize>,
    pub by_risk_level: BTreeMap<RiskLevel, usize>,
}

impl HubStats {
    pub fn from_records(records: &[CounselingRecord], skipped_rows: usize) -> Self {
        let mut stats = HubStats {
            total: records.len(),
            skipped_rows,
            ..Default::default()
        };
        for r in records {
            *stats.by_category.entry(r.category).or_default() += 1;
            *stats.by_target_type.entry(r.target_type).or_default() += 1;
            *stats.by_risk_level.entry(r.risk_level).or_default() += 1;
        }
        stats
    }
}

/// What the live header looks like relative to the canonical schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "found", rename_all = "snake_case")]
pub enum HeaderStatus {
    Blank,
    Canonical,
    Drift(Vec<String>),
}

/// Canonical-schema view over a [`RecordStore`].
#[derive(Clone)]
pub struct Hub {
    store: Arc<dyn RecordStore>,
}

impl Hub {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub fn describe(&self) -> String {
        self.store.describe()
    }

    pub async fn header_status(&self) -> Result<HeaderStatus, HubError> {
        let found = self.store.read_header().await?;
        if found.iter().all(|c| c.trim().is_empty()) {
            return Ok(HeaderStatus::Blank);
        }
        let trimmed: Vec<String> = found.iter().map(|c| c.trim().to_string()).collect();
        if trimmed == canonical_header() {
            Ok(HeaderStatus::Canonical)
        } else {
            Ok(HeaderStatus::Drift(trimmed))
        }
    }

    /// Write the header on a blank sheet; refuse to append under any other header.
    pub async fn ensure_header(&self) -> Result<(), HubError> {
        match self.header_status().await? {
            HeaderStatus::Canonical => Ok(()),
            HeaderStatus::Blank => {
                tracing::info!("[HUB] blank worksheet, writing header at {}", self.describe());
                self.store.write_header(&canonical_header()).await
            }
            HeaderStatus::Drift(found) => {
                let expected = canonical_header();
                tracing::error!(?expected, ?found, "[HUB] schema drift, append refused");
                Err(HubError::SchemaDrift { expected, found })
            }
        }
    }

    /// Validate the header, then append one row.
    pub async fn append_record(&self, record: &CounselingRecord) -> Result<(), HubError> {
        self.ensure_header().await?;
        self.store.append(record.to_row()).await?;
        tracing::info!(
            student_id = %record.student_id,
            category = %record.category,
            risk = %record.risk_level,
            "[HUB] record appended"
        );
        Ok(())
    }

    /// Full-table scan mapped by header. Unmappable rows are skipped and counted.
    pub async fn scan(&self) -> Result<(Vec<CounselingRecord>, usize), HubError> {
        let header = self.store.read_header().await?;
        if header.iter().all(|c| c.trim().is_empty()) {
            return Ok((Vec::new(), 0));
        }
        let rows = self.store.scan_all().await?;
        let mut records = Vec::with_capacity(rows.len());
        let mut skipped = 0;
        for (i, row) in rows.iter().enumerate() {
            if row.iter().all(|c| c.trim().is_empty()) {
                continue;
            }
            match CounselingRecord::from_row(&header, row) {
                Ok(r) => records.push(r),
                Err(e) => {
                    skipped += 1;
                    tracing::warn!("[HUB] skipping row {}: {}", i + 2, e);
                }
            }
        }
        Ok((records, skipped))
    }

    pub async fn scan_records(&self) -> Result<Vec<CounselingRecord>, HubError> {
        Ok(self.scan().await?.0)
    }

    /// Records for one student id, in insertion order. Exact match after trimming.
    pub async fn history(&self, student_id: &str) -> Result<Vec<CounselingRecord>, HubError> {
        let wanted = student_id.trim();
        Ok(self
            .scan_records()
            .await?
            .into_iter()
            .filter(|r| r.student_id == wanted)
            .collect())
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (records, skipped) = self.scan().await?;
        Ok(HubStats::from_records(&records, skipped))
    }
}
