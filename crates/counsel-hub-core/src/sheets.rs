//! Google Sheets backend for the Hub.
//!
//! The spreadsheet is opened by title through Drive, the worksheet by tab name. The
//! resolved spreadsheet id is memoized for the process lifetime; every read is a full scan.

use crate::google_auth::{ServiceAccountAuth, ServiceAccountKey, SHEETS_SCOPES};
use crate::hub::{HubError, RecordStore};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::OnceCell;

const SHEETS_API: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const DRIVE_FILES_API: &str = "https://www.googleapis.com/drive/v3/files";
const SPREADSHEET_MIME: &str = "application/vnd.google-apps.spreadsheet";

#[derive(Deserialize)]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Deserialize)]
struct DriveFile {
    id: String,
}

#[derive(Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Deserialize)]
struct SheetProperties {
    title: String,
}

#[derive(Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

/// Cells come back as strings under the default render option; anything else is stringified.
fn cell_text(v: serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// A1 sheet reference with the tab name quoted (`'It''s'!1:1`).
pub fn a1_range(worksheet: &str, cells: Option<&str>) -> String {
    let quoted = format!("'{}'", worksheet.replace('\'', "''"));
    match cells {
        Some(c) => format!("{}!{}", quoted, c),
        None => quoted,
    }
}

/// Drive query matching a spreadsheet by exact title.
pub fn title_query(title: &str) -> String {
    format!(
        "name = '{}' and mimeType = '{}' and trashed = false",
        title.replace('\\', "\\\\").replace('\'', "\\'"),
        SPREADSHEET_MIME
    )
}

pub struct SheetsHub {
    client: reqwest::Client,
    auth: ServiceAccountAuth,
    title: String,
    worksheet: String,
    spreadsheet_id: OnceCell<String>,
}

impl SheetsHub {
    pub fn new(key: ServiceAccountKey, title: &str, worksheet: &str) -> Result<Self, HubError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            auth: ServiceAccountAuth::new(key, SHEETS_SCOPES)?,
            title: title.to_string(),
            worksheet: worksheet.to_string(),
            spreadsheet_id: OnceCell::new(),
        })
    }

    pub fn service_account(&self) -> &str {
        self.auth.client_email()
    }

    async fn token(&self) -> Result<String, HubError> {
        self.auth.access_token(&self.client).await
    }

    /// Map a failed response onto the Hub error taxonomy.
    async fn check(&self, res: reqwest::Response) -> Result<reqwest::Response, HubError> {
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        let body = res.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            401 | 403 => HubError::Permission(body),
            400 if body.contains("Unable to parse range") => {
                HubError::WorksheetNotFound(self.worksheet.clone())
            }
            code => HubError::Api { status: code, body },
        })
    }

    /// Resolve the spreadsheet id by title and confirm the tab exists. Memoized.
    pub async fn spreadsheet_id(&self) -> Result<&str, HubError> {
        self.spreadsheet_id
            .get_or_try_init(|| async {
                let token = self.token().await?;
                let res = self
                    .client
                    .get(DRIVE_FILES_API)
                    .bearer_auth(&token)
                    .query(&[
                        ("q", title_query(&self.title).as_str()),
                        ("fields", "files(id,name)"),
                        ("supportsAllDrives", "true"),
                        ("includeItemsFromAllDrives", "true"),
                    ])
                    .send()
                    .await?;
                let list: DriveFileList = self.check(res).await?.json().await?;
                let id = list
                    .files
                    .into_iter()
                    .next()
                    .map(|f| f.id)
                    .ok_or_else(|| HubError::SpreadsheetNotFound(self.title.clone()))?;

                let res = self
                    .client
                    .get(format!("{}/{}", SHEETS_API, id))
                    .bearer_auth(&token)
                    .query(&[("fields", "sheets.properties.title")])
                    .send()
                    .await?;
                let meta: SpreadsheetMeta = self.check(res).await?.json().await?;
                if !meta.sheets.iter().any(|s| s.properties.title == self.worksheet) {
                    return Err(HubError::WorksheetNotFound(self.worksheet.clone()));
                }
                tracing::info!("[HUB] opened {:?} / {:?}", self.title, self.worksheet);
                Ok::<_, HubError>(id)
            })
            .await
            .map(|s| s.as_str())
    }

    /// `.../spreadsheets/{id}/values/{range}{suffix}` with the range percent-encoded.
    async fn values_url(&self, range: &str, suffix: &str) -> Result<reqwest::Url, HubError> {
        let id = self.spreadsheet_id().await?;
        let last = format!("{}{}", range, suffix);
        let mut url = reqwest::Url::parse(SHEETS_API).map_err(|e| HubError::Row(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| HubError::Row("Sheets API base URL cannot be a base".to_string()))?
            .extend([id, "values", last.as_str()]);
        Ok(url)
    }

    async fn get_values(&self, range: &str) -> Result<Vec<Vec<String>>, HubError> {
        let url = self.values_url(range, "").await?;
        let token = self.token().await?;
        let res = self.client.get(url).bearer_auth(&token).send().await?;
        let vr: ValueRange = self.check(res).await?.json().await?;
        Ok(vr
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_text).collect())
            .collect())
    }
}

#[async_trait]
impl RecordStore for SheetsHub {
    async fn read_header(&self) -> Result<Vec<String>, HubError> {
        let rows = self.get_values(&a1_range(&self.worksheet, Some("1:1"))).await?;
        Ok(rows.into_iter().next().unwrap_or_default())
    }

    async fn write_header(&self, header: &[String]) -> Result<(), HubError> {
        let url = self
            .values_url(&a1_range(&self.worksheet, Some("A1")), "")
            .await?;
        let token = self.token().await?;
        let res = self
            .client
            .put(url)
            .bearer_auth(&token)
            .query(&[("valueInputOption", "RAW")])
            .json(&serde_json::json!({ "values": [header] }))
            .send()
            .await?;
        self.check(res).await?;
        Ok(())
    }

    async fn append(&self, row: Vec<String>) -> Result<(), HubError> {
        let url = self
            .values_url(&a1_range(&self.worksheet, Some("A1")), ":append")
            .await?;
        let token = self.token().await?;
        let res = self
            .client
            .post(url)
            .bearer_auth(&token)
            .query(&[("valueInputOption", "RAW"), ("insertDataOption", "INSERT_ROWS")])
            .json(&serde_json::json!({ "values": [row] }))
            .send()
            .await?;
        self.check(res).await?;
        Ok(())
    }

    async fn scan_all(&self) -> Result<Vec<Vec<String>>, HubError> {
        let mut rows = self.get_values(&a1_range(&self.worksheet, None)).await?;
        if !rows.is_empty() {
            rows.remove(0);
        }
        Ok(rows)
    }

    fn describe(&self) -> String {
        format!("sheets:{}/{}", self.title, self.worksheet)
    }
}
