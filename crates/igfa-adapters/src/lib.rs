//! Tabular source boundary: fetches the spreadsheet CSV exports and hands
//! raw rows to the sync pipeline.
//!
//! Column lookup is resolved once per sheet shape into a [`FestivalColumns`]
//! map with a typed missing-column outcome, instead of probing several label
//! spellings per row.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use igfa_core::Partition;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "igfa-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source fetch failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("source returned http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("sheet {sheet} is missing required column '{label}'")]
    MissingColumn { sheet: String, label: String },
    #[error("sheet {0} has no header row")]
    EmptySheet(String),
}

/// One raw spreadsheet row: positional cells, already unquoted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub cells: Vec<String>,
}

impl RawRow {
    pub fn cell(&self, index: usize) -> &str {
        self.cells.get(index).map(String::as_str).unwrap_or("")
    }
}

/// Resolved column indices for a festival sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FestivalColumns {
    pub name: usize,
    pub festival_type: usize,
    pub when_text: usize,
    pub deadline: usize,
    pub submission_open: usize,
    pub price: usize,
    pub worth_it: usize,
    pub comments: usize,
    pub official_page: usize,
    pub steam_page: usize,
    pub days_to_submit: usize,
}

/// Resolved column indices for the Steam-feature sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SteamColumns {
    pub name: usize,
    pub status_2023: usize,
    pub detail_2023: usize,
    pub status_2024: usize,
    pub detail_2024: usize,
    pub status_2025: usize,
    pub detail_2025: usize,
}

fn find_column(header: &[String], sheet: &str, label: &str) -> Result<usize, SourceError> {
    header
        .iter()
        .position(|cell| cell.trim().eq_ignore_ascii_case(label))
        .ok_or_else(|| SourceError::MissingColumn {
            sheet: sheet.to_string(),
            label: label.to_string(),
        })
}

impl FestivalColumns {
    /// Resolve the label row once per sheet. The name column falls back to
    /// column zero when its label cell is empty (merged header cells export
    /// as blanks).
    pub fn resolve(header: &[String], sheet: &str) -> Result<Self, SourceError> {
        if header.is_empty() {
            return Err(SourceError::EmptySheet(sheet.to_string()));
        }
        let name = match find_column(header, sheet, "Name") {
            Ok(idx) => idx,
            Err(_) if header[0].trim().is_empty() => 0,
            Err(err) => return Err(err),
        };
        Ok(Self {
            name,
            festival_type: find_column(header, sheet, "Type")?,
            when_text: find_column(header, sheet, "When")?,
            deadline: find_column(header, sheet, "Deadline")?,
            submission_open: find_column(header, sheet, "Submission Open")?,
            price: find_column(header, sheet, "Price")?,
            worth_it: find_column(header, sheet, "Worth It")?,
            comments: find_column(header, sheet, "Comments")?,
            official_page: find_column(header, sheet, "Official Page")?,
            steam_page: find_column(header, sheet, "Steam Page")?,
            days_to_submit: find_column(header, sheet, "Days To Submit")?,
        })
    }
}

impl SteamColumns {
    pub fn resolve(header: &[String], sheet: &str) -> Result<Self, SourceError> {
        if header.is_empty() {
            return Err(SourceError::EmptySheet(sheet.to_string()));
        }
        let name = match find_column(header, sheet, "Name") {
            Ok(idx) => idx,
            Err(_) if header[0].trim().is_empty() => 0,
            Err(err) => return Err(err),
        };
        Ok(Self {
            name,
            status_2023: find_column(header, sheet, "2023 Status")?,
            detail_2023: find_column(header, sheet, "2023 Detail")?,
            status_2024: find_column(header, sheet, "2024 Status")?,
            detail_2024: find_column(header, sheet, "2024 Detail")?,
            status_2025: find_column(header, sheet, "2025 Status")?,
            detail_2025: find_column(header, sheet, "2025 Detail")?,
        })
    }
}

/// A festival sheet after header resolution: the column map plus data rows.
#[derive(Debug, Clone)]
pub struct FestivalSheet {
    pub columns: FestivalColumns,
    pub rows: Vec<RawRow>,
}

#[derive(Debug, Clone)]
pub struct SteamSheet {
    pub columns: SteamColumns,
    pub rows: Vec<RawRow>,
}

/// Source of truth for sync passes. Implemented over HTTP for the real
/// spreadsheet export; tests substitute static row sets.
#[async_trait]
pub trait FestivalSource: Send + Sync {
    async fn fetch_festivals(&self, partition: Partition) -> Result<FestivalSheet, SourceError>;

    async fn fetch_steam_features(&self) -> Result<SteamSheet, SourceError>;
}

/// Minimal CSV parser for spreadsheet exports: quoted fields, doubled-quote
/// escapes, CRLF tolerated. The exports never contain embedded newlines
/// inside quoted cells, so rows split on line boundaries.
pub fn parse_csv(text: &str) -> Vec<RawRow> {
    let mut rows = Vec::new();
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        let mut cells = Vec::new();
        let mut current = String::new();
        let mut in_quotes = false;
        let mut chars = line.chars().peekable();
        while let Some(ch) = chars.next() {
            match ch {
                '"' if in_quotes => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        current.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                '"' => in_quotes = true,
                ',' if !in_quotes => {
                    cells.push(std::mem::take(&mut current));
                }
                '\r' => {}
                other => current.push(other),
            }
        }
        cells.push(current);
        rows.push(RawRow { cells });
    }
    rows
}

#[derive(Debug, Clone)]
pub struct SheetConfig {
    pub curated_url: String,
    pub under_consideration_url: String,
    pub steam_url: String,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl SheetConfig {
    pub fn from_env() -> Self {
        Self {
            curated_url: std::env::var("IGFA_SHEET_CURATED_URL").unwrap_or_default(),
            under_consideration_url: std::env::var("IGFA_SHEET_CANDIDATES_URL")
                .unwrap_or_default(),
            steam_url: std::env::var("IGFA_SHEET_STEAM_URL").unwrap_or_default(),
            timeout_secs: std::env::var("IGFA_SHEET_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(15),
            user_agent: std::env::var("IGFA_USER_AGENT")
                .unwrap_or_else(|_| "igfa-bot/0.1".to_string()),
        }
    }
}

/// HTTP-backed [`FestivalSource`] over CSV sheet exports. Festival sheets
/// carry two leading non-data rows (section banner + column labels); the
/// Steam sheet carries one label row.
pub struct HttpSheetSource {
    client: reqwest::Client,
    config: SheetConfig,
}

impl HttpSheetSource {
    pub fn new(config: SheetConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .context("building sheet http client")?;
        Ok(Self { client, config })
    }

    async fn fetch_csv(&self, url: &str) -> Result<Vec<RawRow>, SourceError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let body = response.text().await?;
        let rows = parse_csv(&body);
        debug!(url, rows = rows.len(), "fetched sheet export");
        Ok(rows)
    }
}

#[async_trait]
impl FestivalSource for HttpSheetSource {
    async fn fetch_festivals(&self, partition: Partition) -> Result<FestivalSheet, SourceError> {
        let url = match partition {
            Partition::Curated => &self.config.curated_url,
            Partition::UnderConsideration => &self.config.under_consideration_url,
        };
        let mut rows = self.fetch_csv(url).await?;
        if rows.len() < 2 {
            return Err(SourceError::EmptySheet(partition.to_string()));
        }
        // Row 0 is the section banner; row 1 holds column labels.
        let header = rows.remove(1).cells;
        rows.remove(0);
        let columns = FestivalColumns::resolve(&header, partition.as_str())?;
        Ok(FestivalSheet { columns, rows })
    }

    async fn fetch_steam_features(&self) -> Result<SteamSheet, SourceError> {
        let mut rows = self.fetch_csv(&self.config.steam_url).await?;
        if rows.is_empty() {
            return Err(SourceError::EmptySheet("steam".to_string()));
        }
        let header = rows.remove(0).cells;
        let columns = SteamColumns::resolve(&header, "steam")?;
        Ok(SteamSheet { columns, rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_parser_handles_quotes_and_escapes() {
        let rows = parse_csv("a,\"b, with comma\",\"he said \"\"hi\"\"\"\r\nplain,,last");
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0].cells,
            vec!["a", "b, with comma", "he said \"hi\""]
        );
        assert_eq!(rows[1].cells, vec!["plain", "", "last"]);
    }

    #[test]
    fn festival_columns_resolve_by_label_case_insensitively() {
        let header: Vec<String> = [
            "name", "type", "when", "deadline", "submission open", "price", "worth it",
            "comments", "official page", "steam page", "days to submit",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let columns = FestivalColumns::resolve(&header, "curated").unwrap();
        assert_eq!(columns.name, 0);
        assert_eq!(columns.days_to_submit, 10);
    }

    #[test]
    fn festival_columns_fall_back_to_first_column_for_blank_name_label() {
        let header: Vec<String> = [
            "", "Type", "When", "Deadline", "Submission Open", "Price", "Worth It",
            "Comments", "Official Page", "Steam Page", "Days To Submit",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let columns = FestivalColumns::resolve(&header, "curated").unwrap();
        assert_eq!(columns.name, 0);
    }

    #[test]
    fn missing_column_is_a_typed_error() {
        let header: Vec<String> = ["Name", "Type"].iter().map(|s| s.to_string()).collect();
        let err = FestivalColumns::resolve(&header, "curated").unwrap_err();
        match err {
            SourceError::MissingColumn { sheet, label } => {
                assert_eq!(sheet, "curated");
                assert_eq!(label, "When");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn raw_row_out_of_range_cell_is_empty() {
        let row = RawRow {
            cells: vec!["only".to_string()],
        };
        assert_eq!(row.cell(0), "only");
        assert_eq!(row.cell(5), "");
    }
}
