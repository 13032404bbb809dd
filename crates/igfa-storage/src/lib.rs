//! Document-store abstraction for IGFA.
//!
//! The sync pipeline and enrichment runner talk to [`FestivalStore`] only;
//! [`PgFestivalStore`] backs the service and [`MemoryFestivalStore`] backs
//! tests and offline runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use igfa_core::{
    AiProfile, AiStatus, DescriptiveFields, FestivalRecord, Partition, ScrapeFields,
    SteamFeatureRecord, SyncAuditEntry, VerificationStatus,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod pg;

pub use memory::MemoryFestivalStore;
pub use pg::PgFestivalStore;

pub const CRATE_NAME: &str = "igfa-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("record not found")]
    NotFound,
    #[error("{0}")]
    Backend(String),
    #[error("corrupt stored document: {0}")]
    Corrupt(String),
}

/// Whitelisted sort fields for the read API; anything else falls back to
/// sorting by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    #[default]
    Name,
    FestivalType,
    Deadline,
    SubmissionOpen,
    DaysToSubmit,
    UpdatedAt,
}

impl SortField {
    pub fn parse(input: &str) -> Self {
        match input {
            "festivalType" | "type" => SortField::FestivalType,
            "deadline" => SortField::Deadline,
            "submissionOpen" | "open" => SortField::SubmissionOpen,
            "daysToSubmit" => SortField::DaysToSubmit,
            "updatedAt" => SortField::UpdatedAt,
            _ => SortField::Name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default)]
pub struct FestivalQuery {
    pub partition: Option<Partition>,
    pub festival_type: Option<String>,
    pub submission_open: Option<bool>,
    /// Case-insensitive substring match over name, comments and type.
    pub search: Option<String>,
    pub sort: SortField,
    pub order: SortOrder,
    pub limit: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FestivalStats {
    pub total: u64,
    pub by_partition: BTreeMap<String, u64>,
    pub by_type: BTreeMap<String, u64>,
    pub open_submissions: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SteamFeatureStats {
    pub total: u64,
    /// Count of records with a non-empty status per supported year.
    pub by_year: BTreeMap<u16, u64>,
}

#[async_trait]
pub trait FestivalStore: Send + Sync {
    /// Partial upsert keyed by `(name, partition)`: descriptive fields and
    /// the sync epoch only. Enrichment sub-documents are never touched, and
    /// the slug is assigned once at insert and kept stable afterwards.
    async fn upsert_descriptive(
        &self,
        fields: &DescriptiveFields,
        epoch: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Delete every record in `partition` whose epoch stamp predates
    /// `epoch` (or is absent). Returns the number of deleted records.
    async fn delete_stale(
        &self,
        partition: Partition,
        epoch: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn count_partition(&self, partition: Partition) -> Result<u64, StoreError>;

    async fn list_festivals(
        &self,
        query: &FestivalQuery,
    ) -> Result<Page<FestivalRecord>, StoreError>;

    async fn get_festival(&self, id: Uuid) -> Result<FestivalRecord, StoreError>;

    async fn get_festival_by_slug(&self, slug: &str) -> Result<FestivalRecord, StoreError>;

    async fn festival_stats(&self) -> Result<FestivalStats, StoreError>;

    async fn distinct_types(&self) -> Result<Vec<String>, StoreError>;

    /// Records needing a scrape pass: enrichment absent or pending, or all
    /// of them under `force`. Ordered by name ascending; `limit == 0` means
    /// unbounded.
    async fn select_for_scrape(
        &self,
        force: bool,
        limit: u64,
    ) -> Result<Vec<FestivalRecord>, StoreError>;

    /// Records needing an AI pass: ai sub-document absent, pending, or below
    /// `min_version`; all of them under `force`.
    async fn select_for_ai(
        &self,
        force: bool,
        min_version: i64,
        limit: u64,
    ) -> Result<Vec<FestivalRecord>, StoreError>;

    /// Field-level merge of a scrape result; always stamps the status and
    /// the last-checked timestamp.
    async fn apply_scrape_result(
        &self,
        id: Uuid,
        fields: &ScrapeFields,
        status: VerificationStatus,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn apply_ai_result(
        &self,
        id: Uuid,
        profile: Option<&AiProfile>,
        version: i64,
        status: AiStatus,
        enriched_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Upsert by festival name; Steam-feature history is append-only style
    /// and never subject to staleness deletion.
    async fn upsert_steam_feature(&self, record: &SteamFeatureRecord) -> Result<(), StoreError>;

    async fn list_steam_features(&self) -> Result<Vec<SteamFeatureRecord>, StoreError>;

    async fn get_steam_feature(&self, name: &str) -> Result<SteamFeatureRecord, StoreError>;

    async fn steam_feature_stats(&self) -> Result<SteamFeatureStats, StoreError>;

    async fn insert_audit(&self, entry: &SyncAuditEntry) -> Result<(), StoreError>;

    /// Most recent audit entries, newest first.
    async fn recent_audits(&self, limit: u64) -> Result<Vec<SyncAuditEntry>, StoreError>;
}
