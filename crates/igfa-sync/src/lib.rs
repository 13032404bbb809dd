//! Sync pipeline: normalizes spreadsheet rows, deduplicates them, reconciles
//! each partition against the store, records an audit entry, and optionally
//! chains the enrichment passes behind a cron scheduler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use igfa_adapters::{FestivalColumns, FestivalSource, RawRow, SteamColumns};
use igfa_core::{
    DescriptiveFields, Partition, SteamFeatureRecord, SyncAuditEntry, SyncStatus, YearSlot,
};
use igfa_enrich::{run_ai_pass, run_scrape_pass, AiStrategy, EnrichOptions, EnrichmentReport, ScrapeStrategy};
use igfa_storage::FestivalStore;
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "igfa-sync";

/// Upper bound on error strings carried in a sync report and its audit
/// entry; counters stay exact past the cap.
const ERROR_LIST_CAP: usize = 25;

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub sync_secret: String,
    pub enrich_limit: u64,
    pub enrich_delay: Duration,
}

impl SyncSettings {
    pub fn from_env() -> Self {
        Self {
            scheduler_enabled: std::env::var("IGFA_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("IGFA_SYNC_CRON").unwrap_or_else(|_| "0 6 * * *".to_string()),
            sync_secret: std::env::var("IGFA_SYNC_SECRET").unwrap_or_default(),
            enrich_limit: std::env::var("IGFA_ENRICH_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            enrich_delay: Duration::from_millis(
                std::env::var("IGFA_ENRICH_DELAY_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1500),
            ),
        }
    }
}

/// Section markers and repeated label rows the sheet exports alongside the
/// data; none of them names a festival.
fn is_sentinel_name(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    matches!(
        lowered.as_str(),
        "name" | "festival" | "under consideration"
    ) || name.chars().all(|c| c == '-')
}

/// Turn one raw festival row into canonical descriptive fields. Returns
/// `None` for rows that carry no record: blank names, section markers, and
/// repeated label rows (sheet sections re-print their header mid-export).
pub fn normalize_row(
    row: &RawRow,
    columns: &FestivalColumns,
    partition: Partition,
) -> Option<DescriptiveFields> {
    let name = row.cell(columns.name).trim();
    if name.is_empty() || is_sentinel_name(name) {
        return None;
    }

    let deadline = row.cell(columns.deadline).trim();
    Some(DescriptiveFields {
        name: name.to_string(),
        partition,
        festival_type: row.cell(columns.festival_type).trim().to_string(),
        when_text: row.cell(columns.when_text).trim().to_string(),
        deadline: (!deadline.is_empty()).then(|| deadline.to_string()),
        submission_open: row
            .cell(columns.submission_open)
            .trim()
            .eq_ignore_ascii_case("true"),
        price: row.cell(columns.price).trim().to_string(),
        worth_it: row.cell(columns.worth_it).trim().to_string(),
        comments: row.cell(columns.comments).trim().to_string(),
        official_page: row.cell(columns.official_page).trim().to_string(),
        steam_page: row.cell(columns.steam_page).trim().to_string(),
        days_to_submit: row.cell(columns.days_to_submit).trim().parse().ok(),
    })
}

pub fn normalize_steam_row(
    row: &RawRow,
    columns: &SteamColumns,
    now: DateTime<Utc>,
) -> Option<SteamFeatureRecord> {
    let name = row.cell(columns.name).trim();
    if name.is_empty() || is_sentinel_name(name) {
        return None;
    }
    let slot = |status: usize, detail: usize| YearSlot {
        status: row.cell(status).trim().to_string(),
        detail: row.cell(detail).trim().to_string(),
    };
    Some(SteamFeatureRecord {
        name: name.to_string(),
        year_2023: slot(columns.status_2023, columns.detail_2023),
        year_2024: slot(columns.status_2024, columns.detail_2024),
        year_2025: slot(columns.status_2025, columns.detail_2025),
        updated_at: now,
    })
}

/// Collapse duplicate names within one partition, first occurrence wins.
/// The sheet is human-curated, so duplicates are data-entry noise and the
/// earlier row is the established one.
pub fn dedupe(rows: Vec<DescriptiveFields>) -> Vec<DescriptiveFields> {
    let mut seen = std::collections::HashSet::new();
    let mut kept = Vec::with_capacity(rows.len());
    for row in rows {
        if seen.insert(row.name.to_ascii_lowercase()) {
            kept.push(row);
        } else {
            warn!(name = %row.name, partition = %row.partition, "dropping duplicate row");
        }
    }
    kept
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionReport {
    pub upserted: u64,
    pub deleted: u64,
    pub errors: Vec<String>,
}

/// Reconcile one partition: upsert every normalized row stamped with this
/// pass's epoch, then delete records the pass did not confirm. Row failures
/// are isolated; deletion is skipped entirely unless at least one upsert
/// succeeded, so a broken or empty source cannot wipe a partition.
pub async fn reconcile(
    store: &dyn FestivalStore,
    partition: Partition,
    rows: &[DescriptiveFields],
    epoch: DateTime<Utc>,
) -> PartitionReport {
    let mut report = PartitionReport::default();
    for row in rows {
        match store.upsert_descriptive(row, epoch).await {
            Ok(()) => report.upserted += 1,
            Err(err) => {
                warn!(name = %row.name, partition = %partition, error = %err, "upsert failed");
                report.errors.push(format!("{}: {err}", row.name));
            }
        }
    }

    if report.upserted == 0 {
        if rows.is_empty() {
            warn!(partition = %partition, "no rows from source, skipping stale deletion");
            report
                .errors
                .push(format!("{partition}: source returned no rows"));
        }
        return report;
    }

    match store.delete_stale(partition, epoch).await {
        Ok(deleted) => report.deleted = deleted,
        Err(err) => {
            warn!(partition = %partition, error = %err, "stale deletion failed");
            report.errors.push(format!("{partition}: {err}"));
        }
    }
    report
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub run_id: Uuid,
    pub ran_at: DateTime<Utc>,
    pub festivals_synced: u64,
    pub steam_features_synced: u64,
    pub deleted: u64,
    pub status: SyncStatus,
    pub errors: Vec<String>,
}

/// Runs full sync passes: both festival partitions plus the Steam-feature
/// sheet, with an audit entry per pass.
pub struct SyncOrchestrator {
    store: Arc<dyn FestivalStore>,
    source: Arc<dyn FestivalSource>,
}

impl SyncOrchestrator {
    pub fn new(store: Arc<dyn FestivalStore>, source: Arc<dyn FestivalSource>) -> Self {
        Self { store, source }
    }

    /// One full pass. Overlapping passes are not guarded against: upserts
    /// are last-writer-wins and a slower pass's stale deletion can race a
    /// faster pass's upserts until the next run restores the rows.
    pub async fn run_once(&self) -> Result<SyncReport> {
        let epoch = Utc::now();
        let run_id = Uuid::new_v4();
        let mut festivals_synced = 0;
        let mut deleted = 0;
        let mut errors: Vec<String> = Vec::new();

        for partition in Partition::ALL {
            match self.source.fetch_festivals(partition).await {
                Ok(sheet) => {
                    let rows = dedupe(
                        sheet
                            .rows
                            .iter()
                            .filter_map(|row| normalize_row(row, &sheet.columns, partition))
                            .collect(),
                    );
                    let report = reconcile(self.store.as_ref(), partition, &rows, epoch).await;
                    deleted += report.deleted;
                    errors.extend(report.errors);
                    // Re-query rather than trusting the upsert count so the
                    // report reflects what actually survived the pass.
                    match self.store.count_partition(partition).await {
                        Ok(surviving) => festivals_synced += surviving,
                        Err(err) => {
                            festivals_synced += report.upserted;
                            errors.push(format!("{partition}: {err}"));
                        }
                    }
                }
                Err(err) => {
                    warn!(partition = %partition, error = %err, "festival sheet fetch failed");
                    errors.push(format!("{partition}: {err}"));
                }
            }
        }

        let mut steam_features_synced = 0;
        match self.source.fetch_steam_features().await {
            Ok(sheet) => {
                for row in &sheet.rows {
                    let Some(record) = normalize_steam_row(row, &sheet.columns, epoch) else {
                        continue;
                    };
                    match self.store.upsert_steam_feature(&record).await {
                        Ok(()) => steam_features_synced += 1,
                        Err(err) => errors.push(format!("{}: {err}", record.name)),
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "steam sheet fetch failed");
                errors.push(format!("steam: {err}"));
            }
        }

        let status = if errors.is_empty() {
            SyncStatus::Success
        } else if errors.len() < Partition::ALL.len() {
            SyncStatus::Partial
        } else {
            SyncStatus::Failed
        };
        errors.truncate(ERROR_LIST_CAP);

        let entry = SyncAuditEntry {
            id: run_id,
            ran_at: epoch,
            partitions: Partition::ALL.to_vec(),
            festivals_synced,
            steam_features_synced,
            deleted,
            status,
            errors: errors.clone(),
        };
        if let Err(err) = self.store.insert_audit(&entry).await {
            warn!(error = %err, "failed to record sync audit entry");
        }

        info!(
            %run_id,
            festivals = festivals_synced,
            steam = steam_features_synced,
            deleted,
            status = ?status,
            "sync pass finished"
        );
        Ok(SyncReport {
            run_id,
            ran_at: epoch,
            festivals_synced,
            steam_features_synced,
            deleted,
            status,
            errors,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FullRunReport {
    pub sync: SyncReport,
    pub scrape: EnrichmentReport,
    pub ai: EnrichmentReport,
}

/// Sync followed by bounded enrichment passes, the unit of work the
/// scheduler and the trigger endpoint both run.
pub struct PostSyncPipeline {
    store: Arc<dyn FestivalStore>,
    orchestrator: SyncOrchestrator,
    scrape: Arc<dyn ScrapeStrategy>,
    ai: Arc<dyn AiStrategy>,
    settings: SyncSettings,
}

impl PostSyncPipeline {
    pub fn new(
        store: Arc<dyn FestivalStore>,
        source: Arc<dyn FestivalSource>,
        scrape: Arc<dyn ScrapeStrategy>,
        ai: Arc<dyn AiStrategy>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            orchestrator: SyncOrchestrator::new(store.clone(), source),
            store,
            scrape,
            ai,
            settings,
        }
    }

    pub async fn run(&self) -> Result<FullRunReport> {
        let sync = self.orchestrator.run_once().await?;
        let options = EnrichOptions {
            limit: self.settings.enrich_limit,
            delay: self.settings.enrich_delay,
            ..Default::default()
        };
        let scrape = run_scrape_pass(self.store.as_ref(), self.scrape.as_ref(), options)
            .await
            .context("post-sync scrape pass")?;
        let ai = run_ai_pass(self.store.as_ref(), self.ai.as_ref(), options)
            .await
            .context("post-sync ai pass")?;
        Ok(FullRunReport { sync, scrape, ai })
    }
}

/// Build the cron scheduler when enabled. The job owns a clone of the
/// pipeline and logs failures instead of crashing the service.
pub async fn build_scheduler(
    settings: &SyncSettings,
    pipeline: Arc<PostSyncPipeline>,
) -> Result<Option<JobScheduler>> {
    if !settings.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = settings.sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run().await {
                Ok(report) => info!(
                    festivals = report.sync.festivals_synced,
                    scraped = report.scrape.succeeded,
                    ai = report.ai.succeeded,
                    "scheduled sync finished"
                ),
                Err(err) => warn!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
