//! Best-effort enrichment: selects records needing attention and runs
//! pluggable strategies against them sequentially, with an inter-call delay
//! out of politeness to the target sites.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use igfa_core::{AiProfile, AiStatus, FestivalRecord, ScrapeFields, VerificationStatus};
use igfa_storage::{FestivalStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

mod strategies;

pub use strategies::{
    AiConfig, AiLookupStrategy, CompositeScrapeStrategy, ImageSearchConfig, ImageSearchStrategy,
    PageScrapeStrategy, ScrapeConfig,
};

pub const CRATE_NAME: &str = "igfa-enrich";

/// Current generative-profile payload version. Stored records below this are
/// candidates for re-enrichment.
pub const AI_PROFILE_VERSION: i64 = 1;

/// Upper bound on per-record error strings carried by a report; the counts
/// stay exact past the cap.
const ERROR_LIST_CAP: usize = 25;

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response: {0}")]
    Parse(String),
}

/// Strategy result for one record: either a (possibly partial) payload or a
/// reason the record carries no usable input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Found(T),
    Skipped(String),
}

#[async_trait]
pub trait ScrapeStrategy: Send + Sync {
    async fn enrich(&self, record: &FestivalRecord)
        -> Result<Outcome<ScrapeFields>, StrategyError>;
}

#[async_trait]
pub trait AiStrategy: Send + Sync {
    async fn lookup(&self, record: &FestivalRecord) -> Result<Outcome<AiProfile>, StrategyError>;
}

#[derive(Debug, Clone, Copy)]
pub struct EnrichOptions {
    pub force: bool,
    /// 0 means unbounded; API-facing callers pass a bounded default.
    pub limit: u64,
    pub delay: Duration,
    pub min_version: i64,
}

impl Default for EnrichOptions {
    fn default() -> Self {
        Self {
            force: false,
            limit: 10,
            delay: Duration::from_millis(1500),
            min_version: AI_PROFILE_VERSION,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentReport {
    pub considered: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub errors: Vec<String>,
}

impl EnrichmentReport {
    fn record_error(&mut self, name: &str, err: impl std::fmt::Display) {
        self.failed += 1;
        if self.errors.len() < ERROR_LIST_CAP {
            self.errors.push(format!("{name}: {err}"));
        }
    }
}

/// Scrape pass: sequential, one strategy call per record, partial results
/// persisted field-by-field, status and last-checked stamped every time a
/// record is attempted.
pub async fn run_scrape_pass(
    store: &dyn FestivalStore,
    strategy: &dyn ScrapeStrategy,
    options: EnrichOptions,
) -> Result<EnrichmentReport, StoreError> {
    let records = store.select_for_scrape(options.force, options.limit).await?;
    let mut report = EnrichmentReport {
        considered: records.len() as u64,
        ..Default::default()
    };

    let last = records.len().saturating_sub(1);
    for (index, record) in records.iter().enumerate() {
        let now = Utc::now();
        match strategy.enrich(record).await {
            Ok(Outcome::Found(fields)) => {
                match store
                    .apply_scrape_result(record.id, &fields, VerificationStatus::Verified, now)
                    .await
                {
                    Ok(()) => report.succeeded += 1,
                    Err(err) => report.record_error(&record.name, err),
                }
            }
            Ok(Outcome::Skipped(reason)) => {
                debug!(name = %record.name, reason, "scrape skipped");
                report.skipped += 1;
            }
            Err(err) => {
                warn!(name = %record.name, error = %err, "scrape failed");
                report.record_error(&record.name, &err);
                if let Err(store_err) = store
                    .apply_scrape_result(
                        record.id,
                        &ScrapeFields::default(),
                        VerificationStatus::Failed,
                        now,
                    )
                    .await
                {
                    warn!(name = %record.name, error = %store_err, "failed to stamp scrape failure");
                }
            }
        }

        if index < last && !options.delay.is_zero() {
            tokio::time::sleep(options.delay).await;
        }
    }
    Ok(report)
}

/// AI lookup pass. Versions increase monotonically per record; a failed
/// lookup keeps the previous version so staleness remains visible.
pub async fn run_ai_pass(
    store: &dyn FestivalStore,
    strategy: &dyn AiStrategy,
    options: EnrichOptions,
) -> Result<EnrichmentReport, StoreError> {
    let records = store
        .select_for_ai(options.force, options.min_version, options.limit)
        .await?;
    let mut report = EnrichmentReport {
        considered: records.len() as u64,
        ..Default::default()
    };

    let last = records.len().saturating_sub(1);
    for (index, record) in records.iter().enumerate() {
        let now = Utc::now();
        let previous_version = record.ai_enrichment.as_ref().map(|a| a.version).unwrap_or(0);
        match strategy.lookup(record).await {
            Ok(Outcome::Found(profile)) => {
                let version = (previous_version + 1).max(options.min_version);
                match store
                    .apply_ai_result(record.id, Some(&profile), version, AiStatus::Enriched, now)
                    .await
                {
                    Ok(()) => report.succeeded += 1,
                    Err(err) => report.record_error(&record.name, err),
                }
            }
            Ok(Outcome::Skipped(reason)) => {
                debug!(name = %record.name, reason, "ai lookup skipped");
                report.skipped += 1;
                if let Err(err) = store
                    .apply_ai_result(record.id, None, previous_version, AiStatus::Skipped, now)
                    .await
                {
                    warn!(name = %record.name, error = %err, "failed to stamp ai skip");
                }
            }
            Err(err) => {
                warn!(name = %record.name, error = %err, "ai lookup failed");
                report.record_error(&record.name, &err);
                if let Err(store_err) = store
                    .apply_ai_result(record.id, None, previous_version, AiStatus::Failed, now)
                    .await
                {
                    warn!(name = %record.name, error = %store_err, "failed to stamp ai failure");
                }
            }
        }

        if index < last && !options.delay.is_zero() {
            tokio::time::sleep(options.delay).await;
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use igfa_core::{DescriptiveFields, Partition};
    use igfa_storage::MemoryFestivalStore;

    struct CannedScrape {
        fields: ScrapeFields,
    }

    #[async_trait]
    impl ScrapeStrategy for CannedScrape {
        async fn enrich(
            &self,
            record: &FestivalRecord,
        ) -> Result<Outcome<ScrapeFields>, StrategyError> {
            if record.official_page.is_empty() {
                return Ok(Outcome::Skipped("no official page".to_string()));
            }
            if record.name.contains("Broken") {
                return Err(StrategyError::Parse("bad html".to_string()));
            }
            Ok(Outcome::Found(self.fields.clone()))
        }
    }

    struct CannedAi;

    #[async_trait]
    impl AiStrategy for CannedAi {
        async fn lookup(
            &self,
            record: &FestivalRecord,
        ) -> Result<Outcome<AiProfile>, StrategyError> {
            Ok(Outcome::Found(AiProfile {
                entity: record.name.clone(),
                kind: "festival".to_string(),
                ..Default::default()
            }))
        }
    }

    fn fields(name: &str, official_page: &str) -> DescriptiveFields {
        DescriptiveFields {
            name: name.to_string(),
            partition: Partition::Curated,
            festival_type: "showcase".to_string(),
            when_text: String::new(),
            deadline: None,
            submission_open: false,
            price: String::new(),
            worth_it: String::new(),
            comments: String::new(),
            official_page: official_page.to_string(),
            steam_page: String::new(),
            days_to_submit: None,
        }
    }

    async fn seeded_store(entries: &[(&str, &str)]) -> MemoryFestivalStore {
        let store = MemoryFestivalStore::new();
        let epoch = Utc::now();
        for (name, page) in entries {
            store
                .upsert_descriptive(&fields(name, page), epoch)
                .await
                .unwrap();
        }
        store
    }

    fn no_delay() -> EnrichOptions {
        EnrichOptions {
            delay: Duration::ZERO,
            limit: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn scrape_pass_counts_success_skip_and_failure() {
        let store = seeded_store(&[
            ("Alpha Fest", "https://alpha.example"),
            ("Broken Fest", "https://broken.example"),
            ("No Page Fest", ""),
        ])
        .await;
        let strategy = CannedScrape {
            fields: ScrapeFields {
                description: Some("indie showcase".to_string()),
                ..Default::default()
            },
        };

        let report = run_scrape_pass(&store, &strategy, no_delay()).await.unwrap();
        assert_eq!(report.considered, 3);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("Broken Fest:"));

        let alpha = store.get_festival_by_slug("alpha-fest").await.unwrap();
        let enrichment = alpha.enrichment.expect("verified enrichment");
        assert_eq!(enrichment.status, VerificationStatus::Verified);
        assert_eq!(enrichment.description.as_deref(), Some("indie showcase"));
        assert!(enrichment.verified_at.is_some());

        let broken = store.get_festival_by_slug("broken-fest").await.unwrap();
        let enrichment = broken.enrichment.expect("failure stamped");
        assert_eq!(enrichment.status, VerificationStatus::Failed);
        assert!(enrichment.last_checked_at.is_some());
        assert!(enrichment.verified_at.is_none());
    }

    #[tokio::test]
    async fn second_pass_without_force_selects_nothing_attempted() {
        let store = seeded_store(&[("Alpha Fest", "https://alpha.example")]).await;
        let strategy = CannedScrape {
            fields: ScrapeFields::default(),
        };

        let first = run_scrape_pass(&store, &strategy, no_delay()).await.unwrap();
        assert_eq!(first.succeeded, 1);

        let second = run_scrape_pass(&store, &strategy, no_delay()).await.unwrap();
        assert_eq!(second.considered, 0);

        let forced = run_scrape_pass(
            &store,
            &strategy,
            EnrichOptions {
                force: true,
                ..no_delay()
            },
        )
        .await
        .unwrap();
        assert_eq!(forced.considered, 1);
    }

    #[tokio::test]
    async fn ai_pass_bumps_version_and_respects_min_version() {
        let store = seeded_store(&[("Alpha Fest", "https://alpha.example")]).await;

        let report = run_ai_pass(&store, &CannedAi, no_delay()).await.unwrap();
        assert_eq!(report.succeeded, 1);

        let record = store.get_festival_by_slug("alpha-fest").await.unwrap();
        let ai = record.ai_enrichment.expect("ai enrichment");
        assert_eq!(ai.version, AI_PROFILE_VERSION);
        assert_eq!(ai.status, AiStatus::Enriched);
        assert_eq!(ai.profile.as_ref().unwrap().entity, "Alpha Fest");

        let second = run_ai_pass(&store, &CannedAi, no_delay()).await.unwrap();
        assert_eq!(second.considered, 0);

        let bumped = run_ai_pass(
            &store,
            &CannedAi,
            EnrichOptions {
                min_version: AI_PROFILE_VERSION + 1,
                ..no_delay()
            },
        )
        .await
        .unwrap();
        assert_eq!(bumped.succeeded, 1);
        let record = store.get_festival_by_slug("alpha-fest").await.unwrap();
        assert_eq!(record.ai_enrichment.unwrap().version, AI_PROFILE_VERSION + 1);
    }
}
