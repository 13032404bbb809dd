//! In-memory [`FestivalStore`] used by tests and offline runs.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use igfa_core::{
    derive_slug, AiEnrichment, AiProfile, AiStatus, DescriptiveFields, FestivalRecord, Partition,
    ScrapeEnrichment, ScrapeFields, SteamFeatureRecord, SyncAuditEntry, VerificationStatus,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    FestivalQuery, FestivalStats, FestivalStore, Page, SortField, SortOrder, SteamFeatureStats,
    StoreError,
};

#[derive(Default)]
struct Inner {
    festivals: HashMap<(String, Partition), FestivalRecord>,
    steam: HashMap<String, SteamFeatureRecord>,
    audits: Vec<SyncAuditEntry>,
    fail_upserts: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryFestivalStore {
    inner: Mutex<Inner>,
}

impl MemoryFestivalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make upserts for the given festival names fail with a backend error.
    /// Test hook for partial-failure isolation.
    pub async fn fail_upserts_named(&self, names: &[&str]) {
        let mut inner = self.inner.lock().await;
        inner.fail_upserts = names.iter().map(|n| n.to_string()).collect();
    }

    pub async fn snapshot(&self) -> Vec<FestivalRecord> {
        let inner = self.inner.lock().await;
        let mut records: Vec<_> = inner.festivals.values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }
}

fn unique_slug(name: &str, taken: &HashSet<String>) -> String {
    let base = derive_slug(name);
    if !taken.contains(base.as_str()) {
        return base;
    }
    let mut n = 2u32;
    loop {
        let candidate = format!("{base}-{n}");
        if !taken.contains(candidate.as_str()) {
            return candidate;
        }
        n += 1;
    }
}

fn matches_query(record: &FestivalRecord, query: &FestivalQuery) -> bool {
    if let Some(partition) = query.partition {
        if record.partition != partition {
            return false;
        }
    }
    if let Some(festival_type) = &query.festival_type {
        if !record.festival_type.eq_ignore_ascii_case(festival_type) {
            return false;
        }
    }
    if let Some(open) = query.submission_open {
        if record.submission_open != open {
            return false;
        }
    }
    if let Some(search) = &query.search {
        let needle = search.to_lowercase();
        let haystack = format!(
            "{} {} {}",
            record.name.to_lowercase(),
            record.comments.to_lowercase(),
            record.festival_type.to_lowercase()
        );
        if !haystack.contains(&needle) {
            return false;
        }
    }
    true
}

fn sort_records(records: &mut [FestivalRecord], sort: SortField, order: SortOrder) {
    records.sort_by(|a, b| {
        let ordering = match sort {
            SortField::Name => a.name.cmp(&b.name),
            SortField::FestivalType => a.festival_type.cmp(&b.festival_type),
            SortField::Deadline => a.deadline.cmp(&b.deadline),
            SortField::SubmissionOpen => a.submission_open.cmp(&b.submission_open),
            SortField::DaysToSubmit => a.days_to_submit.cmp(&b.days_to_submit),
            SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        };
        match order {
            SortOrder::Asc => ordering.then_with(|| a.name.cmp(&b.name)),
            SortOrder::Desc => ordering.reverse().then_with(|| a.name.cmp(&b.name)),
        }
    });
}

fn needs_scrape(record: &FestivalRecord) -> bool {
    match &record.enrichment {
        None => true,
        Some(e) => e.status == VerificationStatus::Pending,
    }
}

fn needs_ai(record: &FestivalRecord, min_version: i64) -> bool {
    match &record.ai_enrichment {
        None => true,
        Some(ai) => ai.status == AiStatus::Pending || ai.version < min_version,
    }
}

fn bounded(mut records: Vec<FestivalRecord>, limit: u64) -> Vec<FestivalRecord> {
    records.sort_by(|a, b| a.name.cmp(&b.name));
    if limit > 0 {
        records.truncate(limit as usize);
    }
    records
}

#[async_trait]
impl FestivalStore for MemoryFestivalStore {
    async fn upsert_descriptive(
        &self,
        fields: &DescriptiveFields,
        epoch: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.fail_upserts.contains(&fields.name) {
            return Err(StoreError::Backend(format!(
                "injected upsert failure for {}",
                fields.name
            )));
        }

        let key = (fields.name.clone(), fields.partition);
        if let Some(existing) = inner.festivals.get_mut(&key) {
            existing.festival_type = fields.festival_type.clone();
            existing.when_text = fields.when_text.clone();
            existing.deadline = fields.deadline.clone();
            existing.submission_open = fields.submission_open;
            existing.price = fields.price.clone();
            existing.worth_it = fields.worth_it.clone();
            existing.comments = fields.comments.clone();
            existing.official_page = fields.official_page.clone();
            existing.steam_page = fields.steam_page.clone();
            existing.days_to_submit = fields.days_to_submit;
            existing.last_synced_epoch = Some(epoch);
            existing.updated_at = epoch;
            return Ok(());
        }

        let taken: HashSet<String> = inner.festivals.values().map(|r| r.slug.clone()).collect();
        let slug = unique_slug(&fields.name, &taken);
        inner.festivals.insert(
            key,
            FestivalRecord {
                id: Uuid::new_v4(),
                slug,
                name: fields.name.clone(),
                partition: fields.partition,
                festival_type: fields.festival_type.clone(),
                when_text: fields.when_text.clone(),
                deadline: fields.deadline.clone(),
                submission_open: fields.submission_open,
                price: fields.price.clone(),
                worth_it: fields.worth_it.clone(),
                comments: fields.comments.clone(),
                official_page: fields.official_page.clone(),
                steam_page: fields.steam_page.clone(),
                days_to_submit: fields.days_to_submit,
                last_synced_epoch: Some(epoch),
                enrichment: None,
                ai_enrichment: None,
                created_at: epoch,
                updated_at: epoch,
            },
        );
        Ok(())
    }

    async fn delete_stale(
        &self,
        partition: Partition,
        epoch: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.festivals.len();
        inner.festivals.retain(|(_, p), record| {
            *p != partition || matches!(record.last_synced_epoch, Some(stamp) if stamp >= epoch)
        });
        Ok((before - inner.festivals.len()) as u64)
    }

    async fn count_partition(&self, partition: Partition) -> Result<u64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .festivals
            .values()
            .filter(|r| r.partition == partition)
            .count() as u64)
    }

    async fn list_festivals(
        &self,
        query: &FestivalQuery,
    ) -> Result<Page<FestivalRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let mut matched: Vec<_> = inner
            .festivals
            .values()
            .filter(|r| matches_query(r, query))
            .cloned()
            .collect();
        let total = matched.len() as u64;
        sort_records(&mut matched, query.sort, query.order);
        let items = matched
            .into_iter()
            .skip(query.offset as usize)
            .take(if query.limit > 0 {
                query.limit as usize
            } else {
                usize::MAX
            })
            .collect();
        Ok(Page { items, total })
    }

    async fn get_festival(&self, id: Uuid) -> Result<FestivalRecord, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .festivals
            .values()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn get_festival_by_slug(&self, slug: &str) -> Result<FestivalRecord, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .festivals
            .values()
            .find(|r| r.slug == slug)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn festival_stats(&self) -> Result<FestivalStats, StoreError> {
        let inner = self.inner.lock().await;
        let mut stats = FestivalStats {
            total: inner.festivals.len() as u64,
            by_partition: Default::default(),
            by_type: Default::default(),
            open_submissions: 0,
        };
        for record in inner.festivals.values() {
            *stats
                .by_partition
                .entry(record.partition.as_str().to_string())
                .or_default() += 1;
            if !record.festival_type.is_empty() {
                *stats
                    .by_type
                    .entry(record.festival_type.clone())
                    .or_default() += 1;
            }
            if record.submission_open {
                stats.open_submissions += 1;
            }
        }
        Ok(stats)
    }

    async fn distinct_types(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        let mut types: Vec<String> = inner
            .festivals
            .values()
            .map(|r| r.festival_type.clone())
            .filter(|t| !t.is_empty())
            .collect();
        types.sort();
        types.dedup();
        Ok(types)
    }

    async fn select_for_scrape(
        &self,
        force: bool,
        limit: u64,
    ) -> Result<Vec<FestivalRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let matched: Vec<_> = inner
            .festivals
            .values()
            .filter(|r| force || needs_scrape(r))
            .cloned()
            .collect();
        Ok(bounded(matched, limit))
    }

    async fn select_for_ai(
        &self,
        force: bool,
        min_version: i64,
        limit: u64,
    ) -> Result<Vec<FestivalRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let matched: Vec<_> = inner
            .festivals
            .values()
            .filter(|r| force || needs_ai(r, min_version))
            .cloned()
            .collect();
        Ok(bounded(matched, limit))
    }

    async fn apply_scrape_result(
        &self,
        id: Uuid,
        fields: &ScrapeFields,
        status: VerificationStatus,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .festivals
            .values_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound)?;
        let mut enrichment = record
            .enrichment
            .take()
            .unwrap_or_else(ScrapeEnrichment::pending);
        if let Some(v) = &fields.image_url {
            enrichment.image_url = Some(v.clone());
        }
        if let Some(v) = &fields.logo_url {
            enrichment.logo_url = Some(v.clone());
        }
        if let Some(v) = &fields.description {
            enrichment.description = Some(v.clone());
        }
        if let Some(v) = &fields.twitter {
            enrichment.twitter = Some(v.clone());
        }
        if let Some(v) = &fields.discord {
            enrichment.discord = Some(v.clone());
        }
        if let Some(v) = &fields.location {
            enrichment.location = Some(v.clone());
        }
        if let Some(v) = &fields.organizer {
            enrichment.organizer = Some(v.clone());
        }
        enrichment.status = status;
        enrichment.last_checked_at = Some(checked_at);
        if status == VerificationStatus::Verified {
            enrichment.verified_at = Some(checked_at);
        }
        record.enrichment = Some(enrichment);
        record.updated_at = checked_at;
        Ok(())
    }

    async fn apply_ai_result(
        &self,
        id: Uuid,
        profile: Option<&AiProfile>,
        version: i64,
        status: AiStatus,
        enriched_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .festivals
            .values_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound)?;
        record.ai_enrichment = Some(AiEnrichment {
            profile: profile.cloned(),
            version,
            status,
            enriched_at: Some(enriched_at),
        });
        record.updated_at = enriched_at;
        Ok(())
    }

    async fn upsert_steam_feature(&self, record: &SteamFeatureRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.steam.insert(record.name.clone(), record.clone());
        Ok(())
    }

    async fn list_steam_features(&self) -> Result<Vec<SteamFeatureRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let mut records: Vec<_> = inner.steam.values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    async fn get_steam_feature(&self, name: &str) -> Result<SteamFeatureRecord, StoreError> {
        let inner = self.inner.lock().await;
        inner.steam.get(name).cloned().ok_or(StoreError::NotFound)
    }

    async fn steam_feature_stats(&self) -> Result<SteamFeatureStats, StoreError> {
        let inner = self.inner.lock().await;
        let mut stats = SteamFeatureStats {
            total: inner.steam.len() as u64,
            by_year: Default::default(),
        };
        for record in inner.steam.values() {
            for year in igfa_core::SteamYear::ALL {
                if !record.slot(year).status.is_empty() {
                    *stats.by_year.entry(year.as_u16()).or_default() += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn insert_audit(&self, entry: &SyncAuditEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.audits.push(entry.clone());
        Ok(())
    }

    async fn recent_audits(&self, limit: u64) -> Result<Vec<SyncAuditEntry>, StoreError> {
        let inner = self.inner.lock().await;
        let mut audits = inner.audits.clone();
        audits.sort_by(|a, b| b.ran_at.cmp(&a.ran_at));
        if limit > 0 {
            audits.truncate(limit as usize);
        }
        Ok(audits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(name: &str, partition: Partition) -> DescriptiveFields {
        DescriptiveFields {
            name: name.to_string(),
            partition,
            festival_type: "showcase".to_string(),
            when_text: "June".to_string(),
            deadline: Some("2026-05-01".to_string()),
            submission_open: true,
            price: "free".to_string(),
            worth_it: "yes".to_string(),
            comments: String::new(),
            official_page: "https://example.com".to_string(),
            steam_page: String::new(),
            days_to_submit: Some(30),
        }
    }

    #[tokio::test]
    async fn upsert_assigns_suffixed_slug_on_name_collision() {
        let store = MemoryFestivalStore::new();
        let epoch = Utc::now();
        store
            .upsert_descriptive(&fields("Indie Live Expo!", Partition::Curated), epoch)
            .await
            .unwrap();
        store
            .upsert_descriptive(
                &fields("Indie Live Expo!", Partition::UnderConsideration),
                epoch,
            )
            .await
            .unwrap();

        let records = store.snapshot().await;
        let mut slugs: Vec<_> = records.iter().map(|r| r.slug.clone()).collect();
        slugs.sort();
        assert_eq!(slugs, vec!["indie-live-expo", "indie-live-expo-2"]);
    }

    #[tokio::test]
    async fn upsert_preserves_enrichment_and_slug() {
        let store = MemoryFestivalStore::new();
        let t1 = Utc::now();
        store
            .upsert_descriptive(&fields("A Maze", Partition::Curated), t1)
            .await
            .unwrap();
        let id = store.snapshot().await[0].id;
        store
            .apply_scrape_result(
                id,
                &ScrapeFields {
                    image_url: Some("https://img.example/a.png".into()),
                    ..Default::default()
                },
                VerificationStatus::Verified,
                t1,
            )
            .await
            .unwrap();

        let t2 = t1 + chrono::Duration::seconds(5);
        let mut updated = fields("A Maze", Partition::Curated);
        updated.comments = "moved dates".to_string();
        store.upsert_descriptive(&updated, t2).await.unwrap();

        let record = store.get_festival(id).await.unwrap();
        assert_eq!(record.comments, "moved dates");
        assert_eq!(record.slug, "a-maze");
        assert_eq!(record.last_synced_epoch, Some(t2));
        let enrichment = record.enrichment.expect("enrichment kept");
        assert_eq!(enrichment.image_url.as_deref(), Some("https://img.example/a.png"));
        assert_eq!(enrichment.status, VerificationStatus::Verified);
    }

    #[tokio::test]
    async fn scrape_selector_skips_verified_records() {
        let store = MemoryFestivalStore::new();
        let epoch = Utc::now();
        store
            .upsert_descriptive(&fields("Pending Fest", Partition::Curated), epoch)
            .await
            .unwrap();
        store
            .upsert_descriptive(&fields("Verified Fest", Partition::Curated), epoch)
            .await
            .unwrap();
        let verified = store.get_festival_by_slug("verified-fest").await.unwrap();
        store
            .apply_scrape_result(
                verified.id,
                &ScrapeFields::default(),
                VerificationStatus::Verified,
                epoch,
            )
            .await
            .unwrap();

        let selected = store.select_for_scrape(false, 0).await.unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "Pending Fest");

        let forced = store.select_for_scrape(true, 0).await.unwrap();
        assert_eq!(forced.len(), 2);
    }

    #[tokio::test]
    async fn ai_selector_honors_min_version() {
        let store = MemoryFestivalStore::new();
        let epoch = Utc::now();
        store
            .upsert_descriptive(&fields("Old Version", Partition::Curated), epoch)
            .await
            .unwrap();
        let record = store.get_festival_by_slug("old-version").await.unwrap();
        store
            .apply_ai_result(record.id, None, 1, AiStatus::Enriched, epoch)
            .await
            .unwrap();

        assert!(store.select_for_ai(false, 1, 0).await.unwrap().is_empty());
        let bumped = store.select_for_ai(false, 2, 0).await.unwrap();
        assert_eq!(bumped.len(), 1);
    }

    #[tokio::test]
    async fn list_filters_searches_and_paginates() {
        let store = MemoryFestivalStore::new();
        let epoch = Utc::now();
        for name in ["Alpha Jam", "Beta Showcase", "Gamma Expo"] {
            store
                .upsert_descriptive(&fields(name, Partition::Curated), epoch)
                .await
                .unwrap();
        }
        let mut jam = fields("Delta Jam", Partition::UnderConsideration);
        jam.submission_open = false;
        store.upsert_descriptive(&jam, epoch).await.unwrap();

        let page = store
            .list_festivals(&FestivalQuery {
                search: Some("jam".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 2);

        let curated = store
            .list_festivals(&FestivalQuery {
                partition: Some(Partition::Curated),
                limit: 2,
                offset: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(curated.total, 3);
        assert_eq!(curated.items.len(), 1);
        assert_eq!(curated.items[0].name, "Gamma Expo");

        let open = store
            .list_festivals(&FestivalQuery {
                submission_open: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(open.total, 1);
        assert_eq!(open.items[0].name, "Delta Jam");
    }
}
