//! Postgres-backed [`FestivalStore`]. Descriptive fields live in typed
//! columns; the enrichment sub-documents live in JSONB so a sync-pass upsert
//! can never clobber them.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use igfa_core::{
    derive_slug, AiEnrichment, AiProfile, AiStatus, DescriptiveFields, FestivalRecord, Partition,
    ScrapeEnrichment, ScrapeFields, SteamFeatureRecord, SteamYear, SyncAuditEntry, SyncStatus,
    VerificationStatus, YearSlot,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, QueryBuilder, Row};
use uuid::Uuid;

use crate::{
    FestivalQuery, FestivalStats, FestivalStore, Page, SortField, SortOrder, SteamFeatureStats,
    StoreError,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS festivals (
    id UUID PRIMARY KEY,
    slug TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    partition TEXT NOT NULL,
    festival_type TEXT NOT NULL DEFAULT '',
    when_text TEXT NOT NULL DEFAULT '',
    deadline TEXT,
    submission_open BOOLEAN NOT NULL DEFAULT FALSE,
    price TEXT NOT NULL DEFAULT '',
    worth_it TEXT NOT NULL DEFAULT '',
    comments TEXT NOT NULL DEFAULT '',
    official_page TEXT NOT NULL DEFAULT '',
    steam_page TEXT NOT NULL DEFAULT '',
    days_to_submit BIGINT,
    last_synced_epoch TIMESTAMPTZ,
    enrichment JSONB,
    ai_enrichment JSONB,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    UNIQUE (name, partition)
);

CREATE TABLE IF NOT EXISTS steam_features (
    name TEXT PRIMARY KEY,
    year_2023_status TEXT NOT NULL DEFAULT '',
    year_2023_detail TEXT NOT NULL DEFAULT '',
    year_2024_status TEXT NOT NULL DEFAULT '',
    year_2024_detail TEXT NOT NULL DEFAULT '',
    year_2025_status TEXT NOT NULL DEFAULT '',
    year_2025_detail TEXT NOT NULL DEFAULT '',
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_audits (
    id UUID PRIMARY KEY,
    ran_at TIMESTAMPTZ NOT NULL,
    partitions TEXT[] NOT NULL,
    festivals_synced BIGINT NOT NULL,
    steam_features_synced BIGINT NOT NULL,
    deleted BIGINT NOT NULL,
    status TEXT NOT NULL,
    errors TEXT[] NOT NULL
);
"#;

pub struct PgFestivalStore {
    pool: PgPool,
}

impl PgFestivalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    /// Idempotent schema bootstrap.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn sort_column(sort: SortField) -> &'static str {
    match sort {
        SortField::Name => "name",
        SortField::FestivalType => "festival_type",
        SortField::Deadline => "deadline",
        SortField::SubmissionOpen => "submission_open",
        SortField::DaysToSubmit => "days_to_submit",
        SortField::UpdatedAt => "updated_at",
    }
}

fn row_to_festival(row: &PgRow) -> Result<FestivalRecord, StoreError> {
    let partition: String = row.try_get("partition")?;
    let partition = partition
        .parse::<Partition>()
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let enrichment: Option<serde_json::Value> = row.try_get("enrichment")?;
    let enrichment: Option<ScrapeEnrichment> = enrichment
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| StoreError::Corrupt(format!("enrichment: {e}")))?;
    let ai_enrichment: Option<serde_json::Value> = row.try_get("ai_enrichment")?;
    let ai_enrichment: Option<AiEnrichment> = ai_enrichment
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| StoreError::Corrupt(format!("ai_enrichment: {e}")))?;

    Ok(FestivalRecord {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        name: row.try_get("name")?,
        partition,
        festival_type: row.try_get("festival_type")?,
        when_text: row.try_get("when_text")?,
        deadline: row.try_get("deadline")?,
        submission_open: row.try_get("submission_open")?,
        price: row.try_get("price")?,
        worth_it: row.try_get("worth_it")?,
        comments: row.try_get("comments")?,
        official_page: row.try_get("official_page")?,
        steam_page: row.try_get("steam_page")?,
        days_to_submit: row.try_get("days_to_submit")?,
        last_synced_epoch: row.try_get("last_synced_epoch")?,
        enrichment,
        ai_enrichment,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_steam(row: &PgRow) -> Result<SteamFeatureRecord, StoreError> {
    Ok(SteamFeatureRecord {
        name: row.try_get("name")?,
        year_2023: YearSlot {
            status: row.try_get("year_2023_status")?,
            detail: row.try_get("year_2023_detail")?,
        },
        year_2024: YearSlot {
            status: row.try_get("year_2024_status")?,
            detail: row.try_get("year_2024_detail")?,
        },
        year_2025: YearSlot {
            status: row.try_get("year_2025_status")?,
            detail: row.try_get("year_2025_detail")?,
        },
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_audit(row: &PgRow) -> Result<SyncAuditEntry, StoreError> {
    let partitions: Vec<String> = row.try_get("partitions")?;
    let partitions = partitions
        .iter()
        .map(|p| p.parse::<Partition>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let status: String = row.try_get("status")?;
    let status = match status.as_str() {
        "success" => SyncStatus::Success,
        "partial" => SyncStatus::Partial,
        "failed" => SyncStatus::Failed,
        other => return Err(StoreError::Corrupt(format!("audit status: {other}"))),
    };
    Ok(SyncAuditEntry {
        id: row.try_get("id")?,
        ran_at: row.try_get("ran_at")?,
        partitions,
        festivals_synced: row.try_get::<i64, _>("festivals_synced")? as u64,
        steam_features_synced: row.try_get::<i64, _>("steam_features_synced")? as u64,
        deleted: row.try_get::<i64, _>("deleted")? as u64,
        status,
        errors: row.try_get("errors")?,
    })
}

fn status_str(status: SyncStatus) -> &'static str {
    match status {
        SyncStatus::Success => "success",
        SyncStatus::Partial => "partial",
        SyncStatus::Failed => "failed",
    }
}

fn apply_filters<'a>(builder: &mut QueryBuilder<'a, sqlx::Postgres>, query: &'a FestivalQuery) {
    builder.push(" WHERE TRUE");
    if let Some(partition) = query.partition {
        builder.push(" AND partition = ").push_bind(partition.as_str());
    }
    if let Some(festival_type) = &query.festival_type {
        builder
            .push(" AND LOWER(festival_type) = LOWER(")
            .push_bind(festival_type)
            .push(")");
    }
    if let Some(open) = query.submission_open {
        builder.push(" AND submission_open = ").push_bind(open);
    }
    if let Some(search) = &query.search {
        let pattern = format!("%{search}%");
        builder
            .push(" AND (name ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR comments ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR festival_type ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

#[async_trait]
impl FestivalStore for PgFestivalStore {
    async fn upsert_descriptive(
        &self,
        fields: &DescriptiveFields,
        epoch: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let existing: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM festivals WHERE name = $1 AND partition = $2")
                .bind(&fields.name)
                .bind(fields.partition.as_str())
                .fetch_optional(&self.pool)
                .await?;

        if let Some(id) = existing {
            sqlx::query(
                r#"
                UPDATE festivals
                   SET festival_type = $2, when_text = $3, deadline = $4,
                       submission_open = $5, price = $6, worth_it = $7,
                       comments = $8, official_page = $9, steam_page = $10,
                       days_to_submit = $11, last_synced_epoch = $12,
                       updated_at = $12
                 WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(&fields.festival_type)
            .bind(&fields.when_text)
            .bind(&fields.deadline)
            .bind(fields.submission_open)
            .bind(&fields.price)
            .bind(&fields.worth_it)
            .bind(&fields.comments)
            .bind(&fields.official_page)
            .bind(&fields.steam_page)
            .bind(fields.days_to_submit)
            .bind(epoch)
            .execute(&self.pool)
            .await?;
            return Ok(());
        }

        let base = derive_slug(&fields.name);
        let taken: HashSet<String> =
            sqlx::query_scalar::<_, String>("SELECT slug FROM festivals WHERE slug LIKE $1")
                .bind(format!("{base}%"))
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .collect();
        let mut slug = base.clone();
        let mut n = 2u32;
        while taken.contains(&slug) {
            slug = format!("{base}-{n}");
            n += 1;
        }

        sqlx::query(
            r#"
            INSERT INTO festivals (
                id, slug, name, partition, festival_type, when_text, deadline,
                submission_open, price, worth_it, comments, official_page,
                steam_page, days_to_submit, last_synced_epoch, created_at,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                      $14, $15, $15, $15)
            ON CONFLICT (name, partition) DO UPDATE
               SET festival_type = EXCLUDED.festival_type,
                   when_text = EXCLUDED.when_text,
                   deadline = EXCLUDED.deadline,
                   submission_open = EXCLUDED.submission_open,
                   price = EXCLUDED.price,
                   worth_it = EXCLUDED.worth_it,
                   comments = EXCLUDED.comments,
                   official_page = EXCLUDED.official_page,
                   steam_page = EXCLUDED.steam_page,
                   days_to_submit = EXCLUDED.days_to_submit,
                   last_synced_epoch = EXCLUDED.last_synced_epoch,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&slug)
        .bind(&fields.name)
        .bind(fields.partition.as_str())
        .bind(&fields.festival_type)
        .bind(&fields.when_text)
        .bind(&fields.deadline)
        .bind(fields.submission_open)
        .bind(&fields.price)
        .bind(&fields.worth_it)
        .bind(&fields.comments)
        .bind(&fields.official_page)
        .bind(&fields.steam_page)
        .bind(fields.days_to_submit)
        .bind(epoch)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_stale(
        &self,
        partition: Partition,
        epoch: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM festivals
             WHERE partition = $1
               AND (last_synced_epoch IS NULL OR last_synced_epoch < $2)
            "#,
        )
        .bind(partition.as_str())
        .bind(epoch)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_partition(&self, partition: Partition) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM festivals WHERE partition = $1")
                .bind(partition.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn list_festivals(
        &self,
        query: &FestivalQuery,
    ) -> Result<Page<FestivalRecord>, StoreError> {
        let mut count_builder = QueryBuilder::new("SELECT COUNT(*) FROM festivals");
        apply_filters(&mut count_builder, query);
        let total: i64 = count_builder
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let mut builder = QueryBuilder::new("SELECT * FROM festivals");
        apply_filters(&mut builder, query);
        builder.push(" ORDER BY ");
        builder.push(sort_column(query.sort));
        builder.push(match query.order {
            SortOrder::Asc => " ASC",
            SortOrder::Desc => " DESC",
        });
        builder.push(", name ASC");
        if query.limit > 0 {
            builder.push(" LIMIT ").push_bind(query.limit as i64);
        }
        if query.offset > 0 {
            builder.push(" OFFSET ").push_bind(query.offset as i64);
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        let items = rows
            .iter()
            .map(row_to_festival)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page {
            items,
            total: total as u64,
        })
    }

    async fn get_festival(&self, id: Uuid) -> Result<FestivalRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM festivals WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        row_to_festival(&row)
    }

    async fn get_festival_by_slug(&self, slug: &str) -> Result<FestivalRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM festivals WHERE slug = $1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        row_to_festival(&row)
    }

    async fn festival_stats(&self) -> Result<FestivalStats, StoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM festivals")
            .fetch_one(&self.pool)
            .await?;
        let open: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM festivals WHERE submission_open")
                .fetch_one(&self.pool)
                .await?;

        let mut by_partition = BTreeMap::new();
        let rows = sqlx::query("SELECT partition, COUNT(*) AS n FROM festivals GROUP BY partition")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let partition: String = row.try_get("partition")?;
            let n: i64 = row.try_get("n")?;
            by_partition.insert(partition, n as u64);
        }

        let mut by_type = BTreeMap::new();
        let rows = sqlx::query(
            "SELECT festival_type, COUNT(*) AS n FROM festivals WHERE festival_type <> '' GROUP BY festival_type",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let festival_type: String = row.try_get("festival_type")?;
            let n: i64 = row.try_get("n")?;
            by_type.insert(festival_type, n as u64);
        }

        Ok(FestivalStats {
            total: total as u64,
            by_partition,
            by_type,
            open_submissions: open as u64,
        })
    }

    async fn distinct_types(&self) -> Result<Vec<String>, StoreError> {
        let types = sqlx::query_scalar(
            "SELECT DISTINCT festival_type FROM festivals WHERE festival_type <> '' ORDER BY festival_type",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(types)
    }

    async fn select_for_scrape(
        &self,
        force: bool,
        limit: u64,
    ) -> Result<Vec<FestivalRecord>, StoreError> {
        let mut builder = QueryBuilder::new("SELECT * FROM festivals WHERE (");
        builder.push_bind(force);
        builder.push(" OR enrichment IS NULL OR enrichment->>'status' = 'pending') ORDER BY name ASC");
        if limit > 0 {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_festival).collect()
    }

    async fn select_for_ai(
        &self,
        force: bool,
        min_version: i64,
        limit: u64,
    ) -> Result<Vec<FestivalRecord>, StoreError> {
        let mut builder = QueryBuilder::new("SELECT * FROM festivals WHERE (");
        builder.push_bind(force);
        builder.push(" OR ai_enrichment IS NULL OR ai_enrichment->>'status' = 'pending'");
        builder
            .push(" OR (ai_enrichment->>'version')::BIGINT < ")
            .push_bind(min_version);
        builder.push(") ORDER BY name ASC");
        if limit > 0 {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_festival).collect()
    }

    async fn apply_scrape_result(
        &self,
        id: Uuid,
        fields: &ScrapeFields,
        status: VerificationStatus,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let record = self.get_festival(id).await?;
        let mut enrichment = record
            .enrichment
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

        let json = serde_json::to_value(&enrichment)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        sqlx::query("UPDATE festivals SET enrichment = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(json)
            .bind(checked_at)
            .execute(&self.pool)
            .await?;
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
        let enrichment = AiEnrichment {
            profile: profile.cloned(),
            version,
            status,
            enriched_at: Some(enriched_at),
        };
        let json = serde_json::to_value(&enrichment)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let result =
            sqlx::query("UPDATE festivals SET ai_enrichment = $2, updated_at = $3 WHERE id = $1")
                .bind(id)
                .bind(json)
                .bind(enriched_at)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn upsert_steam_feature(&self, record: &SteamFeatureRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO steam_features (
                name, year_2023_status, year_2023_detail, year_2024_status,
                year_2024_detail, year_2025_status, year_2025_detail, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (name) DO UPDATE
               SET year_2023_status = EXCLUDED.year_2023_status,
                   year_2023_detail = EXCLUDED.year_2023_detail,
                   year_2024_status = EXCLUDED.year_2024_status,
                   year_2024_detail = EXCLUDED.year_2024_detail,
                   year_2025_status = EXCLUDED.year_2025_status,
                   year_2025_detail = EXCLUDED.year_2025_detail,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.name)
        .bind(&record.year_2023.status)
        .bind(&record.year_2023.detail)
        .bind(&record.year_2024.status)
        .bind(&record.year_2024.detail)
        .bind(&record.year_2025.status)
        .bind(&record.year_2025.detail)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_steam_features(&self) -> Result<Vec<SteamFeatureRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM steam_features ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_steam).collect()
    }

    async fn get_steam_feature(&self, name: &str) -> Result<SteamFeatureRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM steam_features WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        row_to_steam(&row)
    }

    async fn steam_feature_stats(&self) -> Result<SteamFeatureStats, StoreError> {
        let records = self.list_steam_features().await?;
        let mut stats = SteamFeatureStats {
            total: records.len() as u64,
            by_year: BTreeMap::new(),
        };
        for record in &records {
            for year in SteamYear::ALL {
                if !record.slot(year).status.is_empty() {
                    *stats.by_year.entry(year.as_u16()).or_default() += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn insert_audit(&self, entry: &SyncAuditEntry) -> Result<(), StoreError> {
        let partitions: Vec<String> = entry
            .partitions
            .iter()
            .map(|p| p.as_str().to_string())
            .collect();
        sqlx::query(
            r#"
            INSERT INTO sync_audits (
                id, ran_at, partitions, festivals_synced, steam_features_synced,
                deleted, status, errors
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.ran_at)
        .bind(partitions)
        .bind(entry.festivals_synced as i64)
        .bind(entry.steam_features_synced as i64)
        .bind(entry.deleted as i64)
        .bind(status_str(entry.status))
        .bind(&entry.errors)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_audits(&self, limit: u64) -> Result<Vec<SyncAuditEntry>, StoreError> {
        let mut builder = QueryBuilder::new("SELECT * FROM sync_audits ORDER BY ran_at DESC");
        if limit > 0 {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_audit).collect()
    }
}
