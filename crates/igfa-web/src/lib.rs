//! JSON read API plus secret-guarded trigger endpoints for sync and
//! enrichment.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use igfa_adapters::FestivalSource;
use igfa_core::{FestivalRecord, Partition, SteamYear, SyncAuditEntry, YearSlot};
use igfa_enrich::{
    run_ai_pass, run_scrape_pass, AiStrategy, EnrichOptions, EnrichmentReport, ScrapeStrategy,
};
use igfa_storage::{
    FestivalQuery, FestivalStats, FestivalStore, SortField, SortOrder, SteamFeatureStats,
    StoreError,
};
use igfa_sync::{FullRunReport, PostSyncPipeline, SyncSettings};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "igfa-web";

const DEFAULT_PAGE_SIZE: u64 = 20;
const MAX_PAGE_SIZE: u64 = 100;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn FestivalStore>,
    pub pipeline: Arc<PostSyncPipeline>,
    pub scrape: Arc<dyn ScrapeStrategy>,
    pub ai: Arc<dyn AiStrategy>,
    pub sync_secret: String,
}

impl AppState {
    pub fn new(
        store: Arc<dyn FestivalStore>,
        source: Arc<dyn FestivalSource>,
        scrape: Arc<dyn ScrapeStrategy>,
        ai: Arc<dyn AiStrategy>,
        settings: SyncSettings,
    ) -> Self {
        let sync_secret = settings.sync_secret.clone();
        let pipeline = Arc::new(PostSyncPipeline::new(
            store.clone(),
            source,
            scrape.clone(),
            ai.clone(),
            settings,
        ));
        Self {
            store,
            pipeline,
            scrape,
            ai,
            sync_secret,
        }
    }
}

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized,
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ApiError::NotFound("record not found".to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::Internal(msg) => {
                warn!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/festivals", get(list_festivals_handler))
        .route("/api/festivals/stats", get(festival_stats_handler))
        .route("/api/festivals/types", get(festival_types_handler))
        .route("/api/festivals/slug/{slug}", get(festival_by_slug_handler))
        .route("/api/festivals/{id}", get(festival_by_id_handler))
        .route("/api/steam-features", get(list_steam_handler))
        .route("/api/steam-features/stats", get(steam_stats_handler))
        .route("/api/steam-features/year/{year}", get(steam_by_year_handler))
        .route("/api/steam-features/{name}", get(steam_by_name_handler))
        .route("/api/sync/audits", get(sync_audits_handler))
        .route("/api/sync", post(trigger_sync_handler))
        .route("/api/enrich/scrape", post(trigger_scrape_handler))
        .route("/api/enrich/ai", post(trigger_ai_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("IGFA_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct FestivalsQuery {
    partition: Option<String>,
    #[serde(rename = "type")]
    festival_type: Option<String>,
    open: Option<bool>,
    search: Option<String>,
    sort: Option<String>,
    order: Option<String>,
    page: Option<u64>,
    per_page: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FestivalsPage {
    items: Vec<FestivalRecord>,
    total: u64,
    total_pages: u64,
    page: u64,
    per_page: u64,
}

async fn list_festivals_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FestivalsQuery>,
) -> Result<Json<FestivalsPage>, ApiError> {
    let partition = match &query.partition {
        Some(raw) => Some(
            raw.parse::<Partition>()
                .map_err(|e| ApiError::BadRequest(e.to_string()))?,
        ),
        None => None,
    };
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query
        .per_page
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);

    let store_query = FestivalQuery {
        partition,
        festival_type: query.festival_type.clone(),
        submission_open: query.open,
        search: query.search.clone(),
        sort: query.sort.as_deref().map(SortField::parse).unwrap_or_default(),
        order: match query.order.as_deref() {
            Some("desc") => SortOrder::Desc,
            _ => SortOrder::Asc,
        },
        limit: per_page,
        offset: (page - 1) * per_page,
    };
    let result = state.store.list_festivals(&store_query).await?;
    Ok(Json(FestivalsPage {
        items: result.items,
        total: result.total,
        total_pages: result.total.div_ceil(per_page),
        page,
        per_page,
    }))
}

async fn festival_stats_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<FestivalStats>, ApiError> {
    Ok(Json(state.store.festival_stats().await?))
}

async fn festival_types_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.store.distinct_types().await?))
}

async fn festival_by_id_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<Json<FestivalRecord>, ApiError> {
    Ok(Json(state.store.get_festival(id).await?))
}

async fn festival_by_slug_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(slug): AxumPath<String>,
) -> Result<Json<FestivalRecord>, ApiError> {
    Ok(Json(state.store.get_festival_by_slug(&slug).await?))
}

async fn list_steam_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<igfa_core::SteamFeatureRecord>>, ApiError> {
    Ok(Json(state.store.list_steam_features().await?))
}

async fn steam_stats_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SteamFeatureStats>, ApiError> {
    Ok(Json(state.store.steam_feature_stats().await?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct YearFeatureRow {
    name: String,
    #[serde(flatten)]
    slot: YearSlot,
}

async fn steam_by_year_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(year): AxumPath<u16>,
) -> Result<Json<Vec<YearFeatureRow>>, ApiError> {
    let year = SteamYear::try_from(year).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let rows = state
        .store
        .list_steam_features()
        .await?
        .into_iter()
        .filter(|record| !record.slot(year).status.is_empty())
        .map(|record| YearFeatureRow {
            slot: record.slot(year).clone(),
            name: record.name,
        })
        .collect();
    Ok(Json(rows))
}

async fn steam_by_name_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Result<Json<igfa_core::SteamFeatureRecord>, ApiError> {
    Ok(Json(state.store.get_steam_feature(&name).await?))
}

#[derive(Debug, Deserialize, Default)]
struct AuditsQuery {
    limit: Option<u64>,
}

async fn sync_audits_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditsQuery>,
) -> Result<Json<Vec<SyncAuditEntry>>, ApiError> {
    let limit = query.limit.unwrap_or(10).clamp(1, MAX_PAGE_SIZE);
    Ok(Json(state.store.recent_audits(limit).await?))
}

/// Exact-match bearer check. A blank configured secret disables the trigger
/// endpoints outright rather than leaving them open.
fn require_secret(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if state.sync_secret.is_empty() {
        return Err(ApiError::Unauthorized);
    }
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    if presented == state.sync_secret {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

async fn trigger_sync_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<FullRunReport>, ApiError> {
    require_secret(&state, &headers)?;
    let report = state
        .pipeline
        .run()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct EnrichRequest {
    #[serde(default)]
    force: bool,
    limit: Option<u64>,
    delay_ms: Option<u64>,
}

impl EnrichRequest {
    fn options(&self, default_delay_ms: u64) -> EnrichOptions {
        let defaults = EnrichOptions::default();
        EnrichOptions {
            force: self.force,
            limit: self.limit.unwrap_or(defaults.limit),
            delay: std::time::Duration::from_millis(self.delay_ms.unwrap_or(default_delay_ms)),
            ..defaults
        }
    }
}

const SCRAPE_DELAY_MS: u64 = 1500;
// AI endpoints rate-limit harder than festival sites.
const AI_DELAY_MS: u64 = 2000;

async fn trigger_scrape_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<EnrichRequest>>,
) -> Result<Json<EnrichmentReport>, ApiError> {
    require_secret(&state, &headers)?;
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let report = run_scrape_pass(
        state.store.as_ref(),
        state.scrape.as_ref(),
        request.options(SCRAPE_DELAY_MS),
    )
    .await?;
    Ok(Json(report))
}

async fn trigger_ai_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<EnrichRequest>>,
) -> Result<Json<EnrichmentReport>, ApiError> {
    require_secret(&state, &headers)?;
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let report =
        run_ai_pass(state.store.as_ref(), state.ai.as_ref(), request.options(AI_DELAY_MS)).await?;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use igfa_adapters::{
        FestivalColumns, FestivalSheet, RawRow, SourceError, SteamColumns, SteamSheet,
    };
    use igfa_core::{AiProfile, DescriptiveFields, ScrapeFields, SteamFeatureRecord};
    use igfa_enrich::{Outcome, StrategyError};
    use igfa_storage::MemoryFestivalStore;
    use tower::ServiceExt;

    struct EmptySource;

    #[async_trait]
    impl FestivalSource for EmptySource {
        async fn fetch_festivals(
            &self,
            partition: Partition,
        ) -> Result<FestivalSheet, SourceError> {
            let _ = partition;
            Ok(FestivalSheet {
                columns: FestivalColumns {
                    name: 0,
                    festival_type: 1,
                    when_text: 2,
                    deadline: 3,
                    submission_open: 4,
                    price: 5,
                    worth_it: 6,
                    comments: 7,
                    official_page: 8,
                    steam_page: 9,
                    days_to_submit: 10,
                },
                rows: vec![RawRow {
                    cells: vec!["Synced Fest".to_string(), "showcase".to_string()],
                }],
            })
        }

        async fn fetch_steam_features(&self) -> Result<SteamSheet, SourceError> {
            Ok(SteamSheet {
                columns: SteamColumns {
                    name: 0,
                    status_2023: 1,
                    detail_2023: 2,
                    status_2024: 3,
                    detail_2024: 4,
                    status_2025: 5,
                    detail_2025: 6,
                },
                rows: Vec::new(),
            })
        }
    }

    struct NoopScrape;

    #[async_trait]
    impl ScrapeStrategy for NoopScrape {
        async fn enrich(
            &self,
            _record: &FestivalRecord,
        ) -> Result<Outcome<ScrapeFields>, StrategyError> {
            Ok(Outcome::Found(ScrapeFields {
                description: Some("found by test strategy".to_string()),
                ..Default::default()
            }))
        }
    }

    struct NoopAi;

    #[async_trait]
    impl AiStrategy for NoopAi {
        async fn lookup(
            &self,
            record: &FestivalRecord,
        ) -> Result<Outcome<AiProfile>, StrategyError> {
            Ok(Outcome::Found(AiProfile {
                entity: record.name.clone(),
                ..Default::default()
            }))
        }
    }

    fn fields(name: &str, partition: Partition, festival_type: &str) -> DescriptiveFields {
        DescriptiveFields {
            name: name.to_string(),
            partition,
            festival_type: festival_type.to_string(),
            when_text: String::new(),
            deadline: None,
            submission_open: false,
            price: String::new(),
            worth_it: String::new(),
            comments: String::new(),
            official_page: String::new(),
            steam_page: String::new(),
            days_to_submit: None,
        }
    }

    async fn seeded_state(secret: &str) -> (AppState, Arc<MemoryFestivalStore>) {
        let store = Arc::new(MemoryFestivalStore::new());
        let epoch = Utc::now();
        for (name, partition, ty) in [
            ("Alpha Fest", Partition::Curated, "showcase"),
            ("Bravo Fest", Partition::Curated, "conference"),
            ("Charlie Fest", Partition::UnderConsideration, "showcase"),
        ] {
            store
                .upsert_descriptive(&fields(name, partition, ty), epoch)
                .await
                .unwrap();
        }
        store
            .upsert_steam_feature(&SteamFeatureRecord {
                name: "Alpha Fest".to_string(),
                year_2023: YearSlot {
                    status: "Featured".to_string(),
                    detail: "Next Fest".to_string(),
                },
                year_2024: YearSlot::default(),
                year_2025: YearSlot::default(),
                updated_at: epoch,
            })
            .await
            .unwrap();

        let settings = SyncSettings {
            scheduler_enabled: false,
            sync_cron: "0 6 * * *".to_string(),
            sync_secret: secret.to_string(),
            enrich_limit: 10,
            enrich_delay: std::time::Duration::ZERO,
        };
        let state = AppState::new(
            store.clone(),
            Arc::new(EmptySource),
            Arc::new(NoopScrape),
            Arc::new(NoopAi),
            settings,
        );
        (state, store)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn list_festivals_filters_and_paginates() {
        let (state, _store) = seeded_state("s3cret").await;
        let app = app(state);

        let (status, body) = get_json(app.clone(), "/api/festivals?partition=curated").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);
        assert_eq!(body["items"][0]["name"], "Alpha Fest");

        let (status, body) = get_json(app.clone(), "/api/festivals?perPage=1&page=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 3);
        assert_eq!(body["totalPages"], 3);
        assert_eq!(body["items"].as_array().unwrap().len(), 1);
        assert_eq!(body["items"][0]["name"], "Bravo Fest");

        let (status, body) = get_json(app, "/api/festivals?partition=bogus").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("bogus"));
    }

    #[tokio::test]
    async fn festival_lookup_by_slug_and_missing_is_404_json() {
        let (state, _store) = seeded_state("s3cret").await;
        let app = app(state);

        let (status, body) = get_json(app.clone(), "/api/festivals/slug/alpha-fest").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["partition"], "curated");

        let (status, body) = get_json(app, "/api/festivals/slug/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn steam_year_endpoint_rejects_unsupported_years() {
        let (state, _store) = seeded_state("s3cret").await;
        let app = app(state);

        let (status, body) = get_json(app.clone(), "/api/steam-features/year/2023").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["name"], "Alpha Fest");
        assert_eq!(body[0]["status"], "Featured");

        let (status, _body) = get_json(app, "/api/steam-features/year/2022").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn trigger_endpoints_require_exact_bearer_secret() {
        let (state, store) = seeded_state("s3cret").await;
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/sync")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/sync")
                    .header("authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        // A rejected trigger must not run the pipeline.
        assert!(store.recent_audits(10).await.unwrap().is_empty());

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/sync")
                    .header("authorization", "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(store.recent_audits(10).await.unwrap().len(), 1);
        assert!(store.get_festival_by_slug("synced-fest").await.is_ok());
    }

    #[tokio::test]
    async fn blank_secret_disables_triggers() {
        let (state, _store) = seeded_state("").await;
        let app = app(state);

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/sync")
                    .header("authorization", "Bearer ")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn scrape_trigger_honors_request_options() {
        let (state, store) = seeded_state("s3cret").await;
        let app = app(state);

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/enrich/scrape")
                    .header("authorization", "Bearer s3cret")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"limit":1,"delayMs":0}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let report: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(report["considered"], 1);
        assert_eq!(report["succeeded"], 1);

        let enriched = store.get_festival_by_slug("alpha-fest").await.unwrap();
        assert_eq!(
            enriched
                .enrichment
                .unwrap()
                .description
                .as_deref(),
            Some("found by test strategy")
        );
    }

    #[tokio::test]
    async fn audits_endpoint_lists_recent_runs_first() {
        let (state, store) = seeded_state("s3cret").await;
        let now = Utc::now();
        for i in 0..3 {
            store
                .insert_audit(&SyncAuditEntry {
                    id: Uuid::new_v4(),
                    ran_at: now + chrono::Duration::seconds(i),
                    partitions: Partition::ALL.to_vec(),
                    festivals_synced: i as u64,
                    steam_features_synced: 0,
                    deleted: 0,
                    status: igfa_core::SyncStatus::Success,
                    errors: Vec::new(),
                })
                .await
                .unwrap();
        }
        let app = app(state);

        let (status, body) = get_json(app, "/api/sync/audits?limit=2").await;
        assert_eq!(status, StatusCode::OK);
        let items = body.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["festivalsSynced"], 2);
    }
}
