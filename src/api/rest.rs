// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`.  Health is public; status and manual
// job triggers require a valid Bearer token checked via `AuthBearer`.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::market_data::trade_stream::StreamState;
use crate::scheduler::JobName;

/// Build the REST router with CORS, request tracing and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/status", get(status))
        .route("/api/v1/jobs/:name/run", post(run_job))
        // ── Middleware & State ───────────────────────────────────────
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    trade_stream: StreamState,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        trade_stream: state.stream_stats.state(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Status (authenticated)
// =============================================================================

async fn status(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

// =============================================================================
// Manual job trigger (authenticated)
// =============================================================================

#[derive(Serialize)]
struct JobAccepted {
    job: JobName,
    run_id: uuid::Uuid,
}

async fn run_job(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let job: JobName = match name.parse() {
        Ok(job) => job,
        Err(e) => {
            return (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": e })))
                .into_response()
        }
    };

    match state.scheduler.try_spawn(job) {
        Some(run_id) => {
            info!(job = %job, run_id = %run_id, "job triggered via API");
            (StatusCode::ACCEPTED, Json(JobAccepted { job, run_id })).into_response()
        }
        None => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": format!("{job} is already running") })),
        )
            .into_response(),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::error::SyncResult;
    use crate::market_data::candle_sync::{CandleSource, CandleSyncSettings, PageRequest};
    use crate::market_data::instrument_sync::InstrumentSource;
    use crate::market_data::{CandleSyncEngine, InstrumentSynchronizer, StreamStats};
    use crate::scheduler::Scheduler;
    use crate::store::MemoryStore;
    use crate::types::{Candle, Instrument};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use tokio::sync::Notify;
    use tower::ServiceExt;

    /// Candle fetches wait until released, so a run stays in flight.
    #[derive(Default)]
    struct GatedSource {
        release: Notify,
    }

    #[async_trait]
    impl InstrumentSource for GatedSource {
        async fn instruments(&self) -> SyncResult<Vec<Instrument>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl CandleSource for GatedSource {
        async fn candles(&self, _req: &PageRequest) -> SyncResult<Vec<Candle>> {
            self.release.notified().await;
            Ok(Vec::new())
        }
    }

    fn state(token: Option<&str>) -> (Arc<AppState>, Arc<GatedSource>) {
        let mut config = AppConfig::default();
        config.api.admin_token = token.map(str::to_string);

        let source = Arc::new(GatedSource::default());
        let store = Arc::new(MemoryStore::new());
        let instruments = Arc::new(InstrumentSynchronizer::new(source.clone(), store.clone()));
        let candles = Arc::new(CandleSyncEngine::new(
            source.clone(),
            store.clone(),
            store,
            CandleSyncSettings::from_config(&config),
        ));
        let scheduler = Arc::new(Scheduler::new(instruments, candles));
        let state = Arc::new(AppState::new(
            &config,
            scheduler,
            Arc::new(StreamStats::default()),
        ));
        (state, source)
    }

    fn post(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut req = Request::builder().method("POST").uri(uri);
        if let Some(t) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {t}"));
        }
        req.body(Body::empty()).unwrap()
    }

    async fn json_body(resp: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let (state, _) = state(None);
        let resp = router(state)
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["trade_stream"], "disconnected");
    }

    #[tokio::test]
    async fn status_requires_token() {
        let (state, _) = state(Some("s3cret"));
        let app = router(state);

        let denied = app
            .clone()
            .oneshot(Request::get("/api/v1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);

        let ok = app
            .oneshot(
                Request::get("/api/v1/status")
                    .header(header::AUTHORIZATION, "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let body = json_body(ok).await;
        assert_eq!(body["pairs"][0], "BTC-USDT");
        assert_eq!(body["jobs"].as_array().unwrap().len(), 3);
        assert_eq!(body["jobs"][1]["name"], "backfill");
    }

    #[tokio::test]
    async fn unconfigured_token_rejects_everything() {
        let (state, _) = state(None);
        let resp = router(state)
            .oneshot(post("/api/v1/jobs/refresh/run", Some("anything")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn trigger_conflicts_while_candle_job_runs() {
        let (state, source) = state(Some("t"));
        let app = router(state.clone());

        let first = app
            .clone()
            .oneshot(post("/api/v1/jobs/backfill/run", Some("t")))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        let body = json_body(first).await;
        assert_eq!(body["job"], "backfill");

        let second = app
            .clone()
            .oneshot(post("/api/v1/jobs/refresh/run", Some("t")))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);

        let other = app
            .clone()
            .oneshot(post("/api/v1/jobs/instruments/run", Some("t")))
            .await
            .unwrap();
        assert_eq!(other.status(), StatusCode::ACCEPTED);

        source.release.notify_one();
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let (state, _) = state(Some("t"));
        let resp = router(state)
            .oneshot(post("/api/v1/jobs/vacuum/run", Some("t")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
