// =============================================================================
// Query Surface — read-only HTTP access to persisted alerts
// =============================================================================
//
// Mirrors the teacher's `api/rest.rs` router shape, adapted for §6's
// cross-origin-with-credentials requirement: the origin is mirrored per
// request rather than wildcarded (tower-http refuses to combine a wildcard
// origin with `allow_credentials`), handlers return `impl IntoResponse` via
// `Json`/`serde_json::json!`. This surface is unauthenticated by design (§1
// scopes auth out) — every route is public. Bad input (unknown
// symbol/severity) returns an empty result set, never a 404 or 500 (§7).
// =============================================================================

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use tower_http::cors::{Any, AllowOrigin, CorsLayer};
use tracing::instrument;

use crate::core::Core;

const SERVICE_NAME: &str = "confluence-sentinel";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn router(core: Arc<Core>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_credentials(true);

    Router::new()
        .route("/", get(root))
        .route("/api/health", get(health))
        .route("/api/alerts", get(list_all))
        .route("/api/alerts/:symbol", get(list_by_symbol))
        .route("/api/alerts/severity/:severity", get(list_by_severity))
        .route("/api/stats", get(stats))
        .route("/api/cleanup", post(cleanup))
        .layer(cors)
        .with_state(core)
}

fn window_start(core: &Core, now: i64) -> i64 {
    now - core.config().retention_hours * 3600 * 1000
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

async fn root(State(core): State<Arc<Core>>) -> impl IntoResponse {
    Json(json!({
        "status": format!("{:?}", core.state()),
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
        "endpoints": [
            "/api/health",
            "/api/alerts",
            "/api/alerts/:symbol",
            "/api/alerts/severity/:severity",
            "/api/stats",
            "/api/cleanup",
        ],
    }))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "timestamp": now_ms() }))
}

#[instrument(skip(core))]
async fn list_all(State(core): State<Arc<Core>>) -> impl IntoResponse {
    let now = now_ms();
    let since = window_start(&core, now);

    let store = core.alert_store_handle().read().clone();
    let Some(store) = store else {
        return Json(json!({ "alerts": [], "count": 0 }));
    };

    match store.list_all(since).await {
        Ok(alerts) => Json(json!({ "count": alerts.len(), "alerts": alerts })),
        Err(_) => Json(json!({ "alerts": [], "count": 0 })),
    }
}

#[instrument(skip(core))]
async fn list_by_symbol(State(core): State<Arc<Core>>, Path(symbol): Path<String>) -> impl IntoResponse {
    let now = now_ms();
    let since = window_start(&core, now);
    let symbol = symbol.to_ascii_uppercase();

    let store = core.alert_store_handle().read().clone();
    let Some(store) = store else {
        return Json(json!({ "alerts": [], "count": 0 }));
    };

    match store.list_by_symbol(&symbol, since).await {
        Ok(alerts) => Json(json!({ "count": alerts.len(), "alerts": alerts })),
        Err(_) => Json(json!({ "alerts": [], "count": 0 })),
    }
}

#[instrument(skip(core))]
async fn list_by_severity(State(core): State<Arc<Core>>, Path(severity): Path<String>) -> impl IntoResponse {
    let now = now_ms();
    let since = window_start(&core, now);
    let severity = severity.to_ascii_uppercase();

    let store = core.alert_store_handle().read().clone();
    let Some(store) = store else {
        return Json(json!({ "alerts": [], "count": 0 }));
    };

    match store.list_by_severity(&severity, since).await {
        Ok(alerts) => Json(json!({ "count": alerts.len(), "alerts": alerts })),
        Err(_) => Json(json!({ "alerts": [], "count": 0 })),
    }
}

#[instrument(skip(core))]
async fn stats(State(core): State<Arc<Core>>) -> impl IntoResponse {
    let now = now_ms();
    let since = window_start(&core, now);

    let store = core.alert_store_handle().read().clone();
    let Some(store) = store else {
        return Json(json!({ "totalAlerts": 0, "bySeverity": {}, "bySetupType": {} }));
    };

    match store.stats(since).await {
        Ok(s) => Json(json!({
            "totalAlerts": s.total_alerts,
            "bySeverity": s.by_severity,
            "bySetupType": s.by_setup_type,
        })),
        Err(_) => Json(json!({ "totalAlerts": 0, "bySeverity": {}, "bySetupType": {} })),
    }
}

#[instrument(skip(core))]
async fn cleanup(State(core): State<Arc<Core>>) -> impl IntoResponse {
    let now = now_ms();
    let cutoff = now - core.config().retention_hours * 3600 * 1000;

    let store = core.alert_store_handle().read().clone();
    let Some(store) = store else {
        return Json(json!({ "message": "alert store unavailable", "deletedCount": 0 }));
    };

    match store.prune(cutoff).await {
        Ok(deleted) => Json(json!({ "message": "cleanup complete", "deletedCount": deleted })),
        Err(_) => Json(json!({ "message": "cleanup failed", "deletedCount": 0 })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    async fn spawn_test_server() -> String {
        let core = Arc::new(Core::new(Config::default()));
        let app = router(core);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let base = spawn_test_server().await;
        let resp = reqwest::get(format!("{base}/api/health")).await.unwrap();
        assert!(resp.status().is_success());
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn alerts_endpoint_returns_empty_when_store_unavailable() {
        let base = spawn_test_server().await;
        let resp = reqwest::get(format!("{base}/api/alerts")).await.unwrap();
        assert!(resp.status().is_success());
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["count"], 0);
        assert_eq!(body["alerts"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn unknown_symbol_returns_empty_not_error() {
        let base = spawn_test_server().await;
        let resp = reqwest::get(format!("{base}/api/alerts/NOPEUSDT")).await.unwrap();
        assert!(resp.status().is_success());
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["count"], 0);
    }

    #[tokio::test]
    async fn root_lists_service_metadata() {
        let base = spawn_test_server().await;
        let resp = reqwest::get(base).await.unwrap();
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["service"], "confluence-sentinel");
    }
}
