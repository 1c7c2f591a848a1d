//! Admin API (port 8081) — operator-facing introspection endpoints.
//!
//! Kept on a separate port from the client API, as the teacher crate does,
//! so it can be network-restricted independently (e.g. reachable only from
//! an internal network, never exposed publicly).

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::router::RouterState;

/// Build the admin-facing axum router (port 8081).
pub fn router(state: Arc<RouterState>) -> Router {
    Router::new()
        .route("/admin/health", get(health))
        .route("/admin/backends", get(backends))
        .route("/admin/queue", get(queue))
        .route("/admin/config", get(config))
        .route("/metrics", get(crate::api::metrics::metrics))
        .with_state(state)
}

/// GET /admin/health — liveness plus a coarse fleet summary.
pub async fn health(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot();
    let now = chrono::Utc::now();
    let alive = snapshot.iter().filter(|b| b.alive && !b.is_excluded(now)).count();
    Json(json!({
        "status": "ok",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "backends_total": snapshot.len(),
        "backends_alive": alive,
    }))
}

/// GET /admin/backends — the full registry snapshot (spec §3), unredacted.
pub async fn backends(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let now = chrono::Utc::now();
    let backends: Vec<Value> = state
        .registry
        .snapshot()
        .into_iter()
        .map(|b| {
            json!({
                "id": b.id.to_string(),
                "declared_tier": b.declared_tier,
                "has_gpu": b.has_gpu,
                "gpu_memory_total_mb": b.gpu_memory_total_mb,
                "gpu_memory_free_mb": b.gpu_memory_free_mb,
                "cpu_capacity": b.cpu_capacity,
                "cpu_load_01": b.cpu_load_01,
                "alive": b.alive,
                "excluded": b.is_excluded(now),
                "excluded_until": b.excluded_until,
                "exclusion_episodes": b.exclusion_episodes,
                "failure_streak": b.failure_streak,
                "in_flight": b.in_flight,
                "latency_ewma_ms": b.latency_ewma_ms,
                "success_rate": b.success_rate,
                "success_rate_for_scoring": b.success_rate_for_scoring(),
                "sample_count": b.sample_count,
                "last_probe_at": b.last_probe_at,
                "resources_updated_at": b.resources_updated_at,
            })
        })
        .collect();
    Json(json!({ "backends": backends }))
}

/// GET /admin/queue — admission-layer depth and per-priority wait stats.
pub async fn queue(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    Json(state.queue.stats())
}

/// GET /admin/config — the live config with secrets redacted: only the name
/// of `admin_token_env` is shown, never its resolved value.
pub async fn config(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let cfg = state.config();
    Json(json!({
        "gateway": {
            "client_port": cfg.gateway.client_port,
            "admin_port": cfg.gateway.admin_port,
            "log_level": cfg.gateway.log_level,
            "admin_token_env": cfg.gateway.admin_token_env,
            "admin_auth_enabled": state.admin_token.is_some(),
        },
        "backends": cfg.backends,
        "queue": cfg.queue,
        "dispatcher": cfg.dispatcher,
        "health": cfg.health,
        "metrics": cfg.metrics,
        "analyzer": cfg.analyzer,
        "scoring": cfg.scoring,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    fn state() -> Arc<RouterState> {
        let config: Config = toml::from_str(
            r#"
            [[backends]]
            host = "127.0.0.1"
            port = 11434
            has_gpu = true
            gpu_memory_total_mb = 24000
            "#,
        )
        .unwrap();
        Arc::new(RouterState::new(Arc::new(config), "test.toml".into()))
    }

    #[tokio::test]
    async fn admin_health_reports_backend_counts() {
        let app = router(state());
        let req = Request::builder().uri("/admin/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["backends_total"], 1);
    }

    #[tokio::test]
    async fn admin_config_redacts_admin_token_value() {
        let config: Config = toml::from_str(
            r#"
            [gateway]
            admin_token_env = "SOLLOL_ADMIN_TOKEN_TEST_DOES_NOT_EXIST"

            [[backends]]
            host = "127.0.0.1"
            port = 11434
            "#,
        )
        .unwrap();
        let state = Arc::new(RouterState::new(Arc::new(config), "test.toml".into()));
        let app = router(state);
        let req = Request::builder().uri("/admin/config").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["gateway"]["admin_token_env"], "SOLLOL_ADMIN_TOKEN_TEST_DOES_NOT_EXIST");
        assert_eq!(json["gateway"]["admin_auth_enabled"], false);
    }
}
