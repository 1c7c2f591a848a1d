//! Prometheus-compatible `/metrics` endpoint (admin API).
//!
//! Everything here is derived live from the registry snapshot and the
//! priority queue's depth stats — there is no separate metrics-exposition
//! buffer, unlike the teacher's traffic-log-backed renderer, since the
//! registry/queue already hold the numbers Prometheus wants to scrape.
//!
//! Metric families:
//! - `sollol_backend_in_flight{backend}`        — requests currently dispatched
//! - `sollol_backend_success_rate{backend}`     — rolling success rate used for scoring
//! - `sollol_backend_latency_ewma_ms{backend}`  — EWMA latency
//! - `sollol_excluded_backends`                 — count currently excluded from routing
//! - `sollol_queue_depth{priority}` / `sollol_queue_depth_total`

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};

use crate::router::RouterState;

/// `GET /metrics` — renders Prometheus text format.
pub async fn metrics(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let backends = state.registry.snapshot();
    let queue_stats = state.queue.stats();
    let now = chrono::Utc::now();

    let mut out = String::with_capacity(1024);

    out.push_str("# HELP sollol_backend_in_flight In-flight requests currently dispatched to this backend.\n");
    out.push_str("# TYPE sollol_backend_in_flight gauge\n");
    for b in &backends {
        out.push_str(&format!("sollol_backend_in_flight{{backend=\"{}\"}} {}\n", b.id, b.in_flight));
    }
    out.push('\n');

    out.push_str("# HELP sollol_backend_success_rate Rolling success rate used for scoring this backend.\n");
    out.push_str("# TYPE sollol_backend_success_rate gauge\n");
    for b in &backends {
        out.push_str(&format!(
            "sollol_backend_success_rate{{backend=\"{}\"}} {}\n",
            b.id,
            b.success_rate_for_scoring()
        ));
    }
    out.push('\n');

    out.push_str("# HELP sollol_backend_latency_ewma_ms EWMA round-trip latency in milliseconds.\n");
    out.push_str("# TYPE sollol_backend_latency_ewma_ms gauge\n");
    for b in &backends {
        out.push_str(&format!("sollol_backend_latency_ewma_ms{{backend=\"{}\"}} {}\n", b.id, b.latency_ewma_ms));
    }
    out.push('\n');

    let excluded_count = backends.iter().filter(|b| b.is_excluded(now)).count();
    out.push_str("# HELP sollol_excluded_backends Number of backends currently excluded from routing.\n");
    out.push_str("# TYPE sollol_excluded_backends gauge\n");
    out.push_str(&format!("sollol_excluded_backends {excluded_count}\n\n"));

    out.push_str("# HELP sollol_queue_depth Admitted-but-undispatched requests, labelled by priority.\n");
    out.push_str("# TYPE sollol_queue_depth gauge\n");
    let mut priorities: Vec<_> = queue_stats.per_priority_depth.iter().collect();
    priorities.sort_by_key(|(p, _)| **p);
    for (priority, depth) in priorities {
        out.push_str(&format!("sollol_queue_depth{{priority=\"{priority}\"}} {depth}\n"));
    }
    out.push_str("\n# HELP sollol_queue_depth_total Total admitted-but-undispatched requests.\n");
    out.push_str("# TYPE sollol_queue_depth_total gauge\n");
    out.push_str(&format!("sollol_queue_depth_total {}\n", queue_stats.depth));

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        out,
    )
}
