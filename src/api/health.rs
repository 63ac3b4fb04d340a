//! Operational endpoints: liveness, readiness and a Prometheus scrape.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

use crate::services::BreakerState;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
struct ReadyResponse {
    ready: bool,
    store: bool,
}

async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    // A trivial store query proves the database file is reachable.
    let store_ok = state.store.trade_count() >= 0;
    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            ready: store_ok,
            store: store_ok,
        }),
    )
}

async fn metrics(State(state): State<AppState>) -> String {
    let mut out = String::new();

    out.push_str("# HELP tiller_trades_total Trades recorded since the database was created\n");
    out.push_str("# TYPE tiller_trades_total counter\n");
    out.push_str(&format!("tiller_trades_total {}\n", state.store.trade_count()));

    out.push_str("# HELP tiller_audit_records_total Audit journal length\n");
    out.push_str("# TYPE tiller_audit_records_total counter\n");
    out.push_str(&format!(
        "tiller_audit_records_total {}\n",
        state.store.audit_count()
    ));

    out.push_str("# HELP tiller_quote_cache_size Symbols held in the quote cache\n");
    out.push_str("# TYPE tiller_quote_cache_size gauge\n");
    out.push_str(&format!(
        "tiller_quote_cache_size {}\n",
        state.market.cache_len()
    ));

    out.push_str("# HELP tiller_ws_clients Connected websocket clients\n");
    out.push_str("# TYPE tiller_ws_clients gauge\n");
    out.push_str(&format!("tiller_ws_clients {}\n", state.rooms.client_count()));

    out.push_str("# HELP tiller_breaker_open Circuit breaker state (1 = open)\n");
    out.push_str("# TYPE tiller_breaker_open gauge\n");
    for status in state.breakers.snapshot() {
        let open = if status.state == BreakerState::Open { 1 } else { 0 };
        out.push_str(&format!(
            "tiller_breaker_open{{resource=\"{}\"}} {}\n",
            status.resource, open
        ));
    }

    out.push_str("# HELP tiller_kill_switch_global Global kill-switch state (1 = frozen)\n");
    out.push_str("# TYPE tiller_kill_switch_global gauge\n");
    out.push_str(&format!(
        "tiller_kill_switch_global {}\n",
        if state.kill_switch.is_global_active() { 1 } else { 0 }
    ));

    out
}
