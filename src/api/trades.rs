//! Trading API.
//!
//! - GET  /trades, POST /trades, POST /trades/:id/close
//! - GET  /approvals, POST /approvals/:id/approve, POST /approvals/:id/reject
//! - GET  /mode, PUT /mode

use axum::{
    extract::{Path, Query, State},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::auth::Authenticated;
use crate::error::AppError;
use crate::types::{
    OrderOrigin, PendingApproval, PlaceTradeRequest, Trade, TradeOrder, TradeOutcome, TradingMode,
};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/trades", get(list_trades).post(place_trade))
        .route("/trades/:id/close", post(close_trade))
        .route("/approvals", get(list_approvals))
        .route("/approvals/:id/approve", post(approve))
        .route("/approvals/:id/reject", post(reject))
        .route("/mode", get(get_mode).put(set_mode))
}

#[derive(Debug, Deserialize)]
struct ListTradesQuery {
    limit: Option<usize>,
}

async fn list_trades(
    State(state): State<AppState>,
    auth: Authenticated,
    Query(query): Query<ListTradesQuery>,
) -> Json<Vec<Trade>> {
    let limit = query.limit.unwrap_or(100).min(500);
    Json(state.store.list_trades(&auth.user.id, limit))
}

/// Submit an order. The `origin` field distinguishes automated signals
/// (gated by Assisted mode) from manual submissions.
#[derive(Debug, Deserialize)]
struct PlaceTradeBody {
    #[serde(flatten)]
    order: PlaceTradeRequest,
    #[serde(default)]
    automated: bool,
}

async fn place_trade(
    State(state): State<AppState>,
    auth: Authenticated,
    Json(body): Json<PlaceTradeBody>,
) -> Result<Json<TradeOutcome>, AppError> {
    let origin = if body.automated {
        OrderOrigin::Automated
    } else {
        OrderOrigin::Manual
    };
    let idempotency_key = body.order.idempotency_key.clone();
    let order = TradeOrder::from(body.order);
    let outcome = state
        .router
        .submit(&auth.user, order, origin, idempotency_key)
        .await?;
    Ok(Json(outcome))
}

async fn close_trade(
    State(state): State<AppState>,
    auth: Authenticated,
    Path(id): Path<String>,
) -> Result<Json<Trade>, AppError> {
    let trade = state.router.close_trade(&auth.user, &id).await?;
    Ok(Json(trade))
}

async fn list_approvals(
    State(state): State<AppState>,
    auth: Authenticated,
) -> Json<Vec<PendingApproval>> {
    Json(state.approvals.pending_for(&auth.user.id))
}

async fn approve(
    State(state): State<AppState>,
    auth: Authenticated,
    Path(id): Path<String>,
) -> Result<Json<TradeOutcome>, AppError> {
    let outcome = state.router.approve(&auth.user, &id).await?;
    Ok(Json(outcome))
}

async fn reject(
    State(state): State<AppState>,
    auth: Authenticated,
    Path(id): Path<String>,
) -> Result<axum::http::StatusCode, AppError> {
    state.approvals.reject(&id, &auth.user.id)?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct ModeResponse {
    mode: TradingMode,
}

async fn get_mode(auth: Authenticated) -> Json<ModeResponse> {
    Json(ModeResponse {
        mode: auth.user.trading_mode,
    })
}

#[derive(Debug, Deserialize)]
struct SetModeRequest {
    mode: TradingMode,
}

async fn set_mode(
    State(state): State<AppState>,
    auth: Authenticated,
    Json(request): Json<SetModeRequest>,
) -> Result<Json<ModeResponse>, AppError> {
    state.store.set_trading_mode(&auth.user.id, request.mode)?;
    state.store.append_audit(
        "trading_mode",
        Some(&auth.user.id),
        &format!("mode set to {}", request.mode.as_str()),
    )?;
    Ok(Json(ModeResponse { mode: request.mode }))
}
