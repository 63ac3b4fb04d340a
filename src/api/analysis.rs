//! AI analysis API.
//!
//! - POST /analysis {symbol}
//!
//! Responses degrade to a deterministic fallback instead of failing when
//! the provider is unavailable.

use axum::{extract::State, routing::post, Json, Router};
use serde::Deserialize;

use crate::api::auth::Authenticated;
use crate::error::AppError;
use crate::services::Analysis;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/analysis", post(analyze))
}

#[derive(Debug, Deserialize)]
struct AnalyzeRequest {
    symbol: String,
}

async fn analyze(
    State(state): State<AppState>,
    _auth: Authenticated,
    Json(request): Json<AnalyzeRequest>,
) -> Result<Json<Analysis>, AppError> {
    let symbol = request.symbol.trim().to_uppercase();
    let quote = state.market.quote(&symbol).await?;
    let analysis = state.ai.analyze(&symbol, &quote).await;
    Ok(Json(analysis))
}
