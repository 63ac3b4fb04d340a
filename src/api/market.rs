//! Market data API.
//!
//! - GET /market/:symbol
//! - GET /market/quotes?symbols=BTCUSDT,ETHUSDT

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::collections::HashMap;

use crate::error::AppError;
use crate::types::{Quote, QuoteEntry};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/market/quotes", get(get_quotes))
        .route("/market/:symbol", get(get_quote))
}

async fn get_quote(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<Quote>, AppError> {
    let quote = state.market.quote(&symbol).await?;
    Ok(Json(quote))
}

#[derive(Debug, Deserialize)]
struct QuotesQuery {
    symbols: String,
}

async fn get_quotes(
    State(state): State<AppState>,
    Query(query): Query<QuotesQuery>,
) -> Result<Json<HashMap<String, QuoteEntry>>, AppError> {
    let symbols: Vec<String> = query
        .symbols
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if symbols.is_empty() {
        return Err(AppError::Validation(
            "symbols query parameter must not be empty".to_string(),
        ));
    }
    if symbols.len() > 50 {
        return Err(AppError::Validation(
            "at most 50 symbols per request".to_string(),
        ));
    }
    Ok(Json(state.market.quotes(&symbols).await))
}
