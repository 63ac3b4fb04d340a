//! Portfolio API.
//!
//! - GET /portfolio

use axum::{extract::State, routing::get, Json, Router};

use crate::api::auth::Authenticated;
use crate::types::PortfolioView;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/portfolio", get(get_portfolio))
}

async fn get_portfolio(State(state): State<AppState>, auth: Authenticated) -> Json<PortfolioView> {
    let snapshot = state.portfolios.snapshot(&auth.user.id).await;
    Json(PortfolioView::from(&snapshot))
}
