pub mod admin;
pub mod alerts;
pub mod analysis;
pub mod auth;
pub mod health;
pub mod market;
pub mod platforms;
pub mod portfolio;
pub mod trades;

use crate::AppState;
use axum::Router;

/// Assemble the full API surface.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .nest("/auth", auth::router())
        .merge(portfolio::router())
        .merge(trades::router())
        .merge(platforms::router())
        .merge(market::router())
        .merge(alerts::router())
        .merge(analysis::router())
        .merge(admin::router())
}
