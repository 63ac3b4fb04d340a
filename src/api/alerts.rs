//! Alert and notification API.
//!
//! - POST /alerts, GET /alerts, DELETE /alerts/:id
//! - GET /notifications, POST /notifications/:id/read

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::api::auth::Authenticated;
use crate::error::AppError;
use crate::types::{CreateAlertRequest, Notification, SmartAlert};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/alerts", get(list_alerts).post(create_alert))
        .route("/alerts/:id", axum::routing::delete(delete_alert))
        .route("/notifications", get(list_notifications))
        .route("/notifications/:id/read", post(mark_read))
}

async fn create_alert(
    State(state): State<AppState>,
    auth: Authenticated,
    Json(request): Json<CreateAlertRequest>,
) -> Result<(StatusCode, Json<SmartAlert>), AppError> {
    if request.symbol.trim().is_empty() {
        return Err(AppError::Validation("symbol must not be empty".to_string()));
    }
    let alert = state.alerts.create(&auth.user.id, request)?;
    Ok((StatusCode::CREATED, Json(alert)))
}

async fn list_alerts(State(state): State<AppState>, auth: Authenticated) -> Json<Vec<SmartAlert>> {
    Json(state.alerts.list(&auth.user.id))
}

async fn delete_alert(
    State(state): State<AppState>,
    auth: Authenticated,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.alerts.dismiss(&id, &auth.user.id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct NotificationsQuery {
    limit: Option<usize>,
}

async fn list_notifications(
    State(state): State<AppState>,
    auth: Authenticated,
    Query(query): Query<NotificationsQuery>,
) -> Json<Vec<Notification>> {
    let limit = query.limit.unwrap_or(50).min(200);
    Json(state.store.list_notifications(&auth.user.id, limit))
}

async fn mark_read(
    State(state): State<AppState>,
    auth: Authenticated,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let updated = state.store.mark_notification_read(&id, &auth.user.id)?;
    if updated == 0 {
        return Err(AppError::NotFound(format!("notification {id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}
