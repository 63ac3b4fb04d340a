//! Admin API: kill-switch and circuit breaker management.
//!
//! - POST /kill-switch (global freeze), DELETE /kill-switch
//! - POST /kill-switch/users/:id, DELETE /kill-switch/users/:id
//! - GET /breakers, POST /breakers/:name/reset

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::api::auth::AdminOnly;
use crate::error::AppError;
use crate::services::breaker::BreakerStatus;
use crate::services::KillSwitchReason;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/kill-switch", post(activate_global).delete(release_global))
        .route(
            "/kill-switch/users/:id",
            post(freeze_user).delete(release_user),
        )
        .route("/breakers", get(list_breakers))
        .route("/breakers/:name/reset", post(reset_breaker))
}

#[derive(Debug, Serialize)]
struct KillSwitchResponse {
    active: bool,
}

async fn activate_global(
    State(state): State<AppState>,
    admin: AdminOnly,
) -> Json<KillSwitchResponse> {
    state.kill_switch.activate_global(&admin.user.username);
    Json(KillSwitchResponse { active: true })
}

async fn release_global(
    State(state): State<AppState>,
    admin: AdminOnly,
) -> Json<KillSwitchResponse> {
    state.kill_switch.release_global(&admin.user.username);
    Json(KillSwitchResponse { active: false })
}

async fn freeze_user(
    State(state): State<AppState>,
    admin: AdminOnly,
    Path(user_id): Path<String>,
) -> Result<StatusCode, AppError> {
    if state.store.get_user(&user_id).is_none() {
        return Err(AppError::NotFound(format!("user {user_id}")));
    }
    state
        .kill_switch
        .activate_user(&user_id, KillSwitchReason::Manual, &admin.user.username);
    let router = state.router.clone();
    tokio::spawn(async move {
        router.close_all(&user_id, "manual").await;
    });
    Ok(StatusCode::ACCEPTED)
}

async fn release_user(
    State(state): State<AppState>,
    admin: AdminOnly,
    Path(user_id): Path<String>,
) -> Result<StatusCode, AppError> {
    if !state.kill_switch.release_user(&user_id, &admin.user.username) {
        return Err(AppError::NotFound(format!(
            "no active kill-switch for {user_id}"
        )));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn list_breakers(
    State(state): State<AppState>,
    _admin: AdminOnly,
) -> Json<Vec<BreakerStatus>> {
    Json(state.breakers.snapshot())
}

async fn reset_breaker(
    State(state): State<AppState>,
    admin: AdminOnly,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    if !state.breakers.reset(&name) {
        return Err(AppError::NotFound(format!("breaker {name}")));
    }
    state.store.append_audit(
        "breaker",
        None,
        &format!("{name} manually reset by {}", admin.user.username),
    )?;
    Ok(StatusCode::NO_CONTENT)
}
