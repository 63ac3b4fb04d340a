//! Platform (exchange connection) API.
//!
//! - GET /platforms, POST /platforms, DELETE /platforms/:id
//! - PUT /platforms/:id/test
//!
//! Credentials encrypt on the way in and never serialize back out.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};

use crate::api::auth::Authenticated;
use crate::error::AppError;
use crate::types::{
    CreatePlatformRequest, Platform, PlatformStatus, PlatformTestResult, PlatformView,
};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/platforms", get(list_platforms).post(create_platform))
        .route("/platforms/:id", axum::routing::delete(delete_platform))
        .route("/platforms/:id/test", put(test_platform))
}

async fn list_platforms(
    State(state): State<AppState>,
    auth: Authenticated,
) -> Json<Vec<PlatformView>> {
    let platforms = state.store.list_platforms(&auth.user.id);
    Json(platforms.iter().map(PlatformView::from).collect())
}

async fn create_platform(
    State(state): State<AppState>,
    auth: Authenticated,
    Json(request): Json<CreatePlatformRequest>,
) -> Result<(StatusCode, Json<PlatformView>), AppError> {
    if request.name.trim().is_empty() {
        return Err(AppError::Validation("name must not be empty".to_string()));
    }
    if request.kind.is_live() && (request.api_key.is_empty() || request.secret_key.is_empty()) {
        return Err(AppError::Validation(
            "live platforms require api_key and secret_key".to_string(),
        ));
    }

    let platform = Platform {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: auth.user.id.clone(),
        name: request.name,
        kind: request.kind,
        is_sandbox: request.is_sandbox,
        is_default: request.is_default,
        api_key_enc: state
            .vault
            .encrypt(&request.api_key)
            .map_err(|_| AppError::Vault)?,
        secret_key_enc: state
            .vault
            .encrypt(&request.secret_key)
            .map_err(|_| AppError::Vault)?,
        passphrase_enc: match request.passphrase {
            Some(ref passphrase) => {
                Some(state.vault.encrypt(passphrase).map_err(|_| AppError::Vault)?)
            }
            None => None,
        },
        status: PlatformStatus::Disconnected,
        last_tested_at: None,
        created_at: chrono::Utc::now().timestamp_millis(),
    };
    state.store.create_platform(&platform)?;
    state.store.append_audit(
        "platform",
        Some(&auth.user.id),
        &format!("platform {} ({}) created", platform.id, platform.kind.as_str()),
    )?;

    Ok((StatusCode::CREATED, Json(PlatformView::from(&platform))))
}

async fn delete_platform(
    State(state): State<AppState>,
    auth: Authenticated,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let platform = state
        .store
        .get_platform(&id)
        .ok_or_else(|| AppError::NotFound(format!("platform {id}")))?;
    if platform.user_id != auth.user.id {
        return Err(AppError::Forbidden("not your platform".to_string()));
    }
    state.store.delete_platform(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn test_platform(
    State(state): State<AppState>,
    auth: Authenticated,
    Path(id): Path<String>,
) -> Result<Json<PlatformTestResult>, AppError> {
    let result = state.router.test_platform(&auth.user.id, &id).await?;
    Ok(Json(result))
}
