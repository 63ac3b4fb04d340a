//! Authentication API.
//!
//! - POST /auth/register
//! - POST /auth/login
//! - GET  /auth/me
//! - POST /auth/2fa/enroll, POST /auth/2fa/confirm, DELETE /auth/2fa

use axum::{
    extract::{FromRequestParts, State},
    http::{request::Parts, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::types::{AuthResponse, LoginRequest, RegisterRequest, User, UserProfile};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/me", get(me))
        .route("/2fa/enroll", post(totp_enroll))
        .route("/2fa/confirm", post(totp_confirm))
        .route("/2fa", delete(totp_disable))
}

async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResponse>), AppError> {
    if request.password.len() < 8 {
        return Err(AppError::Validation(
            "password must be at least 8 characters".to_string(),
        ));
    }
    if !request.email.contains('@') {
        return Err(AppError::Validation("invalid email".to_string()));
    }
    if request.username.trim().is_empty() {
        return Err(AppError::Validation("username must not be empty".to_string()));
    }

    let (user, access_token) =
        state
            .auth
            .register(&request.email, &request.username, &request.password)?;
    // The portfolio exists from the moment the account does.
    state.portfolios.ensure(&user.id);

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            access_token,
            user_id: user.id,
        }),
    ))
}

async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, AppError> {
    let (user, access_token) =
        state
            .auth
            .login(&request.email, &request.password, request.totp.as_deref())?;
    Ok(Json(AuthResponse {
        access_token,
        user_id: user.id,
    }))
}

async fn me(auth: Authenticated) -> Json<UserProfile> {
    Json(UserProfile::from(&auth.user))
}

#[derive(Debug, Serialize)]
struct EnrollResponse {
    secret: String,
}

async fn totp_enroll(
    State(state): State<AppState>,
    auth: Authenticated,
) -> Result<Json<EnrollResponse>, AppError> {
    let secret = state.auth.totp_enroll(&auth.user.id)?;
    Ok(Json(EnrollResponse { secret }))
}

#[derive(Debug, Deserialize)]
struct ConfirmRequest {
    code: String,
}

async fn totp_confirm(
    State(state): State<AppState>,
    auth: Authenticated,
    Json(request): Json<ConfirmRequest>,
) -> Result<StatusCode, AppError> {
    state.auth.totp_confirm(&auth.user.id, &request.code)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn totp_disable(
    State(state): State<AppState>,
    auth: Authenticated,
) -> Result<StatusCode, AppError> {
    state.auth.totp_disable(&auth.user.id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Authenticated user extractor: validates the bearer token and loads the
/// current user.
pub struct Authenticated {
    pub user: User,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for Authenticated {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Auth("missing bearer token".to_string()))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| AppError::Auth("missing bearer token".to_string()))?;
        let user = state.auth.authenticate(token)?;
        Ok(Authenticated { user })
    }
}

/// Admin-scoped extractor; rejects non-admin users with 403.
pub struct AdminOnly {
    pub user: User,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AdminOnly {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Authenticated { user } = Authenticated::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            return Err(AppError::Forbidden("admin scope required".to_string()));
        }
        Ok(AdminOnly { user })
    }
}
