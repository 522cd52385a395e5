use axum::{extract::State, Json};
use serde::Deserialize;
use validator::Validate;

use super::shared::validation_error;
use crate::{
    auth::AuthUser,
    error::{AppError, AppResult},
    models::{now_rfc3339, User, UserDto},
    state::AppState,
};

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateUserRequest {
    #[validate(url(message = "Avatar must be a valid URL"))]
    pub avatar_url: Option<String>,
}

/// GET /users/@me — the authenticated user's own profile.
pub async fn get_current_user(
    State(state): State<AppState>,
    auth: AuthUser,
) -> AppResult<Json<UserDto>> {
    let user = sqlx::query_as::<_, User>(
        "SELECT id, username, email, password_hash, avatar_url, created_at, updated_at
         FROM users WHERE id = $1",
    )
    .bind(auth.user_id() as i64)
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| AppError::NotFound("User not found".into()))?;

    Ok(Json(user.into()))
}

/// PATCH /users/@me — update own profile fields.
pub async fn update_current_user(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<UpdateUserRequest>,
) -> AppResult<Json<UserDto>> {
    req.validate().map_err(validation_error)?;

    if req.avatar_url.is_none() {
        return Err(AppError::Validation("No fields to update".into()));
    }

    let user = sqlx::query_as::<_, User>(
        "UPDATE users
         SET avatar_url = COALESCE($1, avatar_url),
             updated_at = $2
         WHERE id = $3
         RETURNING id, username, email, password_hash, avatar_url, created_at, updated_at",
    )
    .bind(&req.avatar_url)
    .bind(now_rfc3339())
    .bind(auth.user_id() as i64)
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| AppError::NotFound("User not found".into()))?;

    Ok(Json(user.into()))
}
