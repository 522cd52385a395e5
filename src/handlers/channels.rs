use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use validator::Validate;

use super::shared::{fetch_server, require_member, validation_error};
use crate::{
    auth::AuthUser,
    error::{AppError, AppResult},
    models::{generate_id, now_rfc3339, Channel, ChannelDto, ChannelType},
    state::AppState,
};

// ============================================================================
// Input validation
// ============================================================================

#[derive(Debug, serde::Deserialize, Validate)]
pub struct CreateChannelRequest {
    #[validate(length(min = 1, max = 100, message = "Channel name must be 1–100 characters"))]
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: ChannelType,
    #[validate(length(max = 1024, message = "Topic must be at most 1024 characters"))]
    pub topic: Option<String>,
}

fn default_kind() -> ChannelType {
    ChannelType::Text
}

#[derive(Debug, serde::Deserialize, Validate)]
pub struct UpdateChannelRequest {
    #[validate(length(min = 1, max = 100, message = "Channel name must be 1–100 characters"))]
    pub name: Option<String>,
    #[validate(length(max = 1024, message = "Topic must be at most 1024 characters"))]
    pub topic: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /servers/:id/channels — create a text or voice channel (owner only).
pub async fn create_channel(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(server_id): Path<u64>,
    Json(req): Json<CreateChannelRequest>,
) -> AppResult<(StatusCode, Json<ChannelDto>)> {
    req.validate().map_err(validation_error)?;

    let server = fetch_server(&state.pool, server_id).await?;
    require_member(&state.pool, server_id, auth.user_id()).await?;
    if server.owner_id != auth.user_id() {
        return Err(AppError::Forbidden(
            "Only the server owner can create channels".into(),
        ));
    }

    let channel = sqlx::query_as::<_, Channel>(
        "INSERT INTO channels (id, server_id, name, kind, topic, created_at)
         VALUES ($1, $2, $3, $4, $5, $6)
         RETURNING id, server_id, name, kind, topic, created_at",
    )
    .bind(generate_id() as i64)
    .bind(server_id as i64)
    .bind(&req.name)
    .bind(req.kind.to_string())
    .bind(&req.topic)
    .bind(now_rfc3339())
    .fetch_one(&state.pool)
    .await?;

    Ok((StatusCode::CREATED, Json(channel.into())))
}

/// GET /servers/:id/channels — list the server's channels (members only).
pub async fn list_channels(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(server_id): Path<u64>,
) -> AppResult<Json<Vec<ChannelDto>>> {
    fetch_server(&state.pool, server_id).await?;
    require_member(&state.pool, server_id, auth.user_id()).await?;

    let channels = sqlx::query_as::<_, Channel>(
        "SELECT id, server_id, name, kind, topic, created_at
         FROM channels WHERE server_id = $1
         ORDER BY created_at ASC",
    )
    .bind(server_id as i64)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(channels.into_iter().map(ChannelDto::from).collect()))
}

/// GET /servers/:id/channels/:channel_id — fetch one channel (members only).
pub async fn get_channel(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((server_id, channel_id)): Path<(u64, u64)>,
) -> AppResult<Json<ChannelDto>> {
    require_member(&state.pool, server_id, auth.user_id()).await?;

    let channel = sqlx::query_as::<_, Channel>(
        "SELECT id, server_id, name, kind, topic, created_at
         FROM channels WHERE id = $1 AND server_id = $2",
    )
    .bind(channel_id as i64)
    .bind(server_id as i64)
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| AppError::NotFound("Channel not found".into()))?;

    Ok(Json(channel.into()))
}

/// PATCH /servers/:id/channels/:channel_id — rename or retopic (owner only).
pub async fn update_channel(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((server_id, channel_id)): Path<(u64, u64)>,
    Json(req): Json<UpdateChannelRequest>,
) -> AppResult<Json<ChannelDto>> {
    req.validate().map_err(validation_error)?;

    let server = fetch_server(&state.pool, server_id).await?;
    if server.owner_id != auth.user_id() {
        return Err(AppError::Forbidden(
            "Only the server owner can update channels".into(),
        ));
    }

    let channel = sqlx::query_as::<_, Channel>(
        "UPDATE channels
         SET name  = COALESCE($1, name),
             topic = COALESCE($2, topic)
         WHERE id = $3 AND server_id = $4
         RETURNING id, server_id, name, kind, topic, created_at",
    )
    .bind(&req.name)
    .bind(&req.topic)
    .bind(channel_id as i64)
    .bind(server_id as i64)
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| AppError::NotFound("Channel not found".into()))?;

    Ok(Json(channel.into()))
}

/// DELETE /servers/:id/channels/:channel_id — delete a channel (owner only).
pub async fn delete_channel(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((server_id, channel_id)): Path<(u64, u64)>,
) -> AppResult<StatusCode> {
    let server = fetch_server(&state.pool, server_id).await?;
    if server.owner_id != auth.user_id() {
        return Err(AppError::Forbidden(
            "Only the server owner can delete channels".into(),
        ));
    }

    let result = sqlx::query("DELETE FROM channels WHERE id = $1 AND server_id = $2")
        .bind(channel_id as i64)
        .bind(server_id as i64)
        .execute(&state.pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound("Channel not found".into()));
    }

    Ok(StatusCode::NO_CONTENT)
}
