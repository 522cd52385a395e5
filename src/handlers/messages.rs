use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use validator::Validate;

use super::shared::{fetch_channel_by_id, require_member, validation_error};
use crate::{
    auth::AuthUser,
    error::{AppError, AppResult},
    models::{generate_id, now_rfc3339, Message, MessageDto},
    state::AppState,
    websocket::events::{EVENT_MESSAGE_CREATE, EVENT_MESSAGE_DELETE, EVENT_MESSAGE_UPDATE},
    websocket::Envelope,
};

// ============================================================================
// Input validation
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct CreateMessageRequest {
    #[validate(length(
        min = 1,
        max = 4000,
        message = "Message content must be 1–4 000 characters"
    ))]
    pub content: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateMessageRequest {
    #[validate(length(
        min = 1,
        max = 4000,
        message = "Message content must be 1–4 000 characters"
    ))]
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    /// Cursor: return messages with an ID strictly below this one.
    /// Snowflakes are time-ordered, so this pages backwards through history.
    #[serde(default, with = "crate::models::id_str_opt")]
    pub before: Option<u64>,
    /// Maximum number of messages to return (default 50, max 100).
    pub limit: Option<i64>,
}

// ============================================================================
// Helpers
// ============================================================================

/// Fetch a non-deleted message by ID, returning 404 if not found or deleted.
async fn fetch_message(pool: &sqlx::AnyPool, message_id: u64) -> AppResult<Message> {
    sqlx::query_as::<_, Message>(
        "SELECT id, channel_id, author_id, content, edited_at, deleted, created_at
         FROM messages WHERE id = $1 AND deleted = FALSE",
    )
    .bind(message_id as i64)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::NotFound("Message not found".into()))
}

/// Broadcast a message event to the channel's server room. The REST
/// operation has already committed; failures here are not surfaced.
async fn broadcast_message_event(
    state: &AppState,
    server_id: u64,
    channel_id: u64,
    event: &str,
    data: serde_json::Value,
) {
    state
        .hub
        .broadcast(Envelope {
            server_id: Some(server_id),
            channel_id: Some(channel_id),
            event: event.to_owned(),
            data,
        })
        .await;
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /channels/:channel_id/messages — send a message (members only).
pub async fn create_message(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(channel_id): Path<u64>,
    Json(req): Json<CreateMessageRequest>,
) -> AppResult<(StatusCode, Json<MessageDto>)> {
    req.validate().map_err(validation_error)?;

    let channel = fetch_channel_by_id(&state.pool, channel_id).await?;
    require_member(&state.pool, channel.server_id, auth.user_id()).await?;

    let message = sqlx::query_as::<_, Message>(
        "INSERT INTO messages (id, channel_id, author_id, content, deleted, created_at)
         VALUES ($1, $2, $3, $4, FALSE, $5)
         RETURNING id, channel_id, author_id, content, edited_at, deleted, created_at",
    )
    .bind(generate_id() as i64)
    .bind(channel_id as i64)
    .bind(auth.user_id() as i64)
    .bind(&req.content)
    .bind(now_rfc3339())
    .fetch_one(&state.pool)
    .await?;

    let dto = MessageDto::from(message);
    let payload = serde_json::to_value(&dto).unwrap_or_default();
    broadcast_message_event(
        &state,
        channel.server_id,
        channel_id,
        EVENT_MESSAGE_CREATE,
        payload,
    )
    .await;

    Ok((StatusCode::CREATED, Json(dto)))
}

/// GET /channels/:channel_id/messages — page backwards through history.
pub async fn list_messages(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(channel_id): Path<u64>,
    Query(query): Query<ListMessagesQuery>,
) -> AppResult<Json<Vec<MessageDto>>> {
    let channel = fetch_channel_by_id(&state.pool, channel_id).await?;
    require_member(&state.pool, channel.server_id, auth.user_id()).await?;

    let limit = query.limit.unwrap_or(50).clamp(1, 100);
    let before = query.before.unwrap_or(u64::MAX) as i64;

    let messages = sqlx::query_as::<_, Message>(
        "SELECT id, channel_id, author_id, content, edited_at, deleted, created_at
         FROM messages
         WHERE channel_id = $1 AND id < $2 AND deleted = FALSE
         ORDER BY id DESC
         LIMIT $3",
    )
    .bind(channel_id as i64)
    .bind(before)
    .bind(limit)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(messages.into_iter().map(MessageDto::from).collect()))
}

/// PATCH /messages/:message_id — edit own message.
pub async fn update_message(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(message_id): Path<u64>,
    Json(req): Json<UpdateMessageRequest>,
) -> AppResult<Json<MessageDto>> {
    req.validate().map_err(validation_error)?;

    let message = fetch_message(&state.pool, message_id).await?;
    let channel = fetch_channel_by_id(&state.pool, message.channel_id).await?;
    require_member(&state.pool, channel.server_id, auth.user_id()).await?;

    if message.author_id != Some(auth.user_id()) {
        return Err(AppError::Forbidden(
            "Only the author can edit a message".into(),
        ));
    }

    let updated = sqlx::query_as::<_, Message>(
        "UPDATE messages
         SET content = $1, edited_at = $2
         WHERE id = $3
         RETURNING id, channel_id, author_id, content, edited_at, deleted, created_at",
    )
    .bind(&req.content)
    .bind(now_rfc3339())
    .bind(message_id as i64)
    .fetch_one(&state.pool)
    .await?;

    let dto = MessageDto::from(updated);
    let payload = serde_json::to_value(&dto).unwrap_or_default();
    broadcast_message_event(
        &state,
        channel.server_id,
        channel.id,
        EVENT_MESSAGE_UPDATE,
        payload,
    )
    .await;

    Ok(Json(dto))
}

/// DELETE /messages/:message_id — soft-delete (author or server owner).
pub async fn delete_message(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(message_id): Path<u64>,
) -> AppResult<StatusCode> {
    let message = fetch_message(&state.pool, message_id).await?;
    let channel = fetch_channel_by_id(&state.pool, message.channel_id).await?;
    let server = super::shared::fetch_server(&state.pool, channel.server_id).await?;
    require_member(&state.pool, channel.server_id, auth.user_id()).await?;

    let is_author = message.author_id == Some(auth.user_id());
    let is_owner = server.owner_id == auth.user_id();
    if !is_author && !is_owner {
        return Err(AppError::Forbidden(
            "Only the author or the server owner can delete a message".into(),
        ));
    }

    sqlx::query("UPDATE messages SET deleted = TRUE WHERE id = $1")
        .bind(message_id as i64)
        .execute(&state.pool)
        .await?;

    broadcast_message_event(
        &state,
        channel.server_id,
        channel.id,
        EVENT_MESSAGE_DELETE,
        json!({
            "id": message_id.to_string(),
            "channel_id": channel.id.to_string(),
        }),
    )
    .await;

    Ok(StatusCode::NO_CONTENT)
}
