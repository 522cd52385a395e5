use sqlx::AnyPool;

use crate::{
    error::{AppError, AppResult},
    models::{Channel, Server, ServerMember},
};

/// Convert [`validator::ValidationErrors`] into an [`AppError::Validation`]
/// with a human-readable message. Shared across all handler modules to
/// avoid copy-pasting the same boilerplate.
pub fn validation_error(e: validator::ValidationErrors) -> AppError {
    AppError::Validation(
        e.field_errors()
            .values()
            .flat_map(|v| v.iter())
            .filter_map(|e| e.message.as_ref())
            .map(|m| m.to_string())
            .collect::<Vec<_>>()
            .join(", "),
    )
}

/// Fetch a channel by its ID alone (no server scope), returning 404 if not found.
pub async fn fetch_channel_by_id(pool: &AnyPool, channel_id: u64) -> AppResult<Channel> {
    sqlx::query_as::<_, Channel>(
        "SELECT id, server_id, name, kind, topic, created_at
         FROM channels WHERE id = $1",
    )
    .bind(channel_id as i64)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::NotFound("Channel not found".into()))
}

/// Fetch a server row, returning 404 if it does not exist.
pub async fn fetch_server(pool: &AnyPool, server_id: u64) -> AppResult<Server> {
    sqlx::query_as::<_, Server>(
        "SELECT id, name, owner_id, icon_url, created_at
         FROM servers WHERE id = $1",
    )
    .bind(server_id as i64)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::NotFound("Server not found".into()))
}

/// Verify the user is a member of the server.
///
/// Returns 404 (not 403) when the user is not a member — this prevents
/// leaking information about server existence to non-members.
pub async fn require_member(
    pool: &AnyPool,
    server_id: u64,
    user_id: u64,
) -> AppResult<ServerMember> {
    sqlx::query_as::<_, ServerMember>(
        "SELECT user_id, server_id, joined_at
         FROM server_members WHERE server_id = $1 AND user_id = $2",
    )
    .bind(server_id as i64)
    .bind(user_id as i64)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::NotFound("Server not found".into()))
}
