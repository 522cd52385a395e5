use axum::async_trait;
use sqlx::AnyPool;

use crate::error::AppResult;
use crate::models::{PresenceStatus, UserProfile};

/// The narrow persistence interface the realtime plane depends on.
///
/// The hub, router, and SFU never touch the pool directly — they see only
/// this trait, so the whole realtime plane runs in tests against an
/// in-memory implementation.
#[async_trait]
pub trait RealtimeStore: Send + Sync + 'static {
    /// Server IDs the user is an active member of, loaded once per
    /// connection at upgrade time.
    async fn load_membership(&self, user_id: u64) -> AppResult<Vec<u64>>;

    /// Best-effort presence write. The in-memory hub state is authoritative
    /// for routing; callers log failures and keep going.
    async fn persist_presence(&self, user_id: u64, status: PresenceStatus) -> AppResult<()>;

    /// Resolve a channel to its parent server, or `None` if the channel
    /// does not exist.
    async fn parent_server(&self, channel_id: u64) -> AppResult<Option<u64>>;

    /// Display fields embedded in voice-state broadcasts.
    async fn user_profile(&self, user_id: u64) -> AppResult<Option<UserProfile>>;
}

/// SQL-backed implementation used by the running server.
pub struct SqlStore {
    pool: AnyPool,
}

impl SqlStore {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RealtimeStore for SqlStore {
    async fn load_membership(&self, user_id: u64) -> AppResult<Vec<u64>> {
        let rows: Vec<i64> =
            sqlx::query_scalar("SELECT server_id FROM server_members WHERE user_id = $1")
                .bind(user_id as i64)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|id| id as u64).collect())
    }

    async fn persist_presence(&self, user_id: u64, status: PresenceStatus) -> AppResult<()> {
        sqlx::query("UPDATE users SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(status.to_string())
            .bind(crate::models::now_rfc3339())
            .bind(user_id as i64)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn parent_server(&self, channel_id: u64) -> AppResult<Option<u64>> {
        let row: Option<i64> =
            sqlx::query_scalar("SELECT server_id FROM channels WHERE id = $1")
                .bind(channel_id as i64)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|id| id as u64))
    }

    async fn user_profile(&self, user_id: u64) -> AppResult<Option<UserProfile>> {
        let row: Option<(i64, String, Option<String>)> =
            sqlx::query_as("SELECT id, username, avatar_url FROM users WHERE id = $1")
                .bind(user_id as i64)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id, name, avatar_url)| UserProfile {
            id: id as u64,
            name,
            avatar_url,
        }))
    }
}
