use axum::{
    extract::{Path, State},
    Json,
};

use super::shared::{fetch_channel_by_id, require_member};
use crate::{
    auth::AuthUser,
    error::{AppError, AppResult},
    models::{ChannelType, UserProfile},
    state::AppState,
};

/// Returns `AppError::Validation` (HTTP 400) if the channel is not a voice
/// channel.
fn require_voice_channel(channel: &crate::models::Channel) -> AppResult<()> {
    if !matches!(channel.kind, ChannelType::Voice) {
        return Err(AppError::Validation(
            "Channel is not a voice channel".into(),
        ));
    }
    Ok(())
}

/// GET /channels/:channel_id/voice — list live voice participants.
///
/// The roster comes straight from the SFU registry; nothing is persisted.
/// Joining and leaving happen over the gateway via WebRTC signaling, so
/// there are no REST join/leave endpoints.
pub async fn list_voice_participants(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(channel_id): Path<u64>,
) -> AppResult<Json<Vec<UserProfile>>> {
    let channel = fetch_channel_by_id(&state.pool, channel_id).await?;
    require_member(&state.pool, channel.server_id, auth.user_id()).await?;
    require_voice_channel(&channel)?;

    let user_ids = state.sfu.participants(channel_id).await;

    let mut participants = Vec::with_capacity(user_ids.len());
    for user_id in user_ids {
        match state.store.user_profile(user_id).await {
            Ok(Some(profile)) => participants.push(profile),
            Ok(None) => {
                // Still in the room but gone from the database; surface the
                // bare ID rather than hiding the participant.
                participants.push(UserProfile {
                    id: user_id,
                    name: String::new(),
                    avatar_url: None,
                });
            }
            Err(e) => {
                tracing::warn!(
                    user_id,
                    error = ?e,
                    "Failed to load profile for voice roster; skipping entry"
                );
            }
        }
    }

    Ok(Json(participants))
}
