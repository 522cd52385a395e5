use std::sync::Arc;

use super::connection::Connection;
use super::events::{
    Envelope, EVENT_ICE_CANDIDATE, EVENT_TYPING_START, EVENT_WEBRTC_ANSWER, EVENT_WEBRTC_OFFER,
};
use super::hub::Hub;
use crate::sfu::RoomRegistry;
use crate::store::RealtimeStore;

/// Traffic controller for every frame a client sends over the gateway.
///
/// Room-broadcast events go to the hub, WebRTC signaling goes to the SFU,
/// and everything else is dropped with a log line. Authorization failures
/// are silent — an error frame would leak which servers and channels exist.
pub async fn route_message(
    hub: &Hub,
    sfu: &Arc<RoomRegistry>,
    store: &Arc<dyn RealtimeStore>,
    conn: &Arc<Connection>,
    envelope: Envelope,
) {
    let event = envelope.event.clone();
    match event.as_str() {
        EVENT_TYPING_START => {
            // The payload is trusted; membership of the target room is not.
            let Some(server_id) = envelope.server_id else {
                tracing::debug!(user_id = conn.user_id(), "TYPING_START without server_id");
                return;
            };
            if !conn.is_subscribed(server_id) {
                tracing::debug!(
                    user_id = conn.user_id(),
                    server_id,
                    "Dropping broadcast for unsubscribed server"
                );
                return;
            }
            hub.broadcast(envelope).await;
        }

        EVENT_WEBRTC_OFFER | EVENT_WEBRTC_ANSWER | EVENT_ICE_CANDIDATE => {
            let Some(channel_id) = envelope.channel_id else {
                tracing::debug!(
                    user_id = conn.user_id(),
                    event = %event,
                    "Signaling frame without channel_id"
                );
                return;
            };
            let Some(server_id) = resolve_parent_server(store, conn, channel_id).await else {
                return;
            };
            if !conn.is_subscribed(server_id) {
                tracing::debug!(
                    user_id = conn.user_id(),
                    channel_id,
                    "Dropping signaling frame for non-member channel"
                );
                return;
            }
            sfu.handle_signal(conn, channel_id, server_id, &event, envelope.data)
                .await;
        }

        other => {
            tracing::debug!(
                user_id = conn.user_id(),
                event = %other,
                "Unknown event type received"
            );
        }
    }
}

/// Resolve a channel's parent server, consulting the per-connection cache
/// before persistence. Unknown channels resolve to `None` and the frame is
/// dropped by the caller.
async fn resolve_parent_server(
    store: &Arc<dyn RealtimeStore>,
    conn: &Arc<Connection>,
    channel_id: u64,
) -> Option<u64> {
    if let Some(server_id) = conn.cached_parent_server(channel_id) {
        return Some(server_id);
    }

    match store.parent_server(channel_id).await {
        Ok(Some(server_id)) => {
            conn.cache_parent_server(channel_id, server_id);
            Some(server_id)
        }
        Ok(None) => {
            tracing::debug!(channel_id, "Signaling frame for unknown channel");
            None
        }
        Err(e) => {
            tracing::warn!(
                channel_id,
                error = ?e,
                "Failed to resolve channel's parent server; dropping frame"
            );
            None
        }
    }
}
