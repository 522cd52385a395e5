use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::id_str_opt;

/// The canonical wire event for everything that crosses a gateway socket:
/// chat broadcasts, presence transitions, and WebRTC signaling alike.
///
/// `server_id` selects the fan-out room; `channel_id` is informational for
/// receivers (and addresses the SFU room for signaling events). Both are
/// decimal strings on the wire to survive 64-bit IDs in JavaScript clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(
        default,
        with = "id_str_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub server_id: Option<u64>,
    #[serde(
        default,
        with = "id_str_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub channel_id: Option<u64>,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// An event fanned out to every connection subscribed to `server_id`.
    pub fn server_event(server_id: u64, event: &str, data: Value) -> Self {
        Envelope {
            server_id: Some(server_id),
            channel_id: None,
            event: event.to_owned(),
            data,
        }
    }

    /// A per-connection signaling event addressed to a voice channel.
    pub fn channel_event(channel_id: u64, event: &str, data: Value) -> Self {
        Envelope {
            server_id: None,
            channel_id: Some(channel_id),
            event: event.to_owned(),
            data,
        }
    }
}

// ── Client-to-server event tags ──────────────────────────────────────────────

pub const EVENT_TYPING_START: &str = "TYPING_START";
pub const EVENT_WEBRTC_OFFER: &str = "WEBRTC_OFFER";
pub const EVENT_WEBRTC_ANSWER: &str = "WEBRTC_ANSWER";
pub const EVENT_ICE_CANDIDATE: &str = "ICE_CANDIDATE";

// ── Server-to-client event tags ──────────────────────────────────────────────

pub const EVENT_PRESENCE_UPDATE: &str = "PRESENCE_UPDATE";
pub const EVENT_MESSAGE_CREATE: &str = "MESSAGE_CREATE";
pub const EVENT_MESSAGE_UPDATE: &str = "MESSAGE_UPDATE";
pub const EVENT_MESSAGE_DELETE: &str = "MESSAGE_DELETE";
pub const EVENT_VOICE_STATE_UPDATE: &str = "VOICE_STATE_UPDATE";
pub const EVENT_VOICE_USER_JOINED: &str = "VOICE_USER_JOINED";
pub const EVENT_VOICE_USER_LEFT: &str = "VOICE_USER_LEFT";

/// WebRTC signaling frames are the only client frames allowed past the
/// control-frame size cap — SDP bodies run to a few KiB.
pub fn is_signaling_event(event: &str) -> bool {
    matches!(
        event,
        EVENT_WEBRTC_OFFER | EVENT_WEBRTC_ANSWER | EVENT_ICE_CANDIDATE
    )
}
