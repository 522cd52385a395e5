//! Selective-forwarding voice unit.
//!
//! Each voice channel maps to a [`Room`] holding one [`PeerSession`] per
//! participant. Ingress RTP from any publisher is copied onto a server-side
//! egress track and re-fanned out to every other peer, renegotiating their
//! sessions as the track set changes. No transcoding — the server only
//! routes packets.

pub mod room;
pub mod session;

pub use room::Room;
pub use session::{PeerSession, SessionState};

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

use crate::store::RealtimeStore;
use crate::websocket::events::{
    EVENT_ICE_CANDIDATE, EVENT_VOICE_STATE_UPDATE, EVENT_VOICE_USER_JOINED,
    EVENT_VOICE_USER_LEFT, EVENT_WEBRTC_ANSWER, EVENT_WEBRTC_OFFER,
};
use crate::websocket::{Connection, Envelope, Hub};

/// Build the shared WebRTC API: default codecs (Opus for audio) plus the
/// default interceptor chain.
fn build_api() -> API {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .expect("failed to register default codecs");

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .expect("failed to register interceptors");

    APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build()
}

/// Map of channel → media room, plus everything a room needs to signal:
/// the hub for server-wide voice-state announcements and the store for user
/// display fields.
///
/// Lock order is registry → room, never the reverse (`Room` documents the
/// same rule from its side). Room teardown flips the room's `closed` flag
/// while both locks are held, so `get_or_create` can never resurrect a room
/// that is mid-deletion.
pub struct RoomRegistry {
    api: API,
    ice_urls: Vec<String>,
    hub: Hub,
    store: Arc<dyn RealtimeStore>,
    rooms: Mutex<HashMap<u64, Arc<Room>>>,
}

impl RoomRegistry {
    pub fn new(hub: Hub, store: Arc<dyn RealtimeStore>, ice_urls: Vec<String>) -> Arc<Self> {
        Arc::new(RoomRegistry {
            api: build_api(),
            ice_urls,
            hub,
            store,
            rooms: Mutex::new(HashMap::new()),
        })
    }

    /// Entry point from the signaling router. The router has already
    /// resolved and authorised `server_id` for this channel.
    pub async fn handle_signal(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        channel_id: u64,
        server_id: u64,
        event: &str,
        data: serde_json::Value,
    ) {
        match event {
            EVENT_WEBRTC_OFFER => {
                let offer = match serde_json::from_value::<RTCSessionDescription>(data) {
                    Ok(offer) => offer,
                    Err(e) => {
                        tracing::warn!(user_id = conn.user_id(), error = %e, "Invalid offer format");
                        return;
                    }
                };
                self.handle_offer(conn, channel_id, server_id, offer).await;
            }

            EVENT_WEBRTC_ANSWER => {
                let answer = match serde_json::from_value::<RTCSessionDescription>(data) {
                    Ok(answer) => answer,
                    Err(e) => {
                        tracing::warn!(user_id = conn.user_id(), error = %e, "Invalid answer format");
                        return;
                    }
                };
                let Some(session) = self.session_for(channel_id, conn).await else {
                    tracing::debug!(
                        user_id = conn.user_id(),
                        channel_id,
                        "Answer for unknown voice session"
                    );
                    return;
                };
                if let Err(e) = session.apply_remote_answer(answer).await {
                    tracing::error!(
                        user_id = conn.user_id(),
                        channel_id,
                        error = ?e,
                        "Failed to apply renegotiation answer; closing peer session"
                    );
                    self.remove_peer(channel_id, conn.user_id(), Some(conn.conn_id()))
                        .await;
                }
            }

            EVENT_ICE_CANDIDATE => {
                let candidate = match serde_json::from_value(data) {
                    Ok(candidate) => candidate,
                    Err(e) => {
                        tracing::warn!(
                            user_id = conn.user_id(),
                            error = %e,
                            "Invalid ICE candidate format"
                        );
                        return;
                    }
                };
                let Some(session) = self.session_for(channel_id, conn).await else {
                    tracing::debug!(
                        user_id = conn.user_id(),
                        channel_id,
                        "ICE candidate for unknown voice session"
                    );
                    return;
                };
                session.add_remote_candidate(candidate).await;
            }

            other => {
                tracing::debug!(event = %other, "Unknown voice event type received");
            }
        }
    }

    /// A client offer either renegotiates its existing session or joins the
    /// room with a fresh peer connection.
    async fn handle_offer(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        channel_id: u64,
        server_id: u64,
        offer: RTCSessionDescription,
    ) {
        if let Some(session) = self.session_for(channel_id, conn).await {
            match session.apply_remote_offer(offer).await {
                Ok(answer) => match serde_json::to_value(&answer) {
                    Ok(value) => session.signal(EVENT_WEBRTC_ANSWER, value),
                    Err(e) => tracing::error!(error = ?e, "Failed to serialize answer"),
                },
                Err(e) => {
                    tracing::error!(
                        user_id = conn.user_id(),
                        channel_id,
                        error = ?e,
                        "Renegotiation offer failed; closing peer session"
                    );
                    self.remove_peer(channel_id, conn.user_id(), Some(conn.conn_id()))
                        .await;
                }
            }
            return;
        }

        self.join(conn, channel_id, server_id, offer).await;
    }

    /// Create the peer connection, install its callbacks, enter the room,
    /// and answer the initial offer.
    async fn join(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        channel_id: u64,
        server_id: u64,
        offer: RTCSessionDescription,
    ) {
        let user_id = conn.user_id();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_urls.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = match self.api.new_peer_connection(config).await {
            Ok(pc) => Arc::new(pc),
            Err(e) => {
                tracing::error!(user_id, channel_id, error = ?e, "Failed to create peer connection");
                return;
            }
        };

        let session = PeerSession::new(user_id, conn.conn_id(), channel_id, pc.clone(), conn.clone());

        // Trickle the server's own ICE candidates down the same socket.
        let ice_conn = conn.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let conn = ice_conn.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => match serde_json::to_value(init) {
                        Ok(value) => {
                            conn.try_send(Envelope::channel_event(
                                channel_id,
                                EVENT_ICE_CANDIDATE,
                                value,
                            ));
                        }
                        Err(e) => tracing::warn!(error = ?e, "Failed to serialize ICE candidate"),
                    },
                    Err(e) => tracing::warn!(error = ?e, "Failed to convert ICE candidate"),
                }
            })
        }));

        // Weak: the callback must not keep the peer connection alive.
        let state_session = Arc::downgrade(&session);
        pc.on_peer_connection_state_change(Box::new(move |pc_state| {
            let weak = state_session.clone();
            Box::pin(async move {
                tracing::debug!(user_id, channel_id, state = %pc_state, "Peer connection state changed");
                if let Some(session) = weak.upgrade() {
                    session.note_connection_state(pc_state);
                }
            })
        }));

        // Publisher ingress: every remote track becomes a forwarded egress.
        let on_track_registry = Arc::clone(self);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let registry = Arc::clone(&on_track_registry);
            Box::pin(async move {
                registry.on_remote_track(channel_id, user_id, track).await;
            })
        }));

        // Enter the room; a concurrent teardown makes add_peer fail with
        // RoomClosed and the loop lands in a fresh room.
        let (room, replaced) = loop {
            let room = self.get_or_create(channel_id, server_id).await;
            match room.add_peer(session.clone()).await {
                Ok(replaced) => break (room, replaced),
                Err(room::RoomClosed) => continue,
            }
        };
        if let Some(old) = replaced {
            tracing::debug!(user_id, channel_id, "Replacing existing voice session");
            old.close().await;
        }

        match session.apply_remote_offer(offer).await {
            Ok(answer) => match serde_json::to_value(&answer) {
                Ok(value) => session.signal(EVENT_WEBRTC_ANSWER, value),
                Err(e) => tracing::error!(error = ?e, "Failed to serialize answer"),
            },
            Err(e) => {
                tracing::error!(
                    user_id,
                    channel_id,
                    error = ?e,
                    "Failed to answer initial offer; closing peer session"
                );
                self.remove_peer_inner(channel_id, user_id, Some(conn.conn_id()), false)
                    .await;
                return;
            }
        }

        tracing::info!(user_id, channel_id, "Peer joined voice room");

        // Announce to the server room and to the other participants.
        let user = self.voice_user(user_id).await;
        self.hub
            .broadcast(voice_state_update(server_id, channel_id, "join", &user))
            .await;
        for peer in room.peers_snapshot().await {
            if peer.user_id() != user_id {
                peer.signal(EVENT_VOICE_USER_JOINED, json!({ "user": user }));
            }
        }
    }

    /// A publisher's RTP track arrived: clone it into an egress track, spawn
    /// the forwarding loop, and renegotiate every other peer.
    async fn on_remote_track(
        self: &Arc<Self>,
        channel_id: u64,
        publisher: u64,
        remote: Arc<TrackRemote>,
    ) {
        let codec = remote.codec();
        tracing::info!(
            publisher,
            channel_id,
            codec = %codec.capability.mime_type,
            "Received remote track"
        );

        // Same codec capability, track ID, and stream ID as the remote, so
        // subscribers see the publisher's identifiers.
        let egress = Arc::new(TrackLocalStaticRTP::new(
            codec.capability.clone(),
            remote.id(),
            remote.stream_id(),
        ));

        // Forwarding loop: one task per published track, holding no locks.
        // Exits on the first read error (publisher gone) or write error.
        let forward = egress.clone();
        tokio::spawn(async move {
            while let Ok((packet, _)) = remote.read_rtp().await {
                if forward.write_rtp(&packet).await.is_err() {
                    break;
                }
            }
            tracing::debug!(publisher, channel_id, "RTP forwarding ended");
        });

        let Some(room) = self.room(channel_id).await else {
            tracing::debug!(channel_id, "Track arrived for a room that already closed");
            return;
        };

        let subscribers = room.publish_track(publisher, egress.clone()).await;
        for peer in subscribers {
            if let Err(e) = peer.attach_track(egress.clone()).await {
                tracing::error!(
                    publisher,
                    subscriber = peer.user_id(),
                    error = ?e,
                    "Failed to attach forwarded track"
                );
                continue;
            }
            if let Err(e) = peer.send_renegotiation_offer().await {
                tracing::error!(
                    subscriber = peer.user_id(),
                    error = ?e,
                    "Renegotiation failed after track add"
                );
            }
        }
    }

    /// Remove a user's peer session. `expected_conn` guards against a stale
    /// disconnect racing a newer session from the same user.
    pub async fn remove_peer(
        self: &Arc<Self>,
        channel_id: u64,
        user_id: u64,
        expected_conn: Option<Uuid>,
    ) {
        self.remove_peer_inner(channel_id, user_id, expected_conn, true)
            .await;
    }

    /// `announce: false` is the failed-join path — the peer never announced
    /// a join, so no departure is broadcast either.
    async fn remove_peer_inner(
        self: &Arc<Self>,
        channel_id: u64,
        user_id: u64,
        expected_conn: Option<Uuid>,
        announce: bool,
    ) {
        // Registry lock, then room lock. The room is unlinked while both
        // are held so get_or_create cannot hand out a closed room.
        let (removed, remaining, server_id) = {
            let mut rooms = self.rooms.lock().await;
            let Some(room) = rooms.get(&channel_id).cloned() else {
                return;
            };
            let (removed, remaining, now_empty) =
                room.remove_peer_if(user_id, expected_conn).await;
            if now_empty {
                rooms.remove(&channel_id);
                tracing::info!(channel_id, "Voice room empty; destroyed");
            }
            (removed, remaining, room.server_id())
        };

        let Some(session) = removed else { return };
        session.close().await;
        tracing::info!(user_id, channel_id, "Peer left voice room");

        if !announce {
            return;
        }
        let user = self.voice_user(user_id).await;
        self.hub
            .broadcast(voice_state_update(server_id, channel_id, "leave", &user))
            .await;
        for peer in remaining {
            peer.signal(EVENT_VOICE_USER_LEFT, json!({ "user": user }));
        }
    }

    /// Gateway connection closed: tear down every session it owns. Rooms are
    /// gathered first, then peers removed one by one, to respect the
    /// registry → room lock order.
    pub async fn disconnect(self: &Arc<Self>, user_id: u64, conn_id: Uuid) {
        let mut channels = Vec::new();
        {
            let rooms = self.rooms.lock().await;
            for (channel_id, room) in rooms.iter() {
                if room.owns_session(user_id, conn_id).await {
                    channels.push(*channel_id);
                }
            }
        }

        for channel_id in channels {
            self.remove_peer(channel_id, user_id, Some(conn_id)).await;
        }
    }

    pub async fn room(&self, channel_id: u64) -> Option<Arc<Room>> {
        self.rooms.lock().await.get(&channel_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    /// Live participants of a voice channel, for the roster endpoint.
    pub async fn participants(&self, channel_id: u64) -> Vec<u64> {
        match self.room(channel_id).await {
            Some(room) => room.participants().await,
            None => Vec::new(),
        }
    }

    async fn get_or_create(&self, channel_id: u64, server_id: u64) -> Arc<Room> {
        let mut rooms = self.rooms.lock().await;
        rooms
            .entry(channel_id)
            .or_insert_with(|| {
                tracing::info!(channel_id, "Voice room created");
                Room::new(channel_id, server_id)
            })
            .clone()
    }

    async fn session_for(
        &self,
        channel_id: u64,
        conn: &Arc<Connection>,
    ) -> Option<Arc<PeerSession>> {
        let room = self.room(channel_id).await?;
        let session = room.peer(conn.user_id()).await?;
        (session.conn_id() == conn.conn_id()).then_some(session)
    }

    /// User display fields for voice announcements. Falls back to the bare
    /// ID when the profile lookup fails — the announcement still goes out.
    async fn voice_user(&self, user_id: u64) -> serde_json::Value {
        match self.store.user_profile(user_id).await {
            Ok(Some(profile)) => serde_json::to_value(&profile)
                .unwrap_or_else(|_| json!({ "id": user_id.to_string() })),
            Ok(None) => json!({ "id": user_id.to_string() }),
            Err(e) => {
                tracing::warn!(user_id, error = ?e, "Failed to load profile for voice event");
                json!({ "id": user_id.to_string() })
            }
        }
    }
}

/// `VOICE_STATE_UPDATE` fanned out to the channel's parent server room.
fn voice_state_update(
    server_id: u64,
    channel_id: u64,
    action: &str,
    user: &serde_json::Value,
) -> Envelope {
    Envelope {
        server_id: Some(server_id),
        channel_id: Some(channel_id),
        event: EVENT_VOICE_STATE_UPDATE.to_owned(),
        data: json!({
            "channel_id": channel_id.to_string(),
            "action": action,
            "user": user,
        }),
    }
}

// ============================================================================
// Tests
// ============================================================================
