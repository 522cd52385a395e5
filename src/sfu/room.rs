use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use super::session::PeerSession;

/// Returned when a peer tries to join a room that emptied and closed
/// between the registry lookup and the room lock. The caller re-runs
/// `get_or_create` and lands in a fresh room.
#[derive(Debug)]
pub(crate) struct RoomClosed;

/// One voice channel's media room: the set of peer connections plus every
/// egress track accumulated from their publishers.
///
/// Lock discipline: the registry lock is always taken before a room lock,
/// never the reverse, and the room lock is never held across RTP I/O — the
/// forwarding tasks run lock-free.
pub struct Room {
    channel_id: u64,
    server_id: u64,
    inner: Mutex<RoomState>,
}

struct RoomState {
    peers: HashMap<u64, Arc<PeerSession>>,
    /// Server-side copies of every published RTP stream. Each is attached
    /// as a sender on every peer except its publisher.
    forwarded_tracks: Vec<(u64, Arc<TrackLocalStaticRTP>)>,
    /// Set while both registry and room locks are held, immediately before
    /// the room leaves the registry. Joins observing it must retry.
    closed: bool,
}

impl Room {
    pub(crate) fn new(channel_id: u64, server_id: u64) -> Arc<Self> {
        Arc::new(Room {
            channel_id,
            server_id,
            inner: Mutex::new(RoomState {
                peers: HashMap::new(),
                forwarded_tracks: Vec::new(),
                closed: false,
            }),
        })
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub fn server_id(&self) -> u64 {
        self.server_id
    }

    /// Add a peer, bringing it up to the room invariant: every existing
    /// egress track is attached as a sender before the join completes, so
    /// late joiners hear everyone already publishing.
    ///
    /// Returns the replaced session when the same user rejoins (reconnect or
    /// device switch); the caller closes it outside the room lock.
    pub(crate) async fn add_peer(
        &self,
        session: Arc<PeerSession>,
    ) -> Result<Option<Arc<PeerSession>>, RoomClosed> {
        let mut state = self.inner.lock().await;
        if state.closed {
            return Err(RoomClosed);
        }

        for (publisher, track) in &state.forwarded_tracks {
            if *publisher == session.user_id() {
                continue;
            }
            if let Err(e) = session.attach_track(track.clone()).await {
                tracing::error!(
                    channel_id = self.channel_id,
                    user_id = session.user_id(),
                    error = ?e,
                    "Failed to attach existing track to joining peer"
                );
            }
        }

        let replaced = state.peers.insert(session.user_id(), session);
        Ok(replaced)
    }

    /// Record a publisher's egress track and return the other peers that
    /// need it attached plus a renegotiation offer.
    pub(crate) async fn publish_track(
        &self,
        publisher: u64,
        track: Arc<TrackLocalStaticRTP>,
    ) -> Vec<Arc<PeerSession>> {
        let mut state = self.inner.lock().await;
        if state.closed {
            return Vec::new();
        }
        state.forwarded_tracks.push((publisher, track));
        state
            .peers
            .values()
            .filter(|peer| peer.user_id() != publisher)
            .cloned()
            .collect()
    }

    /// Remove a user's session, optionally only when it belongs to the given
    /// gateway connection (so a stale disconnect cannot tear down a newer
    /// session). Marks the room closed when the last peer leaves.
    ///
    /// Called with the registry lock held; returns the removed session (to
    /// close outside the locks), the remaining peers (for departure
    /// announcements), and whether the room just closed.
    pub(crate) async fn remove_peer_if(
        &self,
        user_id: u64,
        expected_conn: Option<Uuid>,
    ) -> (Option<Arc<PeerSession>>, Vec<Arc<PeerSession>>, bool) {
        let mut state = self.inner.lock().await;

        let matches = state.peers.get(&user_id).is_some_and(|session| {
            expected_conn.map_or(true, |conn_id| session.conn_id() == conn_id)
        });
        if !matches {
            return (None, Vec::new(), false);
        }

        let removed = state.peers.remove(&user_id);
        // The leaver's egress tracks are not pruned here: the forwarding
        // loops exit on read error and the next renegotiation drops the
        // dead senders.
        let remaining: Vec<Arc<PeerSession>> = state.peers.values().cloned().collect();
        let now_empty = state.peers.is_empty();
        if now_empty {
            state.closed = true;
        }
        (removed, remaining, now_empty)
    }

    pub(crate) async fn peer(&self, user_id: u64) -> Option<Arc<PeerSession>> {
        self.inner.lock().await.peers.get(&user_id).cloned()
    }

    pub(crate) async fn peers_snapshot(&self) -> Vec<Arc<PeerSession>> {
        self.inner.lock().await.peers.values().cloned().collect()
    }

    /// Whether this user's session in the room is owned by the given
    /// gateway connection.
    pub(crate) async fn owns_session(&self, user_id: u64, conn_id: Uuid) -> bool {
        self.inner
            .lock()
            .await
            .peers
            .get(&user_id)
            .is_some_and(|session| session.conn_id() == conn_id)
    }

    /// User IDs currently in the room, for the voice roster endpoint.
    pub async fn participants(&self) -> Vec<u64> {
        self.inner.lock().await.peers.keys().copied().collect()
    }

    #[cfg(test)]
    pub(crate) async fn forwarded_track_count(&self) -> usize {
        self.inner.lock().await.forwarded_tracks.len()
    }
}
