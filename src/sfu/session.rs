use std::sync::{Arc, Mutex};

use serde_json::Value;
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use crate::websocket::events::EVENT_WEBRTC_OFFER;
use crate::websocket::{Connection, Envelope, SendOutcome};

/// Signaling lifecycle of one peer connection.
///
/// The server answers the initial session and offers on renegotiations, so
/// either description can be set first; the state only gates logging and the
/// terminal `Closed` check — ICE queueing keys off the actual remote
/// description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    OfferSent,
    RemoteSet,
    Connected,
    Closed,
}

impl SessionState {
    pub fn on_local_description(self) -> Self {
        match self {
            SessionState::New => SessionState::OfferSent,
            other => other,
        }
    }

    pub fn on_remote_description(self) -> Self {
        match self {
            SessionState::New | SessionState::OfferSent | SessionState::RemoteSet => {
                SessionState::RemoteSet
            }
            other => other,
        }
    }

    pub fn on_connected(self) -> Self {
        match self {
            SessionState::Closed => SessionState::Closed,
            _ => SessionState::Connected,
        }
    }

    pub fn on_closed(self) -> Self {
        SessionState::Closed
    }
}

/// One user's WebRTC connection in one voice room.
///
/// Owns the SDP state machine and the pending-ICE queue. All signaling for a
/// session runs on its connection's read pump, so offer/answer handling and
/// candidate handling never interleave; the mutexes only cover the WebRTC
/// event-loop callbacks.
pub struct PeerSession {
    user_id: u64,
    conn_id: Uuid,
    channel_id: u64,
    pc: Arc<RTCPeerConnection>,
    conn: Arc<Connection>,
    state: Mutex<SessionState>,
    /// Candidates that raced ahead of the SDP answer. Browsers do this
    /// routinely; they are applied FIFO once the remote description lands.
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
}

impl PeerSession {
    pub(crate) fn new(
        user_id: u64,
        conn_id: Uuid,
        channel_id: u64,
        pc: Arc<RTCPeerConnection>,
        conn: Arc<Connection>,
    ) -> Arc<Self> {
        Arc::new(PeerSession {
            user_id,
            conn_id,
            channel_id,
            pc,
            conn,
            state: Mutex::new(SessionState::New),
            pending_candidates: Mutex::new(Vec::new()),
        })
    }

    pub fn user_id(&self) -> u64 {
        self.user_id
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state lock poisoned")
    }

    fn transition(&self, f: impl FnOnce(SessionState) -> SessionState) {
        let mut state = self.state.lock().expect("session state lock poisoned");
        *state = f(*state);
    }

    /// Push a signaling event down this peer's own gateway connection. A
    /// full or closed queue means the hub is about to evict the connection;
    /// the frame is dropped and the disconnect path cleans the session up.
    pub fn signal(&self, event: &str, data: Value) {
        let envelope = Envelope::channel_event(self.channel_id, event, data);
        match self.conn.try_send(envelope) {
            SendOutcome::Delivered => {}
            outcome => {
                tracing::debug!(
                    user_id = self.user_id,
                    event,
                    ?outcome,
                    "Dropped signaling frame for unhealthy connection"
                );
            }
        }
    }

    /// Attach an egress track as a sender on this peer's connection.
    pub(crate) async fn attach_track(
        &self,
        track: Arc<TrackLocalStaticRTP>,
    ) -> Result<(), webrtc::Error> {
        self.pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map(|_| ())
    }

    /// Apply a client offer and produce the server's answer. Used both for
    /// the initial session (server as answerer) and client-initiated
    /// renegotiations.
    pub(crate) async fn apply_remote_offer(
        &self,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription, webrtc::Error> {
        self.pc.set_remote_description(offer).await?;
        self.transition(SessionState::on_remote_description);
        self.drain_pending_candidates().await;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        self.transition(SessionState::on_local_description);
        Ok(answer)
    }

    /// Apply the client's answer to a server-initiated renegotiation offer.
    pub(crate) async fn apply_remote_answer(
        &self,
        answer: RTCSessionDescription,
    ) -> Result<(), webrtc::Error> {
        self.pc.set_remote_description(answer).await?;
        self.transition(SessionState::on_remote_description);
        self.drain_pending_candidates().await;
        Ok(())
    }

    /// Renegotiate after the track set changed: offer from the server side,
    /// trickling ICE as it gathers.
    pub(crate) async fn send_renegotiation_offer(&self) -> Result<(), webrtc::Error> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        self.transition(SessionState::on_local_description);

        match serde_json::to_value(&offer) {
            Ok(value) => self.signal(EVENT_WEBRTC_OFFER, value),
            Err(e) => tracing::error!(
                user_id = self.user_id,
                error = ?e,
                "Failed to serialize renegotiation offer; this is a programming error"
            ),
        }
        Ok(())
    }

    /// Queue or apply a remote ICE candidate. Candidates arriving before the
    /// remote description are queued, never discarded.
    pub(crate) async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) {
        if self.state() == SessionState::Closed {
            tracing::debug!(user_id = self.user_id, "Dropping candidate for closed session");
            return;
        }

        if self.pc.remote_description().await.is_none() {
            tracing::debug!(
                user_id = self.user_id,
                "Queueing ICE candidate until remote description is set"
            );
            self.pending_candidates
                .lock()
                .expect("pending candidate lock poisoned")
                .push(candidate);
            return;
        }

        if let Err(e) = self.pc.add_ice_candidate(candidate).await {
            tracing::warn!(
                user_id = self.user_id,
                error = ?e,
                "Failed to add ICE candidate"
            );
        }
    }

    /// Apply queued candidates in arrival order.
    async fn drain_pending_candidates(&self) {
        let queued: Vec<RTCIceCandidateInit> = std::mem::take(
            &mut *self
                .pending_candidates
                .lock()
                .expect("pending candidate lock poisoned"),
        );
        if queued.is_empty() {
            return;
        }

        tracing::debug!(
            user_id = self.user_id,
            count = queued.len(),
            "Applying queued ICE candidates"
        );
        for candidate in queued {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                tracing::warn!(
                    user_id = self.user_id,
                    error = ?e,
                    "Failed to add queued ICE candidate"
                );
            }
        }
    }

    pub(crate) fn note_connection_state(&self, state: RTCPeerConnectionState) {
        match state {
            RTCPeerConnectionState::Connected => self.transition(SessionState::on_connected),
            RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed => {
                self.transition(SessionState::on_closed)
            }
            _ => {}
        }
    }

    /// Terminal. Further signaling for this session is dropped.
    pub(crate) async fn close(&self) {
        self.transition(SessionState::on_closed);
        if let Err(e) = self.pc.close().await {
            tracing::debug!(user_id = self.user_id, error = ?e, "Error closing peer connection");
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending_candidates
            .lock()
            .expect("pending candidate lock poisoned")
            .len()
    }

    #[cfg(test)]
    pub(crate) async fn sender_count(&self) -> usize {
        self.pc.get_senders().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ------------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------------

    #[test]
    fn initial_session_transitions_remote_first() {
        // Server as answerer: remote offer lands before the local answer.
        let state = SessionState::New;
        let state = state.on_remote_description();
        assert_eq!(state, SessionState::RemoteSet);
        let state = state.on_local_description();
        assert_eq!(state, SessionState::RemoteSet, "RemoteSet is sticky");
        let state = state.on_connected();
        assert_eq!(state, SessionState::Connected);
    }

    #[test]
    fn renegotiation_transitions_local_first() {
        // Server as offerer on renegotiation.
        let state = SessionState::New.on_local_description();
        assert_eq!(state, SessionState::OfferSent);
        let state = state.on_remote_description();
        assert_eq!(state, SessionState::RemoteSet);
    }

    #[test]
    fn connected_survives_renegotiation_descriptions() {
        let state = SessionState::Connected;
        assert_eq!(state.on_local_description(), SessionState::Connected);
        assert_eq!(state.on_remote_description(), SessionState::Connected);
    }

    #[test]
    fn closed_is_terminal() {
        let state = SessionState::Closed;
        assert_eq!(state.on_local_description(), SessionState::Closed);
        assert_eq!(state.on_remote_description(), SessionState::Closed);
        assert_eq!(state.on_connected(), SessionState::Closed);
    }
}
