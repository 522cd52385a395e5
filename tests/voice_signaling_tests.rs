mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use hermes_server::sfu::RoomRegistry;
use hermes_server::store::RealtimeStore;
use hermes_server::websocket::{route_message, Envelope, Hub};

use common::{connect, drain, settle, TestStore};

const CHANNEL: u64 = 500;
const SERVER: u64 = 100;

// ============================================================================
// Fixtures
// ============================================================================

fn client_api() -> API {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .expect("client codecs");
    let mut registry = webrtc::interceptor::registry::Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).expect("client interceptors");
    APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build()
}

/// A browser-side peer connection that publishes one audio transceiver and
/// can author real SDP offers.
async fn client_offer(api: &API) -> (Arc<RTCPeerConnection>, RTCSessionDescription) {
    let pc = Arc::new(
        api.new_peer_connection(RTCConfiguration::default())
            .await
            .expect("client peer connection"),
    );
    pc.add_transceiver_from_kind(RTPCodecType::Audio, None)
        .await
        .expect("client audio transceiver");

    let offer = pc.create_offer(None).await.expect("client offer");
    pc.set_local_description(offer.clone())
        .await
        .expect("client local description");
    (pc, offer)
}

struct VoiceHarness {
    hub: Hub,
    sfu: Arc<RoomRegistry>,
    store: Arc<dyn RealtimeStore>,
    api: API,
}

fn harness() -> VoiceHarness {
    let store = Arc::new(
        TestStore {
            channels: vec![(CHANNEL, SERVER)],
            ..Default::default()
        }
        .add_profile(1, "alice")
        .add_profile(2, "bob"),
    );
    let store: Arc<dyn RealtimeStore> = store;
    let hub = Hub::spawn(store.clone());
    let sfu = RoomRegistry::new(hub.clone(), store.clone(), vec![]);
    VoiceHarness {
        hub,
        sfu,
        store,
        api: client_api(),
    }
}

fn events_named(envelopes: &[Envelope], event: &str) -> Vec<Envelope> {
    envelopes
        .iter()
        .filter(|e| e.event == event)
        .cloned()
        .collect()
}

/// Real time passes inside webrtc's internals, so let callbacks land.
async fn breathe(hub: &Hub) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    settle(hub).await;
}

// ============================================================================
// Voice join / leave over the signaling bridge
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn voice_join_answers_and_announces() {
    let h = harness();

    let (conn1, mut rx1) = connect(1, &[SERVER]);
    let (conn2, mut rx2) = connect(2, &[SERVER]);
    h.hub.register(conn1.clone()).await;
    h.hub.register(conn2.clone()).await;
    settle(&h.hub).await;
    drain(&mut rx1);
    drain(&mut rx2);

    // User 1 offers into channel 500; the server answers.
    let (_client1, offer1) = client_offer(&h.api).await;
    route_message(
        &h.hub,
        &h.sfu,
        &h.store,
        &conn1,
        Envelope::channel_event(
            CHANNEL,
            "WEBRTC_OFFER",
            serde_json::to_value(&offer1).unwrap(),
        ),
    )
    .await;
    breathe(&h.hub).await;

    let to_user1 = drain(&mut rx1);
    let answers = events_named(&to_user1, "WEBRTC_ANSWER");
    assert_eq!(answers.len(), 1, "the server answers the initial offer");
    assert_eq!(answers[0].channel_id, Some(CHANNEL));
    assert_eq!(answers[0].data["type"], json!("answer"));
    assert!(answers[0].data["sdp"].as_str().is_some_and(|s| !s.is_empty()));

    // The join is announced to the whole server room.
    let join_updates = events_named(&to_user1, "VOICE_STATE_UPDATE");
    assert_eq!(join_updates.len(), 1);
    assert_eq!(join_updates[0].data["action"], json!("join"));
    assert_eq!(join_updates[0].data["channel_id"], json!(CHANNEL.to_string()));
    assert_eq!(join_updates[0].data["user"]["name"], json!("alice"));
    assert_eq!(
        events_named(&drain(&mut rx2), "VOICE_STATE_UPDATE").len(),
        1,
        "other members of the server see the join"
    );

    assert_eq!(h.sfu.participants(CHANNEL).await, vec![1]);

    // User 2 joins: gets an answer; user 1 is told a peer arrived.
    let (_client2, offer2) = client_offer(&h.api).await;
    route_message(
        &h.hub,
        &h.sfu,
        &h.store,
        &conn2,
        Envelope::channel_event(
            CHANNEL,
            "WEBRTC_OFFER",
            serde_json::to_value(&offer2).unwrap(),
        ),
    )
    .await;
    breathe(&h.hub).await;

    let to_user2 = drain(&mut rx2);
    assert_eq!(events_named(&to_user2, "WEBRTC_ANSWER").len(), 1);

    let to_user1 = drain(&mut rx1);
    let joined = events_named(&to_user1, "VOICE_USER_JOINED");
    assert_eq!(joined.len(), 1);
    assert_eq!(joined[0].data["user"]["name"], json!("bob"));

    let mut participants = h.sfu.participants(CHANNEL).await;
    participants.sort_unstable();
    assert_eq!(participants, vec![1, 2]);

    // User 1's socket dies: their session leaves, user 2 is told, and the
    // room survives with one participant.
    h.sfu.disconnect(1, conn1.conn_id()).await;
    breathe(&h.hub).await;

    let to_user2 = drain(&mut rx2);
    assert_eq!(events_named(&to_user2, "VOICE_USER_LEFT").len(), 1);
    let leave_updates = events_named(&to_user2, "VOICE_STATE_UPDATE");
    assert_eq!(leave_updates.len(), 1);
    assert_eq!(leave_updates[0].data["action"], json!("leave"));

    assert_eq!(h.sfu.participants(CHANNEL).await, vec![2]);

    // Last participant out: the room is destroyed.
    h.sfu.disconnect(2, conn2.conn_id()).await;
    breathe(&h.hub).await;
    assert_eq!(h.sfu.room_count().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn renegotiation_offer_from_client_is_answered() {
    let h = harness();

    let (conn1, mut rx1) = connect(1, &[SERVER]);
    h.hub.register(conn1.clone()).await;
    settle(&h.hub).await;
    drain(&mut rx1);

    let (client1, offer1) = client_offer(&h.api).await;
    route_message(
        &h.hub,
        &h.sfu,
        &h.store,
        &conn1,
        Envelope::channel_event(
            CHANNEL,
            "WEBRTC_OFFER",
            serde_json::to_value(&offer1).unwrap(),
        ),
    )
    .await;
    breathe(&h.hub).await;
    let first_answer = events_named(&drain(&mut rx1), "WEBRTC_ANSWER");
    assert_eq!(first_answer.len(), 1);
    client1
        .set_remote_description(
            RTCSessionDescription::answer(
                first_answer[0].data["sdp"].as_str().unwrap().to_owned(),
            )
            .unwrap(),
        )
        .await
        .expect("client applies answer");

    // The client re-offers on the same session (e.g. toggling a track).
    let reoffer = client1.create_offer(None).await.expect("re-offer");
    client1
        .set_local_description(reoffer.clone())
        .await
        .expect("client re-offer local description");
    route_message(
        &h.hub,
        &h.sfu,
        &h.store,
        &conn1,
        Envelope::channel_event(
            CHANNEL,
            "WEBRTC_OFFER",
            serde_json::to_value(&reoffer).unwrap(),
        ),
    )
    .await;
    breathe(&h.hub).await;

    assert_eq!(
        events_named(&drain(&mut rx1), "WEBRTC_ANSWER").len(),
        1,
        "the existing session renegotiates instead of rejoining"
    );
    assert_eq!(h.sfu.participants(CHANNEL).await, vec![1]);
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_offer_is_dropped_without_joining() {
    let h = harness();
    let (conn1, mut rx1) = connect(1, &[SERVER]);
    h.hub.register(conn1.clone()).await;
    settle(&h.hub).await;
    drain(&mut rx1);

    route_message(
        &h.hub,
        &h.sfu,
        &h.store,
        &conn1,
        Envelope::channel_event(CHANNEL, "WEBRTC_OFFER", json!({ "not": "an offer" })),
    )
    .await;
    breathe(&h.hub).await;

    assert_eq!(h.sfu.room_count().await, 0);
    assert!(events_named(&drain(&mut rx1), "WEBRTC_ANSWER").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn ice_candidate_before_any_session_is_dropped() {
    let h = harness();
    let (conn1, _rx1) = connect(1, &[SERVER]);
    h.hub.register(conn1.clone()).await;
    settle(&h.hub).await;

    route_message(
        &h.hub,
        &h.sfu,
        &h.store,
        &conn1,
        Envelope::channel_event(
            CHANNEL,
            "ICE_CANDIDATE",
            json!({ "candidate": "candidate:1 1 UDP 2130706431 127.0.0.1 50000 typ host" }),
        ),
    )
    .await;

    assert_eq!(
        h.sfu.room_count().await,
        0,
        "a stray candidate must not create a room"
    );
}
