// Each integration test file is a separate binary; helpers not used in every
// binary would otherwise trigger dead_code warnings from clippy.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::async_trait;
use tokio::sync::mpsc::Receiver;

use hermes_server::error::AppResult;
use hermes_server::models::{PresenceStatus, UserProfile};
use hermes_server::store::RealtimeStore;
use hermes_server::websocket::{Connection, Envelope, Hub};

/// In-memory stand-in for the persistence layer: a fixed channel → server
/// topology, canned user profiles, and a log of presence writes.
#[derive(Default)]
pub struct TestStore {
    /// (channel_id, parent server_id)
    pub channels: Vec<(u64, u64)>,
    pub profiles: HashMap<u64, UserProfile>,
    pub presence: Mutex<Vec<(u64, PresenceStatus)>>,
}

impl TestStore {
    pub fn with_channel(channel_id: u64, server_id: u64) -> Arc<Self> {
        Arc::new(TestStore {
            channels: vec![(channel_id, server_id)],
            ..Default::default()
        })
    }

    pub fn add_profile(mut self, user_id: u64, name: &str) -> Self {
        self.profiles.insert(
            user_id,
            UserProfile {
                id: user_id,
                name: name.to_owned(),
                avatar_url: None,
            },
        );
        self
    }

    pub fn presence_log(&self) -> Vec<(u64, PresenceStatus)> {
        self.presence.lock().unwrap().clone()
    }
}

#[async_trait]
impl RealtimeStore for TestStore {
    async fn load_membership(&self, _user_id: u64) -> AppResult<Vec<u64>> {
        Ok(vec![])
    }

    async fn persist_presence(&self, user_id: u64, status: PresenceStatus) -> AppResult<()> {
        self.presence.lock().unwrap().push((user_id, status));
        Ok(())
    }

    async fn parent_server(&self, channel_id: u64) -> AppResult<Option<u64>> {
        Ok(self
            .channels
            .iter()
            .find(|(c, _)| *c == channel_id)
            .map(|(_, s)| *s))
    }

    async fn user_profile(&self, user_id: u64) -> AppResult<Option<UserProfile>> {
        Ok(self.profiles.get(&user_id).cloned())
    }
}

/// A fake gateway connection: the test keeps the receiver half the write
/// pump would normally own.
pub fn connect(user_id: u64, servers: &[u64]) -> (Arc<Connection>, Receiver<Envelope>) {
    let (conn, rx) = Connection::new(user_id, servers.to_vec());
    (Arc::new(conn), rx)
}

/// Let spawned tasks run, then flush the hub mailbox. `stats` is processed
/// strictly after every previously queued command, so this doubles as a
/// barrier.
pub async fn settle(hub: &Hub) {
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    let _ = hub.stats().await;
}

pub fn drain(rx: &mut Receiver<Envelope>) -> Vec<Envelope> {
    let mut out = Vec::new();
    while let Ok(env) = rx.try_recv() {
        out.push(env);
    }
    out
}

/// (server_id, status) pairs from the PRESENCE_UPDATE envelopes in a batch.
pub fn presence_events(envelopes: &[Envelope]) -> Vec<(u64, String)> {
    envelopes
        .iter()
        .filter(|e| e.event == "PRESENCE_UPDATE")
        .map(|e| {
            (
                e.server_id.expect("presence event without server_id"),
                e.data["status"].as_str().expect("status field").to_owned(),
            )
        })
        .collect()
}

/// Event tags from a batch, in delivery order.
pub fn event_tags(envelopes: &[Envelope]) -> Vec<String> {
    envelopes.iter().map(|e| e.event.clone()).collect()
}
