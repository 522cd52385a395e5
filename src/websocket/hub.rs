use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::connection::{Connection, SendOutcome};
use super::events::{Envelope, EVENT_PRESENCE_UPDATE};
use crate::models::PresenceStatus;
use crate::store::RealtimeStore;

/// How long a user may stay connection-less before `offline` is emitted.
/// Reconnecting inside the window cancels the pending transition, which
/// suppresses presence flicker from page reloads and network blips.
pub const OFFLINE_GRACE: Duration = Duration::from_secs(60);

const MAILBOX_CAPACITY: usize = 1024;

/// Commands processed by the hub's event loop. All index and presence
/// mutations happen on that single task, so presence transitions for a given
/// user are totally ordered.
enum HubCommand {
    Register(Arc<Connection>),
    Unregister(Arc<Connection>),
    FinalizeOffline {
        user_id: u64,
        server_ids: Vec<u64>,
        /// Matches the timer that sent this; stale timers are ignored.
        epoch: u64,
    },
    Broadcast(Envelope),
    JoinRoom { user_id: u64, server_id: u64 },
    LeaveRoom { user_id: u64, server_id: u64 },
    Stats(oneshot::Sender<HubStats>),
}

/// Gauge snapshot used by the health endpoint and by tests as a mailbox
/// barrier (commands are processed in FIFO order).
#[derive(Debug, Clone, Copy, Default)]
pub struct HubStats {
    pub connected_users: usize,
    pub connections: usize,
    pub rooms: usize,
}

/// Cheap handle to the hub event loop.
#[derive(Clone)]
pub struct Hub {
    tx: mpsc::Sender<HubCommand>,
}

impl Hub {
    /// Spawn the event loop. Call once per process at the composition root;
    /// tests construct as many independent hubs as they like.
    pub fn spawn(store: Arc<dyn RealtimeStore>) -> Hub {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let state = HubState {
            clients_by_user: HashMap::new(),
            rooms_by_server: HashMap::new(),
            offline_timers: HashMap::new(),
            timer_epoch: 0,
            store,
            tx: tx.clone(),
        };
        tokio::spawn(run(state, rx));
        Hub { tx }
    }

    pub async fn register(&self, conn: Arc<Connection>) {
        let _ = self.tx.send(HubCommand::Register(conn)).await;
    }

    pub async fn unregister(&self, conn: Arc<Connection>) {
        let _ = self.tx.send(HubCommand::Unregister(conn)).await;
    }

    /// Fan a server-scoped event out to every subscribed connection.
    pub async fn broadcast(&self, envelope: Envelope) {
        let _ = self.tx.send(HubCommand::Broadcast(envelope)).await;
    }

    /// Subscribe every one of the user's live connections to a server room.
    pub async fn join_room(&self, user_id: u64, server_id: u64) {
        let _ = self
            .tx
            .send(HubCommand::JoinRoom { user_id, server_id })
            .await;
    }

    pub async fn leave_room(&self, user_id: u64, server_id: u64) {
        let _ = self
            .tx
            .send(HubCommand::LeaveRoom { user_id, server_id })
            .await;
    }

    pub async fn stats(&self) -> HubStats {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(HubCommand::Stats(reply)).await.is_err() {
            return HubStats::default();
        }
        rx.await.unwrap_or_default()
    }
}

// ============================================================================
// Event loop
// ============================================================================

struct HubState {
    /// user → live connections. One user may hold several (multi-device).
    clients_by_user: HashMap<u64, HashMap<Uuid, Arc<Connection>>>,
    /// server → subscribed connections. The fan-out index.
    rooms_by_server: HashMap<u64, HashMap<Uuid, Arc<Connection>>>,
    /// Pending delayed-offline transitions, keyed by user.
    offline_timers: HashMap<u64, (u64, JoinHandle<()>)>,
    timer_epoch: u64,
    store: Arc<dyn RealtimeStore>,
    tx: mpsc::Sender<HubCommand>,
}

async fn run(mut state: HubState, mut rx: mpsc::Receiver<HubCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            HubCommand::Register(conn) => state.handle_register(conn).await,
            HubCommand::Unregister(conn) => state.handle_unregister(conn).await,
            HubCommand::FinalizeOffline {
                user_id,
                server_ids,
                epoch,
            } => state.handle_finalize_offline(user_id, server_ids, epoch).await,
            HubCommand::Broadcast(envelope) => state.handle_broadcast(envelope).await,
            HubCommand::JoinRoom { user_id, server_id } => {
                state.handle_join_room(user_id, server_id)
            }
            HubCommand::LeaveRoom { user_id, server_id } => {
                state.handle_leave_room(user_id, server_id)
            }
            HubCommand::Stats(reply) => {
                let _ = reply.send(state.stats());
            }
        }
    }
}

impl HubState {
    async fn handle_register(&mut self, conn: Arc<Connection>) {
        let user_id = conn.user_id();

        // Reconnecting inside the grace window cancels the pending offline.
        if let Some((_, timer)) = self.offline_timers.remove(&user_id) {
            timer.abort();
        }

        let first_connection = self.no_live_connections(user_id);

        self.clients_by_user
            .entry(user_id)
            .or_default()
            .insert(conn.conn_id(), conn.clone());
        for server_id in conn.subscriptions() {
            self.rooms_by_server
                .entry(server_id)
                .or_default()
                .insert(conn.conn_id(), conn.clone());
        }

        if first_connection {
            let dead = self
                .emit_presence(user_id, PresenceStatus::Online, &conn.subscriptions())
                .await;
            self.drain_dead(dead).await;
        }
    }

    async fn handle_unregister(&mut self, conn: Arc<Connection>) {
        // The eviction path may have already detached this connection.
        if !self.detach(&conn) {
            return;
        }
        conn.close_queue();

        let mut dead = Vec::new();
        if self.no_live_connections(conn.user_id()) {
            dead = self
                .mark_last_departed(conn.user_id(), conn.subscriptions())
                .await;
        }
        self.drain_dead(dead).await;
    }

    async fn handle_finalize_offline(&mut self, user_id: u64, server_ids: Vec<u64>, epoch: u64) {
        // Only honour the timer that is still current for this absence
        // episode; anything else raced a reconnect and is stale.
        match self.offline_timers.get(&user_id) {
            Some((current, _)) if *current == epoch => {
                self.offline_timers.remove(&user_id);
            }
            _ => return,
        }

        if self.no_live_connections(user_id) {
            let dead = self
                .emit_presence(user_id, PresenceStatus::Offline, &server_ids)
                .await;
            self.drain_dead(dead).await;
        }
    }

    async fn handle_broadcast(&mut self, envelope: Envelope) {
        let dead = self.fanout(&envelope);
        self.drain_dead(dead).await;
    }

    fn handle_join_room(&mut self, user_id: u64, server_id: u64) {
        let Some(user_conns) = self.clients_by_user.get(&user_id) else {
            return;
        };
        let conns: Vec<Arc<Connection>> = user_conns.values().cloned().collect();
        for conn in conns {
            conn.subscribe(server_id);
            self.rooms_by_server
                .entry(server_id)
                .or_default()
                .insert(conn.conn_id(), conn);
        }
    }

    fn handle_leave_room(&mut self, user_id: u64, server_id: u64) {
        let Some(user_conns) = self.clients_by_user.get(&user_id) else {
            return;
        };
        for conn in user_conns.values() {
            conn.unsubscribe(server_id);
            if let Some(room) = self.rooms_by_server.get_mut(&server_id) {
                room.remove(&conn.conn_id());
            }
        }
        if self
            .rooms_by_server
            .get(&server_id)
            .is_some_and(HashMap::is_empty)
        {
            self.rooms_by_server.remove(&server_id);
        }
    }

    fn stats(&self) -> HubStats {
        HubStats {
            connected_users: self.clients_by_user.len(),
            connections: self.clients_by_user.values().map(HashMap::len).sum(),
            rooms: self.rooms_by_server.len(),
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn no_live_connections(&self, user_id: u64) -> bool {
        self.clients_by_user
            .get(&user_id)
            .map_or(true, HashMap::is_empty)
    }

    /// Push an envelope at every connection in its server room without
    /// blocking. Returns the connections whose queues were full or closed;
    /// the caller must run them through [`Self::drain_dead`].
    fn fanout(&self, envelope: &Envelope) -> Vec<Arc<Connection>> {
        let Some(server_id) = envelope.server_id else {
            return Vec::new();
        };
        let Some(room) = self.rooms_by_server.get(&server_id) else {
            return Vec::new();
        };

        let mut dead = Vec::new();
        for conn in room.values() {
            match conn.try_send(envelope.clone()) {
                SendOutcome::Delivered => {}
                SendOutcome::Full | SendOutcome::Closed => dead.push(conn.clone()),
            }
        }
        dead
    }

    /// Remove a connection from both indices. Returns `false` if it was not
    /// registered (already evicted or never registered).
    fn detach(&mut self, conn: &Arc<Connection>) -> bool {
        let user_id = conn.user_id();
        let Some(user_conns) = self.clients_by_user.get_mut(&user_id) else {
            return false;
        };
        if user_conns.remove(&conn.conn_id()).is_none() {
            return false;
        }
        if user_conns.is_empty() {
            self.clients_by_user.remove(&user_id);
        }

        for server_id in conn.subscriptions() {
            if let Some(room) = self.rooms_by_server.get_mut(&server_id) {
                room.remove(&conn.conn_id());
                if room.is_empty() {
                    self.rooms_by_server.remove(&server_id);
                }
            }
        }
        true
    }

    /// Evict dead consumers, running the same presence transition a normal
    /// unregister would if one of them was its user's last connection.
    ///
    /// Iterative on purpose: emitting `away` fans out again and can expose
    /// further dead consumers.
    async fn drain_dead(&mut self, mut dead: Vec<Arc<Connection>>) {
        while let Some(conn) = dead.pop() {
            if !self.detach(&conn) {
                continue;
            }
            conn.close_queue();
            tracing::debug!(
                user_id = conn.user_id(),
                conn_id = %conn.conn_id(),
                "Evicted slow or closed consumer"
            );
            if self.no_live_connections(conn.user_id()) {
                let more = self
                    .mark_last_departed(conn.user_id(), conn.subscriptions())
                    .await;
                dead.extend(more);
            }
        }
    }

    /// The user's last connection is gone: emit `away` immediately and arm
    /// the delayed `offline` transition.
    async fn mark_last_departed(
        &mut self,
        user_id: u64,
        server_ids: Vec<u64>,
    ) -> Vec<Arc<Connection>> {
        let dead = self
            .emit_presence(user_id, PresenceStatus::Away, &server_ids)
            .await;

        self.timer_epoch += 1;
        let epoch = self.timer_epoch;
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(OFFLINE_GRACE).await;
            let _ = tx
                .send(HubCommand::FinalizeOffline {
                    user_id,
                    server_ids,
                    epoch,
                })
                .await;
        });
        if let Some((_, old)) = self.offline_timers.insert(user_id, (epoch, handle)) {
            old.abort();
        }

        dead
    }

    /// Broadcast a presence transition to each listed server room and
    /// persist it. The in-memory state stays authoritative on store errors.
    async fn emit_presence(
        &mut self,
        user_id: u64,
        status: PresenceStatus,
        server_ids: &[u64],
    ) -> Vec<Arc<Connection>> {
        let data = json!({
            "user_id": user_id.to_string(),
            "status": status.to_string(),
        });

        let mut dead = Vec::new();
        for &server_id in server_ids {
            let envelope = Envelope::server_event(server_id, EVENT_PRESENCE_UPDATE, data.clone());
            dead.extend(self.fanout(&envelope));
        }

        if let Err(e) = self.store.persist_presence(user_id, status).await {
            tracing::warn!(
                user_id,
                status = %status,
                error = ?e,
                "Failed to persist presence; routing continues from memory"
            );
        }

        dead
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc::Receiver;

    use crate::error::AppResult;
    use crate::models::UserProfile;
    use crate::websocket::connection::OUTBOUND_QUEUE_CAPACITY;
    use crate::websocket::events::EVENT_TYPING_START;

    /// In-memory store: records presence writes, everything else is empty.
    #[derive(Default)]
    struct RecordingStore {
        presence: Mutex<Vec<(u64, PresenceStatus)>>,
    }

    impl RecordingStore {
        fn presence_log(&self) -> Vec<(u64, PresenceStatus)> {
            self.presence.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RealtimeStore for RecordingStore {
        async fn load_membership(&self, _user_id: u64) -> AppResult<Vec<u64>> {
            Ok(vec![])
        }

        async fn persist_presence(&self, user_id: u64, status: PresenceStatus) -> AppResult<()> {
            self.presence.lock().unwrap().push((user_id, status));
            Ok(())
        }

        async fn parent_server(&self, _channel_id: u64) -> AppResult<Option<u64>> {
            Ok(None)
        }

        async fn user_profile(&self, _user_id: u64) -> AppResult<Option<UserProfile>> {
            Ok(None)
        }
    }

    fn connect(user_id: u64, servers: &[u64]) -> (Arc<Connection>, Receiver<Envelope>) {
        let (conn, rx) = Connection::new(user_id, servers.to_vec());
        (Arc::new(conn), rx)
    }

    /// Let spawned timer tasks run, then flush the hub mailbox. `Stats` is
    /// processed strictly after every previously queued command.
    async fn settle(hub: &Hub) {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        let _ = hub.stats().await;
    }

    fn drain(rx: &mut Receiver<Envelope>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(env) = rx.try_recv() {
            out.push(env);
        }
        out
    }

    fn presence_events(envelopes: &[Envelope]) -> Vec<(u64, String)> {
        envelopes
            .iter()
            .filter(|e| e.event == EVENT_PRESENCE_UPDATE)
            .map(|e| {
                (
                    e.server_id.unwrap(),
                    e.data["status"].as_str().unwrap().to_owned(),
                )
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Registration and presence
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn first_connection_broadcasts_online_to_every_room() {
        let store = Arc::new(RecordingStore::default());
        let hub = Hub::spawn(store.clone());

        let (watcher, mut watcher_rx) = connect(1, &[10, 20]);
        hub.register(watcher).await;
        settle(&hub).await;
        drain(&mut watcher_rx); // discard the watcher's own online

        let (conn, _rx) = connect(7, &[10, 20]);
        hub.register(conn).await;
        settle(&hub).await;

        let mut seen = presence_events(&drain(&mut watcher_rx));
        seen.sort();
        assert_eq!(
            seen,
            vec![(10, "online".into()), (20, "online".into())],
            "online must reach each of the user's server rooms exactly once"
        );
        assert!(store.presence_log().contains(&(7, PresenceStatus::Online)));
    }

    #[tokio::test(start_paused = true)]
    async fn second_device_does_not_reemit_online() {
        let store = Arc::new(RecordingStore::default());
        let hub = Hub::spawn(store.clone());

        let (watcher, mut watcher_rx) = connect(1, &[10]);
        hub.register(watcher).await;

        let (a, _a_rx) = connect(7, &[10]);
        let (b, _b_rx) = connect(7, &[10]);
        hub.register(a).await;
        settle(&hub).await;
        drain(&mut watcher_rx);

        hub.register(b).await;
        settle(&hub).await;

        assert!(
            presence_events(&drain(&mut watcher_rx)).is_empty(),
            "a second device must not re-announce online"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn closing_one_of_two_devices_changes_nothing() {
        let store = Arc::new(RecordingStore::default());
        let hub = Hub::spawn(store.clone());

        let (watcher, mut watcher_rx) = connect(1, &[10]);
        hub.register(watcher).await;

        let (a, _a_rx) = connect(7, &[10]);
        let (b, _b_rx) = connect(7, &[10]);
        hub.register(a.clone()).await;
        hub.register(b).await;
        settle(&hub).await;
        drain(&mut watcher_rx);

        hub.unregister(a).await;
        settle(&hub).await;

        assert!(
            presence_events(&drain(&mut watcher_rx)).is_empty(),
            "user still has a live connection; no away may be emitted"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn last_disconnect_emits_away_then_offline_after_grace() {
        let store = Arc::new(RecordingStore::default());
        let hub = Hub::spawn(store.clone());

        let (watcher, mut watcher_rx) = connect(1, &[10]);
        hub.register(watcher).await;

        let (conn, _rx) = connect(7, &[10]);
        hub.register(conn.clone()).await;
        settle(&hub).await;
        drain(&mut watcher_rx);

        hub.unregister(conn).await;
        settle(&hub).await;

        assert_eq!(
            presence_events(&drain(&mut watcher_rx)),
            vec![(10, "away".into())],
            "away must be immediate"
        );

        tokio::time::advance(OFFLINE_GRACE + Duration::from_secs(1)).await;
        settle(&hub).await;

        assert_eq!(
            presence_events(&drain(&mut watcher_rx)),
            vec![(10, "offline".into())]
        );
        assert_eq!(
            store.presence_log(),
            vec![
                (1, PresenceStatus::Online),
                (7, PresenceStatus::Online),
                (7, PresenceStatus::Away),
                (7, PresenceStatus::Offline),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_suppresses_offline() {
        let store = Arc::new(RecordingStore::default());
        let hub = Hub::spawn(store.clone());

        let (watcher, mut watcher_rx) = connect(1, &[10]);
        hub.register(watcher).await;

        let (first, _first_rx) = connect(7, &[10]);
        hub.register(first.clone()).await;
        settle(&hub).await;
        drain(&mut watcher_rx);

        hub.unregister(first).await;
        settle(&hub).await;
        assert_eq!(
            presence_events(&drain(&mut watcher_rx)),
            vec![(10, "away".into())]
        );

        tokio::time::advance(Duration::from_secs(10)).await;
        let (second, _second_rx) = connect(7, &[10]);
        hub.register(second).await;
        settle(&hub).await;
        assert_eq!(
            presence_events(&drain(&mut watcher_rx)),
            vec![(10, "online".into())]
        );

        // Well past the original deadline: the aborted timer must stay dead.
        tokio::time::advance(OFFLINE_GRACE * 3).await;
        settle(&hub).await;

        assert!(presence_events(&drain(&mut watcher_rx)).is_empty());
        assert!(
            !store
                .presence_log()
                .contains(&(7, PresenceStatus::Offline)),
            "no offline may be emitted for this episode"
        );
    }

    // ------------------------------------------------------------------------
    // Broadcast fan-out
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn broadcast_reaches_only_the_target_room() {
        let hub = Hub::spawn(Arc::new(RecordingStore::default()));

        let (member, mut member_rx) = connect(3, &[100]);
        let (same_room, mut same_room_rx) = connect(4, &[100]);
        let (other_room, mut other_room_rx) = connect(5, &[200]);
        hub.register(member).await;
        hub.register(same_room).await;
        hub.register(other_room).await;
        settle(&hub).await;
        drain(&mut member_rx);
        drain(&mut same_room_rx);
        drain(&mut other_room_rx);

        hub.broadcast(Envelope::server_event(
            100,
            EVENT_TYPING_START,
            json!({ "user_id": "3" }),
        ))
        .await;
        settle(&hub).await;

        let to_same_room = drain(&mut same_room_rx);
        assert_eq!(to_same_room.len(), 1);
        assert_eq!(to_same_room[0].event, EVENT_TYPING_START);

        // The sender's own connection receives the echo as well — documented
        // behaviour, kept stable for multi-device typing indicators.
        assert_eq!(drain(&mut member_rx).len(), 1);

        assert!(
            drain(&mut other_room_rx).is_empty(),
            "fan-out must be limited to the target room"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_to_unknown_room_is_a_noop() {
        let hub = Hub::spawn(Arc::new(RecordingStore::default()));
        hub.broadcast(Envelope::server_event(999, EVENT_TYPING_START, json!({})))
            .await;
        settle(&hub).await;
        assert_eq!(hub.stats().await.rooms, 0);
    }

    // ------------------------------------------------------------------------
    // Room membership updates
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn join_room_subscribes_all_live_connections() {
        let hub = Hub::spawn(Arc::new(RecordingStore::default()));

        let (a, mut a_rx) = connect(7, &[10]);
        let (b, mut b_rx) = connect(7, &[10]);
        hub.register(a.clone()).await;
        hub.register(b.clone()).await;

        hub.join_room(7, 30).await;
        settle(&hub).await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        hub.broadcast(Envelope::server_event(30, EVENT_TYPING_START, json!({})))
            .await;
        settle(&hub).await;

        assert_eq!(drain(&mut a_rx).len(), 1);
        assert_eq!(drain(&mut b_rx).len(), 1);
        assert!(a.is_subscribed(30));
        assert!(b.is_subscribed(30));
    }

    #[tokio::test(start_paused = true)]
    async fn leave_room_unsubscribes_and_garbage_collects() {
        let hub = Hub::spawn(Arc::new(RecordingStore::default()));

        let (a, mut a_rx) = connect(7, &[10, 30]);
        hub.register(a.clone()).await;
        settle(&hub).await;
        drain(&mut a_rx);

        hub.leave_room(7, 30).await;
        settle(&hub).await;

        hub.broadcast(Envelope::server_event(30, EVENT_TYPING_START, json!({})))
            .await;
        settle(&hub).await;

        assert!(drain(&mut a_rx).is_empty());
        assert!(!a.is_subscribed(30));
        assert_eq!(hub.stats().await.rooms, 1, "empty room must be collected");
    }

    // ------------------------------------------------------------------------
    // Slow-consumer eviction
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn slow_consumer_is_evicted_and_skipped_thereafter() {
        let store = Arc::new(RecordingStore::default());
        let hub = Hub::spawn(store.clone());

        // The receiver half is kept but never drained, so the queue fills.
        let (slow, _slow_rx) = connect(7, &[10]);
        hub.register(slow.clone()).await;
        settle(&hub).await;

        for _ in 0..OUTBOUND_QUEUE_CAPACITY {
            hub.broadcast(Envelope::server_event(10, EVENT_TYPING_START, json!({})))
                .await;
        }
        settle(&hub).await;

        // The overflowing broadcast trips the eviction.
        hub.broadcast(Envelope::server_event(10, EVENT_TYPING_START, json!({})))
            .await;
        settle(&hub).await;

        let stats = hub.stats().await;
        assert_eq!(stats.connections, 0, "evicted from the client index");
        assert_eq!(stats.rooms, 0, "evicted from the fan-out index");
        assert_eq!(
            slow.try_send(Envelope::server_event(10, EVENT_TYPING_START, json!({}))),
            SendOutcome::Closed,
            "the queue must be closed within one event-loop tick"
        );

        // Eviction of the user's last connection runs the normal departure
        // transition.
        assert!(store.presence_log().contains(&(7, PresenceStatus::Away)));
    }

    #[tokio::test(start_paused = true)]
    async fn unregister_after_eviction_is_idempotent() {
        let store = Arc::new(RecordingStore::default());
        let hub = Hub::spawn(store.clone());

        let (slow, _slow_rx) = connect(7, &[10]);
        hub.register(slow.clone()).await;
        for _ in 0..=OUTBOUND_QUEUE_CAPACITY {
            hub.broadcast(Envelope::server_event(10, EVENT_TYPING_START, json!({})))
                .await;
        }
        settle(&hub).await;

        // The read pump notices the closed socket and unregisters anyway.
        hub.unregister(slow).await;
        settle(&hub).await;

        let aways = store
            .presence_log()
            .iter()
            .filter(|(_, s)| *s == PresenceStatus::Away)
            .count();
        assert_eq!(aways, 1, "the departure transition must run exactly once");
    }

    // ------------------------------------------------------------------------
    // Presence ordering (monotonicity per episode)
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn presence_episode_is_monotonic() {
        let store = Arc::new(RecordingStore::default());
        let hub = Hub::spawn(store.clone());

        for _ in 0..3 {
            let (conn, _rx) = connect(7, &[10]);
            hub.register(conn.clone()).await;
            settle(&hub).await;
            hub.unregister(conn).await;
            settle(&hub).await;
            tokio::time::advance(OFFLINE_GRACE + Duration::from_secs(1)).await;
            settle(&hub).await;
        }

        let log: Vec<PresenceStatus> = store
            .presence_log()
            .into_iter()
            .map(|(_, status)| status)
            .collect();
        assert_eq!(
            log,
            vec![
                PresenceStatus::Online,
                PresenceStatus::Away,
                PresenceStatus::Offline,
            ]
            .repeat(3),
            "each episode must be exactly online → away → offline"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_offline_timer_cannot_fire_twice() {
        let store = Arc::new(RecordingStore::default());
        let hub = Hub::spawn(store.clone());

        // Depart, come back just before the deadline, depart again.
        let (first, _rx1) = connect(7, &[10]);
        hub.register(first.clone()).await;
        hub.unregister(first).await;
        settle(&hub).await;

        tokio::time::advance(OFFLINE_GRACE - Duration::from_secs(1)).await;
        let (second, _rx2) = connect(7, &[10]);
        hub.register(second.clone()).await;
        hub.unregister(second).await;
        settle(&hub).await;

        tokio::time::advance(OFFLINE_GRACE * 2).await;
        settle(&hub).await;

        let offlines = store
            .presence_log()
            .iter()
            .filter(|(_, s)| *s == PresenceStatus::Offline)
            .count();
        assert_eq!(offlines, 1, "one offline per absence episode");
    }
}
