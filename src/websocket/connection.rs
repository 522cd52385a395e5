use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::mpsc;
use uuid::Uuid;

use super::events::Envelope;

/// Outbound queue capacity per connection. The hub never blocks on a send:
/// a full queue marks the consumer dead and the connection is evicted.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Result of a non-blocking push onto a connection's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// Queue full — the consumer is presumed dead.
    Full,
    /// Queue already closed by an earlier eviction or disconnect.
    Closed,
}

/// One live gateway socket for one user.
///
/// The hub hands this out as the sole send capability: the write pump owns
/// the receiving half of the queue, and everything else (hub fan-out, SFU
/// signaling) goes through [`Connection::try_send`]. The hub's event loop is
/// the only writer of `subscribed`; the router and pumps read it through the
/// same short-lived mutex.
pub struct Connection {
    user_id: u64,
    conn_id: Uuid,
    subscribed: Mutex<HashSet<u64>>,
    sender: Mutex<Option<mpsc::Sender<Envelope>>>,
    /// channel → parent server, filled lazily by the signaling router so
    /// repeat WebRTC frames skip the persistence lookup.
    channel_servers: Mutex<HashMap<u64, u64>>,
}

impl Connection {
    /// Create a connection subscribed to `server_ids`, returning the receiver
    /// half for the write pump.
    pub fn new(user_id: u64, server_ids: Vec<u64>) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let conn = Connection {
            user_id,
            conn_id: Uuid::new_v4(),
            subscribed: Mutex::new(server_ids.into_iter().collect()),
            sender: Mutex::new(Some(tx)),
            channel_servers: Mutex::new(HashMap::new()),
        };
        (conn, rx)
    }

    pub fn user_id(&self) -> u64 {
        self.user_id
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// Non-blocking send. Never waits; the hub treats [`SendOutcome::Full`]
    /// as a dead consumer.
    pub fn try_send(&self, envelope: Envelope) -> SendOutcome {
        let guard = self.sender.lock().expect("connection sender lock poisoned");
        match guard.as_ref() {
            Some(tx) => match tx.try_send(envelope) {
                Ok(()) => SendOutcome::Delivered,
                Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Full,
                Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
            },
            None => SendOutcome::Closed,
        }
    }

    /// Close the outbound queue. Dropping the last sender makes the write
    /// pump's `recv()` return `None`, which sends a Close frame and exits;
    /// the read pump then unregisters.
    pub fn close_queue(&self) {
        self.sender
            .lock()
            .expect("connection sender lock poisoned")
            .take();
    }

    pub fn is_subscribed(&self, server_id: u64) -> bool {
        self.subscribed
            .lock()
            .expect("subscription lock poisoned")
            .contains(&server_id)
    }

    /// Snapshot of the subscription set, in no particular order.
    pub fn subscriptions(&self) -> Vec<u64> {
        self.subscribed
            .lock()
            .expect("subscription lock poisoned")
            .iter()
            .copied()
            .collect()
    }

    /// Idempotent; called only from the hub loop.
    pub(crate) fn subscribe(&self, server_id: u64) {
        self.subscribed
            .lock()
            .expect("subscription lock poisoned")
            .insert(server_id);
    }

    pub(crate) fn unsubscribe(&self, server_id: u64) {
        self.subscribed
            .lock()
            .expect("subscription lock poisoned")
            .remove(&server_id);
    }

    pub fn cached_parent_server(&self, channel_id: u64) -> Option<u64> {
        self.channel_servers
            .lock()
            .expect("channel cache lock poisoned")
            .get(&channel_id)
            .copied()
    }

    pub fn cache_parent_server(&self, channel_id: u64, server_id: u64) {
        self.channel_servers
            .lock()
            .expect("channel cache lock poisoned")
            .insert(channel_id, server_id);
    }
}
