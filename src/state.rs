use std::sync::Arc;

use sqlx::AnyPool;

use crate::sfu::RoomRegistry;
use crate::store::RealtimeStore;
use crate::websocket::Hub;

/// Shared application state passed to all handlers and extractors.
///
/// `Hub` is a cheap handle around the event loop's mailbox, and the registry
/// and store are behind `Arc`, so cloning `AppState` per request is
/// inexpensive.
#[derive(Clone)]
pub struct AppState {
    pub pool: AnyPool,
    pub jwt_secret: Arc<str>,
    /// Presence and fan-out hub. All broadcasts funnel through here.
    pub hub: Hub,
    /// Voice SFU room registry.
    pub sfu: Arc<RoomRegistry>,
    /// Narrow persistence interface used by the realtime plane.
    pub store: Arc<dyn RealtimeStore>,
}
