//! The gateway: one WebSocket per client carrying chat events, presence,
//! and WebRTC signaling over a single envelope format.
//!
//! The [`Hub`] is the single-writer serialisation point for all presence and
//! routing state; [`Connection`] shields it from slow clients with a bounded
//! queue and non-blocking sends; the router classifies inbound frames between
//! the hub and the SFU.

pub mod connection;
pub mod events;
pub mod handler;
pub mod hub;
pub mod router;

pub use connection::{Connection, SendOutcome, OUTBOUND_QUEUE_CAPACITY};
pub use events::Envelope;
pub use handler::websocket_handler;
pub use hub::{Hub, HubStats, OFFLINE_GRACE};
pub use router::route_message;
