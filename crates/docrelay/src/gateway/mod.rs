//! Realtime fan-out: persistent client connections, tracking subscriptions,
//! rooms and liveness.

pub mod hub;
pub mod messages;
pub mod socket;


pub use hub::{ClientDetail, ClientId, Gateway, GatewayStatistics, HeartbeatReport};
pub use messages::{ClientMessage, GatewayCounters, MessageError, Outbound, ServerMessage};
pub use socket::gateway_router;
