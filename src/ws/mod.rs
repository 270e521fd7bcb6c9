//! WebSocket fan-out: per-connection subscriptions, bounded outbound
//! queues, O(subscribers-for-that-market) dispatch.

mod connection;
mod hub;

pub use connection::{handle_socket, ClientFrame, ServerFrame};
pub use hub::{ConnId, Hub};
