//! Realtime socket.
//!
//! - [`ConnectionManager`]: owns one WebSocket, reconnects with doubling backoff and publishes
//!   inbound frames on an [`EventBus`](crate::bus::EventBus)
//! - [`Envelope`]: the `{ "type", "data" }` wire shape
//! - [`Config`] / [`ReconnectConfig`]: timeouts, heartbeat and reconnect policy
//!
//! Connection failures never reach callers directly. They are retried up to
//! [`ReconnectConfig::max_attempts`] times, after which the state becomes
//! [`ConnectionState::ReconnectExhausted`] and a single [`RECONNECT_FAILED`] event is published.

pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;

pub use config::{Config, ReconnectBackoff, ReconnectConfig};
pub use connection::{ConnectionManager, ConnectionState, RECONNECT_FAILED};
pub use envelope::Envelope;
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
