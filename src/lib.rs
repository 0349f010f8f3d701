//! Relaycast - real-time WebSocket relay
//!
//! Every WebSocket connection becomes a channel named after the client's
//! address. Other connections subscribe to a channel over HTTP, and every
//! message the channel's owner sends is fanned out to its subscribers.
//!
//! ## Architecture
//!
//! ```text
//! peer ──WS──▶ read pump ──▶ own queue ──▶ write pump ──WS──▶ peer
//!                                             │
//!                                             └──▶ subscriber queues ──▶ their write pumps
//!
//! register / unregister / subscribe / list ──▶ Hub task (owns the table)
//! ```
//!
//! ## Environment Variables
//!
//! - `RELAYCAST_ADDR` - listen address (default `0.0.0.0:8080`)
//! - `RELAYCAST_HOME_PAGE` - page served at `/` (default `home.html`)
//! - `RELAYCAST_QUEUE_CAPACITY` - outbound queue capacity per connection
//! - `RELAYCAST_MAX_MESSAGE_SIZE` - largest accepted inbound frame
//! - `RELAYCAST_PONG_WAIT_SECS` - idle-read deadline
//! - `RELAYCAST_WRITE_WAIT_SECS` - per-write deadline

pub mod config;
pub mod connection;
pub mod envelope;
pub mod hub;
pub mod identity;
pub mod server;
pub mod transport;

pub use config::{Config, ConfigError};
pub use connection::{Connection, EnqueueError, Outbound, RelayReport, Timing};
pub use envelope::{Envelope, EnvelopeError, EnvelopeType};
pub use hub::{Hub, HubError, HubHandle};
pub use server::{ApiError, AppState};
pub use transport::{Frame, FrameSink, FrameSource, TransportError};
