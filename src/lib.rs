//! Client library for a channel-multiplexed, message-oriented protocol
//! carried over a single websocket connection.
//!
//! The crate is organized by concern:
//! - `socket`: the reconnecting client, split into wire codec, transport
//!   worker, and the multiplexer with its `connect`/`disconnect`/`on`/`off`/
//!   `push` API.
//! - `backoff`: reconnect pacing shared by the transport.

/// Reconnect pacing policies.
pub mod backoff;
/// Wire codec, transport, and the multiplexed socket client.
pub mod socket;
