//! Reconnecting, channel-multiplexed socket client.
//!
//! The surface splits by responsibility:
//! - `codec`: stateless encode/decode of the array-framed wire protocol.
//! - `transport`: connection ownership, reconnect/backoff, heartbeat.
//! - `client`: the multiplexer owning the subscription, pending-reply, and
//!   send-buffer tables behind the public [`client::Socket`] handle.

pub mod client;
pub mod codec;
pub mod transport;
