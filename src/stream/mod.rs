//! Realtime stream modules.
//!
//! - `consumer`: public facade, stream constructors and shutdown.
//! - `dial`: websocket handshake, token refresh and proxy tunnelling.
//! - `connection`: per-stream handle shared between worker and `close`.
//! - `listen`: read loop that decodes frames and feeds output channels.
//! - `envelope`: protobuf envelope and payload messages.
//! - `firehose`: firehose subscription options.

/// Connection handle for one stream.
mod connection;
/// Consumer facade and stream handles.
pub mod consumer;
/// Websocket dialing and proxy resolution.
pub mod dial;
/// Envelope wire types.
pub mod envelope;
/// Firehose subscription options.
pub mod firehose;
mod listen;

pub use consumer::{Consumer, ConsumerDefaults, ConsumerOptions, StreamHandle};
pub use dial::{proxy_from_environment, ProxyResolver};
pub use envelope::{Envelope, EventType, LogMessage};
pub use firehose::{EnvelopeFilter, FirehoseOptions};
