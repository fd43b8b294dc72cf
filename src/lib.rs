//! Reconnecting websocket consumer for traffic controller log and metric
//! streams.
//!
//! The crate is organized by concern:
//! - `stream`: consumer facade, dialing, read loop and envelope types.
//! - `retry`: backoff engine and timeout helpers shared by every stream.
//! - `errors`: error taxonomy and retry classification.
//! - `auth`: token refresh hook used on `401` answers.
//! - `debug`: request/response dump sink for troubleshooting.

/// Token refresh trait.
pub mod auth;
/// Handshake dump printers.
pub mod debug;
/// Consumer error type and classification helpers.
pub mod errors;
/// Retry engine and timeout helpers.
pub mod retry;
/// Streaming consumer, transport and protocol types.
pub mod stream;

pub use auth::TokenRefresher;
pub use debug::{DebugPrinter, NullDebugPrinter, TracingDebugPrinter};
pub use errors::{BoxError, ConsumerError};
pub use retry::ConnectCallback;
pub use stream::{
    proxy_from_environment, Consumer, ConsumerDefaults, ConsumerOptions, Envelope, EnvelopeFilter,
    FirehoseOptions, LogMessage, ProxyResolver, StreamHandle,
};
