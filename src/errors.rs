//! Error taxonomy shared by the consumer, the dialer and the retry engine.
//!
//! Errors fall into four groups:
//! - non-retryable: configuration and authorization failures that end a stream;
//! - retryable: anything wrapped in [`ConsumerError::Retryable`];
//! - the [`ConsumerError::MaxRetriesReached`] sentinel;
//! - causes (dial, websocket, timeout, ...) which the retry engine wraps.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Boxed error returned by pluggable capabilities such as token refreshers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced while establishing, reading or tearing down streams.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Endpoint plus path did not parse as a URL.
    #[error("invalid url '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// Endpoint scheme is neither `ws` nor `wss`.
    #[error("Invalid scheme '{0}'")]
    InvalidScheme(String),

    /// Token could not be converted to a valid HTTP header value.
    #[error("invalid authorization header: {0}")]
    InvalidAuthHeader(#[from] InvalidHeaderValue),

    /// Server rejected the credentials.
    #[error("Unauthorized error: You are not authorized. {body}")]
    Unauthorized { body: String },

    /// Upgrade request was answered with an unexpected HTTP status.
    #[error("websocket upgrade failed with http {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    /// Transport-level failure while dialing the endpoint.
    #[error(
        "Error dialing traffic controller server: {source}.\nPlease ask your Cloud Foundry Operator to check the platform configuration (traffic controller endpoint is {endpoint})."
    )]
    Dial {
        endpoint: String,
        #[source]
        source: WsError,
    },

    /// Proxy tunnel could not be established.
    #[error("proxy error: {0}")]
    Proxy(String),

    /// Token refresher failed to produce a token. Ends the stream.
    #[error("failed to refresh auth token: {0}")]
    TokenRefresh(#[source] BoxError),

    /// Websocket read or close failure on an established connection.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// No frame arrived within the configured idle timeout.
    #[error("i/o timeout: no message received for {0:?}")]
    IdleTimeout(Duration),

    /// Server ended the stream.
    #[error("remote server terminated connection unexpectedly")]
    LostConnection,

    /// Transient failure after which the stream reconnects.
    #[error("{0}")]
    Retryable(Box<ConsumerError>),

    /// Reconnect budget for the current failure sequence is exhausted.
    #[error("maximum number of WS retries reached")]
    MaxRetriesReached,

    /// `Consumer::close` was called with no registered connections.
    #[error("connection does not exist")]
    NoConnection,
}

impl ConsumerError {
    /// Wraps an error as retryable. Already-retryable errors are returned unchanged.
    pub fn retryable(error: ConsumerError) -> Self {
        match error {
            ConsumerError::Retryable(_) => error,
            other => ConsumerError::Retryable(Box::new(other)),
        }
    }

    /// Returns `true` for errors published before a reconnect attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConsumerError::Retryable(_))
    }

    /// Returns `true` for errors that terminate a stream without retrying.
    pub fn is_non_retryable(&self) -> bool {
        matches!(
            self,
            ConsumerError::InvalidUrl { .. }
                | ConsumerError::InvalidScheme(_)
                | ConsumerError::InvalidAuthHeader(_)
                | ConsumerError::Unauthorized { .. }
                | ConsumerError::TokenRefresh(_)
        )
    }

    /// Returns `true` for the exhausted-budget sentinel.
    pub fn is_max_retries(&self) -> bool {
        matches!(self, ConsumerError::MaxRetriesReached)
    }

    /// Returns the wrapped cause of a retryable error, or `self`.
    pub fn cause(&self) -> &ConsumerError {
        match self {
            ConsumerError::Retryable(inner) => &**inner,
            other => other,
        }
    }
}
