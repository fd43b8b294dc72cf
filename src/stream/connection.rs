//! Connection handle shared between a stream worker and `Consumer::close`.
//!
//! The worker installs each freshly dialed socket and reads from it; the
//! caller may close the handle from any task at any time. Once closed, a
//! handle never accepts another socket.

use std::sync::{Mutex, MutexGuard, PoisonError};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::ConsumerError;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsSink = SplitSink<WsStream, Message>;
pub(crate) type WsReader = SplitStream<WsStream>;

struct Transport {
    sink: WsSink,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ConnectionState {
    closed: bool,
    transport: Option<Transport>,
}

/// One streaming session, possibly spanning several sockets over reconnects.
#[derive(Default)]
pub(crate) struct Connection {
    state: Mutex<ConnectionState>,
    shutdown: CancellationToken,
}

impl Connection {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs a freshly dialed socket, replacing the previous one.
    ///
    /// Returns the read half together with a token that is cancelled when the
    /// handle is closed. Returns `None` and drops `socket` if the handle is
    /// already closed.
    pub(crate) fn set_transport(&self, socket: WsStream) -> Option<(WsReader, CancellationToken)> {
        let mut state = self.lock();
        if state.closed {
            debug!(event = "transport_rejected_after_close");
            return None;
        }

        let (sink, reader) = socket.split();
        let cancel = CancellationToken::new();
        if let Some(previous) = state.transport.replace(Transport {
            sink,
            cancel: cancel.clone(),
        }) {
            previous.cancel.cancel();
        }
        Some((reader, cancel))
    }

    /// Drops the current socket without marking the handle closed.
    pub(crate) fn release_transport(&self) {
        let released = self.lock().transport.take();
        if let Some(transport) = released {
            transport.cancel.cancel();
        }
    }

    /// Marks the handle closed and shuts down the current socket, if any.
    ///
    /// A normal-closure frame is sent on a best-effort basis before the sink
    /// is closed. Only the sink close result is reported; a socket the peer
    /// already closed is not an error.
    pub(crate) async fn close(&self) -> Result<(), ConsumerError> {
        let transport = {
            let mut state = self.lock();
            state.closed = true;
            state.transport.take()
        };
        self.shutdown.cancel();

        let Some(Transport { mut sink, cancel }) = transport else {
            return Ok(());
        };
        cancel.cancel();

        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })))
            .await;

        match sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(err) => Err(ConsumerError::WebSocket(err)),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Token cancelled once the handle is closed. Outlives every socket.
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    #[cfg(test)]
    pub(crate) fn has_transport(&self) -> bool {
        self.lock().transport.is_some()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Connection")
            .field("closed", &state.closed)
            .field("connected", &state.transport.is_some())
            .finish()
    }
}
