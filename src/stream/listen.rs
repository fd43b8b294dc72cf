//! Read loop for an established stream socket.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::ConsumerError;
use crate::retry::with_timeout;
use crate::stream::connection::{Connection, WsReader};
use crate::stream::envelope::Envelope;

/// Reads envelopes until the socket fails or the handle is closed.
///
/// Returns `Ok(())` when `connection` was closed by its owner, even if the
/// close surfaced as a read error. An idle timeout yields a retryable error.
/// Frames that do not decode are skipped. Each decoded envelope goes through
/// `route`; whatever it keeps is sent to `output`, waiting for room.
pub(crate) async fn listen_for_messages<T, R>(
    connection: &Connection,
    mut reader: WsReader,
    cancel: &CancellationToken,
    idle_timeout: Option<Duration>,
    route: &R,
    output: &mpsc::Sender<T>,
) -> Result<(), ConsumerError>
where
    R: Fn(Envelope) -> Option<T>,
{
    if connection.is_closed() {
        return Ok(());
    }

    loop {
        let read = async {
            tokio::select! {
                _ = cancel.cancelled() => None,
                next = reader.next() => Some(next),
            }
        };
        let next = match idle_timeout {
            Some(timeout) => match with_timeout(timeout, read).await {
                Ok(next) => next,
                Err(_) if connection.is_closed() => return Ok(()),
                Err(_) => {
                    return Err(ConsumerError::retryable(ConsumerError::IdleTimeout(
                        timeout,
                    )))
                }
            },
            None => read.await,
        };

        if connection.is_closed() {
            return Ok(());
        }

        let message = match next {
            // Cancelled because a newer socket replaced this one.
            None => return Ok(()),
            Some(None) => return Err(ConsumerError::LostConnection),
            Some(Some(Err(err))) => return Err(ConsumerError::WebSocket(err)),
            Some(Some(Ok(message))) => message,
        };

        let frame = match message {
            Message::Binary(frame) => frame,
            Message::Close(frame) => {
                debug!(event = "server_closed_stream", frame = ?frame);
                return Err(ConsumerError::LostConnection);
            }
            Message::Text(_) => {
                debug!(event = "text_frame_skipped");
                continue;
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        let envelope = match Envelope::from_frame(&frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(event = "envelope_decode_failed", error = %err, len = frame.len());
                continue;
            }
        };

        if let Some(item) = route(envelope) {
            if output.send(item).await.is_err() {
                debug!(event = "output_receiver_dropped");
                let _ = connection.close().await;
                return Ok(());
            }
        }
    }
}
