//! Consumer facade and stream constructors.
//!
//! Every constructor registers a connection handle and spawns one background
//! worker that owns the socket. The worker delivers items on a bounded output
//! channel and errors on a bounded error channel, and drops both senders when
//! it finishes; a closed pair of channels means the stream has ended for good.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustls::ClientConfig;
use secrecy::SecretString;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::auth::TokenRefresher;
use crate::debug::DebugPrinter;
use crate::errors::ConsumerError;
use crate::retry::{
    retry_action, Attempt, ConnectCallback, ConnectHook, RetryTunables, DEFAULT_MAX_RETRY_COUNT,
    DEFAULT_MAX_RETRY_DELAY, DEFAULT_MIN_RETRY_DELAY,
};
use crate::stream::connection::Connection;
use crate::stream::dial::{proxy_from_environment, Dialer, ProxyResolver};
use crate::stream::envelope::{Envelope, LogMessage};
use crate::stream::firehose::{EnvelopeFilter, FirehoseOptions};
use crate::stream::listen::listen_for_messages;

/// Output items in flight per stream.
const OUTPUT_CAPACITY: usize = 1;
/// Errors that may wait undrained before the worker blocks.
const ERROR_CAPACITY: usize = 1;

/// Default tunables applied by [`Consumer::new`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConsumerDefaults;

impl ConsumerDefaults {
    /// First reconnect delay.
    pub const MIN_RETRY_DELAY: Duration = DEFAULT_MIN_RETRY_DELAY;
    /// Ceiling for the doubling reconnect delay.
    pub const MAX_RETRY_DELAY: Duration = DEFAULT_MAX_RETRY_DELAY;
    /// Reconnect attempts allowed per failure sequence.
    pub const MAX_RETRY_COUNT: u64 = DEFAULT_MAX_RETRY_COUNT;
    /// Idle timeout is off unless configured.
    pub const IDLE_TIMEOUT: Option<Duration> = None;
}

/// Tunables that can be loaded from configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsumerOptions {
    /// Delay before the first reconnect after a failure.
    pub min_retry_delay: Duration,
    /// Upper bound for the reconnect delay.
    pub max_retry_delay: Duration,
    /// Reconnects allowed before the stream gives up.
    pub max_retry_count: u64,
    /// Per-read idle timeout; `None` waits forever.
    pub idle_timeout: Option<Duration>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            min_retry_delay: ConsumerDefaults::MIN_RETRY_DELAY,
            max_retry_delay: ConsumerDefaults::MAX_RETRY_DELAY,
            max_retry_count: ConsumerDefaults::MAX_RETRY_COUNT,
            idle_timeout: ConsumerDefaults::IDLE_TIMEOUT,
        }
    }
}

/// Receivers of one stream.
///
/// Both channels close when the worker ends. Reconnecting streams must keep
/// draining errors: the worker waits for room on the error channel before
/// every reconnect.
#[derive(Debug)]
pub struct StreamHandle<T> {
    output: mpsc::Receiver<T>,
    errors: mpsc::Receiver<ConsumerError>,
}

impl<T> StreamHandle<T> {
    /// Receives the next item, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<T> {
        self.output.recv().await
    }

    /// Receives the next error, or `None` once the stream has ended.
    pub async fn recv_error(&mut self) -> Option<ConsumerError> {
        self.errors.recv().await
    }

    /// Splits into output and error receivers.
    pub fn split(self) -> (mpsc::Receiver<T>, mpsc::Receiver<ConsumerError>) {
        (self.output, self.errors)
    }
}

/// Client for the traffic controller streaming endpoints.
///
/// Cloning is cheap; clones share configuration and open connections.
#[derive(Clone)]
pub struct Consumer {
    shared: Arc<ConsumerShared>,
}

struct ConsumerShared {
    dialer: Dialer,
    tunables: Arc<RetryTunables>,
    idle_timeout_nanos: AtomicU64,
    on_connect: ConnectHook,
    conns: Mutex<VecDeque<Arc<Connection>>>,
}

impl Consumer {
    /// Creates a consumer for `endpoint` (a `ws://` or `wss://` URL).
    ///
    /// `tls` overrides the default webpki roots for `wss`. Without a `proxy`
    /// resolver, [`proxy_from_environment`] is used.
    pub fn new(
        endpoint: impl Into<String>,
        tls: Option<Arc<ClientConfig>>,
        proxy: Option<ProxyResolver>,
    ) -> Self {
        let endpoint = endpoint.into().trim_end().to_string();
        let proxy = proxy.unwrap_or_else(|| Arc::new(proxy_from_environment));

        Self {
            shared: Arc::new(ConsumerShared {
                dialer: Dialer::new(endpoint, tls, proxy),
                tunables: Arc::new(RetryTunables::default()),
                idle_timeout_nanos: AtomicU64::new(0),
                on_connect: ConnectHook::new(),
                conns: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Applies loaded options to the tunables.
    pub fn with_options(self, options: &ConsumerOptions) -> Self {
        self.set_min_retry_delay(options.min_retry_delay);
        self.set_max_retry_delay(options.max_retry_delay);
        self.set_max_retry_count(options.max_retry_count);
        self.set_idle_timeout(options.idle_timeout.unwrap_or(Duration::ZERO));
        self
    }

    /// Endpoint every stream path is appended to.
    pub fn endpoint(&self) -> &str {
        self.shared.dialer.endpoint()
    }

    /// Sets the first reconnect delay; used from the next backoff on.
    pub fn set_min_retry_delay(&self, delay: Duration) {
        self.shared.tunables.set_min_delay(delay);
    }

    /// Sets the ceiling for the doubling reconnect delay.
    pub fn set_max_retry_delay(&self, delay: Duration) {
        self.shared.tunables.set_max_delay(delay);
    }

    /// Sets how many reconnects a failure sequence may use.
    pub fn set_max_retry_count(&self, count: u64) {
        self.shared.tunables.set_max_count(count);
    }

    /// Sets the per-read idle timeout. `Duration::ZERO` disables it.
    pub fn set_idle_timeout(&self, timeout: Duration) {
        let nanos = timeout.as_nanos().min(u64::MAX as u128) as u64;
        self.shared.idle_timeout_nanos.store(nanos, Ordering::Release);
    }

    /// Installs the sink for handshake dumps.
    pub fn set_debug_printer(&self, printer: Arc<dyn DebugPrinter>) {
        self.shared.dialer.set_debug_printer(printer);
    }

    /// Sets the callback fired after every successful dial.
    ///
    /// Reconnecting streams chain their own backoff reset in front of it for
    /// as long as they run.
    pub fn set_on_connect_callback(&self, callback: Option<ConnectCallback>) {
        self.shared.on_connect.replace(callback);
    }

    /// Installs a token refresher and enables refresh on `401`.
    pub fn refresh_token_from(&self, refresher: Arc<dyn TokenRefresher>) {
        self.shared.dialer.set_token_refresher(refresher);
    }

    /// Streams log messages for an app, reconnecting on failure.
    ///
    /// Non-log envelopes are dropped. Must be called within a Tokio runtime.
    pub fn tailing_logs(&self, app_guid: &str, auth_token: SecretString) -> StreamHandle<LogMessage> {
        self.spawn_stream(app_stream_path(app_guid), auth_token, true, Envelope::into_log_message)
    }

    /// Like [`Consumer::tailing_logs`] with a single connection attempt.
    pub fn tailing_logs_without_reconnect(
        &self,
        app_guid: &str,
        auth_token: SecretString,
    ) -> StreamHandle<LogMessage> {
        self.spawn_stream(app_stream_path(app_guid), auth_token, false, Envelope::into_log_message)
    }

    /// Streams every envelope for an app, reconnecting on failure.
    pub fn stream(&self, app_guid: &str, auth_token: SecretString) -> StreamHandle<Envelope> {
        self.spawn_stream(app_stream_path(app_guid), auth_token, true, Some)
    }

    /// Like [`Consumer::stream`] with a single connection attempt.
    pub fn stream_without_reconnect(
        &self,
        app_guid: &str,
        auth_token: SecretString,
    ) -> StreamHandle<Envelope> {
        self.spawn_stream(app_stream_path(app_guid), auth_token, false, Some)
    }

    /// Subscribes to the unfiltered firehose, reconnecting on failure.
    pub fn firehose(
        &self,
        subscription_id: &str,
        auth_token: SecretString,
    ) -> StreamHandle<Envelope> {
        self.firehose_with_options(FirehoseOptions::new(subscription_id, auth_token))
    }

    /// Like [`Consumer::firehose`] with a single connection attempt.
    pub fn firehose_without_reconnect(
        &self,
        subscription_id: &str,
        auth_token: SecretString,
    ) -> StreamHandle<Envelope> {
        self.firehose_with_options(
            FirehoseOptions::new(subscription_id, auth_token).with_retry(false),
        )
    }

    /// Subscribes to the subset of the firehose selected by `filter`.
    pub fn filtered_firehose(
        &self,
        subscription_id: &str,
        auth_token: SecretString,
        filter: EnvelopeFilter,
    ) -> StreamHandle<Envelope> {
        self.firehose_with_options(
            FirehoseOptions::new(subscription_id, auth_token).with_filter(filter),
        )
    }

    /// Subscribes to the firehose with explicit options.
    pub fn firehose_with_options(&self, options: FirehoseOptions) -> StreamHandle<Envelope> {
        let path = options.path();
        self.spawn_stream(path, options.auth_token, options.retry, Some)
    }

    /// Closes every open connection in the order they were opened.
    ///
    /// Stops at the first close error and returns it; that connection and
    /// any after it stay registered. Returns [`ConsumerError::NoConnection`]
    /// when nothing is registered.
    pub async fn close(&self) -> Result<(), ConsumerError> {
        if self.shared.lock_conns().is_empty() {
            return Err(ConsumerError::NoConnection);
        }

        loop {
            let Some(conn) = self.shared.lock_conns().front().cloned() else {
                return Ok(());
            };
            conn.close().await?;

            let mut conns = self.shared.lock_conns();
            if conns.front().is_some_and(|front| Arc::ptr_eq(front, &conn)) {
                conns.pop_front();
            }
        }
    }

    fn new_conn(&self) -> Arc<Connection> {
        let conn = Arc::new(Connection::new());
        self.shared.lock_conns().push_back(Arc::clone(&conn));
        conn
    }

    fn spawn_stream<T, R>(
        &self,
        path: String,
        auth_token: SecretString,
        reconnect: bool,
        route: R,
    ) -> StreamHandle<T>
    where
        T: Send + 'static,
        R: Fn(Envelope) -> Option<T> + Send + Sync + 'static,
    {
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_CAPACITY);
        let conn = self.new_conn();
        let shared = Arc::clone(&self.shared);

        tokio::spawn(async move {
            let worker = StreamWorker {
                shared: &shared,
                conn: &conn,
                path: &path,
                auth_token: &auth_token,
                hook: ConnectHook::delegating(shared.on_connect.clone()),
            };

            if reconnect {
                let shutdown = conn.shutdown_token();
                retry_action(&shared.tunables, &worker.hook, &errors_tx, &shutdown, || {
                    worker.connect_and_listen(&route, &output_tx)
                })
                .await;
            } else if let Some(error) = worker.connect_and_listen(&route, &output_tx).await.error {
                let _ = errors_tx.send(error).await;
            }
            debug!(event = "stream_worker_finished", path = %path);
        });

        StreamHandle {
            output: output_rx,
            errors: errors_rx,
        }
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("endpoint", &self.endpoint())
            .field("tunables", &self.shared.tunables)
            .field("open_connections", &self.shared.lock_conns().len())
            .finish()
    }
}

impl ConsumerShared {
    fn lock_conns(&self) -> MutexGuard<'_, VecDeque<Arc<Connection>>> {
        self.conns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn idle_timeout(&self) -> Option<Duration> {
        match self.idle_timeout_nanos.load(Ordering::Acquire) {
            0 => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }
}

/// Per-stream state borrowed by the worker's connect-and-listen action.
struct StreamWorker<'a> {
    shared: &'a ConsumerShared,
    conn: &'a Connection,
    path: &'a str,
    auth_token: &'a SecretString,
    hook: ConnectHook,
}

impl StreamWorker<'_> {
    async fn connect_and_listen<T, R>(&self, route: &R, output: &mpsc::Sender<T>) -> Attempt
    where
        R: Fn(Envelope) -> Option<T>,
    {
        if self.conn.is_closed() {
            return Attempt::done();
        }

        let shutdown = self.conn.shutdown_token();
        let dialed = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Attempt::done(),
            dialed = self
                .shared
                .dialer
                .establish_websocket_connection(self.path, self.auth_token, &self.hook) => dialed,
        };

        let socket = match dialed {
            Ok(socket) => socket,
            Err(error) => {
                return Attempt {
                    error: Some(error),
                    done: self.conn.is_closed(),
                }
            }
        };

        let Some((reader, cancel)) = self.conn.set_transport(socket) else {
            return Attempt::done();
        };

        let result = listen_for_messages(
            self.conn,
            reader,
            &cancel,
            self.shared.idle_timeout(),
            route,
            output,
        )
        .await;

        let done = self.conn.is_closed();
        if !done {
            self.conn.release_transport();
        }
        Attempt {
            error: result.err(),
            done,
        }
    }
}

fn app_stream_path(app_guid: &str) -> String {
    format!("/apps/{app_guid}/stream")
}
