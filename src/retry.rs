//! Retry and timeout utilities.
//!
//! The retry engine here is transport-agnostic: it drives any
//! "connect-and-listen" action, publishing errors between attempts and backing
//! off exponentially. Tunables are atomics so they can be adjusted while many
//! streams are retrying.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::ConsumerError;

/// Default delay before the first reconnect attempt.
pub const DEFAULT_MIN_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Default upper bound for reconnect delay growth.
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(60);
/// Default reconnect budget per failure sequence.
pub const DEFAULT_MAX_RETRY_COUNT: u64 = 1000;

/// Retry settings shared by every stream of a consumer.
///
/// Setters take effect on the next backoff computation; a sleep that is
/// already in progress is not shortened or extended.
#[derive(Debug)]
pub struct RetryTunables {
    min_delay_nanos: AtomicU64,
    max_delay_nanos: AtomicU64,
    max_count: AtomicU64,
}

impl RetryTunables {
    /// Creates tunables with the given delay bounds and retry budget.
    pub fn new(min_delay: Duration, max_delay: Duration, max_count: u64) -> Self {
        Self {
            min_delay_nanos: AtomicU64::new(duration_to_nanos(min_delay)),
            max_delay_nanos: AtomicU64::new(duration_to_nanos(max_delay)),
            max_count: AtomicU64::new(max_count),
        }
    }

    /// Current first reconnect delay.
    pub fn min_delay(&self) -> Duration {
        Duration::from_nanos(self.min_delay_nanos.load(Ordering::Acquire))
    }

    /// Current ceiling for the reconnect delay.
    pub fn max_delay(&self) -> Duration {
        Duration::from_nanos(self.max_delay_nanos.load(Ordering::Acquire))
    }

    /// Current retry budget per failure sequence.
    pub fn max_count(&self) -> u64 {
        self.max_count.load(Ordering::Acquire)
    }

    /// Replaces the first reconnect delay.
    pub fn set_min_delay(&self, delay: Duration) {
        self.min_delay_nanos
            .store(duration_to_nanos(delay), Ordering::Release);
    }

    /// Replaces the reconnect delay ceiling.
    pub fn set_max_delay(&self, delay: Duration) {
        self.max_delay_nanos
            .store(duration_to_nanos(delay), Ordering::Release);
    }

    /// Replaces the retry budget.
    pub fn set_max_count(&self, count: u64) {
        self.max_count.store(count, Ordering::Release);
    }

    /// Computes the delay that follows `current`: doubled, clamped to the
    /// current maximum.
    pub fn next_delay(&self, current: Duration) -> Duration {
        std::cmp::min(current.saturating_mul(2), self.max_delay())
    }
}

impl Default for RetryTunables {
    fn default() -> Self {
        Self::new(
            DEFAULT_MIN_RETRY_DELAY,
            DEFAULT_MAX_RETRY_DELAY,
            DEFAULT_MAX_RETRY_COUNT,
        )
    }
}

fn duration_to_nanos(duration: Duration) -> u64 {
    duration.as_nanos().min(u64::MAX as u128) as u64
}

/// Mutable state of one retry loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryContext {
    /// Delay applied after the next failure.
    pub delay: Duration,
    /// Failures since the last successful connect.
    pub attempts: u64,
}

impl RetryContext {
    fn reset(&mut self, min_delay: Duration) {
        self.delay = min_delay;
        self.attempts = 0;
    }
}

/// Callback fired after every successful dial.
pub type ConnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Shared slot holding the callback fired on connect.
#[derive(Clone, Default)]
pub struct ConnectHook {
    slot: Arc<Mutex<Option<ConnectCallback>>>,
}

impl ConnectHook {
    /// Creates an empty hook.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a hook that forwards to whatever `target` holds when fired.
    pub fn delegating(target: ConnectHook) -> Self {
        let hook = Self::new();
        hook.replace(Some(Arc::new(move || target.fire())));
        hook
    }

    /// Installs `callback`, returning the previous one.
    pub fn replace(&self, callback: Option<ConnectCallback>) -> Option<ConnectCallback> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, callback)
    }

    /// Returns the installed callback, if any.
    pub fn get(&self) -> Option<ConnectCallback> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Invokes the installed callback, if any.
    ///
    /// The slot lock is released before the callback runs, so a callback may
    /// itself touch the hook.
    pub fn fire(&self) {
        if let Some(callback) = self.get() {
            callback();
        }
    }
}

impl std::fmt::Debug for ConnectHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectHook")
            .field("installed", &self.get().is_some())
            .finish()
    }
}

/// Restores the previously installed connect callback when dropped.
struct RestoreConnectHook<'a> {
    hook: &'a ConnectHook,
    previous: Option<Option<ConnectCallback>>,
}

impl Drop for RestoreConnectHook<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.hook.replace(previous);
        }
    }
}

/// Result of one connect-and-listen attempt.
#[derive(Debug, Default)]
pub struct Attempt {
    /// Error that ended the attempt, if any.
    pub error: Option<ConsumerError>,
    /// `true` when the stream was shut down on purpose and must not retry.
    pub done: bool,
}

impl Attempt {
    /// Attempt that ended because the stream was shut down.
    pub fn done() -> Self {
        Self {
            error: None,
            done: true,
        }
    }

    /// Attempt that ended with `error` and may be retried.
    pub fn failed(error: ConsumerError) -> Self {
        Self {
            error: Some(error),
            done: false,
        }
    }
}

/// Runs `action` until it reports `done`, fails permanently, or exhausts the
/// retry budget.
///
/// While the loop runs, `hook` holds a callback that resets the backoff delay
/// and attempt count and then calls the callback that was installed before.
/// The original callback is restored on exit.
///
/// Each error send blocks until the receiver has room; a receiver that stops
/// draining stalls all further attempts. If the receiver is dropped the loop
/// stops. Cancelling `shutdown` ends the loop at its next backoff sleep or
/// error send, without publishing anything further.
pub async fn retry_action<Op, Fut>(
    tunables: &Arc<RetryTunables>,
    hook: &ConnectHook,
    errors: &mpsc::Sender<ConsumerError>,
    shutdown: &CancellationToken,
    mut action: Op,
) where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Attempt>,
{
    let context = Arc::new(Mutex::new(RetryContext {
        delay: tunables.min_delay(),
        attempts: 0,
    }));

    let previous = hook.get();
    let reset: ConnectCallback = {
        let context = Arc::clone(&context);
        let tunables = Arc::clone(tunables);
        let previous = previous.clone();
        Arc::new(move || {
            context
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .reset(tunables.min_delay());
            if let Some(previous) = previous.as_ref() {
                previous();
            }
        })
    };
    hook.replace(Some(reset));
    let _restore = RestoreConnectHook {
        hook,
        previous: Some(previous),
    };

    loop {
        let Attempt { error, done } = action().await;
        if done {
            return;
        }

        let error = match error {
            Some(error) if error.is_non_retryable() => {
                warn!(event = "retry_non_retryable", error = %error);
                publish(errors, shutdown, error).await;
                return;
            }
            other => other,
        };

        let next = {
            let mut state = context.lock().unwrap_or_else(PoisonError::into_inner);
            if state.attempts >= tunables.max_count() {
                None
            } else {
                state.attempts += 1;
                Some((state.delay, state.attempts))
            }
        };

        let Some((delay, attempt)) = next else {
            warn!(event = "retry_budget_exhausted", max_count = tunables.max_count());
            publish(errors, shutdown, ConsumerError::MaxRetriesReached).await;
            return;
        };

        if let Some(error) = error {
            if !publish(errors, shutdown, ConsumerError::retryable(error)).await {
                return;
            }
        }

        debug!(
            event = "retry_attempt_failed",
            attempt,
            max_count = tunables.max_count(),
            delay_ms = delay.as_millis() as u64
        );
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!(event = "retry_cancelled", attempt);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        {
            let mut state = context.lock().unwrap_or_else(PoisonError::into_inner);
            state.delay = tunables.next_delay(state.delay);
        }
    }
}

/// Sends `error` unless `shutdown` fires first. Returns `false` when the
/// retry loop must stop.
async fn publish(
    errors: &mpsc::Sender<ConsumerError>,
    shutdown: &CancellationToken,
    error: ConsumerError,
) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        sent = errors.send(error) => sent.is_ok(),
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use super::{retry_action, Attempt, ConnectCallback, ConnectHook, RetryTunables};
    use crate::errors::ConsumerError;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn drain(mut rx: mpsc::Receiver<ConsumerError>) -> JoinHandle<Vec<ConsumerError>> {
        tokio::spawn(async move {
            let mut errors = Vec::new();
            while let Some(error) = rx.recv().await {
                errors.push(error);
            }
            errors
        })
    }

    fn gaps(calls: &[Instant]) -> Vec<Duration> {
        calls.windows(2).map(|pair| pair[1] - pair[0]).collect()
    }

    #[test]
    fn next_delay_doubles_then_clamps() {
        let tunables = RetryTunables::new(ms(500), ms(1500), 10);
        assert_eq!(tunables.next_delay(ms(500)), ms(1000));
        assert_eq!(tunables.next_delay(ms(1000)), ms(1500));
        assert_eq!(tunables.next_delay(ms(1500)), ms(1500));

        tunables.set_max_delay(ms(3000));
        assert_eq!(tunables.next_delay(ms(1500)), ms(3000));
    }

    #[test]
    fn defaults_match_documented_values() {
        let tunables = RetryTunables::default();
        assert_eq!(tunables.min_delay(), ms(500));
        assert_eq!(tunables.max_delay(), Duration::from_secs(60));
        assert_eq!(tunables.max_count(), 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_sequence_doubles_until_budget_is_spent() {
        let tunables = Arc::new(RetryTunables::new(ms(100), ms(400), 5));
        let hook = ConnectHook::new();
        let (tx, rx) = mpsc::channel(1);
        let errors = drain(rx);
        let calls = Mutex::new(Vec::new());

        retry_action(&tunables, &hook, &tx, &CancellationToken::new(), || {
            calls.lock().unwrap().push(Instant::now());
            async { Attempt::failed(ConsumerError::LostConnection) }
        })
        .await;
        drop(tx);

        let calls = calls.into_inner().unwrap();
        assert_eq!(calls.len(), 6);
        assert_eq!(
            gaps(&calls),
            vec![ms(100), ms(200), ms(400), ms(400), ms(400)]
        );

        let errors = errors.await.unwrap();
        assert_eq!(errors.len(), 6);
        assert!(errors[..5].iter().all(ConsumerError::is_retryable));
        assert!(errors[5].is_max_retries());
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_emits_retryable_errors_then_sentinel() {
        let tunables = Arc::new(RetryTunables::new(ms(10), ms(100), 2));
        let hook = ConnectHook::new();
        let (tx, rx) = mpsc::channel(1);
        let errors = drain(rx);
        let calls = AtomicUsize::new(0);

        retry_action(&tunables, &hook, &tx, &CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Attempt::failed(ConsumerError::LostConnection) }
        })
        .await;
        drop(tx);

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let errors = errors.await.unwrap();
        assert_eq!(errors.len(), 3);
        assert!(errors[0].is_retryable());
        assert!(errors[1].is_retryable());
        assert!(errors[2].is_max_retries());
    }

    #[tokio::test(start_paused = true)]
    async fn successful_connect_resets_delay_and_attempts() {
        let tunables = Arc::new(RetryTunables::new(ms(100), ms(1000), 3));
        let hook = ConnectHook::new();
        let user_connects = Arc::new(AtomicUsize::new(0));
        let user_callback: ConnectCallback = {
            let user_connects = Arc::clone(&user_connects);
            Arc::new(move || {
                user_connects.fetch_add(1, Ordering::SeqCst);
            })
        };
        hook.replace(Some(Arc::clone(&user_callback)));

        let (tx, rx) = mpsc::channel(1);
        let errors = drain(rx);
        let calls = Mutex::new(Vec::new());

        retry_action(&tunables, &hook, &tx, &CancellationToken::new(), || {
            let call = {
                let mut calls = calls.lock().unwrap();
                calls.push(Instant::now());
                calls.len()
            };
            if call == 3 {
                hook.fire();
            }
            async { Attempt::failed(ConsumerError::LostConnection) }
        })
        .await;
        drop(tx);

        let calls = calls.into_inner().unwrap();
        assert_eq!(
            gaps(&calls),
            vec![ms(100), ms(200), ms(100), ms(200), ms(400)]
        );
        assert_eq!(user_connects.load(Ordering::SeqCst), 1);

        let restored = hook.get().expect("user callback restored");
        assert!(Arc::ptr_eq(&restored, &user_callback));

        let errors = errors.await.unwrap();
        assert_eq!(errors.len(), 6);
        assert!(errors[5].is_max_retries());
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_is_published_unwrapped() {
        let tunables = Arc::new(RetryTunables::default());
        let hook = ConnectHook::new();
        let (tx, rx) = mpsc::channel(1);
        let errors = drain(rx);
        let calls = AtomicUsize::new(0);

        retry_action(&tunables, &hook, &tx, &CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Attempt::failed(ConsumerError::InvalidScheme("http".to_string())) }
        })
        .await;
        drop(tx);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let errors = errors.await.unwrap();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], ConsumerError::InvalidScheme(_)));
        assert!(hook.get().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn done_attempt_exits_without_errors() {
        let tunables = Arc::new(RetryTunables::default());
        let hook = ConnectHook::new();
        let (tx, rx) = mpsc::channel(1);
        let errors = drain(rx);

        retry_action(&tunables, &hook, &tx, &CancellationToken::new(), || async {
            Attempt::done()
        })
        .await;
        drop(tx);

        assert!(errors.await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn clean_attempt_end_counts_without_publishing() {
        let tunables = Arc::new(RetryTunables::new(ms(10), ms(10), 2));
        let hook = ConnectHook::new();
        let (tx, rx) = mpsc::channel(1);
        let errors = drain(rx);

        retry_action(&tunables, &hook, &tx, &CancellationToken::new(), || async {
            Attempt::default()
        })
        .await;
        drop(tx);

        let errors = errors.await.unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_max_retries());
    }

    #[tokio::test(start_paused = true)]
    async fn undrained_error_conduit_stalls_retries() {
        let tunables = Arc::new(RetryTunables::new(ms(1), ms(1), 100));
        let hook = ConnectHook::new();
        let (tx, mut rx) = mpsc::channel(1);
        let calls = Arc::new(AtomicUsize::new(0));

        let engine = {
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                retry_action(&tunables, &hook, &tx, &CancellationToken::new(), || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Attempt::failed(ConsumerError::LostConnection) }
                })
                .await;
            })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        // One error sits in the conduit, the second send is blocked.
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(rx.recv().await.is_some());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        drop(rx);
        engine.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_backoff_sleep() {
        let tunables = Arc::new(RetryTunables::new(Duration::from_secs(60), ms(60_000), 100));
        let hook = ConnectHook::new();
        let (tx, mut rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let engine = {
            let calls = Arc::clone(&calls);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                retry_action(&tunables, &hook, &tx, &shutdown, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Attempt::failed(ConsumerError::LostConnection) }
                })
                .await;
            })
        };

        assert!(rx.recv().await.expect("first error").is_retryable());
        let cancelled_at = Instant::now();
        shutdown.cancel();
        engine.await.unwrap();

        assert!(cancelled_at.elapsed() < Duration::from_secs(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(rx.recv().await.is_none());
    }
}
