//! Subscriber lifecycle: connect, listen, reconnect, stop.
//!
//! [`Subscriber`] owns one background worker task that receives payloads from
//! a [`Transport`] session and hands each to a [`MessageHandler`]. State moves
//! `Idle → Connecting → Listening → Stopping → Idle`.
//!
//! The worker races every receive against a [`CancellationToken`], so
//! [`Subscriber::stop`] unblocks it even when the channel is silent. Stop
//! waits a bounded time for the worker and aborts it if it does not exit.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::pipeline::MessageHandler;

pub mod channel;
pub mod mqtt;
mod reconnect;
pub mod redis;

pub use reconnect::{next_delay, reconnect_loop, BackoffConfig, ReconnectPolicy};

// ---

/// Opens sessions on the upstream channel.
pub trait Transport: Send + Sync + 'static {
    type Session: Session;

    /// One connect-and-subscribe attempt.
    fn connect(&self) -> impl Future<Output = Result<Self::Session, TransportError>> + Send;
}

/// A live subscription.
pub trait Session: Send + 'static {
    /// Wait for the next payload on the subscribed topic.
    ///
    /// An error means the session is unusable.
    fn recv(&mut self) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    /// Unsubscribe and release the connection.
    fn close(self) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("connection lost: {0}")]
    Connection(String),

    #[error("no handshake within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum SubscriberError {
    #[error("no message handler installed")]
    NoHandler,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("stopped while connecting")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberState {
    Idle,
    Connecting,
    Listening,
    Stopping,
}

#[derive(Debug, Clone)]
pub struct SubscriberOptions {
    /// Upper bound on how long `stop()` waits for the worker.
    pub stop_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::Never,
        }
    }
}

struct Inner {
    state: SubscriberState,
    /// Bumped on every `start()` so a finished worker cannot clobber a newer
    /// session.
    session_id: u64,
    /// Bumped on every `stop()`, even when idle, so a pending
    /// `start_with_retry()` notices it between attempts.
    stops: u64,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    inner: Mutex<Inner>,
}

impl Shared {
    // ---
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move an active session to `state`; ignored once stopping or stale.
    fn transition(&self, session_id: u64, state: SubscriberState) {
        let mut inner = self.lock();
        if inner.session_id == session_id && inner.state != SubscriberState::Stopping {
            inner.state = state;
        }
    }

    /// Called when a session ends on its own; `stop()` handles its own
    /// cleanup.
    fn finish(&self, session_id: u64) {
        let mut inner = self.lock();
        if inner.session_id == session_id && inner.state != SubscriberState::Stopping {
            inner.state = SubscriberState::Idle;
            inner.cancel = None;
            inner.task = None;
        }
    }
}

/// Read-only view of a subscriber's state, cheap to clone into handlers.
#[derive(Clone)]
pub struct SubscriberStatus {
    shared: Arc<Shared>,
}

impl SubscriberStatus {
    // ---
    pub fn state(&self) -> SubscriberState {
        self.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SubscriberState::Listening
    }
}

pub struct Subscriber<T: Transport, H: MessageHandler> {
    transport: Arc<T>,
    handler: Mutex<Option<Arc<H>>>,
    options: SubscriberOptions,
    shared: Arc<Shared>,
}

impl<T: Transport, H: MessageHandler> Subscriber<T, H> {
    // ---
    pub fn new(transport: T, options: SubscriberOptions) -> Self {
        // ---
        Self {
            transport: Arc::new(transport),
            handler: Mutex::new(None),
            options,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: SubscriberState::Idle,
                    session_id: 0,
                    stops: 0,
                    cancel: None,
                    task: None,
                }),
            }),
        }
    }

    pub fn status(&self) -> SubscriberStatus {
        SubscriberStatus {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> SubscriberState {
        self.shared.lock().state
    }

    /// Install the handler used by the next `start()`.
    ///
    /// Must be called before `start()`. Changing it while a session is
    /// active does not affect that session.
    pub fn set_message_handler(&self, handler: Arc<H>) {
        // ---
        let state = self.state();
        if matches!(state, SubscriberState::Connecting | SubscriberState::Listening) {
            tracing::warn!(?state, "Message handler replaced while running; applies from next start");
        }
        *self
            .handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handler);
    }

    /// Connect once and spawn the listening worker.
    ///
    /// A no-op if a session is already connecting or listening. On failure
    /// the subscriber stays `Idle` and the error is returned; there is no
    /// retry here.
    pub async fn start(&self) -> Result<(), SubscriberError> {
        // ---
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(SubscriberError::NoHandler)?;

        let (session_id, cancel) = {
            let mut inner = self.shared.lock();
            if inner.state != SubscriberState::Idle {
                tracing::warn!(state = ?inner.state, "Subscriber already running");
                return Ok(());
            }
            inner.session_id += 1;
            inner.state = SubscriberState::Connecting;
            let cancel = CancellationToken::new();
            inner.cancel = Some(cancel.clone());
            (inner.session_id, cancel)
        };

        // A handshake that completes alongside a stop() is still closed
        // cleanly below.
        let connected = tokio::select! {
            biased;
            result = self.transport.connect() => result.map_err(SubscriberError::from),
            _ = cancel.cancelled() => Err(SubscriberError::Cancelled),
        };

        let session = match connected {
            Ok(session) => session,
            Err(SubscriberError::Cancelled) => {
                tracing::info!("Connect abandoned, subscriber stopped");
                self.shared.finish(session_id);
                return Err(SubscriberError::Cancelled);
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to connect to channel");
                self.shared.finish(session_id);
                return Err(e);
            }
        };

        // stop() may have run while the handshake was in flight.
        let session = {
            let mut inner = self.shared.lock();
            if inner.session_id != session_id || cancel.is_cancelled() {
                Err(session)
            } else {
                let worker = run_worker(
                    Arc::clone(&self.shared),
                    Arc::clone(&self.transport),
                    session,
                    handler,
                    cancel.clone(),
                    session_id,
                    self.options.reconnect.clone(),
                );
                inner.state = SubscriberState::Listening;
                inner.task = Some(tokio::spawn(worker));
                Ok(())
            }
        };

        match session {
            Ok(()) => {
                tracing::info!("Subscribed to channel");
                Ok(())
            }
            Err(session) => {
                tracing::info!("Connected after stop was requested, closing session");
                session.close().await;
                self.shared.finish(session_id);
                Err(SubscriberError::Cancelled)
            }
        }
    }

    /// `start()`, retrying failed connects according to the reconnect
    /// policy.
    ///
    /// With [`ReconnectPolicy::Never`] this is a single `start()`. Only
    /// transport errors are retried; a missing handler ends the attempts at
    /// once, and a `stop()` ends them before the next connect.
    pub async fn start_with_retry(&self) -> Result<(), SubscriberError> {
        // ---
        let config = match &self.options.reconnect {
            ReconnectPolicy::Never => return self.start().await,
            ReconnectPolicy::Backoff(config) => config,
        };

        let stops = self.shared.lock().stops;
        let mut delay = config.initial_delay;
        let mut retries = 0u32;

        loop {
            if self.shared.lock().stops != stops {
                tracing::info!("Subscriber stopped, no further connect attempts");
                return Err(SubscriberError::Cancelled);
            }

            let err = match self.start().await {
                Err(SubscriberError::Transport(e)) => e,
                other => return other,
            };

            if config.max_attempts.is_some_and(|max| retries >= max) {
                tracing::error!(retries, "Giving up on connecting to channel");
                return Err(err.into());
            }
            retries += 1;

            tracing::warn!(
                error = %err,
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                "Channel unavailable, retrying"
            );
            tokio::time::sleep(delay).await;
            delay = next_delay(delay, config);
        }
    }

    /// Cancel the worker, wait up to `stop_timeout` for it, and settle in
    /// `Idle` whatever happens.
    pub async fn stop(&self) {
        // ---
        let (cancel, task) = {
            let mut inner = self.shared.lock();
            inner.stops += 1;
            match inner.state {
                SubscriberState::Idle => {
                    tracing::debug!("Subscriber not running");
                    return;
                }
                SubscriberState::Stopping => {
                    tracing::debug!("Subscriber already stopping");
                    return;
                }
                SubscriberState::Connecting | SubscriberState::Listening => {}
            }
            inner.state = SubscriberState::Stopping;
            (inner.cancel.take(), inner.task.take())
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        if let Some(mut task) = task {
            match tokio::time::timeout(self.options.stop_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Subscriber worker ended abnormally"),
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = self.options.stop_timeout.as_millis() as u64,
                        "Subscriber worker did not exit in time, aborting"
                    );
                    task.abort();
                }
            }
        }

        let mut inner = self.shared.lock();
        inner.state = SubscriberState::Idle;
        inner.cancel = None;
        inner.task = None;
        tracing::info!("Disconnected from channel");
    }
}

/// Receive loop for one subscriber session (and its reconnects).
async fn run_worker<T: Transport, H: MessageHandler>(
    shared: Arc<Shared>,
    transport: Arc<T>,
    mut session: T::Session,
    handler: Arc<H>,
    cancel: CancellationToken,
    session_id: u64,
    policy: ReconnectPolicy,
) {
    // ---
    tracing::info!(session_id, "Listening for messages");

    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = session.recv() => received,
        };

        match received {
            Ok(payload) => {
                tracing::debug!(bytes = payload.len(), "Received message");
                handler.handle(&payload).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Listening loop error");
                session.close().await;

                shared.transition(session_id, SubscriberState::Connecting);
                match reconnect_loop(transport.as_ref(), &policy, &cancel).await {
                    Some(fresh) => {
                        session = fresh;
                        shared.transition(session_id, SubscriberState::Listening);
                    }
                    None => {
                        shared.finish(session_id);
                        tracing::info!(session_id, "Stopped listening");
                        return;
                    }
                }
            }
        }
    }

    session.close().await;
    tracing::info!(session_id, "Stopped listening");
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{mpsc, oneshot};
    use tokio::time::timeout;

    type Feed = mpsc::UnboundedReceiver<Result<Vec<u8>, TransportError>>;
    type FeedTx = mpsc::UnboundedSender<Result<Vec<u8>, TransportError>>;

    /// Each `connect()` consumes one queued feed; none left means refusal.
    #[derive(Default)]
    struct MemoryTransport {
        feeds: Mutex<VecDeque<Feed>>,
        /// Connects refused before any feed is handed out.
        refusals: AtomicUsize,
        connects: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl MemoryTransport {
        fn with_feed(&self) -> FeedTx {
            let (tx, rx) = mpsc::unbounded_channel();
            self.feeds.lock().unwrap().push_back(rx);
            tx
        }
    }

    struct MemorySession {
        feed: Feed,
        closes: Arc<AtomicUsize>,
    }

    impl Transport for MemoryTransport {
        type Session = MemorySession;

        async fn connect(&self) -> Result<MemorySession, TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let refused = self
                .refusals
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(TransportError::Connect("not yet".into()));
            }
            let feed = self
                .feeds
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| TransportError::Connect("refused".into()))?;
            Ok(MemorySession {
                feed,
                closes: Arc::clone(&self.closes),
            })
        }
    }

    impl Session for MemorySession {
        async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
            match self.feed.recv().await {
                Some(item) => item,
                None => Err(TransportError::Connection("feed closed".into())),
            }
        }

        async fn close(self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Handshake blocks until the gate opens, or forever without one.
    struct GatedTransport {
        gate: Mutex<Option<oneshot::Receiver<()>>>,
        closes: Arc<AtomicUsize>,
    }

    impl GatedTransport {
        fn never() -> Self {
            Self {
                gate: Mutex::new(None),
                closes: Arc::default(),
            }
        }

        fn opened_by(rx: oneshot::Receiver<()>) -> Self {
            Self {
                gate: Mutex::new(Some(rx)),
                closes: Arc::default(),
            }
        }
    }

    impl Transport for GatedTransport {
        type Session = MemorySession;

        async fn connect(&self) -> Result<MemorySession, TransportError> {
            let gate = self.gate.lock().unwrap().take();
            match gate {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => std::future::pending::<()>().await,
            }
            let (_tx, feed) = mpsc::unbounded_channel();
            Ok(MemorySession {
                feed,
                closes: Arc::clone(&self.closes),
            })
        }
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<Vec<u8>>,
    }

    impl MessageHandler for Recorder {
        async fn handle(&self, payload: &[u8]) {
            let _ = self.tx.send(payload.to_vec());
        }
    }

    /// Never finishes handling; used to exercise the stop timeout.
    struct Stuck;

    impl MessageHandler for Stuck {
        async fn handle(&self, _payload: &[u8]) {
            std::future::pending::<()>().await;
        }
    }

    fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder { tx }), rx)
    }

    async fn wait_for_state<T: Transport, H: MessageHandler>(
        sub: &Subscriber<T, H>,
        want: SubscriberState,
    ) {
        timeout(Duration::from_secs(2), async {
            while sub.state() != want {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("state transition");
    }

    fn quick_backoff(max_attempts: Option<u32>) -> SubscriberOptions {
        SubscriberOptions {
            stop_timeout: Duration::from_secs(1),
            reconnect: ReconnectPolicy::Backoff(BackoffConfig {
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                multiplier: 2.0,
                max_attempts,
            }),
        }
    }

    #[tokio::test]
    async fn test_start_requires_handler() {
        // ---
        let sub: Subscriber<MemoryTransport, Recorder> =
            Subscriber::new(MemoryTransport::default(), SubscriberOptions::default());
        assert!(matches!(sub.start().await, Err(SubscriberError::NoHandler)));
        assert_eq!(sub.state(), SubscriberState::Idle);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_idle() {
        // ---
        let sub = Subscriber::new(MemoryTransport::default(), SubscriberOptions::default());
        sub.set_message_handler(recorder().0);

        let err = sub.start().await.unwrap_err();
        assert!(matches!(err, SubscriberError::Transport(TransportError::Connect(_))));
        assert_eq!(sub.state(), SubscriberState::Idle);
        assert!(!sub.status().is_connected());
    }

    #[tokio::test]
    async fn test_messages_reach_handler_in_order() {
        // ---
        let transport = MemoryTransport::default();
        let feed = transport.with_feed();
        let connects = Arc::clone(&transport.connects);
        let sub = Subscriber::new(transport, SubscriberOptions::default());
        let (handler, mut seen) = recorder();
        sub.set_message_handler(handler);

        tokio_test::assert_ok!(sub.start().await);
        assert_eq!(sub.state(), SubscriberState::Listening);
        assert!(sub.status().is_connected());

        for body in [&b"one"[..], b"two", b"three"] {
            feed.send(Ok(body.to_vec())).unwrap();
        }
        for want in [&b"one"[..], b"two", b"three"] {
            let got = timeout(Duration::from_secs(1), seen.recv()).await.unwrap().unwrap();
            assert_eq!(got, want);
        }

        // Second start is a no-op.
        tokio_test::assert_ok!(sub.start().await);
        assert_eq!(connects.load(Ordering::SeqCst), 1);

        sub.stop().await;
    }

    #[tokio::test]
    async fn test_stop_unblocks_silent_channel() {
        // ---
        let transport = MemoryTransport::default();
        let _feed = transport.with_feed();
        let closes = Arc::clone(&transport.closes);
        let sub = Subscriber::new(transport, SubscriberOptions::default());
        sub.set_message_handler(recorder().0);
        sub.start().await.unwrap();

        timeout(Duration::from_secs(1), sub.stop())
            .await
            .expect("stop should not wait for the full timeout");
        assert_eq!(sub.state(), SubscriberState::Idle);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        // Stopping again is harmless.
        sub.stop().await;
        assert_eq!(sub.state(), SubscriberState::Idle);
    }

    #[tokio::test]
    async fn test_transport_error_without_reconnect_goes_idle() {
        // ---
        let transport = MemoryTransport::default();
        let feed = transport.with_feed();
        let second = transport.with_feed();
        let sub = Subscriber::new(transport, SubscriberOptions::default());
        let (handler, mut seen) = recorder();
        sub.set_message_handler(handler);
        sub.start().await.unwrap();

        feed.send(Err(TransportError::Connection("broker went away".into())))
            .unwrap();
        wait_for_state(&sub, SubscriberState::Idle).await;

        // An explicit start() opens the next session.
        sub.start().await.unwrap();
        second.send(Ok(b"back".to_vec())).unwrap();
        let got = timeout(Duration::from_secs(1), seen.recv()).await.unwrap().unwrap();
        assert_eq!(got, b"back");
        sub.stop().await;
    }

    #[tokio::test]
    async fn test_backoff_policy_reconnects() {
        // ---
        let transport = MemoryTransport::default();
        let first = transport.with_feed();
        let second = transport.with_feed();
        let sub = Subscriber::new(transport, quick_backoff(Some(5)));
        let (handler, mut seen) = recorder();
        sub.set_message_handler(handler);
        sub.start().await.unwrap();

        drop(first);
        second.send(Ok(b"after reconnect".to_vec())).unwrap();
        let got = timeout(Duration::from_secs(2), seen.recv()).await.unwrap().unwrap();
        assert_eq!(got, b"after reconnect");
        wait_for_state(&sub, SubscriberState::Listening).await;

        sub.stop().await;
        assert_eq!(sub.state(), SubscriberState::Idle);
    }

    #[tokio::test]
    async fn test_backoff_gives_up_after_max_attempts() {
        // ---
        let transport = MemoryTransport::default();
        let only = transport.with_feed();
        let connects = Arc::clone(&transport.connects);
        let sub = Subscriber::new(transport, quick_backoff(Some(3)));
        sub.set_message_handler(recorder().0);
        sub.start().await.unwrap();

        drop(only);
        wait_for_state(&sub, SubscriberState::Idle).await;
        assert_eq!(connects.load(Ordering::SeqCst), 1 + 3);
    }

    #[tokio::test]
    async fn test_stop_aborts_stuck_worker() {
        // ---
        let transport = MemoryTransport::default();
        let feed = transport.with_feed();
        let options = SubscriberOptions {
            stop_timeout: Duration::from_millis(50),
            ..SubscriberOptions::default()
        };
        let sub = Subscriber::new(transport, options);
        sub.set_message_handler(Arc::new(Stuck));
        sub.start().await.unwrap();

        feed.send(Ok(b"hang".to_vec())).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        timeout(Duration::from_secs(1), sub.stop()).await.unwrap();
        assert_eq!(sub.state(), SubscriberState::Idle);
    }


    #[tokio::test]
    async fn test_stop_while_connecting_cancels_handshake() {
        // ---
        let sub = Arc::new(Subscriber::new(
            GatedTransport::never(),
            SubscriberOptions::default(),
        ));
        sub.set_message_handler(recorder().0);

        let starting = tokio::spawn({
            let sub = Arc::clone(&sub);
            async move { sub.start().await }
        });
        wait_for_state(&sub, SubscriberState::Connecting).await;

        timeout(Duration::from_secs(1), sub.stop()).await.unwrap();
        let result = timeout(Duration::from_secs(1), starting).await.unwrap().unwrap();
        assert!(matches!(result, Err(SubscriberError::Cancelled)));
        assert_eq!(sub.state(), SubscriberState::Idle);
    }

    #[tokio::test]
    async fn test_handshake_finishing_after_stop_is_closed() {
        // ---
        let (open, gate) = oneshot::channel();
        let transport = GatedTransport::opened_by(gate);
        let closes = Arc::clone(&transport.closes);
        let sub = Arc::new(Subscriber::new(transport, SubscriberOptions::default()));
        sub.set_message_handler(recorder().0);

        let starting = tokio::spawn({
            let sub = Arc::clone(&sub);
            async move { sub.start().await }
        });
        wait_for_state(&sub, SubscriberState::Connecting).await;

        // Both complete before the start task runs again; the finished
        // handshake wins and its session is closed.
        sub.stop().await;
        open.send(()).unwrap();

        let result = timeout(Duration::from_secs(1), starting).await.unwrap().unwrap();
        assert!(matches!(result, Err(SubscriberError::Cancelled)));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(sub.state(), SubscriberState::Idle);
    }

    #[tokio::test]
    async fn test_start_with_retry_waits_for_channel() {
        // ---
        let transport = MemoryTransport::default();
        transport.refusals.store(2, Ordering::SeqCst);
        let feed = transport.with_feed();
        let connects = Arc::clone(&transport.connects);
        let sub = Subscriber::new(transport, quick_backoff(Some(5)));
        let (handler, mut seen) = recorder();
        sub.set_message_handler(handler);

        tokio_test::assert_ok!(sub.start_with_retry().await);
        assert_eq!(connects.load(Ordering::SeqCst), 3);
        assert_eq!(sub.state(), SubscriberState::Listening);

        feed.send(Ok(b"first".to_vec())).unwrap();
        let got = timeout(Duration::from_secs(1), seen.recv()).await.unwrap().unwrap();
        assert_eq!(got, b"first");
        sub.stop().await;
    }

    #[tokio::test]
    async fn test_start_with_retry_gives_up_after_max_attempts() {
        // ---
        let transport = MemoryTransport::default();
        let connects = Arc::clone(&transport.connects);
        let sub = Subscriber::new(transport, quick_backoff(Some(2)));
        sub.set_message_handler(recorder().0);

        let err = sub.start_with_retry().await.unwrap_err();
        assert!(matches!(err, SubscriberError::Transport(TransportError::Connect(_))));
        assert_eq!(connects.load(Ordering::SeqCst), 1 + 2);
        assert_eq!(sub.state(), SubscriberState::Idle);
    }

    #[tokio::test]
    async fn test_start_with_retry_without_policy_tries_once() {
        // ---
        let transport = MemoryTransport::default();
        let connects = Arc::clone(&transport.connects);
        let sub = Subscriber::new(transport, SubscriberOptions::default());
        sub.set_message_handler(recorder().0);

        assert!(sub.start_with_retry().await.is_err());
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_ends_start_with_retry() {
        // ---
        let transport = MemoryTransport::default();
        let connects = Arc::clone(&transport.connects);
        let options = SubscriberOptions {
            stop_timeout: Duration::from_secs(1),
            reconnect: ReconnectPolicy::Backoff(BackoffConfig {
                initial_delay: Duration::from_millis(50),
                max_delay: Duration::from_millis(50),
                multiplier: 2.0,
                max_attempts: None,
            }),
        };
        let sub = Arc::new(Subscriber::new(transport, options));
        sub.set_message_handler(recorder().0);

        let retrying = tokio::spawn({
            let sub = Arc::clone(&sub);
            async move { sub.start_with_retry().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        sub.stop().await;

        let result = timeout(Duration::from_secs(1), retrying).await.unwrap().unwrap();
        assert!(matches!(result, Err(SubscriberError::Cancelled)));
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pipeline_survives_malformed_message() {
        // ---
        use crate::filter::FilterParams;
        use crate::pipeline::Ingestor;
        use crate::store::{tests::test_pool, ReadingHistory};

        let history = ReadingHistory::new(test_pool().await);
        let transport = MemoryTransport::default();
        let feed = transport.with_feed();
        let sub = Subscriber::new(transport, SubscriberOptions::default());
        sub.set_message_handler(Arc::new(Ingestor::new(
            history.clone(),
            FilterParams::default(),
        )));
        sub.start().await.unwrap();

        feed.send(Ok(br#"{"avg_temp1": "bad"}"#.to_vec())).unwrap();
        feed.send(Ok(br#"{"avg_temp1": 21.0, "avg_temp2": 22.0}"#.to_vec()))
            .unwrap();

        timeout(Duration::from_secs(2), async {
            while history.latest(5).await.unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("valid message ingested");

        let stored = history.latest(5).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!((stored[0].avg_temp1, stored[0].avg_temp2), (21.0, 22.0));
        assert_eq!(sub.state(), SubscriberState::Listening);
        sub.stop().await;
    }
}
