//! Reconnecting event-stream transport.
//!
//! One transport keeps one subscription scope alive: it opens the channel,
//! demands the `connected` marker, hands decoded events to the subscriber,
//! and when the connection drops it silently re-establishes it with
//! exponential backoff. Only the very first connect is allowed to fail the
//! caller; everything after that is absorbed by the reconnect loop and
//! surfaces solely as connection-state changes.

use crate::auth::AuthSession;
use crate::config::BackoffConfig;
use crate::error::{ClientError, ClientResult};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use tether_core::SpaceId;
use tether_proto::{ProtoError, StreamEvent};

/// Subscription scope of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamScope {
    /// Session-wide events: space lifecycle and user storage.
    Global,
    /// One space's content events.
    Space(SpaceId),
}

impl fmt::Display for StreamScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamScope::Global => f.write_str("global"),
            StreamScope::Space(id) => write!(f, "space:{id}"),
        }
    }
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none pending.
    Disconnected,
    /// Connection lost; retrying with backoff.
    Reconnecting,
    /// Stream established.
    Connected,
    /// Terminally closed by [`StreamTransport::unsubscribe`].
    Closed,
}

/// A live, blocking source of decoded stream events.
pub trait EventSource: Send {
    /// Blocks for the next event. `Ok(None)` means the server ended the
    /// stream cleanly; both that and an error hand control to the
    /// reconnect loop.
    fn next_event(&mut self) -> ClientResult<Option<StreamEvent>>;
}

/// Opens scoped event channels.
///
/// Production wiring lives outside this crate; tests script connections.
pub trait StreamConnector: Send + Sync {
    /// Opens a channel for `scope` authenticated by `token`. The returned
    /// source must yield the `connected` marker as its first event.
    fn connect(&self, scope: &StreamScope, token: &str) -> ClientResult<Box<dyn EventSource>>;
}

struct StreamInner {
    connector: Arc<dyn StreamConnector>,
    auth: Arc<AuthSession>,
    scope: StreamScope,
    backoff: BackoffConfig,
    state: Mutex<ConnectionState>,
    state_listeners: Mutex<Vec<mpsc::Sender<ConnectionState>>>,
    subscribed: AtomicBool,
    closed: AtomicBool,
}

impl StreamInner {
    fn set_state(&self, next: ConnectionState) {
        {
            let mut state = self.state.lock();
            if *state == next {
                return;
            }
            *state = next;
        }
        self.state_listeners
            .lock()
            .retain(|tx| tx.send(next).is_ok());
    }

    /// Token, connect, and the mandatory `connected` marker.
    fn open(&self) -> ClientResult<(Box<dyn EventSource>, StreamEvent)> {
        let token = self.auth.token()?;
        let mut source = self.connector.connect(&self.scope, &token)?;
        match source.next_event()? {
            Some(event) if event.is_connected_marker() => Ok((source, event)),
            Some(event) => Err(ClientError::Protocol(ProtoError::decode(format!(
                "expected connected marker, got {}",
                event.type_name()
            )))),
            None => Err(ClientError::transport_retryable(
                "stream ended before connected marker",
            )),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Keeps one scoped event stream alive.
#[derive(Clone)]
pub struct StreamTransport {
    inner: Arc<StreamInner>,
}

impl StreamTransport {
    /// Creates a transport. No connection is made until [`subscribe`].
    ///
    /// [`subscribe`]: StreamTransport::subscribe
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        auth: Arc<AuthSession>,
        scope: StreamScope,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                connector,
                auth,
                scope,
                backoff,
                state: Mutex::new(ConnectionState::Disconnected),
                state_listeners: Mutex::new(Vec::new()),
                subscribed: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The scope this transport serves.
    #[must_use]
    pub fn scope(&self) -> &StreamScope {
        &self.inner.scope
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Subscribes to connection-state changes.
    pub fn on_state_change(&self) -> mpsc::Receiver<ConnectionState> {
        let (tx, rx) = mpsc::channel();
        self.inner.state_listeners.lock().push(tx);
        rx
    }

    /// Opens the stream and returns the event receiver.
    ///
    /// The first connect is synchronous and its failure (including missing
    /// credentials) propagates without any retry; on failure the transport
    /// stays unsubscribed and `subscribe` may be called again. After a
    /// successful subscribe, drops are handled internally and the receiver
    /// sees the `connected` marker again after each re-establishment.
    pub fn subscribe(&self) -> ClientResult<mpsc::Receiver<StreamEvent>> {
        if self.inner.is_closed() {
            return Err(ClientError::invalid_state("stream is closed"));
        }
        if self.inner.subscribed.swap(true, Ordering::SeqCst) {
            return Err(ClientError::invalid_state("already subscribed"));
        }

        let (source, marker) = match self.inner.open() {
            Ok(opened) => opened,
            Err(e) => {
                self.inner.subscribed.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        tracing::info!(scope = %self.inner.scope, "stream connected");
        self.inner.set_state(ConnectionState::Connected);

        let (tx, rx) = mpsc::channel();
        let _ = tx.send(marker);
        let inner = self.inner.clone();
        std::thread::spawn(move || reader_loop(&inner, source, &tx));
        Ok(rx)
    }

    /// Closes the stream permanently. The reader notices at the next
    /// event boundary, so connectors should surface keepalives or read
    /// timeouts rather than blocking forever.
    pub fn unsubscribe(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(scope = %self.inner.scope, "stream closed");
        self.inner.set_state(ConnectionState::Closed);
    }
}

fn reader_loop(
    inner: &Arc<StreamInner>,
    mut source: Box<dyn EventSource>,
    tx: &mpsc::Sender<StreamEvent>,
) {
    let mut failures: u32 = 0;
    'outer: loop {
        // Steady state: drain events until the connection gives out.
        loop {
            if inner.is_closed() {
                break 'outer;
            }
            match source.next_event() {
                Ok(Some(event)) => {
                    failures = 0;
                    if tx.send(event).is_err() {
                        // Receiver gone; nobody is listening anymore.
                        inner.closed.store(true, Ordering::SeqCst);
                        break 'outer;
                    }
                }
                Ok(None) => {
                    tracing::info!(scope = %inner.scope, "stream ended");
                    break;
                }
                Err(e) => {
                    tracing::warn!(scope = %inner.scope, error = %e, "stream error");
                    break;
                }
            }
        }
        if inner.is_closed() {
            break;
        }
        inner.set_state(ConnectionState::Reconnecting);

        // Backoff, then try again until a connection sticks. Credential
        // trouble here is just another failed attempt; steady-state
        // streams never log anyone out.
        loop {
            failures += 1;
            let delay = inner.backoff.delay_for_attempt(failures);
            tracing::debug!(
                scope = %inner.scope,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            std::thread::sleep(delay);
            if inner.is_closed() {
                break 'outer;
            }
            match inner.open() {
                Ok((next_source, marker)) => {
                    source = next_source;
                    failures = 0;
                    tracing::info!(scope = %inner.scope, "stream reconnected");
                    inner.set_state(ConnectionState::Connected);
                    if tx.send(marker).is_err() {
                        inner.closed.store(true, Ordering::SeqCst);
                        break 'outer;
                    }
                    continue 'outer;
                }
                Err(e) => {
                    tracing::debug!(scope = %inner.scope, error = %e, "reconnect failed");
                }
            }
        }
    }
    inner.set_state(ConnectionState::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;
    use crate::config::AuthConfig;
    use crate::provider::StaticProvider;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Event source fed by a channel, so tests control the stream live.
    struct ChannelSource(mpsc::Receiver<ClientResult<Option<StreamEvent>>>);

    impl EventSource for ChannelSource {
        fn next_event(&mut self) -> ClientResult<Option<StreamEvent>> {
            match self.0.recv() {
                Ok(item) => item,
                // Script dropped: treat as clean end.
                Err(_) => Ok(None),
            }
        }
    }

    type Feed = mpsc::Sender<ClientResult<Option<StreamEvent>>>;

    /// Connector that hands out pre-scripted connections in order.
    #[derive(Default)]
    struct ScriptedConnector {
        scripts: Mutex<VecDeque<ClientResult<Box<dyn EventSource>>>>,
        attempts: AtomicU32,
    }

    impl ScriptedConnector {
        fn push_failure(&self, error: ClientError) {
            self.scripts.lock().push_back(Err(error));
        }

        /// Queues a successful connection; the returned sender feeds it.
        fn push_connection(&self, with_marker: Option<u64>) -> Feed {
            let (tx, rx) = mpsc::channel();
            if let Some(version) = with_marker {
                let _ = tx.send(Ok(Some(marker(version))));
            }
            self.scripts
                .lock()
                .push_back(Ok(Box::new(ChannelSource(rx)) as Box<dyn EventSource>));
            tx
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl StreamConnector for ScriptedConnector {
        fn connect(
            &self,
            _scope: &StreamScope,
            _token: &str,
        ) -> ClientResult<Box<dyn EventSource>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.scripts
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(ClientError::transport_retryable("no script")))
        }
    }

    fn marker(version: u64) -> StreamEvent {
        StreamEvent::Connected {
            server_version: Some(version),
            timestamp: 1,
        }
    }

    fn changed() -> StreamEvent {
        StreamEvent::SpaceChanged { timestamp: 2 }
    }

    fn authed_session() -> Arc<AuthSession> {
        let provider = Arc::new(StaticProvider::new(Credentials::new("tok", None, 0)));
        let session = AuthSession::new(provider, AuthConfig::new().with_proactive_refresh(false));
        session.set_credentials(Credentials::new("tok", None, 0));
        session
    }

    fn fast_backoff() -> BackoffConfig {
        BackoffConfig::new()
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(4))
    }

    fn transport(connector: &Arc<ScriptedConnector>, session: Arc<AuthSession>) -> StreamTransport {
        StreamTransport::new(
            connector.clone() as Arc<dyn StreamConnector>,
            session,
            StreamScope::Space(SpaceId::new("s1")),
            fast_backoff(),
        )
    }

    #[test]
    fn subscribe_delivers_marker_first() {
        let connector = Arc::new(ScriptedConnector::default());
        let feed = connector.push_connection(Some(7));
        let stream = transport(&connector, authed_session());

        let rx = stream.subscribe().unwrap();
        assert_eq!(stream.state(), ConnectionState::Connected);

        let first = rx.recv().unwrap();
        assert!(first.is_connected_marker());

        let _ = feed.send(Ok(Some(changed())));
        let second = rx.recv().unwrap();
        assert!(matches!(second, StreamEvent::SpaceChanged { .. }));
    }

    #[test]
    fn subscribe_without_credentials_fails_fast() {
        let provider = Arc::new(StaticProvider::new(Credentials::new("tok", None, 0)));
        let session = AuthSession::new(provider, AuthConfig::new().with_proactive_refresh(false));
        let connector = Arc::new(ScriptedConnector::default());
        let stream = transport(&connector, session);

        let err = stream.subscribe().unwrap_err();
        assert!(matches!(err, ClientError::NotAuthenticated));
        assert_eq!(connector.attempts(), 0);
        assert_eq!(stream.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn subscribe_first_failure_propagates_without_retry() {
        let connector = Arc::new(ScriptedConnector::default());
        connector.push_failure(ClientError::transport_retryable("refused"));
        let stream = transport(&connector, authed_session());

        assert!(stream.subscribe().is_err());
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(connector.attempts(), 1);

        // A failed first connect leaves the transport retryable by the caller.
        let _feed = connector.push_connection(Some(1));
        assert!(stream.subscribe().is_ok());
    }

    #[test]
    fn subscribe_rejects_non_marker_first_event() {
        let connector = Arc::new(ScriptedConnector::default());
        let feed = connector.push_connection(None);
        let _ = feed.send(Ok(Some(changed())));
        let stream = transport(&connector, authed_session());

        let err = stream.subscribe().unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[test]
    fn drop_reconnects_and_redelivers_marker() {
        let connector = Arc::new(ScriptedConnector::default());
        let first = connector.push_connection(Some(1));
        let stream = transport(&connector, authed_session());
        let states = stream.on_state_change();

        let rx = stream.subscribe().unwrap();
        assert!(rx.recv().unwrap().is_connected_marker());

        // Queue the replacement connection, then kill the first one.
        let _second = connector.push_connection(Some(2));
        drop(first);

        let next = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(next.is_connected_marker());
        assert!(matches!(next, StreamEvent::Connected { server_version: Some(2), .. }));

        // Observed sequence: Connected, Reconnecting, Connected.
        assert_eq!(states.recv().unwrap(), ConnectionState::Connected);
        assert_eq!(states.recv().unwrap(), ConnectionState::Reconnecting);
        assert_eq!(
            states.recv_timeout(Duration::from_secs(2)).unwrap(),
            ConnectionState::Connected
        );
    }

    #[test]
    fn steady_state_keeps_retrying_through_failures() {
        let connector = Arc::new(ScriptedConnector::default());
        let first = connector.push_connection(Some(1));
        let stream = transport(&connector, authed_session());

        let rx = stream.subscribe().unwrap();
        assert!(rx.recv().unwrap().is_connected_marker());

        // Several failed attempts before a good one.
        connector.push_failure(ClientError::transport_retryable("down"));
        connector.push_failure(ClientError::transport_retryable("down"));
        let _second = connector.push_connection(Some(5));
        drop(first);

        let next = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(next, StreamEvent::Connected { server_version: Some(5), .. }));
        assert!(connector.attempts() >= 4);
    }

    #[test]
    fn unsubscribe_is_terminal() {
        let connector = Arc::new(ScriptedConnector::default());
        let feed = connector.push_connection(Some(1));
        let stream = transport(&connector, authed_session());

        let rx = stream.subscribe().unwrap();
        assert!(rx.recv().unwrap().is_connected_marker());

        stream.unsubscribe();
        assert_eq!(stream.state(), ConnectionState::Closed);

        // Wake the reader so it observes the closed flag and exits
        // instead of reconnecting.
        drop(feed);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(stream.state(), ConnectionState::Closed);
        assert!(stream.subscribe().is_err());
    }

    #[test]
    fn dropped_receiver_shuts_the_stream_down() {
        let connector = Arc::new(ScriptedConnector::default());
        let feed = connector.push_connection(Some(1));
        let stream = transport(&connector, authed_session());

        let rx = stream.subscribe().unwrap();
        assert!(rx.recv().unwrap().is_connected_marker());
        drop(rx);

        let _ = feed.send(Ok(Some(changed())));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(stream.state(), ConnectionState::Closed);
    }
}
