#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt;
use std::future::pending;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use backoff::backoff::Backoff as _;
use futures::{SinkExt as _, StreamExt as _};
use secrecy::{ExposeSecret as _, SecretString};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, Sleep, sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::config::{Config, ReconnectBackoff};
use super::envelope::Envelope;
use super::error::WsError;
use crate::Result;
use crate::auth::CredentialStore;
use crate::bus::{EventBus, Subscription};
use crate::error::{Error, Kind, ReconnectExhausted};
use crate::policy::{self, CloseAction};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bus event published once when reconnection gives up, with `{ "attempts": n }`.
pub const RECONNECT_FAILED: &str = "reconnect_failed";

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected, and not trying to be
    Closed,
    /// Handshake in progress
    Connecting,
    /// Successfully connected
    Open {
        /// When the connection was established
        since: Instant,
    },
    /// Waiting out the backoff delay before the next attempt
    Reconnecting {
        /// Attempt number since the last `Open`, starting at 1
        attempt: u32,
        delay: Duration,
    },
    /// Gave up after the configured number of attempts; only `connect` recovers
    ReconnectExhausted { attempts: u32 },
}

impl ConnectionState {
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// Whether the manager has stopped on its own and waits for `connect`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::ReconnectExhausted { .. })
    }
}

/// Manages the realtime socket: connection lifecycle, reconnection with backoff, heartbeat,
/// and dispatch of inbound frames to an [`EventBus`].
///
/// One instance is created by the application root and shared by handle (it is cheap to clone).
/// Each connection attempt authenticates with the access token the [`CredentialStore`] holds at
/// that moment, so a token renewed during a backoff wait is used by the next attempt.
///
/// Inbound `{ "type", "data" }` frames are published on the bus under `type`; frames that do not
/// match are logged and dropped. Bus callbacks run on the connection task and must not block.
///
/// ```rust,no_run
/// use console_transport::auth::CredentialStore;
/// use console_transport::bus::EventBus;
/// use console_transport::ws::{Config, ConnectionManager};
/// use serde_json::json;
///
/// # async fn example() -> console_transport::Result<()> {
/// let manager = ConnectionManager::new(Config::default(), EventBus::new(), CredentialStore::default());
/// let _orders = manager.subscribe("order.updated", |data| println!("{data}"));
///
/// manager.connect("wss://console.example.com/realtime")?;
/// manager.send("presence", json!({ "page": "orders" }));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: Config,
    bus: EventBus,
    credentials: CredentialStore,
    state_tx: watch::Sender<ConnectionState>,
    /// The connection task started by the latest `connect`
    session: Mutex<Option<Session>>,
}

struct Session {
    cancel: CancellationToken,
    /// Close frame sent when the session is cancelled by `disconnect`
    close: Arc<OnceLock<CloseFrame>>,
    outbound: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(session) = self
            .session
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            session.cancel.cancel();
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    #[must_use]
    pub fn new(config: Config, bus: EventBus, credentials: CredentialStore) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);

        Self {
            inner: Arc::new(ManagerInner {
                config,
                bus,
                credentials,
                state_tx,
                session: Mutex::new(None),
            }),
        }
    }

    /// Start connecting to `url` in a background task.
    ///
    /// Any previous connection of this manager is torn down first, so at most one socket is
    /// ever open. Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a [`Kind::Validation`] error if `url` is not a
    /// `ws://` or `wss://` URL.
    pub fn connect(&self, url: &str) -> Result<()> {
        let url = Url::parse(url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "unsupported WebSocket scheme: {}",
                url.scheme()
            )));
        }

        let mut slot = self
            .inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let previous = slot.take().map(|previous| {
            previous.cancel.cancel();
            previous.task
        });

        let cancel = CancellationToken::new();
        let close = Arc::new(OnceLock::new());
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        self.inner.state_tx.send_replace(ConnectionState::Connecting);

        let worker = Worker {
            config: self.inner.config.clone(),
            bus: self.inner.bus.clone(),
            credentials: self.inner.credentials.clone(),
            state_tx: self.inner.state_tx.clone(),
            url,
            cancel: cancel.clone(),
            close: Arc::clone(&close),
        };
        let task = tokio::spawn(worker.run(previous, outbound_rx));

        *slot = Some(Session {
            cancel,
            close,
            outbound,
            task,
        });

        Ok(())
    }

    /// Close the socket with `code` and `reason` and stop reconnecting.
    ///
    /// A pending reconnect wait is cancelled together with the move to
    /// [`ConnectionState::Closed`]; nothing reconnects until [`Self::connect`] is called again.
    pub fn disconnect(&self, code: u16, reason: &str) {
        let slot = self
            .inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(session) = slot.as_ref() {
            _ = session.close.set(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_owned().into(),
            });
            session.cancel.cancel();
        }

        self.inner.state_tx.send_replace(ConnectionState::Closed);
    }

    /// Wait until the socket is [`ConnectionState::Open`].
    ///
    /// # Errors
    ///
    /// Returns [`Kind::ReconnectExhausted`] if reconnecting gave up, or [`Kind::Connection`] if
    /// the manager is (or becomes) [`ConnectionState::Closed`] first.
    pub async fn wait_open(&self) -> Result<()> {
        let mut states = self.state_receiver();
        let state = *states
            .wait_for(|state| state.is_open() || state.is_terminal())
            .await
            .map_err(|e| Error::with_source(Kind::Internal, e))?;

        match state {
            ConnectionState::Open { .. } => Ok(()),
            ConnectionState::ReconnectExhausted { attempts } => {
                Err(ReconnectExhausted { attempts }.into())
            }
            _ => Err(WsError::NotConnected.into()),
        }
    }

    /// Send a `{ type, data }` frame.
    ///
    /// Returns `false` unless the socket is [`ConnectionState::Open`]. Nothing is queued for a
    /// later connection; retrying is up to the caller.
    pub fn send(&self, event_type: &str, data: Value) -> bool {
        if !self.state().is_open() {
            return false;
        }

        let text = match Envelope::new(event_type, data).to_text() {
            Ok(text) => text,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, event_type, "unable to encode outbound frame");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return false;
            }
        };

        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|session| session.outbound.send(text).is_ok())
    }

    /// Register `callback` for inbound frames of `event_type` (or [`crate::bus::WILDCARD`]).
    pub fn subscribe<F>(&self, event_type: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(event_type, callback)
    }

    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }
}

/// Why a live session ended.
enum Ended {
    /// `disconnect` or a newer `connect` took over
    Cancelled,
    /// The socket went away; `code` is the peer's close code, if any
    Lost { code: Option<u16>, error: Error },
}

impl Ended {
    fn lost(code: Option<u16>, error: WsError) -> Self {
        Self::Lost {
            code,
            error: error.into(),
        }
    }
}

/// Everything the connection task owns. Holds no reference back to the manager, so dropping the
/// last manager handle cancels the task.
struct Worker {
    config: Config,
    bus: EventBus,
    credentials: CredentialStore,
    state_tx: watch::Sender<ConnectionState>,
    url: Url,
    cancel: CancellationToken,
    close: Arc<OnceLock<CloseFrame>>,
}

impl Worker {
    /// Main connection loop with automatic reconnection.
    ///
    /// `previous` is the task of the session this one replaces; no socket is opened until it
    /// has finished.
    async fn run(
        self,
        previous: Option<JoinHandle<()>>,
        mut outbound: mpsc::UnboundedReceiver<String>,
    ) {
        if let Some(previous) = previous {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = retire(previous, self.config.handshake_timeout) => {}
            }
        }

        let mut backoff = ReconnectBackoff::from(self.config.reconnect);

        loop {
            let attempt = tokio::select! {
                () = self.cancel.cancelled() => return,
                attempt = self.open() => attempt,
            };

            let error = match attempt {
                Ok(stream) => {
                    backoff.reset();
                    // Frames accepted while the previous socket was dying are not replayed
                    while outbound.try_recv().is_ok() {}
                    self.transition(ConnectionState::Open {
                        since: Instant::now(),
                    });

                    #[cfg(feature = "tracing")]
                    tracing::info!(url = %self.url, "WebSocket connected");

                    match self.serve(stream, &mut outbound).await {
                        Ended::Cancelled => return,
                        Ended::Lost { code, error } => {
                            if policy::on_close(code) == CloseAction::Stay {
                                #[cfg(feature = "tracing")]
                                tracing::info!(url = %self.url, "WebSocket closed normally");
                                self.transition(ConnectionState::Closed);
                                return;
                            }
                            error
                        }
                    }
                }
                Err(e) => e,
            };

            #[cfg(feature = "tracing")]
            tracing::warn!(url = %self.url, error = %error, "WebSocket connection lost");
            #[cfg(not(feature = "tracing"))]
            let _ = &error;

            let Some(delay) = backoff.next_backoff() else {
                self.exhausted(backoff.attempt());
                return;
            };

            #[cfg(feature = "tracing")]
            tracing::info!(attempt = backoff.attempt(), ?delay, "scheduling reconnect");

            self.transition(ConnectionState::Reconnecting {
                attempt: backoff.attempt(),
                delay,
            });

            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = sleep(delay) => {}
            }

            self.transition(ConnectionState::Connecting);
        }
    }

    async fn open(&self) -> Result<WsStream> {
        let url = authenticated_url(
            &self.url,
            &self.config.token_param,
            self.credentials.access_token().as_ref(),
        );

        #[cfg(feature = "tracing")]
        tracing::debug!(url = %self.url, "opening WebSocket");

        let (stream, _response) = timeout(self.config.handshake_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_elapsed| WsError::HandshakeTimeout)??;

        Ok(stream)
    }

    /// Pump one live socket until it ends.
    async fn serve(&self, stream: WsStream, outbound: &mut mpsc::UnboundedReceiver<String>) -> Ended {
        let (mut write, mut read) = stream.split();

        let mut heartbeat = self.config.heartbeat_interval.map(|period| {
            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
        });
        // Armed by a PING, disarmed by any inbound frame
        let mut watchdog: Option<Pin<Box<Sleep>>> = None;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let frame = self.close.get().cloned();
                    _ = write.send(Message::Close(frame)).await;
                    return Ended::Cancelled;
                }

                frame = read.next() => {
                    watchdog = None;
                    match frame {
                        Some(Ok(Message::Text(text))) => self.dispatch(text.as_str()),
                        Some(Ok(Message::Binary(_))) => {
                            let error = WsError::UnexpectedFrame("binary");
                            #[cfg(feature = "tracing")]
                            tracing::warn!(%error, "dropping WebSocket frame");
                            #[cfg(not(feature = "tracing"))]
                            let _ = &error;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.as_ref().map(|f| u16::from(f.code));
                            let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                            return Ended::lost(code, WsError::Closed { code, reason });
                        }
                        Some(Ok(_)) => {
                            // Ping and pong frames only prove liveness
                        }
                        Some(Err(e)) => return Ended::lost(None, WsError::Connection(e)),
                        None => {
                            return Ended::lost(None, WsError::Closed { code: None, reason: String::new() });
                        }
                    }
                }

                Some(text) = outbound.recv() => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        return Ended::lost(None, WsError::Connection(e));
                    }
                }

                () = tick(heartbeat.as_mut()) => {
                    if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                        return Ended::lost(None, WsError::Connection(e));
                    }
                    if watchdog.is_none() {
                        watchdog = Some(Box::pin(sleep(self.config.heartbeat_timeout)));
                    }
                }

                () = expire(watchdog.as_mut()) => {
                    return Ended::lost(None, WsError::HeartbeatTimeout);
                }
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match Envelope::parse(text) {
            Ok(envelope) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(event_type = %envelope.kind, "dispatching WebSocket frame");
                self.bus.publish(&envelope.kind, &envelope.data);
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%text, error = %e, "dropping malformed WebSocket frame");
                #[cfg(not(feature = "tracing"))]
                let _ = (&text, &e);
            }
        }
    }

    fn exhausted(&self, attempts: u32) {
        if self.transition(ConnectionState::ReconnectExhausted { attempts }) {
            #[cfg(feature = "tracing")]
            tracing::error!(url = %self.url, attempts, "giving up reconnecting");
            self.bus
                .publish(RECONNECT_FAILED, &json!({ "attempts": attempts }));
        }
    }

    /// Move to `next` unless this worker has been cancelled. A cancelled worker never overwrites
    /// the state set by `disconnect` or a newer `connect`.
    fn transition(&self, next: ConnectionState) -> bool {
        self.state_tx.send_if_modified(|state| {
            if self.cancel.is_cancelled() {
                return false;
            }
            *state = next;
            true
        })
    }
}

/// `base` with the access token appended as the `param` query parameter.
/// Wait for a cancelled session task to finish sending its close frame and drop its socket,
/// aborting it if that takes longer than `grace`.
async fn retire(mut task: JoinHandle<()>, grace: Duration) {
    if timeout(grace, &mut task).await.is_err() {
        #[cfg(feature = "tracing")]
        tracing::warn!(?grace, "previous WebSocket session did not stop in time, aborting it");

        task.abort();
        // Resolves once the aborted task's future, and its socket, have been dropped
        _ = task.await;
    }
}

fn authenticated_url(base: &Url, param: &str, token: Option<&SecretString>) -> Url {
    let mut url = base.clone();
    if let Some(token) = token {
        url.query_pairs_mut()
            .append_pair(param, token.expose_secret());
    }
    url
}

async fn tick(heartbeat: Option<&mut Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

async fn expire(watchdog: Option<&mut Pin<Box<Sleep>>>) {
    match watchdog {
        Some(deadline) => deadline.as_mut().await,
        None => pending().await,
    }
}
