//! Stream connection and its supervisor task
//!
//! `connect` opens the first transport itself so the caller learns about a
//! bad URL or a rejected upgrade directly. After that a supervisor task owns
//! the read half and runs one `select!` over cancellation, heartbeat ticks and
//! inbound frames. The write half sits behind a mutex shared with `send`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use lyo_auth::{SessionManager, TokenGeneration};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::envelope::{Envelope, EventKind};
use crate::error::{Error, Result, upgrade_status};
use crate::state::{ConnectionState, HeartbeatState, Tick};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

type EventHandler = Arc<dyn Fn(StreamEvent) + Send + Sync>;
type FallbackHandler = Arc<dyn Fn() + Send + Sync>;

/// How long `disconnect` waits for the supervisor before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Application payload of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// Delivered to the `on_event` callback passed to `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Frame(Frame),
    /// The transport failed or the peer closed it; reconnection follows
    Error(String),
}

/// Why the supervisor's receive loop stopped.
enum Exit {
    Cancelled,
    HeartbeatExpired,
    Lost(String),
}

struct Run {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// State shared between the handle and its supervisor task.
struct Shared {
    session: Arc<SessionManager>,
    config: StreamConfig,
    state: watch::Sender<ConnectionState>,
    heartbeat: Mutex<HeartbeatState>,
    sink: AsyncMutex<Option<WsSink>>,
    fallback: Mutex<Option<FallbackHandler>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "stream state changed");
        }
    }

    async fn install(&self, ws: WsStream) -> WsSource {
        let (sink, source) = ws.split();
        *self.sink.lock().await = Some(sink);
        self.heartbeat.lock().reset();
        source
    }

    async fn send_message(&self, message: Message) -> Result<()> {
        let mut sink = self.sink.lock().await;
        match sink.as_mut() {
            Some(sink) => sink.send(message).await.map_err(Error::Send),
            None => Err(Error::NotConnected),
        }
    }

    /// Write one heartbeat ping without queueing behind another writer.
    ///
    /// `Ok(false)` when the write half is busy or the ping did not go out
    /// within `limit`. The tick still counts as awaiting a pong, so a peer
    /// that stopped reading runs into the missed-pong threshold.
    async fn ping(&self, limit: Duration) -> Result<bool> {
        let Ok(mut guard) = self.sink.try_lock() else {
            return Ok(false);
        };
        let Some(sink) = guard.as_mut() else {
            return Err(Error::NotConnected);
        };
        match tokio::time::timeout(limit, sink.send(Message::Ping(Bytes::new()))).await {
            Ok(sent) => sent.map(|()| true).map_err(Error::Send),
            Err(_) => Ok(false),
        }
    }

    /// `close_sink`, giving up after `limit` if the write half is stalled.
    async fn close_sink_within(&self, limit: Duration) {
        if tokio::time::timeout(limit, self.close_sink()).await.is_err() {
            debug!("close frame abandoned, write half stalled");
        }
    }

    /// Send a normal-closure frame and drop the write half.
    async fn close_sink(&self) {
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: String::new().into(),
            };
            if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                debug!(error = %e, "close frame not delivered");
            }
        }
    }

    async fn drop_sink(&self) {
        self.sink.lock().await.take();
    }

    fn fire_fallback(&self) {
        metrics::counter!("stream_fallback_total").increment(1);
        let callback = self.fallback.lock().clone();
        match callback {
            Some(callback) => callback(),
            None => warn!("stream degraded but no fallback callback is registered"),
        }
    }
}

/// One persistent, authenticated WebSocket connection.
pub struct StreamConnection {
    shared: Arc<Shared>,
    run: Mutex<Option<Run>>,
}

impl StreamConnection {
    pub fn new(session: Arc<SessionManager>, config: StreamConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                session,
                config,
                state,
                heartbeat: Mutex::new(HeartbeatState::default()),
                sink: AsyncMutex::new(None),
                fallback: Mutex::new(None),
            }),
            run: Mutex::new(None),
        }
    }

    /// Open the stream at `url` and start delivering frames to `on_event`.
    ///
    /// No-op while already connecting, connected or reconnecting. A rejected
    /// upgrade with 401 is retried once after refreshing credentials. If the
    /// first transport cannot be opened the error is returned and the state
    /// goes back to `Disconnected`; reconnection only covers transports that
    /// were established and then lost.
    pub async fn connect<F>(&self, url: &str, on_event: F) -> Result<()>
    where
        F: Fn(StreamEvent) + Send + Sync + 'static,
    {
        let cancel = {
            let mut run = self.run.lock();
            if self.shared.state().is_active() {
                debug!(state = %self.shared.state(), "connect ignored, stream already active");
                return Ok(());
            }
            // A failed run leaves its (finished) supervisor behind.
            if let Some(stale) = run.take() {
                stale.cancel.cancel();
                if let Some(task) = stale.task {
                    task.abort();
                }
            }
            let cancel = CancellationToken::new();
            *run = Some(Run {
                cancel: cancel.clone(),
                task: None,
            });
            self.shared.set_state(ConnectionState::Connecting);
            cancel
        };

        info!(url, "opening stream");
        let opened = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Closed),
            opened = open(&self.shared.session, url) => opened,
        };
        let ws = match opened {
            Ok(ws) => ws,
            Err(e) => {
                warn!(url, error = %e, "stream connect failed");
                let mut run = self.run.lock();
                if !cancel.is_cancelled() {
                    run.take();
                    self.shared.set_state(ConnectionState::Disconnected);
                }
                return Err(e);
            }
        };

        let source = self.shared.install(ws).await;

        let spawned = {
            let mut run = self.run.lock();
            match run.as_mut() {
                Some(current) if !cancel.is_cancelled() => {
                    self.shared.set_state(ConnectionState::Connected);
                    current.task = Some(tokio::spawn(supervise(
                        self.shared.clone(),
                        url.to_string(),
                        source,
                        Arc::new(on_event),
                        cancel.clone(),
                    )));
                    true
                }
                _ => false,
            }
        };

        if !spawned {
            self.shared.close_sink().await;
            return Err(Error::Closed);
        }
        info!(url, "stream connected");
        Ok(())
    }

    /// Stop heartbeat, receive loop and any pending reconnect, then close the
    /// transport with a normal-closure frame. Safe to call in any state.
    pub async fn disconnect(&self) {
        let run = self.run.lock().take();
        if let Some(run) = run {
            run.cancel.cancel();
            if let Some(mut task) = run.task {
                if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                    warn!("stream supervisor did not stop in time, aborting");
                    task.abort();
                }
            }
        }
        self.shared.close_sink_within(SHUTDOWN_GRACE).await;

        let previous = self.shared.state.send_replace(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            info!(from = %previous, "stream disconnected");
        }
    }

    /// Send one frame. Only valid while `Connected`.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        if self.shared.state() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data),
        };
        self.shared.send_message(message).await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Frame::Text(text.into())).await
    }

    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(Frame::Binary(data.into())).await
    }

    /// Send `{type, data, timestamp}` as a text frame.
    pub async fn send_envelope(
        &self,
        kind: impl Into<EventKind>,
        data: serde_json::Value,
    ) -> Result<()> {
        let text = Envelope::new(kind, data).to_text()?;
        self.send_text(text).await
    }

    /// Register the callback invoked when the stream degrades: missed-pong
    /// threshold reached or reconnect attempts exhausted. Fires at most once
    /// per `connect`.
    pub fn on_fallback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.shared.fallback.lock() = Some(Arc::new(callback));
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn heartbeat(&self) -> HeartbeatState {
        self.shared.heartbeat.lock().clone()
    }
}

/// Build the upgrade request, sign it, and connect.
async fn try_open(
    session: &SessionManager,
    url: &str,
) -> Result<(TokenGeneration, std::result::Result<WsStream, tungstenite::Error>)> {
    let mut request = url
        .into_client_request()
        .map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;
    let generation = session.authorize(request.headers_mut()).await;
    let connected = connect_async(request).await.map(|(ws, _response)| ws);
    Ok((generation, connected))
}

/// Open a transport, refreshing credentials once if the upgrade gets 401.
async fn open(session: &SessionManager, url: &str) -> Result<WsStream> {
    let (generation, connected) = try_open(session, url).await?;
    match connected {
        Ok(ws) => Ok(ws),
        Err(e) if upgrade_status(&e) == Some(401) => {
            info!("stream upgrade unauthorized, refreshing token");
            session.refresh_after(generation).await?;
            let (_, retried) = try_open(session, url).await?;
            retried.map_err(Error::from_handshake)
        }
        Err(e) => Err(Error::from_handshake(e)),
    }
}

async fn supervise(
    shared: Arc<Shared>,
    url: String,
    mut source: WsSource,
    on_event: EventHandler,
    cancel: CancellationToken,
) {
    loop {
        match pump(&shared, &mut source, &on_event, &cancel).await {
            Exit::Cancelled => return,
            Exit::HeartbeatExpired => {
                let missed = shared.heartbeat.lock().missed_count;
                warn!(missed, "heartbeat threshold reached, stopping stream");
                shared.set_state(ConnectionState::Failed);
                shared.fire_fallback();
                shared.close_sink_within(shared.config.heartbeat_interval).await;
                return;
            }
            Exit::Lost(reason) => {
                warn!(reason = %reason, "stream transport lost");
                on_event(StreamEvent::Error(reason));
                shared.drop_sink().await;
                shared.set_state(ConnectionState::Reconnecting);

                match reconnect(&shared, &url, &cancel).await {
                    Some(next) => source = next,
                    None if cancel.is_cancelled() => return,
                    None => {
                        warn!(
                            attempts = shared.config.backoff.max_attempts,
                            "reconnect attempts exhausted"
                        );
                        shared.set_state(ConnectionState::Failed);
                        shared.fire_fallback();
                        return;
                    }
                }
            }
        }
    }
}

/// Receive loop plus heartbeat for one live transport.
async fn pump(
    shared: &Shared,
    source: &mut WsSource,
    on_event: &EventHandler,
    cancel: &CancellationToken,
) -> Exit {
    let interval = shared.config.heartbeat_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Exit::Cancelled,

            _ = ticker.tick() => {
                let tick = shared
                    .heartbeat
                    .lock()
                    .on_tick(shared.config.missed_pong_threshold, Instant::now());
                match tick {
                    Tick::Expired => return Exit::HeartbeatExpired,
                    Tick::Ping { missed } => {
                        if missed {
                            metrics::counter!("stream_heartbeat_missed_total").increment(1);
                            debug!("ping went unanswered");
                        }
                        match shared.ping(interval).await {
                            Ok(true) => {}
                            Ok(false) => debug!("ping not written, write half stalled"),
                            Err(e) => return Exit::Lost(format!("ping failed: {e}")),
                        }
                    }
                }
            }

            inbound = source.next() => match inbound {
                Some(Ok(message)) => {
                    shared.heartbeat.lock().record_inbound();
                    match message {
                        Message::Text(text) => {
                            on_event(StreamEvent::Frame(Frame::Text(text.as_str().to_owned())))
                        }
                        Message::Binary(data) => on_event(StreamEvent::Frame(Frame::Binary(data))),
                        Message::Close(frame) => {
                            let reason = match frame {
                                Some(frame) => format!("peer closed the stream ({})", frame.code),
                                None => "peer closed the stream".to_string(),
                            };
                            return Exit::Lost(reason);
                        }
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                    }
                }
                Some(Err(e)) => return Exit::Lost(format!("receive failed: {e}")),
                None => return Exit::Lost("stream ended".to_string()),
            },
        }
    }
}

/// Reopen with backoff. `None` when cancelled or out of attempts.
async fn reconnect(shared: &Shared, url: &str, cancel: &CancellationToken) -> Option<WsSource> {
    let policy = shared.config.backoff;
    for attempt in 0..policy.max_attempts {
        let delay = policy.delay(attempt);
        metrics::counter!("stream_reconnect_attempts_total").increment(1);
        info!(
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "reconnecting stream"
        );

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        let opened = tokio::select! {
            _ = cancel.cancelled() => return None,
            opened = open(&shared.session, url) => opened,
        };

        match opened {
            Ok(ws) => {
                let source = shared.install(ws).await;
                if cancel.is_cancelled() {
                    return None;
                }
                shared.set_state(ConnectionState::Connected);
                info!(attempt = attempt + 1, "stream reconnected");
                return Some(source);
            }
            Err(e) => warn!(attempt = attempt + 1, error = %e, "reconnect attempt failed"),
        }
    }
    None
}
