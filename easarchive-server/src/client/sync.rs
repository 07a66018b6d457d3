//! Realtime sync runtime: keeps a [`SyncState`] mirror current from the
//! server's WebSocket channel, with the REST poll as a backstop.

use std::convert::Infallible;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use tokio::net::TcpStream;
use tokio::sync::futures::Notified;
use tokio::sync::{watch, Notify};
use tokio::time::Interval;
use tokio_graceful_shutdown::SubsystemHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use easarchive_core::sync::{ActiveAlert, ChannelManager, ServerMessage, SyncState};

use super::ArchiveClient;

/// Longest wait for the WebSocket handshake
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type RealtimeStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Raised when the surface is visible again. Only a reconnect backoff that
/// is already waiting sees it; nothing is kept for later waits.
#[derive(Clone, Default)]
pub struct ForegroundSignal(Arc<Notify>);

impl ForegroundSignal {
    pub fn raise(&self) {
        self.0.notify_waiters();
    }

    pub fn wait(&self) -> Notified<'_> {
        self.0.notified()
    }
}

/// Why a connected session ended
enum SessionEnd {
    Shutdown,
    Dropped,
}

pub struct SyncRuntime {
    client: ArchiveClient,
    state: Arc<RwLock<SyncState>>,
    alerts_tx: watch::Sender<Vec<ActiveAlert>>,
    poll_interval: Duration,
    log_tail: usize,
    foreground: ForegroundSignal,
    connect_timeout: Duration,
    start: Instant,
}

impl SyncRuntime {
    pub fn new(
        client: ArchiveClient,
        state: Arc<RwLock<SyncState>>,
        alerts_tx: watch::Sender<Vec<ActiveAlert>>,
        poll_interval: Duration,
        log_tail: usize,
    ) -> Self {
        Self {
            client,
            state,
            alerts_tx,
            poll_interval,
            log_tail,
            foreground: ForegroundSignal::default(),
            connect_timeout: CONNECT_TIMEOUT,
            start: Instant::now(),
        }
    }

    pub fn foreground_handle(&self) -> ForegroundSignal {
        self.foreground.clone()
    }

    pub fn state(&self) -> &Arc<RwLock<SyncState>> {
        &self.state
    }

    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Apply one text frame. Unknown types and malformed frames are
    /// logged and otherwise ignored.
    pub fn handle_text(&self, text: &str) {
        match ServerMessage::parse(text) {
            Ok(Some(message)) => self.apply(message),
            Ok(None) => trace!("Ignoring unknown realtime message"),
            Err(e) => warn!("Malformed realtime message: {}", e),
        }
    }

    fn apply(&self, message: ServerMessage) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let change = state.apply(message);
        if !change.any() {
            trace!("Realtime message changed nothing");
            return;
        }
        if change.alerts {
            self.alerts_tx.send_replace(state.active_alerts().to_vec());
        }
    }

    /// Fetch `/api/status` and `/api/logs` and fold them in.
    pub async fn poll_once(&self) {
        match self.client.status().await {
            Ok(status) => {
                let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
                if state.apply_status(status).alerts {
                    self.alerts_tx.send_replace(state.active_alerts().to_vec());
                }
            }
            Err(e) => debug!("Status poll failed: {}", e),
        }
        match self.client.logs(self.log_tail).await {
            Ok(logs) => {
                let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
                state.apply_logs(logs);
            }
            Err(e) => debug!("Log poll failed: {}", e),
        }
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), Infallible> {
        let mut channel = ChannelManager::default();
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let url = self.client.ws_url();

        loop {
            channel.start_connecting(self.now_ms());
            debug!("Connecting to {}", url);

            let connected = tokio::select! {
                _ = subsys.on_shutdown_requested() => {
                    channel.shutdown(self.now_ms());
                    return Ok(());
                }
                result = self.connect(&url, &mut poll) => result,
            };
            match connected {
                Ok(stream) => {
                    channel.connected(self.now_ms());
                    info!("Realtime channel connected");
                    match self.session(stream, &subsys, &mut poll).await {
                        SessionEnd::Shutdown => {
                            channel.shutdown(self.now_ms());
                            return Ok(());
                        }
                        SessionEnd::Dropped => info!(
                            "Realtime channel dropped after {} ms",
                            channel.time_in_state_ms(self.now_ms())
                        ),
                    }
                }
                Err(e) => warn!("Realtime connect to {} failed: {}", url, e),
            }

            let Some(delay) = channel.failed(self.now_ms()) else {
                return Ok(());
            };
            debug!(
                "Reconnecting in {} ms (attempt {})",
                delay,
                channel.failure_count()
            );

            let sleep = tokio::time::sleep(Duration::from_millis(delay));
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = subsys.on_shutdown_requested() => {
                        channel.shutdown(self.now_ms());
                        return Ok(());
                    }
                    _ = &mut sleep => break,
                    _ = self.foreground.wait() => {
                        if channel.foreground_regained(self.now_ms()) {
                            debug!("Foreground regained, reconnecting now");
                            break;
                        }
                    }
                    _ = poll.tick() => self.poll_once().await,
                }
            }
        }
    }

    /// Open the realtime channel. The REST poll keeps running while the
    /// handshake is pending, which gives up after `connect_timeout`.
    async fn connect(&self, url: &str, poll: &mut Interval) -> Result<RealtimeStream, String> {
        let handshake =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url));
        tokio::pin!(handshake);
        loop {
            tokio::select! {
                result = &mut handshake => return match result {
                    Ok(Ok((stream, _))) => Ok(stream),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!(
                        "no handshake within {} ms",
                        self.connect_timeout.as_millis()
                    )),
                },
                _ = poll.tick() => self.poll_once().await,
            }
        }
    }

    async fn session<S>(
        &self,
        mut stream: S,
        subsys: &SubsystemHandle,
        poll: &mut Interval,
    ) -> SessionEnd
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures_util::Sink<Message>
            + Unpin,
    {
        loop {
            tokio::select! {
                _ = subsys.on_shutdown_requested() => {
                    let _ = stream.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                _ = poll.tick() => self.poll_once().await,
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                    Some(Ok(Message::Ping(payload))) => {
                        if stream.send(Message::Pong(payload)).await.is_err() {
                            return SessionEnd::Dropped;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                    Some(Err(e)) => {
                        warn!("Realtime channel error: {}", e);
                        return SessionEnd::Dropped;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }
}
