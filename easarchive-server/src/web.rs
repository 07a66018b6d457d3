use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::{header, HeaderValue},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use log::{debug, info, trace, warn};
use serde::Deserialize;
use thiserror::Error;
use tokio::{net::TcpListener, sync::broadcast};
use tokio_graceful_shutdown::SubsystemHandle;
use tower_http::cors::CorsLayer;

use easarchive_core::sync::{LogsResponse, ServerMessage, StreamStatus};

use crate::{archive::archive_handler, Session};

const ARCHIVE_URI: &str = "/archive";
const WS_URI: &str = "/ws";
const HEALTH_URI: &str = "/api/health";
const STATUS_URI: &str = "/api/status";
const LOGS_URI: &str = "/api/logs";
const STREAMS_URI: &str = "/api/streams";

/// Interval between server pings on the realtime channel
const HEARTBEAT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum WebError {
    #[error("Socket operation failed")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct Web {
    session: Session,
    shutdown_tx: broadcast::Sender<()>,
}

impl Web {
    pub fn new(session: Session) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Web {
            session,
            shutdown_tx,
        }
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), WebError> {
        let port = self.session.args().port;
        let listener =
            TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port))
                .await
                .map_err(WebError::Io)?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let shutdown_tx = self.shutdown_tx.clone();

        let app = router(self.session.clone(), self.shutdown_tx.clone())
            .into_make_service_with_connect_info::<SocketAddr>();

        info!("Starting HTTP web server on port {}", port);

        tokio::select! { biased;
            _ = subsys.on_shutdown_requested() => {
                let _ = shutdown_tx.send(());
            },
            r = axum::serve(listener, app)
                    .with_graceful_shutdown(
                        async move {
                            _ = shutdown_rx.recv().await;
                        }
                    ) => {
                return r.map_err(WebError::Io);
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
struct AppState {
    session: Session,
    shutdown_tx: broadcast::Sender<()>,
}

impl axum::extract::FromRef<AppState> for Session {
    fn from_ref(state: &AppState) -> Session {
        state.session.clone()
    }
}

/// All routes with their middleware, ready to serve.
pub fn router(session: Session, shutdown_tx: broadcast::Sender<()>) -> Router {
    let state = AppState {
        session,
        shutdown_tx,
    };

    Router::new()
        .route(ARCHIVE_URI, get(archive_handler))
        .route(WS_URI, get(ws_handler))
        .route(HEALTH_URI, get(health_handler))
        .route(STATUS_URI, get(status_handler))
        .route(LOGS_URI, get(logs_handler))
        .route(STREAMS_URI, axum::routing::post(stream_update_handler))
        .layer(middleware::from_fn(no_cache_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Middleware to add no-cache headers to every response
async fn no_cache_middleware(request: axum::extract::Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    response
}

/// GET /api/health
async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "OK" })).into_response()
}

/// GET /api/status
async fn status_handler(State(session): State<Session>) -> Response {
    Json(session.hub().status()).into_response()
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    tail: Option<usize>,
}

/// GET /api/logs?tail=N
async fn logs_handler(
    State(session): State<Session>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let hub = session.hub();
    let tail = hub.clamp_tail(query.tail);
    Json(LogsResponse {
        logs: hub.logs(tail),
    })
    .into_response()
}

/// POST /api/streams - telemetry from the capture process
async fn stream_update_handler(
    State(session): State<Session>,
    Json(status): Json<StreamStatus>,
) -> Response {
    trace!("Stream update for {}", status.stream_url);
    Json(session.hub().update_stream(status)).into_response()
}

/// GET /ws - realtime snapshot and deltas
async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    debug!("Realtime connection from {}", addr);
    let shutdown_rx = state.shutdown_tx.subscribe();
    ws.on_upgrade(move |socket| realtime_stream(socket, state.session, shutdown_rx))
}

fn encode(message: &ServerMessage) -> Option<Message> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            warn!("Failed to encode realtime message: {}", e);
            None
        }
    }
}

async fn realtime_stream(
    mut socket: WebSocket,
    session: Session,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let hub = session.hub().clone();
    // Subscribe before taking the snapshot so nothing falls in between
    let mut event_rx = hub.subscribe();
    debug!("Realtime subscribers: {}", hub.subscriber_count());

    if let Some(msg) = encode(&ServerMessage::Snapshot(hub.snapshot())) {
        if socket.send(msg).await.is_err() {
            return;
        }
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Shutdown of realtime websocket");
                break;
            }
            _ = heartbeat.tick() => {
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Realtime websocket closed");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!("Realtime websocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            event = event_rx.recv() => {
                match event {
                    Ok(message) => {
                        if let Some(msg) = encode(&message) {
                            if socket.send(msg).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Realtime subscriber lagged, missed {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        }
    }
}
