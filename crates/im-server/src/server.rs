//! Gateway façade: wires admission, the bridge and both listeners together.
//!
//! The client endpoint is an axum router. Admission runs inside the upgrade
//! handler before `on_upgrade`, so rejected requests get a plain HTTP status
//! and never allocate a socket. The bus endpoint is the tokio-tungstenite
//! listener in [`crate::bus::listener`].

use crate::auth::admission::{header_str, set_header};
use crate::auth::{apply_query_fallback, Admission};
use crate::bridge::Bridge;
use crate::bus::{listener, BusHolder};
use crate::config::ServerConfig;
use crate::device::{self, BindRequest};
use crate::session::registry::DEFAULT_OUTBOUND_CAPACITY;
use crate::session::{ClientHandle, Outbound, SessionRegistry};
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{future, SinkExt, StreamExt};
use im_core::envelope::headers;
use im_core::{FrameKind, ImError, ImResult, TokenSigner};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// How long shutdown waits for sessions to finish their teardown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Headers forwarded upstream on `session_open`.
const SESSION_HEADERS: &[&str] = &[
    headers::DEVICE_ID,
    headers::CLIENT_ID,
    headers::SESSION_ID,
    headers::TRANSPORT_TYPE,
    headers::AUTHORIZATION,
    headers::USER_ID,
];

/// Shared state behind every route.
pub struct Gateway {
    bridge: Arc<Bridge>,
    admission: Admission,
    signer: TokenSigner,
    secret: Vec<u8>,
    browser: bool,
    admission_timeout: Duration,
    device_token_ttl: u64,
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    sessions: usize,
}

impl Gateway {
    pub fn new(config: &ServerConfig) -> Self {
        let signer = TokenSigner::new(config.secret.as_bytes());
        Self {
            bridge: Arc::new(Bridge::new(
                Arc::new(SessionRegistry::new()),
                Arc::new(BusHolder::new()),
            )),
            admission: Admission::new(signer.clone()).skip_expiry(config.skip_expiry),
            signer,
            secret: config.secret.as_bytes().to_vec(),
            browser: config.browser,
            admission_timeout: config.admission_timeout,
            device_token_ttl: config.device_token_ttl,
        }
    }

    fn health(&self) -> Health {
        Health {
            status: if self.bridge.bus().is_connected() {
                "ok"
            } else {
                "degraded"
            },
            sessions: self.bridge.sessions().count(),
        }
    }

    /// Close every session, give them a moment to tear down, then close the bus.
    pub async fn shutdown(&self) {
        let closing = self.bridge.sessions().close_all();
        if closing > 0 {
            info!(sessions = closing, "closing client sessions");
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while self.bridge.live_sessions() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if self.bridge.live_sessions() > 0 {
            warn!(
                remaining = self.bridge.live_sessions(),
                "sessions still open at shutdown"
            );
        }

        self.bridge.bus().shutdown().await;
    }
}

/// Build the client-facing router.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/device/bind", post(bind_handler))
        .with_state(gateway)
}

/// Bind both listeners and serve until `shutdown` resolves.
pub async fn run(
    config: ServerConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> ImResult<()> {
    let gateway = Arc::new(Gateway::new(&config));

    let ws_listener = TcpListener::bind(config.ws_addr)
        .await
        .map_err(|e| ImError::Transport(format!("client bind failed: {e}")))?;
    info!(addr = %config.ws_addr, browser = config.browser, "client listener started");
    let bus_listener = listener::bind(config.bus_addr).await?;

    serve(gateway, ws_listener, bus_listener, shutdown).await
}

/// Serve on already-bound listeners.
///
/// On shutdown the client listener stops accepting, open sessions are
/// closed, the bus listener stops and the bus connection is flushed last, so
/// every `session_close` makes it upstream.
pub async fn serve(
    gateway: Arc<Gateway>,
    ws_listener: TcpListener,
    bus_listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> ImResult<()> {
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let bus_task = tokio::spawn(listener::serve(
        bus_listener,
        gateway.bridge.clone(),
        shutdown_tx.subscribe(),
    ));

    let signal_tx = shutdown_tx.clone();
    let closing = gateway.clone();
    let result = axum::serve(ws_listener, router(gateway.clone()))
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("shutting down");
            let _ = signal_tx.send(());
            // Upgraded sockets are not tracked by the HTTP server.
            closing.bridge.sessions().close_all();
        })
        .await
        .map_err(|e| ImError::Transport(format!("client listener failed: {e}")));

    let _ = shutdown_tx.send(());
    let _ = bus_task.await;
    gateway.shutdown().await;
    info!("gateway stopped");
    result
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn ws_handler(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<HashMap<String, String>>,
    mut headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if gateway.browser {
        apply_query_fallback(&mut headers, &query);
    }

    let user_id = match gateway.admission.authenticate(&headers) {
        Ok(id) => id,
        Err(e) => {
            warn!(
                device_id = %header_str(&headers, headers::DEVICE_ID),
                error = %e,
                "admission rejected"
            );
            return (StatusCode::UNAUTHORIZED, format!("Unauthorized: {e}")).into_response();
        }
    };
    set_header(&mut headers, headers::USER_ID, &user_id.to_string());

    let session_id = match header_str(&headers, headers::SESSION_ID) {
        "" => new_session_id(),
        id => id.to_string(),
    };
    set_header(&mut headers, headers::SESSION_ID, &session_id);

    if gateway.bridge.sessions().contains(&session_id) {
        warn!(session_id = %session_id, "session id already in use");
        return (StatusCode::CONFLICT, "Conflict: session id already in use").into_response();
    }

    if !gateway.bridge.bus().wait_connected(gateway.admission_timeout).await {
        warn!(session_id = %session_id, "bus not connected, refusing session");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "Service Unavailable: AI gateway not connected",
        )
            .into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let metadata = session_headers(&headers);
    let failed_id = session_id.clone();
    ws.on_failed_upgrade(move |e| {
        warn!(session_id = %failed_id, error = %e, "client upgrade failed");
    })
    .on_upgrade(move |socket| serve_session(gateway, socket, session_id, metadata))
}

async fn health_handler(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    Json(gateway.health())
}

async fn bind_handler(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    body: Result<Json<BindRequest>, JsonRejection>,
) -> impl IntoResponse {
    let request = match body {
        Ok(Json(request)) => request,
        Err(e) => {
            debug!(error = %e, "unreadable bind request body");
            BindRequest::default()
        }
    };
    let (status, response) = device::bind(
        &gateway.signer,
        &gateway.secret,
        gateway.device_token_ttl,
        &headers,
        &request,
    );
    (status, Json(response))
}

// ── Session plumbing ──────────────────────────────────────────────────

/// Run one upgraded client connection until it is torn down.
async fn serve_session(
    gateway: Arc<Gateway>,
    socket: WebSocket,
    session_id: String,
    metadata: HashMap<String, String>,
) {
    let (mut ws_tx, ws_rx) = socket.split();
    let (handle, mut out_rx) = ClientHandle::new(DEFAULT_OUTBOUND_CAPACITY);

    let writer_id = session_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(cmd) = out_rx.recv().await {
            let msg = match cmd {
                Outbound::Frame(FrameKind::Text, payload) => {
                    Message::Text(text_payload(&writer_id, payload).into())
                }
                Outbound::Frame(FrameKind::Binary, payload) => Message::Binary(payload.into()),
                Outbound::Close => break,
            };
            if let Err(e) = ws_tx.send(msg).await {
                warn!(session_id = %writer_id, error = %e, "client write failed");
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let inbound = ws_rx
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => {
                    Some(Ok((FrameKind::Text, text.as_str().as_bytes().to_vec())))
                }
                Ok(Message::Binary(data)) => Some(Ok((FrameKind::Binary, data.to_vec()))),
                Ok(_) => None,
                Err(e) => Some(Err(ImError::Transport(format!("client read failed: {e}")))),
            })
        });

    let closer = handle.clone();
    if let Err(e) = gateway
        .bridge
        .run_session(session_id.clone(), metadata, handle, inbound)
        .await
    {
        warn!(session_id = %session_id, error = %e, "session rejected after upgrade");
        closer.close();
    }
    drop(closer);

    let _ = writer.await;
}

/// Text frames must be UTF-8; invalid payloads are converted lossily.
fn text_payload(session_id: &str, payload: Vec<u8>) -> String {
    String::from_utf8(payload).unwrap_or_else(|e| {
        debug!(session_id = %session_id, "non UTF-8 text payload, converting lossily");
        String::from_utf8_lossy(e.as_bytes()).into_owned()
    })
}

/// Generate a random 128-bit session id, hex encoded.
fn new_session_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

fn session_headers(headers: &HeaderMap) -> HashMap<String, String> {
    SESSION_HEADERS
        .iter()
        .filter_map(|name| match header_str(headers, name) {
            "" => None,
            value => Some((name.to_string(), value.to_string())),
        })
        .collect()
}
